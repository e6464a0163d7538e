use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use glam::{Mat4, Quat, Vec3};

use super::{compute_normals, GeometryLoader, GeometryPart, LoadedGeometry, Mesh, MeshSubset, MeshVertex};
use crate::xml::{self, XmlElement};

const DEFAULT_DIFFUSE: [f32; 4] = [1.0, 1.0, 1.0, 1.0];

/// COLLADA 1.4/1.5 triangle, polylist and polygon primitives with diffuse material colors.
///
/// Scenes are normalized the way viewers expect them: scaled by the asset unit and rotated
/// from Z-up into Y-up when the asset declares `Z_UP`.
pub struct ColladaLoader;

impl GeometryLoader for ColladaLoader {
    fn format_name(&self) -> &'static str {
        "collada"
    }

    fn load(&self, bytes: &[u8]) -> Result<LoadedGeometry> {
        let root = xml::parse_document(bytes).context("COLLADA document is not valid XML")?;
        if root.name != "COLLADA" {
            bail!("expected <COLLADA> root, found <{}>", root.name);
        }
        let document = Document::new(&root);
        let mut parts = Vec::new();
        let asset_transform = document.asset_transform();

        match document.visual_scene() {
            Some(scene) => {
                for node in scene.children_named("node") {
                    document.collect_node(node, asset_transform, &mut parts)?;
                }
            }
            None => {
                for (id, geometry) in &document.geometries {
                    if let Some(part) = document.build_part(id, geometry, asset_transform, &HashMap::new())? {
                        parts.push(part);
                    }
                }
            }
        }

        if parts.is_empty() {
            bail!("COLLADA document contains no triangle geometry");
        }
        Ok(LoadedGeometry { parts })
    }
}

struct Document<'a> {
    root: &'a XmlElement,
    geometries: Vec<(&'a str, &'a XmlElement)>,
    materials: HashMap<&'a str, &'a XmlElement>,
    effects: HashMap<&'a str, &'a XmlElement>,
    nodes: HashMap<&'a str, &'a XmlElement>,
}

impl<'a> Document<'a> {
    fn new(root: &'a XmlElement) -> Self {
        let library = |name: &'a str, item: &'a str| -> Vec<(&'a str, &'a XmlElement)> {
            root.children_named(name)
                .flat_map(|lib| lib.children_named(item))
                .filter_map(|element| element.attr("id").map(|id| (id, element)))
                .collect()
        };
        let mut nodes = HashMap::new();
        for lib in root.children_named("library_nodes") {
            index_nodes(lib, &mut nodes);
        }
        Self {
            root,
            geometries: library("library_geometries", "geometry"),
            materials: library("library_materials", "material").into_iter().collect(),
            effects: library("library_effects", "effect").into_iter().collect(),
            nodes,
        }
    }

    fn asset_transform(&self) -> Mat4 {
        let asset = self.root.child("asset");
        let meter = asset
            .and_then(|asset| asset.child("unit"))
            .and_then(|unit| unit.attr("meter"))
            .and_then(|value| value.trim().parse::<f32>().ok())
            .filter(|value| *value > 0.0)
            .unwrap_or(1.0);
        let z_up = asset.and_then(|asset| asset.child("up_axis")).is_some_and(|axis| axis.text.trim() == "Z_UP");
        let rotation = if z_up { Mat4::from_rotation_x(-std::f32::consts::FRAC_PI_2) } else { Mat4::IDENTITY };
        rotation * Mat4::from_scale(Vec3::splat(meter))
    }

    fn visual_scene(&self) -> Option<&'a XmlElement> {
        let scenes: Vec<&XmlElement> = self
            .root
            .children_named("library_visual_scenes")
            .flat_map(|lib| lib.children_named("visual_scene"))
            .collect();
        let wanted = self
            .root
            .child("scene")
            .and_then(|scene| scene.child("instance_visual_scene"))
            .and_then(|instance| instance.attr("url"))
            .map(|url| url.trim_start_matches('#'));
        match wanted {
            Some(id) => scenes.iter().copied().find(|scene| scene.attr("id") == Some(id)).or(scenes.first().copied()),
            None => scenes.first().copied(),
        }
    }

    fn collect_node(&self, node: &'a XmlElement, parent: Mat4, parts: &mut Vec<GeometryPart>) -> Result<()> {
        let transform = parent * node_transform(node);
        for instance in node.children_named("instance_geometry") {
            let Some(url) = instance.attr("url") else { continue };
            let id = url.trim_start_matches('#');
            let Some((id, geometry)) = self.geometries.iter().find(|(geo_id, _)| *geo_id == id) else {
                continue;
            };
            let bindings = material_bindings(instance);
            if let Some(mut part) = self.build_part(id, geometry, transform, &bindings)? {
                if part.name.is_none() {
                    part.name = node.attr("name").map(str::to_string);
                }
                parts.push(part);
            }
        }
        for instance in node.children_named("instance_node") {
            let target = instance.attr("url").map(|url| url.trim_start_matches('#'));
            if let Some(referenced) = target.and_then(|id| self.nodes.get(id)) {
                self.collect_node(referenced, transform, parts)?;
            }
        }
        for child in node.children_named("node") {
            self.collect_node(child, transform, parts)?;
        }
        Ok(())
    }

    fn build_part(
        &self,
        id: &str,
        geometry: &XmlElement,
        transform: Mat4,
        bindings: &HashMap<&str, &str>,
    ) -> Result<Option<GeometryPart>> {
        let Some(mesh_element) = geometry.child("mesh") else {
            return Ok(None);
        };
        let sources = read_sources(mesh_element)?;
        let vertex_sources = read_vertex_inputs(mesh_element);

        let mut positions: Vec<Vec3> = Vec::new();
        let mut normals: Vec<Vec3> = Vec::new();
        let mut indices: Vec<u32> = Vec::new();
        let mut subsets = Vec::new();
        let mut colors = Vec::new();
        let mut has_normals = true;

        for primitive in &mesh_element.children {
            let polygon_sizes = match primitive.name.as_str() {
                "triangles" | "polylist" | "polygons" => polygon_sizes(primitive)?,
                _ => continue,
            };
            let inputs = read_primitive_inputs(primitive);
            let stride = inputs.iter().map(|input| input.offset + 1).max().unwrap_or(1);
            let Some(position_input) = inputs.iter().find(|input| input.semantic == "VERTEX") else {
                bail!("geometry '{id}' primitive has no VERTEX input");
            };
            let position_source = vertex_sources
                .get(position_input.source)
                .copied()
                .unwrap_or(position_input.source);
            let position_data = sources
                .get(position_source)
                .ok_or_else(|| anyhow!("geometry '{id}' references missing source '{position_source}'"))?;
            let normal_input = inputs.iter().find(|input| input.semantic == "NORMAL");
            let normal_data = normal_input.and_then(|input| sources.get(input.source));
            if normal_data.is_none() {
                has_normals = false;
            }

            let index_values = primitive_indices(primitive)?;
            let index_offset = indices.len() as u32;
            let mut cursor = 0usize;
            for size in polygon_sizes.unwrap_or_else(|| vec![3; index_values.len() / stride / 3]) {
                let corners: Vec<u32> = (0..size)
                    .map(|corner| {
                        let base = (cursor + corner) * stride;
                        let fetch = |offset: usize| index_values.get(base + offset).copied();
                        let position_index = fetch(position_input.offset)
                            .ok_or_else(|| anyhow!("geometry '{id}' index list is truncated"))?;
                        let position = position_data.vec3(position_index as usize)?;
                        let normal = match (normal_input, normal_data) {
                            (Some(input), Some(data)) => {
                                let normal_index = fetch(input.offset)
                                    .ok_or_else(|| anyhow!("geometry '{id}' index list is truncated"))?;
                                data.vec3(normal_index as usize)?
                            }
                            _ => Vec3::ZERO,
                        };
                        positions.push(position);
                        normals.push(normal);
                        Ok(positions.len() as u32 - 1)
                    })
                    .collect::<Result<_>>()?;
                for i in 1..corners.len().saturating_sub(1) {
                    indices.extend_from_slice(&[corners[0], corners[i], corners[i + 1]]);
                }
                cursor += size;
            }

            let index_count = indices.len() as u32 - index_offset;
            if index_count == 0 {
                continue;
            }
            subsets.push(MeshSubset { index_offset, index_count, material: colors.len() });
            let symbol = primitive.attr("material");
            colors.push(symbol.map(|symbol| self.diffuse_color(bindings, symbol)).unwrap_or(DEFAULT_DIFFUSE));
        }

        if subsets.is_empty() {
            return Ok(None);
        }
        if !has_normals {
            normals = compute_normals(&positions, &indices);
        }
        let vertices = positions
            .iter()
            .zip(normals)
            .map(|(position, normal)| {
                let normal = normal.normalize_or_zero();
                MeshVertex::new(*position, if normal == Vec3::ZERO { Vec3::Y } else { normal })
            })
            .collect();
        let name = geometry.attr("name").or(Some(id)).map(str::to_string);
        Ok(Some(GeometryPart { name, mesh: Mesh::with_subsets(vertices, indices, subsets), transform, colors }))
    }

    fn diffuse_color(&self, bindings: &HashMap<&str, &str>, symbol: &str) -> [f32; 4] {
        let material_id = bindings.get(symbol).copied().unwrap_or(symbol);
        self.materials
            .get(material_id)
            .and_then(|material| material.child("instance_effect"))
            .and_then(|instance| instance.attr("url"))
            .and_then(|url| self.effects.get(url.trim_start_matches('#')))
            .and_then(|effect| effect.find_descendant("diffuse"))
            .and_then(|diffuse| diffuse.child("color"))
            .and_then(|color| xml::parse_floats(&color.text))
            .and_then(|values| match values.as_slice() {
                [r, g, b, a] => Some([*r, *g, *b, *a]),
                [r, g, b] => Some([*r, *g, *b, 1.0]),
                _ => None,
            })
            .unwrap_or(DEFAULT_DIFFUSE)
    }
}

fn index_nodes<'a>(element: &'a XmlElement, nodes: &mut HashMap<&'a str, &'a XmlElement>) {
    for node in element.children_named("node") {
        if let Some(id) = node.attr("id") {
            nodes.insert(id, node);
        }
        index_nodes(node, nodes);
    }
}

struct Source {
    values: Vec<f32>,
    stride: usize,
}

impl Source {
    fn vec3(&self, index: usize) -> Result<Vec3> {
        let base = index * self.stride;
        match self.values.get(base..base + 3) {
            Some([x, y, z]) => Ok(Vec3::new(*x, *y, *z)),
            _ => bail!("source index {index} out of range"),
        }
    }
}

struct Input<'a> {
    semantic: &'a str,
    source: &'a str,
    offset: usize,
}

fn read_sources(mesh: &XmlElement) -> Result<HashMap<&str, Source>> {
    let mut sources = HashMap::new();
    for source in mesh.children_named("source") {
        let (Some(id), Some(array)) = (source.attr("id"), source.child("float_array")) else {
            continue;
        };
        let values = xml::parse_floats(&array.text).ok_or_else(|| anyhow!("source '{id}' has non-numeric data"))?;
        let stride = source
            .child("technique_common")
            .and_then(|technique| technique.child("accessor"))
            .and_then(|accessor| accessor.attr("stride"))
            .and_then(|stride| stride.parse().ok())
            .filter(|stride: &usize| *stride >= 3)
            .unwrap_or(3);
        sources.insert(id, Source { values, stride });
    }
    Ok(sources)
}

/// `<vertices id>` → position source id.
fn read_vertex_inputs(mesh: &XmlElement) -> HashMap<&str, &str> {
    mesh.children_named("vertices")
        .filter_map(|vertices| {
            let id = vertices.attr("id")?;
            let position = vertices
                .children_named("input")
                .find(|input| input.attr("semantic") == Some("POSITION"))?
                .attr("source")?;
            Some((id, position.trim_start_matches('#')))
        })
        .collect()
}

fn read_primitive_inputs(primitive: &XmlElement) -> Vec<Input<'_>> {
    primitive
        .children_named("input")
        .filter_map(|input| {
            Some(Input {
                semantic: input.attr("semantic")?,
                source: input.attr("source")?.trim_start_matches('#'),
                offset: input.attr("offset").and_then(|offset| offset.parse().ok()).unwrap_or(0),
            })
        })
        .collect()
}

/// Corner count per polygon, `None` for plain triangle lists.
fn polygon_sizes(primitive: &XmlElement) -> Result<Option<Vec<usize>>> {
    match primitive.name.as_str() {
        "polylist" => {
            let vcount = primitive.child("vcount").map(|vcount| vcount.text.as_str()).unwrap_or_default();
            let sizes = vcount
                .split_whitespace()
                .map(|value| value.parse::<usize>())
                .collect::<Result<Vec<_>, _>>()
                .context("polylist vcount is not numeric")?;
            Ok(Some(sizes))
        }
        "polygons" => {
            let stride = read_primitive_inputs(primitive).iter().map(|input| input.offset + 1).max().unwrap_or(1);
            Ok(Some(
                primitive.children_named("p").map(|p| p.text.split_whitespace().count() / stride).collect(),
            ))
        }
        _ => Ok(None),
    }
}

fn primitive_indices(primitive: &XmlElement) -> Result<Vec<u32>> {
    let mut values = Vec::new();
    for p in primitive.children_named("p") {
        for value in p.text.split_whitespace() {
            values.push(value.parse::<u32>().with_context(|| format!("invalid index '{value}'"))?);
        }
    }
    Ok(values)
}

fn material_bindings(instance: &XmlElement) -> HashMap<&str, &str> {
    instance
        .child("bind_material")
        .and_then(|bind| bind.child("technique_common"))
        .map(|technique| {
            technique
                .children_named("instance_material")
                .filter_map(|material| {
                    Some((material.attr("symbol")?, material.attr("target")?.trim_start_matches('#')))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn node_transform(node: &XmlElement) -> Mat4 {
    let mut transform = Mat4::IDENTITY;
    for child in &node.children {
        let Some(values) = xml::parse_floats(&child.text) else { continue };
        let step = match (child.name.as_str(), values.as_slice()) {
            ("matrix", [..]) if values.len() == 16 => {
                let mut columns = [0.0f32; 16];
                columns.copy_from_slice(&values);
                // COLLADA stores matrices row-major.
                Mat4::from_cols_array(&columns).transpose()
            }
            ("translate", [x, y, z]) => Mat4::from_translation(Vec3::new(*x, *y, *z)),
            ("rotate", [x, y, z, degrees]) => {
                let axis = Vec3::new(*x, *y, *z).normalize_or_zero();
                if axis == Vec3::ZERO {
                    continue;
                }
                Mat4::from_quat(Quat::from_axis_angle(axis, degrees.to_radians()))
            }
            ("scale", [x, y, z]) => Mat4::from_scale(Vec3::new(*x, *y, *z)),
            _ => continue,
        };
        transform *= step;
    }
    transform
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUAD: &str = r##"<?xml version="1.0" encoding="utf-8"?>
<COLLADA xmlns="http://www.collada.org/2005/11/COLLADASchema" version="1.4.1">
  <asset><unit name="millimeter" meter="0.001"/><up_axis>Z_UP</up_axis></asset>
  <library_effects>
    <effect id="red-effect"><profile_COMMON><technique sid="common"><phong>
      <diffuse><color>1 0 0 1</color></diffuse>
    </phong></technique></profile_COMMON></effect>
  </library_effects>
  <library_materials>
    <material id="red-material"><instance_effect url="#red-effect"/></material>
  </library_materials>
  <library_geometries>
    <geometry id="quad" name="quad">
      <mesh>
        <source id="quad-positions">
          <float_array id="quad-positions-array" count="12">0 0 0 1000 0 0 1000 1000 0 0 1000 0</float_array>
          <technique_common><accessor source="#quad-positions-array" count="4" stride="3"/></technique_common>
        </source>
        <vertices id="quad-vertices"><input semantic="POSITION" source="#quad-positions"/></vertices>
        <polylist material="red" count="1">
          <input semantic="VERTEX" source="#quad-vertices" offset="0"/>
          <vcount>4</vcount>
          <p>0 1 2 3</p>
        </polylist>
      </mesh>
    </geometry>
  </library_geometries>
  <library_visual_scenes>
    <visual_scene id="scene">
      <node id="quad-node" name="quad-node">
        <translate>0 0 500</translate>
        <instance_geometry url="#quad">
          <bind_material><technique_common>
            <instance_material symbol="red" target="#red-material"/>
          </technique_common></bind_material>
        </instance_geometry>
      </node>
    </visual_scene>
  </library_visual_scenes>
  <scene><instance_visual_scene url="#scene"/></scene>
</COLLADA>"##;

    #[test]
    fn triangulates_polylists_and_resolves_materials() {
        let geometry = ColladaLoader.load(QUAD.as_bytes()).expect("collada quad");
        assert_eq!(geometry.parts.len(), 1);
        let part = &geometry.parts[0];
        assert_eq!(part.mesh.triangle_count(), 2);
        assert_eq!(part.colors, vec![[1.0, 0.0, 0.0, 1.0]]);
        assert_eq!(part.name.as_deref(), Some("quad"));
        for vertex in &part.mesh.vertices {
            assert!((Vec3::from_array(vertex.normal) - Vec3::Z).length() < 1e-5);
        }
    }

    #[test]
    fn applies_unit_and_up_axis() {
        let geometry = ColladaLoader.load(QUAD.as_bytes()).expect("collada quad");
        let part = &geometry.parts[0];
        // Node lifts 500mm along Z, which becomes +Y after the up-axis correction.
        let corner = part.transform.transform_point3(Vec3::new(1000.0, 1000.0, 0.0));
        assert!((corner - Vec3::new(1.0, 0.5, -1.0)).length() < 1e-4, "corner was {corner:?}");
    }

    #[test]
    fn rejects_documents_without_geometry() {
        let empty = r#"<COLLADA version="1.4.1"><asset/></COLLADA>"#;
        assert!(ColladaLoader.load(empty.as_bytes()).is_err());
        assert!(ColladaLoader.load(b"solid not collada").is_err());
    }
}
