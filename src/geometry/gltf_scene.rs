use anyhow::{bail, Context, Result};
use glam::{Mat4, Vec3};
use gltf::mesh::Mode;

use super::{compute_normals, GeometryLoader, GeometryPart, LoadedGeometry, Mesh, MeshSubset, MeshVertex};

/// glTF 2.0, binary or with embedded buffers. External buffer URIs are not resolved.
pub struct GltfLoader;

impl GeometryLoader for GltfLoader {
    fn format_name(&self) -> &'static str {
        "gltf"
    }

    fn load(&self, bytes: &[u8]) -> Result<LoadedGeometry> {
        let (document, buffers, _images) = gltf::import_slice(bytes).context("failed to import glTF")?;
        let mut parts = Vec::new();

        match document.default_scene().or_else(|| document.scenes().next()) {
            Some(scene) => {
                for node in scene.nodes() {
                    collect_node(&node, Mat4::IDENTITY, &buffers, &mut parts)?;
                }
            }
            None => {
                for mesh in document.meshes() {
                    if let Some(part) = build_part(&mesh, Mat4::IDENTITY, &buffers)? {
                        parts.push(part);
                    }
                }
            }
        }

        if parts.is_empty() {
            bail!("glTF contains no triangle primitives");
        }
        Ok(LoadedGeometry { parts })
    }
}

fn collect_node(
    node: &gltf::Node,
    parent: Mat4,
    buffers: &[gltf::buffer::Data],
    parts: &mut Vec<GeometryPart>,
) -> Result<()> {
    let transform = parent * Mat4::from_cols_array_2d(&node.transform().matrix());
    if let Some(mesh) = node.mesh() {
        if let Some(mut part) = build_part(&mesh, transform, buffers)? {
            part.name = part.name.or_else(|| node.name().map(str::to_string));
            parts.push(part);
        }
    }
    for child in node.children() {
        collect_node(&child, transform, buffers, parts)?;
    }
    Ok(())
}

fn build_part(mesh: &gltf::Mesh, transform: Mat4, buffers: &[gltf::buffer::Data]) -> Result<Option<GeometryPart>> {
    let mut vertices: Vec<MeshVertex> = Vec::new();
    let mut indices: Vec<u32> = Vec::new();
    let mut subsets = Vec::new();
    let mut colors = Vec::new();

    for primitive in mesh.primitives() {
        if primitive.mode() != Mode::Triangles {
            continue;
        }
        let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|data| &data.0[..]));
        let Some(positions) = reader.read_positions() else { continue };
        let positions: Vec<Vec3> = positions.map(Vec3::from_array).collect();
        if positions.is_empty() {
            continue;
        }
        let local_indices: Vec<u32> = reader
            .read_indices()
            .map(|read| read.into_u32().collect())
            .unwrap_or_else(|| (0..positions.len() as u32).collect());
        let normals: Vec<Vec3> = match reader.read_normals() {
            Some(normals) => normals.map(Vec3::from_array).collect(),
            None => compute_normals(&positions, &local_indices),
        };

        let base_vertex = vertices.len() as u32;
        vertices.extend(positions.iter().enumerate().map(|(i, position)| {
            MeshVertex::new(*position, normals.get(i).copied().unwrap_or(Vec3::Y))
        }));
        let index_offset = indices.len() as u32;
        indices.extend(local_indices.iter().map(|index| index + base_vertex));
        subsets.push(MeshSubset { index_offset, index_count: local_indices.len() as u32, material: colors.len() });
        colors.push(primitive.material().pbr_metallic_roughness().base_color_factor());
    }

    if subsets.is_empty() {
        return Ok(None);
    }
    Ok(Some(GeometryPart {
        name: mesh.name().map(str::to_string),
        mesh: Mesh::with_subsets(vertices, indices, subsets),
        transform,
        colors,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRIANGLE: &str = r#"{
        "asset": { "version": "2.0" },
        "scene": 0,
        "scenes": [{ "nodes": [0] }],
        "nodes": [{ "mesh": 0, "translation": [0.0, 2.0, 0.0] }],
        "meshes": [{ "name": "tri", "primitives": [{ "attributes": { "POSITION": 0 }, "material": 0 }] }],
        "materials": [{ "pbrMetallicRoughness": { "baseColorFactor": [0.0, 0.0, 1.0, 1.0] } }],
        "buffers": [{ "byteLength": 36, "uri": "data:application/octet-stream;base64,AAAAAAAAAAAAAAAAAACAPwAAAAAAAAAAAAAAAAAAgD8AAAAA" }],
        "bufferViews": [{ "buffer": 0, "byteOffset": 0, "byteLength": 36 }],
        "accessors": [{
            "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3",
            "min": [0.0, 0.0, 0.0], "max": [1.0, 1.0, 0.0]
        }]
    }"#;

    #[test]
    fn loads_embedded_triangle_with_node_transform() {
        let geometry = GltfLoader.load(TRIANGLE.as_bytes()).expect("gltf triangle");
        assert_eq!(geometry.parts.len(), 1);
        let part = &geometry.parts[0];
        assert_eq!(part.name.as_deref(), Some("tri"));
        assert_eq!(part.mesh.triangle_count(), 1);
        assert_eq!(part.colors, vec![[0.0, 0.0, 1.0, 1.0]]);
        assert_eq!(part.transform.transform_point3(Vec3::ZERO), Vec3::new(0.0, 2.0, 0.0));
        assert!((Vec3::from_array(part.mesh.vertices[0].normal) - Vec3::Z).length() < 1e-5);
    }

    #[test]
    fn rejects_garbage() {
        assert!(GltfLoader.load(b"not a gltf").is_err());
    }
}
