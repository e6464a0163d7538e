use anyhow::{anyhow, bail, Context, Result};
use glam::Vec3;

use super::{GeometryLoader, LoadedGeometry, Mesh, MeshVertex};

const HEADER_LEN: usize = 80;
const FACET_LEN: usize = 50;

/// Binary and ASCII STL. Facets keep flat normals; vertices are not welded.
pub struct StlLoader;

impl GeometryLoader for StlLoader {
    fn format_name(&self) -> &'static str {
        "stl"
    }

    fn load(&self, bytes: &[u8]) -> Result<LoadedGeometry> {
        let triangles = if is_binary(bytes) { parse_binary(bytes)? } else { parse_ascii(bytes)? };
        if triangles.is_empty() {
            bail!("STL contains no facets");
        }
        Ok(LoadedGeometry::single(build_mesh(&triangles)))
    }
}

struct Facet {
    normal: Vec3,
    corners: [Vec3; 3],
}

fn is_binary(bytes: &[u8]) -> bool {
    if bytes.len() < HEADER_LEN + 4 {
        return false;
    }
    let count = u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]) as usize;
    let expected = HEADER_LEN + 4 + count * FACET_LEN;
    // Some exporters write "solid" into binary headers, so the size check wins.
    expected == bytes.len() || !bytes.trim_ascii_start().starts_with(b"solid")
}

fn parse_binary(bytes: &[u8]) -> Result<Vec<Facet>> {
    let count = u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]) as usize;
    let body = &bytes[HEADER_LEN + 4..];
    if body.len() < count * FACET_LEN {
        bail!("binary STL declares {count} facets but holds {} bytes", body.len());
    }
    let read_vec = |chunk: &[u8], offset: usize| {
        let f = |i: usize| {
            let at = offset + i * 4;
            f32::from_le_bytes([chunk[at], chunk[at + 1], chunk[at + 2], chunk[at + 3]])
        };
        Vec3::new(f(0), f(1), f(2))
    };
    Ok(body
        .chunks_exact(FACET_LEN)
        .take(count)
        .map(|chunk| Facet {
            normal: read_vec(chunk, 0),
            corners: [read_vec(chunk, 12), read_vec(chunk, 24), read_vec(chunk, 36)],
        })
        .collect())
}

fn parse_ascii(bytes: &[u8]) -> Result<Vec<Facet>> {
    let text = std::str::from_utf8(bytes).context("ASCII STL is not valid UTF-8")?;
    let mut facets = Vec::new();
    let mut normal = Vec3::ZERO;
    let mut corners = Vec::with_capacity(3);
    for (line_no, line) in text.lines().enumerate() {
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("facet") => {
                corners.clear();
                normal = match tokens.next() {
                    Some("normal") => parse_triplet(&mut tokens).unwrap_or(Vec3::ZERO),
                    _ => Vec3::ZERO,
                };
            }
            Some("vertex") => {
                let corner = parse_triplet(&mut tokens)
                    .ok_or_else(|| anyhow!("bad vertex on line {}", line_no + 1))?;
                corners.push(corner);
            }
            Some("endfacet") => {
                if corners.len() != 3 {
                    bail!("facet ending on line {} has {} vertices", line_no + 1, corners.len());
                }
                facets.push(Facet { normal, corners: [corners[0], corners[1], corners[2]] });
                corners.clear();
            }
            _ => {}
        }
    }
    Ok(facets)
}

fn parse_triplet<'a>(tokens: &mut impl Iterator<Item = &'a str>) -> Option<Vec3> {
    let x = tokens.next()?.parse().ok()?;
    let y = tokens.next()?.parse().ok()?;
    let z = tokens.next()?.parse().ok()?;
    Some(Vec3::new(x, y, z))
}

fn build_mesh(facets: &[Facet]) -> Mesh {
    let mut vertices = Vec::with_capacity(facets.len() * 3);
    for facet in facets {
        let [a, b, c] = facet.corners;
        let computed = (b - a).cross(c - a).normalize_or_zero();
        let normal = if facet.normal.length_squared() > 1e-12 { facet.normal.normalize() } else { computed };
        vertices.extend(facet.corners.iter().map(|corner| MeshVertex::new(*corner, normal)));
    }
    let indices = (0..vertices.len() as u32).collect();
    Mesh::new(vertices, indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary_triangle() -> Vec<u8> {
        let mut bytes = vec![0u8; HEADER_LEN];
        bytes.extend_from_slice(&1u32.to_le_bytes());
        for value in [0.0f32, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes.extend_from_slice(&[0, 0]);
        bytes
    }

    #[test]
    fn parses_binary_facets() {
        let geometry = StlLoader.load(&binary_triangle()).expect("binary stl");
        let mesh = &geometry.parts[0].mesh;
        assert_eq!(mesh.vertices.len(), 3);
        assert_eq!(mesh.vertices[1].position, [1.0, 0.0, 0.0]);
        assert_eq!(mesh.vertices[0].normal, [0.0, 0.0, 1.0]);
    }

    #[test]
    fn binary_header_starting_with_solid_is_still_binary() {
        let mut bytes = binary_triangle();
        bytes[..5].copy_from_slice(b"solid");
        assert!(is_binary(&bytes));
        assert_eq!(StlLoader.load(&bytes).expect("binary stl").triangle_count(), 1);
    }

    #[test]
    fn parses_ascii_and_derives_missing_normals() {
        let text = "solid part\n facet normal 0 0 0\n  outer loop\n   vertex 0 0 0\n   vertex 1 0 0\n   vertex 0 1 0\n  endloop\n endfacet\nendsolid part\n";
        let geometry = StlLoader.load(text.as_bytes()).expect("ascii stl");
        let mesh = &geometry.parts[0].mesh;
        assert_eq!(mesh.triangle_count(), 1);
        assert!((Vec3::from_array(mesh.vertices[2].normal) - Vec3::Z).length() < 1e-6);
    }

    #[test]
    fn empty_ascii_is_rejected() {
        assert!(StlLoader.load(b"solid empty\nendsolid empty\n").is_err());
    }
}
