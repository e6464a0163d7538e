use std::f32::consts::{PI, TAU};

use glam::Vec3;

use super::{Mesh, MeshVertex};

const RADIAL_SEGMENTS: u32 = 32;
const SPHERE_RINGS: u32 = 16;

impl Mesh {
    /// Axis-aligned box centred on the origin with flat-shaded faces.
    pub fn cuboid(size: Vec3) -> Self {
        let h = size * 0.5;
        let corners = [
            Vec3::new(-h.x, -h.y, -h.z),
            Vec3::new(h.x, -h.y, -h.z),
            Vec3::new(h.x, h.y, -h.z),
            Vec3::new(-h.x, h.y, -h.z),
            Vec3::new(-h.x, -h.y, h.z),
            Vec3::new(h.x, -h.y, h.z),
            Vec3::new(h.x, h.y, h.z),
            Vec3::new(-h.x, h.y, h.z),
        ];
        let faces: [([usize; 4], Vec3); 6] = [
            ([0, 3, 2, 1], Vec3::NEG_Z),
            ([4, 5, 6, 7], Vec3::Z),
            ([0, 4, 7, 3], Vec3::NEG_X),
            ([1, 2, 6, 5], Vec3::X),
            ([3, 7, 6, 2], Vec3::Y),
            ([0, 1, 5, 4], Vec3::NEG_Y),
        ];

        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (corner_ids, normal) in faces {
            let base = vertices.len() as u32;
            vertices.extend(corner_ids.iter().map(|&id| MeshVertex::new(corners[id], normal)));
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        Self::new(vertices, indices)
    }

    /// Capped cylinder along Z, centred on the origin.
    pub fn cylinder(radius: f32, length: f32) -> Self {
        let half = length * 0.5;
        let mut vertices = Vec::new();
        let mut indices = Vec::new();

        for i in 0..=RADIAL_SEGMENTS {
            let theta = i as f32 / RADIAL_SEGMENTS as f32 * TAU;
            let normal = Vec3::new(theta.cos(), theta.sin(), 0.0);
            vertices.push(MeshVertex::new(normal * radius - Vec3::Z * half, normal));
            vertices.push(MeshVertex::new(normal * radius + Vec3::Z * half, normal));
        }
        for i in 0..RADIAL_SEGMENTS {
            let a = i * 2;
            indices.extend_from_slice(&[a, a + 2, a + 3, a, a + 3, a + 1]);
        }

        for (z, normal) in [(-half, Vec3::NEG_Z), (half, Vec3::Z)] {
            let center = vertices.len() as u32;
            vertices.push(MeshVertex::new(Vec3::new(0.0, 0.0, z), normal));
            for i in 0..=RADIAL_SEGMENTS {
                let theta = i as f32 / RADIAL_SEGMENTS as f32 * TAU;
                vertices.push(MeshVertex::new(Vec3::new(theta.cos() * radius, theta.sin() * radius, z), normal));
            }
            for i in 0..RADIAL_SEGMENTS {
                let rim = center + 1 + i;
                if normal.z > 0.0 {
                    indices.extend_from_slice(&[center, rim, rim + 1]);
                } else {
                    indices.extend_from_slice(&[center, rim + 1, rim]);
                }
            }
        }
        Self::new(vertices, indices)
    }

    pub fn sphere(radius: f32) -> Self {
        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        for ring in 0..=SPHERE_RINGS {
            let phi = ring as f32 / SPHERE_RINGS as f32 * PI;
            for segment in 0..=RADIAL_SEGMENTS {
                let theta = segment as f32 / RADIAL_SEGMENTS as f32 * TAU;
                let normal = Vec3::new(phi.sin() * theta.cos(), phi.sin() * theta.sin(), phi.cos());
                vertices.push(MeshVertex::new(normal * radius, normal));
            }
        }
        let stride = RADIAL_SEGMENTS + 1;
        for ring in 0..SPHERE_RINGS {
            for segment in 0..RADIAL_SEGMENTS {
                let a = ring * stride + segment;
                let b = a + stride;
                indices.extend_from_slice(&[a, b, a + 1, a + 1, b, b + 1]);
            }
        }
        Self::new(vertices, indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cuboid_matches_requested_size() {
        let mesh = Mesh::cuboid(Vec3::new(2.0, 4.0, 6.0));
        assert_eq!(mesh.vertices.len(), 24);
        assert_eq!(mesh.triangle_count(), 12);
        assert_eq!(mesh.bounds.min, Vec3::new(-1.0, -2.0, -3.0));
        assert_eq!(mesh.bounds.max, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn cylinder_runs_along_z() {
        let mesh = Mesh::cylinder(0.5, 2.0);
        assert!((mesh.bounds.max.z - 1.0).abs() < 1e-6);
        assert!((mesh.bounds.min.z + 1.0).abs() < 1e-6);
        assert!((mesh.bounds.max.x - 0.5).abs() < 1e-5);
    }

    #[test]
    fn sphere_vertices_sit_on_radius() {
        let mesh = Mesh::sphere(1.5);
        for vertex in &mesh.vertices {
            assert!((Vec3::from_array(vertex.position).length() - 1.5).abs() < 1e-4);
        }
    }
}
