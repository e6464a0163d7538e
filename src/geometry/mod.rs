//! Triangle meshes and the loaders that produce them from geometry files.

mod collada;
mod gltf_scene;
mod loader;
mod primitives;
mod stl;

pub use collada::ColladaLoader;
pub use gltf_scene::GltfLoader;
pub use loader::{file_extension, GeometryLoader, LoaderRegistry};
pub use stl::StlLoader;

use glam::{Mat4, Vec3};

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
}

impl MeshVertex {
    pub fn new(position: Vec3, normal: Vec3) -> Self {
        Self { position: position.to_array(), normal: normal.to_array() }
    }

    const ATTRIBUTES: [wgpu::VertexAttribute; 2] = wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x3];

    pub fn layout<'a>() -> wgpu::VertexBufferLayout<'a> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<Self>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &Self::ATTRIBUTES,
        }
    }
}

/// Index range drawn with one material slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeshSubset {
    pub index_offset: u32,
    pub index_count: u32,
    pub material: usize,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeshBounds {
    pub min: Vec3,
    pub max: Vec3,
    pub center: Vec3,
    pub radius: f32,
}

#[derive(Clone, Debug)]
pub struct Mesh {
    pub vertices: Vec<MeshVertex>,
    pub indices: Vec<u32>,
    pub subsets: Vec<MeshSubset>,
    pub bounds: MeshBounds,
}

impl Mesh {
    pub fn new(vertices: Vec<MeshVertex>, indices: Vec<u32>) -> Self {
        let subset = MeshSubset { index_offset: 0, index_count: indices.len() as u32, material: 0 };
        Self::with_subsets(vertices, indices, vec![subset])
    }

    pub fn with_subsets(vertices: Vec<MeshVertex>, indices: Vec<u32>, subsets: Vec<MeshSubset>) -> Self {
        let bounds = MeshBounds::from_vertices(&vertices);
        Self { vertices, indices, subsets, bounds }
    }

    /// Builds a mesh from raw positions, deriving smooth normals from the triangle list.
    pub fn from_positions(positions: &[Vec3], indices: Vec<u32>) -> Self {
        let normals = compute_normals(positions, &indices);
        let vertices = positions.iter().zip(normals).map(|(pos, normal)| MeshVertex::new(*pos, normal)).collect();
        Self::new(vertices, indices)
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Number of material slots the subsets reference.
    pub fn material_slots(&self) -> usize {
        self.subsets.iter().map(|subset| subset.material + 1).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

impl MeshBounds {
    pub const EMPTY: MeshBounds = MeshBounds { min: Vec3::ZERO, max: Vec3::ZERO, center: Vec3::ZERO, radius: 0.0 };

    pub fn from_vertices(vertices: &[MeshVertex]) -> Self {
        let points = || vertices.iter().map(|vertex| Vec3::from_array(vertex.position));
        let Some(first) = points().next() else {
            return Self::EMPTY;
        };
        let (min, max) = points().fold((first, first), |(lo, hi), point| (lo.min(point), hi.max(point)));
        let center = min.lerp(max, 0.5);
        let radius = points().map(|point| point.distance(center)).fold(0.0_f32, f32::max);
        MeshBounds { min, max, center, radius }
    }
}

/// One drawable piece of a loaded geometry file.
#[derive(Clone, Debug)]
pub struct GeometryPart {
    pub name: Option<String>,
    pub mesh: Mesh,
    /// Placement of the part inside the file's own coordinate frame.
    pub transform: Mat4,
    /// One linear RGBA color per material slot; empty when the file carries none.
    pub colors: Vec<[f32; 4]>,
}

/// Everything a loader extracted from one geometry file.
#[derive(Clone, Debug, Default)]
pub struct LoadedGeometry {
    pub parts: Vec<GeometryPart>,
}

impl LoadedGeometry {
    pub fn single(mesh: Mesh) -> Self {
        Self { parts: vec![GeometryPart { name: None, mesh, transform: Mat4::IDENTITY, colors: Vec::new() }] }
    }

    pub fn triangle_count(&self) -> usize {
        self.parts.iter().map(|part| part.mesh.triangle_count()).sum()
    }
}

/// Area-weighted vertex normals; vertices touched by no valid triangle point up.
pub(crate) fn compute_normals(positions: &[Vec3], indices: &[u32]) -> Vec<Vec3> {
    let mut accum = vec![Vec3::ZERO; positions.len()];
    let corners = indices.chunks_exact(3).filter_map(|tri| {
        let [a, b, c] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
        (a.max(b).max(c) < positions.len()).then_some([a, b, c])
    });
    for [a, b, c] in corners {
        let face = (positions[b] - positions[a]).cross(positions[c] - positions[a]);
        for corner in [a, b, c] {
            accum[corner] += face;
        }
    }
    accum.into_iter().map(|sum| sum.try_normalize().unwrap_or(Vec3::Y)).collect()
}
