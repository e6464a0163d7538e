//! GPU-side resource handles shared between the scene graph and the renderer.
//!
//! Every geometry and material gets a process-unique [`ResourceId`]. Renderers upload lazily
//! on first draw and free on [`RenderBackend::release`](crate::renderer::RenderBackend::release),
//! so a resource is live exactly between first draw and explicit release.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::geometry::Mesh;

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    pub fn next() -> Self {
        Self(NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Clone, Debug)]
pub struct Geometry {
    pub id: ResourceId,
    pub mesh: Arc<Mesh>,
}

impl Geometry {
    pub fn new(mesh: Arc<Mesh>) -> Self {
        Self { id: ResourceId::next(), mesh }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Material {
    pub id: ResourceId,
    /// Linear RGBA.
    pub color: [f32; 4],
}

impl Material {
    pub const DEFAULT_COLOR: [f32; 4] = [1.0, 1.0, 1.0, 1.0];

    pub fn new(color: [f32; 4]) -> Self {
        Self { id: ResourceId::next(), color }
    }
}

/// A mesh is drawn with one material or one per subset.
#[derive(Clone, Debug)]
pub enum MaterialSlot {
    Single(Material),
    Array(Vec<Material>),
}

impl MaterialSlot {
    pub fn from_colors(colors: &[[f32; 4]]) -> Self {
        match colors {
            [] => MaterialSlot::Single(Material::new(Material::DEFAULT_COLOR)),
            [color] => MaterialSlot::Single(Material::new(*color)),
            many => MaterialSlot::Array(many.iter().map(|color| Material::new(*color)).collect()),
        }
    }

    /// Material for a subset slot, falling back to the last entry for out-of-range slots.
    pub fn for_slot(&self, slot: usize) -> Option<&Material> {
        match self {
            MaterialSlot::Single(material) => Some(material),
            MaterialSlot::Array(materials) => materials.get(slot).or_else(|| materials.last()),
        }
    }

    pub fn ids(&self) -> Vec<ResourceId> {
        match self {
            MaterialSlot::Single(material) => vec![material.id],
            MaterialSlot::Array(materials) => materials.iter().map(|material| material.id).collect(),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LineVertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
}

impl LineVertex {
    pub fn layout<'a>() -> wgpu::VertexBufferLayout<'a> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<LineVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute { offset: 0, shader_location: 0, format: wgpu::VertexFormat::Float32x3 },
                wgpu::VertexAttribute { offset: 12, shader_location: 1, format: wgpu::VertexFormat::Float32x4 },
            ],
        }
    }
}

/// Line-list geometry, drawn unlit.
#[derive(Clone, Debug)]
pub struct LineGeometry {
    pub id: ResourceId,
    pub vertices: Arc<Vec<LineVertex>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = ResourceId::next();
        let b = ResourceId::next();
        assert_ne!(a, b);
        assert!(b.raw() > a.raw());
    }

    #[test]
    fn material_slots_follow_color_count() {
        assert!(matches!(MaterialSlot::from_colors(&[]), MaterialSlot::Single(_)));
        let array = MaterialSlot::from_colors(&[[1.0, 0.0, 0.0, 1.0], [0.0, 1.0, 0.0, 1.0]]);
        assert_eq!(array.ids().len(), 2);
        assert_eq!(array.for_slot(1).map(|m| m.color), Some([0.0, 1.0, 0.0, 1.0]));
        assert_eq!(array.for_slot(7).map(|m| m.color), Some([0.0, 1.0, 0.0, 1.0]));
        assert!(MaterialSlot::Array(Vec::new()).for_slot(0).is_none());
    }
}
