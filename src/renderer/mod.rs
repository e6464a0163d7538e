//! Render backends behind the viewer's lifecycle manager.

mod gpu;
mod headless;
mod window_surface;

pub use gpu::GpuRenderer;
pub use headless::{HeadlessRenderer, HeadlessStats};
pub use window_surface::WindowSurface;

use anyhow::Result;

use crate::camera3d::Camera3D;
use crate::resources::ResourceId;
use crate::scene::Scene;

pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// Draws a [`Scene`] and owns the GPU-side copies of its resources.
///
/// Resources are uploaded lazily on first draw and stay resident until [`release`](Self::release)
/// names them; the scene never shares ownership with the backend.
pub trait RenderBackend {
    fn resize(&mut self, width: u32, height: u32);

    fn set_shadows(&mut self, enabled: bool);

    fn render(&mut self, scene: &Scene, camera: &Camera3D) -> Result<()>;

    fn release(&mut self, resource: ResourceId);

    /// Frees everything still resident. Further calls are no-ops.
    fn dispose(&mut self);
}
