use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Result};

use super::RenderBackend;
use crate::camera3d::Camera3D;
use crate::resources::ResourceId;
use crate::scene::Scene;

/// Observable state of a [`HeadlessRenderer`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeadlessStats {
    pub frames: u64,
    pub width: u32,
    pub height: u32,
    pub shadows: bool,
    pub clear_color: [f32; 3],
    pub rigs_drawn: usize,
    /// Resources uploaded and not yet released.
    pub resident: BTreeSet<ResourceId>,
    pub released: u64,
    pub disposed: bool,
}

/// Renderer without a GPU. It tracks residency the way the GPU backend does, which makes
/// resource leaks visible to tests and to `--headless` runs.
#[derive(Debug, Clone, Default)]
pub struct HeadlessRenderer {
    stats: Arc<Mutex<HeadlessStats>>,
}

impl HeadlessRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of the stats; stays valid after the renderer is boxed and handed off.
    pub fn stats(&self) -> Arc<Mutex<HeadlessStats>> {
        self.stats.clone()
    }

    pub fn snapshot(&self) -> HeadlessStats {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, HeadlessStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RenderBackend for HeadlessRenderer {
    fn resize(&mut self, width: u32, height: u32) {
        let mut stats = self.lock();
        stats.width = width;
        stats.height = height;
    }

    fn set_shadows(&mut self, enabled: bool) {
        self.lock().shadows = enabled;
    }

    fn render(&mut self, scene: &Scene, _camera: &Camera3D) -> Result<()> {
        let mut stats = self.lock();
        if stats.disposed {
            bail!("renderer has been disposed");
        }
        stats.frames += 1;
        stats.clear_color = scene.background.to_linear();
        stats.rigs_drawn = scene.rig_count();
        stats.resident.extend(scene.resource_ids());
        Ok(())
    }

    fn release(&mut self, resource: ResourceId) {
        let mut stats = self.lock();
        if stats.resident.remove(&resource) {
            stats.released += 1;
        }
    }

    fn dispose(&mut self) {
        let mut stats = self.lock();
        if stats.disposed {
            return;
        }
        let remaining = std::mem::take(&mut stats.resident);
        stats.released += remaining.len() as u64;
        stats.disposed = true;
    }
}
