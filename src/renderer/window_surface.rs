use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use winit::dpi::PhysicalSize;
use winit::event_loop::ActiveEventLoop;
use winit::window::Window;

use super::DEPTH_FORMAT;
use crate::config::WindowConfig;

/// How a failed frame acquisition is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameFault {
    /// Swapchain no longer matches the window; reconfigure and skip the frame.
    Stale,
    /// Skip the frame and try again next time.
    Transient,
    Fatal,
}

impl FrameFault {
    fn classify(error: &wgpu::SurfaceError) -> Self {
        match error {
            wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated => FrameFault::Stale,
            wgpu::SurfaceError::Timeout => FrameFault::Transient,
            wgpu::SurfaceError::OutOfMemory | wgpu::SurfaceError::Other => FrameFault::Fatal,
        }
    }
}

/// Everything that exists only once the window has a GPU behind it.
struct Live {
    window: Arc<Window>,
    surface: wgpu::Surface<'static>,
    device: wgpu::Device,
    queue: wgpu::Queue,
    config: wgpu::SurfaceConfiguration,
    depth: wgpu::TextureView,
}

impl Live {
    fn reconfigure(&mut self, size: PhysicalSize<u32>) {
        self.config.width = size.width;
        self.config.height = size.height;
        self.surface.configure(&self.device, &self.config);
        self.depth = depth_target(&self.device, size);
    }
}

/// The viewer's window together with its swapchain and depth target.
///
/// Created empty; [`ensure_window`](Self::ensure_window) opens the window and binds a device
/// the first time the event loop resumes. Zero-sized resizes are remembered but not applied,
/// since a minimised window cannot back a swapchain.
pub struct WindowSurface {
    title: String,
    vsync: bool,
    size: PhysicalSize<u32>,
    live: Option<Live>,
    #[cfg(test)]
    reconfigure_requests: usize,
}

impl WindowSurface {
    pub fn new(window_cfg: &WindowConfig) -> Self {
        Self {
            title: window_cfg.title.clone(),
            vsync: window_cfg.vsync,
            size: PhysicalSize::new(window_cfg.width, window_cfg.height),
            live: None,
            #[cfg(test)]
            reconfigure_requests: 0,
        }
    }

    pub fn ensure_window(&mut self, event_loop: &ActiveEventLoop) -> Result<Arc<Window>> {
        if let Some(live) = &self.live {
            return Ok(live.window.clone());
        }
        let attrs = Window::default_attributes().with_title(self.title.as_str()).with_inner_size(self.size);
        let window = Arc::new(event_loop.create_window(attrs).context("Failed to create viewer window")?);
        let live = pollster::block_on(self.bind_gpu(window.clone()))?;
        self.size = live.window.inner_size();
        self.live = Some(live);
        log::info!("[surface] window ready at {}x{}", self.size.width, self.size.height);
        Ok(window)
    }

    fn live(&self) -> Result<&Live> {
        self.live.as_ref().context("Viewer surface is not bound to a GPU")
    }

    pub fn device(&self) -> Result<&wgpu::Device> {
        Ok(&self.live()?.device)
    }

    pub fn queue(&self) -> Result<&wgpu::Queue> {
        Ok(&self.live()?.queue)
    }

    pub fn depth_view(&self) -> Result<&wgpu::TextureView> {
        Ok(&self.live()?.depth)
    }

    pub fn surface_format(&self) -> Result<wgpu::TextureFormat> {
        Ok(self.live()?.config.format)
    }

    pub fn size(&self) -> PhysicalSize<u32> {
        self.size
    }

    pub fn window(&self) -> Option<&Arc<Window>> {
        self.live.as_ref().map(|live| &live.window)
    }

    pub fn resize(&mut self, new_size: PhysicalSize<u32>) {
        self.size = new_size;
        #[cfg(test)]
        {
            self.reconfigure_requests += 1;
        }
        if new_size.width == 0 || new_size.height == 0 {
            return;
        }
        if let Some(live) = self.live.as_mut() {
            live.reconfigure(new_size);
        }
    }

    pub fn acquire_frame(&mut self) -> Result<wgpu::SurfaceTexture> {
        let outcome = self.live()?.surface.get_current_texture();
        outcome.map_err(|err| self.recover(&err))
    }

    /// Drops the swapchain, device and this surface's handle on the window.
    pub fn release(&mut self) {
        if self.live.take().is_some() {
            log::debug!("[surface] released");
        }
    }

    fn recover(&mut self, error: &wgpu::SurfaceError) -> anyhow::Error {
        match FrameFault::classify(error) {
            FrameFault::Stale => {
                self.resize(self.size);
                anyhow!("Swapchain was stale ({error}); reconfigured")
            }
            FrameFault::Transient => anyhow!("Frame skipped: {error}"),
            FrameFault::Fatal => anyhow!("Surface failure: {error}"),
        }
    }

    fn present_mode(&self, supported: &[wgpu::PresentMode]) -> wgpu::PresentMode {
        let preferred: &[wgpu::PresentMode] = if self.vsync {
            &[wgpu::PresentMode::Fifo]
        } else {
            &[wgpu::PresentMode::Mailbox, wgpu::PresentMode::Immediate]
        };
        preferred.iter().copied().find(|mode| supported.contains(mode)).unwrap_or(wgpu::PresentMode::Fifo)
    }

    async fn bind_gpu(&self, window: Arc<Window>) -> Result<Live> {
        let instance = wgpu::Instance::default();
        let surface = instance.create_surface(window.clone()).context("Failed to create viewer surface")?;
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .context("No GPU adapter can present to the viewer window")?;
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("urdf-studio-device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
                experimental_features: wgpu::ExperimentalFeatures::default(),
                memory_hints: wgpu::MemoryHints::default(),
                trace: wgpu::Trace::default(),
            })
            .await
            .context("Failed to open GPU device")?;

        let caps = surface.get_capabilities(&adapter);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(wgpu::TextureFormat::is_srgb)
            .or_else(|| caps.formats.first().copied())
            .context("Viewer surface supports no texture formats")?;
        let size = window.inner_size();
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: self.present_mode(&caps.present_modes),
            alpha_mode: caps.alpha_modes.first().copied().unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: Vec::new(),
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);
        let depth = depth_target(&device, size);
        Ok(Live { window, surface, device, queue, config, depth })
    }
}

fn depth_target(device: &wgpu::Device, size: PhysicalSize<u32>) -> wgpu::TextureView {
    device
        .create_texture(&wgpu::TextureDescriptor {
            label: Some("viewer-depth"),
            size: wgpu::Extent3d { width: size.width.max(1), height: size.height.max(1), depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        })
        .create_view(&wgpu::TextureViewDescriptor::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgpu::PresentMode;

    #[test]
    fn vsync_off_prefers_mailbox_then_immediate() {
        let surface = WindowSurface::new(&WindowConfig { vsync: false, ..WindowConfig::default() });
        assert_eq!(surface.present_mode(&[PresentMode::Fifo, PresentMode::Immediate]), PresentMode::Immediate);
        assert_eq!(
            surface.present_mode(&[PresentMode::Immediate, PresentMode::Mailbox, PresentMode::Fifo]),
            PresentMode::Mailbox
        );
        assert_eq!(surface.present_mode(&[PresentMode::Fifo]), PresentMode::Fifo);

        let vsync = WindowSurface::new(&WindowConfig::default());
        assert_eq!(vsync.present_mode(&[PresentMode::Immediate, PresentMode::Fifo]), PresentMode::Fifo);
    }

    #[test]
    fn stale_swapchain_triggers_reconfigure() {
        assert_eq!(FrameFault::classify(&wgpu::SurfaceError::Outdated), FrameFault::Stale);
        assert_eq!(FrameFault::classify(&wgpu::SurfaceError::Timeout), FrameFault::Transient);
        assert_eq!(FrameFault::classify(&wgpu::SurfaceError::OutOfMemory), FrameFault::Fatal);

        let mut surface = WindowSurface::new(&WindowConfig::default());
        let err = surface.recover(&wgpu::SurfaceError::Lost);
        assert!(err.to_string().contains("reconfigured"));
        assert_eq!(surface.reconfigure_requests, 1);
    }

    #[test]
    fn unbound_surface_reports_errors_and_keeps_size() {
        let mut surface = WindowSurface::new(&WindowConfig::default());
        assert!(surface.device().is_err());
        assert!(surface.acquire_frame().is_err());
        surface.resize(PhysicalSize::new(0, 0));
        assert_eq!(surface.size(), PhysicalSize::new(0, 0));
        assert!(surface.window().is_none());
        surface.release();
    }
}
