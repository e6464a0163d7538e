//! Process wiring: config, store, stdio bridge and the window or headless loop around a
//! [`Session`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use glam::Vec2;
use winit::application::ApplicationHandler;
use winit::event::{ElementState, MouseButton, MouseScrollDelta, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::cli::Cli;
use crate::config::AppConfig;
use crate::descriptor::{FileBlob, RobotDescriptor, URDF_MEDIA_TYPE};
use crate::lifecycle::{SharedViewport, WindowViewport};
use crate::protocol::stdio::StdioBridge;
use crate::protocol::{Envelope, ProtocolHandler, Publisher};
use crate::renderer::{GpuRenderer, HeadlessRenderer, WindowSurface};
use crate::session::Session;
use crate::store::{ModelStore, StoreWorker};

const HEADLESS_FRAME: Duration = Duration::from_millis(16);
/// Scroll pixels per zoom step on touchpads.
const PIXELS_PER_ZOOM_STEP: f32 = 50.0;

/// Wakes the event loop from the protocol reader thread.
#[derive(Debug, Clone, Copy)]
pub enum StudioEvent {
    Inbox,
}

pub fn run(cli: Cli) -> Result<()> {
    let mut config = AppConfig::load_or_default(&cli.config);
    let overrides = cli.config_overrides();
    if !overrides.is_empty() {
        log::info!("[cli] overrides applied: {}", overrides.applied_fields().join(", "));
    }
    config.apply_overrides(&overrides);
    let startup = startup_descriptor(&cli)?;

    if cli.headless {
        run_headless(config, startup)
    } else {
        run_windowed(config, startup)
    }
}

fn run_windowed(config: AppConfig, startup: Option<RobotDescriptor>) -> Result<()> {
    let event_loop = EventLoop::<StudioEvent>::with_user_event()
        .build()
        .context("Failed to create winit event loop")?;
    event_loop.set_control_flow(ControlFlow::Wait);

    let (inbox_tx, inbox_rx) = mpsc::channel::<Envelope>();
    let bridge = if config.protocol.stdio {
        let proxy = event_loop.create_proxy();
        Some(StdioBridge::spawn(inbox_tx, move || {
            let _ = proxy.send_event(StudioEvent::Inbox);
        })?)
    } else {
        None
    };
    let publisher = bridge.as_ref().map(StdioBridge::publisher).unwrap_or_else(Publisher::detached);

    let mut studio = Studio::new(config, publisher, startup);
    studio.handler.init(inbox_rx);
    event_loop.run_app(&mut studio).context("Event loop execution failed")?;
    studio.session.shutdown();
    // stdin may still be open, so the bridge threads are left to end with the process
    drop(bridge);
    Ok(())
}

fn run_headless(config: AppConfig, startup: Option<RobotDescriptor>) -> Result<()> {
    let (inbox_tx, inbox_rx) = mpsc::channel::<Envelope>();
    let bridge = if config.protocol.stdio { Some(StdioBridge::spawn(inbox_tx, || {})?) } else { None };
    let publisher = bridge.as_ref().map(StdioBridge::publisher).unwrap_or_else(Publisher::detached);
    let viewport = SharedViewport::new(config.window.width, config.window.height);

    let mut studio = Studio::new(config, publisher, startup);
    studio.handler.init(inbox_rx);
    studio.session.mount(Box::new(viewport), Box::new(HeadlessRenderer::new()));
    studio.activate_startup();

    log::info!("[studio] headless; reading messages from stdin");
    loop {
        studio.handler.pump(&mut studio.session);
        studio.session.frame(Instant::now());
        if !studio.handler.is_listening() {
            break;
        }
        thread::sleep(HEADLESS_FRAME);
    }
    studio.session.shutdown();
    drop(studio);
    if let Some(bridge) = bridge {
        bridge.shutdown();
    }
    Ok(())
}

/// Reads the `--load` URDF and its `--mesh` files into a descriptor.
fn startup_descriptor(cli: &Cli) -> Result<Option<RobotDescriptor>> {
    let Some(urdf_path) = &cli.load else { return Ok(None) };
    let description = FileBlob::new(file_name(urdf_path), read_file(urdf_path)?).with_media_type(URDF_MEDIA_TYPE);
    let geometry = cli
        .meshes
        .iter()
        .map(|path| Ok(FileBlob::new(file_name(path), read_file(path)?)))
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(RobotDescriptor::new(file_name(urdf_path), description, geometry)))
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn file_name(path: &Path) -> String {
    path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_else(|| path.display().to_string())
}

fn open_store(config: &AppConfig, session: &mut Session) -> Option<StoreWorker> {
    if !config.store.enabled {
        return None;
    }
    let directory: PathBuf = match config.store.resolved_directory() {
        Some(directory) => directory,
        None => {
            log::warn!("[store] no data directory available; persistence disabled");
            return None;
        }
    };
    let store = match ModelStore::open(&directory, config.store.version) {
        Ok(store) => store,
        Err(err) => {
            log::warn!("[store] {err}; persistence disabled");
            return None;
        }
    };
    session.restore(&store);
    match StoreWorker::spawn(store) {
        Ok(worker) => Some(worker),
        Err(err) => {
            log::warn!("[store] {err:#}; persistence disabled");
            None
        }
    }
}

struct Studio {
    config: AppConfig,
    session: Session,
    handler: ProtocolHandler,
    window: Option<Arc<Window>>,
    startup: Option<RobotDescriptor>,
    cursor: Option<Vec2>,
    drag: Option<MouseButton>,
    should_close: bool,
}

impl Studio {
    fn new(config: AppConfig, publisher: Publisher, startup: Option<RobotDescriptor>) -> Self {
        let mut session = Session::new(config.scene.clone(), config.viewer.clone()).with_publisher(publisher);
        if let Some(store) = open_store(&config, &mut session) {
            session = session.with_store(store);
        }
        Self {
            config,
            session,
            handler: ProtocolHandler::new(),
            window: None,
            startup,
            cursor: None,
            drag: None,
            should_close: false,
        }
    }

    fn activate_startup(&mut self) {
        let Some(descriptor) = self.startup.take() else { return };
        let activated = self
            .session
            .add_descriptor(descriptor)
            .and_then(|descriptor| self.session.activate(&descriptor.id));
        if let Err(err) = activated {
            log::error!("[studio] startup model: {err}");
        }
    }

    fn mount_window(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let mut surface = WindowSurface::new(&self.config.window);
        let window = surface.ensure_window(event_loop)?;
        let renderer = GpuRenderer::new(surface)?;
        self.session.mount(Box::new(WindowViewport(window.clone())), Box::new(renderer));
        window.request_redraw();
        self.window = Some(window);
        Ok(())
    }

    fn request_redraw(&self) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn viewport_height(&self) -> f32 {
        self.window.as_ref().map(|window| window.inner_size().height as f32).unwrap_or(0.0)
    }

    fn cursor_moved(&mut self, position: Vec2) {
        let previous = self.cursor.replace(position);
        let (Some(button), Some(previous)) = (self.drag, previous) else { return };
        let drag = position - previous;
        let height = self.viewport_height();
        let Some((controls, camera)) = self.session.viewer_mut().navigation_mut() else { return };
        match button {
            MouseButton::Left => controls.rotate(drag, height),
            MouseButton::Right | MouseButton::Middle => controls.pan(drag, camera, height),
            _ => return,
        }
        self.request_redraw();
    }
}

impl ApplicationHandler<StudioEvent> for Studio {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.session.viewer().is_mounted() {
            return;
        }
        if let Err(err) = self.mount_window(event_loop) {
            log::error!("[studio] renderer initialization failed: {err:#}");
            self.should_close = true;
            return;
        }
        self.activate_startup();
    }

    fn user_event(&mut self, _event_loop: &ActiveEventLoop, event: StudioEvent) {
        match event {
            StudioEvent::Inbox => {
                if self.handler.pump(&mut self.session) > 0 {
                    self.request_redraw();
                }
            }
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => self.should_close = true,
            WindowEvent::Resized(_) => {
                self.session.viewer_mut().notify_resize(Instant::now());
                self.request_redraw();
            }
            WindowEvent::CursorMoved { position, .. } => {
                self.cursor_moved(Vec2::new(position.x as f32, position.y as f32));
            }
            WindowEvent::CursorLeft { .. } => {
                self.cursor = None;
                self.drag = None;
            }
            WindowEvent::MouseInput { state, button, .. } => {
                self.drag = match state {
                    ElementState::Pressed => Some(button),
                    ElementState::Released => None,
                };
            }
            WindowEvent::MouseWheel { delta, .. } => {
                let steps = match delta {
                    MouseScrollDelta::LineDelta(_, y) => y,
                    MouseScrollDelta::PixelDelta(offset) => offset.y as f32 / PIXELS_PER_ZOOM_STEP,
                };
                if let Some(controls) = self.session.viewer_mut().controls_mut() {
                    controls.zoom(steps);
                }
                self.request_redraw();
            }
            WindowEvent::RedrawRequested => {
                self.handler.pump(&mut self.session);
                if self.session.frame(Instant::now()) {
                    self.request_redraw();
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.should_close {
            event_loop.exit();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.session.shutdown();
        self.window = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_descriptor_reads_urdf_and_meshes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let urdf = dir.path().join("arm.urdf");
        let mesh = dir.path().join("base.stl");
        fs::write(&urdf, "<robot name=\"arm\"><link name=\"base\"/></robot>").expect("write urdf");
        fs::write(&mesh, b"solid base\nendsolid base\n").expect("write mesh");

        let cli = Cli::parse([
            "urdf_studio",
            "--load",
            urdf.to_str().expect("utf8 path"),
            "--mesh",
            mesh.to_str().expect("utf8 path"),
        ])
        .expect("parse cli");
        let descriptor = startup_descriptor(&cli).expect("read files").expect("descriptor");
        assert_eq!(descriptor.name, "arm.urdf");
        assert_eq!(descriptor.description.media_type.as_deref(), Some(URDF_MEDIA_TYPE));
        assert!(descriptor.geometry.contains_key("base.stl"));
    }

    #[test]
    fn missing_startup_file_is_an_error() {
        let cli = Cli::parse(["urdf_studio", "--load", "/definitely/not/here.urdf"]).expect("parse cli");
        let err = startup_descriptor(&cli).expect_err("missing file");
        assert!(format!("{err:#}").contains("here.urdf"));
    }

    #[test]
    fn no_startup_model_without_load() {
        let cli = Cli::parse(["urdf_studio"]).expect("parse cli");
        assert!(startup_descriptor(&cli).expect("no files").is_none());
    }
}
