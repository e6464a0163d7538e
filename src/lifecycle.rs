//! Scene, camera, navigation and renderer lifecycle.
//!
//! A [`Viewer`] is either unmounted (only the [`SceneConfig`] is held) or mounted on a
//! [`ViewportHost`] with a live scene and render backend. Camera and scene mutations are silent
//! no-ops while unmounted, and [`Viewer::dispose`] returns it to that state from anywhere.
//!
//! Rigs outlive mounts: a rig attached while unmounted, or still attached when the viewer is
//! disposed, is held off-scene and placed under the scene root by the next [`Viewer::init`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use glam::Vec3;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use winit::window::Window;

use crate::camera3d::{Camera3D, OrbitControls};
use crate::config::ViewerConfig;
use crate::renderer::RenderBackend;
use crate::rig::Rig;
use crate::scene::{AmbientLight, Color, DirectionalLight, GridHelper, Scene, SceneConfig};

const NEAR_PLANE: f32 = 0.1;
const FAR_PLANE: f32 = 1000.0;
/// Initial camera offset along each axis, as a share of `cameraDistance`.
const INITIAL_OFFSET: f32 = 0.7;

/// Anything the viewer can be mounted on.
pub trait ViewportHost {
    /// Drawable size in physical pixels.
    fn pixel_size(&self) -> (u32, u32);
}

pub struct WindowViewport(pub Arc<Window>);

impl ViewportHost for WindowViewport {
    fn pixel_size(&self) -> (u32, u32) {
        let size = self.0.inner_size();
        (size.width, size.height)
    }
}

/// Fixed-size viewport whose size can be changed from outside, for headless runs.
#[derive(Debug, Clone)]
pub struct SharedViewport(Arc<Mutex<(u32, u32)>>);

impl SharedViewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self(Arc::new(Mutex::new((width, height))))
    }

    pub fn set_size(&self, width: u32, height: u32) {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = (width, height);
    }
}

impl ViewportHost for SharedViewport {
    fn pixel_size(&self) -> (u32, u32) {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Canonical axis-aligned camera views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewDirection {
    PosX,
    NegX,
    PosY,
    NegY,
    PosZ,
    NegZ,
}

impl ViewDirection {
    pub const ALL: [ViewDirection; 6] = [
        ViewDirection::PosX,
        ViewDirection::NegX,
        ViewDirection::PosY,
        ViewDirection::NegY,
        ViewDirection::PosZ,
        ViewDirection::NegZ,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ViewDirection::PosX => "+x",
            ViewDirection::NegX => "-x",
            ViewDirection::PosY => "+y",
            ViewDirection::NegY => "-y",
            ViewDirection::PosZ => "+z",
            ViewDirection::NegZ => "-z",
        }
    }

    pub fn axis(self) -> Vec3 {
        match self {
            ViewDirection::PosX => Vec3::X,
            ViewDirection::NegX => Vec3::NEG_X,
            ViewDirection::PosY => Vec3::Y,
            ViewDirection::NegY => Vec3::NEG_Y,
            ViewDirection::PosZ => Vec3::Z,
            ViewDirection::NegZ => Vec3::NEG_Z,
        }
    }

    /// Z-up for x and y views, Y-up for z views.
    pub fn up(self) -> Vec3 {
        match self {
            ViewDirection::PosZ | ViewDirection::NegZ => Vec3::Y,
            _ => Vec3::Z,
        }
    }
}

impl fmt::Display for ViewDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViewDirection {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ViewDirection::ALL
            .into_iter()
            .find(|view| view.as_str() == value)
            .ok_or_else(|| format!("unknown view '{value}', expected one of +x,-x,+y,-y,+z,-z"))
    }
}

impl Serialize for ViewDirection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ViewDirection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Debounced size-change observer.
#[derive(Debug, Clone, Copy)]
struct ResizeObserver {
    delay: Duration,
    deadline: Option<Instant>,
}

struct Mounted {
    container: Box<dyn ViewportHost>,
    renderer: Box<dyn RenderBackend>,
    scene: Scene,
    camera: Camera3D,
    controls: OrbitControls,
    resize: Option<ResizeObserver>,
    running: bool,
}

pub struct Viewer {
    config: SceneConfig,
    settings: ViewerConfig,
    mounted: Option<Mounted>,
    /// Rigs waiting for a mount.
    off_scene: BTreeMap<String, Rig>,
}

impl Viewer {
    pub fn new(config: SceneConfig, settings: ViewerConfig) -> Self {
        Self { config, settings, mounted: None, off_scene: BTreeMap::new() }
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.is_some()
    }

    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    /// Builds the scene, camera, lights and controls on `container` and starts the render loop.
    /// Mounting again disposes the previous mount first; rigs carry over to the new scene.
    pub fn init(&mut self, container: Box<dyn ViewportHost>, mut renderer: Box<dyn RenderBackend>) {
        if self.mounted.is_some() {
            log::info!("[viewer] remounting; disposing previous surface");
            self.dispose();
        }
        let config = &self.config;
        let (width, height) = container.pixel_size();

        let mut scene = Scene::new(config.background_color);
        scene.ambient = Some(AmbientLight { color: Color::from_hex(0xffffff), intensity: config.ambient_intensity });
        scene.directional = Some(DirectionalLight::new(config.directional_intensity, config.shadows));
        if config.show_grid {
            scene.grid = Some(GridHelper::new(self.settings.grid_size, self.settings.grid_divisions));
        }

        let aspect = if height > 0 { width as f32 / height as f32 } else { 1.0 };
        let mut camera = Camera3D::new(config.fov, aspect, NEAR_PLANE, FAR_PLANE);
        camera.position = Vec3::splat(config.camera_distance * INITIAL_OFFSET);
        camera.look_at(Vec3::ZERO);

        renderer.resize(width, height);
        renderer.set_shadows(config.shadows);

        for (robot_id, rig) in std::mem::take(&mut self.off_scene) {
            scene.insert_rig(&robot_id, rig);
        }

        let controls = OrbitControls::new(Vec3::ZERO, self.settings.damping_factor);
        log::info!("[viewer] mounted at {width}x{height} with {} rig(s)", scene.rig_count());
        self.mounted = Some(Mounted { container, renderer, scene, camera, controls, resize: None, running: true });
    }

    /// Per-frame callback. Returns whether another frame should be scheduled.
    pub fn frame(&mut self, now: Instant) -> bool {
        let Some(mounted) = self.mounted.as_mut() else { return false };
        if !mounted.running {
            return false;
        }
        mounted.apply_due_resize(now);
        mounted.controls.update(&mut mounted.camera);
        if let Err(err) = mounted.renderer.render(&mounted.scene, &mounted.camera) {
            log::warn!("[viewer] render failed: {err:#}");
        }
        true
    }

    pub fn apply_config(&mut self, config: SceneConfig) {
        let previous = std::mem::replace(&mut self.config, config);
        let Some(mounted) = self.mounted.as_mut() else { return };
        let config = &self.config;

        mounted.camera.fov_y_degrees = config.fov;
        mounted.camera.update_projection();
        if let Some(ambient) = mounted.scene.ambient.as_mut() {
            ambient.intensity = config.ambient_intensity;
        }
        if let Some(directional) = mounted.scene.directional.as_mut() {
            directional.intensity = config.directional_intensity;
            directional.cast_shadow = config.shadows;
        }
        mounted.scene.background = config.background_color;
        if previous.show_grid != config.show_grid {
            if let Some(grid) = mounted.scene.grid.take() {
                for id in grid.resource_ids() {
                    mounted.renderer.release(id);
                }
            }
            if config.show_grid {
                mounted.scene.grid = Some(GridHelper::new(self.settings.grid_size, self.settings.grid_divisions));
            }
        }
        mounted.renderer.set_shadows(config.shadows);
    }

    pub fn set_view(&mut self, direction: ViewDirection) {
        let Some(mounted) = self.mounted.as_mut() else { return };
        mounted.camera.position = direction.axis() * self.config.camera_distance;
        mounted.camera.up = direction.up();
        mounted.controls.target = Vec3::ZERO;
        mounted.controls.reset_motion();
        mounted.camera.look_at(Vec3::ZERO);
    }

    /// Starts observing container size changes.
    pub fn observe_resize(&mut self) {
        let delay = Duration::from_millis(self.settings.resize_debounce_ms);
        if let Some(mounted) = self.mounted.as_mut() {
            mounted.resize.get_or_insert(ResizeObserver { delay, deadline: None });
        }
    }

    /// Records a size change; the resize runs once `now + debounce` passes without another notice.
    pub fn notify_resize(&mut self, now: Instant) {
        if let Some(observer) = self.mounted.as_mut().and_then(|mounted| mounted.resize.as_mut()) {
            observer.deadline = Some(now + observer.delay);
        }
    }

    /// Inserts `rig` under the scene root, or holds it off-scene until the next mount.
    /// Returns whether it went straight into a scene.
    pub fn attach_rig(&mut self, robot_id: &str, rig: Rig) -> bool {
        let Some(mounted) = self.mounted.as_mut() else {
            self.off_scene.insert(robot_id.to_string(), rig);
            return false;
        };
        if let Some(previous) = mounted.scene.insert_rig(robot_id, rig) {
            release_rig(mounted.renderer.as_mut(), &previous);
        }
        true
    }

    /// Removes the rig and releases its geometry and materials.
    pub fn detach_rig(&mut self, robot_id: &str) -> Option<Rig> {
        let Some(mounted) = self.mounted.as_mut() else {
            return self.off_scene.remove(robot_id);
        };
        let rig = mounted.scene.remove_rig(robot_id)?;
        release_rig(mounted.renderer.as_mut(), &rig);
        Some(rig)
    }

    pub fn rig(&self, robot_id: &str) -> Option<&Rig> {
        match &self.mounted {
            Some(mounted) => mounted.scene.rig(robot_id),
            None => self.off_scene.get(robot_id),
        }
    }

    pub fn rig_mut(&mut self, robot_id: &str) -> Option<&mut Rig> {
        match &mut self.mounted {
            Some(mounted) => mounted.scene.rig_mut(robot_id),
            None => self.off_scene.get_mut(robot_id),
        }
    }

    pub fn scene(&self) -> Option<&Scene> {
        self.mounted.as_ref().map(|mounted| &mounted.scene)
    }

    pub fn camera(&self) -> Option<&Camera3D> {
        self.mounted.as_ref().map(|mounted| &mounted.camera)
    }

    pub fn controls_mut(&mut self) -> Option<&mut OrbitControls> {
        self.mounted.as_mut().map(|mounted| &mut mounted.controls)
    }

    /// Camera plus controls, for input handlers that need both.
    pub fn navigation_mut(&mut self) -> Option<(&mut OrbitControls, &Camera3D)> {
        self.mounted.as_mut().map(|mounted| (&mut mounted.controls, &mounted.camera))
    }

    /// Accepted and logged; the scene is left as it is.
    pub fn reset_scene(&mut self) {
        log::debug!("[viewer] reset requested");
    }

    pub fn dispose(&mut self) {
        let Some(mut mounted) = self.mounted.take() else { return };
        mounted.running = false;
        mounted.resize = None;
        mounted.controls.dispose();
        for (robot_id, rig) in mounted.scene.drain_rigs() {
            release_rig(mounted.renderer.as_mut(), &rig);
            self.off_scene.insert(robot_id, rig);
        }
        if let Some(grid) = mounted.scene.grid.take() {
            for id in grid.resource_ids() {
                mounted.renderer.release(id);
            }
        }
        mounted.scene.ambient = None;
        mounted.scene.directional = None;
        mounted.renderer.dispose();
        log::info!("[viewer] disposed");
    }
}

impl Mounted {
    fn apply_due_resize(&mut self, now: Instant) {
        let Some(observer) = self.resize.as_mut() else { return };
        match observer.deadline {
            Some(deadline) if deadline <= now => observer.deadline = None,
            _ => return,
        }
        let (width, height) = self.container.pixel_size();
        self.camera.set_viewport(width, height);
        self.renderer.resize(width, height);
        log::debug!("[viewer] resized to {width}x{height}");
    }
}

fn release_rig(renderer: &mut dyn RenderBackend, rig: &Rig) {
    for id in rig.resource_ids() {
        renderer.release(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::HeadlessRenderer;

    fn mounted(width: u32, height: u32) -> (Viewer, HeadlessRenderer, SharedViewport) {
        let mut viewer = Viewer::new(SceneConfig::default(), ViewerConfig::default());
        let renderer = HeadlessRenderer::new();
        let viewport = SharedViewport::new(width, height);
        viewer.init(Box::new(viewport.clone()), Box::new(renderer.clone()));
        (viewer, renderer, viewport)
    }

    #[test]
    fn init_places_camera_on_diagonal() {
        let (viewer, renderer, _) = mounted(800, 400);
        let camera = viewer.camera().expect("camera");
        assert_eq!(camera.position, Vec3::splat(7.0));
        assert_eq!(camera.aspect, 2.0);
        assert_eq!((camera.near, camera.far), (0.1, 1000.0));
        let stats = renderer.snapshot();
        assert_eq!((stats.width, stats.height), (800, 400));
        assert!(stats.shadows);
        assert!(viewer.scene().expect("scene").grid.is_some());
    }

    #[test]
    fn unmounted_viewer_ignores_mutations() {
        let mut viewer = Viewer::new(SceneConfig::default(), ViewerConfig::default());
        viewer.set_view(ViewDirection::PosX);
        viewer.observe_resize();
        viewer.notify_resize(Instant::now());
        assert!(!viewer.frame(Instant::now()));
        assert!(viewer.detach_rig("robot").is_none());
        viewer.dispose();
        assert!(viewer.scene().is_none());

        let config = SceneConfig { fov: 40.0, ..SceneConfig::default() };
        viewer.apply_config(config.clone());
        assert_eq!(viewer.config(), &config);
    }

    #[test]
    fn views_pick_non_degenerate_up_vectors() {
        let (mut viewer, _, _) = mounted(640, 480);
        for view in ViewDirection::ALL {
            viewer.set_view(view);
            let camera = viewer.camera().expect("camera");
            assert_eq!(camera.position, view.axis() * 10.0);
            assert!(camera.up.cross(view.axis()).length() > 0.5, "{view} up is parallel to its axis");
            assert_eq!(camera.target, Vec3::ZERO);
        }
        assert_eq!(ViewDirection::PosX.up(), Vec3::Z);
        assert_eq!(ViewDirection::NegZ.up(), Vec3::Y);
        assert_eq!("-y".parse::<ViewDirection>(), Ok(ViewDirection::NegY));
        assert!("up".parse::<ViewDirection>().is_err());
    }

    #[test]
    fn resize_waits_for_quiet_period() {
        let (mut viewer, renderer, viewport) = mounted(800, 600);
        viewer.observe_resize();
        let start = Instant::now();

        viewport.set_size(1024, 512);
        viewer.notify_resize(start);
        viewer.notify_resize(start + Duration::from_millis(60));
        viewer.frame(start + Duration::from_millis(120));
        assert_eq!(renderer.snapshot().width, 800);

        viewer.frame(start + Duration::from_millis(161));
        assert_eq!((renderer.snapshot().width, renderer.snapshot().height), (1024, 512));
        assert_eq!(viewer.camera().expect("camera").aspect, 2.0);
    }

    #[test]
    fn toggling_grid_releases_old_lines() {
        let (mut viewer, renderer, _) = mounted(800, 600);
        viewer.frame(Instant::now());
        let grid_id = viewer.scene().and_then(|scene| scene.grid.as_ref()).expect("grid").lines.id;
        assert!(renderer.snapshot().resident.contains(&grid_id));

        viewer.apply_config(SceneConfig { show_grid: false, shadows: false, ..SceneConfig::default() });
        let stats = renderer.snapshot();
        assert!(!stats.resident.contains(&grid_id));
        assert!(!stats.shadows);
        let scene = viewer.scene().expect("scene");
        assert!(scene.grid.is_none());
        assert_eq!(scene.directional.as_ref().map(|light| light.cast_shadow), Some(false));
    }

    fn block_rig() -> Rig {
        let robot = crate::urdf::parse_urdf(
            br#"<robot name="block"><link name="base"><visual><geometry><box size="1 1 1"/></geometry></visual></link></robot>"#,
        )
        .expect("parse block");
        crate::rig::build_rig(&robot, &mut |path: &str| Err(anyhow::anyhow!("no mesh {path}"))).expect("build block")
    }

    #[test]
    fn rigs_attached_before_mount_join_the_scene() {
        let mut viewer = Viewer::new(SceneConfig::default(), ViewerConfig::default());
        assert!(!viewer.attach_rig("block", block_rig()));
        assert!(viewer.rig("block").is_some());

        let renderer = HeadlessRenderer::new();
        viewer.init(Box::new(SharedViewport::new(640, 480)), Box::new(renderer.clone()));
        assert_eq!(viewer.scene().expect("scene").rig_count(), 1);
        viewer.frame(Instant::now());
        let ids = viewer.rig("block").expect("mounted rig").resource_ids();
        assert!(ids.iter().all(|id| renderer.snapshot().resident.contains(id)));
    }

    #[test]
    fn remount_carries_rigs_to_the_new_renderer() {
        let (mut viewer, first, _) = mounted(640, 480);
        assert!(viewer.attach_rig("block", block_rig()));
        viewer.frame(Instant::now());

        let second = HeadlessRenderer::new();
        viewer.init(Box::new(SharedViewport::new(320, 240)), Box::new(second.clone()));
        assert!(first.snapshot().resident.is_empty());
        assert!(viewer.rig("block").is_some());
        viewer.frame(Instant::now());
        let ids = viewer.rig("block").expect("rig").resource_ids();
        assert!(ids.iter().all(|id| second.snapshot().resident.contains(id)));

        viewer.dispose();
        assert!(viewer.detach_rig("block").is_some(), "disposed rigs wait off-scene");
        assert!(viewer.rig("block").is_none());
    }

    #[test]
    fn dispose_is_idempotent() {
        let (mut viewer, renderer, _) = mounted(800, 600);
        viewer.frame(Instant::now());
        viewer.dispose();
        let after_first = renderer.snapshot();
        assert!(after_first.disposed);
        assert!(after_first.resident.is_empty());

        viewer.dispose();
        assert_eq!(renderer.snapshot(), after_first);
        assert!(!viewer.is_mounted());
        assert!(!viewer.frame(Instant::now()));
    }
}
