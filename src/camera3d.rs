use std::f32::consts::{PI, TAU};

use glam::{Mat4, Quat, Vec2, Vec3};

const DEFAULT_UP: Vec3 = Vec3::Y;
const MIN_POLAR: f32 = 1e-6;

/// Perspective camera looking at a target point.
#[derive(Debug, Clone)]
pub struct Camera3D {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub fov_y_degrees: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
    projection: Mat4,
}

impl Camera3D {
    pub fn new(fov_y_degrees: f32, aspect: f32, near: f32, far: f32) -> Self {
        let mut camera = Self {
            position: Vec3::new(0.0, 0.0, 1.0),
            target: Vec3::ZERO,
            up: DEFAULT_UP,
            fov_y_degrees,
            aspect,
            near,
            far,
            projection: Mat4::IDENTITY,
        };
        camera.update_projection();
        camera
    }

    /// Recomputes the cached projection after fov, aspect or clip planes change.
    pub fn update_projection(&mut self) {
        self.projection =
            Mat4::perspective_rh(self.fov_y_degrees.to_radians(), self.aspect.max(0.0001), self.near, self.far);
    }

    pub fn projection_matrix(&self) -> Mat4 {
        self.projection
    }

    pub fn look_at(&mut self, target: Vec3) {
        self.target = target;
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection * self.view_matrix()
    }

    pub fn set_viewport(&mut self, width: u32, height: u32) {
        self.aspect = if height > 0 { width as f32 / height as f32 } else { 1.0 };
        self.update_projection();
    }
}

/// Damped orbit navigation around a target.
///
/// Input accumulates into pending deltas; each [`update`](Self::update) applies a
/// `damping_factor` share of them and decays the rest, so motion eases out over frames.
#[derive(Debug, Clone)]
pub struct OrbitControls {
    pub target: Vec3,
    pub damping_factor: f32,
    pub rotate_speed: f32,
    pub zoom_speed: f32,
    pub min_distance: f32,
    pub max_distance: f32,
    enabled: bool,
    /// (azimuth, polar) radians still to apply.
    rotate_delta: Vec2,
    pan_delta: Vec3,
    zoom_scale: f32,
}

impl OrbitControls {
    pub fn new(target: Vec3, damping_factor: f32) -> Self {
        Self {
            target,
            damping_factor: damping_factor.clamp(0.0, 1.0),
            rotate_speed: 1.0,
            zoom_speed: 1.0,
            min_distance: 0.01,
            max_distance: f32::INFINITY,
            enabled: true,
            rotate_delta: Vec2::ZERO,
            pan_delta: Vec3::ZERO,
            zoom_scale: 1.0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Drag in pixels; a full viewport height of travel is one full turn.
    pub fn rotate(&mut self, drag: Vec2, viewport_height: f32) {
        if !self.enabled || viewport_height <= 0.0 {
            return;
        }
        self.rotate_delta.x -= TAU * drag.x / viewport_height * self.rotate_speed;
        self.rotate_delta.y -= TAU * drag.y / viewport_height * self.rotate_speed;
    }

    /// Positive steps move the camera towards the target.
    pub fn zoom(&mut self, steps: f32) {
        if !self.enabled {
            return;
        }
        self.zoom_scale *= 0.95_f32.powf(steps * self.zoom_speed);
    }

    /// Drag in pixels, translated in the camera plane at the target's depth.
    pub fn pan(&mut self, drag: Vec2, camera: &Camera3D, viewport_height: f32) {
        if !self.enabled || viewport_height <= 0.0 {
            return;
        }
        let distance = (camera.position - self.target).length() * (camera.fov_y_degrees.to_radians() * 0.5).tan();
        let view = camera.view_matrix().inverse();
        let right = view.x_axis.truncate();
        let up = view.y_axis.truncate();
        let scale = 2.0 * distance / viewport_height;
        self.pan_delta += (-right * drag.x + up * drag.y) * scale;
    }

    /// Drops any pending motion.
    pub fn reset_motion(&mut self) {
        self.rotate_delta = Vec2::ZERO;
        self.pan_delta = Vec3::ZERO;
        self.zoom_scale = 1.0;
    }

    /// Applies pending motion to `camera`. Returns true when the camera moved.
    pub fn update(&mut self, camera: &mut Camera3D) -> bool {
        if !self.enabled {
            return false;
        }
        let to_y_up = Quat::from_rotation_arc(camera.up.try_normalize().unwrap_or(DEFAULT_UP), Vec3::Y);
        let offset = to_y_up * (camera.position - self.target);

        let mut radius = offset.length();
        let mut azimuth = offset.x.atan2(offset.z);
        let mut polar = if radius > 0.0 { (offset.y / radius).clamp(-1.0, 1.0).acos() } else { 0.0 };

        azimuth += self.rotate_delta.x * self.damping_factor;
        polar = (polar + self.rotate_delta.y * self.damping_factor).clamp(MIN_POLAR, PI - MIN_POLAR);
        radius = (radius * self.zoom_scale).clamp(self.min_distance, self.max_distance);
        self.target += self.pan_delta * self.damping_factor;

        let offset = Vec3::new(radius * polar.sin() * azimuth.sin(), radius * polar.cos(), radius * polar.sin() * azimuth.cos());
        let position = self.target + to_y_up.inverse() * offset;
        let moved = position.distance_squared(camera.position) > 1e-12 || camera.target != self.target;
        camera.position = position;
        camera.look_at(self.target);

        self.rotate_delta *= 1.0 - self.damping_factor;
        self.pan_delta *= 1.0 - self.damping_factor;
        self.zoom_scale = 1.0;
        moved
    }

    pub fn dispose(&mut self) {
        self.enabled = false;
        self.reset_motion();
    }
}
