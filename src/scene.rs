use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use glam::Vec3;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::resources::{LineGeometry, LineVertex, ResourceId};
use crate::rig::Rig;

/// Viewer-wide presentation settings. Field names match the protocol's camelCase JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneConfig {
    /// Vertical field of view in degrees.
    #[serde(default = "SceneConfig::default_fov", alias = "fieldOfView")]
    pub fov: f32,
    #[serde(default = "SceneConfig::default_camera_distance")]
    pub camera_distance: f32,
    #[serde(default = "SceneConfig::default_ambient_intensity")]
    pub ambient_intensity: f32,
    #[serde(default = "SceneConfig::default_directional_intensity")]
    pub directional_intensity: f32,
    #[serde(default = "SceneConfig::default_background_color")]
    pub background_color: Color,
    #[serde(default = "SceneConfig::default_true")]
    pub show_grid: bool,
    #[serde(default = "SceneConfig::default_true")]
    pub shadows: bool,
}

impl SceneConfig {
    const fn default_fov() -> f32 {
        75.0
    }

    const fn default_camera_distance() -> f32 {
        10.0
    }

    const fn default_ambient_intensity() -> f32 {
        0.5
    }

    const fn default_directional_intensity() -> f32 {
        1.0
    }

    const fn default_background_color() -> Color {
        Color::from_rgb8(0xcc, 0xcc, 0xcc)
    }

    const fn default_true() -> bool {
        true
    }

    /// Applies every field present in `patch`.
    pub fn merge(&mut self, patch: &SceneConfigPatch) {
        if let Some(fov) = patch.fov {
            self.fov = fov;
        }
        if let Some(distance) = patch.camera_distance {
            self.camera_distance = distance;
        }
        if let Some(intensity) = patch.ambient_intensity {
            self.ambient_intensity = intensity;
        }
        if let Some(intensity) = patch.directional_intensity {
            self.directional_intensity = intensity;
        }
        if let Some(color) = patch.background_color {
            self.background_color = color;
        }
        if let Some(show) = patch.show_grid {
            self.show_grid = show;
        }
        if let Some(shadows) = patch.shadows {
            self.shadows = shadows;
        }
    }
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            fov: Self::default_fov(),
            camera_distance: Self::default_camera_distance(),
            ambient_intensity: Self::default_ambient_intensity(),
            directional_intensity: Self::default_directional_intensity(),
            background_color: Self::default_background_color(),
            show_grid: true,
            shadows: true,
        }
    }
}

/// Partial update of [`SceneConfig`] as sent over the protocol.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneConfigPatch {
    #[serde(default, alias = "fieldOfView")]
    pub fov: Option<f32>,
    #[serde(default)]
    pub camera_distance: Option<f32>,
    #[serde(default)]
    pub ambient_intensity: Option<f32>,
    #[serde(default)]
    pub directional_intensity: Option<f32>,
    #[serde(default)]
    pub background_color: Option<Color>,
    #[serde(default)]
    pub show_grid: Option<bool>,
    #[serde(default)]
    pub shadows: Option<bool>,
}

/// sRGB color parsed from and written as `#rrggbb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn from_rgb8(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub const fn from_hex(value: u32) -> Self {
        Self::from_rgb8((value >> 16) as u8, (value >> 8) as u8, value as u8)
    }

    /// Components converted to linear space.
    pub fn to_linear(self) -> [f32; 3] {
        let channel = |c: u8| {
            let c = c as f32 / 255.0;
            if c <= 0.04045 {
                c / 12.92
            } else {
                ((c + 0.055) / 1.055).powf(2.4)
            }
        };
        [channel(self.r), channel(self.g), channel(self.b)]
    }
}

impl FromStr for Color {
    type Err = String;

    /// Accepts `#rgb`, `#rrggbb` and the same without the leading `#`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let hex = value.trim().trim_start_matches('#');
        let expanded: String = match hex.len() {
            3 => hex.chars().flat_map(|c| [c, c]).collect(),
            6 => hex.to_string(),
            _ => return Err(format!("invalid color '{value}'")),
        };
        let raw = u32::from_str_radix(&expanded, 16).map_err(|_| format!("invalid color '{value}'"))?;
        Ok(Color::from_hex(raw))
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl Serialize for Color {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Color {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AmbientLight {
    pub color: Color,
    pub intensity: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShadowSettings {
    pub map_size: u32,
    pub near: f32,
    pub far: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectionalLight {
    pub color: Color,
    pub intensity: f32,
    pub position: Vec3,
    pub cast_shadow: bool,
    pub shadow: ShadowSettings,
}

impl DirectionalLight {
    pub fn new(intensity: f32, cast_shadow: bool) -> Self {
        Self {
            color: Color::from_hex(0xffffff),
            intensity,
            position: Vec3::new(5.0, 5.0, 5.0),
            cast_shadow,
            shadow: ShadowSettings { map_size: 1024, near: 0.5, far: 500.0 },
        }
    }

    /// Direction the light travels, towards the origin.
    pub fn direction(&self) -> Vec3 {
        (-self.position).normalize_or_zero()
    }
}

/// Square line grid on the XZ plane.
#[derive(Debug, Clone)]
pub struct GridHelper {
    pub size: f32,
    pub divisions: u32,
    pub lines: LineGeometry,
}

impl GridHelper {
    pub const CENTER_COLOR: Color = Color::from_hex(0x888888);
    pub const LINE_COLOR: Color = Color::from_hex(0x444444);
    pub const OPACITY: f32 = 0.5;

    pub fn new(size: f32, divisions: u32) -> Self {
        let divisions = divisions.max(1);
        let step = size / divisions as f32;
        let half = size * 0.5;
        let center = divisions / 2;
        let mut vertices = Vec::with_capacity((divisions as usize + 1) * 4);
        for i in 0..=divisions {
            let k = -half + i as f32 * step;
            let color = if i == center && divisions % 2 == 0 { Self::CENTER_COLOR } else { Self::LINE_COLOR };
            let [r, g, b] = color.to_linear();
            let rgba = [r, g, b, Self::OPACITY];
            vertices.push(LineVertex { position: [-half, 0.0, k], color: rgba });
            vertices.push(LineVertex { position: [half, 0.0, k], color: rgba });
            vertices.push(LineVertex { position: [k, 0.0, -half], color: rgba });
            vertices.push(LineVertex { position: [k, 0.0, half], color: rgba });
        }
        Self { size, divisions, lines: LineGeometry { id: ResourceId::next(), vertices: Arc::new(vertices) } }
    }

    pub fn resource_ids(&self) -> Vec<ResourceId> {
        vec![self.lines.id]
    }
}

/// Everything the renderer draws in one frame.
#[derive(Debug)]
pub struct Scene {
    pub background: Color,
    pub ambient: Option<AmbientLight>,
    pub directional: Option<DirectionalLight>,
    pub grid: Option<GridHelper>,
    rigs: BTreeMap<String, Rig>,
}

impl Scene {
    pub fn new(background: Color) -> Self {
        Self { background, ambient: None, directional: None, grid: None, rigs: BTreeMap::new() }
    }

    pub fn insert_rig(&mut self, robot_id: &str, rig: Rig) -> Option<Rig> {
        self.rigs.insert(robot_id.to_string(), rig)
    }

    pub fn remove_rig(&mut self, robot_id: &str) -> Option<Rig> {
        self.rigs.remove(robot_id)
    }

    pub fn rig(&self, robot_id: &str) -> Option<&Rig> {
        self.rigs.get(robot_id)
    }

    pub fn rig_mut(&mut self, robot_id: &str) -> Option<&mut Rig> {
        self.rigs.get_mut(robot_id)
    }

    pub fn rigs(&self) -> impl Iterator<Item = (&str, &Rig)> {
        self.rigs.iter().map(|(id, rig)| (id.as_str(), rig))
    }

    pub fn rig_count(&self) -> usize {
        self.rigs.len()
    }

    /// Detaches every rig, handing ownership to the caller.
    pub fn drain_rigs(&mut self) -> Vec<(String, Rig)> {
        std::mem::take(&mut self.rigs).into_iter().collect()
    }

    /// Every geometry and material currently reachable from the scene.
    pub fn resource_ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self.rigs.values().flat_map(|rig| rig.resource_ids()).collect();
        if let Some(grid) = &self.grid {
            ids.extend(grid.resource_ids());
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_viewer_presets() {
        let config = SceneConfig::default();
        assert_eq!(config.fov, 75.0);
        assert_eq!(config.camera_distance, 10.0);
        assert_eq!(config.ambient_intensity, 0.5);
        assert_eq!(config.directional_intensity, 1.0);
        assert_eq!(config.background_color.to_string(), "#cccccc");
        assert!(config.show_grid);
        assert!(config.shadows);
    }

    #[test]
    fn config_json_accepts_field_of_view_alias() {
        let config: SceneConfig =
            serde_json::from_str(r##"{"fieldOfView": 50, "backgroundColor": "#102030", "showGrid": false}"##)
                .expect("parse config");
        assert_eq!(config.fov, 50.0);
        assert_eq!(config.background_color, Color::from_rgb8(0x10, 0x20, 0x30));
        assert!(!config.show_grid);
        assert_eq!(config.camera_distance, 10.0);

        let json = serde_json::to_value(&config).expect("serialize");
        assert_eq!(json["backgroundColor"], "#102030");
        assert_eq!(json["fov"], 50.0);
    }

    #[test]
    fn patch_merges_only_present_fields() {
        let mut config = SceneConfig::default();
        let patch: SceneConfigPatch = serde_json::from_str(r#"{"ambientIntensity": 0.2}"#).expect("patch");
        config.merge(&patch);
        assert_eq!(config.ambient_intensity, 0.2);
        assert_eq!(config.fov, 75.0);
    }

    #[test]
    fn color_parsing_rejects_garbage() {
        assert_eq!("#abc".parse::<Color>(), Ok(Color::from_hex(0xaabbcc)));
        assert!("#12345".parse::<Color>().is_err());
        assert!("#gggggg".parse::<Color>().is_err());
        assert!(serde_json::from_str::<SceneConfigPatch>(r#"{"backgroundColor": "red"}"#).is_err());
    }

    #[test]
    fn grid_lies_on_xz_plane() {
        let grid = GridHelper::new(10.0, 10);
        assert_eq!(grid.lines.vertices.len(), 44);
        assert!(grid.lines.vertices.iter().all(|v| v.position[1] == 0.0 && v.color[3] == 0.5));
        let extent = grid.lines.vertices.iter().map(|v| v.position[0].abs()).fold(0.0, f32::max);
        assert_eq!(extent, 5.0);
    }
}
