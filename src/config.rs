use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::scene::SceneConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "WindowConfig::default_title")]
    pub title: String,
    #[serde(default = "WindowConfig::default_width")]
    pub width: u32,
    #[serde(default = "WindowConfig::default_height")]
    pub height: u32,
    #[serde(default = "WindowConfig::default_vsync")]
    pub vsync: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ViewerConfig {
    #[serde(default = "ViewerConfig::default_resize_debounce_ms")]
    pub resize_debounce_ms: u64,
    #[serde(default = "ViewerConfig::default_damping_factor")]
    pub damping_factor: f32,
    #[serde(default = "ViewerConfig::default_grid_size")]
    pub grid_size: f32,
    #[serde(default = "ViewerConfig::default_grid_divisions")]
    pub grid_divisions: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "StoreConfig::default_enabled")]
    pub enabled: bool,
    /// Defaults to the platform data directory when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "StoreConfig::default_version")]
    pub version: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    /// Serve the message protocol over stdin/stdout.
    #[serde(default = "ProtocolConfig::default_stdio")]
    pub stdio: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub scene: SceneConfig,
    #[serde(default)]
    pub viewer: ViewerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

#[derive(Debug, Clone, Default)]
pub struct AppConfigOverrides {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub vsync: Option<bool>,
    pub store_dir: Option<PathBuf>,
    pub disable_store: bool,
}

impl WindowConfig {
    fn default_title() -> String {
        "URDF Studio".to_string()
    }

    const fn default_width() -> u32 {
        1280
    }

    const fn default_height() -> u32 {
        720
    }

    const fn default_vsync() -> bool {
        true
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: Self::default_title(),
            width: Self::default_width(),
            height: Self::default_height(),
            vsync: Self::default_vsync(),
        }
    }
}

impl ViewerConfig {
    const fn default_resize_debounce_ms() -> u64 {
        100
    }

    const fn default_damping_factor() -> f32 {
        0.05
    }

    const fn default_grid_size() -> f32 {
        10.0
    }

    const fn default_grid_divisions() -> u32 {
        10
    }
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            resize_debounce_ms: Self::default_resize_debounce_ms(),
            damping_factor: Self::default_damping_factor(),
            grid_size: Self::default_grid_size(),
            grid_divisions: Self::default_grid_divisions(),
        }
    }
}

impl StoreConfig {
    const fn default_enabled() -> bool {
        true
    }

    const fn default_version() -> u32 {
        1
    }

    /// Configured directory, or `<data dir>/urdf_studio/store`.
    pub fn resolved_directory(&self) -> Option<PathBuf> {
        self.directory.clone().or_else(|| {
            directories_next::BaseDirs::new().map(|dirs| dirs.data_dir().join("urdf_studio").join("store"))
        })
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { enabled: Self::default_enabled(), directory: None, version: Self::default_version() }
    }
}

impl ProtocolConfig {
    const fn default_stdio() -> bool {
        true
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self { stdio: Self::default_stdio() }
    }
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                log::warn!("Config load error: {err:#}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &AppConfigOverrides) {
        let window = &mut self.window;
        window.width = overrides.width.unwrap_or(window.width);
        window.height = overrides.height.unwrap_or(window.height);
        window.vsync = overrides.vsync.unwrap_or(window.vsync);
        if overrides.store_dir.is_some() {
            self.store.directory.clone_from(&overrides.store_dir);
        }
        self.store.enabled &= !overrides.disable_store;
    }
}

impl AppConfigOverrides {
    /// Names of the command-line flags that changed the loaded config.
    pub fn applied_fields(&self) -> Vec<&'static str> {
        [
            ("width", self.width.is_some()),
            ("height", self.height.is_some()),
            ("vsync", self.vsync.is_some()),
            ("store_dir", self.store_dir.is_some()),
            ("no_store", self.disable_store),
        ]
        .into_iter()
        .filter_map(|(name, set)| set.then_some(name))
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.applied_fields().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_uses_every_default() {
        let cfg: AppConfig = serde_json::from_str("{}").expect("parse empty config");
        assert_eq!(cfg.window.width, 1280);
        assert_eq!(cfg.viewer.resize_debounce_ms, 100);
        assert_eq!(cfg.viewer.damping_factor, 0.05);
        assert_eq!(cfg.scene, SceneConfig::default());
        assert!(cfg.store.enabled);
        assert!(cfg.protocol.stdio);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{"window": {"width": 800}, "scene": {"fov": 60, "showGrid": false}}"#)
                .expect("parse config");
        assert_eq!(cfg.window.width, 800);
        assert_eq!(cfg.window.height, 720);
        assert_eq!(cfg.scene.fov, 60.0);
        assert!(!cfg.scene.show_grid);
        assert_eq!(cfg.scene.camera_distance, 10.0);
    }

    #[test]
    fn overrides_replace_window_and_store_fields() {
        let mut cfg = AppConfig::default();
        let overrides = AppConfigOverrides {
            width: Some(1920),
            vsync: Some(false),
            store_dir: Some(PathBuf::from("/tmp/models")),
            disable_store: true,
            ..AppConfigOverrides::default()
        };
        cfg.apply_overrides(&overrides);
        assert_eq!(cfg.window.width, 1920);
        assert!(!cfg.window.vsync);
        assert_eq!(cfg.store.resolved_directory(), Some(PathBuf::from("/tmp/models")));
        assert!(!cfg.store.enabled);
        assert_eq!(overrides.applied_fields(), vec!["width", "vsync", "store_dir", "no_store"]);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = AppConfig::load_or_default("definitely/not/here.json");
        assert_eq!(cfg.window.title, "URDF Studio");
    }
}
