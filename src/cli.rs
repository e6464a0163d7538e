use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;

use crate::config::AppConfigOverrides;

#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(name = "urdf_studio")]
#[command(about = "Articulated robot viewer driven by a JSON message protocol")]
pub struct Cli {
    /// Config file path.
    #[arg(long, default_value = "config/app.json")]
    pub config: PathBuf,

    #[arg(long)]
    pub width: Option<u32>,

    #[arg(long)]
    pub height: Option<u32>,

    /// on/off, true/false, yes/no or 1/0.
    #[arg(long, value_parser = parse_bool_flag)]
    pub vsync: Option<bool>,

    /// Run without a window, rendering into the headless backend.
    #[arg(long)]
    pub headless: bool,

    /// Model store directory.
    #[arg(long)]
    pub store_dir: Option<PathBuf>,

    /// Disable the persistent model store.
    #[arg(long)]
    pub no_store: bool,

    /// URDF file to load and activate at startup.
    #[arg(long)]
    pub load: Option<PathBuf>,

    /// Geometry file referenced by the startup URDF. Repeatable.
    #[arg(long = "mesh")]
    pub meshes: Vec<PathBuf>,
}

impl Cli {
    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<std::ffi::OsString> + Clone,
    {
        Ok(Self::try_parse_from(args)?)
    }

    pub fn config_overrides(&self) -> AppConfigOverrides {
        AppConfigOverrides {
            width: self.width,
            height: self.height,
            vsync: self.vsync,
            store_dir: self.store_dir.clone(),
            disable_store: self.no_store,
        }
    }
}

fn parse_bool_flag(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => bail!("Invalid vsync value '{other}'. Use on/off or true/false."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_window_overrides() {
        let cli = Cli::parse(["app", "--width", "1600", "--height", "900", "--vsync", "off"]).expect("parse cli");
        let overrides = cli.config_overrides();
        assert_eq!((overrides.width, overrides.height, overrides.vsync), (Some(1600), Some(900), Some(false)));
        assert!(!overrides.disable_store);
    }

    #[test]
    fn collects_repeated_meshes() {
        let cli = Cli::parse(["app", "--load", "arm.urdf", "--mesh", "a.stl", "--mesh", "b.dae", "--headless"])
            .expect("parse cli");
        assert_eq!(cli.load, Some(PathBuf::from("arm.urdf")));
        assert_eq!(cli.meshes, vec![PathBuf::from("a.stl"), PathBuf::from("b.dae")]);
        assert!(cli.headless);
        assert_eq!(cli.config, PathBuf::from("config/app.json"));
    }

    #[test]
    fn rejects_bad_vsync_and_unknown_flags() {
        assert!(Cli::parse(["app", "--vsync", "maybe"]).is_err());
        assert!(Cli::parse(["app", "--foo", "bar"]).is_err());
    }
}
