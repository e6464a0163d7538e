//! Articulated robot viewer: URDF loading, joint control and a JSON message protocol around a
//! wgpu scene.

pub mod camera3d;
pub mod cli;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod geometry;
pub mod joints;
pub mod lifecycle;
pub mod loading;
pub mod logging;
pub mod protocol;
pub mod renderer;
pub mod resources;
pub mod rig;
pub mod scene;
pub mod session;
pub mod store;
pub mod studio;
pub mod urdf;
pub mod xml;

pub use error::{ErrorKind, ViewerError, ViewerResult};
pub use session::Session;
pub use studio::run;
