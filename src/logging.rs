use std::io::Write;

use env_logger::{Builder, Env, Target};
use log::LevelFilter;

/// Routes `log` output to stderr. Stdout carries protocol messages and stays clean.
pub fn init_logger() {
    let mut builder = Builder::from_env(Env::default().default_filter_or("urdf_studio=info"));
    builder.target(Target::Stderr);
    builder.filter_module("naga", LevelFilter::Warn);
    builder.filter_module("wgpu", LevelFilter::Warn);
    builder.filter_module("wgpu_core", LevelFilter::Warn);
    builder.filter_module("wgpu_hal", LevelFilter::Warn);

    builder.format(|buf, record| {
        let style = buf.default_level_style(record.level());
        let module_path = record.module_path().unwrap_or("<unknown>");
        writeln!(buf, "{style}[{}]{style:#}[{module_path}] {}", record.level(), record.args())
    });

    let _ = builder.try_init();
}
