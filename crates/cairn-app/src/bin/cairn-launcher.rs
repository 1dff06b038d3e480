//! Headless launcher: creates a component application from the process
//! arguments, ticks it for a number of frames and shuts it down.
//!
//! ```text
//! cairn-launcher --engine-path=/opt/cairn --frames=120 --regset=/Cairn/Application/RandomSeed=7
//! ```
//!
//! `--descriptor=<file>` loads an [`AppDescriptor`] envelope written by the
//! serialize context. Set `RUST_LOG` to control log output.

use std::path::Path;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use cairn_app::prelude::*;

/// Frames run when `--frames` is absent.
const DEFAULT_FRAMES: u64 = 60;

fn load_descriptor(path: &Path) -> anyhow::Result<AppDescriptor> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading descriptor {}", path.display()))?;
    let envelope: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("parsing descriptor {}", path.display()))?;

    let mut reflection = ReflectionManager::new();
    reflection.add_reflect_context::<SerializeContext>();
    reflection.reflect(AppDescriptor::TYPE_UUID, cairn_app::descriptor::reflect_app_descriptor);
    let serialize = reflection
        .context::<SerializeContext>()
        .context("serialize context missing")?;
    Ok(serialize.load::<AppDescriptor>(&envelope)?)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut app = ComponentApplication::new(std::env::args());
    let command_line = app.command_line();

    let frames = match command_line.last_switch_value("frames") {
        Some(value) => value
            .parse::<u64>()
            .with_context(|| format!("--frames expects a number, got '{value}'"))?,
        None => DEFAULT_FRAMES,
    };
    let descriptor = match command_line.last_switch_value("descriptor") {
        Some(path) => load_descriptor(Path::new(path))?,
        None => AppDescriptor::default(),
    };

    app.start(descriptor, StartupParameters::default())?;
    for outcome in app.module_load_outcomes() {
        if let Some(error) = outcome.error() {
            tracing::warn!(path = %outcome.path.display(), %error, "module unavailable");
        }
    }

    tracing::info!(frames, "running");
    for _ in 0..frames {
        app.tick_system();
        app.tick(None);
    }

    app.destroy();
    tracing::info!(steps = app.teardown_log().len(), "shut down");
    Ok(())
}
