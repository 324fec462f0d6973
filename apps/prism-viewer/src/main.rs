//! Prism glTF viewer
//!
//! Loads the textures, glTF models and SPIR-V shaders listed in a TOML
//! config and draws them until the window is closed.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p prism-viewer -- [OPTIONS]
//! ```
//!
//! Run `-h` for the list of switches. Shaders are read as SPIR-V; compile
//! the sources in `shaders/` first:
//!
//! ```bash
//! glslc shaders/shader.vert -o shaders/shader.vert.spv
//! glslc shaders/shader.frag -o shaders/shader.frag.spv
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use std::path::Path;

use anyhow::Context;
use prism_app::{init_logging, run, CliArgs, USAGE};
use prism_core::Config;

fn main() -> anyhow::Result<()> {
    init_logging();

    let args = CliArgs::from_env();
    if args.show_help {
        eprintln!("{USAGE}");
        return Ok(());
    }

    let mut config = Config::load(&args.config_path)
        .with_context(|| format!("Failed to load {}", args.config_path.display()))?;
    config.resolve_paths(args.config_path.parent().unwrap_or(Path::new(".")));

    tracing::info!("Using config {}", args.config_path.display());
    run(config, args.options)
}
