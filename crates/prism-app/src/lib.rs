//! Host for the Prism renderer.
//!
//! This crate handles the boilerplate around the renderer:
//! - Command line switches
//! - Logging setup
//! - Window creation and the winit event loop
//! - Frame statistics
//!
//! # Example
//!
//! ```no_run
//! use prism_app::{init_logging, run, CliArgs};
//! use prism_core::Config;
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging();
//!     let args = CliArgs::from_env();
//!     let config = Config::load(&args.config_path)?;
//!     run(config, args.options)
//! }
//! ```

mod args;
mod logging;
mod runner;

pub use args::{CliArgs, DEFAULT_CONFIG_PATH, USAGE};
pub use logging::{init_logging, DEFAULT_FILTER};
pub use runner::{application_info, run, FrameStats};
