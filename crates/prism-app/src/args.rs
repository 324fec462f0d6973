//! Command line switches.

use std::path::PathBuf;

use prism_core::RuntimeOptions;

/// Config file used when `-config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "config/renderer.toml";

/// Parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    pub options: RuntimeOptions,
    pub config_path: PathBuf,
    pub show_help: bool,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            options: RuntimeOptions::default(),
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            show_help: false,
        }
    }
}

impl CliArgs {
    /// Parse the process arguments.
    pub fn from_env() -> Self {
        Self::parse(std::env::args().skip(1))
    }

    /// Parse arguments, program name excluded.
    ///
    /// Unknown flags and malformed values are ignored with a warning.
    pub fn parse<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_ref() {
                "-gpu" => match args.next() {
                    Some(value) => match value.as_ref().parse::<u32>() {
                        Ok(index) => parsed.options.preferred_gpu_index = Some(index),
                        Err(_) => tracing::warn!(
                            "Ignoring -gpu {}: not a GPU index",
                            value.as_ref()
                        ),
                    },
                    None => tracing::warn!("Ignoring -gpu without a value"),
                },
                "-config" => match args.next() {
                    Some(value) => parsed.config_path = PathBuf::from(value.as_ref()),
                    None => tracing::warn!("Ignoring -config without a value"),
                },
                "-nostats" => parsed.options.hide_gpu_stats = true,
                "-renderdoc" => parsed.options.enable_renderdoc = true,
                "-novalidation" => parsed.options.disable_validation = true,
                "-no_separate_data_queue" => parsed.options.force_no_separate_transfer_queue = true,
                "-no_vk_debug_markers" => parsed.options.disable_debug_markers = true,
                "-h" | "--help" => parsed.show_help = true,
                other => tracing::warn!("Ignoring unknown argument {other}"),
            }
        }

        parsed
    }
}

/// Help text for `-h`.
pub const USAGE: &str = "Prism glTF viewer

USAGE:
    prism-viewer [OPTIONS]

OPTIONS:
    -config <PATH>            Config file (default: config/renderer.toml)
    -gpu <INDEX>              Prefer the GPU at this enumeration index
    -nostats                  Do not log GPU information at startup
    -renderdoc                Enable the RenderDoc capture layer
    -novalidation             Disable the Khronos validation layer
    -no_separate_data_queue   Upload on the graphics queue
    -no_vk_debug_markers      Do not name Vulkan objects
    -h, --help                Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                  Set log level (e.g., info, debug, trace)";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_arguments_give_defaults() {
        let args = CliArgs::parse(Vec::<String>::new());
        assert_eq!(args, CliArgs::default());
        assert_eq!(args.config_path, PathBuf::from("config/renderer.toml"));
    }

    #[test]
    fn every_switch_is_recognised() {
        let args = CliArgs::parse([
            "-gpu",
            "1",
            "-nostats",
            "-renderdoc",
            "-novalidation",
            "-no_separate_data_queue",
            "-no_vk_debug_markers",
            "-config",
            "other.toml",
        ]);
        assert_eq!(
            args.options,
            RuntimeOptions {
                preferred_gpu_index: Some(1),
                disable_validation: true,
                enable_renderdoc: true,
                force_no_separate_transfer_queue: true,
                hide_gpu_stats: true,
                disable_debug_markers: true,
            }
        );
        assert_eq!(args.config_path, PathBuf::from("other.toml"));
        assert!(!args.show_help);
    }

    #[test]
    fn bad_gpu_index_is_ignored() {
        let args = CliArgs::parse(["-gpu", "first", "-nostats"]);
        assert_eq!(args.options.preferred_gpu_index, None);
        assert!(args.options.hide_gpu_stats);
    }

    #[test]
    fn trailing_gpu_without_value_is_ignored() {
        let args = CliArgs::parse(["-gpu"]);
        assert_eq!(args.options.preferred_gpu_index, None);
    }

    #[test]
    fn unknown_flags_do_not_stop_parsing() {
        let args = CliArgs::parse(["--fullscreen", "-renderdoc"]);
        assert!(args.options.enable_renderdoc);
    }

    #[test]
    fn help_in_either_form() {
        assert!(CliArgs::parse(["-h"]).show_help);
        assert!(CliArgs::parse(["--help"]).show_help);
    }
}
