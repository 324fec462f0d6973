//! Renderer configuration.
//!
//! The file layout is a TOML document with application metadata, window
//! geometry, optional rasterisation settings and the asset lists. Runtime
//! switches that come from the command line live in [`RuntimeOptions`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Semantic version triple as written in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    /// Create a new version triple.
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Engine name and version reported to the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineInfo {
    pub name: String,
    #[serde(default)]
    pub version: Version,
}

impl Default for EngineInfo {
    fn default() -> Self {
        Self {
            name: "Prism".to_string(),
            version: Version::new(0, 1, 0),
        }
    }
}

/// Initial window geometry and title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_window_name")]
    pub name: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

fn default_window_name() -> String {
    "Prism".to_string()
}

const fn default_width() -> u32 {
    800
}

const fn default_height() -> u32 {
    600
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            name: default_window_name(),
            width: default_width(),
            height: default_height(),
        }
    }
}

/// `[application]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default = "default_window_name")]
    pub name: String,
    #[serde(default)]
    pub version: Version,
    #[serde(default)]
    pub engine: EngineInfo,
    #[serde(default)]
    pub window: WindowConfig,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_window_name(),
            version: Version::default(),
            engine: EngineInfo::default(),
            window: WindowConfig::default(),
        }
    }
}

/// Which faces the rasteriser discards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

/// Winding order treated as front-facing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrontFace {
    #[default]
    Clockwise,
    CounterClockwise,
}

/// `[rendering]` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderingConfig {
    #[serde(default = "default_frames_in_flight")]
    pub frames_in_flight: u32,
    #[serde(default)]
    pub cull_mode: CullMode,
    #[serde(default)]
    pub front_face: FrontFace,
}

const fn default_frames_in_flight() -> u32 {
    2
}

impl Default for RenderingConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: default_frames_in_flight(),
            cull_mode: CullMode::default(),
            front_face: FrontFace::default(),
        }
    }
}

/// A `files = [...]` list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

/// `[shaders]` table with one list per stage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShaderConfig {
    #[serde(default)]
    pub vertex: FileList,
    #[serde(default)]
    pub fragment: FileList,
}

/// Contents of `renderer.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub rendering: RenderingConfig,
    #[serde(default)]
    pub textures: FileList,
    #[serde(default, rename = "glTFmodels")]
    pub models: FileList,
    #[serde(default)]
    pub shaders: ShaderConfig,
}

impl Config {
    /// Parse a config document.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Read and parse a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&source)
    }

    /// Resolve every asset path against `base`, leaving absolute paths alone.
    ///
    /// Config files list assets relative to their own directory.
    pub fn resolve_paths(&mut self, base: &Path) {
        let lists = [
            &mut self.textures,
            &mut self.models,
            &mut self.shaders.vertex,
            &mut self.shaders.fragment,
        ];
        for list in lists {
            for file in &mut list.files {
                if file.is_relative() {
                    *file = base.join(&*file);
                }
            }
        }
    }
}

/// Switches that are set from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeOptions {
    /// Index of the GPU to prefer, if it exists and is suitable.
    pub preferred_gpu_index: Option<u32>,
    /// Do not request the Khronos validation layer.
    pub disable_validation: bool,
    /// Request the RenderDoc capture layer.
    pub enable_renderdoc: bool,
    /// Run uploads on the graphics queue even when a transfer family exists.
    pub force_no_separate_transfer_queue: bool,
    /// Skip the GPU information dump at startup.
    pub hide_gpu_stats: bool,
    /// Do not attach debug names to Vulkan objects.
    pub disable_debug_markers: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
title = "Prism example"

[application]
name = "Prism viewer"
version = { major = 1, minor = 2, patch = 3 }

[application.engine]
name = "Prism"
version = { major = 0, minor = 1, patch = 0 }

[application.window]
name = "Prism"
width = 1280
height = 720

[textures]
files = ["textures/crate.png"]

[glTFmodels]
files = ["models/cube.gltf", "models/plane.gltf"]

[shaders.vertex]
files = ["shaders/main.vert.spv"]

[shaders.fragment]
files = ["shaders/main.frag.spv"]
"#;

    #[test]
    fn parses_full_document() {
        let config = Config::from_toml_str(SAMPLE).unwrap();

        assert_eq!(config.title, "Prism example");
        assert_eq!(config.application.name, "Prism viewer");
        assert_eq!(config.application.version, Version::new(1, 2, 3));
        assert_eq!(config.application.engine.name, "Prism");
        assert_eq!(config.textures.files.len(), 1);
        assert_eq!(config.models.files.len(), 2);
        assert_eq!(
            config.shaders.fragment.files[0],
            PathBuf::from("shaders/main.frag.spv")
        );
    }

    #[test]
    fn width_and_height_are_independent() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.application.window.width, 1280);
        assert_eq!(config.application.window.height, 720);
    }

    #[test]
    fn missing_sections_use_defaults() {
        let config = Config::from_toml_str("title = \"bare\"").unwrap();

        assert_eq!(config.application.window.width, 800);
        assert_eq!(config.application.window.height, 600);
        assert_eq!(config.rendering.frames_in_flight, 2);
        assert_eq!(config.rendering.cull_mode, CullMode::Back);
        assert_eq!(config.rendering.front_face, FrontFace::Clockwise);
        assert!(config.models.files.is_empty());
    }

    #[test]
    fn rendering_table_overrides() {
        let config = Config::from_toml_str(
            r#"
[rendering]
frames_in_flight = 3
cull_mode = "none"
front_face = "counter_clockwise"
"#,
        )
        .unwrap();

        assert_eq!(config.rendering.frames_in_flight, 3);
        assert_eq!(config.rendering.cull_mode, CullMode::None);
        assert_eq!(config.rendering.front_face, FrontFace::CounterClockwise);
    }

    #[test]
    fn invalid_document_is_config_error() {
        let err = Config::from_toml_str("[application\nname = 1").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Config::load("does/not/exist.toml").unwrap_err();
        assert!(matches!(err, crate::Error::Io(_)));
    }

    #[test]
    fn relative_paths_resolve_against_base() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.resolve_paths(Path::new("/opt/prism"));

        assert_eq!(
            config.textures.files[0],
            PathBuf::from("/opt/prism/textures/crate.png")
        );
        assert_eq!(
            config.shaders.vertex.files[0],
            PathBuf::from("/opt/prism/shaders/main.vert.spv")
        );
    }

    #[test]
    fn version_display() {
        assert_eq!(Version::new(1, 0, 7).to_string(), "1.0.7");
    }
}
