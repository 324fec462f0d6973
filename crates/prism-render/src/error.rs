//! Render error types.

use std::path::PathBuf;

use prism_gpu::GpuError;
use prism_platform::PlatformError;
use thiserror::Error;

/// Errors raised while loading assets or driving frames.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("Asset not found: {}", .0.display())]
    AssetNotFound(PathBuf),

    #[error("Failed to load image {}: {reason}", .path.display())]
    ImageLoadError { path: PathBuf, reason: String },

    #[error("Failed to load shader {}: {reason}", .path.display())]
    ShaderLoadError { path: PathBuf, reason: String },

    #[error("Failed to load mesh {}: {reason}", .path.display())]
    MeshLoadError { path: PathBuf, reason: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl RenderError {
    /// Whether the error only affects one asset, which can be skipped.
    pub fn is_asset_error(&self) -> bool {
        matches!(
            self,
            Self::AssetNotFound(_)
                | Self::ImageLoadError { .. }
                | Self::ShaderLoadError { .. }
                | Self::MeshLoadError { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RenderError>;
