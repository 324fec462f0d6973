//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error that has no more specific kind.
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),

    /// A required layer, extension, feature or queue family is missing.
    #[error("Unsupported environment: {0}")]
    UnsupportedEnvironment(String),

    /// Device selection found no usable GPU.
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// The presentation surface is gone.
    #[error("Surface lost")]
    SurfaceLost,

    /// The swapchain no longer matches the surface.
    #[error("Swapchain out of date")]
    OutOfDate,

    /// The swapchain still works but no longer matches the surface exactly.
    #[error("Swapchain suboptimal")]
    Suboptimal,

    /// Device or host memory exhausted, or the allocator refused the request.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// A staging copy or its submission failed.
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    /// An image layout transition outside the supported table was requested.
    #[error("Unsupported layout transition: {old:?} -> {new:?}")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    /// The descriptor pool could not satisfy an allocation.
    #[error("Descriptor pool exhausted")]
    PoolExhausted,

    /// Descriptor layout bindings and writes disagree.
    #[error("Descriptor layout mismatch: {0}")]
    LayoutMismatch(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl GpuError {
    /// Whether the error is recovered by rebuilding the swapchain.
    pub fn is_surface_invalidation(&self) -> bool {
        matches!(self, Self::OutOfDate | Self::Suboptimal | Self::SurfaceLost)
    }
}

impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::OutOfDate,
            vk::Result::SUBOPTIMAL_KHR => Self::Suboptimal,
            vk::Result::ERROR_SURFACE_LOST_KHR => Self::SurfaceLost,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                Self::AllocationFailed(result.to_string())
            }
            vk::Result::ERROR_LAYER_NOT_PRESENT
            | vk::Result::ERROR_EXTENSION_NOT_PRESENT
            | vk::Result::ERROR_FEATURE_NOT_PRESENT
            | vk::Result::ERROR_INCOMPATIBLE_DRIVER => {
                Self::UnsupportedEnvironment(result.to_string())
            }
            other => Self::Vulkan(other),
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_results_map_to_invalidation() {
        for result in [
            vk::Result::ERROR_OUT_OF_DATE_KHR,
            vk::Result::SUBOPTIMAL_KHR,
            vk::Result::ERROR_SURFACE_LOST_KHR,
        ] {
            assert!(GpuError::from(result).is_surface_invalidation());
        }
    }

    #[test]
    fn memory_results_map_to_allocation_failed() {
        let err = GpuError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert!(matches!(err, GpuError::AllocationFailed(_)));
        assert!(!err.is_surface_invalidation());
    }

    #[test]
    fn missing_extension_is_unsupported_environment() {
        let err = GpuError::from(vk::Result::ERROR_EXTENSION_NOT_PRESENT);
        assert!(matches!(err, GpuError::UnsupportedEnvironment(_)));
    }

    #[test]
    fn other_results_stay_vulkan() {
        let err = GpuError::from(vk::Result::ERROR_DEVICE_LOST);
        assert!(matches!(err, GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST)));
    }
}
