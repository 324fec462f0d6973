//! Vulkan layer of the Prism renderer.
//!
//! This crate provides:
//! - Instance creation, validation and debug naming
//! - Cached capability queries and physical device selection
//! - Queue family planning, including a dedicated transfer queue
//! - Memory allocation via gpu-allocator
//! - Swapchain, render pass, pipeline and descriptor management
//! - Staging uploads and frame synchronisation

pub mod capabilities;
pub mod command;
pub mod context;
pub mod debug;
pub mod descriptors;
pub mod error;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod probe;
pub mod queues;
pub mod selection;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod upload;

pub use capabilities::{GpuCapabilities, GpuVendor};
pub use command::CommandPool;
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{DescriptorWrite, LayoutBinding, ResourceDescriptor};
pub use error::{GpuError, Result};
pub use instance::ApplicationInfo;
pub use memory::{GpuAllocator, GpuBuffer, GpuImage, MemoryLocality, MemoryStats};
pub use pipeline::{GraphicsPipeline, GraphicsPipelineConfig};
pub use probe::CapabilityProbe;
pub use queues::QueuePlan;
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::Swapchain;
pub use sync::{FrameSync, FrameSyncManager};
pub use upload::ResourceUploader;

pub use ash::vk;
