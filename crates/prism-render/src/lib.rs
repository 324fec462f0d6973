//! Rasterizing renderer for the Prism viewer.
//!
//! This crate provides:
//! - Image, glTF and SPIR-V loading
//! - Mesh, texture and shader stores
//! - Frame scheduling over a fixed ring of frames in flight
//! - Swapchain rebuilds and draw recording

pub mod assets;
pub mod error;
pub mod frame;
pub mod mesh;
pub mod renderer;
pub mod resources;
pub mod shader;
pub mod texture;
pub mod uniforms;
pub mod vertex;

pub use assets::{decode_image, load_gltf, load_spirv, DecodedImage, MeshData, MeshIndices};
pub use error::{RenderError, Result};
pub use frame::{FrameBackend, FrameOutcome, FrameScheduler, FrameStatus};
pub use mesh::{DrawCall, MeshBuffer, MeshStore};
pub use renderer::{Renderer, SwapchainCounts, MEMORY_STATS_PATH};
pub use resources::ImageResources;
pub use shader::{Shader, ShaderStage, ShaderStore};
pub use texture::{SamplerSettings, Texture, TextureStore, FALLBACK_TEXTURE};
pub use uniforms::{Camera, SceneUniforms};
pub use vertex::Vertex;
