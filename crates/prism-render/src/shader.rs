//! Compiled shader modules keyed by file name.

use std::path::Path;
use std::sync::Arc;

use ash::vk;
use prism_core::Registry;
use prism_gpu::GpuContext;

use crate::assets::{asset_name, load_spirv};
use crate::error::{RenderError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

pub struct Shader {
    pub stage: ShaderStage,
    pub module: vk::ShaderModule,
    pub entry_point: String,
}

#[derive(Default)]
pub struct ShaderStore {
    shaders: Registry<String, Shader>,
}

impl ShaderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a SPIR-V file and create its module. Returns `false` if a shader
    /// with the same file name is already loaded.
    pub fn load(&self, ctx: &GpuContext, stage: ShaderStage, path: &Path) -> Result<bool> {
        let name = asset_name(path);
        if self.shaders.contains_key(&name) {
            return Ok(false);
        }

        let code = load_spirv(path)?;
        let module = unsafe { prism_gpu::pipeline::create_shader_module(ctx.device(), &code)? };
        ctx.name_object(module, &name);

        tracing::info!("Loaded {stage:?} shader {name} ({} words)", code.len());

        let inserted = self.shaders.insert(
            name,
            Shader {
                stage,
                module,
                entry_point: "main".to_string(),
            },
        );
        if !inserted {
            unsafe { ctx.device().destroy_shader_module(module, None) };
        }
        Ok(inserted)
    }

    /// First loaded shader of `stage`.
    pub fn first(&self, stage: ShaderStage) -> Option<Arc<Shader>> {
        self.shaders.values().into_iter().find(|s| s.stage == stage)
    }

    /// First vertex and first fragment shader, both required.
    pub fn pipeline_stages(&self) -> Result<(Arc<Shader>, Arc<Shader>)> {
        let vertex = self.first(ShaderStage::Vertex);
        let fragment = self.first(ShaderStage::Fragment);
        match (vertex, fragment) {
            (Some(vertex), Some(fragment)) => Ok((vertex, fragment)),
            _ => Err(RenderError::InvalidState(
                "a vertex and a fragment shader are required".to_string(),
            )),
        }
    }

    pub fn len(&self) -> usize {
        self.shaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shaders.is_empty()
    }

    /// Destroy all modules.
    ///
    /// # Safety
    /// No pipeline may still be created from them.
    pub unsafe fn destroy_all(&self, device: &ash::Device) {
        for (_, shader) in self.shaders.drain() {
            device.destroy_shader_module(shader.module, None);
        }
    }
}
