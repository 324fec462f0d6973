//! Per-image resources rebuilt with the swapchain.
//!
//! Uniform buffers, command buffers and the per-model descriptor sets all
//! come in one-per-image sets. Descriptors outlive a rebuild with their
//! layout bindings intact; only their writes and sets are recreated.

use ash::vk;
use prism_gpu::{
    CommandPool, DescriptorWrite, GpuBuffer, GpuContext, LayoutBinding, MemoryLocality,
    ResourceDescriptor,
};

use crate::error::{RenderError, Result};
use crate::mesh::MeshStore;
use crate::texture::TextureStore;
use crate::uniforms::SceneUniforms;

/// Descriptor for one model, reusing `retained` when it still has its
/// bindings: uniforms at binding 0, the texture at binding 1.
pub fn model_descriptor(retained: Option<ResourceDescriptor>, name: &str) -> ResourceDescriptor {
    if let Some(descriptor) = retained.filter(|d| !d.bindings().is_empty()) {
        return descriptor;
    }
    let mut descriptor = ResourceDescriptor::new(name);
    descriptor
        .add_layout_binding(LayoutBinding::uniform_buffer(vk::ShaderStageFlags::VERTEX))
        .add_layout_binding(LayoutBinding::combined_image_sampler(
            vk::ShaderStageFlags::FRAGMENT,
        ));
    descriptor
}

/// Uniform buffers, descriptor sets and command buffers for one swapchain.
#[derive(Default)]
pub struct ImageResources {
    uniform_buffers: Vec<GpuBuffer>,
    descriptors: Vec<ResourceDescriptor>,
    command_buffers: Vec<vk::CommandBuffer>,
}

impl ImageResources {
    /// Allocate everything for `image_count` images.
    ///
    /// `retained` are the descriptors handed back by the previous
    /// [`teardown`](Self::teardown), in model order. Command buffers are
    /// allocated but not recorded. On failure nothing is leaked.
    pub fn build(
        ctx: &GpuContext,
        command_pool: &CommandPool,
        meshes: &MeshStore,
        textures: &TextureStore,
        retained: Vec<ResourceDescriptor>,
        image_count: usize,
    ) -> Result<Self> {
        let mut resources = Self::default();
        match resources.populate(ctx, command_pool, meshes, textures, retained, image_count) {
            Ok(()) => Ok(resources),
            Err(e) => {
                resources.teardown(ctx, command_pool, false);
                Err(e)
            }
        }
    }

    fn populate(
        &mut self,
        ctx: &GpuContext,
        command_pool: &CommandPool,
        meshes: &MeshStore,
        textures: &TextureStore,
        retained: Vec<ResourceDescriptor>,
        image_count: usize,
    ) -> Result<()> {
        let device = ctx.device();

        let uniform_size = std::mem::size_of::<SceneUniforms>() as u64;
        {
            let mut allocator = ctx.allocator().lock();
            for index in 0..image_count {
                let buffer = allocator.create_buffer(
                    uniform_size,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    MemoryLocality::HostVisibleCoherent,
                    &format!("scene uniforms {index}"),
                )?;
                self.uniform_buffers.push(buffer);
            }
        }

        let mut retained = retained.into_iter();
        for (model_index, (name, _)) in meshes.entries().iter().enumerate() {
            let texture = textures
                .for_model(model_index)
                .ok_or_else(|| RenderError::InvalidState("no texture loaded".to_string()))?;

            let mut descriptor = model_descriptor(retained.next(), name);
            descriptor
                .add_descriptor_write(DescriptorWrite::per_set_uniform_buffers(
                    self.uniform_buffers.iter().map(|b| (b.buffer, b.size)),
                ))
                .add_descriptor_write(texture.descriptor_write());
            let finalized = unsafe { descriptor.finalize(device, image_count as u32) };
            self.descriptors.push(descriptor);
            finalized?;
        }

        self.command_buffers = unsafe { command_pool.allocate(device, image_count as u32)? };
        Ok(())
    }

    pub fn uniform_buffers(&self) -> &[GpuBuffer] {
        &self.uniform_buffers
    }

    /// One descriptor per model, in load order.
    pub fn descriptors(&self) -> &[ResourceDescriptor] {
        &self.descriptors
    }

    pub fn command_buffers(&self) -> &[vk::CommandBuffer] {
        &self.command_buffers
    }

    /// Sets summed over every descriptor.
    pub fn descriptor_set_count(&self) -> usize {
        self.descriptors.iter().map(|d| d.sets().len()).sum()
    }

    /// Release everything. With `keep_bindings` the descriptors come back
    /// with their layout bindings, ready for the next [`build`](Self::build).
    ///
    /// The device must be idle.
    pub fn teardown(
        mut self,
        ctx: &GpuContext,
        command_pool: &CommandPool,
        keep_bindings: bool,
    ) -> Vec<ResourceDescriptor> {
        let device = ctx.device();
        unsafe {
            if !self.command_buffers.is_empty() {
                command_pool.free(device, &self.command_buffers);
            }
            for descriptor in &mut self.descriptors {
                descriptor.destroy(device, keep_bindings);
            }
        }

        let mut allocator = ctx.allocator().lock();
        for buffer in &mut self.uniform_buffers {
            if let Err(e) = allocator.destroy_buffer(buffer) {
                tracing::error!("Failed to release uniform buffer: {e}");
            }
        }

        if keep_bindings {
            self.descriptors
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_model_descriptor_has_uniform_then_sampler() {
        let descriptor = model_descriptor(None, "room.gltf");
        let types: Vec<vk::DescriptorType> =
            descriptor.bindings().iter().map(|b| b.descriptor_type).collect();
        assert_eq!(
            types,
            vec![
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            ]
        );
        assert!(descriptor.writes().is_empty());
    }

    #[test]
    fn retained_descriptor_keeps_its_bindings() {
        let mut kept = ResourceDescriptor::new("kept");
        kept.add_layout_binding(LayoutBinding::uniform_buffer(vk::ShaderStageFlags::ALL));

        let descriptor = model_descriptor(Some(kept), "room.gltf");
        assert_eq!(
            descriptor.bindings(),
            &[LayoutBinding::uniform_buffer(vk::ShaderStageFlags::ALL)]
        );
    }

    #[test]
    fn retained_descriptor_without_bindings_is_replaced() {
        let descriptor = model_descriptor(Some(ResourceDescriptor::new("empty")), "room.gltf");
        assert_eq!(descriptor.bindings().len(), 2);
    }
}
