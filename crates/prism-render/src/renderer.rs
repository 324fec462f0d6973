//! The renderer: asset loading, swapchain-dependent state and frames.

use std::path::Path;

use ash::vk;
use prism_core::config::{Config, RenderingConfig};
use prism_gpu::command::{begin_command_buffer, end_command_buffer};
use prism_gpu::pipeline::{create_render_pass, cull_mode_flags, front_face};
use prism_gpu::{
    CommandPool, GpuContext, GraphicsPipeline, GraphicsPipelineConfig, ResourceDescriptor,
    ResourceUploader, Swapchain,
};
use prism_platform::WindowHost;

use crate::assets::{asset_name, decode_image, load_gltf};
use crate::error::{RenderError, Result};
use crate::frame::{FrameOutcome, FrameScheduler, FrameStatus};
use crate::mesh::MeshStore;
use crate::resources::ImageResources;
use crate::shader::{ShaderStage, ShaderStore};
use crate::texture::TextureStore;
use crate::uniforms::{Camera, SceneUniforms};
use crate::vertex::Vertex;

/// Where the allocator statistics are written at shutdown.
pub const MEMORY_STATS_PATH: &str = "vma-dumps/memory-stats.toml";

const CLEAR_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

/// Sizes of the per-image collections; all equal after a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainCounts {
    pub images: usize,
    pub image_views: usize,
    pub framebuffers: usize,
    pub command_buffers: usize,
    pub uniform_buffers: usize,
    pub images_in_flight: usize,
    /// Models with a descriptor.
    pub descriptors: usize,
    /// Sets over every descriptor; one per image per model.
    pub descriptor_sets: usize,
}

impl SwapchainCounts {
    pub fn is_consistent(&self) -> bool {
        [
            self.image_views,
            self.framebuffers,
            self.command_buffers,
            self.uniform_buffers,
            self.images_in_flight,
        ]
        .iter()
        .all(|&n| n == self.images)
            && self.descriptor_sets == self.images * self.descriptors
    }
}

/// Everything rebuilt when the swapchain is reset.
struct SwapchainState {
    swapchain: Swapchain,
    render_pass: vk::RenderPass,
    resources: ImageResources,
    pipeline: Option<GraphicsPipeline>,
}

/// Owns the GPU context, the asset stores and the frame loop.
pub struct Renderer {
    settings: RenderingConfig,
    uploader: ResourceUploader,
    textures: TextureStore,
    meshes: MeshStore,
    shaders: ShaderStore,
    command_pool: CommandPool,
    scheduler: Option<FrameScheduler>,
    state: Option<SwapchainState>,
    // Bindings carried from one swapchain to the next.
    retained_descriptors: Vec<ResourceDescriptor>,
    camera: Camera,
    shut_down: bool,
    // Dropped last.
    ctx: GpuContext,
}

impl Renderer {
    /// Load the configured assets and build the swapchain for `host`.
    pub fn new(ctx: GpuContext, config: &Config, host: &dyn WindowHost) -> Result<Self> {
        let uploader = ResourceUploader::new(&ctx)?;
        let command_pool = unsafe {
            CommandPool::new(
                ctx.device(),
                ctx.queue_plan().graphics,
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )?
        };

        let mut renderer = Self {
            settings: config.rendering,
            uploader,
            textures: TextureStore::new(),
            meshes: MeshStore::new(),
            shaders: ShaderStore::new(),
            command_pool,
            scheduler: None,
            state: None,
            retained_descriptors: Vec::new(),
            camera: Camera::default(),
            shut_down: false,
            ctx,
        };

        renderer.load_assets(config)?;
        renderer.camera.look_at(glam::Vec3::ZERO);

        match drawable_extent(host) {
            Some(extent) => renderer.build_swapchain_state(extent)?,
            None => tracing::info!("Window starts minimised, deferring the swapchain"),
        }
        let image_count = renderer.image_count();
        renderer.scheduler = Some(FrameScheduler::new(
            &renderer.ctx,
            renderer.settings.frames_in_flight as usize,
            image_count,
        )?);

        Ok(renderer)
    }

    fn load_assets(&mut self, config: &Config) -> Result<()> {
        for (stage, files) in [
            (ShaderStage::Vertex, &config.shaders.vertex.files),
            (ShaderStage::Fragment, &config.shaders.fragment.files),
        ] {
            for path in files {
                let loaded = self.shaders.load(&self.ctx, stage, path);
                skip_failed_asset(path, loaded)?;
            }
        }

        for path in &config.textures.files {
            let loaded = decode_image(path).and_then(|image| {
                self.textures
                    .upload(&self.ctx, &mut self.uploader, &asset_name(path), &image)
            });
            skip_failed_asset(path, loaded)?;
        }
        self.textures.ensure_fallback(&self.ctx, &mut self.uploader)?;

        for path in &config.models.files {
            let loaded = load_gltf(path).and_then(|mesh| {
                self.meshes
                    .upload(&self.ctx, &mut self.uploader, &asset_name(path), &mesh)
            });
            skip_failed_asset(path, loaded)?;
        }

        tracing::info!(
            "Assets: {} shaders, {} textures, {} meshes",
            self.shaders.len(),
            self.textures.len(),
            self.meshes.len()
        );
        Ok(())
    }

    pub fn context(&self) -> &GpuContext {
        &self.ctx
    }

    pub fn meshes(&self) -> &MeshStore {
        &self.meshes
    }

    pub fn textures(&self) -> &TextureStore {
        &self.textures
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    /// Number of swapchain images, 0 before the first build.
    pub fn image_count(&self) -> usize {
        self.state
            .as_ref()
            .map_or(0, |state| state.swapchain.image_count())
    }

    /// Current swapchain extent.
    pub fn extent(&self) -> Option<vk::Extent2D> {
        self.state.as_ref().map(|state| state.swapchain.extent)
    }

    /// Sizes of the per-image collections.
    pub fn swapchain_counts(&self) -> SwapchainCounts {
        let images_in_flight = self
            .scheduler
            .as_ref()
            .map_or(0, |s| s.images_in_flight().len());
        match &self.state {
            Some(state) => SwapchainCounts {
                images: state.swapchain.images.len(),
                image_views: state.swapchain.image_views.len(),
                framebuffers: state.swapchain.framebuffers.len(),
                command_buffers: state.resources.command_buffers().len(),
                uniform_buffers: state.resources.uniform_buffers().len(),
                images_in_flight,
                descriptors: state.resources.descriptors().len(),
                descriptor_sets: state.resources.descriptor_set_count(),
            },
            None => SwapchainCounts {
                images: 0,
                image_views: 0,
                framebuffers: 0,
                command_buffers: 0,
                uniform_buffers: 0,
                images_in_flight,
                descriptors: 0,
                descriptor_sets: 0,
            },
        }
    }

    /// Draw one frame, rebuilding the swapchain when it has gone stale.
    pub fn draw_frame(&mut self, host: &dyn WindowHost) -> Result<FrameStatus> {
        if self.shut_down {
            return Ok(FrameStatus::ShutdownRequested);
        }
        if host.should_close() {
            self.ctx.wait_idle()?;
            return Ok(FrameStatus::ShutdownRequested);
        }
        if host.is_minimized() {
            return Ok(FrameStatus::Minimized);
        }
        if self.state.is_none() {
            // The last reset happened while minimised.
            return self.reset_swapchain(host).map(|rebuilt| {
                if rebuilt {
                    FrameStatus::Skipped
                } else {
                    FrameStatus::Minimized
                }
            });
        }

        let (Some(scheduler), Some(state)) = (self.scheduler.as_mut(), self.state.as_ref()) else {
            return Err(RenderError::InvalidState("renderer not initialised".to_string()));
        };

        let uniforms = SceneUniforms::new(&self.camera, std::f32::consts::FRAC_PI_2);
        let outcome = scheduler.draw(
            &self.ctx,
            &state.swapchain,
            state.resources.command_buffers(),
            host.resize_observed(),
            |image| {
                let buffer = state.resources.uniform_buffers().get(image as usize).ok_or_else(|| {
                    RenderError::InvalidState(format!("no uniform buffer for image {image}"))
                })?;
                buffer.write(std::slice::from_ref(&uniforms))?;
                Ok(())
            },
        )?;

        match outcome {
            FrameOutcome::Presented { needs_reset, .. } => {
                if needs_reset {
                    self.reset_swapchain(host)?;
                }
                Ok(FrameStatus::Presented)
            }
            FrameOutcome::AcquireFailed => {
                self.reset_swapchain(host)?;
                Ok(FrameStatus::Skipped)
            }
        }
    }

    /// Tear down and rebuild everything that depends on the swapchain.
    ///
    /// Returns `false` without touching anything when the window has no
    /// area; the caller retries once a non-zero size is reported.
    pub fn reset_swapchain(&mut self, host: &dyn WindowHost) -> Result<bool> {
        let Some(extent) = drawable_extent(host) else {
            return Ok(false);
        };

        self.ctx.wait_idle()?;
        self.destroy_swapchain_state(true);
        self.build_swapchain_state(extent)?;

        let image_count = self.image_count();
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.reset_images(image_count);
        }
        host.clear_resize_flag();

        let counts = self.swapchain_counts();
        debug_assert!(counts.is_consistent(), "{counts:?}");
        tracing::debug!(
            "Swapchain reset to {}x{}, {image_count} images",
            extent.width,
            extent.height
        );
        Ok(true)
    }

    fn build_swapchain_state(&mut self, requested: vk::Extent2D) -> Result<()> {
        let swapchain = Swapchain::new(&self.ctx, requested, vk::SwapchainKHR::null())?;
        self.camera
            .set_viewport(swapchain.extent.width, swapchain.extent.height);

        let mut state = SwapchainState {
            swapchain,
            render_pass: vk::RenderPass::null(),
            resources: ImageResources::default(),
            pipeline: None,
        };

        let retained = std::mem::take(&mut self.retained_descriptors);
        match self.populate_swapchain_state(&mut state, retained) {
            Ok(()) => {
                self.state = Some(state);
                Ok(())
            }
            Err(e) => {
                self.retained_descriptors = self.destroy_state(state, true);
                Err(e)
            }
        }
    }

    fn populate_swapchain_state(
        &self,
        state: &mut SwapchainState,
        retained: Vec<ResourceDescriptor>,
    ) -> Result<()> {
        let ctx = &self.ctx;
        let device = ctx.device();

        // Depth, render pass, framebuffers
        state
            .swapchain
            .create_depth(ctx, &mut ctx.allocator().lock())?;
        let depth_format = state
            .swapchain
            .depth_format()
            .ok_or_else(|| RenderError::InvalidState("missing depth buffer".to_string()))?;
        state.render_pass =
            unsafe { create_render_pass(device, state.swapchain.format, depth_format)? };
        ctx.name_object(state.render_pass, "main render pass");
        state.swapchain.create_framebuffers(ctx, state.render_pass)?;

        // Uniform buffers, descriptor sets and command buffers per image
        state.resources = ImageResources::build(
            ctx,
            &self.command_pool,
            &self.meshes,
            &self.textures,
            retained,
            state.swapchain.image_count(),
        )?;

        // Pipeline
        if let Some(layout) = state
            .resources
            .descriptors()
            .first()
            .map(ResourceDescriptor::layout)
        {
            let (vertex, fragment) = self.shaders.pipeline_stages()?;
            let config = GraphicsPipelineConfig {
                vertex_module: vertex.module,
                fragment_module: fragment.module,
                entry_point: vertex.entry_point.clone(),
                vertex_bindings: vec![Vertex::binding_description()],
                vertex_attributes: Vertex::attribute_descriptions().to_vec(),
                cull_mode: cull_mode_flags(self.settings.cull_mode),
                front_face: front_face(self.settings.front_face),
                extent: state.swapchain.extent,
            };
            let pipeline =
                unsafe { GraphicsPipeline::new(device, &config, state.render_pass, &[layout])? };
            ctx.name_object(pipeline.pipeline, "main pipeline");
            state.pipeline = Some(pipeline);
        } else {
            tracing::warn!("No meshes loaded, frames will only be cleared");
        }

        // Record
        for (index, &cmd) in state.resources.command_buffers().iter().enumerate() {
            unsafe { self.record_commands(state, index, cmd)? };
        }

        Ok(())
    }

    unsafe fn record_commands(
        &self,
        state: &SwapchainState,
        image_index: usize,
        cmd: vk::CommandBuffer,
    ) -> Result<()> {
        let device = self.ctx.device();
        begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::empty())?;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: CLEAR_COLOR,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(state.render_pass)
            .framebuffer(state.swapchain.framebuffers[image_index])
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: state.swapchain.extent,
            })
            .clear_values(&clear_values);
        device.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);

        if let Some(pipeline) = &state.pipeline {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);
            let descriptors = state.resources.descriptors();
            for ((name, mesh), descriptor) in self.meshes.entries().iter().zip(descriptors) {
                if let Some(set) = descriptor.set(image_index as u32) {
                    device.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        pipeline.layout,
                        0,
                        &[set],
                        &[],
                    );
                    self.meshes.record_draw(device, cmd, name, mesh);
                }
            }
        }

        device.cmd_end_render_pass(cmd);
        end_command_buffer(device, cmd)?;
        Ok(())
    }

    /// With `keep_bindings` the descriptors are held for the next build.
    fn destroy_swapchain_state(&mut self, keep_bindings: bool) {
        if let Some(state) = self.state.take() {
            self.retained_descriptors = self.destroy_state(state, keep_bindings);
        }
    }

    fn destroy_state(
        &self,
        mut state: SwapchainState,
        keep_bindings: bool,
    ) -> Vec<ResourceDescriptor> {
        let device = self.ctx.device();
        if let Some(pipeline) = state.pipeline.take() {
            unsafe { pipeline.destroy(device) };
        }
        let retained = state
            .resources
            .teardown(&self.ctx, &self.command_pool, keep_bindings);

        state
            .swapchain
            .destroy_with(&self.ctx, Some(&mut *self.ctx.allocator().lock()));

        if state.render_pass != vk::RenderPass::null() {
            unsafe { device.destroy_render_pass(state.render_pass, None) };
        }
        retained
    }

    /// Release every GPU resource and write the allocator statistics.
    ///
    /// Called on drop if not called explicitly.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        self.ctx.wait_idle()?;
        self.destroy_swapchain_state(false);
        for mut descriptor in self.retained_descriptors.drain(..) {
            unsafe { descriptor.destroy(self.ctx.device(), false) };
        }
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.destroy(&self.ctx);
        }

        self.meshes.destroy_all(&mut self.ctx.allocator().lock())?;
        self.textures.destroy_all(&self.ctx)?;
        unsafe {
            self.shaders.destroy_all(self.ctx.device());
            self.uploader.destroy(self.ctx.device());
            self.command_pool.destroy(self.ctx.device());
        }

        let allocator = self.ctx.allocator().lock();
        let stats = allocator.snapshot_stats();
        tracing::info!(
            "GPU memory at shutdown: {} bytes in {} allocations, {} blocks",
            stats.used_bytes,
            stats.allocation_count,
            stats.block_count
        );
        if stats.allocation_count > 0 {
            tracing::warn!(
                "{} GPU allocations ({} bytes) were not released",
                stats.allocation_count,
                stats.used_bytes
            );
        }
        if let Err(e) = allocator.write_stats_dump(Path::new(MEMORY_STATS_PATH)) {
            tracing::warn!("Could not write {MEMORY_STATS_PATH}: {e}");
        }
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("Renderer shutdown failed: {e}");
        }
    }
}

/// The host's framebuffer size, or `None` while it has no area.
fn drawable_extent(host: &dyn WindowHost) -> Option<vk::Extent2D> {
    let (width, height) = host.framebuffer_extent();
    (width > 0 && height > 0).then_some(vk::Extent2D { width, height })
}

/// Log and swallow per-asset failures; anything else is fatal.
fn skip_failed_asset<T>(path: &Path, result: Result<T>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_asset_error() => {
            tracing::warn!("Skipping {}: {e}", path.display());
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use prism_platform::{PlatformError, RawDisplayHandle, RawWindowHandle};

    struct FixedHost((u32, u32));

    impl WindowHost for FixedHost {
        fn raw_handles(&self) -> prism_platform::Result<(RawDisplayHandle, RawWindowHandle)> {
            Err(PlatformError::Handle("no window".to_string()))
        }

        fn framebuffer_extent(&self) -> (u32, u32) {
            self.0
        }

        fn should_close(&self) -> bool {
            false
        }

        fn resize_observed(&self) -> bool {
            false
        }

        fn clear_resize_flag(&self) {}
    }

    fn counts(n: usize) -> SwapchainCounts {
        SwapchainCounts {
            images: n,
            image_views: n,
            framebuffers: n,
            command_buffers: n,
            uniform_buffers: n,
            images_in_flight: n,
            descriptors: 2,
            descriptor_sets: 2 * n,
        }
    }

    #[test]
    fn minimised_window_has_no_drawable_extent() {
        assert_eq!(drawable_extent(&FixedHost((0, 0))), None);
        assert_eq!(drawable_extent(&FixedHost((0, 600))), None);
        assert_eq!(drawable_extent(&FixedHost((800, 0))), None);
        assert_eq!(
            drawable_extent(&FixedHost((800, 600))),
            Some(vk::Extent2D {
                width: 800,
                height: 600
            })
        );
    }

    #[test]
    fn equal_counts_are_consistent() {
        assert!(counts(3).is_consistent());
        assert!(counts(0).is_consistent());
    }

    #[test]
    fn any_mismatch_is_inconsistent() {
        let mut c = counts(3);
        c.framebuffers = 2;
        assert!(!c.is_consistent());

        let mut c = counts(3);
        c.images_in_flight = 4;
        assert!(!c.is_consistent());

        // Sets left over from a two-image swapchain.
        let mut c = counts(3);
        c.descriptor_sets = 2 * 2;
        assert!(!c.is_consistent());
    }

    #[test]
    fn asset_errors_are_skipped_but_gpu_errors_are_not() {
        let path = std::path::PathBuf::from("missing.png");
        assert!(skip_failed_asset::<()>(
            &path,
            Err(RenderError::AssetNotFound(path.clone()))
        )
        .is_ok());
        assert!(skip_failed_asset::<()>(
            &path,
            Err(RenderError::Gpu(prism_gpu::GpuError::NoSuitableGpu))
        )
        .is_err());
    }
}
