//! Staging uploads from host memory into device-local buffers and images.

use crate::command::CommandPool;
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::memory::{GpuBuffer, GpuImage, MemoryLocality};
use ash::vk;

/// Access and stage masks for one image layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Barrier masks for the two transitions an upload performs.
///
/// Everything else is rejected, so an image can only become shader-readable
/// after having been a transfer destination.
pub fn transition_masks(old: vk::ImageLayout, new: vk::ImageLayout) -> Result<TransitionMasks> {
    match (old, new) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => Ok(TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        }),
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => {
            Ok(TransitionMasks {
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            })
        }
        _ => Err(GpuError::UnsupportedLayoutTransition { old, new }),
    }
}

/// Record a pipeline barrier moving `image` from `old` to `new`.
///
/// # Safety
/// `cmd` must be in the recording state.
pub unsafe fn record_layout_transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<()> {
    let masks = transition_masks(old, new)?;

    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
        .src_access_mask(masks.src_access)
        .dst_access_mask(masks.dst_access);

    device.cmd_pipeline_barrier(
        cmd,
        masks.src_stage,
        masks.dst_stage,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[barrier],
    );
    Ok(())
}

/// Byte size of a tightly packed RGBA8 image.
pub fn rgba8_byte_len(extent: vk::Extent2D) -> u64 {
    u64::from(extent.width) * u64::from(extent.height) * 4
}

/// Copies host data into device-local resources through staging buffers.
///
/// Copies run on the transfer queue. When that queue belongs to its own
/// family, the final transition to `SHADER_READ_ONLY_OPTIMAL` is recorded on
/// the graphics queue, since the fragment shader stage does not exist on a
/// transfer-only queue. Every upload waits for its queue to go idle, so this
/// is meant for loading before the render loop starts.
pub struct ResourceUploader {
    transfer_pool: CommandPool,
    graphics_pool: Option<CommandPool>,
    last_staging_size: u64,
}

impl ResourceUploader {
    /// Create the command pools used for uploads.
    pub fn new(ctx: &GpuContext) -> Result<Self> {
        let plan = ctx.queue_plan();
        let device = ctx.device();

        let transfer_pool =
            unsafe { CommandPool::new(device, plan.transfer, vk::CommandPoolCreateFlags::TRANSIENT)? };

        let graphics_pool = if plan.has_separate_transfer() {
            match unsafe {
                CommandPool::new(device, plan.graphics, vk::CommandPoolCreateFlags::TRANSIENT)
            } {
                Ok(pool) => Some(pool),
                Err(e) => {
                    let mut transfer_pool = transfer_pool;
                    unsafe { transfer_pool.destroy(device) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(Self {
            transfer_pool,
            graphics_pool,
            last_staging_size: 0,
        })
    }

    /// Size of the staging buffer used by the most recent upload.
    pub fn last_staging_size(&self) -> u64 {
        self.last_staging_size
    }

    fn create_staging(&mut self, ctx: &GpuContext, data: &[u8], name: &str) -> Result<GpuBuffer> {
        let mut allocator = ctx.allocator().lock();
        let mut staging = allocator.create_buffer(
            data.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocality::HostVisibleCoherent,
            &format!("{name} staging"),
        )?;

        if let Err(e) = staging.write_bytes(0, data) {
            allocator.destroy_buffer(&mut staging)?;
            return Err(e);
        }

        self.last_staging_size = staging.size;
        Ok(staging)
    }

    /// Upload `data` into a new device-local buffer with `usage`.
    ///
    /// `TRANSFER_DST` is added to `usage`.
    pub fn upload_buffer(
        &mut self,
        ctx: &GpuContext,
        data: &[u8],
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<GpuBuffer> {
        let mut staging = self.create_staging(ctx, data, name)?;

        let target = ctx.allocator().lock().create_buffer(
            staging.size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocality::DeviceLocal,
            name,
        );
        let mut target = match target {
            Ok(target) => target,
            Err(e) => {
                ctx.allocator().lock().destroy_buffer(&mut staging)?;
                return Err(e);
            }
        };

        let device = ctx.device();
        let copied = unsafe {
            self.transfer_pool
                .with_one_shot_commands(device, ctx.transfer_queue(), |cmd| {
                    let region = vk::BufferCopy::default().size(staging.size);
                    device.cmd_copy_buffer(cmd, staging.buffer, target.buffer, &[region]);
                    Ok(())
                })
        };

        let mut allocator = ctx.allocator().lock();
        allocator.destroy_buffer(&mut staging)?;
        if let Err(e) = copied {
            allocator.destroy_buffer(&mut target)?;
            return Err(upload_failure(name, e));
        }

        tracing::debug!("Uploaded buffer {name} ({} bytes)", target.size);
        Ok(target)
    }

    /// Upload tightly packed RGBA8 `pixels` into a new sampled image.
    ///
    /// The returned image is in `SHADER_READ_ONLY_OPTIMAL` layout.
    pub fn upload_rgba8_image(
        &mut self,
        ctx: &GpuContext,
        pixels: &[u8],
        extent: vk::Extent2D,
        format: vk::Format,
        name: &str,
    ) -> Result<GpuImage> {
        let expected = rgba8_byte_len(extent);
        if pixels.len() as u64 != expected || expected == 0 {
            return Err(GpuError::UploadFailed(format!(
                "{name}: {} bytes of pixel data for a {}x{} image",
                pixels.len(),
                extent.width,
                extent.height
            )));
        }

        let mut staging = self.create_staging(ctx, pixels, name)?;

        let image = ctx.allocator().lock().create_image(
            format,
            extent,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
            name,
        );
        let mut image = match image {
            Ok(image) => image,
            Err(e) => {
                ctx.allocator().lock().destroy_buffer(&mut staging)?;
                return Err(e);
            }
        };

        let result = self.copy_into_image(ctx, &staging, &mut image);

        let mut allocator = ctx.allocator().lock();
        allocator.destroy_buffer(&mut staging)?;
        if let Err(e) = result {
            allocator.destroy_image(&mut image)?;
            return Err(upload_failure(name, e));
        }

        tracing::debug!(
            "Uploaded image {name} ({}x{}, {} bytes)",
            extent.width,
            extent.height,
            expected
        );
        Ok(image)
    }

    fn copy_into_image(
        &self,
        ctx: &GpuContext,
        staging: &GpuBuffer,
        image: &mut GpuImage,
    ) -> Result<()> {
        let device = ctx.device();
        let range = image.subresource_range();
        let handle = image.image;
        let initial_layout = image.layout;

        let region = vk::BufferImageCopy::default()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(image.aspect)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .image_offset(vk::Offset3D::default())
            .image_extent(vk::Extent3D {
                width: image.extent.width,
                height: image.extent.height,
                depth: 1,
            });

        let record_copy = |cmd: vk::CommandBuffer| -> Result<()> {
            unsafe {
                record_layout_transition(
                    device,
                    cmd,
                    handle,
                    range,
                    initial_layout,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                )?;
                device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer,
                    handle,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
            Ok(())
        };
        let record_release = |cmd: vk::CommandBuffer| -> Result<()> {
            unsafe {
                record_layout_transition(
                    device,
                    cmd,
                    handle,
                    range,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )
            }
        };

        match &self.graphics_pool {
            Some(graphics_pool) => unsafe {
                self.transfer_pool
                    .with_one_shot_commands(device, ctx.transfer_queue(), record_copy)?;
                image.layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
                graphics_pool.with_one_shot_commands(device, ctx.graphics_queue(), record_release)?;
            },
            None => unsafe {
                self.transfer_pool
                    .with_one_shot_commands(device, ctx.transfer_queue(), |cmd| {
                        record_copy(cmd)?;
                        record_release(cmd)
                    })?;
            },
        }

        image.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        Ok(())
    }

    /// Destroy the command pools.
    ///
    /// # Safety
    /// No upload may be in progress.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        self.transfer_pool.destroy(device);
        if let Some(pool) = self.graphics_pool.as_mut() {
            pool.destroy(device);
        }
        self.graphics_pool = None;
    }
}

/// Surface recording and submission failures as `UploadFailed`.
///
/// Layout table violations and memory exhaustion keep their own kind.
fn upload_failure(name: &str, error: GpuError) -> GpuError {
    match error {
        GpuError::UnsupportedLayoutTransition { .. }
        | GpuError::AllocationFailed(_)
        | GpuError::UploadFailed(_) => error,
        other => GpuError::UploadFailed(format!("{name}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUTS: [vk::ImageLayout; 6] = [
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::GENERAL,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    ];

    #[test]
    fn undefined_to_transfer_dst() {
        let masks = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert_eq!(masks.src_access, vk::AccessFlags::empty());
        assert_eq!(masks.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(masks.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(masks.dst_stage, vk::PipelineStageFlags::TRANSFER);
    }

    #[test]
    fn transfer_dst_to_shader_read() {
        let masks = transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(masks.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(masks.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(masks.src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(masks.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn only_two_transitions_are_supported() {
        let mut supported = 0;
        for old in LAYOUTS {
            for new in LAYOUTS {
                match transition_masks(old, new) {
                    Ok(_) => supported += 1,
                    Err(GpuError::UnsupportedLayoutTransition { old: o, new: n }) => {
                        assert_eq!((o, n), (old, new));
                    }
                    Err(other) => panic!("unexpected error {other:?}"),
                }
            }
        }
        assert_eq!(supported, 2);
    }

    #[test]
    fn shader_read_only_is_reached_only_from_transfer_dst() {
        for old in LAYOUTS {
            let reachable =
                transition_masks(old, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL).is_ok();
            assert_eq!(reachable, old == vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        }
    }

    #[test]
    fn rgba8_sizes() {
        assert_eq!(
            rgba8_byte_len(vk::Extent2D {
                width: 256,
                height: 256
            }),
            262_144
        );
        assert_eq!(rgba8_byte_len(vk::Extent2D { width: 1, height: 1 }), 4);
        assert_eq!(rgba8_byte_len(vk::Extent2D::default()), 0);
    }

    #[test]
    fn recording_failures_become_upload_failures() {
        let wrapped = upload_failure("albedo", GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
        assert!(matches!(wrapped, GpuError::UploadFailed(message) if message.starts_with("albedo")));

        let kept = upload_failure(
            "albedo",
            GpuError::UnsupportedLayoutTransition {
                old: vk::ImageLayout::GENERAL,
                new: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        );
        assert!(matches!(kept, GpuError::UnsupportedLayoutTransition { .. }));
    }
}
