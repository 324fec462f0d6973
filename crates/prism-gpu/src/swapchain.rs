//! Swapchain management.
//!
//! Surface format, present mode, image count, extent and depth format are
//! chosen by pure functions so the policies can be tested without a device.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::memory::{GpuAllocator, GpuImage};
use ash::vk;

/// Depth formats in order of preference.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Swapchain with its per-image views, depth buffer and framebuffers.
pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub depth: Option<GpuImage>,
    pub framebuffers: Vec<vk::Framebuffer>,
}

impl Swapchain {
    /// Create a swapchain and one color view per image.
    ///
    /// `requested` is the window's framebuffer size; it is only used when
    /// the surface leaves the extent up to the application.
    pub fn new(ctx: &GpuContext, requested: vk::Extent2D, old: vk::SwapchainKHR) -> Result<Self> {
        let surface = ctx.surface()?;
        let loader = ctx.swapchain_loader()?;
        let caps = surface.capabilities(ctx.physical_device())?;

        let surface_format = choose_surface_format(&caps.formats)?;
        let present_mode = choose_present_mode(&caps.present_modes);
        let extent = choose_extent(&caps.capabilities, requested);
        let image_count = choose_image_count(&caps.capabilities);
        let (sharing_mode, families) = ctx.queue_plan().swapchain_sharing();

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&families)
            .pre_transform(caps.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old);

        let swapchain = unsafe { loader.create_swapchain(&create_info, None)? };

        let mut result = Self {
            swapchain,
            images: Vec::new(),
            image_views: Vec::new(),
            format: surface_format.format,
            extent,
            present_mode,
            depth: None,
            framebuffers: Vec::new(),
        };

        if let Err(e) = result.create_image_views(ctx) {
            result.destroy(ctx);
            return Err(e);
        }

        tracing::info!(
            "Swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            result.images.len(),
            surface_format.format,
            present_mode
        );

        Ok(result)
    }

    fn create_image_views(&mut self, ctx: &GpuContext) -> Result<()> {
        self.images = unsafe { ctx.swapchain_loader()?.get_swapchain_images(self.swapchain)? };

        for (index, &image) in self.images.iter().enumerate() {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_mip_level(0)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(1),
                );

            let view = unsafe { ctx.device().create_image_view(&view_info, None)? };
            ctx.name_object(view, &format!("swapchain view {index}"));
            self.image_views.push(view);
        }

        Ok(())
    }

    /// Number of presentable images.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Allocate the depth buffer in the first supported candidate format.
    pub fn create_depth(&mut self, ctx: &GpuContext, allocator: &mut GpuAllocator) -> Result<()> {
        let format = choose_depth_format(|format| {
            ctx.format_properties(format)
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })?;

        let depth = allocator.create_image(
            format,
            self.extent,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
            "depth buffer",
        )?;
        tracing::debug!("Depth buffer format {format:?}");
        self.depth = Some(depth);
        Ok(())
    }

    /// Depth buffer format, once the depth buffer exists.
    pub fn depth_format(&self) -> Option<vk::Format> {
        self.depth.as_ref().map(|depth| depth.format)
    }

    /// Create one framebuffer per image, each with the shared depth view.
    pub fn create_framebuffers(&mut self, ctx: &GpuContext, render_pass: vk::RenderPass) -> Result<()> {
        let depth_view = self
            .depth
            .as_ref()
            .map(|depth| depth.view)
            .ok_or_else(|| GpuError::InvalidState("framebuffers need a depth buffer".to_string()))?;

        for &view in &self.image_views {
            let attachments = [view, depth_view];
            let info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);
            let framebuffer = unsafe { ctx.device().create_framebuffer(&info, None)? };
            self.framebuffers.push(framebuffer);
        }

        Ok(())
    }

    /// Acquire the next image, signalling `semaphore`.
    ///
    /// Returns the image index and whether the swapchain is suboptimal.
    /// An out-of-date swapchain yields [`GpuError::OutOfDate`].
    ///
    /// # Safety
    /// The semaphore must be unsignalled with no pending signal operation.
    pub unsafe fn acquire_next_image(
        &self,
        loader: &ash::khr::swapchain::Device,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool)> {
        Ok(loader.acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())?)
    }

    /// Queue an image for presentation.
    ///
    /// Returns `true` when the swapchain is suboptimal.
    ///
    /// # Safety
    /// `image_index` must have been acquired and the queue must support
    /// presentation to the surface.
    pub unsafe fn present(
        &self,
        loader: &ash::khr::swapchain::Device,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [wait_semaphore];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        Ok(loader.queue_present(queue, &present_info)?)
    }

    /// Destroy framebuffers, depth buffer, views and the swapchain.
    ///
    /// The depth buffer is released through `allocator` when one is passed.
    pub fn destroy_with(&mut self, ctx: &GpuContext, allocator: Option<&mut GpuAllocator>) {
        let device = ctx.device();
        unsafe {
            for framebuffer in self.framebuffers.drain(..) {
                device.destroy_framebuffer(framebuffer, None);
            }
        }

        if let Some(mut depth) = self.depth.take() {
            let result = match allocator {
                Some(allocator) => allocator.destroy_image(&mut depth),
                None => ctx.allocator().lock().destroy_image(&mut depth),
            };
            if let Err(e) = result {
                tracing::error!("Failed to release depth buffer: {e}");
            }
        }

        unsafe {
            for view in self.image_views.drain(..) {
                device.destroy_image_view(view, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                if let Ok(loader) = ctx.swapchain_loader() {
                    loader.destroy_swapchain(self.swapchain, None);
                }
                self.swapchain = vk::SwapchainKHR::null();
            }
        }
        self.images.clear();
    }

    /// Destroy everything the swapchain owns.
    pub fn destroy(&mut self, ctx: &GpuContext) {
        self.destroy_with(ctx, None);
    }
}

/// Pick the surface format.
///
/// Preference: BGRA8 UNORM with sRGB-nonlinear color space, then any BGRA8
/// variant, then the first format offered. A lone `UNDEFINED` entry means
/// the surface has no preference.
pub fn choose_surface_format(available: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    const PREFERRED: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };

    match available {
        [] => Err(GpuError::UnsupportedEnvironment(
            "surface reports no formats".to_string(),
        )),
        [only] if only.format == vk::Format::UNDEFINED => Ok(PREFERRED),
        _ => {
            let exact = available.iter().find(|f| {
                f.format == PREFERRED.format && f.color_space == PREFERRED.color_space
            });
            let bgra = || {
                available.iter().find(|f| {
                    matches!(
                        f.format,
                        vk::Format::B8G8R8A8_UNORM
                            | vk::Format::B8G8R8A8_SRGB
                            | vk::Format::B8G8R8A8_SNORM
                            | vk::Format::B8G8R8A8_USCALED
                            | vk::Format::B8G8R8A8_SSCALED
                            | vk::Format::B8G8R8A8_UINT
                            | vk::Format::B8G8R8A8_SINT
                    )
                })
            };
            Ok(*exact.or_else(bgra).unwrap_or(&available[0]))
        }
    }
}

/// Pick the present mode: Mailbox, then Fifo, then whatever is offered.
pub fn choose_present_mode(available: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO]
        .into_iter()
        .find(|mode| available.contains(mode))
        .or_else(|| available.first().copied())
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// One image more than the minimum, capped by the maximum when it is set.
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Use the surface's current extent unless it is the "application decides"
/// sentinel, in which case the requested size is clamped to the limits.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    requested: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: requested.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: requested.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// First candidate depth format accepted by `supported`.
pub fn choose_depth_format(supported: impl Fn(vk::Format) -> bool) -> Result<vk::Format> {
    DEPTH_FORMAT_CANDIDATES
        .into_iter()
        .find(|&format| supported(format))
        .ok_or_else(|| {
            GpuError::UnsupportedEnvironment("no depth format supports optimal tiling".to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            ..Default::default()
        }
    }

    #[test]
    fn image_count_policy() {
        assert_eq!(choose_image_count(&caps(1, 3)), 2);
        assert_eq!(choose_image_count(&caps(3, 3)), 3);
        assert_eq!(choose_image_count(&caps(2, 0)), 3);
    }

    #[test]
    fn extent_uses_current_extent() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        };
        let extent = choose_extent(
            &capabilities,
            vk::Extent2D {
                width: 800,
                height: 600,
            },
        );
        assert_eq!((extent.width, extent.height), (1920, 1080));
    }

    #[test]
    fn extent_clamps_requested_size() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 100,
                height: 100,
            },
            max_image_extent: vk::Extent2D {
                width: 1000,
                height: 500,
            },
            ..Default::default()
        };

        let within = choose_extent(
            &capabilities,
            vk::Extent2D {
                width: 800,
                height: 400,
            },
        );
        assert_eq!((within.width, within.height), (800, 400));

        let clamped = choose_extent(
            &capabilities,
            vk::Extent2D {
                width: 4000,
                height: 10,
            },
        );
        assert_eq!((clamped.width, clamped.height), (1000, 100));
    }

    #[test]
    fn surface_format_preference() {
        let srgb = vk::ColorSpaceKHR::SRGB_NONLINEAR;
        let hdr = vk::ColorSpaceKHR::HDR10_ST2084_EXT;

        let exact = choose_surface_format(&[
            format(vk::Format::R8G8B8A8_UNORM, srgb),
            format(vk::Format::B8G8R8A8_UNORM, hdr),
            format(vk::Format::B8G8R8A8_UNORM, srgb),
        ])
        .unwrap();
        assert_eq!(exact.format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(exact.color_space, srgb);

        let any_bgra = choose_surface_format(&[
            format(vk::Format::R8G8B8A8_UNORM, srgb),
            format(vk::Format::B8G8R8A8_SRGB, srgb),
        ])
        .unwrap();
        assert_eq!(any_bgra.format, vk::Format::B8G8R8A8_SRGB);

        let first = choose_surface_format(&[
            format(vk::Format::R16G16B16A16_SFLOAT, hdr),
            format(vk::Format::R8G8B8A8_UNORM, srgb),
        ])
        .unwrap();
        assert_eq!(first.format, vk::Format::R16G16B16A16_SFLOAT);
    }

    #[test]
    fn undefined_surface_format_means_free_choice() {
        let chosen =
            choose_surface_format(&[format(vk::Format::UNDEFINED, vk::ColorSpaceKHR::SRGB_NONLINEAR)])
                .unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn empty_surface_formats_fail() {
        assert!(matches!(
            choose_surface_format(&[]),
            Err(GpuError::UnsupportedEnvironment(_))
        ));
    }

    #[test]
    fn present_mode_preference() {
        use vk::PresentModeKHR as P;

        assert_eq!(choose_present_mode(&[P::FIFO, P::MAILBOX]), P::MAILBOX);
        assert_eq!(choose_present_mode(&[P::IMMEDIATE, P::FIFO]), P::FIFO);
        assert_eq!(choose_present_mode(&[P::IMMEDIATE]), P::IMMEDIATE);
    }

    #[test]
    fn depth_format_preference() {
        assert_eq!(choose_depth_format(|_| true).unwrap(), vk::Format::D32_SFLOAT);
        assert_eq!(
            choose_depth_format(|f| f == vk::Format::D24_UNORM_S8_UINT).unwrap(),
            vk::Format::D24_UNORM_S8_UINT
        );
        assert!(choose_depth_format(|f| f == vk::Format::D16_UNORM).is_err());
    }
}
