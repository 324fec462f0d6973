//! GPU memory management.

use crate::debug::DebugNames;
use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Where a resource's memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocality {
    /// Fastest for the GPU, not mappable.
    DeviceLocal,
    /// Persistently mapped, written by the CPU without explicit flushes.
    HostVisibleCoherent,
    /// Persistently mapped and cached, for reading results back.
    HostVisibleCached,
}

impl MemoryLocality {
    fn location(self) -> MemoryLocation {
        match self {
            Self::DeviceLocal => MemoryLocation::GpuOnly,
            Self::HostVisibleCoherent => MemoryLocation::CpuToGpu,
            Self::HostVisibleCached => MemoryLocation::GpuToCpu,
        }
    }
}

/// Allocator usage snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MemoryStats {
    /// Bytes handed out to live allocations.
    pub used_bytes: u64,
    /// Bytes reserved in memory blocks but not handed out.
    pub unused_bytes: u64,
    pub block_count: usize,
    pub allocation_count: usize,
}

#[derive(Serialize)]
struct StatsDump<'a> {
    total: &'a MemoryStats,
    allocations: Vec<AllocationEntry>,
}

#[derive(Serialize)]
struct AllocationEntry {
    name: String,
    size: u64,
}

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
    debug_names: Option<Arc<DebugNames>>,
    sharing_mode: vk::SharingMode,
    sharing_families: Vec<u32>,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// `sharing` is applied to every buffer and image; it lists the queue
    /// families that touch uploaded resources.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
        sharing: (vk::SharingMode, Vec<u32>),
        debug_names: Option<Arc<DebugNames>>,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        let (sharing_mode, sharing_families) = sharing;
        Ok(Self {
            allocator: Some(allocator),
            device,
            debug_names,
            sharing_mode,
            sharing_families,
        })
    }

    fn inner(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator already shut down".to_string()))
    }

    fn name_object<H: vk::Handle>(&self, object: H, name: &str) {
        if let Some(names) = &self.debug_names {
            unsafe { names.set_name(object, name) };
        }
    }

    /// Allocate a buffer.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        locality: MemoryLocality,
        debug_name: &str,
    ) -> Result<GpuBuffer> {
        if size == 0 {
            return Err(GpuError::AllocationFailed(format!(
                "buffer {debug_name} has zero size"
            )));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(self.sharing_mode)
            .queue_family_indices(&self.sharing_families);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = self.inner().and_then(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name: debug_name,
                    requirements,
                    location: locality.location(),
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let mut gpu_buffer = GpuBuffer {
            buffer,
            allocation: Some(allocation),
            size,
        };

        let bound = unsafe {
            let allocation = gpu_buffer.allocation.as_ref();
            match allocation {
                Some(a) => self.device.bind_buffer_memory(buffer, a.memory(), a.offset()),
                None => Ok(()),
            }
        };
        if let Err(e) = bound {
            self.destroy_buffer(&mut gpu_buffer)?;
            return Err(e.into());
        }

        self.name_object(buffer, debug_name);
        Ok(gpu_buffer)
    }

    /// Release a buffer. Calling this again on the same buffer is a no-op.
    pub fn destroy_buffer(&mut self, buffer: &mut GpuBuffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.inner()?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        }

        if buffer.buffer != vk::Buffer::null() {
            unsafe { self.device.destroy_buffer(buffer.buffer, None) };
            buffer.buffer = vk::Buffer::null();
        }

        Ok(())
    }

    /// Allocate a 2D, single-mip, single-sample image together with a view.
    ///
    /// The image starts in `UNDEFINED` layout.
    pub fn create_image(
        &mut self,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
        debug_name: &str,
    ) -> Result<GpuImage> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(self.sharing_mode)
            .queue_family_indices(&self.sharing_families)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&create_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = self.inner().and_then(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name: debug_name,
                    requirements,
                    location: MemoryLocation::GpuOnly,
                    linear: false,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let mut gpu_image = GpuImage {
            image,
            view: vk::ImageView::null(),
            allocation: Some(allocation),
            format,
            extent,
            aspect,
            layout: vk::ImageLayout::UNDEFINED,
        };

        let view = unsafe {
            let bound = match gpu_image.allocation.as_ref() {
                Some(a) => self.device.bind_image_memory(image, a.memory(), a.offset()),
                None => Ok(()),
            };
            bound.and_then(|()| {
                let view_info = vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format)
                    .components(vk::ComponentMapping::default())
                    .subresource_range(gpu_image.subresource_range());
                self.device.create_image_view(&view_info, None)
            })
        };
        match view {
            Ok(view) => gpu_image.view = view,
            Err(e) => {
                self.destroy_image(&mut gpu_image)?;
                return Err(e.into());
            }
        }

        self.name_object(image, debug_name);
        Ok(gpu_image)
    }

    /// Release an image and its view. Calling this again is a no-op.
    pub fn destroy_image(&mut self, image: &mut GpuImage) -> Result<()> {
        if image.view != vk::ImageView::null() {
            unsafe { self.device.destroy_image_view(image.view, None) };
            image.view = vk::ImageView::null();
        }

        if let Some(allocation) = image.allocation.take() {
            self.inner()?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        }

        if image.image != vk::Image::null() {
            unsafe { self.device.destroy_image(image.image, None) };
            image.image = vk::Image::null();
        }

        Ok(())
    }

    /// Current usage figures.
    pub fn snapshot_stats(&self) -> MemoryStats {
        let Some(allocator) = self.allocator.as_ref() else {
            return MemoryStats::default();
        };
        let report = allocator.generate_report();

        let reserved: u64 = report.blocks.iter().map(|block| block.size).sum();
        let used: u64 = report.allocations.iter().map(|a| a.size).sum();

        MemoryStats {
            used_bytes: used,
            unused_bytes: reserved.saturating_sub(used),
            block_count: report.blocks.len(),
            allocation_count: report.allocations.len(),
        }
    }

    /// Write usage figures and the live allocation list as TOML.
    pub fn write_stats_dump(&self, path: &Path) -> prism_core::Result<()> {
        let stats = self.snapshot_stats();
        let allocations = self
            .allocator
            .as_ref()
            .map(|allocator| {
                allocator
                    .generate_report()
                    .allocations
                    .into_iter()
                    .map(|a| AllocationEntry {
                        name: a.name,
                        size: a.size,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let dump = toml::to_string_pretty(&StatsDump {
            total: &stats,
            allocations,
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, dump)?;
        Ok(())
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Any remaining allocations will be freed (and logged as leaks).
    pub fn shutdown(&mut self) {
        let stats = self.snapshot_stats();
        if stats.used_bytes > 0 {
            tracing::warn!(
                "{} allocation(s) totalling {} bytes still alive at allocator shutdown",
                stats.allocation_count,
                stats.used_bytes
            );
        }
        self.allocator = None;
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A GPU buffer with its allocation.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
}

impl GpuBuffer {
    /// Persistently mapped pointer, if the buffer is host-visible.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .map(|p| p.as_ptr().cast::<u8>())
    }

    /// Write data at the start of the buffer (must be host-visible).
    pub fn write<T: bytemuck::Pod>(&self, data: &[T]) -> Result<()> {
        self.write_bytes(0, bytemuck::cast_slice(data))
    }

    /// Write raw bytes to the buffer at the given offset (must be host-visible).
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidState(format!(
                "write of {} bytes at {offset} exceeds buffer size {}",
                data.len(),
                self.size
            )));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }

        Ok(())
    }

    /// Whether the buffer still owns its memory.
    pub fn is_alive(&self) -> bool {
        self.allocation.is_some()
    }
}

/// A GPU image with its allocation and default view.
pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub aspect: vk::ImageAspectFlags,
    /// Layout after the last recorded transition.
    pub layout: vk::ImageLayout,
}

impl GpuImage {
    /// Range covering the whole image.
    pub fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::default()
            .aspect_mask(self.aspect)
            .base_mip_level(0)
            .level_count(1)
            .base_array_layer(0)
            .layer_count(1)
    }

    /// Whether the image still owns its memory.
    pub fn is_alive(&self) -> bool {
        self.allocation.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locality_maps_to_allocator_location() {
        assert_eq!(MemoryLocality::DeviceLocal.location(), MemoryLocation::GpuOnly);
        assert_eq!(
            MemoryLocality::HostVisibleCoherent.location(),
            MemoryLocation::CpuToGpu
        );
        assert_eq!(
            MemoryLocality::HostVisibleCached.location(),
            MemoryLocation::GpuToCpu
        );
    }

    #[test]
    fn unmapped_buffer_rejects_writes() {
        let buffer = GpuBuffer {
            buffer: vk::Buffer::null(),
            allocation: None,
            size: 16,
        };
        assert!(buffer.mapped_ptr().is_none());
        assert!(matches!(
            buffer.write(&[1u32, 2, 3, 4]),
            Err(GpuError::InvalidState(_))
        ));
    }

    #[test]
    fn stats_serialize_to_toml() {
        let stats = MemoryStats {
            used_bytes: 1024,
            unused_bytes: 512,
            block_count: 1,
            allocation_count: 2,
        };
        let dump = toml::to_string_pretty(&StatsDump {
            total: &stats,
            allocations: vec![AllocationEntry {
                name: "vertices".to_string(),
                size: 1024,
            }],
        })
        .unwrap();

        assert!(dump.contains("used_bytes = 1024"));
        assert!(dump.contains("name = \"vertices\""));
    }
}
