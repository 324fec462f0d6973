//! GPU capability detection.

use ash::vk;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Physical device type
    pub device_type: vk::PhysicalDeviceType,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Maximum memory allocation count
    pub max_memory_allocation_count: u32,

    /// Anisotropic filtering support
    pub supports_sampler_anisotropy: bool,
    /// Maximum sampler anisotropy
    pub max_sampler_anisotropy: f32,

    /// Queue family flags and queue counts, indexed by family
    pub queue_families: Vec<(vk::QueueFlags, u32)>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let features = instance.get_physical_device_features(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);
        let families = instance.get_physical_device_queue_family_properties(physical_device);

        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            device_type: properties.device_type,
            api_version: properties.api_version,
            driver_version: properties.driver_version,

            device_local_memory_mb: device_local_bytes(&memory_properties) / (1024 * 1024),
            max_memory_allocation_count: properties.limits.max_memory_allocation_count,

            supports_sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
            max_sampler_anisotropy: properties.limits.max_sampler_anisotropy,

            queue_families: families
                .iter()
                .map(|f| (f.queue_flags, f.queue_count))
                .collect(),
        }
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            device_type_name(self.device_type),
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }

    /// Log the full device report.
    pub fn log_report(&self) {
        tracing::info!("GPU: {}", self.device_name);
        tracing::info!("  Type: {}", device_type_name(self.device_type));
        tracing::info!("  Vendor: {:?}", self.vendor);
        tracing::info!(
            "  API version: {}.{}.{}",
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version)
        );
        tracing::info!("  Driver version: {:#x}", self.driver_version);
        tracing::info!("  Device-local memory: {} MB", self.device_local_memory_mb);
        tracing::info!(
            "  Sampler anisotropy: {} (max {})",
            self.supports_sampler_anisotropy,
            self.max_sampler_anisotropy
        );
        for (index, (flags, count)) in self.queue_families.iter().enumerate() {
            tracing::info!("  Queue family {index}: {count} queue(s), {flags:?}");
        }
    }
}

/// Sum of all device-local heap sizes in bytes.
pub fn device_local_bytes(memory: &vk::PhysicalDeviceMemoryProperties) -> u64 {
    memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|heap| heap.size)
        .sum()
}

/// Readable name of a physical device type.
pub fn device_type_name(device_type: vk::PhysicalDeviceType) -> &'static str {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => "discrete",
        vk::PhysicalDeviceType::INTEGRATED_GPU => "integrated",
        vk::PhysicalDeviceType::VIRTUAL_GPU => "virtual",
        vk::PhysicalDeviceType::CPU => "cpu",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn device_local_bytes_ignores_host_heaps() {
        let mut memory = vk::PhysicalDeviceMemoryProperties {
            memory_heap_count: 3,
            ..Default::default()
        };
        memory.memory_heaps[0] = vk::MemoryHeap {
            size: 4 << 30,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        memory.memory_heaps[1] = vk::MemoryHeap {
            size: 16 << 30,
            flags: vk::MemoryHeapFlags::empty(),
        };
        memory.memory_heaps[2] = vk::MemoryHeap {
            size: 256 << 20,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        // Heaps past the count are ignored.
        memory.memory_heaps[3] = vk::MemoryHeap {
            size: 1 << 40,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };

        assert_eq!(device_local_bytes(&memory), (4 << 30) + (256 << 20));
    }

    #[test]
    fn device_type_names() {
        assert_eq!(device_type_name(vk::PhysicalDeviceType::DISCRETE_GPU), "discrete");
        assert_eq!(device_type_name(vk::PhysicalDeviceType::CPU), "cpu");
        assert_eq!(device_type_name(vk::PhysicalDeviceType::OTHER), "other");
    }
}
