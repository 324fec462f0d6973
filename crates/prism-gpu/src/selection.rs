//! Physical device selection.

use ash::vk;

use crate::capabilities::{device_local_bytes, device_type_name};
use crate::error::{GpuError, Result};
use crate::probe::CapabilityProbe;
use crate::queues::QueueFamilyInfo;

/// What selection needs to know about one physical device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Position in the driver's enumeration order.
    pub index: u32,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    /// Sum of device-local heaps in bytes.
    pub device_local_memory: u64,
    pub has_swapchain_extension: bool,
    pub queue_families: Vec<QueueFamilyInfo>,
}

impl DeviceInfo {
    /// Collect selection data for `gpu`.
    ///
    /// Without a surface (headless) every graphics family counts as
    /// presentable and the swapchain extension is not required.
    pub fn gather(
        probe: &CapabilityProbe,
        instance: &ash::Instance,
        gpu: vk::PhysicalDevice,
        index: u32,
        surface: Option<vk::SurfaceKHR>,
    ) -> Result<Self> {
        let (properties, memory) = unsafe {
            (
                instance.get_physical_device_properties(gpu),
                instance.get_physical_device_memory_properties(gpu),
            )
        };
        let name = unsafe { std::ffi::CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let families = probe.queue_families(gpu)?;
        let mut queue_families = Vec::with_capacity(families.len());
        for (family_index, family) in families.iter().enumerate() {
            let present = match surface {
                Some(surface) => probe.surface_supported(gpu, surface, family_index as u32)?,
                None => family.queue_flags.contains(vk::QueueFlags::GRAPHICS),
            };
            queue_families.push(QueueFamilyInfo {
                flags: family.queue_flags,
                present,
            });
        }

        let has_swapchain_extension = match surface {
            Some(_) => probe.device_extension_available(gpu, ash::khr::swapchain::NAME)?,
            None => true,
        };

        Ok(Self {
            index,
            name,
            device_type: properties.device_type,
            device_local_memory: device_local_bytes(&memory),
            has_swapchain_extension,
            queue_families,
        })
    }

    /// Swapchain support, a presentable family and a graphics family.
    pub fn is_suitable(&self) -> bool {
        self.has_swapchain_extension
            && self.queue_families.iter().any(|f| f.present)
            && self
                .queue_families
                .iter()
                .any(|f| f.flags.contains(vk::QueueFlags::GRAPHICS))
    }

    /// Ranking key: device type first, device-local memory second.
    pub fn score(&self) -> (u32, u64) {
        (type_rating(self.device_type), self.device_local_memory)
    }
}

fn type_rating(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 4,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 1,
        _ => 0,
    }
}

/// Pick a device from `devices`, returning its position in the slice.
///
/// A lone device is used if suitable. Otherwise a valid, suitable preferred
/// index wins, and failing that the best-scoring suitable device is taken,
/// with ties going to the lower index.
pub fn select_device(devices: &[DeviceInfo], preferred: Option<u32>) -> Result<usize> {
    match devices {
        [] => return Err(GpuError::NoSuitableGpu),
        [only] => {
            return if only.is_suitable() {
                Ok(0)
            } else {
                Err(GpuError::NoSuitableGpu)
            };
        }
        _ => {}
    }

    if let Some(preferred) = preferred {
        match devices.get(preferred as usize) {
            Some(device) if device.is_suitable() => {
                tracing::info!("Using preferred GPU {preferred} ({})", device.name);
                return Ok(preferred as usize);
            }
            Some(device) => tracing::warn!(
                "Preferred GPU {preferred} ({}) is not suitable, selecting automatically",
                device.name
            ),
            None => tracing::warn!(
                "Preferred GPU index {preferred} is out of range ({} devices), selecting automatically",
                devices.len()
            ),
        }
    }

    let mut best: Option<usize> = None;
    for (position, device) in devices.iter().enumerate() {
        if !device.is_suitable() {
            tracing::debug!(
                "Skipping unsuitable GPU {} ({})",
                device.name,
                device_type_name(device.device_type)
            );
            continue;
        }
        if best.map_or(true, |b| device.score() > devices[b].score()) {
            best = Some(position);
        }
    }

    best.ok_or(GpuError::NoSuitableGpu)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(index: u32, device_type: vk::PhysicalDeviceType, memory_gb: u64) -> DeviceInfo {
        DeviceInfo {
            index,
            name: format!("gpu{index}"),
            device_type,
            device_local_memory: memory_gb << 30,
            has_swapchain_extension: true,
            queue_families: vec![QueueFamilyInfo {
                flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER,
                present: true,
            }],
        }
    }

    fn unsuitable(mut info: DeviceInfo) -> DeviceInfo {
        info.has_swapchain_extension = false;
        info
    }

    #[test]
    fn single_suitable_device_is_used() {
        let devices = [device(0, vk::PhysicalDeviceType::CPU, 0)];
        assert_eq!(select_device(&devices, None).unwrap(), 0);
        // The hint does not matter with one device.
        assert_eq!(select_device(&devices, Some(5)).unwrap(), 0);
    }

    #[test]
    fn single_unsuitable_device_fails() {
        let devices = [unsuitable(device(0, vk::PhysicalDeviceType::DISCRETE_GPU, 8))];
        assert!(matches!(
            select_device(&devices, None),
            Err(GpuError::NoSuitableGpu)
        ));
    }

    #[test]
    fn no_devices_fails() {
        assert!(matches!(select_device(&[], None), Err(GpuError::NoSuitableGpu)));
    }

    #[test]
    fn preferred_index_wins_when_suitable() {
        let devices = [
            device(0, vk::PhysicalDeviceType::DISCRETE_GPU, 8),
            device(1, vk::PhysicalDeviceType::INTEGRATED_GPU, 1),
        ];
        assert_eq!(select_device(&devices, Some(1)).unwrap(), 1);
    }

    #[test]
    fn out_of_range_preference_falls_back() {
        let devices = [
            device(0, vk::PhysicalDeviceType::INTEGRATED_GPU, 2),
            device(1, vk::PhysicalDeviceType::DISCRETE_GPU, 4),
        ];
        assert_eq!(select_device(&devices, Some(99)).unwrap(), 1);
    }

    #[test]
    fn unsuitable_preference_falls_back() {
        let devices = [
            device(0, vk::PhysicalDeviceType::INTEGRATED_GPU, 2),
            unsuitable(device(1, vk::PhysicalDeviceType::DISCRETE_GPU, 4)),
        ];
        assert_eq!(select_device(&devices, Some(1)).unwrap(), 0);
    }

    #[test]
    fn device_type_outranks_memory() {
        let devices = [
            device(0, vk::PhysicalDeviceType::VIRTUAL_GPU, 64),
            device(1, vk::PhysicalDeviceType::CPU, 128),
            device(2, vk::PhysicalDeviceType::INTEGRATED_GPU, 1),
        ];
        assert_eq!(select_device(&devices, None).unwrap(), 2);
    }

    #[test]
    fn memory_breaks_type_ties_and_equal_scores_keep_lower_index() {
        let devices = [
            device(0, vk::PhysicalDeviceType::DISCRETE_GPU, 4),
            device(1, vk::PhysicalDeviceType::DISCRETE_GPU, 8),
            device(2, vk::PhysicalDeviceType::DISCRETE_GPU, 8),
        ];
        assert_eq!(select_device(&devices, None).unwrap(), 1);
    }

    #[test]
    fn suitability_requires_present_and_graphics() {
        let mut no_present = device(0, vk::PhysicalDeviceType::DISCRETE_GPU, 8);
        no_present.queue_families[0].present = false;
        assert!(!no_present.is_suitable());

        let mut no_graphics = device(0, vk::PhysicalDeviceType::DISCRETE_GPU, 8);
        no_graphics.queue_families[0].flags = vk::QueueFlags::COMPUTE;
        assert!(!no_graphics.is_suitable());

        let devices = [no_present, no_graphics];
        assert!(matches!(
            select_device(&devices, None),
            Err(GpuError::NoSuitableGpu)
        ));
    }
}
