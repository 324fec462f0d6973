//! Queue family assignment.

use ash::vk;

use crate::error::{GpuError, Result};

/// What a queue family offers, as far as queue assignment cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub flags: vk::QueueFlags,
    /// Can present to the target surface.
    pub present: bool,
}

/// Queue family indices for graphics, presentation and uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePlan {
    pub graphics: u32,
    pub present: u32,
    pub transfer: u32,
}

impl QueuePlan {
    /// Assign queue families.
    ///
    /// Graphics and present take the first family that qualifies. Transfer
    /// takes the first family with `TRANSFER` but without `GRAPHICS`, and
    /// falls back to the graphics family when there is none or when
    /// `force_shared_transfer` is set.
    pub fn from_families(families: &[QueueFamilyInfo], force_shared_transfer: bool) -> Result<Self> {
        let graphics = first_family(families, |f| f.flags.contains(vk::QueueFlags::GRAPHICS))
            .ok_or(GpuError::NoSuitableGpu)?;
        let present = first_family(families, |f| f.present).ok_or(GpuError::NoSuitableGpu)?;

        let dedicated_transfer = first_family(families, |f| {
            f.flags.contains(vk::QueueFlags::TRANSFER) && !f.flags.contains(vk::QueueFlags::GRAPHICS)
        });
        let transfer = match dedicated_transfer {
            Some(index) if !force_shared_transfer => index,
            _ => graphics,
        };

        Ok(Self {
            graphics,
            present,
            transfer,
        })
    }

    /// Whether uploads run on their own queue family.
    pub fn has_separate_transfer(&self) -> bool {
        self.transfer != self.graphics
    }

    /// Distinct families in the order graphics, present, transfer.
    ///
    /// One `VkDeviceQueueCreateInfo` is created per entry.
    pub fn unique_families(&self) -> Vec<u32> {
        let mut families = vec![self.graphics];
        for family in [self.present, self.transfer] {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }

    /// Sharing mode and family list for swapchain images.
    pub fn swapchain_sharing(&self) -> (vk::SharingMode, Vec<u32>) {
        sharing(self.graphics, self.present)
    }

    /// Sharing mode and family list for buffers and images that are written
    /// by uploads and read by rendering.
    pub fn resource_sharing(&self) -> (vk::SharingMode, Vec<u32>) {
        sharing(self.graphics, self.transfer)
    }
}

fn first_family(
    families: &[QueueFamilyInfo],
    pred: impl Fn(&QueueFamilyInfo) -> bool,
) -> Option<u32> {
    families.iter().position(pred).map(|index| index as u32)
}

fn sharing(a: u32, b: u32) -> (vk::SharingMode, Vec<u32>) {
    if a == b {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (vk::SharingMode::CONCURRENT, vec![a, b])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, present: bool) -> QueueFamilyInfo {
        QueueFamilyInfo { flags, present }
    }

    const GCT: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::GRAPHICS.as_raw()
            | vk::QueueFlags::COMPUTE.as_raw()
            | vk::QueueFlags::TRANSFER.as_raw(),
    );
    const CT: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::COMPUTE.as_raw() | vk::QueueFlags::TRANSFER.as_raw(),
    );

    #[test]
    fn single_universal_family() {
        let plan = QueuePlan::from_families(&[family(GCT, true)], false).unwrap();

        assert_eq!(plan, QueuePlan { graphics: 0, present: 0, transfer: 0 });
        assert_eq!(plan.unique_families(), vec![0]);
        assert!(!plan.has_separate_transfer());
        assert_eq!(plan.swapchain_sharing(), (vk::SharingMode::EXCLUSIVE, vec![]));
    }

    #[test]
    fn picks_transfer_family_without_graphics() {
        let families = [
            family(GCT, true),
            family(CT, false),
            family(vk::QueueFlags::TRANSFER, false),
        ];
        let plan = QueuePlan::from_families(&families, false).unwrap();

        assert_eq!(plan.transfer, 1);
        assert!(plan.has_separate_transfer());
        assert_eq!(plan.unique_families(), vec![0, 1]);
        assert_eq!(
            plan.resource_sharing(),
            (vk::SharingMode::CONCURRENT, vec![0, 1])
        );
    }

    #[test]
    fn forced_shared_transfer_aliases_graphics() {
        let families = [family(GCT, true), family(vk::QueueFlags::TRANSFER, false)];
        let plan = QueuePlan::from_families(&families, true).unwrap();

        assert_eq!(plan.transfer, plan.graphics);
        assert_eq!(plan.unique_families(), vec![0]);
    }

    #[test]
    fn separate_present_family_uses_concurrent_sharing() {
        let families = [family(GCT, false), family(vk::QueueFlags::TRANSFER, true)];
        let plan = QueuePlan::from_families(&families, false).unwrap();

        assert_eq!(plan.graphics, 0);
        assert_eq!(plan.present, 1);
        assert_eq!(plan.transfer, 1);
        assert_eq!(
            plan.swapchain_sharing(),
            (vk::SharingMode::CONCURRENT, vec![0, 1])
        );
        assert_eq!(plan.unique_families(), vec![0, 1]);
    }

    #[test]
    fn graphics_is_first_capable_family() {
        let families = [
            family(CT, false),
            family(GCT, true),
            family(GCT, true),
        ];
        let plan = QueuePlan::from_families(&families, false).unwrap();

        assert_eq!(plan.graphics, 1);
        assert_eq!(plan.present, 1);
        assert_eq!(plan.transfer, 0);
    }

    #[test]
    fn missing_graphics_or_present_fails() {
        let no_graphics = [family(CT, true)];
        assert!(matches!(
            QueuePlan::from_families(&no_graphics, false),
            Err(GpuError::NoSuitableGpu)
        ));

        let no_present = [family(GCT, false)];
        assert!(matches!(
            QueuePlan::from_families(&no_present, false),
            Err(GpuError::NoSuitableGpu)
        ));
    }
}
