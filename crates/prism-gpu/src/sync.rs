//! Synchronization primitives.

use crate::error::Result;
use ash::vk;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = device.create_semaphore(&create_info, None)?;
    Ok(semaphore)
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = device.create_fence(&create_info, None)?;
    Ok(fence)
}

/// Wait for a fence to be signaled, without timeout.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn wait_for_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device.wait_for_fences(&[fence], true, u64::MAX)?;
    Ok(())
}

/// Reset a fence to unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device.reset_fences(&[fence])?;
    Ok(())
}

/// Synchronization objects of one frame slot.
pub struct FrameSync {
    /// Semaphore signaled when image is available
    pub image_available: vk::Semaphore,
    /// Semaphore signaled when rendering is complete
    pub render_finished: vk::Semaphore,
    /// Fence signaled when the slot's last submit has completed
    pub in_flight: vk::Fence,
}

impl FrameSync {
    /// Create frame synchronization resources. The fence starts signaled.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        let image_available = create_semaphore(device)?;
        let render_finished = match create_semaphore(device) {
            Ok(semaphore) => semaphore,
            Err(e) => {
                device.destroy_semaphore(image_available, None);
                return Err(e);
            }
        };
        let in_flight = match create_fence(device, true) {
            Ok(fence) => fence,
            Err(e) => {
                device.destroy_semaphore(image_available, None);
                device.destroy_semaphore(render_finished, None);
                return Err(e);
            }
        };

        Ok(Self {
            image_available,
            render_finished,
            in_flight,
        })
    }

    /// Destroy synchronization resources.
    ///
    /// # Safety
    /// The device must be valid and resources must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_semaphore(self.image_available, None);
        device.destroy_semaphore(self.render_finished, None);
        device.destroy_fence(self.in_flight, None);
    }
}

/// Round-robin cursor over `F` frame slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCursor {
    current: usize,
    count: usize,
}

impl FrameCursor {
    /// Cursor over `count` slots, starting at slot 0. `count` is at least 1.
    pub fn new(count: usize) -> Self {
        Self {
            current: 0,
            count: count.max(1),
        }
    }

    /// Current slot.
    pub fn current(&self) -> usize {
        self.current
    }

    /// Number of slots.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Move to the next slot, wrapping around.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.count;
    }
}

/// Per swapchain image: the fence of the frame slot that last rendered into
/// it, if any.
///
/// Generic over the fence type so the bookkeeping can be exercised without
/// a device.
#[derive(Debug, Clone)]
pub struct InFlightTracker<F> {
    slots: Vec<Option<F>>,
}

impl<F: Copy + Eq> InFlightTracker<F> {
    /// Tracker for `image_count` images, all free.
    pub fn new(image_count: usize) -> Self {
        Self {
            slots: vec![None; image_count],
        }
    }

    /// Number of tracked images.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no images are tracked.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Fence currently pinning `image`.
    pub fn get(&self, image: usize) -> Option<F> {
        self.slots.get(image).copied().flatten()
    }

    /// Pin `image` to `fence`, returning the fence that pinned it before.
    pub fn claim(&mut self, image: usize, fence: F) -> Option<F> {
        self.slots.get_mut(image).and_then(|slot| slot.replace(fence))
    }

    /// Forget all pins and resize to `image_count` images.
    pub fn reset(&mut self, image_count: usize) {
        self.slots.clear();
        self.slots.resize(image_count, None);
    }
}

/// Fence and semaphore ring for `F` frames in flight plus the per-image
/// fence slots.
pub struct FrameSyncManager {
    frames: Vec<FrameSync>,
    cursor: FrameCursor,
    images_in_flight: InFlightTracker<vk::Fence>,
}

impl FrameSyncManager {
    /// Create `frames_in_flight` slots and track `image_count` images.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        frames_in_flight: usize,
        image_count: usize,
    ) -> Result<Self> {
        let frames_in_flight = frames_in_flight.max(1);
        let mut frames = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            match FrameSync::new(device) {
                Ok(sync) => frames.push(sync),
                Err(e) => {
                    for sync in &frames {
                        sync.destroy(device);
                    }
                    return Err(e);
                }
            }
        }

        tracing::debug!("Created synchronization for {frames_in_flight} frames in flight");

        Ok(Self {
            frames,
            cursor: FrameCursor::new(frames_in_flight),
            images_in_flight: InFlightTracker::new(image_count),
        })
    }

    /// Get the current frame's sync resources.
    pub fn current(&self) -> &FrameSync {
        &self.frames[self.cursor.current()]
    }

    /// Current frame slot index.
    pub fn current_frame(&self) -> usize {
        self.cursor.current()
    }

    /// Number of frames in flight.
    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    /// Advance to the next frame slot.
    pub fn advance(&mut self) {
        self.cursor.advance();
    }

    /// Per-image fence slots.
    pub fn images_in_flight(&self) -> &InFlightTracker<vk::Fence> {
        &self.images_in_flight
    }

    /// Mutable per-image fence slots.
    pub fn images_in_flight_mut(&mut self) -> &mut InFlightTracker<vk::Fence> {
        &mut self.images_in_flight
    }

    /// Destroy all resources.
    ///
    /// # Safety
    /// The device must be valid and all resources must not be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for sync in self.frames.drain(..) {
            sync.destroy(device);
        }
        self.images_in_flight.reset(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_wraps() {
        let mut cursor = FrameCursor::new(2);
        let visited: Vec<usize> = (0..5)
            .map(|_| {
                let current = cursor.current();
                cursor.advance();
                current
            })
            .collect();
        assert_eq!(visited, vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn cursor_never_has_zero_slots() {
        let mut cursor = FrameCursor::new(0);
        cursor.advance();
        assert_eq!(cursor.count(), 1);
        assert_eq!(cursor.current(), 0);
    }

    #[test]
    fn claim_returns_previous_fence() {
        let mut tracker: InFlightTracker<u64> = InFlightTracker::new(3);

        assert_eq!(tracker.claim(1, 10), None);
        assert_eq!(tracker.get(1), Some(10));
        assert_eq!(tracker.claim(1, 11), Some(10));
        assert_eq!(tracker.get(0), None);
        assert_eq!(tracker.claim(7, 1), None);
    }

    #[test]
    fn reset_clears_and_resizes() {
        let mut tracker: InFlightTracker<u64> = InFlightTracker::new(2);
        tracker.claim(0, 1);
        tracker.reset(4);

        assert_eq!(tracker.len(), 4);
        assert!((0..4).all(|i| tracker.get(i).is_none()));
    }

    /// Simulated GPU: each frame slot's fence is "signalled" once the frame
    /// submitted on it retires. Frame k+F on a slot may only start after the
    /// frame k on that slot, and any frame reusing an image must first see
    /// that image's previous fence signalled.
    #[test]
    fn image_reuse_waits_for_previous_fence() {
        for (frames, images) in [(2usize, 3usize), (3, 2), (2, 2), (1, 4)] {
            let mut cursor = FrameCursor::new(frames);
            let mut tracker: InFlightTracker<usize> = InFlightTracker::new(images);
            // Frame number currently pending on each slot's fence.
            let mut pending: Vec<Option<u32>> = vec![None; frames];
            // Frame number that last rendered into each image.
            let mut last_frame_in_image: Vec<Option<u32>> = vec![None; images];

            for frame in 0..40u32 {
                let slot = cursor.current();
                // Step 1: wait on the slot's fence.
                pending[slot] = None;

                // Step 2: the presentation engine hands images out round-robin.
                let image = (frame as usize * 7 + 3) % images;

                // Step 3: wait on the image's fence.
                if let Some(fence_slot) = tracker.get(image) {
                    pending[fence_slot] = None;
                }
                // The previous frame that used this image must be retired.
                if let Some(previous) = last_frame_in_image[image] {
                    assert!(
                        pending.iter().all(|p| *p != Some(previous)),
                        "frame {frame} reused image {image} before frame {previous} finished"
                    );
                }

                // Steps 5-7: claim the image, reset and submit.
                tracker.claim(image, slot);
                pending[slot] = Some(frame);
                last_frame_in_image[image] = Some(frame);

                cursor.advance();
            }
        }
    }
}
