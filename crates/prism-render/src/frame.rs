//! Per-frame acquire, submit and present with `F` frames in flight.
//!
//! One frame runs these steps:
//!
//! 1. wait for the current slot's fence,
//! 2. acquire a swapchain image (an out-of-date swapchain ends the frame
//!    here, before anything is submitted),
//! 3. wait for the fence of the slot that last rendered into that image,
//! 4. update the image's uniforms,
//! 5. pin the image to the current slot's fence,
//! 6. reset the fence,
//! 7. submit the image's command buffer,
//! 8. present, noting whether the swapchain needs rebuilding,
//! 9. move to the next slot.
//!
//! The steps live in [`run_frame`], generic over [`FrameBackend`], so they
//! can be driven by a simulated GPU in tests.

use ash::vk;
use prism_gpu::command::submit_frame;
use prism_gpu::sync::{reset_fence, wait_for_fence, InFlightTracker};
use prism_gpu::{FrameSyncManager, GpuContext, GpuError, Swapchain};

use crate::error::Result;

/// What the caller should do after [`FrameScheduler::draw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was submitted and presented. `needs_reset` is set when the
    /// swapchain reported itself stale or the window was resized.
    Presented { image: u32, needs_reset: bool },
    /// The swapchain was out of date at acquire; nothing was submitted.
    AcquireFailed,
}

/// Result of one call to the renderer's draw entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// A frame reached the presentation engine.
    Presented,
    /// The frame was dropped to rebuild the swapchain.
    Skipped,
    /// The window has no area; nothing was drawn.
    Minimized,
    /// The window asked to close; the device is idle.
    ShutdownRequested,
}

/// GPU operations one frame needs.
pub trait FrameBackend {
    type Fence: Copy + Eq;

    fn wait_fence(&mut self, fence: Self::Fence) -> prism_gpu::Result<()>;
    fn reset_fence(&mut self, fence: Self::Fence) -> prism_gpu::Result<()>;
    /// Image index and whether the swapchain is suboptimal.
    fn acquire(&mut self) -> prism_gpu::Result<(u32, bool)>;
    fn update_uniforms(&mut self, image: u32) -> Result<()>;
    fn submit(&mut self, image: u32, fence: Self::Fence) -> prism_gpu::Result<()>;
    /// Whether the swapchain is suboptimal.
    fn present(&mut self, image: u32) -> prism_gpu::Result<bool>;
}

/// Run steps 1 to 8 for the slot owning `fence`.
///
/// Surface invalidation at acquire returns [`FrameOutcome::AcquireFailed`]
/// with the fence still signalled; at present it sets `needs_reset`. Other
/// errors propagate.
pub fn run_frame<B: FrameBackend>(
    backend: &mut B,
    fence: B::Fence,
    images_in_flight: &mut InFlightTracker<B::Fence>,
    resize_requested: bool,
) -> Result<FrameOutcome> {
    backend.wait_fence(fence)?;

    let (image, acquire_suboptimal) = match backend.acquire() {
        Ok(acquired) => acquired,
        Err(e) if e.is_surface_invalidation() => return Ok(FrameOutcome::AcquireFailed),
        Err(e) => return Err(e.into()),
    };

    if let Some(previous) = images_in_flight.get(image as usize) {
        if previous != fence {
            backend.wait_fence(previous)?;
        }
    }

    backend.update_uniforms(image)?;

    images_in_flight.claim(image as usize, fence);
    backend.reset_fence(fence)?;
    backend.submit(image, fence)?;

    let present_stale = match backend.present(image) {
        Ok(suboptimal) => suboptimal,
        Err(e) if e.is_surface_invalidation() => true,
        Err(e) => return Err(e.into()),
    };

    Ok(FrameOutcome::Presented {
        image,
        needs_reset: acquire_suboptimal || present_stale || resize_requested,
    })
}

struct VulkanFrame<'a, U> {
    ctx: &'a GpuContext,
    swapchain: &'a Swapchain,
    command_buffers: &'a [vk::CommandBuffer],
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    update: U,
}

impl<U> FrameBackend for VulkanFrame<'_, U>
where
    U: FnMut(u32) -> Result<()>,
{
    type Fence = vk::Fence;

    fn wait_fence(&mut self, fence: vk::Fence) -> prism_gpu::Result<()> {
        unsafe { wait_for_fence(self.ctx.device(), fence) }
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> prism_gpu::Result<()> {
        unsafe { reset_fence(self.ctx.device(), fence) }
    }

    fn acquire(&mut self) -> prism_gpu::Result<(u32, bool)> {
        let loader = self.ctx.swapchain_loader()?;
        unsafe { self.swapchain.acquire_next_image(loader, self.image_available) }
    }

    fn update_uniforms(&mut self, image: u32) -> Result<()> {
        (self.update)(image)
    }

    fn submit(&mut self, image: u32, fence: vk::Fence) -> prism_gpu::Result<()> {
        let command_buffer = self
            .command_buffers
            .get(image as usize)
            .copied()
            .ok_or_else(|| GpuError::InvalidState(format!("no command buffer for image {image}")))?;
        unsafe {
            submit_frame(
                self.ctx.device(),
                self.ctx.graphics_queue(),
                command_buffer,
                self.image_available,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                self.render_finished,
                fence,
            )
        }
    }

    fn present(&mut self, image: u32) -> prism_gpu::Result<bool> {
        let loader = self.ctx.swapchain_loader()?;
        unsafe {
            self.swapchain
                .present(loader, self.ctx.present_queue(), image, self.render_finished)
        }
    }
}

/// Owns the fence and semaphore ring and runs frames against a swapchain.
pub struct FrameScheduler {
    sync: FrameSyncManager,
}

impl FrameScheduler {
    /// Create `frames_in_flight` slots for a swapchain of `image_count`
    /// images.
    pub fn new(ctx: &GpuContext, frames_in_flight: usize, image_count: usize) -> Result<Self> {
        let sync = unsafe { FrameSyncManager::new(ctx.device(), frames_in_flight, image_count)? };
        tracing::info!("Frames in flight: {}", sync.frames_in_flight());
        Ok(Self { sync })
    }

    pub fn frames_in_flight(&self) -> usize {
        self.sync.frames_in_flight()
    }

    pub fn current_frame(&self) -> usize {
        self.sync.current_frame()
    }

    /// Per-image fence slots.
    pub fn images_in_flight(&self) -> &InFlightTracker<vk::Fence> {
        self.sync.images_in_flight()
    }

    /// Forget every image pin after the swapchain was rebuilt with
    /// `image_count` images. The device must be idle.
    pub fn reset_images(&mut self, image_count: usize) {
        self.sync.images_in_flight_mut().reset(image_count);
    }

    /// Draw one frame. `update` writes the uniforms of the acquired image.
    pub fn draw(
        &mut self,
        ctx: &GpuContext,
        swapchain: &Swapchain,
        command_buffers: &[vk::CommandBuffer],
        resize_requested: bool,
        update: impl FnMut(u32) -> Result<()>,
    ) -> Result<FrameOutcome> {
        let current = self.sync.current();
        let fence = current.in_flight;
        let mut backend = VulkanFrame {
            ctx,
            swapchain,
            command_buffers,
            image_available: current.image_available,
            render_finished: current.render_finished,
            update,
        };

        let outcome = run_frame(
            &mut backend,
            fence,
            self.sync.images_in_flight_mut(),
            resize_requested,
        )?;
        if let FrameOutcome::Presented { .. } = outcome {
            self.sync.advance();
        }
        Ok(outcome)
    }

    /// Destroy the ring. The device must be idle.
    pub fn destroy(&mut self, ctx: &GpuContext) {
        unsafe { self.sync.destroy(ctx.device()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_gpu::sync::FrameCursor;

    /// A GPU where each submit completes when its fence is waited on.
    #[derive(Default)]
    struct SimulatedGpu {
        /// Fence index -> signalled.
        signalled: Vec<bool>,
        /// Images handed out by acquire, in order.
        acquire_script: Vec<prism_gpu::Result<(u32, bool)>>,
        present_script: Vec<prism_gpu::Result<bool>>,
        /// Fence index -> image whose frame is pending on it.
        pending_image: Vec<Option<u32>>,
        submits: Vec<(u32, usize)>,
        presents: Vec<u32>,
        uniform_updates: Vec<u32>,
        /// Images with a submitted frame that has not completed.
        busy_images: Vec<u32>,
    }

    impl SimulatedGpu {
        fn new(frames: usize) -> Self {
            Self {
                signalled: vec![true; frames],
                pending_image: vec![None; frames],
                ..Self::default()
            }
        }
    }

    impl FrameBackend for SimulatedGpu {
        type Fence = usize;

        fn wait_fence(&mut self, fence: usize) -> prism_gpu::Result<()> {
            if let Some(image) = self.pending_image[fence].take() {
                self.busy_images.retain(|&i| i != image);
            }
            self.signalled[fence] = true;
            Ok(())
        }

        fn reset_fence(&mut self, fence: usize) -> prism_gpu::Result<()> {
            assert!(self.signalled[fence], "reset of an unsignalled fence");
            self.signalled[fence] = false;
            Ok(())
        }

        fn acquire(&mut self) -> prism_gpu::Result<(u32, bool)> {
            self.acquire_script.remove(0)
        }

        fn update_uniforms(&mut self, image: u32) -> Result<()> {
            assert!(
                !self.busy_images.contains(&image),
                "uniforms of image {image} written while the GPU may read them"
            );
            self.uniform_updates.push(image);
            Ok(())
        }

        fn submit(&mut self, image: u32, fence: usize) -> prism_gpu::Result<()> {
            assert!(!self.signalled[fence], "submit with a signalled fence");
            assert!(
                !self.busy_images.contains(&image),
                "image {image} submitted while still in flight"
            );
            self.pending_image[fence] = Some(image);
            self.busy_images.push(image);
            self.submits.push((image, fence));
            Ok(())
        }

        fn present(&mut self, image: u32) -> prism_gpu::Result<bool> {
            self.presents.push(image);
            if self.present_script.is_empty() {
                Ok(false)
            } else {
                self.present_script.remove(0)
            }
        }
    }

    fn drive(
        gpu: &mut SimulatedGpu,
        cursor: &mut FrameCursor,
        tracker: &mut InFlightTracker<usize>,
        frames: usize,
    ) -> Vec<FrameOutcome> {
        (0..frames)
            .map(|_| {
                let outcome = run_frame(gpu, cursor.current(), tracker, false).unwrap();
                if matches!(outcome, FrameOutcome::Presented { .. }) {
                    cursor.advance();
                }
                outcome
            })
            .collect()
    }

    #[test]
    fn single_frame_presents_acquired_image() {
        let mut gpu = SimulatedGpu::new(2);
        gpu.acquire_script = vec![Ok((1, false))];
        let mut cursor = FrameCursor::new(2);
        let mut tracker = InFlightTracker::new(3);

        let outcomes = drive(&mut gpu, &mut cursor, &mut tracker, 1);

        assert_eq!(
            outcomes,
            vec![FrameOutcome::Presented {
                image: 1,
                needs_reset: false
            }]
        );
        assert_eq!(gpu.submits, vec![(1, 0)]);
        assert_eq!(gpu.presents, vec![1]);
        assert_eq!(tracker.get(1), Some(0));
        assert_eq!(cursor.current(), 1);
    }

    #[test]
    fn out_of_date_acquire_skips_submit_and_keeps_fence_signalled() {
        let mut gpu = SimulatedGpu::new(2);
        gpu.acquire_script = vec![Err(GpuError::OutOfDate)];
        let mut cursor = FrameCursor::new(2);
        let mut tracker = InFlightTracker::new(3);

        let outcomes = drive(&mut gpu, &mut cursor, &mut tracker, 1);

        assert_eq!(outcomes, vec![FrameOutcome::AcquireFailed]);
        assert!(gpu.submits.is_empty());
        assert!(gpu.presents.is_empty());
        assert!(gpu.signalled.iter().all(|&s| s));
        assert_eq!(cursor.current(), 0);
    }

    #[test]
    fn suboptimal_or_out_of_date_present_requests_reset() {
        let mut gpu = SimulatedGpu::new(2);
        gpu.acquire_script = vec![Ok((0, false)), Ok((1, false)), Ok((2, true))];
        gpu.present_script = vec![Ok(true), Err(GpuError::OutOfDate), Ok(false)];
        let mut cursor = FrameCursor::new(2);
        let mut tracker = InFlightTracker::new(3);

        let outcomes = drive(&mut gpu, &mut cursor, &mut tracker, 3);

        let resets: Vec<bool> = outcomes
            .iter()
            .map(|o| matches!(o, FrameOutcome::Presented { needs_reset: true, .. }))
            .collect();
        assert_eq!(resets, vec![true, true, true]);
        assert_eq!(gpu.submits.len(), 3);
    }

    #[test]
    fn resize_flag_requests_reset() {
        let mut gpu = SimulatedGpu::new(2);
        gpu.acquire_script = vec![Ok((0, false))];
        let mut tracker = InFlightTracker::new(2);

        let outcome = run_frame(&mut gpu, 0, &mut tracker, true).unwrap();
        assert_eq!(
            outcome,
            FrameOutcome::Presented {
                image: 0,
                needs_reset: true
            }
        );
    }

    #[test]
    fn other_errors_propagate() {
        let mut gpu = SimulatedGpu::new(1);
        gpu.acquire_script = vec![Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST))];
        let mut tracker = InFlightTracker::new(2);

        assert!(run_frame(&mut gpu, 0, &mut tracker, false).is_err());
    }

    #[test]
    fn fewer_images_than_frames_never_overlap() {
        // Three slots over two images: image reuse must wait on the other
        // slot's fence.
        let mut gpu = SimulatedGpu::new(3);
        gpu.acquire_script = (0..12).map(|i| Ok((i % 2, false))).collect();
        let mut cursor = FrameCursor::new(3);
        let mut tracker = InFlightTracker::new(2);

        let outcomes = drive(&mut gpu, &mut cursor, &mut tracker, 12);

        assert_eq!(outcomes.len(), 12);
        assert_eq!(gpu.submits.len(), 12);
        assert_eq!(gpu.uniform_updates.len(), 12);
    }

    #[test]
    fn more_images_than_frames_cycle_slots() {
        let mut gpu = SimulatedGpu::new(2);
        gpu.acquire_script = (0..9).map(|i| Ok(((i * 2) % 3, false))).collect();
        let mut cursor = FrameCursor::new(2);
        let mut tracker = InFlightTracker::new(3);

        drive(&mut gpu, &mut cursor, &mut tracker, 9);

        let fences: Vec<usize> = gpu.submits.iter().map(|&(_, fence)| fence).collect();
        assert_eq!(fences, vec![0, 1, 0, 1, 0, 1, 0, 1, 0]);
    }
}
