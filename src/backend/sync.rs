// Synchronization primitives
//
// Per frame-in-flight fences and semaphores, plus the images-in-flight table.
// The fence of each slot bounds how far the CPU can run ahead of the GPU;
// the table stops two slots from rendering into the same swapchain image.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::gpu::{GpuDevice, Submission};
use crate::error::RendererError;

/// Frame synchronization - one per frame in flight
#[derive(Debug, Clone, Copy)]
pub struct FrameSlot {
    pub in_flight_fence: vk::Fence,
    pub image_available: vk::Semaphore,
    pub queue_complete: vk::Semaphore,
}

/// Result of a bounded fence wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceWait {
    Signaled,
    TimedOut,
}

pub struct FrameSynchronizer<D: GpuDevice> {
    slots: Vec<FrameSlot>,
    /// Swapchain image index -> fence of the slot last rendering into it.
    /// Entries never own the fence.
    images_in_flight: Vec<Option<vk::Fence>>,
    device: Arc<D>,
}

impl<D: GpuDevice> FrameSynchronizer<D> {
    pub fn new(device: Arc<D>, frames_in_flight: usize, image_count: usize) -> Result<Self> {
        let mut sync = Self {
            slots: Vec::with_capacity(frames_in_flight),
            images_in_flight: vec![None; image_count],
            device,
        };

        for _ in 0..frames_in_flight {
            let slot = sync.create_slot()?;
            sync.slots.push(slot);
        }

        log::info!("Created {} frame slots", frames_in_flight);
        Ok(sync)
    }

    fn create_slot(&self) -> Result<FrameSlot> {
        // Fences start signaled so the first wait on each slot returns at once
        let in_flight_fence = self
            .device
            .create_fence(true)
            .context("Failed to create in-flight fence")?;

        let image_available = match self.device.create_semaphore() {
            Ok(sem) => sem,
            Err(e) => {
                self.device.destroy_fence(in_flight_fence);
                return Err(e).context("Failed to create image-available semaphore");
            }
        };

        let queue_complete = match self.device.create_semaphore() {
            Ok(sem) => sem,
            Err(e) => {
                self.device.destroy_semaphore(image_available);
                self.device.destroy_fence(in_flight_fence);
                return Err(e).context("Failed to create queue-complete semaphore");
            }
        };

        Ok(FrameSlot {
            in_flight_fence,
            image_available,
            queue_complete,
        })
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> FrameSlot {
        self.slots[index % self.slots.len()]
    }

    pub fn image_fence(&self, image_index: u32) -> Option<vk::Fence> {
        self.images_in_flight
            .get(image_index as usize)
            .copied()
            .flatten()
    }

    fn wait(&self, fence: vk::Fence, timeout: u64) -> Result<FenceWait> {
        match self.device.wait_for_fence(fence, timeout) {
            Ok(()) => Ok(FenceWait::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(FenceWait::TimedOut),
            Err(e) => Err(e).context("Failed to wait for in-flight fence"),
        }
    }

    /// Block until the slot's previous submission has finished
    pub fn wait_for_slot(&self, slot: usize, timeout: u64) -> Result<FenceWait> {
        self.wait(self.slot(slot).in_flight_fence, timeout)
    }

    /// Block until whichever slot last rendered into `image_index` is done
    pub fn wait_for_image(&self, image_index: u32, timeout: u64) -> Result<FenceWait> {
        match self.image_fence(image_index) {
            Some(fence) => self.wait(fence, timeout),
            None => Ok(FenceWait::Signaled),
        }
    }

    /// Reset the slot fence, submit `cmd`, and record that the slot now owns
    /// `image_index`. A submission error is fatal.
    pub fn submit(&mut self, slot: usize, image_index: u32, cmd: vk::CommandBuffer) -> Result<()> {
        let frame = self.slot(slot);

        self.device
            .reset_fence(frame.in_flight_fence)
            .context("Failed to reset in-flight fence")?;

        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [cmd];
        let signal_semaphores = [frame.queue_complete];

        let submission = Submission {
            wait_semaphores: &wait_semaphores,
            wait_stages: &wait_stages,
            command_buffers: &command_buffers,
            signal_semaphores: &signal_semaphores,
        };

        self.device
            .queue_submit(&submission, frame.in_flight_fence)
            .map_err(|e| {
                log::error!("Queue submission failed: {:?}", e);
                RendererError::SubmitFailed(e)
            })?;

        if let Some(entry) = self.images_in_flight.get_mut(image_index as usize) {
            *entry = Some(frame.in_flight_fence);
        }
        Ok(())
    }

    /// Replace the images-in-flight table after a swapchain rebuild
    pub fn reset_images(&mut self, image_count: usize) {
        self.images_in_flight = vec![None; image_count];
    }

    /// Swap in a fresh image-available semaphore for `slot`. Used when an
    /// acquire signaled it but the frame was abandoned before any submit
    /// waited on it. The device must be idle.
    pub fn refresh_image_available(&mut self, slot: usize) -> Result<()> {
        let index = slot % self.slots.len();
        let fresh = self
            .device
            .create_semaphore()
            .context("Failed to create image-available semaphore")?;
        let stale = std::mem::replace(&mut self.slots[index].image_available, fresh);
        self.device.destroy_semaphore(stale);
        Ok(())
    }
}

impl<D: GpuDevice> Drop for FrameSynchronizer<D> {
    fn drop(&mut self) {
        for slot in self.slots.drain(..) {
            self.device.destroy_semaphore(slot.image_available);
            self.device.destroy_semaphore(slot.queue_complete);
            self.device.destroy_fence(slot.in_flight_fence);
        }
    }
}
