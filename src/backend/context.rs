// Graphics context - frame lifecycle
//
// Owns everything that has to agree about the current swapchain: the chain
// itself, its framebuffers, the per-image command buffers, and the frame
// synchronizer. A resize only bumps a generation counter; the rebuild happens
// at the top of the next `begin_frame`, and that frame is skipped.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::command::{CommandBuffer, CommandPool};
use super::gpu::GpuDevice;
use super::render_target::RenderTarget;
use super::swapchain::{AcquireResult, PresentResult, Swapchain};
use super::sync::{FenceWait, FrameSynchronizer};
use crate::config::Config;
use crate::error::RendererError;
use crate::renderer::types::{FrameStatus, SkipReason};

pub struct GraphicsContext<D: GpuDevice> {
    // Declaration order is drop order
    sync: FrameSynchronizer<D>,
    commands: CommandPool<D>,
    pub render_target: RenderTarget<D>,
    pub swapchain: Swapchain<D>,
    device: Arc<D>,

    fence_timeout: u64,
    frames_in_flight: usize,
    current_frame: usize,
    image_index: u32,
    /// Image acquired by a frame that was then abandoned before submit
    pending_image: Option<u32>,
    frame_in_progress: bool,
    recreating_swapchain: bool,

    framebuffer_width: u32,
    framebuffer_height: u32,
    framebuffer_size_generation: u64,
    framebuffer_size_last_generation: u64,
}

impl<D: GpuDevice> GraphicsContext<D> {
    pub fn new(device: Arc<D>, width: u32, height: u32, config: &Config) -> Result<Self> {
        let requested_frames = config.graphics.max_frames_in_flight.max(1);

        let swapchain = Swapchain::new(
            device.clone(),
            width,
            height,
            config.present_mode(),
            requested_frames,
        )?;
        let image_count = swapchain.image_count();
        let frames_in_flight = requested_frames.min(image_count);

        let mut render_target = RenderTarget::new(
            device.clone(),
            swapchain.format,
            config.graphics.clear_color,
        )?;
        render_target.rebuild(&swapchain)?;

        let mut commands = CommandPool::new(device.clone())?;
        commands.rebuild(image_count)?;

        let sync = FrameSynchronizer::new(device.clone(), frames_in_flight, image_count)?;

        log::info!(
            "Graphics context ready: {} frames in flight over {} swapchain images",
            frames_in_flight,
            image_count
        );

        Ok(Self {
            sync,
            commands,
            render_target,
            swapchain,
            device,
            fence_timeout: config.fence_timeout(),
            frames_in_flight,
            current_frame: 0,
            image_index: 0,
            pending_image: None,
            frame_in_progress: false,
            recreating_swapchain: false,
            framebuffer_width: width,
            framebuffer_height: height,
            framebuffer_size_generation: 0,
            framebuffer_size_last_generation: 0,
        })
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn commands(&self) -> &CommandPool<D> {
        &self.commands
    }

    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    pub fn image_count(&self) -> usize {
        self.swapchain.image_count()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    /// (size generation, generation the swapchain was last built for)
    pub fn generations(&self) -> (u64, u64) {
        (
            self.framebuffer_size_generation,
            self.framebuffer_size_last_generation,
        )
    }

    pub fn frame_in_progress(&self) -> bool {
        self.frame_in_progress
    }

    /// Record the new framebuffer size. GPU resources are left alone until
    /// the next `begin_frame`.
    pub fn on_resized(&mut self, width: u32, height: u32) {
        self.framebuffer_width = width;
        self.framebuffer_height = height;
        self.framebuffer_size_generation = self.framebuffer_size_generation.wrapping_add(1);
        log::debug!(
            "Framebuffer resized to {}x{} (generation {})",
            width,
            height,
            self.framebuffer_size_generation
        );
    }

    /// Ask for a rebuild at the current size on the next frame
    fn request_rebuild(&mut self) {
        self.framebuffer_size_generation = self.framebuffer_size_generation.wrapping_add(1);
    }

    /// Tear down and rebuild the swapchain and everything sized by it.
    /// Returns `Ok(false)` when a rebuild is already running or the
    /// framebuffer has a zero dimension; nothing is touched in that case.
    pub fn recreate_swapchain(&mut self) -> Result<bool> {
        if self.recreating_swapchain {
            log::debug!("Swapchain recreation already in progress");
            return Ok(false);
        }
        let (width, height) = (self.framebuffer_width, self.framebuffer_height);
        if width == 0 || height == 0 {
            log::debug!("Framebuffer is {}x{}, not recreating swapchain", width, height);
            return Ok(false);
        }

        self.recreating_swapchain = true;
        let result = self.rebuild_swapchain_resources(width, height);
        self.recreating_swapchain = false;
        result?;

        self.framebuffer_size_last_generation = self.framebuffer_size_generation;
        log::info!("Swapchain recreated at {}x{}", width, height);
        Ok(true)
    }

    fn rebuild_swapchain_resources(&mut self, width: u32, height: u32) -> Result<()> {
        // Non-cancellable stall: in-flight work finishes before anything dies
        self.device
            .wait_idle()
            .context("Failed to wait for device idle before swapchain rebuild")?;

        self.render_target.release();
        self.swapchain.recreate(width, height)?;
        self.render_target.rebuild(&self.swapchain)?;

        let image_count = self.swapchain.image_count();
        self.commands.rebuild(image_count)?;
        self.sync.reset_images(image_count);

        if self.pending_image.take().is_some() {
            self.sync.refresh_image_available(self.current_frame)?;
        }
        Ok(())
    }

    /// Wait for the frame slot, acquire an image and start recording.
    pub fn begin_frame(&mut self) -> Result<FrameStatus> {
        if self.frame_in_progress {
            anyhow::bail!("begin_frame called while a frame is already being recorded");
        }

        if self.recreating_swapchain {
            self.device
                .wait_idle()
                .context("Failed to wait for device idle")?;
            log::info!("Swapchain is being recreated, skipping frame");
            return Ok(FrameStatus::Skipped(SkipReason::Recreating));
        }

        if self.framebuffer_size_generation != self.framebuffer_size_last_generation {
            self.device
                .wait_idle()
                .context("Failed to wait for device idle")?;
            if !self.recreate_swapchain()? {
                return Ok(FrameStatus::Skipped(SkipReason::NotReady));
            }
            return Ok(FrameStatus::Skipped(SkipReason::Resized));
        }

        // Backpressure: this slot's previous submission must be finished
        if self.sync.wait_for_slot(self.current_frame, self.fence_timeout)? == FenceWait::TimedOut {
            log::warn!("In-flight fence wait timed out on frame {}", self.current_frame);
            return Ok(FrameStatus::Skipped(SkipReason::FenceTimeout));
        }

        let image_index = match self.pending_image {
            Some(image_index) => image_index,
            None => {
                let slot = self.sync.slot(self.current_frame);
                match self
                    .swapchain
                    .acquire_next_image(self.fence_timeout, slot.image_available)?
                {
                    AcquireResult::Acquired {
                        image_index,
                        suboptimal,
                    } => {
                        if suboptimal {
                            self.request_rebuild();
                        }
                        image_index
                    }
                    AcquireResult::OutOfDate => {
                        log::debug!("Swapchain out of date on acquire");
                        self.recreate_swapchain()?;
                        return Ok(FrameStatus::Skipped(SkipReason::OutOfDate));
                    }
                    AcquireResult::NotReady => {
                        return Ok(FrameStatus::Skipped(SkipReason::ImageUnavailable));
                    }
                }
            }
        };

        // The image may still be in use by a different slot
        if self.sync.wait_for_image(image_index, self.fence_timeout)? == FenceWait::TimedOut {
            log::warn!("Fence for swapchain image {} timed out", image_index);
            self.pending_image = Some(image_index);
            return Ok(FrameStatus::Skipped(SkipReason::FenceTimeout));
        }
        self.pending_image = None;
        self.image_index = image_index;

        self.record_frame_start(image_index)?;
        self.frame_in_progress = true;
        Ok(FrameStatus::Ready)
    }

    fn record_frame_start(&mut self, image_index: u32) -> Result<()> {
        let extent = self.swapchain.extent;
        let framebuffer = self
            .render_target
            .framebuffer(image_index)
            .with_context(|| format!("No framebuffer for swapchain image {}", image_index))?;
        let clear_values = self.render_target.clear_values();

        let device = self.device.as_ref();
        let cmd = self.commands.for_image(image_index as usize)?;
        cmd.reset(device)?;
        cmd.begin(device, vk::CommandBufferUsageFlags::empty())?;

        // Y-flipped so +Y points up in clip space
        let viewport = vk::Viewport {
            x: 0.0,
            y: extent.height as f32,
            width: extent.width as f32,
            height: -(extent.height as f32),
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        device.cmd_set_viewport(cmd.handle, viewport);
        device.cmd_set_scissor(cmd.handle, scissor);

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_target.render_pass)
            .framebuffer(framebuffer)
            .render_area(scissor)
            .clear_values(&clear_values);
        cmd.begin_render_pass(device, &render_pass_info)
    }

    /// The command buffer of the frame being recorded
    pub fn frame_command_buffer(&self) -> Result<&CommandBuffer, RendererError> {
        if !self.frame_in_progress {
            return Err(RendererError::NoFrameInProgress);
        }
        self.commands
            .get(self.image_index as usize)
            .ok_or(RendererError::NoFrameInProgress)
    }

    /// Finish recording, submit, present, and advance to the next slot.
    pub fn end_frame(&mut self) -> Result<()> {
        if !self.frame_in_progress {
            return Err(RendererError::NoFrameInProgress.into());
        }
        self.frame_in_progress = false;

        let device = self.device.as_ref();
        let image_index = self.image_index;
        let cmd = self.commands.for_image(image_index as usize)?;
        cmd.end_render_pass(device)?;
        cmd.end(device)?;

        self.sync.submit(self.current_frame, image_index, cmd.handle)?;
        cmd.mark_submitted()?;

        let slot = self.sync.slot(self.current_frame);
        if self.swapchain.present(image_index, slot.queue_complete)? == PresentResult::NeedsRebuild {
            log::debug!("Swapchain needs rebuild after present");
            self.request_rebuild();
        }

        self.current_frame = (self.current_frame + 1) % self.frames_in_flight;
        Ok(())
    }
}

impl<D: GpuDevice> Drop for GraphicsContext<D> {
    fn drop(&mut self) {
        log::info!("Destroying graphics context...");
        if let Err(e) = self.device.wait_idle() {
            log::error!("Device idle wait failed during shutdown: {:?}", e);
        }
    }
}
