// Command pool and command buffer state tracking
//
// Each command buffer carries an explicit state so recording calls made in
// the wrong order fail loudly instead of producing invalid Vulkan usage:
//
//   NotAllocated -> Ready -> Recording <-> InRenderPass
//                     ^         |
//                     |         v
//                 Submitted <- Recorded

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::gpu::{GpuDevice, Submission};
use crate::error::RendererError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    NotAllocated,
    Ready,
    Recording,
    InRenderPass,
    Recorded,
    Submitted,
}

#[derive(Debug)]
pub struct CommandBuffer {
    pub handle: vk::CommandBuffer,
    state: CommandBufferState,
}

impl CommandBuffer {
    fn allocated(handle: vk::CommandBuffer) -> Self {
        Self {
            handle,
            state: CommandBufferState::Ready,
        }
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    fn advance(
        &mut self,
        action: &'static str,
        allowed: &[CommandBufferState],
        next: CommandBufferState,
    ) -> Result<(), RendererError> {
        if !allowed.contains(&self.state) {
            return Err(RendererError::InvalidCommandBufferState {
                action,
                state: self.state,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Fail unless the buffer is in `expected`
    pub fn require(
        &self,
        action: &'static str,
        expected: CommandBufferState,
    ) -> Result<(), RendererError> {
        if self.state != expected {
            return Err(RendererError::InvalidCommandBufferState {
                action,
                state: self.state,
            });
        }
        Ok(())
    }

    /// Return to Ready. Callers must have observed the fence guarding a
    /// submitted buffer before resetting it.
    pub fn reset<D: GpuDevice>(&mut self, device: &D) -> Result<()> {
        use CommandBufferState::*;
        self.advance("reset", &[Ready, Recorded, Submitted], Ready)?;
        device
            .reset_command_buffer(self.handle)
            .context("Failed to reset command buffer")
    }

    pub fn begin<D: GpuDevice>(
        &mut self,
        device: &D,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        self.advance(
            "begin",
            &[CommandBufferState::Ready],
            CommandBufferState::Recording,
        )?;
        device
            .begin_command_buffer(self.handle, flags)
            .context("Failed to begin command buffer")
    }

    pub fn begin_render_pass<D: GpuDevice>(
        &mut self,
        device: &D,
        info: &vk::RenderPassBeginInfo,
    ) -> Result<()> {
        self.advance(
            "begin a render pass",
            &[CommandBufferState::Recording],
            CommandBufferState::InRenderPass,
        )?;
        device.cmd_begin_render_pass(self.handle, info);
        Ok(())
    }

    pub fn end_render_pass<D: GpuDevice>(&mut self, device: &D) -> Result<()> {
        self.advance(
            "end a render pass",
            &[CommandBufferState::InRenderPass],
            CommandBufferState::Recording,
        )?;
        device.cmd_end_render_pass(self.handle);
        Ok(())
    }

    pub fn end<D: GpuDevice>(&mut self, device: &D) -> Result<()> {
        self.advance(
            "end",
            &[CommandBufferState::Recording],
            CommandBufferState::Recorded,
        )?;
        device
            .end_command_buffer(self.handle)
            .context("Failed to end command buffer")
    }

    pub fn mark_submitted(&mut self) -> Result<(), RendererError> {
        self.advance(
            "submit",
            &[CommandBufferState::Recorded],
            CommandBufferState::Submitted,
        )
    }
}

/// Command pool plus the per-swapchain-image command buffers allocated from it
pub struct CommandPool<D: GpuDevice> {
    pub pool: vk::CommandPool,
    buffers: Vec<CommandBuffer>,
    device: Arc<D>,
}

impl<D: GpuDevice> CommandPool<D> {
    pub fn new(device: Arc<D>) -> Result<Self> {
        let pool = device
            .create_command_pool(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .context("Failed to create command pool")?;

        Ok(Self {
            pool,
            buffers: Vec::new(),
            device,
        })
    }

    /// Free every per-image buffer and allocate `count` fresh ones
    pub fn rebuild(&mut self, count: usize) -> Result<()> {
        self.free_all();

        let handles = self
            .device
            .allocate_command_buffers(self.pool, count as u32)
            .context("Failed to allocate command buffers")?;
        self.buffers = handles.into_iter().map(CommandBuffer::allocated).collect();

        log::debug!("Allocated {} command buffers", self.buffers.len());
        Ok(())
    }

    fn free_all(&mut self) {
        if self.buffers.is_empty() {
            return;
        }
        let handles: Vec<_> = self.buffers.iter().map(|b| b.handle).collect();
        self.device.free_command_buffers(self.pool, &handles);
        self.buffers.clear();
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CommandBuffer> {
        self.buffers.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut CommandBuffer> {
        self.buffers.get_mut(index)
    }

    /// The buffer for a swapchain image; an index past the allocated set is
    /// reported as a NotAllocated buffer.
    pub fn for_image(&mut self, index: usize) -> Result<&mut CommandBuffer, RendererError> {
        self.buffers
            .get_mut(index)
            .ok_or(RendererError::InvalidCommandBufferState {
                action: "record",
                state: CommandBufferState::NotAllocated,
            })
    }

    /// Allocate a one-shot buffer and start recording into it
    pub fn begin_single_use(&self) -> Result<CommandBuffer> {
        let handles = self
            .device
            .allocate_command_buffers(self.pool, 1)
            .context("Failed to allocate single-use command buffer")?;
        let mut cmd = CommandBuffer::allocated(handles[0]);
        if let Err(e) = cmd.begin(
            self.device.as_ref(),
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        ) {
            self.device.free_command_buffers(self.pool, &[cmd.handle]);
            return Err(e);
        }
        Ok(cmd)
    }

    /// End, submit, wait for the queue to drain, then free
    pub fn end_single_use(&self, mut cmd: CommandBuffer) -> Result<()> {
        let result = self.submit_and_wait(&mut cmd);
        self.device.free_command_buffers(self.pool, &[cmd.handle]);
        result
    }

    fn submit_and_wait(&self, cmd: &mut CommandBuffer) -> Result<()> {
        cmd.end(self.device.as_ref())?;

        let command_buffers = [cmd.handle];
        let submission = Submission {
            command_buffers: &command_buffers,
            ..Default::default()
        };
        self.device
            .queue_submit(&submission, vk::Fence::null())
            .map_err(RendererError::SubmitFailed)?;
        cmd.mark_submitted()?;

        self.device
            .queue_wait_idle()
            .context("Failed to wait for single-use submission")
    }
}

impl<D: GpuDevice> Drop for CommandPool<D> {
    fn drop(&mut self) {
        self.free_all();
        self.device.destroy_command_pool(self.pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{ObjectKind, SimDevice};

    fn pool_with(count: usize) -> (Arc<SimDevice>, CommandPool<SimDevice>) {
        let sim = Arc::new(SimDevice::new());
        let mut pool = CommandPool::new(sim.clone()).unwrap();
        pool.rebuild(count).unwrap();
        (sim, pool)
    }

    fn state_error(err: anyhow::Error) -> RendererError {
        err.downcast::<RendererError>().unwrap()
    }

    #[test]
    fn test_full_cycle() {
        let (sim, mut pool) = pool_with(1);
        let cmd = pool.get_mut(0).unwrap();

        cmd.begin(sim.as_ref(), vk::CommandBufferUsageFlags::empty())
            .unwrap();
        let info = vk::RenderPassBeginInfo::default();
        cmd.begin_render_pass(sim.as_ref(), &info).unwrap();
        assert_eq!(cmd.state(), CommandBufferState::InRenderPass);
        cmd.end_render_pass(sim.as_ref()).unwrap();
        cmd.end(sim.as_ref()).unwrap();
        cmd.mark_submitted().unwrap();
        cmd.reset(sim.as_ref()).unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Ready);
    }

    #[test]
    fn test_end_inside_render_pass_is_rejected() {
        let (sim, mut pool) = pool_with(1);
        let cmd = pool.get_mut(0).unwrap();
        cmd.begin(sim.as_ref(), vk::CommandBufferUsageFlags::empty())
            .unwrap();
        cmd.begin_render_pass(sim.as_ref(), &vk::RenderPassBeginInfo::default())
            .unwrap();

        let err = state_error(cmd.end(sim.as_ref()).unwrap_err());
        assert_eq!(
            err,
            RendererError::InvalidCommandBufferState {
                action: "end",
                state: CommandBufferState::InRenderPass,
            }
        );
    }

    #[test]
    fn test_double_begin_is_rejected() {
        let (sim, mut pool) = pool_with(1);
        let cmd = pool.get_mut(0).unwrap();
        cmd.begin(sim.as_ref(), vk::CommandBufferUsageFlags::empty())
            .unwrap();
        assert!(cmd
            .begin(sim.as_ref(), vk::CommandBufferUsageFlags::empty())
            .is_err());
        assert_eq!(cmd.state(), CommandBufferState::Recording);
    }

    #[test]
    fn test_submit_requires_recorded() {
        let (_sim, mut pool) = pool_with(1);
        let cmd = pool.get_mut(0).unwrap();
        assert!(cmd.mark_submitted().is_err());
    }

    #[test]
    fn test_rebuild_replaces_buffers() {
        let (sim, mut pool) = pool_with(3);
        assert_eq!(sim.live_count(ObjectKind::CommandBuffer), 3);

        pool.rebuild(2).unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(sim.live_count(ObjectKind::CommandBuffer), 2);

        drop(pool);
        assert_eq!(sim.live_count(ObjectKind::CommandBuffer), 0);
        assert_eq!(sim.live_count(ObjectKind::CommandPool), 0);
        assert!(sim.violations().is_empty());
    }

    #[test]
    fn test_single_use_is_freed() {
        let (sim, pool) = pool_with(0);
        let cmd = pool.begin_single_use().unwrap();
        pool.end_single_use(cmd).unwrap();
        assert_eq!(sim.live_count(ObjectKind::CommandBuffer), 0);
        assert_eq!(sim.stats().submits, 1);
        assert!(sim.violations().is_empty());
    }
}
