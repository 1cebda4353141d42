// Driver seam
//
// Every call the frame engine makes into the graphics driver goes through
// `GpuDevice`. Arguments are plain `ash::vk` structs and handles, so the real
// implementation (`VulkanDevice`) forwards straight to `ash::Device` and the
// simulated one (`SimDevice`) can run the exact same engine code without a GPU.

use anyhow::Result;
use ash::prelude::VkResult;
use ash::vk;

use crate::config::Config;
use crate::platform::PlatformWindow;

/// Surface properties queried before (re)building a swapchain
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// One queue submission, with borrowed dependency lists
#[derive(Debug, Clone, Copy, Default)]
pub struct Submission<'a> {
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub command_buffers: &'a [vk::CommandBuffer],
    pub signal_semaphores: &'a [vk::Semaphore],
}

pub trait GpuDevice: Sized + 'static {
    /// Build the device context: instance, surface, physical/logical device
    /// and queues.
    fn create(app_name: &str, window: &dyn PlatformWindow, config: &Config) -> Result<Self>;

    // ---------------------------------------------------------------------
    // Device queries
    // ---------------------------------------------------------------------
    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties;
    fn max_sampler_anisotropy(&self) -> f32;
    fn depth_format(&self) -> vk::Format;
    fn surface_support(&self) -> VkResult<SurfaceSupport>;

    fn wait_idle(&self) -> VkResult<()>;
    fn queue_wait_idle(&self) -> VkResult<()>;

    // ---------------------------------------------------------------------
    // Synchronization
    // ---------------------------------------------------------------------
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// `Err(vk::Result::TIMEOUT)` when the timeout elapses
    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // ---------------------------------------------------------------------
    // Presentation
    // ---------------------------------------------------------------------
    fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR) -> VkResult<vk::SwapchainKHR>;
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    /// Returns `(image_index, suboptimal)`
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;
    /// Returns `suboptimal`
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool>;
    fn queue_submit(&self, submission: &Submission<'_>, fence: vk::Fence) -> VkResult<()>;

    // ---------------------------------------------------------------------
    // Memory and resources
    // ---------------------------------------------------------------------
    fn allocate_memory(&self, info: &vk::MemoryAllocateInfo) -> VkResult<vk::DeviceMemory>;
    fn free_memory(&self, memory: vk::DeviceMemory);
    /// Map, copy `data` in at `offset`, unmap. Unless `coherent`, the write is
    /// flushed before unmapping.
    fn write_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        data: &[u8],
        coherent: bool,
    ) -> VkResult<()>;
    /// Map, copy `out.len()` bytes out from `offset`, unmap. Unless `coherent`,
    /// the mapping is invalidated before the copy.
    fn read_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        out: &mut [u8],
        coherent: bool,
    ) -> VkResult<()>;

    fn create_buffer(&self, info: &vk::BufferCreateInfo) -> VkResult<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()>;

    fn create_image(&self, info: &vk::ImageCreateInfo) -> VkResult<vk::Image>;
    fn destroy_image(&self, image: vk::Image);
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> VkResult<()>;

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo) -> VkResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn create_sampler(&self, info: &vk::SamplerCreateInfo) -> VkResult<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    // ---------------------------------------------------------------------
    // Render targets and pipelines
    // ---------------------------------------------------------------------
    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo) -> VkResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo) -> VkResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    fn create_pipeline_layout(
        &self,
        info: &vk::PipelineLayoutCreateInfo,
    ) -> VkResult<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo,
    ) -> VkResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    // ---------------------------------------------------------------------
    // Command buffers
    // ---------------------------------------------------------------------
    fn create_command_pool(&self, flags: vk::CommandPoolCreateFlags) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);
    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;

    fn cmd_begin_render_pass(&self, cmd: vk::CommandBuffer, info: &vk::RenderPassBeginInfo);
    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer);
    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewport: vk::Viewport);
    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissor: vk::Rect2D);
    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline);
    fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );
    fn cmd_bind_vertex_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer, offset: u64);
    fn cmd_bind_index_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer, offset: u64);
    fn cmd_draw_indexed(&self, cmd: vk::CommandBuffer, index_count: u32);
    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    );
    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        region: vk::BufferImageCopy,
    );
    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier,
    );
}
