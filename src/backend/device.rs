// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with (optional) validation layers
// - Surface creation from the platform window's raw handles
// - Physical device selection (prefer discrete GPU, must present to surface)
// - Logical device + queue creation
// - Forwarding every `GpuDevice` call to ash

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr};
use ash::prelude::VkResult;
use ash::{vk, Entry};
use std::ffi::{c_char, CStr, CString};

use super::gpu::{GpuDevice, Submission, SurfaceSupport};
use crate::config::Config;
use crate::error::RendererError;
use crate::platform::PlatformWindow;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Depth formats in order of preference
const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    surface_loader: khr::Surface,
    surface: vk::SurfaceKHR,
    swapchain_loader: khr::Swapchain,

    // Queue handles. One family serves graphics and present.
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,

    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    depth_format: vk::Format,
}

impl VulkanDevice {
    fn create_instance(
        entry: &Entry,
        app_name: &str,
        display_handle: raw_window_handle::RawDisplayHandle,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("Frame Forge")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_2);

        // Surface extensions for whatever platform the window lives on
        let mut extensions: Vec<*const c_char> =
            ash_window::enumerate_required_extensions(display_handle)
                .context("Failed to query required surface extensions")?
                .to_vec();
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        log::info!("Vulkan instance created");
        Ok(instance)
    }

    /// Validation is optional: a missing layer degrades to running without it.
    fn validation_available(entry: &Entry) -> bool {
        let layers = match entry.enumerate_instance_layer_properties() {
            Ok(layers) => layers,
            Err(e) => {
                log::warn!("Could not enumerate instance layers: {:?}", e);
                return false;
            }
        };

        let found = layers.iter().any(|layer| {
            let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
            name == VALIDATION_LAYER
        });
        if !found {
            log::warn!(
                "Validation layer {:?} not installed, continuing without it",
                VALIDATION_LAYER
            );
        }
        found
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            return Err(RendererError::NoSuitableDevice("no Vulkan-capable GPU".into()).into());
        }

        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let features = unsafe { instance.get_physical_device_features(device) };
            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy();

            if features.sampler_anisotropy != vk::TRUE {
                log::debug!("Skipping {}: no sampler anisotropy", name);
                continue;
            }

            if !Self::supports_swapchain(instance, device)? {
                log::debug!("Skipping {}: no swapchain extension", name);
                continue;
            }

            // A single family must do both graphics and present
            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };
            let mut family = None;
            for (index, props) in queue_families.iter().enumerate() {
                let index = index as u32;
                let presents = unsafe {
                    surface_loader.get_physical_device_surface_support(device, index, surface)
                }?;
                if props.queue_flags.contains(vk::QueueFlags::GRAPHICS) && presents {
                    family = Some(index);
                    break;
                }
            }

            if let Some(graphics_family) = family {
                let score = match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                    _ => 1,
                };

                if score > best_score {
                    best_score = score;
                    best_device = Some((device, graphics_family));
                }
            }
        }

        best_device.ok_or_else(|| {
            RendererError::NoSuitableDevice(
                "no GPU can render and present to this surface".into(),
            )
            .into()
        })
    }

    fn supports_swapchain(instance: &ash::Instance, device: vk::PhysicalDevice) -> Result<bool> {
        let extensions = unsafe { instance.enumerate_device_extension_properties(device) }?;
        Ok(extensions.iter().any(|ext| {
            let name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
            name == khr::Swapchain::name()
        }))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extensions = [khr::Swapchain::name().as_ptr()];
        let features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(true)
            .build();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        Ok((device, graphics_queue))
    }

    fn detect_depth_format(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> Result<vk::Format> {
        DEPTH_FORMAT_CANDIDATES
            .iter()
            .copied()
            .find(|&format| {
                let props = unsafe {
                    instance.get_physical_device_format_properties(physical_device, format)
                };
                props
                    .optimal_tiling_features
                    .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
            })
            .ok_or_else(|| {
                RendererError::NoSuitableDevice("no supported depth format".into()).into()
            })
    }
}

fn whole_range(memory: vk::DeviceMemory) -> vk::MappedMemoryRange {
    vk::MappedMemoryRange::builder()
        .memory(memory)
        .offset(0)
        .size(vk::WHOLE_SIZE)
        .build()
}

impl GpuDevice for VulkanDevice {
    fn create(app_name: &str, window: &dyn PlatformWindow, config: &Config) -> Result<Self> {
        log::info!("Creating Vulkan device: {}", app_name);

        let (display_handle, window_handle) = window
            .raw_handles()
            .ok_or(RendererError::MissingWindowHandle)?;

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Instance (validation only in debug builds, and only if installed)
        let enable_validation = cfg!(debug_assertions)
            && config.debug.validation_layers
            && Self::validation_available(&entry);
        let instance = Self::create_instance(&entry, app_name, display_handle, enable_validation)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 3: Surface
        let surface_loader = khr::Surface::new(&entry, &instance);
        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
        }
        .context("Failed to create window surface")?;

        // Step 4: Pick physical device (GPU)
        let (physical_device, graphics_queue_family) =
            Self::pick_physical_device(&instance, &surface_loader, surface)?;

        // Step 5: Create logical device
        let (device, graphics_queue) =
            Self::create_logical_device(&instance, physical_device, graphics_queue_family)?;

        // Step 6: Cache device properties
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let depth_format = Self::detect_depth_format(&instance, physical_device)?;

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        let swapchain_loader = khr::Swapchain::new(&instance, &device);

        Ok(Self {
            device,
            physical_device,
            instance,
            _entry: entry,
            surface_loader,
            surface,
            swapchain_loader,
            graphics_queue,
            graphics_queue_family,
            debug_utils,
            properties,
            memory_properties,
            depth_format,
        })
    }

    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    fn max_sampler_anisotropy(&self) -> f32 {
        self.properties.limits.max_sampler_anisotropy
    }

    fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    fn surface_support(&self) -> VkResult<SurfaceSupport> {
        unsafe {
            Ok(SurfaceSupport {
                capabilities: self
                    .surface_loader
                    .get_physical_device_surface_capabilities(self.physical_device, self.surface)?,
                formats: self
                    .surface_loader
                    .get_physical_device_surface_formats(self.physical_device, self.surface)?,
                present_modes: self
                    .surface_loader
                    .get_physical_device_surface_present_modes(self.physical_device, self.surface)?,
            })
        }
    }

    fn wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }

    fn queue_wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.queue_wait_idle(self.graphics_queue) }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device.create_fence(&info, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.device.create_semaphore(&info, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR) -> VkResult<vk::SwapchainKHR> {
        // The engine never sees the surface; it is owned here
        let mut info = *info;
        info.surface = self.surface;
        unsafe { self.swapchain_loader.create_swapchain(&info, None) }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout, semaphore, vk::Fence::null())
        }
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe {
            self.swapchain_loader
                .queue_present(self.graphics_queue, &present_info)
        }
    }

    fn queue_submit(&self, submission: &Submission<'_>, fence: vk::Fence) -> VkResult<()> {
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(submission.wait_semaphores)
            .wait_dst_stage_mask(submission.wait_stages)
            .command_buffers(submission.command_buffers)
            .signal_semaphores(submission.signal_semaphores);

        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info.build()], fence)
        }
    }

    fn allocate_memory(&self, info: &vk::MemoryAllocateInfo) -> VkResult<vk::DeviceMemory> {
        unsafe { self.device.allocate_memory(info, None) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) }
    }

    fn write_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        data: &[u8],
        coherent: bool,
    ) -> VkResult<()> {
        // Whole-allocation mapping keeps flush ranges atom aligned
        unsafe {
            let ptr = self.device.map_memory(
                memory,
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )? as *mut u8;
            ptr.add(offset as usize)
                .copy_from_nonoverlapping(data.as_ptr(), data.len());
            let flushed = if coherent {
                Ok(())
            } else {
                self.device
                    .flush_mapped_memory_ranges(&[whole_range(memory)])
            };
            self.device.unmap_memory(memory);
            flushed
        }
    }

    fn read_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        out: &mut [u8],
        coherent: bool,
    ) -> VkResult<()> {
        unsafe {
            let ptr = self.device.map_memory(
                memory,
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )? as *const u8;
            if !coherent {
                if let Err(e) = self
                    .device
                    .invalidate_mapped_memory_ranges(&[whole_range(memory)])
                {
                    self.device.unmap_memory(memory);
                    return Err(e);
                }
            }
            out.as_mut_ptr()
                .copy_from_nonoverlapping(ptr.add(offset as usize), out.len());
            self.device.unmap_memory(memory);
        }
        Ok(())
    }

    fn create_buffer(&self, info: &vk::BufferCreateInfo) -> VkResult<vk::Buffer> {
        unsafe { self.device.create_buffer(info, None) }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, 0) }
    }

    fn create_image(&self, info: &vk::ImageCreateInfo) -> VkResult<vk::Image> {
        unsafe { self.device.create_image(info, None) }
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) }
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> VkResult<()> {
        unsafe { self.device.bind_image_memory(image, memory, 0) }
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo) -> VkResult<vk::ImageView> {
        unsafe { self.device.create_image_view(info, None) }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) }
    }

    fn create_sampler(&self, info: &vk::SamplerCreateInfo) -> VkResult<vk::Sampler> {
        unsafe { self.device.create_sampler(info, None) }
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) }
    }

    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo) -> VkResult<vk::RenderPass> {
        unsafe { self.device.create_render_pass(info, None) }
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) }
    }

    fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo) -> VkResult<vk::Framebuffer> {
        unsafe { self.device.create_framebuffer(info, None) }
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) }
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::builder().code(code);
        unsafe { self.device.create_shader_module(&info, None) }
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) }
    }

    fn create_pipeline_layout(
        &self,
        info: &vk::PipelineLayoutCreateInfo,
    ) -> VkResult<vk::PipelineLayout> {
        unsafe { self.device.create_pipeline_layout(info, None) }
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) }
    }

    fn create_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo,
    ) -> VkResult<vk::Pipeline> {
        let pipelines = unsafe {
            self.device.create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(info),
                None,
            )
        }
        .map_err(|(_, e)| e)?;
        Ok(pipelines[0])
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) }
    }

    fn create_command_pool(&self, flags: vk::CommandPoolCreateFlags) -> VkResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(self.graphics_queue_family)
            .flags(flags);
        unsafe { self.device.create_command_pool(&info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe { self.device.allocate_command_buffers(&info) }
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        unsafe { self.device.free_command_buffers(pool, buffers) }
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        let info = vk::CommandBufferBeginInfo::builder().flags(flags);
        unsafe { self.device.begin_command_buffer(cmd, &info) }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(cmd) }
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        }
    }

    fn cmd_begin_render_pass(&self, cmd: vk::CommandBuffer, info: &vk::RenderPassBeginInfo) {
        unsafe {
            self.device
                .cmd_begin_render_pass(cmd, info, vk::SubpassContents::INLINE)
        }
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(cmd) }
    }

    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewport: vk::Viewport) {
        unsafe { self.device.cmd_set_viewport(cmd, 0, &[viewport]) }
    }

    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissor: vk::Rect2D) {
        unsafe { self.device.cmd_set_scissor(cmd, 0, &[scissor]) }
    }

    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline)
        }
    }

    fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe {
            self.device
                .cmd_push_constants(cmd, layout, stages, offset, data)
        }
    }

    fn cmd_bind_vertex_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer, offset: u64) {
        unsafe { self.device.cmd_bind_vertex_buffers(cmd, 0, &[buffer], &[offset]) }
    }

    fn cmd_bind_index_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer, offset: u64) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(cmd, buffer, offset, vk::IndexType::UINT32)
        }
    }

    fn cmd_draw_indexed(&self, cmd: vk::CommandBuffer, index_count: u32) {
        unsafe { self.device.cmd_draw_indexed(cmd, index_count, 1, 0, 0, 0) }
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) {
        unsafe { self.device.cmd_copy_buffer(cmd, src, dst, &[region]) }
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        region: vk::BufferImageCopy,
    ) {
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(cmd, src, image, layout, &[region])
        }
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier,
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(barrier),
            )
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // Cleanup in reverse order
        unsafe {
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::info!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::trace!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
