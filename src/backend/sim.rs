// Simulated driver
//
// `SimDevice` implements `GpuDevice` with no GPU behind it. It hands out
// fabricated handles and keeps enough state to check the synchronization
// protocol the engine relies on:
// - fences move Unsignaled -> Pending (submitted) -> Signaled (work executed)
// - binary semaphores must be signaled exactly once before each wait
// - image layouts are tracked and checked when barriers/copies execute
// - memory is real bytes, so copies actually move data
//
// Submitted work sits in an in-order queue and only executes when something
// waits on it (a fence wait or an idle wait). In manual mode fence waits time
// out instead, until `complete_all` drains the queue.
//
// Anything the engine does that a real driver would reject (or that would be
// undefined behavior) is recorded in `violations()` rather than panicking.

use anyhow::Result;
use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use super::gpu::{GpuDevice, Submission, SurfaceSupport};
use crate::config::Config;
use crate::platform::PlatformWindow;

const SPIRV_MAGIC: u32 = 0x0723_0203;
const SIM_ALIGNMENT: u64 = 256;

/// Memory type 0 is device-local, type 1 is host-visible (coherent unless
/// created with `SimDevice::non_coherent`)
pub const SIM_DEVICE_LOCAL_TYPE: u32 = 0;
pub const SIM_HOST_VISIBLE_TYPE: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Fence,
    Semaphore,
    Swapchain,
    Memory,
    Buffer,
    Image,
    ImageView,
    Sampler,
    RenderPass,
    Framebuffer,
    ShaderModule,
    PipelineLayout,
    Pipeline,
    CommandPool,
    CommandBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    Unsignaled,
    /// Submitted, GPU work not yet executed
    Pending,
    Signaled,
}

/// Counters over everything the simulated queue has executed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub submits: u64,
    pub presents: u64,
    pub draws: u64,
    pub indices_drawn: u64,
    pub host_flushes: u64,
    pub host_invalidates: u64,
}

#[derive(Debug, Clone)]
enum SimCommand {
    CopyBuffer {
        src: u64,
        dst: u64,
        region: vk::BufferCopy,
    },
    CopyBufferToImage {
        src: u64,
        image: u64,
        layout: vk::ImageLayout,
        offset: u64,
    },
    Barrier {
        image: u64,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },
    Draw {
        index_count: u32,
        reads: Vec<BufferRange>,
    },
}

/// Bytes `start..end` of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BufferRange {
    buffer: u64,
    start: u64,
    end: u64,
}

impl BufferRange {
    fn overlaps(&self, other: &BufferRange) -> bool {
        self.buffer == other.buffer && self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Default)]
struct SimCommandBuffer {
    pool: u64,
    recording: bool,
    in_render_pass: bool,
    commands: Vec<SimCommand>,
    vertex_stride: u64,
    vertex_binding: Option<(u64, u64)>,
    index_binding: Option<(u64, u64)>,
}

impl SimCommandBuffer {
    fn clear(&mut self) {
        self.recording = false;
        self.in_render_pass = false;
        self.commands.clear();
        self.vertex_stride = 0;
        self.vertex_binding = None;
        self.index_binding = None;
    }
}

#[derive(Debug)]
struct SimImage {
    extent: vk::Extent3D,
    layout: vk::ImageLayout,
    memory: Option<u64>,
}

#[derive(Debug)]
struct SimBuffer {
    size: u64,
    memory: Option<u64>,
}

#[derive(Debug)]
struct SimMemory {
    type_index: u32,
    bytes: Vec<u8>,
}

#[derive(Debug)]
struct SimSwapchain {
    images: Vec<u64>,
    next_image: u32,
}

#[derive(Debug)]
struct PendingSubmit {
    fence: u64,
    command_buffers: Vec<u64>,
    commands: Vec<SimCommand>,
}

#[derive(Debug, Default)]
struct SimState {
    next_handle: u64,
    live: HashMap<u64, ObjectKind>,
    destroy_log: Vec<(ObjectKind, u64)>,
    violations: Vec<String>,

    fences: HashMap<u64, FenceState>,
    semaphores: HashMap<u64, bool>,
    memories: HashMap<u64, SimMemory>,
    buffers: HashMap<u64, SimBuffer>,
    images: HashMap<u64, SimImage>,
    swapchains: HashMap<u64, SimSwapchain>,
    command_buffers: HashMap<u64, SimCommandBuffer>,
    pipeline_strides: HashMap<u64, u64>,

    queue: VecDeque<PendingSubmit>,
    peak_pending_fences: usize,
    stats: SimStats,

    manual_gpu: bool,
    acquire_out_of_date: u32,
    present_out_of_date: u32,
    fail_next_submit: bool,
    fail_next_wait_idle: bool,
}

impl SimState {
    fn create(&mut self, kind: ObjectKind) -> u64 {
        self.next_handle += 1;
        let raw = self.next_handle;
        self.live.insert(raw, kind);
        raw
    }

    fn destroy(&mut self, raw: u64, kind: ObjectKind) -> bool {
        // Destroying VK_NULL_HANDLE is a no-op
        if raw == 0 {
            return false;
        }
        match self.live.remove(&raw) {
            Some(found) if found == kind => {
                self.destroy_log.push((kind, raw));
                true
            }
            Some(found) => {
                self.live.insert(raw, found);
                self.violate(format!("destroy {:?} #{} but it is a {:?}", kind, raw, found));
                false
            }
            None => {
                self.violate(format!("destroy of dead {:?} #{}", kind, raw));
                false
            }
        }
    }

    fn is_live(&mut self, raw: u64, kind: ObjectKind, what: &str) -> bool {
        if self.live.get(&raw) == Some(&kind) {
            true
        } else {
            self.violate(format!("{} uses dead {:?} #{}", what, kind, raw));
            false
        }
    }

    fn violate(&mut self, message: String) {
        log::error!("[sim] {}", message);
        self.violations.push(message);
    }

    fn pending_fences(&self) -> usize {
        self.queue.iter().filter(|s| s.fence != 0).count()
    }

    fn recording_buffer(&mut self, cmd: u64, what: &str) -> Option<&mut SimCommandBuffer> {
        let recording = self
            .command_buffers
            .get(&cmd)
            .map(|cb| cb.recording)
            .unwrap_or(false);
        if !recording {
            self.violate(format!("{} on command buffer #{} that is not recording", what, cmd));
            return None;
        }
        self.command_buffers.get_mut(&cmd)
    }

    fn record(&mut self, cmd: u64, what: &str, command: SimCommand) {
        if let Some(cb) = self.recording_buffer(cmd, what) {
            cb.commands.push(command);
        }
    }

    fn in_flight(&self, cmd: u64) -> bool {
        self.queue.iter().any(|s| s.command_buffers.contains(&cmd))
    }

    /// Ranges an indexed draw reads: its indices, and the vertices they
    /// reference (known because index data is already in memory)
    fn draw_reads(&mut self, cmd: u64, index_count: u32) -> Vec<BufferRange> {
        let Some(cb) = self.command_buffers.get(&cmd) else {
            return Vec::new();
        };
        let (stride, vertex, index) = (cb.vertex_stride, cb.vertex_binding, cb.index_binding);
        let Some((index_buffer, index_offset)) = index else {
            return Vec::new();
        };

        let index_bytes = u64::from(index_count) * 4;
        let mut reads = vec![BufferRange {
            buffer: index_buffer,
            start: index_offset,
            end: index_offset + index_bytes,
        }];

        let indices = self.buffer_bytes(index_buffer, index_offset, index_bytes);
        if let (Some((vertex_buffer, vertex_offset)), Some(indices)) = (vertex, indices) {
            let vertex_count = indices
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .max()
                .map_or(0, |max| u64::from(max) + 1);
            reads.push(BufferRange {
                buffer: vertex_buffer,
                start: vertex_offset,
                end: vertex_offset + vertex_count * stride,
            });
        }
        reads
    }

    /// Whether a queued, not yet executed draw reads any of `written`
    fn read_by_pending_draw(&self, written: &BufferRange) -> bool {
        self.queue
            .iter()
            .flat_map(|submit| submit.commands.iter())
            .any(|command| match command {
                SimCommand::Draw { reads, .. } => reads.iter().any(|r| r.overlaps(written)),
                _ => false,
            })
    }

    /// Execute queued submissions in order. With `until` set, stop after the
    /// submission that signals that fence.
    fn execute(&mut self, until: Option<u64>) {
        while let Some(submit) = self.queue.pop_front() {
            for command in &submit.commands {
                self.run(command);
            }
            if submit.fence != 0 {
                self.fences.insert(submit.fence, FenceState::Signaled);
            }
            if until.is_some_and(|f| f == submit.fence) {
                break;
            }
        }
    }

    fn run(&mut self, command: &SimCommand) {
        match *command {
            SimCommand::CopyBuffer { src, dst, region } => {
                let Some(bytes) = self.buffer_bytes(src, region.src_offset, region.size) else {
                    return;
                };
                self.write_buffer(dst, region.dst_offset, &bytes);
            }
            SimCommand::CopyBufferToImage {
                src,
                image,
                layout,
                offset,
            } => {
                let Some(current) = self.images.get(&image).map(|i| i.layout) else {
                    self.violate(format!("copy into dead image #{}", image));
                    return;
                };
                if current != layout || layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
                    self.violate(format!(
                        "copy into image #{} declared {:?} but image is {:?}",
                        image, layout, current
                    ));
                    return;
                }
                let size = self.images.get(&image).map_or(0, |i| {
                    u64::from(i.extent.width) * u64::from(i.extent.height) * 4
                });
                let Some(bytes) = self.buffer_bytes(src, offset, size) else {
                    return;
                };
                let memory = self.images.get(&image).and_then(|i| i.memory);
                match memory.and_then(|m| self.memories.get_mut(&m)) {
                    Some(mem) if mem.bytes.len() >= bytes.len() => {
                        mem.bytes[..bytes.len()].copy_from_slice(&bytes);
                    }
                    _ => self.violate(format!("copy into image #{} without bound memory", image)),
                }
            }
            SimCommand::Barrier { image, old, new } => {
                let Some(img) = self.images.get_mut(&image) else {
                    self.violate(format!("barrier on dead image #{}", image));
                    return;
                };
                // UNDEFINED as the source discards contents and is valid from any layout
                if old != vk::ImageLayout::UNDEFINED && img.layout != old {
                    let current = img.layout;
                    self.violate(format!(
                        "barrier on image #{} expects {:?} but image is {:?}",
                        image, old, current
                    ));
                    return;
                }
                img.layout = new;
            }
            SimCommand::Draw { index_count, .. } => {
                self.stats.draws += 1;
                self.stats.indices_drawn += u64::from(index_count);
            }
        }
    }

    fn buffer_bytes(&mut self, buffer: u64, offset: u64, size: u64) -> Option<Vec<u8>> {
        let memory = self.buffers.get(&buffer).and_then(|b| b.memory);
        let range = offset as usize..(offset + size) as usize;
        match memory.and_then(|m| self.memories.get(&m)) {
            Some(mem) if range.end <= mem.bytes.len() => Some(mem.bytes[range].to_vec()),
            _ => {
                self.violate(format!("read {} bytes from buffer #{} out of range", size, buffer));
                None
            }
        }
    }

    fn write_buffer(&mut self, buffer: u64, offset: u64, bytes: &[u8]) {
        let memory = self.buffers.get(&buffer).and_then(|b| b.memory);
        let start = offset as usize;
        match memory.and_then(|m| self.memories.get_mut(&m)) {
            Some(mem) if start + bytes.len() <= mem.bytes.len() => {
                mem.bytes[start..start + bytes.len()].copy_from_slice(bytes);
            }
            _ => self.violate(format!(
                "write {} bytes to buffer #{} out of range",
                bytes.len(),
                buffer
            )),
        }
    }
}

/// A driver that runs entirely in host memory
pub struct SimDevice {
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    state: Mutex<SimState>,
}

impl SimDevice {
    pub fn new() -> Self {
        Self::with_host_memory(
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    /// Host-visible memory needs explicit flushes and invalidations
    pub fn non_coherent() -> Self {
        Self::with_host_memory(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    fn with_host_memory(host_flags: vk::MemoryPropertyFlags) -> Self {
        let mut memory_properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 2,
            memory_heap_count: 2,
            ..Default::default()
        };
        memory_properties.memory_heaps[0] = vk::MemoryHeap {
            size: 1 << 30,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        memory_properties.memory_heaps[1] = vk::MemoryHeap {
            size: 1 << 30,
            flags: vk::MemoryHeapFlags::empty(),
        };
        memory_properties.memory_types[SIM_DEVICE_LOCAL_TYPE as usize] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };
        memory_properties.memory_types[SIM_HOST_VISIBLE_TYPE as usize] = vk::MemoryType {
            property_flags: host_flags,
            heap_index: 1,
        };

        Self {
            memory_properties,
            state: Mutex::new(SimState::default()),
        }
    }

    // ---------------------------------------------------------------------
    // Controls
    // ---------------------------------------------------------------------

    /// In manual mode fence waits on pending work time out
    pub fn set_manual_gpu(&self, manual: bool) {
        self.state.lock().manual_gpu = manual;
    }

    /// Execute every queued submission
    pub fn complete_all(&self) {
        self.state.lock().execute(None);
    }

    pub fn inject_acquire_out_of_date(&self, times: u32) {
        self.state.lock().acquire_out_of_date += times;
    }

    pub fn inject_present_out_of_date(&self, times: u32) {
        self.state.lock().present_out_of_date += times;
    }

    pub fn fail_next_submit(&self) {
        self.state.lock().fail_next_submit = true;
    }

    /// The next device idle wait reports a lost device without executing anything
    pub fn fail_next_wait_idle(&self) {
        self.state.lock().fail_next_wait_idle = true;
    }

    fn is_coherent(&self, type_index: u32) -> bool {
        self.memory_properties.memory_types[type_index as usize]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    // ---------------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------------

    pub fn live_count(&self, kind: ObjectKind) -> usize {
        self.state.lock().live.values().filter(|&&k| k == kind).count()
    }

    pub fn destroy_log(&self) -> Vec<(ObjectKind, u64)> {
        self.state.lock().destroy_log.clone()
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn fence_state(&self, fence: vk::Fence) -> Option<FenceState> {
        self.state.lock().fences.get(&fence.as_raw()).copied()
    }

    pub fn pending_submissions(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Highest number of fenced submissions ever queued at once
    pub fn peak_pending_fences(&self) -> usize {
        self.state.lock().peak_pending_fences
    }

    pub fn stats(&self) -> SimStats {
        self.state.lock().stats
    }

    pub fn image_layout(&self, image: vk::Image) -> Option<vk::ImageLayout> {
        self.state.lock().images.get(&image.as_raw()).map(|i| i.layout)
    }

    /// Bytes backing an image, as written by executed copies
    pub fn image_bytes(&self, image: vk::Image) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let memory = state.images.get(&image.as_raw())?.memory?;
        state.memories.get(&memory).map(|m| m.bytes.clone())
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn handle<H: Handle>(raw: u64) -> H {
    H::from_raw(raw)
}

impl GpuDevice for SimDevice {
    fn create(app_name: &str, _window: &dyn PlatformWindow, _config: &Config) -> Result<Self> {
        log::info!("Creating simulated device: {}", app_name);
        Ok(Self::new())
    }

    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    fn max_sampler_anisotropy(&self) -> f32 {
        16.0
    }

    fn depth_format(&self) -> vk::Format {
        vk::Format::D32_SFLOAT
    }

    fn surface_support(&self) -> VkResult<SurfaceSupport> {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            // The surface size is decided by the swapchain
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 16384,
                height: 16384,
            },
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_DST,
        };

        Ok(SurfaceSupport {
            capabilities,
            formats: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        })
    }

    fn wait_idle(&self) -> VkResult<()> {
        let mut state = self.state.lock();
        if state.fail_next_wait_idle {
            state.fail_next_wait_idle = false;
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        state.execute(None);
        Ok(())
    }

    fn queue_wait_idle(&self) -> VkResult<()> {
        self.state.lock().execute(None);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Synchronization
    // ---------------------------------------------------------------------

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        let raw = state.create(ObjectKind::Fence);
        let initial = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        state.fences.insert(raw, initial);
        Ok(handle(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        let raw = fence.as_raw();
        if state.fences.get(&raw) == Some(&FenceState::Pending) {
            state.violate(format!("fence #{} destroyed while pending", raw));
        }
        if state.destroy(raw, ObjectKind::Fence) {
            state.fences.remove(&raw);
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout: u64) -> VkResult<()> {
        let mut state = self.state.lock();
        let raw = fence.as_raw();
        match state.fences.get(&raw).copied() {
            Some(FenceState::Signaled) => Ok(()),
            Some(FenceState::Pending) if state.manual_gpu => Err(vk::Result::TIMEOUT),
            Some(FenceState::Pending) => {
                state.execute(Some(raw));
                Ok(())
            }
            Some(FenceState::Unsignaled) => {
                state.violate(format!("wait on fence #{} that was never submitted", raw));
                Err(vk::Result::TIMEOUT)
            }
            None => {
                state.violate(format!("wait on dead fence #{}", raw));
                Err(vk::Result::ERROR_DEVICE_LOST)
            }
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        let raw = fence.as_raw();
        match state.fences.get(&raw).copied() {
            Some(FenceState::Pending) => {
                state.violate(format!("fence #{} reset while its work is pending", raw));
            }
            Some(_) => {
                state.fences.insert(raw, FenceState::Unsignaled);
            }
            None => state.violate(format!("reset of dead fence #{}", raw)),
        }
        Ok(())
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut state = self.state.lock();
        let raw = state.create(ObjectKind::Semaphore);
        state.semaphores.insert(raw, false);
        Ok(handle(raw))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        let raw = semaphore.as_raw();
        if state.destroy(raw, ObjectKind::Semaphore) {
            state.semaphores.remove(&raw);
        }
    }

    // ---------------------------------------------------------------------
    // Presentation
    // ---------------------------------------------------------------------

    fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR) -> VkResult<vk::SwapchainKHR> {
        let mut state = self.state.lock();
        if info.image_extent.width == 0 || info.image_extent.height == 0 {
            state.violate(format!("zero-sized swapchain {:?}", info.image_extent));
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let old = info.old_swapchain.as_raw();
        if old != 0 {
            state.is_live(old, ObjectKind::Swapchain, "swapchain recreation");
        }

        let raw = state.create(ObjectKind::Swapchain);
        let mut images = Vec::with_capacity(info.min_image_count as usize);
        for _ in 0..info.min_image_count {
            // Presentable images belong to the swapchain, not the live set
            state.next_handle += 1;
            let image = state.next_handle;
            state.images.insert(
                image,
                SimImage {
                    extent: vk::Extent3D {
                        width: info.image_extent.width,
                        height: info.image_extent.height,
                        depth: 1,
                    },
                    layout: vk::ImageLayout::UNDEFINED,
                    memory: None,
                },
            );
            images.push(image);
        }
        state.swapchains.insert(
            raw,
            SimSwapchain {
                images,
                next_image: 0,
            },
        );
        Ok(handle(raw))
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        let state = self.state.lock();
        state
            .swapchains
            .get(&swapchain.as_raw())
            .map(|s| s.images.iter().map(|&raw| handle(raw)).collect())
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        let raw = swapchain.as_raw();
        if state.destroy(raw, ObjectKind::Swapchain) {
            if let Some(chain) = state.swapchains.remove(&raw) {
                for image in chain.images {
                    state.images.remove(&image);
                }
            }
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state.lock();
        if state.acquire_out_of_date > 0 {
            state.acquire_out_of_date -= 1;
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }

        let sem = semaphore.as_raw();
        match state.semaphores.get(&sem).copied() {
            Some(true) => state.violate(format!("acquire signals semaphore #{} twice", sem)),
            Some(false) => {
                state.semaphores.insert(sem, true);
            }
            None => state.violate(format!("acquire with dead semaphore #{}", sem)),
        }

        let chain = state
            .swapchains
            .get_mut(&swapchain.as_raw())
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)?;
        let index = chain.next_image;
        chain.next_image = (index + 1) % chain.images.len() as u32;
        Ok((index, false))
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool> {
        let mut state = self.state.lock();
        let sem = wait_semaphore.as_raw();
        if state.semaphores.get(&sem) == Some(&true) {
            state.semaphores.insert(sem, false);
        } else {
            state.violate(format!("present waits on unsignaled semaphore #{}", sem));
        }

        let image_count = state
            .swapchains
            .get(&swapchain.as_raw())
            .map(|s| s.images.len())
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)?;
        if image_index as usize >= image_count {
            state.violate(format!("present of image {} out of {}", image_index, image_count));
        }

        if state.present_out_of_date > 0 {
            state.present_out_of_date -= 1;
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        state.stats.presents += 1;
        Ok(false)
    }

    fn queue_submit(&self, submission: &Submission<'_>, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        if state.fail_next_submit {
            state.fail_next_submit = false;
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }

        let fence_raw = fence.as_raw();
        if fence_raw != 0 {
            match state.fences.get(&fence_raw).copied() {
                Some(FenceState::Unsignaled) => {
                    state.fences.insert(fence_raw, FenceState::Pending);
                }
                Some(other) => state.violate(format!(
                    "submit with fence #{} in state {:?}",
                    fence_raw, other
                )),
                None => state.violate(format!("submit with dead fence #{}", fence_raw)),
            }
        }

        for sem in submission.wait_semaphores.iter().map(|s| s.as_raw()) {
            if state.semaphores.get(&sem) == Some(&true) {
                state.semaphores.insert(sem, false);
            } else {
                state.violate(format!("submit waits on unsignaled semaphore #{}", sem));
            }
        }

        let mut commands = Vec::new();
        let mut command_buffers = Vec::with_capacity(submission.command_buffers.len());
        for cmd in submission.command_buffers.iter().map(|c| c.as_raw()) {
            match state.command_buffers.get(&cmd) {
                Some(cb) if !cb.recording => commands.extend(cb.commands.iter().cloned()),
                Some(_) => state.violate(format!("submit of command buffer #{} still recording", cmd)),
                None => state.violate(format!("submit of dead command buffer #{}", cmd)),
            }
            command_buffers.push(cmd);
        }

        // Separate submissions are unordered without a barrier or semaphore
        for command in &commands {
            if let SimCommand::CopyBuffer { dst, region, .. } = command {
                let written = BufferRange {
                    buffer: *dst,
                    start: region.dst_offset,
                    end: region.dst_offset + region.size,
                };
                if state.read_by_pending_draw(&written) {
                    state.violate(format!(
                        "copy into buffer #{} bytes {}..{} races a pending draw reading them",
                        dst, written.start, written.end
                    ));
                }
            }
        }

        for sem in submission.signal_semaphores.iter().map(|s| s.as_raw()) {
            match state.semaphores.get(&sem).copied() {
                Some(false) => {
                    state.semaphores.insert(sem, true);
                }
                Some(true) => state.violate(format!("submit signals semaphore #{} twice", sem)),
                None => state.violate(format!("submit signals dead semaphore #{}", sem)),
            }
        }

        state.queue.push_back(PendingSubmit {
            fence: fence_raw,
            command_buffers,
            commands,
        });
        state.stats.submits += 1;
        let pending = state.pending_fences();
        state.peak_pending_fences = state.peak_pending_fences.max(pending);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Memory and resources
    // ---------------------------------------------------------------------

    fn allocate_memory(&self, info: &vk::MemoryAllocateInfo) -> VkResult<vk::DeviceMemory> {
        let mut state = self.state.lock();
        if info.memory_type_index >= self.memory_properties.memory_type_count {
            state.violate(format!("allocation from memory type {}", info.memory_type_index));
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let raw = state.create(ObjectKind::Memory);
        state.memories.insert(
            raw,
            SimMemory {
                type_index: info.memory_type_index,
                bytes: vec![0; info.allocation_size as usize],
            },
        );
        Ok(handle(raw))
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        let raw = memory.as_raw();
        if state.destroy(raw, ObjectKind::Memory) {
            state.memories.remove(&raw);
        }
    }

    fn write_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        data: &[u8],
        coherent: bool,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        let raw = memory.as_raw();
        let start = offset as usize;
        match state.memories.get_mut(&raw) {
            Some(mem) if mem.type_index == SIM_HOST_VISIBLE_TYPE => {
                if start + data.len() > mem.bytes.len() {
                    return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
                }
                mem.bytes[start..start + data.len()].copy_from_slice(data);
                let type_coherent = self.is_coherent(mem.type_index);
                if !coherent {
                    state.stats.host_flushes += 1;
                } else if !type_coherent {
                    state.violate(format!("write to non-coherent memory #{} without flush", raw));
                }
                Ok(())
            }
            Some(_) => {
                state.violate(format!("map of device-local memory #{}", raw));
                Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
            }
            None => {
                state.violate(format!("map of dead memory #{}", raw));
                Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
            }
        }
    }

    fn read_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        out: &mut [u8],
        coherent: bool,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        let raw = memory.as_raw();
        let start = offset as usize;
        match state.memories.get(&raw) {
            Some(mem) if mem.type_index == SIM_HOST_VISIBLE_TYPE => {
                if start + out.len() > mem.bytes.len() {
                    return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
                }
                out.copy_from_slice(&mem.bytes[start..start + out.len()]);
                let type_coherent = self.is_coherent(mem.type_index);
                if !coherent {
                    state.stats.host_invalidates += 1;
                } else if !type_coherent {
                    state.violate(format!("read of non-coherent memory #{} without invalidate", raw));
                }
                Ok(())
            }
            Some(_) => {
                state.violate(format!("map of device-local memory #{}", raw));
                Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
            }
            None => {
                state.violate(format!("map of dead memory #{}", raw));
                Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
            }
        }
    }

    fn create_buffer(&self, info: &vk::BufferCreateInfo) -> VkResult<vk::Buffer> {
        let mut state = self.state.lock();
        let raw = state.create(ObjectKind::Buffer);
        state.buffers.insert(
            raw,
            SimBuffer {
                size: info.size,
                memory: None,
            },
        );
        Ok(handle(raw))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        let raw = buffer.as_raw();
        if state.destroy(raw, ObjectKind::Buffer) {
            state.buffers.remove(&raw);
        }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let state = self.state.lock();
        let size = state.buffers.get(&buffer.as_raw()).map_or(0, |b| b.size);
        vk::MemoryRequirements {
            size: size.next_multiple_of(SIM_ALIGNMENT),
            alignment: SIM_ALIGNMENT,
            memory_type_bits: 0b11,
        }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()> {
        let mut state = self.state.lock();
        let (buf, mem) = (buffer.as_raw(), memory.as_raw());
        if !state.is_live(buf, ObjectKind::Buffer, "bind_buffer_memory")
            || !state.is_live(mem, ObjectKind::Memory, "bind_buffer_memory")
        {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        if let Some(b) = state.buffers.get_mut(&buf) {
            b.memory = Some(mem);
        }
        Ok(())
    }

    fn create_image(&self, info: &vk::ImageCreateInfo) -> VkResult<vk::Image> {
        let mut state = self.state.lock();
        let raw = state.create(ObjectKind::Image);
        state.images.insert(
            raw,
            SimImage {
                extent: info.extent,
                layout: info.initial_layout,
                memory: None,
            },
        );
        Ok(handle(raw))
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = self.state.lock();
        let raw = image.as_raw();
        if state.destroy(raw, ObjectKind::Image) {
            state.images.remove(&raw);
        }
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let state = self.state.lock();
        let size = state.images.get(&image.as_raw()).map_or(0, |i| {
            u64::from(i.extent.width) * u64::from(i.extent.height) * 4
        });
        vk::MemoryRequirements {
            size: size.next_multiple_of(SIM_ALIGNMENT),
            alignment: SIM_ALIGNMENT,
            memory_type_bits: 1 << SIM_DEVICE_LOCAL_TYPE,
        }
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> VkResult<()> {
        let mut state = self.state.lock();
        let (img, mem) = (image.as_raw(), memory.as_raw());
        if !state.is_live(img, ObjectKind::Image, "bind_image_memory")
            || !state.is_live(mem, ObjectKind::Memory, "bind_image_memory")
        {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        if let Some(i) = state.images.get_mut(&img) {
            i.memory = Some(mem);
        }
        Ok(())
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo) -> VkResult<vk::ImageView> {
        let mut state = self.state.lock();
        if !state.images.contains_key(&info.image.as_raw()) {
            state.violate(format!("view of dead image #{}", info.image.as_raw()));
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        Ok(handle(state.create(ObjectKind::ImageView)))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state.lock().destroy(view.as_raw(), ObjectKind::ImageView);
    }

    fn create_sampler(&self, _info: &vk::SamplerCreateInfo) -> VkResult<vk::Sampler> {
        Ok(handle(self.state.lock().create(ObjectKind::Sampler)))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.state.lock().destroy(sampler.as_raw(), ObjectKind::Sampler);
    }

    // ---------------------------------------------------------------------
    // Render targets and pipelines
    // ---------------------------------------------------------------------

    fn create_render_pass(&self, _info: &vk::RenderPassCreateInfo) -> VkResult<vk::RenderPass> {
        Ok(handle(self.state.lock().create(ObjectKind::RenderPass)))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.state
            .lock()
            .destroy(render_pass.as_raw(), ObjectKind::RenderPass);
    }

    fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo) -> VkResult<vk::Framebuffer> {
        let mut state = self.state.lock();
        if !state.is_live(info.render_pass.as_raw(), ObjectKind::RenderPass, "create_framebuffer") {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        Ok(handle(state.create(ObjectKind::Framebuffer)))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.state
            .lock()
            .destroy(framebuffer.as_raw(), ObjectKind::Framebuffer);
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        if code.first() != Some(&SPIRV_MAGIC) {
            return Err(vk::Result::ERROR_INVALID_SHADER_NV);
        }
        Ok(handle(self.state.lock().create(ObjectKind::ShaderModule)))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.state
            .lock()
            .destroy(module.as_raw(), ObjectKind::ShaderModule);
    }

    fn create_pipeline_layout(
        &self,
        _info: &vk::PipelineLayoutCreateInfo,
    ) -> VkResult<vk::PipelineLayout> {
        Ok(handle(self.state.lock().create(ObjectKind::PipelineLayout)))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.state
            .lock()
            .destroy(layout.as_raw(), ObjectKind::PipelineLayout);
    }

    fn create_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo,
    ) -> VkResult<vk::Pipeline> {
        let mut state = self.state.lock();
        let layout_ok =
            state.is_live(info.layout.as_raw(), ObjectKind::PipelineLayout, "create_pipeline");
        let pass_ok =
            state.is_live(info.render_pass.as_raw(), ObjectKind::RenderPass, "create_pipeline");
        if !(layout_ok && pass_ok) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        // The create info and everything it points at are valid for this call
        let stride = unsafe { info.p_vertex_input_state.as_ref() }
            .filter(|input| input.vertex_binding_description_count > 0)
            .map_or(0, |input| unsafe { (*input.p_vertex_binding_descriptions).stride });

        let raw = state.create(ObjectKind::Pipeline);
        state.pipeline_strides.insert(raw, u64::from(stride));
        Ok(handle(raw))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        let mut state = self.state.lock();
        let raw = pipeline.as_raw();
        if state.destroy(raw, ObjectKind::Pipeline) {
            state.pipeline_strides.remove(&raw);
        }
    }

    // ---------------------------------------------------------------------
    // Command buffers
    // ---------------------------------------------------------------------

    fn create_command_pool(&self, _flags: vk::CommandPoolCreateFlags) -> VkResult<vk::CommandPool> {
        Ok(handle(self.state.lock().create(ObjectKind::CommandPool)))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        let raw = pool.as_raw();
        if state.destroy(raw, ObjectKind::CommandPool) {
            // Buffers still allocated from the pool go with it
            let orphans: Vec<u64> = state
                .command_buffers
                .iter()
                .filter(|(_, cb)| cb.pool == raw)
                .map(|(&cmd, _)| cmd)
                .collect();
            for cmd in orphans {
                state.command_buffers.remove(&cmd);
                state.live.remove(&cmd);
            }
        }
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        if !state.is_live(pool.as_raw(), ObjectKind::CommandPool, "allocate_command_buffers") {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let mut buffers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let raw = state.create(ObjectKind::CommandBuffer);
            state.command_buffers.insert(
                raw,
                SimCommandBuffer {
                    pool: pool.as_raw(),
                    ..Default::default()
                },
            );
            buffers.push(handle(raw));
        }
        Ok(buffers)
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for raw in buffers.iter().map(|b| b.as_raw()) {
            if state.in_flight(raw) {
                state.violate(format!("command buffer #{} freed while in flight", raw));
            }
            if state.destroy(raw, ObjectKind::CommandBuffer) {
                state.command_buffers.remove(&raw);
            }
        }
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        let raw = cmd.as_raw();
        if state.in_flight(raw) {
            state.violate(format!("command buffer #{} re-recorded while in flight", raw));
        }
        match state.command_buffers.get_mut(&raw) {
            Some(cb) if !cb.recording => {
                cb.clear();
                cb.recording = true;
                Ok(())
            }
            Some(_) => {
                state.violate(format!("begin on command buffer #{} already recording", raw));
                Err(vk::Result::ERROR_UNKNOWN)
            }
            None => {
                state.violate(format!("begin on dead command buffer #{}", raw));
                Err(vk::Result::ERROR_UNKNOWN)
            }
        }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        let raw = cmd.as_raw();
        let Some(cb) = state.recording_buffer(raw, "end") else {
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        let unterminated = cb.in_render_pass;
        cb.recording = false;
        if unterminated {
            state.violate(format!("command buffer #{} ended inside a render pass", raw));
        }
        Ok(())
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        let raw = cmd.as_raw();
        if state.in_flight(raw) {
            state.violate(format!("command buffer #{} reset while in flight", raw));
        }
        match state.command_buffers.get_mut(&raw) {
            Some(cb) => {
                cb.clear();
                Ok(())
            }
            None => {
                state.violate(format!("reset of dead command buffer #{}", raw));
                Err(vk::Result::ERROR_UNKNOWN)
            }
        }
    }

    fn cmd_begin_render_pass(&self, cmd: vk::CommandBuffer, info: &vk::RenderPassBeginInfo) {
        let mut state = self.state.lock();
        let raw = cmd.as_raw();
        state.is_live(info.framebuffer.as_raw(), ObjectKind::Framebuffer, "begin_render_pass");
        let Some(cb) = state.recording_buffer(raw, "begin_render_pass") else {
            return;
        };
        let nested = cb.in_render_pass;
        cb.in_render_pass = true;
        if nested {
            state.violate(format!("nested render pass on command buffer #{}", raw));
        }
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        let mut state = self.state.lock();
        let raw = cmd.as_raw();
        let Some(cb) = state.recording_buffer(raw, "end_render_pass") else {
            return;
        };
        let open = cb.in_render_pass;
        cb.in_render_pass = false;
        if !open {
            state.violate(format!("end_render_pass without a render pass on #{}", raw));
        }
    }

    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, _viewport: vk::Viewport) {
        self.state.lock().recording_buffer(cmd.as_raw(), "set_viewport");
    }

    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, _scissor: vk::Rect2D) {
        self.state.lock().recording_buffer(cmd.as_raw(), "set_scissor");
    }

    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        let mut state = self.state.lock();
        let raw = pipeline.as_raw();
        state.is_live(raw, ObjectKind::Pipeline, "bind_pipeline");
        let stride = state.pipeline_strides.get(&raw).copied().unwrap_or(0);
        if let Some(cb) = state.recording_buffer(cmd.as_raw(), "bind_pipeline") {
            cb.vertex_stride = stride;
        }
    }

    fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        _stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        let mut state = self.state.lock();
        if offset as usize + data.len() > 128 {
            state.violate(format!("push constants exceed 128 bytes ({})", data.len()));
        }
        state.recording_buffer(cmd.as_raw(), "push_constants");
    }

    fn cmd_bind_vertex_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer, offset: u64) {
        let mut state = self.state.lock();
        state.is_live(buffer.as_raw(), ObjectKind::Buffer, "bind_vertex_buffer");
        if let Some(cb) = state.recording_buffer(cmd.as_raw(), "bind_vertex_buffer") {
            cb.vertex_binding = Some((buffer.as_raw(), offset));
        }
    }

    fn cmd_bind_index_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer, offset: u64) {
        let mut state = self.state.lock();
        state.is_live(buffer.as_raw(), ObjectKind::Buffer, "bind_index_buffer");
        if let Some(cb) = state.recording_buffer(cmd.as_raw(), "bind_index_buffer") {
            cb.index_binding = Some((buffer.as_raw(), offset));
        }
    }

    fn cmd_draw_indexed(&self, cmd: vk::CommandBuffer, index_count: u32) {
        let mut state = self.state.lock();
        let raw = cmd.as_raw();
        let outside = state
            .command_buffers
            .get(&raw)
            .is_some_and(|cb| !cb.in_render_pass);
        if outside {
            state.violate(format!("draw outside a render pass on #{}", raw));
        }
        let reads = state.draw_reads(raw, index_count);
        state.record(raw, "draw_indexed", SimCommand::Draw { index_count, reads });
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) {
        self.state.lock().record(
            cmd.as_raw(),
            "copy_buffer",
            SimCommand::CopyBuffer {
                src: src.as_raw(),
                dst: dst.as_raw(),
                region,
            },
        );
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        region: vk::BufferImageCopy,
    ) {
        self.state.lock().record(
            cmd.as_raw(),
            "copy_buffer_to_image",
            SimCommand::CopyBufferToImage {
                src: src.as_raw(),
                image: image.as_raw(),
                layout,
                offset: region.buffer_offset,
            },
        );
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        _src_stage: vk::PipelineStageFlags,
        _dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier,
    ) {
        self.state.lock().record(
            cmd.as_raw(),
            "pipeline_barrier",
            SimCommand::Barrier {
                image: barrier.image.as_raw(),
                old: barrier.old_layout,
                new: barrier.new_layout,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit_empty(sim: &SimDevice, fence: vk::Fence) {
        sim.queue_submit(&Submission::default(), fence).unwrap();
    }

    #[test]
    fn test_fence_lifecycle() {
        let sim = SimDevice::new();
        let fence = sim.create_fence(true).unwrap();
        assert_eq!(sim.fence_state(fence), Some(FenceState::Signaled));

        sim.reset_fence(fence).unwrap();
        submit_empty(&sim, fence);
        assert_eq!(sim.fence_state(fence), Some(FenceState::Pending));

        sim.wait_for_fence(fence, u64::MAX).unwrap();
        assert_eq!(sim.fence_state(fence), Some(FenceState::Signaled));
        assert!(sim.violations().is_empty());
    }

    #[test]
    fn test_reset_while_pending_is_a_violation() {
        let sim = SimDevice::new();
        let fence = sim.create_fence(false).unwrap();
        submit_empty(&sim, fence);
        sim.reset_fence(fence).unwrap();
        assert_eq!(sim.violations().len(), 1);
        assert_eq!(sim.fence_state(fence), Some(FenceState::Pending));
    }

    #[test]
    fn test_manual_gpu_times_out_until_completed() {
        let sim = SimDevice::new();
        sim.set_manual_gpu(true);
        let fence = sim.create_fence(false).unwrap();
        submit_empty(&sim, fence);

        assert_eq!(sim.wait_for_fence(fence, 0), Err(vk::Result::TIMEOUT));
        sim.complete_all();
        assert_eq!(sim.wait_for_fence(fence, 0), Ok(()));
        assert_eq!(sim.pending_submissions(), 0);
    }

    #[test]
    fn test_queue_executes_in_order() {
        let sim = SimDevice::new();
        let first = sim.create_fence(false).unwrap();
        let second = sim.create_fence(false).unwrap();
        submit_empty(&sim, first);
        submit_empty(&sim, second);
        assert_eq!(sim.peak_pending_fences(), 2);

        // Waiting on the second retires the first too
        sim.wait_for_fence(second, u64::MAX).unwrap();
        assert_eq!(sim.fence_state(first), Some(FenceState::Signaled));
    }

    #[test]
    fn test_semaphore_wait_requires_signal() {
        let sim = SimDevice::new();
        let sem = sim.create_semaphore().unwrap();
        let waits = [sem];
        let stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let submission = Submission {
            wait_semaphores: &waits,
            wait_stages: &stages,
            ..Default::default()
        };
        sim.queue_submit(&submission, vk::Fence::null()).unwrap();
        assert_eq!(sim.violations().len(), 1);
    }

    #[test]
    fn test_double_destroy_is_a_violation() {
        let sim = SimDevice::new();
        let sampler = sim
            .create_sampler(&vk::SamplerCreateInfo::default())
            .unwrap();
        sim.destroy_sampler(sampler);
        sim.destroy_sampler(sampler);
        assert_eq!(sim.live_count(ObjectKind::Sampler), 0);
        assert_eq!(sim.violations().len(), 1);
    }

    #[test]
    fn test_injected_faults_fire_once() {
        let sim = SimDevice::new();
        sim.fail_next_submit();
        assert_eq!(
            sim.queue_submit(&Submission::default(), vk::Fence::null()),
            Err(vk::Result::ERROR_DEVICE_LOST)
        );
        assert!(sim
            .queue_submit(&Submission::default(), vk::Fence::null())
            .is_ok());
    }

    #[test]
    fn test_copy_over_indices_of_pending_draw_is_a_violation() {
        let sim = SimDevice::new();
        let buffer = sim
            .create_buffer(&vk::BufferCreateInfo {
                size: 64,
                ..Default::default()
            })
            .unwrap();
        let memory = sim
            .allocate_memory(&vk::MemoryAllocateInfo {
                allocation_size: 64,
                memory_type_index: SIM_HOST_VISIBLE_TYPE,
                ..Default::default()
            })
            .unwrap();
        sim.bind_buffer_memory(buffer, memory).unwrap();

        let pool = sim.create_command_pool(vk::CommandPoolCreateFlags::empty()).unwrap();
        let cmds = sim.allocate_command_buffers(pool, 2).unwrap();
        let flags = vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT;

        // Draw reading indices 0..12, left pending
        sim.begin_command_buffer(cmds[0], flags).unwrap();
        sim.cmd_bind_index_buffer(cmds[0], buffer, 0);
        sim.cmd_draw_indexed(cmds[0], 3);
        sim.end_command_buffer(cmds[0]).unwrap();
        let draw = [cmds[0]];
        let submission = Submission {
            command_buffers: &draw,
            ..Default::default()
        };
        sim.queue_submit(&submission, vk::Fence::null()).unwrap();
        let before = sim.violations().len();

        // Disjoint copy is fine, an overlapping one races the draw
        sim.begin_command_buffer(cmds[1], flags).unwrap();
        let region = |dst_offset, size| vk::BufferCopy {
            src_offset: 32,
            dst_offset,
            size,
        };
        sim.cmd_copy_buffer(cmds[1], buffer, buffer, region(12, 4));
        sim.cmd_copy_buffer(cmds[1], buffer, buffer, region(8, 8));
        sim.end_command_buffer(cmds[1]).unwrap();
        let copy = [cmds[1]];
        let submission = Submission {
            command_buffers: &copy,
            ..Default::default()
        };
        sim.queue_submit(&submission, vk::Fence::null()).unwrap();

        let violations = sim.violations();
        assert_eq!(violations.len(), before + 1);
        assert!(violations[before].contains("races a pending draw"));
    }

    #[test]
    fn test_failed_idle_wait_leaves_work_queued() {
        let sim = SimDevice::new();
        let fence = sim.create_fence(false).unwrap();
        submit_empty(&sim, fence);

        sim.fail_next_wait_idle();
        assert_eq!(sim.wait_idle(), Err(vk::Result::ERROR_DEVICE_LOST));
        assert_eq!(sim.fence_state(fence), Some(FenceState::Pending));
        assert_eq!(sim.wait_idle(), Ok(()));
        assert_eq!(sim.fence_state(fence), Some(FenceState::Signaled));
    }

    #[test]
    fn test_rejects_non_spirv() {
        let sim = SimDevice::new();
        assert!(sim.create_shader_module(&[0xdead_beef]).is_err());
        assert!(sim.create_shader_module(&[SPIRV_MAGIC, 0]).is_ok());
    }
}
