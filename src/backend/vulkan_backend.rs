// Vulkan renderer backend
//
// Implements `RendererBackend` on top of any `GpuDevice`. With `VulkanDevice`
// this is the real renderer; with `SimDevice` it is the headless one.

use anyhow::{Context, Result};
use glam::{Mat4, Vec3, Vec4};
use std::collections::HashMap;
use std::sync::Arc;

use super::context::GraphicsContext;
use super::geometry::GeometryBuffers;
use super::gpu::GpuDevice;
use super::pipeline::ObjectShaderPipeline;
use super::shader::ShaderSource;
use super::texture::Texture;
use crate::config::Config;
use crate::error::RendererError;
use crate::platform::PlatformWindow;
use crate::renderer::types::{FrameStatus, GlobalState, TextureHandle, VertexData};
use crate::renderer::RendererBackend;

/// Everything that exists between `initialize` and `shutdown`
struct BackendState<D: GpuDevice> {
    // Declaration order is drop order
    textures: HashMap<TextureHandle, Texture<D>>,
    geometry: GeometryBuffers<D>,
    pipeline: ObjectShaderPipeline<D>,
    context: GraphicsContext<D>,
    next_texture_id: u32,
    global: GlobalState,
}

impl<D: GpuDevice> Drop for BackendState<D> {
    fn drop(&mut self) {
        // Textures and geometry may still be referenced by in-flight frames
        if let Err(e) = self.context.device().wait_idle() {
            log::error!("Device idle wait failed during shutdown: {:?}", e);
        }
    }
}

pub struct VulkanBackend<D: GpuDevice> {
    config: Config,
    shaders: Box<dyn ShaderSource>,
    /// Device supplied by the caller instead of created in `initialize`
    injected: Option<Arc<D>>,
    state: Option<BackendState<D>>,
}

impl<D: GpuDevice> VulkanBackend<D> {
    pub fn new(config: Config, shaders: Box<dyn ShaderSource>) -> Self {
        Self {
            config,
            shaders,
            injected: None,
            state: None,
        }
    }

    /// Run on an existing device. `initialize` skips device creation.
    pub fn with_device(config: Config, shaders: Box<dyn ShaderSource>, device: Arc<D>) -> Self {
        Self {
            config,
            shaders,
            injected: Some(device),
            state: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    pub fn context(&self) -> Option<&GraphicsContext<D>> {
        self.state.as_ref().map(|s| &s.context)
    }

    pub fn global_state(&self) -> Option<&GlobalState> {
        self.state.as_ref().map(|s| &s.global)
    }

    pub fn geometry(&self) -> Option<&GeometryBuffers<D>> {
        self.state.as_ref().map(|s| &s.geometry)
    }

    pub fn texture(&self, handle: TextureHandle) -> Option<&Texture<D>> {
        self.state.as_ref().and_then(|s| s.textures.get(&handle))
    }

    fn state_mut(&mut self) -> Result<&mut BackendState<D>, RendererError> {
        self.state.as_mut().ok_or(RendererError::NotInitialized)
    }
}

impl<D: GpuDevice> RendererBackend for VulkanBackend<D> {
    fn initialize(&mut self, app_name: &str, window: &dyn PlatformWindow) -> Result<()> {
        if self.state.is_some() {
            log::warn!("Backend already initialized");
            return Ok(());
        }

        let device = match &self.injected {
            Some(device) => device.clone(),
            None => Arc::new(
                D::create(app_name, window, &self.config)
                    .context("Failed to create device context")?,
            ),
        };

        let (width, height) = window.framebuffer_size();
        let context = GraphicsContext::new(device.clone(), width, height, &self.config)
            .context("Failed to create graphics context")?;
        let pipeline = ObjectShaderPipeline::new(
            device.clone(),
            self.shaders.as_ref(),
            context.render_target.render_pass,
        )?;
        let geometry = GeometryBuffers::new(
            device,
            self.config.graphics.vertex_capacity,
            self.config.graphics.index_capacity,
            context.frames_in_flight(),
        )?;

        self.state = Some(BackendState {
            textures: HashMap::new(),
            geometry,
            pipeline,
            context,
            next_texture_id: 0,
            global: GlobalState::default(),
        });

        log::info!("Renderer backend initialized for '{}'", app_name);
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.state.take().is_some() {
            log::info!("Renderer backend shut down");
        }
    }

    fn on_resized(&mut self, width: u32, height: u32) {
        match self.state.as_mut() {
            Some(state) => state.context.on_resized(width, height),
            None => log::warn!("Resize to {}x{} before initialization ignored", width, height),
        }
    }

    fn begin_frame(&mut self, _delta_time: f32) -> Result<FrameStatus> {
        let state = self.state_mut()?;
        let status = state.context.begin_frame()?;
        if status == FrameStatus::Ready {
            // The slot's fence has been waited, so its geometry region is free
            state.geometry.begin_slot(state.context.current_frame());
        }
        Ok(status)
    }

    fn update_global_state(
        &mut self,
        projection: Mat4,
        view: Mat4,
        view_position: Vec3,
        ambient_color: Vec4,
        mode: i32,
    ) -> Result<()> {
        let state = self.state_mut()?;
        let cmd = state.context.frame_command_buffer()?;
        state.pipeline.bind(cmd)?;
        state.pipeline.push_matrices(cmd, projection, view)?;

        state.global = GlobalState {
            projection,
            view,
            view_position,
            ambient_color,
            mode,
        };
        Ok(())
    }

    fn draw(&mut self, data: &VertexData) -> Result<()> {
        let state = self.state_mut()?;
        if data.indices.is_empty() {
            return Ok(());
        }

        let cmd = state.context.frame_command_buffer()?;
        let device = state.context.device();
        let range = state
            .geometry
            .append(device, state.context.commands(), data)
            .context("Failed to upload draw geometry")?;

        device.cmd_bind_vertex_buffer(
            cmd.handle,
            state.geometry.vertex_buffer.buffer,
            range.vertex_offset,
        );
        device.cmd_bind_index_buffer(
            cmd.handle,
            state.geometry.index_buffer.buffer,
            range.index_offset,
        );
        device.cmd_draw_indexed(cmd.handle, data.indices.len() as u32);
        Ok(())
    }

    fn end_frame(&mut self, _delta_time: f32) -> Result<()> {
        self.state_mut()?.context.end_frame()
    }

    fn create_texture(
        &mut self,
        name: &str,
        width: u32,
        height: u32,
        channel_count: u8,
        pixels: &[u8],
        has_transparency: bool,
    ) -> Result<TextureHandle> {
        let state = self.state_mut()?;
        let handle = TextureHandle(state.next_texture_id);
        let next = state
            .next_texture_id
            .checked_add(1)
            .ok_or(RendererError::IdExhausted("textures"))?;

        let texture = Texture::new(
            state.context.device().clone(),
            state.context.commands(),
            name,
            width,
            height,
            channel_count,
            pixels,
            has_transparency,
        )?;

        state.next_texture_id = next;
        state.textures.insert(handle, texture);
        Ok(handle)
    }

    fn destroy_texture(&mut self, handle: TextureHandle) {
        let Some(state) = self.state.as_mut() else {
            log::warn!("destroy_texture({:?}) before initialization", handle);
            return;
        };
        if !state.textures.contains_key(&handle) {
            log::warn!("destroy_texture: unknown texture {:?}", handle);
            return;
        }

        // A frame in flight may still sample it
        if let Err(e) = state.context.device().wait_idle() {
            log::error!("Device idle wait failed, keeping texture {:?}: {:?}", handle, e);
            return;
        }
        if let Some(texture) = state.textures.remove(&handle) {
            log::debug!("Texture '{}' destroyed", texture.name);
        }
    }

    fn current_frame(&self) -> usize {
        self.state
            .as_ref()
            .map_or(0, |s| s.context.current_frame())
    }

    fn frames_in_flight(&self) -> usize {
        self.state
            .as_ref()
            .map_or(0, |s| s.context.frames_in_flight())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::shader::{MemoryShaderSource, ShaderStage};
    use crate::backend::sim::{ObjectKind, SimDevice};
    use crate::backend::pipeline::OBJECT_SHADER;
    use crate::platform::HeadlessWindow;

    fn spirv_stub() -> Vec<u8> {
        bytemuck::cast_slice::<u32, u8>(&[0x0723_0203, 0x0001_0000, 0, 1, 0]).to_vec()
    }

    fn backend(sim: &Arc<SimDevice>) -> VulkanBackend<SimDevice> {
        let shaders = MemoryShaderSource::new()
            .with(OBJECT_SHADER, ShaderStage::Vertex, spirv_stub())
            .with(OBJECT_SHADER, ShaderStage::Fragment, spirv_stub());
        let mut backend =
            VulkanBackend::with_device(Config::default(), Box::new(shaders), sim.clone());
        backend
            .initialize("test", &HeadlessWindow::new(1280, 720))
            .unwrap();
        backend
    }

    #[test]
    fn test_calls_before_initialize_fail() {
        let sim = Arc::new(SimDevice::new());
        let mut backend: VulkanBackend<SimDevice> =
            VulkanBackend::with_device(Config::default(), Box::new(MemoryShaderSource::new()), sim);

        let err = backend.begin_frame(0.0).unwrap_err();
        assert_eq!(
            err.downcast_ref::<RendererError>(),
            Some(&RendererError::NotInitialized)
        );
        assert_eq!(backend.current_frame(), 0);
    }

    #[test]
    fn test_draw_outside_frame_is_an_error() {
        let sim = Arc::new(SimDevice::new());
        let mut backend = backend(&sim);
        let err = backend.draw(&VertexData::quad(0.5)).unwrap_err();
        assert_eq!(
            err.downcast_ref::<RendererError>(),
            Some(&RendererError::NoFrameInProgress)
        );
    }

    #[test]
    fn test_global_state_is_retained() {
        let sim = Arc::new(SimDevice::new());
        let mut backend = backend(&sim);

        assert_eq!(backend.begin_frame(0.016).unwrap(), FrameStatus::Ready);
        let ambient = Vec4::new(0.1, 0.2, 0.3, 1.0);
        backend
            .update_global_state(Mat4::IDENTITY, Mat4::IDENTITY, Vec3::ONE, ambient, 2)
            .unwrap();
        backend.end_frame(0.016).unwrap();

        let global = backend.global_state().unwrap();
        assert_eq!(global.view_position, Vec3::ONE);
        assert_eq!(global.ambient_color, ambient);
        assert_eq!(global.mode, 2);
    }

    #[test]
    fn test_texture_ids_are_not_reused() {
        let sim = Arc::new(SimDevice::new());
        let mut backend = backend(&sim);

        let a = backend.create_texture("a", 1, 1, 4, &[0; 4], false).unwrap();
        backend.destroy_texture(a);
        let b = backend.create_texture("b", 1, 1, 4, &[0; 4], false).unwrap();
        assert_ne!(a, b);
        assert!(backend.texture(a).is_none());
        assert!(backend.texture(b).is_some());

        // Unknown handles are ignored
        backend.destroy_texture(TextureHandle(99));
        assert_eq!(sim.live_count(ObjectKind::Sampler), 1);
    }

    #[test]
    fn test_texture_survives_failed_idle_wait() {
        let sim = Arc::new(SimDevice::new());
        let mut backend = backend(&sim);
        let handle = backend.create_texture("t", 1, 1, 4, &[0; 4], false).unwrap();

        sim.fail_next_wait_idle();
        backend.destroy_texture(handle);
        assert!(backend.texture(handle).is_some());
        assert_eq!(sim.live_count(ObjectKind::Sampler), 1);

        backend.destroy_texture(handle);
        assert!(backend.texture(handle).is_none());
        assert_eq!(sim.live_count(ObjectKind::Sampler), 0);
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let sim = Arc::new(SimDevice::new());
        let mut backend = backend(&sim);
        backend.create_texture("t", 2, 2, 3, &[7; 12], false).unwrap();
        backend.shutdown();

        assert!(!backend.is_initialized());
        for kind in [
            ObjectKind::Sampler,
            ObjectKind::Image,
            ObjectKind::Buffer,
            ObjectKind::Memory,
            ObjectKind::Pipeline,
            ObjectKind::PipelineLayout,
            ObjectKind::CommandPool,
        ] {
            assert_eq!(sim.live_count(kind), 0, "{:?} leaked", kind);
        }
        assert!(sim.violations().is_empty(), "{:?}", sim.violations());
    }
}
