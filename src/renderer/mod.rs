// Renderer facade
//
// `RendererBackend` is what the frontend talks to. Each supported graphics
// API provides one implementation; the frontend only ever holds the trait
// object.

pub mod frontend;
pub mod types;

pub use frontend::Renderer;
pub use types::{
    FrameStatus, GlobalState, RenderPacket, SkipReason, TextureHandle, Vertex3d, VertexData,
};

use anyhow::Result;
use glam::{Mat4, Vec3, Vec4};

use crate::backend::device::VulkanDevice;
use crate::backend::shader::FileShaderSource;
use crate::backend::sim::SimDevice;
use crate::backend::vulkan_backend::VulkanBackend;
use crate::config::Config;
use crate::platform::PlatformWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// Real driver through ash
    Vulkan,
    /// Same engine over the simulated driver; no GPU or window system needed
    Headless,
}

impl BackendType {
    /// Backend named by `graphics.backend`, defaulting to Vulkan
    pub fn from_config(config: &Config) -> Self {
        match config.graphics.backend.to_lowercase().as_str() {
            "vulkan" => BackendType::Vulkan,
            "headless" | "sim" => BackendType::Headless,
            other => {
                log::warn!("Unknown backend '{}', defaulting to vulkan", other);
                BackendType::Vulkan
            }
        }
    }
}

pub trait RendererBackend {
    fn initialize(&mut self, app_name: &str, window: &dyn PlatformWindow) -> Result<()>;
    fn shutdown(&mut self);
    fn on_resized(&mut self, width: u32, height: u32);

    fn begin_frame(&mut self, delta_time: f32) -> Result<FrameStatus>;
    fn update_global_state(
        &mut self,
        projection: Mat4,
        view: Mat4,
        view_position: Vec3,
        ambient_color: Vec4,
        mode: i32,
    ) -> Result<()>;
    fn draw(&mut self, data: &VertexData) -> Result<()>;
    fn end_frame(&mut self, delta_time: f32) -> Result<()>;

    fn create_texture(
        &mut self,
        name: &str,
        width: u32,
        height: u32,
        channel_count: u8,
        pixels: &[u8],
        has_transparency: bool,
    ) -> Result<TextureHandle>;
    fn destroy_texture(&mut self, handle: TextureHandle);

    fn current_frame(&self) -> usize;
    fn frames_in_flight(&self) -> usize;
}

/// Build an uninitialized backend of the requested type
pub fn create_backend(backend_type: BackendType, config: &Config) -> Box<dyn RendererBackend> {
    let shaders = Box::new(FileShaderSource::new(config.assets.shader_dir.clone()));
    match backend_type {
        BackendType::Vulkan => Box::new(VulkanBackend::<VulkanDevice>::new(config.clone(), shaders)),
        BackendType::Headless => Box::new(VulkanBackend::<SimDevice>::new(config.clone(), shaders)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_type_from_config() {
        let mut config = Config::default();
        assert_eq!(BackendType::from_config(&config), BackendType::Vulkan);

        config.graphics.backend = "Headless".to_string();
        assert_eq!(BackendType::from_config(&config), BackendType::Headless);

        config.graphics.backend = "opengl".to_string();
        assert_eq!(BackendType::from_config(&config), BackendType::Vulkan);
    }
}
