//! Shared setup for the integration tests: a simulated device behind the
//! real Vulkan backend, with in-memory shader bytecode.

#![allow(dead_code)]

use std::sync::Arc;

use frame_forge::backend::pipeline::OBJECT_SHADER;
use frame_forge::backend::shader::{MemoryShaderSource, ShaderStage};
use frame_forge::backend::{SimDevice, VulkanBackend};
use frame_forge::config::Config;
use frame_forge::platform::HeadlessWindow;
use frame_forge::renderer::{Renderer, RendererBackend};

pub const WIDTH: u32 = 1280;
pub const HEIGHT: u32 = 720;

/// Smallest blob the simulated driver accepts as SPIR-V
pub fn spirv_stub() -> Vec<u8> {
    bytemuck::cast_slice::<u32, u8>(&[0x0723_0203, 0x0001_0000, 0, 1, 0]).to_vec()
}

pub fn shaders() -> Box<MemoryShaderSource> {
    Box::new(
        MemoryShaderSource::new()
            .with(OBJECT_SHADER, ShaderStage::Vertex, spirv_stub())
            .with(OBJECT_SHADER, ShaderStage::Fragment, spirv_stub()),
    )
}

pub fn backend_with(sim: &Arc<SimDevice>, config: Config) -> VulkanBackend<SimDevice> {
    let mut backend = VulkanBackend::with_device(config, shaders(), sim.clone());
    backend
        .initialize("integration", &HeadlessWindow::new(WIDTH, HEIGHT))
        .expect("backend initializes on the simulated device");
    backend
}

pub fn backend(sim: &Arc<SimDevice>) -> VulkanBackend<SimDevice> {
    backend_with(sim, Config::default())
}

pub fn renderer(sim: &Arc<SimDevice>) -> Renderer {
    let backend = VulkanBackend::with_device(Config::default(), shaders(), sim.clone());
    Renderer::with_backend(
        Box::new(backend),
        "integration",
        &HeadlessWindow::new(WIDTH, HEIGHT),
    )
    .expect("renderer initializes on the simulated device")
}

pub fn assert_no_violations(sim: &SimDevice) {
    let violations = sim.violations();
    assert!(violations.is_empty(), "driver protocol violations: {:#?}", violations);
}
