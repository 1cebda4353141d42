// Shader module loading
//
// Vulkan consumes SPIR-V. Bytecode is fetched as opaque blobs keyed by
// shader name and stage, so the renderer never cares where it came from.

use anyhow::{Context, Result};
use ash::vk;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;

use super::gpu::GpuDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    pub fn extension(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vert",
            ShaderStage::Fragment => "frag",
        }
    }

    pub fn flags(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

/// Where SPIR-V bytecode comes from
pub trait ShaderSource {
    fn load(&self, name: &str, stage: ShaderStage) -> Result<Vec<u8>>;
}

/// Reads `<dir>/<name>.<stage>.spv`
#[derive(Debug, Clone)]
pub struct FileShaderSource {
    pub dir: PathBuf,
}

impl FileShaderSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, name: &str, stage: ShaderStage) -> PathBuf {
        self.dir.join(format!("{}.{}.spv", name, stage.extension()))
    }
}

impl ShaderSource for FileShaderSource {
    fn load(&self, name: &str, stage: ShaderStage) -> Result<Vec<u8>> {
        let path = self.path_for(name, stage);
        std::fs::read(&path).with_context(|| format!("Failed to read shader {:?}", path))
    }
}

/// Bytecode held in memory, for embedded shaders and tests
#[derive(Debug, Clone, Default)]
pub struct MemoryShaderSource {
    blobs: HashMap<(String, ShaderStage), Vec<u8>>,
}

impl MemoryShaderSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, stage: ShaderStage, bytes: Vec<u8>) -> Self {
        self.blobs.insert((name.to_string(), stage), bytes);
        self
    }
}

impl ShaderSource for MemoryShaderSource {
    fn load(&self, name: &str, stage: ShaderStage) -> Result<Vec<u8>> {
        self.blobs
            .get(&(name.to_string(), stage))
            .cloned()
            .with_context(|| format!("No shader {}.{}", name, stage.extension()))
    }
}

/// Load `name.<stage>` from `source` and create a shader module
pub fn create_shader_module<D: GpuDevice>(
    device: &D,
    source: &dyn ShaderSource,
    name: &str,
    stage: ShaderStage,
) -> Result<vk::ShaderModule> {
    let bytes = source.load(name, stage)?;

    // read_spv checks the length and realigns the bytes into words
    let code = ash::util::read_spv(&mut Cursor::new(&bytes))
        .with_context(|| format!("Shader {}.{} is not SPIR-V", name, stage.extension()))?;

    device
        .create_shader_module(&code)
        .with_context(|| format!("Failed to create shader module {}.{}", name, stage.extension()))
}
