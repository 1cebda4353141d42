// Backend module - Vulkan abstraction layer
//
// Everything below `gpu` is written against the `GpuDevice` seam, so the same
// swapchain, sync and upload code runs on a real GPU or on the simulator.

pub mod buffer;
pub mod command;
pub mod context;
pub mod device;
pub mod geometry;
pub mod gpu;
pub mod image;
pub mod memory;
pub mod pipeline;
pub mod render_target;
pub mod shader;
pub mod sim;
pub mod swapchain;
pub mod sync;
pub mod texture;
pub mod upload;
pub mod vulkan_backend;

pub use context::GraphicsContext;
pub use device::VulkanDevice;
pub use gpu::GpuDevice;
pub use sim::SimDevice;
pub use swapchain::Swapchain;
pub use vulkan_backend::VulkanBackend;
