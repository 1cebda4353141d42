//! Frame lifecycle and GPU resource synchronization for a Vulkan renderer.
//!
//! The [`renderer::Renderer`] frontend drives a [`renderer::RendererBackend`].
//! The Vulkan backend is generic over [`backend::GpuDevice`], which has a real
//! implementation on `ash` and a simulated one used for headless runs and tests.

pub mod backend;
pub mod config;
pub mod error;
pub mod platform;
pub mod renderer;

pub use config::Config;
pub use error::RendererError;
pub use renderer::{BackendType, FrameStatus, RenderPacket, Renderer, SkipReason};
