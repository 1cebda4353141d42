//! Typed renderer failures.
//!
//! Everything here is fatal for the operation that raised it. Per-frame
//! recoverable outcomes are reported as [`crate::renderer::FrameStatus`]
//! values instead. Functions return `anyhow::Result`, so callers that need
//! to branch on a specific failure use `err.downcast_ref::<RendererError>()`.

use ash::vk;
use thiserror::Error;

use crate::backend::command::CommandBufferState;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RendererError {
    #[error("No suitable GPU found: {0}")]
    NoSuitableDevice(String),
    #[error("Surface offers no usable format")]
    NoSurfaceFormat,
    #[error("Window does not expose native handles for surface creation")]
    MissingWindowHandle,
    #[error("Unsupported image layout transition {old:?} -> {new:?}")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },
    #[error("Command buffer cannot {action} while {state:?}")]
    InvalidCommandBufferState {
        action: &'static str,
        state: CommandBufferState,
    },
    #[error("Queue submission failed: {0}")]
    SubmitFailed(vk::Result),
    #[error("No memory type satisfies {0:?}")]
    NoSuitableMemoryType(vk::MemoryPropertyFlags),
    #[error("Renderer backend is not initialized")]
    NotInitialized,
    #[error("No frame is being recorded")]
    NoFrameInProgress,
    #[error("Geometry buffer full: {requested} bytes requested, {available} available")]
    GeometryBufferFull { requested: u64, available: u64 },
    #[error("Invalid texture '{name}': {reason}")]
    InvalidTexture { name: String, reason: String },
    #[error("Identifier space exhausted for {0}")]
    IdExhausted(&'static str),
    #[error("Memory is not host visible")]
    HostAccess,
}
