//! Types shared between the frontend and the backends.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};

/// Vertex layout of the object shader: position then texture coordinate
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex3d {
    pub position: Vec3,
    pub tex_coord: Vec2,
}

impl Vertex3d {
    pub fn new(position: Vec3, tex_coord: Vec2) -> Self {
        Self {
            position,
            tex_coord,
        }
    }
}

/// Indexed geometry for one draw
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VertexData {
    pub vertices: Vec<Vertex3d>,
    pub indices: Vec<u32>,
}

impl VertexData {
    /// Unit quad in the XY plane, facing +Z
    pub fn quad(half_extent: f32) -> Self {
        let e = half_extent;
        Self {
            vertices: vec![
                Vertex3d::new(Vec3::new(-e, -e, 0.0), Vec2::new(0.0, 0.0)),
                Vertex3d::new(Vec3::new(e, e, 0.0), Vec2::new(1.0, 1.0)),
                Vertex3d::new(Vec3::new(-e, e, 0.0), Vec2::new(0.0, 1.0)),
                Vertex3d::new(Vec3::new(e, -e, 0.0), Vec2::new(1.0, 0.0)),
            ],
            indices: vec![0, 1, 2, 0, 3, 1],
        }
    }
}

/// Why a frame was not rendered. The caller just tries again next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A swapchain rebuild was already running
    Recreating,
    /// The swapchain was rebuilt for a new framebuffer size
    Resized,
    /// The framebuffer has a zero dimension
    NotReady,
    FenceTimeout,
    /// Acquire reported the swapchain out of date; it has been rebuilt
    OutOfDate,
    /// No swapchain image became available in time
    ImageUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Ready,
    Skipped(SkipReason),
}

impl FrameStatus {
    pub fn is_ready(self) -> bool {
        self == FrameStatus::Ready
    }
}

/// Opaque id of a texture owned by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub u32);

/// Per-frame constants shared by every draw
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalState {
    pub projection: Mat4,
    pub view: Mat4,
    pub view_position: Vec3,
    pub ambient_color: Vec4,
    pub mode: i32,
}

impl Default for GlobalState {
    fn default() -> Self {
        Self {
            projection: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            view_position: Vec3::ZERO,
            ambient_color: Vec4::ONE,
            mode: 0,
        }
    }
}

/// What the application hands the renderer each tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderPacket {
    pub delta_time: f32,
    pub view: Mat4,
    pub view_position: Vec3,
}

impl Default for RenderPacket {
    fn default() -> Self {
        Self {
            delta_time: 0.0,
            view: Mat4::IDENTITY,
            view_position: Vec3::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex3d>(), 20);
    }

    #[test]
    fn test_quad_shape() {
        let quad = VertexData::quad(1.0);
        assert_eq!(quad.vertices.len(), 4);
        assert_eq!(quad.indices, vec![0, 1, 2, 0, 3, 1]);
    }
}
