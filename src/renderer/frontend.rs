// Frontend driver
//
// Owns the active backend and the scene it draws: loaded meshes and the
// objects that reference them. Ids are handed out monotonically and never
// reused.

use anyhow::{Context, Result};
use glam::{Mat4, Vec4};
use std::collections::BTreeMap;

use super::types::{FrameStatus, RenderPacket, TextureHandle, VertexData};
use super::{create_backend, BackendType, RendererBackend};
use crate::config::Config;
use crate::error::RendererError;
use crate::platform::PlatformWindow;

const FIELD_OF_VIEW_DEGREES: f32 = 45.0;
const NEAR_CLIP: f32 = 0.1;
const FAR_CLIP: f32 = 1000.0;

const DEFAULT_TEXTURE_NAME: &str = "default";
const DEFAULT_TEXTURE_SIZE: u32 = 512;

pub type MeshId = u32;
pub type ObjectId = u32;

/// A mesh placed in the scene
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderObject {
    pub mesh: MeshId,
    pub texture: TextureHandle,
}

/// Blue/white checkerboard, one texel per square
fn checkerboard(size: u32) -> Vec<u8> {
    let mut pixels = vec![0xFF; (size * size * 4) as usize];
    for row in 0..size {
        for col in 0..size {
            if row % 2 == col % 2 {
                let i = ((row * size + col) * 4) as usize;
                pixels[i] = 0;
                pixels[i + 1] = 0;
            }
        }
    }
    pixels
}

fn next_id(counter: &mut u32, what: &'static str) -> Result<u32, RendererError> {
    let id = *counter;
    *counter = id.checked_add(1).ok_or(RendererError::IdExhausted(what))?;
    Ok(id)
}

pub struct Renderer {
    backend: Box<dyn RendererBackend>,
    frame_number: u64,
    projection: Mat4,

    meshes: BTreeMap<MeshId, VertexData>,
    objects: BTreeMap<ObjectId, RenderObject>,
    next_mesh_id: u32,
    next_object_id: u32,
    default_texture: TextureHandle,
}

impl Renderer {
    /// Create and initialize the backend named by `backend_type`
    pub fn new(
        backend_type: BackendType,
        app_name: &str,
        window: &dyn PlatformWindow,
        config: &Config,
    ) -> Result<Self> {
        log::info!("Creating {:?} renderer", backend_type);
        Self::with_backend(create_backend(backend_type, config), app_name, window)
    }

    /// Initialize an already constructed backend and take ownership of it
    pub fn with_backend(
        mut backend: Box<dyn RendererBackend>,
        app_name: &str,
        window: &dyn PlatformWindow,
    ) -> Result<Self> {
        backend
            .initialize(app_name, window)
            .context("Renderer backend failed to initialize")?;

        let size = DEFAULT_TEXTURE_SIZE;
        let default_texture = backend
            .create_texture(DEFAULT_TEXTURE_NAME, size, size, 4, &checkerboard(size), false)
            .context("Failed to create default texture")?;

        let (width, height) = window.framebuffer_size();
        Ok(Self {
            backend,
            frame_number: 0,
            projection: perspective(width, height),
            meshes: BTreeMap::new(),
            objects: BTreeMap::new(),
            next_mesh_id: 0,
            next_object_id: 0,
            default_texture,
        })
    }

    pub fn backend(&self) -> &dyn RendererBackend {
        self.backend.as_ref()
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn default_texture(&self) -> TextureHandle {
        self.default_texture
    }

    pub fn objects(&self) -> impl Iterator<Item = (&ObjectId, &RenderObject)> {
        self.objects.iter()
    }

    pub fn load_mesh(&mut self, data: VertexData) -> Result<MeshId> {
        let id = next_id(&mut self.next_mesh_id, "meshes")?;
        log::debug!(
            "Mesh {} loaded: {} vertices, {} indices",
            id,
            data.vertices.len(),
            data.indices.len()
        );
        self.meshes.insert(id, data);
        Ok(id)
    }

    /// Place `mesh` in the scene. `None` uses the default texture.
    pub fn register_object(
        &mut self,
        mesh: MeshId,
        texture: Option<TextureHandle>,
    ) -> Result<ObjectId> {
        if !self.meshes.contains_key(&mesh) {
            anyhow::bail!("Cannot register object: mesh {} is not loaded", mesh);
        }
        let id = next_id(&mut self.next_object_id, "objects")?;
        self.objects.insert(
            id,
            RenderObject {
                mesh,
                texture: texture.unwrap_or(self.default_texture),
            },
        );
        Ok(id)
    }

    pub fn create_texture(
        &mut self,
        name: &str,
        width: u32,
        height: u32,
        channel_count: u8,
        pixels: &[u8],
        has_transparency: bool,
    ) -> Result<TextureHandle> {
        self.backend
            .create_texture(name, width, height, channel_count, pixels, has_transparency)
    }

    pub fn destroy_texture(&mut self, handle: TextureHandle) {
        self.backend.destroy_texture(handle);
    }

    pub fn on_resized(&mut self, width: u32, height: u32) {
        self.projection = perspective(width, height);
        self.backend.on_resized(width, height);
    }

    /// Render one frame. A skipped frame is not an error; the caller simply
    /// calls again next tick. An `Err` is fatal.
    pub fn draw_frame(&mut self, packet: &RenderPacket) -> Result<FrameStatus> {
        let status = self.backend.begin_frame(packet.delta_time)?;
        if status != FrameStatus::Ready {
            return Ok(status);
        }

        let recorded = self.record_scene(packet);
        // The frame has begun, so it is always submitted
        let ended = self.backend.end_frame(packet.delta_time);
        recorded?;
        ended.context("end_frame failed")?;

        self.frame_number += 1;
        Ok(status)
    }

    fn record_scene(&mut self, packet: &RenderPacket) -> Result<()> {
        self.backend.update_global_state(
            self.projection,
            packet.view,
            packet.view_position,
            Vec4::ONE,
            0,
        )?;

        for object in self.objects.values() {
            if let Some(mesh) = self.meshes.get(&object.mesh) {
                self.backend.draw(mesh)?;
            }
        }
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.objects.clear();
        self.meshes.clear();
        self.backend.shutdown();
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn perspective(width: u32, height: u32) -> Mat4 {
    let aspect = width.max(1) as f32 / height.max(1) as f32;
    Mat4::perspective_rh(FIELD_OF_VIEW_DEGREES.to_radians(), aspect, NEAR_CLIP, FAR_CLIP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkerboard_pattern() {
        let pixels = checkerboard(4);
        // (0,0) is blue, (0,1) white, (1,1) blue
        assert_eq!(&pixels[0..4], &[0, 0, 255, 255]);
        assert_eq!(&pixels[4..8], &[255, 255, 255, 255]);
        assert_eq!(&pixels[20..24], &[0, 0, 255, 255]);
    }

    #[test]
    fn test_ids_are_monotonic_and_bounded() {
        let mut counter = 0;
        assert_eq!(next_id(&mut counter, "meshes").unwrap(), 0);
        assert_eq!(next_id(&mut counter, "meshes").unwrap(), 1);

        let mut counter = u32::MAX;
        assert_eq!(
            next_id(&mut counter, "objects"),
            Err(RendererError::IdExhausted("objects"))
        );
        assert_eq!(counter, u32::MAX);
    }

    #[test]
    fn test_perspective_tolerates_zero_height() {
        let m = perspective(1280, 0);
        assert!(m.is_finite());
    }
}
