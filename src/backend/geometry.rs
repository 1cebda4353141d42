// Per-frame geometry buffers
//
// One device-local vertex buffer and one index buffer, split into an equal
// region per frame slot. A slot only rewrites its own region, and only after
// its fence has signaled, so a frame still on the GPU never has its geometry
// overwritten by the next one.

use anyhow::Result;
use ash::vk;
use std::mem::size_of;
use std::sync::Arc;

use super::buffer::GpuBuffer;
use super::command::CommandPool;
use super::gpu::GpuDevice;
use super::memory::MemoryRequest;
use super::upload::upload_to_buffer;
use crate::error::RendererError;
use crate::renderer::types::{Vertex3d, VertexData};

/// Byte offsets a draw's data was written at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryRange {
    pub vertex_offset: vk::DeviceSize,
    pub index_offset: vk::DeviceSize,
}

pub struct GeometryBuffers<D: GpuDevice> {
    pub vertex_buffer: GpuBuffer<D>,
    pub index_buffer: GpuBuffer<D>,
    /// Bytes per slot
    vertex_region: vk::DeviceSize,
    index_region: vk::DeviceSize,
    slots: usize,
    slot: usize,
    // Relative to the current slot's region
    vertex_offset: vk::DeviceSize,
    index_offset: vk::DeviceSize,
}

impl<D: GpuDevice> GeometryBuffers<D> {
    /// `vertex_capacity` and `index_capacity` are per frame slot
    pub fn new(
        device: Arc<D>,
        vertex_capacity: u64,
        index_capacity: u64,
        slots: usize,
    ) -> Result<Self> {
        let slots = slots.max(1);
        let usage = vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC;
        let vertex_region = vertex_capacity * size_of::<Vertex3d>() as u64;
        let index_region = index_capacity * size_of::<u32>() as u64;

        let vertex_buffer = GpuBuffer::new(
            device.clone(),
            vertex_region * slots as u64,
            usage | vk::BufferUsageFlags::VERTEX_BUFFER,
            MemoryRequest::DEVICE_LOCAL,
        )?;
        let index_buffer = GpuBuffer::new(
            device,
            index_region * slots as u64,
            usage | vk::BufferUsageFlags::INDEX_BUFFER,
            MemoryRequest::DEVICE_LOCAL,
        )?;

        log::debug!(
            "Geometry buffers: {} vertices, {} indices per slot, {} slots",
            vertex_capacity,
            index_capacity,
            slots
        );

        Ok(Self {
            vertex_buffer,
            index_buffer,
            vertex_region,
            index_region,
            slots,
            slot: 0,
            vertex_offset: 0,
            index_offset: 0,
        })
    }

    /// Start writing into `slot`'s region from its beginning. The caller must
    /// have waited for the slot's previous frame.
    pub fn begin_slot(&mut self, slot: usize) {
        self.slot = slot % self.slots;
        self.vertex_offset = 0;
        self.index_offset = 0;
    }

    /// Upload `data` behind everything written to the current slot this frame
    pub fn append(
        &mut self,
        device: &Arc<D>,
        pool: &CommandPool<D>,
        data: &VertexData,
    ) -> Result<GeometryRange> {
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&data.vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(&data.indices);

        check_capacity(vertex_bytes.len(), self.vertex_offset, self.vertex_region)?;
        check_capacity(index_bytes.len(), self.index_offset, self.index_region)?;

        let slot = self.slot as u64;
        let range = GeometryRange {
            vertex_offset: slot * self.vertex_region + self.vertex_offset,
            index_offset: slot * self.index_region + self.index_offset,
        };

        upload_to_buffer(device, pool, &self.vertex_buffer, range.vertex_offset, vertex_bytes)?;
        upload_to_buffer(device, pool, &self.index_buffer, range.index_offset, index_bytes)?;

        self.vertex_offset += vertex_bytes.len() as u64;
        self.index_offset += index_bytes.len() as u64;
        Ok(range)
    }
}

fn check_capacity(len: usize, offset: u64, size: u64) -> Result<(), RendererError> {
    let requested = len as u64;
    let available = size.saturating_sub(offset);
    if requested > available {
        return Err(RendererError::GeometryBufferFull {
            requested,
            available,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimDevice;
    use crate::backend::upload::download;
    use glam::{Vec2, Vec3};

    fn triangle() -> VertexData {
        VertexData {
            vertices: vec![
                Vertex3d::new(Vec3::ZERO, Vec2::ZERO),
                Vertex3d::new(Vec3::X, Vec2::X),
                Vertex3d::new(Vec3::Y, Vec2::Y),
            ],
            indices: vec![0, 1, 2],
        }
    }

    #[test]
    fn test_appends_then_rewinds() {
        let sim = Arc::new(SimDevice::new());
        let pool = CommandPool::new(sim.clone()).unwrap();
        let mut geometry = GeometryBuffers::new(sim.clone(), 16, 16, 1).unwrap();

        let first = geometry.append(&sim, &pool, &triangle()).unwrap();
        let second = geometry.append(&sim, &pool, &triangle()).unwrap();
        assert_eq!(first.vertex_offset, 0);
        assert_eq!(second.vertex_offset, 60);
        assert_eq!(second.index_offset, 12);

        let indices = download(&sim, &pool, &geometry.index_buffer, 12, 12).unwrap();
        assert_eq!(indices, bytemuck::cast_slice::<u32, u8>(&[0, 1, 2]));

        geometry.begin_slot(0);
        assert_eq!(geometry.append(&sim, &pool, &triangle()).unwrap(), first);
    }

    #[test]
    fn test_slots_write_disjoint_regions() {
        let sim = Arc::new(SimDevice::new());
        let pool = CommandPool::new(sim.clone()).unwrap();
        let mut geometry = GeometryBuffers::new(sim.clone(), 16, 16, 2).unwrap();
        assert_eq!(geometry.vertex_buffer.size, 2 * 16 * 20);

        geometry.begin_slot(0);
        let first = geometry.append(&sim, &pool, &triangle()).unwrap();
        geometry.begin_slot(1);
        let second = geometry.append(&sim, &pool, &triangle()).unwrap();

        assert_eq!(first.vertex_offset, 0);
        assert_eq!(second.vertex_offset, 16 * 20);
        assert_eq!(second.index_offset, 16 * 4);

        // Slot indices wrap
        geometry.begin_slot(2);
        assert_eq!(geometry.append(&sim, &pool, &triangle()).unwrap(), first);
    }

    #[test]
    fn test_overflow_is_reported() {
        let sim = Arc::new(SimDevice::new());
        let pool = CommandPool::new(sim.clone()).unwrap();
        let mut geometry = GeometryBuffers::new(sim.clone(), 4, 16, 1).unwrap();

        geometry.append(&sim, &pool, &triangle()).unwrap();
        let err = geometry.append(&sim, &pool, &triangle()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<RendererError>(),
            Some(&RendererError::GeometryBufferFull {
                requested: 60,
                available: 20,
            })
        );
    }
}
