// GPU buffers for vertex, index, and staging data
//
// A GpuBuffer owns its handle and its memory and frees both on drop.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::gpu::GpuDevice;
use super::memory::{allocate_for, MemoryRequest};
use crate::error::RendererError;

pub struct GpuBuffer<D: GpuDevice> {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    memory_flags: vk::MemoryPropertyFlags,
    device: Arc<D>,
}

impl<D: GpuDevice> GpuBuffer<D> {
    pub fn new(
        device: Arc<D>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        request: MemoryRequest,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = device
            .create_buffer(&buffer_info)
            .context("Failed to create buffer")?;

        let requirements = device.buffer_memory_requirements(buffer);
        let allocation = match allocate_for(device.as_ref(), requirements, request) {
            Ok(allocation) => allocation,
            Err(e) => {
                device.destroy_buffer(buffer);
                return Err(e);
            }
        };

        let memory = allocation.memory;
        if let Err(e) = device.bind_buffer_memory(buffer, memory) {
            device.destroy_buffer(buffer);
            device.free_memory(memory);
            return Err(e).context("Failed to bind buffer memory");
        }

        Ok(Self {
            buffer,
            memory,
            size,
            memory_flags: allocation.flags,
            device,
        })
    }

    /// Host-visible transient buffer for uploads and readbacks
    pub fn staging(device: Arc<D>, size: vk::DeviceSize) -> Result<Self> {
        Self::new(
            device,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryRequest::HOST_VISIBLE,
        )
    }

    pub fn is_host_visible(&self) -> bool {
        self.memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub fn is_coherent(&self) -> bool {
        self.memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    /// Copy `data` into mapped memory at `offset`
    pub fn write(&self, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        if !self.is_host_visible() {
            return Err(RendererError::HostAccess.into());
        }
        self.device
            .write_memory(self.memory, offset, data, self.is_coherent())
            .context("Failed to map buffer memory for writing")
    }

    /// Copy `out.len()` bytes from mapped memory at `offset`
    pub fn read(&self, offset: vk::DeviceSize, out: &mut [u8]) -> Result<()> {
        if !self.is_host_visible() {
            return Err(RendererError::HostAccess.into());
        }
        self.device
            .read_memory(self.memory, offset, out, self.is_coherent())
            .context("Failed to map buffer memory for reading")
    }
}

impl<D: GpuDevice> Drop for GpuBuffer<D> {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.buffer);
        self.device.free_memory(self.memory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{ObjectKind, SimDevice};

    #[test]
    fn test_staging_write_read() {
        let sim = Arc::new(SimDevice::new());
        let staging = GpuBuffer::staging(sim.clone(), 8).unwrap();
        staging.write(2, &[1, 2, 3]).unwrap();

        let mut out = [0u8; 5];
        staging.read(0, &mut out).unwrap();
        assert_eq!(out, [0, 0, 1, 2, 3]);

        assert!(staging.is_coherent());
        assert_eq!(sim.stats().host_flushes, 0);
    }

    #[test]
    fn test_non_coherent_staging_is_flushed_and_invalidated() {
        let sim = Arc::new(SimDevice::non_coherent());
        let staging = GpuBuffer::staging(sim.clone(), 8).unwrap();
        assert!(staging.is_host_visible());
        assert!(!staging.is_coherent());

        staging.write(0, &[5; 8]).unwrap();
        let mut out = [0u8; 8];
        staging.read(0, &mut out).unwrap();

        assert_eq!(out, [5; 8]);
        let stats = sim.stats();
        assert_eq!((stats.host_flushes, stats.host_invalidates), (1, 1));
        assert!(sim.violations().is_empty());
    }

    #[test]
    fn test_device_local_rejects_host_access() {
        let sim = Arc::new(SimDevice::new());
        let buffer = GpuBuffer::new(
            sim.clone(),
            64,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            MemoryRequest::DEVICE_LOCAL,
        )
        .unwrap();
        let err = buffer.write(0, &[0; 4]).unwrap_err();
        assert_eq!(
            err.downcast_ref::<RendererError>(),
            Some(&RendererError::HostAccess)
        );
    }

    #[test]
    fn test_drop_releases_everything() {
        let sim = Arc::new(SimDevice::new());
        {
            let _buffer = GpuBuffer::staging(sim.clone(), 16).unwrap();
            assert_eq!(sim.live_count(ObjectKind::Buffer), 1);
            assert_eq!(sim.live_count(ObjectKind::Memory), 1);
        }
        assert_eq!(sim.live_count(ObjectKind::Buffer), 0);
        assert_eq!(sim.live_count(ObjectKind::Memory), 0);
        assert!(sim.violations().is_empty());
    }
}
