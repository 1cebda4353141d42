// Staged uploads
//
// Host data reaches device-local memory through a transient host-visible
// staging buffer and a single-use command buffer. Every function here blocks
// until the GPU copy has completed, and is meant for bulk asset data.

use anyhow::{bail, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::GpuBuffer;
use super::command::CommandPool;
use super::gpu::GpuDevice;
use super::image::GpuImage;

fn out_of_bounds(offset: vk::DeviceSize, size: vk::DeviceSize, capacity: vk::DeviceSize) -> bool {
    offset.checked_add(size).map_or(true, |end| end > capacity)
}

/// Copy `size` bytes between buffers on the GPU and wait for it
pub fn copy_buffer<D: GpuDevice>(
    pool: &CommandPool<D>,
    device: &D,
    src: &GpuBuffer<D>,
    src_offset: vk::DeviceSize,
    dst: &GpuBuffer<D>,
    dst_offset: vk::DeviceSize,
    size: vk::DeviceSize,
) -> Result<()> {
    let cmd = pool.begin_single_use()?;

    let region = vk::BufferCopy {
        src_offset,
        dst_offset,
        size,
    };
    device.cmd_copy_buffer(cmd.handle, src.buffer, dst.buffer, region);

    pool.end_single_use(cmd)
}

/// Write `data` into `dest` at `offset` through a staging buffer
pub fn upload_to_buffer<D: GpuDevice>(
    device: &Arc<D>,
    pool: &CommandPool<D>,
    dest: &GpuBuffer<D>,
    offset: vk::DeviceSize,
    data: &[u8],
) -> Result<()> {
    let size = data.len() as vk::DeviceSize;
    if size == 0 {
        return Ok(());
    }
    if out_of_bounds(offset, size, dest.size) {
        bail!(
            "Upload of {} bytes at offset {} overflows a {} byte buffer",
            size,
            offset,
            dest.size
        );
    }

    let staging = GpuBuffer::staging(device.clone(), size)?;
    staging.write(0, data)?;

    copy_buffer(pool, device.as_ref(), &staging, 0, dest, offset, size)
}

/// Read `len` bytes back from any buffer by copying into a staging buffer
pub fn download<D: GpuDevice>(
    device: &Arc<D>,
    pool: &CommandPool<D>,
    src: &GpuBuffer<D>,
    offset: vk::DeviceSize,
    len: usize,
) -> Result<Vec<u8>> {
    let mut out = vec![0; len];
    if len == 0 {
        return Ok(out);
    }
    let size = len as vk::DeviceSize;
    if out_of_bounds(offset, size, src.size) {
        bail!(
            "Readback of {} bytes at offset {} overruns a {} byte buffer",
            size,
            offset,
            src.size
        );
    }

    let staging = GpuBuffer::staging(device.clone(), size)?;
    copy_buffer(pool, device.as_ref(), src, offset, &staging, 0, size)?;
    staging.read(0, &mut out)?;
    Ok(out)
}

/// Fill a freshly created image with `pixels` and leave it ready for sampling.
///
/// One command buffer records UNDEFINED -> TRANSFER_DST, the copy, and
/// TRANSFER_DST -> SHADER_READ_ONLY. The staging buffer is released after the
/// queue has drained.
pub fn upload_image<D: GpuDevice>(
    device: &Arc<D>,
    pool: &CommandPool<D>,
    image: &mut GpuImage<D>,
    pixels: &[u8],
) -> Result<()> {
    let staging = GpuBuffer::staging(device.clone(), pixels.len() as vk::DeviceSize)?;
    staging.write(0, pixels)?;

    let cmd = pool.begin_single_use()?;
    let recorded = image
        .transition_layout(&cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .and_then(|_| image.copy_from_buffer(&cmd, &staging))
        .and_then(|_| image.transition_layout(&cmd, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL));

    // Submit even on failure so the single-use buffer is freed
    let submitted = pool.end_single_use(cmd);
    recorded?;
    submitted
}
