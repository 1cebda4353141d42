// Device memory type selection and allocation
//
// Every buffer and image allocation funnels through here so the
// "preferred flags are optional" fallback is applied uniformly.

use anyhow::{Context, Result};
use ash::vk;

use super::gpu::GpuDevice;
use crate::error::RendererError;

/// What an allocation needs from a memory type
#[derive(Debug, Clone, Copy)]
pub struct MemoryRequest {
    pub required: vk::MemoryPropertyFlags,
    pub preferred: vk::MemoryPropertyFlags,
}

impl MemoryRequest {
    pub const DEVICE_LOCAL: Self = Self {
        required: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        preferred: vk::MemoryPropertyFlags::empty(),
    };

    /// Mappable. Coherent when available, otherwise host access is flushed
    /// and invalidated explicitly.
    pub const HOST_VISIBLE: Self = Self {
        required: vk::MemoryPropertyFlags::HOST_VISIBLE,
        preferred: vk::MemoryPropertyFlags::HOST_COHERENT,
    };
}

/// Memory from `allocate_for` and the properties of the type it came from
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub memory: vk::DeviceMemory,
    pub flags: vk::MemoryPropertyFlags,
}

/// Find a memory type allowed by `type_bits` that has `required | preferred`.
/// When nothing has the preferred flags, settle for `required` alone.
pub fn find_memory_index(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
    preferred: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let search = |flags: vk::MemoryPropertyFlags| {
        (0..props.memory_type_count).find(|&i| {
            let allowed = type_bits & (1 << i) != 0;
            allowed && props.memory_types[i as usize].property_flags.contains(flags)
        })
    };

    if let Some(index) = search(required | preferred) {
        return Some(index);
    }

    if !preferred.is_empty() {
        log::warn!(
            "No memory type with preferred flags {:?}, falling back to {:?}",
            preferred,
            required
        );
        return search(required);
    }

    None
}

/// Allocate memory satisfying `requirements` and `request`
pub fn allocate_for<D: GpuDevice>(
    device: &D,
    requirements: vk::MemoryRequirements,
    request: MemoryRequest,
) -> Result<Allocation> {
    let props = device.memory_properties();
    let memory_type_index = find_memory_index(
        props,
        requirements.memory_type_bits,
        request.required,
        request.preferred,
    )
    .ok_or(RendererError::NoSuitableMemoryType(request.required))?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    let memory = device
        .allocate_memory(&alloc_info)
        .context("Failed to allocate device memory")?;
    Ok(Allocation {
        memory,
        flags: props.memory_types[memory_type_index as usize].property_flags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, &flags) in types.iter().enumerate() {
            props.memory_types[i].property_flags = flags;
        }
        props
    }

    #[test]
    fn test_prefers_combined_flags() {
        let props = props(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);
        let index = find_memory_index(
            &props,
            0b11,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_CACHED,
        );
        assert_eq!(index, Some(1));
    }

    #[test]
    fn test_falls_back_to_required_only() {
        let props = props(&[vk::MemoryPropertyFlags::HOST_VISIBLE]);
        let index = find_memory_index(
            &props,
            0b1,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_CACHED,
        );
        assert_eq!(index, Some(0));
    }

    #[test]
    fn test_respects_type_bits() {
        let props = props(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        let index = find_memory_index(
            &props,
            0b10,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::empty(),
        );
        assert_eq!(index, Some(1));
    }

    #[test]
    fn test_allocation_reports_chosen_type_flags() {
        use crate::backend::sim::SimDevice;

        let sim = SimDevice::non_coherent();
        let requirements = vk::MemoryRequirements {
            size: 256,
            alignment: 256,
            memory_type_bits: 0b11,
        };
        let allocation = allocate_for(&sim, requirements, MemoryRequest::HOST_VISIBLE).unwrap();
        assert_eq!(allocation.flags, vk::MemoryPropertyFlags::HOST_VISIBLE);
        sim.free_memory(allocation.memory);
    }

    #[test]
    fn test_missing_required_is_none() {
        let props = props(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let index = find_memory_index(
            &props,
            0b1,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::empty(),
        );
        assert_eq!(index, None);
    }
}
