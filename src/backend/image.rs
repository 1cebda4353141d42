// GPU images and layout transitions
//
// An image's layout is tracked on the CPU side and only ever changed through
// `transition_layout`, which records the matching pipeline barrier. The set of
// supported transitions is a closed table; anything else is an error.

use anyhow::{bail, Context, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::GpuBuffer;
use super::command::{CommandBuffer, CommandBufferState};
use super::gpu::GpuDevice;
use super::memory::{allocate_for, MemoryRequest};
use crate::error::RendererError;

/// Access masks and stages for one barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Look up the barrier for `old -> new`
pub fn transition_for(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<LayoutTransition, RendererError> {
    match (old, new) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => {
            Ok(LayoutTransition {
                src_access: vk::AccessFlags::empty(),
                dst_access: vk::AccessFlags::TRANSFER_WRITE,
                src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                dst_stage: vk::PipelineStageFlags::TRANSFER,
            })
        }
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => {
            Ok(LayoutTransition {
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            })
        }
        (old, new) => Err(RendererError::UnsupportedLayoutTransition { old, new }),
    }
}

/// Parameters for a 2D image
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
    pub create_view: bool,
}

pub struct GpuImage<D: GpuDevice> {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: Option<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    layout: vk::ImageLayout,
    device: Arc<D>,
}

impl<D: GpuDevice> GpuImage<D> {
    /// Device-local, optimal tiling, created in UNDEFINED layout
    pub fn new(device: Arc<D>, desc: &ImageDesc) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = device
            .create_image(&image_info)
            .context("Failed to create image")?;

        let requirements = device.image_memory_requirements(image);
        let memory = match allocate_for(device.as_ref(), requirements, MemoryRequest::DEVICE_LOCAL)
        {
            Ok(allocation) => allocation.memory,
            Err(e) => {
                device.destroy_image(image);
                return Err(e);
            }
        };

        // From here on Drop cleans up whatever was created
        let mut gpu_image = Self {
            image,
            memory,
            view: None,
            format: desc.format,
            extent: desc.extent,
            layout: vk::ImageLayout::UNDEFINED,
            device,
        };

        gpu_image
            .device
            .bind_image_memory(image, memory)
            .context("Failed to bind image memory")?;

        if desc.create_view {
            gpu_image.view = Some(gpu_image.create_view(desc.aspect)?);
        }

        Ok(gpu_image)
    }

    fn create_view(&self, aspect: vk::ImageAspectFlags) -> Result<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(self.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        self.device
            .create_image_view(&view_info)
            .context("Failed to create image view")
    }

    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    /// Record a barrier moving the image to `new_layout`
    pub fn transition_layout(
        &mut self,
        cmd: &CommandBuffer,
        new_layout: vk::ImageLayout,
    ) -> Result<()> {
        cmd.require("transition an image", CommandBufferState::Recording)?;
        let transition = transition_for(self.layout, new_layout)?;

        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(self.layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .src_access_mask(transition.src_access)
            .dst_access_mask(transition.dst_access);

        self.device.cmd_pipeline_barrier(
            cmd.handle,
            transition.src_stage,
            transition.dst_stage,
            &barrier,
        );
        self.layout = new_layout;
        Ok(())
    }

    /// Record a copy of the whole image from the start of `src`
    pub fn copy_from_buffer(&self, cmd: &CommandBuffer, src: &GpuBuffer<D>) -> Result<()> {
        cmd.require("copy into an image", CommandBufferState::Recording)?;
        if self.layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
            bail!(
                "Image must be TRANSFER_DST_OPTIMAL to receive a copy, is {:?}",
                self.layout
            );
        }

        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D {
                width: self.extent.width,
                height: self.extent.height,
                depth: 1,
            })
            .build();

        self.device.cmd_copy_buffer_to_image(
            cmd.handle,
            src.buffer,
            self.image,
            self.layout,
            region,
        );
        Ok(())
    }
}

impl<D: GpuDevice> Drop for GpuImage<D> {
    fn drop(&mut self) {
        // View, then memory, then the image itself
        if let Some(view) = self.view.take() {
            self.device.destroy_image_view(view);
        }
        self.device.free_memory(self.memory);
        self.device.destroy_image(self.image);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::command::CommandPool;
    use crate::backend::sim::{ObjectKind, SimDevice};

    fn color_desc() -> ImageDesc {
        ImageDesc {
            extent: vk::Extent2D {
                width: 4,
                height: 4,
            },
            format: vk::Format::R8G8B8A8_SRGB,
            usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            aspect: vk::ImageAspectFlags::COLOR,
            create_view: true,
        }
    }

    #[test]
    fn test_table_accepts_engine_transitions() {
        let upload =
            transition_for(vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .unwrap();
        assert_eq!(upload.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(upload.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);

        let sample = transition_for(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(sample.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn test_table_rejects_everything_else() {
        let layouts = [
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        ];
        let supported = [
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            (
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ),
        ];

        for old in layouts {
            for new in layouts {
                let result = transition_for(old, new);
                if supported.contains(&(old, new)) {
                    assert!(result.is_ok());
                } else {
                    assert_eq!(
                        result,
                        Err(RendererError::UnsupportedLayoutTransition { old, new })
                    );
                }
            }
        }
    }

    #[test]
    fn test_rejected_transition_leaves_layout() {
        let sim = Arc::new(SimDevice::new());
        let pool = CommandPool::new(sim.clone()).unwrap();
        let mut image = GpuImage::new(sim.clone(), &color_desc()).unwrap();
        let cmd = pool.begin_single_use().unwrap();

        assert!(image
            .transition_layout(&cmd, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .is_err());
        assert_eq!(image.layout(), vk::ImageLayout::UNDEFINED);
        pool.end_single_use(cmd).unwrap();
    }

    #[test]
    fn test_transition_requires_recording() {
        let sim = Arc::new(SimDevice::new());
        let mut pool = CommandPool::new(sim.clone()).unwrap();
        pool.rebuild(1).unwrap();
        let mut image = GpuImage::new(sim.clone(), &color_desc()).unwrap();

        let cmd = pool.get(0).unwrap();
        assert!(image
            .transition_layout(cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .is_err());
    }

    #[test]
    fn test_drop_order() {
        let sim = Arc::new(SimDevice::new());
        drop(GpuImage::new(sim.clone(), &color_desc()).unwrap());

        let kinds: Vec<_> = sim.destroy_log().into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            kinds,
            vec![ObjectKind::ImageView, ObjectKind::Memory, ObjectKind::Image]
        );
    }
}
