// Render pass and per-swapchain framebuffers
//
// The render pass lives as long as the renderer. The depth image and one
// framebuffer per swapchain image form a set that is thrown away and built
// again whenever the swapchain is.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::gpu::GpuDevice;
use super::image::{GpuImage, ImageDesc};
use super::swapchain::Swapchain;

struct FramebufferSet<D: GpuDevice> {
    framebuffers: Vec<vk::Framebuffer>,
    depth: GpuImage<D>,
    extent: vk::Extent2D,
}

pub struct RenderTarget<D: GpuDevice> {
    pub render_pass: vk::RenderPass,
    pub clear_color: [f32; 4],
    depth_format: vk::Format,
    set: Option<FramebufferSet<D>>,
    device: Arc<D>,
}

impl<D: GpuDevice> RenderTarget<D> {
    pub fn new(device: Arc<D>, color_format: vk::Format, clear_color: [f32; 4]) -> Result<Self> {
        let depth_format = device.depth_format();
        let render_pass = create_render_pass(device.as_ref(), color_format, depth_format)?;

        Ok(Self {
            render_pass,
            clear_color,
            depth_format,
            set: None,
            device,
        })
    }

    /// Drop the current framebuffers and depth image
    pub fn release(&mut self) {
        if let Some(set) = self.set.take() {
            for framebuffer in set.framebuffers {
                self.device.destroy_framebuffer(framebuffer);
            }
            // depth image dropped here
        }
    }

    /// Build a fresh depth image and framebuffers for `swapchain`
    pub fn rebuild(&mut self, swapchain: &Swapchain<D>) -> Result<()> {
        self.release();

        let depth = GpuImage::new(
            self.device.clone(),
            &ImageDesc {
                extent: swapchain.extent,
                format: self.depth_format,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                aspect: vk::ImageAspectFlags::DEPTH,
                create_view: true,
            },
        )
        .context("Failed to create depth image")?;
        let depth_view = depth
            .view
            .context("Depth image was created without a view")?;

        let mut set = FramebufferSet {
            framebuffers: Vec::with_capacity(swapchain.image_views.len()),
            depth,
            extent: swapchain.extent,
        };

        for &image_view in &swapchain.image_views {
            let attachments = [image_view, depth_view];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(self.render_pass)
                .attachments(&attachments)
                .width(swapchain.extent.width)
                .height(swapchain.extent.height)
                .layers(1);

            match self.device.create_framebuffer(&framebuffer_info) {
                Ok(framebuffer) => set.framebuffers.push(framebuffer),
                Err(e) => {
                    for framebuffer in set.framebuffers {
                        self.device.destroy_framebuffer(framebuffer);
                    }
                    return Err(e).context("Failed to create framebuffer");
                }
            }
        }

        log::debug!(
            "Built {} framebuffers at {}x{}",
            set.framebuffers.len(),
            set.extent.width,
            set.extent.height
        );
        self.set = Some(set);
        Ok(())
    }

    pub fn framebuffer(&self, image_index: u32) -> Option<vk::Framebuffer> {
        self.set
            .as_ref()
            .and_then(|set| set.framebuffers.get(image_index as usize).copied())
    }

    pub fn clear_values(&self) -> [vk::ClearValue; 2] {
        [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ]
    }
}

impl<D: GpuDevice> Drop for RenderTarget<D> {
    fn drop(&mut self) {
        self.release();
        self.device.destroy_render_pass(self.render_pass);
    }
}

/// Color + depth render pass; the color attachment ends ready for present
fn create_render_pass<D: GpuDevice>(
    device: &D,
    color_format: vk::Format,
    depth_format: vk::Format,
) -> Result<vk::RenderPass> {
    // Color attachment (the swapchain image)
    let color_attachment = vk::AttachmentDescription::builder()
        .format(color_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build();

    // Depth attachment
    let depth_attachment = vk::AttachmentDescription::builder()
        .format(depth_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let depth_attachment_ref = vk::AttachmentReference::builder()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachments = &[color_attachment_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(color_attachments)
        .depth_stencil_attachment(&depth_attachment_ref)
        .build();

    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_READ
                | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .build();

    let attachments = &[color_attachment, depth_attachment];
    let subpasses = &[subpass];
    let dependencies = &[dependency];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(attachments)
        .subpasses(subpasses)
        .dependencies(dependencies);

    device
        .create_render_pass(&render_pass_info)
        .context("Failed to create render pass")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{ObjectKind, SimDevice};

    #[test]
    fn test_rebuild_keeps_one_live_set() {
        let sim = Arc::new(SimDevice::new());
        let mut swapchain =
            Swapchain::new(sim.clone(), 1280, 720, vk::PresentModeKHR::FIFO, 2).unwrap();
        let mut target =
            RenderTarget::new(sim.clone(), swapchain.format, [0.0, 0.0, 0.0, 1.0]).unwrap();

        target.rebuild(&swapchain).unwrap();
        let count = swapchain.image_count();
        assert_eq!(sim.live_count(ObjectKind::Framebuffer), count);

        target.release();
        swapchain.recreate(1280, 720).unwrap();
        target.rebuild(&swapchain).unwrap();

        assert_eq!(sim.live_count(ObjectKind::Framebuffer), count);
        assert_eq!(sim.live_count(ObjectKind::Image), 1);
        assert_eq!(sim.live_count(ObjectKind::RenderPass), 1);
        assert!(target.framebuffer(count as u32 - 1).is_some());
        assert!(target.framebuffer(count as u32).is_none());
    }
}
