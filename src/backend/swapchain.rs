// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// The whole object is replaced on recreation; nothing is patched in place.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::gpu::GpuDevice;
use crate::error::RendererError;

/// Outcome of asking the swapchain for the next image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    Acquired { image_index: u32, suboptimal: bool },
    /// Timed out or no image available yet
    NotReady,
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentResult {
    Presented,
    /// Out of date or suboptimal: rebuild before the next frame
    NeedsRebuild,
}

pub struct Swapchain<D: GpuDevice> {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    preferred_present_mode: vk::PresentModeKHR,
    min_frames: usize,
    device: Arc<D>,
}

impl<D: GpuDevice> Swapchain<D> {
    /// `min_frames` is the number of frames the caller wants in flight; the
    /// image count never drops below it unless the surface forbids it.
    pub fn new(
        device: Arc<D>,
        width: u32,
        height: u32,
        preferred_present_mode: vk::PresentModeKHR,
        min_frames: usize,
    ) -> Result<Self> {
        log::info!("Creating swapchain: {}x{}", width, height);
        if width == 0 || height == 0 {
            anyhow::bail!("Cannot create a {}x{} swapchain", width, height);
        }
        Self::build(
            device,
            width,
            height,
            preferred_present_mode,
            min_frames,
            vk::SwapchainKHR::null(),
        )
    }

    fn build(
        device: Arc<D>,
        width: u32,
        height: u32,
        preferred_present_mode: vk::PresentModeKHR,
        min_frames: usize,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Self> {
        let support = device
            .surface_support()
            .context("Failed to query surface support")?;
        let caps = support.capabilities;

        // Choose surface format (prefer SRGB)
        let surface_format = support
            .formats
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_SRGB
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| support.formats.first())
            .copied()
            .ok_or(RendererError::NoSurfaceFormat)?;

        // FIFO is always supported
        let present_mode = if support.present_modes.contains(&preferred_present_mode) {
            preferred_present_mode
        } else {
            log::warn!(
                "Present mode {:?} unsupported, using FIFO",
                preferred_present_mode
            );
            vk::PresentModeKHR::FIFO
        };

        let extent = if caps.current_extent.width != u32::MAX {
            caps.current_extent
        } else {
            vk::Extent2D {
                width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
                height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
            }
        };

        let mut image_count = (caps.min_image_count + 1).max(min_frames as u32);
        if caps.max_image_count > 0 && image_count > caps.max_image_count {
            image_count = caps.max_image_count;
        }

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = device
            .create_swapchain(&create_info)
            .context("Failed to create swapchain")?;

        let images = match device.swapchain_images(swapchain) {
            Ok(images) => images,
            Err(e) => {
                device.destroy_swapchain(swapchain);
                return Err(e).context("Failed to get swapchain images");
            }
        };

        let mut chain = Self {
            swapchain,
            images,
            image_views: Vec::new(),
            format: surface_format.format,
            extent,
            present_mode,
            preferred_present_mode,
            min_frames,
            device,
        };

        for i in 0..chain.images.len() {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(chain.images[i])
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(chain.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            let view = chain
                .device
                .create_image_view(&view_info)
                .context("Failed to create swapchain image view")?;
            chain.image_views.push(view);
        }

        log::info!(
            "Swapchain ready: {} images, {}x{}, {:?}",
            chain.images.len(),
            extent.width,
            extent.height,
            present_mode
        );
        Ok(chain)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Replace this swapchain with a new one of the given size. Returns
    /// `Ok(false)` without touching anything when either dimension is zero.
    pub fn recreate(&mut self, width: u32, height: u32) -> Result<bool> {
        if width == 0 || height == 0 {
            log::debug!("Refusing to recreate swapchain at {}x{}", width, height);
            return Ok(false);
        }

        let replacement = Self::build(
            self.device.clone(),
            width,
            height,
            self.preferred_present_mode,
            self.min_frames,
            self.swapchain,
        )?;

        // Dropping the retired chain destroys its views and handle
        *self = replacement;
        Ok(true)
    }

    /// Acquire next image for rendering
    pub fn acquire_next_image(
        &self,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> Result<AcquireResult> {
        match self
            .device
            .acquire_next_image(self.swapchain, timeout, semaphore)
        {
            Ok((image_index, suboptimal)) => Ok(AcquireResult::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireResult::OutOfDate),
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => Ok(AcquireResult::NotReady),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    /// Present rendered image to screen
    pub fn present(&self, image_index: u32, wait_semaphore: vk::Semaphore) -> Result<PresentResult> {
        match self
            .device
            .queue_present(self.swapchain, image_index, wait_semaphore)
        {
            Ok(false) => Ok(PresentResult::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentResult::NeedsRebuild),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }
}

impl<D: GpuDevice> Drop for Swapchain<D> {
    fn drop(&mut self) {
        for view in self.image_views.drain(..) {
            self.device.destroy_image_view(view);
        }
        self.device.destroy_swapchain(self.swapchain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{ObjectKind, SimDevice};

    fn chain(sim: &Arc<SimDevice>, frames: usize) -> Swapchain<SimDevice> {
        Swapchain::new(sim.clone(), 1280, 720, vk::PresentModeKHR::MAILBOX, frames).unwrap()
    }

    #[test]
    fn test_image_count_covers_frames_in_flight() {
        let sim = Arc::new(SimDevice::new());
        // min_image_count + 1
        assert_eq!(chain(&sim, 2).image_count(), 3);
        // frames in flight dominate
        assert_eq!(chain(&sim, 5).image_count(), 5);
        // clamped to the surface maximum of 8
        assert_eq!(chain(&sim, 12).image_count(), 8);
    }

    #[test]
    fn test_unsupported_present_mode_falls_back() {
        let sim = Arc::new(SimDevice::new());
        let chain =
            Swapchain::new(sim.clone(), 640, 480, vk::PresentModeKHR::IMMEDIATE, 2).unwrap();
        assert_eq!(chain.present_mode, vk::PresentModeKHR::FIFO);
        assert_eq!(chain.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn test_zero_size_recreate_is_refused() {
        let sim = Arc::new(SimDevice::new());
        let mut chain = chain(&sim, 2);
        let before = (chain.swapchain, chain.extent, chain.image_count());

        assert!(!chain.recreate(0, 720).unwrap());
        assert!(!chain.recreate(1280, 0).unwrap());
        assert_eq!(before, (chain.swapchain, chain.extent, chain.image_count()));
    }

    #[test]
    fn test_recreate_retires_old_chain() {
        let sim = Arc::new(SimDevice::new());
        let mut chain = chain(&sim, 2);
        let old = chain.swapchain;

        assert!(chain.recreate(800, 600).unwrap());
        assert_ne!(chain.swapchain, old);
        assert_eq!(chain.extent, vk::Extent2D { width: 800, height: 600 });
        assert_eq!(sim.live_count(ObjectKind::Swapchain), 1);
        assert_eq!(sim.live_count(ObjectKind::ImageView), chain.image_count());
        assert!(sim.violations().is_empty());
    }

    #[test]
    fn test_acquire_and_present_out_of_date() {
        let sim = Arc::new(SimDevice::new());
        let chain = chain(&sim, 2);
        sim.inject_acquire_out_of_date(1);
        sim.inject_present_out_of_date(1);

        let sem = sim.create_semaphore().unwrap();
        assert_eq!(
            chain.acquire_next_image(u64::MAX, sem).unwrap(),
            AcquireResult::OutOfDate
        );
        let AcquireResult::Acquired { image_index, .. } =
            chain.acquire_next_image(u64::MAX, sem).unwrap()
        else {
            panic!("expected an image");
        };
        assert_eq!(
            chain.present(image_index, sem).unwrap(),
            PresentResult::NeedsRebuild
        );
        sim.destroy_semaphore(sem);
    }
}
