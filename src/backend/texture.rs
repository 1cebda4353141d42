// Sampled textures
//
// Pixels of any channel count (1..=4) are widened to RGBA8 on the CPU and
// uploaded into an R8G8B8A8_SRGB image.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::command::CommandPool;
use super::gpu::GpuDevice;
use super::image::{GpuImage, ImageDesc};
use super::upload;
use crate::error::RendererError;

pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

pub struct Texture<D: GpuDevice> {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub channel_count: u8,
    pub has_transparency: bool,
    pub sampler: vk::Sampler,
    pub image: GpuImage<D>,
    device: Arc<D>,
}

/// Widen tightly packed pixels to RGBA8. Grey replicates into RGB, missing
/// alpha becomes opaque.
fn expand_to_rgba(pixels: &[u8], channel_count: u8) -> Vec<u8> {
    let channels = channel_count as usize;
    let mut rgba = Vec::with_capacity(pixels.len() / channels * 4);
    for px in pixels.chunks_exact(channels) {
        let texel = match *px {
            [g] => [g, g, g, 255],
            [g, a] => [g, g, g, a],
            [r, g, b] => [r, g, b, 255],
            [r, g, b, a] => [r, g, b, a],
            _ => unreachable!("chunks_exact yields 1..=4 channels"),
        };
        rgba.extend_from_slice(&texel);
    }
    rgba
}

fn validate(
    name: &str,
    width: u32,
    height: u32,
    channel_count: u8,
    pixels: &[u8],
) -> Result<(), RendererError> {
    let invalid = |reason: String| RendererError::InvalidTexture {
        name: name.to_string(),
        reason,
    };

    if width == 0 || height == 0 {
        return Err(invalid(format!("zero extent {}x{}", width, height)));
    }
    if !(1..=4).contains(&channel_count) {
        return Err(invalid(format!("{} channels", channel_count)));
    }
    let expected = width as usize * height as usize * channel_count as usize;
    if pixels.len() != expected {
        return Err(invalid(format!(
            "{} bytes of pixel data, expected {}",
            pixels.len(),
            expected
        )));
    }
    Ok(())
}

impl<D: GpuDevice> Texture<D> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: Arc<D>,
        pool: &CommandPool<D>,
        name: &str,
        width: u32,
        height: u32,
        channel_count: u8,
        pixels: &[u8],
        has_transparency: bool,
    ) -> Result<Self> {
        validate(name, width, height, channel_count, pixels)?;
        let rgba = expand_to_rgba(pixels, channel_count);

        let mut image = GpuImage::new(
            device.clone(),
            &ImageDesc {
                extent: vk::Extent2D { width, height },
                format: TEXTURE_FORMAT,
                usage: vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::COLOR_ATTACHMENT,
                aspect: vk::ImageAspectFlags::COLOR,
                create_view: true,
            },
        )
        .with_context(|| format!("Failed to create image for texture '{}'", name))?;

        upload::upload_image(&device, pool, &mut image, &rgba)
            .with_context(|| format!("Failed to upload texture '{}'", name))?;

        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(true)
            .max_anisotropy(device.max_sampler_anisotropy())
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .mip_lod_bias(0.0)
            .min_lod(0.0)
            .max_lod(0.0);

        let sampler = device
            .create_sampler(&sampler_info)
            .context("Failed to create texture sampler")?;

        log::debug!(
            "Texture '{}' created: {}x{} ({} channels)",
            name,
            width,
            height,
            channel_count
        );

        Ok(Self {
            name: name.to_string(),
            width,
            height,
            channel_count,
            has_transparency,
            sampler,
            image,
            device,
        })
    }
}

impl<D: GpuDevice> Drop for Texture<D> {
    fn drop(&mut self) {
        // The sampler goes first; `image` then releases view, memory, image
        self.device.destroy_sampler(self.sampler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_grey_and_rgb() {
        assert_eq!(expand_to_rgba(&[10, 20], 1), vec![10, 10, 10, 255, 20, 20, 20, 255]);
        assert_eq!(expand_to_rgba(&[1, 2, 3], 3), vec![1, 2, 3, 255]);
        assert_eq!(expand_to_rgba(&[5, 128], 2), vec![5, 5, 5, 128]);
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        assert!(validate("t", 2, 2, 4, &[0; 16]).is_ok());
        assert!(validate("t", 2, 2, 5, &[0; 20]).is_err());
        assert!(validate("t", 0, 2, 4, &[]).is_err());

        let err = validate("short", 2, 2, 3, &[0; 11]).unwrap_err();
        assert!(matches!(err, RendererError::InvalidTexture { ref name, .. } if name == "short"));
    }
}
