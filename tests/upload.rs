//! Resource Upload Tests
//!
//! Tests for:
//! - Staged buffer upload and read-back
//! - Texture upload leaving the image sampleable with the expanded pixels
//! - Texture teardown order
//! - Layout transitions outside the supported table

mod common;

use std::sync::Arc;

use ash::vk::{self, Handle};

use frame_forge::backend::buffer::GpuBuffer;
use frame_forge::backend::command::CommandPool;
use frame_forge::backend::image::transition_for;
use frame_forge::backend::memory::MemoryRequest;
use frame_forge::backend::sim::ObjectKind;
use frame_forge::backend::upload::{download, upload_to_buffer};
use frame_forge::backend::SimDevice;
use frame_forge::error::RendererError;
use frame_forge::renderer::RendererBackend;

use common::assert_no_violations;

// ============================================================================
// Buffers
// ============================================================================

#[test]
fn buffer_round_trip_returns_the_same_bytes() {
    let sim = Arc::new(SimDevice::new());
    let pool = CommandPool::new(sim.clone()).unwrap();
    let bytes: Vec<u8> = (0..=255).cycle().take(1000).collect();

    let buffer = GpuBuffer::new(
        sim.clone(),
        bytes.len() as u64,
        vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryRequest::DEVICE_LOCAL,
    )
    .unwrap();

    upload_to_buffer(&sim, &pool, &buffer, 0, &bytes).unwrap();
    assert_eq!(download(&sim, &pool, &buffer, 0, bytes.len()).unwrap(), bytes);
    assert_no_violations(&sim);
}

#[test]
fn round_trip_through_non_coherent_staging() {
    let sim = Arc::new(SimDevice::non_coherent());
    let pool = CommandPool::new(sim.clone()).unwrap();
    let bytes = [3u8; 64];

    let buffer = GpuBuffer::new(
        sim.clone(),
        bytes.len() as u64,
        vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryRequest::DEVICE_LOCAL,
    )
    .unwrap();

    upload_to_buffer(&sim, &pool, &buffer, 0, &bytes).unwrap();
    assert_eq!(download(&sim, &pool, &buffer, 0, bytes.len()).unwrap(), bytes);

    let stats = sim.stats();
    assert_eq!(stats.host_flushes, 1);
    assert_eq!(stats.host_invalidates, 1);
    assert_no_violations(&sim);
}

#[test]
fn upload_past_the_end_is_rejected() {
    let sim = Arc::new(SimDevice::new());
    let pool = CommandPool::new(sim.clone()).unwrap();
    let buffer = GpuBuffer::new(
        sim.clone(),
        16,
        vk::BufferUsageFlags::TRANSFER_DST,
        MemoryRequest::DEVICE_LOCAL,
    )
    .unwrap();

    assert!(upload_to_buffer(&sim, &pool, &buffer, 8, &[0; 16]).is_err());
    assert!(upload_to_buffer(&sim, &pool, &buffer, u64::MAX - 1, &[1, 2, 3, 4]).is_err());
    assert!(download(&sim, &pool, &buffer, u64::MAX, 4).is_err());
    assert_eq!(sim.stats().submits, 0);
}

// ============================================================================
// Textures
// ============================================================================

#[test]
fn texture_ends_shader_readable_with_rgba_pixels() {
    let sim = Arc::new(SimDevice::new());
    let mut backend = common::backend(&sim);

    let rgb = [10, 20, 30, 40, 50, 60, 70, 80, 90, 100, 110, 120];
    let handle = backend.create_texture("rgb", 2, 2, 3, &rgb, false).unwrap();

    let texture = backend.texture(handle).unwrap();
    assert_eq!(
        sim.image_layout(texture.image.image),
        Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    );
    assert_eq!(texture.image.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

    let expected = [
        10, 20, 30, 255, 40, 50, 60, 255, 70, 80, 90, 255, 100, 110, 120, 255,
    ];
    let bytes = sim.image_bytes(texture.image.image).unwrap();
    assert_eq!(&bytes[..expected.len()], &expected);
    assert_no_violations(&sim);
}

#[test]
fn texture_with_wrong_pixel_count_is_rejected() {
    let sim = Arc::new(SimDevice::new());
    let mut backend = common::backend(&sim);
    let images = sim.live_count(ObjectKind::Image);

    let err = backend.create_texture("short", 2, 2, 4, &[0; 15], false).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RendererError>(),
        Some(RendererError::InvalidTexture { .. })
    ));
    assert_eq!(sim.live_count(ObjectKind::Image), images);
}

#[test]
fn texture_teardown_order() {
    let sim = Arc::new(SimDevice::new());
    let mut backend = common::backend(&sim);
    let handle = backend.create_texture("t", 1, 1, 4, &[1, 2, 3, 4], true).unwrap();

    let (sampler, view, memory, image) = {
        let texture = backend.texture(handle).unwrap();
        (
            texture.sampler,
            texture.image.view.unwrap(),
            texture.image.memory,
            texture.image.image,
        )
    };

    backend.destroy_texture(handle);

    let log = sim.destroy_log();
    let tail = &log[log.len() - 4..];
    assert_eq!(
        tail,
        &[
            (ObjectKind::Sampler, sampler.as_raw()),
            (ObjectKind::ImageView, view.as_raw()),
            (ObjectKind::Memory, memory.as_raw()),
            (ObjectKind::Image, image.as_raw()),
        ]
    );
    assert_no_violations(&sim);
}

// ============================================================================
// Layout transitions
// ============================================================================

#[test]
fn only_upload_transitions_are_supported() {
    assert!(transition_for(
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL
    )
    .is_ok());
    assert!(transition_for(
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    )
    .is_ok());

    let err = transition_for(
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    )
    .unwrap_err();
    assert_eq!(
        err,
        RendererError::UnsupportedLayoutTransition {
            old: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            new: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        }
    );
}
