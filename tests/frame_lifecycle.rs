//! Frame Lifecycle Tests
//!
//! Tests for:
//! - A full begin/update/draw/end frame on a 1280x720 surface
//! - Frames in flight never exceeding the slot count
//! - Geometry of a frame still on the GPU surviving the next frame
//! - Fence timeouts skipping the frame without advancing
//! - Submission failure surfacing as a fatal error

mod common;

use std::sync::Arc;

use glam::{Mat4, Vec3, Vec4};

use frame_forge::backend::upload::download;
use frame_forge::backend::SimDevice;
use frame_forge::config::Config;
use frame_forge::error::RendererError;
use frame_forge::renderer::{FrameStatus, RenderPacket, RendererBackend, SkipReason, VertexData};

use common::assert_no_violations;

// ============================================================================
// Single frame
// ============================================================================

#[test]
fn quad_frame_succeeds_and_advances_one_slot() {
    let sim = Arc::new(SimDevice::new());
    let mut backend = common::backend(&sim);
    let frames = backend.frames_in_flight();
    let before = backend.current_frame();

    assert_eq!(backend.begin_frame(0.016).unwrap(), FrameStatus::Ready);
    backend
        .update_global_state(Mat4::IDENTITY, Mat4::IDENTITY, Vec3::ZERO, Vec4::ONE, 0)
        .unwrap();
    backend.draw(&VertexData::quad(0.25)).unwrap();
    backend.end_frame(0.016).unwrap();

    assert_eq!(backend.current_frame(), (before + 1) % frames);

    sim.complete_all();
    let stats = sim.stats();
    assert_eq!(stats.draws, 1);
    assert_eq!(stats.indices_drawn, 6);
    assert_eq!(stats.presents, 1);
    assert_no_violations(&sim);
}

#[test]
fn renderer_counts_only_rendered_frames() {
    let sim = Arc::new(SimDevice::new());
    let mut renderer = common::renderer(&sim);
    let mesh = renderer.load_mesh(VertexData::quad(0.25)).unwrap();
    renderer.register_object(mesh, None).unwrap();

    let packet = RenderPacket::default();
    assert!(renderer.draw_frame(&packet).unwrap().is_ready());
    assert_eq!(renderer.frame_number(), 1);

    renderer.on_resized(800, 600);
    assert_eq!(
        renderer.draw_frame(&packet).unwrap(),
        FrameStatus::Skipped(SkipReason::Resized)
    );
    assert_eq!(renderer.frame_number(), 1);

    assert!(renderer.draw_frame(&packet).unwrap().is_ready());
    assert_eq!(renderer.frame_number(), 2);
    assert_no_violations(&sim);
}

#[test]
fn unknown_mesh_cannot_be_registered() {
    let sim = Arc::new(SimDevice::new());
    let mut renderer = common::renderer(&sim);
    assert!(renderer.register_object(7, None).is_err());
    assert_eq!(renderer.objects().count(), 0);
}

// ============================================================================
// Frames in flight
// ============================================================================

#[test]
fn ten_rounds_of_drawn_frames_render_cleanly() {
    let sim = Arc::new(SimDevice::new());
    let mut renderer = common::renderer(&sim);
    let mesh = renderer.load_mesh(VertexData::quad(0.25)).unwrap();
    renderer.register_object(mesh, None).unwrap();

    let frames = renderer.backend().frames_in_flight();
    let packet = RenderPacket::default();
    for _ in 0..10 * frames {
        assert!(renderer.draw_frame(&packet).unwrap().is_ready());
    }

    assert_eq!(renderer.frame_number(), 10 * frames as u64);
    // Each geometry upload drains the queue, leaving only the last frame pending
    assert_eq!(sim.peak_pending_fences(), 1);
    assert_no_violations(&sim);
}

#[test]
fn without_draws_gpu_work_piles_up_to_the_slot_count() {
    let sim = Arc::new(SimDevice::new());
    let mut backend = common::backend(&sim);
    let frames = backend.frames_in_flight();

    for _ in 0..10 * frames {
        assert_eq!(backend.begin_frame(0.0).unwrap(), FrameStatus::Ready);
        backend.end_frame(0.0).unwrap();
    }

    // Only the slot fence wait retires work, so every slot was in use at once
    assert_eq!(sim.peak_pending_fences(), frames);
    assert_no_violations(&sim);
}

#[test]
fn next_frame_leaves_geometry_of_pending_frame_intact() {
    let sim = Arc::new(SimDevice::new());
    let mut backend = common::backend(&sim);
    assert!(backend.frames_in_flight() >= 2);

    let first = VertexData::quad(0.25);
    let second = VertexData::quad(0.5);
    for data in [&first, &second] {
        assert_eq!(backend.begin_frame(0.016).unwrap(), FrameStatus::Ready);
        backend
            .update_global_state(Mat4::IDENTITY, Mat4::IDENTITY, Vec3::ZERO, Vec4::ONE, 0)
            .unwrap();
        backend.draw(data).unwrap();
        backend.end_frame(0.016).unwrap();
    }

    // The second frame's upload went to its own slot, not over the first
    // frame's vertices while that frame was still queued
    assert_no_violations(&sim);

    let expected: &[u8] = bytemuck::cast_slice(&first.vertices);
    let geometry = backend.geometry().unwrap();
    let commands = backend.context().unwrap().commands();
    let bytes = download(&sim, commands, &geometry.vertex_buffer, 0, expected.len()).unwrap();
    assert_eq!(bytes, expected);
}

// ============================================================================
// Timeouts and failures
// ============================================================================

#[test]
fn fence_timeout_skips_without_advancing() {
    let sim = Arc::new(SimDevice::new());
    let mut config = Config::default();
    config.graphics.fence_timeout_ms = Some(10);
    let mut backend = common::backend_with(&sim, config);
    let frames = backend.frames_in_flight();

    sim.set_manual_gpu(true);
    for _ in 0..frames {
        assert_eq!(backend.begin_frame(0.0).unwrap(), FrameStatus::Ready);
        backend.end_frame(0.0).unwrap();
    }
    assert_eq!(sim.pending_submissions(), frames);

    assert_eq!(
        backend.begin_frame(0.0).unwrap(),
        FrameStatus::Skipped(SkipReason::FenceTimeout)
    );
    assert_eq!(backend.current_frame(), 0);

    sim.complete_all();
    assert_eq!(backend.begin_frame(0.0).unwrap(), FrameStatus::Ready);
    backend.end_frame(0.0).unwrap();
    assert_no_violations(&sim);
}

#[test]
fn submit_failure_is_fatal() {
    let sim = Arc::new(SimDevice::new());
    let mut renderer = common::renderer(&sim);

    sim.fail_next_submit();
    let err = renderer.draw_frame(&RenderPacket::default()).unwrap_err();

    assert_eq!(
        err.downcast_ref::<RendererError>(),
        Some(&RendererError::SubmitFailed(ash::vk::Result::ERROR_DEVICE_LOST))
    );
    assert_eq!(renderer.frame_number(), 0);
}
