//! Resize / Swapchain Invalidation Tests
//!
//! Tests for:
//! - Zero-sized framebuffers leaving the swapchain alone
//! - Same-size rebuilds returning live object counts to their baseline
//! - Out-of-date acquire and present both leading to a rebuild

mod common;

use std::sync::Arc;

use ash::vk;

use frame_forge::backend::sim::ObjectKind;
use frame_forge::backend::{SimDevice, VulkanBackend};
use frame_forge::renderer::{FrameStatus, RendererBackend, SkipReason};

use common::assert_no_violations;

const TRACKED: [ObjectKind; 7] = [
    ObjectKind::Swapchain,
    ObjectKind::ImageView,
    ObjectKind::Framebuffer,
    ObjectKind::CommandBuffer,
    ObjectKind::Image,
    ObjectKind::Memory,
    ObjectKind::Semaphore,
];

fn live_counts(sim: &SimDevice) -> Vec<usize> {
    TRACKED.iter().map(|&kind| sim.live_count(kind)).collect()
}

fn swapchain_handle(backend: &VulkanBackend<SimDevice>) -> vk::SwapchainKHR {
    backend.context().unwrap().swapchain.swapchain
}

fn run_frame(backend: &mut VulkanBackend<SimDevice>) -> FrameStatus {
    let status = backend.begin_frame(0.0).unwrap();
    if status == FrameStatus::Ready {
        backend.end_frame(0.0).unwrap();
    }
    status
}

// ============================================================================
// Zero-sized framebuffer
// ============================================================================

#[test]
fn zero_width_is_not_ready_and_keeps_swapchain() {
    let sim = Arc::new(SimDevice::new());
    let mut backend = common::backend(&sim);
    let swapchain = swapchain_handle(&backend);

    backend.on_resized(0, 720);
    assert_eq!(run_frame(&mut backend), FrameStatus::Skipped(SkipReason::NotReady));
    assert_eq!(swapchain_handle(&backend), swapchain);

    backend.on_resized(1280, 0);
    assert_eq!(run_frame(&mut backend), FrameStatus::Skipped(SkipReason::NotReady));
    assert_eq!(swapchain_handle(&backend), swapchain);
    assert_eq!(
        backend.context().unwrap().extent(),
        vk::Extent2D { width: 1280, height: 720 }
    );
}

#[test]
fn restoring_size_after_minimize_renders_again() {
    let sim = Arc::new(SimDevice::new());
    let mut backend = common::backend(&sim);

    backend.on_resized(0, 0);
    assert_eq!(run_frame(&mut backend), FrameStatus::Skipped(SkipReason::NotReady));

    backend.on_resized(640, 480);
    assert_eq!(run_frame(&mut backend), FrameStatus::Skipped(SkipReason::Resized));
    assert_eq!(run_frame(&mut backend), FrameStatus::Ready);
    assert_eq!(
        backend.context().unwrap().extent(),
        vk::Extent2D { width: 640, height: 480 }
    );
    assert_no_violations(&sim);
}

// ============================================================================
// Idempotent rebuild
// ============================================================================

#[test]
fn same_size_rebuilds_do_not_leak() {
    let sim = Arc::new(SimDevice::new());
    let mut backend = common::backend(&sim);
    assert_eq!(run_frame(&mut backend), FrameStatus::Ready);

    let baseline = live_counts(&sim);
    let image_count = backend.context().unwrap().image_count();
    let first = swapchain_handle(&backend);

    for _ in 0..2 {
        backend.on_resized(common::WIDTH, common::HEIGHT);
        assert_eq!(run_frame(&mut backend), FrameStatus::Skipped(SkipReason::Resized));
        assert_eq!(live_counts(&sim), baseline);
        assert_eq!(backend.context().unwrap().image_count(), image_count);
    }

    assert_ne!(swapchain_handle(&backend), first);
    assert_eq!(sim.live_count(ObjectKind::Swapchain), 1);
    assert_eq!(run_frame(&mut backend), FrameStatus::Ready);
    assert_no_violations(&sim);
}

#[test]
fn burst_of_resizes_rebuilds_once() {
    let sim = Arc::new(SimDevice::new());
    let mut backend = common::backend(&sim);
    let first = swapchain_handle(&backend);

    backend.on_resized(800, 600);
    backend.on_resized(900, 700);
    backend.on_resized(1024, 768);
    assert_eq!(run_frame(&mut backend), FrameStatus::Skipped(SkipReason::Resized));
    assert_ne!(swapchain_handle(&backend), first);

    let rebuilt = swapchain_handle(&backend);
    assert_eq!(run_frame(&mut backend), FrameStatus::Ready);
    assert_eq!(swapchain_handle(&backend), rebuilt);
    assert_eq!(
        backend.context().unwrap().extent(),
        vk::Extent2D { width: 1024, height: 768 }
    );
}

// ============================================================================
// Driver-reported invalidation
// ============================================================================

#[test]
fn out_of_date_acquire_rebuilds_and_skips() {
    let sim = Arc::new(SimDevice::new());
    let mut backend = common::backend(&sim);
    let first = swapchain_handle(&backend);

    sim.inject_acquire_out_of_date(1);
    assert_eq!(run_frame(&mut backend), FrameStatus::Skipped(SkipReason::OutOfDate));
    assert_ne!(swapchain_handle(&backend), first);

    assert_eq!(run_frame(&mut backend), FrameStatus::Ready);
    assert_no_violations(&sim);
}

#[test]
fn out_of_date_present_rebuilds_on_next_frame() {
    let sim = Arc::new(SimDevice::new());
    let mut backend = common::backend(&sim);

    sim.inject_present_out_of_date(1);
    assert_eq!(run_frame(&mut backend), FrameStatus::Ready);
    assert_eq!(run_frame(&mut backend), FrameStatus::Skipped(SkipReason::Resized));
    assert_eq!(run_frame(&mut backend), FrameStatus::Ready);
    assert_no_violations(&sim);
}
