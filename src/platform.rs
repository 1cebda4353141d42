// Windowing collaborator seam
//
// The core never talks to a window system directly. Whoever owns the window
// hands the backend something that can report the framebuffer size and, for
// real drivers, the native handles needed to build a surface.

use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

pub trait PlatformWindow {
    /// Current framebuffer size in pixels. May be (0, 0) while minimized.
    fn framebuffer_size(&self) -> (u32, u32);

    /// Native handles for surface creation. `None` for windowless hosts.
    fn raw_handles(&self) -> Option<(RawDisplayHandle, RawWindowHandle)>;
}

/// A window that only has a size. Used for headless rendering and tests.
#[derive(Debug, Clone, Copy)]
pub struct HeadlessWindow {
    pub width: u32,
    pub height: u32,
}

impl HeadlessWindow {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl PlatformWindow for HeadlessWindow {
    fn framebuffer_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn raw_handles(&self) -> Option<(RawDisplayHandle, RawWindowHandle)> {
        None
    }
}
