// =============================================================================
// FRAME FORGE - windowed driver
// =============================================================================
//
// Opens a winit window, hands it to the renderer as a `PlatformWindow`, and
// draws a textured quad every redraw.
//
// FRAME FLOW:
// 1. Window events update the framebuffer size (resize is deferred)
// 2. RedrawRequested -> Renderer::draw_frame
// 3. Skipped frames are simply retried on the next redraw
//
// =============================================================================

use anyhow::{Context, Result};
use glam::{Mat4, Vec3};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::fs::File;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

use frame_forge::config::Config;
use frame_forge::platform::PlatformWindow;
use frame_forge::renderer::{BackendType, RenderPacket, Renderer, VertexData};

const CAMERA_DISTANCE: f32 = 2.0;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting Frame Forge");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    if let Some(e) = app.fatal.take() {
        return Err(e);
    }
    Ok(())
}

/// Level comes from config; RUST_LOG still overrides it
fn init_logging(config: &Config) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(config.log_level());
    builder.parse_default_env();

    if config.debug.log_to_file {
        match File::create(&config.debug.log_file) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {}: {}", config.debug.log_file, e),
        }
    }

    builder.init();
}

// =============================================================================
// WINDOW ADAPTER
// =============================================================================

struct WinitSurface<'a>(&'a Window);

impl PlatformWindow for WinitSurface<'_> {
    fn framebuffer_size(&self) -> (u32, u32) {
        let size = self.0.inner_size();
        (size.width, size.height)
    }

    fn raw_handles(&self) -> Option<(RawDisplayHandle, RawWindowHandle)> {
        Some((self.0.raw_display_handle(), self.0.raw_window_handle()))
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the renderer (and its surface) must go
/// before the window it was created from.
struct App {
    config: Config,
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    // Fatal error that stopped the event loop
    fatal: Option<anyhow::Error>,

    // FPS tracking
    last_frame_time: Instant,
    last_fps_update: Instant,
    frame_count: u32,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        Self {
            config,
            renderer: None,
            window: None,
            is_fullscreen,
            fatal: None,
            last_frame_time: Instant::now(),
            last_fps_update: Instant::now(),
            frame_count: 0,
        }
    }

    fn init_renderer(&mut self, window: &Window) -> Result<()> {
        let backend = BackendType::from_config(&self.config);
        let mut renderer = Renderer::new(
            backend,
            &self.config.window.title,
            &WinitSurface(window),
            &self.config,
        )?;

        let quad = renderer.load_mesh(VertexData::quad(0.25))?;
        renderer
            .register_object(quad, None)
            .context("Failed to register quad")?;

        self.renderer = Some(renderer);
        Ok(())
    }

    fn render_frame(&mut self) -> Result<bool> {
        let Some(renderer) = self.renderer.as_mut() else {
            return Ok(false);
        };

        let now = Instant::now();
        let delta_time = now.duration_since(self.last_frame_time).as_secs_f32();

        let view_position = Vec3::new(0.0, 0.0, CAMERA_DISTANCE);
        let packet = RenderPacket {
            delta_time,
            view: Mat4::from_translation(view_position).inverse(),
            view_position,
        };

        Ok(renderer.draw_frame(&packet)?.is_ready())
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
        }
    }

    fn update_fps(&mut self) {
        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        if !self.config.debug.show_fps {
            return;
        }

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("Fatal renderer error: {:?}", error);
        self.renderer = None;
        self.fatal = Some(error);
        event_loop.exit();
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        if let Err(e) = self.init_renderer(&window) {
            self.fail(event_loop, e.context("Failed to initialize renderer"));
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.on_resized(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => self.fail(event_loop, e),
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Shutting down renderer...");
        if let Some(mut renderer) = self.renderer.take() {
            renderer.shutdown();
        }
        log::info!("Cleanup complete");
    }
}
