// =============================================================================
// HAAR2D DEMO - Compute transform on a Vulkan swapchain
// =============================================================================
//
// Loads one image, runs two passes of a horizontal Haar transform on it with
// a compute shader, and blits the result to the window every frame.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  App (winit ApplicationHandler)                                 │
// │    └── FrameLoop (ring cursor, one-time work phase)             │
// │          └── Renderer (FrameDriver)                             │
// │                ├── ComputePipeline + Texture                    │
// │                ├── WindowSurface (swapchain, per-slot sync)     │
// │                └── VulkanDevice (instance, queue, allocator)    │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait for the slot's fence
// 2. Acquire swapchain image
// 3. Record: (first frame) upload + transform, then blit
// 4. Reset fence, submit
// 5. Present, advance to the next slot
//
// =============================================================================

mod backend;
mod config;
mod frame;
mod renderer;

use anyhow::{Context, Result};
use backend::VulkanDevice;
use config::Config;
use frame::{FrameLoop, FrameStatus};
use raw_window_handle::HasRawDisplayHandle;
use renderer::Renderer;
use std::fs::File;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let (config, source) = Config::load();

    // Initialize logging
    init_logging(&config);
    log::info!("Starting Haar2D demo");
    source.log();
    log::debug!("Config: {:?}", config);
    log::info!(
        "Window: {}x{}, image {:?}, block_dim {}",
        config.window.width,
        config.window.height,
        config.image.path,
        config.compute.block_dim
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    config.validate().context("Invalid configuration")?;

    let event_loop = EventLoop::new()?;
    // Never block on events, the fence wait is the only place the loop sleeps
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    // GPU resources go before the error is reported
    let error = app.error.take();
    drop(app);

    match error {
        Some(e) => Err(e),
        None => {
            log::info!("Clean exit");
            Ok(())
        }
    }
}

/// Initialize logging, optionally piped to the configured log file
fn init_logging(config: &Config) {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    // RUST_LOG still wins over the default level
    builder.parse_default_env();

    let mut file_error = None;
    if config.debug.log_to_file {
        match File::create(&config.debug.log_file) {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => file_error = Some(e),
        }
    }

    builder.init();

    if let Some(e) = file_error {
        log::warn!("Cannot write log file {}: {}, logging to stderr", config.debug.log_file, e);
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// IMPORTANT: Field order matters for Drop! The renderer must release the
/// swapchain and surface while the window still exists.
struct App {
    // ─────────────────────────────────────────────────────────────────────────
    // CONFIGURATION
    // ─────────────────────────────────────────────────────────────────────────
    config: Config,

    // ─────────────────────────────────────────────────────────────────────────
    // VULKAN
    // ─────────────────────────────────────────────────────────────────────────
    renderer: Option<Renderer>,
    frame_loop: Option<FrameLoop>,

    // ─────────────────────────────────────────────────────────────────────────
    // WINDOW
    // ─────────────────────────────────────────────────────────────────────────
    window: Option<Arc<Window>>,

    /// First fatal error, returned from main
    error: Option<anyhow::Error>,

    // ─────────────────────────────────────────────────────────────────────────
    // FPS TRACKING
    // ─────────────────────────────────────────────────────────────────────────
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            config,
            renderer: None,
            frame_loop: None,
            window: None,
            error: None,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    /// Create the window and everything the frame loop needs.
    ///
    /// 1. Window (fixed size, it is also the swapchain size)
    /// 2. Vulkan device
    /// 3. Renderer: surface, swapchain, sync, texture, pipeline, commands
    /// 4. Frame loop sized to the negotiated image count
    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        log::info!("Initializing Vulkan...");

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ))
            // No swapchain recreation, so no resizing either
            .with_resizable(false);

        let window = Arc::new(
            event_loop
                .create_window(window_attributes)
                .context("Failed to create window")?,
        );
        self.window = Some(window.clone());

        // Enable validation layers based on config (and debug build)
        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let device = VulkanDevice::new(
            &self.config.window.title,
            enable_validation,
            window.raw_display_handle(),
            self.config.graphics.device_index,
        )?;

        let renderer = Renderer::new(device, window, &self.config)?;
        let frame_loop = FrameLoop::new(renderer.slot_count())?;
        log::info!("Frame ring: {} slots", frame_loop.slot_count());

        self.renderer = Some(renderer);
        self.frame_loop = Some(frame_loop);

        log::info!("Vulkan initialized successfully!");
        Ok(())
    }

    /// Record a fatal error and stop the event loop
    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        if self.error.is_none() {
            self.error = Some(error);
        }
        event_loop.exit();
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    fn render_frame(&mut self) -> Result<Option<FrameStatus>> {
        let (Some(renderer), Some(frame_loop)) = (self.renderer.as_mut(), self.frame_loop.as_mut()) else {
            return Ok(None);
        };

        frame_loop.run_frame(renderer).map(Some).with_context(|| {
            format!(
                "Frame on slot {} failed (last image {:?}, {:?})",
                frame_loop.frame_index(),
                frame_loop.image_index(),
                frame_loop.phase()
            )
        })
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

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
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        if let Err(e) = self.init(event_loop) {
            self.fail(event_loop, e.context("Failed to initialize Vulkan"));
        }
    }

    /// Handle window events.
    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            // ─────────────────────────────────────────────────────────────────
            // CLOSE REQUEST
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            // ─────────────────────────────────────────────────────────────────
            // REDRAW REQUESTED
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(Some(FrameStatus::Presented { .. })) => self.update_fps(),
                Ok(_) => {}
                Err(e) => self.fail(event_loop, e),
            },

            // ─────────────────────────────────────────────────────────────────
            // KEYBOARD INPUT
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    /// Called when the event loop is about to block waiting for events.
    /// We use this to request continuous redraws.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        if let Some(ref frame_loop) = self.frame_loop {
            log::info!("Presented {} frames", frame_loop.presented());
        }

        log::info!("Cleaning up Vulkan resources...");
        // Renderer waits for every slot, then releases in dependency order
        self.renderer = None;
        log::info!("Cleanup complete");
    }
}
