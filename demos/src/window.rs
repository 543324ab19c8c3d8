//! winit window polled by the frame loop.
//!
//! The event loop is pumped with `pump_app_events` from inside
//! [`Window::poll_events`], so the frame loop stays in control of the thread
//! instead of handing it to `EventLoop::run_app`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ash::vk;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::window::{Window as WinitWindow, WindowId};

use tessera_graphics::{GraphicsError, Window};

const CREATE_TIMEOUT: Duration = Duration::from_secs(5);
/// Pump interval while the window is minimized.
const MINIMIZED_POLL: Duration = Duration::from_millis(16);

/// Framebuffer size, shared with the swapchain's extent provider.
#[derive(Debug, Default)]
pub struct SharedExtent {
    width: AtomicU32,
    height: AtomicU32,
}

impl SharedExtent {
    fn store(&self, size: PhysicalSize<u32>) {
        self.width.store(size.width, Ordering::Relaxed);
        self.height.store(size.height, Ordering::Relaxed);
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width.load(Ordering::Relaxed),
            height: self.height.load(Ordering::Relaxed),
        }
    }

    fn is_zero(&self) -> bool {
        let extent = self.extent();
        extent.width == 0 || extent.height == 0
    }
}

struct Handler {
    title: String,
    size: PhysicalSize<u32>,
    window: Option<WinitWindow>,
    created: bool,
    create_error: Option<String>,
    close_requested: bool,
    resized: bool,
    extent: Arc<SharedExtent>,
}

impl ApplicationHandler for Handler {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.created {
            return;
        }
        let attributes = WinitWindow::default_attributes()
            .with_title(self.title.clone())
            .with_inner_size(self.size);
        match event_loop.create_window(attributes) {
            Ok(window) => {
                self.extent.store(window.inner_size());
                self.window = Some(window);
                self.created = true;
            }
            Err(e) => {
                self.create_error = Some(e.to_string());
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested");
                self.close_requested = true;
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.extent.store(size);
                self.resized = true;
            }
            _ => {}
        }
    }
}

/// A desktop window driven by polling.
pub struct DemoWindow {
    // Declared first so it is dropped before the event loop.
    window: WinitWindow,
    handler: Handler,
    event_loop: EventLoop<()>,
}

impl DemoWindow {
    /// Open a window with the given inner size in physical pixels.
    pub fn new(title: &str, width: u32, height: u32) -> Result<Self, GraphicsError> {
        let mut event_loop = EventLoop::new().map_err(|e| {
            GraphicsError::InitializationFailed(format!("Event loop creation failed: {e}"))
        })?;
        let mut handler = Handler {
            title: title.to_string(),
            size: PhysicalSize::new(width.max(1), height.max(1)),
            window: None,
            created: false,
            create_error: None,
            close_requested: false,
            resized: false,
            extent: Arc::new(SharedExtent::default()),
        };

        // Windows can only be created once the loop has delivered `resumed`.
        let deadline = Instant::now() + CREATE_TIMEOUT;
        let window = loop {
            let status = event_loop.pump_app_events(Some(Duration::from_millis(10)), &mut handler);
            if let Some(window) = handler.window.take() {
                break window;
            }
            if let Some(e) = handler.create_error.take() {
                return Err(GraphicsError::InitializationFailed(format!(
                    "Window creation failed: {e}"
                )));
            }
            if matches!(status, PumpStatus::Exit(_)) || Instant::now() >= deadline {
                return Err(GraphicsError::InitializationFailed(
                    "Event loop never resumed, no window was created".to_string(),
                ));
            }
        };

        log::info!(
            "Created window '{}' ({}x{})",
            title,
            window.inner_size().width,
            window.inner_size().height
        );
        Ok(Self {
            window,
            handler,
            event_loop,
        })
    }

    /// The native window, for surface creation.
    pub fn window(&self) -> &WinitWindow {
        &self.window
    }

    /// Current framebuffer size.
    pub fn extent(&self) -> vk::Extent2D {
        self.handler.extent.extent()
    }

    /// Handle that keeps tracking the framebuffer size.
    pub fn shared_extent(&self) -> Arc<SharedExtent> {
        Arc::clone(&self.handler.extent)
    }

    fn pump(&mut self, timeout: Duration) {
        if let PumpStatus::Exit(code) = self
            .event_loop
            .pump_app_events(Some(timeout), &mut self.handler)
        {
            log::debug!("Event loop exited with code {}", code);
            self.handler.close_requested = true;
        }
    }
}

impl Window for DemoWindow {
    fn should_close(&self) -> bool {
        self.handler.close_requested
    }

    fn poll_events(&mut self) {
        self.pump(Duration::ZERO);
        // A minimized window has no drawable surface; wait until it is
        // restored or closed.
        while self.handler.extent.is_zero() && !self.handler.close_requested {
            self.pump(MINIMIZED_POLL);
        }
        if !self.handler.close_requested {
            self.window.request_redraw();
        }
    }

    fn take_framebuffer_resized(&mut self) -> bool {
        std::mem::take(&mut self.handler.resized)
    }
}

impl std::fmt::Debug for DemoWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemoWindow")
            .field("extent", &self.extent())
            .field("close_requested", &self.handler.close_requested)
            .finish_non_exhaustive()
    }
}
