//! Shared fixtures for the integration tests.
//!
//! Every test gets its own [`DummyBackend`], so tests can run in parallel
//! and inspect the backend's call log without interference.

#![allow(dead_code)]

use std::cell::RefCell;
use std::sync::{Arc, Once};

use ash::vk;
use log::{Level, Log, Metadata, Record};

use tessera_graphics::backend::dummy::{BackendCall, DummySwapchain};
use tessera_graphics::{DeviceContext, DummyBackend, GraphicsConfig};

/// A device context over a fresh dummy backend.
pub struct TestContext {
    pub backend: Arc<DummyBackend>,
    pub ctx: DeviceContext,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(GraphicsConfig::default())
    }

    pub fn with_config(config: GraphicsConfig) -> Self {
        let backend = Arc::new(DummyBackend::new());
        let ctx = DeviceContext::new(backend.clone(), config);
        Self { backend, ctx }
    }

    pub fn swapchain(&self, image_count: u32) -> DummySwapchain {
        DummySwapchain::new(
            self.backend.clone(),
            image_count,
            vk::Extent2D {
                width: 640,
                height: 480,
            },
        )
    }

    /// Number of logged calls matching `pred`.
    pub fn count_calls(&self, pred: impl Fn(&BackendCall) -> bool) -> usize {
        self.backend.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn assert_clean(&self) {
        let errors = self.backend.validation_errors();
        assert!(errors.is_empty(), "validation errors: {errors:#?}");
    }
}

/// Route log output through the test harness.
///
/// Only for test binaries that never call [`capture_logs`], since both
/// install the global logger.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic byte pattern of length `len`.
pub fn test_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

thread_local! {
    static CAPTURED: RefCell<Vec<(Level, String)>> = const { RefCell::new(Vec::new()) };
}

struct CaptureLogger;

impl Log for CaptureLogger {
    fn enabled(&self, _: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        CAPTURED.with(|c| {
            c.borrow_mut()
                .push((record.level(), record.args().to_string()))
        });
    }

    fn flush(&self) {}
}

static CAPTURE_LOGGER: CaptureLogger = CaptureLogger;
static INSTALL: Once = Once::new();

/// Start capturing log records emitted on the current thread.
///
/// Clears anything captured earlier on this thread.
pub fn capture_logs() {
    INSTALL.call_once(|| {
        // Another logger may already be installed by a different fixture;
        // capturing is then unavailable and the asserting tests will fail.
        let _ = log::set_logger(&CAPTURE_LOGGER);
        log::set_max_level(log::LevelFilter::Trace);
    });
    CAPTURED.with(|c| c.borrow_mut().clear());
}

/// Messages captured on this thread at `level`.
pub fn captured(level: Level) -> Vec<String> {
    CAPTURED.with(|c| {
        c.borrow()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.clone())
            .collect()
    })
}
