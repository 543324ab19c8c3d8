//! Graphics configuration.
//!
//! [`GraphicsConfig`] collects the knobs that shape device bring-up and the
//! frame loop. Binaries fill it from their command line; tests use the
//! defaults and override single fields with the `with_*` methods.

use std::time::Duration;

/// Presentation mode for the swapchain.
///
/// Controls how frames are synchronized with the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PresentMode {
    /// No synchronization. May cause tearing but has lowest latency.
    Immediate,
    /// Triple buffering. Low latency without tearing.
    Mailbox,
    /// VSync enabled. No tearing, but may have higher latency.
    #[default]
    Fifo,
    /// VSync with relaxed timing. May tear if a frame is late.
    FifoRelaxed,
}

/// Default number of frames the host may record ahead of the device.
pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;

/// Default bound on the host wait for a one-shot upload.
pub const DEFAULT_UPLOAD_FENCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for device bring-up and frame pacing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphicsConfig {
    /// Application name reported to the driver.
    pub app_name: String,
    /// Application version reported to the driver.
    pub app_version: u32,
    /// Enable validation layers and the debug messenger.
    pub validation: bool,
    /// Number of frame slots recorded ahead of the device.
    pub frames_in_flight: usize,
    /// Preferred presentation mode. Falls back to FIFO when unavailable.
    pub present_mode: PresentMode,
    /// Host wait bound for staged uploads. `None` waits forever.
    pub upload_fence_timeout: Option<Duration>,
    /// Rank discrete adapters above integrated ones.
    pub prefer_discrete_gpu: bool,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            app_name: "Tessera".to_string(),
            app_version: 1,
            validation: cfg!(debug_assertions),
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            present_mode: PresentMode::Fifo,
            upload_fence_timeout: Some(DEFAULT_UPLOAD_FENCE_TIMEOUT),
            prefer_discrete_gpu: true,
        }
    }
}

impl GraphicsConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    pub fn with_app_version(mut self, version: u32) -> Self {
        self.app_version = version;
        self
    }

    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.validation = enabled;
        self
    }

    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn with_present_mode(mut self, mode: PresentMode) -> Self {
        self.present_mode = mode;
        self
    }

    pub fn with_upload_fence_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.upload_fence_timeout = timeout;
        self
    }

    pub fn with_prefer_discrete_gpu(mut self, prefer: bool) -> Self {
        self.prefer_discrete_gpu = prefer;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GraphicsConfig::default();
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.present_mode, PresentMode::Fifo);
        assert_eq!(config.upload_fence_timeout, Some(Duration::from_secs(10)));
        assert!(config.prefer_discrete_gpu);
    }

    #[test]
    fn test_builder_overrides() {
        let config = GraphicsConfig::new()
            .with_app_name("triangle")
            .with_frames_in_flight(3)
            .with_present_mode(PresentMode::Mailbox)
            .with_upload_fence_timeout(None)
            .with_validation(false);

        assert_eq!(config.app_name, "triangle");
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.present_mode, PresentMode::Mailbox);
        assert_eq!(config.upload_fence_timeout, None);
        assert!(!config.validation);
    }
}
