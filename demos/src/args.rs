//! Command-line arguments shared by the demo binaries.

use clap::Parser;

use tessera_graphics::config::DEFAULT_FRAMES_IN_FLIGHT;
use tessera_graphics::{GraphicsConfig, PresentMode};

/// Frame limit for headless runs, which have no window to close.
pub const HEADLESS_FRAME_LIMIT: u64 = 120;

/// Tessera demo arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "triangle",
    about = "Spinning triangle driven by the Tessera frame loop",
    long_about = "Renders a vertex-colored triangle through the Tessera frame loop.\n\n\
        By default a window is opened and rendered with the Vulkan backend.\n\
        With --headless the same loop runs against the simulated device,\n\
        which needs neither a display nor a GPU.\n\
        \n\
        EXAMPLES:\n\
          # Render until the window is closed\n\
          ./triangle\n\
        \n\
          # Three frames in flight, exit after 500 frames\n\
          ./triangle --frames-in-flight 3 --frames 500\n\
        \n\
          # Smoke test without a GPU\n\
          ./triangle --headless --frames 10",
    version
)]
pub struct Args {
    /// Exit after presenting N frames.
    #[arg(long)]
    pub frames: Option<u64>,

    /// Frames the host may record ahead of the device.
    #[arg(long, default_value_t = DEFAULT_FRAMES_IN_FLIGHT)]
    pub frames_in_flight: usize,

    /// Enable GPU validation layers (slower but helps catch bugs).
    #[arg(long, conflicts_with = "no_validation")]
    pub validation: bool,

    /// Disable GPU validation layers.
    #[arg(long, conflicts_with = "validation")]
    pub no_validation: bool,

    /// Run against the simulated device without opening a window.
    #[arg(long)]
    pub headless: bool,

    /// Initial window width in pixels.
    #[arg(long, default_value = "1280")]
    pub width: u32,

    /// Initial window height in pixels.
    #[arg(long, default_value = "720")]
    pub height: u32,

    /// Disable vertical sync (mailbox presentation when available).
    #[arg(long)]
    pub no_vsync: bool,

    /// Rank integrated GPUs above discrete ones.
    #[arg(long)]
    pub integrated: bool,
}

impl Args {
    /// Graphics configuration described by these arguments.
    pub fn graphics_config(&self) -> GraphicsConfig {
        // --validation forces on, --no-validation forces off, otherwise use debug default
        let validation = self.validation || (!self.no_validation && cfg!(debug_assertions));
        let present_mode = if self.no_vsync {
            PresentMode::Mailbox
        } else {
            PresentMode::Fifo
        };

        GraphicsConfig::default()
            .with_app_name("Tessera Triangle")
            .with_validation(validation)
            .with_frames_in_flight(self.frames_in_flight)
            .with_present_mode(present_mode)
            .with_prefer_discrete_gpu(!self.integrated)
    }

    /// Presented-frame limit for the frame loop.
    pub fn frame_limit(&self) -> Option<u64> {
        match (self.frames, self.headless) {
            (Some(frames), _) => Some(frames),
            (None, true) => Some(HEADLESS_FRAME_LIMIT),
            (None, false) => None,
        }
    }
}
