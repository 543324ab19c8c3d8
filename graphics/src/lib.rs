//! # Tessera Graphics
//!
//! Frame synchronization, command recording and GPU transfer core of the
//! Tessera engine.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`DeviceContext`] - shared device state and a thread-safe pool of spare command pools
//! - [`CommandPool`] / [`CommandList`] - state-checked command recording
//! - [`FrameSyncSet`] / [`FrameLoop`] - the frames-in-flight handshake with a swapchain
//! - [`BufferHandle`] / [`ImageHandle`] - GPU resources with blocking staged uploads
//! - [`GpuBackend`] - the seam between the core and a driver: Vulkan, or Dummy for testing
//!
//! ## Example
//!
//! ```ignore
//! use tessera_graphics::{DeviceContext, FrameLoop, GraphicsConfig};
//!
//! let ctx = DeviceContext::new(backend, GraphicsConfig::default());
//! let pool = ctx.lend_command_pool()?;
//! let mut frames = FrameLoop::new(&pool, ctx.config().frames_in_flight)?;
//! frames.run(&mut window, &mut swapchain, &mut renderer, None)?;
//! ```

pub mod backend;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod frame;
pub mod resources;
pub mod sync;
pub mod target;

// Re-export main types for convenience
pub use backend::{
    AcquireResult, BufferDesc, DummyBackend, FenceWait, GpuBackend, ImageDesc, MemoryLocation,
    SamplerDesc, SurfaceStatus,
};
pub use command::{CommandList, CommandListState, CommandPool, ImageBarrierInfo};
pub use config::{GraphicsConfig, PresentMode};
pub use device::DeviceContext;
pub use error::GraphicsError;
pub use frame::{FrameContext, FrameLoop, FrameOutcome, FrameRenderer, FrameStats};
pub use resources::{BufferHandle, ImageHandle, ImageInfo};
pub use sync::{Fence, FrameCounter, FrameSyncSet, Semaphore};
pub use target::{Pipeline, RenderTarget, Swapchain, Window};

#[cfg(feature = "vulkan-backend")]
pub use backend::vulkan::VulkanBackend;

/// Graphics library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the graphics subsystem.
///
/// This should be called before using any graphics functionality.
pub fn init() {
    log::info!("Tessera Graphics v{} initialized", VERSION);
}
