//! # Tessera Demos
//!
//! Demo programs built on `tessera-graphics`.
//!
//! ## Available Demos
//!
//! - `triangle` - spinning vertex-colored triangle, windowed over Vulkan or
//!   headless over the simulated device (`--headless`)

pub mod app;
pub mod args;
pub mod renderer;
pub mod window;

pub use args::Args;

/// Demos library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
