//! Collaborator traits consumed by the frame loop.
//!
//! The windowing layer, the swapchain and the pipeline are external to the
//! synchronization core. The core only needs the narrow views below, which
//! both the Vulkan and the dummy backend implement.

use ash::vk;

use crate::error::GraphicsError;

/// Window event source.
pub trait Window {
    /// Whether the user asked to close the window.
    fn should_close(&self) -> bool;

    /// Pump pending window-system events without blocking.
    fn poll_events(&mut self);

    /// Returns `true` once after each framebuffer resize, then clears the flag.
    fn take_framebuffer_resized(&mut self) -> bool;
}

/// Presentation engine images for a surface.
pub trait Swapchain {
    fn handle(&self) -> vk::SwapchainKHR;

    fn surface_format(&self) -> vk::SurfaceFormatKHR;

    fn extent(&self) -> vk::Extent2D;

    fn image_count(&self) -> u32;

    /// Rebuild the swapchain and everything derived from its images.
    ///
    /// Called when acquire or present reports a stale surface, or after a
    /// resize. The caller guarantees no frame is mid-recording.
    fn recreate_swapchain(&mut self) -> Result<(), GraphicsError>;
}

/// Render pass plus one framebuffer per presentable image.
pub trait RenderTarget {
    fn render_pass(&self) -> vk::RenderPass;

    /// Framebuffer for a swapchain image, `None` for an out-of-range index.
    fn framebuffer(&self, image_index: u32) -> Option<vk::Framebuffer>;

    fn render_area(&self) -> vk::Rect2D;
}

/// A compiled pipeline ready to bind.
pub trait Pipeline {
    fn handle(&self) -> vk::Pipeline;

    fn layout(&self) -> vk::PipelineLayout;

    fn bind_point(&self) -> vk::PipelineBindPoint {
        vk::PipelineBindPoint::GRAPHICS
    }
}
