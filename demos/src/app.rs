//! Demo entry points: a headless run over the simulated device and a
//! windowed run over Vulkan.

use std::sync::Arc;

use ash::vk;

use tessera_graphics::backend::dummy::{DummyPipeline, DummySwapchain, DummyWindow};
use tessera_graphics::{
    DeviceContext, DummyBackend, FrameLoop, FrameStats, GpuBackend, GraphicsError,
};

use crate::args::Args;
use crate::renderer::TriangleRenderer;

/// Swapchain image count used by the headless run.
const HEADLESS_IMAGE_COUNT: u32 = 3;

/// Run the triangle demo described by `args`.
pub fn run(args: &Args) -> Result<FrameStats, GraphicsError> {
    if args.headless {
        run_headless(args)
    } else {
        run_windowed(args)
    }
}

/// Drive the frame loop against [`DummyBackend`].
pub fn run_headless(args: &Args) -> Result<FrameStats, GraphicsError> {
    let config = args.graphics_config();
    let backend = Arc::new(DummyBackend::new());
    let ctx = DeviceContext::new(backend.clone(), config.clone());
    log::info!("Running headless on the {} backend", ctx.backend().name());

    let mut swapchain = DummySwapchain::new(
        backend.clone(),
        HEADLESS_IMAGE_COUNT,
        vk::Extent2D {
            width: args.width,
            height: args.height,
        },
    );
    let mut window = DummyWindow::open();
    let mut renderer = TriangleRenderer::new(&ctx, DummyPipeline::new(&backend))?;

    let pool = ctx.lend_command_pool()?;
    let stats = {
        let mut frames = FrameLoop::new(&pool, config.frames_in_flight)?;
        frames.run(&mut window, &mut swapchain, &mut renderer, args.frame_limit())?
    };

    let errors = backend.validation_errors();
    if let Some(first) = errors.first() {
        return Err(GraphicsError::Internal(format!(
            "{} validation error(s), first: {}",
            errors.len(),
            first
        )));
    }
    Ok(stats)
}

#[cfg(feature = "vulkan")]
pub use self::windowed::run_windowed;

#[cfg(feature = "vulkan")]
mod windowed {
    use std::sync::Arc;

    use ash::vk;

    use tessera_graphics::backend::vulkan::{
        GraphicsPipelineBuilder, ShaderCompiler, ShaderStage, VulkanPipeline, VulkanSwapchain,
    };
    use tessera_graphics::{
        DeviceContext, FrameLoop, FrameStats, GraphicsError, RenderTarget, VulkanBackend,
    };

    use crate::args::Args;
    use crate::renderer::{PushConstants, TriangleRenderer, Vertex};
    use crate::window::DemoWindow;

    const TRIANGLE_SHADER: &str = include_str!("../shaders/triangle.wgsl");

    /// Open a window and render with the Vulkan backend until it is closed.
    pub fn run_windowed(args: &Args) -> Result<FrameStats, GraphicsError> {
        let config = args.graphics_config();
        // Locals drop in reverse order: frames, pool, renderer, swapchain,
        // context, backend, window.
        let mut window = DemoWindow::new(&config.app_name, args.width, args.height)?;
        let backend = Arc::new(VulkanBackend::new(&config, window.window())?);
        let ctx = DeviceContext::new(backend.clone(), config.clone());

        let extent = window.shared_extent();
        let mut swapchain = VulkanSwapchain::new(backend.clone(), window.extent())?
            .with_extent_provider(move || extent.extent());

        let pipeline = build_pipeline(&backend, &swapchain)?;
        let mut renderer = TriangleRenderer::new(&ctx, pipeline)?;

        let pool = ctx.lend_command_pool()?;
        let mut frames = FrameLoop::new(&pool, config.frames_in_flight)?;
        frames.run(&mut window, &mut swapchain, &mut renderer, args.frame_limit())
    }

    /// Compile `triangle.wgsl` and build a pipeline for the swapchain's
    /// render pass.
    pub fn build_pipeline(
        backend: &Arc<VulkanBackend>,
        swapchain: &VulkanSwapchain,
    ) -> Result<VulkanPipeline, GraphicsError> {
        let vertex = ShaderCompiler::compile_wgsl(TRIANGLE_SHADER, ShaderStage::Vertex, "vs_main")?;
        let fragment =
            ShaderCompiler::compile_wgsl(TRIANGLE_SHADER, ShaderStage::Fragment, "fs_main")?;

        GraphicsPipelineBuilder::new(Arc::clone(backend))
            .vertex_shader(vertex, "vs_main")?
            .fragment_shader(fragment, "fs_main")?
            .vertex_binding(0, Vertex::STRIDE)
            .vertex_attribute(0, 0, vk::Format::R32G32B32_SFLOAT, Vertex::POSITION_OFFSET)
            .vertex_attribute(1, 0, vk::Format::R32G32B32_SFLOAT, Vertex::COLOR_OFFSET)
            .push_constant_range(vk::ShaderStageFlags::VERTEX, 0, PushConstants::SIZE)
            .render_pass(swapchain.render_pass(), 0)
            .build()
    }
}

#[cfg(not(feature = "vulkan"))]
pub fn run_windowed(_args: &Args) -> Result<FrameStats, GraphicsError> {
    Err(GraphicsError::FeatureNotSupported(
        "windowed rendering needs the `vulkan` feature".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(1, 5)]
    #[case(2, 12)]
    #[case(3, 7)]
    fn test_headless_presents_frame_limit(#[case] frames_in_flight: usize, #[case] frames: u64) {
        let args = Args::try_parse_from([
            "triangle".to_string(),
            "--headless".to_string(),
            "--frames-in-flight".to_string(),
            frames_in_flight.to_string(),
            "--frames".to_string(),
            frames.to_string(),
        ])
        .unwrap();

        let stats = run(&args).unwrap();
        assert_eq!(stats.presented, frames);
        assert_eq!(stats.recreations, 0);
    }

    #[test]
    fn test_headless_rejects_zero_frames_in_flight() {
        let args =
            Args::try_parse_from(["triangle", "--headless", "--frames-in-flight", "0"]).unwrap();
        assert!(matches!(
            run(&args),
            Err(GraphicsError::InvalidParameter(_))
        ));
    }
}
