//! Triangle renderer recording one indexed draw per frame.

use std::mem::size_of;

use ash::vk;
use bytemuck::{Pod, Zeroable};

use tessera_graphics::{
    BufferHandle, DeviceContext, FrameContext, FrameRenderer, GraphicsError, Pipeline,
};

/// Interleaved position and color.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
}

impl Vertex {
    pub const STRIDE: u32 = size_of::<Self>() as u32;
    pub const POSITION_OFFSET: u32 = 0;
    pub const COLOR_OFFSET: u32 = size_of::<[f32; 3]>() as u32;
}

pub const TRIANGLE: [Vertex; 3] = [
    Vertex {
        position: [0.0, -0.5, 0.0],
        color: [1.0, 0.0, 0.0],
    },
    Vertex {
        position: [0.5, 0.5, 0.0],
        color: [0.0, 1.0, 0.0],
    },
    Vertex {
        position: [-0.5, 0.5, 0.0],
        color: [0.0, 0.0, 1.0],
    },
];

pub const TRIANGLE_INDICES: [u16; 3] = [0, 1, 2];

/// Matches `PushConstants` in `triangle.wgsl`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PushConstants {
    pub angle: f32,
    pub aspect: f32,
}

impl PushConstants {
    pub const SIZE: u32 = size_of::<Self>() as u32;
}

const CLEAR_COLOR: [f32; 4] = [0.02, 0.02, 0.05, 1.0];
const RADIANS_PER_FRAME: f32 = 0.01;

/// Draws [`TRIANGLE`] from device-local vertex and index buffers.
pub struct TriangleRenderer<'d, P> {
    pipeline: P,
    vertices: BufferHandle<'d>,
    indices: BufferHandle<'d>,
}

impl<'d, P: Pipeline> TriangleRenderer<'d, P> {
    /// Upload the triangle and wrap `pipeline`.
    pub fn new(ctx: &'d DeviceContext, pipeline: P) -> Result<Self, GraphicsError> {
        let mut vertices = ctx.create_buffer_handle();
        vertices.create_staged_buffer_from_slice(vk::BufferUsageFlags::VERTEX_BUFFER, &TRIANGLE)?;
        let mut indices = ctx.create_buffer_handle();
        indices.create_staged_buffer_from_slice(
            vk::BufferUsageFlags::INDEX_BUFFER,
            &TRIANGLE_INDICES,
        )?;
        log::info!(
            "Uploaded {} triangle vertices and {} indices",
            TRIANGLE.len(),
            TRIANGLE_INDICES.len()
        );
        Ok(Self {
            pipeline,
            vertices,
            indices,
        })
    }

    pub fn vertex_buffer(&self) -> &BufferHandle<'d> {
        &self.vertices
    }

    pub fn index_buffer(&self) -> &BufferHandle<'d> {
        &self.indices
    }
}

impl<P: Pipeline> FrameRenderer for TriangleRenderer<'_, P> {
    fn record_frame(&mut self, frame: &mut FrameContext<'_, '_>) -> Result<(), GraphicsError> {
        let area = frame.target.render_area();
        let aspect = if area.extent.height == 0 {
            1.0
        } else {
            area.extent.width as f32 / area.extent.height as f32
        };
        let constants = PushConstants {
            angle: frame.frame as f32 * RADIANS_PER_FRAME,
            aspect,
        };
        let clear = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: CLEAR_COLOR,
            },
        }];

        let commands = &mut *frame.commands;
        commands.begin_render_pass(frame.target, &self.pipeline, frame.image_index, &clear)?;
        commands.set_viewport_and_scissor(area)?;
        commands.bind_vertex_buffer(0, &self.vertices, 0)?;
        commands.bind_index_buffer(&self.indices, 0, vk::IndexType::UINT16)?;
        commands.push_constants(
            &self.pipeline,
            vk::ShaderStageFlags::VERTEX,
            0,
            bytemuck::bytes_of(&constants),
        )?;
        commands.draw_indexed(TRIANGLE_INDICES.len() as u32, 1, 0, 0, 0)?;
        commands.end_render_pass()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tessera_graphics::backend::dummy::{DummyPipeline, DummySwapchain, RecordedCommand};
    use tessera_graphics::{DummyBackend, FrameLoop, GraphicsConfig};

    use super::*;

    #[test]
    fn test_vertex_layout() {
        assert_eq!(Vertex::STRIDE, 24);
        assert_eq!(Vertex::COLOR_OFFSET, 12);
        assert_eq!(PushConstants::SIZE, 8);
    }

    #[test]
    fn test_frames_draw_the_uploaded_buffers() {
        let backend = Arc::new(DummyBackend::new());
        let ctx = DeviceContext::new(backend.clone(), GraphicsConfig::default());
        let mut swapchain = DummySwapchain::new(
            backend.clone(),
            3,
            vk::Extent2D {
                width: 200,
                height: 100,
            },
        );
        let mut renderer = TriangleRenderer::new(&ctx, DummyPipeline::new(&backend)).unwrap();
        let vertex_buffer = renderer.vertex_buffer().buffer();
        let index_buffer = renderer.index_buffer().buffer();
        assert_eq!(
            backend.buffer_contents(index_buffer).unwrap(),
            bytemuck::cast_slice::<u16, u8>(&TRIANGLE_INDICES)
        );
        let pool = ctx.lend_command_pool().unwrap();
        let mut frames = FrameLoop::new(&pool, 2).unwrap();

        for _ in 0..3 {
            frames
                .run_frame(&mut swapchain, false, &mut renderer)
                .unwrap();
        }

        let submitted = backend.submitted_commands();
        let draws = submitted
            .iter()
            .filter(|c| matches!(c, RecordedCommand::DrawIndexed { index_count: 3, .. }))
            .count();
        assert_eq!(draws, 3);
        assert!(!submitted
            .iter()
            .any(|c| matches!(c, RecordedCommand::Draw { .. })));
        assert!(submitted.iter().any(|c| matches!(
            c,
            RecordedCommand::BindIndexBuffer { buffer, index_type: vk::IndexType::UINT16 }
                if *buffer == index_buffer
        )));
        assert!(submitted.iter().any(|c| matches!(
            c,
            RecordedCommand::BindVertexBuffer { binding: 0, buffer } if *buffer == vertex_buffer
        )));

        let aspects: Vec<PushConstants> = submitted
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::PushConstants { data, .. } => {
                    Some(bytemuck::pod_read_unaligned::<PushConstants>(data))
                }
                _ => None,
            })
            .collect();
        assert_eq!(aspects.len(), 3);
        assert!(aspects.iter().all(|pc| pc.aspect == 2.0));
        assert_eq!(aspects[0].angle, 0.0);
        assert!(backend.validation_errors().is_empty());
    }
}
