use std::sync::Arc;

use ash::vk;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use tessera_graphics::backend::dummy::{DummyPipeline, DummySwapchain};
use tessera_graphics::{
    DeviceContext, DummyBackend, FrameContext, FrameLoop, FrameRenderer, GraphicsConfig,
    GraphicsError,
};

fn dummy_context() -> (Arc<DummyBackend>, DeviceContext) {
    let backend = Arc::new(DummyBackend::new());
    let ctx = DeviceContext::new(backend.clone(), GraphicsConfig::default());
    (backend, ctx)
}

// ---------------------------------------------------------------------------
// Command pools
// ---------------------------------------------------------------------------

fn bench_pool_lend_return(c: &mut Criterion) {
    let (_backend, ctx) = dummy_context();
    c.bench_function("command_pool_lend_return", |b| {
        b.iter(|| {
            let pool = ctx.lend_command_pool().unwrap();
            black_box(pool.handle());
        });
    });
}

fn bench_record_and_submit(c: &mut Criterion) {
    let (_backend, ctx) = dummy_context();
    c.bench_function("command_list_record_submit", |b| {
        b.iter(|| {
            let pool = ctx.lend_command_pool().unwrap();
            let mut list = pool
                .create_command_list(vk::CommandBufferLevel::PRIMARY)
                .unwrap();
            list.begin_record(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                .unwrap();
            list.end_record().unwrap();
            let fence = ctx.create_fence(false).unwrap();
            list.submit(Some(&fence)).unwrap();
            black_box(fence.wait(None).unwrap());
        });
    });
}

// ---------------------------------------------------------------------------
// Frame loop
// ---------------------------------------------------------------------------

struct Triangle {
    pipeline: DummyPipeline,
}

impl FrameRenderer for Triangle {
    fn record_frame(&mut self, frame: &mut FrameContext<'_, '_>) -> Result<(), GraphicsError> {
        frame
            .commands
            .begin_render_pass(frame.target, &self.pipeline, frame.image_index, &[])?;
        frame.commands.draw(3, 1, 0, 0)?;
        frame.commands.end_render_pass()
    }
}

fn bench_frame_cycle(c: &mut Criterion) {
    let (backend, ctx) = dummy_context();
    let mut swapchain = DummySwapchain::new(
        backend.clone(),
        3,
        vk::Extent2D {
            width: 1280,
            height: 720,
        },
    );
    let mut renderer = Triangle {
        pipeline: DummyPipeline::new(&backend),
    };
    let pool = ctx.lend_command_pool().unwrap();
    let mut frames = FrameLoop::new(&pool, 2).unwrap();

    c.bench_function("frame_loop_cycle_2_in_flight", |b| {
        b.iter(|| {
            black_box(frames.run_frame(&mut swapchain, false, &mut renderer).unwrap());
            // The call log grows with every frame.
            backend.clear_calls();
        });
    });
}

// ---------------------------------------------------------------------------
// Uploads
// ---------------------------------------------------------------------------

fn bench_staged_upload(c: &mut Criterion) {
    let (_backend, ctx) = dummy_context();
    let data = vec![0xABu8; 64 * 1024];
    c.bench_function("staged_buffer_upload_64k", |b| {
        b.iter(|| {
            let mut buffer = ctx.create_buffer_handle();
            buffer
                .create_staged_buffer(vk::BufferUsageFlags::VERTEX_BUFFER, &data)
                .unwrap();
            black_box(buffer.buffer());
        });
    });
}

criterion_group!(
    benches,
    bench_pool_lend_return,
    bench_record_and_submit,
    bench_frame_cycle,
    bench_staged_upload
);
criterion_main!(benches);
