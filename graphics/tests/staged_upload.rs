//! Staged buffer and image uploads through one-shot submissions.

mod common;

use std::time::Duration;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use log::Level;

use common::{capture_logs, captured, test_pattern, TestContext};
use tessera_graphics::backend::dummy::{BackendCall, FailPoint};
use tessera_graphics::{GraphicsConfig, GraphicsError};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
    color: [f32; 3],
}

const TRIANGLE: [Vertex; 3] = [
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

#[test]
fn test_staged_bytes_survive_round_trip() {
    let t = TestContext::new();
    let usage = vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC;

    for len in [256usize, 4096] {
        let data = test_pattern(len);
        let mut buffer = t.ctx.create_buffer_handle();
        buffer.create_staged_buffer(usage, &data).unwrap();

        assert_eq!(buffer.size(), len as u64);
        assert!(buffer.mapped_ptr().is_none());
        assert_eq!(buffer.read_back().unwrap(), data);
        assert_eq!(t.backend.buffer_contents(buffer.buffer()).unwrap(), data);
    }

    t.assert_clean();
}

#[test]
fn test_staging_same_payload_twice_is_identical() {
    let t = TestContext::new();
    let usage = vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC;
    let payload = test_pattern(1024);

    let mut first = t.ctx.create_buffer_handle();
    first.create_staged_buffer(usage, &payload).unwrap();
    let mut second = t.ctx.create_buffer_handle();
    second.create_staged_buffer(usage, &payload).unwrap();

    assert_ne!(first.buffer(), second.buffer());
    for buffer in [&first, &second] {
        assert_eq!(buffer.read_back().unwrap(), payload);
        assert_eq!(t.backend.buffer_contents(buffer.buffer()).unwrap(), payload);
    }
    assert_eq!(t.ctx.spare_pool_count(), 1);
    t.assert_clean();
}

#[test]
fn test_vertex_upload_frees_staging() {
    let t = TestContext::new();
    let baseline = t.backend.live_allocations();

    let mut vertices = t.ctx.create_buffer_handle();
    vertices
        .create_staged_buffer_from_slice(vk::BufferUsageFlags::VERTEX_BUFFER, &TRIANGLE)
        .unwrap();

    assert_eq!(vertices.size(), 72);
    assert!(vertices
        .usage()
        .contains(vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST));
    assert_eq!(t.backend.live_allocations(), baseline + 1);

    let stored = t.backend.buffer_contents(vertices.buffer()).unwrap();
    let decoded: &[Vertex] = bytemuck::cast_slice(&stored);
    assert_eq!(decoded, TRIANGLE);

    // The upload pool went back to the context and its fence was destroyed.
    assert_eq!(t.ctx.spare_pool_count(), 1);
    assert_eq!(t.backend.live_fences(), 0);

    drop(vertices);
    assert_eq!(t.backend.live_allocations(), baseline);
    t.assert_clean();
}

#[test]
fn test_upload_reuses_the_spare_pool() {
    let t = TestContext::new();
    for _ in 0..4 {
        let mut buffer = t.ctx.create_buffer_handle();
        buffer
            .create_staged_buffer(vk::BufferUsageFlags::INDEX_BUFFER, &[1, 2, 3, 4])
            .unwrap();
    }
    assert_eq!(
        t.count_calls(|c| matches!(c, BackendCall::CreateCommandPool(_))),
        1
    );
    assert_eq!(t.ctx.spare_pool_count(), 1);
}

#[test]
fn test_image_upload_ends_shader_readable() {
    let t = TestContext::new();
    let pixels = test_pattern(8 * 4 * 4);

    let mut image = t.ctx.create_image_handle();
    image.create_image_from_pixels(8, 4, &pixels).unwrap();
    image.create_view().unwrap();
    image
        .create_sampler(&tessera_graphics::SamplerDesc::default())
        .unwrap();

    assert_eq!(
        t.backend.image_layout(image.image()),
        Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    );
    assert_eq!(t.backend.image_contents(image.image()).unwrap(), pixels);
    assert_eq!(image.extent().width, 8);
    assert_eq!(image.extent().height, 4);
    assert_ne!(image.view(), vk::ImageView::null());
    assert_ne!(image.sampler(), vk::Sampler::null());

    drop(image);
    assert_eq!(t.backend.live_allocations(), 0);
    t.assert_clean();
}

#[test]
fn test_upload_timeout_leaks_staging() {
    let config =
        GraphicsConfig::default().with_upload_fence_timeout(Some(Duration::from_millis(5)));
    let t = TestContext::with_config(config);
    t.backend.set_hold_fences(true);

    let mut buffer = t.ctx.create_buffer_handle();
    let err = buffer
        .create_staged_buffer(vk::BufferUsageFlags::VERTEX_BUFFER, &test_pattern(64))
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(matches!(
        err,
        GraphicsError::Timeout {
            operation: "staged buffer upload",
            ..
        }
    ));
    // The device may still be copying, so neither buffer is freed and the
    // handle no longer claims the destination.
    assert!(!buffer.is_created());
    assert_eq!(t.backend.live_allocations(), 2);
    assert_eq!(
        t.count_calls(|c| matches!(c, BackendCall::DestroyBuffer(_))),
        0
    );
    assert_eq!(t.backend.live_fences(), 1);
    assert_eq!(t.ctx.spare_pool_count(), 0);
}

#[test]
fn test_empty_payload_rejected() {
    let t = TestContext::new();
    capture_logs();
    {
        let mut buffer = t.ctx.create_buffer_handle();
        let err = buffer
            .create_staged_buffer(vk::BufferUsageFlags::VERTEX_BUFFER, &[])
            .unwrap_err();
        assert!(matches!(err, GraphicsError::InvalidParameter(_)));
        assert!(!buffer.is_created());
    }
    assert_eq!(t.count_calls(|c| matches!(c, BackendCall::Submit { .. })), 0);
    assert_eq!(t.backend.live_allocations(), 0);
    assert_eq!(captured(Level::Warn).len(), 1);
}

#[test]
fn test_failed_submit_leaves_handle_empty() {
    let t = TestContext::new();
    t.backend
        .fail_next(FailPoint::QueueSubmit, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);

    let mut buffer = t.ctx.create_buffer_handle();
    let err = buffer
        .create_staged_buffer(vk::BufferUsageFlags::VERTEX_BUFFER, &[0u8; 16])
        .unwrap_err();

    assert!(matches!(err, GraphicsError::OutOfMemory));
    assert!(!buffer.is_created());
    assert_eq!(t.backend.live_allocations(), 0);

    // The handle can be populated after a failure.
    buffer
        .create_staged_buffer(vk::BufferUsageFlags::VERTEX_BUFFER, &[7u8; 16])
        .unwrap();
    assert_eq!(t.backend.buffer_contents(buffer.buffer()).unwrap(), [7u8; 16]);
}

#[test]
fn test_never_created_handles_warn_once() {
    let t = TestContext::new();
    capture_logs();

    drop(t.ctx.create_buffer_handle());
    let warnings = captured(Level::Warn);
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("never created"));

    capture_logs();
    drop(t.ctx.create_image_handle());
    assert_eq!(captured(Level::Warn).len(), 1);

    capture_logs();
    let mut buffer = t.ctx.create_buffer_handle();
    buffer
        .create_staged_buffer(vk::BufferUsageFlags::VERTEX_BUFFER, &[1u8; 32])
        .unwrap();
    drop(buffer);
    assert!(captured(Level::Warn).is_empty());
}
