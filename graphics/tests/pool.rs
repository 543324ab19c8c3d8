//! Command pool lending from several threads at once.

mod common;

use std::sync::Barrier;
use std::thread;

use ash::vk;

use common::{test_pattern, TestContext};
use tessera_graphics::backend::dummy::BackendCall;
use tessera_graphics::FenceWait;

const THREADS: usize = 8;
const ROUNDS: usize = 25;

#[test]
fn test_concurrent_lend_and_return() {
    common::init_logging();
    let t = TestContext::new();
    let barrier = Barrier::new(THREADS);

    thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                barrier.wait();
                for _ in 0..ROUNDS {
                    let pool = t.ctx.lend_command_pool().unwrap();
                    let mut list = pool
                        .create_command_list(vk::CommandBufferLevel::PRIMARY)
                        .unwrap();
                    list.begin_record(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                        .unwrap();
                    list.end_record().unwrap();

                    let fence = t.ctx.create_fence(false).unwrap();
                    list.submit(Some(&fence)).unwrap();
                    assert_eq!(fence.wait(None).unwrap(), FenceWait::Signaled);
                }
            });
        }
    });

    // Every pool came back, and no more were created than could be lent at once.
    let created = t.ctx.created_pool_count();
    assert!(created >= 1 && created <= THREADS, "created {created} pools");
    assert_eq!(t.ctx.spare_pool_count(), created);
    assert_eq!(
        t.count_calls(|c| matches!(c, BackendCall::ResetCommandPool(_))),
        THREADS * ROUNDS
    );
    assert_eq!(t.backend.live_command_buffers(), 0);
    t.assert_clean();
}

#[test]
fn test_concurrent_staged_uploads() {
    common::init_logging();
    let t = TestContext::new();

    thread::scope(|scope| {
        for i in 0..THREADS {
            let t = &t;
            scope.spawn(move || {
                let data = test_pattern(128 + i * 16);
                let mut buffer = t.ctx.create_buffer_handle();
                buffer
                    .create_staged_buffer(vk::BufferUsageFlags::UNIFORM_BUFFER, &data)
                    .unwrap();
                assert_eq!(t.backend.buffer_contents(buffer.buffer()).unwrap(), data);
            });
        }
    });

    assert_eq!(t.backend.live_allocations(), 0);
    assert_eq!(t.backend.live_fences(), 0);
    assert_eq!(t.ctx.spare_pool_count(), t.ctx.created_pool_count());
    t.assert_clean();
}

#[test]
fn test_dedicated_pool_is_not_lent() {
    common::init_logging();
    let t = TestContext::new();
    {
        let pool = t.ctx.create_command_pool().unwrap();
        assert!(!pool.is_lent());
    }
    assert_eq!(t.ctx.spare_pool_count(), 0);
    assert_eq!(t.backend.live_command_pools(), 0);

    {
        let pool = t.ctx.lend_command_pool().unwrap();
        assert!(pool.is_lent());
    }
    assert_eq!(t.ctx.spare_pool_count(), 1);
    assert_eq!(t.backend.live_command_pools(), 1);
}
