//! One-shot transfer submissions.
//!
//! Uploads run outside the frame loop. [`submit_one_shot`] lends a command
//! pool, records a one-time-submit list, submits it with a dedicated fence
//! and blocks until the fence signals. The wait is bounded by
//! [`GraphicsConfig::upload_fence_timeout`](crate::GraphicsConfig).
//!
//! When the wait times out the device may still be reading the command
//! buffer and whatever the commands reference. The pool, list and fence are
//! then leaked instead of destroyed, and callers leak their staging memory
//! the same way.

use std::time::Duration;

use ash::vk;

use crate::backend::FenceWait;
use crate::command::CommandList;
use crate::device::DeviceContext;
use crate::error::GraphicsError;

/// Record with `record`, submit, and block until the device has executed it.
pub fn submit_one_shot<F>(
    ctx: &DeviceContext,
    operation: &'static str,
    record: F,
) -> Result<(), GraphicsError>
where
    F: FnOnce(&mut CommandList<'_>) -> Result<(), GraphicsError>,
{
    let pool = ctx.lend_command_pool()?;
    let mut commands = pool.create_command_list(vk::CommandBufferLevel::PRIMARY)?;
    commands.begin_record(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
    record(&mut commands)?;
    commands.end_record()?;

    let fence = ctx.create_fence(false)?;
    commands.submit(Some(&fence))?;

    let timeout = ctx.config().upload_fence_timeout;
    match fence.wait(timeout)? {
        FenceWait::Signaled => {
            log::trace!("{} completed", operation);
            Ok(())
        }
        FenceWait::TimedOut => {
            let timeout = timeout.unwrap_or(Duration::MAX);
            let fence = fence.leak();
            std::mem::forget(commands);
            std::mem::forget(pool);
            log::error!(
                "{} did not complete within {:?}; leaking fence {:?} and its command buffer",
                operation,
                timeout,
                fence
            );
            Err(GraphicsError::Timeout { operation, timeout })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::dummy::{BackendCall, FailPoint};
    use crate::backend::DummyBackend;
    use crate::config::GraphicsConfig;

    #[test]
    fn test_one_shot_returns_pool_and_destroys_fence() {
        let backend = Arc::new(DummyBackend::new());
        let ctx = DeviceContext::new(backend.clone(), GraphicsConfig::default());

        submit_one_shot(&ctx, "empty transfer", |_| Ok(())).unwrap();

        assert_eq!(ctx.spare_pool_count(), 1);
        assert_eq!(backend.live_fences(), 0);
        assert_eq!(backend.live_command_buffers(), 0);
        let calls = backend.calls();
        let submit = calls
            .iter()
            .position(|c| matches!(c, BackendCall::Submit { .. }))
            .unwrap();
        let wait = calls
            .iter()
            .position(|c| matches!(c, BackendCall::WaitForFence(_)))
            .unwrap();
        assert!(submit < wait);
    }

    #[test]
    fn test_recording_error_skips_submission() {
        let backend = Arc::new(DummyBackend::new());
        let ctx = DeviceContext::new(backend.clone(), GraphicsConfig::default());

        let err = submit_one_shot(&ctx, "failing transfer", |_| {
            Err(GraphicsError::InvalidParameter("bad region".to_string()))
        })
        .unwrap_err();

        assert!(matches!(err, GraphicsError::InvalidParameter(_)));
        assert!(!backend
            .calls()
            .iter()
            .any(|c| matches!(c, BackendCall::Submit { .. })));
        assert_eq!(ctx.spare_pool_count(), 1);
    }

    #[test]
    fn test_submit_failure_propagates() {
        let backend = Arc::new(DummyBackend::new());
        let ctx = DeviceContext::new(backend.clone(), GraphicsConfig::default());
        backend.fail_next(FailPoint::QueueSubmit, vk::Result::ERROR_DEVICE_LOST);

        assert_eq!(
            submit_one_shot(&ctx, "transfer", |_| Ok(())),
            Err(GraphicsError::DeviceLost)
        );
        assert_eq!(backend.live_fences(), 0);
    }

    #[test]
    fn test_timeout_leaks_fence() {
        let backend = Arc::new(DummyBackend::new());
        let config =
            GraphicsConfig::default().with_upload_fence_timeout(Some(Duration::from_millis(5)));
        let ctx = DeviceContext::new(backend.clone(), config);
        backend.set_hold_fences(true);

        let err = submit_one_shot(&ctx, "stalled transfer", |_| Ok(())).unwrap_err();
        assert_eq!(
            err,
            GraphicsError::Timeout {
                operation: "stalled transfer",
                timeout: Duration::from_millis(5),
            }
        );
        assert_eq!(backend.live_fences(), 1);
        assert_eq!(ctx.spare_pool_count(), 0);
    }
}
