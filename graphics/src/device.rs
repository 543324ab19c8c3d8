//! Device context.
//!
//! The [`DeviceContext`] is the root object of the engine. It owns the
//! backend, the configuration and a pool of reusable command pools, and
//! every other handle borrows it, so the borrow checker enforces that no
//! resource outlives the device.
//!
//! # Command pool reuse
//!
//! Native command pools are externally synchronized and fairly expensive to
//! create. Instead of destroying them, threads lend a pool from the context
//! with [`DeviceContext::lend_command_pool`], record into it, and the pool
//! is reset and handed back when the [`CommandPool`] guard drops. The spare
//! queue is the only structure shared between threads; the lock is held
//! only for the push or pop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::backend::{GpuBackend, QueueFamilyIndices};
use crate::command::CommandPool;
use crate::config::GraphicsConfig;
use crate::error::GraphicsError;
use crate::resources::{BufferHandle, ImageHandle};
use crate::sync::{Fence, FrameSyncSet, Semaphore};

/// Root of the object graph: backend, configuration and command-pool reuse.
///
/// # Thread Safety
///
/// `DeviceContext` is `Send + Sync`. Pools may be lent and returned from any
/// thread; everything else is either immutable or synchronized by the backend.
pub struct DeviceContext {
    backend: Arc<dyn GpuBackend>,
    config: GraphicsConfig,
    /// Pools that are not lent out. A handle is never in here twice.
    spare_pools: Mutex<VecDeque<vk::CommandPool>>,
    created_pools: AtomicUsize,
}

impl DeviceContext {
    /// Create a context over an initialized backend.
    pub fn new(backend: Arc<dyn GpuBackend>, config: GraphicsConfig) -> Self {
        log::info!(
            "Device context created on {} backend ({} frames in flight)",
            backend.name(),
            config.frames_in_flight
        );
        Self {
            backend,
            config,
            spare_pools: Mutex::new(VecDeque::new()),
            created_pools: AtomicUsize::new(0),
        }
    }

    pub fn backend(&self) -> &dyn GpuBackend {
        self.backend.as_ref()
    }

    pub fn config(&self) -> &GraphicsConfig {
        &self.config
    }

    pub fn queue_families(&self) -> QueueFamilyIndices {
        self.backend.queue_families()
    }

    /// Take a spare native pool, creating a new one when none is available.
    ///
    /// The caller owns the returned pool until it hands it back with
    /// [`release_pool`](Self::release_pool). Prefer
    /// [`lend_command_pool`](Self::lend_command_pool), which does that on drop.
    pub fn acquire_pool(&self) -> Result<vk::CommandPool, GraphicsError> {
        let spare = self.spare_pools.lock().pop_front();
        if let Some(pool) = spare {
            log::trace!("Reusing command pool {:?}", pool);
            return Ok(pool);
        }

        let pool = self.backend.create_command_pool()?;
        let total = self.created_pools.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!("Created command pool {:?} ({} total)", pool, total);
        Ok(pool)
    }

    /// Return a pool taken with [`acquire_pool`](Self::acquire_pool).
    ///
    /// The pool must have been reset and must have no work in flight.
    pub fn release_pool(&self, pool: vk::CommandPool) {
        let mut spare = self.spare_pools.lock();
        debug_assert!(
            !spare.contains(&pool),
            "command pool {pool:?} returned twice"
        );
        spare.push_back(pool);
    }

    /// Destroy a pool that can no longer be reused.
    pub(crate) fn discard_pool(&self, pool: vk::CommandPool) {
        // SAFETY: the pool has been taken out of circulation by its only owner.
        unsafe { self.backend.destroy_command_pool(pool) };
        self.created_pools.fetch_sub(1, Ordering::Relaxed);
        log::debug!("Discarded command pool {:?}", pool);
    }

    /// Lend a command pool. It is reset and returned when the guard drops.
    pub fn lend_command_pool(&self) -> Result<CommandPool<'_>, GraphicsError> {
        let pool = self.acquire_pool()?;
        Ok(CommandPool::lent(self, pool))
    }

    /// Create a command pool owned outright by the returned guard.
    ///
    /// The pool never enters the spare queue and is destroyed on drop.
    pub fn create_command_pool(&self) -> Result<CommandPool<'_>, GraphicsError> {
        let pool = self.backend.create_command_pool()?;
        log::debug!("Created dedicated command pool {:?}", pool);
        Ok(CommandPool::dedicated(self, pool))
    }

    /// Number of pools waiting in the spare queue.
    pub fn spare_pool_count(&self) -> usize {
        self.spare_pools.lock().len()
    }

    /// Number of pools created for lending that are still alive.
    pub fn created_pool_count(&self) -> usize {
        self.created_pools.load(Ordering::Relaxed)
    }

    pub fn create_fence(&self, signaled: bool) -> Result<Fence<'_>, GraphicsError> {
        Fence::new(self, signaled)
    }

    pub fn create_semaphore(&self) -> Result<Semaphore<'_>, GraphicsError> {
        Semaphore::new(self)
    }

    /// Create an empty buffer handle. Populate it with one of its `create_*` methods.
    pub fn create_buffer_handle(&self) -> BufferHandle<'_> {
        BufferHandle::new(self)
    }

    /// Create an empty image handle. Populate it with one of its `create_*` methods.
    pub fn create_image_handle(&self) -> ImageHandle<'_> {
        ImageHandle::new(self)
    }

    /// Create per-frame fences and semaphores for `frames_in_flight` slots.
    pub fn create_sync_objects(
        &self,
        frames_in_flight: usize,
    ) -> Result<FrameSyncSet<'_>, GraphicsError> {
        FrameSyncSet::new(self, frames_in_flight)
    }

    /// Block until the device has finished all submitted work.
    pub fn wait_idle(&self) -> Result<(), GraphicsError> {
        self.backend.wait_idle()
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("backend", &self.backend.name())
            .field("spare_pools", &self.spare_pool_count())
            .field("created_pools", &self.created_pool_count())
            .finish_non_exhaustive()
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if let Err(e) = self.backend.wait_idle() {
            log::error!("Failed to wait for device idle during teardown: {}", e);
        }

        let spare: Vec<_> = self.spare_pools.get_mut().drain(..).collect();
        let created = *self.created_pools.get_mut();
        if spare.len() != created {
            log::warn!(
                "{} of {} command pools were never returned",
                created.saturating_sub(spare.len()),
                created
            );
        }
        for pool in spare {
            // SAFETY: the device is idle and spare pools are not lent out.
            unsafe { self.backend.destroy_command_pool(pool) };
        }
        log::debug!("Device context destroyed ({} command pools)", created);
    }
}

static_assertions::assert_impl_all!(DeviceContext: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;

    fn context() -> (DeviceContext, Arc<DummyBackend>) {
        let backend = Arc::new(DummyBackend::new());
        let ctx = DeviceContext::new(backend.clone(), GraphicsConfig::default());
        (ctx, backend)
    }

    #[test]
    fn test_acquire_creates_then_reuses() {
        let (ctx, backend) = context();

        let first = ctx.acquire_pool().unwrap();
        ctx.release_pool(first);
        let second = ctx.acquire_pool().unwrap();

        assert_eq!(first, second);
        assert_eq!(ctx.created_pool_count(), 1);
        assert_eq!(backend.live_command_pools(), 1);
        ctx.release_pool(second);
    }

    #[test]
    fn test_two_outstanding_pools_are_distinct() {
        let (ctx, _backend) = context();

        let a = ctx.acquire_pool().unwrap();
        let b = ctx.acquire_pool().unwrap();
        assert_ne!(a, b);
        assert_eq!(ctx.spare_pool_count(), 0);

        ctx.release_pool(a);
        ctx.release_pool(b);
        assert_eq!(ctx.spare_pool_count(), 2);
    }

    #[test]
    fn test_lent_pool_returns_on_drop() {
        let (ctx, _backend) = context();
        {
            let _pool = ctx.lend_command_pool().unwrap();
            assert_eq!(ctx.spare_pool_count(), 0);
        }
        assert_eq!(ctx.spare_pool_count(), 1);
    }

    #[test]
    fn test_dedicated_pool_is_destroyed_on_drop() {
        let (ctx, backend) = context();
        {
            let _pool = ctx.create_command_pool().unwrap();
            assert_eq!(backend.live_command_pools(), 1);
        }
        assert_eq!(backend.live_command_pools(), 0);
        assert_eq!(ctx.spare_pool_count(), 0);
    }

    #[test]
    fn test_teardown_destroys_spare_pools() {
        let (ctx, backend) = context();
        let a = ctx.acquire_pool().unwrap();
        let b = ctx.acquire_pool().unwrap();
        ctx.release_pool(a);
        ctx.release_pool(b);
        drop(ctx);

        assert_eq!(backend.live_command_pools(), 0);
        assert!(backend.validation_errors().is_empty());
    }
}
