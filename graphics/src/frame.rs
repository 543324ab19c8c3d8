//! Frame loop.
//!
//! [`FrameLoop`] drives one presented frame per call to
//! [`FrameLoop::run_frame`]:
//!
//! 1. wait for the slot's fence (unbounded)
//! 2. acquire the next image; on an out-of-date surface recreate the
//!    swapchain and retry without advancing the frame counter
//! 3. record the slot's command list through the [`FrameRenderer`]
//! 4. reset the fence, submit
//! 5. present; a stale surface, a suboptimal acquire or a window resize
//!    triggers exactly one swapchain recreation
//! 6. advance the frame counter
//!
//! Stale surfaces are ordinary control flow. When recording fails, the
//! acquired image is cleared and presented anyway so the slot stays usable,
//! the error is returned and the counter does not advance. Every other
//! failure is returned, and [`FrameLoop::run`] stops on the first one.

use ash::vk;

use crate::backend::AcquireResult;
use crate::command::{CommandList, CommandPool};
use crate::device::DeviceContext;
use crate::error::GraphicsError;
use crate::sync::{FrameCounter, FrameSyncSet};
use crate::target::{RenderTarget, Swapchain, Window};

/// What the renderer gets to record one frame.
pub struct FrameContext<'a, 'p> {
    /// The slot's command list, already recording.
    pub commands: &'a mut CommandList<'p>,
    /// Target whose framebuffer `image_index` is being rendered.
    pub target: &'a dyn RenderTarget,
    pub image_index: u32,
    pub slot: usize,
    /// Frame number, counting presented frames.
    pub frame: u64,
}

/// Records the commands for one frame.
pub trait FrameRenderer {
    fn record_frame(&mut self, frame: &mut FrameContext<'_, '_>) -> Result<(), GraphicsError>;
}

impl<F> FrameRenderer for F
where
    F: FnMut(&mut FrameContext<'_, '_>) -> Result<(), GraphicsError>,
{
    fn record_frame(&mut self, frame: &mut FrameContext<'_, '_>) -> Result<(), GraphicsError> {
        self(frame)
    }
}

/// Result of one [`FrameLoop::run_frame`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was submitted and presented.
    Presented {
        slot: usize,
        image_index: u32,
        /// The swapchain was recreated after presenting.
        recreated: bool,
    },
    /// The surface was out of date on acquire. The swapchain was recreated
    /// and nothing was submitted.
    Retry,
}

/// Counters reported by [`FrameLoop::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub presented: u64,
    pub retries: u64,
    pub recreations: u64,
}

/// Frames-in-flight driver owning one command list per slot.
pub struct FrameLoop<'p> {
    ctx: &'p DeviceContext,
    sync: FrameSyncSet<'p>,
    commands: Vec<CommandList<'p>>,
    counter: FrameCounter,
    stats: FrameStats,
}

impl<'p> FrameLoop<'p> {
    /// Create sync objects and one primary command list per slot from `pool`.
    pub fn new(pool: &'p CommandPool<'p>, frames_in_flight: usize) -> Result<Self, GraphicsError> {
        let ctx = pool.context();
        let counter = FrameCounter::new(frames_in_flight)?;
        let sync = FrameSyncSet::new(ctx, frames_in_flight)?;
        let commands = (0..frames_in_flight)
            .map(|_| pool.create_command_list(vk::CommandBufferLevel::PRIMARY))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            ctx,
            sync,
            commands,
            counter,
            stats: FrameStats::default(),
        })
    }

    pub fn counter(&self) -> FrameCounter {
        self.counter
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn sync(&self) -> &FrameSyncSet<'p> {
        &self.sync
    }

    /// Run one frame cycle.
    pub fn run_frame<S, R>(
        &mut self,
        swapchain: &mut S,
        resized: bool,
        renderer: &mut R,
    ) -> Result<FrameOutcome, GraphicsError>
    where
        S: Swapchain + RenderTarget,
        R: FrameRenderer + ?Sized,
    {
        let slot = self.counter.slot();
        self.sync.wait_for_fence(slot)?;

        let (image_index, acquire_status) = match self.sync.acquire_next_image(slot, &*swapchain)? {
            AcquireResult::Image { index, status } => (index, status),
            AcquireResult::OutOfDate => {
                log::debug!(
                    "Swapchain out of date on acquire (frame {}), recreating",
                    self.counter.frame()
                );
                swapchain.recreate_swapchain()?;
                self.stats.recreations += 1;
                self.stats.retries += 1;
                return Ok(FrameOutcome::Retry);
            }
        };

        let frame_number = self.counter.frame();
        let recorded = record_commands(
            &mut self.commands[slot],
            &*swapchain,
            image_index,
            slot,
            frame_number,
            renderer,
        );
        // The acquired image still has to be submitted and presented, or the
        // slot's semaphore stays signaled and its fence never signals again.
        let recorded = match recorded {
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!(
                    "Recording frame {} failed, presenting a cleared image: {}",
                    frame_number,
                    e
                );
                let commands = &mut self.commands[slot];
                commands.close()?;
                commands.begin_record(vk::CommandBufferUsageFlags::empty())?;
                commands.clear_render_target(&*swapchain, image_index, &CLEARED)?;
                commands.end_record()?;
                Err(e)
            }
        };

        self.sync.reset_fence(slot)?;
        self.sync.submit_frame(slot, &self.commands[slot])?;
        let present_status = self.sync.present_frame(slot, &*swapchain, image_index)?;

        let recreated = present_status.is_stale() || acquire_status.is_stale() || resized;
        if recreated {
            log::debug!(
                "Recreating swapchain after frame {} (acquire {:?}, present {:?}, resized {})",
                frame_number,
                acquire_status,
                present_status,
                resized
            );
            swapchain.recreate_swapchain()?;
            self.stats.recreations += 1;
        }
        recorded?;

        self.counter.advance();
        self.stats.presented += 1;
        Ok(FrameOutcome::Presented {
            slot,
            image_index,
            recreated,
        })
    }

    /// Poll `window` and run frames until it asks to close or `max_frames`
    /// frames were presented, then wait for the device to go idle.
    pub fn run<W, S, R>(
        &mut self,
        window: &mut W,
        swapchain: &mut S,
        renderer: &mut R,
        max_frames: Option<u64>,
    ) -> Result<FrameStats, GraphicsError>
    where
        W: Window + ?Sized,
        S: Swapchain + RenderTarget,
        R: FrameRenderer + ?Sized,
    {
        log::info!(
            "Entering frame loop ({} frames in flight)",
            self.counter.frames_in_flight()
        );

        while !window.should_close() {
            if max_frames.is_some_and(|limit| self.stats.presented >= limit) {
                break;
            }
            window.poll_events();
            let resized = window.take_framebuffer_resized();
            if let Err(e) = self.run_frame(swapchain, resized, renderer) {
                log::error!("Frame {} failed: {}", self.counter.frame(), e);
                return Err(e);
            }
        }

        self.ctx.wait_idle()?;
        log::info!(
            "Frame loop finished: {} presented, {} retried, {} swapchain recreations",
            self.stats.presented,
            self.stats.retries,
            self.stats.recreations
        );
        Ok(self.stats)
    }
}

/// Fills the image presented in place of a frame whose recording failed.
const CLEARED: [vk::ClearValue; 1] = [vk::ClearValue {
    color: vk::ClearColorValue {
        float32: [0.0, 0.0, 0.0, 1.0],
    },
}];

fn record_commands<R>(
    commands: &mut CommandList<'_>,
    target: &dyn RenderTarget,
    image_index: u32,
    slot: usize,
    frame: u64,
    renderer: &mut R,
) -> Result<(), GraphicsError>
where
    R: FrameRenderer + ?Sized,
{
    commands.begin_record(vk::CommandBufferUsageFlags::empty())?;
    let mut context = FrameContext {
        commands: &mut *commands,
        target,
        image_index,
        slot,
        frame,
    };
    renderer.record_frame(&mut context)?;
    commands.end_record()
}

impl std::fmt::Debug for FrameLoop<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameLoop")
            .field("counter", &self.counter)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Drop for FrameLoop<'_> {
    fn drop(&mut self) {
        // Fences, semaphores and lists may still be referenced by the last
        // submissions.
        if let Err(e) = self.ctx.wait_idle() {
            log::error!("Failed to wait for device idle before frame loop teardown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::dummy::{BackendCall, DummySwapchain, RecordedCommand};
    use crate::backend::{DummyBackend, SurfaceStatus};
    use crate::config::GraphicsConfig;

    fn setup() -> (DeviceContext, Arc<DummyBackend>, DummySwapchain) {
        let backend = Arc::new(DummyBackend::new());
        let ctx = DeviceContext::new(backend.clone(), GraphicsConfig::default());
        let swapchain = DummySwapchain::new(
            backend.clone(),
            3,
            vk::Extent2D {
                width: 320,
                height: 240,
            },
        );
        (ctx, backend, swapchain)
    }

    fn noop(_: &mut FrameContext<'_, '_>) -> Result<(), GraphicsError> {
        Ok(())
    }

    #[test]
    fn test_single_frame_order() {
        let (ctx, backend, mut swapchain) = setup();
        let pool = ctx.lend_command_pool().unwrap();
        let mut frames = FrameLoop::new(&pool, 2).unwrap();
        backend.clear_calls();

        let outcome = frames.run_frame(&mut swapchain, false, &mut noop).unwrap();
        assert_eq!(
            outcome,
            FrameOutcome::Presented {
                slot: 0,
                image_index: 0,
                recreated: false
            }
        );

        let kinds: Vec<&str> = backend
            .calls()
            .iter()
            .map(|call| match call {
                BackendCall::WaitForFence(_) => "wait",
                BackendCall::AcquireNextImage { .. } => "acquire",
                BackendCall::ResetFence(_) => "reset",
                BackendCall::BeginCommandBuffer(_) => "begin",
                BackendCall::EndCommandBuffer(_) => "end",
                BackendCall::Submit { .. } => "submit",
                BackendCall::Present { .. } => "present",
                _ => "other",
            })
            .collect();
        assert_eq!(
            kinds,
            ["wait", "acquire", "begin", "end", "reset", "submit", "present"]
        );
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn test_out_of_date_acquire_retries_without_advancing() {
        let (ctx, backend, mut swapchain) = setup();
        let pool = ctx.lend_command_pool().unwrap();
        let mut frames = FrameLoop::new(&pool, 2).unwrap();

        backend.script_acquire(SurfaceStatus::OutOfDate);
        assert_eq!(
            frames.run_frame(&mut swapchain, false, &mut noop).unwrap(),
            FrameOutcome::Retry
        );
        assert_eq!(frames.counter().frame(), 0);

        assert!(matches!(
            frames.run_frame(&mut swapchain, false, &mut noop).unwrap(),
            FrameOutcome::Presented { slot: 0, .. }
        ));
        assert_eq!(frames.counter().frame(), 1);
        assert_eq!(frames.stats().recreations, 1);
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn test_renderer_error_presents_cleared_image() {
        let (ctx, backend, mut swapchain) = setup();
        let pool = ctx.lend_command_pool().unwrap();
        let mut frames = FrameLoop::new(&pool, 2).unwrap();
        fn failing(_: &mut FrameContext<'_, '_>) -> Result<(), GraphicsError> {
            Err(GraphicsError::Internal("renderer failed".to_string()))
        }
        backend.clear_calls();

        let err = frames.run_frame(&mut swapchain, false, &mut failing).unwrap_err();
        assert!(matches!(err, GraphicsError::Internal(_)));
        assert_eq!(frames.counter().frame(), 0);
        assert_eq!(frames.stats().presented, 0);

        let submitted = backend.submitted_commands();
        assert_eq!(submitted.len(), 2);
        assert!(matches!(submitted[0], RecordedCommand::BeginRenderPass { .. }));
        assert!(matches!(submitted[1], RecordedCommand::EndRenderPass));
        assert!(backend
            .calls()
            .iter()
            .any(|c| matches!(c, BackendCall::Present { .. })));
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn test_single_slot_recovers_after_renderer_error() {
        let (ctx, backend, mut swapchain) = setup();
        let pool = ctx.lend_command_pool().unwrap();
        let mut frames = FrameLoop::new(&pool, 1).unwrap();
        let mut failures = 1;
        let mut flaky = |_: &mut FrameContext<'_, '_>| {
            if failures > 0 {
                failures -= 1;
                return Err(GraphicsError::InvalidParameter("bad draw".to_string()));
            }
            Ok(())
        };

        assert!(frames.run_frame(&mut swapchain, false, &mut flaky).is_err());
        assert!(matches!(
            frames.run_frame(&mut swapchain, false, &mut flaky).unwrap(),
            FrameOutcome::Presented { slot: 0, .. }
        ));
        assert!(matches!(
            frames.run_frame(&mut swapchain, false, &mut flaky).unwrap(),
            FrameOutcome::Presented { slot: 0, .. }
        ));
        assert_eq!(frames.counter().frame(), 2);
        assert!(backend.validation_errors().is_empty());
    }
}
