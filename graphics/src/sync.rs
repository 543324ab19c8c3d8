//! GPU synchronization primitives.
//!
//! This module provides the owning [`Fence`] and [`Semaphore`] handles and
//! [`FrameSyncSet`], which coordinates several frames in flight:
//!
//! - the host waits on a slot's fence before re-recording that slot's
//!   command list, so it never overwrites commands the device is reading
//! - acquire signals the slot's image-available semaphore, the submission
//!   waits on it and signals render-finished, and presentation waits on that
//!
//! The slot for a frame is `frame % frames_in_flight` (see [`FrameCounter`]).

use std::time::Duration;

use ash::vk;

use crate::backend::{AcquireResult, FenceWait, QueueSubmit, SurfaceStatus};
use crate::command::{CommandList, CommandListState};
use crate::device::DeviceContext;
use crate::error::GraphicsError;
use crate::target::Swapchain;

/// CPU-GPU synchronization primitive. Destroyed on drop.
pub struct Fence<'d> {
    ctx: &'d DeviceContext,
    fence: vk::Fence,
}

impl<'d> Fence<'d> {
    /// Create a new fence, optionally already signaled.
    pub fn new(ctx: &'d DeviceContext, signaled: bool) -> Result<Self, GraphicsError> {
        let fence = ctx.backend().create_fence(signaled)?;
        Ok(Self { ctx, fence })
    }

    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Block until the fence is signaled or `timeout` expires.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<FenceWait, GraphicsError> {
        self.ctx.backend().wait_for_fence(self.fence, timeout)
    }

    pub fn reset(&self) -> Result<(), GraphicsError> {
        self.ctx.backend().reset_fence(self.fence)
    }

    /// Give up ownership without destroying the native fence.
    ///
    /// Used when the device may still signal it and waiting is not an option.
    pub(crate) fn leak(self) -> vk::Fence {
        let fence = self.fence;
        std::mem::forget(self);
        fence
    }
}

impl std::fmt::Debug for Fence<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Fence").field(&self.fence).finish()
    }
}

impl Drop for Fence<'_> {
    fn drop(&mut self) {
        // SAFETY: owners wait on the fence before dropping it.
        unsafe { self.ctx.backend().destroy_fence(self.fence) };
    }
}

/// GPU semaphore ordering queue operations. Destroyed on drop.
///
/// Unlike fences, semaphores cannot be waited on from the CPU.
pub struct Semaphore<'d> {
    ctx: &'d DeviceContext,
    semaphore: vk::Semaphore,
}

impl<'d> Semaphore<'d> {
    pub fn new(ctx: &'d DeviceContext) -> Result<Self, GraphicsError> {
        let semaphore = ctx.backend().create_semaphore()?;
        Ok(Self { ctx, semaphore })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl std::fmt::Debug for Semaphore<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Semaphore").field(&self.semaphore).finish()
    }
}

impl Drop for Semaphore<'_> {
    fn drop(&mut self) {
        // SAFETY: owners idle the device before dropping semaphores.
        unsafe { self.ctx.backend().destroy_semaphore(self.semaphore) };
    }
}

/// Monotonic frame number and the slot it maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCounter {
    frame: u64,
    frames_in_flight: usize,
}

impl FrameCounter {
    pub fn new(frames_in_flight: usize) -> Result<Self, GraphicsError> {
        if frames_in_flight == 0 {
            return Err(GraphicsError::InvalidParameter(
                "frames_in_flight must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            frame: 0,
            frames_in_flight,
        })
    }

    /// Number of frames completed so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn slot(&self) -> usize {
        (self.frame % self.frames_in_flight as u64) as usize
    }

    /// Move to the next frame. Call only after a frame was presented.
    pub fn advance(&mut self) {
        self.frame += 1;
    }
}

/// Per-slot fences and semaphores for pipelined frames.
///
/// Fences are created signaled so the first wait on each slot returns
/// immediately.
pub struct FrameSyncSet<'d> {
    ctx: &'d DeviceContext,
    in_flight: Vec<Fence<'d>>,
    image_available: Vec<Semaphore<'d>>,
    render_finished: Vec<Semaphore<'d>>,
}

impl<'d> FrameSyncSet<'d> {
    /// Create sync objects for `frames_in_flight` slots.
    pub fn new(ctx: &'d DeviceContext, frames_in_flight: usize) -> Result<Self, GraphicsError> {
        if frames_in_flight == 0 {
            return Err(GraphicsError::InvalidParameter(
                "frames_in_flight must be at least 1".to_string(),
            ));
        }

        let mut in_flight = Vec::with_capacity(frames_in_flight);
        let mut image_available = Vec::with_capacity(frames_in_flight);
        let mut render_finished = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            in_flight.push(Fence::new(ctx, true)?);
            image_available.push(Semaphore::new(ctx)?);
            render_finished.push(Semaphore::new(ctx)?);
        }

        log::debug!("Created sync objects for {} frames in flight", frames_in_flight);
        Ok(Self {
            ctx,
            in_flight,
            image_available,
            render_finished,
        })
    }

    pub fn frames_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn check_slot(&self, slot: usize) -> Result<(), GraphicsError> {
        if slot < self.in_flight.len() {
            Ok(())
        } else {
            Err(GraphicsError::InvalidParameter(format!(
                "frame slot {slot} out of range for {} frames in flight",
                self.in_flight.len()
            )))
        }
    }

    pub fn fence(&self, slot: usize) -> Result<&Fence<'d>, GraphicsError> {
        self.check_slot(slot)?;
        Ok(&self.in_flight[slot])
    }

    pub fn image_available(&self, slot: usize) -> Result<&Semaphore<'d>, GraphicsError> {
        self.check_slot(slot)?;
        Ok(&self.image_available[slot])
    }

    pub fn render_finished(&self, slot: usize) -> Result<&Semaphore<'d>, GraphicsError> {
        self.check_slot(slot)?;
        Ok(&self.render_finished[slot])
    }

    /// Block until the slot's previous submission has completed.
    pub fn wait_for_fence(&self, slot: usize) -> Result<(), GraphicsError> {
        self.check_slot(slot)?;
        match self.in_flight[slot].wait(None)? {
            FenceWait::Signaled => Ok(()),
            FenceWait::TimedOut => Err(GraphicsError::Internal(format!(
                "unbounded wait on frame slot {slot} reported a timeout"
            ))),
        }
    }

    /// Clear the slot's fence so the next submission can signal it.
    pub fn reset_fence(&self, slot: usize) -> Result<(), GraphicsError> {
        self.check_slot(slot)?;
        self.in_flight[slot].reset()
    }

    /// Acquire the next swapchain image, signaling the slot's image-available
    /// semaphore.
    ///
    /// A stale surface is reported in the result, not as an error.
    pub fn acquire_next_image(
        &self,
        slot: usize,
        swapchain: &dyn Swapchain,
    ) -> Result<AcquireResult, GraphicsError> {
        self.check_slot(slot)?;
        self.ctx
            .backend()
            .acquire_next_image(swapchain.handle(), self.image_available[slot].handle())
    }

    /// Submit the slot's recorded commands.
    ///
    /// Waits on image-available at color attachment output and signals the
    /// slot's fence and render-finished semaphore.
    pub fn submit_frame(&self, slot: usize, commands: &CommandList<'_>) -> Result<(), GraphicsError> {
        self.check_slot(slot)?;
        if commands.state() != CommandListState::Executable {
            return Err(GraphicsError::InvalidState {
                operation: "submit_frame",
                state: commands.state(),
            });
        }

        self.ctx.backend().queue_submit(&QueueSubmit {
            command_buffers: &[commands.handle()],
            wait_semaphores: &[self.image_available[slot].handle()],
            wait_stages: &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            signal_semaphores: &[self.render_finished[slot].handle()],
            fence: self.in_flight[slot].handle(),
        })
    }

    /// Present `image_index` once the slot's rendering has finished.
    pub fn present_frame(
        &self,
        slot: usize,
        swapchain: &dyn Swapchain,
        image_index: u32,
    ) -> Result<SurfaceStatus, GraphicsError> {
        self.check_slot(slot)?;
        self.ctx.backend().queue_present(
            swapchain.handle(),
            image_index,
            self.render_finished[slot].handle(),
        )
    }
}

impl std::fmt::Debug for FrameSyncSet<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSyncSet")
            .field("frames_in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}
