//! Command pools and command lists.
//!
//! A [`CommandPool`] owns one native pool. A [`CommandList`] wraps one
//! command buffer allocated from it and tracks the recording state
//! explicitly, so misuse such as submitting a list that is still recording
//! is rejected before it reaches the driver.
//!
//! ```text
//!            begin_record            begin_render_pass
//!  Initial ───────────────► Recording ─────────────────► RenderPassActive
//!     ▲                      │   ▲   ◄─────────────────
//!     │         end_record   │   │    end_render_pass
//!     │                      ▼   │ begin_record
//!     └──────────────────  Executable ──► submit
//! ```
//!
//! Native pools are externally synchronized, so `CommandPool` is `!Sync`
//! and lists borrow their pool: each thread lends its own pool from the
//! [`DeviceContext`].

use std::cell::Cell;
use std::fmt;

use ash::vk;

use crate::backend::{ImageBarrier, QueueSubmit, RenderPassBegin};
use crate::device::DeviceContext;
use crate::error::GraphicsError;
use crate::resources::{format_texel_size, BufferHandle, ImageHandle};
use crate::sync::Fence;
use crate::target::{Pipeline, RenderTarget};

/// Recording state of a [`CommandList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandListState {
    /// Allocated, nothing recorded yet.
    Initial,
    /// Between `begin_record` and `end_record`, outside a render pass.
    Recording,
    /// Inside a render pass.
    RenderPassActive,
    /// Recording finished; ready to submit or re-record.
    Executable,
}

impl fmt::Display for CommandListState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initial => "initial",
            Self::Recording => "recording",
            Self::RenderPassActive => "inside a render pass",
            Self::Executable => "executable",
        };
        f.write_str(name)
    }
}

/// Layouts, access masks and stages for one image transition.
///
/// The pairing is always explicit; nothing is inferred from the layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrierInfo {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access_mask: vk::AccessFlags,
    pub dst_access_mask: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

impl ImageBarrierInfo {
    /// Prepare a freshly created image to receive a transfer.
    pub const UNDEFINED_TO_TRANSFER_DST: Self = Self {
        old_layout: vk::ImageLayout::UNDEFINED,
        new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::TRANSFER_WRITE,
        src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
        dst_stage: vk::PipelineStageFlags::TRANSFER,
    };

    /// Make transferred texels visible to fragment shader reads.
    pub const TRANSFER_DST_TO_SHADER_READ: Self = Self {
        old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
        dst_access_mask: vk::AccessFlags::SHADER_READ,
        src_stage: vk::PipelineStageFlags::TRANSFER,
        dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
    };

    /// Make transferred texels readable by a following transfer.
    pub const TRANSFER_DST_TO_TRANSFER_SRC: Self = Self {
        old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
        dst_access_mask: vk::AccessFlags::TRANSFER_READ,
        src_stage: vk::PipelineStageFlags::TRANSFER,
        dst_stage: vk::PipelineStageFlags::TRANSFER,
    };
}

/// Owner of one native command pool.
///
/// A pool lent by [`DeviceContext::lend_command_pool`] is reset and handed
/// back to the context on drop; a pool from
/// [`DeviceContext::create_command_pool`] is destroyed.
pub struct CommandPool<'d> {
    ctx: &'d DeviceContext,
    pool: vk::CommandPool,
    lent: bool,
    /// Lists currently allocated from this pool. Also makes the type `!Sync`.
    live_lists: Cell<usize>,
}

impl<'d> CommandPool<'d> {
    pub(crate) fn lent(ctx: &'d DeviceContext, pool: vk::CommandPool) -> Self {
        Self {
            ctx,
            pool,
            lent: true,
            live_lists: Cell::new(0),
        }
    }

    pub(crate) fn dedicated(ctx: &'d DeviceContext, pool: vk::CommandPool) -> Self {
        Self {
            ctx,
            pool,
            lent: false,
            live_lists: Cell::new(0),
        }
    }

    pub fn context(&self) -> &'d DeviceContext {
        self.ctx
    }

    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Whether the pool goes back to the context's spare queue on drop.
    pub fn is_lent(&self) -> bool {
        self.lent
    }

    pub fn live_lists(&self) -> usize {
        self.live_lists.get()
    }

    /// Allocate a command list from this pool.
    ///
    /// Allocation failures such as `ERROR_OUT_OF_POOL_MEMORY` are returned
    /// unchanged; they are never retried.
    pub fn create_command_list(
        &self,
        level: vk::CommandBufferLevel,
    ) -> Result<CommandList<'_>, GraphicsError> {
        let buffer = self
            .ctx
            .backend()
            .allocate_command_buffer(self.pool, level)?;
        self.live_lists.set(self.live_lists.get() + 1);
        Ok(CommandList {
            pool: self,
            buffer,
            level,
            state: CommandListState::Initial,
        })
    }

    /// Reset every list allocated from the pool back to [`CommandListState::Initial`].
    ///
    /// Requires `&mut self`, so no list can be alive while it runs.
    pub fn reset(&mut self) -> Result<(), GraphicsError> {
        self.ctx.backend().reset_command_pool(self.pool)
    }
}

impl fmt::Debug for CommandPool<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandPool")
            .field("pool", &self.pool)
            .field("lent", &self.lent)
            .field("live_lists", &self.live_lists.get())
            .finish()
    }
}

impl Drop for CommandPool<'_> {
    fn drop(&mut self) {
        if !self.lent {
            // SAFETY: lists borrow the pool, so none are alive; the caller
            // fenced any submitted work before dropping the pool.
            unsafe { self.ctx.backend().destroy_command_pool(self.pool) };
            log::debug!("Destroyed dedicated command pool {:?}", self.pool);
            return;
        }

        match self.ctx.backend().reset_command_pool(self.pool) {
            Ok(()) => self.ctx.release_pool(self.pool),
            Err(e) => {
                log::error!(
                    "Failed to reset command pool {:?}, discarding it: {}",
                    self.pool,
                    e
                );
                self.ctx.discard_pool(self.pool);
            }
        }
    }
}

static_assertions::assert_not_impl_any!(CommandPool<'static>: Sync);

/// One command buffer with explicit recording state.
///
/// Freed back to its pool on drop. Dropping a list whose submission is
/// still executing is a caller error; wait on the submission's fence first.
pub struct CommandList<'p> {
    pool: &'p CommandPool<'p>,
    buffer: vk::CommandBuffer,
    level: vk::CommandBufferLevel,
    state: CommandListState,
}

impl<'p> CommandList<'p> {
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    pub fn level(&self) -> vk::CommandBufferLevel {
        self.level
    }

    pub fn state(&self) -> CommandListState {
        self.state
    }

    pub fn context(&self) -> &'p DeviceContext {
        self.pool.ctx
    }

    fn expect_state(
        &self,
        operation: &'static str,
        allowed: &[CommandListState],
    ) -> Result<(), GraphicsError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(GraphicsError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// Start recording. Re-recording an executable list discards its contents.
    pub fn begin_record(
        &mut self,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<(), GraphicsError> {
        self.expect_state(
            "begin_record",
            &[CommandListState::Initial, CommandListState::Executable],
        )?;
        self.context()
            .backend()
            .begin_command_buffer(self.buffer, flags)?;
        self.state = CommandListState::Recording;
        Ok(())
    }

    pub fn end_record(&mut self) -> Result<(), GraphicsError> {
        self.expect_state("end_record", &[CommandListState::Recording])?;
        self.context().backend().end_command_buffer(self.buffer)?;
        self.state = CommandListState::Executable;
        Ok(())
    }

    /// Begin `target`'s render pass on the framebuffer for `image_index` and
    /// bind `pipeline`.
    pub fn begin_render_pass(
        &mut self,
        target: &dyn RenderTarget,
        pipeline: &dyn Pipeline,
        image_index: u32,
        clear_values: &[vk::ClearValue],
    ) -> Result<(), GraphicsError> {
        self.expect_state("begin_render_pass", &[CommandListState::Recording])?;
        let framebuffer = target.framebuffer(image_index).ok_or_else(|| {
            GraphicsError::InvalidParameter(format!(
                "render target has no framebuffer for image index {image_index}"
            ))
        })?;

        let backend = self.context().backend();
        backend.cmd_begin_render_pass(
            self.buffer,
            &RenderPassBegin {
                render_pass: target.render_pass(),
                framebuffer,
                render_area: target.render_area(),
                clear_values,
            },
        );
        backend.cmd_bind_pipeline(self.buffer, pipeline.bind_point(), pipeline.handle());
        self.state = CommandListState::RenderPassActive;
        Ok(())
    }

    pub fn end_render_pass(&mut self) -> Result<(), GraphicsError> {
        self.expect_state("end_render_pass", &[CommandListState::RenderPassActive])?;
        self.context().backend().cmd_end_render_pass(self.buffer);
        self.state = CommandListState::Recording;
        Ok(())
    }

    /// Run `target`'s render pass on `image_index` with no draws, so its load
    /// and store ops clear the framebuffer and leave it in the final layout.
    pub fn clear_render_target(
        &mut self,
        target: &dyn RenderTarget,
        image_index: u32,
        clear_values: &[vk::ClearValue],
    ) -> Result<(), GraphicsError> {
        self.expect_state("clear_render_target", &[CommandListState::Recording])?;
        let framebuffer = target.framebuffer(image_index).ok_or_else(|| {
            GraphicsError::InvalidParameter(format!(
                "render target has no framebuffer for image index {image_index}"
            ))
        })?;
        let backend = self.context().backend();
        backend.cmd_begin_render_pass(
            self.buffer,
            &RenderPassBegin {
                render_pass: target.render_pass(),
                framebuffer,
                render_area: target.render_area(),
                clear_values,
            },
        );
        backend.cmd_end_render_pass(self.buffer);
        Ok(())
    }

    /// Close whatever is open (render pass, then recording) so the list ends
    /// up [`Executable`](CommandListState::Executable) and can be re-recorded.
    /// A list that was never begun stays [`Initial`](CommandListState::Initial).
    ///
    /// The closed contents are meant to be discarded, not submitted.
    pub fn close(&mut self) -> Result<(), GraphicsError> {
        if self.state == CommandListState::RenderPassActive {
            self.end_render_pass()?;
        }
        if self.state == CommandListState::Recording {
            self.end_record()?;
        }
        Ok(())
    }

    pub fn set_viewport_and_scissor(&mut self, area: vk::Rect2D) -> Result<(), GraphicsError> {
        self.expect_state(
            "set_viewport_and_scissor",
            &[CommandListState::RenderPassActive],
        )?;
        self.context()
            .backend()
            .cmd_set_viewport_and_scissor(self.buffer, area);
        Ok(())
    }

    pub fn bind_vertex_buffer(
        &mut self,
        binding: u32,
        buffer: &BufferHandle<'_>,
        offset: u64,
    ) -> Result<(), GraphicsError> {
        self.expect_state("bind_vertex_buffer", &[CommandListState::RenderPassActive])?;
        require_created(buffer, "vertex buffer")?;
        self.context()
            .backend()
            .cmd_bind_vertex_buffer(self.buffer, binding, buffer.buffer(), offset);
        Ok(())
    }

    pub fn bind_index_buffer(
        &mut self,
        buffer: &BufferHandle<'_>,
        offset: u64,
        index_type: vk::IndexType,
    ) -> Result<(), GraphicsError> {
        self.expect_state("bind_index_buffer", &[CommandListState::RenderPassActive])?;
        require_created(buffer, "index buffer")?;
        self.context()
            .backend()
            .cmd_bind_index_buffer(self.buffer, buffer.buffer(), offset, index_type);
        Ok(())
    }

    pub fn push_constants(
        &mut self,
        pipeline: &dyn Pipeline,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) -> Result<(), GraphicsError> {
        self.expect_state("push_constants", &[CommandListState::RenderPassActive])?;
        if data.len() % 4 != 0 || offset % 4 != 0 {
            return Err(GraphicsError::InvalidParameter(format!(
                "push constant range {offset}+{} is not 4-byte aligned",
                data.len()
            )));
        }
        self.context().backend().cmd_push_constants(
            self.buffer,
            pipeline.layout(),
            stages,
            offset,
            data,
        );
        Ok(())
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<(), GraphicsError> {
        self.expect_state("draw", &[CommandListState::RenderPassActive])?;
        self.context().backend().cmd_draw(
            self.buffer,
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        );
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<(), GraphicsError> {
        self.expect_state("draw_indexed", &[CommandListState::RenderPassActive])?;
        self.context().backend().cmd_draw_indexed(
            self.buffer,
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        );
        Ok(())
    }

    /// Copy `size` bytes between two buffers.
    pub fn copy_buffer_to_buffer(
        &mut self,
        src: &BufferHandle<'_>,
        src_offset: u64,
        dst: &BufferHandle<'_>,
        dst_offset: u64,
        size: u64,
    ) -> Result<(), GraphicsError> {
        self.expect_state("copy_buffer_to_buffer", &[CommandListState::Recording])?;
        require_created(src, "copy source")?;
        require_created(dst, "copy destination")?;
        if size == 0 {
            return Err(GraphicsError::InvalidParameter(
                "buffer copy of zero bytes".to_string(),
            ));
        }
        check_range("copy source", src_offset, size, src.size())?;
        check_range("copy destination", dst_offset, size, dst.size())?;

        self.context().backend().cmd_copy_buffer(
            self.buffer,
            src.buffer(),
            dst.buffer(),
            vk::BufferCopy {
                src_offset,
                dst_offset,
                size,
            },
        );
        Ok(())
    }

    /// Copy tightly packed texels from `src` into mip 0, all layers, of `dst`,
    /// starting at `image_offset` and running to the far corner of the image.
    ///
    /// `dst` must already be in `TRANSFER_DST_OPTIMAL`.
    pub fn copy_buffer_to_image(
        &mut self,
        src: &BufferHandle<'_>,
        buffer_offset: u64,
        dst: &ImageHandle<'_>,
        image_offset: vk::Offset3D,
        aspect_mask: vk::ImageAspectFlags,
    ) -> Result<(), GraphicsError> {
        self.expect_state("copy_buffer_to_image", &[CommandListState::Recording])?;
        require_created(src, "copy source")?;
        if !dst.is_created() {
            return Err(GraphicsError::InvalidParameter(
                "copy destination image was never created".to_string(),
            ));
        }
        let extent = remaining_extent(dst.extent(), image_offset)?;
        if let Some(texel) = format_texel_size(dst.format()) {
            let bytes = u64::from(extent.width)
                * u64::from(extent.height)
                * u64::from(extent.depth)
                * u64::from(dst.array_layers())
                * u64::from(texel);
            check_range("copy source", buffer_offset, bytes, src.size())?;
        }

        self.context().backend().cmd_copy_buffer_to_image(
            self.buffer,
            src.buffer(),
            dst.image(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::BufferImageCopy {
                buffer_offset,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: dst.array_layers(),
                },
                image_offset,
                image_extent: extent,
            },
        );
        Ok(())
    }

    /// Copy mip 0 of `src`, from `src_offset` to its far corner, into `dst`
    /// at `dst_offset`.
    ///
    /// `src` must be in `TRANSFER_SRC_OPTIMAL` and `dst` in `TRANSFER_DST_OPTIMAL`.
    pub fn copy_image_to_image(
        &mut self,
        src: &ImageHandle<'_>,
        src_offset: vk::Offset3D,
        dst: &ImageHandle<'_>,
        dst_offset: vk::Offset3D,
        aspect_mask: vk::ImageAspectFlags,
    ) -> Result<(), GraphicsError> {
        self.expect_state("copy_image_to_image", &[CommandListState::Recording])?;
        if !src.is_created() || !dst.is_created() {
            return Err(GraphicsError::InvalidParameter(
                "image copy between images that were never created".to_string(),
            ));
        }
        let extent = remaining_extent(src.extent(), src_offset)?;
        let room = remaining_extent(dst.extent(), dst_offset)?;
        if extent.width > room.width || extent.height > room.height || extent.depth > room.depth
        {
            return Err(GraphicsError::InvalidParameter(format!(
                "copy of {}x{}x{} texels does not fit at {:?} in the destination",
                extent.width, extent.height, extent.depth, dst_offset
            )));
        }
        let layer_count = src.array_layers().min(dst.array_layers());
        let layers = vk::ImageSubresourceLayers {
            aspect_mask,
            mip_level: 0,
            base_array_layer: 0,
            layer_count,
        };

        self.context().backend().cmd_copy_image(
            self.buffer,
            src.image(),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst.image(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageCopy {
                src_subresource: layers,
                src_offset,
                dst_subresource: layers,
                dst_offset,
                extent,
            },
        );
        Ok(())
    }

    /// Record a layout transition covering every mip and layer of `image`.
    pub fn image_barrier(
        &mut self,
        image: &ImageHandle<'_>,
        info: &ImageBarrierInfo,
        aspect_mask: vk::ImageAspectFlags,
    ) -> Result<(), GraphicsError> {
        self.expect_state("image_barrier", &[CommandListState::Recording])?;
        if !image.is_created() {
            return Err(GraphicsError::InvalidParameter(
                "barrier on an image that was never created".to_string(),
            ));
        }
        self.context().backend().cmd_image_barrier(
            self.buffer,
            &ImageBarrier {
                image: image.image(),
                old_layout: info.old_layout,
                new_layout: info.new_layout,
                src_access_mask: info.src_access_mask,
                dst_access_mask: info.dst_access_mask,
                src_stage: info.src_stage,
                dst_stage: info.dst_stage,
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask,
                    base_mip_level: 0,
                    level_count: image.mip_levels(),
                    base_array_layer: 0,
                    layer_count: image.array_layers(),
                },
            },
        );
        Ok(())
    }

    /// Submit to the graphics queue, signaling `fence` on completion.
    ///
    /// Does not wait. The list stays executable and may be submitted again
    /// once the previous submission has completed.
    pub fn submit(&self, fence: Option<&Fence<'_>>) -> Result<(), GraphicsError> {
        self.expect_state("submit", &[CommandListState::Executable])?;
        self.context().backend().queue_submit(&QueueSubmit {
            command_buffers: &[self.buffer],
            fence: fence.map_or(vk::Fence::null(), Fence::handle),
            ..Default::default()
        })
    }
}

impl fmt::Debug for CommandList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandList")
            .field("buffer", &self.buffer)
            .field("level", &self.level)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Drop for CommandList<'_> {
    fn drop(&mut self) {
        // SAFETY: the owner fenced any submission of this buffer before
        // dropping it.
        unsafe {
            self.context()
                .backend()
                .free_command_buffer(self.pool.pool, self.buffer)
        };
        self.pool.live_lists.set(self.pool.live_lists.get() - 1);
    }
}

fn require_created(buffer: &BufferHandle<'_>, what: &str) -> Result<(), GraphicsError> {
    if buffer.is_created() {
        Ok(())
    } else {
        Err(GraphicsError::InvalidParameter(format!(
            "{what} was never created"
        )))
    }
}

fn check_range(what: &str, offset: u64, len: u64, size: u64) -> Result<(), GraphicsError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(GraphicsError::InvalidParameter(format!(
            "{what} range {offset}..{offset}+{len} exceeds {size} bytes"
        ))),
    }
}

/// Extent from `offset` to the far corner of an image of size `extent`.
fn remaining_extent(
    extent: vk::Extent3D,
    offset: vk::Offset3D,
) -> Result<vk::Extent3D, GraphicsError> {
    let axis = |o: i32, len: u32| -> Option<u32> {
        u32::try_from(o)
            .ok()
            .and_then(|o| len.checked_sub(o))
            .filter(|&left| left > 0)
    };
    match (
        axis(offset.x, extent.width),
        axis(offset.y, extent.height),
        axis(offset.z, extent.depth),
    ) {
        (Some(width), Some(height), Some(depth)) => Ok(vk::Extent3D {
            width,
            height,
            depth,
        }),
        _ => Err(GraphicsError::InvalidParameter(format!(
            "offset {:?} lies outside an image of {}x{}x{}",
            offset, extent.width, extent.height, extent.depth
        ))),
    }
}
