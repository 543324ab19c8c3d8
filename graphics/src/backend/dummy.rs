//! Dummy GPU backend for testing and development.
//!
//! This backend doesn't talk to a driver. It simulates a single graphics
//! queue in host memory:
//!
//! - handles are fabricated from a counter
//! - buffers and images are zero-initialised host allocations, so uploads
//!   can be read back byte for byte
//! - recorded copies and layout transitions execute when the command buffer
//!   is submitted, and submission signals fences and semaphores immediately
//! - misuse the validation layers would catch (waiting on an unsignaled
//!   semaphore, copying into an image in the wrong layout, recording into a
//!   buffer that is not recording) is collected in [`DummyBackend::validation_errors`]
//!
//! Tests can script surface statuses, inject one-shot failures and hold
//! fences unsignaled to simulate a hung device.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;

use crate::error::GraphicsError;
use crate::resources::format_texel_size;
use crate::target::{Pipeline, RenderTarget, Swapchain, Window};

use super::{
    AcquireResult, Allocation, BufferDesc, FenceWait, GpuBackend, ImageBarrier, ImageDesc,
    ImageViewDesc, MappedPtr, MemoryLocation, QueueFamilyIndices, QueueSubmit, RenderPassBegin,
    SamplerDesc, SurfaceStatus,
};

/// Backend entry points that accept an injected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateCommandPool,
    AllocateCommandBuffer,
    BeginCommandBuffer,
    QueueSubmit,
    WaitForFence,
    AcquireNextImage,
    QueuePresent,
    CreateBuffer,
    CreateImage,
}

/// Entry in the dummy backend's call log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    CreateCommandPool(vk::CommandPool),
    ResetCommandPool(vk::CommandPool),
    DestroyCommandPool(vk::CommandPool),
    AllocateCommandBuffer {
        pool: vk::CommandPool,
        buffer: vk::CommandBuffer,
    },
    FreeCommandBuffer(vk::CommandBuffer),
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    Submit {
        command_buffers: Vec<vk::CommandBuffer>,
        wait_semaphores: Vec<vk::Semaphore>,
        signal_semaphores: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    CreateFence(vk::Fence),
    DestroyFence(vk::Fence),
    WaitForFence(vk::Fence),
    ResetFence(vk::Fence),
    AcquireNextImage {
        swapchain: vk::SwapchainKHR,
        image_index: Option<u32>,
    },
    Present {
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        status: SurfaceStatus,
    },
    RecreateSwapchain {
        old: vk::SwapchainKHR,
        new: vk::SwapchainKHR,
    },
    CreateBuffer {
        buffer: vk::Buffer,
        size: u64,
    },
    DestroyBuffer(vk::Buffer),
    CreateImage(vk::Image),
    DestroyImage(vk::Image),
    WaitIdle,
}

/// A command recorded into a dummy command buffer.
#[derive(Debug, Clone)]
pub enum RecordedCommand {
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
    },
    EndRenderPass,
    BindPipeline(vk::Pipeline),
    SetViewportAndScissor(vk::Rect2D),
    BindVertexBuffer {
        binding: u32,
        buffer: vk::Buffer,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        index_type: vk::IndexType,
    },
    PushConstants {
        stages: vk::ShaderStageFlags,
        data: Vec<u8>,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: vk::BufferImageCopy,
    },
    CopyImage {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: vk::ImageCopy,
    },
    ImageBarrier(ImageBarrier),
}

/// Zero-initialised host allocation standing in for device memory.
///
/// Accessed only through raw pointers so a persistent mapping handed out to
/// a resource handle never aliases a Rust reference.
struct HostMemory {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the allocation is uniquely owned; concurrent access is serialized
// by the backend mutex or, for mapped writes, by the resource owner.
unsafe impl Send for HostMemory {}

impl HostMemory {
    fn zeroed(len: usize) -> Self {
        let boxed = vec![0u8; len].into_boxed_slice();
        let ptr = NonNull::from(Box::leak(boxed)).cast::<u8>();
        Self { ptr, len }
    }

    fn contains(&self, offset: u64, len: u64) -> bool {
        offset
            .checked_add(len)
            .is_some_and(|end| end <= self.len as u64)
    }

    fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        debug_assert!(offset + len <= self.len);
        let mut out = vec![0u8; len];
        // SAFETY: bounds checked by the callers; the source is live.
        unsafe { ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), len) };
        out
    }

    fn write(&self, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= self.len);
        // SAFETY: bounds checked by the callers; `data` is a separate allocation.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len())
        };
    }

    fn to_vec(&self) -> Vec<u8> {
        self.read(0, self.len)
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` came from `Box::leak` in `zeroed`.
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )))
        };
    }
}

struct BufferState {
    memory: HostMemory,
}

struct ImageState {
    extent: vk::Extent3D,
    array_layers: u32,
    texel_size: u64,
    layout: vk::ImageLayout,
    memory: HostMemory,
}

impl ImageState {
    fn texel_offset(&self, layer: u32, x: u32, y: u32, z: u32) -> u64 {
        let e = self.extent;
        let index = ((u64::from(layer) * u64::from(e.depth) + u64::from(z)) * u64::from(e.height)
            + u64::from(y))
            * u64::from(e.width)
            + u64::from(x);
        index * self.texel_size
    }

    fn contains(&self, offset: vk::Offset3D, extent: vk::Extent3D, layers: (u32, u32)) -> bool {
        let fits = |o: i32, len: u32, max: u32| {
            o >= 0 && (o as u64).saturating_add(u64::from(len)) <= u64::from(max)
        };
        fits(offset.x, extent.width, self.extent.width)
            && fits(offset.y, extent.height, self.extent.height)
            && fits(offset.z, extent.depth, self.extent.depth)
            && layers.0.saturating_add(layers.1) <= self.array_layers
    }
}

#[derive(Default)]
struct CommandBufferState {
    pool: vk::CommandPool,
    recording: bool,
    executable: bool,
    commands: Vec<RecordedCommand>,
}

struct SwapchainState {
    image_count: u32,
    next_image: u32,
}

#[derive(Default)]
struct DummyState {
    calls: Vec<BackendCall>,
    validation_errors: Vec<String>,
    submitted: Vec<RecordedCommand>,
    command_pools: HashSet<vk::CommandPool>,
    command_buffers: HashMap<vk::CommandBuffer, CommandBufferState>,
    fences: HashMap<vk::Fence, bool>,
    held_fences: Vec<vk::Fence>,
    hold_fences: bool,
    semaphores: HashMap<vk::Semaphore, bool>,
    buffers: HashMap<vk::Buffer, BufferState>,
    images: HashMap<vk::Image, ImageState>,
    views: HashMap<vk::ImageView, vk::Image>,
    samplers: HashSet<vk::Sampler>,
    swapchains: HashMap<vk::SwapchainKHR, SwapchainState>,
    acquire_script: VecDeque<SurfaceStatus>,
    present_script: VecDeque<SurfaceStatus>,
    failures: HashMap<FailPoint, vk::Result>,
}

impl DummyState {
    fn take_failure(
        &mut self,
        point: FailPoint,
        operation: &'static str,
    ) -> Result<(), GraphicsError> {
        match self.failures.remove(&point) {
            Some(result) => {
                log::trace!("DummyBackend: injected {:?} into {}", result, operation);
                Err(GraphicsError::from_vk(operation, result))
            }
            None => Ok(()),
        }
    }

    fn violation(&mut self, message: String) {
        log::error!("DummyBackend validation: {}", message);
        self.validation_errors.push(message);
    }

    fn record(&mut self, buffer: vk::CommandBuffer, command: RecordedCommand) {
        match self.command_buffers.get_mut(&buffer) {
            Some(state) if state.recording => state.commands.push(command),
            Some(_) => self.violation(format!(
                "{command:?} recorded into {buffer:?} which is not recording"
            )),
            None => self.violation(format!("{command:?} recorded into unknown {buffer:?}")),
        }
    }

    fn submit(&mut self, submit: &QueueSubmit<'_>) {
        if submit.wait_semaphores.len() != submit.wait_stages.len() {
            self.violation(format!(
                "{} wait semaphores but {} wait stages",
                submit.wait_semaphores.len(),
                submit.wait_stages.len()
            ));
        }

        for &semaphore in submit.wait_semaphores {
            match self.semaphores.get_mut(&semaphore) {
                Some(signaled) if *signaled => *signaled = false,
                Some(_) => self.violation(format!(
                    "submission waits on {semaphore:?} which has no pending signal"
                )),
                None => self.violation(format!("submission waits on unknown {semaphore:?}")),
            }
        }

        for &buffer in submit.command_buffers {
            let commands = match self.command_buffers.get(&buffer) {
                Some(state) if state.executable => state.commands.clone(),
                Some(_) => {
                    self.violation(format!("{buffer:?} submitted while not executable"));
                    continue;
                }
                None => {
                    self.violation(format!("unknown {buffer:?} submitted"));
                    continue;
                }
            };
            for command in &commands {
                if let Err(message) = self.execute(command) {
                    self.violation(message);
                }
            }
            self.submitted.extend(commands);
        }

        for &semaphore in submit.signal_semaphores {
            match self.semaphores.get_mut(&semaphore) {
                Some(signaled) if !*signaled => *signaled = true,
                Some(_) => self.violation(format!(
                    "submission signals {semaphore:?} which is already signaled"
                )),
                None => self.violation(format!("submission signals unknown {semaphore:?}")),
            }
        }

        if submit.fence != vk::Fence::null() {
            let fence = submit.fence;
            let hold = self.hold_fences;
            match self.fences.get_mut(&fence) {
                Some(signaled) if *signaled => {
                    self.violation(format!("{fence:?} submitted while still signaled"))
                }
                Some(signaled) => {
                    if hold {
                        self.held_fences.push(fence);
                    } else {
                        *signaled = true;
                    }
                }
                None => self.violation(format!("submission signals unknown {fence:?}")),
            }
        }
    }

    fn execute(&mut self, command: &RecordedCommand) -> Result<(), String> {
        match command {
            RecordedCommand::CopyBuffer { src, dst, region } => {
                let source = self
                    .buffers
                    .get(src)
                    .ok_or_else(|| format!("copy from unknown {src:?}"))?;
                if !source.memory.contains(region.src_offset, region.size) {
                    return Err(format!("copy reads past the end of {src:?}"));
                }
                let bytes = source
                    .memory
                    .read(region.src_offset as usize, region.size as usize);
                let target = self
                    .buffers
                    .get(dst)
                    .ok_or_else(|| format!("copy into unknown {dst:?}"))?;
                if !target.memory.contains(region.dst_offset, region.size) {
                    return Err(format!("copy writes past the end of {dst:?}"));
                }
                target.memory.write(region.dst_offset as usize, &bytes);
                Ok(())
            }
            RecordedCommand::CopyBufferToImage {
                src,
                dst,
                dst_layout,
                region,
            } => self.copy_buffer_to_image(*src, *dst, *dst_layout, region),
            RecordedCommand::CopyImage {
                src,
                src_layout,
                dst,
                dst_layout,
                region,
            } => self.copy_image(*src, *src_layout, *dst, *dst_layout, region),
            RecordedCommand::ImageBarrier(barrier) => {
                let image = self
                    .images
                    .get_mut(&barrier.image)
                    .ok_or_else(|| format!("barrier on unknown {:?}", barrier.image))?;
                if barrier.old_layout != vk::ImageLayout::UNDEFINED
                    && barrier.old_layout != image.layout
                {
                    return Err(format!(
                        "barrier expects {:?} in {:?} but it is in {:?}",
                        barrier.image, barrier.old_layout, image.layout
                    ));
                }
                image.layout = barrier.new_layout;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: &vk::BufferImageCopy,
    ) -> Result<(), String> {
        let source = self
            .buffers
            .get(&src)
            .ok_or_else(|| format!("copy from unknown {src:?}"))?;
        let image = self
            .images
            .get(&dst)
            .ok_or_else(|| format!("copy into unknown {dst:?}"))?;
        check_transfer_layout(dst, image.layout, dst_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;

        let sub = region.image_subresource;
        if sub.mip_level != 0 {
            return Err("only mip level 0 is simulated".to_string());
        }
        let extent = region.image_extent;
        if !image.contains(
            region.image_offset,
            extent,
            (sub.base_array_layer, sub.layer_count),
        ) {
            return Err(format!("copy region lies outside {dst:?}"));
        }

        let row_length = if region.buffer_row_length == 0 {
            extent.width
        } else {
            region.buffer_row_length
        };
        let image_height = if region.buffer_image_height == 0 {
            extent.height
        } else {
            region.buffer_image_height
        };
        let row_bytes = u64::from(extent.width) * image.texel_size;
        let off = region.image_offset;

        for layer in 0..sub.layer_count {
            for z in 0..extent.depth {
                for y in 0..extent.height {
                    let row = (u64::from(layer) * u64::from(extent.depth) + u64::from(z))
                        * u64::from(image_height)
                        + u64::from(y);
                    let src_offset =
                        region.buffer_offset + row * u64::from(row_length) * image.texel_size;
                    if !source.memory.contains(src_offset, row_bytes) {
                        return Err(format!("copy reads past the end of {src:?}"));
                    }
                    let bytes = source.memory.read(src_offset as usize, row_bytes as usize);
                    let dst_offset = image.texel_offset(
                        sub.base_array_layer + layer,
                        off.x as u32,
                        off.y as u32 + y,
                        off.z as u32 + z,
                    );
                    image.memory.write(dst_offset as usize, &bytes);
                }
            }
        }
        Ok(())
    }

    fn copy_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: &vk::ImageCopy,
    ) -> Result<(), String> {
        let source = self
            .images
            .get(&src)
            .ok_or_else(|| format!("copy from unknown {src:?}"))?;
        let target = self
            .images
            .get(&dst)
            .ok_or_else(|| format!("copy into unknown {dst:?}"))?;
        check_transfer_layout(src, source.layout, src_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)?;
        check_transfer_layout(dst, target.layout, dst_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
        if source.texel_size != target.texel_size {
            return Err(format!("{src:?} and {dst:?} have different texel sizes"));
        }
        if region.src_subresource.mip_level != 0 || region.dst_subresource.mip_level != 0 {
            return Err("only mip level 0 is simulated".to_string());
        }
        let extent = region.extent;
        let layers = region.src_subresource.layer_count;
        if !source.contains(
            region.src_offset,
            extent,
            (region.src_subresource.base_array_layer, layers),
        ) || !target.contains(
            region.dst_offset,
            extent,
            (region.dst_subresource.base_array_layer, layers),
        ) {
            return Err(format!("copy region lies outside {src:?} or {dst:?}"));
        }

        let row_bytes = (u64::from(extent.width) * source.texel_size) as usize;
        let (so, d_o) = (region.src_offset, region.dst_offset);
        for layer in 0..layers {
            for z in 0..extent.depth {
                for y in 0..extent.height {
                    let from = source.texel_offset(
                        region.src_subresource.base_array_layer + layer,
                        so.x as u32,
                        so.y as u32 + y,
                        so.z as u32 + z,
                    );
                    let bytes = source.memory.read(from as usize, row_bytes);
                    let to = target.texel_offset(
                        region.dst_subresource.base_array_layer + layer,
                        d_o.x as u32,
                        d_o.y as u32 + y,
                        d_o.z as u32 + z,
                    );
                    target.memory.write(to as usize, &bytes);
                }
            }
        }
        Ok(())
    }
}

fn check_transfer_layout(
    image: vk::Image,
    current: vk::ImageLayout,
    declared: vk::ImageLayout,
    expected: vk::ImageLayout,
) -> Result<(), String> {
    if declared != expected && declared != vk::ImageLayout::GENERAL {
        return Err(format!("{image:?} used for transfer in {declared:?}"));
    }
    if current != declared {
        return Err(format!(
            "{image:?} is in {current:?} but the copy declares {declared:?}"
        ));
    }
    Ok(())
}

/// Dummy GPU backend.
pub struct DummyBackend {
    next_handle: AtomicU64,
    state: Mutex<DummyState>,
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DummyBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DummyBackend")
            .field("buffers", &state.buffers.len())
            .field("images", &state.images.len())
            .field("command_pools", &state.command_pools.len())
            .finish_non_exhaustive()
    }
}

impl DummyBackend {
    /// Create a new dummy backend.
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            state: Mutex::new(DummyState::default()),
        }
    }

    /// Fabricate a fresh non-null handle of any type.
    pub fn fabricate_handle<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    // --- inspection ---

    /// Calls made so far, in order.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Every command executed by a submission, in execution order.
    pub fn submitted_commands(&self) -> Vec<RecordedCommand> {
        self.state.lock().submitted.clone()
    }

    /// Misuse detected so far. Empty for a correct caller.
    pub fn validation_errors(&self) -> Vec<String> {
        self.state.lock().validation_errors.clone()
    }

    /// Buffers and images that have not been destroyed.
    pub fn live_allocations(&self) -> usize {
        let state = self.state.lock();
        state.buffers.len() + state.images.len()
    }

    pub fn live_command_pools(&self) -> usize {
        self.state.lock().command_pools.len()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.state.lock().command_buffers.len()
    }

    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    pub fn is_fence_signaled(&self, fence: vk::Fence) -> Option<bool> {
        self.state.lock().fences.get(&fence).copied()
    }

    /// Snapshot of a buffer's memory.
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state
            .lock()
            .buffers
            .get(&buffer)
            .map(|b| b.memory.to_vec())
    }

    /// Snapshot of an image's mip 0, all layers, tightly packed.
    pub fn image_contents(&self, image: vk::Image) -> Option<Vec<u8>> {
        self.state
            .lock()
            .images
            .get(&image)
            .map(|i| i.memory.to_vec())
    }

    pub fn image_layout(&self, image: vk::Image) -> Option<vk::ImageLayout> {
        self.state.lock().images.get(&image).map(|i| i.layout)
    }

    // --- scripting ---

    /// Status returned by the next acquire that has no other script entry.
    pub fn script_acquire(&self, status: SurfaceStatus) {
        self.state.lock().acquire_script.push_back(status);
    }

    pub fn script_present(&self, status: SurfaceStatus) {
        self.state.lock().present_script.push_back(status);
    }

    /// Make the next call to `point` fail with `result`.
    pub fn fail_next(&self, point: FailPoint, result: vk::Result) {
        self.state.lock().failures.insert(point, result);
    }

    /// While set, submissions leave their fence unsignaled until
    /// [`release_held_fences`](Self::release_held_fences).
    pub fn set_hold_fences(&self, hold: bool) {
        self.state.lock().hold_fences = hold;
    }

    pub fn release_held_fences(&self) {
        let mut state = self.state.lock();
        let held = std::mem::take(&mut state.held_fences);
        for fence in held {
            if let Some(signaled) = state.fences.get_mut(&fence) {
                *signaled = true;
            }
        }
    }

    // --- swapchain simulation ---

    pub fn create_swapchain(&self, image_count: u32) -> vk::SwapchainKHR {
        let swapchain = self.fabricate_handle();
        self.state.lock().swapchains.insert(
            swapchain,
            SwapchainState {
                image_count: image_count.max(1),
                next_image: 0,
            },
        );
        log::trace!("DummyBackend: created swapchain {:?}", swapchain);
        swapchain
    }

    /// Replace `old` with a new swapchain of the same image count.
    pub fn recreate_swapchain(&self, old: vk::SwapchainKHR) -> vk::SwapchainKHR {
        let new = self.fabricate_handle();
        let mut state = self.state.lock();
        let image_count = state
            .swapchains
            .remove(&old)
            .map_or(1, |s| s.image_count);
        state.swapchains.insert(
            new,
            SwapchainState {
                image_count,
                next_image: 0,
            },
        );
        state.calls.push(BackendCall::RecreateSwapchain { old, new });
        log::trace!("DummyBackend: recreated swapchain {:?} -> {:?}", old, new);
        new
    }

    pub fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.state.lock().swapchains.remove(&swapchain);
    }
}

impl GpuBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy"
    }

    fn queue_families(&self) -> QueueFamilyIndices {
        QueueFamilyIndices {
            graphics: 0,
            present: Some(0),
        }
    }

    fn wait_idle(&self) -> Result<(), GraphicsError> {
        self.state.lock().calls.push(BackendCall::WaitIdle);
        Ok(())
    }

    fn create_command_pool(&self) -> Result<vk::CommandPool, GraphicsError> {
        let mut state = self.state.lock();
        state.take_failure(FailPoint::CreateCommandPool, "vkCreateCommandPool")?;
        let pool = self.fabricate_handle();
        state.command_pools.insert(pool);
        state.calls.push(BackendCall::CreateCommandPool(pool));
        log::trace!("DummyBackend: created command pool {:?}", pool);
        Ok(pool)
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<(), GraphicsError> {
        let mut state = self.state.lock();
        if !state.command_pools.contains(&pool) {
            return Err(GraphicsError::InvalidParameter(format!(
                "unknown command pool {pool:?}"
            )));
        }
        for buffer in state.command_buffers.values_mut().filter(|b| b.pool == pool) {
            buffer.recording = false;
            buffer.executable = false;
            buffer.commands.clear();
        }
        state.calls.push(BackendCall::ResetCommandPool(pool));
        Ok(())
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        if !state.command_pools.remove(&pool) {
            state.violation(format!("destroying unknown command pool {pool:?}"));
            return;
        }
        state.command_buffers.retain(|_, b| b.pool != pool);
        state.calls.push(BackendCall::DestroyCommandPool(pool));
        log::trace!("DummyBackend: destroyed command pool {:?}", pool);
    }

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer, GraphicsError> {
        let mut state = self.state.lock();
        state.take_failure(FailPoint::AllocateCommandBuffer, "vkAllocateCommandBuffers")?;
        if !state.command_pools.contains(&pool) {
            return Err(GraphicsError::InvalidParameter(format!(
                "unknown command pool {pool:?}"
            )));
        }
        let buffer = self.fabricate_handle();
        state.command_buffers.insert(
            buffer,
            CommandBufferState {
                pool,
                ..Default::default()
            },
        );
        state
            .calls
            .push(BackendCall::AllocateCommandBuffer { pool, buffer });
        Ok(buffer)
    }

    unsafe fn free_command_buffer(&self, pool: vk::CommandPool, buffer: vk::CommandBuffer) {
        let mut state = self.state.lock();
        match state.command_buffers.remove(&buffer) {
            Some(b) if b.pool == pool => state.calls.push(BackendCall::FreeCommandBuffer(buffer)),
            Some(_) => state.violation(format!("{buffer:?} freed into the wrong pool")),
            None => state.violation(format!("freeing unknown {buffer:?}")),
        }
    }

    fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> Result<(), GraphicsError> {
        let mut state = self.state.lock();
        state.take_failure(FailPoint::BeginCommandBuffer, "vkBeginCommandBuffer")?;
        let Some(cmd) = state.command_buffers.get_mut(&buffer) else {
            return Err(GraphicsError::InvalidParameter(format!(
                "unknown command buffer {buffer:?}"
            )));
        };
        let was_recording = cmd.recording;
        cmd.recording = true;
        cmd.executable = false;
        cmd.commands.clear();
        if was_recording {
            state.violation(format!("{buffer:?} begun while already recording"));
        }
        state.calls.push(BackendCall::BeginCommandBuffer(buffer));
        Ok(())
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> Result<(), GraphicsError> {
        let mut state = self.state.lock();
        let Some(cmd) = state.command_buffers.get_mut(&buffer) else {
            return Err(GraphicsError::InvalidParameter(format!(
                "unknown command buffer {buffer:?}"
            )));
        };
        if !cmd.recording {
            state.violation(format!("{buffer:?} ended while not recording"));
            return Ok(());
        }
        cmd.recording = false;
        cmd.executable = true;
        state.calls.push(BackendCall::EndCommandBuffer(buffer));
        Ok(())
    }

    fn cmd_begin_render_pass(&self, buffer: vk::CommandBuffer, begin: &RenderPassBegin<'_>) {
        self.state.lock().record(
            buffer,
            RecordedCommand::BeginRenderPass {
                render_pass: begin.render_pass,
                framebuffer: begin.framebuffer,
            },
        );
    }

    fn cmd_end_render_pass(&self, buffer: vk::CommandBuffer) {
        self.state
            .lock()
            .record(buffer, RecordedCommand::EndRenderPass);
    }

    fn cmd_bind_pipeline(
        &self,
        buffer: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.state
            .lock()
            .record(buffer, RecordedCommand::BindPipeline(pipeline));
    }

    fn cmd_set_viewport_and_scissor(&self, buffer: vk::CommandBuffer, area: vk::Rect2D) {
        self.state
            .lock()
            .record(buffer, RecordedCommand::SetViewportAndScissor(area));
    }

    fn cmd_bind_vertex_buffer(
        &self,
        buffer: vk::CommandBuffer,
        binding: u32,
        vertex_buffer: vk::Buffer,
        _offset: u64,
    ) {
        self.state.lock().record(
            buffer,
            RecordedCommand::BindVertexBuffer {
                binding,
                buffer: vertex_buffer,
            },
        );
    }

    fn cmd_bind_index_buffer(
        &self,
        buffer: vk::CommandBuffer,
        index_buffer: vk::Buffer,
        _offset: u64,
        index_type: vk::IndexType,
    ) {
        self.state.lock().record(
            buffer,
            RecordedCommand::BindIndexBuffer {
                buffer: index_buffer,
                index_type,
            },
        );
    }

    fn cmd_push_constants(
        &self,
        buffer: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        _offset: u32,
        data: &[u8],
    ) {
        self.state.lock().record(
            buffer,
            RecordedCommand::PushConstants {
                stages,
                data: data.to_vec(),
            },
        );
    }

    fn cmd_draw(
        &self,
        buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.state.lock().record(
            buffer,
            RecordedCommand::Draw {
                vertex_count,
                instance_count,
            },
        );
    }

    fn cmd_draw_indexed(
        &self,
        buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.state.lock().record(
            buffer,
            RecordedCommand::DrawIndexed {
                index_count,
                instance_count,
            },
        );
    }

    fn cmd_copy_buffer(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) {
        self.state
            .lock()
            .record(buffer, RecordedCommand::CopyBuffer { src, dst, region });
    }

    fn cmd_copy_buffer_to_image(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: vk::BufferImageCopy,
    ) {
        self.state.lock().record(
            buffer,
            RecordedCommand::CopyBufferToImage {
                src,
                dst,
                dst_layout,
                region,
            },
        );
    }

    fn cmd_copy_image(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: vk::ImageCopy,
    ) {
        self.state.lock().record(
            buffer,
            RecordedCommand::CopyImage {
                src,
                src_layout,
                dst,
                dst_layout,
                region,
            },
        );
    }

    fn cmd_image_barrier(&self, buffer: vk::CommandBuffer, barrier: &ImageBarrier) {
        self.state
            .lock()
            .record(buffer, RecordedCommand::ImageBarrier(*barrier));
    }

    fn queue_submit(&self, submit: &QueueSubmit<'_>) -> Result<(), GraphicsError> {
        let mut state = self.state.lock();
        state.take_failure(FailPoint::QueueSubmit, "vkQueueSubmit")?;
        state.calls.push(BackendCall::Submit {
            command_buffers: submit.command_buffers.to_vec(),
            wait_semaphores: submit.wait_semaphores.to_vec(),
            signal_semaphores: submit.signal_semaphores.to_vec(),
            fence: submit.fence,
        });
        state.submit(submit);
        log::trace!(
            "DummyBackend: submitted {} command buffer(s)",
            submit.command_buffers.len()
        );
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence, GraphicsError> {
        let fence = self.fabricate_handle();
        let mut state = self.state.lock();
        state.fences.insert(fence, signaled);
        state.calls.push(BackendCall::CreateFence(fence));
        Ok(fence)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        if state.fences.remove(&fence).is_none() {
            state.violation(format!("destroying unknown {fence:?}"));
            return;
        }
        if state.held_fences.contains(&fence) {
            state.violation(format!("{fence:?} destroyed with pending work"));
        }
        state.calls.push(BackendCall::DestroyFence(fence));
    }

    fn wait_for_fence(
        &self,
        fence: vk::Fence,
        timeout: Option<Duration>,
    ) -> Result<FenceWait, GraphicsError> {
        let mut state = self.state.lock();
        state.take_failure(FailPoint::WaitForFence, "vkWaitForFences")?;
        state.calls.push(BackendCall::WaitForFence(fence));
        match (state.fences.get(&fence).copied(), timeout) {
            (Some(true), _) => Ok(FenceWait::Signaled),
            (Some(false), Some(_)) => Ok(FenceWait::TimedOut),
            (Some(false), None) => Err(GraphicsError::Internal(format!(
                "{fence:?} has no pending signal; an unbounded wait would never return"
            ))),
            (None, _) => Err(GraphicsError::InvalidParameter(format!(
                "unknown fence {fence:?}"
            ))),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<(), GraphicsError> {
        let mut state = self.state.lock();
        if state.held_fences.contains(&fence) {
            state.violation(format!("{fence:?} reset with pending work"));
        }
        match state.fences.get_mut(&fence) {
            Some(signaled) => *signaled = false,
            None => {
                return Err(GraphicsError::InvalidParameter(format!(
                    "unknown fence {fence:?}"
                )))
            }
        }
        state.calls.push(BackendCall::ResetFence(fence));
        Ok(())
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore, GraphicsError> {
        let semaphore = self.fabricate_handle();
        self.state.lock().semaphores.insert(semaphore, false);
        Ok(semaphore)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        if state.semaphores.remove(&semaphore).is_none() {
            state.violation(format!("destroying unknown {semaphore:?}"));
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> Result<AcquireResult, GraphicsError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.take_failure(FailPoint::AcquireNextImage, "vkAcquireNextImageKHR")?;
        let status = state
            .acquire_script
            .pop_front()
            .unwrap_or(SurfaceStatus::Optimal);
        let Some(chain) = state.swapchains.get_mut(&swapchain) else {
            return Err(GraphicsError::InvalidParameter(format!(
                "unknown swapchain {swapchain:?}"
            )));
        };

        if status == SurfaceStatus::OutOfDate {
            state.calls.push(BackendCall::AcquireNextImage {
                swapchain,
                image_index: None,
            });
            return Ok(AcquireResult::OutOfDate);
        }

        let index = chain.next_image;
        chain.next_image = (chain.next_image + 1) % chain.image_count;

        match state.semaphores.get_mut(&signal) {
            Some(signaled) if !*signaled => *signaled = true,
            Some(_) => state.violation(format!(
                "acquire signals {signal:?} which is already signaled"
            )),
            None => state.violation(format!("acquire signals unknown {signal:?}")),
        }
        state.calls.push(BackendCall::AcquireNextImage {
            swapchain,
            image_index: Some(index),
        });
        Ok(AcquireResult::Image { index, status })
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<SurfaceStatus, GraphicsError> {
        let mut state = self.state.lock();
        state.take_failure(FailPoint::QueuePresent, "vkQueuePresentKHR")?;
        let Some(image_count) = state.swapchains.get(&swapchain).map(|s| s.image_count) else {
            return Err(GraphicsError::InvalidParameter(format!(
                "unknown swapchain {swapchain:?}"
            )));
        };
        if image_index >= image_count {
            return Err(GraphicsError::InvalidParameter(format!(
                "image index {image_index} out of range for {image_count} swapchain images"
            )));
        }
        match state.semaphores.get_mut(&wait) {
            Some(signaled) if *signaled => *signaled = false,
            Some(_) => state.violation(format!(
                "present waits on {wait:?} which has no pending signal"
            )),
            None => state.violation(format!("present waits on unknown {wait:?}")),
        }
        let status = state
            .present_script
            .pop_front()
            .unwrap_or(SurfaceStatus::Optimal);
        state.calls.push(BackendCall::Present {
            swapchain,
            image_index,
            status,
        });
        Ok(status)
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<(vk::Buffer, Allocation), GraphicsError> {
        let mut state = self.state.lock();
        state.take_failure(FailPoint::CreateBuffer, "vkCreateBuffer")?;
        if desc.size == 0 {
            return Err(GraphicsError::InvalidParameter(
                "buffer size must be non-zero".to_string(),
            ));
        }
        let size = usize::try_from(desc.size).map_err(|_| GraphicsError::OutOfMemory)?;

        let buffer: vk::Buffer = self.fabricate_handle();
        let memory = HostMemory::zeroed(size);
        let mapped = desc
            .location
            .is_host_visible()
            .then(|| MappedPtr::new(memory.ptr));
        state.buffers.insert(buffer, BufferState { memory });
        state.calls.push(BackendCall::CreateBuffer {
            buffer,
            size: desc.size,
        });
        log::trace!(
            "DummyBackend: creating buffer {:?} (size: {}, {:?})",
            desc.label,
            desc.size,
            desc.location
        );
        Ok((buffer, Allocation::new(buffer.as_raw(), desc.size, mapped)))
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer, allocation: Allocation) {
        let mut state = self.state.lock();
        if state.buffers.remove(&buffer).is_none() {
            state.violation(format!(
                "destroying unknown {buffer:?} (allocation {})",
                allocation.id()
            ));
            return;
        }
        state.calls.push(BackendCall::DestroyBuffer(buffer));
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<(vk::Image, Allocation), GraphicsError> {
        let mut state = self.state.lock();
        state.take_failure(FailPoint::CreateImage, "vkCreateImage")?;
        let e = desc.extent;
        if e.width == 0 || e.height == 0 || e.depth == 0 || desc.array_layers == 0 {
            return Err(GraphicsError::InvalidParameter(format!(
                "image extent {}x{}x{} with {} layers is empty",
                e.width, e.height, e.depth, desc.array_layers
            )));
        }
        let texel_size = u64::from(format_texel_size(desc.format).unwrap_or(4));
        let bytes = u64::from(e.width)
            * u64::from(e.height)
            * u64::from(e.depth)
            * u64::from(desc.array_layers)
            * texel_size;
        let len = usize::try_from(bytes).map_err(|_| GraphicsError::OutOfMemory)?;

        let image: vk::Image = self.fabricate_handle();
        let memory = HostMemory::zeroed(len);
        let mapped = desc
            .location
            .is_host_visible()
            .then(|| MappedPtr::new(memory.ptr));
        state.images.insert(
            image,
            ImageState {
                extent: e,
                array_layers: desc.array_layers,
                texel_size,
                layout: vk::ImageLayout::UNDEFINED,
                memory,
            },
        );
        state.calls.push(BackendCall::CreateImage(image));
        log::trace!(
            "DummyBackend: creating image {:?} ({}x{}x{}, {:?})",
            desc.label,
            e.width,
            e.height,
            e.depth,
            desc.format
        );
        Ok((image, Allocation::new(image.as_raw(), bytes, mapped)))
    }

    unsafe fn destroy_image(&self, image: vk::Image, _allocation: Allocation) {
        let mut state = self.state.lock();
        if state.views.values().any(|&i| i == image) {
            state.violation(format!("{image:?} destroyed while views still reference it"));
        }
        if state.images.remove(&image).is_none() {
            state.violation(format!("destroying unknown {image:?}"));
            return;
        }
        state.calls.push(BackendCall::DestroyImage(image));
    }

    fn create_image_view(&self, desc: &ImageViewDesc) -> Result<vk::ImageView, GraphicsError> {
        let mut state = self.state.lock();
        if !state.images.contains_key(&desc.image) {
            return Err(GraphicsError::InvalidParameter(format!(
                "view of unknown image {:?}",
                desc.image
            )));
        }
        let view = self.fabricate_handle();
        state.views.insert(view, desc.image);
        log::trace!(
            "DummyBackend: creating {:?} view of {:?}",
            desc.view_type,
            desc.image
        );
        Ok(view)
    }

    unsafe fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.state.lock();
        if state.views.remove(&view).is_none() {
            state.violation(format!("destroying unknown {view:?}"));
        }
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler, GraphicsError> {
        let sampler = self.fabricate_handle();
        self.state.lock().samplers.insert(sampler);
        log::trace!("DummyBackend: creating sampler {:?}", desc);
        Ok(sampler)
    }

    unsafe fn destroy_sampler(&self, sampler: vk::Sampler) {
        let mut state = self.state.lock();
        if !state.samplers.remove(&sampler) {
            state.violation(format!("destroying unknown {sampler:?}"));
        }
    }
}

/// Swapchain and render target backed by [`DummyBackend`].
pub struct DummySwapchain {
    backend: Arc<DummyBackend>,
    handle: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
}

impl DummySwapchain {
    pub fn new(backend: Arc<DummyBackend>, image_count: u32, extent: vk::Extent2D) -> Self {
        let handle = backend.create_swapchain(image_count);
        let render_pass = backend.fabricate_handle();
        let framebuffers = (0..image_count.max(1))
            .map(|_| backend.fabricate_handle())
            .collect();
        Self {
            backend,
            handle,
            format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            extent,
            render_pass,
            framebuffers,
        }
    }

    /// Extent picked up by the next recreation.
    pub fn set_extent(&mut self, extent: vk::Extent2D) {
        self.extent = extent;
    }
}

impl std::fmt::Debug for DummySwapchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DummySwapchain")
            .field("handle", &self.handle)
            .field("extent", &self.extent)
            .field("images", &self.framebuffers.len())
            .finish_non_exhaustive()
    }
}

impl Swapchain for DummySwapchain {
    fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn image_count(&self) -> u32 {
        self.framebuffers.len() as u32
    }

    fn recreate_swapchain(&mut self) -> Result<(), GraphicsError> {
        self.handle = self.backend.recreate_swapchain(self.handle);
        let backend = &self.backend;
        for framebuffer in &mut self.framebuffers {
            *framebuffer = backend.fabricate_handle();
        }
        Ok(())
    }
}

impl RenderTarget for DummySwapchain {
    fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    fn framebuffer(&self, image_index: u32) -> Option<vk::Framebuffer> {
        self.framebuffers.get(image_index as usize).copied()
    }

    fn render_area(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: self.extent,
        }
    }
}

impl Drop for DummySwapchain {
    fn drop(&mut self) {
        self.backend.destroy_swapchain(self.handle);
    }
}

/// Scripted window for headless runs.
#[derive(Debug, Clone, Default)]
pub struct DummyWindow {
    close_after_polls: Option<u64>,
    polls: u64,
    resize_at: Vec<u64>,
    resized: bool,
}

impl DummyWindow {
    /// Window that requests close once it has been polled `polls` times.
    pub fn closing_after(polls: u64) -> Self {
        Self {
            close_after_polls: Some(polls),
            ..Self::default()
        }
    }

    /// Window that never requests close.
    pub fn open() -> Self {
        Self::default()
    }

    /// Report a framebuffer resize during the `poll`-th poll (1-based).
    pub fn with_resize_at_poll(mut self, poll: u64) -> Self {
        self.resize_at.push(poll);
        self
    }

    pub fn polls(&self) -> u64 {
        self.polls
    }
}

impl Window for DummyWindow {
    fn should_close(&self) -> bool {
        self.close_after_polls
            .is_some_and(|limit| self.polls >= limit)
    }

    fn poll_events(&mut self) {
        self.polls += 1;
        if self.resize_at.contains(&self.polls) {
            self.resized = true;
        }
    }

    fn take_framebuffer_resized(&mut self) -> bool {
        std::mem::take(&mut self.resized)
    }
}

/// Pipeline with fabricated handles.
#[derive(Debug, Clone, Copy)]
pub struct DummyPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl DummyPipeline {
    pub fn new(backend: &DummyBackend) -> Self {
        Self {
            pipeline: backend.fabricate_handle(),
            layout: backend.fabricate_handle(),
        }
    }
}

impl Pipeline for DummyPipeline {
    fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dummy_backend_name() {
        let backend = DummyBackend::new();
        assert_eq!(backend.name(), "Dummy");
    }

    #[test]
    fn test_fabricated_handles_are_unique_and_non_null() {
        let backend = DummyBackend::new();
        let a: vk::Buffer = backend.fabricate_handle();
        let b: vk::Buffer = backend.fabricate_handle();
        assert_ne!(a, vk::Buffer::null());
        assert_ne!(a, b);
    }

    #[test]
    fn test_submit_executes_buffer_copy() {
        let backend = DummyBackend::new();
        let desc = BufferDesc::new(
            8,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        );
        let (src, src_alloc) = backend.create_buffer(&desc).unwrap();
        let (dst, dst_alloc) = backend
            .create_buffer(&BufferDesc::new(
                8,
                vk::BufferUsageFlags::TRANSFER_DST,
                MemoryLocation::GpuOnly,
            ))
            .unwrap();
        assert!(dst_alloc.mapped_ptr().is_none());

        let mapped = src_alloc.mapped_ptr().unwrap();
        let payload = [1u8, 2, 3, 4, 5, 6, 7, 8];
        unsafe { ptr::copy_nonoverlapping(payload.as_ptr(), mapped.as_ptr(), 8) };

        let pool = backend.create_command_pool().unwrap();
        let cmd = backend
            .allocate_command_buffer(pool, vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        backend
            .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .unwrap();
        backend.cmd_copy_buffer(
            cmd,
            src,
            dst,
            vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: 8,
            },
        );
        backend.end_command_buffer(cmd).unwrap();

        let fence = backend.create_fence(false).unwrap();
        backend
            .queue_submit(&QueueSubmit {
                command_buffers: &[cmd],
                fence,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(backend.is_fence_signaled(fence), Some(true));
        assert_eq!(backend.buffer_contents(dst).unwrap(), payload);
        assert!(backend.validation_errors().is_empty());

        unsafe {
            backend.destroy_fence(fence);
            backend.destroy_command_pool(pool);
            backend.destroy_buffer(src, src_alloc);
            backend.destroy_buffer(dst, dst_alloc);
        }
        assert_eq!(backend.live_allocations(), 0);
        assert_eq!(backend.live_command_buffers(), 0);
    }

    #[test]
    fn test_waiting_on_unsignaled_semaphore_is_reported() {
        let backend = DummyBackend::new();
        let semaphore = backend.create_semaphore().unwrap();
        backend
            .queue_submit(&QueueSubmit {
                wait_semaphores: &[semaphore],
                wait_stages: &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(backend.validation_errors().len(), 1);
    }

    #[test]
    fn test_held_fence_times_out_until_released() {
        let backend = DummyBackend::new();
        backend.set_hold_fences(true);
        let fence = backend.create_fence(false).unwrap();
        backend
            .queue_submit(&QueueSubmit {
                fence,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(
            backend
                .wait_for_fence(fence, Some(Duration::from_millis(1)))
                .unwrap(),
            FenceWait::TimedOut
        );
        assert!(backend.wait_for_fence(fence, None).is_err());

        backend.release_held_fences();
        assert_eq!(
            backend.wait_for_fence(fence, None).unwrap(),
            FenceWait::Signaled
        );
    }

    #[test]
    fn test_injected_failure_fires_once() {
        let backend = DummyBackend::new();
        backend.fail_next(FailPoint::CreateCommandPool, vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        assert_eq!(
            backend.create_command_pool(),
            Err(GraphicsError::OutOfMemory)
        );
        assert!(backend.create_command_pool().is_ok());
    }

    #[test]
    fn test_scripted_acquire_out_of_date_leaves_semaphore_unsignaled() {
        let backend = Arc::new(DummyBackend::new());
        let swapchain = backend.create_swapchain(2);
        let semaphore = backend.create_semaphore().unwrap();

        backend.script_acquire(SurfaceStatus::OutOfDate);
        assert_eq!(
            backend.acquire_next_image(swapchain, semaphore).unwrap(),
            AcquireResult::OutOfDate
        );
        assert_eq!(
            backend.acquire_next_image(swapchain, semaphore).unwrap(),
            AcquireResult::Image {
                index: 0,
                status: SurfaceStatus::Optimal
            }
        );
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn test_dummy_window_closes_and_reports_resize() {
        let mut window = DummyWindow::closing_after(3).with_resize_at_poll(2);
        assert!(!window.should_close());
        window.poll_events();
        assert!(!window.take_framebuffer_resized());
        window.poll_events();
        assert!(window.take_framebuffer_resized());
        assert!(!window.take_framebuffer_resized());
        window.poll_events();
        assert!(window.should_close());
    }

    #[test]
    fn test_dummy_swapchain_recreation_is_logged() {
        let backend = Arc::new(DummyBackend::new());
        let mut swapchain = DummySwapchain::new(
            backend.clone(),
            3,
            vk::Extent2D {
                width: 800,
                height: 600,
            },
        );
        let old = swapchain.handle();
        swapchain.recreate_swapchain().unwrap();
        assert_ne!(swapchain.handle(), old);
        assert_eq!(swapchain.image_count(), 3);
        assert!(backend
            .calls()
            .iter()
            .any(|c| matches!(c, BackendCall::RecreateSwapchain { old: o, .. } if *o == old)));
    }
}
