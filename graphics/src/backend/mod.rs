//! GPU backend abstraction layer.
//!
//! Every native call the core makes goes through the [`GpuBackend`] trait,
//! so the frame-sync, command and transfer code above it never talks to a
//! driver directly.
//!
//! # Available Backends
//!
//! - `dummy` (always built): in-memory device used by tests and headless runs
//! - `vulkan-backend` (default): native Vulkan backend using ash
//!
//! Handles are the raw `ash::vk` handle types for both backends. The dummy
//! backend fabricates them from a counter.

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

pub mod dummy;

use std::fmt;
use std::ptr::NonNull;
use std::time::Duration;

use ash::vk;

use crate::error::GraphicsError;

pub use dummy::DummyBackend;

/// Where the memory behind a buffer or image lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryLocation {
    /// Device-local memory, not visible to the host.
    #[default]
    GpuOnly,
    /// Host-visible memory the host writes and the device reads.
    CpuToGpu,
    /// Host-visible memory the device writes and the host reads.
    GpuToCpu,
}

impl MemoryLocation {
    /// Host-visible locations are persistently mapped by every backend.
    pub fn is_host_visible(self) -> bool {
        !matches!(self, Self::GpuOnly)
    }
}

/// Host pointer to the start of a persistently mapped allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedPtr(NonNull<u8>);

// SAFETY: the pointer refers to driver-owned mapped memory that stays valid
// until the owning allocation is freed. Access is synchronized by the owner
// of the allocation, never through this type.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    pub fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }
}

/// Opaque memory allocation returned alongside a native buffer or image.
///
/// The value is an ownership token: it is moved back into the backend when
/// the resource is destroyed, so it is deliberately not `Clone`.
#[derive(Debug)]
pub struct Allocation {
    id: u64,
    size: u64,
    mapped: Option<MappedPtr>,
}

impl Allocation {
    pub fn new(id: u64, size: u64, mapped: Option<MappedPtr>) -> Self {
        Self { id, size, mapped }
    }

    /// Backend-specific identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size in bytes of the resource the allocation backs.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Start of the persistent host mapping, if host visible.
    pub fn mapped_ptr(&self) -> Option<MappedPtr> {
        self.mapped
    }
}

/// Queue families selected for the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    /// `None` on headless devices.
    pub present: Option<u32>,
}

/// Description of a buffer to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    pub label: Option<String>,
}

impl BufferDesc {
    pub fn new(size: u64, usage: vk::BufferUsageFlags, location: MemoryLocation) -> Self {
        Self {
            size,
            usage,
            location,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Description of an image to create.
#[derive(Debug, Clone)]
pub struct ImageDesc {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub location: MemoryLocation,
    pub label: Option<String>,
}

impl ImageDesc {
    /// Create a descriptor for a single-sampled, single-mip 2D image.
    pub fn texture_2d(
        width: u32,
        height: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Self {
        Self {
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
            location: MemoryLocation::GpuOnly,
            label: None,
        }
    }

    pub fn with_image_type(mut self, image_type: vk::ImageType) -> Self {
        self.image_type = image_type;
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.extent.depth = depth;
        self
    }

    pub fn with_mip_levels(mut self, count: u32) -> Self {
        self.mip_levels = count;
        self
    }

    pub fn with_array_layers(mut self, count: u32) -> Self {
        self.array_layers = count;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Description of an image view.
#[derive(Debug, Clone, Copy)]
pub struct ImageViewDesc {
    pub image: vk::Image,
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub subresource_range: vk::ImageSubresourceRange,
}

/// Description of a sampler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    /// Maximum anisotropy. Ignored when the device lacks the feature.
    pub max_anisotropy: Option<f32>,
    pub max_lod: f32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            max_anisotropy: None,
            max_lod: vk::LOD_CLAMP_NONE,
        }
    }
}

impl SamplerDesc {
    /// Nearest-neighbour filtering with clamped addressing.
    pub fn nearest_clamped() -> Self {
        Self {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            ..Self::default()
        }
    }

    pub fn with_anisotropy(mut self, max: f32) -> Self {
        self.max_anisotropy = Some(max);
        self
    }
}

/// A single image layout transition recorded into a command buffer.
#[derive(Debug, Clone, Copy)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access_mask: vk::AccessFlags,
    pub dst_access_mask: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub subresource_range: vk::ImageSubresourceRange,
}

/// Render pass begin parameters.
#[derive(Clone, Copy)]
pub struct RenderPassBegin<'a> {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub render_area: vk::Rect2D,
    pub clear_values: &'a [vk::ClearValue],
}

impl fmt::Debug for RenderPassBegin<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderPassBegin")
            .field("render_pass", &self.render_pass)
            .field("framebuffer", &self.framebuffer)
            .field("render_area", &self.render_area)
            .field("clear_values", &self.clear_values.len())
            .finish()
    }
}

/// One batch submitted to the graphics queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueSubmit<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [vk::Semaphore],
    /// One stage mask per wait semaphore.
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
    /// `vk::Fence::null()` when no fence is signaled.
    pub fence: vk::Fence,
}

/// Result of a host wait on a fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceWait {
    Signaled,
    TimedOut,
}

/// Health of the presentation surface reported by acquire and present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceStatus {
    /// The swapchain matches the surface.
    Optimal,
    /// Still usable, but should be recreated.
    Suboptimal,
    /// Unusable until recreated.
    OutOfDate,
}

impl SurfaceStatus {
    /// Whether the swapchain should be recreated.
    pub fn is_stale(self) -> bool {
        !matches!(self, Self::Optimal)
    }
}

/// Outcome of acquiring a swapchain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    /// An image was acquired. `status` is `Optimal` or `Suboptimal`.
    Image { index: u32, status: SurfaceStatus },
    /// No image was acquired; the semaphore was not signaled.
    OutOfDate,
}

impl AcquireResult {
    pub fn status(&self) -> SurfaceStatus {
        match self {
            Self::Image { status, .. } => *status,
            Self::OutOfDate => SurfaceStatus::OutOfDate,
        }
    }

    pub fn image_index(&self) -> Option<u32> {
        match self {
            Self::Image { index, .. } => Some(*index),
            Self::OutOfDate => None,
        }
    }
}

/// Trait implemented by all GPU backends.
///
/// Methods that destroy objects are `unsafe`: the caller guarantees the
/// object is no longer referenced by any pending device work.
pub trait GpuBackend: Send + Sync + 'static {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    /// Queue families the device was created with.
    fn queue_families(&self) -> QueueFamilyIndices;

    /// Block until all device work has completed.
    fn wait_idle(&self) -> Result<(), GraphicsError>;

    // --- command pools and buffers ---

    /// Create a command pool on the graphics queue family.
    fn create_command_pool(&self) -> Result<vk::CommandPool, GraphicsError>;

    /// Reset a pool, returning all of its command buffers to the initial state.
    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<(), GraphicsError>;

    /// # Safety
    /// No command buffer allocated from `pool` may be pending execution.
    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool);

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer, GraphicsError>;

    /// # Safety
    /// `buffer` must not be pending execution.
    unsafe fn free_command_buffer(&self, pool: vk::CommandPool, buffer: vk::CommandBuffer);

    fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<(), GraphicsError>;

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> Result<(), GraphicsError>;

    // --- command recording ---

    fn cmd_begin_render_pass(&self, buffer: vk::CommandBuffer, begin: &RenderPassBegin<'_>);

    fn cmd_end_render_pass(&self, buffer: vk::CommandBuffer);

    fn cmd_bind_pipeline(
        &self,
        buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );

    fn cmd_set_viewport_and_scissor(&self, buffer: vk::CommandBuffer, area: vk::Rect2D);

    fn cmd_bind_vertex_buffer(
        &self,
        buffer: vk::CommandBuffer,
        binding: u32,
        vertex_buffer: vk::Buffer,
        offset: u64,
    );

    fn cmd_bind_index_buffer(
        &self,
        buffer: vk::CommandBuffer,
        index_buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    );

    fn cmd_push_constants(
        &self,
        buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );

    fn cmd_draw(
        &self,
        buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );

    fn cmd_draw_indexed(
        &self,
        buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );

    fn cmd_copy_buffer(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    );

    fn cmd_copy_buffer_to_image(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: vk::BufferImageCopy,
    );

    fn cmd_copy_image(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: vk::ImageCopy,
    );

    fn cmd_image_barrier(&self, buffer: vk::CommandBuffer, barrier: &ImageBarrier);

    // --- submission and synchronization ---

    /// Submit a batch to the graphics queue.
    fn queue_submit(&self, submit: &QueueSubmit<'_>) -> Result<(), GraphicsError>;

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence, GraphicsError>;

    /// # Safety
    /// The fence must not be associated with pending queue work.
    unsafe fn destroy_fence(&self, fence: vk::Fence);

    /// Block until `fence` is signaled or `timeout` expires. `None` waits forever.
    fn wait_for_fence(
        &self,
        fence: vk::Fence,
        timeout: Option<Duration>,
    ) -> Result<FenceWait, GraphicsError>;

    fn reset_fence(&self, fence: vk::Fence) -> Result<(), GraphicsError>;

    fn create_semaphore(&self) -> Result<vk::Semaphore, GraphicsError>;

    /// # Safety
    /// No pending queue operation may wait on or signal the semaphore.
    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // --- presentation ---

    /// Acquire the next swapchain image, signaling `signal` when it is ready.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> Result<AcquireResult, GraphicsError>;

    /// Queue `image_index` for presentation once `wait` is signaled.
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<SurfaceStatus, GraphicsError>;

    // --- memory-backed resources ---

    fn create_buffer(&self, desc: &BufferDesc) -> Result<(vk::Buffer, Allocation), GraphicsError>;

    /// # Safety
    /// The buffer must not be referenced by pending device work.
    unsafe fn destroy_buffer(&self, buffer: vk::Buffer, allocation: Allocation);

    fn create_image(&self, desc: &ImageDesc) -> Result<(vk::Image, Allocation), GraphicsError>;

    /// # Safety
    /// The image must not be referenced by pending device work, and all of
    /// its views must already be destroyed.
    unsafe fn destroy_image(&self, image: vk::Image, allocation: Allocation);

    fn create_image_view(&self, desc: &ImageViewDesc) -> Result<vk::ImageView, GraphicsError>;

    /// # Safety
    /// The view must not be referenced by pending device work.
    unsafe fn destroy_image_view(&self, view: vk::ImageView);

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler, GraphicsError>;

    /// # Safety
    /// The sampler must not be referenced by pending device work.
    unsafe fn destroy_sampler(&self, sampler: vk::Sampler);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_status_staleness() {
        assert!(!SurfaceStatus::Optimal.is_stale());
        assert!(SurfaceStatus::Suboptimal.is_stale());
        assert!(SurfaceStatus::OutOfDate.is_stale());
    }

    #[test]
    fn test_acquire_result_accessors() {
        let acquired = AcquireResult::Image {
            index: 2,
            status: SurfaceStatus::Suboptimal,
        };
        assert_eq!(acquired.image_index(), Some(2));
        assert_eq!(acquired.status(), SurfaceStatus::Suboptimal);
        assert_eq!(AcquireResult::OutOfDate.image_index(), None);
        assert_eq!(AcquireResult::OutOfDate.status(), SurfaceStatus::OutOfDate);
    }

    #[test]
    fn test_memory_location_visibility() {
        assert!(!MemoryLocation::GpuOnly.is_host_visible());
        assert!(MemoryLocation::CpuToGpu.is_host_visible());
        assert!(MemoryLocation::GpuToCpu.is_host_visible());
    }

    #[test]
    fn test_texture_2d_descriptor() {
        let desc = ImageDesc::texture_2d(
            64,
            32,
            vk::Format::R8G8B8A8_SRGB,
            vk::ImageUsageFlags::SAMPLED,
        )
        .with_array_layers(4);
        assert_eq!(desc.extent.width, 64);
        assert_eq!(desc.extent.height, 32);
        assert_eq!(desc.extent.depth, 1);
        assert_eq!(desc.array_layers, 4);
        assert_eq!(desc.image_type, vk::ImageType::TYPE_2D);
    }
}
