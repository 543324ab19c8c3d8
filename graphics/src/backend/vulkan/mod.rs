//! Native Vulkan backend implementation using ash.
//!
//! The backend owns the instance, the optional window surface, the logical
//! device and a gpu-allocator [`Allocator`]. Swapchains and pipelines are
//! built on top of it by [`VulkanSwapchain`] and [`GraphicsPipelineBuilder`].
//!
//! Queue submission and presentation share one lock, since a `VkQueue` is
//! externally synchronized and the graphics and present queues may be the
//! same object.

mod allocator;
pub(crate) mod conversion;
mod debug;
mod device;
mod instance;
pub mod pipeline;
pub mod swapchain;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ash::vk;
use gpu_allocator::vulkan::Allocator;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::config::GraphicsConfig;
use crate::error::GraphicsError;

use super::{
    AcquireResult, Allocation, BufferDesc, FenceWait, GpuBackend, ImageBarrier, ImageDesc,
    ImageViewDesc, MappedPtr, QueueFamilyIndices, QueueSubmit, RenderPassBegin, SamplerDesc,
    SurfaceStatus,
};

pub use pipeline::{GraphicsPipelineBuilder, ShaderCompiler, ShaderStage, VulkanPipeline};
pub use swapchain::VulkanSwapchain;

use self::conversion::{convert_sampler_desc, convert_timeout};
use self::device::{DeviceSelection, SurfaceQuery};
use self::instance::InstanceBundle;

/// Vulkan-based GPU backend using ash.
pub struct VulkanBackend {
    /// Vulkan entry points (function loader). Must outlive the instance.
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: InstanceBundle,
    surface_loader: ash::khr::surface::Instance,
    /// `None` for headless backends.
    surface: Option<vk::SurfaceKHR>,
    selection: DeviceSelection,
    device: ash::Device,
    graphics_queue: vk::Queue,
    present_queue: Option<vk::Queue>,
    swapchain_loader: Option<ash::khr::swapchain::Device>,
    /// Taken in `Drop` so it is destroyed before the device.
    allocator: Mutex<Option<Allocator>>,
    allocations: Mutex<HashMap<u64, gpu_allocator::vulkan::Allocation>>,
    next_allocation: AtomicU64,
    queue_lock: Mutex<()>,
    config: GraphicsConfig,
}

impl std::fmt::Debug for VulkanBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBackend")
            .field("device", &self.selection.name)
            .field("queue_families", &self.selection.queue_families)
            .field("surface", &self.surface)
            .field("validation", &self.instance.debug_messenger.is_some())
            .finish()
    }
}

impl VulkanBackend {
    /// Create a backend that renders to `window`.
    pub fn new<W>(config: &GraphicsConfig, window: &W) -> Result<Self, GraphicsError>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GraphicsError::InitializationFailed(format!("No display handle: {e}")))?
            .as_raw();
        let window = window
            .window_handle()
            .map_err(|e| GraphicsError::InitializationFailed(format!("No window handle: {e}")))?
            .as_raw();

        let entry = load_entry()?;
        let surface_extensions = ash_window::enumerate_required_extensions(display)
            .map_err(|e| GraphicsError::from_vk("vkEnumerateInstanceExtensionProperties", e))?;
        let instance = instance::create_instance(&entry, config, surface_extensions)?;

        let surface = match unsafe {
            ash_window::create_surface(&entry, &instance.instance, display, window, None)
        } {
            Ok(surface) => surface,
            Err(e) => {
                unsafe { instance.destroy() };
                return Err(GraphicsError::InitializationFailed(format!(
                    "Failed to create window surface: {:?}",
                    e
                )));
            }
        };

        Self::with_instance(entry, instance, Some(surface), config)
    }

    /// Create a backend without a surface. Presentation is unsupported.
    pub fn headless(config: &GraphicsConfig) -> Result<Self, GraphicsError> {
        let entry = load_entry()?;
        let instance = instance::create_instance(&entry, config, &[])?;
        Self::with_instance(entry, instance, None, config)
    }

    fn with_instance(
        entry: ash::Entry,
        instance: InstanceBundle,
        surface: Option<vk::SurfaceKHR>,
        config: &GraphicsConfig,
    ) -> Result<Self, GraphicsError> {
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance.instance);

        let brought_up = Self::bring_up_device(&instance.instance, &surface_loader, surface, config);
        let (selection, device, allocator) = match brought_up {
            Ok(parts) => parts,
            Err(e) => {
                unsafe {
                    if let Some(surface) = surface {
                        surface_loader.destroy_surface(surface, None);
                    }
                    instance.destroy();
                }
                return Err(e);
            }
        };

        let families = selection.queue_families;
        let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
        let present_queue = families
            .present
            .map(|family| unsafe { device.get_device_queue(family, 0) });
        let swapchain_loader = surface
            .is_some()
            .then(|| ash::khr::swapchain::Device::new(&instance.instance, &device));

        log::info!(
            "Vulkan backend initialized on {} (validation: {}, surface: {})",
            selection.name,
            instance.debug_messenger.is_some(),
            surface.is_some()
        );

        Ok(Self {
            entry,
            instance,
            surface_loader,
            surface,
            selection,
            device,
            graphics_queue,
            present_queue,
            swapchain_loader,
            allocator: Mutex::new(Some(allocator)),
            allocations: Mutex::new(HashMap::new()),
            next_allocation: AtomicU64::new(1),
            queue_lock: Mutex::new(()),
            config: config.clone(),
        })
    }

    fn bring_up_device(
        instance: &ash::Instance,
        surface_loader: &ash::khr::surface::Instance,
        surface: Option<vk::SurfaceKHR>,
        config: &GraphicsConfig,
    ) -> Result<(DeviceSelection, ash::Device, Allocator), GraphicsError> {
        let query = surface.map(|surface| SurfaceQuery {
            loader: surface_loader,
            surface,
        });
        let selection = device::select_physical_device(instance, query, config.prefer_discrete_gpu)?;
        let device = device::create_logical_device(instance, &selection)?;
        match allocator::create_allocator(instance, selection.physical_device, device.clone()) {
            Ok(allocator) => Ok((selection, device, allocator)),
            Err(e) => {
                unsafe { device.destroy_device(None) };
                Err(e)
            }
        }
    }

    /// Get the Vulkan device.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the physical device.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.selection.physical_device
    }

    /// Name of the selected GPU.
    pub fn device_name(&self) -> &str {
        &self.selection.name
    }

    /// Configuration the backend was created with.
    pub fn config(&self) -> &GraphicsConfig {
        &self.config
    }

    /// Window surface, `None` when headless.
    pub fn surface(&self) -> Option<vk::SurfaceKHR> {
        self.surface
    }

    pub(crate) fn surface_loader(&self) -> &ash::khr::surface::Instance {
        &self.surface_loader
    }

    pub(crate) fn swapchain_loader(&self) -> Result<&ash::khr::swapchain::Device, GraphicsError> {
        self.swapchain_loader.as_ref().ok_or_else(|| {
            GraphicsError::FeatureNotSupported("presentation on a headless device".to_string())
        })
    }

    fn register_allocation(&self, allocation: gpu_allocator::vulkan::Allocation) -> u64 {
        let id = self.next_allocation.fetch_add(1, Ordering::Relaxed);
        self.allocations.lock().insert(id, allocation);
        id
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: super::MemoryLocation,
        linear: bool,
    ) -> Result<gpu_allocator::vulkan::Allocation, GraphicsError> {
        let mut guard = self.allocator.lock();
        let live = guard
            .as_mut()
            .ok_or_else(|| GraphicsError::Internal("allocator already destroyed".to_string()))?;
        allocator::allocate(live, name, requirements, location, linear)
    }

    fn free(&self, id: u64) {
        let Some(allocation) = self.allocations.lock().remove(&id) else {
            log::error!("Freeing unknown allocation {}", id);
            return;
        };
        if let Some(allocator) = self.allocator.lock().as_mut() {
            if let Err(e) = allocator.free(allocation) {
                log::error!("Failed to free allocation {}: {}", id, e);
            }
        }
    }
}

fn load_entry() -> Result<ash::Entry, GraphicsError> {
    unsafe { ash::Entry::load() }
        .map_err(|e| GraphicsError::InitializationFailed(format!("Failed to load Vulkan: {}", e)))
}

fn surface_status(suboptimal: bool) -> SurfaceStatus {
    if suboptimal {
        SurfaceStatus::Suboptimal
    } else {
        SurfaceStatus::Optimal
    }
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn queue_families(&self) -> QueueFamilyIndices {
        self.selection.queue_families
    }

    fn wait_idle(&self) -> Result<(), GraphicsError> {
        let _queue = self.queue_lock.lock();
        unsafe { self.device.device_wait_idle() }
            .map_err(|e| GraphicsError::from_vk("vkDeviceWaitIdle", e))
    }

    fn create_command_pool(&self) -> Result<vk::CommandPool, GraphicsError> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(self.selection.queue_families.graphics);
        unsafe { self.device.create_command_pool(&info, None) }
            .map_err(|e| GraphicsError::from_vk("vkCreateCommandPool", e))
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<(), GraphicsError> {
        unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())
        }
        .map_err(|e| GraphicsError::from_vk("vkResetCommandPool", e))
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer, GraphicsError> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }
            .map_err(|e| GraphicsError::from_vk("vkAllocateCommandBuffers", e))?;
        buffers.into_iter().next().ok_or_else(|| {
            GraphicsError::Internal("vkAllocateCommandBuffers returned no buffer".to_string())
        })
    }

    unsafe fn free_command_buffer(&self, pool: vk::CommandPool, buffer: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[buffer]) };
    }

    fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<(), GraphicsError> {
        let info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe { self.device.begin_command_buffer(buffer, &info) }
            .map_err(|e| GraphicsError::from_vk("vkBeginCommandBuffer", e))
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> Result<(), GraphicsError> {
        unsafe { self.device.end_command_buffer(buffer) }
            .map_err(|e| GraphicsError::from_vk("vkEndCommandBuffer", e))
    }

    fn cmd_begin_render_pass(&self, buffer: vk::CommandBuffer, begin: &RenderPassBegin<'_>) {
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(begin.render_pass)
            .framebuffer(begin.framebuffer)
            .render_area(begin.render_area)
            .clear_values(begin.clear_values);
        unsafe {
            self.device
                .cmd_begin_render_pass(buffer, &info, vk::SubpassContents::INLINE)
        };
    }

    fn cmd_end_render_pass(&self, buffer: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(buffer) };
    }

    fn cmd_bind_pipeline(
        &self,
        buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe { self.device.cmd_bind_pipeline(buffer, bind_point, pipeline) };
    }

    fn cmd_set_viewport_and_scissor(&self, buffer: vk::CommandBuffer, area: vk::Rect2D) {
        let viewport = vk::Viewport {
            x: area.offset.x as f32,
            y: area.offset.y as f32,
            width: area.extent.width as f32,
            height: area.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe {
            self.device.cmd_set_viewport(buffer, 0, &[viewport]);
            self.device.cmd_set_scissor(buffer, 0, &[area]);
        }
    }

    fn cmd_bind_vertex_buffer(
        &self,
        buffer: vk::CommandBuffer,
        binding: u32,
        vertex_buffer: vk::Buffer,
        offset: u64,
    ) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(buffer, binding, &[vertex_buffer], &[offset])
        };
    }

    fn cmd_bind_index_buffer(
        &self,
        buffer: vk::CommandBuffer,
        index_buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    ) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(buffer, index_buffer, offset, index_type)
        };
    }

    fn cmd_push_constants(
        &self,
        buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe {
            self.device
                .cmd_push_constants(buffer, layout, stages, offset, data)
        };
    }

    fn cmd_draw(
        &self,
        buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw(
                buffer,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        };
    }

    fn cmd_draw_indexed(
        &self,
        buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
    }

    fn cmd_copy_buffer(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) {
        unsafe { self.device.cmd_copy_buffer(buffer, src, dst, &[region]) };
    }

    fn cmd_copy_buffer_to_image(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: vk::BufferImageCopy,
    ) {
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(buffer, src, dst, dst_layout, &[region])
        };
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
        unsafe {
            self.device
                .cmd_copy_image(buffer, src, src_layout, dst, dst_layout, &[region])
        };
    }

    fn cmd_image_barrier(&self, buffer: vk::CommandBuffer, barrier: &ImageBarrier) {
        let image_barrier = vk::ImageMemoryBarrier::default()
            .old_layout(barrier.old_layout)
            .new_layout(barrier.new_layout)
            .src_access_mask(barrier.src_access_mask)
            .dst_access_mask(barrier.dst_access_mask)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(barrier.image)
            .subresource_range(barrier.subresource_range);
        unsafe {
            self.device.cmd_pipeline_barrier(
                buffer,
                barrier.src_stage,
                barrier.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[image_barrier],
            )
        };
    }

    fn queue_submit(&self, submit: &QueueSubmit<'_>) -> Result<(), GraphicsError> {
        if submit.wait_semaphores.len() != submit.wait_stages.len() {
            return Err(GraphicsError::InvalidParameter(format!(
                "{} wait semaphores but {} wait stages",
                submit.wait_semaphores.len(),
                submit.wait_stages.len()
            )));
        }
        let info = vk::SubmitInfo::default()
            .wait_semaphores(submit.wait_semaphores)
            .wait_dst_stage_mask(submit.wait_stages)
            .command_buffers(submit.command_buffers)
            .signal_semaphores(submit.signal_semaphores);

        let _queue = self.queue_lock.lock();
        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[info], submit.fence)
        }
        .map_err(|e| GraphicsError::from_vk("vkQueueSubmit", e))
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence, GraphicsError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)
        }
        .map_err(|e| GraphicsError::from_vk("vkCreateFence", e))
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_for_fence(
        &self,
        fence: vk::Fence,
        timeout: Option<Duration>,
    ) -> Result<FenceWait, GraphicsError> {
        match unsafe {
            self.device
                .wait_for_fences(&[fence], true, convert_timeout(timeout))
        } {
            Ok(()) => Ok(FenceWait::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(FenceWait::TimedOut),
            Err(e) => Err(GraphicsError::from_vk("vkWaitForFences", e)),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<(), GraphicsError> {
        unsafe { self.device.reset_fences(&[fence]) }
            .map_err(|e| GraphicsError::from_vk("vkResetFences", e))
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore, GraphicsError> {
        unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
        .map_err(|e| GraphicsError::from_vk("vkCreateSemaphore", e))
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> Result<AcquireResult, GraphicsError> {
        let loader = self.swapchain_loader()?;
        match unsafe { loader.acquire_next_image(swapchain, u64::MAX, signal, vk::Fence::null()) } {
            Ok((index, suboptimal)) => Ok(AcquireResult::Image {
                index,
                status: surface_status(suboptimal),
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireResult::OutOfDate),
            Err(e) => Err(GraphicsError::from_vk("vkAcquireNextImageKHR", e)),
        }
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<SurfaceStatus, GraphicsError> {
        let loader = self.swapchain_loader()?;
        let queue = self.present_queue.ok_or_else(|| {
            GraphicsError::FeatureNotSupported("device has no present queue".to_string())
        })?;

        let wait_semaphores = [wait];
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let _queue = self.queue_lock.lock();
        match unsafe { loader.queue_present(queue, &info) } {
            Ok(suboptimal) => Ok(surface_status(suboptimal)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(SurfaceStatus::OutOfDate),
            Err(e) => Err(GraphicsError::from_vk("vkQueuePresentKHR", e)),
        }
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<(vk::Buffer, Allocation), GraphicsError> {
        if desc.size == 0 {
            return Err(GraphicsError::InvalidParameter(
                "buffer size must be non-zero".to_string(),
            ));
        }
        let info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None) }
            .map_err(|e| GraphicsError::from_vk("vkCreateBuffer", e))?;

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let name = desc.label.as_deref().unwrap_or("buffer");
        let memory = match self.allocate(name, requirements, desc.location, true) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, memory.memory(), memory.offset())
        };
        let mapped = memory.mapped_ptr().map(|ptr| MappedPtr::new(ptr.cast()));
        let id = self.register_allocation(memory);
        if let Err(e) = bound {
            self.free(id);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(GraphicsError::from_vk("vkBindBufferMemory", e));
        }

        log::trace!(
            "Created buffer {:?} ({}, {} bytes, {:?})",
            buffer,
            name,
            desc.size,
            desc.location
        );
        Ok((buffer, Allocation::new(id, desc.size, mapped)))
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer, allocation: Allocation) {
        unsafe { self.device.destroy_buffer(buffer, None) };
        self.free(allocation.id());
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<(vk::Image, Allocation), GraphicsError> {
        let info = vk::ImageCreateInfo::default()
            .image_type(desc.image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(desc.samples)
            .tiling(desc.tiling)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&info, None) }
            .map_err(|e| GraphicsError::from_vk("vkCreateImage", e))?;

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let name = desc.label.as_deref().unwrap_or("image");
        let linear = desc.tiling == vk::ImageTiling::LINEAR;
        let memory = match self.allocate(name, requirements, desc.location, linear) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .bind_image_memory(image, memory.memory(), memory.offset())
        };
        let size = memory.size();
        let mapped = memory.mapped_ptr().map(|ptr| MappedPtr::new(ptr.cast()));
        let id = self.register_allocation(memory);
        if let Err(e) = bound {
            self.free(id);
            unsafe { self.device.destroy_image(image, None) };
            return Err(GraphicsError::from_vk("vkBindImageMemory", e));
        }

        log::trace!("Created image {:?} ({}, {:?})", image, name, desc.format);
        Ok((image, Allocation::new(id, size, mapped)))
    }

    unsafe fn destroy_image(&self, image: vk::Image, allocation: Allocation) {
        unsafe { self.device.destroy_image(image, None) };
        self.free(allocation.id());
    }

    fn create_image_view(&self, desc: &ImageViewDesc) -> Result<vk::ImageView, GraphicsError> {
        let info = vk::ImageViewCreateInfo::default()
            .image(desc.image)
            .view_type(desc.view_type)
            .format(desc.format)
            .components(vk::ComponentMapping::default())
            .subresource_range(desc.subresource_range);
        unsafe { self.device.create_image_view(&info, None) }
            .map_err(|e| GraphicsError::from_vk("vkCreateImageView", e))
    }

    unsafe fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler, GraphicsError> {
        let info = convert_sampler_desc(desc, self.selection.max_anisotropy);
        unsafe { self.device.create_sampler(&info, None) }
            .map_err(|e| GraphicsError::from_vk("vkCreateSampler", e))
    }

    unsafe fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("Failed to wait for device idle during teardown: {:?}", e);
            }

            let leftovers: Vec<_> = self.allocations.lock().drain().collect();
            let mut allocator = self.allocator.lock().take();
            if !leftovers.is_empty() {
                log::warn!(
                    "{} allocations still alive at backend teardown",
                    leftovers.len()
                );
            }
            if let Some(allocator) = allocator.as_mut() {
                for (_, allocation) in leftovers {
                    if let Err(e) = allocator.free(allocation) {
                        log::error!("Failed to free allocation during teardown: {}", e);
                    }
                }
            }
            drop(allocator);

            self.device.destroy_device(None);
            if let Some(surface) = self.surface.take() {
                self.surface_loader.destroy_surface(surface, None);
            }
            self.instance.destroy();
        }
        log::info!("Vulkan backend destroyed");
    }
}

static_assertions::assert_impl_all!(VulkanBackend: Send, Sync);
