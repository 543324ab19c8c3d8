//! Vulkan swapchain and its presentation render target.
//!
//! [`VulkanSwapchain`] owns the swapchain, one view and one framebuffer per
//! image, and a single-subpass render pass that clears the image and leaves
//! it in `PRESENT_SRC_KHR`.

use std::sync::Arc;

use ash::vk;

use super::conversion::convert_present_mode;
use super::VulkanBackend;
use crate::backend::GpuBackend;
use crate::error::GraphicsError;
use crate::target::{RenderTarget, Swapchain};

type ExtentProvider = Box<dyn Fn() -> vk::Extent2D + Send>;

/// Swapchain plus render pass and framebuffers for a window surface.
pub struct VulkanSwapchain {
    backend: Arc<VulkanBackend>,
    surface: vk::SurfaceKHR,
    handle: vk::SwapchainKHR,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    /// Window size to use when the surface leaves the extent to us.
    requested_extent: vk::Extent2D,
    extent_provider: Option<ExtentProvider>,
}

impl VulkanSwapchain {
    /// Create a swapchain for the backend's surface.
    ///
    /// `extent` is used only when the surface does not dictate one.
    pub fn new(backend: Arc<VulkanBackend>, extent: vk::Extent2D) -> Result<Self, GraphicsError> {
        let surface = backend.surface().ok_or_else(|| {
            GraphicsError::FeatureNotSupported("swapchain on a headless device".to_string())
        })?;
        let surface_format = choose_surface_format(&backend, surface)?;
        let present_mode = choose_present_mode(&backend, surface)?;
        let render_pass = create_render_pass(backend.device(), surface_format.format)?;

        let mut swapchain = Self {
            backend,
            surface,
            handle: vk::SwapchainKHR::null(),
            surface_format,
            present_mode,
            extent,
            images: Vec::new(),
            image_views: Vec::new(),
            render_pass,
            framebuffers: Vec::new(),
            requested_extent: extent,
            extent_provider: None,
        };
        // On failure, Drop destroys whatever was created so far.
        swapchain.build()?;
        log::info!(
            "Created swapchain: {} images, {}x{}, {:?}, {:?}",
            swapchain.images.len(),
            swapchain.extent.width,
            swapchain.extent.height,
            swapchain.surface_format.format,
            swapchain.present_mode
        );
        Ok(swapchain)
    }

    /// Query the window size at every recreation.
    pub fn with_extent_provider(
        mut self,
        provider: impl Fn() -> vk::Extent2D + Send + 'static,
    ) -> Self {
        self.extent_provider = Some(Box::new(provider));
        self
    }

    /// Size to ask for at the next recreation when no provider is set.
    pub fn set_requested_extent(&mut self, extent: vk::Extent2D) {
        self.requested_extent = extent;
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// (Re)create the swapchain, views and framebuffers, retiring the
    /// current swapchain if there is one.
    fn build(&mut self) -> Result<(), GraphicsError> {
        let capabilities = unsafe {
            self.backend
                .surface_loader()
                .get_physical_device_surface_capabilities(
                    self.backend.physical_device(),
                    self.surface,
                )
        }
        .map_err(|e| GraphicsError::from_vk("vkGetPhysicalDeviceSurfaceCapabilitiesKHR", e))?;

        if let Some(provider) = &self.extent_provider {
            self.requested_extent = provider();
        }
        let extent = choose_extent(&capabilities, self.requested_extent);
        let image_count = choose_image_count(&capabilities);

        let families = self.backend.queue_families();
        let family_indices = [families.graphics, families.present.unwrap_or(families.graphics)];
        let concurrent = family_indices[0] != family_indices[1];

        let mut create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(self.surface_format.format)
            .image_color_space(self.surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.present_mode)
            .clipped(true)
            .old_swapchain(self.handle);
        create_info = if concurrent {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let backend = Arc::clone(&self.backend);
        let loader = backend.swapchain_loader()?;
        let handle = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(|e| GraphicsError::from_vk("vkCreateSwapchainKHR", e))?;

        self.destroy_image_resources();
        if self.handle != vk::SwapchainKHR::null() {
            unsafe { loader.destroy_swapchain(self.handle, None) };
        }
        self.handle = handle;
        self.extent = extent;

        self.images = unsafe { loader.get_swapchain_images(handle) }
            .map_err(|e| GraphicsError::from_vk("vkGetSwapchainImagesKHR", e))?;
        for &image in &self.images {
            let view = create_color_view(backend.device(), image, self.surface_format.format)?;
            self.image_views.push(view);
        }
        for &view in &self.image_views {
            let attachments = [view];
            let info = vk::FramebufferCreateInfo::default()
                .render_pass(self.render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            let framebuffer = unsafe { backend.device().create_framebuffer(&info, None) }
                .map_err(|e| GraphicsError::from_vk("vkCreateFramebuffer", e))?;
            self.framebuffers.push(framebuffer);
        }
        Ok(())
    }

    fn destroy_image_resources(&mut self) {
        let device = self.backend.device();
        unsafe {
            for framebuffer in self.framebuffers.drain(..) {
                device.destroy_framebuffer(framebuffer, None);
            }
            for view in self.image_views.drain(..) {
                device.destroy_image_view(view, None);
            }
        }
        self.images.clear();
    }
}

impl Swapchain for VulkanSwapchain {
    fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.surface_format
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    fn recreate_swapchain(&mut self) -> Result<(), GraphicsError> {
        // Framebuffers and views may still be used by frames in flight.
        self.backend.wait_idle()?;
        self.build()?;
        log::debug!(
            "Recreated swapchain: {}x{}, {} images",
            self.extent.width,
            self.extent.height,
            self.images.len()
        );
        Ok(())
    }
}

impl RenderTarget for VulkanSwapchain {
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

impl std::fmt::Debug for VulkanSwapchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanSwapchain")
            .field("handle", &self.handle)
            .field("format", &self.surface_format.format)
            .field("extent", &self.extent)
            .field("images", &self.images.len())
            .finish()
    }
}

impl Drop for VulkanSwapchain {
    fn drop(&mut self) {
        if let Err(e) = self.backend.wait_idle() {
            log::error!("Failed to wait for device idle before swapchain teardown: {}", e);
        }
        self.destroy_image_resources();
        unsafe {
            self.backend
                .device()
                .destroy_render_pass(self.render_pass, None);
            if self.handle != vk::SwapchainKHR::null() {
                if let Ok(loader) = self.backend.swapchain_loader() {
                    loader.destroy_swapchain(self.handle, None);
                }
            }
        }
    }
}

fn choose_surface_format(
    backend: &VulkanBackend,
    surface: vk::SurfaceKHR,
) -> Result<vk::SurfaceFormatKHR, GraphicsError> {
    let formats = unsafe {
        backend
            .surface_loader()
            .get_physical_device_surface_formats(backend.physical_device(), surface)
    }
    .map_err(|e| GraphicsError::from_vk("vkGetPhysicalDeviceSurfaceFormatsKHR", e))?;

    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
        .ok_or_else(|| {
            GraphicsError::InitializationFailed("Surface reports no formats".to_string())
        })
}

fn choose_present_mode(
    backend: &VulkanBackend,
    surface: vk::SurfaceKHR,
) -> Result<vk::PresentModeKHR, GraphicsError> {
    let modes = unsafe {
        backend
            .surface_loader()
            .get_physical_device_surface_present_modes(backend.physical_device(), surface)
    }
    .map_err(|e| GraphicsError::from_vk("vkGetPhysicalDeviceSurfacePresentModesKHR", e))?;

    let wanted = convert_present_mode(backend.config().present_mode);
    if modes.contains(&wanted) {
        Ok(wanted)
    } else {
        log::warn!("Present mode {:?} unavailable, using FIFO", wanted);
        Ok(vk::PresentModeKHR::FIFO)
    }
}

fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    requested: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: requested.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: requested.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One more than the minimum, to avoid waiting on the driver.
fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        wanted.min(capabilities.max_image_count)
    } else {
        wanted
    }
}

fn create_color_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
) -> Result<vk::ImageView, GraphicsError> {
    let info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping::default())
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });
    unsafe { device.create_image_view(&info, None) }
        .map_err(|e| GraphicsError::from_vk("vkCreateImageView", e))
}

fn create_render_pass(
    device: &ash::Device,
    format: vk::Format,
) -> Result<vk::RenderPass, GraphicsError> {
    let attachments = [vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)];

    let color_refs = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let subpasses = [vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)];

    // Wait for the acquire semaphore's stage before writing the attachment.
    let dependencies = [vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        dependency_flags: vk::DependencyFlags::empty(),
    }];

    let info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);
    unsafe { device.create_render_pass(&info, None) }
        .map_err(|e| GraphicsError::from_vk("vkCreateRenderPass", e))
}
