//! GPU image resource.
//!
//! An [`ImageHandle`] owns an image and its memory, plus at most one view
//! and one sampler created on top of it. Sampled textures are usually built
//! with [`ImageHandle::create_image_from_pixels`] or
//! [`ImageHandle::create_image_from_file`], which run a staged upload and
//! leave the image in `SHADER_READ_ONLY_OPTIMAL`.

use std::path::Path;

use ash::vk;

use crate::backend::{Allocation, ImageDesc, ImageViewDesc, SamplerDesc};
use crate::command::ImageBarrierInfo;
use crate::device::DeviceContext;
use crate::error::GraphicsError;

use super::buffer::BufferHandle;
use super::transfer;

/// Format of images created from RGBA pixel data.
const PIXEL_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Properties an image was created with.
#[derive(Debug, Clone, Copy)]
pub struct ImageInfo {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub usage: vk::ImageUsageFlags,
}

impl Default for ImageInfo {
    fn default() -> Self {
        Self {
            image_type: vk::ImageType::TYPE_2D,
            format: vk::Format::UNDEFINED,
            extent: vk::Extent3D::default(),
            mip_levels: 0,
            array_layers: 0,
            samples: vk::SampleCountFlags::TYPE_1,
            usage: vk::ImageUsageFlags::empty(),
        }
    }
}

impl From<&ImageDesc> for ImageInfo {
    fn from(desc: &ImageDesc) -> Self {
        Self {
            image_type: desc.image_type,
            format: desc.format,
            extent: desc.extent,
            mip_levels: desc.mip_levels,
            array_layers: desc.array_layers,
            samples: desc.samples,
            usage: desc.usage,
        }
    }
}

/// A GPU image with optional view and sampler.
///
/// Obtained empty from [`DeviceContext::create_image_handle`]. Dropping the
/// handle destroys the sampler, then the view, then the image.
pub struct ImageHandle<'d> {
    ctx: &'d DeviceContext,
    image: vk::Image,
    allocation: Option<Allocation>,
    view: vk::ImageView,
    sampler: vk::Sampler,
    info: ImageInfo,
}

impl<'d> ImageHandle<'d> {
    pub fn new(ctx: &'d DeviceContext) -> Self {
        Self {
            ctx,
            image: vk::Image::null(),
            allocation: None,
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
            info: ImageInfo::default(),
        }
    }

    /// Create the image described by `desc`. Its initial layout is undefined.
    pub fn create_image(&mut self, desc: &ImageDesc) -> Result<(), GraphicsError> {
        if self.is_created() {
            return Err(GraphicsError::AlreadyCreated("image"));
        }
        if desc.mip_levels == 0 {
            return Err(GraphicsError::InvalidParameter(
                "image needs at least one mip level".to_string(),
            ));
        }
        let (image, allocation) = self.ctx.backend().create_image(desc)?;
        log::trace!(
            "Created {:?} image {:?} {}x{}x{} ({:?})",
            desc.image_type,
            image,
            desc.extent.width,
            desc.extent.height,
            desc.extent.depth,
            desc.format
        );
        self.image = image;
        self.allocation = Some(allocation);
        self.info = ImageInfo::from(desc);
        Ok(())
    }

    /// Create a sampled 2D image from tightly packed RGBA8 pixels.
    ///
    /// Blocks until the upload has executed. The image ends up in
    /// `SHADER_READ_ONLY_OPTIMAL`. Timeouts and other failures are handled
    /// as in [`BufferHandle::create_staged_buffer`]: either way the handle is
    /// left empty, and on a timeout the image memory is leaked.
    pub fn create_image_from_pixels(
        &mut self,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) -> Result<(), GraphicsError> {
        if self.is_created() {
            return Err(GraphicsError::AlreadyCreated("image"));
        }
        let expected = u64::from(width) * u64::from(height) * 4;
        if width == 0 || height == 0 || rgba.len() as u64 != expected {
            return Err(GraphicsError::InvalidParameter(format!(
                "{}x{} RGBA image needs {} bytes, got {}",
                width,
                height,
                expected,
                rgba.len()
            )));
        }

        let staging = BufferHandle::staging_from(self.ctx, rgba)?;
        self.create_image(
            &ImageDesc::texture_2d(
                width,
                height,
                PIXEL_FORMAT,
                vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::SAMPLED,
            )
            .with_label("uploaded image"),
        )?;

        let this = &*self;
        let aspect = vk::ImageAspectFlags::COLOR;
        let uploaded = transfer::submit_one_shot(self.ctx, "staged image upload", |commands| {
            commands.image_barrier(this, &ImageBarrierInfo::UNDEFINED_TO_TRANSFER_DST, aspect)?;
            commands.copy_buffer_to_image(&staging, 0, this, vk::Offset3D::default(), aspect)?;
            commands.image_barrier(this, &ImageBarrierInfo::TRANSFER_DST_TO_SHADER_READ, aspect)
        });

        match uploaded {
            Ok(()) => {
                log::debug!("Uploaded {}x{} image {:?}", width, height, self.image);
                Ok(())
            }
            Err(e) if e.is_timeout() => {
                staging.leak();
                self.abandon();
                Err(e)
            }
            Err(e) => {
                self.release();
                Err(e)
            }
        }
    }

    /// Decode an image file and upload it as an RGBA8 texture.
    pub fn create_image_from_file(&mut self, path: impl AsRef<Path>) -> Result<(), GraphicsError> {
        let path = path.as_ref();
        let decoded = ::image::open(path)
            .map_err(|e| {
                GraphicsError::ResourceCreationFailed(format!(
                    "failed to load image {}: {}",
                    path.display(),
                    e
                ))
            })?
            .to_rgba8();
        let (width, height) = decoded.dimensions();
        log::info!("Loaded {} ({}x{})", path.display(), width, height);
        self.create_image_from_pixels(width, height, decoded.as_raw())
    }

    /// Create a view covering every mip and layer of the image.
    ///
    /// The view type follows the image type and layer count, the aspect
    /// follows the format.
    pub fn create_view(&mut self) -> Result<(), GraphicsError> {
        if !self.is_created() {
            return Err(GraphicsError::InvalidParameter(
                "view of an image that was never created".to_string(),
            ));
        }
        if self.view != vk::ImageView::null() {
            return Err(GraphicsError::AlreadyCreated("image view"));
        }
        let view_type = view_type_for(self.info.image_type, self.info.array_layers)?;
        self.view = self.ctx.backend().create_image_view(&ImageViewDesc {
            image: self.image,
            view_type,
            format: self.info.format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: aspect_for_format(self.info.format),
                base_mip_level: 0,
                level_count: self.info.mip_levels,
                base_array_layer: 0,
                layer_count: self.info.array_layers,
            },
        })?;
        Ok(())
    }

    /// Create the sampler used with this image's view.
    pub fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<(), GraphicsError> {
        if !self.is_created() {
            return Err(GraphicsError::InvalidParameter(
                "sampler for an image that was never created".to_string(),
            ));
        }
        if self.sampler != vk::Sampler::null() {
            return Err(GraphicsError::AlreadyCreated("sampler"));
        }
        self.sampler = self.ctx.backend().create_sampler(desc)?;
        Ok(())
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    /// Null until [`create_view`](Self::create_view) succeeds.
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    pub fn info(&self) -> &ImageInfo {
        &self.info
    }

    pub fn format(&self) -> vk::Format {
        self.info.format
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.info.extent
    }

    pub fn mip_levels(&self) -> u32 {
        self.info.mip_levels
    }

    pub fn array_layers(&self) -> u32 {
        self.info.array_layers
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        self.info.samples
    }

    pub fn image_type(&self) -> vk::ImageType {
        self.info.image_type
    }

    pub fn is_created(&self) -> bool {
        self.allocation.is_some()
    }

    /// Forget the image and its memory, leaving the handle empty. Only valid
    /// before a view or sampler exists.
    fn abandon(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            log::error!(
                "Leaking image {:?} ({} bytes) still in use by the device",
                self.image,
                allocation.size()
            );
            std::mem::forget(allocation);
        }
        self.image = vk::Image::null();
        self.info = ImageInfo::default();
    }

    fn release(&mut self) {
        let backend = self.ctx.backend();
        // SAFETY: all three objects are owned by this handle and callers
        // keep it alive until submissions referencing them complete.
        unsafe {
            if self.sampler != vk::Sampler::null() {
                backend.destroy_sampler(self.sampler);
                self.sampler = vk::Sampler::null();
            }
            if self.view != vk::ImageView::null() {
                backend.destroy_image_view(self.view);
                self.view = vk::ImageView::null();
            }
            if let Some(allocation) = self.allocation.take() {
                backend.destroy_image(self.image, allocation);
                self.image = vk::Image::null();
            }
        }
    }
}

impl std::fmt::Debug for ImageHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageHandle")
            .field("image", &self.image)
            .field("view", &self.view)
            .field("sampler", &self.sampler)
            .field("info", &self.info)
            .finish()
    }
}

impl Drop for ImageHandle<'_> {
    fn drop(&mut self) {
        if !self.is_created() {
            log::warn!("Dropping an image handle that was never created");
        }
        self.release();
    }
}

static_assertions::assert_impl_all!(ImageHandle<'static>: Send, Sync);

fn view_type_for(
    image_type: vk::ImageType,
    array_layers: u32,
) -> Result<vk::ImageViewType, GraphicsError> {
    let layered = array_layers > 1;
    match image_type {
        vk::ImageType::TYPE_1D if layered => Ok(vk::ImageViewType::TYPE_1D_ARRAY),
        vk::ImageType::TYPE_1D => Ok(vk::ImageViewType::TYPE_1D),
        vk::ImageType::TYPE_2D if layered => Ok(vk::ImageViewType::TYPE_2D_ARRAY),
        vk::ImageType::TYPE_2D => Ok(vk::ImageViewType::TYPE_2D),
        vk::ImageType::TYPE_3D => Ok(vk::ImageViewType::TYPE_3D),
        other => Err(GraphicsError::FeatureNotSupported(format!(
            "no view type for image type {other:?}"
        ))),
    }
}

/// Aspects an image of `format` has.
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Bytes per texel of uncompressed `format`, `None` for formats this crate
/// does not upload.
pub fn format_texel_size(format: vk::Format) -> Option<u32> {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_SRGB | vk::Format::R8_UINT | vk::Format::S8_UINT => {
            Some(1)
        }
        vk::Format::R8G8_UNORM
        | vk::Format::R8G8_SRGB
        | vk::Format::R16_SFLOAT
        | vk::Format::R16_UNORM
        | vk::Format::R16_UINT
        | vk::Format::D16_UNORM => Some(2),
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::R8G8B8A8_UINT
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::D32_SFLOAT
        | vk::Format::X8_D24_UNORM_PACK32
        | vk::Format::D24_UNORM_S8_UINT => Some(4),
        vk::Format::R16G16B16A16_SFLOAT
        | vk::Format::R16G16B16A16_UNORM
        | vk::Format::R32G32_SFLOAT => Some(8),
        vk::Format::R32G32B32_SFLOAT => Some(12),
        vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT => Some(16),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::dummy::{BackendCall, RecordedCommand};
    use crate::backend::DummyBackend;
    use crate::config::GraphicsConfig;

    fn context() -> (DeviceContext, Arc<DummyBackend>) {
        let backend = Arc::new(DummyBackend::new());
        (
            DeviceContext::new(backend.clone(), GraphicsConfig::default()),
            backend,
        )
    }

    fn checker(width: u32, height: u32) -> Vec<u8> {
        (0..width * height)
            .flat_map(|i| {
                let v = if i % 2 == 0 { 255 } else { 0 };
                [v, v, v, 255]
            })
            .collect()
    }

    #[test]
    fn test_texel_sizes() {
        assert_eq!(format_texel_size(vk::Format::R8G8B8A8_SRGB), Some(4));
        assert_eq!(format_texel_size(vk::Format::R8_UNORM), Some(1));
        assert_eq!(format_texel_size(vk::Format::R32G32B32A32_SFLOAT), Some(16));
        assert_eq!(format_texel_size(vk::Format::BC1_RGB_UNORM_BLOCK), None);
    }

    #[test]
    fn test_aspect_for_format() {
        assert_eq!(
            aspect_for_format(vk::Format::B8G8R8A8_SRGB),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(
            aspect_for_format(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn test_view_types() {
        assert_eq!(
            view_type_for(vk::ImageType::TYPE_2D, 1).unwrap(),
            vk::ImageViewType::TYPE_2D
        );
        assert_eq!(
            view_type_for(vk::ImageType::TYPE_2D, 6).unwrap(),
            vk::ImageViewType::TYPE_2D_ARRAY
        );
        assert_eq!(
            view_type_for(vk::ImageType::TYPE_1D, 4).unwrap(),
            vk::ImageViewType::TYPE_1D_ARRAY
        );
        assert_eq!(
            view_type_for(vk::ImageType::TYPE_3D, 1).unwrap(),
            vk::ImageViewType::TYPE_3D
        );
        assert!(matches!(
            view_type_for(vk::ImageType::from_raw(42), 1),
            Err(GraphicsError::FeatureNotSupported(_))
        ));
    }

    #[test]
    fn test_image_from_pixels() {
        let (ctx, backend) = context();
        let pixels = checker(4, 2);
        let mut image = ctx.create_image_handle();
        image.create_image_from_pixels(4, 2, &pixels).unwrap();

        assert_eq!(image.format(), vk::Format::R8G8B8A8_SRGB);
        assert_eq!(image.extent().width, 4);
        assert_eq!(
            backend.image_layout(image.image()),
            Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        );
        assert_eq!(backend.image_contents(image.image()).unwrap(), pixels);
        assert_eq!(backend.live_allocations(), 1);
        assert!(backend.validation_errors().is_empty());

        let commands = backend.submitted_commands();
        assert!(matches!(commands[0], RecordedCommand::ImageBarrier(_)));
        assert!(matches!(commands[1], RecordedCommand::CopyBufferToImage { .. }));
        assert!(matches!(commands[2], RecordedCommand::ImageBarrier(_)));
    }

    #[test]
    fn test_pixel_length_mismatch() {
        let (ctx, backend) = context();
        let mut image = ctx.create_image_handle();
        assert!(matches!(
            image.create_image_from_pixels(4, 4, &[0; 12]),
            Err(GraphicsError::InvalidParameter(_))
        ));
        assert_eq!(backend.live_allocations(), 0);
    }

    #[test]
    fn test_view_and_sampler_lifecycle() {
        let (ctx, backend) = context();
        let mut image = ctx.create_image_handle();
        image
            .create_image(&ImageDesc::texture_2d(
                8,
                8,
                vk::Format::D32_SFLOAT,
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            ))
            .unwrap();
        image.create_view().unwrap();
        assert_ne!(image.view(), vk::ImageView::null());
        assert_eq!(
            image.create_view(),
            Err(GraphicsError::AlreadyCreated("image view"))
        );
        image.create_sampler(&SamplerDesc::nearest_clamped()).unwrap();
        assert_eq!(
            image.create_sampler(&SamplerDesc::default()),
            Err(GraphicsError::AlreadyCreated("sampler"))
        );

        let handle = image.image();
        drop(image);
        assert!(backend
            .calls()
            .iter()
            .any(|c| matches!(c, BackendCall::DestroyImage(i) if *i == handle)));
        assert_eq!(backend.live_allocations(), 0);
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn test_view_of_empty_handle() {
        let (ctx, _) = context();
        let mut image = ctx.create_image_handle();
        assert!(image.create_view().is_err());
    }

    #[test]
    fn test_sampler_of_empty_handle() {
        let (ctx, backend) = context();
        let mut image = ctx.create_image_handle();
        assert!(matches!(
            image.create_sampler(&SamplerDesc::nearest_clamped()),
            Err(GraphicsError::InvalidParameter(_))
        ));
        assert_eq!(image.sampler(), vk::Sampler::null());
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn test_upload_timeout_leaves_handle_empty() {
        let backend = Arc::new(DummyBackend::new());
        let ctx = DeviceContext::new(
            backend.clone(),
            GraphicsConfig::default()
                .with_upload_fence_timeout(Some(std::time::Duration::from_millis(1))),
        );
        backend.set_hold_fences(true);

        let mut image = ctx.create_image_handle();
        let err = image.create_image_from_pixels(2, 2, &checker(2, 2)).unwrap_err();
        assert!(err.is_timeout());
        assert!(!image.is_created());
        assert_eq!(image.image(), vk::Image::null());
        assert_eq!(backend.live_allocations(), 2);
        assert!(!backend
            .calls()
            .iter()
            .any(|c| matches!(c, BackendCall::DestroyImage(_))));
    }

    #[test]
    fn test_missing_file() {
        let (ctx, _) = context();
        let mut image = ctx.create_image_handle();
        assert!(matches!(
            image.create_image_from_file("does/not/exist.png"),
            Err(GraphicsError::ResourceCreationFailed(_))
        ));
    }
}
