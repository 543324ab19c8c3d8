//! GPU buffer resource.

use ash::vk;

use crate::backend::{Allocation, BufferDesc, MappedPtr, MemoryLocation};
use crate::device::DeviceContext;
use crate::error::GraphicsError;

use super::transfer;

/// A GPU buffer and its memory.
///
/// Handles are obtained empty from [`DeviceContext::create_buffer_handle`]
/// and populated by one of the `create_*` methods. Host-visible buffers stay
/// persistently mapped for their whole lifetime.
///
/// # Example
///
/// ```ignore
/// let mut vertices = ctx.create_buffer_handle();
/// vertices.create_staged_buffer_from_slice(vk::BufferUsageFlags::VERTEX_BUFFER, &TRIANGLE)?;
/// ```
pub struct BufferHandle<'d> {
    ctx: &'d DeviceContext,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
}

impl<'d> BufferHandle<'d> {
    /// Create an empty handle.
    pub fn new(ctx: &'d DeviceContext) -> Self {
        Self {
            ctx,
            buffer: vk::Buffer::null(),
            allocation: None,
            usage: vk::BufferUsageFlags::empty(),
            location: MemoryLocation::GpuOnly,
        }
    }

    /// Create a populated handle in one step. Used for internal scratch
    /// buffers, which never exist in the empty state.
    fn with_desc(ctx: &'d DeviceContext, desc: &BufferDesc) -> Result<Self, GraphicsError> {
        let (buffer, allocation) = ctx.backend().create_buffer(desc)?;
        Ok(Self {
            ctx,
            buffer,
            allocation: Some(allocation),
            usage: desc.usage,
            location: desc.location,
        })
    }

    /// Mapped staging buffer already holding `data`.
    pub(super) fn staging_from(ctx: &'d DeviceContext, data: &[u8]) -> Result<Self, GraphicsError> {
        let mut staging = Self::with_desc(
            ctx,
            &BufferDesc::new(
                data.len() as u64,
                vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryLocation::CpuToGpu,
            )
            .with_label("staging buffer"),
        )?;
        staging.write_mapped(0, data)?;
        Ok(staging)
    }

    /// Create the buffer described by `desc`.
    pub fn create_buffer(&mut self, desc: &BufferDesc) -> Result<(), GraphicsError> {
        if self.is_created() {
            return Err(GraphicsError::AlreadyCreated("buffer"));
        }
        let (buffer, allocation) = self.ctx.backend().create_buffer(desc)?;
        log::trace!(
            "Created buffer {:?} ({} bytes, {:?}, {:?})",
            buffer,
            desc.size,
            desc.usage,
            desc.location
        );
        self.buffer = buffer;
        self.allocation = Some(allocation);
        self.usage = desc.usage;
        self.location = desc.location;
        Ok(())
    }

    /// Host-writable uniform buffer.
    pub fn create_uniform_buffer(&mut self, size: u64) -> Result<(), GraphicsError> {
        self.create_buffer(
            &BufferDesc::new(
                size,
                vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                MemoryLocation::CpuToGpu,
            )
            .with_label("uniform buffer"),
        )
    }

    /// Host-visible, persistently mapped buffer.
    pub fn create_cpu_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> Result<(), GraphicsError> {
        self.create_buffer(&BufferDesc::new(size, usage, MemoryLocation::CpuToGpu))
    }

    /// Device-local buffer. Fill it with a transfer or a staged upload.
    pub fn create_gpu_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> Result<(), GraphicsError> {
        self.create_buffer(&BufferDesc::new(size, usage, MemoryLocation::GpuOnly))
    }

    /// Mapped transfer source.
    pub fn create_staging_buffer(&mut self, size: u64) -> Result<(), GraphicsError> {
        self.create_buffer(
            &BufferDesc::new(
                size,
                vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryLocation::CpuToGpu,
            )
            .with_label("staging buffer"),
        )
    }

    /// Mapped transfer destination for reading results back on the host.
    pub fn create_readback_buffer(&mut self, size: u64) -> Result<(), GraphicsError> {
        self.create_buffer(&readback_desc(size))
    }

    /// Create a device-local buffer holding `data`.
    ///
    /// `data` is copied into a temporary staging buffer and transferred with
    /// a one-shot submission; this call blocks until the copy has executed.
    /// `TRANSFER_DST` is added to `usage`.
    ///
    /// If the upload fence times out, the device may still be copying, so
    /// the destination and the staging buffer are both leaked and this
    /// handle is left empty. On any other failure the destination is
    /// destroyed and the handle is likewise left empty.
    pub fn create_staged_buffer(
        &mut self,
        usage: vk::BufferUsageFlags,
        data: &[u8],
    ) -> Result<(), GraphicsError> {
        if self.is_created() {
            return Err(GraphicsError::AlreadyCreated("buffer"));
        }
        if data.is_empty() {
            return Err(GraphicsError::InvalidParameter(
                "staged upload of an empty payload".to_string(),
            ));
        }
        let size = data.len() as u64;

        let staging = Self::staging_from(self.ctx, data)?;

        self.create_buffer(
            &BufferDesc::new(
                size,
                usage | vk::BufferUsageFlags::TRANSFER_DST,
                MemoryLocation::GpuOnly,
            )
            .with_label("staged buffer"),
        )?;

        let this = &*self;
        let uploaded = transfer::submit_one_shot(self.ctx, "staged buffer upload", |commands| {
            commands.copy_buffer_to_buffer(&staging, 0, this, 0, size)
        });

        match uploaded {
            Ok(()) => {
                log::debug!("Uploaded {} bytes into buffer {:?}", size, self.buffer);
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

    /// [`create_staged_buffer`](Self::create_staged_buffer) from a slice of
    /// plain-old-data values.
    pub fn create_staged_buffer_from_slice<T: bytemuck::Pod>(
        &mut self,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<(), GraphicsError> {
        self.create_staged_buffer(usage, bytemuck::cast_slice(data))
    }

    /// Copy `data` into the mapped memory at `offset`.
    pub fn write_mapped(&mut self, offset: u64, data: &[u8]) -> Result<(), GraphicsError> {
        let ptr = self.mapped_range(offset, data.len() as u64)?;
        // SAFETY: the range lies inside the live mapping and `&mut self`
        // excludes host-side aliasing.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
        }
        Ok(())
    }

    /// Copy `len` bytes out of the mapped memory at `offset`.
    pub fn read_mapped(&self, offset: u64, len: u64) -> Result<Vec<u8>, GraphicsError> {
        let ptr = self.mapped_range(offset, len)?;
        let len = usize::try_from(len).map_err(|_| GraphicsError::OutOfMemory)?;
        let mut out = vec![0u8; len];
        // SAFETY: the range lies inside the live mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr as *const u8, out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    /// Read the whole buffer on the host.
    ///
    /// Mapped buffers are read directly. Device-local buffers need
    /// `TRANSFER_SRC` usage and are copied through a temporary readback
    /// buffer with a blocking one-shot submission.
    pub fn read_back(&self) -> Result<Vec<u8>, GraphicsError> {
        if !self.is_created() {
            return Err(GraphicsError::InvalidParameter(
                "read back of a buffer that was never created".to_string(),
            ));
        }
        if self.mapped_ptr().is_some() {
            return self.read_mapped(0, self.size());
        }
        if !self.usage.contains(vk::BufferUsageFlags::TRANSFER_SRC) {
            return Err(GraphicsError::InvalidParameter(format!(
                "read back needs TRANSFER_SRC usage, buffer has {:?}",
                self.usage
            )));
        }

        let size = self.size();
        let readback = Self::with_desc(self.ctx, &readback_desc(size))?;
        let copied = transfer::submit_one_shot(self.ctx, "buffer read back", |commands| {
            commands.copy_buffer_to_buffer(self, 0, &readback, 0, size)
        });
        match copied {
            Ok(()) => readback.read_mapped(0, size),
            Err(e) if e.is_timeout() => {
                readback.leak();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    /// Size in bytes, 0 while the handle is empty.
    pub fn size(&self) -> u64 {
        self.allocation.as_ref().map_or(0, Allocation::size)
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    pub fn is_created(&self) -> bool {
        self.allocation.is_some()
    }

    /// Start of the persistent mapping, if the buffer is host-visible.
    pub fn mapped_ptr(&self) -> Option<MappedPtr> {
        self.allocation.as_ref().and_then(Allocation::mapped_ptr)
    }

    fn mapped_range(&self, offset: u64, len: u64) -> Result<*mut u8, GraphicsError> {
        let mapped = self.mapped_ptr().ok_or_else(|| {
            GraphicsError::InvalidParameter(format!(
                "buffer {:?} is not host visible ({:?})",
                self.buffer, self.location
            ))
        })?;
        match offset.checked_add(len) {
            Some(end) if end <= self.size() => {}
            _ => {
                return Err(GraphicsError::InvalidParameter(format!(
                    "mapped range {offset}..{offset}+{len} exceeds {} bytes",
                    self.size()
                )))
            }
        }
        let offset = usize::try_from(offset).map_err(|_| GraphicsError::OutOfMemory)?;
        // SAFETY: offset was checked against the allocation size.
        Ok(unsafe { mapped.as_ptr().add(offset) })
    }

    /// Give up ownership without destroying the buffer.
    pub(super) fn leak(mut self) -> vk::Buffer {
        let buffer = self.buffer;
        self.abandon();
        std::mem::forget(self);
        buffer
    }

    /// Forget the buffer and its memory, leaving the handle empty.
    fn abandon(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            log::error!(
                "Leaking buffer {:?} ({} bytes) still in use by the device",
                self.buffer,
                allocation.size()
            );
            std::mem::forget(allocation);
        }
        self.buffer = vk::Buffer::null();
        self.usage = vk::BufferUsageFlags::empty();
    }

    fn release(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            // SAFETY: the buffer is owned by this handle and callers keep it
            // alive until submissions referencing it complete.
            unsafe { self.ctx.backend().destroy_buffer(self.buffer, allocation) };
            self.buffer = vk::Buffer::null();
        }
    }
}

fn readback_desc(size: u64) -> BufferDesc {
    BufferDesc::new(
        size,
        vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::GpuToCpu,
    )
    .with_label("readback buffer")
}

impl std::fmt::Debug for BufferHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHandle")
            .field("buffer", &self.buffer)
            .field("size", &self.size())
            .field("usage", &self.usage)
            .field("location", &self.location)
            .finish()
    }
}

impl Drop for BufferHandle<'_> {
    fn drop(&mut self) {
        if !self.is_created() {
            log::warn!("Dropping a buffer handle that was never created");
            return;
        }
        self.release();
    }
}

static_assertions::assert_impl_all!(BufferHandle<'static>: Send, Sync);

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::backend::dummy::{BackendCall, FailPoint};
    use crate::backend::DummyBackend;
    use crate::config::GraphicsConfig;

    fn context() -> (DeviceContext, Arc<DummyBackend>) {
        let backend = Arc::new(DummyBackend::new());
        (
            DeviceContext::new(backend.clone(), GraphicsConfig::default()),
            backend,
        )
    }

    #[test]
    fn test_empty_handle() {
        let (ctx, _) = context();
        let buffer = ctx.create_buffer_handle();
        assert!(!buffer.is_created());
        assert_eq!(buffer.size(), 0);
        assert_eq!(buffer.buffer(), vk::Buffer::null());
        assert!(buffer.mapped_ptr().is_none());
    }

    #[test]
    fn test_second_create_is_rejected() {
        let (ctx, backend) = context();
        let mut buffer = ctx.create_buffer_handle();
        buffer.create_uniform_buffer(64).unwrap();
        assert_eq!(
            buffer.create_uniform_buffer(64),
            Err(GraphicsError::AlreadyCreated("buffer"))
        );
        assert_eq!(backend.live_allocations(), 1);
    }

    #[test]
    fn test_cpu_buffer_mapped_roundtrip() {
        let (ctx, _) = context();
        let mut buffer = ctx.create_buffer_handle();
        buffer
            .create_cpu_buffer(8, vk::BufferUsageFlags::VERTEX_BUFFER)
            .unwrap();
        buffer.write_mapped(2, &[1, 2, 3]).unwrap();
        assert_eq!(buffer.read_mapped(0, 6).unwrap(), [0, 0, 1, 2, 3, 0]);
        assert_eq!(buffer.read_back().unwrap().len(), 8);
    }

    #[test]
    fn test_mapped_write_out_of_range() {
        let (ctx, _) = context();
        let mut buffer = ctx.create_buffer_handle();
        buffer.create_staging_buffer(4).unwrap();
        assert!(matches!(
            buffer.write_mapped(2, &[0; 3]),
            Err(GraphicsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_gpu_buffer_is_not_mapped() {
        let (ctx, _) = context();
        let mut buffer = ctx.create_buffer_handle();
        buffer
            .create_gpu_buffer(16, vk::BufferUsageFlags::STORAGE_BUFFER)
            .unwrap();
        assert!(buffer.mapped_ptr().is_none());
        assert!(buffer.read_mapped(0, 4).is_err());
        // No TRANSFER_SRC usage.
        assert!(buffer.read_back().is_err());
    }

    #[test]
    fn test_staged_buffer_contents() {
        let (ctx, backend) = context();
        let mut buffer = ctx.create_buffer_handle();
        let data: Vec<u8> = (0..32).collect();
        buffer
            .create_staged_buffer(
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
                &data,
            )
            .unwrap();

        assert!(buffer
            .usage()
            .contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert_eq!(buffer.location(), MemoryLocation::GpuOnly);
        assert_eq!(backend.buffer_contents(buffer.buffer()).unwrap(), data);
        assert_eq!(buffer.read_back().unwrap(), data);
        // Staging and readback buffers are gone.
        assert_eq!(backend.live_allocations(), 1);
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn test_staged_buffer_from_slice() {
        let (ctx, backend) = context();
        let mut buffer = ctx.create_buffer_handle();
        let indices: [u16; 3] = [0, 1, 2];
        buffer
            .create_staged_buffer_from_slice(vk::BufferUsageFlags::INDEX_BUFFER, &indices)
            .unwrap();
        assert_eq!(buffer.size(), 6);
        assert_eq!(
            backend.buffer_contents(buffer.buffer()).unwrap(),
            bytemuck::cast_slice::<u16, u8>(&indices)
        );
    }

    #[test]
    fn test_staged_upload_failure_leaves_handle_empty() {
        let (ctx, backend) = context();
        let mut buffer = ctx.create_buffer_handle();
        backend.fail_next(FailPoint::QueueSubmit, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);

        assert_eq!(
            buffer.create_staged_buffer(vk::BufferUsageFlags::VERTEX_BUFFER, &[1, 2, 3, 4]),
            Err(GraphicsError::OutOfMemory)
        );
        assert!(!buffer.is_created());
        assert_eq!(backend.live_allocations(), 0);
        drop(buffer);
    }

    #[test]
    fn test_staged_upload_timeout_leaks_staging() {
        let backend = Arc::new(DummyBackend::new());
        let ctx = DeviceContext::new(
            backend.clone(),
            GraphicsConfig::default().with_upload_fence_timeout(Some(Duration::from_millis(1))),
        );
        backend.set_hold_fences(true);

        let mut buffer = ctx.create_buffer_handle();
        let err = buffer
            .create_staged_buffer(vk::BufferUsageFlags::VERTEX_BUFFER, &[7; 16])
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(!buffer.is_created());
        assert_eq!(buffer.buffer(), vk::Buffer::null());
        // Destination and staging buffer are both leaked, not freed.
        assert_eq!(backend.live_allocations(), 2);
        assert!(!backend
            .calls()
            .iter()
            .any(|c| matches!(c, BackendCall::DestroyBuffer(_))));
    }

    #[test]
    fn test_buffer_debug() {
        let (ctx, _) = context();
        let mut buffer = ctx.create_buffer_handle();
        buffer.create_uniform_buffer(1024).unwrap();
        let debug = format!("{:?}", buffer);
        assert!(debug.contains("BufferHandle"));
        assert!(debug.contains("1024"));
    }
}
