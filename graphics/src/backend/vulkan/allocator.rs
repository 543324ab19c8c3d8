//! GPU memory allocator integration using gpu-allocator.

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::AllocationError;

use crate::backend::MemoryLocation;
use crate::error::GraphicsError;

use super::conversion::convert_memory_location;

/// Create a memory allocator for the Vulkan device.
pub fn create_allocator(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
) -> Result<Allocator, GraphicsError> {
    Allocator::new(&AllocatorCreateDesc {
        instance: instance.clone(),
        device,
        physical_device,
        debug_settings: Default::default(),
        buffer_device_address: false,
        allocation_sizes: gpu_allocator::AllocationSizes::default(),
    })
    .map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create memory allocator: {}", e))
    })
}

/// Allocate memory satisfying `requirements`.
///
/// Host-visible locations come back persistently mapped.
pub fn allocate(
    allocator: &mut Allocator,
    name: &str,
    requirements: vk::MemoryRequirements,
    location: MemoryLocation,
    linear: bool,
) -> Result<Allocation, GraphicsError> {
    allocator
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: convert_memory_location(location),
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .map_err(|e| match e {
            AllocationError::OutOfMemory => GraphicsError::OutOfMemory,
            other => GraphicsError::ResourceCreationFailed(format!(
                "Failed to allocate {} bytes for {}: {}",
                requirements.size, name, other
            )),
        })
}
