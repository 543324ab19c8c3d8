//! Type conversions between Tessera types and Vulkan / gpu-allocator types.

use std::time::Duration;

use ash::vk;

use crate::backend::{MemoryLocation, SamplerDesc};
use crate::config::PresentMode;

/// Convert a memory location to the allocator's location.
pub fn convert_memory_location(location: MemoryLocation) -> gpu_allocator::MemoryLocation {
    match location {
        MemoryLocation::GpuOnly => gpu_allocator::MemoryLocation::GpuOnly,
        MemoryLocation::CpuToGpu => gpu_allocator::MemoryLocation::CpuToGpu,
        MemoryLocation::GpuToCpu => gpu_allocator::MemoryLocation::GpuToCpu,
    }
}

/// Convert a present mode to Vulkan.
pub fn convert_present_mode(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        PresentMode::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
    }
}

/// Fence wait timeout in nanoseconds. `None` waits forever.
pub fn convert_timeout(timeout: Option<Duration>) -> u64 {
    timeout.map_or(u64::MAX, |t| {
        u64::try_from(t.as_nanos()).unwrap_or(u64::MAX)
    })
}

/// Build sampler create info.
///
/// Anisotropy is enabled only when both the descriptor asks for it and the
/// device supports it, and is clamped to the device limit.
pub fn convert_sampler_desc(
    desc: &SamplerDesc,
    device_max_anisotropy: Option<f32>,
) -> vk::SamplerCreateInfo<'static> {
    let anisotropy = match (desc.max_anisotropy, device_max_anisotropy) {
        (Some(requested), Some(limit)) if requested > 1.0 => Some(requested.min(limit)),
        _ => None,
    };

    vk::SamplerCreateInfo::default()
        .mag_filter(desc.mag_filter)
        .min_filter(desc.min_filter)
        .mipmap_mode(desc.mipmap_mode)
        .address_mode_u(desc.address_mode)
        .address_mode_v(desc.address_mode)
        .address_mode_w(desc.address_mode)
        .anisotropy_enable(anisotropy.is_some())
        .max_anisotropy(anisotropy.unwrap_or(1.0))
        .compare_enable(false)
        .min_lod(0.0)
        .max_lod(desc.max_lod)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_present_modes() {
        assert_eq!(convert_present_mode(PresentMode::Fifo), vk::PresentModeKHR::FIFO);
        assert_eq!(
            convert_present_mode(PresentMode::Mailbox),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn test_timeouts() {
        assert_eq!(convert_timeout(None), u64::MAX);
        assert_eq!(convert_timeout(Some(Duration::from_millis(3))), 3_000_000);
        assert_eq!(convert_timeout(Some(Duration::MAX)), u64::MAX);
    }

    #[test]
    fn test_sampler_anisotropy_clamped() {
        let desc = SamplerDesc::default().with_anisotropy(16.0);
        let info = convert_sampler_desc(&desc, Some(8.0));
        assert_eq!(info.anisotropy_enable, vk::TRUE);
        assert_eq!(info.max_anisotropy, 8.0);

        let info = convert_sampler_desc(&desc, None);
        assert_eq!(info.anisotropy_enable, vk::FALSE);
    }

    #[test]
    fn test_sampler_addressing() {
        let info = convert_sampler_desc(&SamplerDesc::nearest_clamped(), Some(16.0));
        assert_eq!(info.mag_filter, vk::Filter::NEAREST);
        assert_eq!(info.address_mode_w, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(info.anisotropy_enable, vk::FALSE);
    }
}
