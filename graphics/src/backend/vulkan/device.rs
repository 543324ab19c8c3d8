//! Vulkan physical and logical device management.

use std::ffi::CStr;

use ash::vk;

use crate::backend::QueueFamilyIndices;
use crate::error::GraphicsError;

/// Surface a device must be able to present to.
#[derive(Clone, Copy)]
pub struct SurfaceQuery<'a> {
    pub loader: &'a ash::khr::surface::Instance,
    pub surface: vk::SurfaceKHR,
}

/// The physical device picked for rendering.
#[derive(Debug, Clone)]
pub struct DeviceSelection {
    pub physical_device: vk::PhysicalDevice,
    pub name: String,
    pub queue_families: QueueFamilyIndices,
    /// `Some(limit)` when sampler anisotropy is supported.
    pub max_anisotropy: Option<f32>,
}

/// Select the best physical device.
///
/// A candidate needs a graphics queue family and, when `surface` is given,
/// a family that can present to it plus the swapchain extension.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface: Option<SurfaceQuery<'_>>,
    prefer_discrete: bool,
) -> Result<DeviceSelection, GraphicsError> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        GraphicsError::InitializationFailed(format!(
            "Failed to enumerate physical devices: {:?}",
            e
        ))
    })?;

    if devices.is_empty() {
        return Err(GraphicsError::InitializationFailed(
            "No Vulkan-capable GPU found".to_string(),
        ));
    }

    let mut best: Option<(u32, DeviceSelection)> = None;
    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let name = properties
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "<unnamed>".to_string());

        let Some(queue_families) = find_queue_families(instance, device, surface) else {
            log::debug!("Skipping {}: no suitable queue families", name);
            continue;
        };
        if surface.is_some() && !supports_extension(instance, device, ash::khr::swapchain::NAME) {
            log::debug!("Skipping {}: no swapchain support", name);
            continue;
        }

        let features = unsafe { instance.get_physical_device_features(device) };
        let max_anisotropy = (features.sampler_anisotropy == vk::TRUE)
            .then_some(properties.limits.max_sampler_anisotropy);

        let score = score_device(&properties, prefer_discrete);
        log::info!(
            "Found GPU: {} (type: {:?}, score: {})",
            name,
            properties.device_type,
            score
        );

        if best.as_ref().map_or(true, |(s, _)| score > *s) {
            best = Some((
                score,
                DeviceSelection {
                    physical_device: device,
                    name,
                    queue_families,
                    max_anisotropy,
                },
            ));
        }
    }

    best.map(|(_, selection)| selection)
        .ok_or_else(|| GraphicsError::InitializationFailed("No suitable GPU found".to_string()))
}

/// Rank a device. Higher is better.
pub fn score_device(properties: &vk::PhysicalDeviceProperties, prefer_discrete: bool) -> u32 {
    let type_score = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU if prefer_discrete => 1000,
        vk::PhysicalDeviceType::DISCRETE_GPU => 500,
        vk::PhysicalDeviceType::INTEGRATED_GPU if prefer_discrete => 100,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1000,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        vk::PhysicalDeviceType::CPU => 10,
        _ => 1,
    };
    type_score + properties.limits.max_image_dimension2_d / 1024
}

fn find_queue_families(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: Option<SurfaceQuery<'_>>,
) -> Option<QueueFamilyIndices> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    let graphics = families
        .iter()
        .position(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS))? as u32;

    let Some(query) = surface else {
        return Some(QueueFamilyIndices {
            graphics,
            present: None,
        });
    };

    let can_present = |index: u32| unsafe {
        query
            .loader
            .get_physical_device_surface_support(device, index, query.surface)
            .unwrap_or(false)
    };
    // Prefer presenting from the graphics family.
    let present = if can_present(graphics) {
        graphics
    } else {
        (0..families.len() as u32).find(|&i| can_present(i))?
    };

    Some(QueueFamilyIndices {
        graphics,
        present: Some(present),
    })
}

fn supports_extension(instance: &ash::Instance, device: vk::PhysicalDevice, name: &CStr) -> bool {
    unsafe { instance.enumerate_device_extension_properties(device) }
        .map(|extensions| {
            extensions
                .iter()
                .any(|e| e.extension_name_as_c_str().is_ok_and(|n| n == name))
        })
        .unwrap_or(false)
}

/// Create the logical device with one queue per distinct family.
pub fn create_logical_device(
    instance: &ash::Instance,
    selection: &DeviceSelection,
) -> Result<ash::Device, GraphicsError> {
    let families = selection.queue_families;
    let priorities = [1.0f32];

    let mut queue_create_infos = vec![vk::DeviceQueueCreateInfo::default()
        .queue_family_index(families.graphics)
        .queue_priorities(&priorities)];
    if let Some(present) = families.present.filter(|&p| p != families.graphics) {
        queue_create_infos.push(
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(present)
                .queue_priorities(&priorities),
        );
    }

    let extensions = if families.present.is_some() {
        vec![ash::khr::swapchain::NAME.as_ptr()]
    } else {
        Vec::new()
    };

    let features = vk::PhysicalDeviceFeatures::default()
        .sampler_anisotropy(selection.max_anisotropy.is_some());

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extensions)
        .enabled_features(&features);

    unsafe { instance.create_device(selection.physical_device, &create_info, None) }.map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create logical device: {:?}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(device_type: vk::PhysicalDeviceType) -> vk::PhysicalDeviceProperties {
        vk::PhysicalDeviceProperties {
            device_type,
            limits: vk::PhysicalDeviceLimits {
                max_image_dimension2_d: 16384,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_discrete_preferred() {
        let discrete = properties(vk::PhysicalDeviceType::DISCRETE_GPU);
        let integrated = properties(vk::PhysicalDeviceType::INTEGRATED_GPU);
        assert!(score_device(&discrete, true) > score_device(&integrated, true));
    }

    #[test]
    fn test_integrated_preferred_when_asked() {
        let discrete = properties(vk::PhysicalDeviceType::DISCRETE_GPU);
        let integrated = properties(vk::PhysicalDeviceType::INTEGRATED_GPU);
        assert!(score_device(&integrated, false) > score_device(&discrete, false));
    }

    #[test]
    fn test_software_rasterizer_last() {
        let cpu = properties(vk::PhysicalDeviceType::CPU);
        let virtual_gpu = properties(vk::PhysicalDeviceType::VIRTUAL_GPU);
        assert!(score_device(&virtual_gpu, true) > score_device(&cpu, true));
        assert!(score_device(&cpu, true) > 0);
    }
}
