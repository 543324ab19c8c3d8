//! Vulkan instance creation and configuration.

use std::ffi::{c_char, CStr, CString};

use ash::vk;

use crate::config::GraphicsConfig;
use crate::error::GraphicsError;

use super::debug;

/// Classic render passes and `vkQueueSubmit` need nothing newer.
const API_VERSION: u32 = vk::API_VERSION_1_2;

const ENGINE_NAME: &CStr = c"Tessera";

const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance plus the debug messenger created with it.
pub struct InstanceBundle {
    pub instance: ash::Instance,
    pub debug_utils: Option<ash::ext::debug_utils::Instance>,
    pub debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl InstanceBundle {
    /// Destroy the messenger and the instance.
    ///
    /// # Safety
    /// Every object created from the instance must already be destroyed.
    pub unsafe fn destroy(&self) {
        unsafe {
            if let (Some(utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger) {
                utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Create a Vulkan instance.
///
/// `surface_extensions` are the window-system extensions the surface needs;
/// empty for headless devices. Validation is enabled when `config` asks for
/// it and the layer is installed.
pub fn create_instance(
    entry: &ash::Entry,
    config: &GraphicsConfig,
    surface_extensions: &[*const c_char],
) -> Result<InstanceBundle, GraphicsError> {
    let validation = config.validation && validation_layer_available(entry);
    if config.validation && !validation {
        log::warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed");
    }

    let app_name = CString::new(config.app_name.as_str()).map_err(|e| {
        GraphicsError::InvalidParameter(format!("application name contains a NUL byte: {}", e))
    })?;
    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(config.app_version)
        .engine_name(ENGINE_NAME)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(API_VERSION);

    let mut extensions = surface_extensions.to_vec();
    if validation {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
    }

    #[allow(unused_mut)]
    let mut flags = vk::InstanceCreateFlags::empty();
    #[cfg(target_os = "macos")]
    {
        extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
        flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    }

    let layers: Vec<*const c_char> = if validation {
        vec![VALIDATION_LAYER_NAME.as_ptr()]
    } else {
        Vec::new()
    };

    let create_info = vk::InstanceCreateInfo::default()
        .flags(flags)
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers);

    let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create Vulkan instance: {:?}", e))
    })?;

    if !validation {
        return Ok(InstanceBundle {
            instance,
            debug_utils: None,
            debug_messenger: None,
        });
    }

    let debug_utils = ash::ext::debug_utils::Instance::new(entry, &instance);
    match debug::create_debug_messenger(&debug_utils) {
        Ok(messenger) => Ok(InstanceBundle {
            instance,
            debug_utils: Some(debug_utils),
            debug_messenger: Some(messenger),
        }),
        Err(e) => {
            unsafe { instance.destroy_instance(None) };
            Err(e)
        }
    }
}

fn validation_layer_available(entry: &ash::Entry) -> bool {
    let Ok(layers) = (unsafe { entry.enumerate_instance_layer_properties() }) else {
        return false;
    };
    layers.iter().any(|layer| {
        layer
            .layer_name_as_c_str()
            .is_ok_and(|name| name == VALIDATION_LAYER_NAME)
    })
}
