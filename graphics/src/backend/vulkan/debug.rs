//! Routes validation layer messages into the `log` facade.

use std::borrow::Cow;
use std::ffi::CStr;

use ash::vk;

use crate::error::GraphicsError;

/// Create a messenger forwarding validation output to `log`.
///
/// Verbose messages are only requested when trace logging is enabled.
pub fn create_debug_messenger(
    debug_utils: &ash::ext::debug_utils::Instance,
) -> Result<vk::DebugUtilsMessengerEXT, GraphicsError> {
    let mut severity = vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO;
    if log::log_enabled!(log::Level::Trace) {
        severity |= vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE;
    }

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(severity)
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }.map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create debug messenger: {:?}", e))
    })
}

/// Copy a possibly-null C string from the driver.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn driver_str<'a>(ptr: *const std::ffi::c_char) -> Cow<'a, str> {
    if ptr.is_null() {
        Cow::Borrowed("")
    } else {
        // SAFETY: guaranteed by the caller.
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy()
    }
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if callback_data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: the driver passes valid callback data for the duration of the call.
    let data = unsafe { &*callback_data };
    // SAFETY: the loader passes null or NUL-terminated strings in callback data.
    let (id, message) = unsafe {
        (
            driver_str(data.p_message_id_name),
            driver_str(data.p_message),
        )
    };

    let level = match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::Level::Error,
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::Level::Warn,
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::Level::Debug,
        _ => log::Level::Trace,
    };
    log::log!(
        target: "tessera_graphics::vulkan",
        level,
        "[{:?}] {}: {}",
        message_type,
        id,
        message
    );

    vk::FALSE
}
