//! Graphics error types.

use std::time::Duration;

use ash::vk;
use thiserror::Error;

use crate::command::CommandListState;

/// Errors that can occur in the graphics system.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphicsError {
    /// Failed to initialize the graphics system.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),
    /// Failed to create a resource.
    #[error("resource creation failed: {0}")]
    ResourceCreationFailed(String),
    /// A raw API call returned an error code.
    #[error("{operation} failed: {result:?}")]
    Vulkan {
        operation: &'static str,
        result: vk::Result,
    },
    /// Out of host or device memory.
    #[error("out of GPU memory")]
    OutOfMemory,
    /// The GPU device was lost.
    #[error("GPU device lost")]
    DeviceLost,
    /// A command list was used in a state that does not allow the operation.
    #[error("{operation} is not allowed while the command list is {state}")]
    InvalidState {
        operation: &'static str,
        state: CommandListState,
    },
    /// An invalid parameter was provided.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// A `create_*` call was made on a handle that already owns an object.
    #[error("{0} was already created")]
    AlreadyCreated(&'static str),
    /// A bounded wait expired.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    /// Shader source failed to parse, validate or emit.
    #[error("shader compilation failed: {0}")]
    ShaderCompilationFailed(String),
    /// A requested feature is not supported.
    #[error("feature not supported: {0}")]
    FeatureNotSupported(String),
    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GraphicsError {
    /// Classify a raw API result returned by `operation`.
    pub fn from_vk(operation: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                Self::OutOfMemory
            }
            result => Self::Vulkan { operation, result },
        }
    }

    /// Whether the frame loop must stop when it sees this error.
    ///
    /// Usage errors are reported to the caller but leave the device usable.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::InvalidState { .. } | Self::InvalidParameter(_) | Self::AlreadyCreated(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GraphicsError::OutOfMemory;
        assert_eq!(err.to_string(), "out of GPU memory");

        let err = GraphicsError::InitializationFailed("no GPU found".to_string());
        assert_eq!(err.to_string(), "initialization failed: no GPU found");

        let err = GraphicsError::AlreadyCreated("buffer");
        assert_eq!(err.to_string(), "buffer was already created");
    }

    #[test]
    fn test_invalid_state_names_operation_and_state() {
        let err = GraphicsError::InvalidState {
            operation: "submit",
            state: CommandListState::Recording,
        };
        assert_eq!(
            err.to_string(),
            "submit is not allowed while the command list is recording"
        );
    }

    #[test]
    fn test_from_vk_classification() {
        assert_eq!(
            GraphicsError::from_vk("vkQueueSubmit", vk::Result::ERROR_DEVICE_LOST),
            GraphicsError::DeviceLost
        );
        assert_eq!(
            GraphicsError::from_vk("vkCreateBuffer", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            GraphicsError::OutOfMemory
        );
        assert_eq!(
            GraphicsError::from_vk(
                "vkAllocateCommandBuffers",
                vk::Result::ERROR_OUT_OF_POOL_MEMORY
            ),
            GraphicsError::Vulkan {
                operation: "vkAllocateCommandBuffers",
                result: vk::Result::ERROR_OUT_OF_POOL_MEMORY,
            }
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(GraphicsError::DeviceLost.is_fatal());
        assert!(GraphicsError::Internal("x".into()).is_fatal());
        assert!(!GraphicsError::AlreadyCreated("image").is_fatal());
        assert!(!GraphicsError::InvalidParameter("slot".into()).is_fatal());
    }
}
