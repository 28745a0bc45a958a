//! Vulkan backend error types.

use ash::vk;
use thiserror::Error;

/// Vulkan backend errors.
#[derive(Error, Debug)]
pub enum VulkanError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(#[from] gpu_allocator::AllocationError),

    /// Shader module creation failed.
    #[error("Invalid shader library: {0}")]
    ShaderModule(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<VulkanError> for prism_core::Error {
    fn from(error: VulkanError) -> Self {
        match error {
            VulkanError::Vulkan(
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            )
            | VulkanError::AllocationFailed(_) => Self::AllocationFailure(error.to_string()),
            VulkanError::ExtensionNotSupported(_) => Self::UnsupportedFeature(error.to_string()),
            VulkanError::ShaderModule(_) => Self::InvalidInput(error.to_string()),
            VulkanError::Vulkan(_)
            | VulkanError::PipelineCreation(_)
            | VulkanError::InvalidState(_) => Self::Device(error.to_string()),
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, VulkanError>;
