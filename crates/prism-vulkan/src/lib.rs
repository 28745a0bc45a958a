//! Vulkan backend for Prism.
//!
//! Implements the `prism-core` device traits on top of
//! `VK_KHR_acceleration_structure` and `VK_KHR_ray_tracing_pipeline`.
//! The application owns the instance, the logical device and queue
//! submission; this crate owns buffers, structures and pipelines.

pub mod capabilities;
pub mod command;
pub mod device;
pub mod error;
mod geometry;
pub mod memory;
pub mod pipeline;

pub use capabilities::{missing_extensions, RayTracingCapabilities, REQUIRED_EXTENSIONS};
pub use command::VulkanCommandList;
pub use device::{DeviceBuffer, VulkanRtDevice};
pub use error::{Result, VulkanError};
pub use memory::{BufferAllocator, VulkanBuffer};
pub use pipeline::{DescriptorSetLayoutBuilder, RtPipeline, VulkanProperties};
