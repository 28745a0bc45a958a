//! Ray tracing capability detection.

use ash::vk;
use prism_core::RayTracingLimits;
use std::collections::HashSet;
use std::ffi::CStr;

use crate::error::{Result, VulkanError};

/// Device extensions the backend cannot work without.
pub const REQUIRED_EXTENSIONS: [&CStr; 3] = [
    ash::khr::acceleration_structure::NAME,
    ash::khr::ray_tracing_pipeline::NAME,
    ash::khr::deferred_host_operations::NAME,
];

/// Required extensions absent from `available`.
pub fn missing_extensions(available: &HashSet<String>) -> Vec<String> {
    REQUIRED_EXTENSIONS
        .iter()
        .filter_map(|name| name.to_str().ok())
        .filter(|name| !available.contains(*name))
        .map(String::from)
        .collect()
}

/// Detected ray tracing capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayTracingCapabilities {
    /// Limits handed to the builders.
    pub limits: RayTracingLimits,
    /// Required alignment of scratch buffer addresses.
    pub min_scratch_alignment: u32,
    /// Maximum instance count of one TLAS.
    pub max_instance_count: u64,
    /// Maximum primitive count of one BLAS.
    pub max_primitive_count: u64,
}

impl RayTracingCapabilities {
    /// Translate the two extension property structs.
    pub fn from_properties(
        pipeline: &vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'_>,
        structure: &vk::PhysicalDeviceAccelerationStructurePropertiesKHR<'_>,
    ) -> Self {
        Self {
            limits: RayTracingLimits {
                shader_identifier_size: pipeline.shader_group_handle_size,
                shader_record_alignment: pipeline.shader_group_handle_alignment,
                shader_table_alignment: pipeline.shader_group_base_alignment,
                max_record_stride: pipeline.max_shader_group_stride,
                max_recursion_depth: pipeline.max_ray_recursion_depth,
                max_attribute_size: pipeline.max_ray_hit_attribute_size,
            },
            min_scratch_alignment: structure.min_acceleration_structure_scratch_offset_alignment,
            max_instance_count: structure.max_instance_count,
            max_primitive_count: structure.max_primitive_count,
        }
    }

    /// Check extensions and query properties of a physical device.
    ///
    /// Fails with [`VulkanError::ExtensionNotSupported`] when a required
    /// extension is missing.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Result<Self> {
        let available: HashSet<String> = instance
            .enumerate_device_extension_properties(physical_device)?
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let missing = missing_extensions(&available);
        if !missing.is_empty() {
            return Err(VulkanError::ExtensionNotSupported(missing.join(", ")));
        }

        let mut pipeline = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut structure = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut pipeline)
            .push_next(&mut structure);
        instance.get_physical_device_properties2(physical_device, &mut properties2);

        Ok(Self::from_properties(&pipeline, &structure))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_missing_extensions() {
        let mut available: HashSet<String> = ["VK_KHR_swapchain", "VK_KHR_acceleration_structure"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            missing_extensions(&available),
            vec![
                "VK_KHR_ray_tracing_pipeline".to_string(),
                "VK_KHR_deferred_host_operations".to_string()
            ]
        );

        available.insert("VK_KHR_ray_tracing_pipeline".to_string());
        available.insert("VK_KHR_deferred_host_operations".to_string());
        assert!(missing_extensions(&available).is_empty());
    }

    #[test]
    fn limits_from_properties() {
        let mut pipeline = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        pipeline.shader_group_handle_size = 32;
        pipeline.shader_group_handle_alignment = 32;
        pipeline.shader_group_base_alignment = 64;
        pipeline.max_shader_group_stride = 4096;
        pipeline.max_ray_recursion_depth = 31;
        pipeline.max_ray_hit_attribute_size = 32;
        let mut structure = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        structure.min_acceleration_structure_scratch_offset_alignment = 128;

        let capabilities = RayTracingCapabilities::from_properties(&pipeline, &structure);
        assert_eq!(capabilities.limits, RayTracingLimits::default());
        assert_eq!(capabilities.min_scratch_alignment, 128);
    }
}
