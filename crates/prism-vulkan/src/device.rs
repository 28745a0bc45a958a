//! [`GpuDevice`] implementation on a Vulkan logical device.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use prism_core::{
    BufferDesc, BufferHandle, BufferUsage, BuildInputs, Error, GpuDevice, PipelineDesc,
    PipelineHandle, PrebuildInfo, RayTracingLimits, Registry,
};
use tracing::{debug, info, warn};

use crate::capabilities::RayTracingCapabilities;
use crate::command::VulkanCommandList;
use crate::error::Result;
use crate::geometry::{build_flags, structure_type, GeometryBuild};
use crate::memory::{BufferAllocator, VulkanBuffer};
use crate::pipeline::{RtPipeline, VulkanProperties};

/// Required alignment of an acceleration structure's storage offset.
const ACCELERATION_STRUCTURE_ALIGNMENT: u64 = 256;

/// A buffer, and the acceleration structure object placed on it if any.
pub struct DeviceBuffer {
    pub memory: VulkanBuffer,
    pub structure: Option<vk::AccelerationStructureKHR>,
    /// Structure address for acceleration structure storage, buffer address otherwise.
    pub address: vk::DeviceAddress,
}

pub(crate) struct Resources {
    pub allocator: BufferAllocator,
    pub buffers: Registry<BufferHandle, DeviceBuffer>,
    pub pipelines: Registry<PipelineHandle, RtPipeline>,
}

/// State shared by the device and its command lists.
pub(crate) struct Shared {
    pub device: ash::Device,
    pub as_loader: ash::khr::acceleration_structure::Device,
    pub rt_loader: ash::khr::ray_tracing_pipeline::Device,
    pub resources: Mutex<Resources>,
}

impl Shared {
    /// Destroy the structure object and free the memory of `buffer`.
    pub fn release_buffer(&self, resources: &mut Resources, mut buffer: DeviceBuffer) -> Result<()> {
        if let Some(structure) = buffer.structure.take() {
            unsafe { self.as_loader.destroy_acceleration_structure(structure, None) };
        }
        resources.allocator.free_buffer(&mut buffer.memory)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let mut resources = self.resources.lock();
        let buffers = resources.buffers.drain();
        let pipelines = resources.pipelines.drain();
        if !buffers.is_empty() || !pipelines.is_empty() {
            warn!(
                "Releasing {} buffers and {} pipelines still alive at shutdown",
                buffers.len(),
                pipelines.len()
            );
        }
        for pipeline in pipelines {
            unsafe { pipeline.destroy(&self.device) };
        }
        for buffer in buffers {
            if let Err(e) = self.release_buffer(&mut resources, buffer) {
                warn!("Failed to release buffer at shutdown: {e}");
            }
        }
        resources.allocator.shutdown();
    }
}

/// Ray tracing device over an existing Vulkan logical device.
///
/// The logical device must have been created with the extensions in
/// [`REQUIRED_EXTENSIONS`](crate::REQUIRED_EXTENSIONS), buffer device
/// address, and synchronization2 enabled. It must outlive this object.
pub struct VulkanRtDevice {
    shared: Arc<Shared>,
    capabilities: RayTracingCapabilities,
}

impl VulkanRtDevice {
    /// Query capabilities and load the ray tracing entry points.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let capabilities = RayTracingCapabilities::query(instance, physical_device)?;
        let allocator = BufferAllocator::new(instance, device, physical_device)?;

        info!(
            "Ray tracing device ready: identifiers {} bytes, recursion {}, scratch alignment {}",
            capabilities.limits.shader_identifier_size,
            capabilities.limits.max_recursion_depth,
            capabilities.min_scratch_alignment
        );

        Ok(Self {
            shared: Arc::new(Shared {
                device: device.clone(),
                as_loader: ash::khr::acceleration_structure::Device::new(instance, device),
                rt_loader: ash::khr::ray_tracing_pipeline::Device::new(instance, device),
                resources: Mutex::new(Resources {
                    allocator,
                    buffers: Registry::new(),
                    pipelines: Registry::new(),
                }),
            }),
            capabilities,
        })
    }

    pub fn capabilities(&self) -> &RayTracingCapabilities {
        &self.capabilities
    }

    /// Wrap a command buffer in the recording state.
    pub fn command_list(&self, cmd: vk::CommandBuffer) -> VulkanCommandList {
        VulkanCommandList::new(Arc::clone(&self.shared), cmd)
    }

    /// Raw buffer, for descriptor writes by the dispatch.
    pub fn raw_buffer(&self, handle: BufferHandle) -> prism_core::Result<vk::Buffer> {
        Ok(self.shared.resources.lock().buffers.get(handle)?.memory.buffer)
    }

    /// Acceleration structure object placed on `handle`.
    pub fn raw_acceleration_structure(
        &self,
        handle: BufferHandle,
    ) -> prism_core::Result<vk::AccelerationStructureKHR> {
        self.shared
            .resources
            .lock()
            .buffers
            .get(handle)?
            .structure
            .ok_or_else(|| Error::InvalidInput(format!("{handle:?} holds no acceleration structure")))
    }

    /// Pipeline and layout to bind for a dispatch.
    pub fn raw_pipeline(
        &self,
        handle: PipelineHandle,
    ) -> prism_core::Result<(vk::Pipeline, vk::PipelineLayout)> {
        let resources = self.shared.resources.lock();
        let pipeline = resources.pipelines.get(handle)?;
        Ok((pipeline.pipeline, pipeline.layout))
    }
}

impl GpuDevice for VulkanRtDevice {
    type Properties = VulkanProperties;

    fn limits(&self) -> RayTracingLimits {
        self.capabilities.limits
    }

    fn query_prebuild_info(&self, inputs: &BuildInputs<'_>) -> prism_core::Result<PrebuildInfo> {
        let build = {
            let resources = self.shared.resources.lock();
            GeometryBuild::new(&resources.buffers, inputs, None)?
        };
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(structure_type(&inputs.geometry))
            .flags(build_flags(inputs.flags))
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&build.geometries);

        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.shared.as_loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &build.primitive_counts(),
                &mut sizes,
            );
        }

        Ok(PrebuildInfo {
            result_size: sizes.acceleration_structure_size,
            scratch_size: sizes.build_scratch_size,
            update_scratch_size: sizes.update_scratch_size,
        })
    }

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> prism_core::Result<BufferHandle> {
        if desc.size == 0 {
            return Err(Error::InvalidInput(format!(
                "zero-sized buffer '{}'",
                desc.name
            )));
        }
        let min_alignment = if desc.usage.contains(BufferUsage::SCRATCH) {
            u64::from(self.capabilities.min_scratch_alignment)
        } else if desc.usage.contains(BufferUsage::SHADER_TABLE) {
            u64::from(self.capabilities.limits.shader_table_alignment)
        } else if desc.usage.contains(BufferUsage::ACCELERATION_STRUCTURE) {
            ACCELERATION_STRUCTURE_ALIGNMENT
        } else {
            1
        };

        let mut resources = self.shared.resources.lock();
        let mut memory = resources.allocator.create_buffer(desc, min_alignment)?;

        let mut structure = None;
        let mut address = memory.address;
        if desc.usage.contains(BufferUsage::ACCELERATION_STRUCTURE) {
            // Level is fixed by the first build.
            let create_info = vk::AccelerationStructureCreateInfoKHR::default()
                .buffer(memory.buffer)
                .offset(0)
                .size(desc.size)
                .ty(vk::AccelerationStructureTypeKHR::GENERIC);
            match unsafe {
                self.shared
                    .as_loader
                    .create_acceleration_structure(&create_info, None)
            } {
                Ok(created) => {
                    address = unsafe {
                        self.shared.as_loader.get_acceleration_structure_device_address(
                            &vk::AccelerationStructureDeviceAddressInfoKHR::default()
                                .acceleration_structure(created),
                        )
                    };
                    structure = Some(created);
                }
                Err(e) => {
                    resources.allocator.free_buffer(&mut memory)?;
                    return Err(crate::VulkanError::from(e).into());
                }
            }
        }

        let handle = resources.buffers.insert(DeviceBuffer {
            memory,
            structure,
            address,
        });
        debug!("Created buffer '{}' ({} bytes) as {handle:?}", desc.name, desc.size);
        Ok(handle)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) -> prism_core::Result<()> {
        let mut resources = self.shared.resources.lock();
        let removed = resources.buffers.remove(buffer)?;
        self.shared.release_buffer(&mut resources, removed)?;
        Ok(())
    }

    fn buffer_address(&self, buffer: BufferHandle) -> prism_core::Result<u64> {
        Ok(self.shared.resources.lock().buffers.get(buffer)?.address)
    }

    fn create_raytracing_pipeline(
        &mut self,
        desc: &PipelineDesc<'_>,
    ) -> prism_core::Result<(PipelineHandle, VulkanProperties)> {
        let (pipeline, properties) =
            unsafe { RtPipeline::new(&self.shared, desc, &self.capabilities.limits)? };
        let handle = self.shared.resources.lock().pipelines.insert(pipeline);
        Ok((handle, properties))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) -> prism_core::Result<()> {
        let removed = self.shared.resources.lock().pipelines.remove(pipeline)?;
        unsafe { removed.destroy(&self.shared.device) };
        Ok(())
    }
}
