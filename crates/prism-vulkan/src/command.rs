//! [`CommandList`] recording into a Vulkan command buffer.

use std::sync::Arc;

use ash::vk;
use prism_core::{BufferHandle, BuildDesc, CommandList, Error};
use tracing::trace;

use crate::device::Shared;
use crate::geometry::{build_flags, structure_type, GeometryBuild};

/// Records builds, barriers and uploads into one command buffer.
///
/// The command buffer must be in the recording state. Submission and fencing
/// stay with the caller.
pub struct VulkanCommandList {
    shared: Arc<Shared>,
    cmd: vk::CommandBuffer,
}

impl VulkanCommandList {
    pub(crate) const fn new(shared: Arc<Shared>, cmd: vk::CommandBuffer) -> Self {
        Self { shared, cmd }
    }

    /// The wrapped command buffer.
    pub const fn raw(&self) -> vk::CommandBuffer {
        self.cmd
    }
}

/// Barrier ordering a build's writes before later builds and ray tracing reads.
pub fn build_barrier() -> vk::MemoryBarrier2<'static> {
    vk::MemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
        .src_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR)
        .dst_stage_mask(
            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR
                | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        )
        .dst_access_mask(
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
                | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
        )
}

const fn build_mode(desc: &BuildDesc<'_>) -> vk::BuildAccelerationStructureModeKHR {
    if desc.is_update() {
        vk::BuildAccelerationStructureModeKHR::UPDATE
    } else {
        vk::BuildAccelerationStructureModeKHR::BUILD
    }
}

impl CommandList for VulkanCommandList {
    #[cfg_attr(feature = "profiling", tracing::instrument(level = "trace", skip_all))]
    fn build_acceleration_structure(&mut self, desc: &BuildDesc<'_>) -> prism_core::Result<()> {
        let resources = self.shared.resources.lock();
        let build = GeometryBuild::new(&resources.buffers, &desc.inputs, desc.instance_descriptors)?;

        let structure_of = |handle: BufferHandle| -> prism_core::Result<vk::AccelerationStructureKHR> {
            resources.buffers.get(handle)?.structure.ok_or_else(|| {
                Error::InvalidInput(format!("{handle:?} holds no acceleration structure"))
            })
        };
        let destination = structure_of(desc.destination)?;
        let source = desc
            .source
            .map(structure_of)
            .transpose()?
            .unwrap_or_else(vk::AccelerationStructureKHR::null);
        let scratch_address = resources.buffers.get(desc.scratch)?.address;

        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(structure_type(&desc.inputs.geometry))
            .flags(build_flags(desc.inputs.flags))
            .mode(build_mode(desc))
            .src_acceleration_structure(source)
            .dst_acceleration_structure(destination)
            .geometries(&build.geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            });

        trace!(
            "Recording {:?} of {:?} with {} geometries",
            build_mode(desc),
            desc.destination,
            build.ranges.len()
        );

        unsafe {
            self.shared.as_loader.cmd_build_acceleration_structures(
                self.cmd,
                std::slice::from_ref(&build_info),
                &[build.ranges.as_slice()],
            );
        }
        Ok(())
    }

    fn insert_barrier(&mut self, buffer: BufferHandle) -> prism_core::Result<()> {
        // Global barrier; the handle only has to be live.
        if !self.shared.resources.lock().buffers.contains(buffer) {
            return Err(Error::StaleHandle(format!("{buffer:?}")));
        }
        let barrier = build_barrier();
        let dependency_info =
            vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));
        unsafe { self.shared.device.cmd_pipeline_barrier2(self.cmd, &dependency_info) };
        Ok(())
    }

    fn copy_bytes(
        &mut self,
        destination: BufferHandle,
        offset: u64,
        bytes: &[u8],
    ) -> prism_core::Result<()> {
        // Upload memory is host-visible, so the write lands before submission.
        let resources = self.shared.resources.lock();
        resources
            .buffers
            .get(destination)?
            .memory
            .write_bytes(offset, bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barrier_covers_ray_tracing_reads() {
        let barrier = build_barrier();
        assert!(barrier
            .dst_stage_mask
            .contains(vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR));
        assert!(barrier
            .dst_access_mask
            .contains(vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR));
        assert_eq!(
            barrier.src_access_mask,
            vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR
        );
    }
}
