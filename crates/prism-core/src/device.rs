//! Collaborator traits the builders are written against.
//!
//! A backend implements [`GpuDevice`] for resource creation and size queries
//! and [`CommandList`] for recording builds, barriers, and uploads. The
//! builders never see backend types; everything crosses this boundary as a
//! handle or a plain description.

use bitflags::bitflags;

use crate::error::Result;
use crate::geometry::GeometryHandle;
use crate::handle::{BufferHandle, PipelineHandle};
use crate::shader::{PipelineDesc, ShaderIdentifier};

bitflags! {
    /// How a buffer will be used.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Backing storage of an acceleration structure.
        const ACCELERATION_STRUCTURE = 1 << 0;
        /// Scratch memory for acceleration structure builds.
        const SCRATCH = 1 << 1;
        /// Read-only input of an acceleration structure build (instance records).
        const BUILD_INPUT = 1 << 2;
        /// Shader binding table storage.
        const SHADER_TABLE = 1 << 3;
        /// Host-visible memory that the CPU writes through `copy_bytes`.
        const UPLOAD = 1 << 4;
    }
}

bitflags! {
    /// Acceleration structure build flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BuildFlags: u32 {
        const PREFER_FAST_TRACE = 1 << 0;
        const PREFER_FAST_BUILD = 1 << 1;
        /// The structure may later be refit in place.
        const ALLOW_UPDATE = 1 << 2;
    }
}

/// Request for a new device buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferDesc<'a> {
    pub size: u64,
    pub usage: BufferUsage,
    /// Debug name.
    pub name: &'a str,
}

impl<'a> BufferDesc<'a> {
    pub const fn new(size: u64, usage: BufferUsage, name: &'a str) -> Self {
        Self { size, usage, name }
    }
}

/// Geometry fed to a size query or a build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeometryInputs<'a> {
    /// Bottom level: one triangle list per entry.
    Triangles(&'a [GeometryHandle]),
    /// Top level: `count` instance descriptors.
    Instances { count: u32 },
}

impl GeometryInputs<'_> {
    pub const fn is_top_level(&self) -> bool {
        matches!(self, Self::Instances { .. })
    }
}

/// Inputs of an acceleration structure size query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuildInputs<'a> {
    pub geometry: GeometryInputs<'a>,
    pub flags: BuildFlags,
}

/// A recorded acceleration structure build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuildDesc<'a> {
    pub inputs: BuildInputs<'a>,
    /// Instance descriptor buffer (top level only).
    pub instance_descriptors: Option<BufferHandle>,
    /// Structure to update from. `Some` makes this an in-place refit.
    pub source: Option<BufferHandle>,
    pub destination: BufferHandle,
    pub scratch: BufferHandle,
}

impl BuildDesc<'_> {
    /// Whether this build updates an existing structure instead of building from scratch.
    pub const fn is_update(&self) -> bool {
        self.source.is_some()
    }
}

/// Sizes reported by the device for a prospective build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrebuildInfo {
    pub result_size: u64,
    pub scratch_size: u64,
    pub update_scratch_size: u64,
}

/// Ray tracing limits relevant to pipeline and SBT layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RayTracingLimits {
    /// Size of one shader identifier in bytes.
    pub shader_identifier_size: u32,
    /// Alignment of every record (and therefore every stride).
    pub shader_record_alignment: u32,
    /// Alignment of every region start.
    pub shader_table_alignment: u32,
    /// Largest record stride the hardware accepts.
    pub max_record_stride: u32,
    pub max_recursion_depth: u32,
    pub max_attribute_size: u32,
}

impl Default for RayTracingLimits {
    fn default() -> Self {
        Self {
            shader_identifier_size: 32,
            shader_record_alignment: 32,
            shader_table_alignment: 64,
            max_record_stride: 4096,
            max_recursion_depth: 31,
            max_attribute_size: 32,
        }
    }
}

/// Resolves shader identifiers from a built pipeline.
pub trait ShaderIdentifierSource {
    /// Identifier of a ray generation or miss export, or of a hit group.
    fn shader_identifier(&self, program: &str) -> Option<ShaderIdentifier>;
}

/// Command recording for acceleration structure builds and uploads.
///
/// Commands execute in recording order; nothing here waits on the GPU.
pub trait CommandList {
    /// Record an acceleration structure build or refit.
    fn build_acceleration_structure(&mut self, desc: &BuildDesc<'_>) -> Result<()>;

    /// Make writes to `buffer` visible to every later command.
    fn insert_barrier(&mut self, buffer: BufferHandle) -> Result<()>;

    /// Write `bytes` into an [`BufferUsage::UPLOAD`] buffer at `offset`.
    fn copy_bytes(&mut self, destination: BufferHandle, offset: u64, bytes: &[u8]) -> Result<()>;
}

/// Resource creation and size queries.
pub trait GpuDevice {
    /// Pipeline properties handle returned with every pipeline.
    type Properties: ShaderIdentifierSource;

    fn limits(&self) -> RayTracingLimits;

    /// Sizes needed to build `inputs`.
    fn query_prebuild_info(&self, inputs: &BuildInputs<'_>) -> Result<PrebuildInfo>;

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<BufferHandle>;

    /// Destroy a buffer immediately. Callers route releases through the
    /// retire queue unless the GPU has provably never seen the buffer.
    fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<()>;

    /// GPU virtual address of a buffer.
    fn buffer_address(&self, buffer: BufferHandle) -> Result<u64>;

    fn create_raytracing_pipeline(
        &mut self,
        desc: &PipelineDesc<'_>,
    ) -> Result<(PipelineHandle, Self::Properties)>;

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::SlotHandle;

    #[test]
    fn update_is_keyed_on_source() {
        let handle = BufferHandle::from_parts(0, 0);
        let mut desc = BuildDesc {
            inputs: BuildInputs {
                geometry: GeometryInputs::Instances { count: 1 },
                flags: BuildFlags::ALLOW_UPDATE,
            },
            instance_descriptors: Some(handle),
            source: None,
            destination: handle,
            scratch: handle,
        };
        assert!(!desc.is_update());
        desc.source = Some(handle);
        assert!(desc.is_update());
        assert!(desc.inputs.geometry.is_top_level());
    }

    #[test]
    fn default_limits_are_powers_of_two() {
        let limits = RayTracingLimits::default();
        assert!(limits.shader_record_alignment.is_power_of_two());
        assert!(limits.shader_table_alignment.is_power_of_two());
        assert_eq!(limits.shader_identifier_size, 32);
    }
}
