//! Core types, collaborator traits, and shared invariants for Prism.
//!
//! This crate provides the foundation the ray tracing builders are written against:
//! - Collaborator traits for the GPU device and command list
//! - Generation-tagged resource handles and the deferred release queue
//! - Geometry, instance, and shader-set descriptions
//! - The hit-group indexing convention shared by the TLAS and the SBT
//! - Error types and build configuration

pub mod config;
pub mod deferred;
pub mod device;
pub mod error;
pub mod geometry;
pub mod handle;
pub mod indexing;
pub mod math;
pub mod shader;

pub use config::{BuildPreference, RtConfig};
pub use deferred::{Retired, RetireQueue};
pub use device::{
    BufferDesc, BufferUsage, BuildDesc, BuildFlags, BuildInputs, CommandList, GeometryInputs,
    GpuDevice, PrebuildInfo, RayTracingLimits, ShaderIdentifierSource,
};
pub use error::{Error, Result};
pub use geometry::{GeometryHandle, GeometryId, IndexBuffer, IndexFormat, Instance, MeshDesc, VertexFormat};
pub use handle::{BufferHandle, FenceValue, PipelineHandle, Registry, SlotHandle};
pub use indexing::{HitGroupIndexing, HitSlot};
pub use math::{InstanceDescriptor, Ray};
pub use shader::{
    DescriptorKind, DescriptorRange, HitBinding, HitGroupDesc, LocalSignatureAssociation,
    PipelineDesc, RootParameter, RootSignatureDesc, ShaderExport, ShaderIdentifier, ShaderLibrary,
    ShaderRecordDesc, ShaderSet, ShaderStage,
};

/// Hardware-facing constants shared by every backend.
pub mod constants {
    /// Size in bytes of one instance descriptor record in the TLAS input buffer.
    pub const INSTANCE_DESCRIPTOR_SIZE: u64 = 64;
    /// Instance mask that makes an instance visible to every ray.
    pub const INSTANCE_MASK_ALL: u8 = 0xFF;
    /// Largest value representable in the 24-bit instance id and contribution fields.
    pub const MAX_INSTANCE_FIELD: u32 = (1 << 24) - 1;
    /// Size in bytes of a root descriptor or descriptor table in a local argument block.
    pub const ROOT_DESCRIPTOR_SIZE: u32 = 8;
    /// Size in bytes of one 32-bit root constant.
    pub const ROOT_CONSTANT_SIZE: u32 = 4;
}
