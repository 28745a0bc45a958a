//! Ray tracing scene builders for Prism.
//!
//! This crate provides:
//! - Bottom-level acceleration structure builds, one per mesh
//! - Top-level builds and in-place refits over an ordered instance list
//! - Ray tracing pipeline assembly from shader libraries and root signatures
//! - Shader binding table layout and upload
//! - An orchestrator sequencing all of the above and owning the results
//!
//! Every builder is generic over the collaborator traits of `prism-core`.

mod alloc;
pub mod blas;
pub mod orchestrator;
pub mod pipeline;
pub mod sbt;
pub mod tlas;

pub use blas::{AccelerationStructureBuffers, Blas, BlasTable, BottomLevelBuilder};
pub use orchestrator::AccelerationStructureOrchestrator;
pub use pipeline::{local_argument_sizes, RaytracingPipeline, RaytracingPipelineAssembler};
pub use sbt::{
    RegionRequest, SbtLayout, SbtRegion, ShaderBindingTable, ShaderBindingTableBuilder,
    StridedRegion,
};
pub use tlas::{Tlas, TlasHandle, TopLevelBuilder, UpdateKind};
