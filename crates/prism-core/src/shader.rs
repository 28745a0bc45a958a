//! Shader libraries, root signatures, and shader records.
//!
//! Shader binaries are opaque: the core only knows the names and stages of
//! the entry points each library exports, plus the payload and attribute
//! sizes each export declares.

use serde::{Deserialize, Serialize};

use crate::constants::{ROOT_CONSTANT_SIZE, ROOT_DESCRIPTOR_SIZE};

/// Ray tracing shader stage of an export.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShaderStage {
    RayGeneration,
    Miss,
    ClosestHit,
    AnyHit,
    Intersection,
}

/// A named entry point of a shader library.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaderExport {
    pub name: String,
    pub stage: ShaderStage,
    /// Bytes of ray payload the entry point reads or writes.
    pub payload_size: u32,
    /// Bytes of hit attributes the entry point reads.
    pub attribute_size: u32,
}

impl ShaderExport {
    pub fn new(name: impl Into<String>, stage: ShaderStage) -> Self {
        Self {
            name: name.into(),
            stage,
            payload_size: 0,
            attribute_size: 0,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload_size: u32) -> Self {
        self.payload_size = payload_size;
        self
    }

    #[must_use]
    pub fn with_attributes(mut self, attribute_size: u32) -> Self {
        self.attribute_size = attribute_size;
        self
    }
}

/// A compiled shader binary and the entry points it exports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderLibrary {
    pub name: String,
    /// Opaque compiled binary (DXIL, SPIR-V, ...).
    pub code: Vec<u8>,
    pub exports: Vec<ShaderExport>,
}

/// A hit group: the shaders invoked when a ray hits geometry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HitGroupDesc {
    pub name: String,
    pub closest_hit: Option<String>,
    pub any_hit: Option<String>,
    pub intersection: Option<String>,
}

impl HitGroupDesc {
    /// Triangle hit group with only a closest-hit shader.
    pub fn closest_hit(name: impl Into<String>, closest_hit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            closest_hit: Some(closest_hit.into()),
            any_hit: None,
            intersection: None,
        }
    }

    /// Exports referenced by this group with the stage each must have.
    pub fn members(&self) -> impl Iterator<Item = (&str, ShaderStage)> {
        [
            (self.closest_hit.as_deref(), ShaderStage::ClosestHit),
            (self.any_hit.as_deref(), ShaderStage::AnyHit),
            (self.intersection.as_deref(), ShaderStage::Intersection),
        ]
        .into_iter()
        .filter_map(|(name, stage)| name.map(|name| (name, stage)))
    }
}

/// Kind of resource a descriptor binds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DescriptorKind {
    /// Read-write image (the ray tracing output).
    StorageImage,
    /// Top-level acceleration structure.
    AccelerationStructure,
    /// Constant/uniform buffer.
    ConstantBuffer,
    /// Read-only or read-write structured buffer.
    StorageBuffer,
}

/// A contiguous range of bindings inside a descriptor table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DescriptorRange {
    pub kind: DescriptorKind,
    pub binding: u32,
    pub count: u32,
}

/// One parameter of a root signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RootParameter {
    /// A buffer bound directly by GPU address.
    Descriptor { kind: DescriptorKind, binding: u32 },
    /// A table of descriptors bound by a descriptor-heap handle.
    DescriptorTable(Vec<DescriptorRange>),
    /// Inline 32-bit constants.
    Constants { binding: u32, count: u32 },
}

impl RootParameter {
    /// Bytes this parameter occupies in a local argument block.
    pub const fn argument_size(&self) -> u32 {
        match self {
            Self::Descriptor { .. } | Self::DescriptorTable(_) => ROOT_DESCRIPTOR_SIZE,
            Self::Constants { count, .. } => *count * ROOT_CONSTANT_SIZE,
        }
    }

    /// Alignment of this parameter in a local argument block.
    pub const fn argument_alignment(&self) -> u32 {
        match self {
            Self::Descriptor { .. } | Self::DescriptorTable(_) => ROOT_DESCRIPTOR_SIZE,
            Self::Constants { .. } => ROOT_CONSTANT_SIZE,
        }
    }
}

/// A root signature: the resources a shader may bind.
///
/// The global signature is shared by every stage; local signatures describe
/// the argument block stored in each shader record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootSignatureDesc {
    pub name: String,
    pub parameters: Vec<RootParameter>,
}

impl RootSignatureDesc {
    pub fn new(name: impl Into<String>, parameters: Vec<RootParameter>) -> Self {
        Self {
            name: name.into(),
            parameters,
        }
    }

    /// A signature with no parameters.
    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new())
    }

    /// Size in bytes of the local argument block this signature describes.
    ///
    /// Descriptors sit on 8-byte boundaries, constants on 4-byte boundaries,
    /// and the whole block is padded to 8 bytes.
    pub fn local_argument_size(&self) -> u32 {
        let end = self.parameters.iter().fold(0u32, |offset, parameter| {
            align_up_u32(offset, parameter.argument_alignment()) + parameter.argument_size()
        });
        align_up_u32(end, ROOT_DESCRIPTOR_SIZE)
    }
}

/// Associates a local root signature with the programs it applies to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSignatureAssociation {
    pub signature: String,
    /// Ray generation or miss export names, or hit group names.
    pub programs: Vec<String>,
}

/// Every subobject needed to create a ray tracing pipeline state object.
///
/// Produced by the pipeline assembler after validation; consumed by
/// [`GpuDevice::create_raytracing_pipeline`](crate::GpuDevice::create_raytracing_pipeline).
#[derive(Clone, Copy, Debug)]
pub struct PipelineDesc<'a> {
    pub libraries: &'a [ShaderLibrary],
    pub hit_groups: &'a [HitGroupDesc],
    pub global_signature: &'a RootSignatureDesc,
    pub local_signatures: &'a [RootSignatureDesc],
    pub associations: &'a [LocalSignatureAssociation],
    pub max_payload_size: u32,
    pub max_attribute_size: u32,
    pub max_recursion_depth: u32,
}

impl PipelineDesc<'_> {
    /// Names the pipeline exposes identifiers for: ray generation and miss
    /// exports, then hit groups, in declaration order.
    pub fn program_names(&self) -> Vec<&str> {
        let general = self
            .libraries
            .iter()
            .flat_map(|library| library.exports.iter())
            .filter(|export| {
                matches!(export.stage, ShaderStage::RayGeneration | ShaderStage::Miss)
            })
            .map(|export| export.name.as_str());
        general
            .chain(self.hit_groups.iter().map(|group| group.name.as_str()))
            .collect()
    }
}

/// Opaque shader identifier resolved from a pipeline by program name.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ShaderIdentifier(Box<[u8]>);

impl ShaderIdentifier {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for ShaderIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ShaderIdentifier(")?;
        for byte in self.0.iter().take(8) {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

/// One record to place in the shader binding table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderRecordDesc {
    /// Ray generation or miss export name, or hit group name.
    pub program: String,
    /// Local root arguments, laid out per the program's local signature.
    pub local_arguments: Vec<u8>,
}

impl ShaderRecordDesc {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            local_arguments: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_arguments(mut self, local_arguments: Vec<u8>) -> Self {
        self.local_arguments = local_arguments;
        self
    }
}

/// The hit records of one material/geometry combination, one per ray type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HitBinding {
    pub records: Vec<ShaderRecordDesc>,
}

impl HitBinding {
    pub fn new(records: Vec<ShaderRecordDesc>) -> Self {
        Self { records }
    }
}

/// Shader libraries, signatures, and the records to lay out in the SBT.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderSet {
    pub libraries: Vec<ShaderLibrary>,
    pub hit_groups: Vec<HitGroupDesc>,
    pub global_signature: RootSignatureDesc,
    pub local_signatures: Vec<RootSignatureDesc>,
    pub associations: Vec<LocalSignatureAssociation>,
    /// The single ray generation record.
    pub ray_gen: ShaderRecordDesc,
    /// Miss records, indexed by the miss index passed at trace time.
    pub miss: Vec<ShaderRecordDesc>,
    /// Hit bindings referenced by [`Instance::hit_binding`](crate::Instance::hit_binding).
    pub hit_bindings: Vec<HitBinding>,
}

#[inline]
const fn align_up_u32(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}
