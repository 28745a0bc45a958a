//! CPU implementation of the device collaborator traits.
//!
//! `MockDevice` keeps every buffer in host memory with a fake GPU address.
//! Command lists only record; [`MockDevice::submit`] executes the recording in
//! order, validating buffer sizes and usages against the prebuild sizes it
//! reported, and tracks which acceleration structures have been written
//! without a following barrier so that reads of them are reported as hazards.

use std::collections::{HashMap, HashSet};

use glam::Vec3;
use prism_core::constants::INSTANCE_DESCRIPTOR_SIZE;
use prism_core::{
    BufferDesc, BufferHandle, BufferUsage, BuildDesc, BuildFlags, BuildInputs, CommandList, Error,
    GeometryHandle, GeometryInputs, GpuDevice, IndexFormat, InstanceDescriptor, PipelineDesc,
    PipelineHandle, PrebuildInfo, Ray, RayTracingLimits, Registry, ShaderIdentifier,
    ShaderIdentifierSource,
};
use tracing::{debug, trace};

use crate::{Result, TestError};

const BASE_ADDRESS: u64 = 0x1_0000;
const ADDRESS_ALIGNMENT: u64 = 256;

/// Owned copy of the geometry a build was recorded with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordedInputs {
    Triangles(Vec<GeometryHandle>),
    Instances { count: u32 },
}

/// An acceleration structure build as recorded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedBuild {
    pub inputs: RecordedInputs,
    pub flags: BuildFlags,
    pub instance_descriptors: Option<BufferHandle>,
    pub source: Option<BufferHandle>,
    pub destination: BufferHandle,
    pub scratch: BufferHandle,
}

impl RecordedBuild {
    fn build_inputs(&self) -> BuildInputs<'_> {
        let geometry = match &self.inputs {
            RecordedInputs::Triangles(geometries) => GeometryInputs::Triangles(geometries),
            RecordedInputs::Instances { count } => GeometryInputs::Instances { count: *count },
        };
        BuildInputs {
            geometry,
            flags: self.flags,
        }
    }

    pub const fn is_update(&self) -> bool {
        self.source.is_some()
    }

    pub const fn is_top_level(&self) -> bool {
        matches!(self.inputs, RecordedInputs::Instances { .. })
    }
}

/// A recorded command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Build(RecordedBuild),
    Barrier(BufferHandle),
    Copy {
        destination: BufferHandle,
        offset: u64,
        bytes: Vec<u8>,
    },
}

/// Command list that records commands for [`MockDevice::submit`].
#[derive(Debug, Default)]
pub struct MockCommandList {
    commands: Vec<Command>,
}

impl MockCommandList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands recorded since the last submit.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Number of recorded builds.
    pub fn build_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|command| matches!(command, Command::Build(_)))
            .count()
    }
}

impl CommandList for MockCommandList {
    fn build_acceleration_structure(&mut self, desc: &BuildDesc<'_>) -> prism_core::Result<()> {
        let inputs = match desc.inputs.geometry {
            GeometryInputs::Triangles(geometries) => RecordedInputs::Triangles(geometries.to_vec()),
            GeometryInputs::Instances { count } => RecordedInputs::Instances { count },
        };
        self.commands.push(Command::Build(RecordedBuild {
            inputs,
            flags: desc.inputs.flags,
            instance_descriptors: desc.instance_descriptors,
            source: desc.source,
            destination: desc.destination,
            scratch: desc.scratch,
        }));
        Ok(())
    }

    fn insert_barrier(&mut self, buffer: BufferHandle) -> prism_core::Result<()> {
        self.commands.push(Command::Barrier(buffer));
        Ok(())
    }

    fn copy_bytes(
        &mut self,
        destination: BufferHandle,
        offset: u64,
        bytes: &[u8],
    ) -> prism_core::Result<()> {
        self.commands.push(Command::Copy {
            destination,
            offset,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }
}

/// Shader identifiers of a mock pipeline.
#[derive(Clone, Debug, Default)]
pub struct MockProperties {
    identifiers: HashMap<String, ShaderIdentifier>,
}

impl ShaderIdentifierSource for MockProperties {
    fn shader_identifier(&self, program: &str) -> Option<ShaderIdentifier> {
        self.identifiers.get(program).cloned()
    }
}

/// Closest hit reported by [`MockDevice::trace_ray`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Hit {
    /// Position of the instance in the TLAS.
    pub instance_index: u32,
    /// Instance id stored in the descriptor.
    pub instance_id: u32,
    pub hit_group_contribution: u32,
    /// Hit region record the hardware would invoke.
    pub record_index: u32,
    /// Triangle index within the BLAS.
    pub primitive_index: u32,
    pub t: f32,
}

struct MockBuffer {
    name: String,
    usage: BufferUsage,
    address: u64,
    data: Vec<u8>,
}

enum Structure {
    Bottom {
        triangles: Vec<[Vec3; 3]>,
    },
    Top {
        instances: Vec<(InstanceDescriptor, BufferHandle)>,
        allow_update: bool,
    },
}

struct MockPipeline {
    programs: Vec<String>,
}

/// Software device executing builds and traces on the CPU.
pub struct MockDevice {
    limits: RayTracingLimits,
    buffers: Registry<BufferHandle, MockBuffer>,
    pipelines: Registry<PipelineHandle, MockPipeline>,
    structures: HashMap<BufferHandle, Structure>,
    unsynchronized: HashSet<BufferHandle>,
    next_address: u64,
    allocations_before_failure: Option<usize>,
    fail_prebuild: bool,
    builds_executed: usize,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Device with default (D3D12-like) limits.
    pub fn new() -> Self {
        Self::with_limits(RayTracingLimits::default())
    }

    pub fn with_limits(limits: RayTracingLimits) -> Self {
        Self {
            limits,
            buffers: Registry::new(),
            pipelines: Registry::new(),
            structures: HashMap::new(),
            unsynchronized: HashSet::new(),
            next_address: BASE_ADDRESS,
            allocations_before_failure: None,
            fail_prebuild: false,
            builds_executed: 0,
        }
    }

    /// Let `successes` more buffer creations succeed, then fail every one after.
    pub fn fail_allocation_after(&mut self, successes: usize) {
        self.allocations_before_failure = Some(successes);
    }

    pub fn clear_allocation_failure(&mut self) {
        self.allocations_before_failure = None;
    }

    /// Make every prebuild size query fail.
    pub fn fail_prebuild_queries(&mut self, fail: bool) {
        self.fail_prebuild = fail;
    }

    /// Create an upload buffer holding `bytes`.
    pub fn upload_buffer(
        &mut self,
        bytes: &[u8],
        usage: BufferUsage,
        name: &str,
    ) -> prism_core::Result<BufferHandle> {
        let handle = self.create_buffer(&BufferDesc::new(
            bytes.len() as u64,
            usage | BufferUsage::UPLOAD,
            name,
        ))?;
        self.write_buffer(handle, 0, bytes)?;
        Ok(handle)
    }

    /// Host write into any live buffer.
    pub fn write_buffer(
        &mut self,
        handle: BufferHandle,
        offset: u64,
        bytes: &[u8],
    ) -> prism_core::Result<()> {
        let buffer = self.buffers.get_mut(handle)?;
        let start = usize::try_from(offset)
            .map_err(|_| Error::InvalidInput(format!("offset {offset} out of range")))?;
        let end = start + bytes.len();
        if end > buffer.data.len() {
            return Err(Error::InvalidInput(format!(
                "write of {} bytes at {offset} overflows '{}' ({} bytes)",
                bytes.len(),
                buffer.name,
                buffer.data.len()
            )));
        }
        buffer.data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Contents of a live buffer.
    pub fn read_buffer(&self, handle: BufferHandle) -> prism_core::Result<&[u8]> {
        Ok(&self.buffers.get(handle)?.data)
    }

    pub fn buffer_size(&self, handle: BufferHandle) -> prism_core::Result<u64> {
        Ok(self.buffers.get(handle)?.data.len() as u64)
    }

    pub fn buffer_usage(&self, handle: BufferHandle) -> prism_core::Result<BufferUsage> {
        Ok(self.buffers.get(handle)?.usage)
    }

    pub fn buffer_name(&self, handle: BufferHandle) -> prism_core::Result<&str> {
        Ok(&self.buffers.get(handle)?.name)
    }

    pub fn is_buffer_live(&self, handle: BufferHandle) -> bool {
        self.buffers.contains(handle)
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Live buffers whose usage intersects `usage`.
    pub fn live_buffers_with(&self, usage: BufferUsage) -> usize {
        self.buffers
            .iter()
            .filter(|(_, buffer)| buffer.usage.intersects(usage))
            .count()
    }

    pub fn live_pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    /// Programs a live pipeline was created with.
    pub fn pipeline_programs(&self, pipeline: PipelineHandle) -> prism_core::Result<&[String]> {
        Ok(&self.pipelines.get(pipeline)?.programs)
    }

    /// Builds executed by `submit` so far.
    pub fn builds_executed(&self) -> usize {
        self.builds_executed
    }

    /// Instance count of a built TLAS.
    pub fn instance_count(&self, tlas: BufferHandle) -> Result<usize> {
        match self.structures.get(&tlas) {
            Some(Structure::Top { instances, .. }) => Ok(instances.len()),
            _ => Err(TestError::Validation(format!(
                "{tlas:?} holds no top-level structure"
            ))),
        }
    }

    /// Triangle count of a built BLAS.
    pub fn triangle_count(&self, blas: BufferHandle) -> Result<usize> {
        match self.structures.get(&blas) {
            Some(Structure::Bottom { triangles }) => Ok(triangles.len()),
            _ => Err(TestError::Validation(format!(
                "{blas:?} holds no bottom-level structure"
            ))),
        }
    }

    /// Execute and clear every command recorded in `list`.
    pub fn submit(&mut self, list: &mut MockCommandList) -> Result<()> {
        debug!("Submitting {} mock commands", list.commands.len());
        for command in list.commands.drain(..) {
            match command {
                Command::Build(build) => self.execute_build(&build)?,
                Command::Barrier(buffer) => {
                    self.buffers.get(buffer)?;
                    self.unsynchronized.remove(&buffer);
                }
                Command::Copy {
                    destination,
                    offset,
                    bytes,
                } => {
                    let usage = self.buffers.get(destination)?.usage;
                    if !usage.contains(BufferUsage::UPLOAD) {
                        return Err(TestError::Validation(format!(
                            "copy into {destination:?} which is not host visible"
                        )));
                    }
                    self.write_buffer(destination, offset, &bytes)
                        .map_err(|e| TestError::Validation(e.to_string()))?;
                }
            }
        }
        Ok(())
    }

    /// Closest hit of `ray` against a built TLAS.
    pub fn trace_ray(&self, tlas: BufferHandle, ray: &Ray, ray_type: u32) -> Result<Option<Hit>> {
        self.buffers.get(tlas)?;
        if self.unsynchronized.contains(&tlas) {
            return Err(TestError::Hazard(format!(
                "trace reads {tlas:?} before a barrier"
            )));
        }
        let Some(Structure::Top { instances, .. }) = self.structures.get(&tlas) else {
            return Err(TestError::Validation(format!(
                "{tlas:?} holds no top-level structure"
            )));
        };

        let mut nearest: Option<Hit> = None;
        for (instance_index, (descriptor, blas)) in instances.iter().enumerate() {
            if descriptor.mask() == 0 {
                continue;
            }
            let Some(Structure::Bottom { triangles }) = self.structures.get(blas) else {
                return Err(TestError::Validation(format!(
                    "instance {instance_index} references a released BLAS"
                )));
            };

            let object_ray = ray.transform(descriptor.transform_matrix().inverse());
            for (primitive_index, [v0, v1, v2]) in triangles.iter().enumerate() {
                let Some(t) = object_ray.intersect_triangle(*v0, *v1, *v2, 0.0) else {
                    continue;
                };
                if nearest.map_or(true, |hit| t < hit.t) {
                    nearest = Some(Hit {
                        instance_index: instance_index as u32,
                        instance_id: descriptor.instance_id(),
                        hit_group_contribution: descriptor.hit_group_contribution(),
                        record_index: descriptor.hit_group_contribution() + ray_type,
                        primitive_index: primitive_index as u32,
                        t,
                    });
                }
            }
        }
        Ok(nearest)
    }

    fn execute_build(&mut self, build: &RecordedBuild) -> Result<()> {
        let sizes = prebuild_sizes(&build.build_inputs())?;

        let destination = self.buffers.get(build.destination)?;
        if !destination.usage.contains(BufferUsage::ACCELERATION_STRUCTURE) {
            return Err(TestError::Validation(format!(
                "build destination '{}' lacks acceleration structure usage",
                destination.name
            )));
        }
        if (destination.data.len() as u64) < sizes.result_size {
            return Err(TestError::Validation(format!(
                "build destination '{}' holds {} bytes, build needs {}",
                destination.name,
                destination.data.len(),
                sizes.result_size
            )));
        }

        let scratch = self.buffers.get(build.scratch)?;
        let scratch_needed = if build.is_update() {
            sizes.update_scratch_size
        } else {
            sizes.scratch_size
        };
        if !scratch.usage.contains(BufferUsage::SCRATCH) {
            return Err(TestError::Validation(format!(
                "scratch '{}' lacks scratch usage",
                scratch.name
            )));
        }
        if (scratch.data.len() as u64) < scratch_needed {
            return Err(TestError::Validation(format!(
                "scratch '{}' holds {} bytes, build needs {scratch_needed}",
                scratch.name,
                scratch.data.len()
            )));
        }

        let structure = match &build.inputs {
            RecordedInputs::Triangles(geometries) => {
                if build.is_update() {
                    return Err(TestError::Validation(
                        "bottom-level refit is not supported".to_string(),
                    ));
                }
                let mut triangles = Vec::new();
                for geometry in geometries {
                    self.read_triangles(geometry, &mut triangles)?;
                }
                trace!("Built BLAS {:?} with {} triangles", build.destination, triangles.len());
                Structure::Bottom { triangles }
            }
            RecordedInputs::Instances { count } => {
                let instances = self.read_instances(build, *count)?;
                if let Some(source) = build.source {
                    self.check_refit_source(build.destination, source, &instances)?;
                }
                trace!("Built TLAS {:?} with {} instances", build.destination, instances.len());
                Structure::Top {
                    instances,
                    allow_update: build.flags.contains(BuildFlags::ALLOW_UPDATE),
                }
            }
        };

        self.structures.insert(build.destination, structure);
        self.unsynchronized.insert(build.destination);
        self.builds_executed += 1;
        Ok(())
    }

    fn read_triangles(&self, geometry: &GeometryHandle, out: &mut Vec<[Vec3; 3]>) -> Result<()> {
        let vertices = &self.buffers.get(geometry.vertex_buffer)?.data;
        let stride = geometry.vertex_stride as usize;
        let vertex_count = geometry.vertex_count as usize;
        if vertex_count == 0 || (vertex_count - 1) * stride + 12 > vertices.len() {
            return Err(TestError::Validation(format!(
                "vertex buffer {:?} too small for {vertex_count} vertices",
                geometry.vertex_buffer
            )));
        }

        let position = |index: usize| -> Result<Vec3> {
            if index >= vertex_count {
                return Err(TestError::Validation(format!(
                    "index {index} out of range for {vertex_count} vertices"
                )));
            }
            let start = index * stride;
            let xyz: [f32; 3] = bytemuck::pod_read_unaligned(&vertices[start..start + 12]);
            Ok(Vec3::from_array(xyz))
        };

        let indices: Vec<usize> = match geometry.index_buffer {
            None => (0..vertex_count).collect(),
            Some(index_buffer) => {
                let data = &self.buffers.get(index_buffer.buffer)?.data;
                let element = index_buffer.format.size() as usize;
                let count = index_buffer.count as usize;
                if count * element > data.len() {
                    return Err(TestError::Validation(format!(
                        "index buffer {:?} too small for {count} indices",
                        index_buffer.buffer
                    )));
                }
                data[..count * element]
                    .chunks_exact(element)
                    .map(|bytes| match index_buffer.format {
                        IndexFormat::Uint16 => {
                            usize::from(bytemuck::pod_read_unaligned::<u16>(bytes))
                        }
                        IndexFormat::Uint32 => {
                            bytemuck::pod_read_unaligned::<u32>(bytes) as usize
                        }
                    })
                    .collect()
            }
        };

        for triangle in indices.chunks_exact(3) {
            out.push([
                position(triangle[0])?,
                position(triangle[1])?,
                position(triangle[2])?,
            ]);
        }
        Ok(())
    }

    fn read_instances(
        &self,
        build: &RecordedBuild,
        count: u32,
    ) -> Result<Vec<(InstanceDescriptor, BufferHandle)>> {
        let handle = build.instance_descriptors.ok_or_else(|| {
            TestError::Validation("top-level build without instance descriptors".to_string())
        })?;
        let buffer = self.buffers.get(handle)?;
        if !buffer.usage.contains(BufferUsage::BUILD_INPUT) {
            return Err(TestError::Validation(format!(
                "instance buffer '{}' lacks build input usage",
                buffer.name
            )));
        }
        let record = INSTANCE_DESCRIPTOR_SIZE as usize;
        let needed = count as usize * record;
        if needed > buffer.data.len() {
            return Err(TestError::Validation(format!(
                "instance buffer '{}' holds {} bytes, {count} instances need {needed}",
                buffer.name,
                buffer.data.len()
            )));
        }

        let mut instances = Vec::with_capacity(count as usize);
        for (index, bytes) in buffer.data[..needed].chunks_exact(record).enumerate() {
            let descriptor: InstanceDescriptor = bytemuck::pod_read_unaligned(bytes);
            let blas = self.structure_at(descriptor.blas_address).ok_or_else(|| {
                TestError::Validation(format!(
                    "instance {index} references {:#x}, which is not a built BLAS",
                    descriptor.blas_address
                ))
            })?;
            if !matches!(self.structures.get(&blas), Some(Structure::Bottom { .. })) {
                return Err(TestError::Validation(format!(
                    "instance {index} references a top-level structure"
                )));
            }
            if self.unsynchronized.contains(&blas) {
                return Err(TestError::Hazard(format!(
                    "TLAS build reads BLAS {blas:?} (instance {index}) before a barrier"
                )));
            }
            instances.push((descriptor, blas));
        }
        Ok(instances)
    }

    fn check_refit_source(
        &self,
        destination: BufferHandle,
        source: BufferHandle,
        instances: &[(InstanceDescriptor, BufferHandle)],
    ) -> Result<()> {
        if source != destination {
            return Err(TestError::Validation(
                "only in-place refits are supported".to_string(),
            ));
        }
        if self.unsynchronized.contains(&source) {
            return Err(TestError::Hazard(format!(
                "refit reads {source:?} before a barrier"
            )));
        }
        let Some(Structure::Top {
            instances: previous,
            allow_update,
        }) = self.structures.get(&source)
        else {
            return Err(TestError::Validation(format!(
                "refit source {source:?} holds no top-level structure"
            )));
        };
        if !allow_update {
            return Err(TestError::Validation(
                "refit source was built without ALLOW_UPDATE".to_string(),
            ));
        }
        if previous.len() != instances.len() {
            return Err(TestError::Validation(format!(
                "refit changes instance count from {} to {}",
                previous.len(),
                instances.len()
            )));
        }
        if let Some(index) = previous
            .iter()
            .zip(instances)
            .position(|((_, before), (_, after))| before != after)
        {
            return Err(TestError::Validation(format!(
                "refit changes the BLAS of instance {index}"
            )));
        }
        Ok(())
    }

    fn structure_at(&self, address: u64) -> Option<BufferHandle> {
        self.buffers
            .iter()
            .find(|(handle, buffer)| {
                buffer.address == address && self.structures.contains_key(handle)
            })
            .map(|(handle, _)| handle)
    }
}

impl GpuDevice for MockDevice {
    type Properties = MockProperties;

    fn limits(&self) -> RayTracingLimits {
        self.limits
    }

    fn query_prebuild_info(&self, inputs: &BuildInputs<'_>) -> prism_core::Result<PrebuildInfo> {
        if self.fail_prebuild {
            return Err(Error::AllocationFailure(
                "prebuild query failed (injected)".to_string(),
            ));
        }
        prebuild_sizes(inputs)
    }

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> prism_core::Result<BufferHandle> {
        if let Some(remaining) = self.allocations_before_failure.as_mut() {
            if *remaining == 0 {
                return Err(Error::AllocationFailure(format!(
                    "allocation of '{}' failed (injected)",
                    desc.name
                )));
            }
            *remaining -= 1;
        }
        if desc.size == 0 {
            return Err(Error::InvalidInput(format!(
                "buffer '{}' has zero size",
                desc.name
            )));
        }
        let size = usize::try_from(desc.size)
            .map_err(|_| Error::AllocationFailure(format!("buffer '{}' too large", desc.name)))?;

        let address = self.next_address;
        self.next_address += desc.size.div_ceil(ADDRESS_ALIGNMENT) * ADDRESS_ALIGNMENT;
        let handle = self.buffers.insert(MockBuffer {
            name: desc.name.to_string(),
            usage: desc.usage,
            address,
            data: vec![0; size],
        });
        trace!("Created mock buffer '{}' ({} bytes) as {handle:?}", desc.name, desc.size);
        Ok(handle)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) -> prism_core::Result<()> {
        self.buffers.remove(buffer)?;
        self.structures.remove(&buffer);
        self.unsynchronized.remove(&buffer);
        Ok(())
    }

    fn buffer_address(&self, buffer: BufferHandle) -> prism_core::Result<u64> {
        Ok(self.buffers.get(buffer)?.address)
    }

    fn create_raytracing_pipeline(
        &mut self,
        desc: &PipelineDesc<'_>,
    ) -> prism_core::Result<(PipelineHandle, MockProperties)> {
        if desc.max_recursion_depth > self.limits.max_recursion_depth {
            return Err(Error::UnsupportedFeature(format!(
                "recursion depth {} exceeds device limit {}",
                desc.max_recursion_depth, self.limits.max_recursion_depth
            )));
        }

        let programs: Vec<String> = desc
            .program_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let identifiers = programs
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    mock_identifier(name, self.limits.shader_identifier_size),
                )
            })
            .collect();
        let handle = self.pipelines.insert(MockPipeline { programs });
        debug!("Created mock pipeline {handle:?}");
        Ok((handle, MockProperties { identifiers }))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) -> prism_core::Result<()> {
        self.pipelines.remove(pipeline).map(|_| ())
    }
}

/// Deterministic sizes standing in for a driver's prebuild info.
fn prebuild_sizes(inputs: &BuildInputs<'_>) -> prism_core::Result<PrebuildInfo> {
    match inputs.geometry {
        GeometryInputs::Triangles(geometries) => {
            if geometries.is_empty() {
                return Err(Error::InvalidInput(
                    "bottom-level build without geometry".to_string(),
                ));
            }
            let primitives: u64 = geometries
                .iter()
                .map(|geometry| u64::from(geometry.primitive_count()))
                .sum();
            Ok(PrebuildInfo {
                result_size: 256 + 64 * primitives,
                scratch_size: 128 + 32 * primitives,
                update_scratch_size: 64 + 16 * primitives,
            })
        }
        GeometryInputs::Instances { count } => {
            let count = u64::from(count);
            Ok(PrebuildInfo {
                result_size: 128 + 128 * count,
                scratch_size: 64 + 64 * count,
                update_scratch_size: 32 + 32 * count,
            })
        }
    }
}

/// Identifier bytes derived from the program name (FNV-1a seeded splitmix64).
fn mock_identifier(program: &str, size: u32) -> ShaderIdentifier {
    let mut state = program
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
        });
    let mut bytes = Vec::with_capacity(size as usize + 8);
    while bytes.len() < size as usize {
        state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        bytes.extend_from_slice(&(z ^ (z >> 31)).to_le_bytes());
    }
    bytes.truncate(size as usize);
    ShaderIdentifier::from_bytes(&bytes)
}
