//! Shader Binding Table (SBT) layout and construction.
//!
//! The SBT is one GPU buffer holding shader records in three regions:
//! - Ray generation: exactly one record
//! - Miss: one or more records, indexed by the miss index at trace time
//! - Hit groups: `ray_type_count` records per instance
//!
//! A record is a shader identifier followed by the local root arguments of
//! its program. Every record of a region shares the region stride; shorter
//! records are zero padded.

use std::collections::HashMap;

use prism_core::{
    BufferDesc, BufferHandle, BufferUsage, CommandList, Error, FenceValue, GpuDevice,
    HitGroupIndexing, Instance, RayTracingLimits, Result, Retired, RetireQueue,
    ShaderIdentifierSource, ShaderRecordDesc, ShaderSet,
};
use tracing::{debug, warn};

use crate::alloc::align_up;
use crate::pipeline::local_argument_sizes;

/// Record count and largest local argument block of one region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegionRequest {
    pub record_count: u32,
    pub max_argument_size: u32,
}

/// Placement of one region inside the SBT buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SbtRegion {
    /// Byte offset of the first record from the buffer start.
    pub offset: u64,
    pub stride: u64,
    /// Size reported to the dispatch; for ray generation this equals the stride.
    pub size: u64,
    pub record_count: u32,
}

impl SbtRegion {
    /// Byte offset of record `index`.
    pub fn record_offset(&self, index: u32) -> Result<u64> {
        if index >= self.record_count {
            return Err(Error::InvalidInput(format!(
                "record {index} out of range (region has {})",
                self.record_count
            )));
        }
        Ok(self.offset + u64::from(index) * self.stride)
    }

    /// End of the last record.
    pub const fn end(&self) -> u64 {
        self.offset + self.stride * self.record_count as u64
    }
}

/// Byte layout of the three SBT regions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SbtLayout {
    pub ray_gen: SbtRegion,
    pub miss: SbtRegion,
    pub hit: SbtRegion,
    /// Total buffer size.
    pub size: u64,
}

impl SbtLayout {
    /// Compute the layout for the given regions.
    ///
    /// Stride is the identifier plus the largest argument block, rounded up to
    /// the record alignment. Each region starts at the previous region's end
    /// rounded up to the table alignment.
    ///
    /// The argument block size of a region is the largest size declared by
    /// the local root signatures of its programs, not the largest block a
    /// record actually carries, since the GPU reads the full declared block.
    pub fn compute(
        limits: &RayTracingLimits,
        ray_gen: RegionRequest,
        miss: RegionRequest,
        hit: RegionRequest,
    ) -> Result<Self> {
        if ray_gen.record_count != 1 {
            return Err(Error::InvalidInput(format!(
                "ray generation region needs exactly one record, got {}",
                ray_gen.record_count
            )));
        }
        if miss.record_count == 0 {
            return Err(Error::InvalidInput(
                "miss region needs at least one record".to_string(),
            ));
        }

        let table_alignment = u64::from(limits.shader_table_alignment);
        let region = |request: RegionRequest, start: u64| -> Result<SbtRegion> {
            let stride = align_up(
                u64::from(limits.shader_identifier_size) + u64::from(request.max_argument_size),
                u64::from(limits.shader_record_alignment),
            );
            if stride > u64::from(limits.max_record_stride) {
                return Err(Error::LayoutViolation(format!(
                    "record stride {stride} exceeds device limit {}",
                    limits.max_record_stride
                )));
            }
            Ok(SbtRegion {
                offset: align_up(start, table_alignment),
                stride,
                size: stride * u64::from(request.record_count),
                record_count: request.record_count,
            })
        };

        let ray_gen = region(ray_gen, 0)?;
        let miss = region(miss, ray_gen.end())?;
        let hit = region(hit, miss.end())?;
        let size = if hit.record_count == 0 {
            miss.end()
        } else {
            hit.end()
        };
        Ok(Self {
            ray_gen,
            miss,
            hit,
            size,
        })
    }
}

/// A device-address range handed to the dispatch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StridedRegion {
    pub address: u64,
    pub stride: u64,
    pub size: u64,
}

/// A written shader binding table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderBindingTable {
    pub buffer: BufferHandle,
    /// GPU address of the buffer start.
    pub address: u64,
    pub layout: SbtLayout,
    /// Hit binding per instance the hit region was written for.
    pub(crate) hit_bindings: Vec<u32>,
}

impl ShaderBindingTable {
    fn strided(&self, region: &SbtRegion) -> StridedRegion {
        StridedRegion {
            address: self.address + region.offset,
            stride: region.stride,
            size: region.size,
        }
    }

    pub fn ray_gen_region(&self) -> StridedRegion {
        self.strided(&self.layout.ray_gen)
    }

    pub fn miss_region(&self) -> StridedRegion {
        self.strided(&self.layout.miss)
    }

    pub fn hit_region(&self) -> StridedRegion {
        self.strided(&self.layout.hit)
    }

    /// Byte offset of hit record `record_index` from the buffer start.
    pub fn hit_record_offset(&self, record_index: u32) -> Result<u64> {
        self.layout.hit.record_offset(record_index)
    }

    /// Whether the hit region matches `instances` (same count and bindings).
    pub fn matches_instances(&self, instances: &[Instance]) -> bool {
        self.hit_bindings.len() == instances.len()
            && self
                .hit_bindings
                .iter()
                .zip(instances)
                .all(|(&binding, instance)| binding == instance.hit_binding)
    }

    /// Queue the buffer for release after `fence`.
    pub fn retire(self, queue: &mut RetireQueue, fence: FenceValue) {
        queue.retire(Retired::Buffer(self.buffer), fence);
    }
}

/// Lays out and writes shader binding tables.
#[derive(Clone, Copy, Debug)]
pub struct ShaderBindingTableBuilder {
    indexing: HitGroupIndexing,
}

impl ShaderBindingTableBuilder {
    pub fn new(indexing: HitGroupIndexing) -> Self {
        Self { indexing }
    }

    /// Hit records in hit region order, one per instance and ray type.
    pub fn hit_records<'a>(
        &self,
        shaders: &'a ShaderSet,
        instances: &[Instance],
    ) -> Result<Vec<&'a ShaderRecordDesc>> {
        let slots = self.indexing.hit_slots(instances)?;
        let expected = self.indexing.hit_record_count(instances.len())?;
        if slots.len() != expected as usize {
            return Err(Error::IndexingMismatch(format!(
                "{} hit records for {} instances x {} ray types",
                slots.len(),
                instances.len(),
                self.indexing.ray_type_count()
            )));
        }

        let mut records = Vec::with_capacity(slots.len());
        for (position, slot) in slots.iter().enumerate() {
            if slot.record_index as usize != position {
                return Err(Error::IndexingMismatch(format!(
                    "instance {} ray type {} maps to record {}, written at {position}",
                    slot.instance_index, slot.ray_type, slot.record_index
                )));
            }
            let binding = shaders
                .hit_bindings
                .get(slot.hit_binding as usize)
                .ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "instance {} uses hit binding {}, only {} exist",
                        slot.instance_index,
                        slot.hit_binding,
                        shaders.hit_bindings.len()
                    ))
                })?;
            let record = binding.records.get(slot.ray_type as usize).ok_or_else(|| {
                Error::InvalidInput(format!(
                    "hit binding {} has no record for ray type {}",
                    slot.hit_binding, slot.ray_type
                ))
            })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Compute the layout and the table bytes.
    pub fn encode<P: ShaderIdentifierSource>(
        &self,
        limits: &RayTracingLimits,
        properties: &P,
        shaders: &ShaderSet,
        instances: &[Instance],
    ) -> Result<(SbtLayout, Vec<u8>)> {
        let local_sizes = local_argument_sizes(shaders)?;
        let hit = self.hit_records(shaders, instances)?;
        let ray_gen = [&shaders.ray_gen];
        let miss: Vec<&ShaderRecordDesc> = shaders.miss.iter().collect();

        let layout = SbtLayout::compute(
            limits,
            region_request(&ray_gen, &local_sizes)?,
            region_request(&miss, &local_sizes)?,
            region_request(&hit, &local_sizes)?,
        )?;

        let mut bytes = vec![0u8; usize::try_from(layout.size).map_err(|_| {
            Error::AllocationFailure(format!("SBT of {} bytes", layout.size))
        })?];
        for (region, records) in [
            (&layout.ray_gen, &ray_gen[..]),
            (&layout.miss, &miss[..]),
            (&layout.hit, &hit[..]),
        ] {
            for (index, record) in records.iter().enumerate() {
                let identifier = properties
                    .shader_identifier(&record.program)
                    .ok_or_else(|| Error::UnknownExport(record.program.clone()))?;
                if identifier.len() != limits.shader_identifier_size as usize {
                    return Err(Error::Device(format!(
                        "identifier of '{}' is {} bytes, device reports {}",
                        record.program,
                        identifier.len(),
                        limits.shader_identifier_size
                    )));
                }
                let start = region.record_offset(index as u32)? as usize;
                let arguments = start + identifier.len();
                bytes[start..arguments].copy_from_slice(identifier.as_bytes());
                bytes[arguments..arguments + record.local_arguments.len()]
                    .copy_from_slice(&record.local_arguments);
            }
        }
        Ok((layout, bytes))
    }

    /// Write a new table into a fresh upload buffer.
    #[cfg_attr(feature = "profiling", tracing::instrument(level = "trace", skip_all))]
    pub fn build<D, C>(
        &self,
        device: &mut D,
        cmd: &mut C,
        properties: &D::Properties,
        shaders: &ShaderSet,
        instances: &[Instance],
    ) -> Result<ShaderBindingTable>
    where
        D: GpuDevice,
        C: CommandList,
    {
        let limits = device.limits();
        let (layout, bytes) = self.encode(&limits, properties, shaders, instances)?;

        let buffer = device
            .create_buffer(&BufferDesc::new(
                layout.size,
                BufferUsage::SHADER_TABLE | BufferUsage::UPLOAD,
                "shader_binding_table",
            ))
            .map_err(Error::into_allocation_failure)?;
        let written = device
            .buffer_address(buffer)
            .and_then(|address| cmd.copy_bytes(buffer, 0, &bytes).map(|()| address));
        let address = match written {
            Ok(address) => address,
            Err(e) => {
                if let Err(destroy) = device.destroy_buffer(buffer) {
                    warn!("Failed to release SBT buffer {buffer:?}: {destroy}");
                }
                return Err(e);
            }
        };

        debug!(
            "Wrote SBT: {} bytes, miss {} x {}, hit {} x {}",
            layout.size,
            layout.miss.record_count,
            layout.miss.stride,
            layout.hit.record_count,
            layout.hit.stride
        );

        Ok(ShaderBindingTable {
            buffer,
            address,
            layout,
            hit_bindings: instances.iter().map(|instance| instance.hit_binding).collect(),
        })
    }
}

fn region_request(
    records: &[&ShaderRecordDesc],
    local_sizes: &HashMap<String, u32>,
) -> Result<RegionRequest> {
    let mut max_argument_size = 0;
    for record in records {
        let declared = local_sizes.get(&record.program).copied().unwrap_or(0);
        if record.local_arguments.len() as u64 > u64::from(declared) {
            return Err(Error::LayoutViolation(format!(
                "record '{}' carries {} bytes of local arguments, its local root signature declares {declared}",
                record.program,
                record.local_arguments.len()
            )));
        }
        max_argument_size = max_argument_size.max(declared);
    }
    Ok(RegionRequest {
        record_count: u32::try_from(records.len())
            .map_err(|_| Error::InvalidInput("too many shader records".to_string()))?,
        max_argument_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RaytracingPipelineAssembler;
    use glam::Mat4;
    use prism_core::{GeometryId, RtConfig};
    use prism_test::{hit_record_arguments, simple_shader_set, MockDevice, MockProperties};

    fn request(record_count: u32, max_argument_size: u32) -> RegionRequest {
        RegionRequest {
            record_count,
            max_argument_size,
        }
    }

    fn instances(bindings: &[u32]) -> Vec<Instance> {
        bindings
            .iter()
            .map(|&binding| Instance::new(GeometryId(0), Mat4::IDENTITY, binding))
            .collect()
    }

    fn pipeline(device: &mut MockDevice, shaders: &ShaderSet, ray_types: u32) -> MockProperties {
        RaytracingPipelineAssembler::new(&RtConfig::default().with_ray_types(ray_types))
            .assemble(device, shaders)
            .unwrap()
            .properties
    }

    #[test]
    fn stride_and_alignment() {
        let limits = RayTracingLimits::default();
        let layout =
            SbtLayout::compute(&limits, request(1, 0), request(2, 4), request(3, 40)).unwrap();

        assert_eq!(layout.ray_gen.stride, 32);
        assert_eq!(layout.ray_gen.size, layout.ray_gen.stride);
        // 32 + 4 -> 64
        assert_eq!(layout.miss.stride, 64);
        // 32 + 40 -> 96
        assert_eq!(layout.hit.stride, 96);

        for region in [layout.ray_gen, layout.miss, layout.hit] {
            assert_eq!(region.offset % 64, 0);
            assert_eq!(region.stride % 32, 0);
        }
        assert!(layout.ray_gen.offset < layout.miss.offset);
        assert!(layout.miss.offset < layout.hit.offset);
        assert!(layout.ray_gen.end() <= layout.miss.offset);
        assert!(layout.miss.end() <= layout.hit.offset);
        assert_eq!(layout.miss.offset, 64);
        assert_eq!(layout.hit.offset, 192);
        assert_eq!(layout.size, 192 + 3 * 96);
    }

    #[test]
    fn record_offsets_strictly_increase() {
        let layout = SbtLayout::compute(
            &RayTracingLimits::default(),
            request(1, 8),
            request(1, 8),
            request(4, 8),
        )
        .unwrap();
        let offsets: Vec<u64> = (0..4).map(|i| layout.hit.record_offset(i).unwrap()).collect();
        assert!(offsets.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(layout.hit.record_offset(4).is_err());
    }

    #[test]
    fn oversized_stride_rejected() {
        let err = SbtLayout::compute(
            &RayTracingLimits::default(),
            request(1, 0),
            request(1, 0),
            request(1, 8000),
        )
        .unwrap_err();
        assert!(matches!(err, Error::LayoutViolation(_)));
    }

    #[test]
    fn region_counts_checked() {
        let limits = RayTracingLimits::default();
        assert!(SbtLayout::compute(&limits, request(2, 0), request(1, 0), request(1, 0)).is_err());
        assert!(SbtLayout::compute(&limits, request(1, 0), request(0, 0), request(1, 0)).is_err());
        // An empty hit region is legal for an empty scene.
        let layout =
            SbtLayout::compute(&limits, request(1, 0), request(1, 0), request(0, 0)).unwrap();
        assert_eq!(layout.hit.size, 0);
        assert_eq!(layout.size, layout.miss.end());
    }

    #[test]
    fn records_land_at_indexed_slots() {
        let mut device = MockDevice::new();
        let shaders = simple_shader_set(2, 3);
        let properties = pipeline(&mut device, &shaders, 2);
        let builder = ShaderBindingTableBuilder::new(HitGroupIndexing::new(2).unwrap());
        let instances = instances(&[2, 0, 1]);

        let (layout, bytes) = builder
            .encode(&device.limits(), &properties, &shaders, &instances)
            .unwrap();
        assert_eq!(layout.hit.record_count, 6);

        let indexing = HitGroupIndexing::new(2).unwrap();
        for (instance_index, instance) in instances.iter().enumerate() {
            for ray_type in 0..2 {
                let record = indexing.record_index(instance_index as u32, ray_type).unwrap();
                let offset = layout.hit.record_offset(record).unwrap() as usize;
                let group = if ray_type == 0 { "HitGroup" } else { "ShadowHitGroup" };
                let identifier = properties.shader_identifier(group).unwrap();
                assert_eq!(&bytes[offset..offset + 32], identifier.as_bytes());
                assert_eq!(
                    &bytes[offset + 32..offset + 40],
                    &hit_record_arguments(instance.hit_binding, ray_type)[..]
                );
            }
        }

        let miss = layout.miss.record_offset(1).unwrap() as usize;
        assert_eq!(
            &bytes[miss..miss + 32],
            properties.shader_identifier("ShadowMiss").unwrap().as_bytes()
        );
    }

    #[test]
    fn short_arguments_are_zero_padded() {
        let mut device = MockDevice::new();
        let mut shaders = simple_shader_set(1, 1);
        shaders.hit_bindings[0].records[0].local_arguments = vec![0xAB; 4];
        let properties = pipeline(&mut device, &shaders, 1);
        let builder = ShaderBindingTableBuilder::new(HitGroupIndexing::new(1).unwrap());

        let (layout, bytes) = builder
            .encode(&device.limits(), &properties, &shaders, &instances(&[0]))
            .unwrap();
        let offset = layout.hit.offset as usize + 32;
        assert_eq!(&bytes[offset..offset + 8], &[0xAB, 0xAB, 0xAB, 0xAB, 0, 0, 0, 0]);

        // Stride follows the declared block, not the shorter payload.
        let (full, _) = builder
            .encode(&device.limits(), &properties, &simple_shader_set(1, 1), &instances(&[0]))
            .unwrap();
        assert_eq!(layout.hit.stride, full.hit.stride);
    }

    #[test]
    fn unknown_hit_binding_rejected() {
        let shaders = simple_shader_set(1, 1);
        let builder = ShaderBindingTableBuilder::new(HitGroupIndexing::new(1).unwrap());
        assert!(matches!(
            builder.hit_records(&shaders, &instances(&[0, 5])),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn build_uploads_table() {
        let mut device = MockDevice::new();
        let shaders = simple_shader_set(1, 1);
        let properties = pipeline(&mut device, &shaders, 1);
        let builder = ShaderBindingTableBuilder::new(HitGroupIndexing::new(1).unwrap());
        let mut cmd = prism_test::MockCommandList::new();
        let instances = instances(&[0]);

        let sbt = builder
            .build(&mut device, &mut cmd, &properties, &shaders, &instances)
            .unwrap();
        device.submit(&mut cmd).unwrap();

        let (_, expected) = builder
            .encode(&device.limits(), &properties, &shaders, &instances)
            .unwrap();
        assert_eq!(device.read_buffer(sbt.buffer).unwrap(), &expected[..]);
        assert_eq!(sbt.ray_gen_region().address, sbt.address);
        assert_eq!(sbt.ray_gen_region().size, sbt.ray_gen_region().stride);
        assert_eq!(sbt.hit_region().address, sbt.address + sbt.layout.hit.offset);
        assert!(sbt.matches_instances(&instances));
        assert!(!sbt.matches_instances(&[]));
    }
}
