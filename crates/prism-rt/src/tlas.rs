//! Top-level acceleration structure.
//!
//! The TLAS places every instance of the ordered instance list. Position in
//! the list is the instance index seen by hit shaders, written into each
//! descriptor as the instance id, and determines the hit-group contribution
//! through [`HitGroupIndexing`].

use prism_core::constants::{INSTANCE_DESCRIPTOR_SIZE, MAX_INSTANCE_FIELD};
use prism_core::{
    BufferDesc, BufferHandle, BufferUsage, BuildDesc, BuildFlags, BuildInputs, CommandList, Error,
    FenceValue, GeometryInputs, GpuDevice, HitGroupIndexing, Instance, InstanceDescriptor, Result,
    RetireQueue, RtConfig,
};
use tracing::{debug, trace};

use crate::alloc::with_allocation;
use crate::blas::{AccelerationStructureBuffers, BlasTable};

/// How a TLAS was brought up to date.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    /// Transforms rewritten and the structure updated in place.
    Refit,
    /// New buffers and a full build.
    Rebuild,
}

/// What the dispatch collaborator binds to trace against the scene.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TlasHandle {
    pub buffer: BufferHandle,
    pub address: u64,
    /// Incremented on every full rebuild.
    pub generation: u64,
    pub instance_count: u32,
}

/// A built top-level acceleration structure.
#[derive(Debug)]
pub struct Tlas {
    pub buffers: AccelerationStructureBuffers,
    pub address: u64,
    pub generation: u64,
    instance_count: u32,
    /// BLAS address per instance index at the last full build.
    blas_addresses: Vec<u64>,
    allow_update: bool,
}

impl Tlas {
    pub fn handle(&self) -> TlasHandle {
        TlasHandle {
            buffer: self.buffers.result,
            address: self.address,
            generation: self.generation,
            instance_count: self.instance_count,
        }
    }

    pub const fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// Whether `instances` can be applied by an in-place refit: the structure
    /// allows updates and both the instance count and the BLAS at every index
    /// are unchanged since the last full build.
    pub fn can_refit(&self, instances: &[Instance], blas: &BlasTable) -> bool {
        self.allow_update
            && self.blas_addresses.len() == instances.len()
            && instances
                .iter()
                .zip(&self.blas_addresses)
                .all(|(instance, &address)| blas.address_of(instance.geometry) == Ok(address))
    }

    /// Queue every buffer for release after `fence`.
    pub fn retire(self, queue: &mut RetireQueue, fence: FenceValue) {
        debug!("Retiring TLAS generation {} after fence {fence}", self.generation);
        self.buffers.retire(queue, fence);
    }

    /// Hand the scratch buffer back when it is not kept for refits.
    pub fn take_scratch_if_unused(&mut self) -> Option<BufferHandle> {
        if self.allow_update {
            None
        } else {
            self.buffers.scratch.take()
        }
    }
}

/// Builds and refits the TLAS.
#[derive(Clone, Copy, Debug)]
pub struct TopLevelBuilder {
    flags: BuildFlags,
    indexing: HitGroupIndexing,
}

impl TopLevelBuilder {
    pub fn new(config: &RtConfig, indexing: HitGroupIndexing) -> Self {
        Self {
            flags: config.tlas_flags(),
            indexing,
        }
    }

    pub const fn indexing(&self) -> HitGroupIndexing {
        self.indexing
    }

    /// Instance descriptors for `instances`, in order.
    pub fn instance_descriptors(
        &self,
        instances: &[Instance],
        blas: &BlasTable,
    ) -> Result<Vec<InstanceDescriptor>> {
        instances
            .iter()
            .enumerate()
            .map(|(index, instance)| {
                let index = u32::try_from(index)
                    .ok()
                    .filter(|&index| index <= MAX_INSTANCE_FIELD)
                    .ok_or_else(|| {
                        Error::InvalidInput(format!(
                            "instance {index} exceeds the 24-bit instance id range"
                        ))
                    })?;
                Ok(InstanceDescriptor::new(
                    &instance.transform,
                    index,
                    self.indexing.instance_contribution(index)?,
                    blas.address_of(instance.geometry)?,
                ))
            })
            .collect()
    }

    /// Allocate new buffers and record a full build of `instances`.
    ///
    /// Every referenced BLAS must already be built, with a barrier recorded
    /// on `cmd` after its build. The build is followed by a barrier on the
    /// result buffer. On failure nothing is left allocated.
    #[cfg_attr(feature = "profiling", tracing::instrument(level = "trace", skip_all))]
    pub fn build<D, C>(
        &self,
        device: &mut D,
        cmd: &mut C,
        instances: &[Instance],
        blas: &BlasTable,
        generation: u64,
    ) -> Result<Tlas>
    where
        D: GpuDevice,
        C: CommandList,
    {
        let descriptors = self.instance_descriptors(instances, blas)?;
        let count = descriptors.len() as u32;

        let inputs = BuildInputs {
            geometry: GeometryInputs::Instances { count },
            flags: self.flags,
        };
        let sizes = device
            .query_prebuild_info(&inputs)
            .map_err(Error::into_allocation_failure)?;
        if sizes.result_size == 0 {
            return Err(Error::AllocationFailure(
                "device reported a zero-sized TLAS".to_string(),
            ));
        }
        let allow_update = self.flags.contains(BuildFlags::ALLOW_UPDATE);
        let scratch_size = if allow_update {
            sizes.scratch_size.max(sizes.update_scratch_size)
        } else {
            sizes.scratch_size
        };
        // An empty TLAS still needs an addressable instance buffer.
        let instance_bytes = u64::from(count.max(1)) * INSTANCE_DESCRIPTOR_SIZE;

        let (result, scratch, instance_buffer, address) =
            with_allocation(device, |device, allocation| {
                let instance_buffer = allocation.create(
                    device,
                    &BufferDesc::new(
                        instance_bytes,
                        BufferUsage::BUILD_INPUT | BufferUsage::UPLOAD,
                        "tlas_instances",
                    ),
                )?;
                let result = allocation.create(
                    device,
                    &BufferDesc::new(
                        sizes.result_size,
                        BufferUsage::ACCELERATION_STRUCTURE,
                        "tlas",
                    ),
                )?;
                let scratch = allocation.create(
                    device,
                    &BufferDesc::new(scratch_size.max(1), BufferUsage::SCRATCH, "tlas_scratch"),
                )?;
                let address = device.buffer_address(result)?;

                if !descriptors.is_empty() {
                    cmd.copy_bytes(instance_buffer, 0, bytemuck::cast_slice(&descriptors))?;
                }
                cmd.build_acceleration_structure(&BuildDesc {
                    inputs,
                    instance_descriptors: Some(instance_buffer),
                    source: None,
                    destination: result,
                    scratch,
                })?;
                cmd.insert_barrier(result)?;
                Ok((result, scratch, instance_buffer, address))
            })?;

        debug!(
            "Recorded TLAS generation {generation}: {count} instances, {} bytes (scratch {scratch_size})",
            sizes.result_size
        );

        Ok(Tlas {
            buffers: AccelerationStructureBuffers {
                result,
                scratch: Some(scratch),
                instance_descriptors: Some(instance_buffer),
                result_size: sizes.result_size,
            },
            address,
            generation,
            instance_count: count,
            blas_addresses: descriptors.iter().map(|d| d.blas_address).collect(),
            allow_update,
        })
    }

    /// Rewrite transforms and record an in-place update of `tlas`.
    ///
    /// Fails with [`Error::InvalidInput`] unless [`Tlas::can_refit`] holds.
    /// The caller must only refit once no submitted trace still reads `tlas`.
    #[cfg_attr(feature = "profiling", tracing::instrument(level = "trace", skip_all))]
    pub fn refit<C: CommandList>(
        &self,
        cmd: &mut C,
        tlas: &mut Tlas,
        instances: &[Instance],
        blas: &BlasTable,
    ) -> Result<()> {
        if !tlas.can_refit(instances, blas) {
            return Err(Error::InvalidInput(
                "refit needs an updatable TLAS with the same instance count and BLAS per index"
                    .to_string(),
            ));
        }
        let (Some(scratch), Some(instance_buffer)) =
            (tlas.buffers.scratch, tlas.buffers.instance_descriptors)
        else {
            return Err(Error::InvalidInput(
                "TLAS no longer owns its refit buffers".to_string(),
            ));
        };

        let descriptors = self.instance_descriptors(instances, blas)?;
        if !descriptors.is_empty() {
            cmd.copy_bytes(instance_buffer, 0, bytemuck::cast_slice(&descriptors))?;
        }
        cmd.build_acceleration_structure(&BuildDesc {
            inputs: BuildInputs {
                geometry: GeometryInputs::Instances {
                    count: tlas.instance_count,
                },
                flags: self.flags,
            },
            instance_descriptors: Some(instance_buffer),
            source: Some(tlas.buffers.result),
            destination: tlas.buffers.result,
            scratch,
        })?;
        cmd.insert_barrier(tlas.buffers.result)?;

        trace!(
            "Recorded TLAS refit (generation {}, {} instances)",
            tlas.generation,
            tlas.instance_count
        );
        Ok(())
    }
}
