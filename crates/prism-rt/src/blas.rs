//! Bottom-level acceleration structures.
//!
//! One BLAS is built per logical mesh. Every geometry entry of the mesh
//! becomes one triangle geometry of the same structure.

use std::collections::BTreeMap;

use prism_core::{
    BufferDesc, BufferHandle, BufferUsage, BuildDesc, BuildFlags, BuildInputs, CommandList, Error,
    FenceValue, GeometryHandle, GeometryId, GeometryInputs, GpuDevice, MeshDesc, Result, Retired,
    RetireQueue, RtConfig,
};
use tracing::debug;

use crate::alloc::with_allocation;

/// Buffers backing one acceleration structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccelerationStructureBuffers {
    /// The structure itself; read by traces and by the TLAS build.
    pub result: BufferHandle,
    /// Build scratch. `None` once handed back for release.
    pub scratch: Option<BufferHandle>,
    /// Instance descriptor input (top level only).
    pub instance_descriptors: Option<BufferHandle>,
    /// Size reported by the prebuild query for `result`.
    pub result_size: u64,
}

impl AccelerationStructureBuffers {
    /// Queue every buffer for release after `fence`.
    pub fn retire(self, queue: &mut RetireQueue, fence: FenceValue) {
        for buffer in [Some(self.result), self.scratch, self.instance_descriptors]
            .into_iter()
            .flatten()
        {
            queue.retire(Retired::Buffer(buffer), fence);
        }
    }
}

/// A built bottom-level acceleration structure.
#[derive(Clone, Debug, PartialEq)]
pub struct Blas {
    pub id: GeometryId,
    pub buffers: AccelerationStructureBuffers,
    /// GPU address referenced by instance descriptors.
    pub address: u64,
    /// Geometry the structure was built from.
    pub geometries: Vec<GeometryHandle>,
}

impl Blas {
    /// Hand the scratch buffer back once the build is recorded.
    pub fn take_scratch(&mut self) -> Option<BufferHandle> {
        self.buffers.scratch.take()
    }

    /// Whether this structure was built from exactly `mesh`.
    pub fn matches(&self, mesh: &MeshDesc) -> bool {
        self.id == mesh.id && self.geometries == mesh.geometries
    }
}

/// Built BLAS keyed by geometry id.
#[derive(Debug, Default)]
pub struct BlasTable {
    entries: BTreeMap<GeometryId, Blas>,
}

impl BlasTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, blas: Blas) -> Option<Blas> {
        self.entries.insert(blas.id, blas)
    }

    pub fn get(&self, id: GeometryId) -> Option<&Blas> {
        self.entries.get(&id)
    }

    pub fn remove(&mut self, id: GeometryId) -> Option<Blas> {
        self.entries.remove(&id)
    }

    /// GPU address of the BLAS built for `id`.
    pub fn address_of(&self, id: GeometryId) -> Result<u64> {
        self.entries
            .get(&id)
            .map(|blas| blas.address)
            .ok_or_else(|| Error::InvalidInput(format!("no BLAS built for geometry {id:?}")))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Blas> {
        self.entries.values()
    }

    /// Remove every entry.
    pub fn drain(&mut self) -> impl Iterator<Item = Blas> {
        std::mem::take(&mut self.entries).into_values()
    }
}

/// Builds one BLAS per mesh.
#[derive(Clone, Copy, Debug)]
pub struct BottomLevelBuilder {
    flags: BuildFlags,
}

impl BottomLevelBuilder {
    pub fn new(config: &RtConfig) -> Self {
        Self {
            flags: config.blas_flags(),
        }
    }

    /// Size, allocate, and record the build of `mesh`.
    ///
    /// The recorded build is followed by a barrier on the result buffer, so
    /// later commands on `cmd` may read the structure. On failure nothing is
    /// left allocated.
    #[cfg_attr(feature = "profiling", tracing::instrument(level = "trace", skip_all))]
    pub fn build<D, C>(&self, device: &mut D, cmd: &mut C, mesh: &MeshDesc) -> Result<Blas>
    where
        D: GpuDevice,
        C: CommandList,
    {
        mesh.validate()?;

        let inputs = BuildInputs {
            geometry: GeometryInputs::Triangles(&mesh.geometries),
            flags: self.flags,
        };
        let sizes = device
            .query_prebuild_info(&inputs)
            .map_err(Error::into_allocation_failure)?;
        if sizes.result_size == 0 {
            return Err(Error::AllocationFailure(format!(
                "device reported a zero-sized BLAS for {:?}",
                mesh.id
            )));
        }

        let result_name = format!("blas{}", mesh.id.0);
        let scratch_name = format!("blas{}_scratch", mesh.id.0);
        let (result, scratch, address) = with_allocation(device, |device, allocation| {
            let result = allocation.create(
                device,
                &BufferDesc::new(
                    sizes.result_size,
                    BufferUsage::ACCELERATION_STRUCTURE,
                    &result_name,
                ),
            )?;
            let scratch = allocation.create(
                device,
                &BufferDesc::new(sizes.scratch_size.max(1), BufferUsage::SCRATCH, &scratch_name),
            )?;
            let address = device.buffer_address(result)?;

            cmd.build_acceleration_structure(&BuildDesc {
                inputs,
                instance_descriptors: None,
                source: None,
                destination: result,
                scratch,
            })?;
            cmd.insert_barrier(result)?;
            Ok((result, scratch, address))
        })?;

        debug!(
            "Recorded BLAS {:?}: {} geometries, {} triangles, {} bytes (scratch {})",
            mesh.id,
            mesh.geometries.len(),
            mesh.primitive_count(),
            sizes.result_size,
            sizes.scratch_size
        );

        Ok(Blas {
            id: mesh.id,
            buffers: AccelerationStructureBuffers {
                result,
                scratch: Some(scratch),
                instance_descriptors: None,
                result_size: sizes.result_size,
            },
            address,
            geometries: mesh.geometries.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_test::{Command, MockCommandList, SceneFixture};

    #[test]
    fn result_buffer_matches_prebuild_size() {
        let mut fixture = SceneFixture::new(1, 1).unwrap();
        let mut cmd = MockCommandList::new();
        let builder = BottomLevelBuilder::new(&RtConfig::default());

        for mesh in &fixture.meshes {
            let inputs = BuildInputs {
                geometry: GeometryInputs::Triangles(&mesh.geometries),
                flags: RtConfig::default().blas_flags(),
            };
            let expected = fixture.device.query_prebuild_info(&inputs).unwrap();
            let blas = builder.build(&mut fixture.device, &mut cmd, mesh).unwrap();

            assert_eq!(blas.buffers.result_size, expected.result_size);
            assert_eq!(
                fixture.device.buffer_size(blas.buffers.result).unwrap(),
                expected.result_size
            );
            assert_eq!(
                fixture.device.buffer_address(blas.buffers.result).unwrap(),
                blas.address
            );
        }

        fixture.device.submit(&mut cmd).unwrap();
        assert_eq!(fixture.device.builds_executed(), 2);
    }

    #[test]
    fn build_is_followed_by_barrier() {
        let mut fixture = SceneFixture::new(1, 1).unwrap();
        let mut cmd = MockCommandList::new();
        let blas = BottomLevelBuilder::new(&RtConfig::default())
            .build(&mut fixture.device, &mut cmd, &fixture.meshes[0])
            .unwrap();

        match cmd.commands() {
            [Command::Build(build), Command::Barrier(barrier)] => {
                assert_eq!(build.destination, blas.buffers.result);
                assert_eq!(*barrier, blas.buffers.result);
            }
            other => panic!("unexpected commands: {other:?}"),
        }
    }

    #[test]
    fn allocation_failure_leaves_nothing_behind() {
        let mut fixture = SceneFixture::new(1, 1).unwrap();
        let before = fixture.device.live_buffer_count();
        let mut cmd = MockCommandList::new();
        // Result buffer succeeds, scratch fails.
        fixture.device.fail_allocation_after(1);

        let err = BottomLevelBuilder::new(&RtConfig::default())
            .build(&mut fixture.device, &mut cmd, &fixture.meshes[0])
            .unwrap_err();

        assert!(matches!(err, Error::AllocationFailure(_)));
        assert_eq!(fixture.device.live_buffer_count(), before);
        assert!(cmd.is_empty());
    }

    #[test]
    fn failed_size_query_is_an_allocation_failure() {
        let mut fixture = SceneFixture::new(1, 1).unwrap();
        fixture.device.fail_prebuild_queries(true);
        let err = BottomLevelBuilder::new(&RtConfig::default())
            .build(&mut fixture.device, &mut MockCommandList::new(), &fixture.meshes[1])
            .unwrap_err();
        assert!(matches!(err, Error::AllocationFailure(_)));
    }

    #[test]
    fn empty_mesh_rejected() {
        let mut fixture = SceneFixture::new(1, 1).unwrap();
        let mesh = MeshDesc {
            id: GeometryId(9),
            geometries: Vec::new(),
        };
        let err = BottomLevelBuilder::new(&RtConfig::default())
            .build(&mut fixture.device, &mut MockCommandList::new(), &mesh)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn table_lookup() {
        let mut fixture = SceneFixture::new(1, 1).unwrap();
        let mut cmd = MockCommandList::new();
        let builder = BottomLevelBuilder::new(&RtConfig::default());
        let mut table = BlasTable::new();
        for mesh in &fixture.meshes {
            table.insert(builder.build(&mut fixture.device, &mut cmd, mesh).unwrap());
        }

        assert_eq!(table.len(), 2);
        assert!(table.get(SceneFixture::QUAD).unwrap().matches(&fixture.meshes[1]));
        assert!(!table.get(SceneFixture::QUAD).unwrap().matches(&fixture.meshes[0]));
        assert!(matches!(
            table.address_of(GeometryId(42)),
            Err(Error::InvalidInput(_))
        ));
    }
}
