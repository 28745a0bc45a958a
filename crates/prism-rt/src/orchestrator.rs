//! Scene-level sequencing of the builders.
//!
//! The orchestrator owns every structure it builds. Replaced resources are
//! never destroyed in place: they are retired with the fence value of the
//! submission that replaced them and released once the caller reports that
//! fence complete.

use std::collections::HashSet;

use prism_core::{
    BufferHandle, CommandList, Error, FenceValue, GeometryId, GpuDevice, HitGroupIndexing,
    Instance, MeshDesc, PipelineHandle, Result, Retired, RetireQueue, RtConfig, ShaderSet,
};
use tracing::{debug, info, warn};

use crate::blas::{BlasTable, BottomLevelBuilder};
use crate::pipeline::{RaytracingPipeline, RaytracingPipelineAssembler};
use crate::sbt::{ShaderBindingTable, ShaderBindingTableBuilder};
use crate::tlas::{Tlas, TlasHandle, TopLevelBuilder, UpdateKind};

/// Resources created by one `build_all` before they replace the current scene.
struct Staged<P> {
    blas: BlasTable,
    /// Meshes whose BLAS was built in this pass.
    fresh: Vec<GeometryId>,
    /// Build scratch, released after the submission completes.
    scratch: Vec<BufferHandle>,
    tlas: Option<Tlas>,
    pipeline: Option<RaytracingPipeline<P>>,
    sbt: Option<ShaderBindingTable>,
}

impl<P> Staged<P> {
    fn new() -> Self {
        Self {
            blas: BlasTable::new(),
            fresh: Vec::new(),
            scratch: Vec::new(),
            tlas: None,
            pipeline: None,
            sbt: None,
        }
    }

    /// Queue everything created so far for release.
    ///
    /// Commands already recorded may reference these buffers, so they wait
    /// for `fence` like any replaced resource.
    fn abandon(mut self, queue: &mut RetireQueue, fence: FenceValue) {
        for id in self.fresh {
            if let Some(blas) = self.blas.remove(id) {
                blas.buffers.retire(queue, fence);
            }
        }
        for scratch in self.scratch {
            queue.retire(Retired::Buffer(scratch), fence);
        }
        if let Some(tlas) = self.tlas {
            tlas.retire(queue, fence);
        }
        if let Some(pipeline) = self.pipeline {
            queue.retire(Retired::Pipeline(pipeline.handle), fence);
        }
        if let Some(sbt) = self.sbt {
            sbt.retire(queue, fence);
        }
    }
}

/// Builds and owns the BLAS set, TLAS, pipeline, and SBT of one scene.
pub struct AccelerationStructureOrchestrator<D: GpuDevice> {
    config: RtConfig,
    blas_builder: BottomLevelBuilder,
    tlas_builder: TopLevelBuilder,
    assembler: RaytracingPipelineAssembler,
    sbt_builder: ShaderBindingTableBuilder,
    blas: BlasTable,
    tlas: Option<Tlas>,
    pipeline: Option<RaytracingPipeline<D::Properties>>,
    sbt: Option<ShaderBindingTable>,
    shaders: Option<ShaderSet>,
    instances: Vec<Instance>,
    generation: u64,
    retired: RetireQueue,
}

impl<D: GpuDevice> AccelerationStructureOrchestrator<D> {
    /// Create an orchestrator for `device`, validating `config` against its limits.
    pub fn new(device: &D, config: RtConfig) -> Result<Self> {
        config.validate(&device.limits())?;
        let indexing = HitGroupIndexing::new(config.ray_type_count)?;

        info!(
            "Ray tracing core ready: {} ray types, recursion {}, {:?}",
            config.ray_type_count, config.max_recursion_depth, config.build_preference
        );

        Ok(Self {
            blas_builder: BottomLevelBuilder::new(&config),
            tlas_builder: TopLevelBuilder::new(&config, indexing),
            assembler: RaytracingPipelineAssembler::new(&config),
            sbt_builder: ShaderBindingTableBuilder::new(indexing),
            config,
            blas: BlasTable::new(),
            tlas: None,
            pipeline: None,
            sbt: None,
            shaders: None,
            instances: Vec::new(),
            generation: 0,
            retired: RetireQueue::new(),
        })
    }

    pub fn config(&self) -> &RtConfig {
        &self.config
    }

    /// Build the whole scene: BLAS per mesh, TLAS, pipeline, and SBT.
    ///
    /// `fence` is the value the submission of `cmd` will signal; everything
    /// replaced by this call is released once it completes. A BLAS whose mesh
    /// is unchanged since the previous build is kept. Every structure written
    /// is followed by a barrier on `cmd`, so a dispatch recorded afterwards
    /// reads complete data.
    ///
    /// The shader set is validated before any command is recorded. On a later
    /// failure the current scene stays in place and the partial build is
    /// retired with `fence`.
    #[cfg_attr(feature = "profiling", tracing::instrument(level = "trace", skip_all))]
    pub fn build_all<C: CommandList>(
        &mut self,
        device: &mut D,
        cmd: &mut C,
        meshes: &[MeshDesc],
        instances: &[Instance],
        shaders: ShaderSet,
        fence: FenceValue,
    ) -> Result<()> {
        self.assembler.describe(&shaders, &device.limits())?;

        let mut ids = HashSet::with_capacity(meshes.len());
        for mesh in meshes {
            if !ids.insert(mesh.id) {
                return Err(Error::InvalidInput(format!(
                    "mesh {:?} listed twice",
                    mesh.id
                )));
            }
        }
        for (index, instance) in instances.iter().enumerate() {
            if !ids.contains(&instance.geometry) {
                return Err(Error::InvalidInput(format!(
                    "instance {index} references unknown mesh {:?}",
                    instance.geometry
                )));
            }
        }
        check_hit_bindings(instances, &shaders)?;

        let mut staged = Staged::new();
        if let Err(e) = self.stage(device, cmd, meshes, instances, &shaders, &mut staged) {
            warn!("Scene build failed, discarding partial resources: {e}");
            staged.abandon(&mut self.retired, fence);
            return Err(e);
        }

        // Old BLAS not carried over, and everything the new scene replaces.
        for old in self.blas.drain() {
            let kept = staged
                .blas
                .get(old.id)
                .is_some_and(|blas| blas.buffers.result == old.buffers.result);
            if !kept {
                old.buffers.retire(&mut self.retired, fence);
            }
        }
        if let Some(tlas) = self.tlas.take() {
            tlas.retire(&mut self.retired, fence);
        }
        if let Some(pipeline) = self.pipeline.take() {
            self.retired.retire(Retired::Pipeline(pipeline.handle), fence);
        }
        if let Some(sbt) = self.sbt.take() {
            sbt.retire(&mut self.retired, fence);
        }
        for scratch in staged.scratch {
            self.retired.retire(Retired::Buffer(scratch), fence);
        }

        self.generation += 1;
        info!(
            "Built scene generation {}: {} meshes ({} rebuilt), {} instances",
            self.generation,
            staged.blas.len(),
            staged.fresh.len(),
            instances.len()
        );

        self.blas = staged.blas;
        self.tlas = staged.tlas;
        self.pipeline = staged.pipeline;
        self.sbt = staged.sbt;
        self.shaders = Some(shaders);
        self.instances = instances.to_vec();
        Ok(())
    }

    fn stage<C: CommandList>(
        &self,
        device: &mut D,
        cmd: &mut C,
        meshes: &[MeshDesc],
        instances: &[Instance],
        shaders: &ShaderSet,
        staged: &mut Staged<D::Properties>,
    ) -> Result<()> {
        for mesh in meshes {
            match self.blas.get(mesh.id) {
                Some(blas) if blas.matches(mesh) => {
                    staged.blas.insert(blas.clone());
                }
                _ => {
                    let mut blas = self.blas_builder.build(device, cmd, mesh)?;
                    staged.scratch.extend(blas.take_scratch());
                    staged.fresh.push(mesh.id);
                    staged.blas.insert(blas);
                }
            }
        }

        let mut tlas =
            self.tlas_builder
                .build(device, cmd, instances, &staged.blas, self.generation + 1)?;
        staged.scratch.extend(tlas.take_scratch_if_unused());
        staged.tlas = Some(tlas);

        let pipeline = staged
            .pipeline
            .insert(self.assembler.assemble(device, shaders)?);
        staged.sbt = Some(self.sbt_builder.build(
            device,
            cmd,
            &pipeline.properties,
            shaders,
            instances,
        )?);
        Ok(())
    }

    /// Apply a new instance list to the built scene.
    ///
    /// Refits the TLAS in place when the instance count and the BLAS at every
    /// index are unchanged, otherwise rebuilds it. The SBT hit region is
    /// rewritten when the instance count or any hit binding changed.
    ///
    /// A refit overwrites the structure read by earlier traces: call this only
    /// once the previous frame's work on the TLAS has completed.
    #[cfg_attr(feature = "profiling", tracing::instrument(level = "trace", skip_all))]
    pub fn update_transforms<C: CommandList>(
        &mut self,
        device: &mut D,
        cmd: &mut C,
        instances: &[Instance],
        fence: FenceValue,
    ) -> Result<UpdateKind> {
        let (Some(tlas), Some(pipeline), Some(sbt), Some(shaders)) = (
            self.tlas.as_mut(),
            self.pipeline.as_ref(),
            self.sbt.as_ref(),
            self.shaders.as_ref(),
        ) else {
            return Err(Error::InvalidInput(
                "update_transforms called before build_all".to_string(),
            ));
        };
        check_hit_bindings(instances, shaders)?;
        for (index, instance) in instances.iter().enumerate() {
            if self.blas.get(instance.geometry).is_none() {
                return Err(Error::InvalidInput(format!(
                    "instance {index} references unknown mesh {:?}",
                    instance.geometry
                )));
            }
        }

        let new_sbt = if sbt.matches_instances(instances) {
            None
        } else {
            Some(self.sbt_builder.build(
                device,
                cmd,
                &pipeline.properties,
                shaders,
                instances,
            )?)
        };

        let kind = if tlas.can_refit(instances, &self.blas) {
            if let Err(e) = self.tlas_builder.refit(cmd, tlas, instances, &self.blas) {
                if let Some(sbt) = new_sbt {
                    sbt.retire(&mut self.retired, fence);
                }
                return Err(e);
            }
            UpdateKind::Refit
        } else {
            warn!(
                "TLAS refit not possible ({} -> {} instances or BLAS changed), rebuilding",
                tlas.instance_count(),
                instances.len()
            );
            let rebuilt = self.tlas_builder.build(
                device,
                cmd,
                instances,
                &self.blas,
                self.generation + 1,
            );
            let mut rebuilt = match rebuilt {
                Ok(rebuilt) => rebuilt,
                Err(e) => {
                    if let Some(sbt) = new_sbt {
                        sbt.retire(&mut self.retired, fence);
                    }
                    return Err(e);
                }
            };
            if let Some(scratch) = rebuilt.take_scratch_if_unused() {
                self.retired.retire(Retired::Buffer(scratch), fence);
            }
            if let Some(old) = self.tlas.replace(rebuilt) {
                old.retire(&mut self.retired, fence);
            }
            self.generation += 1;
            UpdateKind::Rebuild
        };

        if let Some(sbt) = new_sbt {
            if let Some(old) = self.sbt.replace(sbt) {
                old.retire(&mut self.retired, fence);
            }
        }
        self.instances = instances.to_vec();

        debug!("Updated {} instances ({kind:?})", instances.len());
        Ok(kind)
    }

    /// What the dispatch binds to trace against the scene.
    pub fn tlas_handle(&self) -> Option<TlasHandle> {
        self.tlas.as_ref().map(Tlas::handle)
    }

    pub fn shader_binding_table(&self) -> Option<&ShaderBindingTable> {
        self.sbt.as_ref()
    }

    pub fn pipeline_handle(&self) -> Option<PipelineHandle> {
        self.pipeline.as_ref().map(|pipeline| pipeline.handle)
    }

    /// Shader identifier source of the current pipeline.
    pub fn properties(&self) -> Option<&D::Properties> {
        self.pipeline.as_ref().map(|pipeline| &pipeline.properties)
    }

    pub fn bottom_level(&self) -> &BlasTable {
        &self.blas
    }

    /// Instance list of the current TLAS.
    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    /// Scene generation; bumped by every full TLAS build.
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Release retired resources whose fence value has completed.
    pub fn release_completed(&mut self, device: &mut D, completed: FenceValue) -> Result<usize> {
        let released = self
            .retired
            .release_completed(completed, |resource| release(device, resource))?;
        if released > 0 {
            debug!("Released {released} resources up to fence {completed}");
        }
        Ok(released)
    }

    /// Number of retired resources waiting for their fence.
    pub fn pending_release_count(&self) -> usize {
        self.retired.pending_count()
    }

    /// Destroy every owned resource.
    ///
    /// The device must be idle: nothing waits for a fence.
    pub fn destroy(mut self, device: &mut D) -> Result<()> {
        for blas in self.blas.drain() {
            blas.buffers.retire(&mut self.retired, 0);
        }
        if let Some(tlas) = self.tlas.take() {
            tlas.retire(&mut self.retired, 0);
        }
        if let Some(pipeline) = self.pipeline.take() {
            self.retired.retire(Retired::Pipeline(pipeline.handle), 0);
        }
        if let Some(sbt) = self.sbt.take() {
            sbt.retire(&mut self.retired, 0);
        }
        let released = self.retired.flush(|resource| release(device, resource))?;
        info!("Destroyed ray tracing scene ({released} resources)");
        Ok(())
    }
}

fn check_hit_bindings(instances: &[Instance], shaders: &ShaderSet) -> Result<()> {
    let available = shaders.hit_bindings.len();
    match instances
        .iter()
        .position(|instance| instance.hit_binding as usize >= available)
    {
        Some(index) => Err(Error::InvalidInput(format!(
            "instance {index} uses hit binding {}, only {available} exist",
            instances[index].hit_binding
        ))),
        None => Ok(()),
    }
}

fn release<D: GpuDevice>(device: &mut D, resource: Retired) -> Result<()> {
    match resource {
        Retired::Buffer(buffer) => device.destroy_buffer(buffer),
        Retired::Pipeline(pipeline) => device.destroy_pipeline(pipeline),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::{Mat4, Vec3};
    use prism_core::{BufferUsage, Ray, ShaderIdentifierSource};
    use prism_test::{
        hit_record_arguments, init_tracing, MockCommandList, MockDevice, MockProperties,
        SceneFixture,
    };

    type Orchestrator = AccelerationStructureOrchestrator<MockDevice>;

    fn at(x: f32) -> Mat4 {
        Mat4::from_translation(Vec3::new(x, 0.0, 0.0))
    }

    fn ray_at(x: f32) -> Ray {
        Ray::new(Vec3::new(x, 0.0, 5.0), Vec3::new(0.0, 0.0, -1.0))
    }

    fn triangles(placements: &[(f32, u32)]) -> Vec<Instance> {
        placements
            .iter()
            .map(|&(x, binding)| Instance::new(SceneFixture::TRIANGLE, at(x), binding))
            .collect()
    }

    /// Build `instances` over the fixture and submit.
    fn built(
        ray_types: u32,
        bindings: u32,
        instances: &[Instance],
    ) -> (SceneFixture, Orchestrator) {
        init_tracing();
        let mut fixture = SceneFixture::new(ray_types, bindings).unwrap();
        let config = RtConfig::default().with_ray_types(ray_types);
        let mut orchestrator = Orchestrator::new(&fixture.device, config).unwrap();
        let mut cmd = MockCommandList::new();
        orchestrator
            .build_all(
                &mut fixture.device,
                &mut cmd,
                &fixture.meshes,
                instances,
                fixture.shaders.clone(),
                1,
            )
            .unwrap();
        fixture.device.submit(&mut cmd).unwrap();
        (fixture, orchestrator)
    }

    /// Identifier and local arguments stored in the hit record the hardware
    /// would invoke for `hit`.
    fn invoked_record(
        device: &MockDevice,
        orchestrator: &Orchestrator,
        record_index: u32,
    ) -> (Vec<u8>, Vec<u8>) {
        let sbt = orchestrator.shader_binding_table().unwrap();
        let offset = sbt.hit_record_offset(record_index).unwrap() as usize;
        let bytes = device.read_buffer(sbt.buffer).unwrap();
        (
            bytes[offset..offset + 32].to_vec(),
            bytes[offset + 32..offset + 40].to_vec(),
        )
    }

    fn identifier(orchestrator: &Orchestrator, program: &str) -> Vec<u8> {
        let properties: &MockProperties = orchestrator.properties().unwrap();
        properties.shader_identifier(program).unwrap().as_bytes().to_vec()
    }

    #[test]
    fn single_triangle_scene() {
        let instances = [Instance::new(SceneFixture::TRIANGLE, Mat4::IDENTITY, 0)];
        let (fixture, orchestrator) = built(1, 1, &instances);

        let sbt = orchestrator.shader_binding_table().unwrap();
        let layout = sbt.layout;
        assert_eq!(layout.ray_gen.record_count, 1);
        assert_eq!(layout.miss.record_count, 1);
        assert_eq!(layout.hit.record_count, 1);
        assert!(layout.ray_gen.end() <= layout.miss.offset);
        assert!(layout.miss.end() <= layout.hit.offset);
        assert_eq!(
            fixture.device.buffer_usage(sbt.buffer).unwrap(),
            BufferUsage::SHADER_TABLE | BufferUsage::UPLOAD
        );

        let tlas = orchestrator.tlas_handle().unwrap();
        assert_eq!(tlas.instance_count, 1);
        assert_eq!(tlas.generation, 1);
        assert_eq!(fixture.device.instance_count(tlas.buffer).unwrap(), 1);

        let hit = fixture
            .device
            .trace_ray(tlas.buffer, &ray_at(0.0), 0)
            .unwrap()
            .unwrap();
        assert_eq!(hit.instance_index, 0);
        assert_eq!(hit.record_index, 0);
        assert_relative_eq!(hit.t, 5.0, epsilon = 1e-5);

        let (id, arguments) = invoked_record(&fixture.device, &orchestrator, hit.record_index);
        assert_eq!(id, identifier(&orchestrator, "HitGroup"));
        assert_eq!(arguments, hit_record_arguments(0, 0));
    }

    #[test]
    fn shrinking_instance_list_rebuilds() {
        let (mut fixture, mut orchestrator) =
            built(1, 1, &triangles(&[(-3.0, 0), (0.0, 0), (3.0, 0)]));
        let old = orchestrator.tlas_handle().unwrap();

        let mut cmd = MockCommandList::new();
        let kind = orchestrator
            .update_transforms(&mut fixture.device, &mut cmd, &triangles(&[(-3.0, 0), (0.0, 0)]), 2)
            .unwrap();
        fixture.device.submit(&mut cmd).unwrap();

        assert_eq!(kind, UpdateKind::Rebuild);
        let tlas = orchestrator.tlas_handle().unwrap();
        assert_ne!(tlas.buffer, old.buffer);
        assert_eq!(tlas.generation, old.generation + 1);
        assert_eq!(tlas.instance_count, 2);
        assert_eq!(fixture.device.instance_count(tlas.buffer).unwrap(), 2);
        assert_eq!(
            orchestrator.shader_binding_table().unwrap().layout.hit.record_count,
            2
        );
        assert!(fixture
            .device
            .trace_ray(tlas.buffer, &ray_at(3.0), 0)
            .unwrap()
            .is_none());
    }

    #[test]
    fn oversized_local_arguments_fail_before_recording() {
        init_tracing();
        let mut fixture = SceneFixture::new(1, 1).unwrap();
        let mut shaders = fixture.shaders.clone();
        // HitLocal declares 8 bytes.
        shaders.hit_bindings[0].records[0].local_arguments = vec![0; 12];
        let mut orchestrator = Orchestrator::new(&fixture.device, RtConfig::default()).unwrap();
        let before = fixture.device.live_buffer_count();
        let mut cmd = MockCommandList::new();

        let err = orchestrator
            .build_all(
                &mut fixture.device,
                &mut cmd,
                &fixture.meshes,
                &triangles(&[(0.0, 0)]),
                shaders,
                1,
            )
            .unwrap_err();

        assert!(matches!(err, Error::LayoutViolation(_)));
        assert!(cmd.is_empty());
        assert_eq!(fixture.device.live_buffer_count(), before);
        assert_eq!(fixture.device.live_pipeline_count(), 0);
        assert!(orchestrator.tlas_handle().is_none());
    }

    #[test]
    fn swapped_instances_keep_records_consistent() {
        let (mut fixture, mut orchestrator) = built(2, 2, &triangles(&[(-3.0, 0), (3.0, 1)]));
        let tlas = orchestrator.tlas_handle().unwrap();
        let before = fixture
            .device
            .trace_ray(tlas.buffer, &ray_at(3.0), 0)
            .unwrap()
            .unwrap();
        assert_eq!(before.instance_index, 1);
        assert_eq!(before.record_index, 2);

        let mut cmd = MockCommandList::new();
        let kind = orchestrator
            .update_transforms(
                &mut fixture.device,
                &mut cmd,
                &triangles(&[(3.0, 1), (-3.0, 0)]),
                2,
            )
            .unwrap();
        fixture.device.submit(&mut cmd).unwrap();
        // Same BLAS at every index: refit, with the hit region rewritten.
        assert_eq!(kind, UpdateKind::Refit);

        let tlas = orchestrator.tlas_handle().unwrap();
        for ray_type in 0..2 {
            let hit = fixture
                .device
                .trace_ray(tlas.buffer, &ray_at(3.0), ray_type)
                .unwrap()
                .unwrap();
            assert_eq!(hit.instance_index, 0);
            assert_eq!(hit.instance_id, 0);
            assert_eq!(hit.record_index, ray_type);

            let group = if ray_type == 0 { "HitGroup" } else { "ShadowHitGroup" };
            let (id, arguments) =
                invoked_record(&fixture.device, &orchestrator, hit.record_index);
            assert_eq!(id, identifier(&orchestrator, group));
            assert_eq!(arguments, hit_record_arguments(1, ray_type));
        }
    }

    #[test]
    fn refit_with_identical_transforms_keeps_hits() {
        let instances = triangles(&[(-3.0, 0), (3.0, 0)]);
        let (mut fixture, mut orchestrator) = built(1, 1, &instances);
        let tlas = orchestrator.tlas_handle().unwrap();
        let rays = [ray_at(-3.0), ray_at(3.0), ray_at(0.0)];
        let before: Vec<_> = rays
            .iter()
            .map(|ray| fixture.device.trace_ray(tlas.buffer, ray, 0).unwrap())
            .collect();
        let sbt = orchestrator.shader_binding_table().unwrap().buffer;
        let pending = orchestrator.pending_release_count();

        let mut cmd = MockCommandList::new();
        let kind = orchestrator
            .update_transforms(&mut fixture.device, &mut cmd, &instances, 2)
            .unwrap();
        fixture.device.submit(&mut cmd).unwrap();

        assert_eq!(kind, UpdateKind::Refit);
        assert_eq!(orchestrator.tlas_handle().unwrap(), tlas);
        assert_eq!(orchestrator.shader_binding_table().unwrap().buffer, sbt);
        let after: Vec<_> = rays
            .iter()
            .map(|ray| fixture.device.trace_ray(tlas.buffer, ray, 0).unwrap())
            .collect();
        assert_eq!(before, after);
        assert_eq!(orchestrator.pending_release_count(), pending);
    }

    #[test]
    fn changed_geometry_at_an_index_rebuilds() {
        let (mut fixture, mut orchestrator) = built(1, 1, &triangles(&[(0.0, 0)]));
        let mut cmd = MockCommandList::new();
        let kind = orchestrator
            .update_transforms(
                &mut fixture.device,
                &mut cmd,
                &[Instance::new(SceneFixture::QUAD, Mat4::IDENTITY, 0)],
                2,
            )
            .unwrap();
        fixture.device.submit(&mut cmd).unwrap();

        assert_eq!(kind, UpdateKind::Rebuild);
        let hit = fixture
            .device
            .trace_ray(orchestrator.tlas_handle().unwrap().buffer, &ray_at(0.9), 0)
            .unwrap();
        // Outside the triangle, inside the quad.
        assert!(hit.is_some());
    }

    #[test]
    fn replaced_resources_wait_for_their_fence() {
        let (mut fixture, mut orchestrator) = built(1, 1, &triangles(&[(0.0, 0)]));
        let old_tlas = orchestrator.tlas_handle().unwrap().buffer;
        let old_sbt = orchestrator.shader_binding_table().unwrap().buffer;

        let mut cmd = MockCommandList::new();
        orchestrator
            .update_transforms(
                &mut fixture.device,
                &mut cmd,
                &triangles(&[(0.0, 0), (3.0, 0)]),
                5,
            )
            .unwrap();
        fixture.device.submit(&mut cmd).unwrap();
        assert!(orchestrator.pending_release_count() > 0);

        // Build scratch retired at fence 1 goes first.
        orchestrator.release_completed(&mut fixture.device, 4).unwrap();
        assert!(fixture.device.is_buffer_live(old_tlas));
        assert!(fixture.device.is_buffer_live(old_sbt));

        let released = orchestrator.release_completed(&mut fixture.device, 5).unwrap();
        assert!(released >= 2);
        assert_eq!(orchestrator.pending_release_count(), 0);
        assert!(!fixture.device.is_buffer_live(old_tlas));
        assert!(matches!(
            fixture.device.read_buffer(old_sbt),
            Err(Error::StaleHandle(_))
        ));
    }

    #[test]
    fn unchanged_meshes_keep_their_blas() {
        let instances = triangles(&[(0.0, 0)]);
        let (mut fixture, mut orchestrator) = built(1, 1, &instances);
        let blas_before = orchestrator
            .bottom_level()
            .get(SceneFixture::QUAD)
            .unwrap()
            .buffers
            .result;
        let pipeline_before = orchestrator.pipeline_handle().unwrap();
        let builds = fixture.device.builds_executed();

        let mut cmd = MockCommandList::new();
        orchestrator
            .build_all(
                &mut fixture.device,
                &mut cmd,
                &fixture.meshes,
                &instances,
                fixture.shaders.clone(),
                2,
            )
            .unwrap();
        fixture.device.submit(&mut cmd).unwrap();

        // Only the TLAS was built again.
        assert_eq!(fixture.device.builds_executed(), builds + 1);
        assert_eq!(
            orchestrator
                .bottom_level()
                .get(SceneFixture::QUAD)
                .unwrap()
                .buffers
                .result,
            blas_before
        );
        assert_eq!(orchestrator.generation(), 2);

        orchestrator.release_completed(&mut fixture.device, 2).unwrap();
        assert!(fixture.device.is_buffer_live(blas_before));
        assert_eq!(fixture.device.live_pipeline_count(), 1);
        assert_ne!(orchestrator.pipeline_handle().unwrap(), pipeline_before);
    }

    #[test]
    fn failed_build_keeps_current_scene() {
        let instances = triangles(&[(0.0, 0)]);
        let (mut fixture, mut orchestrator) = built(1, 1, &instances);
        let tlas = orchestrator.tlas_handle().unwrap();

        let mut meshes = fixture.meshes.clone();
        let extra = meshes[1].geometries[0];
        meshes[0].geometries.push(extra);
        // New BLAS allocates two buffers; the TLAS instance buffer then fails.
        fixture.device.fail_allocation_after(2);
        let mut cmd = MockCommandList::new();
        let err = orchestrator
            .build_all(
                &mut fixture.device,
                &mut cmd,
                &meshes,
                &instances,
                fixture.shaders.clone(),
                2,
            )
            .unwrap_err();
        fixture.device.clear_allocation_failure();

        assert!(matches!(err, Error::AllocationFailure(_)));
        assert_eq!(orchestrator.tlas_handle().unwrap(), tlas);
        assert!(orchestrator.pending_release_count() >= 2);
        fixture.device.submit(&mut cmd).unwrap();
        assert!(fixture
            .device
            .trace_ray(tlas.buffer, &ray_at(0.0), 0)
            .unwrap()
            .is_some());
    }

    #[test]
    fn rejects_bad_instances() {
        init_tracing();
        let mut fixture = SceneFixture::new(1, 1).unwrap();
        let mut orchestrator = Orchestrator::new(&fixture.device, RtConfig::default()).unwrap();
        let mut cmd = MockCommandList::new();

        let err = orchestrator
            .update_transforms(&mut fixture.device, &mut cmd, &triangles(&[(0.0, 0)]), 1)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = orchestrator
            .build_all(
                &mut fixture.device,
                &mut cmd,
                &fixture.meshes,
                &triangles(&[(0.0, 3)]),
                fixture.shaders.clone(),
                1,
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = orchestrator
            .build_all(
                &mut fixture.device,
                &mut cmd,
                &fixture.meshes[..1],
                &[Instance::new(SceneFixture::QUAD, Mat4::IDENTITY, 0)],
                fixture.shaders.clone(),
                1,
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(cmd.is_empty());
    }

    #[test]
    fn empty_scene_traces_nothing() {
        let (fixture, orchestrator) = built(1, 1, &[]);
        let tlas = orchestrator.tlas_handle().unwrap();
        assert_eq!(tlas.instance_count, 0);
        assert_eq!(
            orchestrator.shader_binding_table().unwrap().layout.hit.record_count,
            0
        );
        assert!(fixture
            .device
            .trace_ray(tlas.buffer, &ray_at(0.0), 0)
            .unwrap()
            .is_none());
    }

    #[test]
    fn destroy_releases_everything() {
        let (mut fixture, mut orchestrator) = built(1, 1, &triangles(&[(0.0, 0)]));
        let mut cmd = MockCommandList::new();
        orchestrator
            .update_transforms(&mut fixture.device, &mut cmd, &[], 2)
            .unwrap();
        fixture.device.submit(&mut cmd).unwrap();

        orchestrator.destroy(&mut fixture.device).unwrap();
        // Only the fixture's geometry remains.
        assert_eq!(fixture.device.live_buffer_count(), 3);
        assert_eq!(fixture.device.live_pipeline_count(), 0);
    }
}
