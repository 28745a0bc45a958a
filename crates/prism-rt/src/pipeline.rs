//! Ray tracing pipeline assembly.
//!
//! Validates a [`ShaderSet`] against the configured payload, attribute, and
//! recursion bounds and the device limits, then creates one pipeline state
//! object from it. Validation is pure and runs before anything is created.

use std::collections::HashMap;

use prism_core::{
    Error, GpuDevice, PipelineDesc, PipelineHandle, RayTracingLimits, Result, RtConfig,
    ShaderExport, ShaderIdentifierSource, ShaderRecordDesc, ShaderSet, ShaderStage,
};
use tracing::{debug, warn};

use crate::alloc::align_up;

/// A created pipeline and the handle resolving its shader identifiers.
#[derive(Debug)]
pub struct RaytracingPipeline<P> {
    pub handle: PipelineHandle,
    pub properties: P,
}

/// What a program name refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Program<'a> {
    Export(&'a ShaderExport),
    HitGroup,
}

/// Name tables of a validated shader set.
struct Programs<'a> {
    programs: HashMap<&'a str, Program<'a>>,
    local_sizes: HashMap<&'a str, u32>,
}

impl<'a> Programs<'a> {
    fn collect(shaders: &'a ShaderSet) -> Result<Self> {
        let mut programs = HashMap::new();
        for export in shaders.libraries.iter().flat_map(|library| &library.exports) {
            if programs
                .insert(export.name.as_str(), Program::Export(export))
                .is_some()
            {
                return Err(Error::InvalidInput(format!(
                    "duplicate shader export '{}'",
                    export.name
                )));
            }
        }

        for group in &shaders.hit_groups {
            let mut members = group.members().peekable();
            if members.peek().is_none() {
                return Err(Error::InvalidInput(format!(
                    "hit group '{}' has no shaders",
                    group.name
                )));
            }
            for (member, stage) in members {
                match programs.get(member) {
                    Some(Program::Export(export)) if export.stage == stage => {}
                    Some(Program::Export(export)) => {
                        return Err(Error::InvalidInput(format!(
                            "hit group '{}' uses '{member}' as {stage:?} but it is {:?}",
                            group.name, export.stage
                        )));
                    }
                    _ => return Err(Error::UnknownExport(member.to_string())),
                }
            }
            if programs
                .insert(group.name.as_str(), Program::HitGroup)
                .is_some()
            {
                return Err(Error::InvalidInput(format!(
                    "hit group name '{}' is already used",
                    group.name
                )));
            }
        }

        let mut signatures = HashMap::new();
        for signature in &shaders.local_signatures {
            if signatures
                .insert(signature.name.as_str(), signature.local_argument_size())
                .is_some()
            {
                return Err(Error::InvalidInput(format!(
                    "duplicate local root signature '{}'",
                    signature.name
                )));
            }
        }

        let mut local_sizes = HashMap::new();
        for association in &shaders.associations {
            let size = *signatures
                .get(association.signature.as_str())
                .ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "association names unknown local root signature '{}'",
                        association.signature
                    ))
                })?;
            for program in &association.programs {
                match programs.get(program.as_str()) {
                    Some(Program::HitGroup) => {}
                    Some(Program::Export(export))
                        if matches!(
                            export.stage,
                            ShaderStage::RayGeneration | ShaderStage::Miss
                        ) => {}
                    Some(Program::Export(export)) => {
                        return Err(Error::InvalidInput(format!(
                            "'{}' is a {:?} shader; associate its hit group instead",
                            export.name, export.stage
                        )));
                    }
                    None => return Err(Error::UnknownExport(program.clone())),
                }
                if local_sizes.insert(program.as_str(), size).is_some() {
                    return Err(Error::InvalidInput(format!(
                        "'{program}' is associated with more than one local root signature"
                    )));
                }
            }
        }

        Ok(Self {
            programs,
            local_sizes,
        })
    }

    fn check_record(&self, record: &ShaderRecordDesc, expected: Option<ShaderStage>) -> Result<()> {
        match (self.programs.get(record.program.as_str()), expected) {
            (None, _) => return Err(Error::UnknownExport(record.program.clone())),
            (Some(Program::Export(export)), Some(stage)) if export.stage == stage => {}
            (Some(Program::HitGroup), None) => {}
            (Some(_), expected) => {
                return Err(Error::InvalidInput(format!(
                    "record '{}' is not a {}",
                    record.program,
                    expected.map_or("hit group".to_string(), |stage| format!("{stage:?} shader"))
                )));
            }
        }

        let declared = self.local_size(&record.program);
        if record.local_arguments.len() as u64 > u64::from(declared) {
            return Err(Error::LayoutViolation(format!(
                "record '{}' carries {} bytes of local arguments, its local root signature declares {declared}",
                record.program,
                record.local_arguments.len()
            )));
        }
        Ok(())
    }

    fn local_size(&self, program: &str) -> u32 {
        self.local_sizes.get(program).copied().unwrap_or(0)
    }
}

/// Local argument block size per program name (programs without a local
/// root signature are absent and take no argument bytes).
pub fn local_argument_sizes(shaders: &ShaderSet) -> Result<HashMap<String, u32>> {
    Ok(Programs::collect(shaders)?
        .local_sizes
        .into_iter()
        .map(|(name, size)| (name.to_string(), size))
        .collect())
}

/// Assembles one pipeline state object from a shader set.
#[derive(Clone, Debug)]
pub struct RaytracingPipelineAssembler {
    config: RtConfig,
}

impl RaytracingPipelineAssembler {
    pub fn new(config: &RtConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Validate `shaders` and describe the pipeline to create.
    ///
    /// Checks, in order: configuration against `limits`; unique export,
    /// hit group, and local signature names; hit group members; association
    /// targets; declared payload and attribute sizes; and every record of
    /// the set (program kind, local argument size, record stride).
    pub fn describe<'a>(
        &self,
        shaders: &'a ShaderSet,
        limits: &RayTracingLimits,
    ) -> Result<PipelineDesc<'a>> {
        self.config.validate(limits)?;
        let programs = Programs::collect(shaders)?;

        for export in shaders.libraries.iter().flat_map(|library| &library.exports) {
            if export.payload_size > self.config.max_payload_size {
                return Err(Error::LayoutViolation(format!(
                    "'{}' declares a {}-byte payload, the pipeline allows {}",
                    export.name, export.payload_size, self.config.max_payload_size
                )));
            }
            if export.attribute_size > self.config.max_attribute_size {
                return Err(Error::LayoutViolation(format!(
                    "'{}' declares {}-byte attributes, the pipeline allows {}",
                    export.name, export.attribute_size, self.config.max_attribute_size
                )));
            }
        }

        if shaders.ray_gen.program.is_empty() {
            return Err(Error::InvalidInput(
                "shader set has no ray generation record".to_string(),
            ));
        }
        programs.check_record(&shaders.ray_gen, Some(ShaderStage::RayGeneration))?;

        if shaders.miss.is_empty() {
            return Err(Error::InvalidInput(
                "shader set needs at least one miss record".to_string(),
            ));
        }
        for record in &shaders.miss {
            programs.check_record(record, Some(ShaderStage::Miss))?;
        }

        let ray_types = self.config.ray_type_count as usize;
        for (index, binding) in shaders.hit_bindings.iter().enumerate() {
            if binding.records.len() != ray_types {
                return Err(Error::InvalidInput(format!(
                    "hit binding {index} has {} records for {ray_types} ray types",
                    binding.records.len()
                )));
            }
            for record in &binding.records {
                programs.check_record(record, None)?;
            }
        }

        let max_local = programs.local_sizes.values().copied().max().unwrap_or(0);
        let stride = align_up(
            u64::from(limits.shader_identifier_size) + u64::from(max_local),
            u64::from(limits.shader_record_alignment),
        );
        if stride > u64::from(limits.max_record_stride) {
            return Err(Error::LayoutViolation(format!(
                "record stride {stride} exceeds device limit {}",
                limits.max_record_stride
            )));
        }

        Ok(PipelineDesc {
            libraries: &shaders.libraries,
            hit_groups: &shaders.hit_groups,
            global_signature: &shaders.global_signature,
            local_signatures: &shaders.local_signatures,
            associations: &shaders.associations,
            max_payload_size: self.config.max_payload_size,
            max_attribute_size: self.config.max_attribute_size,
            max_recursion_depth: self.config.max_recursion_depth,
        })
    }

    /// Validate `shaders` and create the pipeline.
    ///
    /// Every ray generation and miss export and every hit group must resolve
    /// to an identifier of the device's identifier size.
    #[cfg_attr(feature = "profiling", tracing::instrument(level = "trace", skip_all))]
    pub fn assemble<D: GpuDevice>(
        &self,
        device: &mut D,
        shaders: &ShaderSet,
    ) -> Result<RaytracingPipeline<D::Properties>> {
        let limits = device.limits();
        let desc = self.describe(shaders, &limits)?;
        let (handle, properties) = device.create_raytracing_pipeline(&desc)?;

        let programs = desc.program_names();
        let unresolved = programs.iter().find(|name| {
            properties
                .shader_identifier(name)
                .map_or(true, |id| id.len() != limits.shader_identifier_size as usize)
        });
        if let Some(name) = unresolved {
            let err = Error::Device(format!(
                "pipeline returned no valid identifier for '{name}'"
            ));
            if let Err(e) = device.destroy_pipeline(handle) {
                warn!("Failed to destroy rejected pipeline {handle:?}: {e}");
            }
            return Err(err);
        }

        debug!(
            "Assembled ray tracing pipeline {handle:?}: {} libraries, {} programs, recursion {}",
            shaders.libraries.len(),
            programs.len(),
            self.config.max_recursion_depth
        );
        Ok(RaytracingPipeline { handle, properties })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::{HitGroupDesc, LocalSignatureAssociation, ShaderExport};
    use prism_test::{simple_shader_set, MockDevice};

    fn assembler() -> RaytracingPipelineAssembler {
        RaytracingPipelineAssembler::new(&RtConfig::default())
    }

    #[test]
    fn assembles_and_resolves_identifiers() {
        let mut device = MockDevice::new();
        let shaders = simple_shader_set(1, 1);
        let pipeline = assembler().assemble(&mut device, &shaders).unwrap();

        for name in ["RayGen", "Miss", "HitGroup"] {
            assert_eq!(pipeline.properties.shader_identifier(name).unwrap().len(), 32);
        }
        assert_eq!(device.live_pipeline_count(), 1);
        assert_eq!(
            device.pipeline_programs(pipeline.handle).unwrap(),
            ["RayGen", "Miss", "HitGroup"]
        );
    }

    #[test]
    fn oversized_local_arguments_rejected() {
        let mut shaders = simple_shader_set(1, 1);
        // HitLocal declares 8 bytes.
        shaders.hit_bindings[0].records[0].local_arguments = vec![0; 12];
        let err = assembler()
            .describe(&shaders, &RayTracingLimits::default())
            .unwrap_err();
        assert!(matches!(err, Error::LayoutViolation(_)));
    }

    #[test]
    fn unassociated_record_takes_no_arguments() {
        let mut shaders = simple_shader_set(1, 1);
        shaders.miss[0].local_arguments = vec![1, 2, 3, 4];
        assert!(matches!(
            assembler().describe(&shaders, &RayTracingLimits::default()),
            Err(Error::LayoutViolation(_))
        ));
    }

    #[test]
    fn oversized_payload_rejected() {
        let mut shaders = simple_shader_set(1, 1);
        shaders.libraries[0].exports[2].payload_size = 64;
        assert!(matches!(
            assembler().describe(&shaders, &RayTracingLimits::default()),
            Err(Error::LayoutViolation(_))
        ));

        let mut shaders = simple_shader_set(1, 1);
        shaders.libraries[0].exports[2].attribute_size = 24;
        assert!(matches!(
            assembler().describe(&shaders, &RayTracingLimits::default()),
            Err(Error::LayoutViolation(_))
        ));
    }

    #[test]
    fn duplicate_exports_rejected() {
        let mut shaders = simple_shader_set(1, 1);
        shaders.libraries[0]
            .exports
            .push(ShaderExport::new("Miss", ShaderStage::Miss));
        assert!(matches!(
            assembler().describe(&shaders, &RayTracingLimits::default()),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn unknown_names_rejected() {
        let limits = RayTracingLimits::default();

        let mut shaders = simple_shader_set(1, 1);
        shaders
            .hit_groups
            .push(HitGroupDesc::closest_hit("Broken", "DoesNotExist"));
        assert_eq!(
            assembler().describe(&shaders, &limits).unwrap_err(),
            Error::UnknownExport("DoesNotExist".to_string())
        );

        let mut shaders = simple_shader_set(1, 1);
        shaders.associations.push(LocalSignatureAssociation {
            signature: "HitLocal".to_string(),
            programs: vec!["Nowhere".to_string()],
        });
        assert!(matches!(
            assembler().describe(&shaders, &limits),
            Err(Error::UnknownExport(_))
        ));

        let mut shaders = simple_shader_set(1, 1);
        shaders.hit_bindings[0].records[0].program = "Missing".to_string();
        assert!(matches!(
            assembler().describe(&shaders, &limits),
            Err(Error::UnknownExport(_))
        ));
    }

    #[test]
    fn record_kinds_checked() {
        let limits = RayTracingLimits::default();

        let mut shaders = simple_shader_set(1, 1);
        shaders.ray_gen.program = "Miss".to_string();
        assert!(matches!(
            assembler().describe(&shaders, &limits),
            Err(Error::InvalidInput(_))
        ));

        let mut shaders = simple_shader_set(1, 1);
        shaders.ray_gen.program.clear();
        assert!(matches!(
            assembler().describe(&shaders, &limits),
            Err(Error::InvalidInput(_))
        ));

        let mut shaders = simple_shader_set(1, 1);
        shaders.miss.clear();
        assert!(matches!(
            assembler().describe(&shaders, &limits),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn hit_bindings_need_one_record_per_ray_type() {
        let shaders = simple_shader_set(1, 1);
        let two_ray_types = RaytracingPipelineAssembler::new(&RtConfig::default().with_ray_types(2));
        assert!(matches!(
            two_ray_types.describe(&shaders, &RayTracingLimits::default()),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn recursion_depth_bounded_by_device() {
        let limits = RayTracingLimits {
            max_recursion_depth: 1,
            ..RayTracingLimits::default()
        };
        let deep = RaytracingPipelineAssembler::new(&RtConfig::default().with_recursion_depth(2));
        assert!(matches!(
            deep.describe(&simple_shader_set(1, 1), &limits),
            Err(Error::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn local_sizes_by_program() {
        let sizes = local_argument_sizes(&simple_shader_set(2, 1)).unwrap();
        assert_eq!(sizes.get("HitGroup"), Some(&8));
        assert_eq!(sizes.get("ShadowHitGroup"), Some(&8));
        assert_eq!(sizes.get("RayGen"), None);
    }
}
