//! Ray tracing pipeline creation.
//!
//! Every library is one SPIR-V module whose entry points are named after its
//! exports. Ray generation and miss exports become general groups, hit groups
//! become triangle or procedural groups, in the order of
//! [`PipelineDesc::program_names`]. The global signature maps to one
//! descriptor set plus a push constant block. Local signatures have no
//! Vulkan object: their arguments are read from the shader record.

use std::collections::HashMap;
use std::ffi::CString;
use std::io::Cursor;

use ash::vk;
use prism_core::{
    DescriptorKind, PipelineDesc, RayTracingLimits, RootParameter, RootSignatureDesc,
    ShaderIdentifier, ShaderIdentifierSource, ShaderStage,
};
use tracing::debug;

use crate::device::Shared;
use crate::error::{Result, VulkanError};

/// Every stage of a ray tracing pipeline.
pub const RAY_TRACING_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::RAYGEN_KHR.as_raw()
        | vk::ShaderStageFlags::MISS_KHR.as_raw()
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw()
        | vk::ShaderStageFlags::ANY_HIT_KHR.as_raw()
        | vk::ShaderStageFlags::INTERSECTION_KHR.as_raw(),
);

pub const fn descriptor_type(kind: DescriptorKind) -> vk::DescriptorType {
    match kind {
        DescriptorKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        DescriptorKind::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        DescriptorKind::ConstantBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
    }
}

pub const fn shader_stage(stage: ShaderStage) -> vk::ShaderStageFlags {
    match stage {
        ShaderStage::RayGeneration => vk::ShaderStageFlags::RAYGEN_KHR,
        ShaderStage::Miss => vk::ShaderStageFlags::MISS_KHR,
        ShaderStage::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        ShaderStage::AnyHit => vk::ShaderStageFlags::ANY_HIT_KHR,
        ShaderStage::Intersection => vk::ShaderStageFlags::INTERSECTION_KHR,
    }
}

/// Descriptor set layout builder.
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
}

impl DescriptorSetLayoutBuilder<'_> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding visible to every ray tracing stage.
    #[must_use]
    pub fn binding(mut self, binding: u32, kind: DescriptorKind, count: u32) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type(kind))
                .descriptor_count(count)
                .stage_flags(RAY_TRACING_STAGES),
        );
        self
    }

    /// Add every descriptor binding of a signature. Constants are skipped.
    #[must_use]
    pub fn signature(self, signature: &RootSignatureDesc) -> Self {
        signature
            .parameters
            .iter()
            .fold(self, |builder, parameter| match parameter {
                RootParameter::Descriptor { kind, binding } => builder.binding(*binding, *kind, 1),
                RootParameter::DescriptorTable(ranges) => ranges.iter().fold(builder, |b, range| {
                    b.binding(range.binding, range.kind, range.count)
                }),
                RootParameter::Constants { .. } => builder,
            })
    }

    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding<'_>] {
        &self.bindings
    }

    /// Build the descriptor set layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(self, device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);
        Ok(device.create_descriptor_set_layout(&layout_info, None)?)
    }
}

/// Push constant range covering all inline constants of a signature, if any.
pub fn push_constant_range(signature: &RootSignatureDesc) -> Option<vk::PushConstantRange> {
    let size: u32 = signature
        .parameters
        .iter()
        .filter(|parameter| matches!(parameter, RootParameter::Constants { .. }))
        .map(RootParameter::argument_size)
        .sum();
    (size > 0).then(|| {
        vk::PushConstantRange::default()
            .stage_flags(RAY_TRACING_STAGES)
            .offset(0)
            .size(size)
    })
}

/// One shader stage: library index and entry point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagePlan {
    pub library: usize,
    pub entry_point: String,
    pub stage: ShaderStage,
}

/// One shader group, referencing stages by index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupPlan {
    pub name: String,
    pub ty: vk::RayTracingShaderGroupTypeKHR,
    pub general: u32,
    pub closest_hit: u32,
    pub any_hit: u32,
    pub intersection: u32,
}

impl GroupPlan {
    fn general(name: &str, stage: u32) -> Self {
        Self {
            name: name.to_string(),
            ty: vk::RayTracingShaderGroupTypeKHR::GENERAL,
            general: stage,
            closest_hit: vk::SHADER_UNUSED_KHR,
            any_hit: vk::SHADER_UNUSED_KHR,
            intersection: vk::SHADER_UNUSED_KHR,
        }
    }

    fn create_info(&self) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
        vk::RayTracingShaderGroupCreateInfoKHR::default()
            .ty(self.ty)
            .general_shader(self.general)
            .closest_hit_shader(self.closest_hit)
            .any_hit_shader(self.any_hit)
            .intersection_shader(self.intersection)
    }
}

/// Stages and groups of a pipeline, in group handle order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelinePlan {
    pub stages: Vec<StagePlan>,
    pub groups: Vec<GroupPlan>,
}

impl PipelinePlan {
    pub fn new(desc: &PipelineDesc<'_>) -> Result<Self> {
        let mut plan = Self::default();
        let mut by_name: HashMap<&str, u32> = HashMap::new();
        for (library_index, library) in desc.libraries.iter().enumerate() {
            for export in &library.exports {
                let index = plan.stages.len() as u32;
                if by_name.insert(export.name.as_str(), index).is_some() {
                    return Err(VulkanError::ShaderModule(format!(
                        "export '{}' defined twice",
                        export.name
                    )));
                }
                plan.stages.push(StagePlan {
                    library: library_index,
                    entry_point: export.name.clone(),
                    stage: export.stage,
                });
            }
        }

        let lookup = |name: &str, stage: ShaderStage| -> Result<u32> {
            by_name
                .get(name)
                .copied()
                .filter(|&index| plan.stages[index as usize].stage == stage)
                .ok_or_else(|| {
                    VulkanError::ShaderModule(format!("no {stage:?} export named '{name}'"))
                })
        };

        let mut groups = Vec::new();
        for name in desc.program_names() {
            if let Some(group) = desc.hit_groups.iter().find(|group| group.name == name) {
                let optional = |member: Option<&String>, stage| {
                    member.map_or(Ok(vk::SHADER_UNUSED_KHR), |name| lookup(name, stage))
                };
                let intersection = optional(group.intersection.as_ref(), ShaderStage::Intersection)?;
                groups.push(GroupPlan {
                    name: group.name.clone(),
                    ty: if intersection == vk::SHADER_UNUSED_KHR {
                        vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP
                    } else {
                        vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP
                    },
                    general: vk::SHADER_UNUSED_KHR,
                    closest_hit: optional(group.closest_hit.as_ref(), ShaderStage::ClosestHit)?,
                    any_hit: optional(group.any_hit.as_ref(), ShaderStage::AnyHit)?,
                    intersection,
                });
            } else {
                let index = by_name.get(name).copied().ok_or_else(|| {
                    VulkanError::ShaderModule(format!("no export named '{name}'"))
                })?;
                groups.push(GroupPlan::general(name, index));
            }
        }
        plan.groups = groups;
        Ok(plan)
    }
}

/// Split packed group handles into identifiers keyed by program name.
pub fn split_identifiers(
    groups: &[GroupPlan],
    handles: &[u8],
    identifier_size: usize,
) -> Result<VulkanProperties> {
    if identifier_size == 0 || handles.len() != groups.len() * identifier_size {
        return Err(VulkanError::InvalidState(format!(
            "{} bytes of group handles for {} groups of {identifier_size} bytes",
            handles.len(),
            groups.len()
        )));
    }
    let identifiers = groups
        .iter()
        .zip(handles.chunks_exact(identifier_size))
        .map(|(group, bytes)| (group.name.clone(), ShaderIdentifier::from_bytes(bytes)))
        .collect();
    Ok(VulkanProperties { identifiers })
}

/// Shader identifiers of a created pipeline.
#[derive(Clone, Debug, Default)]
pub struct VulkanProperties {
    identifiers: HashMap<String, ShaderIdentifier>,
}

impl VulkanProperties {
    pub fn program_count(&self) -> usize {
        self.identifiers.len()
    }
}

impl ShaderIdentifierSource for VulkanProperties {
    fn shader_identifier(&self, program: &str) -> Option<ShaderIdentifier> {
        self.identifiers.get(program).cloned()
    }
}

/// A created ray tracing pipeline and its layouts.
pub struct RtPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub set_layout: vk::DescriptorSetLayout,
}

impl RtPipeline {
    /// Create the pipeline and read back its shader identifiers.
    ///
    /// # Safety
    /// The shared device must be valid.
    pub(crate) unsafe fn new(
        shared: &Shared,
        desc: &PipelineDesc<'_>,
        limits: &RayTracingLimits,
    ) -> Result<(Self, VulkanProperties)> {
        let plan = PipelinePlan::new(desc)?;
        let device = &shared.device;

        let set_layout = DescriptorSetLayoutBuilder::new()
            .signature(desc.global_signature)
            .build(device)?;
        let mut created = Self {
            pipeline: vk::Pipeline::null(),
            layout: vk::PipelineLayout::null(),
            set_layout,
        };

        match created.create(shared, desc, &plan, limits) {
            Ok(properties) => {
                debug!(
                    "Created ray tracing pipeline with {} stages and {} groups",
                    plan.stages.len(),
                    plan.groups.len()
                );
                Ok((created, properties))
            }
            Err(e) => {
                created.destroy(device);
                Err(e)
            }
        }
    }

    unsafe fn create(
        &mut self,
        shared: &Shared,
        desc: &PipelineDesc<'_>,
        plan: &PipelinePlan,
        limits: &RayTracingLimits,
    ) -> Result<VulkanProperties> {
        let device = &shared.device;

        let set_layouts = [self.set_layout];
        let push_constants: Vec<_> = push_constant_range(desc.global_signature).into_iter().collect();
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constants);
        self.layout = device.create_pipeline_layout(&layout_info, None)?;

        let mut modules = Vec::with_capacity(desc.libraries.len());
        let pipeline = Self::create_modules(device, desc, &mut modules).and_then(|()| {
            let entry_points = plan
                .stages
                .iter()
                .map(|stage| {
                    CString::new(stage.entry_point.as_str()).map_err(|e| {
                        VulkanError::ShaderModule(format!("entry point '{}': {e}", stage.entry_point))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let stages: Vec<_> = plan
                .stages
                .iter()
                .zip(&entry_points)
                .map(|(stage, name)| {
                    vk::PipelineShaderStageCreateInfo::default()
                        .stage(shader_stage(stage.stage))
                        .module(modules[stage.library])
                        .name(name)
                })
                .collect();
            let groups: Vec<_> = plan.groups.iter().map(GroupPlan::create_info).collect();

            let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
                .stages(&stages)
                .groups(&groups)
                .max_pipeline_ray_recursion_depth(desc.max_recursion_depth)
                .layout(self.layout);

            shared
                .rt_loader
                .create_ray_tracing_pipelines(
                    vk::DeferredOperationKHR::null(),
                    vk::PipelineCache::null(),
                    std::slice::from_ref(&pipeline_info),
                    None,
                )
                .map_err(|e| {
                    VulkanError::PipelineCreation(format!("Ray tracing pipeline: {e:?}"))
                })
        });
        for module in modules {
            device.destroy_shader_module(module, None);
        }
        self.pipeline = pipeline?
            .into_iter()
            .next()
            .ok_or_else(|| VulkanError::PipelineCreation("no pipeline returned".to_string()))?;

        let identifier_size = limits.shader_identifier_size as usize;
        let handles = shared.rt_loader.get_ray_tracing_shader_group_handles(
            self.pipeline,
            0,
            plan.groups.len() as u32,
            plan.groups.len() * identifier_size,
        )?;
        split_identifiers(&plan.groups, &handles, identifier_size)
    }

    unsafe fn create_modules(
        device: &ash::Device,
        desc: &PipelineDesc<'_>,
        modules: &mut Vec<vk::ShaderModule>,
    ) -> Result<()> {
        for library in desc.libraries {
            let code = ash::util::read_spv(&mut Cursor::new(&library.code)).map_err(|e| {
                VulkanError::ShaderModule(format!("library '{}': {e}", library.name))
            })?;
            let create_info = vk::ShaderModuleCreateInfo::default().code(&code);
            let module = device.create_shader_module(&create_info, None).map_err(|e| {
                VulkanError::ShaderModule(format!("library '{}': {e}", library.name))
            })?;
            modules.push(module);
        }
        Ok(())
    }

    /// Destroy the pipeline and its layouts.
    ///
    /// # Safety
    /// The pipeline must not be in use by the GPU.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
        device.destroy_descriptor_set_layout(self.set_layout, None);
    }
}
