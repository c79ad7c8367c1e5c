use std::{
    collections::{BTreeMap, HashMap},
    ffi::CString,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::Result;
use ash::vk;
use thiserror::Error as ThisError;

use crate::{device::Device, Context, DescriptorSetLayout, ShaderIdentifiers};

use crate::{PipelineLayout, RayTracingContext, ShaderModule};

static NEXT_PIPELINE_GENERATION: AtomicU64 = AtomicU64::new(1);

/// One entry point exported from a SPIR-V library under a unique name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderExport<'a> {
    pub name: &'a str,
    pub entry_point: &'a str,
    pub stage: vk::ShaderStageFlags,
}

impl<'a> ShaderExport<'a> {
    pub fn new(name: &'a str, stage: vk::ShaderStageFlags) -> Self {
        Self {
            name,
            entry_point: "main",
            stage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
}

/// Resources a group of shaders declares: descriptors in set 0 plus a number
/// of 8-byte arguments stored inline in its shader record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalRootSignature {
    pub bindings: Vec<RootBinding>,
    pub inline_arguments: u32,
}

impl LocalRootSignature {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_binding(mut self, binding: u32, descriptor_type: vk::DescriptorType) -> Self {
        self.bindings.push(RootBinding {
            binding,
            descriptor_type,
        });
        self
    }

    pub fn with_inline_arguments(mut self, inline_arguments: u32) -> Self {
        self.inline_arguments = inline_arguments;
        self
    }
}

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum PipelineBuildError {
    #[error("shader or hit group name {0:?} is defined twice")]
    DuplicateName(String),
    #[error("no shader export or hit group is named {0:?}")]
    UnknownName(String),
    #[error("hit group closest hit shader {0:?} is not a closest hit stage")]
    NotClosestHit(String),
    #[error("shader export {0:?} has an unsupported stage")]
    UnsupportedStage(String),
    #[error("pipeline has no ray generation shader")]
    MissingRayGen,
    #[error("{0:?} is associated with more than one root signature")]
    DuplicateAssociation(String),
    #[error("binding {0} is declared with different descriptor types")]
    ConflictingBinding(u32),
    #[error("max recursion depth {requested} exceeds the device limit of {limit}")]
    RecursionDepth { requested: u32, limit: u32 },
    #[error("hit attribute size {requested} exceeds the device limit of {limit}")]
    AttributeSize { requested: u32, limit: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupKind {
    General { stage: u32 },
    TrianglesHit { closest_hit: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GroupPlan {
    pub name: String,
    pub kind: GroupKind,
}

/// Everything `generate` derives from the builder before touching the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PipelinePlan {
    /// (library index, export) per pipeline stage, in stage order.
    pub stages: Vec<(usize, ShaderExportOwned)>,
    pub groups: Vec<GroupPlan>,
    pub bindings: BTreeMap<u32, (vk::DescriptorType, vk::ShaderStageFlags)>,
    pub inline_arguments: HashMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ShaderExportOwned {
    pub name: String,
    pub entry_point: String,
    pub stage: vk::ShaderStageFlags,
}

/// Collects shader libraries, hit groups and root signature associations and
/// compiles them into one ray tracing pipeline.
pub struct RayTracingPipelineBuilder<'a> {
    libraries: Vec<(&'a [u8], Vec<ShaderExport<'a>>)>,
    hit_groups: Vec<(&'a str, &'a str)>,
    associations: Vec<(LocalRootSignature, Vec<&'a str>)>,
    max_payload_size: u32,
    max_attribute_size: u32,
    max_recursion_depth: u32,
}

impl<'a> Default for RayTracingPipelineBuilder<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> RayTracingPipelineBuilder<'a> {
    pub fn new() -> Self {
        Self {
            libraries: vec![],
            hit_groups: vec![],
            associations: vec![],
            max_payload_size: 4 * std::mem::size_of::<f32>() as u32,
            max_attribute_size: 2 * std::mem::size_of::<f32>() as u32,
            max_recursion_depth: 1,
        }
    }

    pub fn add_library(mut self, source: &'a [u8], exports: &[ShaderExport<'a>]) -> Self {
        self.libraries.push((source, exports.to_vec()));
        self
    }

    pub fn add_hit_group(mut self, name: &'a str, closest_hit: &'a str) -> Self {
        self.hit_groups.push((name, closest_hit));
        self
    }

    /// `names` may be shader export names or hit group names.
    pub fn add_root_signature_association(
        mut self,
        signature: LocalRootSignature,
        names: &[&'a str],
    ) -> Self {
        self.associations.push((signature, names.to_vec()));
        self
    }

    pub fn max_payload_size(self, max_payload_size: u32) -> Self {
        Self {
            max_payload_size,
            ..self
        }
    }

    pub fn max_attribute_size(self, max_attribute_size: u32) -> Self {
        Self {
            max_attribute_size,
            ..self
        }
    }

    pub fn max_recursion_depth(self, max_recursion_depth: u32) -> Self {
        Self {
            max_recursion_depth,
            ..self
        }
    }

    pub(crate) fn plan(&self) -> Result<PipelinePlan, PipelineBuildError> {
        let mut plan = PipelinePlan::default();
        let mut stage_by_name = HashMap::new();

        for (library_index, (_, exports)) in self.libraries.iter().enumerate() {
            for export in exports {
                let stage_index = plan.stages.len() as u32;
                if stage_by_name
                    .insert(export.name, (stage_index, export.stage))
                    .is_some()
                {
                    return Err(PipelineBuildError::DuplicateName(export.name.to_owned()));
                }

                let general = vk::ShaderStageFlags::RAYGEN_KHR
                    | vk::ShaderStageFlags::MISS_KHR
                    | vk::ShaderStageFlags::CALLABLE_KHR;
                if general.contains(export.stage) {
                    plan.groups.push(GroupPlan {
                        name: export.name.to_owned(),
                        kind: GroupKind::General { stage: stage_index },
                    });
                } else if export.stage != vk::ShaderStageFlags::CLOSEST_HIT_KHR {
                    return Err(PipelineBuildError::UnsupportedStage(export.name.to_owned()));
                }

                plan.stages.push((
                    library_index,
                    ShaderExportOwned {
                        name: export.name.to_owned(),
                        entry_point: export.entry_point.to_owned(),
                        stage: export.stage,
                    },
                ));
            }
        }

        if !plan
            .stages
            .iter()
            .any(|(_, e)| e.stage == vk::ShaderStageFlags::RAYGEN_KHR)
        {
            return Err(PipelineBuildError::MissingRayGen);
        }

        for (name, closest_hit) in &self.hit_groups {
            if stage_by_name.contains_key(name) || plan.groups.iter().any(|g| g.name == *name) {
                return Err(PipelineBuildError::DuplicateName((*name).to_owned()));
            }
            let (stage_index, stage) = stage_by_name
                .get(closest_hit)
                .copied()
                .ok_or_else(|| PipelineBuildError::UnknownName((*closest_hit).to_owned()))?;
            if stage != vk::ShaderStageFlags::CLOSEST_HIT_KHR {
                return Err(PipelineBuildError::NotClosestHit((*closest_hit).to_owned()));
            }

            plan.groups.push(GroupPlan {
                name: (*name).to_owned(),
                kind: GroupKind::TrianglesHit {
                    closest_hit: stage_index,
                },
            });
        }

        for (signature, names) in &self.associations {
            for name in names {
                let (groups, stage) = self.resolve_association(&plan, &stage_by_name, name)?;

                for binding in &signature.bindings {
                    let entry = plan
                        .bindings
                        .entry(binding.binding)
                        .or_insert((binding.descriptor_type, vk::ShaderStageFlags::empty()));
                    if entry.0 != binding.descriptor_type {
                        return Err(PipelineBuildError::ConflictingBinding(binding.binding));
                    }
                    entry.1 |= stage;
                }

                for group in groups {
                    if plan
                        .inline_arguments
                        .insert(group.clone(), signature.inline_arguments)
                        .is_some()
                    {
                        return Err(PipelineBuildError::DuplicateAssociation(group));
                    }
                }
            }
        }

        Ok(plan)
    }

    /// Group names and stage an association target covers. A closest hit
    /// export stands for every hit group built from it.
    fn resolve_association(
        &self,
        plan: &PipelinePlan,
        stage_by_name: &HashMap<&str, (u32, vk::ShaderStageFlags)>,
        name: &str,
    ) -> Result<(Vec<String>, vk::ShaderStageFlags), PipelineBuildError> {
        if let Some(group) = plan.groups.iter().find(|g| g.name == name) {
            let stage = match group.kind {
                GroupKind::General { stage } => plan.stages[stage as usize].1.stage,
                GroupKind::TrianglesHit { .. } => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            };
            return Ok((vec![group.name.clone()], stage));
        }

        let (stage_index, stage) = stage_by_name
            .get(name)
            .copied()
            .ok_or_else(|| PipelineBuildError::UnknownName(name.to_owned()))?;
        let groups = plan
            .groups
            .iter()
            .filter(|g| g.kind == GroupKind::TrianglesHit { closest_hit: stage_index })
            .map(|g| g.name.clone())
            .collect();

        Ok((groups, stage))
    }

    pub fn generate(&self, context: &Context) -> Result<RayTracingPipeline> {
        RayTracingPipeline::new(context.device.clone(), &context.ray_tracing, self)
    }
}

pub struct RayTracingPipeline {
    device: Arc<Device>,
    pub(crate) inner: vk::Pipeline,
    pub layout: PipelineLayout,
    descriptor_set_layout: DescriptorSetLayout,
    pool_sizes: Vec<vk::DescriptorPoolSize>,
    group_indices: HashMap<String, usize>,
    inline_arguments: HashMap<String, u32>,
    handles: Vec<u8>,
    handle_size: usize,
    generation: u64,
}

impl RayTracingPipeline {
    pub(crate) fn new(
        device: Arc<Device>,
        ray_tracing: &RayTracingContext,
        builder: &RayTracingPipelineBuilder,
    ) -> Result<Self> {
        let plan = builder.plan()?;

        let properties = &ray_tracing.pipeline_properties;
        if builder.max_recursion_depth > properties.max_ray_recursion_depth {
            return Err(PipelineBuildError::RecursionDepth {
                requested: builder.max_recursion_depth,
                limit: properties.max_ray_recursion_depth,
            }
            .into());
        }
        if builder.max_attribute_size > properties.max_ray_hit_attribute_size {
            return Err(PipelineBuildError::AttributeSize {
                requested: builder.max_attribute_size,
                limit: properties.max_ray_hit_attribute_size,
            }
            .into());
        }

        // Every root signature shares descriptor set 0
        let layout_bindings = plan
            .bindings
            .iter()
            .map(|(binding, (descriptor_type, stage_flags))| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(*binding)
                    .descriptor_type(*descriptor_type)
                    .descriptor_count(1)
                    .stage_flags(*stage_flags)
                    .build()
            })
            .collect::<Vec<_>>();
        let descriptor_set_layout = DescriptorSetLayout::new(device.clone(), &layout_bindings)?;
        let layout = PipelineLayout::new(device.clone(), &[&descriptor_set_layout])?;

        let pool_sizes = plan
            .bindings
            .values()
            .map(|(ty, _)| vk::DescriptorPoolSize {
                ty: *ty,
                descriptor_count: 1,
            })
            .collect::<Vec<_>>();

        let modules = builder
            .libraries
            .iter()
            .map(|(source, _)| ShaderModule::from_bytes(device.clone(), source))
            .collect::<Result<Vec<_>>>()?;
        let entry_point_names = plan
            .stages
            .iter()
            .map(|(_, export)| CString::new(export.entry_point.as_str()))
            .collect::<Result<Vec<_>, _>>()?;

        let stages = plan
            .stages
            .iter()
            .zip(entry_point_names.iter())
            .map(|((library, export), entry_point)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(export.stage)
                    .module(modules[*library].inner)
                    .name(entry_point)
                    .build()
            })
            .collect::<Vec<_>>();

        let groups = plan
            .groups
            .iter()
            .map(|group| {
                let info = vk::RayTracingShaderGroupCreateInfoKHR::builder()
                    .general_shader(vk::SHADER_UNUSED_KHR)
                    .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                    .any_hit_shader(vk::SHADER_UNUSED_KHR)
                    .intersection_shader(vk::SHADER_UNUSED_KHR);
                match group.kind {
                    GroupKind::General { stage } => info
                        .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                        .general_shader(stage),
                    GroupKind::TrianglesHit { closest_hit } => info
                        .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                        .closest_hit_shader(closest_hit),
                }
                .build()
            })
            .collect::<Vec<_>>();

        let interface = vk::RayTracingPipelineInterfaceCreateInfoKHR::builder()
            .max_pipeline_ray_payload_size(builder.max_payload_size)
            .max_pipeline_ray_hit_attribute_size(builder.max_attribute_size);

        let pipe_info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .layout(layout.inner)
            .stages(&stages)
            .groups(&groups)
            .library_interface(&interface)
            .max_pipeline_ray_recursion_depth(builder.max_recursion_depth);

        let inner = unsafe {
            ray_tracing.pipeline_fn.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                std::slice::from_ref(&pipe_info),
                None,
            )?[0]
        };

        let handle_size = properties.shader_group_handle_size as usize;
        let handles = unsafe {
            ray_tracing
                .pipeline_fn
                .get_ray_tracing_shader_group_handles(
                    inner,
                    0,
                    groups.len() as _,
                    groups.len() * handle_size,
                )?
        };

        let generation = NEXT_PIPELINE_GENERATION.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Created ray tracing pipeline generation {generation} with {} stages and {} groups",
            stages.len(),
            groups.len()
        );

        Ok(Self {
            device,
            inner,
            layout,
            descriptor_set_layout,
            pool_sizes,
            group_indices: plan
                .groups
                .iter()
                .enumerate()
                .map(|(index, group)| (group.name.clone(), index))
                .collect(),
            inline_arguments: plan.inline_arguments,
            handles,
            handle_size,
            generation,
        })
    }

    pub fn descriptor_set_layout(&self) -> &DescriptorSetLayout {
        &self.descriptor_set_layout
    }

    /// Pool sizes for one descriptor set matching `descriptor_set_layout`.
    pub fn descriptor_pool_sizes(&self) -> &[vk::DescriptorPoolSize] {
        &self.pool_sizes
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl ShaderIdentifiers for RayTracingPipeline {
    fn shader_identifier(&self, name: &str) -> Option<&[u8]> {
        let index = *self.group_indices.get(name)?;
        self.handles
            .get(index * self.handle_size..(index + 1) * self.handle_size)
    }

    fn inline_argument_count(&self, name: &str) -> Option<u32> {
        self.inline_arguments.get(name).copied()
    }
}

impl Context {
    pub fn create_ray_tracing_pipeline(
        &self,
        builder: &RayTracingPipelineBuilder,
    ) -> Result<RayTracingPipeline> {
        builder.generate(self)
    }
}

impl Drop for RayTracingPipeline {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_pipeline(self.inner, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAYGEN: vk::ShaderStageFlags = vk::ShaderStageFlags::RAYGEN_KHR;
    const MISS: vk::ShaderStageFlags = vk::ShaderStageFlags::MISS_KHR;
    const CLOSEST_HIT: vk::ShaderStageFlags = vk::ShaderStageFlags::CLOSEST_HIT_KHR;

    fn triangle_builder<'a>() -> RayTracingPipelineBuilder<'a> {
        RayTracingPipelineBuilder::new()
            .add_library(&[], &[ShaderExport::new("RayGen", RAYGEN)])
            .add_library(&[], &[ShaderExport::new("Miss", MISS)])
            .add_library(&[], &[ShaderExport::new("ClosestHit", CLOSEST_HIT)])
            .add_hit_group("HitGroup", "ClosestHit")
    }

    #[test]
    fn groups_follow_exports_and_hit_groups() {
        let plan = triangle_builder().plan().unwrap();

        assert_eq!(plan.stages.len(), 3);
        assert_eq!(
            plan.groups,
            vec![
                GroupPlan {
                    name: "RayGen".to_owned(),
                    kind: GroupKind::General { stage: 0 }
                },
                GroupPlan {
                    name: "Miss".to_owned(),
                    kind: GroupKind::General { stage: 1 }
                },
                GroupPlan {
                    name: "HitGroup".to_owned(),
                    kind: GroupKind::TrianglesHit { closest_hit: 2 }
                },
            ]
        );
    }

    #[test]
    fn root_signatures_merge_into_one_set() {
        let plan = triangle_builder()
            .add_root_signature_association(
                LocalRootSignature::empty()
                    .with_binding(0, vk::DescriptorType::STORAGE_IMAGE)
                    .with_binding(1, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR),
                &["RayGen"],
            )
            .add_root_signature_association(
                LocalRootSignature::empty()
                    .with_binding(1, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                    .with_inline_arguments(1),
                &["HitGroup"],
            )
            .add_root_signature_association(LocalRootSignature::empty(), &["Miss"])
            .plan()
            .unwrap();

        assert_eq!(
            plan.bindings[&0],
            (vk::DescriptorType::STORAGE_IMAGE, RAYGEN)
        );
        assert_eq!(
            plan.bindings[&1],
            (
                vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                RAYGEN | CLOSEST_HIT
            )
        );
        assert_eq!(plan.inline_arguments["HitGroup"], 1);
        assert_eq!(plan.inline_arguments["RayGen"], 0);
        assert_eq!(plan.inline_arguments["Miss"], 0);
    }

    #[test]
    fn closest_hit_association_covers_its_hit_group() {
        let plan = triangle_builder()
            .add_root_signature_association(
                LocalRootSignature::empty().with_inline_arguments(2),
                &["ClosestHit"],
            )
            .plan()
            .unwrap();

        assert_eq!(plan.inline_arguments["HitGroup"], 2);
    }

    #[test]
    fn conflicting_binding_types_are_rejected() {
        let error = triangle_builder()
            .add_root_signature_association(
                LocalRootSignature::empty().with_binding(0, vk::DescriptorType::STORAGE_IMAGE),
                &["RayGen"],
            )
            .add_root_signature_association(
                LocalRootSignature::empty().with_binding(0, vk::DescriptorType::STORAGE_BUFFER),
                &["HitGroup"],
            )
            .plan()
            .unwrap_err();

        assert_eq!(error, PipelineBuildError::ConflictingBinding(0));
    }

    #[test]
    fn unknown_names_are_rejected() {
        let error = triangle_builder()
            .add_root_signature_association(LocalRootSignature::empty(), &["Shadow"])
            .plan()
            .unwrap_err();
        assert_eq!(error, PipelineBuildError::UnknownName("Shadow".to_owned()));

        let error = triangle_builder()
            .add_hit_group("Other", "Miss")
            .plan()
            .unwrap_err();
        assert_eq!(error, PipelineBuildError::NotClosestHit("Miss".to_owned()));
    }

    #[test]
    fn ray_generation_shader_is_required() {
        let error = RayTracingPipelineBuilder::new()
            .add_library(&[], &[ShaderExport::new("Miss", MISS)])
            .plan()
            .unwrap_err();

        assert_eq!(error, PipelineBuildError::MissingRayGen);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let error = triangle_builder()
            .add_hit_group("Miss", "ClosestHit")
            .plan()
            .unwrap_err();

        assert_eq!(error, PipelineBuildError::DuplicateName("Miss".to_owned()));
    }
}
