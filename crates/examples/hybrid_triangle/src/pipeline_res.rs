use app::anyhow::Result;
use app::vulkan::ash::vk;
use app::vulkan::{
    Buffer, Context, GraphicsPipeline, GraphicsPipelineCreateInfo, GraphicsShaderCreateInfo,
    LocalRootSignature, PipelineLayout, RayTracingPipeline, RayTracingPipelineBuilder,
    SbtSection, ShaderBindingTable, ShaderBindingTableBuilder, ShaderExport,
};

use crate::{Vertex, AS_BIND, OUTPUT_BIND};

const VERTEX_SHADER: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/shader.vert.spv"));
const FRAGMENT_SHADER: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/shader.frag.spv"));
const RAYGEN_SHADER: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/raygen.rgen.spv"));
const MISS_SHADER: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/miss.rmiss.spv"));
const CLOSEST_HIT_SHADER: &[u8] =
    include_bytes!(concat!(env!("OUT_DIR"), "/closesthit.rchit.spv"));

const RAY_GEN: &str = "RayGen";
const MISS: &str = "Miss";
const CLOSEST_HIT: &str = "ClosestHit";
const HIT_GROUP: &str = "HitGroup";

/// RGB color plus hit distance.
const PAYLOAD_SIZE: u32 = 4 * std::mem::size_of::<f32>() as u32;
/// Barycentric coordinates of the hit.
const ATTRIBUTE_SIZE: u32 = 2 * std::mem::size_of::<f32>() as u32;

pub struct RasterPipeline {
    pub pipeline: GraphicsPipeline,
    pub layout: PipelineLayout,
}

pub fn create_raster_pipeline(
    context: &Context,
    color_attachment_format: vk::Format,
) -> Result<RasterPipeline> {
    let layout = context.create_pipeline_layout(&[])?;

    let pipeline = context.create_graphics_pipeline::<Vertex>(
        &layout,
        GraphicsPipelineCreateInfo {
            shaders: &[
                GraphicsShaderCreateInfo {
                    source: VERTEX_SHADER,
                    stage: vk::ShaderStageFlags::VERTEX,
                },
                GraphicsShaderCreateInfo {
                    source: FRAGMENT_SHADER,
                    stage: vk::ShaderStageFlags::FRAGMENT,
                },
            ],
            primitive_topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::NONE,
            color_attachment_format,
            color_attachment_blend: None,
        },
    )?;

    Ok(RasterPipeline { pipeline, layout })
}

pub fn create_ray_tracing_pipeline(context: &Context) -> Result<RayTracingPipeline> {
    let builder = RayTracingPipelineBuilder::new()
        .add_library(
            RAYGEN_SHADER,
            &[ShaderExport::new(RAY_GEN, vk::ShaderStageFlags::RAYGEN_KHR)],
        )
        .add_library(
            MISS_SHADER,
            &[ShaderExport::new(MISS, vk::ShaderStageFlags::MISS_KHR)],
        )
        .add_library(
            CLOSEST_HIT_SHADER,
            &[ShaderExport::new(
                CLOSEST_HIT,
                vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            )],
        )
        .add_hit_group(HIT_GROUP, CLOSEST_HIT)
        // Ray generation writes the output image and traces against the TLAS
        .add_root_signature_association(
            LocalRootSignature::empty()
                .with_binding(OUTPUT_BIND, vk::DescriptorType::STORAGE_IMAGE)
                .with_binding(AS_BIND, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR),
            &[RAY_GEN],
        )
        // The hit group reads vertex colors through the address in its record
        .add_root_signature_association(
            LocalRootSignature::empty().with_inline_arguments(1),
            &[HIT_GROUP],
        )
        .add_root_signature_association(LocalRootSignature::empty(), &[MISS])
        .max_payload_size(PAYLOAD_SIZE)
        .max_attribute_size(ATTRIBUTE_SIZE)
        .max_recursion_depth(1);

    context.create_ray_tracing_pipeline(&builder)
}

pub fn create_shader_binding_table(
    context: &Context,
    pipeline: &RayTracingPipeline,
    vertex_buffer: &Buffer,
) -> Result<ShaderBindingTable> {
    let alignment = context.ray_tracing.sbt_alignment();

    let mut builder = ShaderBindingTableBuilder::new(alignment);
    builder
        .add_ray_gen_record(RAY_GEN, &[])
        .add_miss_record(MISS, &[])
        .add_hit_group_record(HIT_GROUP, &[vertex_buffer.get_device_address()])
        // Fill the miss section up to a full section alignment
        .pad_section(SbtSection::Miss, alignment.section_alignment);

    context.create_shader_binding_table(&builder, pipeline)
}
