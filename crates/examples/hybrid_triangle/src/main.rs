use std::mem::size_of;

use app::anyhow::Result;
use app::vulkan::ash::vk;
use app::vulkan::utils::create_gpu_only_buffer_from_data;
use app::vulkan::{
    AccelerationStructureBuffers, BlasGeometry, Buffer, CommandBuffer, Context,
    ShaderBindingTable, RayTracingPipeline, TlasInstance,
};
use app::{App, BaseApp, FrameTarget};
use glam::Affine3A;

mod args;
mod desc_sets;
mod pipeline_res;

use args::Args;
use desc_sets::*;
use pipeline_res::*;

const APP_NAME: &str = "Hybrid triangle";

const AS_BIND: u32 = 0;
const OUTPUT_BIND: u32 = 1;

fn main() -> Result<()> {
    pretty_env_logger::init();

    let args = Args::from_env();
    app::run::<HybridTriangle>(APP_NAME, args.width, args.height)
}

struct HybridTriangle {
    sbt: ShaderBindingTable,
    descriptor_res: DescriptorRes,
    rt_pipeline: RayTracingPipeline,
    raster: RasterPipeline,
    _top_as: AccelerationStructureBuffers,
    _bottom_as: AccelerationStructureBuffers,
    vertex_buffer: Buffer,
}

impl App for HybridTriangle {
    fn new(base: &mut BaseApp<Self>) -> Result<Self> {
        let context = &base.context;

        let vertex_buffer = create_vertex_buffer(context)?;
        let (bottom_as, top_as) = create_acceleration_structures(context, &vertex_buffer)?;

        let raster = create_raster_pipeline(context, base.surface.format())?;
        let rt_pipeline = create_ray_tracing_pipeline(context)?;
        let sbt = create_shader_binding_table(context, &rt_pipeline, &vertex_buffer)?;

        let descriptor_res = create_descriptor_sets(
            context,
            &rt_pipeline,
            &top_as.result,
            &base.output_image.view,
        )?;

        Ok(Self {
            sbt,
            descriptor_res,
            rt_pipeline,
            raster,
            _top_as: top_as,
            _bottom_as: bottom_as,
            vertex_buffer,
        })
    }

    fn record_raster_commands(
        &self,
        _: &BaseApp<Self>,
        buffer: &CommandBuffer,
        _: &FrameTarget,
    ) -> Result<()> {
        buffer.bind_graphics_pipeline(&self.raster.pipeline);
        buffer.bind_vertex_buffer(&self.vertex_buffer);
        buffer.draw(3);

        Ok(())
    }

    fn record_raytracing_commands(
        &self,
        _: &BaseApp<Self>,
        buffer: &CommandBuffer,
        target: &FrameTarget,
    ) -> Result<()> {
        debug_assert!(
            self.sbt.is_current_for(&self.rt_pipeline),
            "Shader binding table was generated for another pipeline"
        );

        buffer.bind_rt_pipeline(&self.rt_pipeline);
        buffer.bind_descriptor_sets(
            vk::PipelineBindPoint::RAY_TRACING_KHR,
            &self.rt_pipeline.layout,
            0,
            &[&self.descriptor_res.set],
        );
        buffer.trace_rays(&self.sbt, target.extent.width, target.extent.height);

        Ok(())
    }

    fn on_recreate_swapchain(&mut self, base: &BaseApp<Self>) -> Result<()> {
        self.descriptor_res
            .update_output_image(&base.output_image.view);

        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct Vertex {
    position: [f32; 3],
    color: [f32; 4],
}

impl app::vulkan::Vertex for Vertex {
    fn bindings() -> Vec<vk::VertexInputBindingDescription> {
        vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: size_of::<Vertex>() as _,
            input_rate: vk::VertexInputRate::VERTEX,
        }]
    }

    fn attributes() -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 1,
                format: vk::Format::R32G32B32A32_SFLOAT,
                offset: 12,
            },
        ]
    }
}

const VERTICES: [Vertex; 3] = [
    Vertex {
        position: [0.0, 0.25, 0.0],
        color: [1.0, 0.0, 0.0, 1.0],
    },
    Vertex {
        position: [0.25, -0.25, 0.0],
        color: [0.0, 1.0, 0.0, 1.0],
    },
    Vertex {
        position: [-0.25, -0.25, 0.0],
        color: [0.0, 0.0, 1.0, 1.0],
    },
];

fn create_vertex_buffer(context: &Context) -> Result<Buffer> {
    // Also read by the BLAS build and, through its address, by the hit group
    create_gpu_only_buffer_from_data(
        context,
        vk::BufferUsageFlags::VERTEX_BUFFER
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::STORAGE_BUFFER,
        &VERTICES,
    )
}

fn create_acceleration_structures(
    context: &Context,
    vertex_buffer: &Buffer,
) -> Result<(AccelerationStructureBuffers, AccelerationStructureBuffers)> {
    let (mut bottom_as, mut top_as) = context.execute_one_time_commands(|cmd_buffer| {
        let bottom_as = context.build_bottom_level_acceleration_structure(
            cmd_buffer,
            &[BlasGeometry {
                vertex_buffer,
                vertex_count: VERTICES.len() as _,
                vertex_stride: size_of::<Vertex>() as _,
            }],
        )?;

        cmd_buffer.acceleration_structure_barrier();

        let top_as = context.build_top_level_acceleration_structure(
            cmd_buffer,
            &[TlasInstance {
                blas: &bottom_as.result,
                transform: Affine3A::IDENTITY,
            }],
        )?;

        Ok::<_, app::anyhow::Error>((bottom_as, top_as))
    })??;

    // The one time submission has been flushed, the builds have retired
    bottom_as.release_scratch();
    top_as.release_scratch();

    Ok((bottom_as, top_as))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_matches_hit_shader() {
        // closesthit.rchit reads 7 floats per vertex, color after position
        assert_eq!(size_of::<Vertex>(), 7 * size_of::<f32>());
        assert_eq!(
            <Vertex as app::vulkan::Vertex>::attributes()[1].offset as usize,
            3 * size_of::<f32>()
        );
    }
}
