use app::anyhow::Result;
use app::vulkan::ash::vk;
use app::vulkan::{
    AccelerationStructure, Context, DescriptorPool, DescriptorSet, ImageView,
    RayTracingPipeline, WriteDescriptorSet, WriteDescriptorSetKind,
};

use crate::{AS_BIND, OUTPUT_BIND};

pub struct DescriptorRes {
    pub set: DescriptorSet,
    _pool: DescriptorPool,
}

impl DescriptorRes {
    /// Points the storage image binding at a (possibly recreated) output image.
    pub fn update_output_image(&self, view: &ImageView) {
        self.set.update(&[WriteDescriptorSet {
            binding: OUTPUT_BIND,
            kind: WriteDescriptorSetKind::StorageImage {
                view,
                layout: vk::ImageLayout::GENERAL,
            },
        }]);
    }
}

pub fn create_descriptor_sets(
    context: &Context,
    pipeline: &RayTracingPipeline,
    top_as: &AccelerationStructure,
    output_view: &ImageView,
) -> Result<DescriptorRes> {
    let pool = context.create_descriptor_pool(1, pipeline.descriptor_pool_sizes())?;
    let set = pool.allocate_set(pipeline.descriptor_set_layout())?;

    set.update(&[
        WriteDescriptorSet {
            binding: AS_BIND,
            kind: WriteDescriptorSetKind::AccelerationStructure {
                acceleration_structure: top_as,
            },
        },
        WriteDescriptorSet {
            binding: OUTPUT_BIND,
            kind: WriteDescriptorSetKind::StorageImage {
                view: output_view,
                layout: vk::ImageLayout::GENERAL,
            },
        },
    ]);

    Ok(DescriptorRes { set, _pool: pool })
}
