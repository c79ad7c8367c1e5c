use std::{mem::size_of, sync::Arc};

use anyhow::Result;
use ash::vk;
use glam::Affine3A;
use gpu_allocator::MemoryLocation;

use crate::{utils::compute_aligned_size, Buffer, CommandBuffer, Context, RayTracingContext};

pub struct AccelerationStructure {
    ray_tracing: Arc<RayTracingContext>,
    pub(crate) inner: vk::AccelerationStructureKHR,
    _buffer: Buffer,
    pub level: vk::AccelerationStructureTypeKHR,
    pub address: u64,
}

/// Memory behind one build. `scratch` is only needed until the command
/// buffer recording the build has retired, `result` for as long as rays are
/// traced against it and `instance_descs` (top level only) until the build
/// has run.
pub struct AccelerationStructureBuffers {
    pub scratch: Option<Buffer>,
    pub result: AccelerationStructure,
    pub instance_descs: Option<Buffer>,
}

impl AccelerationStructureBuffers {
    /// Drops the transient buffers. Only valid once the build has executed.
    pub fn release_scratch(&mut self) {
        self.scratch = None;
        self.instance_descs = None;
    }
}

/// A non-indexed triangle list with `R32G32B32_SFLOAT` positions at the start
/// of each vertex.
#[derive(Clone, Copy)]
pub struct BlasGeometry<'a> {
    pub vertex_buffer: &'a Buffer,
    pub vertex_count: u32,
    pub vertex_stride: vk::DeviceSize,
}

#[derive(Clone, Copy)]
pub struct TlasInstance<'a> {
    pub blas: &'a AccelerationStructure,
    pub transform: Affine3A,
}

impl AccelerationStructure {
    /// Allocates the structure and its scratch memory and records the build
    /// into `cmd_buffer`.
    fn build(
        context: &Context,
        cmd_buffer: &CommandBuffer,
        level: vk::AccelerationStructureTypeKHR,
        as_geometry: &[vk::AccelerationStructureGeometryKHR],
        as_ranges: &[vk::AccelerationStructureBuildRangeInfoKHR],
    ) -> Result<(Self, Buffer)> {
        let ray_tracing = context.ray_tracing.clone();
        let max_primitive_counts = as_ranges
            .iter()
            .map(|r| r.primitive_count)
            .collect::<Vec<_>>();

        let build_geo_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(level)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .geometries(as_geometry);

        let build_size = unsafe {
            ray_tracing
                .acceleration_structure_fn
                .get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &build_geo_info,
                    &max_primitive_counts,
                )
        };
        log::debug!(
            "{level:?} acceleration structure: {} bytes, {} bytes scratch",
            build_size.acceleration_structure_size,
            build_size.build_scratch_size
        );

        let buffer = context.create_buffer(
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            build_size.acceleration_structure_size,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(buffer.inner)
            .size(build_size.acceleration_structure_size)
            .ty(level);
        let inner = unsafe {
            ray_tracing
                .acceleration_structure_fn
                .create_acceleration_structure(&create_info, None)?
        };

        let scratch_alignment = ray_tracing
            .acceleration_structure_properties
            .min_acceleration_structure_scratch_offset_alignment
            as u64;
        let scratch_buffer = context.create_buffer(
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            build_size.build_scratch_size + scratch_alignment,
        )?;
        let scratch_buffer_address =
            compute_aligned_size(scratch_buffer.get_device_address(), scratch_alignment);

        let build_geo_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(level)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .geometries(as_geometry)
            .dst_acceleration_structure(inner)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_buffer_address,
            });

        cmd_buffer.build_acceleration_structures(&build_geo_info, as_ranges);

        let address_info =
            vk::AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(inner);
        let address = unsafe {
            ray_tracing
                .acceleration_structure_fn
                .get_acceleration_structure_device_address(&address_info)
        };

        Ok((
            Self {
                ray_tracing,
                inner,
                _buffer: buffer,
                level,
                address,
            },
            scratch_buffer,
        ))
    }
}

impl Context {
    /// Records one bottom level build covering every geometry. Vertex
    /// buffers need `ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR` and
    /// `SHADER_DEVICE_ADDRESS` usage.
    pub fn build_bottom_level_acceleration_structure(
        &self,
        cmd_buffer: &CommandBuffer,
        geometries: &[BlasGeometry],
    ) -> Result<AccelerationStructureBuffers> {
        let as_geometry = geometries
            .iter()
            .map(|g| {
                let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                    .vertex_format(vk::Format::R32G32B32_SFLOAT)
                    .vertex_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: g.vertex_buffer.get_device_address(),
                    })
                    .vertex_stride(g.vertex_stride)
                    .max_vertex(g.vertex_count.saturating_sub(1))
                    .index_type(vk::IndexType::NONE_KHR)
                    .build();

                vk::AccelerationStructureGeometryKHR::builder()
                    .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                    .flags(vk::GeometryFlagsKHR::OPAQUE)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                    .build()
            })
            .collect::<Vec<_>>();

        let as_ranges = geometries
            .iter()
            .map(|g| {
                vk::AccelerationStructureBuildRangeInfoKHR::builder()
                    .first_vertex(0)
                    .primitive_count(g.vertex_count / 3)
                    .primitive_offset(0)
                    .transform_offset(0)
                    .build()
            })
            .collect::<Vec<_>>();

        let (result, scratch) = AccelerationStructure::build(
            self,
            cmd_buffer,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            &as_geometry,
            &as_ranges,
        )?;

        Ok(AccelerationStructureBuffers {
            scratch: Some(scratch),
            result,
            instance_descs: None,
        })
    }

    /// Records a top level build. Every bottom level structure referenced
    /// must have its build recorded earlier in `cmd_buffer`, followed by
    /// `CommandBuffer::acceleration_structure_barrier`.
    pub fn build_top_level_acceleration_structure(
        &self,
        cmd_buffer: &CommandBuffer,
        instances: &[TlasInstance],
    ) -> Result<AccelerationStructureBuffers> {
        let instance_descs = instances
            .iter()
            .enumerate()
            .map(|(index, instance)| {
                instance_descriptor(index as u32, &instance.transform, instance.blas.address)
            })
            .collect::<Vec<_>>();

        let instance_buffer = self.create_buffer(
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
            (size_of::<vk::AccelerationStructureInstanceKHR>() * instance_descs.len().max(1)) as _,
        )?;
        instance_buffer.copy_data_to_buffer(&instance_descs)?;

        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: instance_buffer.get_device_address(),
            })
            .build();

        let as_geometry = vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: instances_data,
            })
            .build();

        let as_range = vk::AccelerationStructureBuildRangeInfoKHR::builder()
            .first_vertex(0)
            .primitive_count(instances.len() as _)
            .primitive_offset(0)
            .transform_offset(0)
            .build();

        let (result, scratch) = AccelerationStructure::build(
            self,
            cmd_buffer,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            std::slice::from_ref(&as_geometry),
            std::slice::from_ref(&as_range),
        )?;

        Ok(AccelerationStructureBuffers {
            scratch: Some(scratch),
            result,
            instance_descs: Some(instance_buffer),
        })
    }
}

/// Row-major 3x4 matrix as the instance descriptor expects it.
pub fn transform_matrix(transform: &Affine3A) -> vk::TransformMatrixKHR {
    let m = transform.matrix3;
    let t = transform.translation;

    vk::TransformMatrixKHR {
        matrix: [
            m.x_axis.x, m.y_axis.x, m.z_axis.x, t.x, //
            m.x_axis.y, m.y_axis.y, m.z_axis.y, t.y, //
            m.x_axis.z, m.y_axis.z, m.z_axis.z, t.z,
        ],
    }
}

pub fn instance_descriptor(
    index: u32,
    transform: &Affine3A,
    blas_address: u64,
) -> vk::AccelerationStructureInstanceKHR {
    vk::AccelerationStructureInstanceKHR {
        transform: transform_matrix(transform),
        instance_custom_index_and_mask: vk::Packed24_8::new(index, 0xFF),
        instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
            0,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as _,
        ),
        acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
            device_handle: blas_address,
        },
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        unsafe {
            self.ray_tracing
                .acceleration_structure_fn
                .destroy_acceleration_structure(self.inner, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use glam::{Mat3, Vec3};

    use super::*;

    #[test]
    fn identity_transform_is_row_major() {
        let matrix = transform_matrix(&Affine3A::IDENTITY).matrix;

        assert_eq!(
            matrix,
            [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]
        );
    }

    #[test]
    fn translation_fills_last_column() {
        let transform = Affine3A::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let matrix = transform_matrix(&transform).matrix;

        assert_eq!([matrix[3], matrix[7], matrix[11]], [1.0, 2.0, 3.0]);
    }

    #[test]
    fn rotation_rows_match_glam() {
        let transform = Affine3A::from_mat3(Mat3::from_rotation_z(std::f32::consts::FRAC_PI_2));
        let matrix = transform_matrix(&transform).matrix;

        let rotated = transform.transform_vector3(Vec3::X);
        let row = |r: usize| Vec3::new(matrix[r * 4], matrix[r * 4 + 1], matrix[r * 4 + 2]);
        let by_rows = Vec3::new(row(0).dot(Vec3::X), row(1).dot(Vec3::X), row(2).dot(Vec3::X));

        assert!(by_rows.abs_diff_eq(rotated, 1e-6));
    }

    #[test]
    fn instances_get_unique_index_and_full_mask() {
        let descs = (0..3)
            .map(|i| instance_descriptor(i, &Affine3A::IDENTITY, 0xABC0))
            .collect::<Vec<_>>();

        for (i, desc) in descs.iter().enumerate() {
            assert_eq!(desc.instance_custom_index_and_mask.low_24(), i as u32);
            assert_eq!(desc.instance_custom_index_and_mask.high_8(), 0xFF);
            assert_eq!(
                unsafe { desc.acceleration_structure_reference.device_handle },
                0xABC0
            );
        }
    }
}
