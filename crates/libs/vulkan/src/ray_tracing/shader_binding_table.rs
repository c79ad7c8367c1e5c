use anyhow::Result;
use ash::vk;
use gpu_allocator::MemoryLocation;
use thiserror::Error as ThisError;

use crate::{utils::compute_aligned_size, Buffer, Context, RayTracingPipeline};

/// Size of one inline root argument (a descriptor handle or device address).
pub const ROOT_ARGUMENT_SIZE: u64 = std::mem::size_of::<u64>() as u64;

/// Looks up the opaque identifier of a named shader group.
pub trait ShaderIdentifiers {
    fn shader_identifier(&self, name: &str) -> Option<&[u8]>;

    /// Inline arguments declared for `name`, if known.
    fn inline_argument_count(&self, _name: &str) -> Option<u32> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbtSection {
    RayGen,
    Miss,
    HitGroup,
}

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum ShaderBindingTableError {
    #[error("shader binding table needs exactly one ray generation record, found {0}")]
    RayGenCount(usize),
    #[error("shader binding table has no {0:?} record")]
    EmptySection(SbtSection),
    #[error("pipeline has no shader group named {0:?}")]
    UnknownShader(String),
    #[error("record {name:?} has {provided} arguments but its root signature declares {expected}")]
    ArgumentCount {
        name: String,
        provided: usize,
        expected: u32,
    },
    #[error("shader binding table needs {required} bytes but the buffer holds {available}")]
    BufferTooSmall { required: u64, available: u64 },
}

/// Device alignment rules for shader records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtAlignment {
    pub identifier_size: u64,
    pub record_alignment: u64,
    pub section_alignment: u64,
}

impl SbtAlignment {
    pub fn from_properties(properties: &vk::PhysicalDeviceRayTracingPipelinePropertiesKHR) -> Self {
        Self {
            identifier_size: properties.shader_group_handle_size as _,
            record_alignment: properties.shader_group_handle_alignment as _,
            section_alignment: properties.shader_group_base_alignment as _,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionLayout {
    pub offset: u64,
    pub stride: u64,
    pub count: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShaderBindingTableLayout {
    pub ray_gen: SectionLayout,
    pub miss: SectionLayout,
    pub hit_group: SectionLayout,
    pub total_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ShaderRecord {
    name: String,
    arguments: Vec<u64>,
}

/// Lays out fixed-stride records in three sections: ray generation, miss and
/// hit group. Records are written as identifier followed by their arguments.
#[derive(Debug, Clone)]
pub struct ShaderBindingTableBuilder {
    alignment: SbtAlignment,
    ray_gen: Vec<ShaderRecord>,
    miss: Vec<ShaderRecord>,
    hit_group: Vec<ShaderRecord>,
}

impl ShaderBindingTableBuilder {
    pub fn new(alignment: SbtAlignment) -> Self {
        Self {
            alignment,
            ray_gen: vec![],
            miss: vec![],
            hit_group: vec![],
        }
    }

    pub fn reset(&mut self) {
        self.ray_gen.clear();
        self.miss.clear();
        self.hit_group.clear();
    }

    pub fn add_ray_gen_record(&mut self, name: &str, arguments: &[u64]) -> &mut Self {
        self.ray_gen.push(ShaderRecord {
            name: name.to_owned(),
            arguments: arguments.to_vec(),
        });
        self
    }

    pub fn add_miss_record(&mut self, name: &str, arguments: &[u64]) -> &mut Self {
        self.miss.push(ShaderRecord {
            name: name.to_owned(),
            arguments: arguments.to_vec(),
        });
        self
    }

    pub fn add_hit_group_record(&mut self, name: &str, arguments: &[u64]) -> &mut Self {
        self.hit_group.push(ShaderRecord {
            name: name.to_owned(),
            arguments: arguments.to_vec(),
        });
        self
    }

    /// Duplicates the last record of `section` until the section spans at
    /// least `min_size` bytes. Does nothing on an empty section.
    pub fn pad_section(&mut self, section: SbtSection, min_size: u64) -> &mut Self {
        let alignment = self.alignment;
        let records = self.records_mut(section);

        while let Some(last) = records.last().cloned() {
            let stride = stride(&alignment, records);
            if stride == 0 || stride * records.len() as u64 >= min_size {
                break;
            }
            records.push(last);
        }
        self
    }

    pub fn record_count(&self, section: SbtSection) -> usize {
        match section {
            SbtSection::RayGen => self.ray_gen.len(),
            SbtSection::Miss => self.miss.len(),
            SbtSection::HitGroup => self.hit_group.len(),
        }
    }

    fn records_mut(&mut self, section: SbtSection) -> &mut Vec<ShaderRecord> {
        match section {
            SbtSection::RayGen => &mut self.ray_gen,
            SbtSection::Miss => &mut self.miss,
            SbtSection::HitGroup => &mut self.hit_group,
        }
    }

    pub fn layout(&self) -> ShaderBindingTableLayout {
        let ray_gen = section_layout(&self.alignment, &self.ray_gen, 0);
        let miss = section_layout(&self.alignment, &self.miss, ray_gen.size);
        let hit_group = section_layout(&self.alignment, &self.hit_group, ray_gen.size + miss.size);

        ShaderBindingTableLayout {
            ray_gen,
            miss,
            hit_group,
            total_size: ray_gen.size + miss.size + hit_group.size,
        }
    }

    pub fn compute_total_size(&self) -> u64 {
        self.layout().total_size
    }

    fn validate(&self) -> Result<(), ShaderBindingTableError> {
        if self.ray_gen.len() != 1 {
            return Err(ShaderBindingTableError::RayGenCount(self.ray_gen.len()));
        }
        if self.miss.is_empty() {
            return Err(ShaderBindingTableError::EmptySection(SbtSection::Miss));
        }
        if self.hit_group.is_empty() {
            return Err(ShaderBindingTableError::EmptySection(SbtSection::HitGroup));
        }
        Ok(())
    }

    /// Table contents with every record resolved against `identifiers`.
    pub fn encode<I: ShaderIdentifiers + ?Sized>(
        &self,
        identifiers: &I,
    ) -> Result<Vec<u8>, ShaderBindingTableError> {
        self.validate()?;

        let layout = self.layout();
        let mut data = vec![0u8; layout.total_size as usize];

        let sections = [
            (&self.ray_gen, layout.ray_gen),
            (&self.miss, layout.miss),
            (&self.hit_group, layout.hit_group),
        ];
        for (records, section) in sections {
            for (index, record) in records.iter().enumerate() {
                let offset = (section.offset + index as u64 * section.stride) as usize;
                self.write_record(&mut data[offset..], record, identifiers)?;
            }
        }

        Ok(data)
    }

    fn write_record<I: ShaderIdentifiers + ?Sized>(
        &self,
        destination: &mut [u8],
        record: &ShaderRecord,
        identifiers: &I,
    ) -> Result<(), ShaderBindingTableError> {
        let identifier = identifiers
            .shader_identifier(&record.name)
            .ok_or_else(|| ShaderBindingTableError::UnknownShader(record.name.clone()))?;

        if let Some(expected) = identifiers.inline_argument_count(&record.name) {
            if expected as usize != record.arguments.len() {
                return Err(ShaderBindingTableError::ArgumentCount {
                    name: record.name.clone(),
                    provided: record.arguments.len(),
                    expected,
                });
            }
        }

        let identifier_size = self.alignment.identifier_size as usize;
        let copied = identifier.len().min(identifier_size);
        destination[..copied].copy_from_slice(&identifier[..copied]);

        let arguments = &mut destination[identifier_size..];
        for (chunk, argument) in arguments
            .chunks_exact_mut(ROOT_ARGUMENT_SIZE as usize)
            .zip(&record.arguments)
        {
            chunk.copy_from_slice(&argument.to_le_bytes());
        }

        Ok(())
    }

    /// Writes the table into `destination`, starting at the first address
    /// aligned for a section. Returns the regions to pass to `trace_rays`.
    pub fn generate(&self, destination: &Buffer, pipeline: &RayTracingPipeline) -> Result<SbtRegions> {
        let layout = self.layout();
        let address = destination.get_device_address();
        let base = compute_aligned_size(address, self.alignment.section_alignment);
        let padding = base - address;

        let required = padding + layout.total_size;
        if required > destination.size {
            return Err(ShaderBindingTableError::BufferTooSmall {
                required,
                available: destination.size,
            }
            .into());
        }

        let mut data = vec![0u8; padding as usize];
        data.extend(self.encode(pipeline)?);
        destination.copy_data_to_buffer(&data)?;

        log::debug!("Shader binding table layout: {layout:?}");

        Ok(SbtRegions::new(&layout, base))
    }
}

fn record_size(alignment: &SbtAlignment, record: &ShaderRecord) -> u64 {
    alignment.identifier_size + ROOT_ARGUMENT_SIZE * record.arguments.len() as u64
}

fn stride(alignment: &SbtAlignment, records: &[ShaderRecord]) -> u64 {
    let largest = records
        .iter()
        .map(|r| record_size(alignment, r))
        .max()
        .unwrap_or(0);
    compute_aligned_size(largest, alignment.record_alignment)
}

fn section_layout(alignment: &SbtAlignment, records: &[ShaderRecord], offset: u64) -> SectionLayout {
    let stride = stride(alignment, records);
    let count = records.len() as u64;

    SectionLayout {
        offset,
        stride,
        count,
        size: compute_aligned_size(stride * count, alignment.section_alignment),
    }
}

/// Device address ranges of the three sections.
#[derive(Debug, Clone, Copy, Default)]
pub struct SbtRegions {
    pub ray_gen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit_group: vk::StridedDeviceAddressRegionKHR,
}

impl SbtRegions {
    pub fn new(layout: &ShaderBindingTableLayout, base_address: vk::DeviceAddress) -> Self {
        let region = |section: &SectionLayout, stride: u64| vk::StridedDeviceAddressRegionKHR {
            device_address: base_address + section.offset,
            stride,
            size: section.size,
        };

        // The ray generation region must have stride equal to its size
        Self {
            ray_gen: region(&layout.ray_gen, layout.ray_gen.size),
            miss: region(&layout.miss, layout.miss.stride),
            hit_group: region(&layout.hit_group, layout.hit_group.stride),
        }
    }
}

pub struct ShaderBindingTable {
    _buffer: Buffer,
    pub layout: ShaderBindingTableLayout,
    regions: SbtRegions,
    pipeline_generation: u64,
}

impl ShaderBindingTable {
    pub fn regions(&self) -> &SbtRegions {
        &self.regions
    }

    /// Whether the table was generated from this pipeline. A rebuilt
    /// pipeline has new identifiers and needs a new table.
    pub fn is_current_for(&self, pipeline: &RayTracingPipeline) -> bool {
        self.pipeline_generation == pipeline.generation()
    }
}

impl Context {
    pub fn create_shader_binding_table(
        &self,
        builder: &ShaderBindingTableBuilder,
        pipeline: &RayTracingPipeline,
    ) -> Result<ShaderBindingTable> {
        let layout = builder.layout();
        let size = layout.total_size + builder.alignment.section_alignment;

        let buffer = self.create_buffer(
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
            size,
        )?;
        let regions = builder.generate(&buffer, pipeline)?;

        Ok(ShaderBindingTable {
            _buffer: buffer,
            layout,
            regions,
            pipeline_generation: pipeline.generation(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const ALIGNMENT: SbtAlignment = SbtAlignment {
        identifier_size: 32,
        record_alignment: 32,
        section_alignment: 64,
    };

    struct FakeIdentifiers {
        identifiers: HashMap<&'static str, Vec<u8>>,
        arguments: HashMap<&'static str, u32>,
    }

    impl FakeIdentifiers {
        fn new(names: &[(&'static str, u8, u32)]) -> Self {
            Self {
                identifiers: names
                    .iter()
                    .map(|(name, byte, _)| (*name, vec![*byte; ALIGNMENT.identifier_size as usize]))
                    .collect(),
                arguments: names.iter().map(|(name, _, args)| (*name, *args)).collect(),
            }
        }
    }

    impl ShaderIdentifiers for FakeIdentifiers {
        fn shader_identifier(&self, name: &str) -> Option<&[u8]> {
            self.identifiers.get(name).map(Vec::as_slice)
        }

        fn inline_argument_count(&self, name: &str) -> Option<u32> {
            self.arguments.get(name).copied()
        }
    }

    fn triangle_table() -> ShaderBindingTableBuilder {
        let mut builder = ShaderBindingTableBuilder::new(ALIGNMENT);
        builder
            .add_ray_gen_record("RayGen", &[0xAAAA])
            .add_miss_record("Miss", &[])
            .add_hit_group_record("HitGroup", &[0xDEAD_BEEF]);
        builder
    }

    #[test]
    fn total_size_sums_aligned_sections() {
        let builder = triangle_table();
        let layout = builder.layout();

        // 32 + 8 aligned to 32
        assert_eq!(layout.ray_gen.stride, 64);
        assert_eq!(layout.miss.stride, 32);
        assert_eq!(layout.hit_group.stride, 64);

        let expected = compute_aligned_size(layout.ray_gen.stride, 64)
            + compute_aligned_size(layout.miss.stride, 64)
            + compute_aligned_size(layout.hit_group.stride, 64);
        assert_eq!(builder.compute_total_size(), expected);
        assert_eq!(expected, 192);
    }

    #[test]
    fn padded_miss_section_keeps_total_size() {
        let mut builder = triangle_table();
        builder.pad_section(SbtSection::Miss, ALIGNMENT.section_alignment);

        assert_eq!(builder.record_count(SbtSection::Miss), 2);

        let layout = builder.layout();
        assert_eq!(layout.miss.count, 2);
        assert_eq!(layout.miss.size, 64);
        assert_eq!(layout.total_size, 192);
    }

    #[test]
    fn padding_never_happens_implicitly() {
        let builder = triangle_table();
        assert_eq!(builder.record_count(SbtSection::Miss), 1);
    }

    #[test]
    fn padding_an_empty_section_is_a_no_op() {
        let mut builder = ShaderBindingTableBuilder::new(ALIGNMENT);
        builder.pad_section(SbtSection::Miss, 256);
        assert_eq!(builder.record_count(SbtSection::Miss), 0);
    }

    #[test]
    fn section_offsets_are_cumulative_sizes() {
        let mut builder = triangle_table();
        builder
            .add_hit_group_record("HitGroup", &[1])
            .add_hit_group_record("HitGroup", &[2]);
        let layout = builder.layout();

        assert_eq!(layout.ray_gen.offset, 0);
        assert_eq!(layout.miss.offset, layout.ray_gen.size);
        assert_eq!(layout.hit_group.offset, layout.ray_gen.size + layout.miss.size);
        assert_eq!(layout.hit_group.size, 192);
        assert_eq!(layout.total_size, 64 + 64 + 192);
    }

    #[test]
    fn encoded_records_land_at_their_offsets() {
        let mut builder = triangle_table();
        builder.pad_section(SbtSection::Miss, 64);
        let ids = FakeIdentifiers::new(&[("RayGen", 1, 1), ("Miss", 2, 0), ("HitGroup", 3, 1)]);

        let data = builder.encode(&ids).unwrap();
        let layout = builder.layout();
        assert_eq!(data.len() as u64, layout.total_size);

        assert!(data[..32].iter().all(|b| *b == 1));
        assert_eq!(data[32..40], 0xAAAAu64.to_le_bytes());

        let miss = layout.miss.offset as usize;
        assert!(data[miss..miss + 32].iter().all(|b| *b == 2));
        assert!(data[miss + 32..miss + 64].iter().all(|b| *b == 2));

        let hit = layout.hit_group.offset as usize;
        assert!(data[hit..hit + 32].iter().all(|b| *b == 3));
        assert_eq!(data[hit + 32..hit + 40], 0xDEAD_BEEFu64.to_le_bytes());
    }

    #[test]
    fn regions_match_layout() {
        let builder = triangle_table();
        let layout = builder.layout();
        let regions = SbtRegions::new(&layout, 0x1000);

        assert_eq!(regions.ray_gen.device_address, 0x1000);
        assert_eq!(regions.ray_gen.stride, regions.ray_gen.size);
        assert_eq!(regions.miss.device_address, 0x1000 + layout.ray_gen.size);
        assert_eq!(regions.miss.stride, 32);
        assert_eq!(
            regions.hit_group.device_address,
            0x1000 + layout.ray_gen.size + layout.miss.size
        );
        assert_eq!(regions.hit_group.size, 64);
    }

    #[test]
    fn encode_validates_sections_and_names() {
        let ids = FakeIdentifiers::new(&[("RayGen", 1, 1), ("Miss", 2, 0)]);

        let mut builder = ShaderBindingTableBuilder::new(ALIGNMENT);
        builder.add_miss_record("Miss", &[]);
        assert_eq!(
            builder.encode(&ids).unwrap_err(),
            ShaderBindingTableError::RayGenCount(0)
        );

        let builder = triangle_table();
        assert_eq!(
            builder.encode(&ids).unwrap_err(),
            ShaderBindingTableError::UnknownShader("HitGroup".to_owned())
        );
    }

    #[test]
    fn argument_count_must_match_root_signature() {
        let ids = FakeIdentifiers::new(&[("RayGen", 1, 0), ("Miss", 2, 0), ("HitGroup", 3, 1)]);

        assert_eq!(
            triangle_table().encode(&ids).unwrap_err(),
            ShaderBindingTableError::ArgumentCount {
                name: "RayGen".to_owned(),
                provided: 1,
                expected: 0
            }
        );
    }

    #[test]
    fn reset_clears_every_section() {
        let mut builder = triangle_table();
        builder.reset();

        assert_eq!(builder.compute_total_size(), 0);
        assert_eq!(builder.record_count(SbtSection::RayGen), 0);
    }
}
