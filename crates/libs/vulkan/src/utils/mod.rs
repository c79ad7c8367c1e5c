use std::mem::size_of_val;

use anyhow::Result;
use ash::vk;
pub mod platforms;

use gpu_allocator::MemoryLocation;

use crate::{Buffer, Context};

/// Rounds `size` up to the next multiple of `alignment`, which must be a
/// power of two.
pub fn compute_aligned_size(size: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return size;
    }
    (size + (alignment - 1)) & !(alignment - 1)
}

pub fn read_shader_from_bytes(bytes: &[u8]) -> Result<Vec<u32>> {
    let mut cursor = std::io::Cursor::new(bytes);
    Ok(ash::util::read_spv(&mut cursor)?)
}

pub fn create_gpu_only_buffer_from_data<T: Copy>(
    context: &Context,
    usage: vk::BufferUsageFlags,
    data: &[T],
) -> Result<Buffer> {
    let size = size_of_val(data) as _;
    let staging_buffer = context.create_buffer(
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryLocation::CpuToGpu,
        size,
    )?;
    staging_buffer.copy_data_to_buffer(data)?;

    let buffer = context.create_buffer(
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::GpuOnly,
        size,
    )?;

    context.execute_one_time_commands(|cmd_buffer| {
        cmd_buffer.copy_buffer(&staging_buffer, &buffer);
    })?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::compute_aligned_size;

    #[test]
    fn aligned_size_rounds_up_to_power_of_two() {
        assert_eq!(compute_aligned_size(0, 64), 0);
        assert_eq!(compute_aligned_size(1, 64), 64);
        assert_eq!(compute_aligned_size(64, 64), 64);
        assert_eq!(compute_aligned_size(65, 64), 128);
        assert_eq!(compute_aligned_size(40, 32), 64);
    }
}
