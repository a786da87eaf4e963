// Buffer utilities
//
// Buffers are backed by gpu-allocator sub-allocations instead of one
// vkAllocateMemory call per buffer.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use super::VulkanDevice;

/// Helper to create a GPU buffer with specified usage and memory location
pub fn create_buffer(
    device: &VulkanDevice,
    name: &str,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
) -> Result<(vk::Buffer, Allocation)> {
    // Create buffer
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe {
        device.device.create_buffer(&buffer_info, None)
            .with_context(|| format!("Failed to create buffer {}", name))?
    };

    // Get memory requirements
    let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

    let allocation = match device.allocate(name, requirements, location, true) {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(e);
        }
    };

    // Bind memory to buffer
    let bound = unsafe {
        device.device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
    };
    if let Err(e) = bound {
        unsafe { device.device.destroy_buffer(buffer, None) };
        device.free(allocation);
        return Err(e).context("Failed to bind buffer memory");
    }

    Ok((buffer, allocation))
}

/// Copy `data` into the start of a host-visible allocation
pub fn write_mapped(allocation: &mut Allocation, data: &[u8]) -> Result<()> {
    let mapped = allocation
        .mapped_slice_mut()
        .context("Allocation is not host visible")?;

    if data.len() > mapped.len() {
        anyhow::bail!(
            "{} bytes do not fit in a {} byte mapping",
            data.len(),
            mapped.len()
        );
    }

    mapped[..data.len()].copy_from_slice(data);
    Ok(())
}
