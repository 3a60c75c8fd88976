// Buffers, images, device memory and views
//
// The registry decides which memory type to use and where a resource
// lands inside an allocation; these helpers only make the calls.

use super::VulkanDevice;
use crate::backend::{BufferDesc, BufferViewDesc, ImageDesc, ImageViewDesc};
use ash::prelude::VkResult;
use ash::vk;

pub fn create_buffer(
    device: &VulkanDevice,
    desc: &BufferDesc,
) -> VkResult<(vk::Buffer, vk::MemoryRequirements)> {
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(desc.size)
        .usage(desc.usage)
        .sharing_mode(desc.sharing_mode);

    unsafe {
        let buffer = device.device.create_buffer(&buffer_info, None)?;
        let requirements = device.device.get_buffer_memory_requirements(buffer);
        Ok((buffer, requirements))
    }
}

pub fn create_image(
    device: &VulkanDevice,
    desc: &ImageDesc,
) -> VkResult<(vk::Image, vk::MemoryRequirements)> {
    let image_info = vk::ImageCreateInfo::builder()
        .image_type(desc.image_type)
        .extent(desc.extent)
        .mip_levels(desc.mip_levels)
        .array_layers(desc.array_layers)
        .format(desc.format)
        .tiling(desc.tiling)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(desc.usage)
        .samples(desc.samples)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    unsafe {
        let image = device.device.create_image(&image_info, None)?;
        let requirements = device.device.get_image_memory_requirements(image);
        Ok((image, requirements))
    }
}

pub fn allocate(
    device: &VulkanDevice,
    size: vk::DeviceSize,
    memory_type_index: u32,
) -> VkResult<vk::DeviceMemory> {
    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(size)
        .memory_type_index(memory_type_index);

    unsafe { device.device.allocate_memory(&alloc_info, None) }
}

/// Copy bytes into host-visible memory
pub fn write(
    device: &VulkanDevice,
    memory: vk::DeviceMemory,
    offset: vk::DeviceSize,
    data: &[u8],
) -> VkResult<()> {
    unsafe {
        let ptr = device
            .device
            .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?
            as *mut u8;

        ptr.add(offset as usize)
            .copy_from_nonoverlapping(data.as_ptr(), data.len());

        // Whole-allocation range keeps the flush valid on non-coherent types
        let range = vk::MappedMemoryRange::builder()
            .memory(memory)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();
        let flushed = device.device.flush_mapped_memory_ranges(&[range]);
        device.device.unmap_memory(memory);
        flushed
    }
}

/// Copy bytes out of host-visible memory
pub fn read(
    device: &VulkanDevice,
    memory: vk::DeviceMemory,
    offset: vk::DeviceSize,
    out: &mut [u8],
) -> VkResult<()> {
    unsafe {
        let ptr = device
            .device
            .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?
            as *const u8;

        let range = vk::MappedMemoryRange::builder()
            .memory(memory)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();
        let invalidated = device.device.invalidate_mapped_memory_ranges(&[range]);
        if invalidated.is_ok() {
            out.as_mut_ptr()
                .copy_from_nonoverlapping(ptr.add(offset as usize), out.len());
        }
        device.device.unmap_memory(memory);
        invalidated
    }
}

pub fn create_buffer_view(
    device: &VulkanDevice,
    buffer: vk::Buffer,
    desc: &BufferViewDesc,
) -> VkResult<vk::BufferView> {
    let view_info = vk::BufferViewCreateInfo::builder()
        .buffer(buffer)
        .format(desc.format)
        .offset(desc.offset)
        .range(desc.range);

    unsafe { device.device.create_buffer_view(&view_info, None) }
}

pub fn create_image_view(
    device: &VulkanDevice,
    image: vk::Image,
    desc: &ImageViewDesc,
) -> VkResult<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(desc.view_type)
        .format(desc.format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(desc.subresource_range);

    unsafe { device.device.create_image_view(&view_info, None) }
}
