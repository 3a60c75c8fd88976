// Command pools, recording and submission
//
// Every submission gets its own fence; waiting on the fence is the only
// blocking call the backend makes.

use super::pipeline::VulkanPipeline;
use super::VulkanDevice;
use ash::prelude::VkResult;
use ash::vk;
use std::time::Duration;

pub fn create_command_pool(
    device: &VulkanDevice,
    family: u32,
    flags: vk::CommandPoolCreateFlags,
) -> VkResult<vk::CommandPool> {
    let pool_info = vk::CommandPoolCreateInfo::builder()
        .queue_family_index(family)
        .flags(flags);

    unsafe { device.device.create_command_pool(&pool_info, None) }
}

pub fn allocate_command_buffers(
    device: &VulkanDevice,
    pool: vk::CommandPool,
    count: u32,
) -> VkResult<Vec<vk::CommandBuffer>> {
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(count);

    unsafe { device.device.allocate_command_buffers(&alloc_info) }
}

pub fn begin(device: &VulkanDevice, command_buffer: vk::CommandBuffer) -> VkResult<()> {
    let begin_info = vk::CommandBufferBeginInfo::builder()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

    unsafe { device.device.begin_command_buffer(command_buffer, &begin_info) }
}

pub fn dispatch(
    device: &VulkanDevice,
    command_buffer: vk::CommandBuffer,
    pipeline: &VulkanPipeline,
    groups: [u32; 3],
) {
    unsafe {
        device
            .device
            .cmd_bind_pipeline(command_buffer, pipeline.bind_point, pipeline.pipeline);
        device
            .device
            .cmd_dispatch(command_buffer, groups[0], groups[1], groups[2]);
    }
}

/// Submit with a fresh fence; returns immediately
pub fn submit(
    device: &VulkanDevice,
    queue: vk::Queue,
    command_buffers: &[vk::CommandBuffer],
) -> VkResult<vk::Fence> {
    let fence_info = vk::FenceCreateInfo::builder();
    let fence = unsafe { device.device.create_fence(&fence_info, None) }?;

    let submit_info = vk::SubmitInfo::builder()
        .command_buffers(command_buffers)
        .build();

    if let Err(e) = unsafe { device.device.queue_submit(queue, &[submit_info], fence) } {
        unsafe { device.device.destroy_fence(fence, None) };
        return Err(e);
    }

    Ok(fence)
}

/// `Ok(false)` when the timeout elapsed before the fence signaled
pub fn wait(device: &VulkanDevice, fence: vk::Fence, timeout: Duration) -> VkResult<bool> {
    let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);

    match unsafe { device.device.wait_for_fences(&[fence], true, timeout_ns) } {
        Ok(()) => Ok(true),
        Err(vk::Result::TIMEOUT) => Ok(false),
        Err(e) => Err(e),
    }
}
