// Vulkan backend - ash implementation of `Backend`
//
// Design: thin wrapper around ash. Each call maps to one (or a few)
// Vulkan entry points; ownership and lifetimes are the registry's job.

pub mod device;
pub mod memory;
pub mod pipeline;
pub mod swapchain;
pub mod sync;

pub use device::{VulkanDevice, VulkanInstance};
pub use pipeline::VulkanPipeline;
pub use swapchain::VulkanSwapchain;

use super::*;
use anyhow::{Context, Result};
use ash::Entry;

pub struct VulkanBackend {
    entry: Entry,
}

impl VulkanBackend {
    /// Load the Vulkan library
    pub fn new() -> Result<Self> {
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;
        Ok(Self { entry })
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }
}

impl Backend for VulkanBackend {
    type Instance = VulkanInstance;
    type PhysicalDevice = vk::PhysicalDevice;
    type Device = VulkanDevice;
    type Queue = vk::Queue;
    type Surface = vk::SurfaceKHR;
    type Swapchain = VulkanSwapchain;
    type Memory = vk::DeviceMemory;
    type Buffer = vk::Buffer;
    type Image = vk::Image;
    type BufferView = vk::BufferView;
    type ImageView = vk::ImageView;
    type ShaderModule = vk::ShaderModule;
    type Pipeline = VulkanPipeline;
    type CommandPool = vk::CommandPool;
    type CommandBuffer = vk::CommandBuffer;
    type Submission = vk::Fence;

    fn instance_extensions(&self) -> VkResult<Vec<String>> {
        device::instance_extensions(&self.entry)
    }

    fn instance_layers(&self) -> VkResult<Vec<String>> {
        device::instance_layers(&self.entry)
    }

    fn create_instance(&mut self, desc: &InstanceDesc) -> VkResult<Self::Instance> {
        device::create_instance(&self.entry, desc)
    }

    fn destroy_instance(&mut self, instance: Self::Instance) {
        device::destroy_instance(instance);
    }

    fn physical_devices(
        &mut self,
        instance: &Self::Instance,
    ) -> VkResult<Vec<(Self::PhysicalDevice, PhysicalDeviceInfo)>> {
        device::physical_devices(instance)
    }

    fn create_device(
        &mut self,
        instance: &Self::Instance,
        physical_device: Self::PhysicalDevice,
        desc: &DeviceDesc,
    ) -> VkResult<Self::Device> {
        device::create_device(instance, physical_device, desc)
    }

    fn get_queue(&mut self, device: &Self::Device, family: u32, index: u32) -> Self::Queue {
        unsafe { device.device.get_device_queue(family, index) }
    }

    fn device_wait_idle(&mut self, device: &Self::Device) -> VkResult<()> {
        unsafe { device.device.device_wait_idle() }
    }

    fn destroy_device(&mut self, device: Self::Device) {
        device::destroy_device(device);
    }

    fn create_swapchain(
        &mut self,
        device: &Self::Device,
        surface: &Self::Surface,
        desc: &SwapchainDesc,
        old: Option<&Self::Swapchain>,
    ) -> VkResult<(Self::Swapchain, SwapchainInfo)> {
        swapchain::create(device, *surface, desc, old)
    }

    fn destroy_swapchain(&mut self, device: &Self::Device, swapchain: Self::Swapchain) {
        swapchain::destroy(device, swapchain);
    }

    fn destroy_surface(&mut self, instance: &Self::Instance, surface: Self::Surface) {
        unsafe { instance.surface_loader.destroy_surface(surface, None) };
    }

    fn create_buffer(
        &mut self,
        device: &Self::Device,
        desc: &BufferDesc,
    ) -> VkResult<(Self::Buffer, vk::MemoryRequirements)> {
        memory::create_buffer(device, desc)
    }

    fn create_image(
        &mut self,
        device: &Self::Device,
        desc: &ImageDesc,
    ) -> VkResult<(Self::Image, vk::MemoryRequirements)> {
        memory::create_image(device, desc)
    }

    fn allocate_memory(
        &mut self,
        device: &Self::Device,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> VkResult<Self::Memory> {
        memory::allocate(device, size, memory_type_index)
    }

    fn free_memory(&mut self, device: &Self::Device, memory: Self::Memory) {
        unsafe { device.device.free_memory(memory, None) };
    }

    fn bind_buffer_memory(
        &mut self,
        device: &Self::Device,
        buffer: Self::Buffer,
        memory: &Self::Memory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        unsafe { device.device.bind_buffer_memory(buffer, *memory, offset) }
    }

    fn bind_image_memory(
        &mut self,
        device: &Self::Device,
        image: Self::Image,
        memory: &Self::Memory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        unsafe { device.device.bind_image_memory(image, *memory, offset) }
    }

    fn write_memory(
        &mut self,
        device: &Self::Device,
        memory: &Self::Memory,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> VkResult<()> {
        memory::write(device, *memory, offset, data)
    }

    fn read_memory(
        &mut self,
        device: &Self::Device,
        memory: &Self::Memory,
        offset: vk::DeviceSize,
        out: &mut [u8],
    ) -> VkResult<()> {
        memory::read(device, *memory, offset, out)
    }

    fn create_buffer_view(
        &mut self,
        device: &Self::Device,
        buffer: Self::Buffer,
        desc: &BufferViewDesc,
    ) -> VkResult<Self::BufferView> {
        memory::create_buffer_view(device, buffer, desc)
    }

    fn create_image_view(
        &mut self,
        device: &Self::Device,
        image: Self::Image,
        desc: &ImageViewDesc,
    ) -> VkResult<Self::ImageView> {
        memory::create_image_view(device, image, desc)
    }

    fn destroy_buffer_view(&mut self, device: &Self::Device, view: Self::BufferView) {
        unsafe { device.device.destroy_buffer_view(view, None) };
    }

    fn destroy_image_view(&mut self, device: &Self::Device, view: Self::ImageView) {
        unsafe { device.device.destroy_image_view(view, None) };
    }

    fn destroy_buffer(&mut self, device: &Self::Device, buffer: Self::Buffer) {
        unsafe { device.device.destroy_buffer(buffer, None) };
    }

    fn destroy_image(&mut self, device: &Self::Device, image: Self::Image) {
        unsafe { device.device.destroy_image(image, None) };
    }

    fn create_shader_module(
        &mut self,
        device: &Self::Device,
        code: &[u32],
    ) -> VkResult<Self::ShaderModule> {
        pipeline::create_shader_module(device, code)
    }

    fn destroy_shader_module(&mut self, device: &Self::Device, module: Self::ShaderModule) {
        unsafe { device.device.destroy_shader_module(module, None) };
    }

    fn create_pipeline(
        &mut self,
        device: &Self::Device,
        kind: PipelineKind,
        stages: &[StageDesc<'_, Self::ShaderModule>],
    ) -> VkResult<Self::Pipeline> {
        pipeline::create(device, kind, stages)
    }

    fn destroy_pipeline(&mut self, device: &Self::Device, pipeline: Self::Pipeline) {
        pipeline::destroy(device, pipeline);
    }

    fn create_command_pool(
        &mut self,
        device: &Self::Device,
        family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<Self::CommandPool> {
        sync::create_command_pool(device, family, flags)
    }

    fn allocate_command_buffers(
        &mut self,
        device: &Self::Device,
        pool: &Self::CommandPool,
        count: u32,
    ) -> VkResult<Vec<Self::CommandBuffer>> {
        sync::allocate_command_buffers(device, *pool, count)
    }

    fn reset_command_pool(
        &mut self,
        device: &Self::Device,
        pool: &Self::CommandPool,
    ) -> VkResult<()> {
        unsafe {
            device
                .device
                .reset_command_pool(*pool, vk::CommandPoolResetFlags::empty())
        }
    }

    fn destroy_command_pool(&mut self, device: &Self::Device, pool: Self::CommandPool) {
        unsafe { device.device.destroy_command_pool(pool, None) };
    }

    fn begin_command_buffer(
        &mut self,
        device: &Self::Device,
        command_buffer: Self::CommandBuffer,
    ) -> VkResult<()> {
        sync::begin(device, command_buffer)
    }

    fn end_command_buffer(
        &mut self,
        device: &Self::Device,
        command_buffer: Self::CommandBuffer,
    ) -> VkResult<()> {
        unsafe { device.device.end_command_buffer(command_buffer) }
    }

    fn cmd_fill_buffer(
        &mut self,
        device: &Self::Device,
        command_buffer: Self::CommandBuffer,
        buffer: Self::Buffer,
        value: u32,
    ) {
        unsafe {
            device
                .device
                .cmd_fill_buffer(command_buffer, buffer, 0, vk::WHOLE_SIZE, value)
        };
    }

    fn cmd_copy_buffer(
        &mut self,
        device: &Self::Device,
        command_buffer: Self::CommandBuffer,
        src: Self::Buffer,
        dst: Self::Buffer,
        size: vk::DeviceSize,
    ) {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe {
            device
                .device
                .cmd_copy_buffer(command_buffer, src, dst, &[region])
        };
    }

    fn cmd_dispatch(
        &mut self,
        device: &Self::Device,
        command_buffer: Self::CommandBuffer,
        pipeline: &Self::Pipeline,
        groups: [u32; 3],
    ) {
        sync::dispatch(device, command_buffer, pipeline, groups);
    }

    fn submit(
        &mut self,
        device: &Self::Device,
        queue: Self::Queue,
        command_buffers: &[Self::CommandBuffer],
    ) -> VkResult<Self::Submission> {
        sync::submit(device, queue, command_buffers)
    }

    fn wait(
        &mut self,
        device: &Self::Device,
        submission: &Self::Submission,
        timeout: Duration,
    ) -> VkResult<bool> {
        sync::wait(device, *submission, timeout)
    }

    fn retire_submission(&mut self, device: &Self::Device, submission: Self::Submission) {
        unsafe { device.device.destroy_fence(submission, None) };
    }
}
