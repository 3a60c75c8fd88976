// Backend module - boundary to the native graphics API
//
// Design: the registry owns every native object, but never calls the
// graphics API directly. It goes through `Backend`, which mirrors the
// Vulkan object-creation calls and reports plain `vk::Result` codes.
//
// Implementations:
// - `vulkan::VulkanBackend`: ash on a real driver
// - `headless::HeadlessBackend`: deterministic software stand-in

pub mod headless;
pub mod vulkan;

pub use headless::HeadlessBackend;
pub use vulkan::VulkanBackend;

use ash::prelude::VkResult;
use ash::vk;
use std::ffi::CStr;
use std::time::Duration;

/// Parameters for instance creation
#[derive(Debug, Clone)]
pub struct InstanceDesc {
    pub app_name: String,
    pub app_version: u32,
    pub engine_name: String,
    pub api_version: u32,
    pub extensions: Vec<String>,
    pub layers: Vec<String>,
}

impl Default for InstanceDesc {
    fn default() -> Self {
        Self {
            app_name: "vk-registry".to_string(),
            app_version: vk::make_api_version(0, 0, 1, 0),
            engine_name: "vk-registry".to_string(),
            api_version: vk::API_VERSION_1_3,
            extensions: Vec::new(),
            layers: Vec::new(),
        }
    }
}

/// Read-only snapshot of a physical device, taken once at discovery
#[derive(Debug, Clone)]
pub struct PhysicalDeviceInfo {
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    pub memory: vk::PhysicalDeviceMemoryProperties,
    pub extensions: Vec<String>,
}

impl PhysicalDeviceInfo {
    pub fn name(&self) -> String {
        // device_name is NUL-terminated by the driver
        let bytes: Vec<u8> = self
            .properties
            .device_name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn memory_types(&self) -> &[vk::MemoryType] {
        &self.memory.memory_types[..self.memory.memory_type_count as usize]
    }

    pub fn memory_heaps(&self) -> &[vk::MemoryHeap] {
        &self.memory.memory_heaps[..self.memory.memory_heap_count as usize]
    }
}

/// One merged queue family request
#[derive(Debug, Clone)]
pub struct QueueCreateDesc {
    pub family: u32,
    pub priorities: Vec<f32>,
}

/// Parameters for logical device creation
#[derive(Debug, Clone, Default)]
pub struct DeviceDesc {
    pub queues: Vec<QueueCreateDesc>,
    pub extensions: Vec<String>,
    pub features: vk::PhysicalDeviceFeatures,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub sharing_mode: vk::SharingMode,
}

impl BufferDesc {
    pub fn new(size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
}

impl ImageDesc {
    /// Single-mip 2D image
    pub fn new_2d(format: vk::Format, width: u32, height: u32, usage: vk::ImageUsageFlags) -> Self {
        Self {
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferViewDesc {
    pub format: vk::Format,
    pub offset: vk::DeviceSize,
    pub range: vk::DeviceSize,
}

#[derive(Debug, Clone, Copy)]
pub struct ImageViewDesc {
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub subresource_range: vk::ImageSubresourceRange,
}

impl ImageViewDesc {
    /// Whole-image 2D view
    pub fn new_2d(format: vk::Format, aspect_mask: vk::ImageAspectFlags) -> Self {
        Self {
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    pub extent: vk::Extent2D,
    pub preferred_format: vk::Format,
    pub present_mode: vk::PresentModeKHR,
    pub min_image_count: u32,
    pub usage: vk::ImageUsageFlags,
}

impl Default for SwapchainDesc {
    fn default() -> Self {
        Self {
            extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            preferred_format: vk::Format::B8G8R8A8_SRGB,
            present_mode: vk::PresentModeKHR::FIFO,
            min_image_count: 3,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
        }
    }
}

/// What the backend actually built for a swapchain request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainInfo {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub image_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    Compute,
    /// Dynamic rendering into a single color attachment
    Graphics { color_format: vk::Format },
}

/// One shader stage handed to pipeline creation
pub struct StageDesc<'a, M> {
    pub module: &'a M,
    pub stage: vk::ShaderStageFlags,
    pub entry: &'a CStr,
}

/// The native graphics API as seen by the registry.
///
/// Every fallible call returns the raw `vk::Result`; translation into
/// `GpuError` happens in the registry. Destroy calls cannot fail.
pub trait Backend {
    type Instance;
    type PhysicalDevice: Copy;
    type Device;
    type Queue: Copy;
    type Surface;
    type Swapchain;
    type Memory;
    type Buffer: Copy;
    type Image: Copy;
    type BufferView;
    type ImageView;
    type ShaderModule;
    type Pipeline;
    type CommandPool;
    type CommandBuffer: Copy;
    type Submission;

    // Capability queries

    fn instance_extensions(&self) -> VkResult<Vec<String>>;
    fn instance_layers(&self) -> VkResult<Vec<String>>;

    // Instance / device

    fn create_instance(&mut self, desc: &InstanceDesc) -> VkResult<Self::Instance>;
    fn destroy_instance(&mut self, instance: Self::Instance);
    fn physical_devices(
        &mut self,
        instance: &Self::Instance,
    ) -> VkResult<Vec<(Self::PhysicalDevice, PhysicalDeviceInfo)>>;
    fn create_device(
        &mut self,
        instance: &Self::Instance,
        physical_device: Self::PhysicalDevice,
        desc: &DeviceDesc,
    ) -> VkResult<Self::Device>;
    fn get_queue(&mut self, device: &Self::Device, family: u32, index: u32) -> Self::Queue;
    fn device_wait_idle(&mut self, device: &Self::Device) -> VkResult<()>;
    fn destroy_device(&mut self, device: Self::Device);

    // Presentation

    fn create_swapchain(
        &mut self,
        device: &Self::Device,
        surface: &Self::Surface,
        desc: &SwapchainDesc,
        old: Option<&Self::Swapchain>,
    ) -> VkResult<(Self::Swapchain, SwapchainInfo)>;
    fn destroy_swapchain(&mut self, device: &Self::Device, swapchain: Self::Swapchain);
    fn destroy_surface(&mut self, instance: &Self::Instance, surface: Self::Surface);

    // Memory and resources

    fn create_buffer(
        &mut self,
        device: &Self::Device,
        desc: &BufferDesc,
    ) -> VkResult<(Self::Buffer, vk::MemoryRequirements)>;
    fn create_image(
        &mut self,
        device: &Self::Device,
        desc: &ImageDesc,
    ) -> VkResult<(Self::Image, vk::MemoryRequirements)>;
    fn allocate_memory(
        &mut self,
        device: &Self::Device,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> VkResult<Self::Memory>;
    fn free_memory(&mut self, device: &Self::Device, memory: Self::Memory);
    fn bind_buffer_memory(
        &mut self,
        device: &Self::Device,
        buffer: Self::Buffer,
        memory: &Self::Memory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;
    fn bind_image_memory(
        &mut self,
        device: &Self::Device,
        image: Self::Image,
        memory: &Self::Memory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;
    fn write_memory(
        &mut self,
        device: &Self::Device,
        memory: &Self::Memory,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> VkResult<()>;
    fn read_memory(
        &mut self,
        device: &Self::Device,
        memory: &Self::Memory,
        offset: vk::DeviceSize,
        out: &mut [u8],
    ) -> VkResult<()>;
    fn create_buffer_view(
        &mut self,
        device: &Self::Device,
        buffer: Self::Buffer,
        desc: &BufferViewDesc,
    ) -> VkResult<Self::BufferView>;
    fn create_image_view(
        &mut self,
        device: &Self::Device,
        image: Self::Image,
        desc: &ImageViewDesc,
    ) -> VkResult<Self::ImageView>;
    fn destroy_buffer_view(&mut self, device: &Self::Device, view: Self::BufferView);
    fn destroy_image_view(&mut self, device: &Self::Device, view: Self::ImageView);
    fn destroy_buffer(&mut self, device: &Self::Device, buffer: Self::Buffer);
    fn destroy_image(&mut self, device: &Self::Device, image: Self::Image);

    // Shaders and pipelines

    fn create_shader_module(
        &mut self,
        device: &Self::Device,
        code: &[u32],
    ) -> VkResult<Self::ShaderModule>;
    fn destroy_shader_module(&mut self, device: &Self::Device, module: Self::ShaderModule);
    fn create_pipeline(
        &mut self,
        device: &Self::Device,
        kind: PipelineKind,
        stages: &[StageDesc<'_, Self::ShaderModule>],
    ) -> VkResult<Self::Pipeline>;
    fn destroy_pipeline(&mut self, device: &Self::Device, pipeline: Self::Pipeline);

    // Commands

    fn create_command_pool(
        &mut self,
        device: &Self::Device,
        family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<Self::CommandPool>;
    fn allocate_command_buffers(
        &mut self,
        device: &Self::Device,
        pool: &Self::CommandPool,
        count: u32,
    ) -> VkResult<Vec<Self::CommandBuffer>>;
    fn reset_command_pool(&mut self, device: &Self::Device, pool: &Self::CommandPool)
        -> VkResult<()>;
    fn destroy_command_pool(&mut self, device: &Self::Device, pool: Self::CommandPool);
    fn begin_command_buffer(
        &mut self,
        device: &Self::Device,
        command_buffer: Self::CommandBuffer,
    ) -> VkResult<()>;
    fn end_command_buffer(
        &mut self,
        device: &Self::Device,
        command_buffer: Self::CommandBuffer,
    ) -> VkResult<()>;
    fn cmd_fill_buffer(
        &mut self,
        device: &Self::Device,
        command_buffer: Self::CommandBuffer,
        buffer: Self::Buffer,
        value: u32,
    );
    fn cmd_copy_buffer(
        &mut self,
        device: &Self::Device,
        command_buffer: Self::CommandBuffer,
        src: Self::Buffer,
        dst: Self::Buffer,
        size: vk::DeviceSize,
    );
    fn cmd_dispatch(
        &mut self,
        device: &Self::Device,
        command_buffer: Self::CommandBuffer,
        pipeline: &Self::Pipeline,
        groups: [u32; 3],
    );

    // Submission

    /// Hand recorded work to the device timeline; must not block
    fn submit(
        &mut self,
        device: &Self::Device,
        queue: Self::Queue,
        command_buffers: &[Self::CommandBuffer],
    ) -> VkResult<Self::Submission>;
    /// Wait for a submission. `Ok(false)` means the timeout elapsed.
    fn wait(
        &mut self,
        device: &Self::Device,
        submission: &Self::Submission,
        timeout: Duration,
    ) -> VkResult<bool>;
    /// Release the synchronization object of a completed submission
    fn retire_submission(&mut self, device: &Self::Device, submission: Self::Submission);
}
