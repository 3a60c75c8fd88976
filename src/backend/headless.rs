// Headless backend - deterministic software stand-in for a Vulkan driver
//
// Responsibilities:
// - Report configurable capabilities (extensions, layers, devices, heaps)
// - Track every object it hands out so tests can assert "no leaks"
// - Execute the small command set (fill/copy) against host-side memory
// - Inject failures: one-shot `vk::Result`s, stalled waits, device loss

use super::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Calls that can be made to fail once with `HeadlessBackend::fail_next`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateInstance,
    CreateDevice,
    CreateSwapchain,
    CreateBuffer,
    CreateImage,
    AllocateMemory,
    BindMemory,
    CreateBufferView,
    CreateImageView,
    CreateShaderModule,
    CreatePipeline,
    CreateCommandPool,
    Submit,
}

/// Object kinds counted by the leak tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Instance,
    Device,
    Surface,
    Swapchain,
    Memory,
    Buffer,
    Image,
    BufferView,
    ImageView,
    ShaderModule,
    Pipeline,
    CommandPool,
    Submission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeadlessObject(pub u64);

#[derive(Debug)]
pub struct HeadlessInstance {
    pub id: HeadlessObject,
    pub extensions: Vec<String>,
    surfaces: Arc<SurfaceTracker>,
}

impl HeadlessInstance {
    /// Stand-in for a platform surface call (what a window provider does)
    pub fn create_surface(&self, window_index: u16) -> HeadlessSurface {
        self.surfaces.live.fetch_add(1, Ordering::Relaxed);
        let id = self.surfaces.next.fetch_add(1, Ordering::Relaxed);
        HeadlessSurface {
            id: HeadlessObject(SURFACE_ID_BASE + id),
            window_index,
        }
    }
}

/// Surfaces are created through the instance, outside `&mut HeadlessBackend`
#[derive(Debug, Default)]
struct SurfaceTracker {
    live: AtomicUsize,
    next: AtomicU64,
}

const SURFACE_ID_BASE: u64 = 1 << 48;

#[derive(Debug)]
pub struct HeadlessDevice {
    pub id: HeadlessObject,
    pub physical_device: u32,
}

#[derive(Debug)]
pub struct HeadlessSurface {
    pub id: HeadlessObject,
    pub window_index: u16,
}

#[derive(Debug)]
pub struct HeadlessSwapchain {
    pub id: HeadlessObject,
    pub info: SwapchainInfo,
}

#[derive(Debug)]
pub struct HeadlessMemory {
    pub id: HeadlessObject,
    pub size: vk::DeviceSize,
    pub memory_type_index: u32,
}

#[derive(Debug)]
pub struct HeadlessPipeline {
    pub id: HeadlessObject,
    pub kind: PipelineKind,
}

#[derive(Debug)]
pub struct HeadlessSubmission {
    pub id: HeadlessObject,
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Fill { buffer: u64, value: u32 },
    Copy { src: u64, dst: u64, size: vk::DeviceSize },
    Dispatch { groups: [u32; 3] },
}

#[derive(Debug)]
struct BufferState {
    size: vk::DeviceSize,
    binding: Option<(u64, vk::DeviceSize)>,
}

/// Capabilities the headless "driver" reports
#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    pub instance_extensions: Vec<String>,
    pub layers: Vec<String>,
    pub devices: Vec<PhysicalDeviceInfo>,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            instance_extensions: vec![
                "VK_KHR_surface".to_string(),
                "VK_KHR_xlib_surface".to_string(),
                "VK_KHR_wayland_surface".to_string(),
                "VK_KHR_win32_surface".to_string(),
                "VK_EXT_debug_utils".to_string(),
            ],
            layers: vec!["VK_LAYER_KHRONOS_validation".to_string()],
            devices: vec![HeadlessConfig::discrete_gpu()],
        }
    }
}

impl HeadlessConfig {
    /// A discrete GPU with one universal and one transfer queue family.
    ///
    /// Memory types:
    /// 0: DEVICE_LOCAL (heap 0, 4 GiB)
    /// 1: HOST_VISIBLE | HOST_COHERENT (heap 1, 1 GiB)
    /// 2: DEVICE_LOCAL | HOST_VISIBLE | HOST_COHERENT (heap 2, 256 MiB)
    pub fn discrete_gpu() -> PhysicalDeviceInfo {
        let mut properties = vk::PhysicalDeviceProperties {
            api_version: vk::API_VERSION_1_3,
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            ..Default::default()
        };
        for (dst, src) in properties.device_name.iter_mut().zip(b"Headless GPU".iter()) {
            *dst = *src as std::os::raw::c_char;
        }

        let features = vk::PhysicalDeviceFeatures {
            fill_mode_non_solid: vk::TRUE,
            wide_lines: vk::TRUE,
            sampler_anisotropy: vk::TRUE,
            shader_int64: vk::TRUE,
            ..Default::default()
        };

        let queue_families = vec![
            vk::QueueFamilyProperties {
                queue_flags: vk::QueueFlags::GRAPHICS
                    | vk::QueueFlags::COMPUTE
                    | vk::QueueFlags::TRANSFER,
                queue_count: 2,
                ..Default::default()
            },
            vk::QueueFamilyProperties {
                queue_flags: vk::QueueFlags::TRANSFER,
                queue_count: 1,
                ..Default::default()
            },
        ];

        let mut memory = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            memory_heap_count: 3,
            ..Default::default()
        };
        memory.memory_heaps[0] = vk::MemoryHeap {
            size: 4 << 30,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        memory.memory_heaps[1] = vk::MemoryHeap {
            size: 1 << 30,
            flags: vk::MemoryHeapFlags::empty(),
        };
        memory.memory_heaps[2] = vk::MemoryHeap {
            size: 256 << 20,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        memory.memory_types[0] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };
        memory.memory_types[1] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 1,
        };
        memory.memory_types[2] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL
                | vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 2,
        };

        PhysicalDeviceInfo {
            properties,
            features,
            queue_families,
            memory,
            extensions: vec!["VK_KHR_swapchain".to_string()],
        }
    }
}

const SPIRV_MAGIC: u32 = 0x0723_0203;
const BUFFER_ALIGNMENT: vk::DeviceSize = 256;
const IMAGE_ALIGNMENT: vk::DeviceSize = 4096;

pub struct HeadlessBackend {
    config: HeadlessConfig,
    next_id: u64,
    live: HashMap<ObjectKind, usize>,
    failures: HashMap<FailPoint, vk::Result>,
    heap_usage: HashMap<(u32, u32), vk::DeviceSize>,
    memory_contents: HashMap<u64, Vec<u8>>,
    buffers: HashMap<u64, BufferState>,
    command_buffers: HashMap<u64, Vec<Op>>,
    surfaces: Arc<SurfaceTracker>,
    stalled_waits: u32,
    device_lost: bool,
    pipelines_built: usize,
    dispatches: usize,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new(HeadlessConfig::default())
    }
}

impl HeadlessBackend {
    pub fn new(config: HeadlessConfig) -> Self {
        Self {
            config,
            next_id: 1,
            live: HashMap::new(),
            failures: HashMap::new(),
            heap_usage: HashMap::new(),
            memory_contents: HashMap::new(),
            buffers: HashMap::new(),
            command_buffers: HashMap::new(),
            surfaces: Arc::default(),
            stalled_waits: 0,
            device_lost: false,
            pipelines_built: 0,
            dispatches: 0,
        }
    }

    /// Make the next call at `point` fail with `result`
    pub fn fail_next(&mut self, point: FailPoint, result: vk::Result) {
        self.failures.insert(point, result);
    }

    /// The next `count` waits report a timeout
    pub fn stall_waits(&mut self, count: u32) {
        self.stalled_waits = count;
    }

    /// Every submit/wait reports `ERROR_DEVICE_LOST` until a device is destroyed
    pub fn lose_device(&mut self) {
        self.device_lost = true;
    }

    pub fn live(&self, kind: ObjectKind) -> usize {
        match kind {
            ObjectKind::Surface => self.surfaces.live.load(Ordering::Relaxed),
            _ => self.live.get(&kind).copied().unwrap_or(0),
        }
    }

    pub fn live_total(&self) -> usize {
        self.live.values().sum::<usize>() + self.live(ObjectKind::Surface)
    }

    /// Number of native pipelines created so far (including rebuilds)
    pub fn pipelines_built(&self) -> usize {
        self.pipelines_built
    }

    /// Number of compute dispatches executed by submissions
    pub fn dispatches(&self) -> usize {
        self.dispatches
    }

    fn check(&mut self, point: FailPoint) -> VkResult<()> {
        match self.failures.remove(&point) {
            Some(result) => Err(result),
            None => Ok(()),
        }
    }

    fn object(&mut self, kind: ObjectKind) -> HeadlessObject {
        let id = self.next_id;
        self.next_id += 1;
        *self.live.entry(kind).or_insert(0) += 1;
        HeadlessObject(id)
    }

    fn forget(&mut self, kind: ObjectKind) {
        let count = self.live.entry(kind).or_insert(0);
        debug_assert!(*count > 0, "double destroy of {:?}", kind);
        *count = count.saturating_sub(1);
    }

    fn device_info(&self, device: &HeadlessDevice) -> &PhysicalDeviceInfo {
        &self.config.devices[device.physical_device as usize]
    }

    fn execute(&mut self, ops: &[Op]) {
        for op in ops {
            match *op {
                Op::Fill { buffer, value } => {
                    if let Some((memory, offset, size)) = self.buffer_range(buffer) {
                        if let Some(bytes) = self.memory_contents.get_mut(&memory) {
                            let range = &mut bytes[offset as usize..(offset + size) as usize];
                            for chunk in range.chunks_mut(4) {
                                let word = value.to_le_bytes();
                                chunk.copy_from_slice(&word[..chunk.len()]);
                            }
                        }
                    }
                }
                Op::Copy { src, dst, size } => {
                    let (Some(src), Some(dst)) = (self.buffer_range(src), self.buffer_range(dst))
                    else {
                        continue;
                    };
                    let size = size.min(src.2).min(dst.2) as usize;
                    let data = match self.memory_contents.get(&src.0) {
                        Some(bytes) => bytes[src.1 as usize..src.1 as usize + size].to_vec(),
                        None => continue,
                    };
                    if let Some(bytes) = self.memory_contents.get_mut(&dst.0) {
                        bytes[dst.1 as usize..dst.1 as usize + size].copy_from_slice(&data);
                    }
                }
                Op::Dispatch { groups } => {
                    if groups.iter().all(|&g| g > 0) {
                        self.dispatches += 1;
                    }
                }
            }
        }
    }

    fn buffer_range(&self, buffer: u64) -> Option<(u64, vk::DeviceSize, vk::DeviceSize)> {
        let state = self.buffers.get(&buffer)?;
        let (memory, offset) = state.binding?;
        Some((memory, offset, state.size))
    }

    fn record(&mut self, command_buffer: HeadlessObject, op: Op) {
        if let Some(ops) = self.command_buffers.get_mut(&command_buffer.0) {
            ops.push(op);
        }
    }
}

impl Backend for HeadlessBackend {
    type Instance = HeadlessInstance;
    type PhysicalDevice = u32;
    type Device = HeadlessDevice;
    type Queue = (u32, u32);
    type Surface = HeadlessSurface;
    type Swapchain = HeadlessSwapchain;
    type Memory = HeadlessMemory;
    type Buffer = HeadlessObject;
    type Image = HeadlessObject;
    type BufferView = HeadlessObject;
    type ImageView = HeadlessObject;
    type ShaderModule = HeadlessObject;
    type Pipeline = HeadlessPipeline;
    type CommandPool = HeadlessObject;
    type CommandBuffer = HeadlessObject;
    type Submission = HeadlessSubmission;

    fn instance_extensions(&self) -> VkResult<Vec<String>> {
        Ok(self.config.instance_extensions.clone())
    }

    fn instance_layers(&self) -> VkResult<Vec<String>> {
        Ok(self.config.layers.clone())
    }

    fn create_instance(&mut self, desc: &InstanceDesc) -> VkResult<Self::Instance> {
        self.check(FailPoint::CreateInstance)?;
        if desc
            .extensions
            .iter()
            .any(|ext| !self.config.instance_extensions.contains(ext))
        {
            return Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT);
        }
        if desc.layers.iter().any(|layer| !self.config.layers.contains(layer)) {
            return Err(vk::Result::ERROR_LAYER_NOT_PRESENT);
        }
        Ok(HeadlessInstance {
            id: self.object(ObjectKind::Instance),
            extensions: desc.extensions.clone(),
            surfaces: Arc::clone(&self.surfaces),
        })
    }

    fn destroy_instance(&mut self, _instance: Self::Instance) {
        self.forget(ObjectKind::Instance);
    }

    fn physical_devices(
        &mut self,
        _instance: &Self::Instance,
    ) -> VkResult<Vec<(Self::PhysicalDevice, PhysicalDeviceInfo)>> {
        Ok(self
            .config
            .devices
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, info)| (index as u32, info))
            .collect())
    }

    fn create_device(
        &mut self,
        _instance: &Self::Instance,
        physical_device: Self::PhysicalDevice,
        desc: &DeviceDesc,
    ) -> VkResult<Self::Device> {
        self.check(FailPoint::CreateDevice)?;
        let info = self
            .config
            .devices
            .get(physical_device as usize)
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;
        for queue in &desc.queues {
            let family = info
                .queue_families
                .get(queue.family as usize)
                .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;
            if queue.priorities.len() as u32 > family.queue_count {
                return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
            }
        }
        if desc.extensions.iter().any(|ext| !info.extensions.contains(ext)) {
            return Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT);
        }
        Ok(HeadlessDevice {
            id: self.object(ObjectKind::Device),
            physical_device,
        })
    }

    fn get_queue(&mut self, _device: &Self::Device, family: u32, index: u32) -> Self::Queue {
        (family, index)
    }

    fn device_wait_idle(&mut self, _device: &Self::Device) -> VkResult<()> {
        if self.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        Ok(())
    }

    fn destroy_device(&mut self, _device: Self::Device) {
        self.device_lost = false;
        self.forget(ObjectKind::Device);
    }

    fn create_swapchain(
        &mut self,
        _device: &Self::Device,
        _surface: &Self::Surface,
        desc: &SwapchainDesc,
        _old: Option<&Self::Swapchain>,
    ) -> VkResult<(Self::Swapchain, SwapchainInfo)> {
        self.check(FailPoint::CreateSwapchain)?;
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let info = SwapchainInfo {
            format: desc.preferred_format,
            extent: desc.extent,
            image_count: desc.min_image_count.max(2),
        };
        let swapchain = HeadlessSwapchain {
            id: self.object(ObjectKind::Swapchain),
            info,
        };
        Ok((swapchain, info))
    }

    fn destroy_swapchain(&mut self, _device: &Self::Device, _swapchain: Self::Swapchain) {
        self.forget(ObjectKind::Swapchain);
    }

    fn destroy_surface(&mut self, _instance: &Self::Instance, _surface: Self::Surface) {
        let previous = self.surfaces.live.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "double destroy of surface");
    }

    fn create_buffer(
        &mut self,
        _device: &Self::Device,
        desc: &BufferDesc,
    ) -> VkResult<(Self::Buffer, vk::MemoryRequirements)> {
        self.check(FailPoint::CreateBuffer)?;
        if desc.size == 0 {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let buffer = self.object(ObjectKind::Buffer);
        self.buffers.insert(
            buffer.0,
            BufferState {
                size: desc.size,
                binding: None,
            },
        );
        let requirements = vk::MemoryRequirements {
            size: desc.size.div_ceil(BUFFER_ALIGNMENT) * BUFFER_ALIGNMENT,
            alignment: BUFFER_ALIGNMENT,
            memory_type_bits: 0b111,
        };
        Ok((buffer, requirements))
    }

    fn create_image(
        &mut self,
        _device: &Self::Device,
        desc: &ImageDesc,
    ) -> VkResult<(Self::Image, vk::MemoryRequirements)> {
        self.check(FailPoint::CreateImage)?;
        let texels = desc.extent.width as vk::DeviceSize
            * desc.extent.height as vk::DeviceSize
            * desc.extent.depth as vk::DeviceSize
            * desc.array_layers as vk::DeviceSize;
        if texels == 0 {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let image = self.object(ObjectKind::Image);
        // Optimal-tiling images only live in device-local types
        let requirements = vk::MemoryRequirements {
            size: (texels * 4).div_ceil(IMAGE_ALIGNMENT) * IMAGE_ALIGNMENT,
            alignment: IMAGE_ALIGNMENT,
            memory_type_bits: 0b101,
        };
        Ok((image, requirements))
    }

    fn allocate_memory(
        &mut self,
        device: &Self::Device,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> VkResult<Self::Memory> {
        self.check(FailPoint::AllocateMemory)?;
        let info = self.device_info(device);
        let memory_type = info
            .memory_types()
            .get(memory_type_index as usize)
            .copied()
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;
        let heap_size = info.memory_heaps()[memory_type.heap_index as usize].size;

        let key = (device.physical_device, memory_type.heap_index);
        let used = self.heap_usage.get(&key).copied().unwrap_or(0);
        if used + size > heap_size {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        self.heap_usage.insert(key, used + size);

        let id = self.object(ObjectKind::Memory);
        self.memory_contents.insert(id.0, vec![0; size as usize]);
        Ok(HeadlessMemory {
            id,
            size,
            memory_type_index,
        })
    }

    fn free_memory(&mut self, device: &Self::Device, memory: Self::Memory) {
        let heap = self.device_info(device).memory_types()[memory.memory_type_index as usize]
            .heap_index;
        if let Some(used) = self.heap_usage.get_mut(&(device.physical_device, heap)) {
            *used = used.saturating_sub(memory.size);
        }
        self.memory_contents.remove(&memory.id.0);
        self.forget(ObjectKind::Memory);
    }

    fn bind_buffer_memory(
        &mut self,
        _device: &Self::Device,
        buffer: Self::Buffer,
        memory: &Self::Memory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        self.check(FailPoint::BindMemory)?;
        let state = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;
        if offset + state.size > memory.size {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        state.binding = Some((memory.id.0, offset));
        Ok(())
    }

    fn bind_image_memory(
        &mut self,
        _device: &Self::Device,
        _image: Self::Image,
        _memory: &Self::Memory,
        _offset: vk::DeviceSize,
    ) -> VkResult<()> {
        self.check(FailPoint::BindMemory)
    }

    fn write_memory(
        &mut self,
        _device: &Self::Device,
        memory: &Self::Memory,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> VkResult<()> {
        let bytes = self
            .memory_contents
            .get_mut(&memory.id.0)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let start = offset as usize;
        let end = start + data.len();
        if end > bytes.len() {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_memory(
        &mut self,
        _device: &Self::Device,
        memory: &Self::Memory,
        offset: vk::DeviceSize,
        out: &mut [u8],
    ) -> VkResult<()> {
        let bytes = self
            .memory_contents
            .get(&memory.id.0)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let start = offset as usize;
        let end = start + out.len();
        if end > bytes.len() {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        out.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn create_buffer_view(
        &mut self,
        _device: &Self::Device,
        _buffer: Self::Buffer,
        desc: &BufferViewDesc,
    ) -> VkResult<Self::BufferView> {
        self.check(FailPoint::CreateBufferView)?;
        if desc.format == vk::Format::UNDEFINED {
            return Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED);
        }
        Ok(self.object(ObjectKind::BufferView))
    }

    fn create_image_view(
        &mut self,
        _device: &Self::Device,
        _image: Self::Image,
        desc: &ImageViewDesc,
    ) -> VkResult<Self::ImageView> {
        self.check(FailPoint::CreateImageView)?;
        if desc.format == vk::Format::UNDEFINED {
            return Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED);
        }
        Ok(self.object(ObjectKind::ImageView))
    }

    fn destroy_buffer_view(&mut self, _device: &Self::Device, _view: Self::BufferView) {
        self.forget(ObjectKind::BufferView);
    }

    fn destroy_image_view(&mut self, _device: &Self::Device, _view: Self::ImageView) {
        self.forget(ObjectKind::ImageView);
    }

    fn destroy_buffer(&mut self, _device: &Self::Device, buffer: Self::Buffer) {
        self.buffers.remove(&buffer.0);
        self.forget(ObjectKind::Buffer);
    }

    fn destroy_image(&mut self, _device: &Self::Device, _image: Self::Image) {
        self.forget(ObjectKind::Image);
    }

    fn create_shader_module(
        &mut self,
        _device: &Self::Device,
        code: &[u32],
    ) -> VkResult<Self::ShaderModule> {
        self.check(FailPoint::CreateShaderModule)?;
        if code.first() != Some(&SPIRV_MAGIC) {
            return Err(vk::Result::ERROR_INVALID_SHADER_NV);
        }
        Ok(self.object(ObjectKind::ShaderModule))
    }

    fn destroy_shader_module(&mut self, _device: &Self::Device, _module: Self::ShaderModule) {
        self.forget(ObjectKind::ShaderModule);
    }

    fn create_pipeline(
        &mut self,
        _device: &Self::Device,
        kind: PipelineKind,
        stages: &[StageDesc<'_, Self::ShaderModule>],
    ) -> VkResult<Self::Pipeline> {
        self.check(FailPoint::CreatePipeline)?;
        let valid = match kind {
            PipelineKind::Compute => {
                stages.len() == 1 && stages[0].stage == vk::ShaderStageFlags::COMPUTE
            }
            PipelineKind::Graphics { .. } => stages
                .iter()
                .any(|stage| stage.stage == vk::ShaderStageFlags::VERTEX),
        };
        if !valid {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        self.pipelines_built += 1;
        Ok(HeadlessPipeline {
            id: self.object(ObjectKind::Pipeline),
            kind,
        })
    }

    fn destroy_pipeline(&mut self, _device: &Self::Device, _pipeline: Self::Pipeline) {
        self.forget(ObjectKind::Pipeline);
    }

    fn create_command_pool(
        &mut self,
        _device: &Self::Device,
        _family: u32,
        _flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<Self::CommandPool> {
        self.check(FailPoint::CreateCommandPool)?;
        Ok(self.object(ObjectKind::CommandPool))
    }

    fn allocate_command_buffers(
        &mut self,
        _device: &Self::Device,
        _pool: &Self::CommandPool,
        count: u32,
    ) -> VkResult<Vec<Self::CommandBuffer>> {
        // Command buffers die with their pool and are not leak-tracked
        Ok((0..count)
            .map(|_| {
                let id = HeadlessObject(self.next_id);
                self.next_id += 1;
                self.command_buffers.insert(id.0, Vec::new());
                id
            })
            .collect())
    }

    fn reset_command_pool(
        &mut self,
        _device: &Self::Device,
        _pool: &Self::CommandPool,
    ) -> VkResult<()> {
        Ok(())
    }

    fn destroy_command_pool(&mut self, _device: &Self::Device, _pool: Self::CommandPool) {
        self.forget(ObjectKind::CommandPool);
    }

    fn begin_command_buffer(
        &mut self,
        _device: &Self::Device,
        command_buffer: Self::CommandBuffer,
    ) -> VkResult<()> {
        let ops = self
            .command_buffers
            .get_mut(&command_buffer.0)
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;
        ops.clear();
        Ok(())
    }

    fn end_command_buffer(
        &mut self,
        _device: &Self::Device,
        _command_buffer: Self::CommandBuffer,
    ) -> VkResult<()> {
        Ok(())
    }

    fn cmd_fill_buffer(
        &mut self,
        _device: &Self::Device,
        command_buffer: Self::CommandBuffer,
        buffer: Self::Buffer,
        value: u32,
    ) {
        self.record(command_buffer, Op::Fill {
            buffer: buffer.0,
            value,
        });
    }

    fn cmd_copy_buffer(
        &mut self,
        _device: &Self::Device,
        command_buffer: Self::CommandBuffer,
        src: Self::Buffer,
        dst: Self::Buffer,
        size: vk::DeviceSize,
    ) {
        self.record(command_buffer, Op::Copy {
            src: src.0,
            dst: dst.0,
            size,
        });
    }

    fn cmd_dispatch(
        &mut self,
        _device: &Self::Device,
        command_buffer: Self::CommandBuffer,
        _pipeline: &Self::Pipeline,
        groups: [u32; 3],
    ) {
        self.record(command_buffer, Op::Dispatch { groups });
    }

    fn submit(
        &mut self,
        _device: &Self::Device,
        _queue: Self::Queue,
        command_buffers: &[Self::CommandBuffer],
    ) -> VkResult<Self::Submission> {
        self.check(FailPoint::Submit)?;
        if self.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        // The "GPU" runs the work at submission time; waits only model latency
        let ops: Vec<Op> = command_buffers
            .iter()
            .filter_map(|cb| self.command_buffers.get(&cb.0))
            .flatten()
            .copied()
            .collect();
        self.execute(&ops);
        Ok(HeadlessSubmission {
            id: self.object(ObjectKind::Submission),
        })
    }

    fn wait(
        &mut self,
        _device: &Self::Device,
        _submission: &Self::Submission,
        _timeout: Duration,
    ) -> VkResult<bool> {
        if self.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        if self.stalled_waits > 0 {
            self.stalled_waits -= 1;
            return Ok(false);
        }
        Ok(true)
    }

    fn retire_submission(&mut self, _device: &Self::Device, _submission: Self::Submission) {
        self.forget(ObjectKind::Submission);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discrete_gpu_reports_name_and_memory() {
        let info = HeadlessConfig::discrete_gpu();
        assert_eq!(info.name(), "Headless GPU");
        assert_eq!(info.memory_types().len(), 3);
        assert_eq!(info.memory_heaps().len(), 3);
    }

    #[test]
    fn heap_budget_is_enforced() {
        let mut backend = HeadlessBackend::default();
        let instance = backend.create_instance(&InstanceDesc::default()).unwrap();
        let device = backend
            .create_device(&instance, 0, &DeviceDesc::default())
            .unwrap();

        let small = backend.allocate_memory(&device, 200 << 20, 2).unwrap();
        assert_eq!(
            backend.allocate_memory(&device, 100 << 20, 2).unwrap_err(),
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
        );
        backend.free_memory(&device, small);
        assert!(backend.allocate_memory(&device, 100 << 20, 2).is_ok());
    }

    #[test]
    fn injected_failures_fire_once() {
        let mut backend = HeadlessBackend::default();
        backend.fail_next(FailPoint::CreateInstance, vk::Result::ERROR_INITIALIZATION_FAILED);
        assert!(backend.create_instance(&InstanceDesc::default()).is_err());
        assert!(backend.create_instance(&InstanceDesc::default()).is_ok());
        assert_eq!(backend.live(ObjectKind::Instance), 1);
    }

    #[test]
    fn surfaces_are_tracked_through_the_instance() {
        let mut backend = HeadlessBackend::default();
        let instance = backend.create_instance(&InstanceDesc::default()).unwrap();
        let surface = instance.create_surface(3);
        assert_eq!(surface.window_index, 3);
        assert_eq!(backend.live(ObjectKind::Surface), 1);

        backend.destroy_surface(&instance, surface);
        assert_eq!(backend.live(ObjectKind::Surface), 0);
    }

    #[test]
    fn fill_executes_at_submit() {
        let mut backend = HeadlessBackend::default();
        let instance = backend.create_instance(&InstanceDesc::default()).unwrap();
        let device = backend
            .create_device(&instance, 0, &DeviceDesc::default())
            .unwrap();
        let (buffer, requirements) = backend
            .create_buffer(&device, &BufferDesc::new(16, vk::BufferUsageFlags::TRANSFER_DST))
            .unwrap();
        let memory = backend
            .allocate_memory(&device, requirements.size, 1)
            .unwrap();
        backend.bind_buffer_memory(&device, buffer, &memory, 0).unwrap();

        let pool = backend
            .create_command_pool(&device, 0, vk::CommandPoolCreateFlags::empty())
            .unwrap();
        let cb = backend.allocate_command_buffers(&device, &pool, 1).unwrap()[0];
        backend.begin_command_buffer(&device, cb).unwrap();
        backend.cmd_fill_buffer(&device, cb, buffer, 0xAABB_CCDD);
        backend.end_command_buffer(&device, cb).unwrap();
        let submission = backend.submit(&device, (0, 0), &[cb]).unwrap();
        assert!(backend.wait(&device, &submission, Duration::ZERO).unwrap());

        let mut out = [0u8; 8];
        backend.read_memory(&device, &memory, 0, &mut out).unwrap();
        assert_eq!(&out[..4], &0xAABB_CCDDu32.to_le_bytes());
    }
}
