// Memory - allocations, buffers, images and their views
//
// Buffer and image creation is two-phase:
// 1. create the native resource and read its memory requirements
// 2. bind it, either into a caller-supplied allocation or into a fresh
//    one sized for it, then create the declared views
//
// A failure anywhere rolls back everything created by the call. Fresh
// allocations belong to their resource and are freed with it; explicit
// allocations from `allocate_memory` are freed by the caller.

use super::Registry;
use crate::backend::{
    Backend, BufferDesc, BufferViewDesc, ImageDesc, ImageViewDesc, PhysicalDeviceInfo,
};
use crate::error::{GpuError, Result};
use crate::handle::*;
use ash::prelude::VkResult;
use ash::vk;

/// Composite reference from a resource to its backing memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBinding {
    pub device: DeviceHandle,
    /// `NULL` on input asks for a fresh allocation
    pub memory: MemoryHandle,
    pub memory_info: MemoryInfoHandle,
}

impl MemoryBinding {
    pub fn new(device: DeviceHandle) -> Self {
        Self {
            device,
            memory: MemoryHandle::NULL,
            memory_info: MemoryInfoHandle::NULL,
        }
    }

    /// Sub-allocate from an existing allocation
    pub fn in_memory(device: DeviceHandle, memory: MemoryHandle) -> Self {
        Self {
            memory,
            ..Self::new(device)
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferInfo {
    pub desc: BufferDesc,
    pub binding: MemoryBinding,
    pub memory_flags: vk::MemoryPropertyFlags,
    pub views: Vec<BufferViewDesc>,
}

impl BufferInfo {
    pub fn new(
        device: DeviceHandle,
        desc: BufferDesc,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> Self {
        Self {
            desc,
            binding: MemoryBinding::new(device),
            memory_flags,
            views: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub desc: ImageDesc,
    pub binding: MemoryBinding,
    pub memory_flags: vk::MemoryPropertyFlags,
    pub views: Vec<ImageViewDesc>,
}

impl ImageInfo {
    pub fn new(
        device: DeviceHandle,
        desc: ImageDesc,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> Self {
        Self {
            desc,
            binding: MemoryBinding::new(device),
            memory_flags,
            views: Vec::new(),
        }
    }
}

pub struct MemoryRecord<B: Backend> {
    pub device: DeviceHandle,
    pub native: B::Memory,
    pub size: vk::DeviceSize,
    pub memory_type_index: u32,
    pub flags: vk::MemoryPropertyFlags,
    /// Next free offset; rewinds to zero when the last resource unbinds
    pub cursor: vk::DeviceSize,
    /// Allocated for a single resource and freed with it
    pub dedicated: bool,
}

/// Requirements and placement of one binding
#[derive(Debug, Clone, Copy)]
pub struct MemoryInfoRecord {
    pub memory: MemoryHandle,
    pub requirements: vk::MemoryRequirements,
    pub offset: vk::DeviceSize,
}

pub struct BufferRecord<B: Backend> {
    pub native: B::Buffer,
    pub desc: BufferDesc,
    pub binding: MemoryBinding,
    pub views: Vec<B::BufferView>,
}

pub struct ImageRecord<B: Backend> {
    pub native: B::Image,
    pub desc: ImageDesc,
    pub binding: MemoryBinding,
    pub views: Vec<B::ImageView>,
}

/// Pick a memory type allowed by `type_bits` that has every flag in `flags`.
///
/// Among candidates the one on the smallest heap wins, then the lowest
/// index, which keeps the big heaps free for big allocations.
pub fn select_memory_type(
    info: &PhysicalDeviceInfo,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let heaps = info.memory_heaps();
    info.memory_types()
        .iter()
        .enumerate()
        .filter(|(index, memory_type)| {
            type_bits & (1 << index) != 0 && memory_type.property_flags.contains(flags)
        })
        .min_by_key(|(index, memory_type)| {
            let heap_size = heaps
                .get(memory_type.heap_index as usize)
                .map_or(vk::DeviceSize::MAX, |heap| heap.size);
            (heap_size, *index)
        })
        .map(|(index, _)| index as u32)
}

fn align_up(offset: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    if alignment <= 1 {
        offset
    } else {
        offset.div_ceil(alignment) * alignment
    }
}

/// The backend calls that differ between buffers and images
trait Bindable<B: Backend> {
    type Desc;
    type Native: Copy;
    type View;
    type ViewDesc;

    fn create(
        backend: &mut B,
        device: &B::Device,
        desc: &Self::Desc,
    ) -> VkResult<(Self::Native, vk::MemoryRequirements)>;
    fn bind(
        backend: &mut B,
        device: &B::Device,
        native: Self::Native,
        memory: &B::Memory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;
    fn create_view(
        backend: &mut B,
        device: &B::Device,
        native: Self::Native,
        desc: &Self::ViewDesc,
    ) -> VkResult<Self::View>;
    fn destroy_view(backend: &mut B, device: &B::Device, view: Self::View);
    fn destroy(backend: &mut B, device: &B::Device, native: Self::Native);
}

struct BufferKind;
struct ImageKind;

impl<B: Backend> Bindable<B> for BufferKind {
    type Desc = BufferDesc;
    type Native = B::Buffer;
    type View = B::BufferView;
    type ViewDesc = BufferViewDesc;

    fn create(
        backend: &mut B,
        device: &B::Device,
        desc: &BufferDesc,
    ) -> VkResult<(B::Buffer, vk::MemoryRequirements)> {
        backend.create_buffer(device, desc)
    }

    fn bind(
        backend: &mut B,
        device: &B::Device,
        native: B::Buffer,
        memory: &B::Memory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        backend.bind_buffer_memory(device, native, memory, offset)
    }

    fn create_view(
        backend: &mut B,
        device: &B::Device,
        native: B::Buffer,
        desc: &BufferViewDesc,
    ) -> VkResult<B::BufferView> {
        backend.create_buffer_view(device, native, desc)
    }

    fn destroy_view(backend: &mut B, device: &B::Device, view: B::BufferView) {
        backend.destroy_buffer_view(device, view);
    }

    fn destroy(backend: &mut B, device: &B::Device, native: B::Buffer) {
        backend.destroy_buffer(device, native);
    }
}

impl<B: Backend> Bindable<B> for ImageKind {
    type Desc = ImageDesc;
    type Native = B::Image;
    type View = B::ImageView;
    type ViewDesc = ImageViewDesc;

    fn create(
        backend: &mut B,
        device: &B::Device,
        desc: &ImageDesc,
    ) -> VkResult<(B::Image, vk::MemoryRequirements)> {
        backend.create_image(device, desc)
    }

    fn bind(
        backend: &mut B,
        device: &B::Device,
        native: B::Image,
        memory: &B::Memory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        backend.bind_image_memory(device, native, memory, offset)
    }

    fn create_view(
        backend: &mut B,
        device: &B::Device,
        native: B::Image,
        desc: &ImageViewDesc,
    ) -> VkResult<B::ImageView> {
        backend.create_image_view(device, native, desc)
    }

    fn destroy_view(backend: &mut B, device: &B::Device, view: B::ImageView) {
        backend.destroy_image_view(device, view);
    }

    fn destroy(backend: &mut B, device: &B::Device, native: B::Image) {
        backend.destroy_image(device, native);
    }
}

/// Where a freshly bound resource lives
enum Placement<M> {
    Existing(MemoryHandle),
    Dedicated { native: M, memory_type_index: u32 },
}

/// Native side of a successful two-phase creation, not yet registered
struct Bound<M, N, V> {
    native: N,
    views: Vec<V>,
    requirements: vk::MemoryRequirements,
    offset: vk::DeviceSize,
    placement: Placement<M>,
}

impl<B: Backend> Registry<B> {
    /// Caller-owned allocation that resources can be placed into
    pub fn allocate_memory(
        &mut self,
        device: DeviceHandle,
        size: vk::DeviceSize,
        flags: vk::MemoryPropertyFlags,
        type_bits: u32,
    ) -> Result<MemoryHandle> {
        if size == 0 {
            return Err(GpuError::InvalidParameter("allocation size is zero".into()));
        }
        let record = self.devices.resolve(device)?;
        let info = &self.physical_devices.resolve(record.physical_device)?.info;
        let type_bits = if type_bits == 0 { u32::MAX } else { type_bits };
        let memory_type_index = select_memory_type(info, type_bits, flags)
            .ok_or(GpuError::NoCompatibleMemoryType { type_bits, flags })?;
        let type_flags = info.memory_types()[memory_type_index as usize].property_flags;
        self.memories.reserve(1)?;

        let native = self
            .backend
            .allocate_memory(&record.native, size, memory_type_index)
            .map_err(|e| self.frames.backend_err(e))?;

        let handle = self.memories.allocate(MemoryRecord {
            device,
            native,
            size,
            memory_type_index,
            flags: type_flags,
            cursor: 0,
            dedicated: false,
        })?;
        self.devices.retain(device)?;

        log::debug!(
            "Allocated {:?}: {} bytes, type {} ({:?})",
            handle,
            size,
            memory_type_index,
            type_flags
        );
        Ok(handle)
    }

    /// Free a caller-owned allocation once nothing is bound to it
    pub fn free_memory(&mut self, memory: MemoryHandle) -> Result<()> {
        let record = self.memories.resolve(memory)?;
        if record.dedicated {
            return Err(GpuError::InvalidParameter(format!(
                "{:?} belongs to a resource and is freed with it",
                memory
            )));
        }
        let record = self.memories.release(memory)?;
        self.free_native_memory(record)?;
        log::debug!("Freed {:?}", memory);
        Ok(())
    }

    fn free_native_memory(&mut self, record: MemoryRecord<B>) -> Result<()> {
        let device = &self.devices.resolve(record.device)?.native;
        self.backend.free_memory(device, record.native);
        self.devices.unretain(record.device)?;
        Ok(())
    }

    pub fn memory(&self, memory: MemoryHandle) -> Result<&MemoryRecord<B>> {
        self.memories.resolve(memory)
    }

    pub fn memory_info(&self, memory_info: MemoryInfoHandle) -> Result<&MemoryInfoRecord> {
        self.memory_infos.resolve(memory_info)
    }

    /// Everything that can be checked without touching the backend
    fn validate_binding(&self, binding: &MemoryBinding) -> Result<()> {
        self.devices.resolve(binding.device)?;
        if !binding.memory.is_null() {
            let memory = self.memories.resolve(binding.memory)?;
            if memory.device != binding.device {
                return Err(GpuError::InvalidParameter(format!(
                    "{:?} belongs to {:?}, not {:?}",
                    binding.memory, memory.device, binding.device
                )));
            }
            if memory.dedicated {
                return Err(GpuError::InvalidParameter(format!(
                    "{:?} is dedicated to another resource",
                    binding.memory
                )));
            }
        } else {
            self.memories.reserve(1)?;
        }
        self.memory_infos.reserve(1)
    }

    fn create_bound<R: Bindable<B>>(
        &mut self,
        desc: &R::Desc,
        binding: &MemoryBinding,
        flags: vk::MemoryPropertyFlags,
        view_descs: &[R::ViewDesc],
    ) -> Result<Bound<B::Memory, R::Native, R::View>> {
        let device_record = self.devices.resolve(binding.device)?;
        let device = &device_record.native;
        let info = &self.physical_devices.resolve(device_record.physical_device)?.info;

        // Phase 1: requirements
        let (native, requirements) =
            R::create(&mut self.backend, device, desc).map_err(|e| self.frames.backend_err(e))?;

        // Phase 2: placement and bind
        let placement = if binding.memory.is_null() {
            let Some(memory_type_index) =
                select_memory_type(info, requirements.memory_type_bits, flags)
            else {
                R::destroy(&mut self.backend, device, native);
                return Err(GpuError::NoCompatibleMemoryType {
                    type_bits: requirements.memory_type_bits,
                    flags,
                });
            };
            match self
                .backend
                .allocate_memory(device, requirements.size, memory_type_index)
            {
                Ok(memory) => Placement::Dedicated {
                    native: memory,
                    memory_type_index,
                },
                Err(e) => {
                    R::destroy(&mut self.backend, device, native);
                    return Err(self.frames.backend_err(e));
                }
            }
        } else {
            Placement::Existing(binding.memory)
        };

        let (memory, offset) = match &placement {
            Placement::Dedicated { native, .. } => (native, 0),
            Placement::Existing(handle) => {
                let memory = self.memories.resolve(*handle)?;
                let offset = align_up(memory.cursor, requirements.alignment);
                let compatible = requirements.memory_type_bits & (1 << memory.memory_type_index)
                    != 0
                    && memory.flags.contains(flags);
                if !compatible {
                    R::destroy(&mut self.backend, device, native);
                    return Err(GpuError::NoCompatibleMemoryType {
                        type_bits: requirements.memory_type_bits,
                        flags,
                    });
                }
                if offset + requirements.size > memory.size {
                    R::destroy(&mut self.backend, device, native);
                    return Err(GpuError::OutOfMemory);
                }
                (&memory.native, offset)
            }
        };

        let rollback = |backend: &mut B, views: Vec<R::View>, placement: Placement<B::Memory>| {
            for view in views {
                R::destroy_view(backend, device, view);
            }
            R::destroy(backend, device, native);
            if let Placement::Dedicated { native, .. } = placement {
                backend.free_memory(device, native);
            }
        };

        if let Err(e) = R::bind(&mut self.backend, device, native, memory, offset) {
            rollback(&mut self.backend, Vec::new(), placement);
            return Err(self.frames.backend_err(e));
        }

        // Views only after a successful bind
        let mut views = Vec::with_capacity(view_descs.len());
        for (index, view_desc) in view_descs.iter().enumerate() {
            match R::create_view(&mut self.backend, device, native, view_desc) {
                Ok(view) => views.push(view),
                Err(result) => {
                    rollback(&mut self.backend, views, placement);
                    if result == vk::Result::ERROR_DEVICE_LOST {
                        return Err(self.frames.backend_err(result));
                    }
                    return Err(GpuError::ViewCreationFailed { index, result });
                }
            }
        }

        Ok(Bound {
            native,
            views,
            requirements,
            offset,
            placement,
        })
    }

    /// Record the placement of a bound resource and take its references
    fn register_binding(
        &mut self,
        device: DeviceHandle,
        requirements: vk::MemoryRequirements,
        offset: vk::DeviceSize,
        placement: Placement<B::Memory>,
    ) -> Result<MemoryBinding> {
        let memory = match placement {
            Placement::Existing(handle) => {
                self.memories.resolve_mut(handle)?.cursor = offset + requirements.size;
                handle
            }
            Placement::Dedicated {
                native,
                memory_type_index,
            } => {
                let physical = self.devices.resolve(device)?.physical_device;
                let flags = self.physical_devices.resolve(physical)?.info.memory_types()
                    [memory_type_index as usize]
                    .property_flags;
                let handle = self.memories.allocate(MemoryRecord {
                    device,
                    native,
                    size: requirements.size,
                    memory_type_index,
                    flags,
                    cursor: requirements.size,
                    dedicated: true,
                })?;
                self.devices.retain(device)?;
                handle
            }
        };

        let memory_info = self.memory_infos.allocate(MemoryInfoRecord {
            memory,
            requirements,
            offset,
        })?;
        self.memories.retain(memory)?;
        self.devices.retain(device)?;

        Ok(MemoryBinding {
            device,
            memory,
            memory_info,
        })
    }

    /// Drop a resource's references; dedicated memory goes with the last one
    fn release_binding(&mut self, binding: &MemoryBinding) -> Result<()> {
        self.memory_infos.release(binding.memory_info)?;

        if self.memories.unretain(binding.memory)? == 0 {
            let memory = self.memories.resolve_mut(binding.memory)?;
            memory.cursor = 0;
            if memory.dedicated {
                let record = self.memories.release(binding.memory)?;
                self.free_native_memory(record)?;
            }
        }

        self.devices.unretain(binding.device)?;
        Ok(())
    }

    pub fn create_buffer(&mut self, info: &BufferInfo) -> Result<BufferHandle> {
        self.validate_binding(&info.binding)?;
        self.buffers.reserve(1)?;

        let bound = self.create_bound::<BufferKind>(
            &info.desc,
            &info.binding,
            info.memory_flags,
            &info.views,
        )?;
        let binding = self.register_binding(
            info.binding.device,
            bound.requirements,
            bound.offset,
            bound.placement,
        )?;
        let handle = self.buffers.allocate(BufferRecord {
            native: bound.native,
            desc: info.desc,
            binding,
            views: bound.views,
        })?;

        log::debug!(
            "Created {:?}: {} bytes in {:?} at offset {}",
            handle,
            info.desc.size,
            binding.memory,
            bound.offset
        );
        Ok(handle)
    }

    pub fn create_image(&mut self, info: &ImageInfo) -> Result<ImageHandle> {
        self.validate_binding(&info.binding)?;
        self.images.reserve(1)?;

        let bound = self.create_bound::<ImageKind>(
            &info.desc,
            &info.binding,
            info.memory_flags,
            &info.views,
        )?;
        let binding = self.register_binding(
            info.binding.device,
            bound.requirements,
            bound.offset,
            bound.placement,
        )?;
        let handle = self.images.allocate(ImageRecord {
            native: bound.native,
            desc: info.desc,
            binding,
            views: bound.views,
        })?;

        log::debug!(
            "Created {:?}: {}x{} {:?}",
            handle,
            info.desc.extent.width,
            info.desc.extent.height,
            info.desc.format
        );
        Ok(handle)
    }

    pub fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        let record = self.buffers.release(buffer)?;
        {
            let device = &self.devices.resolve(record.binding.device)?.native;
            for view in record.views {
                self.backend.destroy_buffer_view(device, view);
            }
            self.backend.destroy_buffer(device, record.native);
        }
        self.release_binding(&record.binding)?;
        log::debug!("Destroyed {:?}", buffer);
        Ok(())
    }

    pub fn destroy_image(&mut self, image: ImageHandle) -> Result<()> {
        let record = self.images.release(image)?;
        {
            let device = &self.devices.resolve(record.binding.device)?.native;
            for view in record.views {
                self.backend.destroy_image_view(device, view);
            }
            self.backend.destroy_image(device, record.native);
        }
        self.release_binding(&record.binding)?;
        log::debug!("Destroyed {:?}", image);
        Ok(())
    }

    pub fn buffer(&self, buffer: BufferHandle) -> Result<&BufferRecord<B>> {
        self.buffers.resolve(buffer)
    }

    pub fn image(&self, image: ImageHandle) -> Result<&ImageRecord<B>> {
        self.images.resolve(image)
    }

    /// Host-visible byte range of a buffer: (memory offset, checked length)
    fn host_range(
        &self,
        buffer: BufferHandle,
        offset: vk::DeviceSize,
        len: usize,
    ) -> Result<vk::DeviceSize> {
        let record = self.buffers.resolve(buffer)?;
        let end = offset.checked_add(len as vk::DeviceSize);
        if end.map_or(true, |end| end > record.desc.size) {
            return Err(GpuError::InvalidParameter(format!(
                "range {}+{} exceeds {:?} of {} bytes",
                offset, len, buffer, record.desc.size
            )));
        }
        let memory = self.memories.resolve(record.binding.memory)?;
        if !memory.flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(GpuError::InvalidParameter(format!(
                "{:?} is not host visible",
                buffer
            )));
        }
        let info = self.memory_infos.resolve(record.binding.memory_info)?;
        Ok(info.offset + offset)
    }

    /// Copy bytes into a host-visible buffer
    pub fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<()> {
        let memory_offset = self.host_range(buffer, offset, data.len())?;
        let binding = self.buffers.resolve(buffer)?.binding;
        let device = &self.devices.resolve(binding.device)?.native;
        let memory = &self.memories.resolve(binding.memory)?.native;
        self.backend
            .write_memory(device, memory, memory_offset, data)
            .map_err(|e| self.frames.backend_err(e))?;
        Ok(())
    }

    /// Read bytes back from a host-visible buffer
    pub fn read_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: vk::DeviceSize,
        len: usize,
    ) -> Result<Vec<u8>> {
        let memory_offset = self.host_range(buffer, offset, len)?;
        let binding = self.buffers.resolve(buffer)?.binding;
        let device = &self.devices.resolve(binding.device)?.native;
        let memory = &self.memories.resolve(binding.memory)?.native;
        let mut out = vec![0; len];
        self.backend
            .read_memory(device, memory, memory_offset, &mut out)
            .map_err(|e| self.frames.backend_err(e))?;
        Ok(out)
    }
}
