// Registry - explicit owner of every GPU object
//
// Design: one `Registry` value replaces process-wide instance/device
// tables. Every object it creates is a record in a per-kind `HandleTable`;
// callers only ever hold handles. A record retains what it is built on (a
// buffer retains its device and memory, a pipeline its shaders), so
// releasing something that is still in use fails with `StillReferenced`.
//
// Operations are split by concern:
// - instance.rs: capability checks, the instance, physical devices
// - device.rs: logical devices and their queues
// - memory.rs: memory types, allocations, buffers, images, views
// - shader.rs: shader modules, pipelines, replacement and rebuild
// - swapchain.rs: surface provider and swapchains
// - command.rs: command pools and command buffer states
// - frame.rs: the update / dispatch / gather cycle
// - shared.rs: the phase lock for readers on other threads

mod command;
mod device;
mod frame;
mod instance;
mod memory;
mod shader;
mod shared;
mod swapchain;

pub use command::{CommandBufferState, CommandPoolRecord};
pub use device::{DeviceQueues, DeviceRecord, LogicalDeviceInfo, QueueDecl, QueueRecord};
pub use frame::{Command, FrameState, GatherReport, ResourceRef, UpdateContext};
pub use instance::{InstanceRecord, PhysicalDeviceRecord};
pub use memory::{
    select_memory_type, BufferInfo, BufferRecord, ImageInfo, ImageRecord, MemoryBinding,
    MemoryInfoRecord, MemoryRecord,
};
pub use shader::{PipelineDesc, PipelineRecord, ShaderBulk, ShaderInfo, ShaderRecord, StageDecl};
pub use shared::SharedRegistry;
pub use swapchain::{SurfaceProvider, SwapchainRecord};

use crate::backend::Backend;
use crate::config::Config;
use crate::error::{GpuError, Result};
use crate::handle::*;
use frame::FrameCycle;

/// Native objects that may still be in use by submitted work
enum Retired<B: Backend> {
    Pipeline(B::Pipeline),
    Swapchain {
        swapchain: SwapchainHandle,
        native: B::Swapchain,
    },
    /// Outlives every retired swapchain built on it
    Surface(B::Surface),
}

struct RetiredObject<B: Backend> {
    device: DeviceHandle,
    /// Safe to destroy once this dispatch serial has been gathered
    serial: u64,
    object: Retired<B>,
}

pub struct Registry<B: Backend> {
    backend: B,
    config: Config,
    instance: InstanceHandle,

    instances: HandleTable<kind::Instance, InstanceRecord<B>>,
    physical_devices: HandleTable<kind::PhysicalDevice, PhysicalDeviceRecord<B>>,
    devices: HandleTable<kind::Device, DeviceRecord<B>>,
    queues: HandleTable<kind::Queue, QueueRecord<B>>,
    swapchains: HandleTable<kind::Swapchain, SwapchainRecord<B>>,
    memories: HandleTable<kind::Memory, MemoryRecord<B>>,
    memory_infos: HandleTable<kind::MemoryInfo, MemoryInfoRecord>,
    buffers: HandleTable<kind::Buffer, BufferRecord<B>>,
    images: HandleTable<kind::Image, ImageRecord<B>>,
    shaders: HandleTable<kind::Shader, ShaderRecord<B>>,
    pipelines: HandleTable<kind::Pipeline, PipelineRecord<B>>,
    command_pools: HandleTable<kind::CommandPool, CommandPoolRecord<B>>,

    surface_provider: Option<Box<dyn SurfaceProvider<B> + Send + Sync>>,
    frames: FrameCycle<B>,
    retired: Vec<RetiredObject<B>>,
}

impl<B: Backend> Registry<B> {
    /// Registry with default configuration
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, &Config::default())
    }

    pub fn with_config(backend: B, config: &Config) -> Self {
        let frames_in_flight = config.frames.frames_in_flight.max(1);
        Self {
            backend,
            config: config.clone(),
            instance: InstanceHandle::NULL,
            instances: HandleTable::new(),
            physical_devices: HandleTable::new(),
            devices: HandleTable::new(),
            queues: HandleTable::new(),
            swapchains: HandleTable::new(),
            memories: HandleTable::new(),
            memory_infos: HandleTable::new(),
            buffers: HandleTable::new(),
            images: HandleTable::new(),
            shaders: HandleTable::new(),
            pipelines: HandleTable::new(),
            command_pools: HandleTable::new(),
            surface_provider: None,
            frames: FrameCycle::new(frames_in_flight),
            retired: Vec::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        !self.instance.is_null()
    }

    fn require_instance(&self) -> Result<InstanceHandle> {
        if self.instance.is_null() {
            return Err(GpuError::NotInitialized);
        }
        Ok(self.instance)
    }

    /// Quiescent: no frame slot is recording or in flight
    pub fn is_quiescent(&self) -> bool {
        self.frames.is_quiescent()
    }

    /// Number of native objects waiting for in-flight work to finish
    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// Queue a replaced native object for destruction after in-flight work
    fn retire(&mut self, device: DeviceHandle, object: Retired<B>) -> Result<()> {
        let serial = self.frames.retire_serial();
        self.retire_at(device, serial, object)
    }

    fn retire_at(&mut self, device: DeviceHandle, serial: u64, object: Retired<B>) -> Result<()> {
        self.devices.retain(device)?;
        self.retired.push(RetiredObject {
            device,
            serial,
            object,
        });
        self.collect_retired();
        Ok(())
    }

    /// Destroy retired objects whose last possible user has been gathered
    fn collect_retired(&mut self) {
        let completed = self.frames.completed();
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retired)
            .into_iter()
            .partition(|retired| retired.serial <= completed);
        self.retired = waiting;

        for retired in ready {
            self.destroy_retired(retired);
        }
    }

    fn destroy_retired(&mut self, retired: RetiredObject<B>) {
        match (retired.object, self.devices.resolve(retired.device)) {
            (Retired::Surface(surface), _) => match self.instances.resolve(self.instance) {
                Ok(instance) => self.backend.destroy_surface(&instance.native, surface),
                Err(e) => log::error!("Retired surface outlived its instance: {}", e),
            },
            (Retired::Pipeline(pipeline), Ok(device)) => {
                self.backend.destroy_pipeline(&device.native, pipeline)
            }
            (Retired::Swapchain { native, .. }, Ok(device)) => {
                self.backend.destroy_swapchain(&device.native, native)
            }
            (_, Err(e)) => log::error!("Retired object outlived its device: {}", e),
        }
        if let Err(e) = self.devices.unretain(retired.device) {
            log::error!("Failed to drop retired object's device ref: {}", e);
        }
    }

    /// Tear down every object in reverse dependency order.
    ///
    /// Waits for in-flight work unless the frame cycle faulted. Afterwards
    /// the registry is back to its initial state and may be initialized
    /// again. Closing an uninitialized registry is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if !self.is_initialized() {
            return Ok(());
        }

        log::info!("Closing registry...");

        if !self.frames.is_faulted() {
            for (handle, device) in self.devices.iter() {
                if let Err(e) = self.backend.device_wait_idle(&device.native) {
                    log::warn!("Wait idle on {:?} failed: {}", handle, e);
                }
            }
        }
        self.teardown_frames();

        for retired in std::mem::take(&mut self.retired) {
            self.destroy_retired(retired);
        }

        for (_, pipeline) in self.pipelines.drain() {
            if let Ok(device) = self.devices.resolve(pipeline.device) {
                self.backend.destroy_pipeline(&device.native, pipeline.native);
            }
        }

        for (_, shader) in self.shaders.drain() {
            if let Ok(device) = self.devices.resolve(shader.device) {
                self.backend.destroy_shader_module(&device.native, shader.native);
            }
        }

        for (_, buffer) in self.buffers.drain() {
            if let Ok(device) = self.devices.resolve(buffer.binding.device) {
                for view in buffer.views {
                    self.backend.destroy_buffer_view(&device.native, view);
                }
                self.backend.destroy_buffer(&device.native, buffer.native);
            }
        }

        for (_, image) in self.images.drain() {
            if let Ok(device) = self.devices.resolve(image.binding.device) {
                for view in image.views {
                    self.backend.destroy_image_view(&device.native, view);
                }
                self.backend.destroy_image(&device.native, image.native);
            }
        }

        self.memory_infos.drain();

        for (_, memory) in self.memories.drain() {
            if let Ok(device) = self.devices.resolve(memory.device) {
                self.backend.free_memory(&device.native, memory.native);
            }
        }

        for (_, swapchain) in self.swapchains.drain() {
            if let Ok(device) = self.devices.resolve(swapchain.device) {
                self.backend.destroy_swapchain(&device.native, swapchain.native);
            }
            if let Ok(instance) = self.instances.resolve(self.instance) {
                self.backend.destroy_surface(&instance.native, swapchain.surface);
            }
        }

        for (_, pool) in self.command_pools.drain() {
            if let Ok(device) = self.devices.resolve(pool.device) {
                self.backend.destroy_command_pool(&device.native, pool.native);
            }
        }

        self.queues.drain();

        for (handle, device) in self.devices.drain() {
            log::debug!("Destroying {:?}", handle);
            self.backend.destroy_device(device.native);
        }

        self.physical_devices.drain();

        for (_, instance) in self.instances.drain() {
            self.backend.destroy_instance(instance.native);
        }

        self.instance = InstanceHandle::NULL;
        self.frames = FrameCycle::new(self.config.frames.frames_in_flight.max(1));

        log::info!("Registry closed");
        Ok(())
    }
}

impl<B: Backend> Drop for Registry<B> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Failed to close registry: {}", e);
        }
    }
}
