// Frame cycle - update phases and asynchronous dispatch / gather
//
// Each frame slot walks
//
//   Idle -> PreUpdate -> Updating -> PostUpdate -> Dispatched -> (gather) -> Idle
//
// Work is queued as `Command`s between frames. `pre_update` validates it
// and pins every referenced resource; the pins are dropped when the slot
// is gathered. `async_dispatch` never blocks; `async_gather` is the only
// call that waits, and only on the oldest slot in flight.
//
// Device loss puts the whole cycle into `Faulted`. Only `close()` gets it
// out again.

use super::{CommandBufferState, Registry};
use crate::backend::{Backend, PipelineKind};
use crate::error::{GpuError, Result};
use crate::handle::*;
use ash::vk;
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    PreUpdate,
    Updating,
    PostUpdate,
    Dispatched,
    Faulted,
}

impl FrameState {
    pub fn name(self) -> &'static str {
        match self {
            FrameState::Idle => "idle",
            FrameState::PreUpdate => "pre-update",
            FrameState::Updating => "updating",
            FrameState::PostUpdate => "post-update",
            FrameState::Dispatched => "dispatched",
            FrameState::Faulted => "faulted",
        }
    }
}

/// A resource that pending work depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceRef {
    Buffer(BufferHandle),
    Image(ImageHandle),
    Pipeline(PipelineHandle),
    Swapchain(SwapchainHandle),
}

/// Work recorded into a frame's command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Fill the whole buffer with a repeated 32-bit word
    FillBuffer { buffer: BufferHandle, value: u32 },
    /// Copy `size` bytes; `vk::WHOLE_SIZE` copies as much as both buffers hold
    CopyBuffer {
        src: BufferHandle,
        dst: BufferHandle,
        size: vk::DeviceSize,
    },
    Dispatch {
        pipeline: PipelineHandle,
        groups: [u32; 3],
    },
    /// Keep a resource alive and validated for the frame without recording anything
    Use(ResourceRef),
}

impl Command {
    fn resources(&self) -> Vec<ResourceRef> {
        match *self {
            Command::FillBuffer { buffer, .. } => vec![ResourceRef::Buffer(buffer)],
            Command::CopyBuffer { src, dst, .. } => {
                vec![ResourceRef::Buffer(src), ResourceRef::Buffer(dst)]
            }
            Command::Dispatch { pipeline, .. } => vec![ResourceRef::Pipeline(pipeline)],
            Command::Use(resource) => vec![resource],
        }
    }
}

/// What a completed gather handed back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatherReport {
    pub slot: usize,
    /// Dispatch serial of the gathered submission
    pub serial: u64,
    /// Commands executed by the submission
    pub commands: usize,
}

struct FrameSlot<B: Backend> {
    state: FrameState,
    pool: CommandPoolHandle,
    commands: Vec<Command>,
    pinned: Vec<ResourceRef>,
    submission: Option<B::Submission>,
    serial: u64,
}

pub(super) struct FrameCycle<B: Backend> {
    frames_in_flight: usize,
    slots: Vec<FrameSlot<B>>,
    device: DeviceHandle,
    queue: QueueHandle,
    current: usize,
    /// Dispatched slots, oldest first
    in_flight: VecDeque<usize>,
    /// Commands queued for the next `pre_update`
    pending: Vec<Command>,
    submitted: u64,
    completed: u64,
    faulted: bool,
}

impl<B: Backend> FrameCycle<B> {
    pub(super) fn new(frames_in_flight: usize) -> Self {
        Self {
            frames_in_flight: frames_in_flight.max(1),
            slots: Vec::new(),
            device: DeviceHandle::NULL,
            queue: QueueHandle::NULL,
            current: 0,
            in_flight: VecDeque::new(),
            pending: Vec::new(),
            submitted: 0,
            completed: 0,
            faulted: false,
        }
    }

    pub(super) fn is_quiescent(&self) -> bool {
        !self.faulted && self.slots.iter().all(|slot| slot.state == FrameState::Idle)
    }

    /// Serial of the most recent dispatch
    pub(super) fn submitted(&self) -> u64 {
        self.submitted
    }

    /// Serial of the most recent gathered dispatch
    pub(super) fn completed(&self) -> u64 {
        self.completed
    }

    pub(super) fn is_faulted(&self) -> bool {
        self.faulted
    }

    /// Serial that must be gathered before an object replaced now is unused.
    ///
    /// A slot between `pre_update` and `async_dispatch` may already hold the
    /// object in its command buffer, so it counts as the next dispatch.
    pub(super) fn retire_serial(&self) -> u64 {
        let building = self.slots.get(self.current).is_some_and(|slot| {
            matches!(
                slot.state,
                FrameState::PreUpdate | FrameState::Updating | FrameState::PostUpdate
            )
        });
        if building {
            self.submitted + 1
        } else {
            self.submitted
        }
    }

    /// Latch `Faulted` on `GpuFault`; other errors pass through
    pub(super) fn note(&mut self, error: GpuError) -> GpuError {
        if error.is_fatal() && !self.faulted {
            self.faulted = true;
            log::error!("GPU fault: frame cycle is faulted until close()");
        }
        error
    }

    /// Translate a failed backend call, latching device loss
    pub(super) fn backend_err(&mut self, result: vk::Result) -> GpuError {
        self.note(result.into())
    }

    fn is_initialized(&self) -> bool {
        !self.slots.is_empty()
    }
}

/// Host-side access to the registry while a frame is updating
pub struct UpdateContext<'a, B: Backend> {
    registry: &'a mut Registry<B>,
    slot: usize,
}

impl<'a, B: Backend> UpdateContext<'a, B> {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn registry(&self) -> &Registry<B> {
        self.registry
    }

    pub fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<()> {
        self.registry.write_buffer(buffer, offset, data)
    }

    pub fn read_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: vk::DeviceSize,
        len: usize,
    ) -> Result<Vec<u8>> {
        self.registry.read_buffer(buffer, offset, len)
    }

    /// Add a command to this frame; validated and pinned immediately
    pub fn record(&mut self, command: Command) -> Result<()> {
        self.registry.validate_command(&command)?;
        let resources = command.resources();
        self.registry.pin(&resources)?;

        let slot = &mut self.registry.frames.slots[self.slot];
        slot.pinned.extend(resources);
        slot.commands.push(command);
        Ok(())
    }
}

impl<B: Backend> Registry<B> {
    /// Create one command pool and buffer per frame slot on `queue`'s family
    pub fn init_frames(&mut self, device: DeviceHandle, queue: QueueHandle) -> Result<()> {
        self.require_instance()?;
        self.check_faulted()?;
        if self.frames.is_initialized() {
            return Err(GpuError::AlreadyInitialized);
        }
        let queue_record = self.queues.resolve(queue)?;
        if queue_record.device != device {
            return Err(GpuError::InvalidParameter(format!(
                "{:?} does not belong to {:?}",
                queue, device
            )));
        }
        let family = queue_record.family;

        let count = self.frames.frames_in_flight;
        let mut pools = Vec::with_capacity(count);
        for _ in 0..count {
            let created = self
                .create_command_pool(device, family, vk::CommandPoolCreateFlags::empty())
                .and_then(|pool| {
                    pools.push(pool);
                    self.allocate_command_buffers(pool, 1)
                });
            if let Err(e) = created {
                for pool in pools {
                    if let Err(e) = self.destroy_command_pool(pool) {
                        log::error!("Failed to roll back {:?}: {}", pool, e);
                    }
                }
                return Err(e);
            }
        }

        self.frames.slots = pools
            .into_iter()
            .map(|pool| FrameSlot {
                state: FrameState::Idle,
                pool,
                commands: Vec::new(),
                pinned: Vec::new(),
                submission: None,
                serial: 0,
            })
            .collect();
        self.frames.device = device;
        self.frames.queue = queue;
        self.frames.current = 0;

        log::info!("Frame cycle ready: {} slot(s) on {:?}", count, queue);
        Ok(())
    }

    /// Destroy the frame slots; every slot must be idle
    pub fn release_frames(&mut self) -> Result<()> {
        self.check_faulted()?;
        if let Some(slot) = self
            .frames
            .slots
            .iter()
            .find(|slot| slot.state != FrameState::Idle)
        {
            return Err(GpuError::InvalidPhase {
                expected: FrameState::Idle.name(),
                found: slot.state.name(),
            });
        }

        for slot in std::mem::take(&mut self.frames.slots) {
            self.destroy_command_pool(slot.pool)?;
        }
        self.frames.device = DeviceHandle::NULL;
        self.frames.queue = QueueHandle::NULL;
        log::info!("Frame cycle released");
        Ok(())
    }

    pub fn frame_state(&self) -> FrameState {
        if self.frames.faulted {
            return FrameState::Faulted;
        }
        self.frames
            .slots
            .get(self.frames.current)
            .map_or(FrameState::Idle, |slot| slot.state)
    }

    pub fn current_slot(&self) -> usize {
        self.frames.current
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.in_flight.len()
    }

    pub fn pending_commands(&self) -> &[Command] {
        &self.frames.pending
    }

    /// Queue work for the next frame
    pub fn enqueue(&mut self, command: Command) -> Result<()> {
        self.check_faulted()?;
        self.frames.pending.push(command);
        Ok(())
    }

    pub fn clear_pending(&mut self) {
        self.frames.pending.clear();
    }

    fn check_faulted(&self) -> Result<()> {
        if self.frames.faulted {
            return Err(GpuError::GpuFault);
        }
        Ok(())
    }

    fn check_frames(&self) -> Result<()> {
        self.check_faulted()?;
        if !self.frames.is_initialized() {
            return Err(GpuError::NotInitialized);
        }
        Ok(())
    }

    fn expect_phase(&self, expected: FrameState) -> Result<usize> {
        self.check_frames()?;
        let current = self.frames.current;
        let found = self.frames.slots[current].state;
        if found != expected {
            return Err(GpuError::InvalidPhase {
                expected: expected.name(),
                found: found.name(),
            });
        }
        Ok(current)
    }

    fn note_error(&mut self, error: GpuError) -> GpuError {
        self.frames.note(error)
    }

    fn validate_command(&mut self, command: &Command) -> Result<()> {
        let device = self.frames.device;
        let buffer_usage = |registry: &Self,
                            buffer: BufferHandle,
                            usage: vk::BufferUsageFlags|
         -> Result<()> {
            let record = registry.buffers.resolve(buffer)?;
            if record.binding.device != device {
                return Err(GpuError::InvalidParameter(format!(
                    "{:?} is not on the frame device",
                    buffer
                )));
            }
            if !record.desc.usage.contains(usage) {
                return Err(GpuError::InvalidParameter(format!(
                    "{:?} lacks usage {:?}",
                    buffer, usage
                )));
            }
            Ok(())
        };

        match *command {
            Command::FillBuffer { buffer, .. } => {
                buffer_usage(self, buffer, vk::BufferUsageFlags::TRANSFER_DST)
            }
            Command::CopyBuffer { src, dst, .. } => {
                buffer_usage(self, src, vk::BufferUsageFlags::TRANSFER_SRC)?;
                buffer_usage(self, dst, vk::BufferUsageFlags::TRANSFER_DST)
            }
            Command::Dispatch { pipeline, .. } => {
                let record = self.pipelines.resolve(pipeline)?;
                if record.kind != PipelineKind::Compute {
                    return Err(GpuError::InvalidParameter(format!(
                        "{:?} is not a compute pipeline",
                        pipeline
                    )));
                }
                self.ensure_pipeline_ready(pipeline)
            }
            Command::Use(ResourceRef::Buffer(buffer)) => self.buffers.resolve(buffer).map(drop),
            Command::Use(ResourceRef::Image(image)) => self.images.resolve(image).map(drop),
            Command::Use(ResourceRef::Pipeline(pipeline)) => self.ensure_pipeline_ready(pipeline),
            Command::Use(ResourceRef::Swapchain(swapchain)) => {
                if self.swapchains.resolve(swapchain)?.out_of_date {
                    return Err(GpuError::ResourceNotReady(format!(
                        "{:?} is out of date",
                        swapchain
                    )));
                }
                Ok(())
            }
        }
    }

    /// Rebuild a stale pipeline before it is used by a frame
    fn ensure_pipeline_ready(&mut self, pipeline: PipelineHandle) -> Result<()> {
        if !self.pipelines.resolve(pipeline)?.stale {
            return Ok(());
        }
        self.rebuild_pipeline(pipeline).map_err(|e| match e {
            GpuError::GpuFault => e,
            other => GpuError::ResourceNotReady(format!(
                "{:?} could not be rebuilt: {}",
                pipeline, other
            )),
        })
    }

    fn pin(&mut self, resources: &[ResourceRef]) -> Result<()> {
        for resource in resources {
            match *resource {
                ResourceRef::Buffer(buffer) => self.buffers.retain(buffer)?,
                ResourceRef::Image(image) => self.images.retain(image)?,
                ResourceRef::Pipeline(pipeline) => self.pipelines.retain(pipeline)?,
                ResourceRef::Swapchain(swapchain) => self.swapchains.retain(swapchain)?,
            }
        }
        Ok(())
    }

    fn unpin(&mut self, resources: &[ResourceRef]) {
        for resource in resources {
            let result = match *resource {
                ResourceRef::Buffer(buffer) => self.buffers.unretain(buffer),
                ResourceRef::Image(image) => self.images.unretain(image),
                ResourceRef::Pipeline(pipeline) => self.pipelines.unretain(pipeline),
                ResourceRef::Swapchain(swapchain) => self.swapchains.unretain(swapchain),
            };
            if let Err(e) = result {
                log::error!("Failed to unpin {:?}: {}", resource, e);
            }
        }
    }

    /// Start a frame: validate queued work and pin what it references.
    ///
    /// Picks the slot after the last dispatched one. If that slot has not
    /// been gathered yet this fails with `DispatchInFlight`. On validation
    /// failure the queued work is kept so it can be fixed and retried.
    pub fn pre_update(&mut self) -> Result<()> {
        self.check_frames()?;
        let count = self.frames.slots.len();
        let mut slot = self.frames.current;
        if self.frames.slots[slot].state == FrameState::Dispatched {
            slot = (slot + 1) % count;
        }
        match self.frames.slots[slot].state {
            FrameState::Idle => {}
            FrameState::Dispatched => return Err(GpuError::DispatchInFlight { slot }),
            found => {
                return Err(GpuError::InvalidPhase {
                    expected: FrameState::Idle.name(),
                    found: found.name(),
                })
            }
        }

        let commands = self.frames.pending.clone();
        for command in &commands {
            if let Err(e) = self.validate_command(command) {
                log::warn!("Frame {} rejected {:?}: {}", slot, command, e);
                return Err(self.note_error(e));
            }
        }
        let resources: Vec<ResourceRef> = commands.iter().flat_map(Command::resources).collect();
        self.pin(&resources)?;
        self.frames.pending.clear();

        self.frames.current = slot;
        let frame = &mut self.frames.slots[slot];
        frame.commands = commands;
        frame.pinned = resources;
        frame.state = FrameState::PreUpdate;
        log::debug!("Frame slot {}: pre-update ({} commands)", slot, frame.commands.len());
        Ok(())
    }

    /// Run host-side updates for the current frame. Must not block.
    pub fn do_update<R, F>(&mut self, update: F) -> Result<R>
    where
        F: FnOnce(&mut UpdateContext<'_, B>) -> Result<R>,
    {
        self.check_frames()?;
        let slot = self.frames.current;
        match self.frames.slots[slot].state {
            FrameState::PreUpdate | FrameState::Updating => {}
            found => {
                return Err(GpuError::InvalidPhase {
                    expected: FrameState::PreUpdate.name(),
                    found: found.name(),
                })
            }
        }
        self.frames.slots[slot].state = FrameState::Updating;

        let mut context = UpdateContext {
            registry: self,
            slot,
        };
        update(&mut context).map_err(|e| self.note_error(e))
    }

    /// Record the frame's commands into its command buffer
    pub fn post_update(&mut self) -> Result<()> {
        let slot = self.expect_phase(FrameState::Updating)?;
        if let Err(e) = self.record_frame(slot) {
            let e = self.note_error(e);
            if !self.frames.faulted {
                self.abandon_slot(slot);
            }
            return Err(e);
        }
        self.frames.slots[slot].state = FrameState::PostUpdate;
        log::debug!("Frame slot {}: recorded", slot);
        Ok(())
    }

    fn record_frame(&mut self, slot: usize) -> Result<()> {
        let pool = self.frames.slots[slot].pool;
        let commands = self.frames.slots[slot].commands.clone();
        for command in &commands {
            if let Command::Dispatch { pipeline, .. } = *command {
                self.ensure_pipeline_ready(pipeline)?;
            }
        }

        self.begin_command_buffer(pool, 0)?;
        let (command_buffer, _) = self.command_buffer(pool, 0)?;
        let device = &self.devices.resolve(self.frames.device)?.native;
        for command in &commands {
            match *command {
                Command::FillBuffer { buffer, value } => {
                    let buffer = self.buffers.resolve(buffer)?.native;
                    self.backend
                        .cmd_fill_buffer(device, command_buffer, buffer, value);
                }
                Command::CopyBuffer { src, dst, size } => {
                    let src = self.buffers.resolve(src)?;
                    let dst = self.buffers.resolve(dst)?;
                    let size = size.min(src.desc.size).min(dst.desc.size);
                    self.backend
                        .cmd_copy_buffer(device, command_buffer, src.native, dst.native, size);
                }
                Command::Dispatch { pipeline, groups } => {
                    let pipeline = &self.pipelines.resolve(pipeline)?.native;
                    self.backend
                        .cmd_dispatch(device, command_buffer, pipeline, groups);
                }
                Command::Use(_) => {}
            }
        }
        self.end_command_buffer(pool, 0)
    }

    /// Drop a frame that never reached the queue
    fn abandon_slot(&mut self, slot: usize) {
        let frame = &mut self.frames.slots[slot];
        let pool = frame.pool;
        let pinned = std::mem::take(&mut frame.pinned);
        frame.commands.clear();
        frame.state = FrameState::Idle;

        self.unpin(&pinned);
        if let Err(e) = self.reset_command_pool(pool) {
            log::error!("Failed to reset frame slot {}: {}", slot, e);
        }
        log::warn!("Frame slot {} abandoned", slot);
    }

    /// Give up on the frame being built; queued work is not restored
    pub fn abandon_frame(&mut self) -> Result<()> {
        self.check_frames()?;
        let slot = self.frames.current;
        match self.frames.slots[slot].state {
            FrameState::PreUpdate | FrameState::Updating | FrameState::PostUpdate => {
                self.abandon_slot(slot);
                Ok(())
            }
            found => Err(GpuError::InvalidPhase {
                expected: FrameState::Updating.name(),
                found: found.name(),
            }),
        }
    }

    /// Submit the recorded frame and return without waiting
    pub fn async_dispatch(&mut self) -> Result<u64> {
        self.check_frames()?;
        let slot = self.frames.current;
        match self.frames.slots[slot].state {
            FrameState::PostUpdate => {}
            FrameState::Dispatched => return Err(GpuError::DispatchInFlight { slot }),
            found => {
                return Err(GpuError::InvalidPhase {
                    expected: FrameState::PostUpdate.name(),
                    found: found.name(),
                })
            }
        }

        let pool = self.frames.slots[slot].pool;
        let (command_buffer, _) = self.command_buffer(pool, 0)?;
        self.set_command_buffer_state(
            pool,
            0,
            CommandBufferState::Executable,
            CommandBufferState::Pending,
        )?;

        let queue = self.queues.resolve(self.frames.queue)?.native;
        let device = &self.devices.resolve(self.frames.device)?.native;
        let submission = match self.backend.submit(device, queue, &[command_buffer]) {
            Ok(submission) => submission,
            Err(result) => {
                self.set_command_buffer_state(
                    pool,
                    0,
                    CommandBufferState::Pending,
                    CommandBufferState::Executable,
                )?;
                let e = self.note_error(result.into());
                if !self.frames.faulted {
                    self.abandon_slot(slot);
                }
                return Err(e);
            }
        };

        self.frames.submitted += 1;
        let serial = self.frames.submitted;
        let frame = &mut self.frames.slots[slot];
        frame.submission = Some(submission);
        frame.serial = serial;
        frame.state = FrameState::Dispatched;
        self.frames.in_flight.push_back(slot);

        log::debug!("Frame slot {}: dispatched (serial {})", slot, serial);
        Ok(serial)
    }

    /// Wait for the oldest dispatched frame.
    ///
    /// On `GatherTimeout` the submission stays in flight; call again.
    pub fn async_gather(&mut self, timeout: Duration) -> Result<GatherReport> {
        self.check_frames()?;
        let Some(&slot) = self.frames.in_flight.front() else {
            return Err(GpuError::InvalidPhase {
                expected: FrameState::Dispatched.name(),
                found: self.frame_state().name(),
            });
        };

        let device = &self.devices.resolve(self.frames.device)?.native;
        let waited = match &self.frames.slots[slot].submission {
            Some(submission) => self.backend.wait(device, submission, timeout),
            None => Ok(true),
        };
        match waited {
            Ok(true) => {}
            Ok(false) => {
                log::warn!("Frame slot {}: gather timed out after {:?}", slot, timeout);
                return Err(GpuError::GatherTimeout { slot });
            }
            Err(result) => return Err(self.note_error(result.into())),
        }

        self.frames.in_flight.pop_front();
        let frame = &mut self.frames.slots[slot];
        let submission = frame.submission.take();
        let pinned = std::mem::take(&mut frame.pinned);
        let commands = std::mem::take(&mut frame.commands).len();
        let serial = frame.serial;
        let pool = frame.pool;
        frame.state = FrameState::Idle;

        if let Some(submission) = submission {
            self.backend.retire_submission(device, submission);
        }
        self.frames.completed = serial;
        self.unpin(&pinned);
        self.set_command_buffer_state(
            pool,
            0,
            CommandBufferState::Pending,
            CommandBufferState::Executable,
        )?;
        self.reset_command_pool(pool)?;
        self.collect_retired();

        log::debug!("Frame slot {}: gathered (serial {})", slot, serial);
        Ok(GatherReport {
            slot,
            serial,
            commands,
        })
    }

    /// Release everything the frame cycle holds without waiting (close only)
    pub(super) fn teardown_frames(&mut self) {
        let device = self.frames.device;
        for slot in std::mem::take(&mut self.frames.slots) {
            if let Some(submission) = slot.submission {
                match self.devices.resolve(device) {
                    Ok(device) => self.backend.retire_submission(&device.native, submission),
                    Err(e) => log::error!("Submission outlived its device: {}", e),
                }
            }
        }
        self.frames.in_flight.clear();
        self.frames.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{FailPoint, HeadlessInstance, ObjectKind};
    use crate::backend::{BufferDesc, HeadlessBackend, SwapchainDesc};
    use crate::registry::{BufferInfo, LogicalDeviceInfo, PipelineDesc, QueueDecl, ShaderInfo};

    const SPIRV: [u32; 5] = [0x0723_0203, 0x0001_0000, 0, 1, 0];
    const TIMEOUT: Duration = Duration::from_millis(10);

    fn setup() -> (Registry<HeadlessBackend>, DeviceHandle) {
        let mut registry = Registry::new(HeadlessBackend::default());
        registry.default_init().unwrap();
        let physical = registry.preferred_physical_device().unwrap();
        let info = LogicalDeviceInfo {
            queues: vec![QueueDecl::new(0, vec![1.0])],
            ..LogicalDeviceInfo::default()
        };
        let queues = registry.init_queues(&info, physical).unwrap();
        registry.init_frames(queues.device, queues.queues[0]).unwrap();
        (registry, queues.device)
    }

    fn transfer_buffer(registry: &mut Registry<HeadlessBackend>, device: DeviceHandle) -> BufferHandle {
        let desc = BufferDesc::new(
            64,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
        );
        registry
            .create_buffer(&BufferInfo::new(
                device,
                desc,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
            ))
            .unwrap()
    }

    fn run_frame(registry: &mut Registry<HeadlessBackend>) -> u64 {
        registry.pre_update().unwrap();
        registry.do_update(|_| Ok(())).unwrap();
        registry.post_update().unwrap();
        registry.async_dispatch().unwrap()
    }

    #[test]
    fn empty_frame_completes() {
        let (mut registry, _) = setup();
        assert_eq!(registry.frame_state(), FrameState::Idle);
        registry.pre_update().unwrap();
        assert_eq!(registry.frame_state(), FrameState::PreUpdate);
        registry.do_update(|_| Ok(())).unwrap();
        assert_eq!(registry.frame_state(), FrameState::Updating);
        registry.post_update().unwrap();
        assert_eq!(registry.frame_state(), FrameState::PostUpdate);
        assert_eq!(registry.async_dispatch().unwrap(), 1);
        assert_eq!(registry.frame_state(), FrameState::Dispatched);
        assert!(!registry.is_quiescent());

        let report = registry.async_gather(TIMEOUT).unwrap();
        assert_eq!(report, GatherReport { slot: 0, serial: 1, commands: 0 });
        assert_eq!(registry.frame_state(), FrameState::Idle);
        assert!(registry.is_quiescent());
        assert_eq!(registry.backend().live(ObjectKind::Submission), 0);
    }

    #[test]
    fn second_dispatch_on_a_slot_is_in_flight() {
        let (mut registry, _) = setup();
        run_frame(&mut registry);
        assert_eq!(
            registry.async_dispatch(),
            Err(GpuError::DispatchInFlight { slot: 0 })
        );

        // Slot 1 is free, then both are busy
        run_frame(&mut registry);
        assert_eq!(registry.frames_in_flight(), 2);
        assert_eq!(
            registry.pre_update(),
            Err(GpuError::DispatchInFlight { slot: 0 })
        );

        assert_eq!(registry.async_gather(TIMEOUT).unwrap().slot, 0);
        assert_eq!(registry.async_gather(TIMEOUT).unwrap().slot, 1);
        // An idle current slot is reused
        run_frame(&mut registry);
        assert_eq!(registry.current_slot(), 1);
    }

    #[test]
    fn phases_must_run_in_order() {
        let (mut registry, _) = setup();
        assert!(matches!(
            registry.post_update(),
            Err(GpuError::InvalidPhase { expected: "updating", found: "idle" })
        ));
        assert!(matches!(
            registry.async_gather(TIMEOUT),
            Err(GpuError::InvalidPhase { .. })
        ));
        registry.pre_update().unwrap();
        assert!(matches!(
            registry.async_dispatch(),
            Err(GpuError::InvalidPhase { found: "pre-update", .. })
        ));
    }

    #[test]
    fn frames_execute_queued_commands() {
        let (mut registry, device) = setup();
        let src = transfer_buffer(&mut registry, device);
        let dst = transfer_buffer(&mut registry, device);

        registry
            .enqueue(Command::FillBuffer {
                buffer: src,
                value: 0xabab_abab,
            })
            .unwrap();
        registry.pre_update().unwrap();
        registry
            .do_update(|ctx| {
                ctx.record(Command::CopyBuffer {
                    src,
                    dst,
                    size: vk::WHOLE_SIZE,
                })
            })
            .unwrap();
        registry.post_update().unwrap();
        registry.async_dispatch().unwrap();

        // Pinned until gathered
        assert!(matches!(
            registry.destroy_buffer(src),
            Err(GpuError::StillReferenced { kind: "buffer", .. })
        ));

        let report = registry.async_gather(TIMEOUT).unwrap();
        assert_eq!(report.commands, 2);
        assert_eq!(registry.read_buffer(dst, 0, 64).unwrap(), vec![0xab; 64]);
        registry.destroy_buffer(src).unwrap();
    }

    #[test]
    fn commands_are_validated_before_recording() {
        let (mut registry, device) = setup();
        let desc = BufferDesc::new(64, vk::BufferUsageFlags::STORAGE_BUFFER);
        let storage = registry
            .create_buffer(&BufferInfo::new(
                device,
                desc,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            ))
            .unwrap();

        registry
            .enqueue(Command::FillBuffer {
                buffer: storage,
                value: 0,
            })
            .unwrap();
        assert!(matches!(
            registry.pre_update(),
            Err(GpuError::InvalidParameter(_))
        ));
        assert_eq!(registry.frame_state(), FrameState::Idle);
        assert_eq!(registry.pending_commands().len(), 1);

        registry.clear_pending();
        registry.enqueue(Command::Use(ResourceRef::Buffer(BufferHandle::NULL))).unwrap();
        assert!(matches!(
            registry.pre_update(),
            Err(GpuError::InvalidHandle { .. })
        ));
    }

    #[test]
    fn out_of_date_swapchain_is_not_ready() {
        let (mut registry, device) = setup();
        registry.provide_surface_fun(|instance: &HeadlessInstance, index| {
            Ok(instance.create_surface(index))
        });
        let swapchain = registry
            .create_swapchain(&SwapchainDesc::default(), 0, device)
            .unwrap();
        registry.invalidate_swapchain(swapchain).unwrap();

        registry
            .enqueue(Command::Use(ResourceRef::Swapchain(swapchain)))
            .unwrap();
        assert!(matches!(
            registry.pre_update(),
            Err(GpuError::ResourceNotReady(_))
        ));

        registry
            .recreate_swapchain(swapchain, vk::Extent2D { width: 640, height: 480 })
            .unwrap();
        run_frame(&mut registry);
        registry.async_gather(TIMEOUT).unwrap();
    }

    #[test]
    fn stale_pipeline_is_rebuilt_before_dispatch() {
        let (mut registry, device) = setup();
        let shader = registry
            .add_shader(ShaderInfo::new(&SPIRV), device, vk::ShaderStageFlags::COMPUTE)
            .unwrap();
        let pipeline = registry
            .create_pipeline(&PipelineDesc {
                device,
                kind: PipelineKind::Compute,
                shaders: vec![shader],
            })
            .unwrap();

        registry
            .enqueue(Command::Dispatch {
                pipeline,
                groups: [4, 1, 1],
            })
            .unwrap();
        run_frame(&mut registry);

        // Replace the shader while the first dispatch is in flight
        registry
            .add_shader(
                ShaderInfo::replacing(&SPIRV, shader),
                device,
                vk::ShaderStageFlags::COMPUTE,
            )
            .unwrap();
        registry
            .enqueue(Command::Dispatch {
                pipeline,
                groups: [4, 1, 1],
            })
            .unwrap();
        run_frame(&mut registry);
        assert!(!registry.pipeline(pipeline).unwrap().stale);

        // The replaced native pipeline waits for the first frame
        assert_eq!(registry.retired_count(), 1);
        registry.async_gather(TIMEOUT).unwrap();
        assert_eq!(registry.retired_count(), 0);
        registry.async_gather(TIMEOUT).unwrap();
        assert_eq!(registry.backend().dispatches(), 2);
        assert_eq!(registry.backend().live(ObjectKind::Pipeline), 1);
    }

    #[test]
    fn timed_out_gather_can_be_retried() {
        let (mut registry, _) = setup();
        run_frame(&mut registry);
        registry.backend_mut().stall_waits(1);
        assert_eq!(
            registry.async_gather(TIMEOUT),
            Err(GpuError::GatherTimeout { slot: 0 })
        );
        assert_eq!(registry.frame_state(), FrameState::Dispatched);
        assert_eq!(registry.async_gather(TIMEOUT).unwrap().serial, 1);
    }

    #[test]
    fn device_loss_faults_the_cycle() {
        let (mut registry, _) = setup();
        run_frame(&mut registry);
        registry.backend_mut().lose_device();
        assert_eq!(registry.async_gather(TIMEOUT), Err(GpuError::GpuFault));
        assert_eq!(registry.frame_state(), FrameState::Faulted);
        assert_eq!(registry.pre_update(), Err(GpuError::GpuFault));
        assert_eq!(
            registry.enqueue(Command::Use(ResourceRef::Buffer(BufferHandle::NULL))),
            Err(GpuError::GpuFault)
        );
        assert!(!registry.is_quiescent());

        registry.close().unwrap();
        assert_eq!(registry.backend().live_total(), 0);
        assert_eq!(registry.frame_state(), FrameState::Idle);
    }

    #[test]
    fn failed_submit_abandons_the_frame() {
        let (mut registry, device) = setup();
        let buffer = transfer_buffer(&mut registry, device);
        registry
            .enqueue(Command::FillBuffer { buffer, value: 1 })
            .unwrap();
        registry.pre_update().unwrap();
        registry.do_update(|_| Ok(())).unwrap();
        registry.post_update().unwrap();

        registry
            .backend_mut()
            .fail_next(FailPoint::Submit, vk::Result::ERROR_UNKNOWN);
        assert_eq!(
            registry.async_dispatch(),
            Err(GpuError::Backend(vk::Result::ERROR_UNKNOWN))
        );
        assert_eq!(registry.frame_state(), FrameState::Idle);
        // Pins were dropped with the frame
        registry.destroy_buffer(buffer).unwrap();
        run_frame(&mut registry);
    }

    #[test]
    fn frames_release_cleanly() {
        let (mut registry, device) = setup();
        run_frame(&mut registry);
        assert!(matches!(
            registry.release_frames(),
            Err(GpuError::InvalidPhase { .. })
        ));
        registry.async_gather(TIMEOUT).unwrap();
        registry.release_frames().unwrap();
        assert_eq!(registry.backend().live(ObjectKind::CommandPool), 0);
        assert_eq!(registry.device(device).map(|_| ()), Ok(()));
        assert_eq!(registry.pre_update(), Err(GpuError::NotInitialized));
    }
}
