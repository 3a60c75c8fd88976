// Command pools - per-family pools and the command buffer state machine
//
// Initial -> Recording -> Executable -> Pending -> (pool reset) -> Initial
//
// Only the frame cycle moves buffers into and out of Pending.

use super::Registry;
use crate::backend::Backend;
use crate::error::{GpuError, Result};
use crate::handle::*;
use ash::vk;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    Pending,
}

impl CommandBufferState {
    pub fn name(self) -> &'static str {
        match self {
            CommandBufferState::Initial => "initial",
            CommandBufferState::Recording => "recording",
            CommandBufferState::Executable => "executable",
            CommandBufferState::Pending => "pending",
        }
    }
}

pub struct CommandPoolRecord<B: Backend> {
    pub device: DeviceHandle,
    pub family: u32,
    pub flags: vk::CommandPoolCreateFlags,
    pub native: B::CommandPool,
    pub buffers: Vec<(B::CommandBuffer, CommandBufferState)>,
}

impl<B: Backend> CommandPoolRecord<B> {
    fn can_reset_individually(&self) -> bool {
        self.flags
            .contains(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
    }

    pub fn state(&self, index: usize) -> Result<CommandBufferState> {
        self.buffers
            .get(index)
            .map(|(_, state)| *state)
            .ok_or_else(|| out_of_range(index, self.buffers.len()))
    }

    pub fn has_pending(&self) -> bool {
        self.buffers
            .iter()
            .any(|(_, state)| *state == CommandBufferState::Pending)
    }
}

fn out_of_range(index: usize, len: usize) -> GpuError {
    GpuError::InvalidParameter(format!(
        "command buffer {} out of range (pool has {})",
        index, len
    ))
}

fn expect_state(
    found: CommandBufferState,
    expected: CommandBufferState,
) -> Result<()> {
    if found != expected {
        return Err(GpuError::InvalidPhase {
            expected: expected.name(),
            found: found.name(),
        });
    }
    Ok(())
}

impl<B: Backend> Registry<B> {
    pub fn create_command_pool(
        &mut self,
        device: DeviceHandle,
        family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<CommandPoolHandle> {
        let record = self.devices.resolve(device)?;
        let families = self
            .physical_devices
            .resolve(record.physical_device)?
            .info
            .queue_families
            .len();
        if family as usize >= families {
            return Err(GpuError::InvalidParameter(format!(
                "queue family {} does not exist ({} families)",
                family, families
            )));
        }
        self.command_pools.reserve(1)?;

        let native = self
            .backend
            .create_command_pool(&record.native, family, flags)?;
        let handle = self.command_pools.allocate(CommandPoolRecord {
            device,
            family,
            flags,
            native,
            buffers: Vec::new(),
        })?;
        self.devices.retain(device)?;

        log::debug!("Created {:?} for family {}", handle, family);
        Ok(handle)
    }

    pub fn command_pool(&self, pool: CommandPoolHandle) -> Result<&CommandPoolRecord<B>> {
        self.command_pools.resolve(pool)
    }

    /// Allocate `count` buffers in the Initial state; returns their indices
    pub fn allocate_command_buffers(
        &mut self,
        pool: CommandPoolHandle,
        count: u32,
    ) -> Result<Range<usize>> {
        let record = self.command_pools.resolve_mut(pool)?;
        let device = &self.devices.resolve(record.device)?.native;
        let buffers = self
            .backend
            .allocate_command_buffers(device, &record.native, count)?;

        let start = record.buffers.len();
        record.buffers.extend(
            buffers
                .into_iter()
                .map(|buffer| (buffer, CommandBufferState::Initial)),
        );
        Ok(start..record.buffers.len())
    }

    pub fn command_buffer(
        &self,
        pool: CommandPoolHandle,
        index: usize,
    ) -> Result<(B::CommandBuffer, CommandBufferState)> {
        let record = self.command_pools.resolve(pool)?;
        record
            .buffers
            .get(index)
            .copied()
            .ok_or_else(|| out_of_range(index, record.buffers.len()))
    }

    /// Start recording.
    ///
    /// Executable buffers may be re-recorded only in pools created with
    /// `RESET_COMMAND_BUFFER`; otherwise the whole pool has to be reset.
    pub fn begin_command_buffer(&mut self, pool: CommandPoolHandle, index: usize) -> Result<()> {
        let record = self.command_pools.resolve_mut(pool)?;
        let reset_individually = record.can_reset_individually();
        let len = record.buffers.len();
        let (buffer, state) = record
            .buffers
            .get_mut(index)
            .ok_or_else(|| out_of_range(index, len))?;

        let allowed = match *state {
            CommandBufferState::Initial => true,
            CommandBufferState::Executable => reset_individually,
            _ => false,
        };
        if !allowed {
            return Err(GpuError::InvalidPhase {
                expected: CommandBufferState::Initial.name(),
                found: state.name(),
            });
        }

        let device = &self.devices.resolve(record.device)?.native;
        self.backend
            .begin_command_buffer(device, *buffer)
            .map_err(|e| self.frames.backend_err(e))?;
        *state = CommandBufferState::Recording;
        Ok(())
    }

    pub fn end_command_buffer(&mut self, pool: CommandPoolHandle, index: usize) -> Result<()> {
        let record = self.command_pools.resolve_mut(pool)?;
        let len = record.buffers.len();
        let (buffer, state) = record
            .buffers
            .get_mut(index)
            .ok_or_else(|| out_of_range(index, len))?;
        expect_state(*state, CommandBufferState::Recording)?;

        let device = &self.devices.resolve(record.device)?.native;
        self.backend
            .end_command_buffer(device, *buffer)
            .map_err(|e| self.frames.backend_err(e))?;
        *state = CommandBufferState::Executable;
        Ok(())
    }

    /// Move every buffer of the pool back to Initial
    pub fn reset_command_pool(&mut self, pool: CommandPoolHandle) -> Result<()> {
        let record = self.command_pools.resolve_mut(pool)?;
        if record.has_pending() {
            return Err(GpuError::InvalidPhase {
                expected: CommandBufferState::Executable.name(),
                found: CommandBufferState::Pending.name(),
            });
        }

        let device = &self.devices.resolve(record.device)?.native;
        self.backend
            .reset_command_pool(device, &record.native)
            .map_err(|e| self.frames.backend_err(e))?;
        for (_, state) in record.buffers.iter_mut() {
            *state = CommandBufferState::Initial;
        }
        Ok(())
    }

    /// Submission bookkeeping for the frame cycle
    pub(super) fn set_command_buffer_state(
        &mut self,
        pool: CommandPoolHandle,
        index: usize,
        expected: CommandBufferState,
        next: CommandBufferState,
    ) -> Result<()> {
        let record = self.command_pools.resolve_mut(pool)?;
        let len = record.buffers.len();
        let (_, state) = record
            .buffers
            .get_mut(index)
            .ok_or_else(|| out_of_range(index, len))?;
        expect_state(*state, expected)?;
        *state = next;
        Ok(())
    }

    pub fn destroy_command_pool(&mut self, pool: CommandPoolHandle) -> Result<()> {
        let record = self.command_pools.resolve(pool)?;
        if record.has_pending() {
            return Err(GpuError::InvalidPhase {
                expected: CommandBufferState::Executable.name(),
                found: CommandBufferState::Pending.name(),
            });
        }

        let record = self.command_pools.release(pool)?;
        let device = &self.devices.resolve(record.device)?.native;
        self.backend.destroy_command_pool(device, record.native);
        self.devices.unretain(record.device)?;
        log::debug!("Destroyed {:?}", pool);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::ObjectKind;
    use crate::backend::HeadlessBackend;
    use crate::registry::{LogicalDeviceInfo, QueueDecl};

    fn setup() -> (Registry<HeadlessBackend>, DeviceHandle) {
        let mut registry = Registry::new(HeadlessBackend::default());
        registry.default_init().unwrap();
        let physical = registry.preferred_physical_device().unwrap();
        let info = LogicalDeviceInfo {
            queues: vec![QueueDecl::new(0, vec![1.0])],
            ..LogicalDeviceInfo::default()
        };
        let device = registry.init_queues(&info, physical).unwrap().device;
        (registry, device)
    }

    #[test]
    fn buffers_walk_the_state_machine() {
        let (mut registry, device) = setup();
        let pool = registry
            .create_command_pool(device, 0, vk::CommandPoolCreateFlags::empty())
            .unwrap();
        let range = registry.allocate_command_buffers(pool, 2).unwrap();
        assert_eq!(range, 0..2);

        registry.begin_command_buffer(pool, 0).unwrap();
        assert_eq!(
            registry.end_command_buffer(pool, 1),
            Err(GpuError::InvalidPhase {
                expected: "recording",
                found: "initial"
            })
        );
        registry.end_command_buffer(pool, 0).unwrap();
        assert_eq!(
            registry.command_buffer(pool, 0).unwrap().1,
            CommandBufferState::Executable
        );

        // No per-buffer reset in this pool
        assert!(matches!(
            registry.begin_command_buffer(pool, 0),
            Err(GpuError::InvalidPhase { .. })
        ));
        registry.reset_command_pool(pool).unwrap();
        registry.begin_command_buffer(pool, 0).unwrap();
    }

    #[test]
    fn resettable_pool_rerecords_executable_buffers() {
        let (mut registry, device) = setup();
        let pool = registry
            .create_command_pool(device, 0, vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .unwrap();
        registry.allocate_command_buffers(pool, 1).unwrap();
        registry.begin_command_buffer(pool, 0).unwrap();
        registry.end_command_buffer(pool, 0).unwrap();
        registry.begin_command_buffer(pool, 0).unwrap();
        assert_eq!(
            registry.command_buffer(pool, 0).unwrap().1,
            CommandBufferState::Recording
        );
    }

    #[test]
    fn pending_buffers_block_reset_and_destroy() {
        let (mut registry, device) = setup();
        let pool = registry
            .create_command_pool(device, 0, vk::CommandPoolCreateFlags::empty())
            .unwrap();
        registry.allocate_command_buffers(pool, 1).unwrap();
        registry.begin_command_buffer(pool, 0).unwrap();
        registry.end_command_buffer(pool, 0).unwrap();
        registry
            .set_command_buffer_state(
                pool,
                0,
                CommandBufferState::Executable,
                CommandBufferState::Pending,
            )
            .unwrap();

        assert!(matches!(
            registry.reset_command_pool(pool),
            Err(GpuError::InvalidPhase { found: "pending", .. })
        ));
        assert!(registry.destroy_command_pool(pool).is_err());

        registry
            .set_command_buffer_state(
                pool,
                0,
                CommandBufferState::Pending,
                CommandBufferState::Executable,
            )
            .unwrap();
        registry.destroy_command_pool(pool).unwrap();
        assert_eq!(registry.backend().live(ObjectKind::CommandPool), 0);
        assert_eq!(registry.devices.refs(device).unwrap(), 0);
    }

    #[test]
    fn pool_needs_an_existing_family() {
        let (mut registry, device) = setup();
        assert!(matches!(
            registry.create_command_pool(device, 42, vk::CommandPoolCreateFlags::empty()),
            Err(GpuError::InvalidParameter(_))
        ));
        assert!(matches!(
            registry.command_buffer(CommandPoolHandle::NULL, 0),
            Err(GpuError::InvalidHandle { .. })
        ));
    }

    #[test]
    fn pool_keeps_its_device_alive() {
        let (mut registry, device) = setup();
        let pool = registry
            .create_command_pool(device, 0, vk::CommandPoolCreateFlags::empty())
            .unwrap();
        assert_eq!(
            registry.destroy_device(device),
            Err(GpuError::StillReferenced {
                kind: "device",
                refs: 1
            })
        );
        registry.destroy_command_pool(pool).unwrap();
        registry.destroy_device(device).unwrap();
        assert_eq!(registry.backend().live(ObjectKind::Device), 0);
    }
}
