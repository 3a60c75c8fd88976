// Shared registry - phase lock for readers on other threads
//
// The update thread owns all mutation through `update`. Other threads may
// look at records through `inspect`, which only succeeds while no frame
// slot is recording or in flight.

use super::Registry;
use crate::backend::Backend;
use crate::error::{GpuError, Result};
use parking_lot::RwLock;
use std::sync::Arc;

pub struct SharedRegistry<B: Backend> {
    inner: Arc<RwLock<Registry<B>>>,
}

impl<B: Backend> Clone for SharedRegistry<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> SharedRegistry<B> {
    pub fn new(registry: Registry<B>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(registry)),
        }
    }

    /// Read access during the quiescent window
    pub fn inspect<R>(&self, f: impl FnOnce(&Registry<B>) -> R) -> Result<R> {
        let registry = self.inner.read();
        if !registry.is_quiescent() {
            return Err(GpuError::NotQuiescent);
        }
        Ok(f(&registry))
    }

    /// Like `inspect`, but fails instead of waiting for the update thread
    pub fn try_inspect<R>(&self, f: impl FnOnce(&Registry<B>) -> R) -> Result<R> {
        let registry = self.inner.try_read().ok_or(GpuError::NotQuiescent)?;
        if !registry.is_quiescent() {
            return Err(GpuError::NotQuiescent);
        }
        Ok(f(&registry))
    }

    /// Exclusive access for the thread driving the frame cycle
    pub fn update<R>(&self, f: impl FnOnce(&mut Registry<B>) -> R) -> R {
        let mut registry = self.inner.write();
        f(&mut registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::registry::{LogicalDeviceInfo, QueueDecl};
    use std::thread;
    use std::time::Duration;

    fn shared() -> SharedRegistry<HeadlessBackend> {
        let mut registry = Registry::new(HeadlessBackend::default());
        registry.default_init().unwrap();
        let physical = registry.preferred_physical_device().unwrap();
        let info = LogicalDeviceInfo {
            queues: vec![QueueDecl::new(0, vec![1.0])],
            ..LogicalDeviceInfo::default()
        };
        let queues = registry.init_queues(&info, physical).unwrap();
        registry.init_frames(queues.device, queues.queues[0]).unwrap();
        SharedRegistry::new(registry)
    }

    #[test]
    fn readers_are_refused_while_a_frame_is_in_flight() {
        let shared = shared();
        let reader = shared.clone();
        let devices = thread::spawn(move || reader.inspect(|r| r.physical_devices().len()))
            .join()
            .unwrap();
        assert_eq!(devices, Ok(1));

        shared.update(|registry| {
            registry.pre_update().unwrap();
            registry.do_update(|_| Ok(())).unwrap();
            registry.post_update().unwrap();
            registry.async_dispatch().unwrap();
        });

        let reader = shared.clone();
        let refused = thread::spawn(move || reader.inspect(|r| r.is_initialized()))
            .join()
            .unwrap();
        assert_eq!(refused, Err(GpuError::NotQuiescent));

        shared
            .update(|registry| registry.async_gather(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(shared.try_inspect(|r| r.is_initialized()), Ok(true));
    }
}
