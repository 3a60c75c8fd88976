// Swapchains - surfaces come from a host-supplied provider
//
// The registry never talks to a window system. The host registers a
// surface provider once; `create_swapchain` asks it for the surface of a
// window index and owns that surface from then on. Recreation keeps the
// handle stable and bumps `generation`.

use super::{Registry, Retired};
use crate::backend::{Backend, SwapchainDesc, SwapchainInfo};
use crate::error::{GpuError, Result};
use crate::handle::*;
use ash::prelude::VkResult;
use ash::vk;

/// Creates the presentation surface for a window
pub trait SurfaceProvider<B: Backend> {
    fn surface(&mut self, instance: &B::Instance, window_index: u16) -> VkResult<B::Surface>;
}

impl<B, F> SurfaceProvider<B> for F
where
    B: Backend,
    F: FnMut(&B::Instance, u16) -> VkResult<B::Surface>,
{
    fn surface(&mut self, instance: &B::Instance, window_index: u16) -> VkResult<B::Surface> {
        self(instance, window_index)
    }
}

pub struct SwapchainRecord<B: Backend> {
    pub device: DeviceHandle,
    pub window_index: u16,
    pub desc: SwapchainDesc,
    pub info: SwapchainInfo,
    pub surface: B::Surface,
    pub native: B::Swapchain,
    /// Bumped by every successful recreation
    pub generation: u32,
    /// Window changed; present and record against it fail until recreated
    pub out_of_date: bool,
}

impl<B: Backend> Registry<B> {
    /// Register the surface provider, replacing any previous one
    pub fn provide_surface(&mut self, provider: Box<dyn SurfaceProvider<B> + Send + Sync>) {
        self.surface_provider = Some(provider);
    }

    /// Register a closure as surface provider
    pub fn provide_surface_fun<F>(&mut self, provider: F)
    where
        F: FnMut(&B::Instance, u16) -> VkResult<B::Surface> + Send + Sync + 'static,
        B: 'static,
    {
        self.provide_surface(Box::new(provider));
    }

    pub fn has_surface_provider(&self) -> bool {
        self.surface_provider.is_some()
    }

    pub fn create_swapchain(
        &mut self,
        desc: &SwapchainDesc,
        window_index: u16,
        device: DeviceHandle,
    ) -> Result<SwapchainHandle> {
        if self.surface_provider.is_none() {
            return Err(GpuError::NoSurfaceProvider);
        }
        let instance = self.require_instance()?;
        self.swapchains.reserve(1)?;

        let instance = &self.instances.resolve(instance)?.native;
        let device_native = &self.devices.resolve(device)?.native;
        let provider = self
            .surface_provider
            .as_mut()
            .ok_or(GpuError::NoSurfaceProvider)?;
        let surface = provider
            .surface(instance, window_index)
            .map_err(|e| self.frames.backend_err(e))?;
        let (native, info) = match self
            .backend
            .create_swapchain(device_native, &surface, desc, None)
        {
            Ok(created) => created,
            Err(e) => {
                self.backend.destroy_surface(instance, surface);
                log::error!("Swapchain for window {} failed: {}", window_index, e);
                return Err(self.frames.backend_err(e));
            }
        };

        let handle = self.swapchains.allocate(SwapchainRecord {
            device,
            window_index,
            desc: *desc,
            info,
            surface,
            native,
            generation: 0,
            out_of_date: false,
        })?;
        self.devices.retain(device)?;

        log::info!(
            "Swapchain created: {}x{}, {:?}, {} images",
            info.extent.width,
            info.extent.height,
            info.format,
            info.image_count
        );
        Ok(handle)
    }

    pub fn swapchain(&self, swapchain: SwapchainHandle) -> Result<&SwapchainRecord<B>> {
        self.swapchains.resolve(swapchain)
    }

    /// Mark a swapchain as needing recreation (window resized or lost)
    pub fn invalidate_swapchain(&mut self, swapchain: SwapchainHandle) -> Result<()> {
        self.swapchains.resolve_mut(swapchain)?.out_of_date = true;
        log::debug!("{:?} marked out of date", swapchain);
        Ok(())
    }

    /// Rebuild a swapchain for a new extent under the same handle.
    ///
    /// The previous native swapchain is retired until in-flight frames are
    /// gathered. On failure the record stays out of date.
    pub fn recreate_swapchain(
        &mut self,
        swapchain: SwapchainHandle,
        extent: vk::Extent2D,
    ) -> Result<()> {
        let record = self.swapchains.resolve(swapchain)?;
        let device = record.device;
        let desc = SwapchainDesc {
            extent,
            ..record.desc
        };
        let device_native = &self.devices.resolve(device)?.native;

        let created =
            self.backend
                .create_swapchain(device_native, &record.surface, &desc, Some(&record.native));
        let (native, info) = match created {
            Ok(created) => created,
            Err(e) => {
                self.swapchains.resolve_mut(swapchain)?.out_of_date = true;
                log::warn!("Recreating {:?} failed: {}", swapchain, e);
                return Err(self.frames.backend_err(e));
            }
        };

        let record = self.swapchains.resolve_mut(swapchain)?;
        let old = std::mem::replace(&mut record.native, native);
        record.desc = desc;
        record.info = info;
        record.generation += 1;
        record.out_of_date = false;
        let generation = record.generation;
        self.retire(
            device,
            Retired::Swapchain {
                swapchain,
                native: old,
            },
        )?;

        log::info!(
            "Swapchain recreated: {}x{} (generation {})",
            extent.width,
            extent.height,
            generation
        );
        Ok(())
    }

    /// Destroy a swapchain and its surface.
    ///
    /// If natives replaced by `recreate_swapchain` are still waiting for a
    /// gather, the surface is retired behind them instead.
    pub fn destroy_swapchain(&mut self, swapchain: SwapchainHandle) -> Result<()> {
        let record = self.swapchains.release(swapchain)?;
        self.collect_retired();

        let device = &self.devices.resolve(record.device)?.native;
        self.backend.destroy_swapchain(device, record.native);

        let waiting = self
            .retired
            .iter()
            .filter(|retired| {
                matches!(retired.object, Retired::Swapchain { swapchain: owner, .. } if owner == swapchain)
            })
            .map(|retired| retired.serial)
            .max();
        match waiting {
            Some(serial) => {
                log::debug!("Surface of {:?} retired until serial {}", swapchain, serial);
                self.retire_at(record.device, serial, Retired::Surface(record.surface))?;
            }
            None => {
                let instance = &self.instances.resolve(self.instance)?.native;
                self.backend.destroy_surface(instance, record.surface);
            }
        }
        self.devices.unretain(record.device)?;

        log::debug!("Destroyed {:?}", swapchain);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{FailPoint, HeadlessInstance, ObjectKind};
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

    fn with_provider(registry: &mut Registry<HeadlessBackend>) {
        registry.provide_surface_fun(|instance: &HeadlessInstance, window_index| {
            Ok(instance.create_surface(window_index))
        });
    }

    #[test]
    fn no_provider_fails_first() {
        let mut registry = Registry::new(HeadlessBackend::default());
        assert_eq!(
            registry.create_swapchain(&SwapchainDesc::default(), 0, DeviceHandle::NULL),
            Err(GpuError::NoSurfaceProvider)
        );
    }

    #[test]
    fn swapchain_owns_its_surface() {
        let (mut registry, device) = setup();
        with_provider(&mut registry);
        let swapchain = registry
            .create_swapchain(&SwapchainDesc::default(), 3, device)
            .unwrap();

        let record = registry.swapchain(swapchain).unwrap();
        assert_eq!(record.window_index, 3);
        assert_eq!(record.surface.window_index, 3);
        assert_eq!(record.info.image_count, 3);
        assert_eq!(registry.backend().live(ObjectKind::Surface), 1);

        registry.destroy_swapchain(swapchain).unwrap();
        assert_eq!(registry.backend().live(ObjectKind::Surface), 0);
        assert_eq!(registry.backend().live(ObjectKind::Swapchain), 0);
        assert_eq!(registry.devices.refs(device).unwrap(), 0);
    }

    #[test]
    fn failed_creation_returns_the_surface() {
        let (mut registry, device) = setup();
        with_provider(&mut registry);
        registry
            .backend_mut()
            .fail_next(FailPoint::CreateSwapchain, vk::Result::ERROR_SURFACE_LOST_KHR);
        assert_eq!(
            registry.create_swapchain(&SwapchainDesc::default(), 0, device),
            Err(GpuError::Backend(vk::Result::ERROR_SURFACE_LOST_KHR))
        );
        assert_eq!(registry.backend().live(ObjectKind::Surface), 0);
    }

    #[test]
    fn recreation_keeps_the_handle() {
        let (mut registry, device) = setup();
        with_provider(&mut registry);
        let swapchain = registry
            .create_swapchain(&SwapchainDesc::default(), 0, device)
            .unwrap();

        registry.invalidate_swapchain(swapchain).unwrap();
        assert!(registry.swapchain(swapchain).unwrap().out_of_date);

        let extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        registry.recreate_swapchain(swapchain, extent).unwrap();
        let record = registry.swapchain(swapchain).unwrap();
        assert_eq!(record.generation, 1);
        assert_eq!(record.info.extent, extent);
        assert!(!record.out_of_date);
        assert_eq!(registry.backend().live(ObjectKind::Swapchain), 1);
    }

    #[test]
    fn failed_recreation_stays_out_of_date() {
        let (mut registry, device) = setup();
        with_provider(&mut registry);
        let swapchain = registry
            .create_swapchain(&SwapchainDesc::default(), 0, device)
            .unwrap();

        // Minimized window
        let zero = vk::Extent2D {
            width: 0,
            height: 0,
        };
        assert!(registry.recreate_swapchain(swapchain, zero).is_err());
        let record = registry.swapchain(swapchain).unwrap();
        assert!(record.out_of_date);
        assert_eq!(record.generation, 0);
    }
}
