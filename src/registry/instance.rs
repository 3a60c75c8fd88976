// Instance - capability checks, instance creation, physical devices
//
// `default_init` is the opinionated path (surface + debug extensions and
// the validation layer when available). `init_instance` is strict: every
// requested name must be available, checked before anything is created.

use super::Registry;
use crate::backend::{Backend, InstanceDesc, PhysicalDeviceInfo};
use crate::error::{GpuError, Result};
use crate::handle::*;
use ash::vk;

const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";
const DEBUG_UTILS: &str = "VK_EXT_debug_utils";

/// Surface extensions requested by `default_init` when the loader has them
const SURFACE_EXTENSIONS: &[&str] = &[
    "VK_KHR_surface",
    "VK_KHR_win32_surface",
    "VK_KHR_xlib_surface",
    "VK_KHR_xcb_surface",
    "VK_KHR_wayland_surface",
    "VK_EXT_metal_surface",
];

pub struct InstanceRecord<B: Backend> {
    pub native: B::Instance,
    pub desc: InstanceDesc,
    /// Everything the loader reported at creation time
    pub available_extensions: Vec<String>,
}

pub struct PhysicalDeviceRecord<B: Backend> {
    pub native: B::PhysicalDevice,
    pub info: PhysicalDeviceInfo,
}

fn missing(requested: &[String], available: &[String]) -> Vec<String> {
    requested
        .iter()
        .filter(|name| !available.contains(*name))
        .cloned()
        .collect()
}

fn device_type_score(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 3,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
        _ => 0,
    }
}

impl<B: Backend> Registry<B> {
    /// Create the instance with sensible defaults
    pub fn default_init(&mut self) -> Result<InstanceHandle> {
        if self.is_initialized() {
            return Err(GpuError::AlreadyInitialized);
        }

        let available_extensions = self.backend.instance_extensions()?;
        let available_layers = self.backend.instance_layers()?;

        let validation = cfg!(debug_assertions) && self.config.instance.validation_layers;

        let mut extensions: Vec<String> = SURFACE_EXTENSIONS
            .iter()
            .copied()
            .chain(validation.then_some(DEBUG_UTILS))
            .filter(|name| available_extensions.iter().any(|ext| ext.as_str() == *name))
            .map(String::from)
            .collect();

        let mut layers = Vec::new();
        if validation {
            if available_layers.iter().any(|layer| layer == VALIDATION_LAYER) {
                layers.push(VALIDATION_LAYER.to_string());
                log::info!("Validation layers enabled");
            } else {
                log::warn!("Validation layers requested but not available");
            }
        }

        // Names from config are required, not preferred
        for name in &self.config.instance.extensions {
            if !extensions.contains(name) {
                extensions.push(name.clone());
            }
        }
        for name in &self.config.instance.layers {
            if !layers.contains(name) {
                layers.push(name.clone());
            }
        }

        let desc = InstanceDesc {
            app_name: self.config.app.name.clone(),
            app_version: self.config.app_version(),
            extensions,
            layers,
            ..InstanceDesc::default()
        };
        self.init_instance(&desc)
    }

    /// Create the instance exactly as described
    pub fn init_instance(&mut self, desc: &InstanceDesc) -> Result<InstanceHandle> {
        if self.is_initialized() {
            return Err(GpuError::AlreadyInitialized);
        }

        let available_extensions = self.backend.instance_extensions()?;
        let unsupported = missing(&desc.extensions, &available_extensions);
        if !unsupported.is_empty() {
            return Err(GpuError::UnsupportedExtension(unsupported));
        }

        let available_layers = self.backend.instance_layers()?;
        let unsupported = missing(&desc.layers, &available_layers);
        if !unsupported.is_empty() {
            return Err(GpuError::UnsupportedLayer(unsupported));
        }

        self.instances.reserve(1)?;

        let native = self.backend.create_instance(desc)?;

        let physical = match self.backend.physical_devices(&native) {
            Ok(physical) => physical,
            Err(e) => {
                self.backend.destroy_instance(native);
                return Err(e.into());
            }
        };
        if let Err(e) = self.physical_devices.reserve(physical.len()) {
            self.backend.destroy_instance(native);
            return Err(e);
        }

        let handle = self.instances.allocate(InstanceRecord {
            native,
            desc: desc.clone(),
            available_extensions,
        })?;
        self.instance = handle;

        for (native, info) in physical {
            log::info!(
                "Found GPU: {} ({:?})",
                info.name(),
                info.properties.device_type
            );
            self.physical_devices
                .allocate(PhysicalDeviceRecord { native, info })?;
        }

        log::info!(
            "Instance created: {} extension(s), {} layer(s)",
            desc.extensions.len(),
            desc.layers.len()
        );
        Ok(handle)
    }

    pub fn instance(&self) -> Result<&InstanceRecord<B>> {
        let handle = self.require_instance()?;
        self.instances.resolve(handle)
    }

    pub fn physical_devices(&self) -> Vec<PhysicalDeviceHandle> {
        self.physical_devices.handles()
    }

    pub fn physical_device(&self, handle: PhysicalDeviceHandle) -> Result<&PhysicalDeviceInfo> {
        self.physical_devices.resolve(handle).map(|record| &record.info)
    }

    /// Discrete beats integrated beats everything else; first found wins ties
    pub fn preferred_physical_device(&self) -> Option<PhysicalDeviceHandle> {
        let mut best: Option<(u32, PhysicalDeviceHandle)> = None;
        for (handle, record) in self.physical_devices.iter() {
            let score = device_type_score(record.info.properties.device_type);
            if best.map_or(true, |(best_score, _)| score > best_score) {
                best = Some((score, handle));
            }
        }
        best.map(|(_, handle)| handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessConfig, ObjectKind};
    use crate::backend::HeadlessBackend;

    fn registry_with(config: HeadlessConfig) -> Registry<HeadlessBackend> {
        Registry::new(HeadlessBackend::new(config))
    }

    #[test]
    fn default_init_enables_available_surface_extensions() {
        let mut registry = registry_with(HeadlessConfig::default());
        registry.default_init().unwrap();

        let instance = registry.instance().unwrap();
        assert!(instance.desc.extensions.contains(&"VK_KHR_surface".to_string()));
        // Not offered by the headless loader, so silently skipped
        assert!(!instance.desc.extensions.contains(&"VK_EXT_metal_surface".to_string()));
        assert_eq!(registry.physical_devices().len(), 1);
    }

    #[test]
    fn second_init_fails() {
        let mut registry = registry_with(HeadlessConfig::default());
        registry.default_init().unwrap();
        assert_eq!(registry.default_init(), Err(GpuError::AlreadyInitialized));
        assert_eq!(
            registry.init_instance(&InstanceDesc::default()),
            Err(GpuError::AlreadyInitialized)
        );
    }

    #[test]
    fn unknown_extension_fails_fast() {
        let mut registry = registry_with(HeadlessConfig::default());
        let desc = InstanceDesc {
            extensions: vec!["VK_KHR_surface".into(), "VK_KHR_imaginary".into()],
            ..InstanceDesc::default()
        };
        assert_eq!(
            registry.init_instance(&desc),
            Err(GpuError::UnsupportedExtension(vec!["VK_KHR_imaginary".into()]))
        );
        assert!(!registry.is_initialized());
        assert_eq!(registry.backend().live(ObjectKind::Instance), 0);
    }

    #[test]
    fn unknown_layer_fails_fast() {
        let mut registry = registry_with(HeadlessConfig::default());
        let desc = InstanceDesc {
            layers: vec!["VK_LAYER_missing".into()],
            ..InstanceDesc::default()
        };
        assert_eq!(
            registry.init_instance(&desc),
            Err(GpuError::UnsupportedLayer(vec!["VK_LAYER_missing".into()]))
        );
        assert!(!registry.is_initialized());
    }

    #[test]
    fn discrete_gpu_is_preferred() {
        let mut integrated = HeadlessConfig::discrete_gpu();
        integrated.properties.device_type = vk::PhysicalDeviceType::INTEGRATED_GPU;
        let config = HeadlessConfig {
            devices: vec![integrated, HeadlessConfig::discrete_gpu()],
            ..HeadlessConfig::default()
        };

        let mut registry = registry_with(config);
        assert_eq!(registry.preferred_physical_device(), None);
        registry.default_init().unwrap();

        let preferred = registry.preferred_physical_device().unwrap();
        assert_eq!(
            registry.physical_device(preferred).unwrap().properties.device_type,
            vk::PhysicalDeviceType::DISCRETE_GPU
        );
    }

    #[test]
    fn close_allows_reinit() {
        let mut registry = registry_with(HeadlessConfig::default());
        let first = registry.default_init().unwrap();
        registry.close().unwrap();
        assert!(!registry.is_initialized());
        assert_eq!(registry.backend().live_total(), 0);

        let second = registry.default_init().unwrap();
        assert_ne!(first, second);
    }
}
