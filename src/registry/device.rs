// Device - logical devices and queues
//
// Queue declarations are validated against the physical device before
// anything is created, then merged per family into one device request.
// Queues belong to their device: they are released with it and do not
// count as dependents.

use super::Registry;
use crate::backend::{Backend, DeviceDesc, QueueCreateDesc};
use crate::error::{GpuError, Result};
use crate::handle::*;
use ash::vk;

/// Request for `count` queues of one family
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDecl {
    pub family: u32,
    pub count: u32,
    /// One priority in [0, 1] per queue
    pub priorities: Vec<f32>,
}

impl QueueDecl {
    pub fn new(family: u32, priorities: Vec<f32>) -> Self {
        Self {
            family,
            count: priorities.len() as u32,
            priorities,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogicalDeviceInfo {
    pub queues: Vec<QueueDecl>,
    pub extensions: Vec<String>,
    pub features: vk::PhysicalDeviceFeatures,
}

pub struct DeviceRecord<B: Backend> {
    pub native: B::Device,
    pub physical_device: PhysicalDeviceHandle,
    pub queues: Vec<QueueHandle>,
    pub extensions: Vec<String>,
    pub features: vk::PhysicalDeviceFeatures,
}

pub struct QueueRecord<B: Backend> {
    pub device: DeviceHandle,
    pub family: u32,
    pub index: u32,
    pub priority: f32,
    pub native: B::Queue,
}

/// A new device together with its queues, in declaration order
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceQueues {
    pub device: DeviceHandle,
    pub queues: Vec<QueueHandle>,
}

/// `vk::PhysicalDeviceFeatures` field names, in declaration order
const FEATURE_NAMES: [&str; 55] = [
    "robustBufferAccess",
    "fullDrawIndexUint32",
    "imageCubeArray",
    "independentBlend",
    "geometryShader",
    "tessellationShader",
    "sampleRateShading",
    "dualSrcBlend",
    "logicOp",
    "multiDrawIndirect",
    "drawIndirectFirstInstance",
    "depthClamp",
    "depthBiasClamp",
    "fillModeNonSolid",
    "depthBounds",
    "wideLines",
    "largePoints",
    "alphaToOne",
    "multiViewport",
    "samplerAnisotropy",
    "textureCompressionETC2",
    "textureCompressionASTC_LDR",
    "textureCompressionBC",
    "occlusionQueryPrecise",
    "pipelineStatisticsQuery",
    "vertexPipelineStoresAndAtomics",
    "fragmentStoresAndAtomics",
    "shaderTessellationAndGeometryPointSize",
    "shaderImageGatherExtended",
    "shaderStorageImageExtendedFormats",
    "shaderStorageImageMultisample",
    "shaderStorageImageReadWithoutFormat",
    "shaderStorageImageWriteWithoutFormat",
    "shaderUniformBufferArrayDynamicIndexing",
    "shaderSampledImageArrayDynamicIndexing",
    "shaderStorageBufferArrayDynamicIndexing",
    "shaderStorageImageArrayDynamicIndexing",
    "shaderClipDistance",
    "shaderCullDistance",
    "shaderFloat64",
    "shaderInt64",
    "shaderInt16",
    "shaderResourceResidency",
    "shaderResourceMinLod",
    "sparseBinding",
    "sparseResidencyBuffer",
    "sparseResidencyImage2D",
    "sparseResidencyImage3D",
    "sparseResidency2Samples",
    "sparseResidency4Samples",
    "sparseResidency8Samples",
    "sparseResidency16Samples",
    "sparseResidencyAliased",
    "variableMultisampleRate",
    "inheritedQueries",
];

fn feature_flags(features: &vk::PhysicalDeviceFeatures) -> &[vk::Bool32] {
    // SAFETY: the struct is #[repr(C)] and consists solely of Bool32 fields
    unsafe {
        std::slice::from_raw_parts(
            (features as *const vk::PhysicalDeviceFeatures).cast::<vk::Bool32>(),
            std::mem::size_of::<vk::PhysicalDeviceFeatures>() / std::mem::size_of::<vk::Bool32>(),
        )
    }
}

/// Names of requested features the device does not offer
fn unsupported_features(
    requested: &vk::PhysicalDeviceFeatures,
    available: &vk::PhysicalDeviceFeatures,
) -> Vec<&'static str> {
    feature_flags(requested)
        .iter()
        .zip(feature_flags(available))
        .zip(FEATURE_NAMES)
        .filter(|((wanted, offered), _)| **wanted != vk::FALSE && **offered == vk::FALSE)
        .map(|(_, name)| name)
        .collect()
}

/// Check declarations and merge them per family, keeping first-seen order
fn merge_queue_decls(
    decls: &[QueueDecl],
    families: &[vk::QueueFamilyProperties],
) -> Result<Vec<QueueCreateDesc>> {
    let mut merged: Vec<QueueCreateDesc> = Vec::new();

    for decl in decls {
        if decl.count == 0 {
            return Err(GpuError::InvalidParameter(format!(
                "queue family {}: queue count must be at least 1",
                decl.family
            )));
        }
        if decl.priorities.len() != decl.count as usize {
            return Err(GpuError::PriorityCountMismatch {
                family: decl.family,
                count: decl.count,
                priorities: decl.priorities.len(),
            });
        }
        if let Some(&value) = decl.priorities.iter().find(|p| !(0.0..=1.0).contains(*p)) {
            return Err(GpuError::InvalidPriority {
                family: decl.family,
                value,
            });
        }

        match merged.iter_mut().find(|queue| queue.family == decl.family) {
            Some(queue) => queue.priorities.extend_from_slice(&decl.priorities),
            None => merged.push(QueueCreateDesc {
                family: decl.family,
                priorities: decl.priorities.clone(),
            }),
        }
    }

    for queue in &merged {
        // Unknown families have no capacity at all
        let available = families
            .get(queue.family as usize)
            .map_or(0, |family| family.queue_count);
        let requested = queue.priorities.len() as u32;
        if requested > available {
            return Err(GpuError::QueueFamilyExhausted {
                family: queue.family,
                requested,
                available,
            });
        }
    }

    Ok(merged)
}

impl<B: Backend> Registry<B> {
    /// Create a logical device and its queues on `physical_device`
    pub fn init_queues(
        &mut self,
        info: &LogicalDeviceInfo,
        physical_device: PhysicalDeviceHandle,
    ) -> Result<DeviceQueues> {
        let instance = self.require_instance()?;
        let physical = self.physical_devices.resolve(physical_device)?;
        if info.queues.is_empty() {
            return Err(GpuError::InvalidParameter(
                "a device needs at least one queue".into(),
            ));
        }

        let merged = merge_queue_decls(&info.queues, &physical.info.queue_families)?;

        let unsupported: Vec<String> = info
            .extensions
            .iter()
            .filter(|ext| !physical.info.extensions.contains(*ext))
            .cloned()
            .collect();
        if !unsupported.is_empty() {
            return Err(GpuError::UnsupportedExtension(unsupported));
        }

        let unsupported = unsupported_features(&info.features, &physical.info.features);
        if !unsupported.is_empty() {
            return Err(GpuError::UnsupportedFeature(unsupported));
        }

        let queue_count: usize = merged.iter().map(|queue| queue.priorities.len()).sum();
        self.devices.reserve(1)?;
        self.queues.reserve(queue_count)?;

        let desc = DeviceDesc {
            queues: merged,
            extensions: info.extensions.clone(),
            features: info.features,
        };
        let native_physical = physical.native;
        let native = {
            let instance = &self.instances.resolve(instance)?.native;
            self.backend
                .create_device(instance, native_physical, &desc)
                .map_err(|e| self.frames.backend_err(e))?
        };

        let mut queues = Vec::with_capacity(queue_count);
        for queue in &desc.queues {
            for (index, &priority) in queue.priorities.iter().enumerate() {
                let index = index as u32;
                let native_queue = self.backend.get_queue(&native, queue.family, index);
                queues.push((queue.family, index, priority, native_queue));
            }
        }

        let device = self.devices.allocate(DeviceRecord {
            native,
            physical_device,
            queues: Vec::with_capacity(queue_count),
            extensions: desc.extensions.clone(),
            features: desc.features,
        })?;

        let mut handles = Vec::with_capacity(queue_count);
        for (family, index, priority, native) in queues {
            handles.push(self.queues.allocate(QueueRecord {
                device,
                family,
                index,
                priority,
                native,
            })?);
        }
        self.devices.resolve_mut(device)?.queues = handles.clone();

        log::info!(
            "Logical device {:?} created with {} queue(s) on {}",
            device,
            handles.len(),
            self.physical_devices.resolve(physical_device)?.info.name()
        );

        Ok(DeviceQueues {
            device,
            queues: handles,
        })
    }

    /// Destroy a device and its queues once nothing is built on it
    pub fn destroy_device(&mut self, device: DeviceHandle) -> Result<()> {
        let record = self.devices.release(device)?;
        for queue in &record.queues {
            self.queues.release(*queue)?;
        }
        self.backend.destroy_device(record.native);
        log::info!("Destroyed {:?}", device);
        Ok(())
    }

    pub fn device(&self, device: DeviceHandle) -> Result<&DeviceRecord<B>> {
        self.devices.resolve(device)
    }

    pub fn queue(&self, queue: QueueHandle) -> Result<&QueueRecord<B>> {
        self.queues.resolve(queue)
    }

    /// Block until the device finished all submitted work
    pub fn wait_idle(&mut self, device: DeviceHandle) -> Result<()> {
        let device = &self.devices.resolve(device)?.native;
        self.backend
            .device_wait_idle(device)
            .map_err(|e| self.frames.backend_err(e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::ObjectKind;
    use crate::backend::HeadlessBackend;

    fn initialized() -> (Registry<HeadlessBackend>, PhysicalDeviceHandle) {
        let mut registry = Registry::new(HeadlessBackend::default());
        registry.default_init().unwrap();
        let physical = registry.preferred_physical_device().unwrap();
        (registry, physical)
    }

    fn info(queues: Vec<QueueDecl>) -> LogicalDeviceInfo {
        LogicalDeviceInfo {
            queues,
            ..LogicalDeviceInfo::default()
        }
    }

    #[test]
    fn one_queue_per_granted_index() {
        let (mut registry, physical) = initialized();
        let created = registry
            .init_queues(
                &info(vec![QueueDecl::new(0, vec![1.0, 0.5]), QueueDecl::new(1, vec![1.0])]),
                physical,
            )
            .unwrap();

        assert_eq!(created.queues.len(), 3);
        let second = registry.queue(created.queues[1]).unwrap();
        assert_eq!((second.family, second.index, second.priority), (0, 1, 0.5));
        assert_eq!(registry.device(created.device).unwrap().queues, created.queues);
    }

    #[test]
    fn same_family_declarations_are_merged() {
        let families = [vk::QueueFamilyProperties {
            queue_count: 2,
            ..Default::default()
        }];
        let merged = merge_queue_decls(
            &[QueueDecl::new(0, vec![1.0]), QueueDecl::new(0, vec![0.25])],
            &families,
        )
        .unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].priorities, vec![1.0, 0.25]);
    }

    #[test]
    fn exhausted_family_leaves_no_device() {
        let (mut registry, physical) = initialized();
        // Family 0 offers two queues; 2 + 1 across declarations is too many
        let result = registry.init_queues(
            &info(vec![QueueDecl::new(0, vec![1.0, 1.0]), QueueDecl::new(0, vec![1.0])]),
            physical,
        );
        assert_eq!(
            result,
            Err(GpuError::QueueFamilyExhausted {
                family: 0,
                requested: 3,
                available: 2
            })
        );
        assert_eq!(registry.backend().live(ObjectKind::Device), 0);
        assert!(registry.devices.is_empty());
        assert!(registry.queues.is_empty());
    }

    #[test]
    fn empty_queue_list_is_rejected() {
        let (mut registry, physical) = initialized();
        let result = registry.init_queues(&info(Vec::new()), physical);
        assert!(matches!(result, Err(GpuError::InvalidParameter(_))));
        assert_eq!(registry.backend().live(ObjectKind::Device), 0);
        assert!(registry.devices.is_empty());
    }

    #[test]
    fn unknown_family_is_exhausted() {
        let (mut registry, physical) = initialized();
        let result = registry.init_queues(&info(vec![QueueDecl::new(7, vec![1.0])]), physical);
        assert!(matches!(
            result,
            Err(GpuError::QueueFamilyExhausted { family: 7, available: 0, .. })
        ));
    }

    #[test]
    fn priorities_are_validated() {
        let (mut registry, physical) = initialized();

        let mismatched = QueueDecl {
            family: 0,
            count: 2,
            priorities: vec![1.0],
        };
        assert_eq!(
            registry.init_queues(&info(vec![mismatched]), physical),
            Err(GpuError::PriorityCountMismatch {
                family: 0,
                count: 2,
                priorities: 1
            })
        );

        assert_eq!(
            registry.init_queues(&info(vec![QueueDecl::new(0, vec![1.5])]), physical),
            Err(GpuError::InvalidPriority {
                family: 0,
                value: 1.5
            })
        );

        let empty = QueueDecl::new(0, Vec::new());
        assert!(matches!(
            registry.init_queues(&info(vec![empty]), physical),
            Err(GpuError::InvalidParameter(_))
        ));
    }

    #[test]
    fn extensions_and_features_fail_fast() {
        let (mut registry, physical) = initialized();

        let mut request = info(vec![QueueDecl::new(0, vec![1.0])]);
        request.extensions = vec!["VK_KHR_ray_query".to_string()];
        assert_eq!(
            registry.init_queues(&request, physical),
            Err(GpuError::UnsupportedExtension(vec!["VK_KHR_ray_query".into()]))
        );

        let mut request = info(vec![QueueDecl::new(0, vec![1.0])]);
        request.features.geometry_shader = vk::TRUE;
        request.features.wide_lines = vk::TRUE;
        assert_eq!(
            registry.init_queues(&request, physical),
            Err(GpuError::UnsupportedFeature(vec!["geometryShader"]))
        );
        assert_eq!(registry.backend().live(ObjectKind::Device), 0);
    }

    #[test]
    fn destroy_device_releases_queues() {
        let (mut registry, physical) = initialized();
        let created = registry
            .init_queues(&info(vec![QueueDecl::new(0, vec![1.0])]), physical)
            .unwrap();

        registry.destroy_device(created.device).unwrap();
        assert!(registry.queue(created.queues[0]).is_err());
        assert!(registry.device(created.device).is_err());
        assert_eq!(registry.backend().live(ObjectKind::Device), 0);
    }

    #[test]
    fn uninitialized_registry_rejects_devices() {
        let mut registry = Registry::new(HeadlessBackend::default());
        assert_eq!(
            registry.init_queues(&info(vec![]), PhysicalDeviceHandle::NULL),
            Err(GpuError::NotInitialized)
        );
    }
}
