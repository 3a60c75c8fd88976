// Vulkan instance and device creation
//
// Responsibilities:
// - Capability queries (instance extensions, layers, device extensions)
// - Instance creation with an optional debug-utils messenger
// - Physical device snapshots
// - Logical device + queue creation

use crate::backend::{DeviceDesc, InstanceDesc, PhysicalDeviceInfo};
use ash::extensions::{ext, khr};
use ash::prelude::VkResult;
use ash::{vk, Entry};
use std::ffi::{c_char, CStr, CString};

const DEBUG_UTILS: &str = "VK_EXT_debug_utils";
const SWAPCHAIN: &str = "VK_KHR_swapchain";

/// Instance plus the loaders that hang off it
pub struct VulkanInstance {
    pub entry: Entry,
    pub instance: ash::Instance,
    pub surface_loader: khr::Surface,
    debug_utils: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

/// Logical device with everything later calls need
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub surface_loader: khr::Surface,
    pub swapchain_loader: Option<khr::Swapchain>,
}

pub(super) fn names_from(props: impl Iterator<Item = [c_char; 256]>) -> Vec<String> {
    props
        .map(|name| {
            // Safety: the driver writes NUL-terminated names into fixed arrays
            unsafe { CStr::from_ptr(name.as_ptr()) }
                .to_string_lossy()
                .into_owned()
        })
        .collect()
}

fn c_strings(names: &[String]) -> VkResult<Vec<CString>> {
    names
        .iter()
        .map(|name| CString::new(name.as_str()).map_err(|_| vk::Result::ERROR_INITIALIZATION_FAILED))
        .collect()
}

pub fn instance_extensions(entry: &Entry) -> VkResult<Vec<String>> {
    let props = unsafe { entry.enumerate_instance_extension_properties(None) }?;
    Ok(names_from(props.into_iter().map(|p| p.extension_name)))
}

pub fn instance_layers(entry: &Entry) -> VkResult<Vec<String>> {
    let props = unsafe { entry.enumerate_instance_layer_properties() }?;
    Ok(names_from(props.into_iter().map(|p| p.layer_name)))
}

pub fn create_instance(entry: &Entry, desc: &InstanceDesc) -> VkResult<VulkanInstance> {
    let app_name = CString::new(desc.app_name.as_str())
        .map_err(|_| vk::Result::ERROR_INITIALIZATION_FAILED)?;
    let engine_name = CString::new(desc.engine_name.as_str())
        .map_err(|_| vk::Result::ERROR_INITIALIZATION_FAILED)?;

    let app_info = vk::ApplicationInfo::builder()
        .application_name(&app_name)
        .application_version(desc.app_version)
        .engine_name(&engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(desc.api_version);

    let extensions = c_strings(&desc.extensions)?;
    let extension_ptrs: Vec<*const c_char> = extensions.iter().map(|s| s.as_ptr()).collect();
    let layers = c_strings(&desc.layers)?;
    let layer_ptrs: Vec<*const c_char> = layers.iter().map(|s| s.as_ptr()).collect();

    let create_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_extension_names(&extension_ptrs)
        .enabled_layer_names(&layer_ptrs);

    let instance = unsafe { entry.create_instance(&create_info, None) }?;

    let debug_utils = if desc.extensions.iter().any(|ext| ext == DEBUG_UTILS) {
        match setup_debug_messenger(entry, &instance) {
            Ok(messenger) => Some(messenger),
            Err(e) => {
                log::warn!("Debug messenger unavailable: {}", e);
                None
            }
        }
    } else {
        None
    };

    let surface_loader = khr::Surface::new(entry, &instance);

    Ok(VulkanInstance {
        entry: entry.clone(),
        instance,
        surface_loader,
        debug_utils,
    })
}

fn setup_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
) -> VkResult<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
    let debug_utils = ext::DebugUtils::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

    Ok((debug_utils, messenger))
}

pub fn destroy_instance(instance: VulkanInstance) {
    unsafe {
        if let Some((debug_utils, messenger)) = instance.debug_utils {
            debug_utils.destroy_debug_utils_messenger(messenger, None);
        }
        instance.instance.destroy_instance(None);
    }
}

pub fn physical_devices(
    instance: &VulkanInstance,
) -> VkResult<Vec<(vk::PhysicalDevice, PhysicalDeviceInfo)>> {
    let devices = unsafe { instance.instance.enumerate_physical_devices() }?;

    devices
        .into_iter()
        .map(|pd| {
            let info = unsafe {
                let extensions = instance.instance.enumerate_device_extension_properties(pd)?;
                PhysicalDeviceInfo {
                    properties: instance.instance.get_physical_device_properties(pd),
                    features: instance.instance.get_physical_device_features(pd),
                    queue_families: instance
                        .instance
                        .get_physical_device_queue_family_properties(pd),
                    memory: instance.instance.get_physical_device_memory_properties(pd),
                    extensions: names_from(extensions.into_iter().map(|p| p.extension_name)),
                }
            };
            log::debug!("Found GPU: {} ({:?})", info.name(), info.properties.device_type);
            Ok((pd, info))
        })
        .collect()
}

pub fn create_device(
    instance: &VulkanInstance,
    physical_device: vk::PhysicalDevice,
    desc: &DeviceDesc,
) -> VkResult<VulkanDevice> {
    let queue_infos: Vec<vk::DeviceQueueCreateInfo> = desc
        .queues
        .iter()
        .map(|queue| {
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(queue.family)
                .queue_priorities(&queue.priorities)
                .build()
        })
        .collect();

    let extensions = c_strings(&desc.extensions)?;
    let extension_ptrs: Vec<*const c_char> = extensions.iter().map(|s| s.as_ptr()).collect();

    // Pipelines are built for dynamic rendering (Vulkan 1.3 core)
    let properties = unsafe {
        instance
            .instance
            .get_physical_device_properties(physical_device)
    };
    let mut vulkan13 = vk::PhysicalDeviceVulkan13Features::builder().dynamic_rendering(true);

    let mut create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extension_ptrs)
        .enabled_features(&desc.features);
    if properties.api_version >= vk::API_VERSION_1_3 {
        create_info = create_info.push_next(&mut vulkan13);
    }

    let device = unsafe {
        instance
            .instance
            .create_device(physical_device, &create_info, None)
    }?;

    let swapchain_loader = desc
        .extensions
        .iter()
        .any(|ext| ext == SWAPCHAIN)
        .then(|| khr::Swapchain::new(&instance.instance, &device));

    Ok(VulkanDevice {
        device,
        physical_device,
        surface_loader: instance.surface_loader.clone(),
        swapchain_loader,
    })
}

pub fn destroy_device(device: VulkanDevice) {
    unsafe { device.device.destroy_device(None) };
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
