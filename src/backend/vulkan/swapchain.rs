// Swapchain - window presentation
//
// Manages the chain of images presented to a surface. Recreation passes
// the previous swapchain as `old_swapchain` so the driver can recycle it.

use super::VulkanDevice;
use crate::backend::{SwapchainDesc, SwapchainInfo};
use ash::prelude::VkResult;
use ash::vk;

pub struct VulkanSwapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

pub fn create(
    device: &VulkanDevice,
    surface: vk::SurfaceKHR,
    desc: &SwapchainDesc,
    old: Option<&VulkanSwapchain>,
) -> VkResult<(VulkanSwapchain, SwapchainInfo)> {
    let swapchain_loader = device
        .swapchain_loader
        .as_ref()
        .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)?;
    let surface_loader = &device.surface_loader;

    // Query surface capabilities
    let surface_caps = unsafe {
        surface_loader.get_physical_device_surface_capabilities(device.physical_device, surface)
    }?;

    // Query supported formats
    let formats = unsafe {
        surface_loader.get_physical_device_surface_formats(device.physical_device, surface)
    }?;

    // Query supported present modes
    let present_modes = unsafe {
        surface_loader.get_physical_device_surface_present_modes(device.physical_device, surface)
    }?;

    // Choose surface format (prefer the requested one in SRGB nonlinear)
    let surface_format = formats
        .iter()
        .find(|f| {
            f.format == desc.preferred_format
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
        .ok_or(vk::Result::ERROR_FORMAT_NOT_SUPPORTED)?;

    // FIFO is always supported
    let present_mode = present_modes
        .iter()
        .copied()
        .find(|&mode| mode == desc.present_mode)
        .unwrap_or(vk::PresentModeKHR::FIFO);

    log::debug!("Present mode: {:?}", present_mode);

    // Choose extent
    let extent = if surface_caps.current_extent.width != u32::MAX {
        surface_caps.current_extent
    } else {
        vk::Extent2D {
            width: desc.extent.width.clamp(
                surface_caps.min_image_extent.width,
                surface_caps.max_image_extent.width,
            ),
            height: desc.extent.height.clamp(
                surface_caps.min_image_extent.height,
                surface_caps.max_image_extent.height,
            ),
        }
    };

    let mut image_count = desc.min_image_count.max(surface_caps.min_image_count);
    if surface_caps.max_image_count > 0 && image_count > surface_caps.max_image_count {
        image_count = surface_caps.max_image_count;
    }

    let create_info = vk::SwapchainCreateInfoKHR::builder()
        .surface(surface)
        .min_image_count(image_count)
        .image_format(surface_format.format)
        .image_color_space(surface_format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(desc.usage)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(surface_caps.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true)
        .old_swapchain(old.map_or(vk::SwapchainKHR::null(), |old| old.swapchain));

    let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }?;

    let images = match unsafe { swapchain_loader.get_swapchain_images(swapchain) } {
        Ok(images) => images,
        Err(e) => {
            unsafe { swapchain_loader.destroy_swapchain(swapchain, None) };
            return Err(e);
        }
    };

    // Create image views, undoing the partial set on failure
    let mut image_views = Vec::with_capacity(images.len());
    for &image in &images {
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(surface_format.format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        match unsafe { device.device.create_image_view(&view_info, None) } {
            Ok(view) => image_views.push(view),
            Err(e) => {
                unsafe {
                    for view in image_views {
                        device.device.destroy_image_view(view, None);
                    }
                    swapchain_loader.destroy_swapchain(swapchain, None);
                }
                return Err(e);
            }
        }
    }

    log::info!(
        "Created swapchain {}x{} with {} images",
        extent.width,
        extent.height,
        images.len()
    );

    let info = SwapchainInfo {
        format: surface_format.format,
        extent,
        image_count: images.len() as u32,
    };

    Ok((
        VulkanSwapchain {
            swapchain,
            images,
            image_views,
            format: surface_format.format,
            extent,
        },
        info,
    ))
}

pub fn destroy(device: &VulkanDevice, swapchain: VulkanSwapchain) {
    unsafe {
        for view in swapchain.image_views {
            device.device.destroy_image_view(view, None);
        }
        if let Some(loader) = &device.swapchain_loader {
            loader.destroy_swapchain(swapchain.swapchain, None);
        }
    }
}
