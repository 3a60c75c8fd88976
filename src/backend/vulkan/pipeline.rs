// Shader modules and pipeline creation
//
// Compute pipelines take a single stage. Graphics pipelines render with
// dynamic rendering into one color attachment; viewport and scissor are
// dynamic so a swapchain resize never invalidates them.

use super::VulkanDevice;
use crate::backend::{PipelineKind, StageDesc};
use ash::prelude::VkResult;
use ash::vk;

pub struct VulkanPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
}

/// Create a shader module from SPIR-V words
pub fn create_shader_module(device: &VulkanDevice, code: &[u32]) -> VkResult<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    unsafe { device.device.create_shader_module(&create_info, None) }
}

pub fn create(
    device: &VulkanDevice,
    kind: PipelineKind,
    stages: &[StageDesc<'_, vk::ShaderModule>],
) -> VkResult<VulkanPipeline> {
    // Empty layout: no descriptor sets, no push constants
    let layout_info = vk::PipelineLayoutCreateInfo::builder();
    let layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }?;

    let shader_stages: Vec<vk::PipelineShaderStageCreateInfo> = stages
        .iter()
        .map(|stage| {
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(stage.stage)
                .module(*stage.module)
                .name(stage.entry)
                .build()
        })
        .collect();

    let result = match kind {
        PipelineKind::Compute => create_compute(device, layout, &shader_stages),
        PipelineKind::Graphics { color_format } => {
            create_graphics(device, layout, &shader_stages, color_format)
        }
    };

    match result {
        Ok((pipeline, bind_point)) => Ok(VulkanPipeline {
            pipeline,
            layout,
            bind_point,
        }),
        Err(e) => {
            unsafe { device.device.destroy_pipeline_layout(layout, None) };
            Err(e)
        }
    }
}

fn create_compute(
    device: &VulkanDevice,
    layout: vk::PipelineLayout,
    stages: &[vk::PipelineShaderStageCreateInfo],
) -> VkResult<(vk::Pipeline, vk::PipelineBindPoint)> {
    let stage = match stages {
        [stage] => *stage,
        _ => return Err(vk::Result::ERROR_INITIALIZATION_FAILED),
    };

    let create_info = vk::ComputePipelineCreateInfo::builder()
        .stage(stage)
        .layout(layout)
        .build();

    let pipelines = unsafe {
        device
            .device
            .create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
    }
    .map_err(|(_, e)| e)?;

    Ok((pipelines[0], vk::PipelineBindPoint::COMPUTE))
}

fn create_graphics(
    device: &VulkanDevice,
    layout: vk::PipelineLayout,
    stages: &[vk::PipelineShaderStageCreateInfo],
    color_format: vk::Format,
) -> VkResult<(vk::Pipeline, vk::PipelineBindPoint)> {
    // No vertex buffers: vertex shaders generate their own positions
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder();

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build();

    let color_blend_attachments = [color_blend_attachment];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let color_formats = [color_format];
    let mut rendering_info =
        vk::PipelineRenderingCreateInfo::builder().color_attachment_formats(&color_formats);

    let create_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info)
        .build();

    let pipelines = unsafe {
        device
            .device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
    }
    .map_err(|(_, e)| e)?;

    Ok((pipelines[0], vk::PipelineBindPoint::GRAPHICS))
}

pub fn destroy(device: &VulkanDevice, pipeline: VulkanPipeline) {
    unsafe {
        device.device.destroy_pipeline(pipeline.pipeline, None);
        device.device.destroy_pipeline_layout(pipeline.layout, None);
    }
}
