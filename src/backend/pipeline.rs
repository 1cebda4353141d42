// Graphics pipeline for the built-in object shader
//
// The graphics pipeline defines how vertices are processed and rasterized.
// It includes: vertex input, shaders, rasterization, depth/stencil, blending.
// Viewport and scissor are dynamic so the pipeline survives swapchain rebuilds.

use anyhow::{Context, Result};
use ash::vk;
use glam::Mat4;
use std::ffi::CStr;
use std::mem::{offset_of, size_of};
use std::sync::Arc;

use super::command::{CommandBuffer, CommandBufferState};
use super::gpu::GpuDevice;
use super::shader::{create_shader_module, ShaderSource, ShaderStage};
use crate::renderer::types::Vertex3d;

pub const OBJECT_SHADER: &str = "builtin.object_shader";

/// projection + view
pub const PUSH_CONSTANT_SIZE: u32 = 2 * size_of::<Mat4>() as u32;

const ENTRY_POINT: &CStr = c"main";

/// Vertex input description: position (vec3) + tex_coord (vec2)
fn vertex_input_info() -> (
    [vk::VertexInputBindingDescription; 1],
    [vk::VertexInputAttributeDescription; 2],
) {
    let binding = vk::VertexInputBindingDescription::builder()
        .binding(0)
        .stride(size_of::<Vertex3d>() as u32)
        .input_rate(vk::VertexInputRate::VERTEX)
        .build();

    let position_attr = vk::VertexInputAttributeDescription::builder()
        .binding(0)
        .location(0)
        .format(vk::Format::R32G32B32_SFLOAT)
        .offset(offset_of!(Vertex3d, position) as u32)
        .build();

    let tex_coord_attr = vk::VertexInputAttributeDescription::builder()
        .binding(0)
        .location(1)
        .format(vk::Format::R32G32_SFLOAT)
        .offset(offset_of!(Vertex3d, tex_coord) as u32)
        .build();

    ([binding], [position_attr, tex_coord_attr])
}

pub struct ObjectShaderPipeline<D: GpuDevice> {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    device: Arc<D>,
}

impl<D: GpuDevice> ObjectShaderPipeline<D> {
    pub fn new(
        device: Arc<D>,
        source: &dyn ShaderSource,
        render_pass: vk::RenderPass,
    ) -> Result<Self> {
        let vert = create_shader_module(device.as_ref(), source, OBJECT_SHADER, ShaderStage::Vertex)?;
        let frag =
            match create_shader_module(device.as_ref(), source, OBJECT_SHADER, ShaderStage::Fragment)
            {
                Ok(module) => module,
                Err(e) => {
                    device.destroy_shader_module(vert);
                    return Err(e);
                }
            };

        let result = Self::build(device.as_ref(), render_pass, vert, frag);

        // Modules are only needed while the pipeline is being created
        device.destroy_shader_module(vert);
        device.destroy_shader_module(frag);

        let (pipeline, layout) = result?;
        log::info!("Object shader pipeline created");

        Ok(Self {
            pipeline,
            layout,
            device,
        })
    }

    fn build(
        device: &D,
        render_pass: vk::RenderPass,
        vert: vk::ShaderModule,
        frag: vk::ShaderModule,
    ) -> Result<(vk::Pipeline, vk::PipelineLayout)> {
        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(ShaderStage::Vertex.flags())
                .module(vert)
                .name(ENTRY_POINT)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(ShaderStage::Fragment.flags())
                .module(frag)
                .name(ENTRY_POINT)
                .build(),
        ];

        let (bindings, attributes) = vertex_input_info();
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Counts only; the values are set per frame
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
            .build();

        let color_blend_attachments = &[color_blend_attachment];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(color_blend_attachments);

        let push_constant_range = vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .offset(0)
            .size(PUSH_CONSTANT_SIZE)
            .build();

        let push_constant_ranges = &[push_constant_range];
        let layout_info =
            vk::PipelineLayoutCreateInfo::builder().push_constant_ranges(push_constant_ranges);

        let pipeline_layout = device
            .create_pipeline_layout(&layout_info)
            .context("Failed to create pipeline layout")?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(pipeline_layout)
            .render_pass(render_pass)
            .subpass(0);

        match device.create_graphics_pipeline(&pipeline_info) {
            Ok(pipeline) => Ok((pipeline, pipeline_layout)),
            Err(e) => {
                device.destroy_pipeline_layout(pipeline_layout);
                Err(e).context("Failed to create graphics pipeline")
            }
        }
    }

    pub fn bind(&self, cmd: &CommandBuffer) -> Result<()> {
        cmd.require("bind a pipeline", CommandBufferState::InRenderPass)?;
        self.device.cmd_bind_pipeline(cmd.handle, self.pipeline);
        Ok(())
    }

    /// Push projection and view for the vertex stage
    pub fn push_matrices(&self, cmd: &CommandBuffer, projection: Mat4, view: Mat4) -> Result<()> {
        cmd.require("push constants", CommandBufferState::InRenderPass)?;
        let matrices = [projection, view];
        self.device.cmd_push_constants(
            cmd.handle,
            self.layout,
            vk::ShaderStageFlags::VERTEX,
            0,
            bytemuck::cast_slice(&matrices),
        );
        Ok(())
    }
}

impl<D: GpuDevice> Drop for ObjectShaderPipeline<D> {
    fn drop(&mut self) {
        self.device.destroy_pipeline(self.pipeline);
        self.device.destroy_pipeline_layout(self.layout);
    }
}
