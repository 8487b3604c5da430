//! Vulkan pipeline management.
//!
//! # Key Types
//!
//! - [`Pipeline`]: A compiled compute or graphics pipeline.
//! - [`GraphicsPipelineConfig`]: Fixed-function state for [`Pipeline::graphics`].
//! - [`ShaderModule`]: A compiled SPIR-V shader module.
//! - [`PipelineLayout`]: Defines the interface between shaders and descriptor sets.
//!
//! Graphics pipelines are built against the [`Renderer`](crate::renderer::Renderer)'s render
//! pass. Viewport and scissor are always dynamic state, set by the renderer when the
//! swapchain render pass begins.

use std::{ffi::CStr, io::Cursor, path::Path, sync::Arc};

use ash::{prelude::VkResult, vk};

use crate::{
    Device, HasDevice,
    descriptor::DescriptorSetLayout,
    error::{Error, Result},
    model::Vertex,
    swapchain::RenderPass,
    utils::AsVkHandle,
};

pub struct Pipeline {
    device: Device,
    handle: vk::Pipeline,
    layout: Arc<PipelineLayout>,
}
impl HasDevice for Pipeline {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl Pipeline {
    pub fn from_raw(device: Device, raw: vk::Pipeline, layout: Arc<PipelineLayout>) -> Self {
        Self {
            device,
            handle: raw,
            layout,
        }
    }

    /// Creates a compute pipeline from a single shader stage.
    pub fn compute(
        layout: Arc<PipelineLayout>,
        shader: &ShaderModule,
        entry: &CStr,
    ) -> VkResult<Self> {
        let device = layout.device().clone();
        let create_info = vk::ComputePipelineCreateInfo {
            layout: layout.vk_handle(),
            stage: vk::PipelineShaderStageCreateInfo {
                stage: vk::ShaderStageFlags::COMPUTE,
                module: shader.vk_handle(),
                p_name: entry.as_ptr(),
                ..Default::default()
            },
            ..Default::default()
        };
        let pipelines = unsafe {
            device
                .create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
                .map_err(|(_, err)| err)?
        };
        let handle = pipelines
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;
        Ok(Self::from_raw(device, handle, layout))
    }

    /// Creates a graphics pipeline from a vertex and a fragment stage, both entered at `main`.
    pub fn graphics(
        layout: Arc<PipelineLayout>,
        vertex: &ShaderModule,
        fragment: &ShaderModule,
        render_pass: &RenderPass,
        config: &GraphicsPipelineConfig,
    ) -> VkResult<Self> {
        let device = layout.device().clone();
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex.vk_handle())
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment.vk_handle())
                .name(c"main"),
        ];
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&config.vertex_bindings)
            .vertex_attribute_descriptions(&config.vertex_attributes);
        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(config.topology);
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(config.polygon_mode)
            .cull_mode(config.cull_mode)
            .front_face(config.front_face)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .min_sample_shading(1.0);
        let attachments = [config.color_blend_attachment()];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op(vk::LogicOp::COPY)
            .attachments(&attachments);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(config.depth_test)
            .depth_write_enable(config.depth_write)
            .depth_compare_op(config.depth_compare_op)
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .color_blend_state(&color_blend)
            .depth_stencil_state(&depth_stencil)
            .dynamic_state(&dynamic)
            .layout(layout.vk_handle())
            .render_pass(render_pass.vk_handle())
            .subpass(config.subpass)
            .base_pipeline_index(-1);
        let pipelines = unsafe {
            device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
                .map_err(|(_, err)| err)?
        };
        let handle = pipelines
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;
        tracing::debug!(pipeline = ?handle, "Created graphics pipeline");
        Ok(Self::from_raw(device, handle, layout))
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }
}

/// Fixed-function state of a graphics pipeline.
///
/// The default draws [`Vertex`] triangle lists with depth testing, no culling and no
/// blending.
#[derive(Clone, Debug)]
pub struct GraphicsPipelineConfig {
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare_op: vk::CompareOp,
    pub alpha_blending: bool,
    pub subpass: u32,
}

impl Default for GraphicsPipelineConfig {
    fn default() -> Self {
        Self {
            vertex_bindings: Vertex::binding_descriptions().to_vec(),
            vertex_attributes: Vertex::attribute_descriptions().to_vec(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::CLOCKWISE,
            depth_test: true,
            depth_write: true,
            depth_compare_op: vk::CompareOp::LESS,
            alpha_blending: false,
            subpass: 0,
        }
    }
}

impl GraphicsPipelineConfig {
    /// Standard `src_alpha, 1 - src_alpha` color blending. Alpha is written through.
    pub fn with_alpha_blending(mut self) -> Self {
        self.alpha_blending = true;
        self
    }

    /// A pipeline without vertex buffers, for shaders that generate their own vertices.
    pub fn without_vertex_input(mut self) -> Self {
        self.vertex_bindings.clear();
        self.vertex_attributes.clear();
        self
    }

    pub fn color_blend_attachment(&self) -> vk::PipelineColorBlendAttachmentState {
        let state = vk::PipelineColorBlendAttachmentState {
            color_write_mask: vk::ColorComponentFlags::RGBA,
            src_color_blend_factor: vk::BlendFactor::ONE,
            dst_color_blend_factor: vk::BlendFactor::ZERO,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ZERO,
            alpha_blend_op: vk::BlendOp::ADD,
            ..Default::default()
        };
        if !self.alpha_blending {
            return state;
        }
        vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::TRUE,
            src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
            dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            ..state
        }
    }
}
impl AsVkHandle for Pipeline {
    type Handle = vk::Pipeline;

    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}
impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.handle, None);
        }
    }
}

/// Checks and re-aligns SPIR-V byte code into 32-bit words.
pub fn parse_spirv(code: &[u8]) -> Result<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(code)).map_err(|err| Error::InvalidShader(err.to_string()))
}

pub struct ShaderModule {
    device: Device,
    handle: vk::ShaderModule,
}
impl ShaderModule {
    pub fn new(device: Device, code: &[u8]) -> Result<Self> {
        let words = parse_spirv(code)?;
        let module = unsafe {
            device.create_shader_module(&vk::ShaderModuleCreateInfo::default().code(&words), None)?
        };
        Ok(Self {
            device,
            handle: module,
        })
    }

    /// Loads a `.spv` file.
    pub fn from_file(device: Device, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let code = std::fs::read(path)?;
        tracing::debug!(path = %path.display(), bytes = code.len(), "loaded shader");
        Self::new(device, &code)
    }
}
impl AsVkHandle for ShaderModule {
    type Handle = vk::ShaderModule;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}
impl HasDevice for ShaderModule {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.handle, None);
        }
    }
}

pub struct PipelineLayout {
    device: Device,
    handle: vk::PipelineLayout,
    _descriptor_set_layouts: Vec<Arc<DescriptorSetLayout>>,
}

impl PipelineLayout {
    pub fn new(
        device: Device,
        set_layouts: Vec<Arc<DescriptorSetLayout>>,
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> VkResult<Self> {
        let raw_set_layouts: Vec<_> = set_layouts.iter().map(|a| a.vk_handle()).collect();
        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&raw_set_layouts)
            .push_constant_ranges(push_constant_ranges);

        let layout = unsafe { device.create_pipeline_layout(&info, None)? };
        Ok(Self {
            device,
            handle: layout,
            _descriptor_set_layouts: set_layouts,
        })
    }
}
impl AsVkHandle for PipelineLayout {
    type Handle = vk::PipelineLayout;

    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}
impl HasDevice for PipelineLayout {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline_layout(self.handle, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spirv_words_are_little_endian() {
        let magic = 0x0723_0203u32.to_le_bytes();
        let words = parse_spirv(&magic).unwrap();
        assert_eq!(words, vec![0x0723_0203]);
    }

    #[test]
    fn default_graphics_state() {
        let config = GraphicsPipelineConfig::default();
        assert_eq!(config.vertex_bindings.len(), 1);
        assert_eq!(
            config.vertex_bindings[0].stride as usize,
            std::mem::size_of::<Vertex>()
        );
        assert_eq!(config.vertex_attributes.len(), 6);
        assert!(config.depth_test && config.depth_write);
        assert_eq!(config.depth_compare_op, vk::CompareOp::LESS);
        let blend = config.color_blend_attachment();
        assert_eq!(blend.blend_enable, vk::FALSE);
        assert_eq!(blend.color_write_mask, vk::ColorComponentFlags::RGBA);

        let blended = config.with_alpha_blending().color_blend_attachment();
        assert_eq!(blended.blend_enable, vk::TRUE);
        assert_eq!(blended.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(
            blended.dst_color_blend_factor,
            vk::BlendFactor::ONE_MINUS_SRC_ALPHA
        );
        assert_eq!(blended.src_alpha_blend_factor, vk::BlendFactor::ONE);
    }

    #[test]
    fn vertexless_pipelines_have_no_input() {
        let config = GraphicsPipelineConfig::default().without_vertex_input();
        assert!(config.vertex_bindings.is_empty());
        assert!(config.vertex_attributes.is_empty());
    }

    #[test]
    fn truncated_spirv_is_rejected() {
        assert!(matches!(
            parse_spirv(&[0x03, 0x02, 0x23]),
            Err(Error::InvalidShader(_))
        ));
    }
}
