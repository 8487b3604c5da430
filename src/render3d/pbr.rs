use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use ash::vk;
use glam::Mat4;

use super::{RenderObject, RenderSystem};
use crate::{
    HasDevice,
    context::Context,
    descriptor::DescriptorSetLayout,
    error::Result,
    frame::FrameInfo,
    material::MaterialSystem,
    model::Model,
    pipeline::{GraphicsPipelineConfig, Pipeline, PipelineLayout, ShaderModule},
    swapchain::RenderPass,
    utils::AsVkHandle,
};

/// Set index of the global descriptor set in the PBR pipeline layout.
pub const GLOBAL_SET: u32 = 0;
/// Set index of the material descriptor set.
pub const MATERIAL_SET: u32 = 1;

/// Locations of the compiled PBR shaders.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PbrShaders {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

impl PbrShaders {
    /// `pbr.vert.spv` and `pbr.frag.spv` inside `dir`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            vertex: dir.join("pbr.vert.spv"),
            fragment: dir.join("pbr.frag.spv"),
        }
    }
}

/// Per-object push constants, visible to the vertex and fragment stages.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PbrPushConstants {
    pub model: Mat4,
    pub normal: Mat4,
}

impl PbrPushConstants {
    pub fn new(object: &RenderObject) -> Self {
        Self {
            model: object.transform,
            normal: object.normal_matrix(),
        }
    }
}

const PUSH_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::VERTEX.as_raw() | vk::ShaderStageFlags::FRAGMENT.as_raw(),
);

/// Draws every object that has a model with its material.
///
/// Set 0 is the global set, set 1 the object's material set.
pub struct PbrRenderSystem {
    pipeline: Pipeline,
}

impl PbrRenderSystem {
    pub fn new(
        context: &Context,
        render_pass: &RenderPass,
        global_layout: Arc<DescriptorSetLayout>,
        material_layout: Arc<DescriptorSetLayout>,
        shaders: &PbrShaders,
    ) -> Result<Self> {
        let device = context.device().clone();
        let layout = Arc::new(PipelineLayout::new(
            device.clone(),
            vec![global_layout, material_layout],
            &[vk::PushConstantRange {
                stage_flags: PUSH_STAGES,
                offset: 0,
                size: std::mem::size_of::<PbrPushConstants>() as u32,
            }],
        )?);
        let vertex = ShaderModule::from_file(device.clone(), &shaders.vertex)?;
        let fragment = ShaderModule::from_file(device, &shaders.fragment)?;
        let pipeline = Pipeline::graphics(
            layout,
            &vertex,
            &fragment,
            render_pass,
            &GraphicsPipelineConfig::default(),
        )?;
        Ok(Self { pipeline })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

/// Objects with a model, in scene order.
fn drawable(objects: &[RenderObject]) -> impl Iterator<Item = (&RenderObject, &Model)> {
    objects
        .iter()
        .filter_map(|object| Some((object, object.model.as_deref()?)))
}

impl RenderSystem for PbrRenderSystem {
    fn name(&self) -> &str {
        "pbr"
    }

    fn render(
        &mut self,
        frame: &FrameInfo,
        objects: &[RenderObject],
        materials: &MaterialSystem,
    ) -> Result<()> {
        let device = self.pipeline.device();
        let layout = self.pipeline.layout();
        let command_buffer = frame.command_buffer;
        unsafe {
            device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.vk_handle(),
            );
            device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout.vk_handle(),
                GLOBAL_SET,
                &[frame.global_descriptor_set],
                &[],
            );
        }
        for (object, model) in drawable(objects) {
            materials.bind(object.material, frame, layout, MATERIAL_SET);
            let push = PbrPushConstants::new(object);
            unsafe {
                device.cmd_push_constants(
                    command_buffer,
                    layout.vk_handle(),
                    PUSH_STAGES,
                    0,
                    bytemuck::bytes_of(&push),
                );
            }
            model.bind(command_buffer);
            model.draw(command_buffer);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::{Error, material::MaterialId};

    #[test]
    fn push_constants_fit_the_guaranteed_minimum() {
        assert_eq!(std::mem::size_of::<PbrPushConstants>(), 128);
        assert!(
            PUSH_STAGES.contains(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
        );
    }

    #[test]
    fn objects_without_models_are_skipped() {
        let object = |material: MaterialId| RenderObject {
            transform: Mat4::from_translation(Vec3::splat(material as f32)),
            material,
            model: None,
        };
        assert_eq!(drawable(&[object(0), object(1)]).count(), 0);

        let push = PbrPushConstants::new(&object(2));
        assert_eq!(push.model.w_axis.truncate(), Vec3::splat(2.0));
        assert_eq!(push.normal, Mat4::IDENTITY);
    }

    #[test]
    fn shader_files_from_dir() {
        let shaders = PbrShaders::from_dir("/shaders");
        assert_eq!(shaders.vertex, Path::new("/shaders/pbr.vert.spv"));
        assert_eq!(shaders.fragment, Path::new("/shaders/pbr.frag.spv"));
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn missing_shader_is_an_io_error() {
        let context = crate::context::test_context();
        let render_pass = RenderPass::new(
            context.device().clone(),
            vk::Format::B8G8R8A8_SRGB,
            vk::Format::D32_SFLOAT,
        )
        .unwrap();
        let layout = |context: &Context| {
            Arc::new(
                DescriptorSetLayout::builder()
                    .add_binding(
                        0,
                        vk::DescriptorType::UNIFORM_BUFFER,
                        vk::ShaderStageFlags::ALL_GRAPHICS,
                        1,
                    )
                    .build(context.device().clone())
                    .unwrap(),
            )
        };
        let result = PbrRenderSystem::new(
            &context,
            &render_pass,
            layout(&context),
            layout(&context),
            &PbrShaders::from_dir("/nonexistent"),
        );
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
