//! The 3D render module.
//!
//! [`Render3d`] owns a [`Renderer`], the global descriptor set of every frame-in-flight slot,
//! the per-slot global uniform buffers and a [`MaterialSystem`]. Each update it draws one frame:
//!
//! 1. begin the frame (skipped entirely when no swapchain image is available)
//! 2. flush every material into the slot
//! 3. fill the slot's [`GlobalUbo`] from the [`Scene`] and flush it
//! 4. begin the swapchain render pass and run every [`RenderSystem`] in order
//! 5. end the render pass and the frame
//!
//! Global set layout, visible to all graphics stages:
//!
//! | binding | contents |
//! |---|---|
//! | 0 | [`GlobalUbo`] |
//! | 1 | skybox cube, combined image sampler |
//! | 2 | irradiance cube, combined image sampler |
//! | 3 | BRDF lookup table, combined image sampler |
//!
//! Without an [`Environment`], bindings 1-3 hold 1×1 black placeholders.
//!
//! [`PbrRenderSystem`] draws the scene's [`RenderObject`]s with their materials.

mod pbr;

use std::sync::Arc;

use ash::vk;
use glam::{Mat3, Mat4, Vec4};

pub use pbr::{PbrPushConstants, PbrRenderSystem, PbrShaders};

use crate::{
    HasDevice,
    buffer::Buffer,
    context::Context,
    cubemap::{Cubemap, CubemapState},
    descriptor::{DescriptorPool, DescriptorSetLayout, DescriptorWriter},
    error::Result,
    frame::{Camera, FrameInfo, GlobalUbo, LightSource},
    material::{MaterialId, MaterialSystem},
    model::Model,
    module::Module,
    renderer::{Renderer, RendererConfig},
    texture::{Texture, TextureSource},
};

/// One object of the scene: where it is, what it looks like and, optionally, its mesh.
#[derive(Clone, Debug)]
pub struct RenderObject {
    pub transform: Mat4,
    pub material: MaterialId,
    pub model: Option<Arc<Model>>,
}

impl RenderObject {
    /// Inverse transpose of the upper 3×3 of `transform`, for transforming normals.
    pub fn normal_matrix(&self) -> Mat4 {
        Mat4::from_mat3(Mat3::from_mat4(self.transform).inverse().transpose())
    }
}

/// Draws into the swapchain render pass.
pub trait RenderSystem {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Records draw commands into `frame.command_buffer`. The swapchain render pass is active
    /// and every material has been flushed into `frame.frame_index`.
    fn render(
        &mut self,
        frame: &FrameInfo,
        objects: &[RenderObject],
        materials: &MaterialSystem,
    ) -> Result<()>;
}

/// What gets drawn: the camera, the lights and the objects of the frame.
pub trait Scene {
    /// Advances the scene. `aspect_ratio` is the current swapchain aspect ratio.
    fn update(&mut self, _delta_time: f32, _aspect_ratio: f32) {}

    fn camera(&self) -> &Camera;

    fn lights(&self) -> Vec<LightSource> {
        Vec::new()
    }

    fn objects(&self) -> &[RenderObject] {
        &[]
    }
}

/// Image-based lighting inputs: a prefiltered skybox with its irradiance map, and the BRDF
/// lookup table.
pub struct Environment {
    skybox: Cubemap,
    brdf_lut: Texture,
    image_infos: [vk::DescriptorImageInfo; 3],
}

impl Environment {
    /// # Panics
    ///
    /// Panics if `skybox` has not been through [`Cubemap::generate_ibl`].
    pub fn new(skybox: Cubemap, brdf_lut: Texture) -> Self {
        let (Some(sky), Some(irradiance)) =
            (skybox.descriptor_info(), skybox.irradiance_descriptor_info())
        else {
            tracing::error!(state = ?skybox.state(), "Environment cubemap lacks lighting maps");
            panic!("The environment cubemap must have its IBL maps generated");
        };
        debug_assert_eq!(skybox.state(), CubemapState::PrefilterGenerated);
        let image_infos = [sky, irradiance, brdf_lut.descriptor_info()];
        Self {
            skybox,
            brdf_lut,
            image_infos,
        }
    }

    pub fn skybox(&self) -> &Cubemap {
        &self.skybox
    }

    pub fn brdf_lut(&self) -> &Texture {
        &self.brdf_lut
    }
}

struct Placeholders {
    cube: Texture,
    lut: Texture,
}

impl Placeholders {
    fn new(context: &Context) -> Result<Self> {
        let black = || TextureSource::solid(Vec4::new(0.0, 0.0, 0.0, 1.0), 1, 1);
        let cube = (0..6)
            .fold(Texture::builder(), |builder, _| builder.add_layer(black()))
            .cubemap(true)
            .format(vk::Format::R8G8B8A8_UNORM)
            .mipmaps(false)
            .build(context)?;
        let lut = Texture::builder()
            .add_layer(black())
            .format(vk::Format::R8G8B8A8_UNORM)
            .address_mode(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .mipmaps(false)
            .build(context)?;
        Ok(Self { cube, lut })
    }

    fn image_infos(&self) -> [vk::DescriptorImageInfo; 3] {
        let cube = self.cube.descriptor_info();
        [cube, cube, self.lut.descriptor_info()]
    }
}

enum Lighting {
    Environment(Environment),
    Placeholder(Placeholders),
}

impl Lighting {
    fn image_infos(&self) -> [vk::DescriptorImageInfo; 3] {
        match self {
            Lighting::Environment(environment) => environment.image_infos,
            Lighting::Placeholder(placeholders) => placeholders.image_infos(),
        }
    }
}

pub struct Render3d {
    systems: Vec<Box<dyn RenderSystem>>,
    scene: Box<dyn Scene>,
    global_sets: Vec<vk::DescriptorSet>,
    global_pool: DescriptorPool,
    global_layout: Arc<DescriptorSetLayout>,
    ubo_buffers: Vec<Buffer>,
    materials: MaterialSystem,
    lighting: Lighting,
    renderer: Renderer,
    context: Context,
}

impl Render3d {
    /// `width` and `height` are the window's framebuffer size in pixels.
    pub fn new(
        context: &Context,
        width: u32,
        height: u32,
        config: RendererConfig,
        scene: Box<dyn Scene>,
        environment: Option<Environment>,
    ) -> Result<Self> {
        let renderer = Renderer::new(context, width, height, config)?;
        let frames_in_flight = renderer.frames_in_flight();
        let frames = frames_in_flight as u32;
        let device = context.device().clone();

        let stages = vk::ShaderStageFlags::ALL_GRAPHICS;
        let global_layout = Arc::new(
            DescriptorSetLayout::builder()
                .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER, stages, 1)
                .add_binding(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, stages, 1)
                .add_binding(2, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, stages, 1)
                .add_binding(3, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, stages, 1)
                .build(device.clone())?,
        );
        let mut global_pool = DescriptorPool::builder()
            .max_sets(frames)
            .add_pool_size(vk::DescriptorType::UNIFORM_BUFFER, frames)
            .add_pool_size(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, frames * 3)
            .build(device)?;

        let ubo_buffers = (0..frames_in_flight)
            .map(|_| {
                let mut buffer = Buffer::new(
                    context.allocator().clone(),
                    std::mem::size_of::<GlobalUbo>() as vk::DeviceSize,
                    1,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    vk::MemoryPropertyFlags::HOST_VISIBLE,
                    context.min_uniform_buffer_offset_alignment(),
                )?;
                buffer.map()?;
                Ok(buffer)
            })
            .collect::<Result<Vec<_>>>()?;

        let lighting = match environment {
            Some(environment) => Lighting::Environment(environment),
            None => Lighting::Placeholder(Placeholders::new(context)?),
        };
        let image_infos = lighting.image_infos();
        let global_sets = ubo_buffers
            .iter()
            .map(|buffer| {
                DescriptorWriter::new(&global_layout, &mut global_pool)
                    .write_buffer(0, &[buffer.descriptor_info_for_index(0)])
                    .write_image(1, &image_infos[0..1])
                    .write_image(2, &image_infos[1..2])
                    .write_image(3, &image_infos[2..3])
                    .build()
            })
            .collect::<Result<Vec<_>>>()?;

        let materials = MaterialSystem::new(context, frames_in_flight)?;
        tracing::debug!(frames_in_flight, "Created 3D render module");
        Ok(Self {
            systems: Vec::new(),
            scene,
            global_sets,
            global_pool,
            global_layout,
            ubo_buffers,
            materials,
            lighting,
            renderer,
            context: context.clone(),
        })
    }

    /// Builds a [`PbrRenderSystem`] against this module's render pass and layouts.
    ///
    /// Returns `Ok(None)` while the window has no area and there is no render pass yet.
    pub fn pbr_system(&self, shaders: &PbrShaders) -> Result<Option<PbrRenderSystem>> {
        let Some(render_pass) = self.renderer.render_pass() else {
            return Ok(None);
        };
        PbrRenderSystem::new(
            &self.context,
            render_pass,
            self.global_layout.clone(),
            self.materials.layout().clone(),
            shaders,
        )
        .map(Some)
    }

    /// Appends a system. Systems render in insertion order.
    pub fn add_system(&mut self, system: Box<dyn RenderSystem>) {
        tracing::debug!(system = system.name(), "Render system added");
        self.systems.push(system);
    }

    /// Replaces the image-based lighting inputs, rewriting the global sets of every slot.
    ///
    /// Waits for the device to go idle, since frames in flight may still sample the old maps.
    pub fn set_environment(&mut self, environment: Option<Environment>) -> Result<()> {
        self.context.wait_idle()?;
        self.lighting = match environment {
            Some(environment) => Lighting::Environment(environment),
            None => Lighting::Placeholder(Placeholders::new(&self.context)?),
        };
        let image_infos = self.lighting.image_infos();
        for (buffer, &set) in self.ubo_buffers.iter().zip(&self.global_sets) {
            DescriptorWriter::new(&self.global_layout, &mut self.global_pool)
                .write_buffer(0, &[buffer.descriptor_info_for_index(0)])
                .write_image(1, &image_infos[0..1])
                .write_image(2, &image_infos[1..2])
                .write_image(3, &image_infos[2..3])
                .overwrite(set);
        }
        Ok(())
    }

    /// Draws one frame. Returns without drawing when no swapchain image is available.
    pub fn draw_frame(&mut self, delta_time: f32) -> Result<()> {
        self.scene.update(delta_time, self.renderer.aspect_ratio());
        let Some(command_buffer) = self.renderer.begin_frame()? else {
            tracing::trace!("Frame skipped");
            return Ok(());
        };
        let recorded = self.record(command_buffer, delta_time);
        // The frame is always closed so the next begin_frame finds the renderer idle.
        self.renderer.end_frame()?;
        recorded
    }

    fn record(&mut self, command_buffer: vk::CommandBuffer, delta_time: f32) -> Result<()> {
        let frame_index = self.renderer.frame_index();
        self.materials.flush_all(frame_index)?;

        let camera = self.scene.camera();
        let mut ubo = GlobalUbo::default();
        ubo.set_camera(camera);
        ubo.set_lights(self.scene.lights());
        let buffer = &mut self.ubo_buffers[frame_index];
        buffer.write_pod(&ubo);
        buffer.flush_index(0)?;

        let frame = FrameInfo {
            frame_index,
            delta_time,
            command_buffer,
            camera,
            global_descriptor_set: self.global_sets[frame_index],
        };
        let objects = self.scene.objects();
        self.renderer.begin_swapchain_render_pass(command_buffer);
        let mut result = Ok(());
        for system in &mut self.systems {
            if let Err(err) = system.render(&frame, objects, &self.materials) {
                tracing::error!(system = system.name(), %err, "Render system failed");
                result = Err(err);
                break;
            }
        }
        self.renderer.end_swapchain_render_pass(command_buffer);
        result
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }
    pub fn global_layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.global_layout
    }
    pub fn materials(&self) -> &MaterialSystem {
        &self.materials
    }
    pub fn materials_mut(&mut self) -> &mut MaterialSystem {
        &mut self.materials
    }
    pub fn scene(&self) -> &dyn Scene {
        self.scene.as_ref()
    }
    pub fn scene_mut(&mut self) -> &mut dyn Scene {
        self.scene.as_mut()
    }
    pub fn environment(&self) -> Option<&Environment> {
        match &self.lighting {
            Lighting::Environment(environment) => Some(environment),
            Lighting::Placeholder(_) => None,
        }
    }
    pub fn system_count(&self) -> usize {
        self.systems.len()
    }
}

impl Module for Render3d {
    fn on_update(&mut self, _context: &Context, delta_time: f32) -> Result<()> {
        self.draw_frame(delta_time)
    }

    fn on_resize(&mut self, _context: &Context, width: u32, height: u32) {
        self.renderer.notify_resized(width, height);
    }
}

impl Drop for Render3d {
    fn drop(&mut self) {
        // Uniform buffers and descriptor sets go before the renderer waits on its frames.
        if let Err(err) = self.context.wait_idle() {
            tracing::error!(%err, "Failed to wait for the device before teardown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use glam::Vec3;

    struct Fixed(Camera);

    impl Scene for Fixed {
        fn camera(&self) -> &Camera {
            &self.0
        }
    }

    #[test]
    fn scene_defaults_to_no_lights() {
        let scene = Fixed(Camera::default());
        assert!(scene.lights().is_empty());
        let mut ubo = GlobalUbo::default();
        ubo.set_lights(scene.lights());
        assert_eq!(ubo.num_point_lights, 0);
        assert_eq!(ubo.num_directional_lights, 0);
    }

    #[test]
    fn scene_defaults_to_no_objects() {
        let scene = Fixed(Camera::default());
        assert!(scene.objects().is_empty());
    }

    #[test]
    fn normal_matrix_undoes_non_uniform_scale() {
        let object = RenderObject {
            transform: Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0))
                * Mat4::from_scale(Vec3::new(2.0, 1.0, 1.0)),
            material: 0,
            model: None,
        };
        let normal = object.normal_matrix();
        assert_eq!(normal.w_axis, Vec4::W);
        let n = normal.transform_vector3(Vec3::X);
        assert!((n - Vec3::new(0.5, 0.0, 0.0)).length() < 1e-6);
        let rotated = RenderObject {
            transform: Mat4::from_rotation_y(0.7),
            ..object
        };
        assert!(rotated.normal_matrix().abs_diff_eq(rotated.transform, 1e-6));
    }

    #[test]
    fn scene_lights_reach_the_ubo() {
        struct Lit(Camera);
        impl Scene for Lit {
            fn camera(&self) -> &Camera {
                &self.0
            }
            fn lights(&self) -> Vec<LightSource> {
                vec![LightSource::Point {
                    position: Vec3::new(1.0, -1.0, 0.0),
                    color: Vec3::ONE,
                    intensity: 0.5,
                }]
            }
        }
        let scene = Lit(Camera::default());
        let mut ubo = GlobalUbo::default();
        ubo.set_camera(scene.camera());
        assert_eq!(ubo.set_lights(scene.lights()), 0);
        assert_eq!(ubo.num_point_lights, 1);
        assert_eq!(ubo.point_lights[0].position, Vec4::new(1.0, -1.0, 0.0, 1.0));
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn placeholders_fill_the_lighting_bindings() {
        let context = crate::context::test_context();
        let lighting = Lighting::Placeholder(Placeholders::new(&context).unwrap());
        let infos = lighting.image_infos();
        assert_eq!(infos[0].image_view, infos[1].image_view);
        assert_ne!(infos[0].image_view, infos[2].image_view);
        assert!(infos
            .iter()
            .all(|info| info.image_layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL));
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn render3d_needs_a_window() {
        let context = crate::context::test_context();
        let result = Render3d::new(
            &context,
            800,
            600,
            RendererConfig::default(),
            Box::new(Fixed(Camera::default())),
            None,
        );
        assert!(matches!(result, Err(Error::MissingSurface)));
    }
}
