//! PBR materials with per-frame-in-flight GPU copies.
//!
//! The [`MaterialSystem`] owns every material. Each material keeps its parameters and
//! textures on the host and, for every frame-in-flight slot, a persistently mapped uniform
//! buffer plus a descriptor set. Edits made through [`MaterialSystem::get_mut`] reach the GPU
//! only when the slot is flushed, so frames still in flight keep reading the values they were
//! recorded with:
//!
//! ```no_run
//! # use tephra::{context::Context, material::MaterialSystem, glam::Vec4};
//! # let context = Context::headless().unwrap();
//! let mut materials = MaterialSystem::new(&context, 2).unwrap();
//! let red = materials.create_material().unwrap();
//! materials.get_mut(red).unwrap().params.albedo = Vec4::new(0.9, 0.2, 0.2, 1.0);
//! // Once per frame, before any draw references the materials:
//! materials.flush_all(0).unwrap();
//! ```
//!
//! Descriptor set layout, all bindings visible to every graphics stage:
//!
//! | binding | contents |
//! |---|---|
//! | 0 | [`PbrParams`] uniform buffer |
//! | 1 | albedo texture |
//! | 2 | ambient occlusion / roughness / metallic texture |
//! | 3 | normal map |

use std::{collections::BTreeMap, sync::Arc};

use ash::vk;
use glam::{Vec2, Vec4};

use crate::{
    HasDevice,
    buffer::Buffer,
    context::Context,
    descriptor::{DescriptorPool, DescriptorSetLayout, DescriptorWriter},
    error::{Error, Result},
    frame::FrameInfo,
    pipeline::PipelineLayout,
    texture::{Texture, TextureSource},
    utils::AsVkHandle,
};

/// Default maximum number of materials.
pub const DEFAULT_CAPACITY: u32 = 100;

pub type MaterialId = u32;

/// Material parameters as laid out in the uniform buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PbrParams {
    pub albedo: Vec4,
    pub emission: Vec4,
    pub uv_scale: Vec2,
    pub roughness: f32,
    pub metallic: f32,
}

impl Default for PbrParams {
    fn default() -> Self {
        Self {
            albedo: Vec4::ONE,
            emission: Vec4::ZERO,
            uv_scale: Vec2::ONE,
            roughness: 0.5,
            metallic: 0.0,
        }
    }
}

/// Textures sampled by a material. Textures may be shared between materials.
#[derive(Clone, Debug)]
pub struct MaterialTextures {
    pub albedo: Arc<Texture>,
    pub arm: Arc<Texture>,
    pub normal: Arc<Texture>,
}

impl MaterialTextures {
    /// 1×1 placeholders: white albedo, full occlusion/roughness/metallic factors, and a flat
    /// tangent-space normal.
    pub fn placeholders(context: &Context) -> Result<Self> {
        let placeholder = |color: Vec4, format: vk::Format| -> Result<Arc<Texture>> {
            Ok(Arc::new(
                Texture::builder()
                    .format(format)
                    .mipmaps(false)
                    .add_layer(TextureSource::solid(color, 1, 1))
                    .build(context)?,
            ))
        };
        Ok(Self {
            albedo: placeholder(Vec4::ONE, vk::Format::R8G8B8A8_SRGB)?,
            arm: placeholder(Vec4::ONE, vk::Format::R8G8B8A8_UNORM)?,
            normal: placeholder(Vec4::new(0.5, 0.5, 1.0, 1.0), vk::Format::R8G8B8A8_UNORM)?,
        })
    }

    fn descriptor_infos(&self) -> [vk::DescriptorImageInfo; 3] {
        [
            self.albedo.descriptor_info(),
            self.arm.descriptor_info(),
            self.normal.descriptor_info(),
        ]
    }
}

struct FrameResources {
    buffer: Buffer,
    descriptor_set: vk::DescriptorSet,
    /// The textures `descriptor_set` points at. Kept alive until the slot is flushed again.
    textures: MaterialTextures,
}

/// A material: host-side parameters and textures plus one GPU copy per frame slot.
///
/// Replacing a texture here does not free the old one: every slot keeps the textures it was
/// last flushed with until its next flush.
pub struct Material {
    pub params: PbrParams,
    pub textures: MaterialTextures,
    frames: Vec<FrameResources>,
}

impl std::fmt::Debug for Material {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Material")
            .field("params", &self.params)
            .field("frames", &self.frames.len())
            .finish_non_exhaustive()
    }
}

impl Material {
    /// The descriptor set of frame slot `frame_index`.
    pub fn descriptor_set(&self, frame_index: usize) -> vk::DescriptorSet {
        self.frames[frame_index].descriptor_set
    }
}

/// Registry of materials. Ids are handed out by each registry, starting at 0 with the
/// default material.
pub struct MaterialSystem {
    materials: BTreeMap<MaterialId, Material>,
    pool: DescriptorPool,
    layout: Arc<DescriptorSetLayout>,
    defaults: MaterialTextures,
    context: Context,
    next_id: MaterialId,
    default_material: MaterialId,
    frames_in_flight: usize,
    capacity: u32,
}

impl MaterialSystem {
    pub fn new(context: &Context, frames_in_flight: usize) -> Result<Self> {
        Self::with_capacity(context, frames_in_flight, DEFAULT_CAPACITY)
    }

    /// Creates a registry holding at most `capacity` materials, the default material
    /// included.
    pub fn with_capacity(context: &Context, frames_in_flight: usize, capacity: u32) -> Result<Self> {
        assert!(frames_in_flight > 0, "At least one frame in flight is required");
        let device = context.device().clone();
        let stages = vk::ShaderStageFlags::ALL_GRAPHICS;
        let layout = DescriptorSetLayout::builder()
            .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER, stages, 1)
            .add_binding(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, stages, 1)
            .add_binding(2, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, stages, 1)
            .add_binding(3, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, stages, 1)
            .build(device.clone())?;
        let sets = capacity * frames_in_flight as u32;
        let pool = DescriptorPool::builder()
            .max_sets(sets)
            .add_pool_size(vk::DescriptorType::UNIFORM_BUFFER, sets)
            .add_pool_size(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, sets * 3)
            .build(device)?;
        let mut system = Self {
            materials: BTreeMap::new(),
            pool,
            layout: Arc::new(layout),
            defaults: MaterialTextures::placeholders(context)?,
            context: context.clone(),
            next_id: 0,
            default_material: 0,
            frames_in_flight,
            capacity,
        };
        system.default_material = system.create_material()?;
        tracing::debug!(capacity, frames_in_flight, "created material system");
        Ok(system)
    }

    /// Registers a material with default parameters and the placeholder textures.
    ///
    /// Returns [`Error::PoolExhausted`] once the registry is at capacity.
    pub fn create_material(&mut self) -> Result<MaterialId> {
        if self.materials.len() >= self.capacity as usize {
            tracing::warn!(capacity = self.capacity, "Material capacity reached");
            return Err(Error::PoolExhausted);
        }
        let textures = self.defaults.clone();
        let image_infos = textures.descriptor_infos();
        let buffers = (0..self.frames_in_flight)
            .map(|_| -> Result<Buffer> {
                let mut buffer = Buffer::new(
                    self.context.allocator().clone(),
                    std::mem::size_of::<PbrParams>() as vk::DeviceSize,
                    1,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    vk::MemoryPropertyFlags::HOST_VISIBLE,
                    self.context.min_uniform_buffer_offset_alignment(),
                )?;
                buffer.map()?;
                Ok(buffer)
            })
            .collect::<Result<Vec<_>>>()?;
        // One allocation for every slot, so a failure leaves no set behind.
        let sets = self
            .pool
            .allocate_descriptor_sets(&self.layout, self.frames_in_flight as u32)?;
        let frames = buffers
            .into_iter()
            .zip(sets)
            .map(|(buffer, descriptor_set)| {
                DescriptorWriter::new(&self.layout, &mut self.pool)
                    .write_buffer(0, &[buffer.descriptor_info_for_index(0)])
                    .write_image(1, &image_infos[0..1])
                    .write_image(2, &image_infos[1..2])
                    .write_image(3, &image_infos[2..3])
                    .overwrite(descriptor_set);
                FrameResources {
                    buffer,
                    descriptor_set,
                    textures: textures.clone(),
                }
            })
            .collect();

        let id = self.next_id;
        self.next_id += 1;
        self.materials.insert(
            id,
            Material {
                params: PbrParams::default(),
                textures,
                frames,
            },
        );
        tracing::trace!(id, "created material");
        Ok(id)
    }

    pub fn get(&self, id: MaterialId) -> Option<&Material> {
        self.materials.get(&id)
    }

    pub fn get_mut(&mut self, id: MaterialId) -> Option<&mut Material> {
        self.materials.get_mut(&id)
    }

    /// Pushes material `id`'s current parameters and textures into frame slot `frame_index`.
    ///
    /// The image bindings are rewritten every time so texture swaps take effect.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not registered or `frame_index` is out of range.
    pub fn flush_material(&mut self, id: MaterialId, frame_index: usize) -> Result<()> {
        let Some(material) = self.materials.get_mut(&id) else {
            tracing::error!(id, "Flushing unknown material");
            panic!("Material {id} does not exist");
        };
        Self::flush(&self.layout, &mut self.pool, material, frame_index)
    }

    /// Flushes every material into frame slot `frame_index`. Call once per frame before any
    /// draw references the materials.
    pub fn flush_all(&mut self, frame_index: usize) -> Result<()> {
        for material in self.materials.values_mut() {
            Self::flush(&self.layout, &mut self.pool, material, frame_index)?;
        }
        Ok(())
    }

    fn flush(
        layout: &DescriptorSetLayout,
        pool: &mut DescriptorPool,
        material: &mut Material,
        frame_index: usize,
    ) -> Result<()> {
        let image_infos = material.textures.descriptor_infos();
        let frame = &mut material.frames[frame_index];
        frame.buffer.write_pod(&material.params);
        DescriptorWriter::new(layout, pool)
            .write_buffer(0, &[frame.buffer.descriptor_info_for_index(0)])
            .write_image(1, &image_infos[0..1])
            .write_image(2, &image_infos[1..2])
            .write_image(3, &image_infos[2..3])
            .overwrite(frame.descriptor_set);
        frame.buffer.flush_index(0)?;
        // The slot's fence has signaled, so the textures it used before can go.
        frame.textures = material.textures.clone();
        Ok(())
    }

    /// Binds material `id`'s descriptor set for the frame being recorded.
    pub fn bind(&self, id: MaterialId, frame: &FrameInfo, layout: &PipelineLayout, set: u32) {
        let Some(material) = self.materials.get(&id) else {
            tracing::error!(id, "Binding unknown material");
            panic!("Material {id} does not exist");
        };
        unsafe {
            self.context.device().cmd_bind_descriptor_sets(
                frame.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout.vk_handle(),
                set,
                &[material.descriptor_set(frame.frame_index)],
                &[],
            );
        }
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }
    pub fn default_material(&self) -> MaterialId {
        self.default_material
    }
    pub fn default_textures(&self) -> &MaterialTextures {
        &self.defaults
    }
    pub fn len(&self) -> usize {
        self.materials.len()
    }
    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }
    pub fn ids(&self) -> impl Iterator<Item = MaterialId> + '_ {
        self.materials.keys().copied()
    }
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_layout() {
        assert_eq!(std::mem::size_of::<PbrParams>(), 48);
        assert_eq!(std::mem::offset_of!(PbrParams, emission), 16);
        assert_eq!(std::mem::offset_of!(PbrParams, uv_scale), 32);
        assert_eq!(std::mem::offset_of!(PbrParams, roughness), 40);
        assert_eq!(std::mem::offset_of!(PbrParams, metallic), 44);
        let params = PbrParams::default();
        assert_eq!(params.albedo, Vec4::ONE);
        assert_eq!(params.roughness, 0.5);
    }

    fn read_params(system: &mut MaterialSystem, id: MaterialId, frame: usize) -> PbrParams {
        let buffer = &mut system.materials.get_mut(&id).unwrap().frames[frame].buffer;
        buffer.invalidate_index(0).unwrap();
        let bytes = buffer.read_mapped().unwrap();
        bytemuck::pod_read_unaligned(&bytes[..std::mem::size_of::<PbrParams>()])
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn flush_all_writes_last_edits_to_one_slot() {
        let context = crate::context::test_context();
        let mut system = MaterialSystem::with_capacity(&context, 2, 4).unwrap();
        assert_eq!(system.default_material(), 0);
        let a = system.create_material().unwrap();
        let b = system.create_material().unwrap();
        assert_eq!((a, b), (1, 2));

        system.flush_all(0).unwrap();
        for step in 0..5 {
            system.get_mut(a).unwrap().params.roughness = step as f32 / 10.0;
            system.get_mut(b).unwrap().params.metallic = step as f32 / 4.0;
        }
        system.flush_all(1).unwrap();
        assert_eq!(read_params(&mut system, a, 1).roughness, 0.4);
        assert_eq!(read_params(&mut system, b, 1).metallic, 1.0);
        assert_eq!(read_params(&mut system, a, 1).metallic, 0.0);

        // Slot 0 still holds the values flushed before the edits.
        assert_eq!(read_params(&mut system, a, 0), PbrParams::default());

        // Capacity covers the default material.
        system.create_material().unwrap();
        assert!(matches!(
            system.create_material(),
            Err(Error::PoolExhausted)
        ));
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn replaced_texture_lives_until_every_slot_is_flushed() {
        let context = crate::context::test_context();
        let mut system = MaterialSystem::with_capacity(&context, 2, 2).unwrap();
        let id = system.create_material().unwrap();
        let solid = |color| {
            Arc::new(
                Texture::builder()
                    .mipmaps(false)
                    .add_layer(TextureSource::solid(color, 1, 1))
                    .build(&context)
                    .unwrap(),
            )
        };

        let first = solid(Vec4::new(1.0, 0.0, 0.0, 1.0));
        let first_weak = Arc::downgrade(&first);
        system.get_mut(id).unwrap().textures.albedo = first;
        system.flush_all(0).unwrap();
        system.flush_all(1).unwrap();

        system.get_mut(id).unwrap().textures.albedo = solid(Vec4::new(0.0, 1.0, 0.0, 1.0));
        assert!(first_weak.upgrade().is_some());
        system.flush_all(0).unwrap();
        // Slot 1 still samples the first texture.
        assert!(first_weak.upgrade().is_some());
        system.flush_all(1).unwrap();
        assert!(first_weak.upgrade().is_none());
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn registries_count_ids_independently() {
        let context = crate::context::test_context();
        let mut first = MaterialSystem::with_capacity(&context, 1, 3).unwrap();
        let mut second = MaterialSystem::with_capacity(&context, 1, 3).unwrap();
        assert_eq!(first.create_material().unwrap(), 1);
        assert_eq!(first.create_material().unwrap(), 2);
        assert_eq!(second.create_material().unwrap(), 1);

        let shared = first.default_textures().albedo.clone();
        second.get_mut(1).unwrap().textures.albedo = shared.clone();
        second.flush_material(1, 0).unwrap();
        assert!(Arc::strong_count(&shared) > 2);
    }
}
