//! Environment cubemaps and image-based lighting.
//!
//! A [`Cubemap`] starts empty and is loaded either from six face images or from an
//! equirectangular HDR panorama that a compute pass projects onto the six faces. Once loaded,
//! [`Cubemap::generate_ibl`] derives the maps used for ambient lighting:
//!
//! 1. a low resolution diffuse irradiance cube, convolved from the base cube, and
//! 2. a specular prefiltered chain, written into mip levels `1..` of the base cube, where
//!    level `l` of `n` is convolved at roughness `l / (n - 1)`.
//!
//! Derived maps are always regenerated from the base texture; loading a new base discards
//! them. [`generate_brdf_lut`] fills the split-sum BRDF lookup table that pairs with them.
//!
//! Every pass is a one-shot compute dispatch. Descriptor pools, pipelines, source textures
//! and per-level views live only for the duration of their pass.
//!
//! # Shader interface
//!
//! All passes use the `main` entry point, one descriptor set and these bindings:
//!
//! | pass | binding 0 | binding 1 | push constants | local size |
//! |---|---|---|---|---|
//! | equirect to cube | sampled panorama | storage `image2DArray`, 6 layers | none | 32×32×1 |
//! | irradiance | sampled base cube | storage `image2DArray`, 6 layers | none | 16×16×1 |
//! | prefilter | sampled base cube, level 0 | storage `image2DArray`, one level | [`PrefilterParams`] | 16×16×1 |
//! | BRDF LUT | storage `image2D` | | none | 32×32×1 |

use std::{
    ffi::CStr,
    path::{Path, PathBuf},
    sync::Arc,
};

use ash::vk;
use glam::{UVec3, Vec4};
use smallvec::SmallVec;

use crate::{
    HasDevice,
    context::Context,
    descriptor::{DescriptorPool, DescriptorSetLayout, DescriptorWriter},
    error::Result,
    image::ImageView,
    pipeline::{Pipeline, PipelineLayout, ShaderModule},
    texture::{Texture, TextureSource, mip_extent},
    tracking::Access,
    utils::{AsVkHandle, group_count},
};

/// Face file stems in cube layer order.
pub const FACE_NAMES: [&str; 6] = ["right", "left", "bottom", "top", "front", "back"];

/// Resolution of the BRDF lookup table unless the caller asks for another.
pub const DEFAULT_BRDF_LUT_SIZE: u32 = 512;

const ENTRY_POINT: &CStr = c"main";
const EQUIRECT_LOCAL_SIZE: u32 = 32;
const IRRADIANCE_LOCAL_SIZE: u32 = 16;
const PREFILTER_LOCAL_SIZE: u32 = 16;
const BRDF_LUT_LOCAL_SIZE: u32 = 32;

/// Locations of the compiled IBL compute shaders.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IblShaders {
    pub equirect_to_cube: PathBuf,
    pub irradiance: PathBuf,
    pub prefilter: PathBuf,
    pub brdf_lut: PathBuf,
}

impl IblShaders {
    /// The standard file names inside `dir`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            equirect_to_cube: dir.join("equirect_to_cube.comp.spv"),
            irradiance: dir.join("irradiance.comp.spv"),
            prefilter: dir.join("prefilter.comp.spv"),
            brdf_lut: dir.join("brdf_lut.comp.spv"),
        }
    }
}

/// Push constants of the prefilter pass.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PrefilterParams {
    pub roughness: f32,
    /// Width of base level 0, for sample-level selection.
    pub source_resolution: f32,
}

/// Roughness for each prefiltered mip level `1..mip_levels`.
pub fn prefilter_roughness(mip_levels: u32) -> Vec<(u32, f32)> {
    if mip_levels < 2 {
        return Vec::new();
    }
    let last = (mip_levels - 1) as f32;
    (1..mip_levels)
        .map(|level| (level, level as f32 / last))
        .collect()
}

/// Workgroups covering a `width` × `height` target with `layers` layers.
pub fn dispatch_size(width: u32, height: u32, layers: u32, local_size: u32) -> UVec3 {
    UVec3::new(
        group_count(width, local_size),
        group_count(height, local_size),
        layers.max(1),
    )
}

/// Face image paths in layer order, `<folder>/<face>.<extension>`.
pub fn face_paths(folder: impl AsRef<Path>, extension: &str) -> [PathBuf; 6] {
    FACE_NAMES.map(|face| folder.as_ref().join(format!("{face}.{extension}")))
}

/// How far a [`Cubemap`] has progressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CubemapState {
    Empty,
    TextureLoaded,
    EquirectConverted,
    IrradianceGenerated,
    PrefilterGenerated,
}

/// A base environment cube and the lighting maps derived from it.
pub struct Cubemap {
    context: Context,
    texture: Option<Texture>,
    irradiance: Option<Texture>,
    state: CubemapState,
}

impl std::fmt::Debug for Cubemap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cubemap")
            .field("state", &self.state)
            .field("texture", &self.texture)
            .field("irradiance", &self.irradiance)
            .finish()
    }
}

impl Cubemap {
    pub fn new(context: &Context) -> Self {
        Self {
            context: context.clone(),
            texture: None,
            irradiance: None,
            state: CubemapState::Empty,
        }
    }

    /// Loads six face images named after [`FACE_NAMES`] from `folder`.
    pub fn from_faces(context: &Context, folder: impl AsRef<Path>, extension: &str) -> Result<Self> {
        let mut cubemap = Self::new(context);
        cubemap.load_faces(folder, extension)?;
        Ok(cubemap)
    }

    /// Replaces the base texture with six sRGB face images.
    pub fn load_faces(&mut self, folder: impl AsRef<Path>, extension: &str) -> Result<()> {
        let mut builder = Texture::builder().cubemap(true);
        for path in face_paths(folder, extension) {
            builder = builder.add_layer(TextureSource::from_file(path)?);
        }
        let texture = builder.build(&self.context)?;
        self.replace_base(texture, CubemapState::TextureLoaded);
        Ok(())
    }

    /// Decodes an equirectangular HDR panorama and projects it onto a new
    /// `resolution` × `resolution` base cube.
    pub fn create_from_hdri(
        &mut self,
        shaders: &IblShaders,
        path: impl AsRef<Path>,
        resolution: u32,
    ) -> Result<()> {
        let source = TextureSource::from_file(path)?;
        self.create_from_equirect(shaders, source, resolution)
    }

    /// Projects an equirectangular panorama onto a new `resolution` × `resolution` base cube
    /// with a full mip chain. Only level 0 is written; the remaining levels are filled by
    /// [`generate_ibl`](Self::generate_ibl).
    pub fn create_from_equirect(
        &mut self,
        shaders: &IblShaders,
        panorama: TextureSource,
        resolution: u32,
    ) -> Result<()> {
        let texture = (0..6)
            .fold(
                Texture::builder()
                    .cubemap(true)
                    .format(vk::Format::R8G8B8A8_UNORM)
                    .add_usage(vk::ImageUsageFlags::STORAGE)
                    .final_layout(vk::ImageLayout::GENERAL),
                |builder, _| builder.add_layer(TextureSource::solid(Vec4::ONE, resolution, resolution)),
            )
            .build(&self.context)?;

        let equirect = Texture::builder()
            .mipmaps(false)
            .add_layer(panorama)
            .build(&self.context)?;
        let mut pass = ComputePass::new(
            &self.context,
            &shaders.equirect_to_cube,
            &[
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::DescriptorType::STORAGE_IMAGE,
            ],
            0,
            1,
        )?;
        let target = storage_view(&texture, 0)?;
        let set = pass
            .writer()
            .write_image(0, &[equirect.descriptor_info()])
            .write_image(1, &[storage_info(&target)])
            .build()?;
        pass.run(
            &self.context,
            set,
            None,
            dispatch_size(resolution, resolution, 6, EQUIRECT_LOCAL_SIZE),
        )?;
        drop(target);
        self.replace_base(texture, CubemapState::EquirectConverted);
        tracing::info!(resolution, "Projected panorama onto cubemap");
        Ok(())
    }

    /// Derives the diffuse irradiance cube at `resolution` and then the prefiltered specular
    /// chain in the base texture's mip levels.
    ///
    /// # Panics
    ///
    /// Panics if no base texture was loaded, or if the base texture is not a storage-capable
    /// cube kept in `GENERAL`.
    pub fn generate_ibl(&mut self, shaders: &IblShaders, resolution: u32) -> Result<()> {
        let Some(base) = &self.texture else {
            tracing::error!("generate_ibl called on an empty cubemap");
            panic!("Cubemap has no base texture to derive lighting from");
        };
        if base.layout() != vk::ImageLayout::GENERAL
            || !base
                .image()
                .usage()
                .contains(vk::ImageUsageFlags::STORAGE)
        {
            tracing::error!(layout = ?base.layout(), usage = ?base.image().usage(), "Base cubemap cannot be written by compute");
            panic!("Image-based lighting needs a storage cubemap in GENERAL layout");
        }
        let irradiance = generate_irradiance(&self.context, shaders, base, resolution)?;
        self.irradiance = Some(irradiance);
        self.state = CubemapState::IrradianceGenerated;
        prefilter(&self.context, shaders, base)?;
        self.state = CubemapState::PrefilterGenerated;
        Ok(())
    }

    fn replace_base(&mut self, texture: Texture, state: CubemapState) {
        if self.irradiance.take().is_some() {
            tracing::debug!("Discarding irradiance map of the previous base texture");
        }
        self.texture = Some(texture);
        self.state = state;
    }

    pub fn state(&self) -> CubemapState {
        self.state
    }
    pub fn texture(&self) -> Option<&Texture> {
        self.texture.as_ref()
    }
    pub fn irradiance(&self) -> Option<&Texture> {
        self.irradiance.as_ref()
    }
    pub fn descriptor_info(&self) -> Option<vk::DescriptorImageInfo> {
        self.texture.as_ref().map(Texture::descriptor_info)
    }
    pub fn irradiance_descriptor_info(&self) -> Option<vk::DescriptorImageInfo> {
        self.irradiance.as_ref().map(Texture::descriptor_info)
    }
}

fn generate_irradiance(
    context: &Context,
    shaders: &IblShaders,
    base: &Texture,
    resolution: u32,
) -> Result<Texture> {
    let irradiance = (0..6)
        .fold(
            Texture::builder()
                .cubemap(true)
                .mipmaps(false)
                .format(vk::Format::R8G8B8A8_UNORM)
                .add_usage(vk::ImageUsageFlags::STORAGE)
                .final_layout(vk::ImageLayout::GENERAL),
            |builder, _| builder.add_layer(TextureSource::solid(Vec4::ZERO, resolution, resolution)),
        )
        .build(context)?;
    let mut pass = ComputePass::new(
        context,
        &shaders.irradiance,
        &[
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::DescriptorType::STORAGE_IMAGE,
        ],
        0,
        1,
    )?;
    let target = storage_view(&irradiance, 0)?;
    let set = pass
        .writer()
        .write_image(0, &[base.descriptor_info()])
        .write_image(1, &[storage_info(&target)])
        .build()?;
    pass.run(
        context,
        set,
        None,
        dispatch_size(resolution, resolution, 6, IRRADIANCE_LOCAL_SIZE),
    )?;
    tracing::info!(resolution, "Generated irradiance cubemap");
    Ok(irradiance)
}

fn prefilter(context: &Context, shaders: &IblShaders, base: &Texture) -> Result<()> {
    let levels = prefilter_roughness(base.mip_level_count());
    if levels.is_empty() {
        tracing::debug!("Base cubemap has a single mip level; nothing to prefilter");
        return Ok(());
    }
    let mut pass = ComputePass::new(
        context,
        &shaders.prefilter,
        &[
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::DescriptorType::STORAGE_IMAGE,
        ],
        std::mem::size_of::<PrefilterParams>() as u32,
        levels.len() as u32,
    )?;
    let source = ImageView::new(base.image(), vk::ImageViewType::CUBE, 0..1, 0..6)?;
    let source_info = vk::DescriptorImageInfo {
        sampler: base.sampler().vk_handle(),
        image_view: source.vk_handle(),
        image_layout: base.layout(),
    };
    for (level, roughness) in levels {
        let (width, height) = mip_extent(base.width(), base.height(), level);
        let target = storage_view(base, level)?;
        let set = pass
            .writer()
            .write_image(0, &[source_info])
            .write_image(1, &[storage_info(&target)])
            .build()?;
        let params = PrefilterParams {
            roughness,
            source_resolution: base.width() as f32,
        };
        pass.run(
            context,
            set,
            Some(bytemuck::bytes_of(&params)),
            dispatch_size(width, height, 6, PREFILTER_LOCAL_SIZE),
        )?;
        tracing::trace!(level, roughness, width, "Prefiltered mip level");
    }
    tracing::info!(levels = base.mip_level_count(), "Prefiltered environment");
    Ok(())
}

/// Fills a `resolution` × `resolution` split-sum BRDF lookup table (`R16G16_SFLOAT`,
/// clamp-to-edge, kept in `GENERAL`). [`DEFAULT_BRDF_LUT_SIZE`] suits most scenes.
pub fn generate_brdf_lut(context: &Context, shaders: &IblShaders, resolution: u32) -> Result<Texture> {
    let lut = Texture::builder()
        .format(vk::Format::R16G16_SFLOAT)
        .address_mode(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .add_usage(vk::ImageUsageFlags::STORAGE)
        .mipmaps(false)
        .final_layout(vk::ImageLayout::GENERAL)
        .add_layer(TextureSource::solid(Vec4::ZERO, resolution, resolution))
        .build(context)?;
    let mut pass = ComputePass::new(
        context,
        &shaders.brdf_lut,
        &[vk::DescriptorType::STORAGE_IMAGE],
        0,
        1,
    )?;
    let set = pass
        .writer()
        .write_image(0, &[lut.descriptor_info()])
        .build()?;
    pass.run(
        context,
        set,
        None,
        dispatch_size(resolution, resolution, 1, BRDF_LUT_LOCAL_SIZE),
    )?;
    tracing::info!(resolution, "Generated BRDF lookup table");
    Ok(lut)
}

/// A single-level, six-layer view for `imageStore` into one mip of a cube.
fn storage_view(texture: &Texture, level: u32) -> Result<ImageView> {
    Ok(ImageView::new(
        texture.image(),
        vk::ImageViewType::TYPE_2D_ARRAY,
        level..level + 1,
        0..texture.layer_count(),
    )?)
}

fn storage_info(view: &ImageView) -> vk::DescriptorImageInfo {
    vk::DescriptorImageInfo {
        sampler: vk::Sampler::null(),
        image_view: view.vk_handle(),
        image_layout: vk::ImageLayout::GENERAL,
    }
}

/// A compute pipeline with a single descriptor set of compute-stage bindings, numbered in
/// order from 0, and a pool sized for `max_sets` sets.
struct ComputePass {
    pool: DescriptorPool,
    pipeline: Pipeline,
    set_layout: Arc<DescriptorSetLayout>,
}

impl ComputePass {
    fn new(
        context: &Context,
        shader: &Path,
        bindings: &[vk::DescriptorType],
        push_constant_size: u32,
        max_sets: u32,
    ) -> Result<Self> {
        let device = context.device().clone();
        let set_layout = bindings
            .iter()
            .enumerate()
            .fold(DescriptorSetLayout::builder(), |builder, (binding, ty)| {
                builder.add_binding(binding as u32, *ty, vk::ShaderStageFlags::COMPUTE, 1)
            })
            .build(device.clone())?;
        let set_layout = Arc::new(set_layout);

        let pool = set_layout
            .bindings()
            .type_counts()
            .into_iter()
            .fold(
                DescriptorPool::builder().max_sets(max_sets),
                |builder, (ty, count)| builder.add_pool_size(ty, count * max_sets),
            )
            .build(device.clone())?;

        let push_constant_ranges: SmallVec<[vk::PushConstantRange; 1]> = (push_constant_size > 0)
            .then_some(vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::COMPUTE,
                offset: 0,
                size: push_constant_size,
            })
            .into_iter()
            .collect();
        let layout = Arc::new(PipelineLayout::new(
            device.clone(),
            vec![set_layout.clone()],
            &push_constant_ranges,
        )?);
        let module = ShaderModule::from_file(device, shader)?;
        let pipeline = Pipeline::compute(layout, &module, ENTRY_POINT)?;
        Ok(Self {
            pool,
            pipeline,
            set_layout,
        })
    }

    fn writer(&mut self) -> DescriptorWriter<'_> {
        DescriptorWriter::new(&self.set_layout, &mut self.pool)
    }

    /// Dispatches `groups` workgroups and waits for them. Storage writes are made visible
    /// to later compute and fragment sampling.
    fn run(
        &self,
        context: &Context,
        set: vk::DescriptorSet,
        push_constants: Option<&[u8]>,
        groups: UVec3,
    ) -> Result<()> {
        let layout = self.pipeline.layout();
        context.one_shot(|encoder| {
            encoder.memory_barrier(Access::COMPUTE_WRITE, Access::COMPUTE_READ);
            encoder.emit_barriers();
            encoder.bind_pipeline(vk::PipelineBindPoint::COMPUTE, &self.pipeline);
            encoder.bind_descriptor_sets(vk::PipelineBindPoint::COMPUTE, layout, 0, &[set], &[]);
            if let Some(constants) = push_constants {
                encoder.push_constants(layout, vk::ShaderStageFlags::COMPUTE, 0, constants);
            }
            encoder.dispatch(groups);
            encoder.memory_barrier(Access::COMPUTE_WRITE, Access::SHADER_SAMPLED_READ);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faces_load_in_layer_order() {
        let paths = face_paths("skybox", "png");
        let names: Vec<_> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(
            names,
            ["right.png", "left.png", "bottom.png", "top.png", "front.png", "back.png"]
        );
        assert!(paths.iter().all(|p| p.starts_with("skybox")));
    }

    #[test]
    fn shader_files_from_dir() {
        let shaders = IblShaders::from_dir("/shaders");
        assert_eq!(
            shaders.equirect_to_cube,
            Path::new("/shaders/equirect_to_cube.comp.spv")
        );
        assert_eq!(shaders.brdf_lut, Path::new("/shaders/brdf_lut.comp.spv"));
    }

    #[test]
    fn roughness_spans_zero_to_one_over_the_chain() {
        assert!(prefilter_roughness(1).is_empty());
        assert_eq!(prefilter_roughness(2), vec![(1, 1.0)]);
        let levels = prefilter_roughness(10);
        assert_eq!(levels.len(), 9);
        assert_eq!(levels[0], (1, 1.0 / 9.0));
        assert_eq!(levels[8], (9, 1.0));
    }

    #[test]
    fn dispatch_keeps_one_group_for_small_mips() {
        assert_eq!(dispatch_size(512, 512, 6, 32), UVec3::new(16, 16, 6));
        assert_eq!(dispatch_size(32, 32, 6, 16), UVec3::new(2, 2, 6));
        assert_eq!(dispatch_size(4, 4, 6, 16), UVec3::new(1, 1, 6));
        assert_eq!(dispatch_size(1, 1, 0, 16), UVec3::new(1, 1, 1));
    }

    #[test]
    fn brdf_lut_defaults_to_512() {
        assert_eq!(DEFAULT_BRDF_LUT_SIZE, 512);
        assert_eq!(
            dispatch_size(DEFAULT_BRDF_LUT_SIZE, DEFAULT_BRDF_LUT_SIZE, 1, BRDF_LUT_LOCAL_SIZE),
            UVec3::new(16, 16, 1)
        );
    }

    #[test]
    fn prefilter_params_are_push_constant_sized() {
        assert_eq!(std::mem::size_of::<PrefilterParams>(), 8);
        assert_eq!(std::mem::size_of::<PrefilterParams>() % 4, 0);
    }

    #[test]
    fn states_are_ordered() {
        assert!(CubemapState::Empty < CubemapState::TextureLoaded);
        assert!(CubemapState::EquirectConverted < CubemapState::IrradianceGenerated);
        assert!(CubemapState::IrradianceGenerated < CubemapState::PrefilterGenerated);
    }

    #[test]
    #[ignore = "requires a Vulkan device and TEPHRA_SHADER_DIR"]
    fn panorama_to_full_ibl() {
        let context = crate::context::test_context();
        let shaders = IblShaders::from_dir(crate::context::test_shader_dir());
        let mut cubemap = Cubemap::new(&context);
        assert_eq!(cubemap.state(), CubemapState::Empty);
        assert!(cubemap.descriptor_info().is_none());

        let panorama = TextureSource::solid(Vec4::new(0.2, 0.4, 0.8, 1.0), 128, 64);
        cubemap
            .create_from_equirect(&shaders, panorama, 512)
            .unwrap();
        assert_eq!(cubemap.state(), CubemapState::EquirectConverted);
        cubemap.generate_ibl(&shaders, 32).unwrap();
        assert_eq!(cubemap.state(), CubemapState::PrefilterGenerated);

        let base = cubemap.texture().unwrap();
        assert_eq!((base.width(), base.height(), base.layer_count()), (512, 512, 6));
        assert_eq!(base.mip_level_count(), 10);
        let irradiance = cubemap.irradiance().unwrap();
        assert_eq!(
            (irradiance.width(), irradiance.height(), irradiance.layer_count()),
            (32, 32, 6)
        );
        assert_eq!(irradiance.mip_level_count(), 1);

        let lut = generate_brdf_lut(&context, &shaders, DEFAULT_BRDF_LUT_SIZE).unwrap();
        assert_eq!((lut.width(), lut.height()), (512, 512));
        assert_eq!(lut.format(), vk::Format::R16G16_SFLOAT);
        assert_eq!(lut.layout(), vk::ImageLayout::GENERAL);
    }
}
