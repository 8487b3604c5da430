//! Sampled textures: pixel sources, the texture builder and layout tracking.
//!
//! A [`Texture`] owns an image with one or more array layers, a view over every mip level and
//! layer, and a sampler. Textures are assembled with [`TextureBuilder`] from
//! [`TextureSource`]s, one per layer:
//!
//! ```no_run
//! # use tephra::{context::Context, texture::{Texture, TextureSource}, ash::vk, glam::Vec4};
//! # let context = Context::headless().unwrap();
//! let texture = Texture::builder()
//!     .add_layer(TextureSource::solid(Vec4::ONE, 4, 4))
//!     .address_mode(vk::SamplerAddressMode::CLAMP_TO_EDGE)
//!     .build(&context)
//!     .unwrap();
//! let info = texture.descriptor_info();
//! ```
//!
//! The texture remembers its current image layout. Layouts only move along the edges of
//! [`layout_transition`]; any other move is a programming error.

use std::path::Path;

use ash::vk;
use glam::Vec4;

use crate::{
    HasDevice,
    buffer::Buffer,
    context::Context,
    error::Result,
    image::{Image, ImageLike, ImageView},
    sampler::Sampler,
    tracking::{Access, layout_transition},
    utils::AsVkHandle,
};

/// Number of levels in a full mip chain: `floor(log2(max(width, height))) + 1`.
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    u32::BITS - width.max(height).max(1).leading_zeros()
}

/// Extent of mip `level` for a base extent of `width` × `height`. Never smaller than 1×1.
pub fn mip_extent(width: u32, height: u32, level: u32) -> (u32, u32) {
    let shrink = |size: u32| size.checked_shr(level).unwrap_or(0).max(1);
    (shrink(width), shrink(height))
}

/// Byte size of `width` × `height` tightly packed pixels, or `None` if it does not fit a
/// `usize`.
pub fn pixel_bytes(width: u32, height: u32, bytes_per_pixel: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(bytes_per_pixel as usize)
}

/// Host pixels for one texture layer.
#[derive(Clone, Debug)]
pub struct TextureSource {
    width: u32,
    height: u32,
    bytes_per_pixel: u32,
    data: Vec<u8>,
}

impl TextureSource {
    /// Tightly packed pixels.
    ///
    /// # Panics
    ///
    /// Panics if `data` is not exactly `width * height * bytes_per_pixel` bytes.
    pub fn from_raw(width: u32, height: u32, bytes_per_pixel: u32, data: Vec<u8>) -> Self {
        assert!(
            pixel_bytes(width, height, bytes_per_pixel) == Some(data.len()),
            "Texture source size does not match its dimensions"
        );
        Self {
            width,
            height,
            bytes_per_pixel,
            data,
        }
    }

    /// Decodes an image file into 8-bit RGBA.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let pixels = image::open(path)?.into_rgba8();
        tracing::debug!(path = %path.display(), width = pixels.width(), height = pixels.height(), "decoded texture");
        Ok(Self::from_raw(
            pixels.width(),
            pixels.height(),
            4,
            pixels.into_raw(),
        ))
    }

    /// Decodes an image file into 32-bit float RGBA, for HDR data.
    pub fn from_float_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let pixels = image::open(path)?.into_rgba32f();
        tracing::debug!(path = %path.display(), width = pixels.width(), height = pixels.height(), "decoded float texture");
        let (width, height) = pixels.dimensions();
        Ok(Self::from_raw(
            width,
            height,
            16,
            bytemuck::cast_slice::<f32, u8>(pixels.as_raw().as_slice()).to_vec(),
        ))
    }

    /// A single color in 8-bit RGBA. Channels are scaled by 255 and truncated.
    pub fn solid(color: Vec4, width: u32, height: u32) -> Self {
        let texel = color.to_array().map(|c| (c * 255.0) as u8);
        Self::from_raw(width, height, 4, texel.repeat(width as usize * height as usize))
    }

    /// A single color in 32-bit float RGBA.
    pub fn float_solid(color: Vec4, width: u32, height: u32) -> Self {
        let texel = color.to_array();
        let texel: &[u8] = bytemuck::cast_slice(texel.as_slice());
        Self::from_raw(width, height, 16, texel.repeat(width as usize * height as usize))
    }

    pub fn width(&self) -> u32 {
        self.width
    }
    pub fn height(&self) -> u32 {
        self.height
    }
    pub fn bytes_per_pixel(&self) -> u32 {
        self.bytes_per_pixel
    }
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Builder for [`Texture`]. Consumed by [`build`](Self::build).
pub struct TextureBuilder {
    layers: Vec<TextureSource>,
    format: vk::Format,
    filter: vk::Filter,
    address_mode: vk::SamplerAddressMode,
    cubemap: bool,
    final_layout: vk::ImageLayout,
    mipmaps: bool,
    extra_usage: vk::ImageUsageFlags,
}

impl Default for TextureBuilder {
    fn default() -> Self {
        Self {
            layers: Vec::new(),
            format: vk::Format::R8G8B8A8_SRGB,
            filter: vk::Filter::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            cubemap: false,
            final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            mipmaps: true,
            extra_usage: vk::ImageUsageFlags::empty(),
        }
    }
}

impl TextureBuilder {
    /// Appends a layer.
    ///
    /// # Panics
    ///
    /// Panics if the source's dimensions or pixel size differ from the first layer's.
    pub fn add_layer(mut self, source: TextureSource) -> Self {
        if let Some(first) = self.layers.first() {
            if (first.width, first.height, first.bytes_per_pixel)
                != (source.width, source.height, source.bytes_per_pixel)
            {
                tracing::error!(
                    expected = ?(first.width, first.height, first.bytes_per_pixel),
                    got = ?(source.width, source.height, source.bytes_per_pixel),
                    "Texture layers must share one shape"
                );
                panic!("Texture layers must share dimensions and pixel size");
            }
        }
        self.layers.push(source);
        self
    }

    pub fn format(mut self, format: vk::Format) -> Self {
        self.format = format;
        self
    }

    pub fn filter(mut self, filter: vk::Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn address_mode(mut self, address_mode: vk::SamplerAddressMode) -> Self {
        self.address_mode = address_mode;
        self
    }

    /// Creates a cube-compatible image and a cube view. Requires six layers.
    pub fn cubemap(mut self, cubemap: bool) -> Self {
        self.cubemap = cubemap;
        self
    }

    /// The layout the texture is left in after construction.
    pub fn final_layout(mut self, layout: vk::ImageLayout) -> Self {
        self.final_layout = layout;
        self
    }

    pub fn mipmaps(mut self, mipmaps: bool) -> Self {
        self.mipmaps = mipmaps;
        self
    }

    pub fn add_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.extra_usage |= usage;
        self
    }

    /// Image usage the built texture will carry.
    pub fn usage(&self) -> vk::ImageUsageFlags {
        let mut usage =
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED | self.extra_usage;
        if self.mipmaps {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        usage
    }

    /// Width, height and pixel size shared by every layer.
    fn layer_shape(&self) -> (u32, u32, u32) {
        let Some(first) = self.layers.first() else {
            tracing::error!("Texture built without layers");
            panic!("A texture needs at least one layer");
        };
        if self.cubemap && self.layers.len() != 6 {
            tracing::error!(layers = self.layers.len(), "Cubemap needs six layers");
            panic!("A cubemap texture needs exactly six layers");
        }
        (first.width, first.height, first.bytes_per_pixel)
    }

    /// Uploads every layer, generates mips when enabled and leaves the texture in the
    /// requested final layout.
    ///
    /// # Panics
    ///
    /// Panics if no layer was added, or if a cubemap does not have six layers.
    pub fn build(self, context: &Context) -> Result<Texture> {
        let (width, height, bytes_per_pixel) = self.layer_shape();
        let layer_count = self.layers.len() as u32;
        let mip_levels = if self.mipmaps {
            mip_level_count(width, height)
        } else {
            1
        };
        let usage = self.usage();

        let pixels: Vec<u8> = self
            .layers
            .iter()
            .flat_map(|layer| layer.data.iter().copied())
            .collect();
        let staging = Buffer::new_staging(context.allocator().clone(), &pixels)?;

        let image = Image::new_private(
            context.allocator().clone(),
            &vk::ImageCreateInfo {
                flags: if self.cubemap {
                    vk::ImageCreateFlags::CUBE_COMPATIBLE
                } else {
                    vk::ImageCreateFlags::empty()
                },
                image_type: vk::ImageType::TYPE_2D,
                format: self.format,
                extent: vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                },
                mip_levels,
                array_layers: layer_count,
                samples: vk::SampleCountFlags::TYPE_1,
                tiling: vk::ImageTiling::OPTIMAL,
                usage,
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                ..Default::default()
            },
        )?;
        let view_type = if self.cubemap {
            vk::ImageViewType::CUBE
        } else if layer_count > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let view = ImageView::new(&image, view_type, 0..mip_levels, 0..layer_count)?;
        let sampler = Sampler::for_texture(
            context.device().clone(),
            self.filter,
            self.address_mode,
            mip_levels,
        )?;

        let mut texture = Texture {
            sampler,
            view,
            image,
            context: context.clone(),
            layout: vk::ImageLayout::UNDEFINED,
            bytes_per_pixel,
            cubemap: self.cubemap,
        };
        texture.transition_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
        context.copy_buffer_to_image(&staging, &texture.image, width, height, layer_count)?;
        if self.mipmaps {
            texture.generate_mipmaps()?;
            if self.final_layout != vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL {
                texture.transition_layout(self.final_layout)?;
            }
        } else {
            texture.transition_layout(self.final_layout)?;
        }
        tracing::debug!(
            width,
            height,
            layers = layer_count,
            mips = mip_levels,
            format = ?self.format,
            layout = ?texture.layout,
            "created texture"
        );
        Ok(texture)
    }
}

/// A sampled image with its view, sampler and tracked layout.
pub struct Texture {
    // Destroyed before the image they refer to.
    sampler: Sampler,
    view: ImageView,
    image: Image,
    context: Context,
    layout: vk::ImageLayout,
    bytes_per_pixel: u32,
    cubemap: bool,
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("image", &self.image)
            .field("layout", &self.layout)
            .field("cubemap", &self.cubemap)
            .finish_non_exhaustive()
    }
}

impl Texture {
    pub fn builder() -> TextureBuilder {
        TextureBuilder::default()
    }

    /// Moves every mip level and layer to `new_layout` with a one-shot barrier.
    ///
    /// # Panics
    ///
    /// Panics if the move is not one of the supported transitions.
    pub fn transition_layout(&mut self, new_layout: vk::ImageLayout) -> Result<()> {
        let old_layout = self.layout;
        let transition = match layout_transition(old_layout, new_layout) {
            Ok(transition) => transition,
            Err(err) => {
                tracing::error!(%err, image = ?self.image.vk_handle(), "Illegal texture layout transition");
                panic!("{err}");
            }
        };
        let image = &self.image;
        self.context.one_shot(|encoder| {
            encoder.image_barrier(
                image,
                transition.before,
                transition.after,
                old_layout,
                new_layout,
                0..image.mip_level_count(),
                0..image.array_layer_count(),
            );
        })?;
        self.layout = new_layout;
        Ok(())
    }

    /// Fills mip levels 1.. by repeatedly blitting each level into the next, across all
    /// layers. Leaves every level in `SHADER_READ_ONLY_OPTIMAL`.
    ///
    /// # Panics
    ///
    /// Panics if the format does not support linear filtering of optimal-tiled images, or
    /// if the texture is not in `TRANSFER_DST_OPTIMAL`.
    fn generate_mipmaps(&mut self) -> Result<()> {
        let format = self.image.format();
        let features = self
            .context
            .physical_device()
            .format_properties(format)
            .optimal_tiling_features;
        if !features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR) {
            tracing::error!(?format, "Format does not support linear blitting");
            panic!("Texture image format {format:?} does not support linear blitting");
        }
        assert_eq!(self.layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        let image = &self.image;
        let layers = 0..image.array_layer_count();
        let levels = image.mip_level_count();
        let extent = image.extent();
        let aspect_mask = image.aspects();
        self.context.one_shot(|encoder| {
            for level in 1..levels {
                let (src_w, src_h) = mip_extent(extent.x, extent.y, level - 1);
                let (dst_w, dst_h) = mip_extent(extent.x, extent.y, level);
                encoder.image_barrier(
                    image,
                    Access::TRANSFER_WRITE,
                    Access::TRANSFER_READ,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    level - 1..level,
                    layers.clone(),
                );
                encoder.emit_barriers();
                encoder.blit_image_with_layout(
                    image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[vk::ImageBlit {
                        src_subresource: vk::ImageSubresourceLayers {
                            aspect_mask,
                            mip_level: level - 1,
                            base_array_layer: layers.start,
                            layer_count: layers.len() as u32,
                        },
                        src_offsets: [
                            vk::Offset3D::default(),
                            vk::Offset3D {
                                x: src_w as i32,
                                y: src_h as i32,
                                z: 1,
                            },
                        ],
                        dst_subresource: vk::ImageSubresourceLayers {
                            aspect_mask,
                            mip_level: level,
                            base_array_layer: layers.start,
                            layer_count: layers.len() as u32,
                        },
                        dst_offsets: [
                            vk::Offset3D::default(),
                            vk::Offset3D {
                                x: dst_w as i32,
                                y: dst_h as i32,
                                z: 1,
                            },
                        ],
                    }],
                    vk::Filter::LINEAR,
                );
                encoder.image_barrier(
                    image,
                    Access::TRANSFER_READ,
                    Access::SHADER_SAMPLED_READ,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    level - 1..level,
                    layers.clone(),
                );
            }
            encoder.image_barrier(
                image,
                Access::TRANSFER_WRITE,
                Access::SHADER_SAMPLED_READ,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                levels - 1..levels,
                layers.clone(),
            );
        })?;
        self.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        Ok(())
    }

    /// Copies the pixels of one layer and mip level back to host memory.
    ///
    /// The texture must have been created with `TRANSFER_SRC` usage, which every
    /// mipmapped texture has. Its tracked layout is unchanged afterwards.
    pub fn read_back(&self, layer: u32, level: u32) -> Result<Vec<u8>> {
        assert!(
            self.image
                .usage()
                .contains(vk::ImageUsageFlags::TRANSFER_SRC),
            "Texture was not created with TRANSFER_SRC usage"
        );
        assert!(layer < self.layer_count() && level < self.mip_level_count());
        let (width, height) = mip_extent(self.width(), self.height(), level);
        let size = width as vk::DeviceSize
            * height as vk::DeviceSize
            * self.bytes_per_pixel as vk::DeviceSize;
        let mut readback = Buffer::new(
            self.context.allocator().clone(),
            size,
            1,
            vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            1,
        )?;
        let image = &self.image;
        let layout = self.layout;
        let any_access = Access {
            stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            access: vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
        };
        self.context.one_shot(|encoder| {
            encoder.image_barrier(
                image,
                any_access,
                Access::TRANSFER_READ,
                layout,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                level..level + 1,
                layer..layer + 1,
            );
            encoder.emit_barriers();
            encoder.copy_image_to_buffer_with_layout(
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                &readback,
                &[vk::BufferImageCopy {
                    buffer_offset: 0,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: image.aspects(),
                        mip_level: level,
                        base_array_layer: layer,
                        layer_count: 1,
                    },
                    image_offset: vk::Offset3D::default(),
                    image_extent: vk::Extent3D {
                        width,
                        height,
                        depth: 1,
                    },
                }],
            );
            encoder.image_barrier(
                image,
                Access::TRANSFER_READ,
                any_access,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                layout,
                level..level + 1,
                layer..layer + 1,
            );
            encoder.memory_barrier(Access::TRANSFER_WRITE, Access::HOST_READ);
        })?;
        readback.map()?;
        readback.invalidate(vk::WHOLE_SIZE, 0)?;
        Ok(readback.read_mapped().unwrap_or_default())
    }

    /// Sampler, view and current layout, ready for a combined-image-sampler or
    /// storage-image descriptor write.
    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler.vk_handle(),
            image_view: self.view.vk_handle(),
            image_layout: self.layout,
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
    pub fn image(&self) -> &Image {
        &self.image
    }
    pub fn view(&self) -> &ImageView {
        &self.view
    }
    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }
    pub fn width(&self) -> u32 {
        self.image.extent().x
    }
    pub fn height(&self) -> u32 {
        self.image.extent().y
    }
    pub fn format(&self) -> vk::Format {
        self.image.format()
    }
    pub fn mip_level_count(&self) -> u32 {
        self.image.mip_level_count()
    }
    pub fn layer_count(&self) -> u32 {
        self.image.array_layer_count()
    }
    pub fn is_cubemap(&self) -> bool {
        self.cubemap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_chain_length() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(2, 1), 2);
        assert_eq!(mip_level_count(512, 512), 10);
        assert_eq!(mip_level_count(640, 480), 10);
        assert_eq!(mip_level_count(1024, 3), 11);
        assert_eq!(mip_level_count(0, 0), 1);
    }

    #[test]
    fn mip_extents_halve_and_clamp() {
        assert_eq!(mip_extent(640, 480, 0), (640, 480));
        assert_eq!(mip_extent(640, 480, 1), (320, 240));
        assert_eq!(mip_extent(640, 480, 9), (1, 1));
        assert_eq!(mip_extent(1024, 3, 2), (256, 1));
        assert_eq!(mip_extent(8, 8, 40), (1, 1));
    }

    #[test]
    fn solid_sources_pack_rgba() {
        let source = TextureSource::solid(Vec4::new(1.0, 0.5, 0.0, 1.0), 2, 3);
        assert_eq!(source.bytes_per_pixel(), 4);
        assert_eq!(source.data().len(), 2 * 3 * 4);
        assert_eq!(&source.data()[..4], &[255, 127, 0, 255]);
        assert_eq!(&source.data()[20..], &[255, 127, 0, 255]);

        let float = TextureSource::float_solid(Vec4::new(2.0, 0.25, 0.0, 1.0), 1, 2);
        assert_eq!(float.bytes_per_pixel(), 16);
        let texels: Vec<f32> = float
            .data()
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(texels, [2.0, 0.25, 0.0, 1.0, 2.0, 0.25, 0.0, 1.0]);
    }

    #[test]
    fn pixel_bytes_does_not_overflow() {
        assert_eq!(pixel_bytes(2, 3, 4), Some(24));
        assert_eq!(pixel_bytes(0, 3, 4), Some(0));
        #[cfg(target_pointer_width = "64")]
        assert_eq!(pixel_bytes(65536, 65536, 4), Some(1 << 34));
        assert_eq!(pixel_bytes(u32::MAX, u32::MAX, u32::MAX), None);
    }

    #[test]
    #[should_panic(expected = "does not match its dimensions")]
    fn huge_source_reports_size_mismatch() {
        TextureSource::from_raw(65536, 65536, 4, vec![0; 4]);
    }

    #[test]
    fn builder_defaults_and_usage() {
        let builder = Texture::builder();
        assert_eq!(builder.format, vk::Format::R8G8B8A8_SRGB);
        assert_eq!(builder.filter, vk::Filter::LINEAR);
        assert_eq!(builder.address_mode, vk::SamplerAddressMode::REPEAT);
        assert_eq!(
            builder.final_layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert!(builder.mipmaps && !builder.cubemap);
        assert_eq!(
            builder.usage(),
            vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC
        );

        let storage = Texture::builder()
            .mipmaps(false)
            .add_usage(vk::ImageUsageFlags::STORAGE);
        assert_eq!(
            storage.usage(),
            vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::STORAGE
        );
    }

    #[test]
    #[should_panic(expected = "share dimensions")]
    fn mismatched_layers_panic() {
        let _ = Texture::builder()
            .add_layer(TextureSource::solid(Vec4::ONE, 4, 4))
            .add_layer(TextureSource::solid(Vec4::ONE, 2, 2));
    }

    #[test]
    #[should_panic(expected = "at least one layer")]
    fn zero_layers_panic() {
        Texture::builder().layer_shape();
    }

    #[test]
    #[should_panic(expected = "exactly six layers")]
    fn cubemap_needs_six_layers() {
        Texture::builder()
            .cubemap(true)
            .add_layer(TextureSource::solid(Vec4::ONE, 4, 4))
            .layer_shape();
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn solid_texture_round_trips_every_mip() {
        let context = crate::context::test_context();
        let texture = Texture::builder()
            .format(vk::Format::R8G8B8A8_UNORM)
            .add_layer(TextureSource::solid(Vec4::new(1.0, 0.0, 0.0, 1.0), 8, 4))
            .build(&context)
            .unwrap();
        assert_eq!(texture.mip_level_count(), 4);
        assert_eq!(
            texture.layout(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        for level in 0..texture.mip_level_count() {
            let pixels = texture.read_back(0, level).unwrap();
            let (w, h) = mip_extent(8, 4, level);
            assert_eq!(pixels.len(), (w * h * 4) as usize);
            assert!(pixels.chunks(4).all(|p| p == [255, 0, 0, 255]));
        }
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn general_final_layout_is_honored() {
        let context = crate::context::test_context();
        let texture = Texture::builder()
            .format(vk::Format::R8G8B8A8_UNORM)
            .cubemap(true)
            .add_usage(vk::ImageUsageFlags::STORAGE)
            .final_layout(vk::ImageLayout::GENERAL);
        let texture = (0..6)
            .fold(texture, |b, _| b.add_layer(TextureSource::solid(Vec4::ONE, 16, 16)))
            .build(&context)
            .unwrap();
        assert_eq!(texture.layout(), vk::ImageLayout::GENERAL);
        assert_eq!(texture.layer_count(), 6);
        assert_eq!(texture.descriptor_info().image_layout, vk::ImageLayout::GENERAL);
    }
}
