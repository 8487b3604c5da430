//! Image and image view abstractions.
//!
//! - [`Image`]: a device-local image allocated through VMA
//! - [`ImageView`]: a view over a mip and array-layer range of an image
//! - [`ImageLike`]: what barrier, copy and blit commands need to know about an image

use std::ops::Range;

use ash::{prelude::VkResult, vk};
use glam::UVec3;
use vk_mem::Alloc;

use crate::{Allocator, Device, HasDevice, utils::AsVkHandle};

pub trait ImageLike: AsVkHandle<Handle = vk::Image> {
    fn aspects(&self) -> vk::ImageAspectFlags {
        format_aspects(self.format())
    }

    fn array_layer_count(&self) -> u32;

    fn mip_level_count(&self) -> u32;

    fn extent(&self) -> UVec3;

    fn format(&self) -> vk::Format;
}

/// The aspects an image of `format` carries.
pub fn format_aspects(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// A 2D image (optionally with several array layers and mip levels) in device-local memory.
pub struct Image {
    allocator: Allocator,
    handle: vk::Image,
    allocation: vk_mem::Allocation,
    extent: UVec3,
    array_layer_count: u32,
    mip_level_count: u32,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
}
impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            self.allocator
                .destroy_image(self.handle, &mut self.allocation);
        }
    }
}
impl HasDevice for Image {
    fn device(&self) -> &Device {
        self.allocator.device()
    }
}
impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("handle", &self.handle)
            .field("extent", &self.extent)
            .field("format", &self.format)
            .field("layers", &self.array_layer_count)
            .field("mips", &self.mip_level_count)
            .finish()
    }
}
impl Image {
    /// Allocates an image from device-local memory.
    pub fn new_private(allocator: Allocator, info: &vk::ImageCreateInfo) -> VkResult<Self> {
        let (image, allocation) = unsafe {
            allocator.create_image(
                info,
                &vk_mem::AllocationCreateInfo {
                    usage: vk_mem::MemoryUsage::AutoPreferDevice,
                    required_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    ..Default::default()
                },
            )?
        };
        Ok(Self {
            extent: UVec3::new(info.extent.width, info.extent.height, info.extent.depth),
            allocator,
            handle: image,
            allocation,
            format: info.format,
            array_layer_count: info.array_layers,
            mip_level_count: info.mip_levels,
            usage: info.usage,
        })
    }

    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }
}
impl ImageLike for Image {
    fn extent(&self) -> UVec3 {
        self.extent
    }
    fn format(&self) -> vk::Format {
        self.format
    }
    fn array_layer_count(&self) -> u32 {
        self.array_layer_count
    }
    fn mip_level_count(&self) -> u32 {
        self.mip_level_count
    }
}
impl AsVkHandle for Image {
    type Handle = vk::Image;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

/// An image view. The view does not keep its image alive; owners declare the view after
/// the image so it is destroyed first.
pub struct ImageView {
    device: Device,
    view: vk::ImageView,
    ty: vk::ImageViewType,
    mip_levels: Range<u32>,
    array_layers: Range<u32>,
}
impl ImageView {
    pub fn new(
        image: &(impl ImageLike + HasDevice),
        ty: vk::ImageViewType,
        mip_levels: Range<u32>,
        array_layers: Range<u32>,
    ) -> VkResult<Self> {
        Self::from_raw_image(
            image.device().clone(),
            image.vk_handle(),
            image.format(),
            image.aspects(),
            ty,
            mip_levels,
            array_layers,
        )
    }

    /// Creates a view over an image the engine does not own, such as a swapchain image.
    pub(crate) fn from_raw_image(
        device: Device,
        image: vk::Image,
        format: vk::Format,
        aspect_mask: vk::ImageAspectFlags,
        ty: vk::ImageViewType,
        mip_levels: Range<u32>,
        array_layers: Range<u32>,
    ) -> VkResult<Self> {
        let view = unsafe {
            device.create_image_view(
                &vk::ImageViewCreateInfo {
                    image,
                    view_type: ty,
                    format,
                    components: vk::ComponentMapping::default(),
                    subresource_range: vk::ImageSubresourceRange {
                        aspect_mask,
                        base_mip_level: mip_levels.start,
                        level_count: mip_levels.len() as u32,
                        base_array_layer: array_layers.start,
                        layer_count: array_layers.len() as u32,
                    },
                    ..Default::default()
                },
                None,
            )?
        };
        Ok(Self {
            device,
            view,
            ty,
            mip_levels,
            array_layers,
        })
    }

    pub fn ty(&self) -> vk::ImageViewType {
        self.ty
    }
    pub fn mip_levels(&self) -> Range<u32> {
        self.mip_levels.clone()
    }
    pub fn array_layers(&self) -> Range<u32> {
        self.array_layers.clone()
    }
}
impl AsVkHandle for ImageView {
    type Handle = vk::ImageView;
    fn vk_handle(&self) -> Self::Handle {
        self.view
    }
}
impl HasDevice for ImageView {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl Drop for ImageView {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.view, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aspects_follow_format() {
        assert_eq!(
            format_aspects(vk::Format::R8G8B8A8_SRGB),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(
            format_aspects(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            format_aspects(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }
}
