//! Buffer and image transfer commands.
//!
//! This module extends [`CommandEncoder`] with methods for copying data between
//! buffers and images.
use ash::vk;

use crate::{HasDevice, buffer::Buffer, image::ImageLike, utils::AsVkHandle};

use super::CommandEncoder;

impl CommandEncoder<'_> {
    pub fn copy_buffer(&mut self, src: &Buffer, dst: &Buffer, size: vk::DeviceSize) {
        debug_assert!(size <= src.buffer_size() && size <= dst.buffer_size());
        unsafe {
            self.device().cmd_copy_buffer(
                self.buffer().vk_handle(),
                src.vk_handle(),
                dst.vk_handle(),
                &[vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size,
                }],
            );
        }
    }

    pub fn copy_buffer_to_image_with_layout(
        &mut self,
        buffer: &Buffer,
        image: &impl ImageLike,
        copies: &[vk::BufferImageCopy],
        image_layout: vk::ImageLayout,
    ) {
        unsafe {
            self.device().cmd_copy_buffer_to_image(
                self.buffer().vk_handle(),
                buffer.vk_handle(),
                image.vk_handle(),
                image_layout,
                copies,
            );
        }
    }

    pub fn copy_image_to_buffer_with_layout(
        &mut self,
        image: &impl ImageLike,
        image_layout: vk::ImageLayout,
        buffer: &Buffer,
        copies: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device().cmd_copy_image_to_buffer(
                self.buffer().vk_handle(),
                image.vk_handle(),
                image_layout,
                buffer.vk_handle(),
                copies,
            );
        }
    }

    pub fn blit_image_with_layout(
        &mut self,
        src: &impl ImageLike,
        src_image_layout: vk::ImageLayout,
        dst: &impl ImageLike,
        dst_image_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        unsafe {
            self.device().cmd_blit_image(
                self.buffer().vk_handle(),
                src.vk_handle(),
                src_image_layout,
                dst.vk_handle(),
                dst_image_layout,
                regions,
                filter,
            );
        }
    }
}
