//! Vulkan sampler management.
//!
//! Samplers define how textures are sampled, including filtering modes,
//! address wrapping, and mipmap selection. They are immutable after creation.

use crate::{Device, HasDevice, utils::AsVkHandle};
use ash::{prelude::VkResult, vk};
use std::fmt::Debug;

pub struct Sampler {
    device: Device,
    handle: vk::Sampler,
}
impl Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.handle.fmt(f)
    }
}
impl HasDevice for Sampler {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl Sampler {
    pub fn new(device: Device, info: &vk::SamplerCreateInfo) -> VkResult<Self> {
        let inner = unsafe { device.create_sampler(info, None) }?;
        Ok(Self {
            device,
            handle: inner,
        })
    }

    /// Creates the sampler used by textures.
    ///
    /// Anisotropic filtering is turned on at the device maximum whenever the device was
    /// created with the `samplerAnisotropy` feature.
    pub fn for_texture(
        device: Device,
        filter: vk::Filter,
        address_mode: vk::SamplerAddressMode,
        mip_level_count: u32,
    ) -> VkResult<Self> {
        let anisotropy = (device.features().sampler_anisotropy == vk::TRUE).then(|| {
            device
                .physical_device()
                .properties()
                .limits
                .max_sampler_anisotropy
        });
        let info = texture_sampler_info(filter, address_mode, mip_level_count, anisotropy);
        Self::new(device, &info)
    }
}

/// Sampler settings shared by every texture: one filter for magnification and
/// minification, one address mode on all axes, linear mip blending over the full chain,
/// an opaque black border and no depth comparison.
pub fn texture_sampler_info(
    filter: vk::Filter,
    address_mode: vk::SamplerAddressMode,
    mip_level_count: u32,
    max_anisotropy: Option<f32>,
) -> vk::SamplerCreateInfo<'static> {
    vk::SamplerCreateInfo {
        mag_filter: filter,
        min_filter: filter,
        mipmap_mode: vk::SamplerMipmapMode::LINEAR,
        address_mode_u: address_mode,
        address_mode_v: address_mode,
        address_mode_w: address_mode,
        mip_lod_bias: 0.0,
        anisotropy_enable: max_anisotropy.is_some().into(),
        max_anisotropy: max_anisotropy.unwrap_or(1.0),
        compare_enable: vk::FALSE,
        compare_op: vk::CompareOp::ALWAYS,
        min_lod: 0.0,
        max_lod: mip_level_count as f32,
        border_color: vk::BorderColor::INT_OPAQUE_BLACK,
        unnormalized_coordinates: vk::FALSE,
        ..Default::default()
    }
}

impl AsVkHandle for Sampler {
    type Handle = vk::Sampler;

    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}
impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe { self.device.destroy_sampler(self.handle, None) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texture_sampler_covers_mip_chain() {
        let info = texture_sampler_info(
            vk::Filter::NEAREST,
            vk::SamplerAddressMode::CLAMP_TO_EDGE,
            10,
            None,
        );
        assert_eq!(info.mag_filter, vk::Filter::NEAREST);
        assert_eq!(info.min_filter, vk::Filter::NEAREST);
        assert_eq!(info.address_mode_w, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(info.max_lod, 10.0);
        assert_eq!(info.anisotropy_enable, vk::FALSE);
        assert_eq!(info.border_color, vk::BorderColor::INT_OPAQUE_BLACK);
        assert_eq!(info.compare_op, vk::CompareOp::ALWAYS);
    }

    #[test]
    fn anisotropy_uses_given_maximum() {
        let info = texture_sampler_info(
            vk::Filter::LINEAR,
            vk::SamplerAddressMode::REPEAT,
            1,
            Some(16.0),
        );
        assert_eq!(info.anisotropy_enable, vk::TRUE);
        assert_eq!(info.max_anisotropy, 16.0);
    }
}
