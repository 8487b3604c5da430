//! The presentation swapchain and the render pass that draws into it.
//!
//! A [`Swapchain`] owns, for each presentable image, a color view, a depth attachment, a
//! framebuffer and the semaphore signaled when rendering to that image has finished. All
//! images share one [`RenderPass`] with a color and a depth attachment; the color attachment
//! ends in `PRESENT_SRC_KHR`.
//!
//! Swapchains are never resized in place. The [`Renderer`](crate::renderer::Renderer) builds
//! a new one, passing the old swapchain so the driver can reuse its resources.

use ash::{prelude::VkResult, vk};
use smallvec::SmallVec;

use crate::{
    Device, HasDevice,
    context::Context,
    error::{Error, Result},
    image::{Image, ImageView, format_aspects},
    sync::Semaphore,
    utils::AsVkHandle,
};

/// Depth formats in order of preference.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Prefers 8-bit BGRA sRGB with the sRGB color space, otherwise takes the first format.
pub fn choose_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|format| {
            format.format == vk::Format::B8G8R8A8_SRGB
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first())
        .copied()
}

/// `preferred` when the surface supports it, otherwise FIFO, which is always available.
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// The surface's fixed extent, or the window extent clamped to the supported range.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    window_extent: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: window_extent.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: window_extent.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One more than the minimum, within the maximum when the surface has one.
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// A render pass with one color attachment (cleared, presented) and one depth attachment
/// (cleared, discarded).
pub struct RenderPass {
    device: Device,
    handle: vk::RenderPass,
}

impl RenderPass {
    pub fn new(device: Device, color_format: vk::Format, depth_format: vk::Format) -> VkResult<Self> {
        let attachments = [
            vk::AttachmentDescription {
                format: color_format,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::STORE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                ..Default::default()
            },
            vk::AttachmentDescription {
                format: depth_format,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::DONT_CARE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                ..Default::default()
            },
        ];
        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let subpasses = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .depth_stencil_attachment(&depth_ref)];
        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let dependencies = [vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: stages | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            src_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dst_stage_mask: stages,
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ..Default::default()
        }];
        let info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        let handle = unsafe { device.create_render_pass(&info, None)? };
        Ok(Self { device, handle })
    }
}

impl AsVkHandle for RenderPass {
    type Handle = vk::RenderPass;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_render_pass(self.handle, None);
        }
    }
}

pub struct Framebuffer {
    device: Device,
    handle: vk::Framebuffer,
}

impl Framebuffer {
    pub fn new(
        render_pass: &RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VkResult<Self> {
        let device = render_pass.device.clone();
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass.vk_handle())
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let handle = unsafe { device.create_framebuffer(&info, None)? };
        Ok(Self { device, handle })
    }
}

impl AsVkHandle for Framebuffer {
    type Handle = vk::Framebuffer;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_framebuffer(self.handle, None);
        }
    }
}

// Field order is drop order: the framebuffer before the views it references.
struct SwapchainImage {
    framebuffer: Framebuffer,
    color_view: ImageView,
    depth_view: ImageView,
    _depth: Image,
    render_finished: Semaphore,
}

/// Presentable images with their framebuffers, plus the render pass they share.
pub struct Swapchain {
    images: SmallVec<[SwapchainImage; 3]>,
    render_pass: RenderPass,
    device: Device,
    handle: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    depth_format: vk::Format,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
}

impl std::fmt::Debug for Swapchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swapchain")
            .field("handle", &self.handle)
            .field("format", &self.format.format)
            .field("extent", &self.extent)
            .field("images", &self.images.len())
            .finish()
    }
}

impl HasDevice for Swapchain {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl Swapchain {
    /// Creates a swapchain for the context's surface.
    ///
    /// `old` is retired in favor of the new swapchain but must still be dropped by the caller.
    pub fn new(
        context: &Context,
        window_extent: vk::Extent2D,
        preferred_present_mode: vk::PresentModeKHR,
        old: Option<&Swapchain>,
    ) -> Result<Self> {
        let surface = context.surface().ok_or(Error::MissingSurface)?.vk_handle();
        let device = context.device().clone();
        let loader = device
            .swapchain_loader()
            .ok_or(Error::Vulkan(vk::Result::ERROR_EXTENSION_NOT_PRESENT))?;
        let pdevice = device.physical_device();

        let capabilities = pdevice.surface_capabilities(surface)?;
        let format = choose_surface_format(&pdevice.surface_formats(surface)?)
            .ok_or(Error::Vulkan(vk::Result::ERROR_FORMAT_NOT_SUPPORTED))?;
        let present_mode =
            choose_present_mode(&pdevice.surface_present_modes(surface)?, preferred_present_mode);
        let extent = choose_extent(&capabilities, window_extent);
        if extent.width == 0 || extent.height == 0 {
            return Err(Error::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR));
        }
        let depth_format = context
            .find_supported_format(
                &DEPTH_FORMAT_CANDIDATES,
                vk::ImageTiling::OPTIMAL,
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            )
            .ok_or(Error::Vulkan(vk::Result::ERROR_FORMAT_NOT_SUPPORTED))?;
        tracing::info!(
            width = %extent.width,
            height = %extent.height,
            format = ?format.format,
            color_space = ?format.color_space,
            ?present_mode,
            ?depth_format,
            "Creating swapchain"
        );

        let info = vk::SwapchainCreateInfoKHR {
            surface,
            min_image_count: choose_image_count(&capabilities),
            image_format: format.format,
            image_color_space: format.color_space,
            image_extent: extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: vk::SharingMode::EXCLUSIVE,
            pre_transform: capabilities.current_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode,
            clipped: vk::TRUE,
            old_swapchain: old.map_or(vk::SwapchainKHR::null(), |old| old.handle),
            ..Default::default()
        };
        let handle = unsafe { loader.create_swapchain(&info, None)? };
        // Owned from here on, so an error below still destroys the swapchain.
        let mut swapchain = Self {
            images: SmallVec::new(),
            render_pass: RenderPass::new(device.clone(), format.format, depth_format)?,
            device: device.clone(),
            handle,
            format,
            depth_format,
            present_mode,
            extent,
        };

        let raw_images = unsafe { loader.get_swapchain_images(handle)? };
        for image in raw_images {
            let color_view = ImageView::from_raw_image(
                device.clone(),
                image,
                format.format,
                vk::ImageAspectFlags::COLOR,
                vk::ImageViewType::TYPE_2D,
                0..1,
                0..1,
            )?;
            let depth = Image::new_private(
                context.allocator().clone(),
                &vk::ImageCreateInfo {
                    image_type: vk::ImageType::TYPE_2D,
                    format: depth_format,
                    extent: vk::Extent3D {
                        width: extent.width,
                        height: extent.height,
                        depth: 1,
                    },
                    mip_levels: 1,
                    array_layers: 1,
                    samples: vk::SampleCountFlags::TYPE_1,
                    tiling: vk::ImageTiling::OPTIMAL,
                    usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                    sharing_mode: vk::SharingMode::EXCLUSIVE,
                    initial_layout: vk::ImageLayout::UNDEFINED,
                    ..Default::default()
                },
            )?;
            let depth_view = ImageView::from_raw_image(
                device.clone(),
                depth.vk_handle(),
                depth_format,
                format_aspects(depth_format) & vk::ImageAspectFlags::DEPTH,
                vk::ImageViewType::TYPE_2D,
                0..1,
                0..1,
            )?;
            let framebuffer = Framebuffer::new(
                &swapchain.render_pass,
                &[color_view.vk_handle(), depth_view.vk_handle()],
                extent,
            )?;
            swapchain.images.push(SwapchainImage {
                framebuffer,
                color_view,
                depth_view,
                _depth: depth,
                render_finished: Semaphore::new_binary(device.clone())?,
            });
        }
        tracing::debug!(images = swapchain.images.len(), "Created swapchain images");
        Ok(swapchain)
    }

    /// Acquires the next image, signaling `semaphore` when it is ready.
    ///
    /// Returns the image index and whether the swapchain is suboptimal.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> VkResult<(u32, bool)> {
        let loader = self
            .device
            .swapchain_loader()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)?;
        unsafe { loader.acquire_next_image(self.handle, u64::MAX, semaphore, vk::Fence::null()) }
    }

    /// True when both swapchains use the same color and depth formats.
    pub fn compare_formats(&self, other: &Swapchain) -> bool {
        self.format.format == other.format.format && self.depth_format == other.depth_format
    }

    pub fn render_pass(&self) -> &RenderPass {
        &self.render_pass
    }
    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.images[image_index as usize].framebuffer.vk_handle()
    }
    /// Signaled by the frame that renders into `image_index`, waited on by presentation.
    pub fn render_finished(&self, image_index: u32) -> vk::Semaphore {
        self.images[image_index as usize].render_finished.vk_handle()
    }
    pub fn image_view(&self, image_index: u32) -> &ImageView {
        &self.images[image_index as usize].color_view
    }
    pub fn depth_view(&self, image_index: u32) -> &ImageView {
        &self.images[image_index as usize].depth_view
    }
    pub fn image_count(&self) -> usize {
        self.images.len()
    }
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
    pub fn format(&self) -> vk::Format {
        self.format.format
    }
    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }
    pub fn aspect_ratio(&self) -> f32 {
        self.extent.width as f32 / self.extent.height as f32
    }
}

impl AsVkHandle for Swapchain {
    type Handle = vk::SwapchainKHR;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.images.clear();
        if let Some(loader) = self.device.swapchain_loader() {
            unsafe { loader.destroy_swapchain(self.handle, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities() -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn srgb_surface_format_preferred() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let chosen = |formats: &[vk::SurfaceFormatKHR]| {
            choose_surface_format(formats).map(|format| format.format)
        };
        assert_eq!(chosen(&[unorm, srgb]), Some(vk::Format::B8G8R8A8_SRGB));
        assert_eq!(chosen(&[unorm]), Some(vk::Format::B8G8R8A8_UNORM));
        assert_eq!(chosen(&[]), None);
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_follows_surface_or_clamps_window() {
        let mut caps = capabilities();
        let window = vk::Extent2D {
            width: 8000,
            height: 600,
        };
        let clamped = choose_extent(&caps, window);
        assert_eq!((clamped.width, clamped.height), (4096, 600));
        caps.current_extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let fixed = choose_extent(&caps, window);
        assert_eq!((fixed.width, fixed.height), (800, 600));
    }

    #[test]
    fn image_count_respects_maximum() {
        let mut caps = capabilities();
        assert_eq!(choose_image_count(&caps), 3);
        caps.max_image_count = 2;
        assert_eq!(choose_image_count(&caps), 2);
        caps.max_image_count = 0;
        assert_eq!(choose_image_count(&caps), 3);
    }
}
