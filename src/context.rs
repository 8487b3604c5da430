//! The engine context.
//!
//! [`Context`] bundles what every GPU resource needs: the logical device, the memory
//! allocator, the single graphics/compute/present queue, and a command pool for one-shot
//! work. It is passed explicitly to constructors and is cheap to clone.
//!
//! ```no_run
//! # use tephra::context::Context;
//! let context = Context::headless().unwrap();
//! context
//!     .one_shot(|encoder| {
//!         // Record transfer or compute work; it has finished when this returns.
//!     })
//!     .unwrap();
//! ```

use std::{
    borrow::Cow,
    ffi::CStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::{
    Allocator, Device, HasDevice, Instance,
    buffer::Buffer,
    command::{CommandEncoder, CommandPool},
    error::{Error, Result},
    image::ImageLike,
    physical_device::PhysicalDevice,
    queue::Queue,
    surface::{self, Surface},
    sync::Fence,
    utils::{AsVkHandle, Version},
};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Options for [`Context`] creation.
#[derive(Clone, Debug)]
pub struct ContextConfig {
    pub application_name: Cow<'static, CStr>,
    /// Enable the Khronos validation layer and route its messages into `tracing`.
    pub validation: bool,
    /// Rank discrete GPUs above integrated ones.
    pub prefer_discrete: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            application_name: Cow::Borrowed(c"tephra application"),
            validation: cfg!(debug_assertions),
            prefer_discrete: true,
        }
    }
}

/// Shared handle to the device, allocator, queue and one-shot command pool.
#[derive(Clone)]
pub struct Context(Arc<ContextInner>);

// Field order is drop order: command pool and allocations before the device.
struct ContextInner {
    one_shot: Mutex<OneShot>,
    allocator: Allocator,
    queue: Mutex<Queue>,
    surface: Option<Surface>,
    device: Device,
}

struct OneShot {
    pool: CommandPool,
    fence: Fence,
}

impl HasDevice for Context {
    fn device(&self) -> &Device {
        &self.0.device
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("device", &self.0.device)
            .field("surface", &self.0.surface.as_ref().map(|s| s.vk_handle()))
            .finish()
    }
}

impl Context {
    /// Creates a context able to present to `window`.
    pub fn new(
        window: &(impl HasDisplayHandle + HasWindowHandle),
        config: ContextConfig,
    ) -> Result<Self> {
        let extensions = surface::required_extensions(window)?;
        let instance = create_instance(&config, &extensions)?;
        let surface = Surface::new(instance, window)?;
        let (pdevice, family) =
            select_physical_device(surface.instance(), Some(&surface), config.prefer_discrete)?;
        Self::finish(pdevice, family, Some(surface))
    }

    /// Creates a context without a presentation surface, for offscreen work and tests.
    pub fn headless() -> Result<Self> {
        let config = ContextConfig::default();
        let instance = create_instance(&config, &[])?;
        let (pdevice, family) = select_physical_device(&instance, None, config.prefer_discrete)?;
        Self::finish(pdevice, family, None)
    }

    fn finish(pdevice: PhysicalDevice, family: u32, surface: Option<Surface>) -> Result<Self> {
        tracing::info!(
            device = ?pdevice.properties().device_name(),
            api_version = %pdevice.properties().api_version(),
            queue_family = family,
            "Selected physical device"
        );
        let mut builder = Device::builder(pdevice);
        let queue = builder
            .enable_queue(family, 1.0)
            .ok_or(Error::NoSuitableDevice)?;
        if surface.is_some() && !builder.enable_extension(ash::khr::swapchain::NAME) {
            return Err(Error::NoSuitableDevice);
        }
        builder.enable_synchronization2();
        builder.enable_sampler_anisotropy();
        let device = builder.build()?;
        let queue = device.get_queue(queue);
        let allocator = Allocator::new(device.clone())?;
        let one_shot = OneShot {
            pool: CommandPool::new(device.clone(), queue.family_index())?,
            fence: Fence::new(device.clone(), false)?,
        };
        Ok(Self(Arc::new(ContextInner {
            one_shot: Mutex::new(one_shot),
            allocator,
            queue: Mutex::new(queue),
            surface,
            device,
        })))
    }

    pub fn allocator(&self) -> &Allocator {
        &self.0.allocator
    }

    pub fn surface(&self) -> Option<&Surface> {
        self.0.surface.as_ref()
    }

    /// Locks the queue shared by one-shot work and the frame loop.
    pub fn queue(&self) -> MutexGuard<'_, Queue> {
        self.0.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records work with `f`, submits it, and blocks until the GPU has finished it.
    ///
    /// Calls are serialized: at most one one-shot submission is in flight at a time.
    pub fn one_shot<T>(&self, f: impl FnOnce(&mut CommandEncoder) -> T) -> Result<T> {
        let mut guard = self.0.one_shot.lock().unwrap_or_else(PoisonError::into_inner);
        let OneShot { pool, fence } = &mut *guard;
        let mut cmd = pool.alloc()?;
        pool.begin(&mut cmd)?;
        let result = pool.record(&mut cmd, f);
        pool.finish(&mut cmd)?;
        fence.reset()?;
        self.queue().submit(&mut cmd, &[], &[], fence.vk_handle())?;
        fence.wait()?;
        cmd.complete();
        pool.free(cmd);
        Ok(result)
    }

    /// Copies the first `size` bytes of `src` into `dst`.
    pub fn copy_buffer(&self, src: &Buffer, dst: &Buffer, size: vk::DeviceSize) -> Result<()> {
        self.one_shot(|encoder| encoder.copy_buffer(src, dst, size))
    }

    /// Copies tightly packed pixels for `layer_count` layers of mip level 0. The image must
    /// already be in `TRANSFER_DST_OPTIMAL`.
    pub fn copy_buffer_to_image(
        &self,
        buffer: &Buffer,
        image: &impl ImageLike,
        width: u32,
        height: u32,
        layer_count: u32,
    ) -> Result<()> {
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: image.aspects(),
                mip_level: 0,
                base_array_layer: 0,
                layer_count,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
        };
        self.one_shot(|encoder| {
            encoder.copy_buffer_to_image_with_layout(
                buffer,
                image,
                &[region],
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )
        })
    }

    pub fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> Option<vk::Format> {
        self.physical_device()
            .find_supported_format(candidates, tiling, features)
    }

    pub fn min_uniform_buffer_offset_alignment(&self) -> vk::DeviceSize {
        self.physical_device()
            .properties()
            .limits
            .min_uniform_buffer_offset_alignment
    }

    pub fn max_sampler_anisotropy(&self) -> f32 {
        self.physical_device()
            .properties()
            .limits
            .max_sampler_anisotropy
    }

    /// Blocks until the device has finished all submitted work.
    pub fn wait_idle(&self) -> Result<()> {
        self.0.device.wait_idle()?;
        Ok(())
    }
}

fn create_instance(config: &ContextConfig, extensions: &[&CStr]) -> Result<Instance> {
    let entry = Arc::new(unsafe { ash::Entry::load() }?);
    let mut builder = Instance::builder(entry)?;
    builder.info.application_name = config.application_name.clone();
    builder.info.api_version = Version::V1_3;
    for extension in extensions {
        builder.enable_extension(extension);
    }
    if config.validation {
        if builder.enable_layer(VALIDATION_LAYER).is_some() {
            builder.enable_debug_messenger();
        } else {
            tracing::warn!("Validation requested but the Khronos validation layer is not installed");
        }
    }
    Ok(builder.build()?)
}

/// Ranks device types; higher is better.
fn device_type_score(ty: vk::PhysicalDeviceType, prefer_discrete: bool) -> u32 {
    match ty {
        vk::PhysicalDeviceType::DISCRETE_GPU if prefer_discrete => 4,
        vk::PhysicalDeviceType::INTEGRATED_GPU if prefer_discrete => 3,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 4,
        vk::PhysicalDeviceType::DISCRETE_GPU => 3,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 1,
        _ => 0,
    }
}

/// First family supporting graphics and compute, and presentation when asked.
fn pick_queue_family(
    families: &[vk::QueueFamilyProperties],
    presents: impl Fn(u32) -> bool,
) -> Option<u32> {
    families
        .iter()
        .enumerate()
        .find(|(index, family)| {
            family
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
                && presents(*index as u32)
        })
        .map(|(index, _)| index as u32)
}

fn select_physical_device(
    instance: &Instance,
    surface: Option<&Surface>,
    prefer_discrete: bool,
) -> Result<(PhysicalDevice, u32)> {
    instance
        .enumerate_physical_devices()?
        .filter_map(|pdevice| {
            let name = pdevice.properties().device_name().to_string_lossy().into_owned();
            if pdevice.properties().api_version() < Version::V1_3 {
                tracing::debug!(device = %name, "Skipping device without Vulkan 1.3");
                return None;
            }
            let (features, features13) = pdevice.supported_features();
            if features.sampler_anisotropy != vk::TRUE || features13.synchronization2 != vk::TRUE {
                tracing::debug!(device = %name, "Skipping device missing required features");
                return None;
            }
            if surface.is_some() && !pdevice.supports_extension(ash::khr::swapchain::NAME) {
                tracing::debug!(device = %name, "Skipping device without swapchain support");
                return None;
            }
            let family = pick_queue_family(&pdevice.queue_family_properties(), |index| {
                surface.is_none_or(|surface| pdevice.supports_surface(index, surface.vk_handle()))
            })?;
            Some((pdevice, family))
        })
        .max_by_key(|(pdevice, _)| {
            device_type_score(pdevice.properties().device_type, prefer_discrete)
        })
        .ok_or(Error::NoSuitableDevice)
}

/// A headless context for GPU tests, with log output routed to the test harness.
///
/// Tests calling this are `#[ignore]`d and run with `cargo test -- --ignored` on a machine
/// with a Vulkan implementation.
///
/// # Panics
///
/// Panics when no Vulkan device is available.
#[cfg(test)]
pub(crate) fn test_context() -> Context {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    match Context::headless() {
        Ok(context) => context,
        Err(err) => panic!("GPU test needs a Vulkan device: {err}"),
    }
}

/// Compiled shader directory for tests that dispatch or draw.
///
/// # Panics
///
/// Panics when `TEPHRA_SHADER_DIR` is not set.
#[cfg(test)]
pub(crate) fn test_shader_dir() -> std::path::PathBuf {
    match std::env::var_os("TEPHRA_SHADER_DIR") {
        Some(dir) => dir.into(),
        None => panic!("TEPHRA_SHADER_DIR must point at the compiled SPIR-V shaders"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discrete_ranked_first_when_preferred() {
        let discrete = vk::PhysicalDeviceType::DISCRETE_GPU;
        let integrated = vk::PhysicalDeviceType::INTEGRATED_GPU;
        assert!(device_type_score(discrete, true) > device_type_score(integrated, true));
        assert!(device_type_score(integrated, false) > device_type_score(discrete, false));
        assert!(
            device_type_score(vk::PhysicalDeviceType::CPU, true)
                < device_type_score(vk::PhysicalDeviceType::VIRTUAL_GPU, true)
        );
    }

    #[test]
    fn queue_family_needs_graphics_compute_and_present() {
        let families = [
            vk::QueueFamilyProperties {
                queue_flags: vk::QueueFlags::TRANSFER,
                queue_count: 1,
                ..Default::default()
            },
            vk::QueueFamilyProperties {
                queue_flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
                queue_count: 1,
                ..Default::default()
            },
            vk::QueueFamilyProperties {
                queue_flags: vk::QueueFlags::GRAPHICS
                    | vk::QueueFlags::COMPUTE
                    | vk::QueueFlags::TRANSFER,
                queue_count: 4,
                ..Default::default()
            },
        ];
        assert_eq!(pick_queue_family(&families, |_| true), Some(1));
        assert_eq!(pick_queue_family(&families, |index| index == 2), Some(2));
        assert_eq!(pick_queue_family(&families, |_| false), None);
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn headless_one_shot_round_trip() {
        let context = crate::context::test_context();
        let value = context.one_shot(|_| 7).unwrap();
        assert_eq!(value, 7);

        let data: Vec<u8> = (0..64).collect();
        let src = Buffer::new_staging(context.allocator().clone(), &data).unwrap();
        let mut dst = Buffer::new(
            context.allocator().clone(),
            64,
            1,
            vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            1,
        )
        .unwrap();
        context.copy_buffer(&src, &dst, 64).unwrap();
        dst.map().unwrap();
        assert_eq!(dst.read_mapped().unwrap(), data);
        assert!(context.min_uniform_buffer_offset_alignment() >= 1);
    }
}
