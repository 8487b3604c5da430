//! GPU memory allocation.
//!
//! [`Allocator`] wraps the Vulkan Memory Allocator (VMA). Create one per device and pass
//! it to buffer and image constructors:
//!
//! ```no_run
//! # use tephra::{Device, Allocator, buffer::Buffer, ash::vk};
//! # let (device, queue) = Device::create_system_default().unwrap();
//! let allocator = Allocator::new(device.clone()).unwrap();
//! let buffer = Buffer::new(
//!     allocator,
//!     64,
//!     4,
//!     vk::BufferUsageFlags::UNIFORM_BUFFER,
//!     vk::MemoryPropertyFlags::HOST_VISIBLE,
//!     256,
//! ).unwrap();
//! ```

use std::{ops::Deref, sync::Arc};

use ash::{prelude::VkResult, vk};

use crate::{Device, HasDevice, utils::AsVkHandle};

/// A GPU memory allocator using the Vulkan Memory Allocator (VMA) library.
///
/// The allocator is thread-safe and can be cloned cheaply.
#[derive(Clone)]
pub struct Allocator(Arc<AllocatorInner>);
// Field order matters: VMA must be torn down before the device it allocates from.
struct AllocatorInner {
    inner: vk_mem::Allocator,
    device: Device,
}

impl HasDevice for Allocator {
    fn device(&self) -> &Device {
        &self.0.device
    }
}

impl Allocator {
    /// Creates a new allocator for the given device.
    pub fn new(device: Device) -> VkResult<Self> {
        let mut info = vk_mem::AllocatorCreateInfo::new(
            device.instance(),
            &device,
            device.physical_device().vk_handle(),
        );
        info.vulkan_api_version = vk::API_VERSION_1_3;
        let alloc = unsafe { vk_mem::Allocator::new(info)? };
        Ok(Self(Arc::new(AllocatorInner {
            inner: alloc,
            device,
        })))
    }

    /// Property flags of the memory type backing `allocation`.
    pub fn memory_properties(&self, allocation: &vk_mem::Allocation) -> vk::MemoryPropertyFlags {
        let info = self.get_allocation_info(allocation);
        self.device()
            .physical_device()
            .properties()
            .memory_types()
            .get(info.memory_type as usize)
            .map(|ty| ty.property_flags)
            .unwrap_or_default()
    }
}

impl Deref for Allocator {
    type Target = vk_mem::Allocator;

    fn deref(&self) -> &Self::Target {
        &self.0.inner
    }
}
