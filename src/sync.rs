//! Host and queue synchronization primitives.
//!
//! - [`Semaphore`]: a binary semaphore ordering submissions against presentation.
//! - [`Fence`]: a host-waitable signal that a submission has finished.
//!
//! All waits are unconditional blocking waits; a hung GPU hangs the caller.

use std::fmt::Debug;

use ash::{prelude::VkResult, vk};

use crate::{Device, HasDevice, utils::AsVkHandle};

/// A binary semaphore.
pub struct Semaphore {
    device: Device,
    handle: vk::Semaphore,
}
impl Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BinarySemaphore").field(&self.handle).finish()
    }
}
impl Semaphore {
    pub fn new_binary(device: Device) -> VkResult<Self> {
        let handle = unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }?;
        Ok(Self { device, handle })
    }
}
impl AsVkHandle for Semaphore {
    type Handle = vk::Semaphore;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}
impl HasDevice for Semaphore {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.handle, None);
        }
    }
}

/// A fence the host can block on.
pub struct Fence {
    device: Device,
    handle: vk::Fence,
}
impl Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Fence").field(&self.handle).finish()
    }
}
impl Fence {
    /// Creates a fence, optionally already signaled so the first wait returns immediately.
    pub fn new(device: Device, signaled: bool) -> VkResult<Self> {
        let info = vk::FenceCreateInfo {
            flags: if signaled {
                vk::FenceCreateFlags::SIGNALED
            } else {
                vk::FenceCreateFlags::empty()
            },
            ..Default::default()
        };
        let handle = unsafe { device.create_fence(&info, None) }?;
        Ok(Self { device, handle })
    }

    /// Blocks until the fence is signaled.
    pub fn wait(&self) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(&[self.handle], true, u64::MAX) }
    }

    pub fn reset(&self) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[self.handle]) }
    }

    pub fn is_signaled(&self) -> VkResult<bool> {
        unsafe { self.device.get_fence_status(self.handle) }
    }
}
impl AsVkHandle for Fence {
    type Handle = vk::Fence;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}
impl HasDevice for Fence {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.handle, None);
        }
    }
}

/// Per frame-in-flight synchronization for the frame loop.
#[derive(Debug)]
pub struct FrameSync {
    /// Signaled when the acquired swapchain image is ready to be rendered to.
    pub image_available: Semaphore,
    /// Signaled when the frame's submission has finished on the GPU.
    pub in_flight: Fence,
}

impl FrameSync {
    pub fn new(device: &Device) -> VkResult<Self> {
        Ok(Self {
            image_available: Semaphore::new_binary(device.clone())?,
            in_flight: Fence::new(device.clone(), true)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn fence_starts_signaled_when_requested() {
        let device = crate::context::test_context().device().clone();
        let fence = Fence::new(device.clone(), true).unwrap();
        assert!(fence.is_signaled().unwrap());
        fence.wait().unwrap();
        fence.reset().unwrap();
        assert!(!fence.is_signaled().unwrap());

        let sync = FrameSync::new(&device).unwrap();
        assert!(sync.in_flight.is_signaled().unwrap());
    }
}
