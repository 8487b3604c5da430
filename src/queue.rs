//! Vulkan queue management.
//!
//! Submissions to a queue are guaranteed to **start** in order, but may **finish** out of
//! order. Callers synchronize with binary semaphores and fences from [`crate::sync`].

use ash::{prelude::VkResult, vk};

use crate::{
    Device, HasDevice,
    command::{CommandBuffer, CommandBufferState},
    utils::AsVkHandle,
};

/// A Vulkan command queue for scheduling GPU work.
///
/// Queues are externally synchronized, so every submission takes `&mut self`.
pub struct Queue {
    device: Device,
    handle: vk::Queue,
    family_index: u32,
    capabilities: vk::QueueFlags,
}

impl HasDevice for Queue {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl AsVkHandle for Queue {
    type Handle = vk::Queue;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

/// A binary semaphore wait or signal attached to a submission.
#[derive(Clone, Copy, Debug)]
pub struct SemaphoreOp {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags2,
}

impl Queue {
    /// Returns the queue family index.
    pub fn family_index(&self) -> u32 {
        self.family_index
    }
    /// Returns the capabilities supported by the queue family that this queue belongs to.
    pub fn capabilities(&self) -> vk::QueueFlags {
        self.capabilities
    }
    pub(crate) fn from_raw(
        device: Device,
        queue: vk::Queue,
        family_index: u32,
        caps: vk::QueueFlags,
    ) -> Self {
        Self {
            device,
            handle: queue,
            family_index,
            capabilities: caps,
        }
    }

    /// Submits a command buffer for execution.
    ///
    /// The command buffer must be in the `Executable` state (recording finished).
    /// After submission, it transitions to the `Pending` state.
    pub fn submit(
        &mut self,
        cb: &mut CommandBuffer,
        waits: &[SemaphoreOp],
        signals: &[SemaphoreOp],
        fence: vk::Fence,
    ) -> VkResult<()> {
        assert_eq!(
            cb.state(),
            CommandBufferState::Executable,
            "The command buffer must finish recording first!"
        );
        let to_info = |op: &SemaphoreOp| vk::SemaphoreSubmitInfo {
            semaphore: op.semaphore,
            stage_mask: op.stage,
            ..Default::default()
        };
        let waits: smallvec::SmallVec<[vk::SemaphoreSubmitInfo; 2]> =
            waits.iter().map(to_info).collect();
        let signals: smallvec::SmallVec<[vk::SemaphoreSubmitInfo; 2]> =
            signals.iter().map(to_info).collect();
        let command_buffers = [vk::CommandBufferSubmitInfo {
            command_buffer: cb.vk_handle(),
            ..Default::default()
        }];
        unsafe {
            self.device.queue_submit2(
                self.handle,
                &[vk::SubmitInfo2::default()
                    .command_buffer_infos(&command_buffers)
                    .wait_semaphore_infos(&waits)
                    .signal_semaphore_infos(&signals)],
                fence,
            )?;
        }
        cb.state = CommandBufferState::Pending;
        Ok(())
    }

    /// Presents a swapchain image.
    ///
    /// Returns `Ok(true)` when the swapchain is suboptimal for the surface.
    pub fn present(
        &mut self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        waits: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let loader = self
            .device
            .swapchain_loader()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)?;
        let swapchains = [swapchain];
        let indices = [image_index];
        unsafe {
            loader.queue_present(
                self.handle,
                &vk::PresentInfoKHR::default()
                    .wait_semaphores(waits)
                    .swapchains(&swapchains)
                    .image_indices(&indices),
            )
        }
    }

    /// Blocks until the queue has finished all submitted work.
    pub fn wait_idle(&mut self) -> VkResult<()> {
        unsafe { self.device.queue_wait_idle(self.handle) }
    }
}
