//! # Command Encoding
//!
//! - [`CommandPool`]: allocates command buffers and drives their recording lifecycle.
//! - [`CommandBuffer`]: a primary Vulkan command buffer plus its [`CommandBufferState`].
//! - [`CommandEncoder`]: records commands into a command buffer and batches pipeline barriers.
//!
//! Barriers added through [`CommandEncoder::image_barrier`] and
//! [`CommandEncoder::memory_barrier`] are accumulated and emitted as a single
//! `vkCmdPipelineBarrier2` call by [`CommandEncoder::emit_barriers`]. Transfer and dispatch
//! commands do not emit barriers on their own; call `emit_barriers` first.
//!
//! Per-frame graphics work is recorded straight into the frame's command buffer by the
//! [`Renderer`](crate::renderer::Renderer); the encoder covers one-shot transfer and compute work.
//!
//! ## Example Usage
//!
//! ```no_run
//! # use tephra::{Device, command::CommandPool};
//! # let (device, queue) = Device::create_system_default().unwrap();
//! let mut pool = CommandPool::new(device.clone(), queue.family_index()).unwrap();
//! let mut cmd = pool.alloc().unwrap();
//! pool.begin(&mut cmd).unwrap();
//! pool.record(&mut cmd, |encoder| {
//!     // Record your commands here
//! });
//! pool.finish(&mut cmd).unwrap();
//! ```

mod compute;
mod transfer;

use std::{ops::Range, sync::Arc};

use ash::{prelude::VkResult, vk};

use crate::{
    Device, HasDevice,
    image::ImageLike,
    tracking::{Access, MemoryBarrier},
    utils::AsVkHandle,
};

/// Records commands into a [`CommandBuffer`] and batches pipeline barriers.
///
/// Command encoders are only ever handed out as an argument to a closure passed to
/// [`CommandPool::record`], which guarantees the command buffer is in the recording state
/// for the encoder's whole lifetime.
pub struct CommandEncoder<'a> {
    buffer: &'a mut CommandBuffer,

    /// Accumulated global memory barrier that will be emitted in the next barrier batch.
    pending_memory_barrier: MemoryBarrier,

    /// Accumulated image memory barriers that will be emitted in the next barrier batch.
    pending_image_barrier: Vec<vk::ImageMemoryBarrier2<'static>>,
}

impl CommandEncoder<'_> {
    /// Returns a reference to the underlying command buffer.
    pub fn buffer(&self) -> &CommandBuffer {
        self.buffer
    }

    /// Emits all pending barriers as a single pipeline barrier command.
    ///
    /// This is typically called before transfer or dispatch commands so that
    /// the resources they use are in the expected states. After emission all pending
    /// barriers are cleared.
    pub fn emit_barriers(&mut self) {
        if !self.has_pending_barriers() {
            return;
        }

        let memory_barrier = std::mem::take(&mut self.pending_memory_barrier);
        let memory_barriers = [vk::MemoryBarrier2 {
            src_stage_mask: memory_barrier.src.stage,
            src_access_mask: memory_barrier.src.access,
            dst_stage_mask: memory_barrier.dst.stage,
            dst_access_mask: memory_barrier.dst.access,
            ..Default::default()
        }];
        let mut info = vk::DependencyInfo::default().image_memory_barriers(&self.pending_image_barrier);
        if !memory_barrier.is_empty() {
            info = info.memory_barriers(&memory_barriers);
        }
        unsafe {
            self.buffer.device.cmd_pipeline_barrier2(self.buffer.buffer, &info);
        }
        self.pending_image_barrier.clear();
    }

    pub fn has_pending_barriers(&self) -> bool {
        !self.pending_memory_barrier.is_empty() || !self.pending_image_barrier.is_empty()
    }

    /// Adds a global memory barrier between pipeline stages.
    ///
    /// This creates
    /// - An execution dependency such that `before.stage` completes before any
    ///   operations in `after.stage` begin
    /// - A memory dependency such that memory regions touched by `before.access` are flushed,
    ///   and memory regions that will be touched by `after.access` are invalidated.
    ///
    /// The barrier is batched with other barriers and emitted by
    /// [`emit_barriers()`](Self::emit_barriers).
    pub fn memory_barrier(&mut self, before: Access, after: Access) {
        self.pending_memory_barrier.src |= before;
        self.pending_memory_barrier.dst |= after;
    }

    /// Creates an image memory barrier that also moves the covered subresources from
    /// `old_layout` to `new_layout`.
    #[allow(clippy::too_many_arguments)]
    pub fn image_barrier(
        &mut self,
        image: &impl ImageLike,
        before: Access,
        after: Access,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        mip_level_range: Range<u32>,
        array_layer_range: Range<u32>,
    ) {
        self.pending_image_barrier.push(vk::ImageMemoryBarrier2 {
            src_stage_mask: before.stage,
            src_access_mask: before.access,
            dst_stage_mask: after.stage,
            dst_access_mask: after.access,
            old_layout,
            new_layout,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image: image.vk_handle(),
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: image.aspects(),
                base_array_layer: array_layer_range.start,
                layer_count: array_layer_range.len() as u32,
                base_mip_level: mip_level_range.start,
                level_count: mip_level_range.len() as u32,
            },
            ..Default::default()
        });
    }
}

impl HasDevice for CommandEncoder<'_> {
    fn device(&self) -> &Device {
        &self.buffer.device
    }
}

/// The lifecycle states of a [`CommandBuffer`].
///
/// ```text
/// Initial -> Recording -> Executable -> Pending -> Invalid
///    |                                               |
///    +----------------<<<---------------- (reset) ---+
/// ```
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum CommandBufferState {
    /// Newly allocated or reset command buffer.
    Initial,

    /// Currently being recorded with commands.
    Recording,

    /// Recording finished, ready for submission to a queue.
    Executable,

    /// Submitted to a queue and possibly still executing on the GPU.
    Pending,

    /// Execution completed, can be reset or freed.
    Invalid,
}

/// A primary Vulkan command buffer.
///
/// Command buffers must be returned to their pool with [`CommandPool::free`] or recycled with
/// [`CommandPool::reset`]. Once a submission is known to be complete (its fence was waited
/// on), call [`CommandBuffer::complete`] to leave the `Pending` state.
pub struct CommandBuffer {
    device: Device,
    pool: Arc<CommandPoolInner>,
    buffer: vk::CommandBuffer,
    pub(crate) state: CommandBufferState,
}

impl AsVkHandle for CommandBuffer {
    type Handle = vk::CommandBuffer;
    fn vk_handle(&self) -> Self::Handle {
        self.buffer
    }
}

impl HasDevice for CommandBuffer {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl CommandBuffer {
    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    /// Marks a pending command buffer as finished.
    ///
    /// The caller must have observed completion on the host, usually by waiting on the fence
    /// passed to [`Queue::submit`](crate::Queue::submit).
    pub fn complete(&mut self) {
        if self.state == CommandBufferState::Pending {
            self.state = CommandBufferState::Invalid;
        }
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("buffer", &self.buffer)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        if self.state == CommandBufferState::Pending {
            tracing::warn!(
                "Dropping CommandBuffer {:?} while it may still be executing",
                self.buffer
            );
        }
        // Freeing is implicit when the pool goes away; otherwise hand the buffer back now.
        unsafe {
            self.device
                .free_command_buffers(self.pool.handle, &[self.buffer]);
        }
    }
}

/// Allocates command buffers and drives their recording lifecycle.
pub struct CommandPool {
    inner: Arc<CommandPoolInner>,
}

impl AsVkHandle for CommandPool {
    type Handle = vk::CommandPool;

    fn vk_handle(&self) -> Self::Handle {
        self.inner.handle
    }
}

impl HasDevice for CommandPool {
    fn device(&self) -> &Device {
        &self.inner.device
    }
}

/// Shared between the command pool and all of its command buffers, so the Vulkan pool
/// outlives every buffer allocated from it.
struct CommandPoolInner {
    device: Device,
    handle: vk::CommandPool,
}

impl Drop for CommandPoolInner {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.handle, None);
        }
    }
}

impl CommandPool {
    /// Creates a pool for short-lived, one-time-submit command buffers.
    pub fn new(device: Device, queue_family_index: u32) -> VkResult<Self> {
        Self::new_with_flags(
            device,
            queue_family_index,
            vk::CommandPoolCreateFlags::TRANSIENT,
        )
    }

    /// Creates a pool whose command buffers can be individually reset and re-recorded.
    pub fn new_resettable(device: Device, queue_family_index: u32) -> VkResult<Self> {
        Self::new_with_flags(
            device,
            queue_family_index,
            vk::CommandPoolCreateFlags::TRANSIENT
                | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )
    }

    fn new_with_flags(
        device: Device,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<Self> {
        unsafe {
            let pool = device.create_command_pool(
                &vk::CommandPoolCreateInfo {
                    flags,
                    queue_family_index,
                    ..Default::default()
                },
                None,
            )?;
            Ok(Self {
                inner: Arc::new(CommandPoolInner {
                    device,
                    handle: pool,
                }),
            })
        }
    }

    pub fn alloc(&mut self) -> VkResult<CommandBuffer> {
        let buffers = unsafe {
            self.inner.device.allocate_command_buffers(&vk::CommandBufferAllocateInfo {
                command_pool: self.inner.handle,
                command_buffer_count: 1,
                level: vk::CommandBufferLevel::PRIMARY,
                ..Default::default()
            })?
        };
        let buffer = buffers
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)?;
        Ok(CommandBuffer {
            device: self.inner.device.clone(),
            pool: self.inner.clone(),
            buffer,
            state: CommandBufferState::Initial,
        })
    }

    pub fn begin(&mut self, cb: &mut CommandBuffer) -> VkResult<()> {
        assert_eq!(
            cb.state,
            CommandBufferState::Initial,
            "Command buffer must be reset before it can be recorded again!"
        );
        assert!(
            Arc::ptr_eq(&cb.pool, &self.inner),
            "Command buffer beginning on the wrong pool!"
        );
        unsafe {
            self.device().begin_command_buffer(
                cb.buffer,
                &vk::CommandBufferBeginInfo {
                    flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                    ..Default::default()
                },
            )?;
        }
        cb.state = CommandBufferState::Recording;
        Ok(())
    }

    /// Records commands into `command_buffer` through a [`CommandEncoder`].
    ///
    /// Pending barriers left on the encoder when the closure returns are emitted.
    pub fn record<T>(
        &mut self,
        command_buffer: &mut CommandBuffer,
        callback: impl FnOnce(&mut CommandEncoder) -> T,
    ) -> T {
        assert_eq!(
            command_buffer.state,
            CommandBufferState::Recording,
            "Must call CommandPool::begin before recording a command buffer"
        );
        assert!(
            Arc::ptr_eq(&command_buffer.pool, &self.inner),
            "Command buffer recorded on the wrong pool!"
        );

        let mut encoder = CommandEncoder {
            buffer: command_buffer,
            pending_memory_barrier: MemoryBarrier::default(),
            pending_image_barrier: Vec::new(),
        };
        let result = (callback)(&mut encoder);
        encoder.emit_barriers();
        result
    }

    pub fn finish(&mut self, cb: &mut CommandBuffer) -> VkResult<()> {
        assert!(
            Arc::ptr_eq(&cb.pool, &self.inner),
            "Command buffer finished on the wrong pool!"
        );
        assert_eq!(cb.state, CommandBufferState::Recording);
        unsafe {
            self.device().end_command_buffer(cb.buffer)?;
        }
        cb.state = CommandBufferState::Executable;
        Ok(())
    }

    /// Returns a command buffer to the pool.
    pub fn free(&mut self, command_buffer: CommandBuffer) {
        assert!(
            Arc::ptr_eq(&command_buffer.pool, &self.inner),
            "Command buffer returned to the wrong pool!"
        );
        assert_ne!(
            command_buffer.state,
            CommandBufferState::Pending,
            "Command buffer is still being executed!"
        );
        drop(command_buffer);
    }

    /// Resets a command buffer to the `Initial` state so it can be recorded again.
    ///
    /// Requires a pool created with [`CommandPool::new_resettable`].
    pub fn reset(&mut self, command_buffer: &mut CommandBuffer) -> VkResult<()> {
        assert!(
            Arc::ptr_eq(&command_buffer.pool, &self.inner),
            "Command buffer resetting on the wrong pool!"
        );
        assert_ne!(
            command_buffer.state,
            CommandBufferState::Pending,
            "Command buffer is still being executed!"
        );
        unsafe {
            self.device()
                .reset_command_buffer(command_buffer.buffer, vk::CommandBufferResetFlags::empty())?;
        }
        command_buffer.state = CommandBufferState::Initial;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn command_buffer_lifecycle() {
        let context = crate::context::test_context();
        let family = context.queue().family_index();
        let mut pool = CommandPool::new_resettable(context.device().clone(), family).unwrap();
        let mut cmd = pool.alloc().unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Initial);
        pool.begin(&mut cmd).unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Recording);
        let pending = pool.record(&mut cmd, |encoder| {
            encoder.memory_barrier(Access::TRANSFER_WRITE, Access::COMPUTE_READ);
            encoder.has_pending_barriers()
        });
        assert!(pending);
        pool.finish(&mut cmd).unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Executable);
        pool.reset(&mut cmd).unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Initial);
        pool.free(cmd);
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    #[should_panic(expected = "Must call CommandPool::begin")]
    fn recording_requires_begin() {
        let context = crate::context::test_context();
        let family = context.queue().family_index();
        let mut pool = CommandPool::new(context.device().clone(), family).unwrap();
        let mut cmd = pool.alloc().unwrap();
        pool.record(&mut cmd, |_| ());
    }
}
