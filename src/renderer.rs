//! The frame loop.
//!
//! A frame moves through `Idle → FrameAcquired → RenderPassActive → RenderPassEnded → Idle`:
//!
//! ```no_run
//! # use tephra::{context::Context, renderer::{Renderer, RendererConfig}};
//! # fn frame(renderer: &mut Renderer) -> tephra::Result<()> {
//! if let Some(command_buffer) = renderer.begin_frame()? {
//!     renderer.begin_swapchain_render_pass(command_buffer);
//!     // draw
//!     renderer.end_swapchain_render_pass(command_buffer);
//!     renderer.end_frame()?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Each frame-in-flight slot owns a command buffer, an "image available" semaphore and an
//! "in flight" fence. The slot index advances on every [`Renderer::end_frame`], so per-slot
//! resources are reused round robin once the slot's fence has signaled.
//!
//! Resizes never recreate the swapchain on the spot. [`Renderer::notify_resized`] records the
//! new window size; recreation happens in the next `end_frame` or `begin_frame`.

use ash::vk;

use crate::{
    HasDevice,
    command::{CommandBuffer, CommandPool},
    context::Context,
    error::{Error, Result},
    queue::SemaphoreOp,
    swapchain::{RenderPass, Swapchain},
    sync::FrameSync,
    utils::AsVkHandle,
};

#[derive(Clone, Debug)]
pub struct RendererConfig {
    /// Number of frames the CPU may record ahead of the GPU.
    pub frames_in_flight: usize,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
    pub clear_stencil: u32,
    /// Used when the surface supports it, FIFO otherwise.
    pub present_mode: vk::PresentModeKHR,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            clear_color: [0.1, 0.1, 0.1, 1.0],
            clear_depth: 1.0,
            clear_stencil: 0,
            present_mode: vk::PresentModeKHR::MAILBOX,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    FrameAcquired,
    RenderPassActive,
    RenderPassEnded,
}

/// Host-side bookkeeping of the frame loop, independent of any Vulkan object.
#[derive(Debug)]
pub struct FrameTracker {
    state: FrameState,
    frame_index: usize,
    frames_in_flight: usize,
    image_index: u32,
    resize_pending: bool,
    /// For each swapchain image, the slot whose submission last rendered into it.
    images_in_flight: Vec<Option<usize>>,
}

impl FrameTracker {
    pub fn new(frames_in_flight: usize) -> Self {
        assert!(frames_in_flight > 0, "At least one frame must be in flight");
        Self {
            state: FrameState::Idle,
            frame_index: 0,
            frames_in_flight,
            image_index: 0,
            resize_pending: false,
            images_in_flight: Vec::new(),
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }
    pub fn image_index(&self) -> u32 {
        assert_ne!(self.state, FrameState::Idle, "No frame in progress");
        self.image_index
    }
    pub fn is_frame_in_progress(&self) -> bool {
        self.state != FrameState::Idle
    }

    pub fn begin(&mut self, image_index: u32) {
        if self.state != FrameState::Idle {
            tracing::error!(state = ?self.state, "begin_frame while a frame is in progress");
            panic!("Can't begin a frame while one is already in progress");
        }
        self.image_index = image_index;
        self.state = FrameState::FrameAcquired;
    }

    pub fn begin_render_pass(&mut self) {
        assert_eq!(
            self.state,
            FrameState::FrameAcquired,
            "The swapchain render pass can only begin once per acquired frame"
        );
        self.state = FrameState::RenderPassActive;
    }

    pub fn end_render_pass(&mut self) {
        assert_eq!(
            self.state,
            FrameState::RenderPassActive,
            "No swapchain render pass is active"
        );
        self.state = FrameState::RenderPassEnded;
    }

    /// Leaves the frame and advances to the next slot. Returns the image that was rendered.
    pub fn end(&mut self) -> u32 {
        match self.state {
            FrameState::FrameAcquired | FrameState::RenderPassEnded => {}
            state => {
                tracing::error!(?state, "end_frame in an invalid state");
                panic!("Can't end a frame that has not begun or whose render pass is still active");
            }
        }
        self.state = FrameState::Idle;
        self.frame_index = (self.frame_index + 1) % self.frames_in_flight;
        self.image_index
    }

    /// Abandons the current frame without advancing.
    fn abort(&mut self) {
        self.state = FrameState::Idle;
    }

    pub fn notify_resized(&mut self) {
        self.resize_pending = true;
    }
    pub fn resize_pending(&self) -> bool {
        self.resize_pending
    }
    fn clear_resize(&mut self) {
        self.resize_pending = false;
    }

    /// Forgets image ownership after the swapchain has been rebuilt with `image_count` images.
    pub fn reset_images(&mut self, image_count: usize) {
        self.images_in_flight.clear();
        self.images_in_flight.resize(image_count, None);
    }

    /// Forgets every image claimed by `slot`, whose submission never happened.
    pub fn release_slot(&mut self, slot: usize) {
        for owner in &mut self.images_in_flight {
            if *owner == Some(slot) {
                *owner = None;
            }
        }
    }

    /// Assigns `image` to the current slot, returning the other slot still using it, if any.
    pub fn claim_image(&mut self, image: u32) -> Option<usize> {
        let slot = self.images_in_flight.get_mut(image as usize)?;
        let previous = slot.replace(self.frame_index);
        previous.filter(|&previous| previous != self.frame_index)
    }
}

/// Owns the swapchain and drives acquisition, submission and presentation.
pub struct Renderer {
    command_buffers: Vec<CommandBuffer>,
    command_pool: CommandPool,
    frames: Vec<FrameSync>,
    swapchain: Option<Swapchain>,
    tracker: FrameTracker,
    config: RendererConfig,
    window_extent: vk::Extent2D,
    context: Context,
}

impl HasDevice for Renderer {
    fn device(&self) -> &crate::Device {
        self.context.device()
    }
}

impl Renderer {
    /// `width` and `height` are the window's framebuffer size in pixels.
    pub fn new(context: &Context, width: u32, height: u32, config: RendererConfig) -> Result<Self> {
        if context.surface().is_none() {
            return Err(Error::MissingSurface);
        }
        let device = context.device().clone();
        let mut command_pool =
            CommandPool::new_resettable(device.clone(), context.queue().family_index())?;
        let command_buffers = (0..config.frames_in_flight)
            .map(|_| command_pool.alloc())
            .collect::<Result<Vec<_>, _>>()?;
        let frames = (0..config.frames_in_flight)
            .map(|_| FrameSync::new(&device))
            .collect::<Result<Vec<_>, _>>()?;
        let mut renderer = Self {
            command_buffers,
            command_pool,
            frames,
            swapchain: None,
            tracker: FrameTracker::new(config.frames_in_flight),
            config,
            window_extent: vk::Extent2D { width, height },
            context: context.clone(),
        };
        renderer.recreate_swapchain()?;
        Ok(renderer)
    }

    /// Starts recording a frame.
    ///
    /// Returns `Ok(None)` when no frame can be drawn right now, because the swapchain was out
    /// of date or the window has no area. The caller skips this iteration.
    pub fn begin_frame(&mut self) -> Result<Option<vk::CommandBuffer>> {
        if self.tracker.is_frame_in_progress() {
            tracing::error!("begin_frame called twice without end_frame");
            panic!("Can't call begin_frame while a frame is already in progress");
        }
        if (self.swapchain.is_none() || self.tracker.resize_pending())
            && !self.recreate_swapchain()?
        {
            return Ok(None);
        }
        let Some(swapchain) = &self.swapchain else {
            return Ok(None);
        };

        let slot = self.tracker.frame_index();
        let sync = &self.frames[slot];
        sync.in_flight.wait()?;
        self.command_buffers[slot].complete();

        let image_index = match swapchain.acquire_next_image(sync.image_available.vk_handle()) {
            Ok((index, _suboptimal)) => index,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                tracing::debug!("Swapchain out of date on acquire");
                self.recreate_swapchain()?;
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        if let Some(previous) = self.tracker.claim_image(image_index) {
            self.frames[previous].in_flight.wait()?;
        }

        let command_buffer = &mut self.command_buffers[slot];
        self.command_pool.reset(command_buffer)?;
        self.command_pool.begin(command_buffer)?;
        self.tracker.begin(image_index);
        Ok(Some(command_buffer.vk_handle()))
    }

    /// Submits and presents the frame, then advances to the next frame-in-flight slot.
    ///
    /// The slot advances even when this call fails or recreates the swapchain.
    pub fn end_frame(&mut self) -> Result<()> {
        let slot = self.tracker.frame_index();
        let image_index = self.tracker.end();
        let outcome = self.submit_and_present(slot, image_index);

        let needs_recreation = match outcome {
            Ok(suboptimal) => suboptimal,
            Err(Error::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR)) => true,
            Err(err) => return Err(err),
        };
        if needs_recreation || self.tracker.resize_pending() {
            self.recreate_swapchain()?;
        }
        Ok(())
    }

    fn submit_and_present(&mut self, slot: usize, image_index: u32) -> Result<bool> {
        let swapchain = self
            .swapchain
            .as_ref()
            .ok_or(Error::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR))?;
        let command_buffer = &mut self.command_buffers[slot];
        self.command_pool.finish(command_buffer)?;

        let sync = &self.frames[slot];
        let render_finished = swapchain.render_finished(image_index);
        let mut queue = self.context.queue();
        // The fence is only unsignaled once the submission that signals it is queued.
        sync.in_flight.reset()?;
        let submitted = queue.submit(
            command_buffer,
            &[SemaphoreOp {
                semaphore: sync.image_available.vk_handle(),
                stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            }],
            &[SemaphoreOp {
                semaphore: render_finished,
                stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            }],
            sync.in_flight.vk_handle(),
        );
        if let Err(err) = submitted {
            drop(queue);
            tracing::error!(?err, slot, "Frame submission failed");
            self.restore_slot(slot)?;
            return Err(err.into());
        }
        Ok(queue.present(swapchain.vk_handle(), image_index, &[render_finished])?)
    }

    /// Makes a slot whose submission never reached the queue usable again.
    ///
    /// Its fence would never signal and its acquire semaphore would never be waited on, so
    /// both are replaced by a fresh signaled pair.
    fn restore_slot(&mut self, slot: usize) -> Result<()> {
        self.tracker.release_slot(slot);
        self.frames[slot] = FrameSync::new(self.context.device())?;
        Ok(())
    }

    /// Begins the swapchain render pass on the current frame's command buffer and sets a
    /// full-extent viewport and scissor.
    pub fn begin_swapchain_render_pass(&mut self, command_buffer: vk::CommandBuffer) {
        self.assert_current(command_buffer);
        let Some(swapchain) = &self.swapchain else {
            panic!("No swapchain while a frame is in progress");
        };
        self.tracker.begin_render_pass();

        let [r, g, b, a] = self.config.clear_color;
        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [r, g, b, a],
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: self.config.clear_depth,
                    stencil: self.config.clear_stencil,
                },
            },
        ];
        let extent = swapchain.extent();
        let render_area = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(swapchain.render_pass().vk_handle())
            .framebuffer(swapchain.framebuffer(self.tracker.image_index()))
            .render_area(render_area)
            .clear_values(&clear_values);
        let device = self.context.device();
        unsafe {
            device.cmd_begin_render_pass(command_buffer, &info, vk::SubpassContents::INLINE);
            device.cmd_set_viewport(
                command_buffer,
                0,
                &[vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: extent.width as f32,
                    height: extent.height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                }],
            );
            device.cmd_set_scissor(command_buffer, 0, &[render_area]);
        }
    }

    pub fn end_swapchain_render_pass(&mut self, command_buffer: vk::CommandBuffer) {
        self.assert_current(command_buffer);
        self.tracker.end_render_pass();
        unsafe {
            self.context.device().cmd_end_render_pass(command_buffer);
        }
    }

    fn assert_current(&self, command_buffer: vk::CommandBuffer) {
        assert!(
            self.tracker.is_frame_in_progress(),
            "Can't use the swapchain render pass outside of a frame"
        );
        assert_eq!(
            command_buffer,
            self.command_buffers[self.tracker.frame_index()].vk_handle(),
            "Can't begin or end the render pass on a command buffer from a different frame"
        );
    }

    /// Records the new window size. The swapchain is rebuilt at the next frame boundary.
    pub fn notify_resized(&mut self, width: u32, height: u32) {
        self.window_extent = vk::Extent2D { width, height };
        self.tracker.notify_resized();
    }

    /// Returns `false` when the window has no area, leaving the resize pending.
    fn recreate_swapchain(&mut self) -> Result<bool> {
        if self.window_extent.width == 0 || self.window_extent.height == 0 {
            tracing::debug!("Window has zero area; deferring swapchain recreation");
            self.tracker.notify_resized();
            return Ok(false);
        }
        self.context.wait_idle()?;
        for command_buffer in &mut self.command_buffers {
            command_buffer.complete();
        }
        if self.swapchain.is_some() {
            tracing::info!(
                width = %self.window_extent.width,
                height = %self.window_extent.height,
                "Recreating swapchain"
            );
        }

        let old = self.swapchain.take();
        let swapchain = match Swapchain::new(
            &self.context,
            self.window_extent,
            self.config.present_mode,
            old.as_ref(),
        ) {
            Ok(swapchain) => swapchain,
            Err(err) if err.is_out_of_date() => {
                self.tracker.notify_resized();
                return Ok(false);
            }
            Err(err) => return Err(err),
        };
        if let Some(old) = &old {
            if !old.compare_formats(&swapchain) {
                tracing::error!(
                    old = ?old.format(),
                    new = ?swapchain.format(),
                    "Swapchain image or depth format has changed"
                );
            }
        }
        drop(old);

        self.tracker.reset_images(swapchain.image_count());
        self.tracker.clear_resize();
        self.swapchain = Some(swapchain);
        Ok(true)
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
    pub fn config(&self) -> &RendererConfig {
        &self.config
    }
    /// The current swapchain. `None` only while the window has no area.
    pub fn swapchain(&self) -> Option<&Swapchain> {
        self.swapchain.as_ref()
    }
    pub fn render_pass(&self) -> Option<&RenderPass> {
        self.swapchain.as_ref().map(Swapchain::render_pass)
    }
    pub fn swapchain_format(&self) -> Option<vk::Format> {
        self.swapchain.as_ref().map(Swapchain::format)
    }
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain
            .as_ref()
            .map_or(self.window_extent, Swapchain::extent)
    }
    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.extent();
        extent.width as f32 / extent.height.max(1) as f32
    }
    pub fn frame_index(&self) -> usize {
        self.tracker.frame_index()
    }
    pub fn frames_in_flight(&self) -> usize {
        self.tracker.frames_in_flight()
    }
    pub fn is_frame_in_progress(&self) -> bool {
        self.tracker.is_frame_in_progress()
    }
    pub fn current_command_buffer(&self) -> vk::CommandBuffer {
        assert!(
            self.tracker.is_frame_in_progress(),
            "Can't get the command buffer when no frame is in progress"
        );
        self.command_buffers[self.tracker.frame_index()].vk_handle()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if self.tracker.is_frame_in_progress() {
            tracing::warn!("Renderer dropped in the middle of a frame");
            self.tracker.abort();
        }
        if let Err(err) = self.context.wait_idle() {
            tracing::error!(?err, "Failed to wait for in-flight frames");
            return;
        }
        for command_buffer in &mut self.command_buffers {
            command_buffer.complete();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_index_cycles_every_end() {
        let mut tracker = FrameTracker::new(2);
        let mut seen = Vec::new();
        for frame in 0..5 {
            tracker.begin(frame % 3);
            tracker.begin_render_pass();
            tracker.end_render_pass();
            if frame == 2 {
                // A resize in the middle of the loop must not disturb the cycle.
                tracker.notify_resized();
                tracker.reset_images(3);
                tracker.clear_resize();
            }
            seen.push(tracker.frame_index());
            tracker.end();
        }
        assert_eq!(seen, [0, 1, 0, 1, 0]);
        assert_eq!(tracker.frame_index(), 1);
    }

    #[test]
    fn frame_without_render_pass_can_end() {
        let mut tracker = FrameTracker::new(3);
        tracker.begin(0);
        assert_eq!(tracker.end(), 0);
        assert_eq!(tracker.state(), FrameState::Idle);
        assert_eq!(tracker.frame_index(), 1);
    }

    #[test]
    #[should_panic(expected = "already in progress")]
    fn double_begin_panics() {
        let mut tracker = FrameTracker::new(2);
        tracker.begin(0);
        tracker.begin(1);
    }

    #[test]
    #[should_panic(expected = "still active")]
    fn end_with_active_render_pass_panics() {
        let mut tracker = FrameTracker::new(2);
        tracker.begin(0);
        tracker.begin_render_pass();
        tracker.end();
    }

    #[test]
    #[should_panic(expected = "once per acquired frame")]
    fn render_pass_outside_frame_panics() {
        let mut tracker = FrameTracker::new(2);
        tracker.begin_render_pass();
    }

    #[test]
    fn images_in_flight_report_other_slot() {
        let mut tracker = FrameTracker::new(2);
        tracker.reset_images(3);

        assert_eq!(tracker.claim_image(0), None);
        tracker.begin(0);
        tracker.end();
        // Slot 1 gets image 0 while slot 0 may still be rendering into it.
        assert_eq!(tracker.claim_image(0), Some(0));
        tracker.begin(0);
        tracker.end();
        // Back in slot 0: the image was last used by slot 1.
        assert_eq!(tracker.claim_image(0), Some(1));
        assert_eq!(tracker.claim_image(0), None);
        assert_eq!(tracker.claim_image(7), None);
    }

    #[test]
    fn failed_submission_leaves_nothing_to_wait_for() {
        let mut tracker = FrameTracker::new(2);
        tracker.reset_images(2);

        assert_eq!(tracker.claim_image(1), None);
        tracker.begin(1);
        let slot = tracker.frame_index();
        tracker.end();
        // The submission of slot 0 failed after the slot advanced.
        tracker.release_slot(slot);
        assert_eq!(tracker.frame_index(), 1);

        // Slot 1 acquires the same image and must not wait on slot 0's fence.
        assert_eq!(tracker.claim_image(1), None);
        tracker.begin(1);
        tracker.end();

        // Back in slot 0, the image now belongs to slot 1, which did submit.
        assert_eq!(tracker.claim_image(1), Some(1));
    }

    #[test]
    fn default_config() {
        let config = RendererConfig::default();
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.clear_color, [0.1, 0.1, 0.1, 1.0]);
        assert_eq!(config.clear_depth, 1.0);
        assert_eq!(config.present_mode, vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn renderer_requires_surface() {
        let context = crate::context::test_context();
        assert!(matches!(
            Renderer::new(&context, 800, 600, RendererConfig::default()),
            Err(Error::MissingSurface)
        ));
    }
}
