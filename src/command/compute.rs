//! Compute shader and pipeline binding commands.
//!
//! This module extends [`CommandEncoder`] with methods for binding pipelines,
//! descriptor sets, push constants, and dispatching compute work.

use ash::vk;
use glam::UVec3;

use crate::{
    HasDevice,
    pipeline::{Pipeline, PipelineLayout},
    utils::AsVkHandle,
};

use super::CommandEncoder;

impl CommandEncoder<'_> {
    /// Binds a pipeline to the command buffer.
    pub fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: &Pipeline) {
        unsafe {
            self.device().cmd_bind_pipeline(
                self.buffer().vk_handle(),
                bind_point,
                pipeline.vk_handle(),
            );
        }
    }

    /// Binds descriptor sets to the command buffer.
    pub fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: &PipelineLayout,
        first_set: u32,
        descriptor_sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        unsafe {
            self.device().cmd_bind_descriptor_sets(
                self.buffer().vk_handle(),
                bind_point,
                layout.vk_handle(),
                first_set,
                descriptor_sets,
                dynamic_offsets,
            );
        }
    }

    /// Updates push constant data for the pipeline.
    pub fn push_constants(
        &mut self,
        layout: &PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        constants: &[u8],
    ) {
        debug_assert!(layout.device() == self.device());
        unsafe {
            self.device().cmd_push_constants(
                self.buffer().vk_handle(),
                layout.vk_handle(),
                stages,
                offset,
                constants,
            );
        }
    }

    /// Dispatches compute work.
    ///
    /// Executes the currently bound compute pipeline with `size` workgroups in each
    /// dimension. See [`group_count`](crate::utils::group_count) for deriving it from an
    /// image extent.
    pub fn dispatch(&mut self, size: UVec3) {
        unsafe {
            self.device()
                .cmd_dispatch(self.buffer().vk_handle(), size.x, size.y, size.z);
        }
    }
}
