//! Error type shared by the whole crate.
//!
//! Recoverable conditions (pool exhaustion, Vulkan results, decode failures) are returned as
//! [`Error`]. Contract violations such as writing to an unmapped [`Buffer`](crate::buffer::Buffer)
//! are logged and then panic instead.

use ash::vk;

/// Errors returned by tephra.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The buffer is already mapped, or its memory is not host visible.
    #[error("buffer memory could not be mapped")]
    MapFailed,

    /// The requested image layout transition has no barrier definition.
    #[error("unsupported layout transition from {old:?} to {new:?}")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    /// The descriptor pool has no room left for the requested set.
    #[error("descriptor pool exhausted")]
    PoolExhausted,

    /// A descriptor write targeted a binding the layout does not declare.
    #[error("descriptor binding {0} is not declared by the layout")]
    UnknownBinding(u32),

    /// A descriptor write does not match the declared count or kind of its binding.
    #[error("descriptor write to binding {binding} does not match the layout: {reason}")]
    DescriptorMismatch { binding: u32, reason: String },

    /// No physical device satisfied the engine's requirements.
    #[error("no suitable physical device found")]
    NoSuitableDevice,

    /// The operation needs a presentation surface but the context was created headless.
    #[error("context has no presentation surface")]
    MissingSurface,

    /// SPIR-V byte code was malformed.
    #[error("invalid SPIR-V shader: {0}")]
    InvalidShader(String),

    #[error(transparent)]
    Vulkan(#[from] vk::Result),

    #[error("failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("failed to decode image: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("window handle unavailable: {0}")]
    WindowHandle(#[from] raw_window_handle::HandleError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Returns true for swapchain results that call for recreation rather than failure.
    pub fn is_out_of_date(&self) -> bool {
        matches!(
            self,
            Error::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_date_detection() {
        assert!(Error::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR).is_out_of_date());
        assert!(Error::Vulkan(vk::Result::SUBOPTIMAL_KHR).is_out_of_date());
        assert!(!Error::Vulkan(vk::Result::ERROR_DEVICE_LOST).is_out_of_date());
        assert!(!Error::PoolExhausted.is_out_of_date());
    }

    #[test]
    fn layout_error_names_both_layouts() {
        let err = Error::UnsupportedLayoutTransition {
            old: vk::ImageLayout::GENERAL,
            new: vk::ImageLayout::UNDEFINED,
        };
        let message = err.to_string();
        assert!(message.contains("GENERAL"));
        assert!(message.contains("UNDEFINED"));
    }
}
