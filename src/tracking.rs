//! Pipeline stage / access pairs and the image layout transitions the engine performs.
//!
//! An [`Access`] names what a command does to a resource: the pipeline stage it happens in
//! and the memory access it makes. Barriers are expressed as a `before` access that must
//! complete and an `after` access that waits for it.
//!
//! Textures only ever move through a small set of layouts. [`layout_transition`] is the
//! complete table of legal moves; any other pair is a programming error.

use std::ops::{BitOr, BitOrAssign};

use ash::vk;

use crate::error::{Error, Result};

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Access {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}
impl BitOr for Access {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self {
            stage: self.stage | rhs.stage,
            access: self.access | rhs.access,
        }
    }
}
impl BitOrAssign for Access {
    fn bitor_assign(&mut self, rhs: Self) {
        self.stage |= rhs.stage;
        self.access |= rhs.access;
    }
}

impl Access {
    pub const NONE: Access = Access {
        stage: vk::PipelineStageFlags2::NONE,
        access: vk::AccessFlags2::NONE,
    };
    pub const TOP_OF_PIPE: Access = Access {
        stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
        access: vk::AccessFlags2::NONE,
    };
    pub const TRANSFER_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::TRANSFER,
        access: vk::AccessFlags2::TRANSFER_WRITE,
    };
    pub const TRANSFER_READ: Access = Access {
        stage: vk::PipelineStageFlags2::TRANSFER,
        access: vk::AccessFlags2::TRANSFER_READ,
    };
    pub const HOST_READ: Access = Access {
        stage: vk::PipelineStageFlags2::HOST,
        access: vk::AccessFlags2::HOST_READ,
    };
    /// Sampled reads from the fragment and compute stages.
    pub const SHADER_SAMPLED_READ: Access = Access {
        stage: vk::PipelineStageFlags2::from_raw(
            vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw()
                | vk::PipelineStageFlags2::COMPUTE_SHADER.as_raw(),
        ),
        access: vk::AccessFlags2::SHADER_SAMPLED_READ,
    };
    pub const COMPUTE_READ: Access = Access {
        stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::SHADER_SAMPLED_READ.as_raw()
                | vk::AccessFlags2::SHADER_STORAGE_READ.as_raw(),
        ),
    };
    pub const COMPUTE_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
        access: vk::AccessFlags2::SHADER_STORAGE_WRITE,
    };
    /// Any shader read or write from any stage, used for images kept in `GENERAL`.
    pub const ALL_SHADER_ACCESS: Access = Access {
        stage: vk::PipelineStageFlags2::ALL_COMMANDS,
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::SHADER_READ.as_raw() | vk::AccessFlags2::SHADER_WRITE.as_raw(),
        ),
    };
    pub const COLOR_ATTACHMENT_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
    };
}

/// A global memory barrier accumulated by the command encoder.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct MemoryBarrier {
    pub src: Access,
    pub dst: Access,
}
impl MemoryBarrier {
    pub fn is_empty(&self) -> bool {
        self.src == Access::NONE && self.dst == Access::NONE
    }
}

/// The barrier accesses for one legal image layout transition.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LayoutTransition {
    pub before: Access,
    pub after: Access,
}

/// Looks up the barrier for moving an image from `old` to `new`.
///
/// Only four moves exist:
/// `UNDEFINED -> TRANSFER_DST`, `TRANSFER_DST -> SHADER_READ_ONLY`,
/// `TRANSFER_DST -> GENERAL` and `SHADER_READ_ONLY -> GENERAL`.
pub fn layout_transition(old: vk::ImageLayout, new: vk::ImageLayout) -> Result<LayoutTransition> {
    use vk::ImageLayout as L;
    let (before, after) = match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => (Access::TOP_OF_PIPE, Access::TRANSFER_WRITE),
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => {
            (Access::TRANSFER_WRITE, Access::SHADER_SAMPLED_READ)
        }
        (L::TRANSFER_DST_OPTIMAL, L::GENERAL) => {
            (Access::TRANSFER_WRITE, Access::ALL_SHADER_ACCESS)
        }
        // Reached right after mip generation, whose last writes were blits.
        (L::SHADER_READ_ONLY_OPTIMAL, L::GENERAL) => {
            (Access::TRANSFER_WRITE, Access::ALL_SHADER_ACCESS)
        }
        _ => return Err(Error::UnsupportedLayoutTransition { old, new }),
    };
    Ok(LayoutTransition { before, after })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk::ImageLayout as L;

    #[test]
    fn legal_transitions() {
        let t = layout_transition(L::UNDEFINED, L::TRANSFER_DST_OPTIMAL).unwrap();
        assert_eq!(t.before.stage, vk::PipelineStageFlags2::TOP_OF_PIPE);
        assert_eq!(t.before.access, vk::AccessFlags2::NONE);
        assert_eq!(t.after, Access::TRANSFER_WRITE);

        let t = layout_transition(L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL).unwrap();
        assert_eq!(t.before, Access::TRANSFER_WRITE);
        assert!(t.after.stage.contains(vk::PipelineStageFlags2::FRAGMENT_SHADER));

        for old in [L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL] {
            let t = layout_transition(old, L::GENERAL).unwrap();
            assert_eq!(t.after.stage, vk::PipelineStageFlags2::ALL_COMMANDS);
        }
    }

    #[test]
    fn every_other_pair_is_rejected() {
        let layouts = [
            L::UNDEFINED,
            L::GENERAL,
            L::TRANSFER_SRC_OPTIMAL,
            L::TRANSFER_DST_OPTIMAL,
            L::SHADER_READ_ONLY_OPTIMAL,
            L::COLOR_ATTACHMENT_OPTIMAL,
            L::PRESENT_SRC_KHR,
        ];
        let legal = [
            (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL),
            (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL),
            (L::TRANSFER_DST_OPTIMAL, L::GENERAL),
            (L::SHADER_READ_ONLY_OPTIMAL, L::GENERAL),
        ];
        for old in layouts {
            for new in layouts {
                let result = layout_transition(old, new);
                if legal.contains(&(old, new)) {
                    assert!(result.is_ok());
                } else {
                    assert!(matches!(
                        result,
                        Err(Error::UnsupportedLayoutTransition { old: o, new: n }) if o == old && n == new
                    ));
                }
            }
        }
    }

    #[test]
    fn access_union() {
        let mut a = Access::TRANSFER_READ;
        a |= Access::TRANSFER_WRITE;
        assert_eq!(
            a.access,
            vk::AccessFlags2::TRANSFER_READ | vk::AccessFlags2::TRANSFER_WRITE
        );
        assert_eq!(a.stage, vk::PipelineStageFlags2::TRANSFER);
        assert!(MemoryBarrier::default().is_empty());
    }
}
