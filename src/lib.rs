//! # Tephra
//!
//! The core of a Vulkan PBR renderer: GPU buffers and textures, descriptor management,
//! image-based lighting precomputation, a per-frame material registry and a frames-in-flight
//! render loop.
//!
//! ## Quick Start
//!
//! ```no_run
//! use tephra::prelude::*;
//!
//! let context = Context::headless().unwrap();
//! let texture = Texture::builder()
//!     .add_layer(TextureSource::solid(glam::Vec4::new(1.0, 0.5, 0.0, 1.0), 64, 64))
//!     .build(&context)
//!     .unwrap();
//! assert_eq!(texture.mip_level_count(), 7);
//! ```
//!
//! ## Overview
//!
//! ### Context
//!
//! Every resource is created from a [`Context`](context::Context): the logical [`Device`],
//! the VMA [`Allocator`], the single graphics [`Queue`] and a command pool for blocking
//! one-shot work such as uploads and mipmap generation. The context is passed explicitly and
//! is cheap to clone.
//!
//! ### Resources
//!
//! - [`Buffer`](buffer::Buffer): fixed-size records with host mapping, flushes and
//!   per-record descriptor info
//! - [`Texture`](texture::Texture): image, view and sampler built from one or more
//!   [`TextureSource`](texture::TextureSource) layers, with a full mip chain and a tracked
//!   layout
//! - [`Cubemap`](cubemap::Cubemap): environment cubes, converted from equirectangular HDR
//!   images and prefiltered for image-based lighting by compute passes
//!
//! ### Descriptors and materials
//!
//! [`DescriptorSetLayout`](descriptor::DescriptorSetLayout),
//! [`DescriptorPool`](descriptor::DescriptorPool) and
//! [`DescriptorWriter`](descriptor::DescriptorWriter) build sets whose writes are checked
//! against the layout. The [`MaterialSystem`](material::MaterialSystem) keeps one uniform
//! buffer and one descriptor set per material and frame in flight.
//!
//! ### Frame loop
//!
//! The [`Renderer`](renderer::Renderer) owns the swapchain and drives
//! acquire → record → submit → present. [`Render3d`](render3d::Render3d) wires the renderer,
//! global uniforms, materials and user [`RenderSystem`](render3d::RenderSystem)s into a
//! [`Module`](module::Module) that an [`Application`](module::Application) updates once per
//! window loop iteration.
//!
//! ## Requirements
//!
//! - Vulkan 1.3 with `synchronization2` and `samplerAnisotropy`
//! - `VK_KHR_swapchain` when presenting to a window

mod alloc;
pub mod buffer;
pub mod command;
pub mod context;
pub mod cubemap;
pub mod debug;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod frame;
pub mod image;
pub mod instance;
pub mod material;
pub mod model;
pub mod module;
pub mod physical_device;
pub mod pipeline;
pub mod queue;
pub mod render3d;
pub mod renderer;
mod sampler;
mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;
pub mod tracking;
pub mod utils;

pub use alloc::Allocator;
pub use device::{Device, HasDevice};
pub use error::{Error, Result};
pub use instance::Instance;
pub use queue::Queue;
pub use sampler::Sampler;
pub use surface::Surface;

pub use ash;
pub use glam;

pub mod prelude {
    pub use crate::{
        Allocator, Device, Error, HasDevice, Result, ash,
        ash::vk,
        buffer::Buffer,
        context::{Context, ContextConfig},
        cubemap::{Cubemap, IblShaders},
        descriptor::{DescriptorPool, DescriptorSetLayout, DescriptorWriter},
        frame::{Camera, FrameInfo, GlobalUbo, LightSource},
        material::{MaterialId, MaterialSystem},
        model::{Model, ModelData, Vertex},
        module::{Application, Module},
        render3d::{Environment, PbrRenderSystem, Render3d, RenderObject, RenderSystem, Scene},
        renderer::{Renderer, RendererConfig},
        texture::{Texture, TextureSource},
        tracking::Access,
        utils::AsVkHandle,
    };
}
