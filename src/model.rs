//! Meshes in device-local vertex and index buffers.
//!
//! [`ModelData`] is the host-side description of a mesh; [`Model::new`] uploads it through
//! staging buffers. Loading meshes from files belongs to the embedder.

use ash::vk;
use glam::{Vec2, Vec3};

use crate::{
    HasDevice,
    buffer::Buffer,
    context::Context,
    error::Result,
    utils::AsVkHandle,
};

/// Vertex layout shared by [`Model`] and the default graphics pipeline.
///
/// | location | attribute |
/// |---|---|
/// | 0 | position |
/// | 1 | color |
/// | 2 | normal |
/// | 3 | uv |
/// | 4 | tangent |
/// | 5 | bitangent |
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub color: Vec3,
    pub normal: Vec3,
    pub tangent: Vec3,
    pub bitangent: Vec3,
    pub uv: Vec2,
}

impl Default for Vertex {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            color: Vec3::ONE,
            normal: Vec3::ZERO,
            tangent: Vec3::ZERO,
            bitangent: Vec3::ZERO,
            uv: Vec2::ZERO,
        }
    }
}

impl Vertex {
    pub fn binding_descriptions() -> [vk::VertexInputBindingDescription; 1] {
        [vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }]
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 6] {
        let attribute = |location, format, offset: usize| vk::VertexInputAttributeDescription {
            location,
            binding: 0,
            format,
            offset: offset as u32,
        };
        let vec3 = vk::Format::R32G32B32_SFLOAT;
        [
            attribute(0, vec3, std::mem::offset_of!(Self, position)),
            attribute(1, vec3, std::mem::offset_of!(Self, color)),
            attribute(2, vec3, std::mem::offset_of!(Self, normal)),
            attribute(3, vk::Format::R32G32_SFLOAT, std::mem::offset_of!(Self, uv)),
            attribute(4, vec3, std::mem::offset_of!(Self, tangent)),
            attribute(5, vec3, std::mem::offset_of!(Self, bitangent)),
        ]
    }
}

/// How a model is drawn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawCall {
    Vertices(u32),
    Indexed(u32),
}

/// Vertices and optional `u32` indices of one mesh.
#[derive(Clone, Debug, Default)]
pub struct ModelData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl ModelData {
    /// # Panics
    ///
    /// Panics with fewer than three vertices, or with between one and two indices.
    pub fn draw_call(&self) -> DrawCall {
        let vertex_count = self.vertices.len();
        let index_count = self.indices.len();
        if vertex_count < 3 || (1..3).contains(&index_count) {
            tracing::error!(vertex_count, index_count, "Degenerate model");
            panic!("A model needs at least 3 vertices and either no indices or at least 3");
        }
        if index_count == 0 {
            DrawCall::Vertices(vertex_count as u32)
        } else {
            DrawCall::Indexed(index_count as u32)
        }
    }
}

/// A mesh uploaded to device-local memory.
pub struct Model {
    vertex_buffer: Buffer,
    index_buffer: Option<Buffer>,
    draw_call: DrawCall,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("vertex_buffer", &self.vertex_buffer.vk_handle())
            .field("draw_call", &self.draw_call)
            .finish_non_exhaustive()
    }
}

impl Model {
    pub fn new(context: &Context, data: &ModelData) -> Result<Self> {
        let draw_call = data.draw_call();
        let vertex_buffer = upload(
            context,
            bytemuck::cast_slice(&data.vertices),
            std::mem::size_of::<Vertex>() as vk::DeviceSize,
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        let index_buffer = match draw_call {
            DrawCall::Vertices(_) => None,
            DrawCall::Indexed(_) => Some(upload(
                context,
                bytemuck::cast_slice(&data.indices),
                std::mem::size_of::<u32>() as vk::DeviceSize,
                vk::BufferUsageFlags::INDEX_BUFFER,
            )?),
        };
        tracing::debug!(vertices = data.vertices.len(), indices = data.indices.len(), "Created model");
        Ok(Self {
            vertex_buffer,
            index_buffer,
            draw_call,
        })
    }

    /// Binds the vertex buffer at binding 0 and the index buffer, if any.
    pub fn bind(&self, command_buffer: vk::CommandBuffer) {
        let device = self.vertex_buffer.device();
        unsafe {
            device.cmd_bind_vertex_buffers(
                command_buffer,
                0,
                &[self.vertex_buffer.vk_handle()],
                &[0],
            );
            if let Some(index_buffer) = &self.index_buffer {
                device.cmd_bind_index_buffer(
                    command_buffer,
                    index_buffer.vk_handle(),
                    0,
                    vk::IndexType::UINT32,
                );
            }
        }
    }

    /// Draws one instance. The model must be bound.
    pub fn draw(&self, command_buffer: vk::CommandBuffer) {
        let device = self.vertex_buffer.device();
        unsafe {
            match self.draw_call {
                DrawCall::Vertices(count) => device.cmd_draw(command_buffer, count, 1, 0, 0),
                DrawCall::Indexed(count) => {
                    device.cmd_draw_indexed(command_buffer, count, 1, 0, 0, 0)
                }
            }
        }
    }

    pub fn draw_call(&self) -> DrawCall {
        self.draw_call
    }
    pub fn has_index_buffer(&self) -> bool {
        self.index_buffer.is_some()
    }
}

fn upload(
    context: &Context,
    bytes: &[u8],
    element_size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
) -> Result<Buffer> {
    let staging = Buffer::new_staging(context.allocator().clone(), bytes)?;
    let size = bytes.len() as vk::DeviceSize;
    let buffer = Buffer::new(
        context.allocator().clone(),
        element_size,
        (size / element_size) as u32,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
        1,
    )?;
    context.copy_buffer(&staging, &buffer, size)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> ModelData {
        let vertex = |x, y| Vertex {
            position: Vec3::new(x, y, 0.0),
            ..Default::default()
        };
        ModelData {
            vertices: vec![vertex(0.0, -0.5), vertex(0.5, 0.5), vertex(-0.5, 0.5)],
            indices: Vec::new(),
        }
    }

    #[test]
    fn vertex_layout_is_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 68);
        let attributes = Vertex::attribute_descriptions();
        let locations: Vec<_> = attributes.iter().map(|a| a.location).collect();
        assert_eq!(locations, [0, 1, 2, 3, 4, 5]);
        assert_eq!(attributes[3].offset, 60);
        assert_eq!(attributes[3].format, vk::Format::R32G32_SFLOAT);
        assert_eq!(Vertex::binding_descriptions()[0].stride, 68);
        assert_eq!(Vertex::default().color, Vec3::ONE);
    }

    #[test]
    fn indices_select_indexed_draws() {
        let mut data = triangle();
        assert_eq!(data.draw_call(), DrawCall::Vertices(3));
        data.indices = vec![0, 1, 2, 2, 1, 0];
        assert_eq!(data.draw_call(), DrawCall::Indexed(6));
    }

    #[test]
    #[should_panic(expected = "at least 3 vertices")]
    fn two_vertices_are_rejected() {
        let mut data = triangle();
        data.vertices.pop();
        data.draw_call();
    }

    #[test]
    #[should_panic(expected = "either no indices or at least 3")]
    fn partial_index_list_is_rejected() {
        let mut data = triangle();
        data.indices = vec![0, 1];
        data.draw_call();
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn upload_indexed_model() {
        let context = crate::context::test_context();
        let mut data = triangle();
        data.indices = vec![0, 1, 2];
        let model = Model::new(&context, &data).unwrap();
        assert!(model.has_index_buffer());
        assert_eq!(model.draw_call(), DrawCall::Indexed(3));

        let plain = Model::new(&context, &triangle()).unwrap();
        assert!(!plain.has_index_buffer());
        assert_eq!(plain.draw_call(), DrawCall::Vertices(3));
    }
}
