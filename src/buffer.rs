//! Device memory buffers with aligned instance records.
//!
//! A [`Buffer`] holds `instance_count` records of `instance_size` bytes. Each record starts
//! on a multiple of the alignment passed at creation, which makes the buffer usable with
//! dynamic uniform offsets and per-index flushes.
//!
//! Host access goes through an explicit mapping: [`Buffer::map`] must succeed before any
//! `write_*` call, and a buffer is mapped at most once until [`Buffer::unmap`].

use std::fmt::Debug;

use ash::{prelude::VkResult, vk};
use vk_mem::Alloc;

use crate::{
    Allocator, Device, HasDevice,
    error::{Error, Result},
    utils::AsVkHandle,
};

/// Rounds `instance_size` up to the next multiple of `min_offset_alignment`.
///
/// An alignment of zero leaves the size unchanged.
pub fn aligned_size(instance_size: vk::DeviceSize, min_offset_alignment: vk::DeviceSize) -> vk::DeviceSize {
    if min_offset_alignment == 0 || instance_size % min_offset_alignment == 0 {
        instance_size
    } else {
        (instance_size / min_offset_alignment + 1) * min_offset_alignment
    }
}

/// A buffer fully bound to a memory allocation.
pub struct Buffer {
    allocator: Allocator,
    allocation: vk_mem::Allocation,
    buffer: vk::Buffer,
    mapped: Option<*mut u8>,

    buffer_size: vk::DeviceSize,
    instance_size: vk::DeviceSize,
    instance_count: u32,
    alignment_size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory_properties: vk::MemoryPropertyFlags,
}
impl HasDevice for Buffer {
    fn device(&self) -> &Device {
        self.allocator.device()
    }
}
// Safety: the mapped pointer is only dereferenced through `&mut self`.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}
impl Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("buffer", &self.buffer)
            .field("buffer_size", &self.buffer_size)
            .field("instance_size", &self.instance_size)
            .field("instance_count", &self.instance_count)
            .field("alignment_size", &self.alignment_size)
            .field("memory_properties", &self.memory_properties)
            .field("mapped", &self.mapped.is_some())
            .finish_non_exhaustive()
    }
}
impl AsVkHandle for Buffer {
    type Handle = vk::Buffer;
    fn vk_handle(&self) -> Self::Handle {
        self.buffer
    }
}
impl Drop for Buffer {
    fn drop(&mut self) {
        self.unmap();
        unsafe {
            self.allocator
                .destroy_buffer(self.buffer, &mut self.allocation);
        }
    }
}

impl Buffer {
    /// Creates a buffer of `instance_count` records.
    ///
    /// `memory_properties` are required flags for the backing memory type; the memory
    /// actually chosen may have more (see [`Buffer::memory_properties`]).
    pub fn new(
        allocator: Allocator,
        instance_size: vk::DeviceSize,
        instance_count: u32,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
        min_offset_alignment: vk::DeviceSize,
    ) -> VkResult<Self> {
        let alignment_size = aligned_size(instance_size, min_offset_alignment);
        let buffer_size = alignment_size * instance_count as vk::DeviceSize;
        let (buffer, allocation) = unsafe {
            allocator.create_buffer_with_alignment(
                &vk::BufferCreateInfo {
                    size: buffer_size,
                    usage,
                    sharing_mode: vk::SharingMode::EXCLUSIVE,
                    ..Default::default()
                },
                &vk_mem::AllocationCreateInfo {
                    usage: vk_mem::MemoryUsage::Unknown,
                    required_flags: memory_properties,
                    ..Default::default()
                },
                min_offset_alignment.max(1),
            )?
        };
        let memory_properties = allocator.memory_properties(&allocation);
        tracing::trace!(
            ?buffer,
            size = buffer_size,
            ?usage,
            ?memory_properties,
            "Created buffer"
        );
        Ok(Self {
            allocator,
            allocation,
            buffer,
            mapped: None,
            buffer_size,
            instance_size,
            instance_count,
            alignment_size,
            usage,
            memory_properties,
        })
    }

    /// Creates a host-visible, host-coherent transfer source holding `data`.
    pub fn new_staging(allocator: Allocator, data: &[u8]) -> Result<Self> {
        let mut staging = Self::new(
            allocator,
            data.len() as vk::DeviceSize,
            1,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            0,
        )?;
        staging.map()?;
        staging.write_to_buffer(data, vk::WHOLE_SIZE, 0);
        staging.flush(vk::WHOLE_SIZE, 0)?;
        staging.unmap();
        Ok(staging)
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// Maps the whole allocation into host memory.
    ///
    /// There is no partial mapping: the mapping always spans `0..buffer_size`, and ranged
    /// access goes through the `offset` and `size` arguments of the write, flush and
    /// invalidate calls.
    ///
    /// Fails with [`Error::MapFailed`] if the buffer is already mapped or its memory is not
    /// host visible.
    pub fn map(&mut self) -> Result<()> {
        if self.mapped.is_some()
            || !self
                .memory_properties
                .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            return Err(Error::MapFailed);
        }
        let ptr = unsafe { self.allocator.map_memory(&mut self.allocation) }?;
        if ptr.is_null() {
            return Err(Error::MapFailed);
        }
        self.mapped = Some(ptr);
        Ok(())
    }

    /// Releases the host mapping. Does nothing if the buffer is not mapped.
    pub fn unmap(&mut self) {
        if self.mapped.take().is_some() {
            unsafe { self.allocator.unmap_memory(&mut self.allocation) };
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    fn mapped_slice(&mut self) -> &mut [u8] {
        let ptr = require_mapped(self.mapped, self.buffer);
        // Safety: the mapping covers the whole allocation, which is at least `buffer_size`.
        unsafe { std::slice::from_raw_parts_mut(ptr, self.buffer_size as usize) }
    }

    /// Copies `data` into the mapped buffer.
    ///
    /// With `size == vk::WHOLE_SIZE` exactly `buffer_size` bytes are written from offset 0,
    /// ignoring `offset`; bytes beyond `data` are zeroed. Otherwise `size` bytes of `data` go
    /// to `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not mapped, or if the range does not fit.
    pub fn write_to_buffer(&mut self, data: &[u8], size: vk::DeviceSize, offset: vk::DeviceSize) {
        copy_into(self.mapped_slice(), data, size, offset);
    }

    /// Writes one record at `index * alignment_size`.
    ///
    /// The index is not range checked against `instance_count`.
    pub fn write_to_index(&mut self, data: &[u8], index: u32) {
        assert!(
            data.len() as vk::DeviceSize <= self.instance_size,
            "record larger than instance size"
        );
        let offset = index as vk::DeviceSize * self.alignment_size;
        self.write_to_buffer(data, data.len() as vk::DeviceSize, offset);
    }

    /// Writes a plain-old-data value as the whole buffer contents.
    pub fn write_pod<T: bytemuck::Pod>(&mut self, value: &T) {
        self.write_to_buffer(bytemuck::bytes_of(value), vk::WHOLE_SIZE, 0);
    }

    /// Makes host writes in the range visible to the device. No-op on coherent memory.
    pub fn flush(&mut self, size: vk::DeviceSize, offset: vk::DeviceSize) -> VkResult<()> {
        if self
            .memory_properties
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            return Ok(());
        }
        self.allocator
            .flush_allocation(&self.allocation, offset, size)
    }

    /// Makes device writes in the range visible to the host. No-op on coherent memory.
    pub fn invalidate(&mut self, size: vk::DeviceSize, offset: vk::DeviceSize) -> VkResult<()> {
        if self
            .memory_properties
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            return Ok(());
        }
        self.allocator
            .invalidate_allocation(&self.allocation, offset, size)
    }

    pub fn flush_index(&mut self, index: u32) -> VkResult<()> {
        self.flush(
            self.alignment_size,
            index as vk::DeviceSize * self.alignment_size,
        )
    }

    pub fn invalidate_index(&mut self, index: u32) -> VkResult<()> {
        self.invalidate(
            self.alignment_size,
            index as vk::DeviceSize * self.alignment_size,
        )
    }

    /// Reads back the mapped contents. The caller should [`invalidate`](Self::invalidate)
    /// first on non-coherent memory.
    pub fn read_mapped(&mut self) -> Option<Vec<u8>> {
        let ptr = self.mapped?;
        Some(unsafe { std::slice::from_raw_parts(ptr, self.buffer_size as usize) }.to_vec())
    }

    pub fn descriptor_info(
        &self,
        size: vk::DeviceSize,
        offset: vk::DeviceSize,
    ) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.buffer,
            offset,
            range: size,
        }
    }

    pub fn descriptor_info_for_index(&self, index: u32) -> vk::DescriptorBufferInfo {
        self.descriptor_info(
            self.alignment_size,
            index as vk::DeviceSize * self.alignment_size,
        )
    }

    pub fn buffer_size(&self) -> vk::DeviceSize {
        self.buffer_size
    }
    pub fn instance_size(&self) -> vk::DeviceSize {
        self.instance_size
    }
    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }
    pub fn alignment_size(&self) -> vk::DeviceSize {
        self.alignment_size
    }
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }
    pub fn memory_properties(&self) -> vk::MemoryPropertyFlags {
        self.memory_properties
    }
}

fn require_mapped(mapped: Option<*mut u8>, buffer: vk::Buffer) -> *mut u8 {
    let Some(ptr) = mapped else {
        tracing::error!(?buffer, "write to unmapped buffer");
        panic!("Cannot write to a buffer that is not mapped");
    };
    ptr
}

/// The write rule of [`Buffer::write_to_buffer`], applied to the mapped bytes.
fn copy_into(target: &mut [u8], data: &[u8], size: vk::DeviceSize, offset: vk::DeviceSize) {
    if size == vk::WHOLE_SIZE {
        let n = data.len().min(target.len());
        target[..n].copy_from_slice(&data[..n]);
        target[n..].fill(0);
    } else {
        let (size, offset) = (size as usize, offset as usize);
        assert!(size <= data.len(), "write size exceeds the source data");
        assert!(
            offset.checked_add(size).is_some_and(|end| end <= target.len()),
            "write exceeds the buffer"
        );
        target[offset..offset + size].copy_from_slice(&data[..size]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_rounds_up_to_multiple() {
        for min in [1u64, 4, 16, 64, 256] {
            for size in [1u64, 3, 16, 63, 64, 65, 200, 256, 257] {
                let aligned = aligned_size(size, min);
                assert_eq!(aligned % min, 0);
                assert!(aligned >= size);
                assert!(aligned - size < min);
            }
        }
    }

    #[test]
    fn alignment_noop_cases() {
        assert_eq!(aligned_size(100, 0), 100);
        assert_eq!(aligned_size(256, 256), 256);
        assert_eq!(aligned_size(512, 256), 512);
        assert_eq!(aligned_size(300, 256), 512);
        assert_eq!(aligned_size(4, 64), 64);
    }

    fn allocator() -> Allocator {
        crate::context::test_context().allocator().clone()
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn map_at_most_once() {
        let mut buffer = Buffer::new(
            allocator(),
            48,
            3,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            64,
        )
        .unwrap();
        assert_eq!(buffer.alignment_size(), 64);
        assert_eq!(buffer.buffer_size(), 192);
        buffer.map().unwrap();
        assert!(matches!(buffer.map(), Err(Error::MapFailed)));
        buffer.unmap();
        buffer.map().unwrap();
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn write_to_index_uses_alignment() {
        let mut buffer = Buffer::new(
            allocator(),
            4,
            3,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            16,
        )
        .unwrap();
        buffer.map().unwrap();
        buffer.write_to_buffer(&[0xAA; 48], vk::WHOLE_SIZE, 0);
        buffer.write_to_index(&[1, 2, 3, 4], 2);
        buffer.flush_index(2).unwrap();
        let bytes = buffer.read_mapped().unwrap();
        assert_eq!(&bytes[32..36], &[1, 2, 3, 4]);
        assert_eq!(bytes[36], 0xAA);
        assert_eq!(bytes[0], 0xAA);
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn whole_size_write_ignores_offset_and_zero_fills() {
        let mut buffer = Buffer::new(
            allocator(),
            16,
            1,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            0,
        )
        .unwrap();
        buffer.map().unwrap();
        buffer.write_to_buffer(&[7; 16], vk::WHOLE_SIZE, 0);
        buffer.write_to_buffer(&[1, 2], vk::WHOLE_SIZE, 8);
        let bytes = buffer.read_mapped().unwrap();
        assert_eq!(&bytes[..2], &[1, 2]);
        assert!(bytes[2..].iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "not mapped")]
    fn write_without_map_panics() {
        require_mapped(None, vk::Buffer::null());
    }

    #[test]
    fn whole_size_copy_zero_fills_the_tail() {
        let mut target = [7u8; 8];
        copy_into(&mut target, &[1, 2], vk::WHOLE_SIZE, 5);
        assert_eq!(target, [1, 2, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn ranged_copy_touches_only_the_range() {
        let mut target = [0u8; 8];
        copy_into(&mut target, &[9, 9, 9, 9], 2, 6);
        assert_eq!(target, [0, 0, 0, 0, 0, 0, 9, 9]);
    }

    #[test]
    #[should_panic(expected = "exceeds the buffer")]
    fn ranged_copy_past_the_end_panics() {
        let mut target = [0u8; 8];
        copy_into(&mut target, &[1, 2, 3], 3, 6);
    }
}
