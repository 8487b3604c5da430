//! Vulkan descriptor set layouts, descriptor pools and descriptor writes.
//!
//! # Key Types
//!
//! - [`DescriptorSetLayout`]: an immutable binding-index → (type, stages, count) contract,
//!   built with [`DescriptorSetLayoutBuilder`].
//! - [`DescriptorPool`]: a bounded arena of descriptor sets. Running out of room is a
//!   recoverable [`Error::PoolExhausted`], never a crash.
//! - [`DescriptorWriter`]: collects buffer and image descriptors for one layout and writes
//!   them into a newly allocated or an existing set.
//!
//! # Example
//!
//! ```no_run
//! # use tephra::{Device, ash::vk, descriptor::{DescriptorSetLayout, DescriptorPool, DescriptorWriter}};
//! # let (device, queue) = Device::create_system_default().unwrap();
//! # let buffer_info = vk::DescriptorBufferInfo::default();
//! let layout = DescriptorSetLayout::builder()
//!     .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::ALL_GRAPHICS, 1)
//!     .build(device.clone())
//!     .unwrap();
//! let mut pool = DescriptorPool::builder()
//!     .max_sets(1)
//!     .add_pool_size(vk::DescriptorType::UNIFORM_BUFFER, 1)
//!     .build(device)
//!     .unwrap();
//! let set = DescriptorWriter::new(&layout, &mut pool)
//!     .write_buffer(0, &[buffer_info])
//!     .build()
//!     .unwrap();
//! ```

use std::collections::BTreeMap;

use ash::{prelude::VkResult, vk};
use smallvec::SmallVec;

use crate::{
    Device, HasDevice,
    error::{Error, Result},
    utils::AsVkHandle,
};

/// The bindings of a descriptor set layout, keyed by binding index.
#[derive(Clone, Debug, Default)]
pub struct SetLayoutBindings {
    bindings: BTreeMap<u32, vk::DescriptorSetLayoutBinding<'static>>,
}

impl SetLayoutBindings {
    /// Declares a binding. Returns `false` and leaves the set untouched when `binding` is
    /// already declared.
    pub fn insert(
        &mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
        count: u32,
    ) -> bool {
        if self.bindings.contains_key(&binding) {
            return false;
        }
        self.bindings.insert(
            binding,
            vk::DescriptorSetLayoutBinding {
                binding,
                descriptor_type,
                descriptor_count: count,
                stage_flags,
                ..Default::default()
            },
        );
        true
    }

    pub fn get(&self, binding: u32) -> Option<&vk::DescriptorSetLayoutBinding<'static>> {
        self.bindings.get(&binding)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Descriptor counts per type needed for one set with these bindings.
    pub fn type_counts(&self) -> BTreeMap<vk::DescriptorType, u32> {
        let mut counts = BTreeMap::new();
        for binding in self.bindings.values() {
            *counts.entry(binding.descriptor_type).or_insert(0) += binding.descriptor_count;
        }
        counts
    }

    /// Validates a write of `count` descriptors of the given kind against the declared
    /// binding, returning the declared descriptor type.
    pub fn check_write(&self, binding: u32, count: usize, kind: WriteKind) -> Result<vk::DescriptorType> {
        let declared = self.get(binding).ok_or(Error::UnknownBinding(binding))?;
        if declared.descriptor_count as usize != count {
            return Err(Error::DescriptorMismatch {
                binding,
                reason: format!(
                    "layout declares {} descriptors but {count} were given",
                    declared.descriptor_count
                ),
            });
        }
        if WriteKind::of(declared.descriptor_type) != Some(kind) {
            return Err(Error::DescriptorMismatch {
                binding,
                reason: format!(
                    "binding has type {:?}, which does not take {kind:?} descriptors",
                    declared.descriptor_type
                ),
            });
        }
        Ok(declared.descriptor_type)
    }

    fn raw_bindings(&self) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
        self.bindings.values().copied().collect()
    }
}

/// Whether a descriptor refers to a buffer or an image.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WriteKind {
    Buffer,
    Image,
}

impl WriteKind {
    pub fn of(ty: vk::DescriptorType) -> Option<Self> {
        match ty {
            vk::DescriptorType::UNIFORM_BUFFER
            | vk::DescriptorType::STORAGE_BUFFER
            | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
            | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => Some(Self::Buffer),
            vk::DescriptorType::SAMPLER
            | vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            | vk::DescriptorType::SAMPLED_IMAGE
            | vk::DescriptorType::STORAGE_IMAGE
            | vk::DescriptorType::INPUT_ATTACHMENT => Some(Self::Image),
            _ => None,
        }
    }
}

/// Builder for [`DescriptorSetLayout`].
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: SetLayoutBindings,
}

impl DescriptorSetLayoutBuilder {
    /// Declares `binding`.
    ///
    /// # Panics
    ///
    /// Panics if `binding` was already declared on this builder.
    pub fn add_binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
        count: u32,
    ) -> Self {
        if !self.bindings.insert(binding, descriptor_type, stage_flags, count) {
            tracing::error!(binding, "Descriptor binding declared twice");
            panic!("Binding {binding} already in use");
        }
        self
    }

    pub fn build(self, device: Device) -> VkResult<DescriptorSetLayout> {
        let raw_bindings = self.bindings.raw_bindings();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&raw_bindings);
        let raw = unsafe { device.create_descriptor_set_layout(&info, None) }?;
        tracing::trace!(layout = ?raw, bindings = raw_bindings.len(), "created descriptor set layout");
        Ok(DescriptorSetLayout {
            device,
            handle: raw,
            bindings: self.bindings,
        })
    }
}

pub struct DescriptorSetLayout {
    device: Device,
    handle: vk::DescriptorSetLayout,
    bindings: SetLayoutBindings,
}
impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.handle, None);
        }
    }
}
impl DescriptorSetLayout {
    pub fn builder() -> DescriptorSetLayoutBuilder {
        DescriptorSetLayoutBuilder::default()
    }

    pub fn bindings(&self) -> &SetLayoutBindings {
        &self.bindings
    }
}
impl AsVkHandle for DescriptorSetLayout {
    type Handle = vk::DescriptorSetLayout;

    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}
impl HasDevice for DescriptorSetLayout {
    fn device(&self) -> &Device {
        &self.device
    }
}

/// Host-side record of what a pool can still hand out.
///
/// Some drivers allocate past the declared pool sizes, so exhaustion is detected here
/// before Vulkan is asked.
#[derive(Clone, Debug, Default)]
pub struct PoolCapacity {
    max_sets: u32,
    sets_in_use: u32,
    capacity: BTreeMap<vk::DescriptorType, u32>,
    in_use: BTreeMap<vk::DescriptorType, u32>,
}

impl PoolCapacity {
    pub fn new(pool_sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> Self {
        let mut capacity = BTreeMap::new();
        for size in pool_sizes {
            *capacity.entry(size.ty).or_insert(0) += size.descriptor_count;
        }
        Self {
            max_sets,
            sets_in_use: 0,
            capacity,
            in_use: BTreeMap::new(),
        }
    }

    /// Reserves room for `count` sets with the given bindings, or leaves the
    /// accounting untouched and returns [`Error::PoolExhausted`].
    pub fn reserve(&mut self, bindings: &SetLayoutBindings, count: u32) -> Result<()> {
        if self.sets_in_use + count > self.max_sets {
            return Err(Error::PoolExhausted);
        }
        let needed = bindings.type_counts();
        for (ty, per_set) in &needed {
            let capacity = self.capacity.get(ty).copied().unwrap_or(0);
            let used = self.in_use.get(ty).copied().unwrap_or(0);
            if used + per_set * count > capacity {
                return Err(Error::PoolExhausted);
            }
        }
        self.sets_in_use += count;
        for (ty, per_set) in needed {
            *self.in_use.entry(ty).or_insert(0) += per_set * count;
        }
        Ok(())
    }

    /// Returns the room taken by `count` sets with the given bindings.
    pub fn release(&mut self, bindings: &SetLayoutBindings, count: u32) {
        self.sets_in_use = self.sets_in_use.saturating_sub(count);
        for (ty, per_set) in bindings.type_counts() {
            if let Some(used) = self.in_use.get_mut(&ty) {
                *used = used.saturating_sub(per_set * count);
            }
        }
    }

    pub fn clear(&mut self) {
        self.sets_in_use = 0;
        self.in_use.clear();
    }

    pub fn sets_in_use(&self) -> u32 {
        self.sets_in_use
    }

    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }
}

/// Builder for [`DescriptorPool`].
pub struct DescriptorPoolBuilder {
    pool_sizes: SmallVec<[vk::DescriptorPoolSize; 4]>,
    max_sets: u32,
    flags: vk::DescriptorPoolCreateFlags,
}

impl Default for DescriptorPoolBuilder {
    fn default() -> Self {
        Self {
            pool_sizes: SmallVec::new(),
            max_sets: 1000,
            flags: vk::DescriptorPoolCreateFlags::empty(),
        }
    }
}

impl DescriptorPoolBuilder {
    pub fn add_pool_size(mut self, ty: vk::DescriptorType, count: u32) -> Self {
        self.pool_sizes.push(vk::DescriptorPoolSize {
            ty,
            descriptor_count: count,
        });
        self
    }

    pub fn max_sets(mut self, max_sets: u32) -> Self {
        self.max_sets = max_sets;
        self
    }

    pub fn flags(mut self, flags: vk::DescriptorPoolCreateFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn build(self, device: Device) -> VkResult<DescriptorPool> {
        let raw = unsafe {
            device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo {
                    flags: self.flags,
                    max_sets: self.max_sets,
                    ..Default::default()
                }
                .pool_sizes(&self.pool_sizes),
                None,
            )?
        };
        tracing::trace!(pool = ?raw, max_sets = self.max_sets, "created descriptor pool");
        Ok(DescriptorPool {
            device,
            raw,
            flags: self.flags,
            capacity: PoolCapacity::new(&self.pool_sizes, self.max_sets),
        })
    }
}

pub struct DescriptorPool {
    device: Device,
    raw: vk::DescriptorPool,
    flags: vk::DescriptorPoolCreateFlags,
    capacity: PoolCapacity,
}
impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.raw, None);
        }
    }
}
impl AsVkHandle for DescriptorPool {
    type Handle = vk::DescriptorPool;
    fn vk_handle(&self) -> Self::Handle {
        self.raw
    }
}
impl HasDevice for DescriptorPool {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl DescriptorPool {
    pub fn builder() -> DescriptorPoolBuilder {
        DescriptorPoolBuilder::default()
    }

    /// Allocates one set for `layout`. Returns [`Error::PoolExhausted`] when the pool is full.
    pub fn allocate_descriptor_set(&mut self, layout: &DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        self.capacity.reserve(layout.bindings(), 1)?;
        let layouts = [layout.vk_handle()];
        let result = unsafe {
            self.device.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(self.raw)
                    .set_layouts(&layouts),
            )
        };
        match result {
            Ok(sets) => sets.into_iter().next().ok_or(Error::PoolExhausted),
            Err(err) => {
                self.capacity.release(layout.bindings(), 1);
                match err {
                    vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                        Err(Error::PoolExhausted)
                    }
                    other => Err(other.into()),
                }
            }
        }
    }

    /// Allocates `count` sets for `layout` at once. Either every set is allocated or none
    /// is, so a failure leaves the pool as it was.
    pub fn allocate_descriptor_sets(
        &mut self,
        layout: &DescriptorSetLayout,
        count: u32,
    ) -> Result<Vec<vk::DescriptorSet>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        self.capacity.reserve(layout.bindings(), count)?;
        let layouts = vec![layout.vk_handle(); count as usize];
        let result = unsafe {
            self.device.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(self.raw)
                    .set_layouts(&layouts),
            )
        };
        result.map_err(|err| {
            self.capacity.release(layout.bindings(), count);
            match err {
                vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                    Error::PoolExhausted
                }
                other => other.into(),
            }
        })
    }

    /// Returns individual sets to the pool.
    ///
    /// # Panics
    ///
    /// Panics unless the pool was built with `FREE_DESCRIPTOR_SET`.
    pub fn free(&mut self, layout: &DescriptorSetLayout, sets: &[vk::DescriptorSet]) -> VkResult<()> {
        assert!(
            self.flags
                .contains(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET),
            "Descriptor pool was not created with FREE_DESCRIPTOR_SET"
        );
        unsafe { self.device.free_descriptor_sets(self.raw, sets)? };
        self.capacity.release(layout.bindings(), sets.len() as u32);
        Ok(())
    }

    /// Releases every set allocated from the pool at once.
    pub fn reset(&mut self) -> VkResult<()> {
        unsafe {
            self.device
                .reset_descriptor_pool(self.raw, vk::DescriptorPoolResetFlags::empty())?;
        }
        self.capacity.clear();
        Ok(())
    }

    pub fn capacity(&self) -> &PoolCapacity {
        &self.capacity
    }
}

enum WriteInfos {
    Buffers(SmallVec<[vk::DescriptorBufferInfo; 1]>),
    Images(SmallVec<[vk::DescriptorImageInfo; 1]>),
}

struct PendingWrite {
    binding: u32,
    descriptor_type: vk::DescriptorType,
    infos: WriteInfos,
}

/// Validated descriptor writes for one layout, not yet tied to a set.
#[derive(Default)]
pub struct DescriptorWrites {
    writes: Vec<PendingWrite>,
}

impl DescriptorWrites {
    pub fn push_buffers(
        &mut self,
        bindings: &SetLayoutBindings,
        binding: u32,
        infos: &[vk::DescriptorBufferInfo],
    ) -> Result<()> {
        let descriptor_type = bindings.check_write(binding, infos.len(), WriteKind::Buffer)?;
        self.writes.push(PendingWrite {
            binding,
            descriptor_type,
            infos: WriteInfos::Buffers(infos.iter().copied().collect()),
        });
        Ok(())
    }

    pub fn push_images(
        &mut self,
        bindings: &SetLayoutBindings,
        binding: u32,
        infos: &[vk::DescriptorImageInfo],
    ) -> Result<()> {
        let descriptor_type = bindings.check_write(binding, infos.len(), WriteKind::Image)?;
        self.writes.push(PendingWrite {
            binding,
            descriptor_type,
            infos: WriteInfos::Images(infos.iter().copied().collect()),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// The raw writes targeting `set`, borrowing the stored infos.
    pub fn to_vk(&self, set: vk::DescriptorSet) -> Vec<vk::WriteDescriptorSet<'_>> {
        self.writes
            .iter()
            .map(|write| {
                let raw = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(write.binding)
                    .dst_array_element(0)
                    .descriptor_type(write.descriptor_type);
                match &write.infos {
                    WriteInfos::Buffers(infos) => raw.buffer_info(infos),
                    WriteInfos::Images(infos) => raw.image_info(infos),
                }
            })
            .collect()
    }
}

/// Writes buffer and image descriptors for one layout into descriptor sets.
///
/// Every write is checked against the layout as it is added; a write whose count or kind
/// disagrees with the declared binding is a programming error and panics before any set is
/// touched.
pub struct DescriptorWriter<'a> {
    layout: &'a DescriptorSetLayout,
    pool: &'a mut DescriptorPool,
    writes: DescriptorWrites,
}

impl<'a> DescriptorWriter<'a> {
    pub fn new(layout: &'a DescriptorSetLayout, pool: &'a mut DescriptorPool) -> Self {
        Self {
            layout,
            pool,
            writes: DescriptorWrites::default(),
        }
    }

    pub fn write_buffer(mut self, binding: u32, infos: &[vk::DescriptorBufferInfo]) -> Self {
        if let Err(err) = self
            .writes
            .push_buffers(self.layout.bindings(), binding, infos)
        {
            tracing::error!(binding, %err, "Invalid buffer descriptor write");
            panic!("{err}");
        }
        self
    }

    pub fn write_image(mut self, binding: u32, infos: &[vk::DescriptorImageInfo]) -> Self {
        if let Err(err) = self
            .writes
            .push_images(self.layout.bindings(), binding, infos)
        {
            tracing::error!(binding, %err, "Invalid image descriptor write");
            panic!("{err}");
        }
        self
    }

    /// Allocates a set from the pool and writes every collected descriptor into it.
    ///
    /// Nothing is written if allocation fails.
    pub fn build(self) -> Result<vk::DescriptorSet> {
        let set = self.pool.allocate_descriptor_set(self.layout)?;
        self.overwrite(set);
        Ok(set)
    }

    /// Writes every collected descriptor into an already allocated set.
    pub fn overwrite(&self, set: vk::DescriptorSet) {
        let writes = self.writes.to_vk(set);
        unsafe {
            self.layout.device().update_descriptor_sets(&writes, &[]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material_like_bindings() -> SetLayoutBindings {
        let mut bindings = SetLayoutBindings::default();
        assert!(bindings.insert(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::ShaderStageFlags::ALL_GRAPHICS,
            1
        ));
        for binding in 1..=3 {
            assert!(bindings.insert(
                binding,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::ALL_GRAPHICS,
                1
            ));
        }
        bindings
    }

    #[test]
    fn duplicate_binding_is_refused() {
        let mut bindings = material_like_bindings();
        assert!(!bindings.insert(
            2,
            vk::DescriptorType::STORAGE_IMAGE,
            vk::ShaderStageFlags::COMPUTE,
            1
        ));
        assert_eq!(
            bindings.get(2).unwrap().descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
    }

    #[test]
    #[should_panic(expected = "Binding 0 already in use")]
    fn builder_panics_on_duplicate_binding() {
        let _ = DescriptorSetLayout::builder()
            .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::ALL, 1)
            .add_binding(0, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::ALL, 1);
    }

    #[test]
    fn type_counts_sum_per_type() {
        let counts = material_like_bindings().type_counts();
        assert_eq!(counts[&vk::DescriptorType::UNIFORM_BUFFER], 1);
        assert_eq!(counts[&vk::DescriptorType::COMBINED_IMAGE_SAMPLER], 3);
    }

    #[test]
    fn write_checks_count_and_kind() {
        let bindings = material_like_bindings();
        let mut writes = DescriptorWrites::default();
        let buffer = vk::DescriptorBufferInfo {
            buffer: vk::Buffer::null(),
            offset: 0,
            range: 64,
        };

        assert!(matches!(
            writes.push_buffers(&bindings, 0, &[buffer, buffer]),
            Err(Error::DescriptorMismatch { binding: 0, .. })
        ));
        assert!(matches!(
            writes.push_buffers(&bindings, 1, &[buffer]),
            Err(Error::DescriptorMismatch { binding: 1, .. })
        ));
        assert!(matches!(
            writes.push_images(&bindings, 7, &[vk::DescriptorImageInfo::default()]),
            Err(Error::UnknownBinding(7))
        ));
        // Rejected writes leave nothing behind.
        assert!(writes.is_empty());

        writes.push_buffers(&bindings, 0, &[buffer]).unwrap();
        writes
            .push_images(&bindings, 1, &[vk::DescriptorImageInfo::default()])
            .unwrap();
        let raw = writes.to_vk(vk::DescriptorSet::null());
        assert_eq!(raw.len(), 2);
        assert_eq!(raw[0].dst_binding, 0);
        assert_eq!(raw[0].descriptor_count, 1);
        assert_eq!(raw[0].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(
            raw[1].descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
    }

    #[test]
    fn capacity_tracks_sets_and_types() {
        let mut ubo_only = SetLayoutBindings::default();
        ubo_only.insert(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::ShaderStageFlags::ALL,
            1,
        );
        let mut capacity = PoolCapacity::new(
            &[vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 1,
            }],
            1,
        );
        capacity.reserve(&ubo_only, 1).unwrap();
        assert!(matches!(
            capacity.reserve(&ubo_only, 1),
            Err(Error::PoolExhausted)
        ));
        assert_eq!(capacity.sets_in_use(), 1);

        capacity.release(&ubo_only, 1);
        capacity.reserve(&ubo_only, 1).unwrap();
        capacity.clear();
        assert_eq!(capacity.sets_in_use(), 0);
    }

    #[test]
    fn batch_reservation_is_all_or_nothing() {
        let bindings = material_like_bindings();
        let mut capacity = PoolCapacity::new(
            &[
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: 3,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    descriptor_count: 9,
                },
            ],
            3,
        );
        capacity.reserve(&bindings, 2).unwrap();
        // Two more sets would fit the set count of one, not two.
        assert!(matches!(
            capacity.reserve(&bindings, 2),
            Err(Error::PoolExhausted)
        ));
        assert_eq!(capacity.sets_in_use(), 2);
        capacity.reserve(&bindings, 1).unwrap();
        assert_eq!(capacity.sets_in_use(), 3);
    }

    #[test]
    fn capacity_rejects_missing_type() {
        let mut capacity = PoolCapacity::new(
            &[vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 10,
            }],
            10,
        );
        assert!(matches!(
            capacity.reserve(&material_like_bindings(), 1),
            Err(Error::PoolExhausted)
        ));
        assert_eq!(capacity.sets_in_use(), 0);
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn second_allocation_from_single_set_pool_fails() {
        let context = crate::context::test_context();
        let device = context.device().clone();
        let layout = DescriptorSetLayout::builder()
            .add_binding(
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::ALL,
                1,
            )
            .build(device.clone())
            .unwrap();
        let mut pool = DescriptorPool::builder()
            .max_sets(1)
            .add_pool_size(vk::DescriptorType::UNIFORM_BUFFER, 1)
            .build(device.clone())
            .unwrap();
        let buffer = crate::buffer::Buffer::new(
            context.allocator().clone(),
            64,
            1,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            1,
        )
        .unwrap();

        let set = DescriptorWriter::new(&layout, &mut pool)
            .write_buffer(0, &[buffer.descriptor_info(64, 0)])
            .build()
            .unwrap();
        assert_ne!(set, vk::DescriptorSet::null());

        let second = DescriptorWriter::new(&layout, &mut pool)
            .write_buffer(0, &[buffer.descriptor_info(64, 0)])
            .build();
        assert!(matches!(second, Err(Error::PoolExhausted)));
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn failed_batch_allocation_restores_capacity() {
        let context = crate::context::test_context();
        let device = context.device().clone();
        let layout = DescriptorSetLayout::builder()
            .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::ALL, 1)
            .build(device.clone())
            .unwrap();
        let mut pool = DescriptorPool::builder()
            .max_sets(3)
            .add_pool_size(vk::DescriptorType::UNIFORM_BUFFER, 3)
            .build(device)
            .unwrap();

        let first = pool.allocate_descriptor_sets(&layout, 2).unwrap();
        assert_eq!(first.len(), 2);
        assert!(matches!(
            pool.allocate_descriptor_sets(&layout, 2),
            Err(Error::PoolExhausted)
        ));
        assert_eq!(pool.capacity().sets_in_use(), 2);
        pool.allocate_descriptor_set(&layout).unwrap();
        assert_eq!(pool.capacity().sets_in_use(), 3);
    }
}
