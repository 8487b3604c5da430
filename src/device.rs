//! Logical device creation and management.
//!
//! - [`Device`]: The main device handle, reference-counted for cheap sharing
//! - [`DeviceBuilder`]: Builder for configuring devices before creation
//! - [`DeviceQueueRef`]: Reference to a queue that will be created with the device
//! - [`HasDevice`]: Trait for types associated with a device
//!
//! For simple use cases, [`Device::create_system_default`] creates a headless device with
//! sensible defaults:
//!
//! ```no_run
//! # use tephra::Device;
//! let (device, queue) = Device::create_system_default().unwrap();
//! ```

use crate::{
    Instance,
    error::{Error, Result},
    physical_device::PhysicalDevice,
    queue::Queue,
    utils::{AsVkHandle, Version},
};
use ash::{prelude::VkResult, vk};

use std::{
    collections::BTreeSet,
    ffi::{CStr, CString},
    fmt::Debug,
    ops::Deref,
    sync::Arc,
};

/// A trait for types created from a Vulkan device.
pub trait HasDevice {
    /// Returns a reference to the Vulkan device.
    fn device(&self) -> &Device;

    /// Returns a reference to the Vulkan [`PhysicalDevice`].
    fn physical_device(&self) -> &PhysicalDevice {
        self.device().physical_device()
    }

    /// Returns a reference to the Vulkan [`Instance`].
    fn instance(&self) -> &Instance {
        self.device().physical_device().instance()
    }
}

/// A Vulkan logical device wrapper.
///
/// Reference-counted using [`Arc`]. Every resource created from the device keeps a clone,
/// so the logical device is destroyed only after the last resource.
#[derive(Clone)]
pub struct Device(Arc<DeviceInner>);
impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Device {}
impl Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Device")
            .field(&self.0.device.handle())
            .finish()
    }
}

struct DeviceInner {
    physical_device: PhysicalDevice,
    device: ash::Device,
    swapchain: Option<ash::khr::swapchain::Device>,
    enabled_extensions: BTreeSet<CString>,
    features: vk::PhysicalDeviceFeatures,
}

impl Device {
    /// Returns a reference to the Vulkan [`Instance`].
    pub fn instance(&self) -> &Instance {
        self.0.physical_device.instance()
    }

    /// Returns a reference to the [`PhysicalDevice`]
    pub fn physical_device(&self) -> &PhysicalDevice {
        &self.0.physical_device
    }

    pub fn has_extension_named(&self, name: &CStr) -> bool {
        self.0.enabled_extensions.contains(name)
    }

    /// Function table for `VK_KHR_swapchain`, if it was enabled.
    pub fn swapchain_loader(&self) -> Option<&ash::khr::swapchain::Device> {
        self.0.swapchain.as_ref()
    }

    /// Core features enabled on this device.
    pub fn features(&self) -> &vk::PhysicalDeviceFeatures {
        &self.0.features
    }

    /// Creates a headless device on the first adapter with a graphics + compute queue.
    pub fn create_system_default() -> Result<(Self, Queue)> {
        let entry = Arc::new(unsafe { ash::Entry::load() }?);
        let mut instance_builder = Instance::builder(entry)?;
        instance_builder.info.api_version = Version::V1_3;
        let instance = instance_builder.build()?;

        let pdevice = instance
            .enumerate_physical_devices()?
            .find(|pdevice| pdevice.properties().api_version() >= Version::V1_3)
            .ok_or(Error::NoSuitableDevice)?;
        let mut builder = Device::builder(pdevice);
        let queue = builder
            .enable_queue_with_caps(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1.0)
            .ok_or(Error::NoSuitableDevice)?;
        builder.enable_synchronization2();
        builder.enable_sampler_anisotropy();
        let device = builder.build()?;
        let queue = device.get_queue(queue);
        Ok((device, queue))
    }

    /// Creates a new device builder for the given physical device.
    pub fn builder(pdevice: PhysicalDevice) -> DeviceBuilder {
        DeviceBuilder::new(pdevice)
    }

    /// Gets a queue handle from a queue reference.
    ///
    /// # Panics
    ///
    /// Panics if the queue reference doesn't belong to this device.
    pub fn get_queue(&self, queue: DeviceQueueRef) -> Queue {
        assert!(self.physical_device() == &queue.pdevice);
        unsafe {
            let raw_queue = self.0.device.get_device_queue(queue.family, queue.index);
            Queue::from_raw(self.clone(), raw_queue, queue.family, queue.flags)
        }
    }

    /// Blocks until the device has finished all submitted work.
    pub fn wait_idle(&self) -> VkResult<()> {
        unsafe { self.0.device.device_wait_idle() }
    }
}

impl Deref for Device {
    type Target = ash::Device;

    fn deref(&self) -> &Self::Target {
        &self.0.device
    }
}
impl AsVkHandle for Device {
    type Handle = vk::Device;

    fn vk_handle(&self) -> Self::Handle {
        self.0.device.handle()
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        tracing::info!(device = ?self.device.handle(), "drop device");
        // Safety: every object created from the device holds a clone of `Device`,
        // so nothing created from it is alive at this point.
        unsafe {
            self.device.destroy_device(None);
        }
    }
}

/// A builder for creating Vulkan logical devices.
pub struct DeviceBuilder {
    pdevice: PhysicalDevice,
    queue_info: Vec<vk::QueueFamilyProperties>,
    queue_priorities: Vec<Vec<f32>>,
    enabled_extensions: BTreeSet<CString>,

    /// Core features to enable.
    pub features: vk::PhysicalDeviceFeatures,
    /// Vulkan 1.3 features to enable.
    pub features13: vk::PhysicalDeviceVulkan13Features<'static>,
}

/// A queue that will be created with the device.
///
/// Returned by [`DeviceBuilder::enable_queue`]; pass it to [`Device::get_queue`] after
/// building the device.
pub struct DeviceQueueRef {
    pdevice: PhysicalDevice,
    family: u32,
    index: u32,
    flags: vk::QueueFlags,
}

impl DeviceQueueRef {
    pub fn family_index(&self) -> u32 {
        self.family
    }

    pub fn flags(&self) -> vk::QueueFlags {
        self.flags
    }
}

impl DeviceBuilder {
    pub fn new(pdevice: PhysicalDevice) -> Self {
        let queue_info = pdevice.queue_family_properties();
        Self {
            queue_priorities: vec![Vec::new(); queue_info.len()],
            queue_info,
            pdevice,
            enabled_extensions: BTreeSet::new(),
            features: vk::PhysicalDeviceFeatures::default(),
            features13: vk::PhysicalDeviceVulkan13Features::default(),
        }
    }

    pub fn physical_device(&self) -> &PhysicalDevice {
        &self.pdevice
    }

    /// Enables a device extension by name. Returns false if the adapter lacks it.
    pub fn enable_extension(&mut self, name: &CStr) -> bool {
        if self.pdevice.supports_extension(name) {
            self.enabled_extensions.insert(name.to_owned());
            true
        } else {
            tracing::warn!(extension = ?name, "Device extension unavailable");
            false
        }
    }

    pub fn enable_synchronization2(&mut self) -> bool {
        let (_, supported) = self.pdevice.supported_features();
        self.features13.synchronization2 = supported.synchronization2;
        supported.synchronization2 == vk::TRUE
    }

    pub fn enable_sampler_anisotropy(&mut self) -> bool {
        let (supported, _) = self.pdevice.supported_features();
        self.features.sampler_anisotropy = supported.sampler_anisotropy;
        supported.sampler_anisotropy == vk::TRUE
    }

    /// Enables one more queue from the given family.
    ///
    /// Returns `None` if every queue in the family is already enabled.
    pub fn enable_queue(&mut self, family_index: u32, priority: f32) -> Option<DeviceQueueRef> {
        let properties = self.queue_info.get(family_index as usize)?;
        let priorities = &mut self.queue_priorities[family_index as usize];
        if priorities.len() as u32 >= properties.queue_count {
            return None;
        }
        let index = priorities.len() as u32;
        priorities.push(priority);
        Some(DeviceQueueRef {
            pdevice: self.pdevice.clone(),
            family: family_index,
            index,
            flags: properties.queue_flags,
        })
    }

    /// Enables the least capable queue with the required queue capabilities.
    pub fn enable_queue_with_caps(
        &mut self,
        required_queue_capabilities: vk::QueueFlags,
        priority: f32,
    ) -> Option<DeviceQueueRef> {
        let (queue_family_index, _) = self
            .queue_info
            .iter()
            .zip(&self.queue_priorities)
            .enumerate()
            .filter(|(_, (properties, enabled))| {
                properties.queue_flags.contains(required_queue_capabilities)
                    && (enabled.len() as u32) < properties.queue_count
            })
            .min_by_key(|(_, (properties, _))| properties.queue_flags.as_raw().count_ones())?;
        self.enable_queue(queue_family_index as u32, priority)
    }

    /// Builds the logical device with the current configuration.
    pub fn build(self) -> VkResult<Device> {
        let extension_names = self
            .enabled_extensions
            .iter()
            .map(|k| k.as_ptr())
            .collect::<Vec<_>>();
        let queue_create_info = self
            .queue_priorities
            .iter()
            .enumerate()
            .filter(|(_, priorities)| !priorities.is_empty())
            .map(|(family, priorities)| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family as u32)
                    .queue_priorities(priorities)
            })
            .collect::<Vec<_>>();
        let mut features13 = self.features13;
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .features(self.features)
            .push_next(&mut features13);
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_info)
            .enabled_extension_names(&extension_names)
            .push_next(&mut features2);
        let device = unsafe {
            self.pdevice
                .instance()
                .create_device(self.pdevice.vk_handle(), &create_info, None)
        }?;
        tracing::info!(
            device = ?self.pdevice.properties().device_name(),
            extensions = ?self.enabled_extensions,
            "Created logical device"
        );
        let swapchain = self
            .enabled_extensions
            .contains(ash::khr::swapchain::NAME)
            .then(|| ash::khr::swapchain::Device::new(self.pdevice.instance(), &device));
        Ok(Device(Arc::new(DeviceInner {
            physical_device: self.pdevice,
            device,
            swapchain,
            enabled_extensions: self.enabled_extensions,
            features: self.features,
        })))
    }
}
