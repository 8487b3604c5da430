//! Physical device enumeration and properties.
//!
//! This module provides the [`PhysicalDevice`] type for querying GPU capabilities
//! and selecting a device for logical device creation.
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use tephra::{Instance, ash::vk};
//! # let entry = Arc::new(unsafe { ash::Entry::load() }.unwrap());
//! # let instance = Instance::builder(entry).unwrap().build().unwrap();
//! let physical_devices: Vec<_> = instance.enumerate_physical_devices().unwrap().collect();
//! let gpu = physical_devices.iter().find(|d| {
//!     d.properties().device_type == vk::PhysicalDeviceType::DISCRETE_GPU
//! }).unwrap_or(&physical_devices[0]);
//! println!("Using: {:?}", gpu.properties().device_name());
//! ```
use crate::utils::{AsVkHandle, Version};

use super::Instance;
use ash::{prelude::VkResult, vk};
use std::{ffi::CStr, ops::Deref, sync::Arc};

/// A handle to a physical GPU device.
///
/// This type is reference-counted and cheap to clone.
#[derive(Clone)]
pub struct PhysicalDevice(Arc<PhysicalDeviceInner>);
impl PartialEq for PhysicalDevice {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for PhysicalDevice {}

struct PhysicalDeviceInner {
    instance: Instance,
    physical_device: vk::PhysicalDevice,
    properties: PhysicalDeviceProperties,
}

impl Instance {
    /// Enumerates all physical devices (GPUs) available on the system.
    pub fn enumerate_physical_devices<'a>(
        &'a self,
    ) -> VkResult<impl ExactSizeIterator<Item = PhysicalDevice> + 'a> {
        let pdevices = unsafe { self.deref().enumerate_physical_devices()? };
        Ok(pdevices.into_iter().map(|pdevice| {
            let properties = PhysicalDeviceProperties::new(self, pdevice);
            PhysicalDevice(Arc::new(PhysicalDeviceInner {
                instance: self.clone(),
                physical_device: pdevice,
                properties,
            }))
        }))
    }
}
impl AsVkHandle for PhysicalDevice {
    type Handle = vk::PhysicalDevice;

    fn vk_handle(&self) -> Self::Handle {
        self.0.physical_device
    }
}
impl std::fmt::Debug for PhysicalDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDevice")
            .field("name", &self.properties().device_name())
            .field("type", &self.properties().device_type)
            .finish_non_exhaustive()
    }
}
impl PhysicalDevice {
    /// Returns the instance this physical device was enumerated from.
    pub fn instance(&self) -> &Instance {
        &self.0.instance
    }

    /// Queries format properties for a specific format.
    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance()
                .get_physical_device_format_properties(self.0.physical_device, format)
        }
    }

    /// Returns the first candidate whose tiling supports all of `features`.
    pub fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> Option<vk::Format> {
        select_format(candidates, tiling, features, |format| {
            self.format_properties(format)
        })
    }

    pub fn queue_family_properties(&self) -> Vec<vk::QueueFamilyProperties> {
        unsafe {
            self.0
                .instance
                .get_physical_device_queue_family_properties(self.0.physical_device)
        }
    }

    /// Returns the features this device supports, including the Vulkan 1.3 block.
    pub fn supported_features(
        &self,
    ) -> (vk::PhysicalDeviceFeatures, vk::PhysicalDeviceVulkan13Features<'static>) {
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut features13);
        unsafe {
            self.instance()
                .get_physical_device_features2(self.0.physical_device, &mut features2);
        }
        let features = features2.features;
        features13.p_next = std::ptr::null_mut();
        (features, features13)
    }

    pub fn supports_extension(&self, name: &CStr) -> bool {
        let Ok(extensions) = (unsafe {
            self.instance()
                .enumerate_device_extension_properties(self.0.physical_device)
        }) else {
            return false;
        };
        extensions
            .iter()
            .any(|ext| ext.extension_name_as_c_str().is_ok_and(|n| n == name))
    }

    /// Returns the physical device properties.
    pub fn properties(&self) -> &PhysicalDeviceProperties {
        &self.0.properties
    }

    pub fn supports_surface(&self, queue_family_index: u32, surface: vk::SurfaceKHR) -> bool {
        unsafe {
            self.instance()
                .surface_loader()
                .get_physical_device_surface_support(
                    self.0.physical_device,
                    queue_family_index,
                    surface,
                )
                .unwrap_or(false)
        }
    }
    pub fn surface_capabilities(
        &self,
        surface: vk::SurfaceKHR,
    ) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.instance()
                .surface_loader()
                .get_physical_device_surface_capabilities(self.0.physical_device, surface)
        }
    }
    pub fn surface_formats(&self, surface: vk::SurfaceKHR) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.instance()
                .surface_loader()
                .get_physical_device_surface_formats(self.0.physical_device, surface)
        }
    }
    pub fn surface_present_modes(
        &self,
        surface: vk::SurfaceKHR,
    ) -> VkResult<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.instance()
                .surface_loader()
                .get_physical_device_surface_present_modes(self.0.physical_device, surface)
        }
    }
}

fn select_format(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
    properties: impl Fn(vk::Format) -> vk::FormatProperties,
) -> Option<vk::Format> {
    candidates.iter().copied().find(|&format| {
        let props = properties(format);
        match tiling {
            vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
            vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
            _ => false,
        }
    })
}

/// Properties and capabilities of a physical device.
pub struct PhysicalDeviceProperties {
    inner: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}
impl PhysicalDeviceProperties {
    fn new(instance: &Instance, pdevice: vk::PhysicalDevice) -> Self {
        unsafe {
            Self {
                inner: instance.get_physical_device_properties(pdevice),
                memory_properties: instance.get_physical_device_memory_properties(pdevice),
            }
        }
    }
    pub fn device_name(&self) -> &CStr {
        self.inner.device_name_as_c_str().unwrap_or(c"unknown")
    }

    pub fn api_version(&self) -> Version {
        Version(self.inner.api_version)
    }

    pub fn driver_version(&self) -> Version {
        Version(self.inner.driver_version)
    }

    pub fn memory_types(&self) -> &[vk::MemoryType] {
        &self.memory_properties.memory_types[..self.memory_properties.memory_type_count as usize]
    }

    pub fn memory_heaps(&self) -> &[vk::MemoryHeap] {
        &self.memory_properties.memory_heaps[..self.memory_properties.memory_heap_count as usize]
    }
}
impl Deref for PhysicalDeviceProperties {
    type Target = vk::PhysicalDeviceProperties;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_properties(format: vk::Format) -> vk::FormatProperties {
        match format {
            vk::Format::D32_SFLOAT => vk::FormatProperties::default(),
            vk::Format::D32_SFLOAT_S8_UINT => vk::FormatProperties {
                optimal_tiling_features: vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
                ..Default::default()
            },
            _ => vk::FormatProperties {
                linear_tiling_features: vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
                optimal_tiling_features: vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
                ..Default::default()
            },
        }
    }

    #[test]
    fn picks_first_format_with_features() {
        let candidates = [
            vk::Format::D32_SFLOAT,
            vk::Format::D32_SFLOAT_S8_UINT,
            vk::Format::D24_UNORM_S8_UINT,
        ];
        let optimal = select_format(
            &candidates,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            fake_properties,
        );
        assert_eq!(optimal, Some(vk::Format::D32_SFLOAT_S8_UINT));
        let linear = select_format(
            &candidates,
            vk::ImageTiling::LINEAR,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            fake_properties,
        );
        assert_eq!(linear, Some(vk::Format::D24_UNORM_S8_UINT));
    }

    #[test]
    fn no_format_when_nothing_matches() {
        let found = select_format(
            &[vk::Format::D32_SFLOAT],
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            fake_properties,
        );
        assert_eq!(found, None);
    }
}
