//! Instance creation and management.
//!
//! This module provides the [`Instance`] type and [`InstanceBuilder`] for creating
//! and configuring Vulkan instances.
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use tephra::{Instance, utils::Version};
//! let entry = Arc::new(unsafe { ash::Entry::load().unwrap() });
//! let mut builder = Instance::builder(entry).unwrap();
//! builder.info.api_version = Version::V1_3;
//! builder.enable_layer(c"VK_LAYER_KHRONOS_validation");
//! let instance = builder.build().unwrap();
//! ```

use crate::{debug::DebugMessenger, utils::Version};
use ash::{prelude::VkResult, vk};
use std::{
    borrow::Cow,
    collections::{BTreeMap, BTreeSet},
    ffi::{CStr, CString},
    ops::Deref,
    sync::Arc,
};

/// A Vulkan instance wrapper.
///
/// The instance is reference-counted using [`Arc`] for cheap shared access and
/// destroyed when the last reference is dropped.
#[derive(Clone)]
pub struct Instance(Arc<InstanceInner>);
impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Instance {}

struct InstanceInner {
    entry: Arc<ash::Entry>,
    instance: ash::Instance,
    surface: ash::khr::surface::Instance,
    messenger: Option<DebugMessenger>,
    enabled_extensions: BTreeSet<CString>,
    api_version: Version,
}

/// Configuration for instance creation.
pub struct InstanceCreateInfo {
    pub flags: vk::InstanceCreateFlags,
    /// The application name (shown in debugging tools).
    pub application_name: Cow<'static, CStr>,
    pub application_version: Version,
    pub engine_name: Cow<'static, CStr>,
    pub engine_version: Version,
    /// The Vulkan API version to use.
    pub api_version: Version,
}

impl Default for InstanceCreateInfo {
    fn default() -> Self {
        Self {
            flags: vk::InstanceCreateFlags::empty(),
            application_name: Cow::Borrowed(c"Unnamed Application"),
            application_version: Default::default(),
            engine_name: Cow::Borrowed(c"tephra"),
            engine_version: Version::new(0, 0, 1, 0),
            api_version: Version::V1_3,
        }
    }
}

impl Instance {
    /// Creates a new instance builder.
    pub fn builder(entry: Arc<ash::Entry>) -> VkResult<InstanceBuilder> {
        InstanceBuilder::new(entry)
    }

    /// Returns the Vulkan entry point.
    pub fn entry(&self) -> &Arc<ash::Entry> {
        &self.0.entry
    }

    /// Function table for `VK_KHR_surface`.
    ///
    /// Only callable when the extension was enabled on this instance.
    pub fn surface_loader(&self) -> &ash::khr::surface::Instance {
        &self.0.surface
    }

    pub fn is_extension_enabled(&self, name: &CStr) -> bool {
        self.0.enabled_extensions.contains(name)
    }

    /// Returns true if a debug messenger forwards validation messages to `tracing`.
    pub fn has_debug_messenger(&self) -> bool {
        self.0.messenger.is_some()
    }

    /// Returns the version of the Vulkan API used when creating the instance.
    pub fn api_version(&self) -> Version {
        self.0.api_version
    }
}

impl Deref for Instance {
    type Target = ash::Instance;

    fn deref(&self) -> &Self::Target {
        &self.0.instance
    }
}

impl Drop for InstanceInner {
    fn drop(&mut self) {
        tracing::info!(instance = ?self.instance.handle(), "drop instance");
        // The messenger must go before the instance it was created from.
        self.messenger.take();
        unsafe {
            self.instance.destroy_instance(None);
        }
    }
}

/// Properties of a Vulkan layer.
#[derive(Clone, Debug)]
pub struct LayerProperties {
    pub spec_version: Version,
    pub implementation_version: Version,
    pub description: String,
}

/// A builder for creating Vulkan instances.
pub struct InstanceBuilder {
    entry: Arc<ash::Entry>,
    available_extensions: BTreeMap<CString, Version>,
    enabled_extensions: BTreeSet<CString>,

    available_layers: BTreeMap<CString, LayerProperties>,
    enabled_layers: Vec<CString>,

    debug_messenger: bool,

    /// Instance creation configuration. Modify this to set application metadata.
    pub info: InstanceCreateInfo,
}

impl InstanceBuilder {
    /// Creates a new instance builder with the given entry point.
    ///
    /// Enumerates available extensions and layers from the Vulkan loader.
    pub fn new(entry: Arc<ash::Entry>) -> VkResult<Self> {
        let available_extensions = unsafe { entry.enumerate_instance_extension_properties(None) }?
            .into_iter()
            .filter_map(|ext| {
                let name = ext.extension_name_as_c_str().ok()?;
                Some((name.to_owned(), Version(ext.spec_version)))
            })
            .collect::<BTreeMap<CString, Version>>();
        let available_layers = unsafe { entry.enumerate_instance_layer_properties() }?
            .into_iter()
            .filter_map(|layer| {
                let name = layer.layer_name_as_c_str().ok()?;
                let description = layer
                    .description_as_c_str()
                    .map(|d| d.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Some((
                    name.to_owned(),
                    LayerProperties {
                        implementation_version: Version(layer.implementation_version),
                        spec_version: Version(layer.spec_version),
                        description,
                    },
                ))
            })
            .collect::<BTreeMap<CString, LayerProperties>>();
        #[allow(unused_mut)]
        let mut this = Self {
            entry,
            available_extensions,
            enabled_extensions: BTreeSet::new(),
            available_layers,
            enabled_layers: Vec::new(),
            debug_messenger: false,
            info: InstanceCreateInfo::default(),
        };
        #[cfg(target_vendor = "apple")]
        {
            // Allow the enumeration of non-conformant implementations
            if this.enable_extension(ash::khr::portability_enumeration::NAME) {
                this.info.flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
            }
        }

        Ok(this)
    }

    /// Enables an instance extension by name.
    ///
    /// Returns false if the loader does not expose the extension.
    pub fn enable_extension(&mut self, name: &CStr) -> bool {
        if self.available_extensions.contains_key(name) {
            self.enabled_extensions.insert(name.to_owned());
            true
        } else {
            tracing::warn!(extension = ?name, "Instance extension unavailable");
            false
        }
    }

    /// Enables a Vulkan layer.
    ///
    /// When a layer is enabled, any additional extensions it provides become
    /// available for enabling.
    pub fn enable_layer(&mut self, layer: &CStr) -> Option<LayerProperties> {
        let properties = self.available_layers.get(layer)?.clone();
        self.enabled_layers.push(layer.to_owned());

        if let Ok(extra) = unsafe {
            self.entry
                .enumerate_instance_extension_properties(Some(layer))
        } {
            self.available_extensions
                .extend(extra.into_iter().filter_map(|a| {
                    Some((
                        a.extension_name_as_c_str().ok()?.to_owned(),
                        Version(a.spec_version),
                    ))
                }));
        }
        Some(properties)
    }

    /// Enables `VK_EXT_debug_utils` and routes its messages into `tracing`.
    pub fn enable_debug_messenger(&mut self) -> bool {
        self.debug_messenger = self.enable_extension(ash::ext::debug_utils::NAME);
        self.debug_messenger
    }

    /// Builds the Vulkan instance with the current configuration.
    pub fn build(self) -> VkResult<Instance> {
        let application_info = vk::ApplicationInfo {
            p_application_name: self.info.application_name.as_ptr(),
            application_version: self.info.application_version.0,
            p_engine_name: self.info.engine_name.as_ptr(),
            engine_version: self.info.engine_version.0,
            api_version: self.info.api_version.0,
            ..Default::default()
        };

        let enabled_extension_names = self
            .enabled_extensions
            .iter()
            .map(|name| name.as_ptr())
            .collect::<Vec<_>>();
        let enabled_layer_names = self
            .enabled_layers
            .iter()
            .map(|name| name.as_ptr())
            .collect::<Vec<_>>();
        let create_info = vk::InstanceCreateInfo {
            p_application_info: &application_info,
            flags: self.info.flags,
            ..Default::default()
        }
        .enabled_layer_names(&enabled_layer_names)
        .enabled_extension_names(&enabled_extension_names);
        // Safety: No Host synchronization rules for vkCreateInstance.
        let instance = unsafe { self.entry.create_instance(&create_info, None)? };
        tracing::info!(
            api_version = %self.info.api_version,
            layers = ?self.enabled_layers,
            extensions = ?self.enabled_extensions,
            "Created Vulkan instance"
        );
        let messenger = if self.debug_messenger {
            match DebugMessenger::new(&self.entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(err) => {
                    tracing::warn!(?err, "Failed to create debug messenger");
                    None
                }
            }
        } else {
            None
        };
        let surface = ash::khr::surface::Instance::new(&self.entry, &instance);
        Ok(Instance(Arc::new(InstanceInner {
            entry: self.entry,
            instance,
            surface,
            messenger,
            enabled_extensions: self.enabled_extensions,
            api_version: self.info.api_version,
        })))
    }
}
