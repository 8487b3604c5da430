//! Window surfaces.
//!
//! A [`Surface`] is created from any window that exposes `raw-window-handle` display and
//! window handles. The instance must have been created with the extensions reported by
//! [`required_extensions`].

use std::ffi::CStr;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::{Instance, error::Result, utils::AsVkHandle};

/// Instance extensions needed to present to windows on this display.
pub fn required_extensions(window: &impl HasDisplayHandle) -> Result<Vec<&'static CStr>> {
    let display = window.display_handle()?;
    let names = ash_window::enumerate_required_extensions(display.as_raw())?;
    // Safety: ash-window returns pointers to static, NUL-terminated extension names.
    Ok(names
        .iter()
        .map(|&name| unsafe { CStr::from_ptr(name) })
        .collect())
}

pub struct Surface {
    instance: Instance,
    handle: vk::SurfaceKHR,
}

impl Surface {
    pub fn new(instance: Instance, window: &(impl HasDisplayHandle + HasWindowHandle)) -> Result<Self> {
        let display = window.display_handle()?;
        let window = window.window_handle()?;
        let handle = unsafe {
            ash_window::create_surface(
                instance.entry(),
                &instance,
                display.as_raw(),
                window.as_raw(),
                None,
            )?
        };
        tracing::debug!(surface = ?handle, "created window surface");
        Ok(Self { instance, handle })
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }
}

impl AsVkHandle for Surface {
    type Handle = vk::SurfaceKHR;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        tracing::debug!(surface = ?self.handle, "drop surface");
        unsafe {
            self.instance.surface_loader().destroy_surface(self.handle, None);
        }
    }
}
