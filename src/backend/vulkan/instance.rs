//! The loaded Vulkan library.

use std::ffi::{CStr, CString};
use std::ops::Deref;

use anyhow::Result;
use ash::vk;

use crate::backend::vulkan::app_info::AppSettings;
use crate::backend::vulkan::util::unwrap_to_raw_strings;

const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

/// Loaded Vulkan entry points and instance. The instance always targets Vulkan 1.3.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Instance {
    #[derivative(Debug = "ignore")]
    entry: ash::Entry,
    #[derivative(Debug = "ignore")]
    instance: ash::Instance,
    validation: bool,
}

impl Instance {
    /// Load Vulkan and create an instance.
    /// # Errors
    /// * Fails if no Vulkan loader is installed.
    /// * Fails if one of the requested instance extensions is not available.
    pub fn new(settings: &AppSettings) -> Result<Self> {
        // SAFETY: loading the library has no preconditions besides it being a valid Vulkan loader.
        let entry = unsafe { ash::Entry::load()? };
        let validation = settings.enable_validation && has_layer(&entry, VALIDATION_LAYER)?;
        if settings.enable_validation && !validation {
            warn!("{VALIDATION_LAYER} is not installed, continuing without validation");
        }

        let app_name = CString::new(settings.name.as_str())?;
        let engine_name = CString::new(env!("CARGO_PKG_NAME"))?;
        let (major, minor, patch) = settings.version;
        let app_info = vk::ApplicationInfo::builder()
            .api_version(vk::API_VERSION_1_3)
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, major, minor, patch))
            .engine_name(&engine_name)
            .engine_version(crate_version());

        let layers = if validation {
            vec![CString::new(VALIDATION_LAYER)?]
        } else {
            vec![]
        };
        let mut extensions = settings
            .instance_extensions
            .iter()
            .map(|name| CString::new(name.as_str()))
            .collect::<Result<Vec<_>, _>>()?;
        if validation {
            extensions.push(CString::from(ash::extensions::ext::DebugUtils::name()));
        }
        debug!("Instance extensions: {extensions:?}");

        let layers_raw = unwrap_to_raw_strings(&layers);
        let extensions_raw = unwrap_to_raw_strings(&extensions);
        let info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_layer_names(&layers_raw)
            .enabled_extension_names(&extensions_raw);
        let instance = unsafe { entry.create_instance(&info, None)? };
        #[cfg(feature = "log-objects")]
        trace!("Created new VkInstance {:p}", instance.handle());

        Ok(Instance {
            entry,
            instance,
            validation,
        })
    }

    /// Whether the validation layer and debug utils are loaded.
    pub fn is_validation_enabled(&self) -> bool {
        self.validation
    }

    /// # Safety
    /// Calls that modify global Vulkan state may invalidate objects created through deimos.
    pub unsafe fn loader(&self) -> &ash::Entry {
        &self.entry
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        #[cfg(feature = "log-objects")]
        trace!("Destroying VkInstance {:p}", self.instance.handle());
        unsafe {
            self.instance.destroy_instance(None);
        }
    }
}

impl Deref for Instance {
    type Target = ash::Instance;

    fn deref(&self) -> &Self::Target {
        &self.instance
    }
}

fn has_layer(entry: &ash::Entry, name: &str) -> Result<bool> {
    Ok(entry
        .enumerate_instance_layer_properties()?
        .iter()
        // SAFETY: the driver returns null terminated layer names.
        .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }.to_str() == Ok(name)))
}

fn crate_version() -> u32 {
    let part = |s: &str| s.parse::<u32>().unwrap_or(0);
    vk::make_api_version(
        0,
        part(env!("CARGO_PKG_VERSION_MAJOR")),
        part(env!("CARGO_PKG_VERSION_MINOR")),
        part(env!("CARGO_PKG_VERSION_PATCH")),
    )
}
