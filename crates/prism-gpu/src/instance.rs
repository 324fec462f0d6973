//! Vulkan instance creation.

use crate::debug::{RENDERDOC_LAYER, VALIDATION_LAYER};
use crate::error::{GpuError, Result};
use crate::probe::CapabilityProbe;
use ash::vk;
use prism_core::Version;
use std::ffi::{c_char, CStr, CString};

/// Application and engine identity reported to the driver.
#[derive(Debug, Clone)]
pub struct ApplicationInfo {
    pub app_name: String,
    pub app_version: Version,
    pub engine_name: String,
    pub engine_version: Version,
}

impl Default for ApplicationInfo {
    fn default() -> Self {
        Self {
            app_name: "Prism".to_string(),
            app_version: Version::new(0, 1, 0),
            engine_name: "Prism".to_string(),
            engine_version: Version::new(0, 1, 0),
        }
    }
}

/// Layers and debug extensions requested for the instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstanceLayers {
    pub validation: bool,
    pub renderdoc: bool,
    pub debug_markers: bool,
}

/// What ended up enabled on the created instance.
#[derive(Debug, Clone, Copy)]
pub struct InstanceFeatures {
    pub validation: bool,
    pub debug_utils: bool,
}

fn version_to_vk(version: Version) -> u32 {
    vk::make_api_version(0, version.major, version.minor, version.patch)
}

fn c_string(value: &str) -> Result<CString> {
    CString::new(value).map_err(|e| GpuError::InvalidState(format!("invalid name {value:?}: {e}")))
}

/// Create a Vulkan instance.
///
/// `window_extensions` are the surface extensions the window system needs;
/// each one must be available. Optional layers that are missing only
/// produce a warning.
///
/// # Safety
/// The entry must be a valid Vulkan entry point and the probe must be built
/// from it.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    probe: &CapabilityProbe,
    info: &ApplicationInfo,
    window_extensions: &[*const c_char],
    layers: InstanceLayers,
) -> Result<(ash::Instance, InstanceFeatures)> {
    let app_name = c_string(&info.app_name)?;
    let engine_name = c_string(&info.engine_name)?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(version_to_vk(info.app_version))
        .engine_name(&engine_name)
        .engine_version(version_to_vk(info.engine_version))
        .api_version(vk::API_VERSION_1_1);

    let mut extension_names: Vec<*const c_char> = Vec::with_capacity(window_extensions.len() + 2);
    for &extension in window_extensions {
        let name = CStr::from_ptr(extension);
        if !probe.instance_extension_available(name)? {
            return Err(GpuError::UnsupportedEnvironment(format!(
                "instance extension {} is not available",
                name.to_string_lossy()
            )));
        }
        extension_names.push(extension);
    }

    let mut layer_names: Vec<*const c_char> = Vec::new();
    let mut validation = false;
    if layers.validation {
        if probe.instance_layer_available(VALIDATION_LAYER)? {
            layer_names.push(VALIDATION_LAYER.as_ptr());
            validation = true;
        } else {
            tracing::warn!(
                "Validation layer {} not available",
                VALIDATION_LAYER.to_string_lossy()
            );
        }
    }
    if layers.renderdoc {
        if probe.instance_layer_available(RENDERDOC_LAYER)? {
            layer_names.push(RENDERDOC_LAYER.as_ptr());
        } else {
            tracing::warn!(
                "RenderDoc layer {} not available",
                RENDERDOC_LAYER.to_string_lossy()
            );
        }
    }

    let wants_debug_utils = validation || layers.debug_markers;
    let debug_utils =
        wants_debug_utils && probe.instance_extension_available(ash::ext::debug_utils::NAME)?;
    if debug_utils {
        extension_names.push(ash::ext::debug_utils::NAME.as_ptr());
    } else if wants_debug_utils {
        tracing::warn!("VK_EXT_debug_utils not available, debug output disabled");
    }

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = {
        extension_names.push(ash::khr::portability_enumeration::NAME.as_ptr());
        vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR
    };
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = entry.create_instance(&create_info, None)?;

    tracing::debug!(
        "Created Vulkan instance for {} {} ({} extensions, {} layers)",
        info.app_name,
        info.app_version,
        extension_names.len(),
        layer_names.len()
    );

    Ok((
        instance,
        InstanceFeatures {
            validation,
            debug_utils,
        },
    ))
}
