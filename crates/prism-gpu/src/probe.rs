//! Cached driver capability queries.
//!
//! The probe answers "is this layer/extension/queue feature available"
//! questions and remembers the answers. Every cache sits behind its own
//! `RwLock`: the first query for a key fills it under the write lock, later
//! queries only take the read lock.

use std::ffi::{CStr, CString};
use std::sync::Arc;

use ash::vk;
use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;

use crate::error::{GpuError, Result};

type NameSet = Arc<HashSet<CString>>;

/// Driver capability queries with per-key caching.
pub struct CapabilityProbe {
    entry: ash::Entry,
    instance: Option<ash::Instance>,
    surface_loader: Option<ash::khr::surface::Instance>,
    instance_layers: RwLock<Option<NameSet>>,
    instance_extensions: RwLock<Option<NameSet>>,
    device_extensions: RwLock<HashMap<vk::PhysicalDevice, NameSet>>,
    queue_families: RwLock<HashMap<vk::PhysicalDevice, Arc<Vec<vk::QueueFamilyProperties>>>>,
    present_support: RwLock<HashMap<(vk::PhysicalDevice, vk::SurfaceKHR, u32), bool>>,
}

impl CapabilityProbe {
    /// Create a probe that can answer instance-level questions.
    pub fn new(entry: &ash::Entry) -> Self {
        Self {
            entry: entry.clone(),
            instance: None,
            surface_loader: None,
            instance_layers: RwLock::new(None),
            instance_extensions: RwLock::new(None),
            device_extensions: RwLock::new(HashMap::new()),
            queue_families: RwLock::new(HashMap::new()),
            present_support: RwLock::new(HashMap::new()),
        }
    }

    /// Attach the created instance so device-level queries become available.
    ///
    /// # Safety
    /// The instance must stay valid for as long as the probe is queried.
    pub unsafe fn attach_instance(&mut self, instance: &ash::Instance, with_surface: bool) {
        self.surface_loader =
            with_surface.then(|| ash::khr::surface::Instance::new(&self.entry, instance));
        self.instance = Some(instance.clone());
    }

    /// Check whether an instance layer is installed.
    pub fn instance_layer_available(&self, name: &CStr) -> Result<bool> {
        let layers = cached_set(&self.instance_layers, || {
            let properties = unsafe { self.entry.enumerate_instance_layer_properties()? };
            Ok(properties
                .iter()
                .map(|p| unsafe { CStr::from_ptr(p.layer_name.as_ptr()) }.to_owned())
                .collect())
        })?;
        Ok(layers.contains(name))
    }

    /// Check whether an instance extension is available.
    pub fn instance_extension_available(&self, name: &CStr) -> Result<bool> {
        let extensions = cached_set(&self.instance_extensions, || {
            let properties = unsafe { self.entry.enumerate_instance_extension_properties(None)? };
            if properties.is_empty() {
                return Err(GpuError::UnsupportedEnvironment(
                    "driver reports no instance extensions".to_string(),
                ));
            }
            Ok(properties
                .iter()
                .map(|p| unsafe { CStr::from_ptr(p.extension_name.as_ptr()) }.to_owned())
                .collect())
        })?;
        Ok(extensions.contains(name))
    }

    /// Check whether a device extension is available on `gpu`.
    pub fn device_extension_available(&self, gpu: vk::PhysicalDevice, name: &CStr) -> Result<bool> {
        if let Some(set) = self.device_extensions.read().get(&gpu) {
            return Ok(set.contains(name));
        }

        let instance = self.instance()?;
        let properties = unsafe { instance.enumerate_device_extension_properties(gpu)? };
        let set: HashSet<CString> = properties
            .iter()
            .map(|p| unsafe { CStr::from_ptr(p.extension_name.as_ptr()) }.to_owned())
            .collect();

        let mut cache = self.device_extensions.write();
        let set = cache.entry(gpu).or_insert_with(|| Arc::new(set));
        Ok(set.contains(name))
    }

    /// Queue family properties of `gpu`.
    pub fn queue_families(&self, gpu: vk::PhysicalDevice) -> Result<Arc<Vec<vk::QueueFamilyProperties>>> {
        if let Some(families) = self.queue_families.read().get(&gpu) {
            return Ok(families.clone());
        }

        let instance = self.instance()?;
        let families = unsafe { instance.get_physical_device_queue_family_properties(gpu) };
        if families.is_empty() {
            return Err(GpuError::UnsupportedEnvironment(
                "physical device exposes no queue families".to_string(),
            ));
        }

        let mut cache = self.queue_families.write();
        Ok(cache.entry(gpu).or_insert_with(|| Arc::new(families)).clone())
    }

    /// Check whether `queue_family` of `gpu` can present to `surface`.
    pub fn surface_supported(
        &self,
        gpu: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        queue_family: u32,
    ) -> Result<bool> {
        let key = (gpu, surface, queue_family);
        if let Some(&supported) = self.present_support.read().get(&key) {
            return Ok(supported);
        }

        let loader = self.surface_loader.as_ref().ok_or_else(|| {
            GpuError::InvalidState("surface queries need a surface-enabled instance".to_string())
        })?;
        let supported = unsafe {
            loader.get_physical_device_surface_support(gpu, queue_family, surface)?
        };

        self.present_support.write().insert(key, supported);
        Ok(supported)
    }

    fn instance(&self) -> Result<&ash::Instance> {
        self.instance
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("probe has no instance attached".to_string()))
    }
}

/// Fill a lazily computed name set, running `query` at most once per winner.
fn cached_set(
    cache: &RwLock<Option<NameSet>>,
    query: impl FnOnce() -> Result<HashSet<CString>>,
) -> Result<NameSet> {
    if let Some(set) = cache.read().as_ref() {
        return Ok(set.clone());
    }

    let set = Arc::new(query()?);
    let mut slot = cache.write();
    Ok(slot.get_or_insert(set).clone())
}
