//! GPU context management.

use crate::capabilities::GpuCapabilities;
use crate::debug::{DebugMessenger, DebugNames};
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, ApplicationInfo, InstanceLayers};
use crate::memory::GpuAllocator;
use crate::probe::CapabilityProbe;
use crate::queues::QueuePlan;
use crate::selection::{select_device, DeviceInfo};
use crate::surface::{required_surface_extensions, SurfaceContext};
use ash::vk;
use parking_lot::Mutex;
use prism_core::RuntimeOptions;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::c_char;
use std::sync::Arc;

/// Main GPU context holding Vulkan resources.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    messenger: Option<DebugMessenger>,
    surface: Option<SurfaceContext>,
    probe: CapabilityProbe,
    physical_device: vk::PhysicalDevice,
    capabilities: GpuCapabilities,
    device: Arc<ash::Device>,
    swapchain_loader: Option<ash::khr::swapchain::Device>,
    debug_names: Option<Arc<DebugNames>>,
    allocator: Mutex<GpuAllocator>,
    anisotropy: Option<f32>,

    queue_plan: QueuePlan,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    transfer_queue: vk::Queue,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Shared handle to the device.
    pub fn device_arc(&self) -> Arc<ash::Device> {
        self.device.clone()
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Cached driver queries.
    pub fn probe(&self) -> &CapabilityProbe {
        &self.probe
    }

    /// Queue family assignment.
    pub fn queue_plan(&self) -> &QueuePlan {
        &self.queue_plan
    }

    /// Get the graphics queue.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Get the present queue.
    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    /// Get the transfer queue. Same as the graphics queue when aliased.
    pub fn transfer_queue(&self) -> vk::Queue {
        self.transfer_queue
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Window surface, absent for headless contexts.
    pub fn surface(&self) -> Result<&SurfaceContext> {
        self.surface
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("context has no surface".to_string()))
    }

    /// Swapchain extension loader, absent for headless contexts.
    pub fn swapchain_loader(&self) -> Result<&ash::khr::swapchain::Device> {
        self.swapchain_loader
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("context has no swapchain support".to_string()))
    }

    /// Anisotropy level for samplers, if the device supports it.
    pub fn sampler_anisotropy(&self) -> Option<f32> {
        self.anisotropy
    }

    /// Attach a debug name to an object when debug markers are enabled.
    pub fn name_object<H: vk::Handle>(&self, object: H, name: &str) {
        if let Some(names) = &self.debug_names {
            unsafe { names.set_name(object, name) };
        }
    }

    /// Format properties of the selected device.
    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        }
    }

    /// Wait for device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Shutdown allocator BEFORE destroying device
            // This frees all VkDeviceMemory allocations
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            if let Some(surface) = self.surface.as_mut() {
                surface.destroy();
            }
            if let Some(messenger) = self.messenger.as_mut() {
                messenger.destroy();
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Instance-level objects that must be torn down if device setup fails.
struct InstanceGuard {
    instance: Option<ash::Instance>,
    messenger: Option<DebugMessenger>,
    surface: Option<SurfaceContext>,
}

impl InstanceGuard {
    fn instance(&self) -> Result<&ash::Instance> {
        self.instance
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("instance already released".to_string()))
    }

    fn release(mut self) -> Result<(ash::Instance, Option<DebugMessenger>, Option<SurfaceContext>)> {
        let instance = self
            .instance
            .take()
            .ok_or_else(|| GpuError::InvalidState("instance already released".to_string()))?;
        Ok((instance, self.messenger.take(), self.surface.take()))
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        unsafe {
            if let Some(surface) = self.surface.as_mut() {
                surface.destroy();
            }
            if let Some(messenger) = self.messenger.as_mut() {
                messenger.destroy();
            }
            if let Some(instance) = self.instance.take() {
                instance.destroy_instance(None);
            }
        }
    }
}

/// Builder for creating a GPU context.
#[derive(Default)]
pub struct GpuContextBuilder {
    app_info: ApplicationInfo,
    options: RuntimeOptions,
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set application and engine identity.
    pub fn app_info(mut self, info: ApplicationInfo) -> Self {
        self.app_info = info;
        self
    }

    /// Set runtime switches (GPU preference, layers, queue sharing).
    pub fn options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    /// Build a context that presents to a window.
    pub fn build_for_window(
        self,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<GpuContext> {
        self.build(Some((display, window)))
    }

    /// Build a context without a surface, for offscreen work and tests.
    pub fn build_headless(self) -> Result<GpuContext> {
        self.build(None)
    }

    fn build(self, window: Option<(RawDisplayHandle, RawWindowHandle)>) -> Result<GpuContext> {
        let options = self.options;

        // Load Vulkan entry point
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            GpuError::UnsupportedEnvironment(format!("Failed to load Vulkan: {e}"))
        })?;
        let mut probe = CapabilityProbe::new(&entry);

        let window_extensions: &[*const c_char] = match window {
            Some((display, _)) => required_surface_extensions(display)?,
            None => &[],
        };

        let layers = InstanceLayers {
            validation: !options.disable_validation,
            renderdoc: options.enable_renderdoc,
            debug_markers: !options.disable_debug_markers,
        };
        let (instance, features) = unsafe {
            create_instance(&entry, &probe, &self.app_info, window_extensions, layers)?
        };
        let mut guard = InstanceGuard {
            instance: Some(instance),
            messenger: None,
            surface: None,
        };

        if features.validation && features.debug_utils {
            guard.messenger = Some(unsafe { DebugMessenger::new(&entry, guard.instance()?)? });
        }

        if let Some((display, window)) = window {
            guard.surface =
                Some(unsafe { SurfaceContext::new(&entry, guard.instance()?, display, window)? });
        }
        let surface_handle = guard.surface.as_ref().map(|s| s.surface);

        unsafe { probe.attach_instance(guard.instance()?, surface_handle.is_some()) };

        // Select physical device
        let instance = guard.instance()?;
        let physical_devices = unsafe { instance.enumerate_physical_devices()? };
        let infos = physical_devices
            .iter()
            .enumerate()
            .map(|(index, &gpu)| {
                DeviceInfo::gather(&probe, instance, gpu, index as u32, surface_handle)
            })
            .collect::<Result<Vec<_>>>()?;
        let selected = select_device(&infos, options.preferred_gpu_index)?;
        let physical_device = physical_devices[selected];

        let capabilities = unsafe { GpuCapabilities::query(instance, physical_device) };
        if options.hide_gpu_stats {
            tracing::debug!("Selected GPU: {}", capabilities.summary());
        } else {
            capabilities.log_report();
        }

        let queue_plan = QueuePlan::from_families(
            &infos[selected].queue_families,
            options.force_no_separate_transfer_queue,
        )?;
        tracing::info!(
            "Queue families: graphics {}, present {}, transfer {}{}",
            queue_plan.graphics,
            queue_plan.present,
            queue_plan.transfer,
            if queue_plan.has_separate_transfer() {
                ""
            } else {
                " (shared with graphics)"
            }
        );

        let anisotropy = capabilities
            .supports_sampler_anisotropy
            .then_some(capabilities.max_sampler_anisotropy.min(16.0));

        let device = unsafe {
            create_device(
                instance,
                physical_device,
                &queue_plan,
                surface_handle.is_some(),
                anisotropy.is_some(),
            )?
        };
        let device = Arc::new(device);

        let queue = |family: u32| unsafe { device.get_device_queue(family, 0) };
        let graphics_queue = queue(queue_plan.graphics);
        let present_queue = queue(queue_plan.present);
        let transfer_queue = queue(queue_plan.transfer);

        let debug_names = (features.debug_utils && !options.disable_debug_markers)
            .then(|| Arc::new(unsafe { DebugNames::new(instance, &device) }));

        let swapchain_loader = surface_handle
            .is_some()
            .then(|| ash::khr::swapchain::Device::new(instance, &device));

        let allocator = unsafe {
            GpuAllocator::new(
                instance,
                device.clone(),
                physical_device,
                queue_plan.resource_sharing(),
                debug_names.clone(),
            )
        };
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        let (instance, messenger, surface) = guard.release()?;

        Ok(GpuContext {
            entry,
            instance,
            messenger,
            surface,
            probe,
            physical_device,
            capabilities,
            device,
            swapchain_loader,
            debug_names,
            allocator: Mutex::new(allocator),
            anisotropy,
            queue_plan,
            graphics_queue,
            present_queue,
            transfer_queue,
        })
    }
}

/// Create the logical device with one queue per distinct family.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_plan: &QueuePlan,
    swapchain: bool,
    sampler_anisotropy: bool,
) -> Result<ash::Device> {
    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = queue_plan
        .unique_families()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let mut extension_names: Vec<*const c_char> = Vec::new();
    if swapchain {
        extension_names.push(ash::khr::swapchain::NAME.as_ptr());
    }
    #[cfg(target_os = "macos")]
    extension_names.push(ash::khr::portability_subset::NAME.as_ptr());

    let features = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(sampler_anisotropy);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .enabled_features(&features);

    let device = instance.create_device(physical_device, &device_create_info, None)?;

    Ok(device)
}
