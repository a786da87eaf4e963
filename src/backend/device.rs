// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Physical device selection (prefer discrete GPU, or a configured index)
// - Logical device + single queue creation
// - Memory allocator setup

use anyhow::{Context, Result};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use raw_window_handle::RawDisplayHandle;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Vulkan device wrapper with automatic cleanup
///
/// This is the one context every other component is handed explicitly.
pub struct VulkanDevice {
    // Vulkan handles (order matters for drop!)
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    pub entry: Entry,

    // Queue handles
    pub queue: vk::Queue,
    pub queue_family: u32,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanDevice {
    /// Create Vulkan device
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers (debug only)
    /// * `display_handle` - Display the surface will be created on, decides the surface extensions
    /// * `device_index` - Use this physical device instead of the best scored one
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        display_handle: RawDisplayHandle,
        device_index: Option<usize>,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Validation is best effort, the layer ships with the SDK only
        let enable_validation = enable_validation && Self::validation_layer_available(&entry);

        // Step 2: Create instance
        let instance = Self::create_instance(&entry, app_name, enable_validation, display_handle)?;

        // Every later failure releases what already exists, newest first
        let destroy_instance = |e: anyhow::Error| {
            unsafe { instance.destroy_instance(None) };
            e
        };

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance).map_err(destroy_instance)?)
        } else {
            None
        };

        let destroy_messenger = |e: anyhow::Error| {
            if let Some((debug_utils, messenger)) = &debug_utils {
                unsafe { debug_utils.destroy_debug_utils_messenger(*messenger, None) };
            }
            destroy_instance(e)
        };

        // Step 4: Pick physical device (GPU)
        let (physical_device, queue_family) =
            Self::pick_physical_device(&instance, device_index).map_err(destroy_messenger)?;

        // Step 5: Create logical device
        let (device, queue) = Self::create_logical_device(&instance, physical_device, queue_family)
            .map_err(destroy_messenger)?;

        let destroy_device = |e: anyhow::Error| {
            unsafe { device.destroy_device(None) };
            destroy_messenger(e)
        };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        log::info!(
            "Selected GPU: {} ({:?})",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy(),
            properties.device_type
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        // Step 6: Create memory allocator
        let allocator = Self::create_allocator(&instance, physical_device, &device)
            .map_err(destroy_device)?;

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            instance,
            entry,
            queue,
            queue_family,
            debug_utils,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        display_handle: RawDisplayHandle,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("haar-demo")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_3);

        // Platform-specific surface extensions
        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .context("Unsupported windowing platform")?
            .to_vec();

        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        // Validation layers
        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn validation_layer_available(entry: &Entry) -> bool {
        #[allow(unused_unsafe)]
        let layers = match unsafe { entry.enumerate_instance_layer_properties() } {
            Ok(layers) => layers,
            Err(e) => {
                log::warn!("Failed to enumerate instance layers: {}", e);
                return false;
            }
        };

        let found = has_layer(&layers, VALIDATION_LAYER);
        if !found {
            log::warn!("Validation requested but {:?} is not installed", VALIDATION_LAYER);
        }
        found
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        device_index: Option<usize>,
    ) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate GPUs")?;

        let candidates: Vec<_> = devices
            .iter()
            .map(|&device| {
                let props = unsafe { instance.get_physical_device_properties(device) };
                (props.device_type, Self::find_queue_family(instance, device))
            })
            .collect();

        let (index, family) = choose_device(&candidates, device_index)?;
        Ok((devices[index], family))
    }

    /// One queue does everything here: the blit needs graphics, the transform needs compute.
    /// Presentation support is checked once the surface exists.
    fn find_queue_family(instance: &ash::Instance, device: vk::PhysicalDevice) -> Option<u32> {
        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        queue_families
            .iter()
            .enumerate()
            .find(|(_, props)| {
                props
                    .queue_flags
                    .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            })
            .map(|(i, _)| i as u32)
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        // Required device extensions
        let extensions = [ash::extensions::khr::Swapchain::name().as_ptr()];

        // Robust access keeps an out-of-range shader access from faulting the GPU
        let supported = unsafe { instance.get_physical_device_features(physical_device) };
        let features = vk::PhysicalDeviceFeatures::builder()
            .robust_buffer_access(supported.robust_buffer_access == vk::TRUE);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        Ok((device, queue))
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create memory allocator")?;

        Ok(allocator)
    }

    /// Allocate memory for a buffer or image with the given requirements
    pub fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        self.allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .with_context(|| format!("Failed to allocate memory for {}", name))
    }

    pub fn free(&self, allocation: Allocation) {
        if let Err(e) = self.allocator.lock().free(allocation) {
            log::error!("Failed to free allocation: {}", e);
        }
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        if let Err(e) = self.wait_idle() {
            log::error!("{:#}", e);
        }

        // Cleanup in reverse order
        unsafe {
            // The allocator still owns its memory blocks and frees them through the device
            ManuallyDrop::drop(&mut self.allocator);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

fn has_layer(layers: &[vk::LayerProperties], name: &CStr) -> bool {
    layers
        .iter()
        .any(|layer| (unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }) == name)
}

/// Pick a GPU from `(type, usable queue family)` candidates, by index or by score
fn choose_device(
    candidates: &[(vk::PhysicalDeviceType, Option<u32>)],
    device_index: Option<usize>,
) -> Result<(usize, u32)> {
    if candidates.is_empty() {
        anyhow::bail!("No Vulkan-capable GPU found");
    }

    if let Some(index) = device_index {
        let &(_, family) = candidates.get(index).with_context(|| {
            format!("graphics.device_index {} out of range ({} GPUs)", index, candidates.len())
        })?;
        let family = family.with_context(|| format!("GPU {} has no graphics + compute queue", index))?;
        return Ok((index, family));
    }

    // Prefer discrete GPU
    let device_score = |device_type: vk::PhysicalDeviceType| match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        _ => 1,
    };

    let mut best: Option<(usize, u32, u32)> = None;
    for (index, &(device_type, family)) in candidates.iter().enumerate() {
        let Some(family) = family else { continue };
        let score = device_score(device_type);
        if best.map_or(true, |(_, _, best_score)| score > best_score) {
            best = Some((index, family, score));
        }
    }

    best.map(|(index, family, _)| (index, family))
        .ok_or_else(|| anyhow::anyhow!("No suitable GPU found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(name: &str) -> vk::LayerProperties {
        let mut props = vk::LayerProperties::default();
        for (dst, &src) in props.layer_name.iter_mut().zip(name.as_bytes()) {
            *dst = src as std::ffi::c_char;
        }
        props
    }

    #[test]
    fn finds_validation_layer_by_name() {
        let layers = [layer("VK_LAYER_MESA_device_select"), layer("VK_LAYER_KHRONOS_validation")];
        assert!(has_layer(&layers, VALIDATION_LAYER));
        assert!(!has_layer(&layers[..1], VALIDATION_LAYER));
        assert!(!has_layer(&[], VALIDATION_LAYER));
    }

    #[test]
    fn scoring_prefers_discrete_with_a_usable_queue() {
        let candidates = [
            (vk::PhysicalDeviceType::INTEGRATED_GPU, Some(0)),
            (vk::PhysicalDeviceType::DISCRETE_GPU, None),
            (vk::PhysicalDeviceType::DISCRETE_GPU, Some(2)),
            (vk::PhysicalDeviceType::CPU, Some(0)),
        ];
        assert_eq!(choose_device(&candidates, None).unwrap(), (2, 2));
        assert_eq!(choose_device(&candidates[..2], None).unwrap(), (0, 0));
    }

    #[test]
    fn forced_index_must_exist_and_be_usable() {
        let candidates = [
            (vk::PhysicalDeviceType::DISCRETE_GPU, Some(0)),
            (vk::PhysicalDeviceType::INTEGRATED_GPU, None),
        ];
        assert_eq!(choose_device(&candidates, Some(0)).unwrap(), (0, 0));

        let err = choose_device(&candidates, Some(5)).unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert!(choose_device(&candidates, Some(1)).is_err());
    }

    #[test]
    fn no_gpu_is_an_error() {
        assert!(choose_device(&[], None).is_err());
        assert!(choose_device(&[(vk::PhysicalDeviceType::CPU, None)], None).is_err());
    }
}
