//! Lifetime root of the runtime
//!
//! The [`Manager`] brings up (or wraps) the Vulkan instance, physical
//! device, logical device and compute queues, hands out tensors, images,
//! algorithms and sequences, and keeps weak references to issued resources
//! so that [`Manager::clear`] can prune anything the caller has dropped.
//! Handles the manager created itself are destroyed when the last resource
//! referencing the device context goes away.

use std::ffi::{CStr, CString};
use std::sync::{Arc, Weak};

use ash::vk;

use crate::algorithm::{Algorithm, ConstantBlock};
use crate::context::DeviceContext;
use crate::error::{ComputeError, Result};
use crate::image::Image;
use crate::memory::{ImageDataType, ImageTiling, ImageType, MemoryClass, SharedMemory};
use crate::memory::{TensorDataType, TensorType};
use crate::sequence::Sequence;
use crate::tensor::Tensor;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Construction options for [`Manager::with_config`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Index into the instance's physical device list.
    pub physical_device_index: usize,
    /// Compute queue families to create queues on; empty selects the first
    /// compute-capable family.
    pub queue_family_indices: Vec<u32>,
    /// Device extensions to enable.
    pub extensions: Vec<String>,
    /// Enable the Khronos validation layer when present.
    pub debug_layers: bool,
    /// Keep weak references to issued resources for [`Manager::clear`].
    pub manage_resources: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            physical_device_index: 0,
            queue_family_indices: Vec::new(),
            extensions: Vec::new(),
            debug_layers: cfg!(debug_assertions),
            manage_resources: true,
        }
    }
}

pub struct Manager {
    ctx: Arc<DeviceContext>,
    manage_resources: bool,
    tensors: Vec<Weak<Tensor>>,
    images: Vec<Weak<Image>>,
    algorithms: Vec<Weak<Algorithm>>,
}

impl Manager {
    /// Brings up Vulkan with the default configuration: physical device 0
    /// and one queue on the first compute-capable family.
    pub fn new() -> Result<Self> {
        Self::with_config(ManagerConfig::default())
    }

    /// Brings up Vulkan with explicit device, queue and extension choices.
    pub fn with_config(config: ManagerConfig) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| ComputeError::DeviceNotFound(format!("failed to load Vulkan: {}", e)))?;

        let instance = Self::create_instance(&entry, config.debug_layers)?;

        match Self::setup_device(&instance, &config) {
            Ok((physical_device, device, families, queues)) => {
                log::info!(
                    "Manager initialized: physical device {}, {} compute queue(s)",
                    config.physical_device_index,
                    queues.len()
                );
                let ctx = Arc::new(DeviceContext::new(
                    entry,
                    instance,
                    physical_device,
                    device,
                    families,
                    queues,
                    true,
                ));
                Ok(Self {
                    ctx,
                    manage_resources: config.manage_resources,
                    tensors: Vec::new(),
                    images: Vec::new(),
                    algorithms: Vec::new(),
                })
            }
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    /// Wraps externally created Vulkan handles. The manager never destroys
    /// them; the caller keeps ownership. Queues are fetched as queue 0 of
    /// each listed family, which therefore must have been requested at
    /// device creation.
    pub fn from_handles(
        entry: ash::Entry,
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queue_family_indices: Vec<u32>,
        manage_resources: bool,
    ) -> Result<Self> {
        if queue_family_indices.is_empty() {
            return Err(ComputeError::DeviceNotFound(
                "wrapped device needs at least one compute queue family".into(),
            ));
        }

        let queues: Vec<vk::Queue> = queue_family_indices
            .iter()
            .map(|&family| unsafe { device.get_device_queue(family, 0) })
            .collect();

        log::info!(
            "Manager wrapping external device with {} compute queue(s)",
            queues.len()
        );

        let ctx = Arc::new(DeviceContext::new(
            entry,
            instance,
            physical_device,
            device,
            queue_family_indices,
            queues,
            false,
        ));

        Ok(Self {
            ctx,
            manage_resources,
            tensors: Vec::new(),
            images: Vec::new(),
            algorithms: Vec::new(),
        })
    }

    fn create_instance(entry: &ash::Entry, debug_layers: bool) -> Result<ash::Instance> {
        let app_info = vk::ApplicationInfo::default()
            .application_name(c"vkcompute")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"vkcompute")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut layer_ptrs = Vec::new();
        if debug_layers {
            let available = unsafe { entry.enumerate_instance_layer_properties() }
                .unwrap_or_default();
            let have_validation = available.iter().any(|layer| {
                (unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }) == VALIDATION_LAYER
            });
            if have_validation {
                log::info!("Enabling {:?}", VALIDATION_LAYER);
                layer_ptrs.push(VALIDATION_LAYER.as_ptr());
            } else {
                log::warn!("Validation layer requested but not installed");
            }
        }

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_ptrs);

        unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| ComputeError::DeviceNotFound(format!("instance creation failed: {:?}", e)))
    }

    /// Picks the physical device, resolves compute queue families, checks
    /// extensions, and creates the logical device plus its queues.
    #[allow(clippy::type_complexity)]
    fn setup_device(
        instance: &ash::Instance,
        config: &ManagerConfig,
    ) -> Result<(vk::PhysicalDevice, ash::Device, Vec<u32>, Vec<vk::Queue>)> {
        let physical_devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(ComputeError::from)?;

        let physical_device = *physical_devices
            .get(config.physical_device_index)
            .ok_or_else(|| {
                ComputeError::DeviceNotFound(format!(
                    "physical device index {} out of range ({} available)",
                    config.physical_device_index,
                    physical_devices.len()
                ))
            })?;

        let family_props =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        let mut families: Vec<u32> = Vec::new();
        if config.queue_family_indices.is_empty() {
            let first_compute = family_props
                .iter()
                .enumerate()
                .find(|(_, props)| props.queue_flags.contains(vk::QueueFlags::COMPUTE))
                .map(|(index, _)| index as u32)
                .ok_or_else(|| {
                    ComputeError::DeviceNotFound("no compute-capable queue family".into())
                })?;
            families.push(first_compute);
        } else {
            for &family in &config.queue_family_indices {
                let props = family_props.get(family as usize).ok_or_else(|| {
                    ComputeError::DeviceNotFound(format!(
                        "queue family {} out of range ({} families)",
                        family,
                        family_props.len()
                    ))
                })?;
                if !props.queue_flags.contains(vk::QueueFlags::COMPUTE) {
                    return Err(ComputeError::DeviceNotFound(format!(
                        "queue family {} is not compute-capable",
                        family
                    )));
                }
                if !families.contains(&family) {
                    families.push(family);
                }
            }
        }

        let extension_names = Self::check_extensions(instance, physical_device, &config.extensions)?;
        let extension_ptrs: Vec<*const std::os::raw::c_char> =
            extension_names.iter().map(|name| name.as_ptr()).collect();

        let priorities = [1.0f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
            })
            .collect();

        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs);

        let device = unsafe { instance.create_device(physical_device, &device_info, None) }
            .map_err(ComputeError::from)?;

        let queues: Vec<vk::Queue> = families
            .iter()
            .map(|&family| unsafe { device.get_device_queue(family, 0) })
            .collect();

        Ok((physical_device, device, families, queues))
    }

    /// Verifies every requested device extension is available.
    fn check_extensions(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        requested: &[String],
    ) -> Result<Vec<CString>> {
        if requested.is_empty() {
            return Ok(Vec::new());
        }

        let available =
            unsafe { instance.enumerate_device_extension_properties(physical_device) }
                .map_err(ComputeError::from)?;

        let mut names = Vec::with_capacity(requested.len());
        for extension in requested {
            let name = CString::new(extension.as_str())
                .map_err(|_| ComputeError::ExtensionUnavailable(extension.clone()))?;
            let present = available.iter().any(|props| {
                (unsafe { CStr::from_ptr(props.extension_name.as_ptr()) }) == name.as_c_str()
            });
            if !present {
                return Err(ComputeError::ExtensionUnavailable(extension.clone()));
            }
            names.push(name);
        }
        Ok(names)
    }

    /// Creates a tensor seeded with `data`; the element type is inferred
    /// from the slice.
    pub fn tensor<T: TensorType>(
        &mut self,
        data: &[T],
        class: MemoryClass,
    ) -> Result<Arc<Tensor>> {
        let bytes = unsafe {
            std::slice::from_raw_parts(data.as_ptr() as *const u8, std::mem::size_of_val(data))
        };
        let tensor = Arc::new(Tensor::new(
            self.ctx.clone(),
            Some(bytes),
            data.len() as u32,
            T::DATA_TYPE,
            class,
        )?);
        if self.manage_resources {
            self.tensors.push(Arc::downgrade(&tensor));
        }
        Ok(tensor)
    }

    /// Creates an uninitialized tensor of `element_count` elements.
    pub fn tensor_raw(
        &mut self,
        element_count: u32,
        dtype: TensorDataType,
        class: MemoryClass,
    ) -> Result<Arc<Tensor>> {
        let tensor = Arc::new(Tensor::new(
            self.ctx.clone(),
            None,
            element_count,
            dtype,
            class,
        )?);
        if self.manage_resources {
            self.tensors.push(Arc::downgrade(&tensor));
        }
        Ok(tensor)
    }

    /// Creates an image seeded with `data`; the element type is inferred
    /// from the slice, which must hold exactly `width * height * channels`
    /// values.
    #[allow(clippy::too_many_arguments)]
    pub fn image<T: ImageType>(
        &mut self,
        data: &[T],
        width: u32,
        height: u32,
        channels: u32,
        class: MemoryClass,
        tiling: ImageTiling,
    ) -> Result<Arc<Image>> {
        let expected = width as u64 * height as u64 * channels as u64;
        if data.len() as u64 != expected {
            return Err(ComputeError::SizeMismatch(format!(
                "image payload holds {} elements, expected {}",
                data.len(),
                expected
            )));
        }

        let bytes = unsafe {
            std::slice::from_raw_parts(data.as_ptr() as *const u8, std::mem::size_of_val(data))
        };
        let image = Arc::new(Image::new(
            self.ctx.clone(),
            Some(bytes),
            width,
            height,
            channels,
            T::DATA_TYPE,
            class,
            tiling,
        )?);
        if self.manage_resources {
            self.images.push(Arc::downgrade(&image));
        }
        Ok(image)
    }

    /// Creates an uninitialized image.
    #[allow(clippy::too_many_arguments)]
    pub fn image_raw(
        &mut self,
        width: u32,
        height: u32,
        channels: u32,
        dtype: ImageDataType,
        class: MemoryClass,
        tiling: ImageTiling,
    ) -> Result<Arc<Image>> {
        let image = Arc::new(Image::new(
            self.ctx.clone(),
            None,
            width,
            height,
            channels,
            dtype,
            class,
            tiling,
        )?);
        if self.manage_resources {
            self.images.push(Arc::downgrade(&image));
        }
        Ok(image)
    }

    /// Creates an algorithm over `bindings` with the given SPIR-V bytecode.
    /// A zero workgroup x dimension defaults to the first bound tensor's
    /// element count.
    pub fn algorithm(
        &mut self,
        bindings: Vec<SharedMemory>,
        spirv: &[u8],
        workgroup: [u32; 3],
        spec_consts: ConstantBlock,
        push_consts: ConstantBlock,
    ) -> Result<Arc<Algorithm>> {
        let algorithm = Arc::new(Algorithm::new(
            self.ctx.clone(),
            bindings,
            spirv,
            workgroup,
            spec_consts,
            push_consts,
        )?);
        if self.manage_resources {
            self.algorithms.push(Arc::downgrade(&algorithm));
        }
        Ok(algorithm)
    }

    /// Creates a sequence bound to the compute queue at `queue_index`.
    /// Nonzero `max_timestamps` allocates a timestamp query pool of that
    /// size.
    pub fn sequence(&self, queue_index: usize, max_timestamps: u32) -> Result<Sequence> {
        Sequence::new(self.ctx.clone(), queue_index, max_timestamps)
    }

    /// Number of compute queues sequences can be sharded across.
    pub fn queue_count(&self) -> usize {
        self.ctx.queue_count()
    }

    /// Queue family indices backing those queues, in queue-index order.
    pub fn queue_family_indices(&self) -> &[u32] {
        self.ctx.queue_family_indices()
    }

    /// Prunes bookkeeping for resources the caller has dropped. Live
    /// resources are never destroyed.
    pub fn clear(&mut self) {
        let before = self.tensors.len() + self.images.len() + self.algorithms.len();
        self.tensors.retain(|weak| weak.strong_count() > 0);
        self.images.retain(|weak| weak.strong_count() > 0);
        self.algorithms.retain(|weak| weak.strong_count() > 0);
        let after = self.tensors.len() + self.images.len() + self.algorithms.len();
        log::debug!("Manager clear: pruned {} dead resources", before - after);
    }

    /// Consumes the manager. Handles the manager created are destroyed
    /// once the last outstanding resource drops its device reference.
    pub fn destroy(self) {}

    /// Properties of the selected physical device.
    pub fn device_properties(&self) -> vk::PhysicalDeviceProperties {
        unsafe {
            self.ctx
                .instance()
                .get_physical_device_properties(self.ctx.physical_device())
        }
    }

    /// Properties of every physical device the instance can see.
    pub fn list_devices(&self) -> Result<Vec<vk::PhysicalDeviceProperties>> {
        let devices = unsafe { self.ctx.instance().enumerate_physical_devices() }
            .map_err(|e| self.ctx.guard(e))?;
        Ok(devices
            .iter()
            .map(|&device| unsafe { self.ctx.instance().get_physical_device_properties(device) })
            .collect())
    }
}
