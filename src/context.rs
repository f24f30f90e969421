//! Shared device context
//!
//! Every GPU object in the crate holds an `Arc<DeviceContext>`, so the
//! logical device outlives all resources created from it regardless of the
//! order in which callers drop things. The context also carries the
//! poisoned flag set on device loss: once poisoned, every subsequent
//! operation that touches the context fails with `DeviceLost`.

use std::sync::atomic::{AtomicBool, Ordering};

use ash::vk;

use crate::error::{ComputeError, Result};

pub struct DeviceContext {
    /// Keeps the Vulkan library loaded for the lifetime of the handles.
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Compute-capable queue families the device was created with.
    queue_family_indices: Vec<u32>,
    /// One queue per family, in the same order as `queue_family_indices`.
    queues: Vec<vk::Queue>,
    /// False when the instance/device were supplied externally.
    owns_handles: bool,
    poisoned: AtomicBool,
}

impl DeviceContext {
    pub(crate) fn new(
        entry: ash::Entry,
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queue_family_indices: Vec<u32>,
        queues: Vec<vk::Queue>,
        owns_handles: bool,
    ) -> Self {
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        Self {
            _entry: entry,
            instance,
            physical_device,
            device,
            memory_properties,
            queue_family_indices,
            queues,
            owns_handles,
            poisoned: AtomicBool::new(false),
        }
    }

    pub(crate) fn device(&self) -> &ash::Device {
        &self.device
    }

    pub(crate) fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub(crate) fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub(crate) fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub(crate) fn queue_family_indices(&self) -> &[u32] {
        &self.queue_family_indices
    }

    pub(crate) fn queue(&self, index: usize) -> Result<(vk::Queue, u32)> {
        match (
            self.queues.get(index),
            self.queue_family_indices.get(index),
        ) {
            (Some(&queue), Some(&family)) => Ok((queue, family)),
            _ => Err(ComputeError::DeviceNotFound(format!(
                "queue index {} out of range ({} compute queues)",
                index,
                self.queues.len()
            ))),
        }
    }

    /// Number of compute queues available for sequences.
    pub(crate) fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Fails with `DeviceLost` once the context has been poisoned.
    pub(crate) fn ensure_alive(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(ComputeError::DeviceLost);
        }
        Ok(())
    }

    /// Converts a raw Vulkan error, poisoning the context on device loss.
    pub(crate) fn guard(&self, result: vk::Result) -> ComputeError {
        if result == vk::Result::ERROR_DEVICE_LOST {
            log::warn!("Vulkan device lost, poisoning device context");
            self.poisoned.store(true, Ordering::Release);
        }
        result.into()
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if !self.owns_handles {
            log::debug!("Releasing externally-owned device context without destroying handles");
            return;
        }

        log::info!("Destroying Vulkan device and instance");
        unsafe {
            // Let in-flight work drain before the handles go away.
            self.device.device_wait_idle().ok();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}
