use std::{ffi::CString, sync::Arc};

use anyhow::Result;
use ash::{vk, Device as AshDevice};

use crate::{
    instance::Instance,
    physical_device::PhysicalDevice,
    queue::{Queue, QueueFamily},
};

pub struct Device {
    pub inner: AshDevice,
}

impl Device {
    pub(crate) fn new(
        instance: &Instance,
        physical_device: &PhysicalDevice,
        queue_family: QueueFamily,
        required_extensions: &[&str],
        device_features: &DeviceFeatures,
    ) -> Result<Self> {
        let queue_priorities = [1.0f32];

        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family.index)
            .queue_priorities(&queue_priorities)
            .build();

        let device_extensions_ptrs = required_extensions
            .iter()
            .map(|e| CString::new(*e))
            .collect::<Result<Vec<_>, _>>()?;
        let device_extensions_ptrs = device_extensions_ptrs
            .iter()
            .map(|e| e.as_ptr())
            .collect::<Vec<_>>();

        let mut ray_tracing_feature = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder()
            .ray_tracing_pipeline(device_features.ray_tracing_pipeline);
        let mut acceleration_struct_feature =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder()
                .acceleration_structure(device_features.acceleration_structure);
        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::builder()
            .buffer_device_address(device_features.buffer_device_address)
            .timeline_semaphore(device_features.timeline_semaphore);
        let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::builder()
            .dynamic_rendering(device_features.dynamic_rendering)
            .synchronization2(device_features.synchronization2);

        let pf = vk::PhysicalDeviceFeatures {
            shader_int64: vk::TRUE,
            ..Default::default()
        };

        let mut features = vk::PhysicalDeviceFeatures2::builder()
            .features(pf)
            .push_next(&mut acceleration_struct_feature)
            .push_next(&mut ray_tracing_feature)
            .push_next(&mut vulkan_12_features)
            .push_next(&mut vulkan_13_features);

        let device_create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&device_extensions_ptrs)
            .push_next(&mut features);

        let inner = unsafe {
            instance
                .inner
                .create_device(physical_device.inner, &device_create_info, None)?
        };

        Ok(Self { inner })
    }

    pub fn get_queue(self: &Arc<Self>, queue_family: QueueFamily, queue_index: u32) -> Queue {
        let inner = unsafe { self.inner.get_device_queue(queue_family.index, queue_index) };
        Queue::new(self.clone(), inner)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            self.inner.destroy_device(None);
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceFeatures {
    pub ray_tracing_pipeline: bool,
    pub acceleration_structure: bool,
    pub buffer_device_address: bool,
    pub timeline_semaphore: bool,
    pub dynamic_rendering: bool,
    pub synchronization2: bool,
}

impl DeviceFeatures {
    pub fn is_compatible_with(&self, requirements: &Self) -> bool {
        (!requirements.ray_tracing_pipeline || self.ray_tracing_pipeline)
            && (!requirements.acceleration_structure || self.acceleration_structure)
            && (!requirements.buffer_device_address || self.buffer_device_address)
            && (!requirements.timeline_semaphore || self.timeline_semaphore)
            && (!requirements.dynamic_rendering || self.dynamic_rendering)
            && (!requirements.synchronization2 || self.synchronization2)
    }

    pub fn supports_ray_tracing(&self) -> bool {
        self.ray_tracing_pipeline && self.acceleration_structure && self.buffer_device_address
    }
}

#[cfg(test)]
mod tests {
    use super::DeviceFeatures;

    #[test]
    fn missing_required_feature_is_incompatible() {
        let required = DeviceFeatures {
            timeline_semaphore: true,
            synchronization2: true,
            ..Default::default()
        };
        let supported = DeviceFeatures {
            synchronization2: true,
            dynamic_rendering: true,
            ..Default::default()
        };

        assert!(!supported.is_compatible_with(&required));
        assert!(required.is_compatible_with(&DeviceFeatures::default()));
    }

    #[test]
    fn ray_tracing_needs_pipeline_structures_and_addresses() {
        let mut features = DeviceFeatures {
            ray_tracing_pipeline: true,
            acceleration_structure: true,
            ..Default::default()
        };
        assert!(!features.supports_ray_tracing());

        features.buffer_device_address = true;
        assert!(features.supports_ray_tracing());
    }
}
