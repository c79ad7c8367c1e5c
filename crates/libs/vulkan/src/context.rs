use std::sync::{Arc, Mutex};

use anyhow::Result;
use ash::{vk, Entry};
use gpu_allocator::{
    vulkan::{Allocator, AllocatorCreateDesc},
    AllocatorDebugSettings,
};

use crate::{
    device::{Device, DeviceFeatures},
    error::Error,
    instance::Instance,
    physical_device::PhysicalDevice,
    queue::{Queue, QueueFamily},
    surface::Surface,
    CommandBuffer, CommandPool, GpuTimeline, RayTracingContext, TimelineFence, Version,
    RAY_TRACING_EXTENSIONS, VERSION_1_3,
};

/// Every device-level object the renderer shares: one adapter, one queue
/// doing graphics, compute and present, and the timeline fence that tracks
/// work submitted to that queue.
pub struct Context {
    pub allocator: Arc<Mutex<Allocator>>,
    pub command_pool: CommandPool,
    pub fence: TimelineFence,
    pub ray_tracing: Arc<RayTracingContext>,
    pub queue: Queue,
    pub device: Arc<Device>,
    pub queue_family: QueueFamily,
    pub physical_device: PhysicalDevice,
    pub surface: Surface,
    pub instance: Instance,
    _entry: Entry,
}

pub struct ContextBuilder<'a> {
    window_handle: &'a winit::window::Window,
    vulkan_version: Version,
    app_name: &'a str,
    required_extensions: &'a [&'a str],
    required_device_features: DeviceFeatures,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(window_handle: &'a winit::window::Window) -> Self {
        Self {
            window_handle,

            vulkan_version: VERSION_1_3,
            app_name: "",
            required_extensions: &[],
            required_device_features: Default::default(),
        }
    }

    pub fn vulkan_version(self, vulkan_version: Version) -> Self {
        Self {
            vulkan_version,
            ..self
        }
    }

    pub fn app_name(self, app_name: &'a str) -> Self {
        Self { app_name, ..self }
    }

    pub fn required_extensions(self, required_extensions: &'a [&str]) -> Self {
        Self {
            required_extensions,
            ..self
        }
    }

    pub fn required_device_features(self, required_device_features: DeviceFeatures) -> Self {
        Self {
            required_device_features,
            ..self
        }
    }

    pub fn build(self) -> Result<Context> {
        Context::new(self)
    }
}

impl Context {
    fn new(
        ContextBuilder {
            vulkan_version,
            window_handle,
            app_name,
            required_extensions,
            required_device_features,
        }: ContextBuilder,
    ) -> Result<Self> {
        let entry = Entry::linked();
        let mut instance = Instance::new(&entry, window_handle, vulkan_version, app_name)?;

        let surface = Surface::new(&entry, &instance, window_handle)?;

        let physical_devices = instance.enumerate_physical_devices(&surface)?;
        let (physical_device, queue_family) = select_suitable_physical_device(
            physical_devices,
            required_extensions,
            &required_device_features,
        )?;
        log::info!(
            "Selected physical device: {:?} ({} MiB device local)",
            physical_device.name,
            physical_device.device_local_memory >> 20
        );

        let device = Arc::new(Device::new(
            &instance,
            &physical_device,
            queue_family,
            required_extensions,
            &required_device_features,
        )?);
        let queue = device.get_queue(queue_family, 0);

        let ray_tracing = Arc::new(RayTracingContext::new(&instance, &physical_device, &device));
        log::debug!(
            "Ray tracing pipeline properties {:#?}",
            ray_tracing.pipeline_properties
        );
        log::debug!(
            "Acceleration structure properties {:#?}",
            ray_tracing.acceleration_structure_properties
        );

        let command_pool = CommandPool::new(
            device.clone(),
            ray_tracing.clone(),
            queue_family,
            Some(vk::CommandPoolCreateFlags::TRANSIENT),
        )?;

        let fence = TimelineFence::new(device.clone(), queue.clone())?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.inner.clone(),
            device: device.inner.clone(),
            physical_device: physical_device.inner,
            debug_settings: AllocatorDebugSettings {
                log_allocations: true,
                log_frees: true,
                ..Default::default()
            },
            buffer_device_address: required_device_features.buffer_device_address,
        })?;

        Ok(Self {
            allocator: Arc::new(Mutex::new(allocator)),
            command_pool,
            fence,
            ray_tracing,
            queue,
            device,
            queue_family,
            physical_device,
            surface,
            instance,
            _entry: entry,
        })
    }
}

fn select_suitable_physical_device(
    devices: &[PhysicalDevice],
    required_extensions: &[&str],
    required_device_features: &DeviceFeatures,
) -> Result<(PhysicalDevice, QueueFamily)> {
    log::debug!("Choosing Vulkan physical device");

    let presentable = |device: &PhysicalDevice, extensions: &[&str]| {
        !device.supported_surface_formats.is_empty()
            && !device.supported_present_modes.is_empty()
            && device.supports_extensions(extensions)
    };
    let universal_family =
        |device: &PhysicalDevice| device.queue_families.iter().copied().find(|f| f.is_universal());

    let selected = devices
        .iter()
        .filter(|device| presentable(*device, required_extensions))
        .filter(|device| {
            device
                .supported_device_features
                .is_compatible_with(required_device_features)
        })
        .find_map(|device| universal_family(device).map(|family| (device.clone(), family)));

    if let Some(selected) = selected {
        return Ok(selected);
    }

    // Tell missing ray tracing support apart from a generally unusable adapter
    let without_ray_tracing = DeviceFeatures {
        ray_tracing_pipeline: false,
        acceleration_structure: false,
        ..*required_device_features
    };
    let extensions_without_ray_tracing = required_extensions
        .iter()
        .copied()
        .filter(|name| !RAY_TRACING_EXTENSIONS.contains(name))
        .collect::<Vec<_>>();
    let fallback = devices
        .iter()
        .filter(|device| presentable(*device, &extensions_without_ray_tracing[..]))
        .filter(|device| universal_family(device).is_some())
        .find(|device| {
            device
                .supported_device_features
                .is_compatible_with(&without_ray_tracing)
        });

    match fallback {
        Some(device) if required_device_features.supports_ray_tracing() => {
            Err(Error::RayTracingUnsupported(device.name.clone()).into())
        }
        _ => Err(Error::NoSuitableAdapter.into()),
    }
}

impl Context {
    /// Records `executor` into a transient command buffer, submits it and
    /// flushes the queue.
    pub fn execute_one_time_commands<R, F: FnOnce(&CommandBuffer) -> R>(
        &self,
        executor: F,
    ) -> Result<R> {
        let command_buffer = self
            .command_pool
            .allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)?;

        command_buffer.begin(Some(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT))?;

        let executor_result = executor(&command_buffer);

        command_buffer.end()?;

        self.queue.submit(&command_buffer, None, None)?;
        self.fence.flush()?;

        self.command_pool.free_command_buffer(&command_buffer)?;

        Ok(executor_result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(index: u32, flags: vk::QueueFlags, present: bool) -> QueueFamily {
        let properties = vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        };
        QueueFamily::new(index, properties, present)
    }

    fn adapter(name: &str, families: Vec<QueueFamily>, features: DeviceFeatures) -> PhysicalDevice {
        PhysicalDevice {
            inner: vk::PhysicalDevice::null(),
            name: name.to_owned(),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            device_local_memory: 0,
            queue_families: families,
            supported_extensions: vec!["VK_KHR_swapchain".to_owned()],
            supported_surface_formats: vec![vk::SurfaceFormatKHR::default()],
            supported_present_modes: vec![vk::PresentModeKHR::FIFO],
            supported_device_features: features,
        }
    }

    fn required_extensions() -> Vec<&'static str> {
        let mut extensions = vec!["VK_KHR_swapchain"];
        extensions.extend(RAY_TRACING_EXTENSIONS);
        extensions
    }

    fn ray_tracing_features() -> DeviceFeatures {
        DeviceFeatures {
            ray_tracing_pipeline: true,
            acceleration_structure: true,
            buffer_device_address: true,
            timeline_semaphore: true,
            dynamic_rendering: true,
            synchronization2: true,
        }
    }

    #[test]
    fn picks_first_adapter_with_universal_queue() {
        let graphics_only = family(0, vk::QueueFlags::GRAPHICS, false);
        let universal = family(1, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, true);
        let devices = [
            adapter("split queues", vec![graphics_only], ray_tracing_features()),
            adapter("universal", vec![graphics_only, universal], ray_tracing_features()),
        ];

        let (device, queue_family) =
            select_suitable_physical_device(&devices, &["VK_KHR_swapchain"], &ray_tracing_features())
                .unwrap();

        assert_eq!(device.name, "universal");
        assert_eq!(queue_family.index, 1);
    }

    #[test]
    fn reports_missing_ray_tracing_separately() {
        let universal = family(0, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, true);
        let raster_only = DeviceFeatures {
            ray_tracing_pipeline: false,
            acceleration_structure: false,
            ..ray_tracing_features()
        };
        let devices = [adapter("raster only", vec![universal], raster_only)];

        let error = select_suitable_physical_device(
            &devices,
            &required_extensions(),
            &ray_tracing_features(),
        )
        .unwrap_err();

        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::RayTracingUnsupported(name)) if name == "raster only"
        ));
    }

    #[test]
    fn missing_ray_tracing_extensions_count_as_missing_ray_tracing() {
        let universal = family(0, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, true);
        let devices = [adapter("no extensions", vec![universal], ray_tracing_features())];

        let error = select_suitable_physical_device(
            &devices,
            &required_extensions(),
            &ray_tracing_features(),
        )
        .unwrap_err();

        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::RayTracingUnsupported(name)) if name == "no extensions"
        ));
    }

    #[test]
    fn adapter_without_swapchain_is_unsuitable() {
        let universal = family(0, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, true);
        let mut headless = adapter("headless", vec![universal], ray_tracing_features());
        headless.supported_extensions.clear();

        let error = select_suitable_physical_device(
            &[headless],
            &required_extensions(),
            &ray_tracing_features(),
        )
        .unwrap_err();

        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::NoSuitableAdapter)
        ));
    }

    #[test]
    fn adapter_with_every_extension_is_selected() {
        let universal = family(0, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, true);
        let mut capable = adapter("capable", vec![universal], ray_tracing_features());
        capable.supported_extensions = required_extensions()
            .iter()
            .map(|name| name.to_string())
            .collect();

        let (device, _) = select_suitable_physical_device(
            &[capable],
            &required_extensions(),
            &ray_tracing_features(),
        )
        .unwrap();

        assert_eq!(device.name, "capable");
    }

    #[test]
    fn no_adapter_at_all() {
        let error = select_suitable_physical_device(&[], &[], &ray_tracing_features()).unwrap_err();

        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::NoSuitableAdapter)
        ));
    }
}
