use ash::vk;
use thiserror::Error as ThisError;

/// Failures callers are expected to tell apart. Everything else travels as a
/// plain `anyhow::Error` wrapping the raw `vk::Result`.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Could not find a suitable device")]
    NoSuitableAdapter,
    #[error("Raytracing not supported on device {0}")]
    RayTracingUnsupported(String),
    #[error("Device lost while waiting for fence value {0}")]
    DeviceLost(u64),
    #[error("Vulkan call failed: {0}")]
    Vulkan(vk::Result),
}

impl Error {
    pub(crate) fn from_wait(result: vk::Result, value: u64) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost(value),
            other => Self::Vulkan(other),
        }
    }
}
