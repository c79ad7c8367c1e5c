use thiserror::Error;
use vulkan::ash::vk;

/// Fatal renderer failures, split by the phase they happened in.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Failed to initialize renderer: {0:#}")]
    Bootstrap(anyhow::Error),
    #[error("GPU device lost: {0:#}")]
    DeviceLost(anyhow::Error),
    #[error("Failed to render frame: {0:#}")]
    Runtime(anyhow::Error),
}

impl RenderError {
    /// Classifies an error raised while the event loop runs.
    pub fn runtime(error: anyhow::Error) -> Self {
        if is_device_lost(&error) {
            Self::DeviceLost(error)
        } else {
            Self::Runtime(error)
        }
    }

    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::DeviceLost(_))
    }
}

fn is_device_lost(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<vulkan::Error>(),
            Some(vulkan::Error::DeviceLost(_))
        ) || cause.downcast_ref::<vk::Result>() == Some(&vk::Result::ERROR_DEVICE_LOST)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context as _;

    #[test]
    fn device_lost_is_recognized_through_context() {
        let error = Err::<(), _>(vulkan::Error::DeviceLost(7))
            .context("Failed to wait for frame slot 1")
            .unwrap_err();

        assert!(RenderError::runtime(error).is_device_lost());
    }

    #[test]
    fn raw_device_lost_result_is_recognized() {
        let error = anyhow::Error::from(vk::Result::ERROR_DEVICE_LOST);
        assert!(RenderError::runtime(error).is_device_lost());
    }

    #[test]
    fn other_errors_stay_runtime() {
        let error = anyhow::anyhow!("Swapchain image 4 does not exist");
        let error = RenderError::runtime(error);

        assert!(!error.is_device_lost());
        assert!(error.to_string().starts_with("Failed to render frame"));
    }
}
