use std::sync::Arc;

use anyhow::Result;
use ash::{extensions::khr::Swapchain as AshSwapchain, vk};

use crate::{device::Device, Context, Image, Queue, Semaphore};

/// Number of presentation images asked for; the surface may clamp it.
pub const PREFERRED_IMAGE_COUNT: u32 = 3;

const PREFERRED_FORMATS: [vk::Format; 2] = [vk::Format::R8G8B8A8_UNORM, vk::Format::B8G8R8A8_UNORM];

pub struct AcquiredImage {
    pub index: u32,
    pub is_suboptimal: bool,
}

pub struct Swapchain {
    device: Arc<Device>,
    inner: AshSwapchain,
    swapchain_khr: vk::SwapchainKHR,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub present_mode: vk::PresentModeKHR,
    pub vsync: bool,
    pub images: Vec<Image>,
    /// Minimum image count passed on every rebuild. The driver may hand out
    /// more images than this.
    requested_image_count: u32,
}

impl Swapchain {
    pub fn new(context: &Context, width: u32, height: u32, vsync: bool) -> Result<Self> {
        log::debug!("Creating vulkan swapchain");

        let formats = unsafe {
            context.surface.inner.get_physical_device_surface_formats(
                context.physical_device.inner,
                context.surface.surface_khr,
            )?
        };
        let format = choose_surface_format(&formats);
        log::debug!("Swapchain format: {format:?}");

        let present_mode = select_present_mode(&supported_present_modes(context), vsync);
        log::debug!("Swapchain present mode: {present_mode:?}");

        let mut swapchain = Self {
            device: context.device.clone(),
            inner: AshSwapchain::new(&context.instance.inner, &context.device.inner),
            swapchain_khr: vk::SwapchainKHR::null(),
            extent: vk::Extent2D { width, height },
            format: format.format,
            color_space: format.color_space,
            present_mode,
            vsync,
            images: vec![],
            requested_image_count: PREFERRED_IMAGE_COUNT,
        };
        swapchain.rebuild(context, width, height)?;

        Ok(swapchain)
    }

    /// Recreates the images at a new size. Format, color space and present
    /// mode are kept. The caller must make sure none of the current images is
    /// still in use.
    pub fn resize(&mut self, context: &Context, width: u32, height: u32) -> Result<()> {
        log::debug!("Resizing vulkan swapchain to {width}x{height}");

        self.rebuild(context, width, height)
    }

    /// Switches the present mode. Takes effect on the next `resize`.
    pub fn set_vsync(&mut self, context: &Context, vsync: bool) {
        self.vsync = vsync;
        self.present_mode = select_present_mode(&supported_present_modes(context), vsync);
        log::debug!("Swapchain present mode: {:?}", self.present_mode);
    }

    fn rebuild(&mut self, context: &Context, width: u32, height: u32) -> Result<()> {
        let capabilities = unsafe {
            context
                .surface
                .inner
                .get_physical_device_surface_capabilities(
                    context.physical_device.inner,
                    context.surface.surface_khr,
                )?
        };

        let extent = choose_extent(&capabilities, width, height);
        log::debug!("Swapchain extent: {extent:?}");

        let image_count = choose_image_count(&capabilities, self.requested_image_count);
        log::debug!("Swapchain min image count: {image_count:?}");

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(context.surface.surface_khr)
            .min_image_count(image_count)
            .image_format(self.format)
            .image_color_space(self.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.present_mode)
            .clipped(true)
            .old_swapchain(self.swapchain_khr);

        let swapchain_khr = unsafe { self.inner.create_swapchain(&create_info, None)? };
        self.destroy();

        let images = unsafe { self.inner.get_swapchain_images(swapchain_khr)? };
        let images = images
            .into_iter()
            .map(|i| {
                Image::from_swapchain_image(
                    self.device.clone(),
                    context.allocator.clone(),
                    i,
                    self.format,
                    extent,
                )
            })
            .collect::<Vec<_>>();

        log::debug!("Swapchain image count: {}", images.len());

        self.swapchain_khr = swapchain_khr;
        self.extent = extent;
        self.images = images;

        Ok(())
    }

    /// `None` when the surface is out of date and must be rebuilt first.
    pub fn acquire_next_image(
        &self,
        timeout: u64,
        semaphore: &Semaphore,
    ) -> Result<Option<AcquiredImage>> {
        let result = unsafe {
            self.inner.acquire_next_image(
                self.swapchain_khr,
                timeout,
                semaphore.inner,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, is_suboptimal)) => Ok(Some(AcquiredImage {
                index,
                is_suboptimal,
            })),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns `true` if the swapchain no longer matches the surface.
    pub fn queue_present(
        &self,
        image_index: u32,
        wait_semaphores: &[&Semaphore],
        queue: &Queue,
    ) -> Result<bool> {
        let swapchains = [self.swapchain_khr];
        let images_indices = [image_index];
        let wait_semaphores = wait_semaphores.iter().map(|s| s.inner).collect::<Vec<_>>();

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&images_indices);

        match unsafe { self.inner.queue_present(queue.inner, &present_info) } {
            Ok(is_suboptimal) => Ok(is_suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    fn destroy(&mut self) {
        self.images.clear();
        if self.swapchain_khr != vk::SwapchainKHR::null() {
            unsafe { self.inner.destroy_swapchain(self.swapchain_khr, None) };
            self.swapchain_khr = vk::SwapchainKHR::null();
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Whether presentation without vertical sync is available. Failing to
/// query simply disables tearing.
pub fn tearing_supported(context: &Context) -> bool {
    supported_present_modes(context).contains(&vk::PresentModeKHR::IMMEDIATE)
}

fn supported_present_modes(context: &Context) -> Vec<vk::PresentModeKHR> {
    context
        .surface
        .present_modes(context.physical_device.inner)
        .unwrap_or_else(|e| {
            log::warn!("Failed to query present modes: {e}");
            vec![]
        })
}

pub fn select_present_mode(supported: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }

    [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX]
        .into_iter()
        .find(|mode| supported.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    let fallback = vk::SurfaceFormatKHR {
        format: PREFERRED_FORMATS[0],
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };

    if formats.is_empty() || (formats.len() == 1 && formats[0].format == vk::Format::UNDEFINED) {
        return fallback;
    }

    PREFERRED_FORMATS
        .iter()
        .find_map(|preferred| {
            formats.iter().find(|f| {
                f.format == *preferred && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
        })
        .copied()
        .unwrap_or(formats[0])
}

fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    let min = capabilities.min_image_extent;
    let max = capabilities.max_image_extent;
    vk::Extent2D {
        width: width.min(max.width).max(min.width).max(1),
        height: height.min(max.height).max(min.height).max(1),
    }
}

fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
    let count = requested.max(capabilities.min_image_count);
    match capabilities.max_image_count {
        0 => count,
        max => count.min(max),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vsync_always_uses_fifo() {
        let supported = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO];
        assert_eq!(select_present_mode(&supported, true), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn tearing_preferred_without_vsync() {
        let supported = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(
            select_present_mode(&supported, false),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            select_present_mode(&supported[..2], false),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            select_present_mode(&supported[..1], false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn prefers_rgba_then_bgra() {
        let srgb = vk::ColorSpaceKHR::SRGB_NONLINEAR;
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: srgb,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: srgb,
            },
        ];
        assert_eq!(choose_surface_format(&formats).format, vk::Format::B8G8R8A8_UNORM);

        let undefined = [vk::SurfaceFormatKHR {
            format: vk::Format::UNDEFINED,
            color_space: srgb,
        }];
        assert_eq!(choose_surface_format(&undefined).format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn extent_follows_surface_when_fixed() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };
        assert_eq!(
            choose_extent(&capabilities, 1280, 720),
            vk::Extent2D {
                width: 800,
                height: 600
            }
        );
    }

    #[test]
    fn extent_clamped_when_surface_defers() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 0,
                height: 0,
            },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        };
        assert_eq!(
            choose_extent(&capabilities, 4000, 0),
            vk::Extent2D {
                width: 1920,
                height: 1
            }
        );
    }

    #[test]
    fn image_count_respects_surface_limits() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&capabilities, 3), 3);

        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 2,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&capabilities, 3), 2);
    }
}
