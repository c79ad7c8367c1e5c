use std::sync::Arc;

use anyhow::{Context as _, Result};
use vulkan::{ash::vk, Context, GpuTimeline, Image, ImageView, Semaphore, Swapchain};

/// The set of images frames are presented from.
///
/// The image to render into next is decided by the presentation engine, not
/// by the caller, so frame slots are always picked through
/// `current_image_index` after a successful `acquire_next_image`.
pub trait PresentationSurface {
    /// Per image resource a frame slot holds on to, e.g. a view of the image.
    type ImageBinding;

    fn extent(&self) -> vk::Extent2D;

    fn image_count(&self) -> usize;

    fn current_image_index(&self) -> usize;

    fn vsync(&self) -> bool;

    /// Takes effect once the images are rebuilt.
    fn set_vsync(&mut self, vsync: bool);

    /// Recreates the images. Every binding handed out before must have been
    /// dropped and the GPU must be idle.
    fn resize_images(&mut self, width: u32, height: u32) -> Result<()>;

    /// `false` if no image could be acquired and the surface must be rebuilt.
    fn acquire_next_image(&mut self) -> Result<bool>;

    fn bind_image(&self, index: usize) -> Result<Self::ImageBinding>;
}

pub struct PresentSurface {
    context: Arc<Context>,
    pub swapchain: Swapchain,
    acquire_semaphores: Vec<Semaphore>,
    spare_acquire_semaphore: Semaphore,
    render_finished_semaphores: Vec<Semaphore>,
    current_index: usize,
}

impl PresentSurface {
    pub fn new(context: Arc<Context>, width: u32, height: u32, vsync: bool) -> Result<Self> {
        let swapchain = Swapchain::new(&context, width, height, vsync)?;
        let (acquire_semaphores, render_finished_semaphores) =
            create_semaphores(&context, swapchain.images.len())?;
        let spare_acquire_semaphore = context.create_semaphore()?;

        Ok(Self {
            context,
            swapchain,
            acquire_semaphores,
            spare_acquire_semaphore,
            render_finished_semaphores,
            current_index: 0,
        })
    }

    pub fn format(&self) -> vk::Format {
        self.swapchain.format
    }

    pub fn image(&self, index: usize) -> Result<&Image> {
        self.swapchain
            .images
            .get(index)
            .with_context(|| format!("No swapchain image {index}"))
    }

    /// Signaled once image `index` is ready to be rendered to.
    pub fn acquire_semaphore(&self, index: usize) -> Result<&Semaphore> {
        self.acquire_semaphores
            .get(index)
            .with_context(|| format!("No acquire semaphore for image {index}"))
    }

    /// Signaled by the frame's submission, waited on by presentation.
    pub fn render_finished_semaphore(&self, index: usize) -> Result<&Semaphore> {
        self.render_finished_semaphores
            .get(index)
            .with_context(|| format!("No render semaphore for image {index}"))
    }

    /// Returns `true` if the surface must be rebuilt before the next frame.
    pub fn present(&self, index: usize) -> Result<bool> {
        self.swapchain.queue_present(
            index as _,
            &[self.render_finished_semaphore(index)?],
            &self.context.queue,
        )
    }
}

impl PresentationSurface for PresentSurface {
    type ImageBinding = ImageView;

    fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    fn image_count(&self) -> usize {
        self.swapchain.images.len()
    }

    fn current_image_index(&self) -> usize {
        self.current_index
    }

    fn vsync(&self) -> bool {
        self.swapchain.vsync
    }

    fn set_vsync(&mut self, vsync: bool) {
        self.swapchain.set_vsync(&self.context, vsync);
    }

    fn resize_images(&mut self, width: u32, height: u32) -> Result<()> {
        self.swapchain.resize(&self.context, width, height)?;

        // Nothing is pending after a flush, but an image acquired and never
        // presented leaves its semaphore signaled.
        let (acquire_semaphores, render_finished_semaphores) =
            create_semaphores(&self.context, self.swapchain.images.len())?;
        self.acquire_semaphores = acquire_semaphores;
        self.render_finished_semaphores = render_finished_semaphores;
        self.spare_acquire_semaphore = self.context.create_semaphore()?;
        self.current_index = 0;

        Ok(())
    }

    fn acquire_next_image(&mut self) -> Result<bool> {
        let acquired = self
            .swapchain
            .acquire_next_image(u64::MAX, &self.spare_acquire_semaphore)?;

        let Some(acquired) = acquired else {
            log::debug!("Swapchain out of date");
            return Ok(false);
        };
        if acquired.is_suboptimal {
            log::debug!("Swapchain suboptimal");
        }

        let index = acquired.index as usize;
        let slot = self
            .acquire_semaphores
            .get_mut(index)
            .with_context(|| format!("Acquired unknown swapchain image {index}"))?;
        std::mem::swap(slot, &mut self.spare_acquire_semaphore);
        self.current_index = index;

        Ok(true)
    }

    fn bind_image(&self, index: usize) -> Result<ImageView> {
        self.image(index)?.create_image_view()
    }
}

fn create_semaphores(context: &Context, count: usize) -> Result<(Vec<Semaphore>, Vec<Semaphore>)> {
    let acquire = (0..count)
        .map(|_| context.create_semaphore())
        .collect::<Result<Vec<_>>>()?;
    let render_finished = (0..count)
        .map(|_| context.create_semaphore())
        .collect::<Result<Vec<_>>>()?;

    Ok((acquire, render_finished))
}

impl Drop for PresentSurface {
    fn drop(&mut self) {
        // Semaphores can only go once the queue stopped using them.
        if let Err(e) = self.context.fence.flush() {
            log::error!("Failed to flush before destroying the surface: {e:#}");
        }
    }
}
