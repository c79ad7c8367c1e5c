pub use anyhow;
pub use vulkan;

mod error;
mod frame;
mod fullscreen;
mod input;
mod recorder;
mod render_mode;
mod resize;
mod stats;
mod surface;

#[cfg(test)]
mod testing;

pub use error::RenderError;
pub use frame::*;
pub use fullscreen::*;
pub use input::{apply_command, Command};
pub use render_mode::RenderMode;
pub use resize::*;
pub use stats::FrameStats;
pub use surface::*;

use anyhow::{Context as _, Result};
use gpu_allocator::MemoryLocation;
use recorder::{frame_steps, FrameImage, Step};
use std::{marker::PhantomData, sync::Arc, time::Instant};
use vulkan::ash::vk;
use vulkan::*;
use winit::{
    dpi::PhysicalSize,
    event::{ElementState, Event, KeyboardInput, ModifiersState, WindowEvent},
    event_loop::{ControlFlow, EventLoop},
    window::{Window, WindowBuilder},
};

pub const CLEAR_COLOR: [f32; 4] = [0.0, 0.2, 0.4, 1.0];

/// Format of the image ray tracing writes to before it is copied to the
/// presentation image.
pub const OUTPUT_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

const REQUIRED_EXTENSIONS: [&str; 4] = [
    "VK_KHR_swapchain",
    RAY_TRACING_EXTENSIONS[0],
    RAY_TRACING_EXTENSIONS[1],
    RAY_TRACING_EXTENSIONS[2],
];

pub struct BaseApp<B: App> {
    phantom: PhantomData<B>,
    render_mode: RenderMode,
    pub output_image: ImageAndView,
    frames: FrameRing<FrameCommands, ImageView>,
    pub surface: PresentSurface,
    resize: ResizeController,
    fullscreen: FullscreenController,
    surface_dirty: bool,
    app_name: String,
    pub context: Arc<Context>,
}

/// The presentation image a frame renders to.
#[derive(Debug, Clone, Copy)]
pub struct FrameTarget {
    pub index: usize,
    pub extent: vk::Extent2D,
}

pub trait App: Sized {
    fn new(base: &mut BaseApp<Self>) -> Result<Self>;

    /// Called inside a render pass that already cleared the target and set
    /// the viewport and scissor.
    fn record_raster_commands(
        &self,
        base: &BaseApp<Self>,
        buffer: &CommandBuffer,
        target: &FrameTarget,
    ) -> Result<()>;

    /// Must fill `base.output_image`, which is in `GENERAL` layout.
    fn record_raytracing_commands(
        &self,
        base: &BaseApp<Self>,
        buffer: &CommandBuffer,
        target: &FrameTarget,
    ) -> Result<()>;

    fn on_recreate_swapchain(&mut self, base: &BaseApp<Self>) -> Result<()>;
}

pub fn run<A: App + 'static>(app_name: &str, width: u32, height: u32) -> Result<()> {
    let (window, event_loop) = create_window(app_name, width, height)?;
    let (mut base_app, mut app) =
        bootstrap::<A>(&window, app_name).map_err(RenderError::Bootstrap)?;

    let mut modifiers = ModifiersState::empty();
    let mut last_frame = Instant::now();
    let mut frame_stats = FrameStats::default();

    event_loop.run(move |event, _, control_flow| {
        *control_flow = ControlFlow::Poll;

        let app = &mut app; // Make sure it is dropped before base_app

        let result = match event {
            Event::NewEvents(_) => {
                let now = Instant::now();
                frame_stats.set_frame_time(now - last_frame);
                last_frame = now;
                Ok(())
            }
            // On resize
            Event::WindowEvent {
                event: WindowEvent::Resized(size),
                ..
            } => {
                log::debug!("Window has been resized to {}x{}", size.width, size.height);
                Ok(())
            }
            Event::WindowEvent {
                event: WindowEvent::ModifiersChanged(state),
                ..
            } => {
                modifiers = state;
                Ok(())
            }
            // Draw
            Event::MainEventsCleared => {
                let size = window.inner_size();
                if size.width == 0 || size.height == 0 {
                    return;
                }

                base_app
                    .resize(app, size.width, size.height)
                    .and_then(|_| base_app.draw(app))
                    .map(|presented| {
                        if presented {
                            if let Some(fps) = frame_stats.tick() {
                                log::info!("FPS: {fps}");
                            }
                        }
                    })
            }
            // Keyboard
            Event::WindowEvent {
                event:
                    WindowEvent::KeyboardInput {
                        input:
                            KeyboardInput {
                                state: ElementState::Pressed,
                                virtual_keycode: Some(key_code),
                                ..
                            },
                        ..
                    },
                ..
            } => match Command::from_key(key_code, modifiers.alt()) {
                Some(Command::Quit) => {
                    *control_flow = ControlFlow::Exit;
                    Ok(())
                }
                Some(command) => base_app.handle_command(command, &window),
                None => Ok(()),
            },
            // Exit app on request to close window
            Event::WindowEvent {
                event: WindowEvent::CloseRequested,
                ..
            } => {
                *control_flow = ControlFlow::Exit;
                Ok(())
            }
            // Wait for gpu to finish pending work before closing app
            Event::LoopDestroyed => base_app.wait_for_gpu(),
            _ => Ok(()),
        };

        if let Err(e) = result {
            log::error!("{}", RenderError::runtime(e));
            *control_flow = ControlFlow::ExitWithCode(1);
        }
    });
}

fn create_window(app_name: &str, width: u32, height: u32) -> Result<(Window, EventLoop<()>)> {
    log::debug!("Creating window and event loop");
    let events_loop = EventLoop::new();
    let window = WindowBuilder::new()
        .with_title(RenderMode::default().window_title(app_name))
        .with_inner_size(PhysicalSize::new(width, height))
        .with_resizable(true)
        .build(&events_loop)?;

    Ok((window, events_loop))
}

fn bootstrap<A: App>(window: &Window, app_name: &str) -> Result<(BaseApp<A>, A)> {
    let mut base_app = BaseApp::new(window, app_name)?;
    let app = A::new(&mut base_app)?;
    base_app.begin_first_frame()?;

    Ok((base_app, app))
}

impl<B: App> BaseApp<B> {
    fn new(window: &Window, app_name: &str) -> Result<Self> {
        log::info!("Create application: {}", app_name);

        let context = ContextBuilder::new(window)
            .vulkan_version(VERSION_1_3)
            .app_name(app_name)
            .required_extensions(&REQUIRED_EXTENSIONS)
            .required_device_features(DeviceFeatures {
                ray_tracing_pipeline: true,
                acceleration_structure: true,
                buffer_device_address: true,
                dynamic_rendering: true,
                synchronization2: true,
                timeline_semaphore: true,
            })
            .build()?;
        let context = Arc::new(context);
        log::info!("Tearing supported: {}", tearing_supported(&context));

        let size = window.inner_size();
        let resize = ResizeController::new(size.width, size.height);
        let (width, height) = resize.size();

        let surface = PresentSurface::new(context.clone(), width, height, true)?;

        let allocators = (0..surface.image_count())
            .map(|_| FrameCommands::new(&context))
            .collect::<Result<Vec<_>>>()?;
        let mut frames = FrameRing::new(allocators);
        frames.bind_images(&surface)?;

        let output_image = create_output_image(&context, surface.extent())?;

        Ok(Self {
            phantom: PhantomData,
            render_mode: RenderMode::default(),
            output_image,
            frames,
            surface,
            resize,
            fullscreen: FullscreenController::new(),
            surface_dirty: false,
            app_name: app_name.to_owned(),
            context,
        })
    }

    /// Waits for the setup work recorded by the app, then acquires the image
    /// the first frame renders to.
    fn begin_first_frame(&mut self) -> Result<()> {
        self.context.fence.flush()?;
        self.surface_dirty = !self.surface.acquire_next_image()?;
        self.frames.acquire_current_slot(&self.surface);

        Ok(())
    }

    pub fn wait_for_gpu(&self) -> Result<()> {
        self.context.fence.flush().map(|_| ())
    }

    fn handle_command(&mut self, command: Command, window: &Window) -> Result<()> {
        let rebuild = apply_command(
            command,
            &mut self.render_mode,
            &mut self.fullscreen,
            &mut self.surface,
            window,
            &self.app_name,
        );
        self.surface_dirty |= rebuild;

        Ok(())
    }

    fn resize(&mut self, app: &mut B, width: u32, height: u32) -> Result<()> {
        let context = &self.context;
        let rebuilt = self.resize.resize(
            width,
            height,
            &context.fence,
            &mut self.frames,
            &mut self.surface,
            || FrameCommands::new(context),
        )?;

        match rebuilt {
            Some(acquired) => self.on_surface_rebuilt(app, acquired),
            None => Ok(()),
        }
    }

    fn rebuild_surface(&mut self, app: &mut B) -> Result<()> {
        let context = &self.context;
        let acquired = self.resize.rebuild(
            &context.fence,
            &mut self.frames,
            &mut self.surface,
            || FrameCommands::new(context),
        )?;

        self.on_surface_rebuilt(app, acquired)
    }

    fn on_surface_rebuilt(&mut self, app: &mut B, acquired: bool) -> Result<()> {
        self.surface_dirty = !acquired;
        self.output_image = create_output_image(&self.context, self.surface.extent())?;

        app.on_recreate_swapchain(self)
    }

    /// Returns `false` if nothing was presented.
    fn draw(&mut self, app: &mut B) -> Result<bool> {
        if self.surface_dirty {
            self.rebuild_surface(app)?;
            if self.surface_dirty {
                return Ok(false);
            }
        }

        let index = self.frames.acquire_current_slot(&self.surface);
        self.frames
            .begin_frame(index, &self.context.fence)
            .with_context(|| format!("Failed to begin frame on slot {index}"))?;

        let slot = self.frames.slot(index)?;
        let command_buffer = &slot.allocator().command_buffer;
        let view = slot
            .image()
            .with_context(|| format!("No image bound to frame slot {index}"))?;
        let target = FrameTarget {
            index,
            extent: self.surface.extent(),
        };

        self.record_command_buffer(command_buffer, &target, view, app)?;

        self.context.queue.submit(
            command_buffer,
            Some(SemaphoreSubmitInfo {
                semaphore: self.surface.acquire_semaphore(index)?,
                stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags2::TRANSFER,
            }),
            Some(SemaphoreSubmitInfo {
                semaphore: self.surface.render_finished_semaphore(index)?,
                stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            }),
        )?;

        let out_of_date = self.surface.present(index)?;
        self.frames.end_frame(index, &self.context.fence)?;

        if out_of_date || !self.surface.acquire_next_image()? {
            self.surface_dirty = true;
        }

        Ok(true)
    }

    fn record_command_buffer(
        &self,
        buffer: &CommandBuffer,
        target: &FrameTarget,
        view: &ImageView,
        app: &B,
    ) -> Result<()> {
        let target_image = self.surface.image(target.index)?;
        let output_image = &self.output_image.image;

        buffer.begin(Some(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT))?;

        for step in frame_steps(self.render_mode) {
            match *step {
                Step::Barriers(transitions) => {
                    let barriers = transitions
                        .iter()
                        .map(|t| {
                            let image = match t.image {
                                FrameImage::Output => output_image,
                                FrameImage::Target => target_image,
                            };
                            t.from.barrier(t.to, image)
                        })
                        .collect::<Vec<_>>();
                    buffer.pipeline_image_barriers(&barriers);
                }
                Step::Draw => {
                    buffer.begin_rendering(
                        view,
                        target.extent,
                        vk::AttachmentLoadOp::CLEAR,
                        CLEAR_COLOR,
                    );
                    buffer.set_viewport(target.extent);
                    buffer.set_scissor(target.extent);
                    app.record_raster_commands(self, buffer, target)?;
                    buffer.end_rendering();
                }
                Step::TraceRays => app.record_raytracing_commands(self, buffer, target)?,
                Step::CopyOutputToTarget => {
                    if output_image.format == target_image.format
                        && output_image.extent == target_image.extent
                    {
                        buffer.copy_image(
                            output_image,
                            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                            target_image,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        );
                    } else {
                        buffer.blit_image(
                            output_image,
                            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                            target_image,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        );
                    }
                }
            }
        }

        buffer.end()?;

        Ok(())
    }
}

pub struct ImageAndView {
    pub view: ImageView,
    pub image: Image,
}

/// Storage image for ray tracing output, left as a copy source like it is
/// between frames.
fn create_output_image(context: &Context, extent: vk::Extent2D) -> Result<ImageAndView> {
    let image = context.create_image(
        vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::STORAGE,
        MemoryLocation::GpuOnly,
        OUTPUT_FORMAT,
        extent.width,
        extent.height,
    )?;

    let view = image.create_image_view()?;

    context.execute_one_time_commands(|cmd_buffer| {
        cmd_buffer.pipeline_image_barriers(&[ImageBarrier {
            image: &image,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            src_access_mask: vk::AccessFlags2::NONE,
            dst_access_mask: vk::AccessFlags2::NONE,
            src_stage_mask: vk::PipelineStageFlags2::NONE,
            dst_stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
        }]);
    })?;

    Ok(ImageAndView { view, image })
}
