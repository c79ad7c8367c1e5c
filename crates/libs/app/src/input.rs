use winit::event::VirtualKeyCode;

use crate::{FullscreenController, PresentationSurface, RenderMode, WindowGeometry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ToggleVSync,
    ToggleRayTracing,
    ToggleFullscreen,
    Quit,
}

impl Command {
    /// Maps a key press to a command. `alt` is whether Alt was held.
    pub fn from_key(key: VirtualKeyCode, alt: bool) -> Option<Self> {
        match key {
            VirtualKeyCode::V => Some(Self::ToggleVSync),
            VirtualKeyCode::Space => Some(Self::ToggleRayTracing),
            VirtualKeyCode::Escape => Some(Self::Quit),
            VirtualKeyCode::Return if alt => Some(Self::ToggleFullscreen),
            VirtualKeyCode::F11 => Some(Self::ToggleFullscreen),
            _ => None,
        }
    }
}

/// Applies a key command other than `Quit`. Returns `true` if the surface
/// must be rebuilt before the next frame.
pub fn apply_command<S, W>(
    command: Command,
    render_mode: &mut RenderMode,
    fullscreen: &mut FullscreenController,
    surface: &mut S,
    window: &W,
    app_name: &str,
) -> bool
where
    S: PresentationSurface,
    W: WindowGeometry + ?Sized,
{
    match command {
        Command::ToggleVSync => {
            let vsync = !surface.vsync();
            log::info!("VSync {}", if vsync { "on" } else { "off" });
            surface.set_vsync(vsync);
            true
        }
        Command::ToggleRayTracing => {
            *render_mode = render_mode.toggle();
            window.set_title(&render_mode.window_title(app_name));
            false
        }
        Command::ToggleFullscreen => {
            fullscreen.toggle(window);
            false
        }
        Command::Quit => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{testing::*, WindowRect};

    struct Frontend {
        log: EventLog,
        surface: RecordingSurface,
        window: FakeWindow,
        render_mode: RenderMode,
        fullscreen: FullscreenController,
    }

    fn frontend() -> Frontend {
        let log = event_log();
        let mut surface = RecordingSurface::new(&log, 1280, 720, 3);
        surface.acquire_next_image().unwrap();
        log.borrow_mut().clear();

        Frontend {
            log,
            surface,
            window: FakeWindow::default(),
            render_mode: RenderMode::default(),
            fullscreen: FullscreenController::new(),
        }
    }

    impl Frontend {
        fn apply(&mut self, command: Command) -> bool {
            apply_command(
                command,
                &mut self.render_mode,
                &mut self.fullscreen,
                &mut self.surface,
                &self.window,
                "Hybrid triangle",
            )
        }
    }

    #[test]
    fn keys_map_to_commands() {
        assert_eq!(
            Command::from_key(VirtualKeyCode::V, false),
            Some(Command::ToggleVSync)
        );
        assert_eq!(
            Command::from_key(VirtualKeyCode::Space, false),
            Some(Command::ToggleRayTracing)
        );
        assert_eq!(
            Command::from_key(VirtualKeyCode::Escape, false),
            Some(Command::Quit)
        );
        assert_eq!(
            Command::from_key(VirtualKeyCode::F11, false),
            Some(Command::ToggleFullscreen)
        );
    }

    #[test]
    fn enter_toggles_fullscreen_only_with_alt() {
        assert_eq!(
            Command::from_key(VirtualKeyCode::Return, true),
            Some(Command::ToggleFullscreen)
        );
        assert_eq!(Command::from_key(VirtualKeyCode::Return, false), None);
    }

    #[test]
    fn other_keys_are_ignored() {
        assert_eq!(Command::from_key(VirtualKeyCode::A, false), None);
        assert_eq!(Command::from_key(VirtualKeyCode::R, true), None);
    }

    #[test]
    fn ray_tracing_toggle_keeps_surface_image_and_extent() {
        let mut f = frontend();
        let index = f.surface.current_image_index();

        assert!(!f.apply(Command::ToggleRayTracing));
        assert_eq!(f.render_mode, RenderMode::RayTrace);
        assert_eq!(*f.window.title.borrow(), "Hybrid triangle (RTX: on)");

        assert!(!f.apply(Command::ToggleRayTracing));
        assert_eq!(f.render_mode, RenderMode::Rasterize);
        assert_eq!(*f.window.title.borrow(), "Hybrid triangle (RTX: off)");

        assert_eq!(f.surface.current_image_index(), index);
        assert_eq!(f.surface.extent().width, 1280);
        assert_eq!(f.surface.extent().height, 720);
        assert!(f.surface.vsync());
        assert!(f.log.borrow().is_empty());
    }

    #[test]
    fn vsync_toggle_asks_for_a_rebuild() {
        let mut f = frontend();

        assert!(f.apply(Command::ToggleVSync));
        assert!(!f.surface.vsync());
        assert!(f.apply(Command::ToggleVSync));
        assert!(f.surface.vsync());
        assert_eq!(f.render_mode, RenderMode::Rasterize);
    }

    #[test]
    fn fullscreen_toggle_only_touches_the_window() {
        let mut f = frontend();
        f.window.monitor = Some(WindowRect {
            x: 0,
            y: 0,
            width: 1920,
            height: 1080,
        });

        assert!(!f.apply(Command::ToggleFullscreen));

        assert!(f.fullscreen.is_fullscreen());
        assert!(f.window.borderless.get());
        assert_eq!(f.surface.extent().width, 1280);
        assert!(f.log.borrow().is_empty());
    }
}
