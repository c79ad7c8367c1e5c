use winit::{
    dpi::{PhysicalPosition, PhysicalSize},
    window::Window,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WindowRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// The bits of a window key commands touch.
pub trait WindowGeometry {
    fn window_rect(&self) -> WindowRect;

    /// Bounds of the monitor the window is on, if it can be found.
    fn monitor_rect(&self) -> Option<WindowRect>;

    fn set_borderless(&self, borderless: bool);

    fn set_window_rect(&self, rect: WindowRect);

    fn set_title(&self, title: &str);
}

impl WindowGeometry for Window {
    fn window_rect(&self) -> WindowRect {
        let position = self.outer_position().unwrap_or_default();
        let size = self.inner_size();

        WindowRect {
            x: position.x,
            y: position.y,
            width: size.width,
            height: size.height,
        }
    }

    fn monitor_rect(&self) -> Option<WindowRect> {
        self.current_monitor().map(|monitor| {
            let position = monitor.position();
            let size = monitor.size();

            WindowRect {
                x: position.x,
                y: position.y,
                width: size.width,
                height: size.height,
            }
        })
    }

    fn set_borderless(&self, borderless: bool) {
        self.set_decorations(!borderless);
    }

    fn set_window_rect(&self, rect: WindowRect) {
        self.set_outer_position(PhysicalPosition::new(rect.x, rect.y));
        self.set_inner_size(PhysicalSize::new(rect.width, rect.height));
    }

    fn set_title(&self, title: &str) {
        Window::set_title(self, title);
    }
}

/// Borderless fullscreen over the current monitor. The window rectangle is
/// remembered on the way in and restored on the way out.
#[derive(Debug, Default)]
pub struct FullscreenController {
    saved: Option<WindowRect>,
}

impl FullscreenController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fullscreen(&self) -> bool {
        self.saved.is_some()
    }

    pub fn set_fullscreen<W: WindowGeometry + ?Sized>(&mut self, window: &W, fullscreen: bool) {
        if fullscreen == self.is_fullscreen() {
            return;
        }

        if fullscreen {
            let Some(monitor) = window.monitor_rect() else {
                log::warn!("No monitor found for the window, staying windowed");
                return;
            };
            self.saved = Some(window.window_rect());
            window.set_borderless(true);
            window.set_window_rect(monitor);
        } else if let Some(saved) = self.saved.take() {
            window.set_borderless(false);
            window.set_window_rect(saved);
        }
    }

    pub fn toggle<W: WindowGeometry + ?Sized>(&mut self, window: &W) {
        self.set_fullscreen(window, !self.is_fullscreen());
    }
}
