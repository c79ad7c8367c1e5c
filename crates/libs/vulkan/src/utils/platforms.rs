use std::os::raw::c_char;

use anyhow::Result;
use ash::{extensions::ext::DebugUtils, vk, Entry, Instance};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use winit::window::Window;

/// Instance extensions needed to present to `window`, plus debug utils.
pub fn required_extension_names(window: &Window) -> Result<Vec<*const c_char>> {
    let mut names =
        ash_window::enumerate_required_extensions(window.raw_display_handle())?.to_vec();
    names.push(DebugUtils::name().as_ptr());

    Ok(names)
}

pub(crate) unsafe fn create_surface(
    entry: &Entry,
    instance: &Instance,
    window: &Window,
) -> Result<vk::SurfaceKHR> {
    Ok(ash_window::create_surface(
        entry,
        instance,
        window.raw_display_handle(),
        window.raw_window_handle(),
        None,
    )?)
}
