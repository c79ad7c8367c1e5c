#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    #[default]
    Rasterize,
    RayTrace,
}

impl RenderMode {
    pub fn toggle(self) -> Self {
        match self {
            Self::Rasterize => Self::RayTrace,
            Self::RayTrace => Self::Rasterize,
        }
    }

    pub fn is_ray_tracing(self) -> bool {
        self == Self::RayTrace
    }

    pub fn window_title(self, app_name: &str) -> String {
        let rtx = if self.is_ray_tracing() { "on" } else { "off" };
        format!("{app_name} (RTX: {rtx})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_rasterizing() {
        assert_eq!(RenderMode::default(), RenderMode::Rasterize);
    }

    #[test]
    fn toggle_flips_and_returns() {
        let mode = RenderMode::default().toggle();
        assert!(mode.is_ray_tracing());
        assert_eq!(mode.toggle(), RenderMode::Rasterize);
    }

    #[test]
    fn title_reports_ray_tracing_state() {
        assert_eq!(
            RenderMode::Rasterize.window_title("Hybrid triangle"),
            "Hybrid triangle (RTX: off)"
        );
        assert_eq!(
            RenderMode::RayTrace.window_title("Hybrid triangle"),
            "Hybrid triangle (RTX: on)"
        );
    }
}
