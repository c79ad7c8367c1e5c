use std::time::Duration;

#[derive(Debug, Default)]
pub struct FrameStats {
    pub frame_time: Duration,
    pub total_frame_count: u64,
    pub frame_count: u32,
    pub fps_counter: u32,
    timer: Duration,
}

impl FrameStats {
    const ONE_SEC: Duration = Duration::from_secs(1);

    pub fn set_frame_time(&mut self, frame_time: Duration) {
        self.frame_time = frame_time;
    }

    /// Counts one presented frame. Returns the frame rate each time a full
    /// second has elapsed.
    pub fn tick(&mut self) -> Option<u32> {
        self.total_frame_count += 1;
        self.frame_count += 1;
        self.timer += self.frame_time;

        // reset counter if a sec has passed
        if self.timer >= FrameStats::ONE_SEC {
            self.fps_counter = self.frame_count;
            self.frame_count = 0;
            self.timer -= FrameStats::ONE_SEC;
            return Some(self.fps_counter);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_once_per_second() {
        let mut stats = FrameStats::default();
        stats.set_frame_time(Duration::from_millis(10));

        let reports = (0..250).filter_map(|_| stats.tick()).collect::<Vec<_>>();

        assert_eq!(reports, vec![100, 100]);
        assert_eq!(stats.total_frame_count, 250);
        assert_eq!(stats.frame_count, 50);
    }

    #[test]
    fn slow_frames_report_low_rates() {
        let mut stats = FrameStats::default();
        stats.set_frame_time(Duration::from_millis(600));

        assert_eq!(stats.tick(), None);
        assert_eq!(stats.tick(), Some(2));
        assert_eq!(stats.tick(), None);
    }
}
