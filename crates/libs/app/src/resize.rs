use anyhow::Result;
use vulkan::GpuTimeline;

use crate::{CommandAllocator, FrameRing, PresentationSurface};

/// Never hand a zero sized extent to the surface, minimized windows report one.
pub fn clamp_extent(width: u32, height: u32) -> (u32, u32) {
    (width.max(1), height.max(1))
}

/// Owns the current surface size and rebuilds everything that depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeController {
    width: u32,
    height: u32,
}

impl ResizeController {
    pub fn new(width: u32, height: u32) -> Self {
        let (width, height) = clamp_extent(width, height);
        Self { width, height }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Returns `Ok(None)` if the size did not change, otherwise whether an
    /// image could be acquired from the rebuilt surface.
    pub fn resize<T, A, S, F>(
        &mut self,
        width: u32,
        height: u32,
        timeline: &T,
        frames: &mut FrameRing<A, S::ImageBinding>,
        surface: &mut S,
        new_allocator: F,
    ) -> Result<Option<bool>>
    where
        T: GpuTimeline + ?Sized,
        A: CommandAllocator,
        S: PresentationSurface,
        F: FnMut() -> Result<A>,
    {
        let (width, height) = clamp_extent(width, height);
        if (width, height) == (self.width, self.height) {
            return Ok(None);
        }

        self.width = width;
        self.height = height;
        self.rebuild(timeline, frames, surface, new_allocator).map(Some)
    }

    /// Rebuilds the surface at the current size, e.g. after a present mode
    /// change or when the surface went out of date.
    ///
    /// The surface may come back with a different number of images, in which
    /// case the ring is resized to match using `new_allocator` for new slots.
    ///
    /// Returns whether an image could be acquired afterwards.
    pub fn rebuild<T, A, S, F>(
        &self,
        timeline: &T,
        frames: &mut FrameRing<A, S::ImageBinding>,
        surface: &mut S,
        new_allocator: F,
    ) -> Result<bool>
    where
        T: GpuTimeline + ?Sized,
        A: CommandAllocator,
        S: PresentationSurface,
        F: FnMut() -> Result<A>,
    {
        log::debug!("Rebuilding surface at {}x{}", self.width, self.height);

        timeline.flush()?;
        frames.retire(timeline)?;
        frames.release_images();

        surface.resize_images(self.width, self.height)?;
        frames.resize_slots(surface.image_count(), new_allocator)?;

        let acquired = surface.acquire_next_image()?;
        frames.acquire_current_slot(surface);
        frames.bind_images(surface)?;

        Ok(acquired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{testing::*, FrameSlotState};

    struct Harness {
        log: EventLog,
        timeline: SimulatedTimeline,
        surface: RecordingSurface,
        frames: FrameRing<MockAllocator, TestBinding>,
        controller: ResizeController,
    }

    fn harness() -> Harness {
        let log = event_log();
        let timeline = SimulatedTimeline::new(&log);
        let surface = RecordingSurface::new(&log, 1280, 720, 3);
        let mut frames = FrameRing::new((0..3).map(|id| timeline.allocator(id)));
        frames.bind_images(&surface).unwrap();
        log.borrow_mut().clear();

        Harness {
            log,
            timeline,
            surface,
            frames,
            controller: ResizeController::new(1280, 720),
        }
    }

    impl Harness {
        fn resize(&mut self, width: u32, height: u32) -> Option<bool> {
            let timeline = &self.timeline;
            let mut next_id = self.frames.len();
            self.controller
                .resize(
                    width,
                    height,
                    timeline,
                    &mut self.frames,
                    &mut self.surface,
                    || {
                        next_id += 1;
                        Ok(timeline.allocator(next_id - 1))
                    },
                )
                .unwrap()
        }

        fn rebuild(&mut self) -> bool {
            let timeline = &self.timeline;
            self.controller
                .rebuild(timeline, &mut self.frames, &mut self.surface, || {
                    Ok(timeline.allocator(usize::MAX))
                })
                .unwrap()
        }
    }

    #[test]
    fn resize_flushes_releases_then_rebuilds() {
        let mut h = harness();

        assert_eq!(h.resize(800, 600), Some(true));

        assert_eq!(
            *h.log.borrow(),
            vec![
                Event::Signal(1),
                Event::Wait(1),
                Event::Release(0),
                Event::Release(1),
                Event::Release(2),
                Event::Resize(800, 600),
                Event::Acquire(1),
                Event::Bind(0),
                Event::Bind(1),
                Event::Bind(2),
            ]
        );
        assert_eq!(h.frames.current(), 1);
    }

    #[test]
    fn same_size_is_a_no_op() {
        let mut h = harness();

        assert_eq!(h.resize(1280, 720), None);
        assert!(h.log.borrow().is_empty());
    }

    #[test]
    fn zero_size_is_clamped_to_one() {
        let mut h = harness();

        h.resize(0, 0);

        assert_eq!(h.controller.size(), (1, 1));
        assert!(h.log.borrow().contains(&Event::Resize(1, 1)));
    }

    #[test]
    fn rebuild_waits_for_in_flight_frames() {
        let mut h = harness();
        for index in 0..3 {
            h.frames.begin_frame(index, &h.timeline).unwrap();
            h.frames.end_frame(index, &h.timeline).unwrap();
        }

        h.rebuild();

        for index in 0..3 {
            assert_eq!(
                h.frames.slot_state(index, &h.timeline).unwrap(),
                FrameSlotState::Idle
            );
        }
        let resized_at = h
            .log
            .borrow()
            .iter()
            .position(|e| matches!(e, Event::Resize(..)))
            .unwrap();
        let waited_at = h
            .log
            .borrow()
            .iter()
            .position(|e| *e == Event::Wait(4))
            .unwrap();
        assert!(waited_at < resized_at);
    }

    #[test]
    fn rebuild_keeps_size() {
        let mut h = harness();

        h.rebuild();

        assert_eq!(h.controller.size(), (1280, 720));
        assert!(h.log.borrow().contains(&Event::Resize(1280, 720)));
    }

    #[test]
    fn resize_follows_a_growing_image_count() {
        let mut h = harness();
        h.surface.image_count_after_resize = Some(4);

        assert_eq!(h.resize(800, 600), Some(true));

        assert_eq!(h.frames.len(), 4);
        for index in 0..4 {
            assert_eq!(h.frames.slot(index).unwrap().image().unwrap().index, index);
        }
        assert!(h.log.borrow().contains(&Event::Bind(3)));
    }

    #[test]
    fn new_slots_record_like_the_old_ones() {
        let mut h = harness();
        h.surface.image_count_after_resize = Some(4);
        h.resize(800, 600);
        h.log.borrow_mut().clear();

        h.frames.begin_frame(3, &h.timeline).unwrap();
        h.frames.end_frame(3, &h.timeline).unwrap();

        assert_eq!(
            *h.log.borrow(),
            vec![
                Event::Reset {
                    allocator: 3,
                    completed: 1
                },
                Event::Signal(2),
            ]
        );
    }

    #[test]
    fn rebuild_follows_a_shrinking_image_count() {
        let mut h = harness();
        h.surface.image_count_after_resize = Some(2);

        h.rebuild();

        assert_eq!(h.frames.len(), 2);
        assert!(h.frames.current() < 2);
        assert!(!h.log.borrow().contains(&Event::Bind(2)));
    }
}
