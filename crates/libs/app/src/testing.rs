//! GPU-free stand-ins for the timeline, surface and command allocators so the
//! frame engine's ordering can be checked without a device.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
    time::Duration,
};

use anyhow::Result;
use vulkan::{ash::vk, GpuTimeline};

use crate::{
    fullscreen::{WindowGeometry, WindowRect},
    CommandAllocator, PresentationSurface,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Signal(u64),
    Wait(u64),
    Reset { allocator: usize, completed: u64 },
    Resize(u32, u32),
    Acquire(usize),
    Bind(usize),
    Release(usize),
}

pub type EventLog = Rc<RefCell<Vec<Event>>>;

pub fn event_log() -> EventLog {
    Rc::new(RefCell::new(vec![]))
}

/// A timeline whose GPU catches up only when someone waits on it, or when a
/// test says so.
pub struct SimulatedTimeline {
    next: Cell<u64>,
    completed: Rc<Cell<u64>>,
    log: EventLog,
}

impl SimulatedTimeline {
    pub fn new(log: &EventLog) -> Self {
        Self {
            next: Cell::new(0),
            completed: Rc::new(Cell::new(0)),
            log: log.clone(),
        }
    }

    pub fn complete_all(&self) {
        self.completed.set(self.next.get());
    }

    pub fn last_signaled(&self) -> u64 {
        self.next.get()
    }

    pub fn allocator(&self, id: usize) -> MockAllocator {
        MockAllocator {
            id,
            completed: self.completed.clone(),
            log: self.log.clone(),
        }
    }
}

impl GpuTimeline for SimulatedTimeline {
    fn signal(&self) -> Result<u64> {
        let value = self.next.get() + 1;
        self.next.set(value);
        self.log.borrow_mut().push(Event::Signal(value));
        Ok(value)
    }

    fn completed_value(&self) -> Result<u64> {
        Ok(self.completed.get())
    }

    fn wait(&self, value: u64, _timeout: Option<Duration>) -> Result<bool> {
        if self.completed.get() < value {
            self.log.borrow_mut().push(Event::Wait(value));
            self.completed.set(value);
        }
        Ok(true)
    }
}

pub struct MockAllocator {
    id: usize,
    completed: Rc<Cell<u64>>,
    log: EventLog,
}

impl CommandAllocator for MockAllocator {
    fn reset(&self) -> Result<()> {
        self.log.borrow_mut().push(Event::Reset {
            allocator: self.id,
            completed: self.completed.get(),
        });
        Ok(())
    }
}

/// Image binding that reports when a frame slot lets go of it.
#[derive(Debug)]
pub struct TestBinding {
    pub index: usize,
    log: EventLog,
}

impl Drop for TestBinding {
    fn drop(&mut self) {
        self.log.borrow_mut().push(Event::Release(self.index));
    }
}

pub struct RecordingSurface {
    extent: vk::Extent2D,
    image_count: usize,
    current: usize,
    /// Indices handed out by the next acquisitions, round robin once empty.
    pub acquire_order: VecDeque<usize>,
    /// Image count the surface comes back with after the next resize.
    pub image_count_after_resize: Option<usize>,
    vsync: bool,
    log: EventLog,
}

impl RecordingSurface {
    pub fn new(log: &EventLog, width: u32, height: u32, image_count: usize) -> Self {
        Self {
            extent: vk::Extent2D { width, height },
            image_count,
            current: 0,
            acquire_order: VecDeque::new(),
            image_count_after_resize: None,
            vsync: true,
            log: log.clone(),
        }
    }
}

impl PresentationSurface for RecordingSurface {
    type ImageBinding = TestBinding;

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn image_count(&self) -> usize {
        self.image_count
    }

    fn current_image_index(&self) -> usize {
        self.current
    }

    fn vsync(&self) -> bool {
        self.vsync
    }

    fn set_vsync(&mut self, vsync: bool) {
        self.vsync = vsync;
    }

    fn resize_images(&mut self, width: u32, height: u32) -> Result<()> {
        self.log.borrow_mut().push(Event::Resize(width, height));
        self.extent = vk::Extent2D { width, height };
        if let Some(count) = self.image_count_after_resize.take() {
            self.image_count = count;
        }
        Ok(())
    }

    fn acquire_next_image(&mut self) -> Result<bool> {
        self.current = self
            .acquire_order
            .pop_front()
            .unwrap_or((self.current + 1) % self.image_count);
        self.log.borrow_mut().push(Event::Acquire(self.current));
        Ok(true)
    }

    fn bind_image(&self, index: usize) -> Result<Self::ImageBinding> {
        self.log.borrow_mut().push(Event::Bind(index));
        Ok(TestBinding {
            index,
            log: self.log.clone(),
        })
    }
}

#[derive(Debug, Default)]
pub struct FakeWindow {
    pub rect: Cell<WindowRect>,
    pub monitor: Option<WindowRect>,
    pub borderless: Cell<bool>,
    pub geometry_changes: Cell<usize>,
    pub title: RefCell<String>,
}

impl WindowGeometry for FakeWindow {
    fn window_rect(&self) -> WindowRect {
        self.rect.get()
    }

    fn monitor_rect(&self) -> Option<WindowRect> {
        self.monitor
    }

    fn set_borderless(&self, borderless: bool) {
        self.borderless.set(borderless);
    }

    fn set_window_rect(&self, rect: WindowRect) {
        self.geometry_changes.set(self.geometry_changes.get() + 1);
        self.rect.set(rect);
    }

    fn set_title(&self, title: &str) {
        *self.title.borrow_mut() = title.to_owned();
    }
}
