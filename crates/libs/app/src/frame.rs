use anyhow::{bail, ensure, Context as _, Result};
use vulkan::{ash::vk, CommandBuffer, CommandPool, Context, GpuTimeline};

use crate::PresentationSurface;

/// Something that hands out command memory for one frame and can take it all
/// back at once.
pub trait CommandAllocator {
    fn reset(&self) -> Result<()>;
}

/// A transient command pool with the single primary buffer recorded each frame.
pub struct FrameCommands {
    pub command_buffer: CommandBuffer,
    pool: CommandPool,
}

impl FrameCommands {
    pub fn new(context: &Context) -> Result<Self> {
        let pool = context.create_command_pool(
            context.queue_family,
            Some(vk::CommandPoolCreateFlags::TRANSIENT),
        )?;
        let command_buffer = pool.allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)?;

        Ok(Self {
            command_buffer,
            pool,
        })
    }
}

impl CommandAllocator for FrameCommands {
    fn reset(&self) -> Result<()> {
        self.pool.reset()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSlotState {
    Idle,
    Recording,
    Submitted,
}

pub struct FrameSlot<A, B> {
    allocator: A,
    image: Option<B>,
    fence_value: u64,
    state: FrameSlotState,
}

impl<A, B> FrameSlot<A, B> {
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// The presentation image bound to this slot, `None` while the surface is
    /// being rebuilt.
    pub fn image(&self) -> Option<&B> {
        self.image.as_ref()
    }

    /// Timeline value that marks the end of the last work submitted from this slot.
    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }
}

/// One slot per presentation image. A slot's allocator is only reset once the
/// GPU is done with everything that was recorded from it.
pub struct FrameRing<A, B> {
    slots: Vec<FrameSlot<A, B>>,
    current: usize,
}

impl<A: CommandAllocator, B> FrameRing<A, B> {
    pub fn new(allocators: impl IntoIterator<Item = A>) -> Self {
        let slots = allocators
            .into_iter()
            .map(|allocator| FrameSlot {
                allocator,
                image: None,
                fence_value: 0,
                state: FrameSlotState::Idle,
            })
            .collect();

        Self { slots, current: 0 }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn slot(&self, index: usize) -> Result<&FrameSlot<A, B>> {
        self.slots
            .get(index)
            .with_context(|| format!("No frame slot {index}, ring has {}", self.slots.len()))
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut FrameSlot<A, B>> {
        let len = self.slots.len();
        self.slots
            .get_mut(index)
            .with_context(|| format!("No frame slot {index}, ring has {len}"))
    }

    /// The slot to record into is the one matching the surface's current image.
    pub fn acquire_current_slot<S: PresentationSurface>(&mut self, surface: &S) -> usize {
        self.current = surface.current_image_index();
        self.current
    }

    /// Blocks until the slot's previous work has retired, then recycles its
    /// command memory.
    pub fn begin_frame<T: GpuTimeline + ?Sized>(&mut self, index: usize, timeline: &T) -> Result<()> {
        let slot = self.slot_mut(index)?;
        if slot.state == FrameSlotState::Recording {
            bail!("Frame slot {index} is already recording");
        }

        timeline.wait(slot.fence_value, None)?;
        slot.allocator.reset()?;
        slot.state = FrameSlotState::Recording;

        Ok(())
    }

    /// Call once the slot's work has been submitted. Returns the timeline value
    /// the slot now waits on.
    pub fn end_frame<T: GpuTimeline + ?Sized>(&mut self, index: usize, timeline: &T) -> Result<u64> {
        let slot = self.slot_mut(index)?;
        ensure!(
            slot.state == FrameSlotState::Recording,
            "Frame slot {index} ended without being started"
        );

        let value = timeline.signal()?;
        slot.fence_value = value;
        slot.state = FrameSlotState::Submitted;

        Ok(value)
    }

    /// Marks every submitted slot whose work has completed as idle.
    pub fn retire<T: GpuTimeline + ?Sized>(&mut self, timeline: &T) -> Result<()> {
        let completed = timeline.completed_value()?;
        for slot in &mut self.slots {
            if slot.state == FrameSlotState::Submitted && slot.fence_value <= completed {
                slot.state = FrameSlotState::Idle;
            }
        }

        Ok(())
    }

    pub fn slot_state<T: GpuTimeline + ?Sized>(
        &mut self,
        index: usize,
        timeline: &T,
    ) -> Result<FrameSlotState> {
        self.retire(timeline)?;
        Ok(self.slot(index)?.state)
    }

    /// Drops every slot's image binding. Must happen before the surface
    /// recreates its images.
    pub fn release_images(&mut self) {
        for slot in &mut self.slots {
            slot.image = None;
        }
    }

    /// Grows or shrinks the ring to `count` slots. New slots get their
    /// allocator from `new_allocator`. Every slot must be idle.
    pub fn resize_slots<F>(&mut self, count: usize, mut new_allocator: F) -> Result<()>
    where
        F: FnMut() -> Result<A>,
    {
        if let Some(index) = self
            .slots
            .iter()
            .position(|slot| slot.state != FrameSlotState::Idle)
        {
            bail!("Cannot resize the frame ring while slot {index} is in flight");
        }

        if count != self.slots.len() {
            log::debug!("Frame ring goes from {} to {count} slots", self.slots.len());
        }

        self.slots.truncate(count);
        while self.slots.len() < count {
            self.slots.push(FrameSlot {
                allocator: new_allocator()?,
                image: None,
                fence_value: 0,
                state: FrameSlotState::Idle,
            });
        }
        self.current = self.current.min(count.saturating_sub(1));

        Ok(())
    }

    pub fn bind_images<S>(&mut self, surface: &S) -> Result<()>
    where
        S: PresentationSurface<ImageBinding = B>,
    {
        ensure!(
            surface.image_count() == self.slots.len(),
            "Surface has {} images but the frame ring has {} slots",
            surface.image_count(),
            self.slots.len()
        );

        for (index, slot) in self.slots.iter_mut().enumerate() {
            slot.image = Some(surface.bind_image(index)?);
        }

        Ok(())
    }
}
