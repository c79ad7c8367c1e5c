use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use ash::vk;

use crate::{device::Device, error::Error, Context, Queue};

pub struct Semaphore {
    device: Arc<Device>,
    pub(crate) inner: vk::Semaphore,
}

impl Semaphore {
    pub(crate) fn new(device: Arc<Device>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let inner = unsafe { device.inner.create_semaphore(&semaphore_info, None)? };

        Ok(Self { device, inner })
    }
}

impl Context {
    pub fn create_semaphore(&self) -> Result<Semaphore> {
        Semaphore::new(self.device.clone())
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.inner.destroy_semaphore(self.inner, None);
        }
    }
}

/// A monotonic GPU completion counter.
///
/// `signal` hands out strictly increasing values and asks the GPU to report
/// each one once all work submitted before it has finished. Waiting for a
/// value that has already completed returns immediately.
pub trait GpuTimeline {
    fn signal(&self) -> Result<u64>;

    fn completed_value(&self) -> Result<u64>;

    /// Returns `false` if the timeout elapsed before `value` completed.
    fn wait(&self, value: u64, timeout: Option<Duration>) -> Result<bool>;

    fn flush(&self) -> Result<u64> {
        let value = self.signal()?;
        self.wait(value, None)?;
        Ok(value)
    }
}

/// Host side of the timeline: the last value handed out.
#[derive(Debug, Default)]
pub struct TimelineCounter(AtomicU64);

impl TimelineCounter {
    pub fn new(initial: u64) -> Self {
        Self(AtomicU64::new(initial))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn last(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct TimelineFence {
    device: Arc<Device>,
    queue: Queue,
    counter: TimelineCounter,
    pub(crate) inner: vk::Semaphore,
}

impl TimelineFence {
    pub(crate) fn new(device: Arc<Device>, queue: Queue) -> Result<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let semaphore_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
        let inner = unsafe { device.inner.create_semaphore(&semaphore_info, None)? };

        Ok(Self {
            device,
            queue,
            counter: TimelineCounter::new(0),
            inner,
        })
    }
}

impl GpuTimeline for TimelineFence {
    fn signal(&self) -> Result<u64> {
        let value = self.counter.next();

        let signal_info = vk::SemaphoreSubmitInfo::builder()
            .semaphore(self.inner)
            .value(value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS);
        let submit_info =
            vk::SubmitInfo2::builder().signal_semaphore_infos(std::slice::from_ref(&signal_info));

        unsafe {
            self.device
                .inner
                .queue_submit2(
                    self.queue.inner,
                    std::slice::from_ref(&submit_info),
                    vk::Fence::null(),
                )
                .map_err(|e| Error::from_wait(e, value))?
        };

        Ok(value)
    }

    fn completed_value(&self) -> Result<u64> {
        let value = unsafe {
            self.device
                .inner
                .get_semaphore_counter_value(self.inner)
                .map_err(|e| Error::from_wait(e, self.counter.last()))?
        };

        Ok(value)
    }

    fn wait(&self, value: u64, timeout: Option<Duration>) -> Result<bool> {
        if self.completed_value()? >= value {
            return Ok(true);
        }

        let timeout = timeout.map_or(u64::MAX, |t| t.as_nanos().min(u64::MAX as u128) as u64);
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(std::slice::from_ref(&self.inner))
            .values(std::slice::from_ref(&value));

        match unsafe { self.device.inner.wait_semaphores(&wait_info, timeout) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(Error::from_wait(e, value).into()),
        }
    }
}

impl Drop for TimelineFence {
    fn drop(&mut self) {
        unsafe {
            self.device.inner.destroy_semaphore(self.inner, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_values_strictly_increase() {
        let counter = TimelineCounter::default();
        let values = (0..16).map(|_| counter.next()).collect::<Vec<_>>();

        assert_eq!(values[0], 1);
        assert!(values.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(counter.last(), 16);
    }

    #[test]
    fn counter_resumes_from_initial_value() {
        let counter = TimelineCounter::new(41);
        assert_eq!(counter.next(), 42);
    }
}
