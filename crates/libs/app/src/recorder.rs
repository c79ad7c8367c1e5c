use vulkan::{ash::vk, Image, ImageBarrier};

use crate::RenderMode;

/// What a frame image is being used for, and therefore which layout, access
/// and pipeline stage a barrier needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Present,
    RenderTarget,
    CopyDest,
    CopySource,
    UnorderedAccess,
}

impl ResourceState {
    fn layout(self) -> vk::ImageLayout {
        match self {
            Self::Present => vk::ImageLayout::PRESENT_SRC_KHR,
            Self::RenderTarget => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            Self::CopyDest => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            Self::CopySource => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            Self::UnorderedAccess => vk::ImageLayout::GENERAL,
        }
    }

    fn access(self) -> vk::AccessFlags2 {
        match self {
            Self::Present => vk::AccessFlags2::NONE,
            Self::RenderTarget => vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            Self::CopyDest => vk::AccessFlags2::TRANSFER_WRITE,
            Self::CopySource => vk::AccessFlags2::TRANSFER_READ,
            Self::UnorderedAccess => vk::AccessFlags2::SHADER_WRITE,
        }
    }

    fn stage(self) -> vk::PipelineStageFlags2 {
        match self {
            Self::Present => vk::PipelineStageFlags2::NONE,
            Self::RenderTarget => vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            Self::CopyDest | Self::CopySource => vk::PipelineStageFlags2::TRANSFER,
            Self::UnorderedAccess => vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        }
    }

    /// Leaving `Present` discards the previous contents. The barrier then
    /// starts at the destination stage so it chains with the acquire
    /// semaphore wait.
    pub fn barrier(self, to: ResourceState, image: &Image) -> ImageBarrier {
        let (old_layout, src_stage_mask) = match self {
            Self::Present => (vk::ImageLayout::UNDEFINED, to.stage()),
            _ => (self.layout(), self.stage()),
        };

        ImageBarrier {
            image,
            old_layout,
            new_layout: to.layout(),
            src_access_mask: self.access(),
            dst_access_mask: to.access(),
            src_stage_mask,
            dst_stage_mask: to.stage(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameImage {
    /// The ray tracing output, kept as a copy source between frames.
    Output,
    /// The presentation image of the current slot.
    Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub image: FrameImage,
    pub from: ResourceState,
    pub to: ResourceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Barriers(&'static [Transition]),
    Draw,
    TraceRays,
    CopyOutputToTarget,
}

macro_rules! transition {
    ($image:ident, $from:ident, $to:ident) => {
        Transition {
            image: FrameImage::$image,
            from: ResourceState::$from,
            to: ResourceState::$to,
        }
    };
}

const RASTER_STEPS: &[Step] = &[
    Step::Barriers(&[transition!(Target, Present, RenderTarget)]),
    Step::Draw,
    Step::Barriers(&[transition!(Target, RenderTarget, Present)]),
];

const RAY_TRACE_STEPS: &[Step] = &[
    Step::Barriers(&[transition!(Output, CopySource, UnorderedAccess)]),
    Step::TraceRays,
    Step::Barriers(&[
        transition!(Output, UnorderedAccess, CopySource),
        transition!(Target, Present, CopyDest),
    ]),
    Step::CopyOutputToTarget,
    Step::Barriers(&[transition!(Target, CopyDest, RenderTarget)]),
    Step::Barriers(&[transition!(Target, RenderTarget, Present)]),
];

/// The commands and layout transitions recorded for one frame.
pub fn frame_steps(mode: RenderMode) -> &'static [Step] {
    match mode {
        RenderMode::Rasterize => RASTER_STEPS,
        RenderMode::RayTrace => RAY_TRACE_STEPS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use FrameImage::*;
    use ResourceState::*;

    fn states_of(mode: RenderMode, image: FrameImage) -> Vec<(ResourceState, ResourceState)> {
        frame_steps(mode)
            .iter()
            .filter_map(|step| match step {
                Step::Barriers(transitions) => Some(*transitions),
                _ => None,
            })
            .flatten()
            .filter(|t| t.image == image)
            .map(|t| (t.from, t.to))
            .collect()
    }

    fn assert_chained(mode: RenderMode, image: FrameImage, resting: ResourceState) {
        let states = states_of(mode, image);
        if states.is_empty() {
            return;
        }

        assert_eq!(states.first().unwrap().0, resting);
        assert_eq!(states.last().unwrap().1, resting);
        assert!(states.windows(2).all(|w| w[0].1 == w[1].0));
    }

    #[test]
    fn target_starts_and_ends_presentable() {
        assert_chained(RenderMode::Rasterize, Target, Present);
        assert_chained(RenderMode::RayTrace, Target, Present);
    }

    #[test]
    fn output_returns_to_copy_source() {
        assert_chained(RenderMode::RayTrace, Output, CopySource);
    }

    #[test]
    fn raster_frames_leave_the_output_alone() {
        assert!(states_of(RenderMode::Rasterize, Output).is_empty());
        assert!(!frame_steps(RenderMode::Rasterize).contains(&Step::TraceRays));
    }

    #[test]
    fn ray_trace_path_order() {
        assert_eq!(
            states_of(RenderMode::RayTrace, Target),
            vec![
                (Present, CopyDest),
                (CopyDest, RenderTarget),
                (RenderTarget, Present)
            ]
        );
        assert_eq!(
            states_of(RenderMode::RayTrace, Output),
            vec![(CopySource, UnorderedAccess), (UnorderedAccess, CopySource)]
        );
    }

    #[test]
    fn draw_happens_in_render_target_state() {
        let steps = frame_steps(RenderMode::Rasterize);
        let draw = steps.iter().position(|s| *s == Step::Draw).unwrap();

        match steps[draw - 1] {
            Step::Barriers(transitions) => assert_eq!(transitions[0].to, RenderTarget),
            other => panic!("Unexpected step before draw: {other:?}"),
        }
    }
}
