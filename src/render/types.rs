use std::io;
use std::path::PathBuf;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use thiserror::Error;
use vulkano::buffer::AllocateBufferError;
use vulkano::command_buffer::CommandBufferExecError;
use vulkano::format::Format;
use vulkano::image::AllocateImageError;
use vulkano::memory::MemoryPropertyFlags;
use vulkano::sync::HostAccessError;
use vulkano::{LoadingError, Validated, ValidationError, VulkanError};

use super::descriptors::DescriptorError;
use super::layout::LayoutError;

/// Bound on the fence and acquire waits. Exceeding it is treated as a hung
/// device, not retried.
pub const SYNC_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Local workgroup size of the ray-march shader, both axes.
pub const WORKGROUP_SIZE: u32 = 16;

/// Per-frame parameters the compute shader reads. Written wholesale into the
/// current slot's uniform buffer before every submission.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, Pod, Zeroable)]
pub struct RenderParams {
    pub position: [f32; 3],
    pub time: f32,
    pub forward: [f32; 3],
    pub fov: f32,
    pub right: [f32; 3],
    pub _pad0: f32,
    pub up: [f32; 3],
    pub _pad1: f32,
}

impl RenderParams {
    pub fn new(
        position: Vec3,
        forward: Vec3,
        right: Vec3,
        up: Vec3,
        fov: f32,
        time: f32,
    ) -> Self {
        Self {
            position: position.to_array(),
            time,
            forward: forward.to_array(),
            fov,
            right: right.to_array(),
            _pad0: 0.0,
            up: up.to_array(),
            _pad1: 0.0,
        }
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no memory type in mask {mask:#b} satisfies {required:?}")]
    OutOfMemoryType {
        mask: u32,
        required: MemoryPropertyFlags,
    },
    #[error("no suitable physical device found")]
    NoSuitableDevice,
    #[error("window system refused to hand out a surface handle")]
    WindowHandle(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("timed out waiting for {0} after {SYNC_WAIT_TIMEOUT:?}")]
    SyncTimeout(&'static str),
    #[error("device cannot use {0:?} as a storage image")]
    UnsupportedFormat(Format),
    #[error("failed to read shader binary {path}")]
    ShaderRead { path: PathBuf, source: io::Error },
    #[error("shader binary {path} is not valid SPIR-V")]
    BadSpirv { path: PathBuf },
    #[error("shader binary has no `main` entry point")]
    MissingEntryPoint,
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error("failed to load the Vulkan library")]
    Loading(#[from] LoadingError),
    #[error("vulkan call failed")]
    Api(#[from] VulkanError),
    #[error("buffer allocation failed")]
    BufferAlloc(#[from] AllocateBufferError),
    #[error("image allocation failed")]
    ImageAlloc(#[from] AllocateImageError),
    #[error("host access to a mapped buffer failed")]
    HostAccess(#[from] HostAccessError),
    #[error("command buffer submission failed")]
    Exec(#[from] CommandBufferExecError),
    #[error("vulkan validation rejected a call: {0}")]
    Validation(Box<ValidationError>),
}

impl From<Box<ValidationError>> for RenderError {
    fn from(err: Box<ValidationError>) -> Self {
        Self::Validation(err)
    }
}

impl From<Validated<VulkanError>> for RenderError {
    fn from(err: Validated<VulkanError>) -> Self {
        match err {
            Validated::Error(e) => Self::Api(e),
            Validated::ValidationError(e) => Self::Validation(e),
        }
    }
}

impl From<Validated<AllocateBufferError>> for RenderError {
    fn from(err: Validated<AllocateBufferError>) -> Self {
        match err {
            Validated::Error(e) => Self::BufferAlloc(e),
            Validated::ValidationError(e) => Self::Validation(e),
        }
    }
}

impl From<Validated<AllocateImageError>> for RenderError {
    fn from(err: Validated<AllocateImageError>) -> Self {
        match err {
            Validated::Error(e) => Self::ImageAlloc(e),
            Validated::ValidationError(e) => Self::Validation(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotPhase {
    Idle,
    InFlight,
}

/// Round-robin frame-slot bookkeeping. Slot `i = frame mod N`; a slot whose
/// previous submission is still in flight must be retired (its fence waited
/// on) before it may record again, so CPU lead over the GPU is bounded by N.
#[derive(Debug)]
pub(super) struct FrameRing {
    phases: Vec<SlotPhase>,
    frames_rendered: u64,
}

impl FrameRing {
    pub(super) fn new(slot_count: usize) -> Self {
        assert!(slot_count > 0, "a swapchain always has at least one image");
        Self {
            phases: vec![SlotPhase::Idle; slot_count],
            frames_rendered: 0,
        }
    }

    pub(super) fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    /// Slot for the current frame, plus whether its previous work must be
    /// waited on before reuse.
    pub(super) fn begin(&self) -> (usize, bool) {
        let idx = (self.frames_rendered % self.phases.len() as u64) as usize;
        (idx, self.phases[idx] == SlotPhase::InFlight)
    }

    /// Slot the most recent frame ran on, if any. Resources shared by every
    /// frame (the draw image) need each submission ordered after this slot's
    /// work; the current slot's own fence only reaches back N frames.
    pub(super) fn previous_slot(&self) -> Option<usize> {
        if self.frames_rendered == 0 {
            return None;
        }
        Some(((self.frames_rendered - 1) % self.phases.len() as u64) as usize)
    }

    pub(super) fn retire(&mut self, idx: usize) {
        self.phases[idx] = SlotPhase::Idle;
    }

    pub(super) fn submit(&mut self, idx: usize) {
        assert_eq!(
            self.phases[idx],
            SlotPhase::Idle,
            "slot resubmitted without an intervening fence wait"
        );
        self.phases[idx] = SlotPhase::InFlight;
    }

    /// The frame counter is monotonic; it wraps only through the modulo when
    /// indexing slots.
    pub(super) fn advance(&mut self) {
        self.frames_rendered += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_cycle_round_robin() {
        let mut ring = FrameRing::new(2);
        let mut visited = Vec::new();
        for _ in 0..4 {
            let (idx, must_wait) = ring.begin();
            if must_wait {
                ring.retire(idx);
            }
            visited.push(idx);
            ring.submit(idx);
            ring.advance();
        }
        assert_eq!(visited, vec![0, 1, 0, 1]);
        assert_eq!(ring.frames_rendered(), 4);
    }

    #[test]
    fn reused_slot_demands_a_wait() {
        let mut ring = FrameRing::new(2);
        let (first, must_wait) = ring.begin();
        assert_eq!(first, 0);
        assert!(!must_wait, "fresh slot needs no wait");
        ring.submit(first);
        ring.advance();

        ring.submit(ring.begin().0);
        ring.advance();

        // Back at slot 0, whose frame is still in flight.
        let (idx, must_wait) = ring.begin();
        assert_eq!(idx, first);
        assert!(must_wait);
        ring.retire(idx);
        assert!(!ring.begin().1);
    }

    #[test]
    fn ordering_wait_targets_the_frame_just_submitted() {
        let mut ring = FrameRing::new(2);
        assert_eq!(
            ring.previous_slot(),
            None,
            "the first frame has nothing to order after"
        );
        ring.submit(0);
        ring.advance();

        // Frame 1 runs on slot 1, whose own fence is clear; shared images
        // written by frame 0 on slot 0 still demand ordering after it.
        let (idx, must_wait) = ring.begin();
        assert_eq!(idx, 1);
        assert!(!must_wait, "slot 1 was never submitted");
        assert_eq!(ring.previous_slot(), Some(0));
        ring.retire(0);
        ring.submit(idx);
        ring.advance();

        assert_eq!(ring.previous_slot(), Some(1));
    }

    #[test]
    #[should_panic(expected = "intervening fence wait")]
    fn submitting_an_in_flight_slot_panics() {
        let mut ring = FrameRing::new(1);
        ring.submit(0);
        ring.submit(0);
    }

    #[test]
    fn surface_errors_keep_their_cause() {
        use std::error::Error;
        let cause = io::Error::new(io::ErrorKind::Unsupported, "no raw window handle");
        let err = RenderError::WindowHandle(Box::new(cause));
        let source = err.source().expect("underlying failure must survive");
        assert!(source.to_string().contains("raw window handle"));
    }

    #[test]
    fn render_params_layout_is_dense() {
        // The shader reads this as four vec4-aligned rows.
        assert_eq!(std::mem::size_of::<RenderParams>(), 64);
    }
}
