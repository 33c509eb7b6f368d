//! Image layout state machine.
//!
//! Vulkan images move through usage states (writable, copy source,
//! presentable) and every operation must see the matching layout. Rather
//! than trusting each caller to pass the image's current layout, every
//! [`ImageLifecycle`] owns it, rejects invalid transitions outright, and
//! reports the barrier masks a transition implies. Barrier emission is
//! handled by vulkano's command-buffer synchronization; this layer is the
//! validation on top of it.

use log::{debug, warn};
use thiserror::Error;
use vulkano::sync::{AccessFlags, PipelineStages};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLayoutState {
    /// Initial state only; contents undefined.
    Undefined,
    /// Destination of a transfer (buffer-to-image copy, blit target).
    TransferDst,
    /// Shader read/write through a storage binding.
    General,
    /// Source of a transfer (blit source).
    TransferSrc,
    /// Required immediately before the surface present call.
    Present,
}

impl std::fmt::Display for ImageLayoutState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Undefined => "UNDEFINED",
            Self::TransferDst => "TRANSFER_DST",
            Self::General => "GENERAL",
            Self::TransferSrc => "TRANSFER_SRC",
            Self::Present => "PRESENT",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("{image}: illegal layout transition {from} -> {to}")]
    InvalidTransition {
        image: &'static str,
        from: ImageLayoutState,
        to: ImageLayoutState,
    },
    #[error("{image}: expected layout {expected}, found {actual}")]
    WrongLayout {
        image: &'static str,
        expected: ImageLayoutState,
        actual: ImageLayoutState,
    },
}

/// Stage/access masks a transition implies on a raw queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierProfile {
    pub src_stages: PipelineStages,
    pub src_access: AccessFlags,
    pub dst_stages: PipelineStages,
    pub dst_access: AccessFlags,
    /// True when no specific profile is known for the pair and the
    /// whole-pipeline fallback was selected. Always correct, maximally
    /// serializing.
    pub conservative: bool,
}

impl BarrierProfile {
    fn conservative() -> Self {
        Self {
            src_stages: PipelineStages::ALL_COMMANDS,
            src_access: AccessFlags::MEMORY_WRITE | AccessFlags::MEMORY_READ,
            dst_stages: PipelineStages::ALL_COMMANDS,
            dst_access: AccessFlags::MEMORY_WRITE | AccessFlags::MEMORY_READ,
            conservative: true,
        }
    }
}

use ImageLayoutState::*;

fn profile_for(from: ImageLayoutState, to: ImageLayoutState) -> Option<BarrierProfile> {
    let (src_stages, src_access, dst_stages, dst_access) = match (from, to) {
        (Undefined, TransferDst) => (
            PipelineStages::TOP_OF_PIPE,
            AccessFlags::empty(),
            PipelineStages::ALL_TRANSFER,
            AccessFlags::TRANSFER_WRITE,
        ),
        (Undefined, General) => (
            PipelineStages::TOP_OF_PIPE,
            AccessFlags::empty(),
            PipelineStages::COMPUTE_SHADER,
            AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE,
        ),
        (TransferDst, General) => (
            PipelineStages::ALL_TRANSFER,
            AccessFlags::TRANSFER_WRITE,
            PipelineStages::COMPUTE_SHADER,
            AccessFlags::SHADER_READ,
        ),
        (General, TransferSrc) => (
            PipelineStages::COMPUTE_SHADER,
            AccessFlags::SHADER_WRITE,
            PipelineStages::ALL_TRANSFER,
            AccessFlags::TRANSFER_READ,
        ),
        (TransferDst, Present) => (
            PipelineStages::ALL_TRANSFER,
            AccessFlags::TRANSFER_WRITE,
            PipelineStages::BOTTOM_OF_PIPE,
            AccessFlags::empty(),
        ),
        _ => return None,
    };
    Some(BarrierProfile {
        src_stages,
        src_access,
        dst_stages,
        dst_access,
        conservative: false,
    })
}

fn transition_is_legal(from: ImageLayoutState, to: ImageLayoutState) -> bool {
    if from == to || to == Undefined {
        return false;
    }
    // Nothing can be read out of, or presented from, undefined contents.
    !(from == Undefined && matches!(to, TransferSrc | Present))
}

/// Tracks one image's layout across its lifetime.
#[derive(Debug)]
pub struct ImageLifecycle {
    image: &'static str,
    current: ImageLayoutState,
}

impl ImageLifecycle {
    pub fn new(image: &'static str) -> Self {
        Self {
            image,
            current: Undefined,
        }
    }

    pub fn current(&self) -> ImageLayoutState {
        self.current
    }

    /// Marks the contents undefined again, as after a present hands the
    /// image back to the swapchain.
    pub fn reset(&mut self) {
        self.current = Undefined;
    }

    /// Moves to `to`, returning the barrier masks the transition implies.
    /// Invalid pairs fail; legal pairs without a known profile take the
    /// whole-pipeline fallback, which is a performance concern rather than a
    /// correctness one, and are logged as such.
    pub fn transition(&mut self, to: ImageLayoutState) -> Result<BarrierProfile, LayoutError> {
        let from = self.current;
        if !transition_is_legal(from, to) {
            return Err(LayoutError::InvalidTransition {
                image: self.image,
                from,
                to,
            });
        }
        let profile = profile_for(from, to).unwrap_or_else(|| {
            warn!(
                "{}: no barrier profile for {} -> {}, falling back to a full-pipeline barrier",
                self.image, from, to
            );
            BarrierProfile::conservative()
        });
        debug!(
            "{}: {} -> {} (src {:?}/{:?}, dst {:?}/{:?})",
            self.image,
            from,
            to,
            profile.src_stages,
            profile.src_access,
            profile.dst_stages,
            profile.dst_access
        );
        self.current = to;
        Ok(profile)
    }

    /// Precondition check for layout-sensitive operations such as blits.
    pub fn expect(&self, expected: ImageLayoutState) -> Result<(), LayoutError> {
        if self.current == expected {
            Ok(())
        } else {
            Err(LayoutError::WrongLayout {
                image: self.image,
                expected,
                actual: self.current,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_the_full_present_chain() {
        let mut draw = ImageLifecycle::new("draw image");
        assert_eq!(draw.current(), Undefined);
        for to in [TransferDst, General, TransferSrc] {
            let profile = draw.transition(to).unwrap();
            assert!(!profile.conservative, "{to} should have a known profile");
            assert_eq!(draw.current(), to);
        }
    }

    #[test]
    fn present_requires_a_transfer_destination() {
        let mut surface = ImageLifecycle::new("swapchain image");
        surface.transition(TransferDst).unwrap();
        let profile = surface.transition(Present).unwrap();
        assert_eq!(profile.dst_stages, PipelineStages::BOTTOM_OF_PIPE);
        assert_eq!(surface.current(), Present);
    }

    #[test]
    fn rejects_self_and_undefined_targets() {
        let mut img = ImageLifecycle::new("img");
        img.transition(General).unwrap();
        assert!(matches!(
            img.transition(General),
            Err(LayoutError::InvalidTransition { .. })
        ));
        assert!(matches!(
            img.transition(Undefined),
            Err(LayoutError::InvalidTransition { .. })
        ));
        // The failed transitions must not move the state.
        assert_eq!(img.current(), General);
    }

    #[test]
    fn rejects_reading_or_presenting_undefined_contents() {
        let mut img = ImageLifecycle::new("img");
        assert!(img.transition(TransferSrc).is_err());
        assert!(img.transition(Present).is_err());
    }

    #[test]
    fn unlisted_pair_takes_the_conservative_fallback() {
        let mut draw = ImageLifecycle::new("draw image");
        draw.transition(General).unwrap();
        draw.transition(TransferSrc).unwrap();
        // Reuse next frame: TRANSFER_SRC -> GENERAL is legal but has no
        // dedicated profile.
        let profile = draw.transition(General).unwrap();
        assert!(profile.conservative);
        assert_eq!(profile.src_stages, PipelineStages::ALL_COMMANDS);
        assert_eq!(draw.current(), General);
    }

    #[test]
    fn blit_preconditions() {
        let mut draw = ImageLifecycle::new("draw image");
        draw.transition(General).unwrap();
        assert!(matches!(
            draw.expect(TransferSrc),
            Err(LayoutError::WrongLayout { .. })
        ));
        draw.transition(TransferSrc).unwrap();
        assert!(draw.expect(TransferSrc).is_ok());
    }

    #[test]
    fn reset_models_a_reacquired_swapchain_image() {
        let mut surface = ImageLifecycle::new("swapchain image");
        surface.transition(TransferDst).unwrap();
        surface.transition(Present).unwrap();
        surface.reset();
        assert_eq!(surface.current(), Undefined);
        assert!(surface.transition(TransferDst).is_ok());
    }
}
