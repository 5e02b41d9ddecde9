//! Tracking engine seam.
//!
//! The pose-refinement mathematics (moving-edge / keypoint tracking) is
//! an external collaborator: given a frame and its current estimate, it
//! produces a refined pose. The client owns exactly one engine instance,
//! constructed after model and pose initialization succeed, and every
//! call goes through the reconfiguration gate's lock.

use crate::config::TrackerSettings;
use crate::error::TrackingError;
use crate::geometry::{Pose, SE3};
use crate::msg::Frame;

pub trait TrackingEngine: Send + 'static {
    /// Reset the engine from a validated initial pose.
    fn reset_from(&mut self, frame: &Frame, pose: &SE3);

    /// Refine the pose estimate for one frame. `Err(TrackingError::Lost)`
    /// reports loss of track; the loop policy decides whether to continue.
    fn track(&mut self, frame: &Frame) -> Result<SE3, TrackingError>;

    /// Replace the live configuration. Called only under the
    /// reconfiguration gate's lock, so a snapshot is always observed in
    /// full.
    fn apply_settings(&mut self, settings: &TrackerSettings);

    /// Current configuration snapshot.
    fn settings(&self) -> TrackerSettings;
}

/// Stand-in engine for the demo binary and tests: holds the last pose
/// without refining it. A production moving-edge tracker plugs in behind
/// `TrackingEngine` instead.
pub struct RigidPlaceholderEngine {
    pose: Pose,
    settings: TrackerSettings,
    pub frames_tracked: u64,
}

impl RigidPlaceholderEngine {
    pub fn new(settings: TrackerSettings) -> Self {
        Self {
            pose: Pose::invalid(),
            settings,
            frames_tracked: 0,
        }
    }
}

impl TrackingEngine for RigidPlaceholderEngine {
    fn reset_from(&mut self, _frame: &Frame, pose: &SE3) {
        self.pose.set(*pose);
    }

    fn track(&mut self, _frame: &Frame) -> Result<SE3, TrackingError> {
        let Some(&transform) = self.pose.transform() else {
            return Err(TrackingError::Lost);
        };
        self.frames_tracked += 1;
        Ok(transform)
    }

    fn apply_settings(&mut self, settings: &TrackerSettings) {
        self.settings = settings.clone();
    }

    fn settings(&self) -> TrackerSettings {
        self.settings.clone()
    }
}
