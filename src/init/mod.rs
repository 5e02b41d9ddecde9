//! Pose initialization.
//!
//! Produces a validated initial pose before tracking starts, either from
//! manual point correspondences or from automatic fiducial detection.
//! The state machine is
//!
//! ```text
//! Uninitialized -> AwaitingInput -> {ManualInit | AutoInit}
//!     -> Validating -> Ready
//! ```
//!
//! with `Failed` reachable from `Validating` once retries are exhausted.
//! Detection failures are retried up to a fixed bound with backoff; a
//! pose whose reprojection error exceeds the validation threshold sends
//! the machine back to the initializing branch instead of being
//! accepted.

pub mod detector;
pub mod manual;
pub mod pose_file;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nalgebra::{Vector2, Vector3};
use tracing::{info, warn};

use crate::error::InitError;
use crate::geometry::{solve_pose, PoseSolution, SE3};
use crate::msg::Frame;
use crate::sync::{SyncInputGate, WaitOutcome};

pub use detector::{
    DataMatrixDetector, DetectorResult, FiducialDetector, FlashcodeKind, QrFlashcodeDetector,
};
pub use manual::{CorrespondenceProvider, ProviderResponse, ScriptedProvider, StdinProvider};

/// Initialization state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Uninitialized,
    AwaitingInput,
    ManualInit,
    AutoInit,
    Validating,
    Ready,
    Failed,
}

/// Initialization policy knobs.
#[derive(Debug, Clone)]
pub struct InitSettings {
    /// Enable the QR-style fiducial detector.
    pub use_qr: bool,
    /// Enable the DataMatrix-style fiducial detector. Ignored when
    /// `use_qr` is also set (QR wins, matching the original behavior).
    pub use_datamatrix: bool,
    /// Physical marker edge length (meters).
    pub marker_edge_m: f64,
    /// Mean reprojection error above which a pose is rejected (pixels).
    pub validation_epsilon_px: f64,
    /// Fiducial detection attempts before giving up.
    pub max_detection_attempts: u32,
    /// Pause between detection attempts.
    pub detection_backoff: Duration,
    /// Full initialize-and-validate rounds before `Failed`.
    pub max_validation_rounds: u32,
    /// Restore a previously saved pose instead of initializing.
    pub start_from_saved_pose: bool,
    /// Ask the provider to confirm a manually initialized pose.
    pub confirm_init: bool,
    /// Pose record location for save/restore.
    pub pose_file: Option<PathBuf>,
    /// Provider polling period during manual entry.
    pub poll_interval: Duration,
}

impl Default for InitSettings {
    fn default() -> Self {
        Self {
            use_qr: false,
            use_datamatrix: false,
            marker_edge_m: 0.06,
            validation_epsilon_px: 4.0,
            max_detection_attempts: 10,
            detection_backoff: Duration::from_millis(100),
            max_validation_rounds: 3,
            start_from_saved_pose: false,
            confirm_init: false,
            pose_file: None,
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// A validated initial pose together with the frame it was computed on.
#[derive(Debug)]
pub struct InitOutcome {
    pub pose: SE3,
    pub frame: Frame,
}

pub struct PoseInitializer {
    settings: InitSettings,
    init_points: Vec<Vector3<f64>>,
    detector: Option<Box<dyn FiducialDetector>>,
    exiting: Arc<AtomicBool>,
    state: InitState,
    detection_attempts: u32,
}

impl PoseInitializer {
    pub fn new(
        settings: InitSettings,
        init_points: Vec<Vector3<f64>>,
        exiting: Arc<AtomicBool>,
    ) -> Self {
        let detector: Option<Box<dyn FiducialDetector>> = if settings.use_qr {
            Some(Box::new(QrFlashcodeDetector))
        } else if settings.use_datamatrix {
            Some(Box::new(DataMatrixDetector))
        } else {
            None
        };
        Self {
            settings,
            init_points,
            detector,
            exiting,
            state: InitState::Uninitialized,
            detection_attempts: 0,
        }
    }

    /// Replace the detector (tests inject counting doubles here).
    pub fn with_detector(mut self, detector: Box<dyn FiducialDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn state(&self) -> InitState {
        self.state
    }

    pub fn detection_attempts(&self) -> u32 {
        self.detection_attempts
    }

    /// Model-frame corner positions of the configured marker
    /// (TL, TR, BR, BL; z = 0 plane, y down to match image rows).
    fn marker_points(&self) -> [Vector3<f64>; 4] {
        let h = self.settings.marker_edge_m / 2.0;
        [
            Vector3::new(-h, -h, 0.0),
            Vector3::new(h, -h, 0.0),
            Vector3::new(h, h, 0.0),
            Vector3::new(-h, h, 0.0),
        ]
    }

    /// Persist a validated pose, if a pose file is configured.
    pub fn save_initial_pose(&self, pose: &SE3) {
        if let Some(path) = &self.settings.pose_file {
            if let Err(e) = pose_file::save_pose(path, pose) {
                warn!(path = %path.display(), error = %e, "failed to save initial pose");
            }
        }
    }

    /// Restore a previously saved pose, if present.
    pub fn load_initial_pose(&self) -> Option<SE3> {
        let path = self.settings.pose_file.as_ref()?;
        match pose_file::load_pose(path) {
            Ok(pose) => pose,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "pose record unreadable; ignoring");
                None
            }
        }
    }

    /// Drive the state machine to `Ready` or `Failed`.
    pub fn initialize(
        &mut self,
        gate: &mut SyncInputGate,
        provider: &mut dyn CorrespondenceProvider,
    ) -> Result<InitOutcome, InitError> {
        self.state = InitState::AwaitingInput;

        if self.settings.start_from_saved_pose {
            if let Some(pose) = self.load_initial_pose() {
                let frame = self.next_frame(gate)?;
                info!("resuming from saved initial pose");
                self.state = InitState::Ready;
                return Ok(InitOutcome { pose, frame });
            }
        }

        for round in 1..=self.settings.max_validation_rounds {
            let (solution, frame, manual) = if self.detector.is_some() {
                self.state = InitState::AutoInit;
                let (sol, frame) = self.auto_init(gate)?;
                (sol, frame, false)
            } else {
                self.state = InitState::ManualInit;
                let frame = self.next_frame(gate)?;
                let image_points = manual::gather_correspondences(
                    &self.init_points,
                    &frame,
                    provider,
                    self.settings.poll_interval,
                    &self.exiting,
                )?;
                let sol = solve_pose(&self.init_points, &image_points, &frame.camera)?;
                (sol, frame, true)
            };
            let (pose, mean_error_px) = (solution.pose, solution.mean_error_px);

            self.state = InitState::Validating;
            if mean_error_px > self.settings.validation_epsilon_px {
                warn!(
                    round,
                    mean_error_px,
                    threshold_px = self.settings.validation_epsilon_px,
                    "pose rejected by reprojection check; re-entering initialization"
                );
                if round == self.settings.max_validation_rounds {
                    self.state = InitState::Failed;
                    return Err(InitError::Validation {
                        error_px: mean_error_px,
                        threshold_px: self.settings.validation_epsilon_px,
                    });
                }
                continue;
            }
            if manual && self.settings.confirm_init && !provider.confirm(&pose, &frame) {
                warn!(round, "pose rejected by operator; re-entering initialization");
                continue;
            }

            info!(round, mean_error_px, "initial pose accepted");
            self.save_initial_pose(&pose);
            self.state = InitState::Ready;
            return Ok(InitOutcome { pose, frame });
        }

        self.state = InitState::Failed;
        Err(InitError::RetriesExhausted {
            rounds: self.settings.max_validation_rounds,
        })
    }

    /// One synchronized frame, or `Cancelled`.
    fn next_frame(&self, gate: &mut SyncInputGate) -> Result<Frame, InitError> {
        match gate.wait_for_frame() {
            WaitOutcome::Frame(frame) => Ok(frame),
            WaitOutcome::Cancelled => Err(InitError::Cancelled),
        }
    }

    /// Detect the configured fiducial, retrying over fresh frames up to
    /// the attempt bound, then solve a planar pose from its corners.
    fn auto_init(
        &mut self,
        gate: &mut SyncInputGate,
    ) -> Result<(PoseSolution, Frame), InitError> {
        loop {
            let frame = match gate.wait_for_frame() {
                WaitOutcome::Frame(frame) => frame,
                WaitOutcome::Cancelled => return Err(InitError::Cancelled),
            };

            self.detection_attempts += 1;
            let detection = match self.detector.as_deref() {
                Some(d) => d.detect(&frame.image),
                None => None,
            };
            if let Some(found) = detection {
                info!(
                    id = found.id,
                    attempts = self.detection_attempts,
                    "fiducial detected"
                );
                let corners: Vec<Vector2<f64>> = found.corners.to_vec();
                let model: Vec<Vector3<f64>> = self.marker_points().to_vec();
                let sol = solve_pose(&model, &corners, &frame.camera)?;
                return Ok((sol, frame));
            }

            if self.detection_attempts >= self.settings.max_detection_attempts {
                self.state = InitState::Failed;
                return Err(InitError::Detection {
                    attempts: self.detection_attempts,
                });
            }
            if self.exiting.load(Ordering::SeqCst) {
                return Err(InitError::Cancelled);
            }
            std::thread::sleep(self.settings.detection_backoff);
        }
    }
}
