//! Tracker client orchestration.
//!
//! `TrackerClient::spin` runs the full lifecycle: verify the input
//! streams are advertised, fetch the model resources, establish a
//! validated initial pose, then track frame by frame, publishing one
//! stamped pose per synchronized frame. Every engine call goes through
//! the reconfiguration gate so parameter updates never interleave with
//! a tracking step.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::{ReconfigurationGate, TrackerSettings};
use crate::engine::TrackingEngine;
use crate::error::{ClientError, TrackingError};
use crate::init::{CorrespondenceProvider, InitSettings, PoseInitializer};
use crate::model::{ModelLoader, ResourceRetriever};
use crate::msg::{CameraInfoMessage, ImageMessage, PoseStamped};
use crate::sync::{SyncInputGate, WaitOutcome};
use crate::transport::{Publisher, Subscriber};

fn default_image_topic() -> String {
    "camera/image_rect".to_string()
}
fn default_info_topic() -> String {
    "camera/camera_info".to_string()
}
fn default_pose_topic() -> String {
    "object_position".to_string()
}
fn default_advertisement_timeout_ms() -> u64 {
    5_000
}

/// Initialization knobs as they appear in the configuration file.
/// Durations are carried as integer milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InitConfig {
    pub use_qr: bool,
    pub use_datamatrix: bool,
    pub marker_edge_m: f64,
    pub validation_epsilon_px: f64,
    pub max_detection_attempts: u32,
    pub detection_backoff_ms: u64,
    pub max_validation_rounds: u32,
    pub start_from_saved_pose: bool,
    pub confirm_init: bool,
    pub pose_file: Option<PathBuf>,
}

impl Default for InitConfig {
    fn default() -> Self {
        let s = InitSettings::default();
        Self {
            use_qr: s.use_qr,
            use_datamatrix: s.use_datamatrix,
            marker_edge_m: s.marker_edge_m,
            validation_epsilon_px: s.validation_epsilon_px,
            max_detection_attempts: s.max_detection_attempts,
            detection_backoff_ms: s.detection_backoff.as_millis() as u64,
            max_validation_rounds: s.max_validation_rounds,
            start_from_saved_pose: s.start_from_saved_pose,
            confirm_init: s.confirm_init,
            pose_file: s.pose_file,
        }
    }
}

impl InitConfig {
    pub fn settings(&self) -> InitSettings {
        InitSettings {
            use_qr: self.use_qr,
            use_datamatrix: self.use_datamatrix,
            marker_edge_m: self.marker_edge_m,
            validation_epsilon_px: self.validation_epsilon_px,
            max_detection_attempts: self.max_detection_attempts,
            detection_backoff: Duration::from_millis(self.detection_backoff_ms),
            max_validation_rounds: self.max_validation_rounds,
            start_from_saved_pose: self.start_from_saved_pose,
            confirm_init: self.confirm_init,
            pose_file: self.pose_file.clone(),
            poll_interval: InitSettings::default().poll_interval,
        }
    }
}

/// Full client configuration, loadable from one TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub model_path: String,
    pub model_name: String,
    #[serde(default = "default_image_topic")]
    pub image_topic: String,
    #[serde(default = "default_info_topic")]
    pub info_topic: String,
    #[serde(default = "default_pose_topic")]
    pub pose_topic: String,
    #[serde(default = "default_advertisement_timeout_ms")]
    pub advertisement_timeout_ms: u64,
    /// Terminate the loop on loss of track instead of holding the last
    /// pose and retrying on subsequent frames.
    #[serde(default)]
    pub stop_on_loss: bool,
    /// Override for the model resource cache directory.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub init: InitConfig,
    #[serde(default)]
    pub tracker: TrackerSettings,
}

impl ClientConfig {
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

/// Counters reported when the loop ends.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpinStats {
    pub frames_tracked: u64,
    pub losses: u64,
}

pub struct TrackerClient<E: TrackingEngine> {
    config: ClientConfig,
    gate: SyncInputGate,
    pose_pub: Publisher<PoseStamped>,
    engine: ReconfigurationGate<E>,
    exiting: Arc<AtomicBool>,
}

impl<E: TrackingEngine> TrackerClient<E> {
    pub fn new(
        config: ClientConfig,
        images: Subscriber<ImageMessage>,
        infos: Subscriber<CameraInfoMessage>,
        pose_pub: Publisher<PoseStamped>,
        engine: E,
        exiting: Arc<AtomicBool>,
    ) -> Self {
        let gate = SyncInputGate::new(images, infos, exiting.clone());
        let engine = ReconfigurationGate::new(engine);
        Self {
            config,
            gate,
            pose_pub,
            engine,
            exiting,
        }
    }

    /// Handle for the reconfiguration path (settings listener, tests).
    pub fn reconfiguration(&self) -> ReconfigurationGate<E> {
        self.engine.clone()
    }

    /// Run the client to completion: startup checks, model load, pose
    /// initialization, then the tracking loop until cancelled or a fatal
    /// tracking error.
    pub fn spin(
        &mut self,
        provider: &mut dyn CorrespondenceProvider,
    ) -> Result<SpinStats, ClientError> {
        self.gate
            .check_inputs(Duration::from_millis(self.config.advertisement_timeout_ms))?;

        let mut loader = ModelLoader::new(ResourceRetriever::new());
        if let Some(dir) = &self.config.cache_dir {
            loader = loader.with_cache_root(dir);
        }
        let model = loader.load(&self.config.model_path, &self.config.model_name)?;

        let mut initializer = PoseInitializer::new(
            self.config.init.settings(),
            model.init_points.clone(),
            self.exiting.clone(),
        );
        let outcome = initializer.initialize(&mut self.gate, provider)?;
        self.engine
            .with_lock(|e| e.reset_from(&outcome.frame, &outcome.pose));
        info!(model = %model.name, "tracking started");

        let mut stats = SpinStats::default();
        loop {
            let frame = match self.gate.wait_for_frame() {
                WaitOutcome::Frame(frame) => frame,
                WaitOutcome::Cancelled => {
                    info!(
                        frames = stats.frames_tracked,
                        losses = stats.losses,
                        "exit requested; tracking loop stopped"
                    );
                    return Ok(stats);
                }
            };

            match self.engine.with_lock(|e| e.track(&frame)) {
                Ok(pose) => {
                    stats.frames_tracked += 1;
                    self.pose_pub.publish(PoseStamped {
                        header: frame.header,
                        pose,
                    });
                }
                Err(TrackingError::Lost) => {
                    stats.losses += 1;
                    warn!(seq = frame.header.seq, "lost track of the object");
                    if self.config.stop_on_loss {
                        return Err(TrackingError::Lost.into());
                    }
                }
                Err(e @ TrackingError::Engine(_)) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RigidPlaceholderEngine;
    use crate::geometry::{CameraModel, SE3};
    use crate::init::ScriptedProvider;
    use crate::msg::{Frame, Header};
    use crate::transport::topic;
    use image::GrayImage;
    use nalgebra::{Vector2, Vector3};

    const CAM: CameraModel = CameraModel {
        fx: 600.0,
        fy: 600.0,
        cx: 320.0,
        cy: 240.0,
        k1: 0.0,
        k2: 0.0,
    };

    /// Write a minimal model (mesh + four planar init points) under a
    /// temp directory and return its path.
    fn write_model(dir: &std::path::Path) {
        std::fs::write(dir.join("cube.wrl"), b"#VRML V2.0 utf8\n").unwrap();
        std::fs::write(
            dir.join("cube.init"),
            b"-0.05,-0.05,0\n0.05,-0.05,0\n0.05,0.05,0\n-0.05,0.05,0\n",
        )
        .unwrap();
    }

    fn model_points() -> Vec<Vector3<f64>> {
        vec![
            Vector3::new(-0.05, -0.05, 0.0),
            Vector3::new(0.05, -0.05, 0.0),
            Vector3::new(0.05, 0.05, 0.0),
            Vector3::new(-0.05, 0.05, 0.0),
        ]
    }

    fn ground_truth() -> SE3 {
        SE3::from_tu(Vector3::new(0.0, 0.02, 0.6), Vector3::new(0.05, 0.1, 0.0))
    }

    fn scripted_clicks() -> Vec<Vector2<f64>> {
        let gt = ground_truth();
        model_points()
            .iter()
            .map(|p| CAM.project(&gt.transform_point(p)).unwrap())
            .collect()
    }

    struct Harness {
        config: ClientConfig,
        img_pub: Publisher<ImageMessage>,
        info_pub: Publisher<CameraInfoMessage>,
        images: Option<Subscriber<ImageMessage>>,
        infos: Option<Subscriber<CameraInfoMessage>>,
        pose_pub: Publisher<PoseStamped>,
        pose_sub: Subscriber<PoseStamped>,
        _model_dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let model_dir = tempfile::tempdir().unwrap();
        write_model(model_dir.path());
        let config_text = format!(
            "model_path = \"{}\"\nmodel_name = \"cube\"\ncache_dir = \"{}\"\nadvertisement_timeout_ms = 1000\n",
            model_dir.path().display(),
            model_dir.path().join("cache").display()
        );
        let config: ClientConfig = toml::from_str(&config_text).unwrap();

        let (img_pub, images) = topic("camera/image_rect", 16);
        let (info_pub, infos) = topic("camera/camera_info", 16);
        let (pose_pub, pose_sub) = topic("object_position", 64);
        Harness {
            config,
            img_pub,
            info_pub,
            images: Some(images),
            infos: Some(infos),
            pose_pub,
            pose_sub,
            _model_dir: model_dir,
        }
    }

    /// Publish image/info pairs until the stop flag is set.
    fn pump(
        img_pub: Publisher<ImageMessage>,
        info_pub: Publisher<CameraInfoMessage>,
        stop: Arc<AtomicBool>,
    ) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let mut seq = 0u64;
            while !stop.load(Ordering::SeqCst) {
                let ts = seq * 33_000_000;
                img_pub.publish(ImageMessage {
                    header: Header::new(seq, ts),
                    image: GrayImage::new(8, 8),
                });
                info_pub.publish(CameraInfoMessage {
                    header: Header::new(seq, ts),
                    intrinsics: CAM,
                });
                seq += 1;
                std::thread::sleep(Duration::from_millis(5));
            }
        })
    }

    #[test]
    fn test_spin_tracks_and_publishes_stamped_poses() {
        let mut h = harness();
        let exiting = Arc::new(AtomicBool::new(false));
        let stop_pump = Arc::new(AtomicBool::new(false));
        let pump_handle = pump(h.img_pub.clone(), h.info_pub.clone(), stop_pump.clone());

        let mut client = TrackerClient::new(
            h.config.clone(),
            h.images.take().unwrap(),
            h.infos.take().unwrap(),
            h.pose_pub.clone(),
            RigidPlaceholderEngine::new(Default::default()),
            exiting.clone(),
        );

        let canceller = std::thread::spawn({
            let exiting = exiting.clone();
            move || {
                std::thread::sleep(Duration::from_millis(300));
                exiting.store(true, Ordering::SeqCst);
            }
        });

        let mut provider = ScriptedProvider::new(scripted_clicks());
        let stats = client.spin(&mut provider).unwrap();
        canceller.join().unwrap();
        stop_pump.store(true, Ordering::SeqCst);
        pump_handle.join().unwrap();

        assert!(stats.frames_tracked > 0);
        assert_eq!(stats.losses, 0);

        let published = h.pose_sub.drain();
        assert!(!published.is_empty());
        let gt = ground_truth();
        for stamped in &published {
            let (d_rot, d_trans) = stamped.pose.delta(&gt);
            assert!(d_rot < 1e-6 && d_trans < 1e-6);
        }
        // Stamps carry through from the originating frames.
        assert!(published.windows(2).all(|w| w[0].header.seq < w[1].header.seq));
    }

    #[test]
    fn test_spin_fails_fast_when_inputs_missing() {
        let mut h = harness();
        h.config.advertisement_timeout_ms = 50;
        let images = h.images.take().unwrap();
        let infos = h.infos.take().unwrap();
        drop(h.img_pub);
        drop(h.info_pub);

        let mut client = TrackerClient::new(
            h.config.clone(),
            images,
            infos,
            h.pose_pub.clone(),
            RigidPlaceholderEngine::new(Default::default()),
            Arc::new(AtomicBool::new(false)),
        );
        let mut provider = ScriptedProvider::new(vec![]);
        assert!(matches!(
            client.spin(&mut provider),
            Err(ClientError::Advertisement(_))
        ));
    }

    /// Engine that tracks a few frames and then reports loss forever.
    struct FlakyEngine {
        pose: SE3,
        remaining: u32,
        settings: TrackerSettings,
    }

    impl FlakyEngine {
        fn new(good_frames: u32) -> Self {
            Self {
                pose: SE3::identity(),
                remaining: good_frames,
                settings: TrackerSettings::default(),
            }
        }
    }

    impl TrackingEngine for FlakyEngine {
        fn reset_from(&mut self, _frame: &Frame, pose: &SE3) {
            self.pose = *pose;
        }
        fn track(&mut self, _frame: &Frame) -> Result<SE3, TrackingError> {
            if self.remaining == 0 {
                return Err(TrackingError::Lost);
            }
            self.remaining -= 1;
            Ok(self.pose)
        }
        fn apply_settings(&mut self, settings: &TrackerSettings) {
            self.settings = settings.clone();
        }
        fn settings(&self) -> TrackerSettings {
            self.settings.clone()
        }
    }

    #[test]
    fn test_stop_on_loss_terminates_the_loop() {
        let mut h = harness();
        h.config.stop_on_loss = true;
        let exiting = Arc::new(AtomicBool::new(false));
        let stop_pump = Arc::new(AtomicBool::new(false));
        let pump_handle = pump(h.img_pub.clone(), h.info_pub.clone(), stop_pump.clone());

        let mut client = TrackerClient::new(
            h.config.clone(),
            h.images.take().unwrap(),
            h.infos.take().unwrap(),
            h.pose_pub.clone(),
            FlakyEngine::new(3),
            exiting,
        );
        let mut provider = ScriptedProvider::new(scripted_clicks());
        let err = client.spin(&mut provider).unwrap_err();
        stop_pump.store(true, Ordering::SeqCst);
        pump_handle.join().unwrap();

        assert!(matches!(err, ClientError::Tracking(TrackingError::Lost)));
        assert_eq!(h.pose_sub.drain().len(), 3);
    }

    #[test]
    fn test_losses_are_tolerated_by_default() {
        let mut h = harness();
        let exiting = Arc::new(AtomicBool::new(false));
        let stop_pump = Arc::new(AtomicBool::new(false));
        let pump_handle = pump(h.img_pub.clone(), h.info_pub.clone(), stop_pump.clone());

        let mut client = TrackerClient::new(
            h.config.clone(),
            h.images.take().unwrap(),
            h.infos.take().unwrap(),
            h.pose_pub.clone(),
            FlakyEngine::new(2),
            exiting.clone(),
        );
        let canceller = std::thread::spawn({
            let exiting = exiting.clone();
            move || {
                std::thread::sleep(Duration::from_millis(250));
                exiting.store(true, Ordering::SeqCst);
            }
        });

        let mut provider = ScriptedProvider::new(scripted_clicks());
        let stats = client.spin(&mut provider).unwrap();
        canceller.join().unwrap();
        stop_pump.store(true, Ordering::SeqCst);
        pump_handle.join().unwrap();

        assert_eq!(stats.frames_tracked, 2);
        assert!(stats.losses > 0);
    }

    #[test]
    fn test_settings_update_lands_between_frames() {
        let mut h = harness();
        let exiting = Arc::new(AtomicBool::new(false));
        let stop_pump = Arc::new(AtomicBool::new(false));
        let pump_handle = pump(h.img_pub.clone(), h.info_pub.clone(), stop_pump.clone());

        let mut client = TrackerClient::new(
            h.config.clone(),
            h.images.take().unwrap(),
            h.infos.take().unwrap(),
            h.pose_pub.clone(),
            RigidPlaceholderEngine::new(Default::default()),
            exiting.clone(),
        );
        let gate = client.reconfiguration();
        let (settings_pub, settings_sub) = topic("tracker/settings", 4);
        let listener_exit = Arc::new(AtomicBool::new(false));
        let listener = gate.spawn_listener(settings_sub, listener_exit.clone());

        let canceller = std::thread::spawn({
            let exiting = exiting.clone();
            move || {
                std::thread::sleep(Duration::from_millis(100));
                let mut s = TrackerSettings::default();
                s.moving_edge.range = 25;
                settings_pub.publish(s);
                std::thread::sleep(Duration::from_millis(200));
                exiting.store(true, Ordering::SeqCst);
            }
        });

        let mut provider = ScriptedProvider::new(scripted_clicks());
        client.spin(&mut provider).unwrap();
        canceller.join().unwrap();
        listener_exit.store(true, Ordering::SeqCst);
        listener.join().unwrap();
        stop_pump.store(true, Ordering::SeqCst);
        pump_handle.join().unwrap();

        let applied = gate.with_lock(|e| e.settings());
        assert_eq!(applied.moving_edge.range, 25);
        assert_eq!(applied.version, 1);
    }
}
