use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use image::GrayImage;
use tracing::info;
use tracing_subscriber::EnvFilter;

use modeltrack::client::{ClientConfig, TrackerClient};
use modeltrack::engine::RigidPlaceholderEngine;
use modeltrack::geometry::CameraModel;
use modeltrack::init::{detector, CorrespondenceProvider, FlashcodeKind, ScriptedProvider, StdinProvider};
use modeltrack::msg::{CameraInfoMessage, Header, ImageMessage, PoseStamped};
use modeltrack::transport::topic;

/// Synthetic camera parameters for the demo feed.
const DEMO_FX: f64 = 600.0;
const DEMO_FY: f64 = 600.0;
const DEMO_CX: f64 = 320.0;
const DEMO_CY: f64 = 240.0;
const DEMO_FRAME_PERIOD: Duration = Duration::from_millis(33);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            ClientConfig::load(&path).with_context(|| format!("loading config from {path}"))?
        }
        None => demo_config()?,
    };
    let run_secs: u64 = std::env::args()
        .nth(2)
        .map(|s| s.parse())
        .transpose()
        .context("run duration must be an integer number of seconds")?
        .unwrap_or(10);

    info!(
        model = %config.model_name,
        image_topic = %config.image_topic,
        run_secs,
        "tracker client starting"
    );

    let (img_pub, images) = topic::<ImageMessage>(&config.image_topic, 16);
    let (info_pub, infos) = topic::<CameraInfoMessage>(&config.info_topic, 16);
    let (pose_pub, pose_sub) = topic::<PoseStamped>(&config.pose_topic, 64);
    let exiting = Arc::new(AtomicBool::new(false));

    // Synthetic camera: a flat fiducial in view of a fixed camera,
    // streamed at ~30 fps. A live deployment replaces this thread with
    // the real image and calibration feeds.
    let camera_thread = {
        let exiting = exiting.clone();
        let marker_kind = if config.init.use_datamatrix && !config.init.use_qr {
            FlashcodeKind::DataMatrix
        } else {
            FlashcodeKind::Qr
        };
        std::thread::spawn(move || {
            let mut canvas = GrayImage::from_pixel(640, 480, image::Luma([245]));
            detector::render_marker(marker_kind, 42, (280, 200), 10, &mut canvas);
            let intrinsics = CameraModel::new(DEMO_FX, DEMO_FY, DEMO_CX, DEMO_CY);
            let mut seq = 0u64;
            while !exiting.load(Ordering::SeqCst) {
                let ts = seq * DEMO_FRAME_PERIOD.as_nanos() as u64;
                img_pub.publish(ImageMessage {
                    header: Header::new(seq, ts),
                    image: canvas.clone(),
                });
                info_pub.publish(CameraInfoMessage {
                    header: Header::new(seq, ts),
                    intrinsics,
                });
                seq += 1;
                std::thread::sleep(DEMO_FRAME_PERIOD);
            }
        })
    };

    // Pose consumer: drain the output stream and report periodically.
    let pose_thread = {
        let exiting = exiting.clone();
        std::thread::spawn(move || {
            while !exiting.load(Ordering::SeqCst) {
                if let Some(stamped) = pose_sub.recv_timeout(Duration::from_millis(100)) {
                    if stamped.header.seq % 30 == 0 {
                        let t = stamped.pose.translation;
                        info!(
                            seq = stamped.header.seq,
                            "object pose [{:.4}, {:.4}, {:.4}]",
                            t.x,
                            t.y,
                            t.z
                        );
                    }
                }
            }
        })
    };

    let mut client = TrackerClient::new(
        config.clone(),
        images,
        infos,
        pose_pub,
        RigidPlaceholderEngine::new(config.tracker.clone()),
        exiting.clone(),
    );

    // Reconfiguration path: apply the configured settings once, then
    // keep listening for runtime updates.
    let gate = client.reconfiguration();
    gate.apply_update(config.tracker.clone());
    let (_settings_pub, settings_sub) = topic("tracker/settings", 4);
    let listener = gate.spawn_listener(settings_sub, exiting.clone());

    // Bounded run; the exit flag also stops the client mid-wait.
    let timer = {
        let exiting = exiting.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(run_secs));
            exiting.store(true, Ordering::SeqCst);
        })
    };

    let mut provider: Box<dyn CorrespondenceProvider> =
        if config.init.use_qr || config.init.use_datamatrix {
            Box::new(ScriptedProvider::new(vec![]))
        } else {
            Box::new(StdinProvider)
        };
    let stats = client.spin(provider.as_mut())?;
    info!(
        frames = stats.frames_tracked,
        losses = stats.losses,
        "tracker client stopped"
    );

    exiting.store(true, Ordering::SeqCst);
    timer.join().ok();
    listener.join().ok();
    pose_thread.join().ok();
    camera_thread.join().ok();
    Ok(())
}

/// Built-in demo: a square model with four init points and automatic
/// initialization from the rendered fiducial.
fn demo_config() -> Result<ClientConfig> {
    let dir = std::env::temp_dir().join("modeltrack-demo");
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join("plate.wrl"), b"#VRML V2.0 utf8\n")?;
    std::fs::write(
        dir.join("plate.init"),
        b"# corner points, meters\n-0.04,-0.04,0\n0.04,-0.04,0\n0.04,0.04,0\n-0.04,0.04,0\n",
    )?;

    let text = format!(
        "model_path = \"{}\"\nmodel_name = \"plate\"\n\n[init]\nuse_qr = true\nmarker_edge_m = 0.08\n",
        dir.display()
    );
    Ok(toml::from_str(&text)?)
}
