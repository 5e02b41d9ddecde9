//! Frame/calibration synchronization gate.
//!
//! `SyncInputGate` blocks until an image and a calibration message whose
//! timestamps differ by less than the synchronization window are jointly
//! available, pairing by nearest timestamp (approximate time, not exact).
//! At most `queue_size` unmatched messages are retained per source;
//! older ones are discarded. Every blocking wait observes the shared
//! cancellation flag, so an external exit request takes effect within
//! one poll interval.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::AdvertisementError;
use crate::msg::{CameraInfoMessage, Frame, ImageMessage};
use crate::transport::Subscriber;

/// Default per-source pending queue depth.
pub const DEFAULT_QUEUE_SIZE: usize = 5;
/// Default synchronization window.
pub const DEFAULT_MAX_SKEW: Duration = Duration::from_millis(10);
/// How often the cancellation flag is observed while waiting.
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// How long to wait without a synchronized pair before logging.
const SYNC_WARN_INTERVAL: Duration = Duration::from_secs(5);
/// Advertisement poll period during `check_inputs`.
const ADVERTISEMENT_POLL: Duration = Duration::from_millis(100);

/// Result of a blocking wait.
#[derive(Debug)]
pub enum WaitOutcome {
    /// A synchronized image/calibration pair.
    Frame(Frame),
    /// The external exit signal became true while waiting.
    Cancelled,
}

pub struct SyncInputGate {
    images: Subscriber<ImageMessage>,
    infos: Subscriber<CameraInfoMessage>,
    queue_size: usize,
    max_skew: Duration,
    exiting: Arc<AtomicBool>,
    pending_images: VecDeque<ImageMessage>,
    pending_infos: VecDeque<CameraInfoMessage>,
}

impl SyncInputGate {
    pub fn new(
        images: Subscriber<ImageMessage>,
        infos: Subscriber<CameraInfoMessage>,
        exiting: Arc<AtomicBool>,
    ) -> Self {
        Self {
            images,
            infos,
            queue_size: DEFAULT_QUEUE_SIZE,
            max_skew: DEFAULT_MAX_SKEW,
            exiting,
            pending_images: VecDeque::new(),
            pending_infos: VecDeque::new(),
        }
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size.max(1);
        self
    }

    pub fn with_max_skew(mut self, max_skew: Duration) -> Self {
        self.max_skew = max_skew;
        self
    }

    fn cancelled(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    /// Verify the expected sources are actually being produced before
    /// the main wait begins. Fatal at startup on timeout.
    pub fn check_inputs(&self, timeout: Duration) -> Result<(), AdvertisementError> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut missing = Vec::new();
            if !self.images.is_advertised() {
                missing.push(self.images.topic().to_string());
            }
            if !self.infos.is_advertised() {
                missing.push(self.infos.topic().to_string());
            }
            if missing.is_empty() {
                debug!("all input streams advertised");
                return Ok(());
            }
            if Instant::now() >= deadline || self.cancelled() {
                return Err(AdvertisementError {
                    timeout_ms: timeout.as_millis() as u64,
                    missing,
                });
            }
            std::thread::sleep(ADVERTISEMENT_POLL.min(timeout));
        }
    }

    /// Block until a synchronized frame is available or the exit signal
    /// is set. Long stretches without a consistent pair are logged and
    /// polling continues; they are never fatal.
    pub fn wait_for_frame(&mut self) -> WaitOutcome {
        let mut last_warn = Instant::now();
        loop {
            if self.cancelled() {
                return WaitOutcome::Cancelled;
            }

            self.ingest();
            if let Some(frame) = self.try_match() {
                return WaitOutcome::Frame(frame);
            }

            if last_warn.elapsed() >= SYNC_WARN_INTERVAL {
                warn!(
                    image_topic = self.images.topic(),
                    info_topic = self.infos.topic(),
                    max_skew_ms = self.max_skew.as_millis() as u64,
                    "no synchronized frame yet; still waiting"
                );
                last_warn = Instant::now();
            }

            // Block on the image stream for at most one poll interval so
            // the cancellation flag stays responsive.
            if let Some(img) = self.images.recv_timeout(POLL_INTERVAL) {
                self.push_image(img);
            }
        }
    }

    /// Move everything queued on the subscribers into the bounded
    /// pending buffers.
    fn ingest(&mut self) {
        for img in self.images.drain() {
            self.push_image(img);
        }
        for info in self.infos.drain() {
            self.push_info(info);
        }
    }

    fn push_image(&mut self, img: ImageMessage) {
        if self.pending_images.len() == self.queue_size {
            self.pending_images.pop_front();
        }
        self.pending_images.push_back(img);
    }

    fn push_info(&mut self, info: CameraInfoMessage) {
        if self.pending_infos.len() == self.queue_size {
            self.pending_infos.pop_front();
        }
        self.pending_infos.push_back(info);
    }

    /// Find the most recent image with a calibration message inside the
    /// window, preferring the nearest-timestamp calibration. Matched and
    /// older pending messages are discarded.
    fn try_match(&mut self) -> Option<Frame> {
        let max_skew_ns = self.max_skew.as_nanos() as i128;

        // Newest image first: prefer the most recent mutually consistent
        // pair over older pending data.
        let mut chosen: Option<(usize, usize)> = None;
        'images: for (i, img) in self.pending_images.iter().enumerate().rev() {
            let ts = img.header.timestamp_ns as i128;
            let mut best: Option<(usize, i128)> = None;
            for (j, info) in self.pending_infos.iter().enumerate() {
                let skew = (info.header.timestamp_ns as i128 - ts).abs();
                if skew < max_skew_ns && best.map_or(true, |(_, b)| skew < b) {
                    best = Some((j, skew));
                }
            }
            if let Some((j, _)) = best {
                chosen = Some((i, j));
                break 'images;
            }
        }

        let (i, j) = chosen?;
        let img = self.pending_images.remove(i)?;
        let info = self.pending_infos.remove(j)?;
        // Anything older than the matched pair can never be preferred.
        self.pending_images.drain(..i.min(self.pending_images.len()));
        self.pending_infos.drain(..j.min(self.pending_infos.len()));

        Some(Frame {
            header: img.header,
            image: img.image,
            camera: info.intrinsics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::Header;
    use crate::transport::{topic, Publisher};
    use image::GrayImage;

    fn image_msg(seq: u64, ts_ns: u64) -> ImageMessage {
        ImageMessage {
            header: Header::new(seq, ts_ns),
            image: GrayImage::new(4, 4),
        }
    }

    fn info_msg(seq: u64, ts_ns: u64) -> CameraInfoMessage {
        let k = nalgebra::Matrix3::new(600.0, 0.0, 320.0, 0.0, 600.0, 240.0, 0.0, 0.0, 1.0);
        CameraInfoMessage::from_k(Header::new(seq, ts_ns), &k)
    }

    fn gate() -> (
        Publisher<ImageMessage>,
        Publisher<CameraInfoMessage>,
        SyncInputGate,
        Arc<AtomicBool>,
    ) {
        let (img_pub, img_sub) = topic("camera/image_rect", 16);
        let (info_pub, info_sub) = topic("camera/camera_info", 16);
        let exiting = Arc::new(AtomicBool::new(false));
        let gate = SyncInputGate::new(img_sub, info_sub, exiting.clone())
            .with_max_skew(Duration::from_millis(10));
        (img_pub, info_pub, gate, exiting)
    }

    #[test]
    fn test_pair_within_window_is_matched() {
        let (img_pub, info_pub, mut gate, _exit) = gate();
        img_pub.publish(image_msg(1, 1_000_000_000));
        info_pub.publish(info_msg(1, 1_000_000_000 + 5_000_000)); // +5 ms

        match gate.wait_for_frame() {
            WaitOutcome::Frame(f) => assert_eq!(f.header.seq, 1),
            WaitOutcome::Cancelled => panic!("expected a frame"),
        }
    }

    #[test]
    fn test_pair_outside_window_is_never_matched() {
        let (img_pub, info_pub, mut gate, exit) = gate();
        img_pub.publish(image_msg(1, 1_000_000_000));
        info_pub.publish(info_msg(1, 1_000_000_000 + 50_000_000)); // +50 ms

        let handle = std::thread::spawn({
            let exit = exit.clone();
            move || {
                std::thread::sleep(Duration::from_millis(80));
                exit.store(true, Ordering::SeqCst);
            }
        });
        match gate.wait_for_frame() {
            WaitOutcome::Cancelled => {}
            WaitOutcome::Frame(f) => panic!("skewed pair must not match (seq {})", f.header.seq),
        }
        handle.join().unwrap();
    }

    #[test]
    fn test_prefers_most_recent_consistent_pair() {
        let (img_pub, info_pub, mut gate, _exit) = gate();
        img_pub.publish(image_msg(1, 1_000_000_000));
        info_pub.publish(info_msg(1, 1_000_000_000));
        img_pub.publish(image_msg(2, 2_000_000_000));
        info_pub.publish(info_msg(2, 2_000_000_000));

        match gate.wait_for_frame() {
            WaitOutcome::Frame(f) => assert_eq!(f.header.seq, 2),
            WaitOutcome::Cancelled => panic!("expected a frame"),
        }
    }

    #[test]
    fn test_nearest_info_wins() {
        let (img_pub, info_pub, mut gate, _exit) = gate();
        img_pub.publish(image_msg(7, 1_000_000_000));
        info_pub.publish(info_msg(1, 1_000_000_000 - 8_000_000));
        info_pub.publish(info_msg(2, 1_000_000_000 + 2_000_000));

        match gate.wait_for_frame() {
            WaitOutcome::Frame(f) => {
                // Image header carries through, paired against info seq 2.
                assert_eq!(f.header.seq, 7);
            }
            WaitOutcome::Cancelled => panic!("expected a frame"),
        }
    }

    #[test]
    fn test_cancellation_latency_is_bounded() {
        let (_img_pub, _info_pub, mut gate, exit) = gate();
        let handle = std::thread::spawn({
            let exit = exit.clone();
            move || {
                std::thread::sleep(Duration::from_millis(30));
                exit.store(true, Ordering::SeqCst);
            }
        });
        let start = Instant::now();
        match gate.wait_for_frame() {
            WaitOutcome::Cancelled => {}
            WaitOutcome::Frame(_) => panic!("no data was published"),
        }
        // One poll interval plus scheduling slack.
        assert!(start.elapsed() < Duration::from_millis(500));
        handle.join().unwrap();
    }

    #[test]
    fn test_check_inputs_fails_when_not_advertised() {
        let (img_pub, info_pub, gate, _exit) = gate();
        drop(img_pub);
        drop(info_pub);
        let err = gate.check_inputs(Duration::from_millis(50)).unwrap_err();
        assert_eq!(err.missing.len(), 2);
    }

    #[test]
    fn test_check_inputs_succeeds_when_advertised() {
        let (_img_pub, _info_pub, gate, _exit) = gate();
        gate.check_inputs(Duration::from_millis(50)).unwrap();
    }

    #[test]
    fn test_pending_queue_is_bounded() {
        let (img_pub, _info_pub, mut gate, _exit) = gate();
        gate = gate.with_queue_size(3);
        for i in 0..10 {
            img_pub.publish(image_msg(i, i * 1_000_000));
        }
        gate.ingest();
        assert!(gate.pending_images.len() <= 3);
    }
}
