//! Timestamped message types exchanged over the transport layer.
//!
//! The client treats its inputs as already-demultiplexed streams: one
//! image message and one calibration message per camera frame, each
//! carrying a header with a nanosecond timestamp and sequence number.

use image::GrayImage;
use nalgebra::Matrix3;

use crate::geometry::{CameraModel, SE3};

/// Message timestamp, nanoseconds since an arbitrary epoch.
pub type StampNs = u64;

/// Per-message metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub seq: u64,
    pub timestamp_ns: StampNs,
    pub frame_id: String,
}

impl Header {
    pub fn new(seq: u64, timestamp_ns: StampNs) -> Self {
        Self {
            seq,
            timestamp_ns,
            frame_id: String::new(),
        }
    }
}

/// One camera image.
#[derive(Debug, Clone)]
pub struct ImageMessage {
    pub header: Header,
    pub image: GrayImage,
}

/// Calibration metadata valid at a given timestamp.
#[derive(Debug, Clone)]
pub struct CameraInfoMessage {
    pub header: Header,
    pub intrinsics: CameraModel,
}

impl CameraInfoMessage {
    pub fn from_k(header: Header, k: &Matrix3<f64>) -> Self {
        Self {
            header,
            intrinsics: CameraModel::from_k(k),
        }
    }
}

/// A synchronized frame: image plus the calibration valid at its
/// timestamp. Invariant: the two source timestamps differ by less than
/// the gate's synchronization window.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Header,
    pub image: GrayImage,
    pub camera: CameraModel,
}

/// Estimated pose tagged with the originating frame's header.
#[derive(Debug, Clone)]
pub struct PoseStamped {
    pub header: Header,
    pub pose: SE3,
}
