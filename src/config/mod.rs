//! Tunable tracking parameters.
//!
//! `TrackerSettings` is the configuration snapshot applied atomically to
//! the engine: moving-edge detector thresholds and keypoint-tracker
//! settings, version-stamped so tests can check snapshot consistency.
//! Out-of-range values are clamped to their documented range and logged,
//! never fatal.

pub mod gate;

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub use gate::ReconfigurationGate;

/// Moving-edge detector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovingEdgeSettings {
    /// Convolution mask size (pixels, odd).
    #[serde(default = "default_mask_size")]
    pub mask_size: u32,
    /// Seek range on both sides of the reference pixel.
    #[serde(default = "default_range")]
    pub range: u32,
    /// Likelihood threshold for contrast detection.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Minimum image contrast allowed to detect a contour.
    #[serde(default = "default_mu")]
    pub mu1: f64,
    /// Maximum image contrast allowed to detect a contour.
    #[serde(default = "default_mu")]
    pub mu2: f64,
    /// Distance between sampled points on model edges (pixels).
    #[serde(default = "default_sample_step")]
    pub sample_step: f64,
    /// Image border width where edges are not tracked.
    #[serde(default = "default_strip")]
    pub strip: u32,
}

/// Keypoint (KLT) tracker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KltSettings {
    #[serde(default = "default_max_features")]
    pub max_features: u32,
    #[serde(default = "default_window_size")]
    pub window_size: u32,
    #[serde(default = "default_quality")]
    pub quality: f64,
    #[serde(default = "default_min_distance")]
    pub min_distance: f64,
    #[serde(default = "default_harris")]
    pub harris: f64,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    #[serde(default = "default_pyramid_levels")]
    pub pyramid_levels: u32,
}

/// Versioned configuration snapshot. The engine observes either the old
/// or the new snapshot in full for a given frame, never a mix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerSettings {
    /// Monotonic stamp set by the reconfiguration gate on apply.
    #[serde(default)]
    pub version: u64,
    /// Angle below which a face is considered appearing (degrees).
    #[serde(default = "default_angle")]
    pub angle_appear_deg: f64,
    /// Angle above which a face is considered disappearing (degrees).
    #[serde(default = "default_angle")]
    pub angle_disappear_deg: f64,
    #[serde(default)]
    pub moving_edge: MovingEdgeSettings,
    #[serde(default)]
    pub klt: KltSettings,
}

fn default_mask_size() -> u32 {
    5
}
fn default_range() -> u32 {
    10
}
fn default_threshold() -> f64 {
    2000.0
}
fn default_mu() -> f64 {
    0.5
}
fn default_sample_step() -> f64 {
    4.0
}
fn default_strip() -> u32 {
    2
}
fn default_max_features() -> u32 {
    10_000
}
fn default_window_size() -> u32 {
    5
}
fn default_quality() -> f64 {
    0.01
}
fn default_min_distance() -> f64 {
    5.0
}
fn default_harris() -> f64 {
    0.01
}
fn default_block_size() -> u32 {
    3
}
fn default_pyramid_levels() -> u32 {
    3
}
fn default_angle() -> f64 {
    75.0
}

impl Default for MovingEdgeSettings {
    fn default() -> Self {
        Self {
            mask_size: default_mask_size(),
            range: default_range(),
            threshold: default_threshold(),
            mu1: default_mu(),
            mu2: default_mu(),
            sample_step: default_sample_step(),
            strip: default_strip(),
        }
    }
}

impl Default for KltSettings {
    fn default() -> Self {
        Self {
            max_features: default_max_features(),
            window_size: default_window_size(),
            quality: default_quality(),
            min_distance: default_min_distance(),
            harris: default_harris(),
            block_size: default_block_size(),
            pyramid_levels: default_pyramid_levels(),
        }
    }
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            version: 0,
            angle_appear_deg: default_angle(),
            angle_disappear_deg: default_angle(),
            moving_edge: MovingEdgeSettings::default(),
            klt: KltSettings::default(),
        }
    }
}

fn clamp_u32(name: &str, value: u32, lo: u32, hi: u32) -> u32 {
    if value < lo || value > hi {
        warn!(param = name, value, lo, hi, "out-of-range value clamped");
    }
    value.clamp(lo, hi)
}

fn clamp_f64(name: &str, value: f64, lo: f64, hi: f64) -> f64 {
    if !value.is_finite() {
        warn!(param = name, value, "non-finite value replaced by lower bound");
        return lo;
    }
    if value < lo || value > hi {
        warn!(param = name, value, lo, hi, "out-of-range value clamped");
    }
    value.clamp(lo, hi)
}

impl TrackerSettings {
    /// Load settings from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Clamp every field to its valid range. Returns the sanitized copy;
    /// clamping is logged, never an error.
    pub fn sanitized(&self) -> Self {
        let me = &self.moving_edge;
        let klt = &self.klt;
        let mut mask_size = clamp_u32("moving_edge.mask_size", me.mask_size, 3, 15);
        if mask_size % 2 == 0 {
            warn!(param = "moving_edge.mask_size", value = mask_size, "even mask size bumped to odd");
            mask_size += 1;
        }
        Self {
            version: self.version,
            angle_appear_deg: clamp_f64("angle_appear_deg", self.angle_appear_deg, 0.0, 90.0),
            angle_disappear_deg: clamp_f64(
                "angle_disappear_deg",
                self.angle_disappear_deg,
                0.0,
                90.0,
            ),
            moving_edge: MovingEdgeSettings {
                mask_size,
                range: clamp_u32("moving_edge.range", me.range, 0, 50),
                threshold: clamp_f64("moving_edge.threshold", me.threshold, 0.0, 20_000.0),
                mu1: clamp_f64("moving_edge.mu1", me.mu1, 0.0, 1.0),
                mu2: clamp_f64("moving_edge.mu2", me.mu2, 0.0, 1.0),
                sample_step: clamp_f64("moving_edge.sample_step", me.sample_step, 1.0, 50.0),
                strip: clamp_u32("moving_edge.strip", me.strip, 0, 10),
            },
            klt: KltSettings {
                max_features: clamp_u32("klt.max_features", klt.max_features, 0, 30_000),
                window_size: clamp_u32("klt.window_size", klt.window_size, 3, 15),
                quality: clamp_f64("klt.quality", klt.quality, 1e-4, 1.0),
                min_distance: clamp_f64("klt.min_distance", klt.min_distance, 0.0, 100.0),
                harris: clamp_f64("klt.harris", klt.harris, 1e-4, 1.0),
                block_size: clamp_u32("klt.block_size", klt.block_size, 3, 9),
                pyramid_levels: clamp_u32("klt.pyramid_levels", klt.pyramid_levels, 0, 5),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_already_sane() {
        let s = TrackerSettings::default();
        assert_eq!(s.sanitized(), s);
    }

    #[test]
    fn test_out_of_range_values_are_clamped_not_fatal() {
        let mut s = TrackerSettings::default();
        s.moving_edge.mu1 = 3.5;
        s.moving_edge.range = 1000;
        s.klt.quality = -1.0;
        s.angle_appear_deg = 400.0;

        let clean = s.sanitized();
        assert_eq!(clean.moving_edge.mu1, 1.0);
        assert_eq!(clean.moving_edge.range, 50);
        assert_eq!(clean.klt.quality, 1e-4);
        assert_eq!(clean.angle_appear_deg, 90.0);
    }

    #[test]
    fn test_even_mask_size_becomes_odd() {
        let mut s = TrackerSettings::default();
        s.moving_edge.mask_size = 6;
        assert_eq!(s.sanitized().moving_edge.mask_size, 7);
    }

    #[test]
    fn test_non_finite_replaced() {
        let mut s = TrackerSettings::default();
        s.moving_edge.threshold = f64::NAN;
        assert_eq!(s.sanitized().moving_edge.threshold, 0.0);
    }

    #[test]
    fn test_toml_round_trip_with_partial_file() {
        let text = "angle_appear_deg = 60.0\n[moving_edge]\nrange = 20\n";
        let s: TrackerSettings = toml::from_str(text).unwrap();
        assert_eq!(s.angle_appear_deg, 60.0);
        assert_eq!(s.moving_edge.range, 20);
        // Unspecified fields fall back to defaults.
        assert_eq!(s.klt.window_size, default_window_size());
    }
}
