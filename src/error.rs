//! Error taxonomy for the tracker client.
//!
//! Startup errors (resource fetch, advertisement) abort the process.
//! Steady-state errors are reported per iteration and the loop decides
//! whether to continue based on the variant.

use std::path::PathBuf;

use thiserror::Error;

/// Failed to resolve a model resource URI to local bytes. Fatal at
/// startup, never retried.
#[derive(Debug, Error)]
pub enum ResourceFetchError {
    #[error("unsupported resource scheme in `{0}`")]
    UnsupportedScheme(String),
    #[error("package root not configured; cannot resolve `{0}`")]
    NoPackageRoot(String),
    #[error("failed to read `{path}`: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write `{path}`: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// An expected input stream never appeared. Fatal at startup after the
/// configured timeout.
#[derive(Debug, Error)]
#[error("input streams not advertised within {timeout_ms} ms: {missing:?}")]
pub struct AdvertisementError {
    pub timeout_ms: u64,
    pub missing: Vec<String>,
}

/// Errors raised while establishing the initial pose.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("fiducial detection failed after {attempts} attempts")]
    Detection { attempts: u32 },
    #[error("pose validation failed: mean reprojection error {error_px:.2} px exceeds {threshold_px:.2} px")]
    Validation { error_px: f64, threshold_px: f64 },
    #[error("initialization retries exhausted after {rounds} rounds")]
    RetriesExhausted { rounds: u32 },
    #[error("input streams cancelled during initialization")]
    Cancelled,
    #[error("correspondence provider closed before {needed} points were entered")]
    ProviderClosed { needed: usize },
    #[error(transparent)]
    Solve(#[from] SolveError),
}

/// Pose-from-points solve failures.
#[derive(Debug, Error)]
pub enum SolveError {
    #[error("need at least {needed} correspondences, got {got}")]
    TooFewPoints { needed: usize, got: usize },
    #[error("degenerate point configuration")]
    Degenerate,
    #[error("SVD failed to converge")]
    SvdFailed,
}

/// Per-frame tracking failures reported by the engine.
#[derive(Debug, Error)]
pub enum TrackingError {
    /// The engine lost the object. The loop may continue or terminate
    /// depending on the client policy.
    #[error("lost track of the object")]
    Lost,
    /// Unrecoverable engine failure; always terminates the loop.
    #[error("tracking engine failure: {0}")]
    Engine(String),
}

/// Top-level client errors (startup plus loop-terminating conditions).
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Fetch(#[from] ResourceFetchError),
    #[error(transparent)]
    Advertisement(#[from] AdvertisementError),
    #[error("pose initialization failed: {0}")]
    Init(#[from] InitError),
    #[error("model file error: {0}")]
    Model(String),
    #[error(transparent)]
    Tracking(#[from] TrackingError),
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;
