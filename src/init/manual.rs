//! Manual initialization: point correspondence entry.
//!
//! The initializer walks the model's ordered init points and asks a
//! `CorrespondenceProvider` for the matching image location of each,
//! polling at a bounded rate so an interactive provider (a user clicking
//! or typing) has time to respond and the exit signal stays observable.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nalgebra::{Vector2, Vector3};
use tracing::debug;

use crate::error::InitError;
use crate::geometry::SE3;
use crate::msg::Frame;

/// Answer to a correspondence request.
pub enum ProviderResponse {
    /// Image location of the requested model point.
    Point(Vector2<f64>),
    /// Not available yet; poll again.
    Pending,
    /// The provider cannot supply any more points.
    Closed,
}

/// Source of 2D image points matched against the model's 3D init points.
pub trait CorrespondenceProvider {
    /// Request the image location of init point `index`.
    fn request_point(
        &mut self,
        index: usize,
        model_point: &Vector3<f64>,
        frame: &Frame,
    ) -> ProviderResponse;

    /// Ask whether a computed pose is acceptable (used when the client
    /// runs with init confirmation enabled). Defaults to accepting.
    fn confirm(&mut self, _pose: &SE3, _frame: &Frame) -> bool {
        true
    }
}

/// Collect one image point per model init point, polling the provider at
/// `poll_interval`. Returns `Cancelled` as soon as the exit flag is set.
pub fn gather_correspondences(
    model_points: &[Vector3<f64>],
    frame: &Frame,
    provider: &mut dyn CorrespondenceProvider,
    poll_interval: Duration,
    exiting: &Arc<AtomicBool>,
) -> Result<Vec<Vector2<f64>>, InitError> {
    let mut image_points = Vec::with_capacity(model_points.len());
    for (index, model_point) in model_points.iter().enumerate() {
        loop {
            if exiting.load(Ordering::SeqCst) {
                return Err(InitError::Cancelled);
            }
            match provider.request_point(index, model_point, frame) {
                ProviderResponse::Point(p) => {
                    debug!(index, x = p.x, y = p.y, "correspondence entered");
                    image_points.push(p);
                    break;
                }
                ProviderResponse::Pending => std::thread::sleep(poll_interval),
                ProviderResponse::Closed => {
                    return Err(InitError::ProviderClosed {
                        needed: model_points.len(),
                    })
                }
            }
        }
    }
    Ok(image_points)
}

/// Scripted provider driven by a fixed point list. Used by tests and by
/// replay runs with pre-recorded clicks.
pub struct ScriptedProvider {
    points: Vec<Vector2<f64>>,
    pub accept_pose: bool,
}

impl ScriptedProvider {
    pub fn new(points: Vec<Vector2<f64>>) -> Self {
        Self {
            points,
            accept_pose: true,
        }
    }
}

impl CorrespondenceProvider for ScriptedProvider {
    fn request_point(
        &mut self,
        index: usize,
        _model_point: &Vector3<f64>,
        _frame: &Frame,
    ) -> ProviderResponse {
        match self.points.get(index) {
            Some(p) => ProviderResponse::Point(*p),
            None => ProviderResponse::Closed,
        }
    }

    fn confirm(&mut self, _pose: &SE3, _frame: &Frame) -> bool {
        self.accept_pose
    }
}

/// Interactive provider reading `u v` pixel pairs from stdin.
pub struct StdinProvider;

impl CorrespondenceProvider for StdinProvider {
    fn request_point(
        &mut self,
        index: usize,
        model_point: &Vector3<f64>,
        _frame: &Frame,
    ) -> ProviderResponse {
        print!(
            "point {index} at model ({:.4}, {:.4}, {:.4}) - enter `u v`: ",
            model_point.x, model_point.y, model_point.z
        );
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return ProviderResponse::Closed;
        }
        let mut it = line.split_whitespace();
        match (
            it.next().and_then(|s| s.parse::<f64>().ok()),
            it.next().and_then(|s| s.parse::<f64>().ok()),
        ) {
            (Some(u), Some(v)) => ProviderResponse::Point(Vector2::new(u, v)),
            _ => ProviderResponse::Pending,
        }
    }
}
