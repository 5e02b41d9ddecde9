//! Initial pose persistence.
//!
//! A pose is stored as a fixed six-line text record: translation x, y, z
//! followed by the axis-angle (theta-u) rotation components. Written on
//! demand after a pose validates; read at startup when the client is
//! configured to resume from a saved pose.

use std::io;
use std::path::Path;

use nalgebra::Vector3;

use crate::geometry::SE3;

/// Write the pose record, creating parent directories as needed.
pub fn save_pose<P: AsRef<Path>>(path: P, pose: &SE3) -> io::Result<()> {
    if let Some(parent) = path.as_ref().parent() {
        std::fs::create_dir_all(parent)?;
    }
    let t = pose.translation;
    let tu = pose.theta_u();
    let record = format!(
        "{:.12}\n{:.12}\n{:.12}\n{:.12}\n{:.12}\n{:.12}\n",
        t.x, t.y, t.z, tu.x, tu.y, tu.z
    );
    std::fs::write(path, record)
}

/// Read a pose record. `Ok(None)` when the file does not exist; a
/// malformed record is an `InvalidData` error.
pub fn load_pose<P: AsRef<Path>>(path: P) -> io::Result<Option<SE3>> {
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let values: Vec<f64> = content
        .split_whitespace()
        .map(|s| s.parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if values.len() != 6 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("pose record has {} values, expected 6", values.len()),
        ));
    }

    Ok(Some(SE3::from_tu(
        Vector3::new(values[0], values[1], values[2]),
        Vector3::new(values[3], values[4], values[5]),
    )))
}
