//! Initialization-points file parsing.
//!
//! The file is an ordered list of 3D model points used for manual
//! correspondence entry: one `x,y,z` row per point, `#` comments
//! allowed. At least four points are required for a pose solve.

use nalgebra::Vector3;

use crate::error::ClientError;
use crate::geometry::pnp::MIN_POINTS_PLANAR;

/// Parse init points from raw file bytes.
pub fn parse_init_points(bytes: &[u8]) -> Result<Vec<Vector3<f64>>, ClientError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .flexible(false)
        .from_reader(bytes);

    let mut points = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record =
            record.map_err(|e| ClientError::Model(format!("init points row {row}: {e}")))?;
        if record.len() != 3 {
            return Err(ClientError::Model(format!(
                "init points row {row}: expected 3 fields, got {}",
                record.len()
            )));
        }
        let mut coords = [0.0f64; 3];
        for (k, field) in record.iter().enumerate() {
            coords[k] = field.parse().map_err(|e| {
                ClientError::Model(format!("init points row {row} field {k}: {e}"))
            })?;
        }
        points.push(Vector3::new(coords[0], coords[1], coords[2]));
    }

    if points.len() < MIN_POINTS_PLANAR {
        return Err(ClientError::Model(format!(
            "init points file has {} points; at least {MIN_POINTS_PLANAR} required",
            points.len()
        )));
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_file() {
        let data = b"# cube corners\n0,0,0\n0.1,0,0\n0.1,0.1,0\n0,0.1,0\n";
        let pts = parse_init_points(data).unwrap();
        assert_eq!(pts.len(), 4);
        assert_eq!(pts[1], Vector3::new(0.1, 0.0, 0.0));
    }

    #[test]
    fn test_order_is_preserved() {
        let data = b"1,0,0\n2,0,0\n3,0,0\n4,0,0\n";
        let pts = parse_init_points(data).unwrap();
        let xs: Vec<f64> = pts.iter().map(|p| p.x).collect();
        assert_eq!(xs, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_too_few_points_rejected() {
        let data = b"0,0,0\n1,0,0\n";
        assert!(parse_init_points(data).is_err());
    }

    #[test]
    fn test_malformed_row_rejected() {
        let data = b"0,0,0\n0.1,zero,0\n0.1,0.1,0\n0,0.1,0\n";
        assert!(parse_init_points(data).is_err());
    }
}
