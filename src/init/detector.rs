//! Fiducial marker detection for automatic pose initialization.
//!
//! Two marker kinds are supported, selected by configuration: a
//! QR-style code with finder blocks in three corners and a
//! DataMatrix-style code with a timing row. Both share the same
//! localization front end: Otsu binarization, largest dark connected
//! component, quad corners from the component extremes, then grid
//! sampling through a square-to-quad projective map to verify the
//! pattern and decode the identity.

use image::GrayImage;
use nalgebra::Vector2;

/// Marker payload grid (cells per side, border ring included).
const GRID: usize = 8;
/// Smallest connected component considered a marker candidate (pixels).
const MIN_COMPONENT_AREA: usize = 200;
/// Fraction of border cells that must be dark.
const BORDER_DARK_RATIO: f64 = 0.85;

/// The two supported fiducial kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashcodeKind {
    Qr,
    DataMatrix,
}

/// A detected marker: decoded identity plus the four outer corners in
/// pixel coordinates, ordered top-left, top-right, bottom-right,
/// bottom-left.
#[derive(Debug, Clone)]
pub struct DetectorResult {
    pub kind: FlashcodeKind,
    pub id: u32,
    pub corners: [Vector2<f64>; 4],
}

/// Capability interface over the detector variants.
pub trait FiducialDetector: Send {
    fn kind(&self) -> FlashcodeKind;
    /// `None` when no marker of this kind is visible in the image.
    fn detect(&self, image: &GrayImage) -> Option<DetectorResult>;
}

#[derive(Debug, Default)]
pub struct QrFlashcodeDetector;

#[derive(Debug, Default)]
pub struct DataMatrixDetector;

impl FiducialDetector for QrFlashcodeDetector {
    fn kind(&self) -> FlashcodeKind {
        FlashcodeKind::Qr
    }

    fn detect(&self, image: &GrayImage) -> Option<DetectorResult> {
        detect_kind(image, FlashcodeKind::Qr)
    }
}

impl FiducialDetector for DataMatrixDetector {
    fn kind(&self) -> FlashcodeKind {
        FlashcodeKind::DataMatrix
    }

    fn detect(&self, image: &GrayImage) -> Option<DetectorResult> {
        detect_kind(image, FlashcodeKind::DataMatrix)
    }
}

fn detect_kind(image: &GrayImage, kind: FlashcodeKind) -> Option<DetectorResult> {
    let binary = binarize(image);
    let corners = locate_quad(&binary, image.width() as usize, image.height() as usize)?;
    let sampler = QuadSampler::new(&corners)?;
    let cells = sampler.sample_grid(&binary, image.width() as usize);

    if !border_is_dark(&cells) {
        return None;
    }
    let id = match kind {
        FlashcodeKind::Qr => decode_qr(&cells)?,
        FlashcodeKind::DataMatrix => decode_datamatrix(&cells)?,
    };
    Some(DetectorResult { kind, id, corners })
}

/// Otsu global threshold; true = dark (marker foreground).
fn binarize(image: &GrayImage) -> Vec<bool> {
    let mut hist = [0u32; 256];
    for p in image.pixels() {
        hist[p.0[0] as usize] += 1;
    }
    let total: u64 = image.width() as u64 * image.height() as u64;
    let sum_all: u64 = hist
        .iter()
        .enumerate()
        .map(|(v, &c)| v as u64 * c as u64)
        .sum();

    let mut best_t = 127usize;
    let mut best_var = -1.0f64;
    let mut w0: u64 = 0;
    let mut sum0: u64 = 0;
    for t in 0..256 {
        w0 += hist[t] as u64;
        if w0 == 0 {
            continue;
        }
        let w1 = total - w0;
        if w1 == 0 {
            break;
        }
        sum0 += t as u64 * hist[t] as u64;
        let m0 = sum0 as f64 / w0 as f64;
        let m1 = (sum_all - sum0) as f64 / w1 as f64;
        let var = w0 as f64 * w1 as f64 * (m0 - m1) * (m0 - m1);
        if var > best_var {
            best_var = var;
            best_t = t;
        }
    }

    image.pixels().map(|p| (p.0[0] as usize) <= best_t).collect()
}

/// Largest dark connected component; returns its quad corners from the
/// four diagonal extremes (TL, TR, BR, BL).
fn locate_quad(binary: &[bool], width: usize, height: usize) -> Option<[Vector2<f64>; 4]> {
    let mut visited = vec![false; binary.len()];
    let mut best: Option<(usize, [Vector2<f64>; 4])> = None;
    let mut stack = Vec::new();

    for start in 0..binary.len() {
        if !binary[start] || visited[start] {
            continue;
        }
        stack.push(start);
        visited[start] = true;
        let mut area = 0usize;
        // Extremes of x+y, x-y pick out the diagonal corners.
        let mut tl = (i64::MAX, 0usize);
        let mut br = (i64::MIN, 0usize);
        let mut tr = (i64::MIN, 0usize);
        let mut bl = (i64::MAX, 0usize);

        while let Some(idx) = stack.pop() {
            area += 1;
            let x = (idx % width) as i64;
            let y = (idx / width) as i64;
            let sum = x + y;
            let diff = x - y;
            if sum < tl.0 {
                tl = (sum, idx);
            }
            if sum > br.0 {
                br = (sum, idx);
            }
            if diff > tr.0 {
                tr = (diff, idx);
            }
            if diff < bl.0 {
                bl = (diff, idx);
            }

            let (xu, yu) = (idx % width, idx / width);
            let mut push = |nx: usize, ny: usize| {
                let n = ny * width + nx;
                if binary[n] && !visited[n] {
                    visited[n] = true;
                    stack.push(n);
                }
            };
            if xu > 0 {
                push(xu - 1, yu);
            }
            if xu + 1 < width {
                push(xu + 1, yu);
            }
            if yu > 0 {
                push(xu, yu - 1);
            }
            if yu + 1 < height {
                push(xu, yu + 1);
            }
        }

        if area < MIN_COMPONENT_AREA {
            continue;
        }
        let corner = |(_, idx): (i64, usize)| {
            Vector2::new((idx % width) as f64, (idx / width) as f64)
        };
        let quad = [corner(tl), corner(tr), corner(br), corner(bl)];
        if best.as_ref().map_or(true, |(a, _)| area > *a) {
            best = Some((area, quad));
        }
    }
    best.map(|(_, q)| q)
}

/// Projective map from the unit square to a quad (Heckbert's
/// square-to-quad form), used to sample the marker grid.
struct QuadSampler {
    a: Vector2<f64>,
    b: Vector2<f64>,
    c: Vector2<f64>,
    g: f64,
    h: f64,
}

impl QuadSampler {
    fn new(corners: &[Vector2<f64>; 4]) -> Option<Self> {
        let [p0, p1, p2, p3] = *corners; // TL, TR, BR, BL
        let d1 = p1 - p2;
        let d2 = p3 - p2;
        let s = p0 - p1 + p2 - p3;
        let cross = |u: Vector2<f64>, v: Vector2<f64>| u.x * v.y - u.y * v.x;

        let denom = cross(d1, d2);
        if denom.abs() < f64::EPSILON {
            return None;
        }
        let (g, h) = if s.norm() < 1e-9 {
            (0.0, 0.0) // parallelogram: affine map
        } else {
            (cross(s, d2) / denom, cross(d1, s) / denom)
        };
        let a = p1 - p0 + g * p1;
        let b = p3 - p0 + h * p3;
        Some(Self { a, b, c: p0, g, h })
    }

    fn map(&self, u: f64, v: f64) -> Vector2<f64> {
        (self.c + self.a * u + self.b * v) / (1.0 + self.g * u + self.h * v)
    }

    /// Sample each grid cell at its center; true = dark.
    fn sample_grid(&self, binary: &[bool], width: usize) -> [[bool; GRID]; GRID] {
        let mut cells = [[false; GRID]; GRID];
        let height = binary.len() / width;
        for (row, row_cells) in cells.iter_mut().enumerate() {
            for (col, cell) in row_cells.iter_mut().enumerate() {
                let u = (col as f64 + 0.5) / GRID as f64;
                let v = (row as f64 + 0.5) / GRID as f64;
                let p = self.map(u, v);
                let x = p.x.round() as i64;
                let y = p.y.round() as i64;
                if x >= 0 && y >= 0 && (x as usize) < width && (y as usize) < height {
                    *cell = binary[y as usize * width + x as usize];
                }
            }
        }
        cells
    }
}

fn border_is_dark(cells: &[[bool; GRID]; GRID]) -> bool {
    let mut dark = 0usize;
    let mut total = 0usize;
    for i in 0..GRID {
        for &(r, c) in &[(0, i), (GRID - 1, i), (i, 0), (i, GRID - 1)] {
            total += 1;
            if cells[r][c] {
                dark += 1;
            }
        }
    }
    dark as f64 / total as f64 >= BORDER_DARK_RATIO
}

/// QR-style: dark finder cells in the TL, TR and BL interior corners and
/// a light alignment cell in the BR corner. Identity from rows 2..GRID-2.
fn decode_qr(cells: &[[bool; GRID]; GRID]) -> Option<u32> {
    let n = GRID - 2;
    if !(cells[1][1] && cells[1][n] && cells[n][1]) || cells[n][n] {
        return None;
    }
    Some(decode_payload(cells, 2))
}

/// DataMatrix-style: alternating timing pattern along the interior top
/// row. Identity from rows 2..GRID-2.
fn decode_datamatrix(cells: &[[bool; GRID]; GRID]) -> Option<u32> {
    for col in 1..GRID - 1 {
        let expect_dark = col % 2 == 1;
        if cells[1][col] != expect_dark {
            return None;
        }
    }
    Some(decode_payload(cells, 2))
}

/// Pack the payload cells into a little-endian id.
fn decode_payload(cells: &[[bool; GRID]; GRID], first_row: usize) -> u32 {
    let mut id = 0u32;
    let mut bit = 0u32;
    for row in first_row..GRID - 2 {
        for col in 2..GRID - 2 {
            if bit < 32 && cells[row][col] {
                id |= 1 << bit;
            }
            bit += 1;
        }
    }
    id
}

/// Render a synthetic marker for tests and the demo replay source.
pub fn render_marker(
    kind: FlashcodeKind,
    id: u32,
    top_left: (u32, u32),
    cell_px: u32,
    canvas: &mut GrayImage,
) -> [Vector2<f64>; 4] {
    let mut cells = [[false; GRID]; GRID];
    // Border ring.
    for i in 0..GRID {
        cells[0][i] = true;
        cells[GRID - 1][i] = true;
        cells[i][0] = true;
        cells[i][GRID - 1] = true;
    }
    let n = GRID - 2;
    match kind {
        FlashcodeKind::Qr => {
            cells[1][1] = true;
            cells[1][n] = true;
            cells[n][1] = true;
            cells[n][n] = false;
        }
        FlashcodeKind::DataMatrix => {
            for col in 1..GRID - 1 {
                cells[1][col] = col % 2 == 1;
            }
        }
    }
    let mut bit = 0u32;
    for row in 2..GRID - 2 {
        for col in 2..GRID - 2 {
            cells[row][col] = bit < 32 && (id >> bit) & 1 == 1;
            bit += 1;
        }
    }

    for (row, row_cells) in cells.iter().enumerate() {
        for (col, &dark) in row_cells.iter().enumerate() {
            let value = if dark { 10u8 } else { 245u8 };
            for dy in 0..cell_px {
                for dx in 0..cell_px {
                    let x = top_left.0 + col as u32 * cell_px + dx;
                    let y = top_left.1 + row as u32 * cell_px + dy;
                    if x < canvas.width() && y < canvas.height() {
                        canvas.put_pixel(x, y, image::Luma([value]));
                    }
                }
            }
        }
    }

    let edge = (GRID as u32 * cell_px) as f64;
    let (x0, y0) = (top_left.0 as f64, top_left.1 as f64);
    [
        Vector2::new(x0, y0),
        Vector2::new(x0 + edge - 1.0, y0),
        Vector2::new(x0 + edge - 1.0, y0 + edge - 1.0),
        Vector2::new(x0, y0 + edge - 1.0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank(w: u32, h: u32) -> GrayImage {
        GrayImage::from_pixel(w, h, image::Luma([245]))
    }

    #[test]
    fn test_qr_marker_detected_with_id() {
        let mut img = blank(320, 240);
        let corners = render_marker(FlashcodeKind::Qr, 0xA5, (80, 60), 12, &mut img);

        let det = QrFlashcodeDetector.detect(&img).expect("marker visible");
        assert_eq!(det.id, 0xA5);
        for (found, truth) in det.corners.iter().zip(corners.iter()) {
            assert!((found - truth).norm() < 3.0, "corner off: {found} vs {truth}");
        }
    }

    #[test]
    fn test_datamatrix_marker_detected() {
        let mut img = blank(320, 240);
        render_marker(FlashcodeKind::DataMatrix, 7, (100, 80), 10, &mut img);

        let det = DataMatrixDetector.detect(&img).expect("marker visible");
        assert_eq!(det.kind, FlashcodeKind::DataMatrix);
        assert_eq!(det.id, 7);
    }

    #[test]
    fn test_kinds_do_not_cross_detect() {
        let mut img = blank(320, 240);
        render_marker(FlashcodeKind::Qr, 3, (80, 60), 12, &mut img);
        assert!(DataMatrixDetector.detect(&img).is_none());
    }

    #[test]
    fn test_blank_image_yields_none() {
        let img = blank(320, 240);
        assert!(QrFlashcodeDetector.detect(&img).is_none());
        assert!(DataMatrixDetector.detect(&img).is_none());
    }
}
