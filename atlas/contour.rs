//! Marching-squares contour extraction for gridded scalar fields.
//!
//! Used to turn the bathymetry provider's depth grid into iso-depth line
//! work for the survey map. Output is an unordered set of line segments in
//! the grid's own coordinate system; the renderer projects and draws them
//! directly, so no polyline chaining is needed.

/// A regular scalar grid, row-major with row 0 at `y0` and values growing
/// along `dx`/`dy`. Missing cells hold NaN.
#[derive(Debug, Clone)]
pub struct ScalarGrid {
    pub x0: f64,
    pub y0: f64,
    pub dx: f64,
    pub dy: f64,
    pub ncols: usize,
    pub nrows: usize,
    pub values: Vec<f64>,
}

impl ScalarGrid {
    pub fn value(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.ncols + col]
    }

    fn corner(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.x0 + col as f64 * self.dx,
            self.y0 + row as f64 * self.dy,
        )
    }

    /// Range of finite values, if any.
    pub fn finite_range(&self) -> Option<(f64, f64)> {
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for &v in &self.values {
            if v.is_finite() {
                lo = lo.min(v);
                hi = hi.max(v);
            }
        }
        (lo <= hi).then_some((lo, hi))
    }
}

/// One contour segment, endpoints in grid coordinates.
pub type Segment = ((f64, f64), (f64, f64));

/// Extracts the iso-line of `level` from the grid. Cells with any NaN corner
/// are skipped. The ambiguous saddle cases (5 and 10) are resolved by the
/// cell-center average, the common disambiguation.
pub fn contour_segments(grid: &ScalarGrid, level: f64) -> Vec<Segment> {
    let mut segments = Vec::new();
    if grid.nrows < 2 || grid.ncols < 2 {
        return segments;
    }

    for row in 0..grid.nrows - 1 {
        for col in 0..grid.ncols - 1 {
            // Corners counter-clockwise from bottom-left of the cell.
            let v00 = grid.value(row, col);
            let v01 = grid.value(row, col + 1);
            let v11 = grid.value(row + 1, col + 1);
            let v10 = grid.value(row + 1, col);
            if !(v00.is_finite() && v01.is_finite() && v11.is_finite() && v10.is_finite()) {
                continue;
            }

            let mut case = 0u8;
            if v00 >= level {
                case |= 1;
            }
            if v01 >= level {
                case |= 2;
            }
            if v11 >= level {
                case |= 4;
            }
            if v10 >= level {
                case |= 8;
            }
            if case == 0 || case == 15 {
                continue;
            }

            let p00 = grid.corner(row, col);
            let p01 = grid.corner(row, col + 1);
            let p11 = grid.corner(row + 1, col + 1);
            let p10 = grid.corner(row + 1, col);

            // Edge crossings, linearly interpolated.
            let bottom = || interpolate(p00, p01, v00, v01, level);
            let right = || interpolate(p01, p11, v01, v11, level);
            let top = || interpolate(p10, p11, v10, v11, level);
            let left = || interpolate(p00, p10, v00, v10, level);

            match case {
                1 | 14 => segments.push((left(), bottom())),
                2 | 13 => segments.push((bottom(), right())),
                3 | 12 => segments.push((left(), right())),
                4 | 11 => segments.push((right(), top())),
                6 | 9 => segments.push((bottom(), top())),
                7 | 8 => segments.push((left(), top())),
                5 | 10 => {
                    let center = 0.25 * (v00 + v01 + v11 + v10);
                    let center_high = center >= level;
                    // Saddle: two segments, paired by the center sign.
                    if (case == 5) == center_high {
                        segments.push((left(), top()));
                        segments.push((bottom(), right()));
                    } else {
                        segments.push((left(), bottom()));
                        segments.push((right(), top()));
                    }
                }
                _ => unreachable!("cases 0 and 15 are filtered above"),
            }
        }
    }
    segments
}

fn interpolate(
    a: (f64, f64),
    b: (f64, f64),
    va: f64,
    vb: f64,
    level: f64,
) -> (f64, f64) {
    let denom = vb - va;
    let t = if denom.abs() < 1e-12 {
        0.5
    } else {
        ((level - va) / denom).clamp(0.0, 1.0)
    };
    (a.0 + t * (b.0 - a.0), a.1 + t * (b.1 - a.1))
}
