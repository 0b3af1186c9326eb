//! Pixel-level drawing: a world-coordinate canvas over an RGB image buffer,
//! plus the regular-grid inference used to rasterize prediction grids.

use super::style::Rgb;
use super::AtlasError;
use image::RgbImage;
use std::path::Path;

/// Geographic bounding box in the working (projected) coordinate system.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    /// Smallest box covering a point stream; None for an empty stream.
    pub fn from_points(points: impl IntoIterator<Item = (f64, f64)>) -> Option<Bounds> {
        let mut bounds: Option<Bounds> = None;
        for (x, y) in points {
            if !(x.is_finite() && y.is_finite()) {
                continue;
            }
            bounds = Some(match bounds {
                None => Bounds {
                    min_x: x,
                    min_y: y,
                    max_x: x,
                    max_y: y,
                },
                Some(b) => Bounds {
                    min_x: b.min_x.min(x),
                    min_y: b.min_y.min(y),
                    max_x: b.max_x.max(x),
                    max_y: b.max_y.max(y),
                },
            });
        }
        bounds
    }

    pub fn union(self, other: Bounds) -> Bounds {
        Bounds {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// Expands every side by `fraction` of the larger span.
    pub fn with_margin(self, fraction: f64) -> Bounds {
        let span = (self.max_x - self.min_x).max(self.max_y - self.min_y);
        let pad = span * fraction;
        Bounds {
            min_x: self.min_x - pad,
            min_y: self.min_y - pad,
            max_x: self.max_x + pad,
            max_y: self.max_y + pad,
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// Infers the cell edge length of a regular grid from one coordinate axis:
/// the smallest positive gap between distinct sorted values.
pub fn infer_cell_size(coords: &[f64]) -> Option<f64> {
    let mut sorted: Vec<f64> = coords.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mut smallest = f64::INFINITY;
    for pair in sorted.windows(2) {
        let gap = pair[1] - pair[0];
        if gap > 1e-9 && gap < smallest {
            smallest = gap;
        }
    }
    smallest.is_finite().then_some(smallest)
}

/// An RGB drawing surface addressed in world coordinates (meters), y up.
pub struct Canvas {
    image: RgbImage,
    bounds: Bounds,
    scale: f64,
}

impl Canvas {
    /// Creates a canvas `width_px` wide; the height follows the bounds'
    /// aspect ratio.
    pub fn new(bounds: Bounds, width_px: u32, background: Rgb) -> Result<Canvas, AtlasError> {
        if !(bounds.width() > 0.0 && bounds.height() > 0.0) {
            return Err(AtlasError::Render(format!(
                "degenerate map bounds: {bounds:?}"
            )));
        }
        let scale = width_px as f64 / bounds.width();
        let height_px = ((bounds.height() * scale).ceil() as u32).max(1);
        let image = RgbImage::from_pixel(width_px, height_px, image::Rgb(background));
        Ok(Canvas {
            image,
            bounds,
            scale,
        })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Meters per pixel.
    pub fn resolution(&self) -> f64 {
        1.0 / self.scale
    }

    /// World to pixel; y axis flips so north is up.
    pub fn to_pixel(&self, x: f64, y: f64) -> (i64, i64) {
        let px = (x - self.bounds.min_x) * self.scale;
        let py = (self.bounds.max_y - y) * self.scale;
        (px.floor() as i64, py.floor() as i64)
    }

    pub fn put(&mut self, px: i64, py: i64, color: Rgb) {
        if px >= 0 && py >= 0 && (px as u32) < self.image.width() && (py as u32) < self.image.height()
        {
            self.image.put_pixel(px as u32, py as u32, image::Rgb(color));
        }
    }

    /// Bresenham line between two world points. Segments entirely off the
    /// canvas on one side are rejected; context layers routinely extend far
    /// beyond the mapped area.
    pub fn draw_line(&mut self, from: (f64, f64), to: (f64, f64), color: Rgb) {
        let (mut x0, mut y0) = self.to_pixel(from.0, from.1);
        let (x1, y1) = self.to_pixel(to.0, to.1);
        let w = self.image.width() as i64;
        let h = self.image.height() as i64;
        if (x0 < 0 && x1 < 0)
            || (y0 < 0 && y1 < 0)
            || (x0 >= w && x1 >= w)
            || (y0 >= h && y1 >= h)
        {
            return;
        }
        let dx = (x1 - x0).abs();
        let dy = -(y1 - y0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;
        loop {
            self.put(x0, y0, color);
            if x0 == x1 && y0 == y1 {
                break;
            }
            let doubled = 2 * err;
            if doubled >= dy {
                err += dy;
                x0 += sx;
            }
            if doubled <= dx {
                err += dx;
                y0 += sy;
            }
        }
    }

    pub fn draw_polyline(&mut self, points: &[(f64, f64)], color: Rgb) {
        for pair in points.windows(2) {
            self.draw_line(pair[0], pair[1], color);
        }
    }

    /// Even-odd scanline fill of a closed ring given in world coordinates.
    pub fn fill_polygon(&mut self, ring: &[(f64, f64)], color: Rgb) {
        if ring.len() < 3 {
            return;
        }
        let pixels: Vec<(f64, f64)> = ring
            .iter()
            .map(|&(x, y)| {
                let (px, py) = self.to_pixel(x, y);
                (px as f64, py as f64)
            })
            .collect();

        let y_min = pixels.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
        let y_max = pixels.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);
        let y_start = (y_min.floor() as i64).max(0);
        let y_end = (y_max.ceil() as i64).min(self.image.height() as i64 - 1);

        for py in y_start..=y_end {
            let scan = py as f64 + 0.5;
            let mut crossings = Vec::new();
            for i in 0..pixels.len() {
                let (x0, y0) = pixels[i];
                let (x1, y1) = pixels[(i + 1) % pixels.len()];
                if (y0 <= scan && y1 > scan) || (y1 <= scan && y0 > scan) {
                    let t = (scan - y0) / (y1 - y0);
                    crossings.push(x0 + t * (x1 - x0));
                }
            }
            crossings
                .sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            for pair in crossings.chunks_exact(2) {
                let x_from = pair[0].floor() as i64;
                let x_to = pair[1].ceil() as i64;
                for px in x_from..=x_to {
                    self.put(px, py, color);
                }
            }
        }
    }

    /// Fills an axis-aligned world rectangle; the seasonal grid cells.
    pub fn fill_rect(&mut self, center: (f64, f64), half_width: f64, color: Rgb) {
        let (px0, py0) = self.to_pixel(center.0 - half_width, center.1 + half_width);
        let (px1, py1) = self.to_pixel(center.0 + half_width, center.1 - half_width);
        for py in py0..=py1 {
            for px in px0..=px1 {
                self.put(px, py, color);
            }
        }
    }

    /// Filled disc of `radius_px` pixels; the observation points.
    pub fn fill_disc(&mut self, center: (f64, f64), radius_px: i64, color: Rgb) {
        let (cx, cy) = self.to_pixel(center.0, center.1);
        for dy in -radius_px..=radius_px {
            for dx in -radius_px..=radius_px {
                if dx * dx + dy * dy <= radius_px * radius_px {
                    self.put(cx + dx, cy + dy, color);
                }
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), AtlasError> {
        self.image.save(path)?;
        Ok(())
    }

    #[cfg(test)]
    pub fn pixel(&self, px: u32, py: u32) -> Rgb {
        self.image.get_pixel(px, py).0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Rgb = [255, 0, 0];
    const WHITE: Rgb = [255, 255, 255];

    fn unit_canvas() -> Canvas {
        let bounds = Bounds {
            min_x: 0.0,
            min_y: 0.0,
            max_x: 100.0,
            max_y: 100.0,
        };
        Canvas::new(bounds, 100, WHITE).unwrap()
    }

    #[test]
    fn cell_size_from_repeated_coordinates() {
        let xs = [0.0, 500.0, 1000.0, 0.0, 500.0, 1000.0];
        assert_eq!(infer_cell_size(&xs), Some(500.0));
    }

    #[test]
    fn cell_size_of_constant_axis_is_none() {
        assert_eq!(infer_cell_size(&[5.0, 5.0, 5.0]), None);
        assert_eq!(infer_cell_size(&[]), None);
    }

    #[test]
    fn canvas_height_follows_aspect_ratio() {
        let bounds = Bounds {
            min_x: 0.0,
            min_y: 0.0,
            max_x: 200.0,
            max_y: 100.0,
        };
        let canvas = Canvas::new(bounds, 400, WHITE).unwrap();
        assert_eq!(canvas.width(), 400);
        assert_eq!(canvas.height(), 200);
    }

    #[test]
    fn degenerate_bounds_are_rejected() {
        let bounds = Bounds {
            min_x: 1.0,
            min_y: 0.0,
            max_x: 1.0,
            max_y: 5.0,
        };
        assert!(Canvas::new(bounds, 100, WHITE).is_err());
    }

    #[test]
    fn north_is_up() {
        let canvas = unit_canvas();
        let (_, py_high) = canvas.to_pixel(50.0, 90.0);
        let (_, py_low) = canvas.to_pixel(50.0, 10.0);
        assert!(py_high < py_low);
    }

    #[test]
    fn filled_polygon_covers_interior_not_exterior() {
        let mut canvas = unit_canvas();
        let square = [
            (20.0, 20.0),
            (80.0, 20.0),
            (80.0, 80.0),
            (20.0, 80.0),
            (20.0, 20.0),
        ];
        canvas.fill_polygon(&square, RED);
        assert_eq!(canvas.pixel(50, 50), RED);
        assert_eq!(canvas.pixel(5, 5), WHITE);
        assert_eq!(canvas.pixel(95, 95), WHITE);
    }

    #[test]
    fn disc_and_rect_paint_pixels() {
        let mut canvas = unit_canvas();
        canvas.fill_disc((50.0, 50.0), 3, RED);
        canvas.fill_rect((10.0, 90.0), 4.0, RED);
        let (px, py) = canvas.to_pixel(50.0, 50.0);
        assert_eq!(canvas.pixel(px as u32, py as u32), RED);
        let (px, py) = canvas.to_pixel(10.0, 90.0);
        assert_eq!(canvas.pixel(px as u32, py as u32), RED);
    }

    #[test]
    fn bounds_union_and_margin() {
        let a = Bounds {
            min_x: 0.0,
            min_y: 0.0,
            max_x: 10.0,
            max_y: 10.0,
        };
        let b = Bounds {
            min_x: -5.0,
            min_y: 2.0,
            max_x: 8.0,
            max_y: 20.0,
        };
        let u = a.union(b);
        assert_eq!(u.min_x, -5.0);
        assert_eq!(u.max_y, 20.0);
        let padded = u.with_margin(0.1);
        assert!(padded.min_x < u.min_x && padded.max_x > u.max_x);
    }
}
