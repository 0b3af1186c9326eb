//! Map composition: the survey overview map and the four seasonal
//! probability maps. Terminal sinks — they only write PNG files.

use super::context::CoastlineLayer;
use super::contour::{contour_segments, ScalarGrid};
use super::proj::UtmProjector;
use super::raster::{infer_cell_size, Bounds, Canvas};
use super::style;
use super::AtlasError;
use crate::data::{GridData, ObservationData, Season};
use ndarray::Array1;
use std::path::{Path, PathBuf};

const MARGIN_FRACTION: f64 = 0.08;
const POINT_RADIUS_PX: i64 = 3;

/// Candidate iso-depth levels; the ones inside the fetched grid's range are
/// drawn.
const DEPTH_LEVELS: [f64; 12] = [
    -5.0, -10.0, -20.0, -30.0, -50.0, -75.0, -100.0, -150.0, -200.0, -300.0, -500.0, -1000.0,
];

/// Renders the exploratory survey map: observation points over coastline
/// and bathymetric contours. Context layers are optional so the map can be
/// produced even when a provider fetch failed upstream.
pub fn render_survey_map(
    observations: &ObservationData,
    coastline: Option<&CoastlineLayer>,
    bathymetry: Option<&ScalarGrid>,
    utm_zone: u8,
    width_px: u32,
    path: &Path,
) -> Result<(), AtlasError> {
    let points = observations
        .x
        .iter()
        .zip(observations.y.iter())
        .map(|(&x, &y)| (x, y));
    let bounds = Bounds::from_points(points)
        .ok_or_else(|| AtlasError::Render("no observation positions to map".to_string()))?
        .with_margin(MARGIN_FRACTION);

    let projector = UtmProjector::new(utm_zone);
    let mut canvas = Canvas::new(bounds, width_px, style::OCEAN)?;

    if let Some(grid) = bathymetry {
        draw_bathymetry(&mut canvas, grid, &projector);
    }
    if let Some(layer) = coastline {
        draw_coastline(&mut canvas, layer, &projector);
    }

    // Data layer last: absences beneath presences so detections stay visible.
    for pass in [0.0, 1.0] {
        for ((&x, &y), &label) in observations
            .x
            .iter()
            .zip(observations.y.iter())
            .zip(observations.presence.iter())
        {
            if label == pass {
                canvas.fill_disc((x, y), POINT_RADIUS_PX, style::presence_color(label));
            }
        }
    }

    draw_north_arrow(&mut canvas, bounds);
    draw_scale_bar(&mut canvas, bounds);
    canvas.save(path)?;
    log::info!(
        "Wrote survey map ({}x{} px) to '{}'",
        canvas.width(),
        canvas.height(),
        path.display()
    );
    Ok(())
}

/// Renders one probability map per season with shared bounds and a shared
/// [0, 1] color scale, so the four maps are directly comparable. Returns the
/// written paths in season order.
pub fn render_season_maps(
    seasons: &[(Season, &GridData, &Array1<f64>)],
    coastline: Option<&CoastlineLayer>,
    utm_zone: u8,
    width_px: u32,
    out_dir: &Path,
) -> Result<Vec<PathBuf>, AtlasError> {
    if seasons.is_empty() {
        return Err(AtlasError::Render("no seasonal grids to render".to_string()));
    }

    // One frame for all four maps: union of every grid's extent.
    let mut shared: Option<Bounds> = None;
    let mut cell = f64::INFINITY;
    for (_, grid, _) in seasons {
        let bounds = Bounds::from_points(
            grid.x.iter().zip(grid.y.iter()).map(|(&x, &y)| (x, y)),
        )
        .ok_or_else(|| AtlasError::Render("empty prediction grid".to_string()))?;
        shared = Some(match shared {
            None => bounds,
            Some(s) => s.union(bounds),
        });
        for axis in [&grid.x, &grid.y] {
            if let Some(gap) = infer_cell_size(axis.as_slice().unwrap_or(&[])) {
                cell = cell.min(gap);
            }
        }
    }
    let shared = shared.expect("at least one season checked above");
    if !cell.is_finite() {
        return Err(AtlasError::Render(
            "cannot infer grid cell size from a single cell".to_string(),
        ));
    }
    let bounds = Bounds {
        min_x: shared.min_x - cell / 2.0,
        min_y: shared.min_y - cell / 2.0,
        max_x: shared.max_x + cell / 2.0,
        max_y: shared.max_y + cell / 2.0,
    }
    .with_margin(MARGIN_FRACTION / 2.0);

    let projector = UtmProjector::new(utm_zone);
    std::fs::create_dir_all(out_dir)?;
    let mut written = Vec::with_capacity(seasons.len());

    for (season, grid, probabilities) in seasons {
        let mut canvas = Canvas::new(bounds, width_px, style::OCEAN)?;

        for ((&x, &y), &p) in grid.x.iter().zip(grid.y.iter()).zip(probabilities.iter()) {
            if p.is_finite() {
                canvas.fill_rect((x, y), cell / 2.0, style::probability_color(p));
            }
        }

        if let Some(layer) = coastline {
            draw_coastline(&mut canvas, layer, &projector);
        }
        draw_probability_legend(&mut canvas);
        draw_north_arrow(&mut canvas, bounds);
        draw_scale_bar(&mut canvas, bounds);

        let path = out_dir.join(format!("{season}_probability.png"));
        canvas.save(&path)?;
        log::info!("Wrote {season} probability map to '{}'", path.display());
        written.push(path);
    }
    Ok(written)
}

fn draw_coastline(canvas: &mut Canvas, layer: &CoastlineLayer, projector: &UtmProjector) {
    for ring in &layer.rings {
        let projected: Vec<(f64, f64)> = ring
            .iter()
            .map(|&(lon, lat)| projector.project(lon, lat))
            .collect();
        canvas.fill_polygon(&projected, style::LAND);
        canvas.draw_polyline(&projected, style::COAST_OUTLINE);
    }
}

fn draw_bathymetry(canvas: &mut Canvas, grid: &ScalarGrid, projector: &UtmProjector) {
    let Some((deepest, shallowest)) = grid.finite_range() else {
        log::warn!("Bathymetry grid holds no finite values; skipping contours");
        return;
    };
    for &level in DEPTH_LEVELS.iter() {
        if level <= deepest || level >= shallowest {
            continue;
        }
        let t = (level / deepest).clamp(0.0, 1.0);
        let color = style::depth_contour_color(t);
        for (a, b) in contour_segments(grid, level) {
            let from = projector.project(a.0, a.1);
            let to = projector.project(b.0, b.1);
            canvas.draw_line(from, to, color);
        }
    }
}

/// Vertical color-scale strip along the right edge, 0 at the bottom.
fn draw_probability_legend(canvas: &mut Canvas) {
    let width = canvas.width() as i64;
    let height = canvas.height() as i64;
    let strip_width = (width / 40).clamp(6, 16);
    let top = height / 10;
    let bottom = height - top;
    let left = width - strip_width - width / 50;

    for py in top..bottom {
        let t = (bottom - py) as f64 / (bottom - top) as f64;
        let color = style::probability_color(t);
        for px in left..left + strip_width {
            canvas.put(px, py, color);
        }
    }
    // Thin frame.
    for py in top..bottom {
        canvas.put(left - 1, py, style::DECORATION);
        canvas.put(left + strip_width, py, style::DECORATION);
    }
    for px in left - 1..=left + strip_width {
        canvas.put(px, top - 1, style::DECORATION);
        canvas.put(px, bottom, style::DECORATION);
    }
}

fn draw_north_arrow(canvas: &mut Canvas, bounds: Bounds) {
    let span = bounds.width().min(bounds.height());
    let size = span * 0.04;
    let cx = bounds.min_x + bounds.width() * 0.06;
    let cy = bounds.max_y - bounds.height() * 0.08;
    let triangle = [
        (cx, cy + size),
        (cx - size * 0.45, cy - size),
        (cx + size * 0.45, cy - size),
        (cx, cy + size),
    ];
    canvas.fill_polygon(&triangle, style::DECORATION);
    canvas.draw_line((cx, cy - size * 1.2), (cx, cy - size * 1.8), style::DECORATION);
}

fn draw_scale_bar(canvas: &mut Canvas, bounds: Bounds) {
    let target = bounds.width() * 0.2;
    let length = round_to_nice_length(target);
    let x0 = bounds.min_x + bounds.width() * 0.05;
    let y = bounds.min_y + bounds.height() * 0.05;
    let tick = bounds.height() * 0.012;

    canvas.draw_line((x0, y), (x0 + length, y), style::DECORATION);
    canvas.draw_line((x0, y - tick), (x0, y + tick), style::DECORATION);
    canvas.draw_line(
        (x0 + length / 2.0, y - tick / 2.0),
        (x0 + length / 2.0, y + tick / 2.0),
        style::DECORATION,
    );
    canvas.draw_line((x0 + length, y - tick), (x0 + length, y + tick), style::DECORATION);
}

/// Rounds down to the nearest 1/2/5 × 10^k meters, the usual scale-bar
/// lengths.
fn round_to_nice_length(target: f64) -> f64 {
    let magnitude = 10f64.powf(target.abs().max(1.0).log10().floor());
    for factor in [5.0, 2.0, 1.0] {
        if factor * magnitude <= target {
            return factor * magnitude;
        }
    }
    magnitude
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2};
    use polars::prelude::DataFrame;

    fn synthetic_observations(n: usize) -> ObservationData {
        let x = Array1::from_iter((0..n).map(|i| 450_000.0 + (i % 10) as f64 * 2_000.0));
        let y = Array1::from_iter((0..n).map(|i| 6_000_000.0 + (i / 10) as f64 * 2_000.0));
        ObservationData {
            ids: (1..=n as i64).collect(),
            lat: Array1::from_elem(n, 54.2),
            lon: Array1::from_elem(n, 8.3),
            x,
            y,
            presence: Array1::from_iter((0..n).map(|i| (i % 3 == 0) as u8 as f64)),
            covariates: Array2::zeros((n, 0)),
            covariate_names: vec![],
            dropped_rows: 0,
        }
    }

    fn synthetic_grid(cols: usize, rows: usize) -> (GridData, Array1<f64>) {
        let n = cols * rows;
        let mut x = Vec::with_capacity(n);
        let mut y = Vec::with_capacity(n);
        let mut p = Vec::with_capacity(n);
        for r in 0..rows {
            for c in 0..cols {
                x.push(440_000.0 + c as f64 * 5_000.0);
                y.push(5_990_000.0 + r as f64 * 5_000.0);
                p.push(if (r + c) % 7 == 0 {
                    f64::NAN
                } else {
                    (r + c) as f64 / (rows + cols) as f64
                });
            }
        }
        let grid = GridData {
            x: Array1::from_vec(x),
            y: Array1::from_vec(y),
            covariates: Array2::zeros((n, 0)),
            covariate_names: vec![],
            frame: DataFrame::empty(),
        };
        (grid, Array1::from_vec(p))
    }

    fn square_coastline() -> CoastlineLayer {
        CoastlineLayer {
            rings: vec![vec![
                (8.0, 54.0),
                (8.4, 54.0),
                (8.4, 54.3),
                (8.0, 54.3),
                (8.0, 54.0),
            ]],
        }
    }

    #[test]
    fn survey_map_writes_a_decodable_png() {
        let observations = synthetic_observations(60);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("survey.png");
        render_survey_map(&observations, Some(&square_coastline()), None, 32, 300, &path)
            .unwrap();
        let decoded = image::open(&path).unwrap();
        assert_eq!(decoded.width(), 300);
    }

    #[test]
    fn survey_map_with_bathymetry_contours() {
        let observations = synthetic_observations(40);
        // Depth deepens westward; several candidate levels fall inside.
        let mut values = Vec::new();
        for _row in 0..8 {
            for col in 0..8 {
                values.push(-5.0 - col as f64 * 12.0);
            }
        }
        let grid = ScalarGrid {
            x0: 7.8,
            y0: 53.9,
            dx: 0.1,
            dy: 0.1,
            ncols: 8,
            nrows: 8,
            values,
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("survey.png");
        render_survey_map(&observations, None, Some(&grid), 32, 240, &path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn season_maps_share_bounds_and_write_four_files() {
        let (grid, probs) = synthetic_grid(12, 9);
        let seasons: Vec<(Season, &GridData, &Array1<f64>)> = Season::ALL
            .iter()
            .map(|&s| (s, &grid, &probs))
            .collect();
        let dir = tempfile::tempdir().unwrap();
        let written =
            render_season_maps(&seasons, Some(&square_coastline()), 32, 240, dir.path()).unwrap();
        assert_eq!(written.len(), 4);
        let first = image::open(&written[0]).unwrap();
        for path in &written[1..] {
            let other = image::open(path).unwrap();
            assert_eq!(first.width(), other.width());
            assert_eq!(first.height(), other.height());
        }
        assert!(written[0].file_name().unwrap().to_str().unwrap().contains("winter"));
    }

    #[test]
    fn empty_season_list_is_a_render_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = render_season_maps(&[], None, 32, 240, dir.path()).unwrap_err();
        match err {
            AtlasError::Render(_) => {}
            other => panic!("Expected Render, got {other:?}"),
        }
    }

    #[test]
    fn nice_lengths_are_1_2_5() {
        assert_eq!(round_to_nice_length(7_300.0), 5_000.0);
        assert_eq!(round_to_nice_length(23_000.0), 20_000.0);
        assert_eq!(round_to_nice_length(150.0), 100.0);
    }
}
