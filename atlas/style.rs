//! Colour helpers shared by the map renderers.

pub type Rgb = [u8; 3];

pub const OCEAN: Rgb = [228, 238, 245];
pub const LAND: Rgb = [205, 205, 199];
pub const COAST_OUTLINE: Rgb = [110, 110, 105];
pub const DECORATION: Rgb = [40, 40, 40];

/// Observation points: presence warm red, absence steel blue.
pub fn presence_color(label: f64) -> Rgb {
    if label >= 0.5 {
        [230, 57, 70]
    } else {
        [69, 123, 157]
    }
}

/// Probability [0, 1] on a perceptually ordered dark-to-bright ramp
/// (viridis control points, linearly interpolated).
pub fn probability_color(t: f64) -> Rgb {
    const STOPS: [Rgb; 5] = [
        [68, 1, 84],
        [59, 82, 139],
        [33, 145, 140],
        [94, 201, 98],
        [253, 231, 37],
    ];
    ramp(t, &STOPS)
}

/// Bathymetric contours: deeper levels draw darker blue.
pub fn depth_contour_color(t: f64) -> Rgb {
    const STOPS: [Rgb; 3] = [[160, 200, 230], [90, 140, 200], [30, 60, 140]];
    ramp(t, &STOPS)
}

fn ramp(t: f64, stops: &[Rgb]) -> Rgb {
    let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
    let segments = (stops.len() - 1) as f64;
    let position = t * segments;
    let index = (position.floor() as usize).min(stops.len() - 2);
    let w = position - index as f64;
    let lo = stops[index];
    let hi = stops[index + 1];
    [
        (lo[0] as f64 * (1.0 - w) + hi[0] as f64 * w).round() as u8,
        (lo[1] as f64 * (1.0 - w) + hi[1] as f64 * w).round() as u8,
        (lo[2] as f64 * (1.0 - w) + hi[2] as f64 * w).round() as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramp_endpoints_hit_the_stops() {
        assert_eq!(probability_color(0.0), [68, 1, 84]);
        assert_eq!(probability_color(1.0), [253, 231, 37]);
        assert_eq!(probability_color(0.5), [33, 145, 140]);
    }

    #[test]
    fn ramp_clamps_out_of_range_and_nan() {
        assert_eq!(probability_color(-3.0), probability_color(0.0));
        assert_eq!(probability_color(7.0), probability_color(1.0));
        assert_eq!(probability_color(f64::NAN), probability_color(0.0));
    }

    #[test]
    fn presence_colors_differ() {
        assert_ne!(presence_color(0.0), presence_color(1.0));
    }
}
