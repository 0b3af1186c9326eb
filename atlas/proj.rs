//! WGS84 transverse-Mercator (UTM) forward projection.
//!
//! The survey grids live in projected meters while coastline and bathymetry
//! providers speak degrees; this projector moves the context layers onto the
//! grids' plane. Northern hemisphere convention (false northing 0), Snyder's
//! series formulation.

const A: f64 = 6_378_137.0;
const F: f64 = 1.0 / 298.257_223_563;
const K0: f64 = 0.9996;
const FALSE_EASTING: f64 = 500_000.0;

/// Forward projector for one UTM zone.
#[derive(Debug, Clone, Copy)]
pub struct UtmProjector {
    central_meridian: f64,
}

impl UtmProjector {
    pub fn new(zone: u8) -> Self {
        let central_meridian = (zone as f64) * 6.0 - 183.0;
        Self { central_meridian }
    }

    /// Projects (lon, lat) in degrees to (easting, northing) in meters.
    pub fn project(&self, lon: f64, lat: f64) -> (f64, f64) {
        let e2 = F * (2.0 - F);
        let ep2 = e2 / (1.0 - e2);

        let phi = lat.to_radians();
        let dlam = (lon - self.central_meridian).to_radians();

        let sin_phi = phi.sin();
        let cos_phi = phi.cos();
        let tan_phi = phi.tan();

        let n = A / (1.0 - e2 * sin_phi * sin_phi).sqrt();
        let t = tan_phi * tan_phi;
        let c = ep2 * cos_phi * cos_phi;
        let a_term = dlam * cos_phi;

        let e4 = e2 * e2;
        let e6 = e4 * e2;
        let m = A
            * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * phi
                - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * phi).sin()
                + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * phi).sin()
                - (35.0 * e6 / 3072.0) * (6.0 * phi).sin());

        let easting = FALSE_EASTING
            + K0 * n
                * (a_term
                    + (1.0 - t + c) * a_term.powi(3) / 6.0
                    + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * a_term.powi(5) / 120.0);
        let northing = K0
            * (m + n
                * tan_phi
                * (a_term * a_term / 2.0
                    + (5.0 - t + 9.0 * c + 4.0 * c * c) * a_term.powi(4) / 24.0
                    + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * a_term.powi(6)
                        / 720.0));

        (easting, northing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn central_meridian_on_equator_is_the_false_origin() {
        let proj = UtmProjector::new(32);
        let (x, y) = proj.project(9.0, 0.0);
        assert!((x - 500_000.0).abs() < 1e-6);
        assert!(y.abs() < 1e-6);
    }

    #[test]
    fn easting_and_northing_are_monotone() {
        let proj = UtmProjector::new(32);
        let (x_west, _) = proj.project(8.0, 54.0);
        let (x_east, _) = proj.project(10.0, 54.0);
        assert!(x_west < 500_000.0 && 500_000.0 < x_east);

        let (_, y_south) = proj.project(9.0, 54.0);
        let (_, y_north) = proj.project(9.0, 56.0);
        assert!(y_south < y_north);
    }

    #[test]
    fn one_degree_of_longitude_spans_the_expected_distance() {
        // At 54 N a degree of longitude is about 65.4 km; the scale factor
        // shrinks it slightly.
        let proj = UtmProjector::new(32);
        let (x0, _) = proj.project(9.0, 54.0);
        let (x1, _) = proj.project(10.0, 54.0);
        let span = x1 - x0;
        assert!((span - 65_400.0).abs() < 500.0, "span {span}");
    }

    #[test]
    fn one_degree_of_latitude_is_about_111_km() {
        let proj = UtmProjector::new(32);
        let (_, y0) = proj.project(9.0, 54.0);
        let (_, y1) = proj.project(9.0, 55.0);
        let span = y1 - y0;
        assert!((span - 111_300.0).abs() < 500.0, "span {span}");
    }
}
