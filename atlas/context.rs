//! Geographic context providers: coastline polygons and bathymetric depth
//! grids.
//!
//! Both layers come from external services over plain blocking HTTP, or from
//! a local file holding the same payload (useful offline and in tests). The
//! payloads are decoded into simple geometry containers; nothing here feeds
//! back into the modeling path.

use super::contour::ScalarGrid;
use super::AtlasError;
use reqwest::blocking::Client;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

/// A geographic bounding box in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoBoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl GeoBoundingBox {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }
}

/// Coastline geometry: one or more closed rings of (lon, lat) vertices.
#[derive(Debug, Clone)]
pub struct CoastlineLayer {
    pub rings: Vec<Vec<(f64, f64)>>,
}

/// Fetches country boundary polygons by ISO code and administrative level.
///
/// The expected payload is GeoJSON with Polygon or MultiPolygon features,
/// the format the GADM archive serves as
/// `<base>/gadm41_<ISO>_<level>.json`.
pub struct CoastlineProvider {
    base_url: String,
    client: Client,
}

impl CoastlineProvider {
    pub const DEFAULT_BASE_URL: &'static str =
        "https://geodata.ucdavis.edu/gadm/gadm4.1/json";

    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: http_client(),
        }
    }

    /// Fetches and decodes the boundary polygons of one country.
    pub fn fetch(&self, iso_code: &str, admin_level: u8) -> Result<CoastlineLayer, AtlasError> {
        let url = format!(
            "{}/gadm41_{}_{}.json",
            self.base_url,
            iso_code.to_uppercase(),
            admin_level
        );
        log::info!("Fetching coastline polygons from {url}");
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|source| AtlasError::Fetch {
                url: url.clone(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(AtlasError::HttpStatus {
                url,
                status: status.as_u16(),
            });
        }
        let body = response.text().map_err(|source| AtlasError::Fetch {
            url: url.clone(),
            source,
        })?;
        parse_geojson(&body)
    }
}

/// Loads coastline polygons from a local GeoJSON file.
pub fn coastline_from_file(path: &Path) -> Result<CoastlineLayer, AtlasError> {
    let body = std::fs::read_to_string(path)?;
    parse_geojson(&body)
}

/// Decodes Polygon/MultiPolygon rings out of a GeoJSON document.
pub fn parse_geojson(body: &str) -> Result<CoastlineLayer, AtlasError> {
    let document: Value = serde_json::from_str(body)
        .map_err(|e| AtlasError::Decode(format!("invalid GeoJSON: {e}")))?;

    let mut rings = Vec::new();
    let features = match document.get("features").and_then(Value::as_array) {
        Some(features) => features.clone(),
        // A bare geometry document is also accepted.
        None => vec![document.clone()],
    };

    for feature in &features {
        let geometry = feature.get("geometry").unwrap_or(feature);
        let geom_type = geometry.get("type").and_then(Value::as_str).unwrap_or("");
        let coordinates = geometry.get("coordinates");
        match (geom_type, coordinates) {
            ("Polygon", Some(coords)) => collect_polygon(coords, &mut rings)?,
            ("MultiPolygon", Some(coords)) => {
                for polygon in coords.as_array().into_iter().flatten() {
                    collect_polygon(polygon, &mut rings)?;
                }
            }
            _ => continue,
        }
    }

    if rings.is_empty() {
        return Err(AtlasError::EmptyLayer(
            "no Polygon or MultiPolygon geometry in coastline payload".to_string(),
        ));
    }
    Ok(CoastlineLayer { rings })
}

fn collect_polygon(polygon: &Value, rings: &mut Vec<Vec<(f64, f64)>>) -> Result<(), AtlasError> {
    for ring in polygon.as_array().into_iter().flatten() {
        let mut vertices = Vec::new();
        for position in ring.as_array().into_iter().flatten() {
            let pair = position.as_array().ok_or_else(|| {
                AtlasError::Decode("GeoJSON position is not an array".to_string())
            })?;
            let lon = pair.first().and_then(Value::as_f64);
            let lat = pair.get(1).and_then(Value::as_f64);
            match (lon, lat) {
                (Some(lon), Some(lat)) => vertices.push((lon, lat)),
                _ => {
                    return Err(AtlasError::Decode(
                        "GeoJSON position is not numeric".to_string(),
                    ))
                }
            }
        }
        if vertices.len() >= 4 {
            rings.push(vertices);
        }
    }
    Ok(())
}

/// Fetches a gridded depth field for a bounding box at a given resolution.
///
/// The expected payload is a headered `lon,lat,depth` table, the shape the
/// NOAA grid-extract endpoints serve. Depths are negative below sea level.
pub struct BathymetryProvider {
    base_url: String,
    client: Client,
}

impl BathymetryProvider {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: http_client(),
        }
    }

    /// Fetches the depth grid covering `bbox` at `resolution_minutes`
    /// arc-minutes per cell.
    pub fn fetch(
        &self,
        bbox: GeoBoundingBox,
        resolution_minutes: u32,
    ) -> Result<ScalarGrid, AtlasError> {
        let url = format!(
            "{}?west={}&south={}&east={}&north={}&resolution={}",
            self.base_url, bbox.west, bbox.south, bbox.east, bbox.north, resolution_minutes
        );
        log::info!("Fetching bathymetry grid from {url}");
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|source| AtlasError::Fetch {
                url: url.clone(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(AtlasError::HttpStatus {
                url,
                status: status.as_u16(),
            });
        }
        let body = response.text().map_err(|source| AtlasError::Fetch {
            url: url.clone(),
            source,
        })?;
        parse_depth_table(&body)
    }
}

/// Loads a bathymetry grid from a local `lon,lat,depth` file.
pub fn bathymetry_from_file(path: &Path) -> Result<ScalarGrid, AtlasError> {
    let body = std::fs::read_to_string(path)?;
    parse_depth_table(&body)
}

/// Decodes a `lon,lat,depth` table into a regular grid. Cell spacing is
/// inferred from the distinct coordinate values; cells absent from the table
/// stay NaN.
pub fn parse_depth_table(body: &str) -> Result<ScalarGrid, AtlasError> {
    let mut records: Vec<(f64, f64, f64)> = Vec::new();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(body.as_bytes());
    for row in reader.records() {
        let row = row.map_err(|e| AtlasError::Decode(format!("bad depth record: {e}")))?;
        if row.len() < 3 {
            return Err(AtlasError::Decode(format!(
                "depth record has {} fields, expected lon,lat,depth",
                row.len()
            )));
        }
        let parse = |field: &str| -> Result<f64, AtlasError> {
            field
                .trim()
                .parse::<f64>()
                .map_err(|_| AtlasError::Decode(format!("non-numeric depth field '{field}'")))
        };
        records.push((parse(&row[0])?, parse(&row[1])?, parse(&row[2])?));
    }
    if records.is_empty() {
        return Err(AtlasError::EmptyLayer(
            "bathymetry payload holds no records".to_string(),
        ));
    }

    let mut lons: Vec<f64> = records.iter().map(|r| r.0).collect();
    let mut lats: Vec<f64> = records.iter().map(|r| r.1).collect();
    dedup_sorted(&mut lons);
    dedup_sorted(&mut lats);
    if lons.len() < 2 || lats.len() < 2 {
        return Err(AtlasError::Decode(
            "bathymetry grid needs at least two distinct lon and lat values".to_string(),
        ));
    }

    let dx = smallest_gap(&lons);
    let dy = smallest_gap(&lats);
    let x0 = lons[0];
    let y0 = lats[0];
    let ncols = ((lons[lons.len() - 1] - x0) / dx).round() as usize + 1;
    let nrows = ((lats[lats.len() - 1] - y0) / dy).round() as usize + 1;

    let mut values = vec![f64::NAN; ncols * nrows];
    for &(lon, lat, depth) in &records {
        let col = ((lon - x0) / dx).round() as usize;
        let row = ((lat - y0) / dy).round() as usize;
        if row < nrows && col < ncols {
            values[row * ncols + col] = depth;
        }
    }

    Ok(ScalarGrid {
        x0,
        y0,
        dx,
        dy,
        ncols,
        nrows,
        values,
    })
}

fn http_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn dedup_sorted(values: &mut Vec<f64>) {
    values.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    values.dedup_by(|a, b| (*a - *b).abs() < 1e-9);
}

fn smallest_gap(sorted: &[f64]) -> f64 {
    sorted
        .windows(2)
        .map(|w| w[1] - w[0])
        .fold(f64::INFINITY, f64::min)
}
