//! Map rendering for survey data and seasonal prediction surfaces.
//!
//! The atlas side of the crate is purely presentational: it consumes
//! observation tables and probability-augmented grids, fetches geographic
//! context (coastline polygons, bathymetric depth grids) from external
//! providers, and writes PNG maps. Nothing downstream consumes its output,
//! and a failure here never affects the modeling path.

pub mod context;
pub mod contour;
pub mod proj;
pub mod raster;
pub mod render;
pub mod style;

use thiserror::Error;

/// Errors for the presentational path: provider fetches, payload decoding,
/// and image output.
#[derive(Error, Debug)]
pub enum AtlasError {
    #[error("Failed to fetch geographic layer from '{url}': {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Geographic layer request to '{url}' returned HTTP status {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("Failed to decode geographic payload: {0}")]
    Decode(String),

    #[error("Geographic layer is empty: {0}")]
    EmptyLayer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode map image: {0}")]
    Image(#[from] image::ImageError),

    #[error("Cannot render map: {0}")]
    Render(String),
}
