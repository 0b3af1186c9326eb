//! # Data Loading and Validation Module
//!
//! This module is the exclusive entry point for user-provided survey data.
//! It reads delimited tabular files (CSV), validates them against the strict
//! survey schema, and transforms them into the clean `ndarray` structures the
//! statistical core operates on.
//!
//! - Strict schema: column names are not configurable. Observation files
//!   carry `id`, `day`, `month`, `year`, `lat`, `lon`, `x`, `y`, `presence`
//!   and the environmental covariate columns; grid files carry `x`, `y` and
//!   the covariates. This eliminates a class of configuration errors.
//! - User-centric errors: failures are assumed to be user-input errors and
//!   `DataError` is written to give actionable feedback.
//! - Incomplete observation rows (missing label or covariate values) are
//!   dropped before fitting, with the count reported. Grid rows keep their
//!   gaps as NaN so prediction can degrade per row instead of aborting.

use ndarray::{Array1, Array2};
use polars::prelude::*;
use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// The binary response column of an observation file.
pub const LABEL_COLUMN: &str = "presence";

/// Projected-coordinate columns shared by observation and grid files.
pub const COORDINATE_COLUMNS: [&str; 2] = ["x", "y"];

/// The full environmental covariate set of the survey schema, in canonical
/// order. Model formulas select a subset of these names.
pub const COVARIATE_COLUMNS: [&str; 11] = [
    "depth",
    "slope",
    "sprat",
    "chl_day",
    "chl_week",
    "chl_lag_day",
    "chl_lag_week",
    "sst_day",
    "sst_week",
    "sal_day",
    "sal_week",
];

/// One of the four seasonal prediction grids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Season {
    Winter,
    Spring,
    Summer,
    Autumn,
}

impl Season {
    pub const ALL: [Season; 4] = [
        Season::Winter,
        Season::Spring,
        Season::Summer,
        Season::Autumn,
    ];
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Season::Winter => "winter",
            Season::Spring => "spring",
            Season::Summer => "summer",
            Season::Autumn => "autumn",
        };
        f.write_str(name)
    }
}

/// A container for validated observation data ready for model fitting.
#[derive(Debug)]
pub struct ObservationData {
    /// Sampling-event identifiers from the `id` column.
    pub ids: Vec<i64>,
    /// Geographic position in degrees (WGS84).
    pub lat: Array1<f64>,
    pub lon: Array1<f64>,
    /// Projected position in meters.
    pub x: Array1<f64>,
    pub y: Array1<f64>,
    /// The binary presence/absence label.
    pub presence: Array1<f64>,
    /// Covariate matrix, shape `[n_rows, n_covariates]`, column order matching
    /// `covariate_names`.
    pub covariates: Array2<f64>,
    pub covariate_names: Vec<String>,
    /// Number of rows removed because of missing label/covariate values.
    pub dropped_rows: usize,
}

/// A container for one seasonal prediction grid.
///
/// The original `DataFrame` is retained so the augmented grid can be exported
/// with exactly the input columns plus the probability column.
pub struct GridData {
    pub x: Array1<f64>,
    pub y: Array1<f64>,
    /// Covariate matrix; cells with missing values hold NaN.
    pub covariates: Array2<f64>,
    pub covariate_names: Vec<String>,
    pub frame: DataFrame,
}

impl fmt::Debug for GridData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GridData")
            .field("rows", &self.x.len())
            .field("covariate_names", &self.covariate_names)
            .finish()
    }
}

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The required column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "The label column '{LABEL_COLUMN}' must contain only 0 or 1, but row {row} holds {value}."
    )]
    NonBinaryLabel { row: usize, value: f64 },
    #[error(
        "Missing or null values were found in the required column '{0}'. Grid coordinates must be complete."
    )]
    MissingValuesFound(String),
    #[error(
        "After removing {dropped} incomplete rows, only {found} observation rows remain, but at least {required} are needed for a stable fit."
    )]
    InsufficientRows {
        found: usize,
        dropped: usize,
        required: usize,
    },
    #[error("Unknown covariate '{0}'. Valid covariates: {valid}", valid = COVARIATE_COLUMNS.join(", "))]
    UnknownCovariate(String),
}

/// Checks a user-supplied covariate selection against the survey schema.
pub fn validate_covariate_selection(names: &[String]) -> Result<(), DataError> {
    for name in names {
        if !COVARIATE_COLUMNS.contains(&name.as_str()) {
            return Err(DataError::UnknownCovariate(name.clone()));
        }
    }
    Ok(())
}

/// Loads and validates observation data for model fitting and survey mapping.
///
/// Rows with missing or non-finite values in the label or any selected
/// covariate are dropped (listwise deletion); the drop count is kept on the
/// returned struct and logged. Coordinate and identifier columns must be
/// complete for the retained rows.
pub fn load_observations(
    path: &str,
    covariate_names: &[String],
) -> Result<ObservationData, DataError> {
    validate_covariate_selection(covariate_names)?;
    let df = internal::read_frame(path)?;

    let mut required: Vec<String> = vec![
        "id".to_string(),
        "day".to_string(),
        "month".to_string(),
        "year".to_string(),
        "lat".to_string(),
        "lon".to_string(),
        "x".to_string(),
        "y".to_string(),
        LABEL_COLUMN.to_string(),
    ];
    required.extend(covariate_names.iter().cloned());
    internal::check_columns(&df, &required)?;

    let n = df.height();

    // Columns that decide row usability: label and the selected covariates.
    let label_raw = internal::numeric_column_with_gaps(&df, LABEL_COLUMN)?;
    let mut covariate_raw: Vec<Vec<f64>> = Vec::with_capacity(covariate_names.len());
    for name in covariate_names {
        covariate_raw.push(internal::numeric_column_with_gaps(&df, name)?);
    }

    let keep: Vec<usize> = (0..n)
        .filter(|&i| label_raw[i].is_finite() && covariate_raw.iter().all(|c| c[i].is_finite()))
        .collect();
    let dropped = n - keep.len();
    if dropped > 0 {
        log::warn!(
            "Dropped {dropped} of {n} observation rows with missing label or covariate values"
        );
    }
    if keep.len() < internal::MINIMUM_ROWS {
        return Err(DataError::InsufficientRows {
            found: keep.len(),
            dropped,
            required: internal::MINIMUM_ROWS,
        });
    }

    // Label must be strictly binary on the retained rows.
    for &i in &keep {
        let v = label_raw[i];
        if v != 0.0 && v != 1.0 {
            return Err(DataError::NonBinaryLabel { row: i + 1, value: v });
        }
    }

    let presence = Array1::from_iter(keep.iter().map(|&i| label_raw[i]));
    let mut covariates = Array2::zeros((keep.len(), covariate_names.len()));
    for (j, column) in covariate_raw.iter().enumerate() {
        for (row, &i) in keep.iter().enumerate() {
            covariates[[row, j]] = column[i];
        }
    }

    let take = |name: &str| -> Result<Array1<f64>, DataError> {
        let full = internal::complete_numeric_column(&df, name)?;
        Ok(Array1::from_iter(keep.iter().map(|&i| full[i])))
    };
    let lat = take("lat")?;
    let lon = take("lon")?;
    let x = take("x")?;
    let y = take("y")?;

    let id_full = internal::integer_column(&df, "id")?;
    let ids: Vec<i64> = keep.iter().map(|&i| id_full[i]).collect();

    // Date columns are validated for presence and completeness even though the
    // fit does not consume them; a malformed file should fail here, not later.
    for name in ["day", "month", "year"] {
        internal::integer_column(&df, name)?;
    }

    log::info!(
        "Loaded {} observation rows ({} presences) with {} covariates from '{}'",
        keep.len(),
        presence.sum() as usize,
        covariate_names.len(),
        path
    );

    Ok(ObservationData {
        ids,
        lat,
        lon,
        x,
        y,
        presence,
        covariates,
        covariate_names: covariate_names.to_vec(),
        dropped_rows: dropped,
    })
}

/// Loads one seasonal prediction grid.
///
/// Coordinates must be complete; every covariate column the model needs must
/// exist (schema error otherwise). Missing covariate values are carried
/// through as NaN so the predictor can yield a missing probability for those
/// rows instead of aborting the batch. Extra columns are ignored but kept in
/// `frame` for the augmented export.
pub fn load_grid(path: &str, covariate_names: &[String]) -> Result<GridData, DataError> {
    let df = internal::read_frame(path)?;

    let mut required: Vec<String> =
        COORDINATE_COLUMNS.iter().map(|s| s.to_string()).collect();
    required.extend(covariate_names.iter().cloned());
    internal::check_columns(&df, &required)?;

    let x = Array1::from_vec(internal::complete_numeric_column(&df, "x")?);
    let y = Array1::from_vec(internal::complete_numeric_column(&df, "y")?);

    let mut covariates = Array2::zeros((df.height(), covariate_names.len()));
    for (j, name) in covariate_names.iter().enumerate() {
        let column = internal::numeric_column_with_gaps(&df, name)?;
        for (i, &v) in column.iter().enumerate() {
            covariates[[i, j]] = v;
        }
    }

    log::info!(
        "Loaded prediction grid with {} cells from '{}'",
        df.height(),
        path
    );

    Ok(GridData {
        x,
        y,
        covariates,
        covariate_names: covariate_names.to_vec(),
        frame: df,
    })
}

/// Appends the predicted-probability column to a grid's frame and writes the
/// augmented table as CSV. NaN predictions become empty cells.
pub fn write_augmented_grid(
    grid: &GridData,
    probabilities: &Array1<f64>,
    path: &str,
) -> Result<(), DataError> {
    let series: Float64Chunked = probabilities
        .iter()
        .map(|&p| if p.is_finite() { Some(p) } else { None })
        .collect();
    let mut frame = grid.frame.clone();
    frame.with_column(series.into_series().with_name("presence_prob".into()))?;

    let mut file = File::create(Path::new(path))?;
    CsvWriter::new(&mut file).include_header(true).finish(&mut frame)?;
    log::info!("Wrote augmented grid to '{path}'");
    Ok(())
}

/// Internal module for shared loading logic.
mod internal {
    use super::*;

    pub(super) const MINIMUM_ROWS: usize = 20;

    pub(super) fn read_frame(path: &str) -> Result<DataFrame, DataError> {
        let df = CsvReader::new(File::open(Path::new(path))?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(CsvParseOptions::default().with_separator(b',')),
            )
            .finish()?;
        Ok(df)
    }

    pub(super) fn check_columns(df: &DataFrame, required: &[String]) -> Result<(), DataError> {
        let present: HashSet<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        for name in required {
            if !present.contains(name) {
                return Err(DataError::ColumnNotFound(name.clone()));
            }
        }
        Ok(())
    }

    /// Extracts a numeric column, representing nulls and non-finite entries
    /// uniformly as NaN. Type failures (e.g. free text) are schema errors.
    pub(super) fn numeric_column_with_gaps(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<f64>, DataError> {
        let series = df.column(column_name)?;
        let casted = series.cast(&DataType::Float64).map_err(|_| {
            DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            }
        })?;
        if casted.null_count() > series.null_count() {
            // Values polars could not interpret as numbers.
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            });
        }
        let chunked = casted.f64()?.rechunk();
        Ok(chunked
            .to_vec()
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect())
    }

    /// Extracts a numeric column that must have no gaps at all.
    pub(super) fn complete_numeric_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<f64>, DataError> {
        let values = numeric_column_with_gaps(df, column_name)?;
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }
        Ok(values)
    }

    pub(super) fn integer_column(df: &DataFrame, column_name: &str) -> Result<Vec<i64>, DataError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }
        let casted = series.cast(&DataType::Int64).map_err(|_| {
            DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "i64 (integer)",
                found_type: format!("{:?}", series.dtype()),
            }
        })?;
        let chunked = casted.i64()?.rechunk();
        Ok(chunked.into_no_null_iter().collect())
    }
}
