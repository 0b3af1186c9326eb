//! The fitted-model artifact: everything needed to reproduce predictions is
//! saved to a human-readable TOML file, in the same spirit as a trained
//! calibration model — configuration, knot vectors, constraint transforms,
//! coefficients, smoothing parameters, and the fit summary travel together.
//!
//! Prediction is a fast, non-iterative reconstruction: rebuild the design
//! matrix from the stored configuration, one matrix-vector product, one
//! inverse-link transform.

use crate::basis::{self, KnotPlacement};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::ops::Range;
use thiserror::Error;

/// Fitted probabilities are kept away from exactly 0 and 1; the same clamp
/// is applied during IRLS so training and inference agree.
const PROB_EPS: f64 = 1e-8;

/// The two model families of the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelFamily {
    /// Linear-predictor logistic regression (GLM).
    Linear,
    /// Smooth-term additive model (GAM), one spline per covariate.
    Smooth,
}

/// Basis setup shared by every smooth term of a GAM fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmoothSpec {
    /// Maximum flexibility: number of basis functions per covariate before
    /// the identifiability constraint removes one.
    pub basis_dim: usize,
    pub degree: usize,
    pub penalty_order: usize,
    pub placement: KnotPlacement,
}

/// The complete blueprint of a fitted model. Data-dependent quantities saved
/// from training (ranges, means, knots, constraints) are what make
/// prediction on new grids exactly consistent with the training basis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub family: ModelFamily,
    /// Canonical covariate order; enforced at both fitting and prediction.
    pub covariate_names: Vec<String>,
    /// Training range per covariate; prediction values are clamped to it.
    pub covariate_ranges: Vec<(f64, f64)>,
    /// Training mean per covariate; linear terms are centered on these.
    pub covariate_means: Vec<f64>,
    pub smooth: Option<SmoothSpec>,
    /// Knot vector per covariate (GAM only).
    #[serde(default)]
    pub knot_vectors: HashMap<String, Array1<f64>>,
    /// Sum-to-zero constraint transform per covariate (GAM only).
    #[serde(default)]
    pub constraints: HashMap<String, Array2<f64>>,
}

/// Per-term detail in the fit summary: a single coefficient for linear
/// terms, an effective-degrees-of-freedom/smoothing pair for smooths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TermDetail {
    Linear { estimate: f64, std_error: f64 },
    Smooth { edf: f64, lambda: f64 },
}

/// Significance summary for one model term under the null hypothesis that
/// the term has no effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TermSummary {
    pub name: String,
    pub detail: TermDetail,
    /// z statistic for linear terms, Wald chi-square for smooths.
    pub statistic: f64,
    pub p_value: f64,
}

/// Whole-fit summary: term table plus the deviance accounting used for
/// model comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitSummary {
    pub intercept: f64,
    pub intercept_std_error: f64,
    pub terms: Vec<TermSummary>,
    pub n_observations: usize,
    pub null_deviance: f64,
    pub deviance: f64,
    /// Total effective degrees of freedom, including the intercept.
    pub edf: f64,
    pub aic: f64,
}

impl FitSummary {
    /// Share of null deviance explained by the fitted model.
    pub fn explained_deviance(&self) -> f64 {
        if self.null_deviance > 0.0 {
            1.0 - self.deviance / self.null_deviance
        } else {
            0.0
        }
    }
}

/// The self-contained fitted model artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedModel {
    pub spec: ModelSpec,
    /// Flattened coefficients: intercept first, then each covariate's
    /// coefficient block in `covariate_names` order.
    pub coefficients: Array1<f64>,
    /// Smoothing parameter per smooth term (empty for the linear family).
    pub lambdas: Vec<f64>,
    pub summary: FitSummary,
}

/// Column layout of a design matrix: the intercept column plus one
/// contiguous coefficient range per covariate.
#[derive(Debug, Clone)]
pub struct TermLayout {
    pub total_columns: usize,
    pub term_ranges: Vec<Range<usize>>,
}

/// Errors for model reconstruction, persistence, and prediction.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error(
        "Prediction data carries covariates [{found}], but the model was fitted on [{expected}]."
    )]
    CovariateMismatch { found: String, expected: String },
    #[error("Basis reconstruction failed during prediction: {0}")]
    BasisError(#[from] basis::BasisError),
    #[error("Model artifact is inconsistent: {0}")]
    InconsistentArtifact(String),
}

impl ModelSpec {
    /// Number of design columns contributed by one covariate.
    fn columns_per_term(&self) -> usize {
        match self.family {
            ModelFamily::Linear => 1,
            ModelFamily::Smooth => {
                self.smooth
                    .as_ref()
                    .map(|s| s.basis_dim - 1)
                    .unwrap_or(1)
            }
        }
    }

    /// The column layout implied by this spec.
    pub fn layout(&self) -> TermLayout {
        let per_term = self.columns_per_term();
        let mut ranges = Vec::with_capacity(self.covariate_names.len());
        let mut next = 1; // column 0 is the intercept
        for _ in &self.covariate_names {
            ranges.push(next..next + per_term);
            next += per_term;
        }
        TermLayout {
            total_columns: next,
            term_ranges: ranges,
        }
    }

    /// Builds the design matrix for `covariates` (shape `[n, n_covariates]`,
    /// columns in `covariate_names` order). All rows must be finite; the
    /// caller handles missing-value rows.
    pub fn design_matrix(&self, covariates: ArrayView2<f64>) -> Result<Array2<f64>, ModelError> {
        if covariates.ncols() != self.covariate_names.len() {
            return Err(ModelError::CovariateMismatch {
                found: covariates.ncols().to_string(),
                expected: self.covariate_names.len().to_string(),
            });
        }
        let layout = self.layout();
        let n = covariates.nrows();
        let mut design = Array2::zeros((n, layout.total_columns));
        design.column_mut(0).fill(1.0);

        for (j, name) in self.covariate_names.iter().enumerate() {
            let (lo, hi) = self.covariate_ranges[j];
            let clamped = covariates.column(j).mapv(|v| v.clamp(lo, hi));
            let range = layout.term_ranges[j].clone();
            match self.family {
                ModelFamily::Linear => {
                    let centered = clamped.mapv(|v| v - self.covariate_means[j]);
                    design.column_mut(range.start).assign(&centered);
                }
                ModelFamily::Smooth => {
                    let smooth = self.smooth.as_ref().ok_or_else(|| {
                        ModelError::InconsistentArtifact(
                            "smooth family without smooth spec".to_string(),
                        )
                    })?;
                    let knots = self.knot_vectors.get(name).ok_or_else(|| {
                        ModelError::InconsistentArtifact(format!(
                            "missing knot vector for '{name}'"
                        ))
                    })?;
                    let z = self.constraints.get(name).ok_or_else(|| {
                        ModelError::InconsistentArtifact(format!(
                            "missing constraint transform for '{name}'"
                        ))
                    })?;
                    let raw = basis::bspline_design(clamped.view(), knots.view(), smooth.degree)?;
                    if raw.ncols() != z.nrows() {
                        return Err(ModelError::InconsistentArtifact(format!(
                            "basis for '{name}' has {} columns but the constraint expects {}",
                            raw.ncols(),
                            z.nrows()
                        )));
                    }
                    let constrained = raw.dot(z);
                    design
                        .slice_mut(ndarray::s![.., range])
                        .assign(&constrained);
                }
            }
        }
        Ok(design)
    }
}

impl FittedModel {
    /// Predicts presence probabilities for a covariate matrix whose columns
    /// follow `names`. The order must match the fitted covariate order.
    ///
    /// Output is on the response scale, in `[0, 1]`. Rows containing a
    /// missing (NaN) covariate value yield NaN instead of failing the batch.
    pub fn predict(
        &self,
        names: &[String],
        covariates: ArrayView2<f64>,
    ) -> Result<Array1<f64>, ModelError> {
        if names != self.spec.covariate_names.as_slice() {
            return Err(ModelError::CovariateMismatch {
                found: names.join(", "),
                expected: self.spec.covariate_names.join(", "),
            });
        }

        let n = covariates.nrows();
        let usable: Vec<usize> = (0..n)
            .filter(|&i| covariates.row(i).iter().all(|v| v.is_finite()))
            .collect();

        let mut probabilities = Array1::from_elem(n, f64::NAN);
        if usable.is_empty() {
            return Ok(probabilities);
        }

        let compact = covariates.select(Axis(0), &usable);
        let design = self.spec.design_matrix(compact.view())?;
        if design.ncols() != self.coefficients.len() {
            return Err(ModelError::InconsistentArtifact(format!(
                "design has {} columns but the model stores {} coefficients",
                design.ncols(),
                self.coefficients.len()
            )));
        }
        let eta = design.dot(&self.coefficients);
        for (&row, &e) in usable.iter().zip(eta.iter()) {
            let e = e.clamp(-700.0, 700.0);
            let p = 1.0 / (1.0 + (-e).exp());
            probabilities[row] = p.clamp(PROB_EPS, 1.0 - PROB_EPS);
        }
        Ok(probabilities)
    }

    /// Convenience wrapper for a loaded prediction grid.
    pub fn predict_grid(&self, grid: &crate::data::GridData) -> Result<Array1<f64>, ModelError> {
        self.predict(&grid.covariate_names, grid.covariates.view())
    }

    /// Saves the fitted model to a human-readable TOML file.
    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads a fitted model from a TOML file.
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model = toml::from_str(&toml_string)?;
        Ok(model)
    }
}
