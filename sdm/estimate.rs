//! # Model Estimation
//!
//! Orchestrates the fitting procedure for both model families:
//!
//! 1. **Linear family (GLM):** one IRLS run on the centered covariate
//!    design.
//! 2. **Smooth family (GAM):** a nested scheme — the outer loop drives the
//!    log smoothing parameters (`rho`) through a BFGS optimizer minimizing
//!    the GCV score `n·D / (n − edf)²`, and the inner loop solves the
//!    coefficients for each trial `rho` by P-IRLS. Gradients for the outer
//!    loop are central finite differences of the GCV score.
//!
//! The result is a self-contained [`FittedModel`] artifact carrying the
//! Wald/chi-square summary table used for covariate selection.

use wolfe_bfgs::{Bfgs, BfgsSolution};

use crate::basis::{self, KnotPlacement};
use crate::data::ObservationData;
use crate::model::{
    FitSummary, FittedModel, ModelFamily, ModelSpec, SmoothSpec, TermDetail, TermSummary,
};
use crate::pirls::{self, PirlsFit, PirlsOptions};
use crate::special;

use ndarray::{s, Array1, Array2, ArrayView1, Axis};
use ndarray_linalg::{Eigh, UPLO};
use std::collections::HashMap;
use thiserror::Error;

/// A comprehensive error type for the model estimation process.
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Underlying basis function generation failed: {0}")]
    BasisError(#[from] basis::BasisError),

    #[error("Design matrix construction failed: {0}")]
    ModelError(#[from] crate::model::ModelError),

    #[error(
        "Covariate '{0}' has (near-)zero variance in the fitting data; the fit would be singular. Remove it from the formula."
    )]
    ZeroVarianceCovariate(String),

    #[error("A linear system solve failed. The (penalized) Hessian may be singular. Error: {0}")]
    LinearSystemSolveFailed(ndarray_linalg::error::LinalgError),

    #[error("Eigendecomposition failed: {0}")]
    EigendecompositionFailed(ndarray_linalg::error::LinalgError),

    #[error(
        "The IRLS loop did not converge within {max_iterations} iterations. Last deviance change was {last_change:.6e}."
    )]
    PirlsDidNotConverge {
        max_iterations: usize,
        last_change: f64,
    },

    #[error("Smoothing-parameter optimization failed to converge: {0}")]
    SmoothingOptimizationFailed(String),
}

/// Everything the fitter needs beyond the data itself.
#[derive(Debug, Clone)]
pub struct FitOptions {
    pub family: ModelFamily,
    /// Maximum flexibility per smooth term (basis dimension); ignored by the
    /// linear family.
    pub basis_dim: usize,
    pub degree: usize,
    pub penalty_order: usize,
    pub placement: KnotPlacement,
    pub pirls: PirlsOptions,
    pub smoothing_tolerance: f64,
    pub smoothing_max_iterations: usize,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            family: ModelFamily::Linear,
            basis_dim: 10,
            degree: 3,
            penalty_order: 2,
            placement: KnotPlacement::Quantile,
            pirls: PirlsOptions::default(),
            smoothing_tolerance: 1e-4,
            smoothing_max_iterations: 100,
        }
    }
}

/// Outcome of comparing two candidate models by information criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelComparison {
    PreferFirst,
    PreferSecond,
    Equivalent,
}

/// Conventional selection thresholds, configurable rather than hardcoded:
/// an AIC gap below `aic_drop` is treated as noise, and covariates with
/// p-values above `alpha` are flagged as removal candidates.
#[derive(Debug, Clone, Copy)]
pub struct SelectionPolicy {
    pub alpha: f64,
    pub aic_drop: f64,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            aic_drop: 2.0,
        }
    }
}

impl SelectionPolicy {
    /// Lower AIC wins, but only a gap of at least `aic_drop` counts as a
    /// meaningful improvement.
    pub fn compare_aic(&self, first: f64, second: f64) -> ModelComparison {
        let gap = first - second;
        if gap <= -self.aic_drop {
            ModelComparison::PreferFirst
        } else if gap >= self.aic_drop {
            ModelComparison::PreferSecond
        } else {
            ModelComparison::Equivalent
        }
    }

    /// Terms whose p-value exceeds `alpha` under the no-effect null.
    pub fn removal_candidates<'a>(&self, summary: &'a FitSummary) -> Vec<&'a str> {
        summary
            .terms
            .iter()
            .filter(|t| t.p_value > self.alpha)
            .map(|t| t.name.as_str())
            .collect()
    }
}

/// The main entry point for model fitting.
pub fn train_model(
    data: &ObservationData,
    options: &FitOptions,
) -> Result<FittedModel, EstimationError> {
    let n = data.presence.len();
    log::info!(
        "Fitting {:?} model on {} observations and {} covariates",
        options.family,
        n,
        data.covariate_names.len()
    );

    // Degenerate covariates make the normal equations singular; report them
    // by name instead of surfacing a bare linear-algebra failure.
    for (j, name) in data.covariate_names.iter().enumerate() {
        if column_variance(data.covariates.column(j)) < 1e-12 {
            return Err(EstimationError::ZeroVarianceCovariate(name.clone()));
        }
    }

    let spec = build_spec(data, options)?;
    let design = spec.design_matrix(data.covariates.view())?;

    let (fit, lambdas) = match options.family {
        ModelFamily::Linear => {
            let fit =
                pirls::fit_penalized_irls(design.view(), data.presence.view(), None, &options.pirls)?;
            (fit, Vec::new())
        }
        ModelFamily::Smooth => fit_smooth(data, options, &spec, &design)?,
    };

    let summary = build_summary(data, &spec, &fit, &lambdas)?;
    log_summary(&summary);

    Ok(FittedModel {
        spec,
        coefficients: fit.beta,
        lambdas,
        summary,
    })
}

/// Builds the model blueprint from the training data: ranges and means for
/// every family, plus knots and sum-to-zero constraints for smooths.
fn build_spec(data: &ObservationData, options: &FitOptions) -> Result<ModelSpec, EstimationError> {
    let mut ranges = Vec::with_capacity(data.covariate_names.len());
    let mut means = Vec::with_capacity(data.covariate_names.len());
    for j in 0..data.covariate_names.len() {
        let column = data.covariates.column(j);
        ranges.push(column_range(column));
        means.push(column.mean().unwrap_or(0.0));
    }

    let mut knot_vectors = HashMap::new();
    let mut constraints = HashMap::new();
    let smooth = match options.family {
        ModelFamily::Linear => None,
        ModelFamily::Smooth => {
            for (j, name) in data.covariate_names.iter().enumerate() {
                let column = data.covariates.column(j);
                let knots = basis::build_knot_vector(
                    column,
                    ranges[j],
                    options.basis_dim,
                    options.degree,
                    options.placement,
                )?;
                let raw = basis::bspline_design(column, knots.view(), options.degree)?;
                let (_constrained, z) = basis::sum_to_zero_constraint(raw.view())?;
                knot_vectors.insert(name.clone(), knots);
                constraints.insert(name.clone(), z);
            }
            Some(SmoothSpec {
                basis_dim: options.basis_dim,
                degree: options.degree,
                penalty_order: options.penalty_order,
                placement: options.placement,
            })
        }
    };

    Ok(ModelSpec {
        family: options.family,
        covariate_names: data.covariate_names.clone(),
        covariate_ranges: ranges,
        covariate_means: means,
        smooth,
        knot_vectors,
        constraints,
    })
}

/// Runs the outer GCV optimization and the final P-IRLS fit for the smooth
/// family. Returns the converged fit and the per-term smoothing parameters.
fn fit_smooth(
    data: &ObservationData,
    options: &FitOptions,
    spec: &ModelSpec,
    design: &Array2<f64>,
) -> Result<(PirlsFit, Vec<f64>), EstimationError> {
    let n = data.presence.len() as f64;
    let layout = spec.layout();
    let num_terms = layout.term_ranges.len();

    // Per-term penalties in the constrained basis, embedded at their block
    // position so `S_λ` assembly is a weighted sum.
    let mut penalty_blocks: Vec<Array2<f64>> = Vec::with_capacity(num_terms);
    for (j, name) in spec.covariate_names.iter().enumerate() {
        let z = &spec.constraints[name];
        let raw_penalty = basis::difference_penalty(options.basis_dim, options.penalty_order)?;
        let constrained = z.t().dot(&raw_penalty).dot(z);
        let mut full = Array2::zeros((layout.total_columns, layout.total_columns));
        let range = layout.term_ranges[j].clone();
        full.slice_mut(s![range.clone(), range]).assign(&constrained);
        penalty_blocks.push(full);
    }

    // The optimizer owns its own copies of the fitting state; the closure
    // has to be self-contained.
    let pirls_options = options.pirls;
    let blocks_for_cost = penalty_blocks.clone();
    let design_for_cost = design.clone();
    let y_for_cost = data.presence.clone();
    let gcv_cost = move |rho: &Array1<f64>| -> f64 {
        let s_lambda = assemble_penalty(&blocks_for_cost, rho);
        match pirls::fit_penalized_irls(
            design_for_cost.view(),
            y_for_cost.view(),
            Some(&s_lambda),
            &pirls_options,
        ) {
            Ok(fit) => {
                let denominator = (n - fit.edf).max(1e-3);
                n * fit.deviance / (denominator * denominator)
            }
            Err(err) => {
                log::warn!("GCV evaluation failed ({err}); returning a large finite score");
                1e10
            }
        }
    };

    // Central-difference gradient of the GCV score; each probe is one full
    // inner P-IRLS solve, which is affordable at this design size.
    const GRAD_STEP: f64 = 1e-3;
    let cost_and_grad = move |rho: &Array1<f64>| -> (f64, Array1<f64>) {
        let cost = gcv_cost(rho);
        let mut grad = Array1::zeros(rho.len());
        for k in 0..rho.len() {
            let mut forward = rho.clone();
            let mut backward = rho.clone();
            forward[k] += GRAD_STEP;
            backward[k] -= GRAD_STEP;
            grad[k] = (gcv_cost(&forward) - gcv_cost(&backward)) / (2.0 * GRAD_STEP);
        }
        (cost, grad)
    };

    let initial_rho = Array1::from_elem(num_terms, -0.5);
    let BfgsSolution {
        final_point: final_rho,
        final_value,
        iterations,
        ..
    } = Bfgs::new(initial_rho, cost_and_grad)
        .with_tolerance(options.smoothing_tolerance)
        .with_max_iterations(options.smoothing_max_iterations)
        .run()
        .map_err(|e| EstimationError::SmoothingOptimizationFailed(format!("BFGS failed: {e:?}")))?;

    log::info!(
        "GCV optimization finished after {iterations} iterations (score {final_value:.6})"
    );

    let lambdas: Vec<f64> = final_rho
        .iter()
        .map(|&r| r.clamp(-12.0, 12.0).exp())
        .collect();
    let s_lambda = assemble_penalty(&penalty_blocks, &final_rho);
    let fit = pirls::fit_penalized_irls(
        design.view(),
        data.presence.view(),
        Some(&s_lambda),
        &options.pirls,
    )?;
    Ok((fit, lambdas))
}

/// Weighted sum of the embedded per-term penalties, `S_λ = Σ λ_j S_j`, with
/// the log smoothing parameters clamped to a numerically safe window.
fn assemble_penalty(blocks: &[Array2<f64>], rho: &Array1<f64>) -> Array2<f64> {
    let size = blocks.first().map(|b| b.nrows()).unwrap_or(0);
    let mut s_lambda = Array2::zeros((size, size));
    for (j, block) in blocks.iter().enumerate() {
        s_lambda.scaled_add(rho[j].clamp(-12.0, 12.0).exp(), block);
    }
    s_lambda
}

/// Assembles the per-term significance table and the deviance accounting.
fn build_summary(
    data: &ObservationData,
    spec: &ModelSpec,
    fit: &PirlsFit,
    lambdas: &[f64],
) -> Result<FitSummary, EstimationError> {
    let layout = spec.layout();
    let mut terms = Vec::with_capacity(spec.covariate_names.len());

    for (j, name) in spec.covariate_names.iter().enumerate() {
        let range = layout.term_ranges[j].clone();
        let term = match spec.family {
            ModelFamily::Linear => {
                let idx = range.start;
                let estimate = fit.beta[idx];
                let std_error = fit.covariance[[idx, idx]].sqrt();
                let statistic = estimate / std_error;
                TermSummary {
                    name: name.clone(),
                    detail: TermDetail::Linear {
                        estimate,
                        std_error,
                    },
                    statistic,
                    p_value: special::normal_two_sided_p(statistic),
                }
            }
            ModelFamily::Smooth => {
                let beta_block = fit.beta.slice(s![range.clone()]).to_owned();
                let cov_block = fit
                    .covariance
                    .slice(s![range.clone(), range.clone()])
                    .to_owned();
                let precision = pseudo_inverse(&cov_block)?;
                let statistic = beta_block.dot(&precision.dot(&beta_block));
                let edf: f64 = fit.edf_by_coef.slice(s![range]).sum();
                TermSummary {
                    name: name.clone(),
                    detail: TermDetail::Smooth {
                        edf,
                        lambda: lambdas[j],
                    },
                    statistic,
                    p_value: special::chi_square_sf(statistic, edf.max(0.1)),
                }
            }
        };
        terms.push(term);
    }

    let deviance = fit.deviance;
    let null_deviance = pirls::null_deviance(data.presence.view());
    Ok(FitSummary {
        intercept: fit.beta[0],
        intercept_std_error: fit.covariance[[0, 0]].sqrt(),
        terms,
        n_observations: data.presence.len(),
        null_deviance,
        deviance,
        edf: fit.edf,
        aic: deviance + 2.0 * fit.edf,
    })
}

fn log_summary(summary: &FitSummary) {
    log::info!(
        "Deviance {:.2} of {:.2} (null), {:.1}% explained, edf {:.2}, AIC {:.2}",
        summary.deviance,
        summary.null_deviance,
        100.0 * summary.explained_deviance(),
        summary.edf,
        summary.aic
    );
}

/// Moore–Penrose pseudo-inverse of a symmetric block via eigendecomposition;
/// eigenvalues below a relative floor are treated as null directions.
fn pseudo_inverse(matrix: &Array2<f64>) -> Result<Array2<f64>, EstimationError> {
    let (values, vectors) = matrix
        .eigh(UPLO::Lower)
        .map_err(EstimationError::EigendecompositionFailed)?;
    let largest = values.iter().cloned().fold(0.0_f64, f64::max);
    let floor = largest * 1e-10;
    let mut inverse = Array2::zeros(matrix.dim());
    for (k, &value) in values.iter().enumerate() {
        if value > floor {
            let u = vectors.column(k).insert_axis(Axis(1));
            inverse = inverse + &u.dot(&u.t()) / value;
        }
    }
    Ok(inverse)
}

fn column_variance(column: ArrayView1<f64>) -> f64 {
    let mean = column.mean().unwrap_or(0.0);
    column.mapv(|v| (v - mean) * (v - mean)).mean().unwrap_or(0.0)
}

fn column_range(column: ArrayView1<f64>) -> (f64, f64) {
    let lo = column.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let hi = column.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    (lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::{Distribution, Normal};

    /// Synthetic observation table with a known logistic relationship
    /// between a single covariate and the label.
    fn synthetic_observations(
        n: usize,
        seed: u64,
        truth: impl Fn(f64) -> f64,
    ) -> ObservationData {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut covariates = Array2::zeros((n, 1));
        let mut presence = Vec::with_capacity(n);
        for i in 0..n {
            let x: f64 = normal.sample(&mut rng);
            covariates[[i, 0]] = x;
            let p = 1.0 / (1.0 + (-truth(x)).exp());
            presence.push(if rng.gen::<f64>() < p { 1.0 } else { 0.0 });
        }
        ObservationData {
            ids: (1..=n as i64).collect(),
            lat: Array1::zeros(n),
            lon: Array1::zeros(n),
            x: Array1::zeros(n),
            y: Array1::zeros(n),
            presence: Array1::from_vec(presence),
            covariates,
            covariate_names: vec!["sst_day".to_string()],
            dropped_rows: 0,
        }
    }

    #[test]
    fn glm_recovers_known_logistic_relationship() {
        // True model: logit(p) = -0.5 + 1.2 x.
        let data = synthetic_observations(1000, 7, |x| -0.5 + 1.2 * x);
        let options = FitOptions {
            family: ModelFamily::Linear,
            ..FitOptions::default()
        };
        let model = train_model(&data, &options).unwrap();
        let term = &model.summary.terms[0];
        match term.detail {
            TermDetail::Linear { estimate, .. } => {
                assert!(estimate > 0.0, "slope sign, got {estimate}");
                assert!((estimate - 1.2).abs() < 0.4, "slope magnitude {estimate}");
            }
            _ => panic!("expected a linear term"),
        }
        assert!(term.p_value < 0.05, "p-value {}", term.p_value);
    }

    #[test]
    fn in_sample_mean_probability_matches_prevalence() {
        let data = synthetic_observations(1000, 11, |x| 0.3 - 0.8 * x);
        let options = FitOptions {
            family: ModelFamily::Linear,
            ..FitOptions::default()
        };
        let model = train_model(&data, &options).unwrap();
        let probs = model
            .predict(&data.covariate_names, data.covariates.view())
            .unwrap();
        let prevalence = data.presence.mean().unwrap();
        let mean_prob = probs.mean().unwrap();
        assert!(
            (mean_prob - prevalence).abs() < 1e-6,
            "mean {mean_prob} vs prevalence {prevalence}"
        );
        for &p in probs.iter() {
            assert!((0.0..=1.0).contains(&p));
        }
    }

    #[test]
    fn refitting_identical_data_is_idempotent() {
        let data = synthetic_observations(400, 23, |x| 0.4 * x);
        let options = FitOptions {
            family: ModelFamily::Linear,
            ..FitOptions::default()
        };
        let first = train_model(&data, &options).unwrap();
        let second = train_model(&data, &options).unwrap();
        for (a, b) in first.coefficients.iter().zip(second.coefficients.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn zero_variance_covariate_is_rejected() {
        let mut data = synthetic_observations(100, 3, |x| x);
        data.covariates.column_mut(0).fill(1.5);
        let err = train_model(&data, &FitOptions::default()).unwrap_err();
        match err {
            EstimationError::ZeroVarianceCovariate(name) => assert_eq!(name, "sst_day"),
            other => panic!("Expected ZeroVarianceCovariate, got {other:?}"),
        }
    }

    #[test]
    fn lowering_basis_dimension_does_not_raise_edf() {
        // Strongly wiggly truth so the flexible basis actually spends edf.
        let data = synthetic_observations(800, 41, |x| 2.0 * (3.0 * x).sin());
        let flexible = FitOptions {
            family: ModelFamily::Smooth,
            basis_dim: 10,
            ..FitOptions::default()
        };
        let rigid = FitOptions {
            family: ModelFamily::Smooth,
            basis_dim: 6,
            ..FitOptions::default()
        };
        let edf_of = |options: &FitOptions| -> f64 {
            let model = train_model(&data, options).unwrap();
            match model.summary.terms[0].detail {
                TermDetail::Smooth { edf, .. } => edf,
                _ => panic!("expected a smooth term"),
            }
        };
        let flexible_edf = edf_of(&flexible);
        let rigid_edf = edf_of(&rigid);
        assert!(
            rigid_edf <= flexible_edf + 1e-6,
            "rigid {rigid_edf} vs flexible {flexible_edf}"
        );
        // The constraint also caps each smooth at basis_dim - 1.
        assert!(rigid_edf <= 5.0 + 1e-6);
    }

    #[test]
    fn smooth_fit_improves_on_linear_for_nonmonotone_truth() {
        let data = synthetic_observations(800, 59, |x| 1.5 * (2.0 * x).cos());
        let linear = train_model(
            &data,
            &FitOptions {
                family: ModelFamily::Linear,
                ..FitOptions::default()
            },
        )
        .unwrap();
        let smooth = train_model(
            &data,
            &FitOptions {
                family: ModelFamily::Smooth,
                ..FitOptions::default()
            },
        )
        .unwrap();
        let policy = SelectionPolicy::default();
        assert_eq!(
            policy.compare_aic(smooth.summary.aic, linear.summary.aic),
            ModelComparison::PreferFirst
        );
    }

    #[test]
    fn selection_policy_thresholds() {
        let policy = SelectionPolicy::default();
        assert_eq!(policy.compare_aic(100.0, 103.0), ModelComparison::PreferFirst);
        assert_eq!(policy.compare_aic(103.0, 100.0), ModelComparison::PreferSecond);
        assert_eq!(policy.compare_aic(100.0, 101.0), ModelComparison::Equivalent);
    }

    #[test]
    fn removal_candidates_use_alpha() {
        let summary = FitSummary {
            intercept: 0.0,
            intercept_std_error: 1.0,
            terms: vec![
                TermSummary {
                    name: "depth".to_string(),
                    detail: TermDetail::Linear {
                        estimate: 1.0,
                        std_error: 0.1,
                    },
                    statistic: 10.0,
                    p_value: 0.0001,
                },
                TermSummary {
                    name: "sprat".to_string(),
                    detail: TermDetail::Linear {
                        estimate: 0.01,
                        std_error: 0.5,
                    },
                    statistic: 0.02,
                    p_value: 0.98,
                },
            ],
            n_observations: 100,
            null_deviance: 120.0,
            deviance: 100.0,
            edf: 3.0,
            aic: 106.0,
        };
        let policy = SelectionPolicy::default();
        assert_eq!(policy.removal_candidates(&summary), vec!["sprat"]);
    }
}
