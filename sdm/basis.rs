//! B-spline machinery for the smooth-term model: knot placement, basis
//! evaluation (Cox–de Boor, NURBS-book triangular recurrence), difference
//! penalties, and the sum-to-zero identifiability constraint.
//!
//! Training builds a knot vector from the observed covariate values; the knot
//! vector is saved in the fitted-model artifact and prediction re-evaluates
//! the exact same basis on new data, so the two design matrices are always
//! consistent.

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::QR;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Strategy for placing interior knots along a covariate's range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KnotPlacement {
    /// Evenly spaced interior knots across the training range.
    Uniform,
    /// Interior knots at quantiles of the training values (adapts the basis
    /// to where the data actually sit).
    Quantile,
}

/// Errors raised by basis construction.
#[derive(Error, Debug)]
pub enum BasisError {
    #[error("Spline degree must be at least 1, but was {0}.")]
    InvalidDegree(usize),

    #[error("Basis dimension {dim} is too small for degree {degree}; need at least degree + 2.")]
    BasisDimensionTooSmall { dim: usize, degree: usize },

    #[error("Covariate range is degenerate: ({0}, {1}). The covariate may have zero variance.")]
    DegenerateRange(f64, f64),

    #[error("Cannot place {num_knots} quantile knots from only {num_points} data points.")]
    InsufficientDataForKnots { num_knots: usize, num_points: usize },

    #[error(
        "Penalty order ({order}) must be positive and less than the number of basis functions ({num_basis})."
    )]
    InvalidPenaltyOrder { order: usize, num_basis: usize },

    #[error("QR decomposition failed while building the constraint null space: {0}")]
    LinalgError(#[from] ndarray_linalg::error::LinalgError),
}

/// Builds the clamped knot vector for one smooth term.
///
/// `basis_dim` is the number of basis functions before the identifiability
/// constraint; the interior knot count follows as
/// `basis_dim - degree - 1`. Boundary knots are repeated `degree + 1` times.
pub fn build_knot_vector(
    training_values: ArrayView1<f64>,
    range: (f64, f64),
    basis_dim: usize,
    degree: usize,
    placement: KnotPlacement,
) -> Result<Array1<f64>, BasisError> {
    if degree < 1 {
        return Err(BasisError::InvalidDegree(degree));
    }
    if basis_dim < degree + 2 {
        return Err(BasisError::BasisDimensionTooSmall {
            dim: basis_dim,
            degree,
        });
    }
    let (lo, hi) = range;
    if !(lo < hi) {
        return Err(BasisError::DegenerateRange(lo, hi));
    }

    let num_interior = basis_dim - degree - 1;
    let interior = match placement {
        KnotPlacement::Uniform => {
            let step = (hi - lo) / (num_interior as f64 + 1.0);
            (1..=num_interior).map(|i| lo + i as f64 * step).collect()
        }
        KnotPlacement::Quantile => {
            if training_values.len() < num_interior {
                return Err(BasisError::InsufficientDataForKnots {
                    num_knots: num_interior,
                    num_points: training_values.len(),
                });
            }
            quantiles(training_values, num_interior)
        }
    };

    let mut knots = Vec::with_capacity(num_interior + 2 * (degree + 1));
    knots.extend(std::iter::repeat(lo).take(degree + 1));
    knots.extend(interior);
    knots.extend(std::iter::repeat(hi).take(degree + 1));
    Ok(Array1::from_vec(knots))
}

/// Evaluates the B-spline design matrix for `data` on a fixed knot vector.
///
/// Values outside the knot span are clamped to the boundary, so prediction
/// on grids slightly outside the surveyed range stays defined. The returned
/// matrix has shape `[data.len(), knots.len() - degree - 1]` and each row
/// sums to one.
pub fn bspline_design(
    data: ArrayView1<f64>,
    knots: ArrayView1<f64>,
    degree: usize,
) -> Result<Array2<f64>, BasisError> {
    if degree < 1 {
        return Err(BasisError::InvalidDegree(degree));
    }
    let num_basis = knots.len() - degree - 1;
    let mut design = Array2::zeros((data.len(), num_basis));
    for (i, &value) in data.iter().enumerate() {
        let (span, local) = evaluate_at_point(value, degree, knots);
        for (r, &b) in local.iter().enumerate() {
            design[[i, span - degree + r]] = b;
        }
    }
    Ok(design)
}

/// Difference penalty `S = D'D` on adjacent spline coefficients; the P-spline
/// wiggliness penalty.
pub fn difference_penalty(num_basis: usize, order: usize) -> Result<Array2<f64>, BasisError> {
    if order == 0 || order >= num_basis {
        return Err(BasisError::InvalidPenaltyOrder {
            order,
            num_basis,
        });
    }
    let mut d = Array2::<f64>::eye(num_basis);
    for _ in 0..order {
        d = &d.slice(s![1.., ..]) - &d.slice(s![..-1, ..]);
    }
    Ok(d.t().dot(&d))
}

/// Reparameterizes a basis to be orthogonal to the intercept (sum-to-zero
/// constraint), removing the confounding between the intercept and each
/// smooth. Returns the constrained basis (one fewer column) and the `Z`
/// transform needed to apply the same constraint at prediction time.
pub fn sum_to_zero_constraint(
    basis: ArrayView2<f64>,
) -> Result<(Array2<f64>, Array2<f64>), BasisError> {
    let n_basis = basis.ncols();
    let column_sums = basis.sum_axis(Axis(0));
    let c = column_sums
        .to_shape((n_basis, 1))
        .expect("column sums reshape cannot fail")
        .to_owned();

    // The first column of Q spans c; the rest span its null space.
    let (q, _r) = c.qr()?;
    let z = q.slice(s![.., 1..]).to_owned();
    Ok((basis.dot(&z), z))
}

/// Quantiles with linear interpolation between order statistics (the same
/// convention R's `quantile(type = 7)` uses).
fn quantiles(values: ArrayView1<f64>, count: usize) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    (1..=count)
        .map(|k| {
            let p = k as f64 / (count as f64 + 1.0);
            let position = (n as f64 - 1.0) * p;
            let below = position.floor() as usize;
            let above = position.ceil() as usize;
            if below == above {
                sorted[below]
            } else {
                let w = position - below as f64;
                sorted[below] * (1.0 - w) + sorted[above] * w
            }
        })
        .collect()
}

/// Evaluates the `degree + 1` non-zero basis functions at one point using the
/// triangular recurrence (The NURBS Book, A2.2). Returns the knot span and
/// the local values; the caller scatters them into the design row.
fn evaluate_at_point(x: f64, degree: usize, knots: ArrayView1<f64>) -> (usize, Vec<f64>) {
    let num_basis = knots.len() - degree - 1;
    let lo = knots[degree];
    let hi = knots[num_basis];
    let x = x.clamp(lo, hi);

    // Knot span `span` with knots[span] <= x < knots[span + 1]; the last
    // span absorbs x == hi.
    let mut span = degree;
    while span + 1 < num_basis && x >= knots[span + 1] {
        span += 1;
    }

    let mut values = vec![0.0; degree + 1];
    let mut left = vec![0.0; degree + 1];
    let mut right = vec![0.0; degree + 1];
    values[0] = 1.0;
    for j in 1..=degree {
        left[j] = x - knots[span + 1 - j];
        right[j] = knots[span + j] - x;
        let mut saved = 0.0;
        for r in 0..j {
            let denom = right[r + 1] + left[j - r];
            let term = if denom > 0.0 { values[r] / denom } else { 0.0 };
            values[r] = saved + right[r + 1] * term;
            saved = left[j - r] * term;
        }
        values[j] = saved;
    }
    (span, values)
}
