//! Single-level reference fit: the coupled weighted lasso with a fixed
//! penalty vector. This is the naive alternative to bilevel bound
//! selection, kept as a comparison point for validation-error reporting.

use crate::estimate::EstimationError;
use crate::solver::{self, ConeDims, ConicProgram, SolverSettings};
use ndarray::{Array1, ArrayView1, ArrayView2};

/// Solves `min ‖Xw − y‖² + λᵀ|w|` for a fixed nonnegative penalty vector
/// λ and returns the fitted weights.
///
/// The absolute values are lifted with auxiliary variables `u ≥ |w|`,
/// leaving a quadratic program over `[w | u]`.
pub fn fixed_penalty_lasso(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    lambda: ArrayView1<f64>,
    settings: &SolverSettings,
) -> Result<Array1<f64>, EstimationError> {
    let p = x.ncols();
    if x.nrows() != y.len() {
        return Err(EstimationError::InvalidConfiguration(format!(
            "design matrix has {} rows but the response has {} entries",
            x.nrows(),
            y.len()
        )));
    }
    if lambda.len() != p {
        return Err(EstimationError::InvalidConfiguration(format!(
            "penalty vector has {} entries but the design matrix has {} columns",
            lambda.len(),
            p
        )));
    }
    if lambda.iter().any(|&v| !(v >= 0.0) || !v.is_finite()) {
        return Err(EstimationError::InvalidConfiguration(
            "penalty vector must be elementwise nonnegative and finite".to_string(),
        ));
    }

    // ½xᵀPx with P_ww = 2·XᵀX; the u block is linear only.
    let gram = x.t().dot(&x);
    let mut p_triplets = Vec::with_capacity(p * (p + 1) / 2);
    for i in 0..p {
        for j in i..p {
            p_triplets.push((i, j, 2.0 * gram[[i, j]]));
        }
    }
    let mut q = x.t().dot(&y).mapv(|v| -2.0 * v).to_vec();
    q.extend(lambda.iter().copied());

    // w_i − u_i <= 0 and −w_i − u_i <= 0.
    let mut a_triplets = Vec::with_capacity(4 * p);
    for i in 0..p {
        a_triplets.push((i, i, 1.0));
        a_triplets.push((i, p + i, -1.0));
        a_triplets.push((p + i, i, -1.0));
        a_triplets.push((p + i, p + i, -1.0));
    }

    let program = ConicProgram {
        p: solver::csc_from_triplets(2 * p, 2 * p, &p_triplets),
        q,
        a: solver::csc_from_triplets(2 * p, 2 * p, &a_triplets),
        b: vec![0.0; 2 * p],
        cones: ConeDims {
            nonneg: 2 * p,
            soc: vec![],
        },
    };

    let solution = solver::solve(&program, settings)?;
    Ok(Array1::from_iter(solution.x[0..p].iter().copied()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn zero_penalty_recovers_least_squares() {
        // y = 2·x1 + 1·x2 exactly; with λ = 0 the fit interpolates.
        let x = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0], [1.0, -1.0]];
        let y = array![2.0, 1.0, 3.0, 1.0];
        let lambda = array![0.0, 0.0];
        let w = fixed_penalty_lasso(x.view(), y.view(), lambda.view(), &SolverSettings::default())
            .unwrap();
        assert_abs_diff_eq!(w[0], 2.0, epsilon = 1e-5);
        assert_abs_diff_eq!(w[1], 1.0, epsilon = 1e-5);
    }

    #[test]
    fn overwhelming_penalty_shrinks_to_zero() {
        let x = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0], [1.0, -1.0]];
        let y = array![2.0, 1.0, 3.0, 1.0];
        let lambda = array![1e6, 1e6];
        let w = fixed_penalty_lasso(x.view(), y.view(), lambda.view(), &SolverSettings::default())
            .unwrap();
        assert_abs_diff_eq!(w[0], 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(w[1], 0.0, epsilon = 1e-4);
    }

    #[test]
    fn rejects_negative_penalties() {
        let x = array![[1.0, 0.0], [0.0, 1.0]];
        let y = array![1.0, 1.0];
        let lambda = array![1.0, -1.0];
        assert!(matches!(
            fixed_penalty_lasso(x.view(), y.view(), lambda.view(), &SolverSettings::default()),
            Err(EstimationError::InvalidConfiguration(_))
        ));
    }
}
