//! # Lower-Level Training Model
//!
//! Wraps the convex training-error minimization of the bilevel program:
//! for a nonnegative bound vector `r`, minimize `‖X_tr w − y_tr‖²` subject
//! to the per-coordinate bound `w_i ≤ r_i`. The bound is one-sided on
//! purpose, matching the formulation the surrogate model linearizes (see
//! DESIGN.md).
//!
//! The quadratic structure is stuffed once at construction; each call to
//! [`TrainingLossModel::solve`] only rewrites the constraint right-hand
//! side before re-solving, and caches the optimum so the bound multipliers
//! can be read back as the value-function subgradient.

use crate::estimate::EstimationError;
use crate::solver::{self, ConeDims, ConicProgram, SolverError, SolverSettings};
use ndarray::{Array1, ArrayView1, ArrayView2};

/// Optimum of the most recent lower-level solve.
struct FittedPoint {
    value: f64,
    duals: Array1<f64>,
    bounds: Array1<f64>,
}

/// The lower-level model: training loss under per-coordinate upper bounds.
pub struct TrainingLossModel<'a> {
    x: ArrayView2<'a, f64>,
    y: ArrayView1<'a, f64>,
    program: ConicProgram,
    settings: SolverSettings,
    last: Option<FittedPoint>,
}

impl<'a> TrainingLossModel<'a> {
    /// Builds the fixed problem structure for the given training block.
    pub fn new(
        x: ArrayView2<'a, f64>,
        y: ArrayView1<'a, f64>,
        settings: SolverSettings,
    ) -> Result<Self, EstimationError> {
        if x.nrows() != y.len() {
            return Err(EstimationError::InvalidConfiguration(format!(
                "training design matrix has {} rows but the response has {} entries",
                x.nrows(),
                y.len()
            )));
        }
        let p = x.ncols();

        // Objective ‖Xw − y‖² = ½ wᵀ(2XᵀX)w − 2(Xᵀy)ᵀw + const.
        let gram = x.t().dot(&x);
        let mut p_triplets = Vec::with_capacity(p * (p + 1) / 2);
        for i in 0..p {
            for j in i..p {
                p_triplets.push((i, j, 2.0 * gram[[i, j]]));
            }
        }
        let q = x.t().dot(&y).mapv(|v| -2.0 * v).to_vec();

        // Bound rows w_i <= r_i: A = I, b = r, s >= 0.
        let a_triplets: Vec<(usize, usize, f64)> = (0..p).map(|i| (i, i, 1.0)).collect();

        let program = ConicProgram {
            p: solver::csc_from_triplets(p, p, &p_triplets),
            q,
            a: solver::csc_from_triplets(p, p, &a_triplets),
            b: vec![0.0; p],
            cones: ConeDims {
                nonneg: p,
                soc: vec![],
            },
        };
        Ok(Self {
            x,
            y,
            program,
            settings,
            last: None,
        })
    }

    /// Number of features (and of bound constraints).
    pub fn num_features(&self) -> usize {
        self.program.q.len()
    }

    /// Solves the training problem at bound vector `r`, returning the
    /// optimal training loss. `w = 0` is feasible for every `r ≥ 0`, so an
    /// infeasibility report means the model was configured inconsistently
    /// and is surfaced as a fatal error.
    ///
    /// Repeated calls with an identical bound vector reuse the cached
    /// optimum instead of re-solving.
    pub fn solve(&mut self, r: ArrayView1<f64>) -> Result<f64, EstimationError> {
        let p = self.num_features();
        if r.len() != p {
            return Err(EstimationError::InvalidConfiguration(format!(
                "bound vector has {} entries but the model has {} features",
                r.len(),
                p
            )));
        }
        if r.iter().any(|&v| !(v >= 0.0) || !v.is_finite()) {
            return Err(EstimationError::InvalidConfiguration(
                "bound vector must be elementwise nonnegative and finite".to_string(),
            ));
        }
        if let Some(fit) = &self.last {
            if fit.bounds == r {
                return Ok(fit.value);
            }
        }

        for (slot, &bound) in self.program.b.iter_mut().zip(r.iter()) {
            *slot = bound;
        }
        let solution = solver::solve(&self.program, &self.settings).map_err(|e| match e {
            SolverError::Infeasible | SolverError::Unbounded => {
                EstimationError::LowerLevelInfeasible
            }
            other => EstimationError::Solver(other),
        })?;

        let weights = Array1::from_vec(solution.x);
        let residual = self.x.dot(&weights) - &self.y;
        let value = residual.mapv(|e| e * e).sum();
        // Inequality multipliers are nonnegative up to solver tolerance.
        let duals = Array1::from_iter(solution.z.iter().map(|&z| z.max(0.0)));
        self.last = Some(FittedPoint {
            value,
            duals,
            bounds: r.to_owned(),
        });
        Ok(value)
    }

    /// Multipliers of the bound constraints at the last optimum, one per
    /// coordinate. Reading before any successful [`solve`](Self::solve) is
    /// a usage error.
    pub fn dual_values(&self) -> Result<&Array1<f64>, EstimationError> {
        self.last
            .as_ref()
            .map(|fit| &fit.duals)
            .ok_or(EstimationError::StaleRead(
                "lower-level dual values requested before a successful solve",
            ))
    }
}
