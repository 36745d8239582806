//! # Upper-Level Surrogate Model
//!
//! The DC-approximated, proximally penalized surrogate of the bilevel
//! objective. At linearization point `(w_k, r_k)` with lower-level value
//! `f_L` and bound multipliers `γ`, the surrogate minimizes over `(w, r)`:
//!
//! ```text
//! φ(w, r) = ‖X_val w − y_val‖²
//!         + (ρ/2)·(‖w − w_k‖² + ‖r − r_k‖²)
//!         + α·max(0, V_k(w, r), max_i(w_i − r_i))
//! with  V_k(w, r) = ‖X_tr w − y_tr‖² − f_L + ⟨γ, r − r_k⟩
//! ```
//!
//! The max term is lifted into epigraph form with a scalar `t` and the
//! training loss into a second-order-cone epigraph `‖X_tr w − y_tr‖² ≤ v`,
//! which leaves a convex quadratic objective over `(w, r, v, t)` with
//! `r ≥ 0`, `t ≥ 0`, two affine epigraph rows per coordinate block, and one
//! second-order cone. The whole structure is stuffed once; the only entries
//! that change between outer iterations are the proximal center in `q`, the
//! penalty weight on `t`, the γ coefficients inside `A`, and one entry of
//! `b`, so each call to [`SurrogateModel::solve`] is a pure numeric
//! re-solve of the same symbolic problem.
//!
//! Variable layout: `x = [w (p) | r (p) | v | t]`.
//! Row layout: `p` rows `r ≥ 0`, one row `t ≥ 0`, one value-function row
//! `v + γᵀr − t ≤ f_L + γᵀr_k`, `p` box rows `w_i − r_i − t ≤ 0`, then the
//! cone `‖(2(X_tr w − y_tr), v − 1)‖ ≤ v + 1`.

use crate::data::DatasetSplit;
use crate::estimate::EstimationError;
use crate::solver::{self, ConeDims, ConicProgram, SolverError, SolverSettings};
use ndarray::{Array1, ArrayView1, ArrayView2};

/// Result of one surrogate solve: the realized objective and the next
/// iterate. Bounds are clamped elementwise at zero before being returned.
#[derive(Debug, Clone)]
pub struct SurrogateStep {
    pub objective: f64,
    pub weights: Array1<f64>,
    pub bounds: Array1<f64>,
}

pub struct SurrogateModel<'a> {
    x_train: ArrayView2<'a, f64>,
    y_train: ArrayView1<'a, f64>,
    x_val: ArrayView2<'a, f64>,
    y_val: ArrayView1<'a, f64>,
    /// Constant part of the w-block linear cost, −2·X_valᵀy_val.
    lin_val: Array1<f64>,
    rho: f64,
    program: ConicProgram,
    /// nzval positions of the γ coefficients in the value-function row.
    gamma_slots: Vec<usize>,
    settings: SolverSettings,
    previous: Option<(Array1<f64>, Array1<f64>)>,
    snapshot: Option<(f64, Array1<f64>)>,
    alpha: Option<f64>,
    last_violation: Option<f64>,
}

impl<'a> SurrogateModel<'a> {
    /// Builds the fixed surrogate structure over the given dataset split.
    pub fn new(
        data: &'a DatasetSplit,
        proximal_weight: f64,
        settings: SolverSettings,
    ) -> Result<Self, EstimationError> {
        if !(proximal_weight > 0.0) || !proximal_weight.is_finite() {
            return Err(EstimationError::InvalidConfiguration(format!(
                "proximal weight must be positive and finite, got {proximal_weight}"
            )));
        }
        let p = data.num_features();
        let n_train = data.x_train.nrows();
        let rho = proximal_weight;

        let (col_v, col_t) = (2 * p, 2 * p + 1);
        let n_vars = 2 * p + 2;

        // Quadratic cost: ½xᵀPx with P_ww = 2·X_valᵀX_val + ρI, P_rr = ρI.
        let gram_val = data.x_val.t().dot(&data.x_val);
        let mut p_triplets = Vec::with_capacity(p * (p + 1) / 2 + p);
        for i in 0..p {
            for j in i..p {
                let mut value = 2.0 * gram_val[[i, j]];
                if i == j {
                    value += rho;
                }
                p_triplets.push((i, j, value));
            }
        }
        for i in 0..p {
            p_triplets.push((p + i, p + i, rho));
        }

        // Constraint rows, nonnegative cone first.
        let row_vf = p + 1;
        let soc_start = 2 * p + 2;
        let mut a_triplets: Vec<(usize, usize, f64)> = Vec::new();
        for i in 0..p {
            a_triplets.push((i, p + i, -1.0)); // r_i >= 0
        }
        a_triplets.push((p, col_t, -1.0)); // t >= 0
        // Value-function row; γ slots start as zeros and are patched per solve.
        for i in 0..p {
            a_triplets.push((row_vf, p + i, 0.0));
        }
        a_triplets.push((row_vf, col_v, 1.0));
        a_triplets.push((row_vf, col_t, -1.0));
        for i in 0..p {
            let row = p + 2 + i; // w_i - r_i - t <= 0
            a_triplets.push((row, i, 1.0));
            a_triplets.push((row, p + i, -1.0));
            a_triplets.push((row, col_t, -1.0));
        }
        // SOC block for ‖X_tr w − y_tr‖² ≤ v, as ‖(2·res, v−1)‖ ≤ v+1.
        a_triplets.push((soc_start, col_v, -1.0));
        a_triplets.push((soc_start + 1, col_v, -1.0));
        for j in 0..n_train {
            for i in 0..p {
                let coefficient = data.x_train[[j, i]];
                if coefficient != 0.0 {
                    a_triplets.push((soc_start + 2 + j, i, -2.0 * coefficient));
                }
            }
        }

        let n_rows = soc_start + 2 + n_train;
        let mut b = vec![0.0; n_rows];
        b[soc_start] = 1.0;
        b[soc_start + 1] = -1.0;
        for j in 0..n_train {
            b[soc_start + 2 + j] = -2.0 * data.y_train[j];
        }

        let a = solver::csc_from_triplets(n_rows, n_vars, &a_triplets);
        let mut gamma_slots = Vec::with_capacity(p);
        for i in 0..p {
            // The slot exists by construction; a missing entry would mean the
            // stuffing above is inconsistent with the row layout.
            let slot = solver::nz_index(&a, row_vf, p + i).ok_or_else(|| {
                EstimationError::InvalidConfiguration(
                    "internal surrogate structure is missing a multiplier slot".to_string(),
                )
            })?;
            gamma_slots.push(slot);
        }

        let program = ConicProgram {
            p: solver::csc_from_triplets(n_vars, n_vars, &p_triplets),
            q: vec![0.0; n_vars],
            a,
            b,
            cones: ConeDims {
                nonneg: 2 * p + 2,
                soc: vec![n_train + 2],
            },
        };

        Ok(Self {
            x_train: data.x_train.view(),
            y_train: data.y_train.view(),
            x_val: data.x_val.view(),
            y_val: data.y_val.view(),
            lin_val: data.x_val.t().dot(&data.y_val).mapv(|v| -2.0 * v),
            rho,
            program,
            gamma_slots,
            settings,
            previous: None,
            snapshot: None,
            alpha: None,
            last_violation: None,
        })
    }

    /// Number of features the surrogate optimizes over.
    pub fn num_features(&self) -> usize {
        self.gamma_slots.len()
    }

    /// Stores the linearization point `(w_k, r_k)`. Invalidates the pending
    /// violation value of the previous solve.
    pub fn set_previous_iterate(
        &mut self,
        w: ArrayView1<f64>,
        r: ArrayView1<f64>,
    ) -> Result<(), EstimationError> {
        let p = self.num_features();
        if w.len() != p || r.len() != p {
            return Err(EstimationError::InvalidConfiguration(format!(
                "previous iterate has lengths ({}, {}) but the model has {} features",
                w.len(),
                r.len(),
                p
            )));
        }
        self.previous = Some((w.to_owned(), r.to_owned()));
        self.last_violation = None;
        Ok(())
    }

    /// Stores the lower-level value snapshot `(f_L, γ)` taken at `r_k`.
    pub fn set_value_snapshot(
        &mut self,
        value: f64,
        duals: ArrayView1<f64>,
    ) -> Result<(), EstimationError> {
        let p = self.num_features();
        if duals.len() != p {
            return Err(EstimationError::InvalidConfiguration(format!(
                "dual vector has {} entries but the model has {} features",
                duals.len(),
                p
            )));
        }
        self.snapshot = Some((value, duals.to_owned()));
        self.last_violation = None;
        Ok(())
    }

    /// Stores the current exact-penalty weight α ≥ 0. Owned and escalated by
    /// the orchestrator, only read here.
    pub fn set_penalty_weight(&mut self, alpha: f64) -> Result<(), EstimationError> {
        if !(alpha >= 0.0) || !alpha.is_finite() {
            return Err(EstimationError::InvalidConfiguration(format!(
                "penalty weight must be nonnegative and finite, got {alpha}"
            )));
        }
        self.alpha = Some(alpha);
        self.last_violation = None;
        Ok(())
    }

    /// Re-solves the surrogate at the injected parameters and returns the
    /// next iterate. The surrogate is feasible for every parameter choice,
    /// so an infeasibility report is surfaced as a configuration error.
    pub fn solve(&mut self) -> Result<SurrogateStep, EstimationError> {
        let p = self.num_features();
        let (w_k, r_k) = self.previous.as_ref().ok_or(EstimationError::StaleRead(
            "surrogate solve requested before the previous iterate was injected",
        ))?;
        let (f_lower, gamma) = self.snapshot.as_ref().ok_or(EstimationError::StaleRead(
            "surrogate solve requested before the value-function snapshot was injected",
        ))?;
        let alpha = self.alpha.ok_or(EstimationError::StaleRead(
            "surrogate solve requested before the penalty weight was injected",
        ))?;

        // Numeric parameter update on the fixed structure.
        for i in 0..p {
            self.program.q[i] = self.lin_val[i] - self.rho * w_k[i];
            self.program.q[p + i] = -self.rho * r_k[i];
            self.program.a.nzval[self.gamma_slots[i]] = gamma[i];
        }
        self.program.q[2 * p] = 0.0;
        self.program.q[2 * p + 1] = alpha;
        self.program.b[p + 1] = f_lower + gamma.dot(r_k);

        let solution = solver::solve(&self.program, &self.settings).map_err(|e| match e {
            SolverError::Infeasible | SolverError::Unbounded => {
                EstimationError::SurrogateInfeasible
            }
            other => EstimationError::Solver(other),
        })?;

        let weights = Array1::from_iter(solution.x[0..p].iter().copied());
        // The r >= 0 row keeps the solution nonnegative up to solver
        // tolerance; the clamp removes the residual jitter.
        let bounds = Array1::from_iter(solution.x[p..2 * p].iter().map(|&v| v.max(0.0)));

        let train_residual = self.x_train.dot(&weights) - &self.y_train;
        let train_loss = train_residual.mapv(|e| e * e).sum();
        let linearized = train_loss - f_lower + gamma.dot(&(&bounds - r_k));
        let box_excess = weights
            .iter()
            .zip(bounds.iter())
            .map(|(w, r)| w - r)
            .fold(f64::NEG_INFINITY, f64::max);
        let violation = linearized.max(box_excess).max(0.0);

        let val_residual = self.x_val.dot(&weights) - &self.y_val;
        let proximity = (&weights - w_k).mapv(|d| d * d).sum()
            + (&bounds - r_k).mapv(|d| d * d).sum();
        let objective =
            val_residual.mapv(|e| e * e).sum() + 0.5 * self.rho * proximity + alpha * violation;

        self.last_violation = Some(violation);
        Ok(SurrogateStep {
            objective,
            weights,
            bounds,
        })
    }

    /// The realized value of the max-penalty term at the last optimum. Valid
    /// only between [`solve`](Self::solve) and the next parameter injection;
    /// anything else is a usage error, never stale data.
    pub fn violation(&self) -> Result<f64, EstimationError> {
        self.last_violation.ok_or(EstimationError::StaleRead(
            "surrogate violation requested before a successful solve",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1, Array2};

    fn toy_split() -> DatasetSplit {
        let x = array![
            [1.0, 0.0],
            [0.0, 1.0],
            [1.0, 1.0],
            [1.0, -1.0],
            [2.0, 1.0],
            [0.5, 0.5],
        ];
        let y = array![2.0, 1.0, 3.0, 1.0, 5.0, 1.5];
        DatasetSplit::from_rows(x, y, 4, 2).unwrap()
    }

    fn injected_model(data: &DatasetSplit, alpha: f64) -> SurrogateModel<'_> {
        let mut model = SurrogateModel::new(data, 1.0, SolverSettings::default()).unwrap();
        let w0 = Array1::zeros(2);
        let r0 = Array1::ones(2);
        model.set_previous_iterate(w0.view(), r0.view()).unwrap();
        model
            .set_value_snapshot(4.0, array![0.5, 0.0].view())
            .unwrap();
        model.set_penalty_weight(alpha).unwrap();
        model
    }

    #[test]
    fn returns_nonnegative_bounds() {
        let data = toy_split();
        let mut model = injected_model(&data, 1.0);
        let step = model.solve().unwrap();
        assert!(step.bounds.iter().all(|&r| r >= 0.0));
        assert!(step.objective.is_finite());
        let violation = model.violation().unwrap();
        assert!(violation >= 0.0);
    }

    #[test]
    fn zero_penalty_weight_is_accepted() {
        let data = toy_split();
        let mut model = injected_model(&data, 0.0);
        let step = model.solve().unwrap();
        assert!(step.bounds.iter().all(|&r| r >= 0.0));
        assert!(model.violation().unwrap() >= 0.0);
    }

    #[test]
    fn large_penalty_drives_violation_down() {
        let data = toy_split();
        let mut low = injected_model(&data, 0.0);
        low.solve().unwrap();
        let relaxed = low.violation().unwrap();

        let mut high = injected_model(&data, 1e4);
        high.solve().unwrap();
        let enforced = high.violation().unwrap();
        assert!(enforced <= relaxed + 1e-6);
    }

    #[test]
    fn violation_before_solve_is_a_usage_error() {
        let data = toy_split();
        let model = injected_model(&data, 1.0);
        assert!(matches!(
            model.violation(),
            Err(EstimationError::StaleRead(_))
        ));
    }

    #[test]
    fn reinjection_invalidates_the_violation() {
        let data = toy_split();
        let mut model = injected_model(&data, 1.0);
        let step = model.solve().unwrap();
        assert!(model.violation().is_ok());
        model
            .set_previous_iterate(step.weights.view(), step.bounds.view())
            .unwrap();
        assert!(matches!(
            model.violation(),
            Err(EstimationError::StaleRead(_))
        ));
    }

    #[test]
    fn solve_without_injection_is_a_usage_error() {
        let data = toy_split();
        let mut model = SurrogateModel::new(&data, 1.0, SolverSettings::default()).unwrap();
        assert!(matches!(
            model.solve(),
            Err(EstimationError::StaleRead(_))
        ));
    }

    #[test]
    fn proximal_center_is_respected_for_huge_rho() {
        // With an overwhelming proximal weight the step stays at the center.
        let data = toy_split();
        let mut model = SurrogateModel::new(&data, 1e8, SolverSettings::default()).unwrap();
        let w0 = array![0.3, -0.2];
        let r0 = array![0.8, 0.4];
        model.set_previous_iterate(w0.view(), r0.view()).unwrap();
        model
            .set_value_snapshot(1.0, Array1::zeros(2).view())
            .unwrap();
        model.set_penalty_weight(1.0).unwrap();
        let step = model.solve().unwrap();
        assert_abs_diff_eq!(step.weights[0], w0[0], epsilon = 1e-3);
        assert_abs_diff_eq!(step.weights[1], w0[1], epsilon = 1e-3);
        assert_abs_diff_eq!(step.bounds[0], r0[0], epsilon = 1e-3);
        assert_abs_diff_eq!(step.bounds[1], r0[1], epsilon = 1e-3);
    }

    #[test]
    fn rejects_nonpositive_proximal_weight() {
        let data = toy_split();
        assert!(matches!(
            SurrogateModel::new(&data, 0.0, SolverSettings::default()),
            Err(EstimationError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn rejects_mismatched_injection_lengths() {
        let data = toy_split();
        let mut model = SurrogateModel::new(&data, 1.0, SolverSettings::default()).unwrap();
        let w = Array1::zeros(3);
        let r = Array1::ones(3);
        assert!(matches!(
            model.set_previous_iterate(w.view(), r.view()),
            Err(EstimationError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            model.set_value_snapshot(0.0, Array2::<f64>::zeros((1, 3)).row(0)),
            Err(EstimationError::InvalidConfiguration(_))
        ));
    }
}
