//! # Hyperparameter Selection via the Outer DC Iteration
//!
//! This module orchestrates the bilevel selection procedure. The bilevel
//! program (minimize validation error over bound vectors `r`, subject to
//! the weights solving the constrained training problem) is handled
//! through a single-level, difference-of-convex reformulation:
//!
//! 1. **Lower level:** for the current `r`, the training model produces the
//!    value function `f_L` and the bound multipliers `γ` (its subgradient
//!    surrogate).
//! 2. **Upper level:** the proximally penalized surrogate is re-solved at
//!    that linearization, yielding the next iterate `(w, r)` and the
//!    realized feasibility violation.
//! 3. **Escalation:** the exact-penalty weight α grows adaptively whenever
//!    the relative step is small compared to the (scaled, capped)
//!    violation, so lower-level optimality is eventually enforced without
//!    growing α unboundedly once the violation is already tiny.
//!
//! The loop terminates with an explicit tagged outcome: either both the
//! relative step and the violation fell below the tolerance, or the
//! iteration budget ran out. Callers never have to infer convergence from
//! the shape of the return value.

use crate::data::DatasetSplit;
use crate::solver::{SolverError, SolverSettings};
use crate::surrogate::SurrogateModel;
use crate::training::TrainingLossModel;
use ndarray::{Array1, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// A comprehensive error type for the selection process.
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("convex solver failed: {0}")]
    Solver(#[from] SolverError),

    #[error(
        "the lower-level training problem was reported infeasible; w = 0 is feasible for every nonnegative bound vector, so the model configuration is inconsistent"
    )]
    LowerLevelInfeasible,

    #[error(
        "the upper-level surrogate was reported infeasible or unbounded; the surrogate is feasible and bounded by construction, so the model configuration is inconsistent"
    )]
    SurrogateInfeasible,

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("stale read: {0}")]
    StaleRead(&'static str),

    #[error("IO error while reading configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration file could not be parsed: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

/// Configuration for the outer DC iteration. Every field is optional in
/// serialized form and defaults to the values below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SelectionConfig {
    /// Outer iteration budget.
    pub max_iterations: usize,
    /// Tolerance applied to both the relative step and the violation.
    pub tolerance: f64,
    /// Initial exact-penalty weight α.
    pub initial_alpha: f64,
    /// Escalation threshold c_α in the adaptive rule.
    pub alpha_escalation: f64,
    /// Amount δ added to α on each escalation.
    pub alpha_increment: f64,
    /// Proximal weight ρ of the surrogate, fixed across iterations.
    pub proximal_weight: f64,
    /// Starting weights; defaults to the zero vector.
    pub initial_w: Option<Vec<f64>>,
    /// Starting bounds; defaults to the all-ones vector.
    pub initial_r: Option<Vec<f64>>,
    /// Settings forwarded to the convex solver.
    pub solver: SolverSettings,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        SelectionConfig {
            max_iterations: 10,
            tolerance: 0.1,
            initial_alpha: 1.0,
            alpha_escalation: 1.0,
            alpha_increment: 5.0,
            proximal_weight: 1.0,
            initial_w: None,
            initial_r: None,
            solver: SolverSettings::default(),
        }
    }
}

impl SelectionConfig {
    /// Parses a configuration from TOML text. Unknown keys are rejected so
    /// misspelled options fail loudly instead of silently using a default.
    pub fn from_toml_str(text: &str) -> Result<Self, EstimationError> {
        let config = toml::from_str(text)?;
        Ok(config)
    }

    /// Loads a configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, EstimationError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Validates the configuration against the feature count `p`, eagerly,
    /// before any solve.
    pub fn validate(&self, p: usize) -> Result<(), EstimationError> {
        if self.max_iterations == 0 {
            return Err(EstimationError::InvalidConfiguration(
                "max_iterations must be positive".to_string(),
            ));
        }
        if !(self.tolerance > 0.0) || !self.tolerance.is_finite() {
            return Err(EstimationError::InvalidConfiguration(format!(
                "tolerance must be positive and finite, got {}",
                self.tolerance
            )));
        }
        if !(self.proximal_weight > 0.0) || !self.proximal_weight.is_finite() {
            return Err(EstimationError::InvalidConfiguration(format!(
                "proximal_weight must be positive and finite, got {}",
                self.proximal_weight
            )));
        }
        for (name, value) in [
            ("initial_alpha", self.initial_alpha),
            ("alpha_escalation", self.alpha_escalation),
            ("alpha_increment", self.alpha_increment),
        ] {
            if !(value >= 0.0) || !value.is_finite() {
                return Err(EstimationError::InvalidConfiguration(format!(
                    "{name} must be nonnegative and finite, got {value}"
                )));
            }
        }
        if let Some(w) = &self.initial_w {
            if w.len() != p {
                return Err(EstimationError::InvalidConfiguration(format!(
                    "initial_w has {} entries but the dataset has {} features",
                    w.len(),
                    p
                )));
            }
            if w.iter().any(|v| !v.is_finite()) {
                return Err(EstimationError::InvalidConfiguration(
                    "initial_w must contain only finite values".to_string(),
                ));
            }
        }
        if let Some(r) = &self.initial_r {
            if r.len() != p {
                return Err(EstimationError::InvalidConfiguration(format!(
                    "initial_r has {} entries but the dataset has {} features",
                    r.len(),
                    p
                )));
            }
            if r.iter().any(|v| !(v.is_finite() && *v >= 0.0)) {
                return Err(EstimationError::InvalidConfiguration(
                    "initial_r must contain only finite, nonnegative values".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn starting_point(&self, p: usize) -> (Array1<f64>, Array1<f64>) {
        let w = match &self.initial_w {
            Some(values) => Array1::from_vec(values.clone()),
            None => Array1::zeros(p),
        };
        let r = match &self.initial_r {
            Some(values) => Array1::from_vec(values.clone()),
            None => Array1::ones(p),
        };
        (w, r)
    }
}

/// How the outer iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Both the relative step and the violation fell below the tolerance.
    Converged,
    /// The iteration budget ran out first. The returned iterate is the last
    /// one computed and may be far from bilevel-optimal.
    MaxIterationsExhausted,
}

/// One row of the per-iteration trace.
#[derive(Debug, Clone)]
pub struct IterationRecord {
    /// 1-based outer iteration index.
    pub iteration: usize,
    /// Lower-level optimal training loss f_L at the iterate's bounds.
    pub train_loss: f64,
    /// Surrogate objective value at the new iterate.
    pub objective: f64,
    /// Relative iterate change.
    pub step: f64,
    /// Realized feasibility violation at the new iterate.
    pub violation: f64,
    /// Penalty weight α used during this iteration (before escalation).
    pub alpha: f64,
}

/// Final fit: the selected iterate plus the run's diagnostic trace.
#[derive(Debug, Clone)]
pub struct SelectionFit {
    /// Selected regression weights.
    pub weights: Array1<f64>,
    /// Selected per-coordinate bounds (the decoupled hyperparameter).
    pub bounds: Array1<f64>,
    /// Tagged outcome of the iteration.
    pub termination: Termination,
    /// Outer iterations actually performed.
    pub iterations: usize,
    /// Per-iteration trace, one record per performed iteration.
    pub history: Vec<IterationRecord>,
}

/// Residual sum of squares `‖Xw − y‖²`, the error metric used on every
/// partition.
pub fn residual_sum_of_squares(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    w: ArrayView1<f64>,
) -> f64 {
    let residual = x.dot(&w) - &y;
    residual.mapv(|e| e * e).sum()
}

/// Relative iterate-change metric of the outer loop.
fn relative_step(
    w: &Array1<f64>,
    r: &Array1<f64>,
    w_next: &Array1<f64>,
    r_next: &Array1<f64>,
) -> f64 {
    let movement = (w - w_next).mapv(|d| d * d).sum() + (r - r_next).mapv(|d| d * d).sum();
    let scale = 1.0 + w.mapv(|v| v * v).sum() + r.mapv(|v| v * v).sum();
    (movement / scale).sqrt()
}

/// The main entry point: builds both models over the dataset split and
/// drives the outer iteration to a tagged outcome.
pub fn select_penalties(
    data: &DatasetSplit,
    config: &SelectionConfig,
) -> Result<SelectionFit, EstimationError> {
    let mut lower = TrainingLossModel::new(
        data.x_train.view(),
        data.y_train.view(),
        config.solver.clone(),
    )?;
    let mut upper = SurrogateModel::new(data, config.proximal_weight, config.solver.clone())?;
    solve_bilevel(&mut lower, &mut upper, config)
}

/// Drives the outer DC iteration over caller-supplied model collaborators.
///
/// The iterate `(w, r)` and the penalty weight α live here exclusively; the
/// models only ever see them through parameter injection.
pub fn solve_bilevel(
    lower: &mut TrainingLossModel<'_>,
    upper: &mut SurrogateModel<'_>,
    config: &SelectionConfig,
) -> Result<SelectionFit, EstimationError> {
    let p = lower.num_features();
    if upper.num_features() != p {
        return Err(EstimationError::InvalidConfiguration(format!(
            "lower-level model has {} features but the surrogate has {}",
            p,
            upper.num_features()
        )));
    }
    config.validate(p)?;

    let (mut w, mut r) = config.starting_point(p);
    let mut alpha = config.initial_alpha;
    let mut history: Vec<IterationRecord> = Vec::with_capacity(config.max_iterations);

    log::info!(
        "Starting bound selection: {} features, budget {} iterations, tolerance {:.3e}.",
        p,
        config.max_iterations,
        config.tolerance
    );

    for iteration in 1..=config.max_iterations {
        let train_loss = lower.solve(r.view())?;
        let duals = lower.dual_values()?.clone();

        upper.set_previous_iterate(w.view(), r.view())?;
        upper.set_value_snapshot(train_loss, duals.view())?;
        upper.set_penalty_weight(alpha)?;
        let step = upper.solve()?;
        let violation = upper.violation()?;

        let movement = relative_step(&w, &r, &step.weights, &step.bounds);
        log::info!(
            "iter {:>3}: train loss {:.6e}, surrogate objective {:.6e}, step {:.3e}, violation {:.3e}, alpha {:.1}",
            iteration,
            train_loss,
            step.objective,
            movement,
            violation,
            alpha
        );
        history.push(IterationRecord {
            iteration,
            train_loss,
            objective: step.objective,
            step: movement,
            violation,
            alpha,
        });

        if movement < config.tolerance && violation < config.tolerance {
            log::info!("Converged after {iteration} iterations.");
            return Ok(SelectionFit {
                weights: step.weights,
                bounds: step.bounds,
                termination: Termination::Converged,
                iterations: iteration,
                history,
            });
        }

        // Adaptive escalation, evaluated with the current alpha: grow the
        // penalty whenever relative progress is small compared to the
        // capped, scaled violation.
        if movement * alpha <= config.alpha_escalation * f64::min(1.0, alpha * violation) {
            alpha += config.alpha_increment;
        }

        w = step.weights;
        r = step.bounds;
    }

    log::warn!(
        "Iteration budget of {} exhausted before convergence.",
        config.max_iterations
    );
    Ok(SelectionFit {
        weights: w,
        bounds: r,
        termination: Termination::MaxIterationsExhausted,
        iterations: config.max_iterations,
        history,
    })
}
