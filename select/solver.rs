//! # Convex Solver Boundary
//!
//! Thin interface to the Clarabel interior-point conic solver. The rest of
//! the crate describes each optimization model once as a [`ConicProgram`]
//! (quadratic cost, linear inequality rows, second-order cone rows), patches
//! the numeric parameter entries between outer iterations, and re-solves,
//! so the structural description is built exactly once per model.
//!
//! Conventions follow Clarabel: minimize ½xᵀPx + qᵀx subject to
//! Ax + s = b with s in the product cone. `P` holds the upper triangle
//! only; nonnegative-cone rows precede second-order-cone rows.

use clarabel::algebra::CscMatrix;
use clarabel::solver::{
    DefaultSettings, DefaultSolver, IPSolver, SolverStatus, SupportedConeT,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Solution status reported by the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// Optimal solution found.
    Optimal,
    /// Problem is primal infeasible.
    Infeasible,
    /// Problem is dual infeasible (unbounded below).
    Unbounded,
    /// Iteration or time budget exhausted before optimality.
    MaxIterations,
    /// Any other outcome, including numerical breakdown.
    Unknown,
}

impl From<SolverStatus> for SolveStatus {
    fn from(status: SolverStatus) -> Self {
        match status {
            SolverStatus::Solved => SolveStatus::Optimal,
            SolverStatus::PrimalInfeasible => SolveStatus::Infeasible,
            SolverStatus::DualInfeasible => SolveStatus::Unbounded,
            SolverStatus::MaxIterations => SolveStatus::MaxIterations,
            SolverStatus::MaxTime => SolveStatus::MaxIterations,
            _ => SolveStatus::Unknown,
        }
    }
}

/// Errors surfaced by a failed conic solve. Retry policy, if any, is the
/// caller's concern.
#[derive(Error, Debug)]
pub enum SolverError {
    #[error("the convex subproblem is primal infeasible")]
    Infeasible,

    #[error("the convex subproblem is unbounded below (dual infeasible)")]
    Unbounded,

    #[error("the convex solver stopped without an optimality certificate ({status:?})")]
    Numerical { status: SolveStatus },
}

/// Solver settings, forwarded to Clarabel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolverSettings {
    /// Print solver output.
    pub verbose: bool,
    /// Maximum interior-point iterations per solve.
    pub max_iter: u32,
    /// Time limit per solve, in seconds.
    pub time_limit: f64,
    /// Absolute duality-gap tolerance.
    pub tol_gap_abs: f64,
    /// Relative duality-gap tolerance.
    pub tol_gap_rel: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        SolverSettings {
            verbose: false,
            max_iter: 200,
            time_limit: f64::INFINITY,
            tol_gap_abs: 1e-8,
            tol_gap_rel: 1e-8,
        }
    }
}

/// Cone block sizes, in constraint-row order.
#[derive(Debug, Clone, Default)]
pub struct ConeDims {
    /// Number of nonnegative-cone rows (elementwise inequalities).
    pub nonneg: usize,
    /// Second-order cone dimensions, one entry per cone.
    pub soc: Vec<usize>,
}

impl ConeDims {
    /// Total number of constraint rows.
    pub fn total(&self) -> usize {
        self.nonneg + self.soc.iter().sum::<usize>()
    }

    fn to_clarabel(&self) -> Vec<SupportedConeT<f64>> {
        let mut cones = Vec::new();
        if self.nonneg > 0 {
            cones.push(SupportedConeT::NonnegativeConeT(self.nonneg));
        }
        for &dim in &self.soc {
            cones.push(SupportedConeT::SecondOrderConeT(dim));
        }
        cones
    }
}

/// A conic program with a fixed sparsity structure. Parameter entries in
/// `q`, `b`, and `a.nzval` are overwritten in place between solves.
#[derive(Debug)]
pub struct ConicProgram {
    /// Quadratic cost, upper triangle of P in ½xᵀPx.
    pub p: CscMatrix<f64>,
    /// Linear cost.
    pub q: Vec<f64>,
    /// Constraint matrix of Ax + s = b.
    pub a: CscMatrix<f64>,
    /// Constraint right-hand side.
    pub b: Vec<f64>,
    /// Cone block sizes matching the rows of `a`.
    pub cones: ConeDims,
}

/// Primal/dual point returned by a successful solve.
#[derive(Debug, Clone)]
pub struct Solution {
    /// Primal variable values.
    pub x: Vec<f64>,
    /// Dual (multiplier) values, one per constraint row.
    pub z: Vec<f64>,
    /// Interior-point iterations used.
    pub iterations: u32,
    /// Solve time in seconds.
    pub solve_time: f64,
}

/// Solves the program, returning a solution only on an optimality
/// certificate; every other status maps to an error.
pub fn solve(program: &ConicProgram, settings: &SolverSettings) -> Result<Solution, SolverError> {
    debug_assert_eq!(program.a.m, program.cones.total());
    debug_assert_eq!(program.a.n, program.q.len());
    debug_assert_eq!(program.b.len(), program.a.m);

    let mut clarabel_settings = DefaultSettings::default();
    clarabel_settings.verbose = settings.verbose;
    clarabel_settings.max_iter = settings.max_iter;
    clarabel_settings.time_limit = settings.time_limit;
    clarabel_settings.tol_gap_abs = settings.tol_gap_abs;
    clarabel_settings.tol_gap_rel = settings.tol_gap_rel;

    let cones = program.cones.to_clarabel();
    let mut solver = DefaultSolver::new(
        &program.p,
        &program.q,
        &program.a,
        &program.b,
        &cones,
        clarabel_settings,
    );
    solver.solve();

    let status: SolveStatus = solver.solution.status.into();
    match status {
        SolveStatus::Optimal => Ok(Solution {
            x: solver.solution.x.clone(),
            z: solver.solution.z.clone(),
            iterations: solver.info.iterations,
            solve_time: solver.solution.solve_time,
        }),
        SolveStatus::Infeasible => Err(SolverError::Infeasible),
        SolveStatus::Unbounded => Err(SolverError::Unbounded),
        other => Err(SolverError::Numerical { status: other }),
    }
}

/// Builds a CSC matrix from (row, col, value) triplets. Entries are kept
/// even when the value is zero, so parameter slots stay addressable, and
/// duplicate coordinates must not be passed.
pub(crate) fn csc_from_triplets(
    nrows: usize,
    ncols: usize,
    triplets: &[(usize, usize, f64)],
) -> CscMatrix<f64> {
    let mut order: Vec<usize> = (0..triplets.len()).collect();
    order.sort_by_key(|&k| (triplets[k].1, triplets[k].0));

    let mut colptr = vec![0usize; ncols + 1];
    let mut rowval = Vec::with_capacity(triplets.len());
    let mut nzval = Vec::with_capacity(triplets.len());
    for &k in &order {
        let (row, col, value) = triplets[k];
        debug_assert!(row < nrows && col < ncols);
        colptr[col + 1] += 1;
        rowval.push(row);
        nzval.push(value);
    }
    for col in 0..ncols {
        colptr[col + 1] += colptr[col];
    }
    CscMatrix::new(nrows, ncols, colptr, rowval, nzval)
}

/// Position of the stored entry (row, col) inside `nzval`, if present.
pub(crate) fn nz_index(matrix: &CscMatrix<f64>, row: usize, col: usize) -> Option<usize> {
    let start = matrix.colptr[col];
    let end = matrix.colptr[col + 1];
    (start..end).find(|&k| matrix.rowval[k] == row)
}
