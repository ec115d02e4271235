//! Solver backends for the IR.
//!
//! The only backend is [`SparseLmBackend`], a sparse Levenberg-Marquardt
//! solver with `num-dual` Jacobians and a sparse LDL^T linear solve. It reports every iteration to registered
//! [`IterationCallback`]s on the solving thread.

mod sparse_lm;

use anyhow::Result;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ir::ProblemIR;

pub use sparse_lm::SparseLmBackend;

/// Backend-agnostic solver options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSolveOptions {
    /// Maximum number of iterations for the optimizer.
    pub max_iters: usize,
    /// Initial damping factor.
    pub initial_lambda: f64,
    /// Relative cost decrease of an accepted step below which the solve stops.
    pub min_rel_decrease: Option<f64>,
    /// Cost threshold for early termination.
    pub min_error: Option<f64>,
    /// Gradient norm threshold for early termination.
    pub gradient_tolerance: f64,
    /// Step norm threshold for early termination.
    pub step_tolerance: f64,
}

impl Default for BackendSolveOptions {
    fn default() -> Self {
        Self {
            max_iters: 100,
            initial_lambda: 1e-4,
            min_rel_decrease: Some(1e-6),
            min_error: Some(1e-12),
            gradient_tolerance: 1e-10,
            step_tolerance: 1e-10,
        }
    }
}

/// Report of one solver iteration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IterationSummary {
    pub iteration: usize,
    /// Cost after the iteration (unchanged when the step was rejected).
    pub cost: f64,
    pub gradient_norm: f64,
    /// Inverse of the damping factor.
    pub trust_region_radius: f64,
    pub step_norm: f64,
    pub step_accepted: bool,
}

/// Read-only view of the parameter values during a solve.
pub struct ParamSnapshot<'a> {
    ir: &'a ProblemIR,
    values: &'a [DVector<f64>],
}

impl<'a> ParamSnapshot<'a> {
    pub(crate) fn new(ir: &'a ProblemIR, values: &'a [DVector<f64>]) -> Self {
        Self { ir, values }
    }

    pub fn get(&self, name: &str) -> Option<&'a DVector<f64>> {
        self.ir.param_by_name(name).map(|id| &self.values[id.0])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a DVector<f64>)> + '_ {
        self.ir
            .params
            .iter()
            .map(|p| (p.name.as_str(), &self.values[p.id.0]))
    }

    pub fn to_map(&self) -> HashMap<String, DVector<f64>> {
        self.iter().map(|(n, v)| (n.to_string(), v.clone())).collect()
    }
}

/// Observer called after every iteration; it cannot alter the solve.
pub trait IterationCallback {
    fn on_iteration(&mut self, summary: &IterationSummary, params: &ParamSnapshot<'_>);
}

impl<F> IterationCallback for F
where
    F: FnMut(&IterationSummary, &ParamSnapshot<'_>),
{
    fn on_iteration(&mut self, summary: &IterationSummary, params: &ParamSnapshot<'_>) {
        self(summary, params)
    }
}

/// Solver output from a backend.
///
/// The `params` map uses the IR parameter block names.
#[derive(Debug, Clone)]
pub struct BackendSolution {
    /// Optimized parameter vectors keyed by block name.
    pub params: HashMap<String, DVector<f64>>,
    /// Robustified cost at the initial values.
    pub initial_cost: f64,
    /// Robustified cost at the returned values.
    pub final_cost: f64,
    /// Number of iterations run.
    pub iterations: usize,
}

/// Backend interface implemented by solvers.
pub trait OptimBackend {
    /// Solve the IR from the provided initial parameters.
    fn solve(
        &self,
        ir: &ProblemIR,
        initial: &HashMap<String, DVector<f64>>,
        opts: &BackendSolveOptions,
        callbacks: &mut [&mut dyn IterationCallback],
    ) -> Result<BackendSolution>;
}
