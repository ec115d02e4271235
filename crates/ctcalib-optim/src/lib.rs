//! Optimization layer of the continuous-time calibrator.
//!
//! Calibration problems are first described as a backend-agnostic
//! [`ProblemIR`]: named parameter blocks (spline knots, extrinsics, time
//! offsets, biases, gravity, landmarks) on their manifolds, and residual
//! blocks tagged with a [`FactorKind`]. A backend then minimizes the IR and
//! returns the optimized blocks by name.
//!
//! ```no_run
//! use ctcalib_optim::{BackendSolveOptions, OptimBackend, ProblemIR, SparseLmBackend};
//! # use std::collections::HashMap;
//! # fn demo(ir: ProblemIR, init: HashMap<String, nalgebra::DVector<f64>>) -> anyhow::Result<()> {
//! let mut on_iter = |s: &ctcalib_optim::IterationSummary, _: &ctcalib_optim::ParamSnapshot<'_>| {
//!     println!("iter {} cost {}", s.iteration, s.cost);
//! };
//! let sol = SparseLmBackend::new(0).solve(&ir, &init, &BackendSolveOptions::default(), &mut [&mut on_iter])?;
//! println!("final cost {}", sol.final_cost);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod factors;
pub mod ir;
pub mod manifold;
mod robust;

pub use backend::{
    BackendSolution, BackendSolveOptions, IterationCallback, IterationSummary, OptimBackend,
    ParamSnapshot, SparseLmBackend,
};
pub use factors::evaluate_factor;
pub use ir::{
    Bound, FactorKind, FixedMask, ManifoldKind, ParamBlock, ParamId, ProblemIR, ResidualBlock,
    RobustLoss, SegmentTime,
};
