//! Sparse Levenberg-Marquardt on `sprs` matrices.
//!
//! - residual blocks are linearized in parallel on a `rayon` pool; each block
//!   is differentiated with `num-dual` over the tangent spaces of all its
//!   slots, then the columns of fixed parameters are dropped;
//! - the Jacobian is assembled as CSR, `J^T J` is damped on its diagonal and
//!   factorized with the sparse LDL^T of `sprs_ldl`;
//! - bounds are clamped after every update;
//! - robust losses are applied as IRLS row scaling (weights are never
//!   differentiated).

use anyhow::{anyhow, bail, ensure, Context, Result};
use log::{debug, info};
use nalgebra::{DVector, SVector};
use num_dual::{jacobian, DualSVec64};
use rayon::prelude::*;
use sprs::{CsMat, SymmetryCheck, TriMat};
use sprs_ldl::Ldl;
use std::collections::HashMap;

use super::{
    BackendSolution, BackendSolveOptions, IterationCallback, IterationSummary, OptimBackend,
    ParamSnapshot,
};
use crate::factors::evaluate_factor;
use crate::ir::{ManifoldKind, ParamId, ProblemIR, ResidualBlock};
use crate::manifold::{retract, retract_generic};

/// Local tangent sizes of the factor layouts, one autodiff kernel each.
const GYRO_LOCAL: usize = 19;
const SENSOR_LOCAL: usize = 31;
const REPROJECTION_LOCAL: usize = 34;
const ACCE_LOCAL: usize = 36;

/// Sparse LM backend running on a dedicated worker pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct SparseLmBackend {
    /// Worker threads; 0 lets rayon pick one per core.
    pub num_threads: usize,
}

impl SparseLmBackend {
    pub fn new(num_threads: usize) -> Self {
        Self { num_threads }
    }
}

/// Columns owned by one parameter block in the Jacobian.
#[derive(Debug, Clone)]
enum BlockColumns {
    Fixed,
    /// Free ambient indices of a Euclidean block.
    Euclidean { offset: usize, free: Vec<usize> },
    /// Whole tangent space of a manifold block.
    Tangent { offset: usize, dim: usize },
}

impl BlockColumns {
    fn count(&self) -> usize {
        match self {
            BlockColumns::Fixed => 0,
            BlockColumns::Euclidean { free, .. } => free.len(),
            BlockColumns::Tangent { dim, .. } => *dim,
        }
    }
}

fn layout_columns(ir: &ProblemIR) -> (Vec<BlockColumns>, usize) {
    let mut offset = 0;
    let columns = ir
        .params
        .iter()
        .map(|p| {
            let cols = if p.fixed.is_all_fixed(p.dim) {
                BlockColumns::Fixed
            } else {
                match p.manifold {
                    ManifoldKind::Euclidean => {
                        let mut free: Vec<usize> =
                            (0..p.dim).filter(|i| !p.fixed.is_fixed(*i)).collect();
                        free.sort_unstable();
                        BlockColumns::Euclidean { offset, free }
                    }
                    other => BlockColumns::Tangent {
                        offset,
                        dim: other.tangent_dim(p.dim),
                    },
                }
            };
            offset += cols.count();
            cols
        })
        .collect();
    (columns, offset)
}

/// Robust-scaled residual and Jacobian entries of one block.
struct Linearization {
    residual: DVector<f64>,
    entries: Vec<(usize, usize, f64)>,
    rho: f64,
}

struct Problem<'a> {
    ir: &'a ProblemIR,
    columns: Vec<BlockColumns>,
    ncols: usize,
    row_offsets: Vec<usize>,
    nrows: usize,
}

impl<'a> Problem<'a> {
    fn new(ir: &'a ProblemIR) -> Self {
        let (columns, ncols) = layout_columns(ir);
        let mut row_offsets = Vec::with_capacity(ir.residuals.len());
        let mut nrows = 0;
        for r in &ir.residuals {
            row_offsets.push(nrows);
            nrows += r.residual_dim;
        }
        Self {
            ir,
            columns,
            ncols,
            row_offsets,
            nrows,
        }
    }

    fn raw_residual(block: &ResidualBlock, values: &[DVector<f64>]) -> DVector<f64> {
        let slices: Vec<&[f64]> = block.params.iter().map(|id| values[id.0].as_slice()).collect();
        evaluate_factor(&block.factor, &slices)
    }

    fn linearize_block(&self, idx: usize, values: &[DVector<f64>]) -> Result<Linearization> {
        let factor = &self.ir.residuals[idx].factor;
        match factor.local_dim() {
            GYRO_LOCAL => Ok(self.linearize_ad::<GYRO_LOCAL>(idx, values)),
            SENSOR_LOCAL => Ok(self.linearize_ad::<SENSOR_LOCAL>(idx, values)),
            REPROJECTION_LOCAL => Ok(self.linearize_ad::<REPROJECTION_LOCAL>(idx, values)),
            ACCE_LOCAL => Ok(self.linearize_ad::<ACCE_LOCAL>(idx, values)),
            other => bail!(
                "no autodiff kernel for the {other}-dimensional {} factor",
                factor.name()
            ),
        }
    }

    /// Residual and tangent-space Jacobian of one block, `N` being the sum
    /// of the tangent dimensions of its slots.
    fn linearize_ad<const N: usize>(&self, idx: usize, values: &[DVector<f64>]) -> Linearization {
        let block = &self.ir.residuals[idx];
        let row0 = self.row_offsets[idx];

        let mut slots: Vec<(ParamId, ManifoldKind, usize, usize)> = Vec::with_capacity(block.params.len());
        let mut local = 0;
        for &id in &block.params {
            let p = &self.ir.params[id.0];
            let dim = p.manifold.tangent_dim(p.dim);
            slots.push((id, p.manifold, local, dim));
            local += dim;
        }
        debug_assert_eq!(local, N);

        let (r, j) = jacobian(
            |delta: SVector<DualSVec64<N>, N>| {
                let ambient: Vec<DVector<DualSVec64<N>>> = slots
                    .iter()
                    .map(|&(id, manifold, off, dim)| {
                        retract_generic(manifold, values[id.0].as_slice(), &delta.as_slice()[off..off + dim])
                    })
                    .collect();
                let refs: Vec<&[DualSVec64<N>]> = ambient.iter().map(|v| v.as_slice()).collect();
                evaluate_factor(&block.factor, &refs)
            },
            SVector::<f64, N>::zeros(),
        );

        let (rho, weight) = block.loss.rho_and_weight(r.norm_squared());
        let sw = weight.sqrt();
        let mut entries = Vec::new();
        let mut push_column = |col: usize, local_col: usize| {
            for row in 0..r.len() {
                let d = j[(row, local_col)] * sw;
                if d != 0.0 {
                    entries.push((row0 + row, col, d));
                }
            }
        };
        // a parameter repeated in one block sums its columns in the triplets
        for &(id, _, off, _) in &slots {
            match &self.columns[id.0] {
                BlockColumns::Fixed => {}
                BlockColumns::Euclidean { offset, free } => {
                    for (k, &i) in free.iter().enumerate() {
                        push_column(offset + k, off + i);
                    }
                }
                BlockColumns::Tangent { offset, dim } => {
                    for k in 0..*dim {
                        push_column(offset + k, off + k);
                    }
                }
            }
        }

        Linearization {
            residual: r * sw,
            entries,
            rho,
        }
    }

    fn cost(&self, values: &[DVector<f64>]) -> f64 {
        0.5 * self
            .ir
            .residuals
            .par_iter()
            .map(|block| {
                let r = Self::raw_residual(block, values);
                block.loss.rho_and_weight(r.norm_squared()).0
            })
            .sum::<f64>()
    }

    /// Returns the CSR Jacobian, the stacked residual and the cost.
    fn linearize(&self, values: &[DVector<f64>]) -> Result<(CsMat<f64>, DVector<f64>, f64)> {
        let blocks: Vec<Linearization> = (0..self.ir.residuals.len())
            .into_par_iter()
            .map(|idx| self.linearize_block(idx, values))
            .collect::<Result<_>>()?;

        let mut tri = TriMat::new((self.nrows, self.ncols));
        let mut residual = DVector::zeros(self.nrows);
        let mut cost = 0.0;
        for (idx, lin) in blocks.into_iter().enumerate() {
            let row0 = self.row_offsets[idx];
            residual.rows_mut(row0, lin.residual.len()).copy_from(&lin.residual);
            for (row, col, val) in lin.entries {
                tri.add_triplet(row, col, val);
            }
            cost += lin.rho;
        }
        Ok((tri.to_csr(), residual, 0.5 * cost))
    }

    fn apply_step(&self, values: &[DVector<f64>], step: &DVector<f64>) -> Vec<DVector<f64>> {
        let mut out = values.to_vec();
        for (p, x) in self.ir.params.iter().zip(out.iter_mut()) {
            match &self.columns[p.id.0] {
                BlockColumns::Fixed => {}
                BlockColumns::Euclidean { offset, free } => {
                    for (k, &i) in free.iter().enumerate() {
                        x[i] += step[offset + k];
                    }
                }
                BlockColumns::Tangent { offset, dim } => {
                    let delta = &step.as_slice()[*offset..*offset + *dim];
                    *x = retract(p.manifold, x.as_slice(), delta);
                }
            }
            if let Some(bounds) = &p.bounds {
                for b in bounds {
                    x[b.idx] = x[b.idx].clamp(b.lower, b.upper);
                }
            }
        }
        out
    }
}

/// `J^T r` for a CSR Jacobian.
fn gradient(j: &CsMat<f64>, r: &DVector<f64>) -> DVector<f64> {
    let mut g = DVector::zeros(j.cols());
    for (row, vec) in j.outer_iterator().enumerate() {
        let r_row = r[row];
        for (col, &val) in vec.iter() {
            g[col] += val * r_row;
        }
    }
    g
}

/// Add Levenberg-Marquardt damping to the diagonal of the symmetric `jtj`:
/// `d + lambda * max(d, 1)`. Columns without a diagonal entry get `lambda`.
fn add_damping(jtj: &CsMat<f64>, lambda: f64) -> CsMat<f64> {
    let n = jtj.cols();
    let mut diag = vec![0.0; n];
    let mut tri = TriMat::new((n, n));
    for (outer, vec) in jtj.outer_iterator().enumerate() {
        for (inner, &val) in vec.iter() {
            if inner == outer {
                diag[inner] += val;
            }
            tri.add_triplet(inner, outer, val);
        }
    }
    for (c, d) in diag.iter().enumerate() {
        tri.add_triplet(c, c, lambda * d.max(1.0));
    }
    tri.to_csc()
}

/// Solve `a x = b` for the damped, symmetric positive definite `a`.
fn solve_ldl(a: &CsMat<f64>, b: &DVector<f64>) -> Result<DVector<f64>> {
    let ldl = Ldl::new()
        .check_symmetry(SymmetryCheck::DontCheckSymmetry)
        .numeric(a.view())
        .map_err(|e| anyhow!("LDL factorization failed: {e:?}"))?;
    let rhs: Vec<f64> = b.iter().copied().collect();
    let x: Vec<f64> = ldl.solve(&rhs);
    Ok(DVector::from_vec(x))
}

impl OptimBackend for SparseLmBackend {
    fn solve(
        &self,
        ir: &ProblemIR,
        initial: &HashMap<String, DVector<f64>>,
        opts: &BackendSolveOptions,
        callbacks: &mut [&mut dyn IterationCallback],
    ) -> Result<BackendSolution> {
        ir.validate()?;

        let mut values = Vec::with_capacity(ir.params.len());
        for param in &ir.params {
            let init = initial.get(&param.name).ok_or_else(|| {
                anyhow!(
                    "initial values missing parameter {} (id {:?})",
                    param.name,
                    param.id
                )
            })?;
            ensure!(
                init.len() == param.dim,
                "initial dimension mismatch for {}: expected {}, got {}",
                param.name,
                param.dim,
                init.len()
            );
            values.push(init.clone());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.num_threads)
            .build()
            .context("building the solver thread pool")?;
        let problem = Problem::new(ir);
        debug!(
            "sparse LM: {} parameter blocks, {} free columns, {} residual rows",
            ir.params.len(),
            problem.ncols,
            problem.nrows
        );

        // Callbacks stay on this thread; only the evaluations run on the pool.
        let linearize = |values: &[DVector<f64>]| pool.install(|| problem.linearize(values));
        let eval_cost = |values: &[DVector<f64>]| pool.install(|| problem.cost(values));

        let (mut jac, mut res, mut cost) = linearize(&values)?;
        let initial_cost = cost;
        let mut lambda = opts.initial_lambda;
        let mut iterations = 0;

        if problem.ncols == 0 || problem.nrows == 0 {
            return Ok(BackendSolution {
                params: ParamSnapshot::new(ir, &values).to_map(),
                initial_cost,
                final_cost: cost,
                iterations,
            });
        }

        for iteration in 0..opts.max_iters {
            if opts.min_error.is_some_and(|e| cost <= e) {
                break;
            }
            let g = gradient(&jac, &res);
            let gradient_norm = g.norm();
            if gradient_norm < opts.gradient_tolerance {
                debug!("sparse LM: gradient norm {gradient_norm:.3e} below tolerance");
                break;
            }

            let jt: CsMat<f64> = jac.clone().transpose_into();
            let jtj: CsMat<f64> = &jt * &jac;
            let damped = add_damping(&jtj, lambda);
            let step = match solve_ldl(&damped, &(-&g)) {
                Ok(step) => step,
                Err(e) => {
                    debug!("sparse LM: {e:#}, raising the damping");
                    lambda *= 10.0;
                    if !lambda.is_finite() || lambda > 1e16 {
                        break;
                    }
                    continue;
                }
            };
            let step_norm = step.norm();

            let candidate = problem.apply_step(&values, &step);
            let new_cost = eval_cost(&candidate);
            let accepted = new_cost.is_finite() && new_cost < cost;
            let rel_decrease = if accepted {
                (cost - new_cost) / cost.max(f64::EPSILON)
            } else {
                0.0
            };

            if accepted {
                values = candidate;
                (jac, res, cost) = linearize(&values)?;
                lambda = (lambda * 0.1).max(1e-12);
            } else {
                lambda *= 10.0;
            }
            iterations = iteration + 1;

            let summary = IterationSummary {
                iteration,
                cost,
                gradient_norm,
                trust_region_radius: 1.0 / lambda,
                step_norm,
                step_accepted: accepted,
            };
            debug!(
                "iter {:>3}: cost {:.6e}, |g| {:.3e}, |dx| {:.3e}, radius {:.3e}, {}",
                iteration,
                cost,
                gradient_norm,
                step_norm,
                summary.trust_region_radius,
                if accepted { "accepted" } else { "rejected" }
            );
            let snapshot = ParamSnapshot::new(ir, &values);
            for cb in callbacks.iter_mut() {
                cb.on_iteration(&summary, &snapshot);
            }

            if step_norm < opts.step_tolerance {
                break;
            }
            if accepted && opts.min_rel_decrease.is_some_and(|m| rel_decrease < m) {
                break;
            }
            if !lambda.is_finite() || lambda > 1e16 {
                debug!("sparse LM: damping diverged ({lambda:.3e})");
                break;
            }
        }

        info!(
            "sparse LM finished after {iterations} iterations: cost {initial_cost:.6e} -> {cost:.6e}"
        );
        Ok(BackendSolution {
            params: ParamSnapshot::new(ir, &values).to_map(),
            initial_cost,
            final_cost: cost,
            iterations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::test_support::{motion, segment_slices};
    use crate::ir::{FactorKind, FixedMask, RobustLoss, SegmentTime};
    use ctcalib_core::{quat_to_array, so3_exp, ScaleSplineType, Vec3};

    fn dense(a: &CsMat<f64>) -> nalgebra::DMatrix<f64> {
        let mut m = nalgebra::DMatrix::zeros(a.rows(), a.cols());
        for (outer, vec) in a.outer_iterator().enumerate() {
            for (inner, &val) in vec.iter() {
                let (r, c) = if a.is_csr() { (outer, inner) } else { (inner, outer) };
                m[(r, c)] += val;
            }
        }
        m
    }

    #[test]
    fn ldl_solves_small_spd_system() {
        let mut tri = TriMat::new((3, 3));
        for (r, c, v) in [
            (0, 0, 4.0),
            (0, 1, 1.0),
            (1, 0, 1.0),
            (1, 1, 3.0),
            (2, 2, 2.0),
        ] {
            tri.add_triplet(r, c, v);
        }
        let a: CsMat<f64> = tri.to_csc();
        let b = DVector::from_vec(vec![1.0, 2.0, 4.0]);
        let x = solve_ldl(&a, &b).unwrap();
        assert!((dense(&a) * x - b).norm() < 1e-12);
    }

    #[test]
    fn damping_adds_missing_diagonal() {
        let mut tri = TriMat::new((2, 2));
        tri.add_triplet(0, 0, 4.0);
        let jtj: CsMat<f64> = tri.to_csc();
        let damped = dense(&add_damping(&jtj, 0.5));
        assert!((damped[(0, 0)] - 6.0).abs() < 1e-12);
        assert!((damped[(1, 1)] - 0.5).abs() < 1e-12);
        assert_eq!(damped[(0, 1)], 0.0);
    }

    #[test]
    fn gradient_is_jt_r() {
        let mut tri = TriMat::new((2, 2));
        tri.add_triplet(0, 0, 1.0);
        tri.add_triplet(0, 1, 2.0);
        tri.add_triplet(1, 1, 3.0);
        let j: CsMat<f64> = tri.to_csr();
        let g = gradient(&j, &DVector::from_vec(vec![1.0, -1.0]));
        assert_eq!(g.as_slice(), &[1.0, -1.0]);
    }

    /// One accelerometer block with every slot free except one bias axis.
    fn acce_problem() -> (ProblemIR, Vec<DVector<f64>>) {
        let motion = motion();
        let t = 1.37;
        let (slices, so3_seg, scale_seg) = segment_slices(&motion.bundle, t);
        let mut ir = ProblemIR::new();
        let mut values: Vec<DVector<f64>> = Vec::new();
        let mut ids = Vec::new();
        for (i, knot) in slices.iter().enumerate() {
            let manifold = if i < 4 { ManifoldKind::SO3 } else { ManifoldKind::Euclidean };
            ids.push(ir.add_param_block(format!("knot_{i}"), knot.len(), manifold, FixedMask::all_free(), None));
            values.push(DVector::from_column_slice(knot));
        }
        let mut add = |name: &str, v: Vec<f64>, manifold, fixed| {
            ids.push(ir.add_param_block(name, v.len(), manifold, fixed, None));
            values.push(DVector::from_vec(v));
        };
        let q_bi = so3_exp(&Vec3::new(0.2, -0.1, 0.3));
        add("so3_imu", quat_to_array(&q_bi).to_vec(), ManifoldKind::SO3, FixedMask::all_free());
        add("pos_imu", vec![0.1, -0.05, 0.02], ManifoldKind::Euclidean, FixedMask::all_free());
        add("time_offset", vec![0.004], ManifoldKind::Euclidean, FixedMask::all_free());
        add("acce_bias", vec![0.01, 0.02, -0.01], ManifoldKind::Euclidean, FixedMask::fix_indices(&[1]));
        add("gravity", vec![0.1, -0.2, -9.8], ManifoldKind::S2, FixedMask::all_free());

        let factor = FactorKind::ImuAcce {
            t,
            acce: [0.3, -0.2, 9.5],
            so3_seg,
            scale_seg,
            scale_type: ScaleSplineType::LinPos,
            w: 2.0,
        };
        assert_eq!(factor.local_dim(), ACCE_LOCAL);
        ir.add_residual_block(ResidualBlock::new(factor, ids, RobustLoss::None));
        (ir, values)
    }

    #[test]
    fn autodiff_jacobian_matches_finite_differences() {
        let (ir, values) = acce_problem();
        let problem = Problem::new(&ir);
        // one bias axis is fixed
        assert_eq!(problem.ncols, ACCE_LOCAL - 1);
        let (jac, _, _) = problem.linearize(&values).unwrap();
        let jac = dense(&jac);

        let h = 1e-6;
        let residual_at = |id: usize, x: DVector<f64>| {
            let mut v = values.clone();
            v[id] = x;
            Problem::raw_residual(&ir.residuals[0], &v)
        };
        for p in &ir.params {
            let x = &values[p.id.0];
            let columns: Vec<(usize, DVector<f64>, DVector<f64>)> = match &problem.columns[p.id.0] {
                BlockColumns::Fixed => Vec::new(),
                BlockColumns::Euclidean { offset, free } => free
                    .iter()
                    .enumerate()
                    .map(|(k, &i)| {
                        let (mut plus, mut minus) = (x.clone(), x.clone());
                        plus[i] += h;
                        minus[i] -= h;
                        (offset + k, plus, minus)
                    })
                    .collect(),
                BlockColumns::Tangent { offset, dim } => (0..*dim)
                    .map(|k| {
                        let mut delta = vec![0.0; *dim];
                        delta[k] = h;
                        let plus = retract(p.manifold, x.as_slice(), &delta);
                        delta[k] = -h;
                        let minus = retract(p.manifold, x.as_slice(), &delta);
                        (offset + k, plus, minus)
                    })
                    .collect(),
            };
            for (col, plus, minus) in columns {
                let fd = (residual_at(p.id.0, plus) - residual_at(p.id.0, minus)) / (2.0 * h);
                let ad = jac.column(col).into_owned();
                assert!(
                    (&fd - &ad).norm() < 1e-5 * fd.norm().max(1.0),
                    "column {col} of {}: ad {ad:?} vs fd {fd:?}",
                    p.name
                );
            }
        }
    }

    #[test]
    fn kernels_cover_every_factor_layout() {
        let seg = SegmentTime { t0: 0.0, dt: 0.1 };
        let dims = [
            FactorKind::ImuGyro { t: 0.0, gyro: [0.0; 3], so3_seg: seg, w: 1.0 }.local_dim(),
            FactorKind::RadarDoppler {
                t: 0.0,
                dir: [1.0, 0.0, 0.0],
                radial_vel: 0.0,
                so3_seg: seg,
                scale_seg: seg,
                scale_type: ScaleSplineType::LinVel,
                w: 1.0,
            }
            .local_dim(),
            FactorKind::Reprojection {
                t: 0.0,
                uv: [0.0; 2],
                intrinsics: [1.0, 1.0, 0.0, 0.0],
                so3_seg: seg,
                scale_seg: seg,
                w: 1.0,
            }
            .local_dim(),
        ];
        assert_eq!(dims, [GYRO_LOCAL, SENSOR_LOCAL, REPROJECTION_LOCAL]);
    }
}
