//! Uniform cumulative cubic B-splines on SO(3) and R^3.
//!
//! Both splines share the knot/time bookkeeping of [`KnotGrid`]:
//! a spline over `[start, end]` with spacing `dt` owns
//! `ceil((end - start) / dt) + 3` knots and is valid on
//! `[start, start + (n - 3) * dt]`. Evaluation strictly outside that interval
//! returns `None`; nothing is extrapolated.
//!
//! The segment evaluators [`so3::eval_segment_generic`] and
//! [`rd::eval_segment_generic`] take the four knots of one segment explicitly
//! and are generic over the scalar, so residual factors can run them on
//! dual numbers and evaluate exactly like the splines.

mod bundle;
pub mod rd;
pub mod so3;

pub use bundle::*;
pub use rd::RdSpline;
pub use so3::So3Spline;

use serde::{Deserialize, Serialize};

use nalgebra::RealField;

use crate::math::{real, Real};

/// Number of control knots influencing one segment.
pub const SPLINE_ORDER: usize = 4;

/// Cumulative blending coefficients of a cubic uniform B-spline.
///
/// `deriv` selects the derivative with respect to the normalized segment
/// time `s`; divide by `dt^deriv` for time derivatives. Entry `j` weighs the
/// difference between knot `j` and knot `j - 1` (entry 0 is the base knot).
/// Generic over the scalar so residual factors can differentiate through it.
pub fn cumulative_blend<T: RealField>(s: T, deriv: usize) -> [T; SPLINE_ORDER] {
    let s2 = s.clone() * s.clone();
    let p: [T; 4] = match deriv {
        0 => [T::one(), s.clone(), s2.clone(), s2 * s],
        1 => [T::zero(), T::one(), s * real(2.0), s2 * real(3.0)],
        2 => [T::zero(), T::zero(), real(2.0), s * real(6.0)],
        3 => [T::zero(), T::zero(), T::zero(), real(6.0)],
        _ => [T::zero(), T::zero(), T::zero(), T::zero()],
    };
    const M: [[Real; 4]; 4] = [
        [6.0, 0.0, 0.0, 0.0],
        [5.0, 3.0, -3.0, 1.0],
        [1.0, 3.0, 3.0, -2.0],
        [0.0, 0.0, 0.0, 1.0],
    ];
    std::array::from_fn(|j| {
        M[j].iter()
            .zip(p.iter())
            .fold(T::zero(), |acc, (m, q)| acc + q.clone() * real(*m))
            / real(6.0)
    })
}

/// Knot timing shared by both spline kinds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KnotGrid {
    pub start_time: Real,
    pub dt: Real,
    pub knot_count: usize,
}

impl KnotGrid {
    /// Grid covering `[start, end]`; at least one segment is created.
    pub fn covering(start: Real, end: Real, dt: Real) -> Self {
        let segments = if end > start {
            ((end - start) / dt).ceil().max(1.0) as usize
        } else {
            1
        };
        Self {
            start_time: start,
            dt,
            knot_count: segments + SPLINE_ORDER - 1,
        }
    }

    pub fn min_time(&self) -> Real {
        self.start_time
    }

    pub fn max_time(&self) -> Real {
        self.start_time + (self.knot_count.saturating_sub(SPLINE_ORDER - 1)) as Real * self.dt
    }

    pub fn time_in_range(&self, t: Real) -> bool {
        self.knot_count >= SPLINE_ORDER && t >= self.min_time() && t <= self.max_time()
    }

    /// Index of the first knot of the segment containing `t` and the
    /// normalized time `s` in `[0, 1]` inside that segment.
    pub fn segment(&self, t: Real) -> Option<(usize, Real)> {
        if !self.time_in_range(t) {
            return None;
        }
        let u = (t - self.start_time) / self.dt;
        let last = self.knot_count - SPLINE_ORDER;
        let idx = (u.floor().max(0.0) as usize).min(last);
        Some((idx, u - idx as Real))
    }

    /// Start time of segment `idx`.
    pub fn segment_start(&self, idx: usize) -> Real {
        self.start_time + idx as Real * self.dt
    }
}
