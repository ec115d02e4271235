//! Orientation spline: cumulative cubic B-spline on SO(3).

use nalgebra::{RealField, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use super::{cumulative_blend, KnotGrid, SPLINE_ORDER};
use crate::math::{so3_exp_generic, so3_log_generic, Quat, Real, Vec3};

/// Rotation and body-frame derivatives of one segment.
#[derive(Debug, Clone)]
pub struct SegmentRotation<T: RealField> {
    pub rot: UnitQuaternion<T>,
    /// Angular velocity in the rotated (body) frame.
    pub omega: Vector3<T>,
    /// Angular acceleration in the body frame; zero unless requested.
    pub alpha: Vector3<T>,
}

/// Evaluate one segment at the normalized time `s`.
///
/// `knots` are the four control rotations of the segment and `dt` the knot
/// spacing. With `R_j = R_{j-1} A_j` and `A_j = Exp(l_j d_j)`:
/// - `w_j = A_j^T w_{j-1} + l'_j d_j`
/// - `a_j = A_j^T a_{j-1} + l''_j d_j + w_j x (l'_j d_j)`
pub fn eval_segment_generic<T: RealField>(
    knots: [&UnitQuaternion<T>; SPLINE_ORDER],
    s: T,
    dt: T,
    with_alpha: bool,
) -> SegmentRotation<T> {
    let lambda = cumulative_blend(s.clone(), 0);
    let lambda_dot = cumulative_blend(s.clone(), 1);
    let lambda_ddot = if with_alpha {
        cumulative_blend(s, 2)
    } else {
        [T::zero(), T::zero(), T::zero(), T::zero()]
    };
    let dt2 = dt.clone() * dt.clone();

    let mut rot = knots[0].clone();
    let mut omega = Vector3::zeros();
    let mut alpha = Vector3::zeros();
    for j in 1..SPLINE_ORDER {
        let delta = so3_log_generic(&(knots[j - 1].inverse() * knots[j]));
        let a = so3_exp_generic(&(&delta * lambda[j].clone()));
        let a_inv = a.inverse();
        rot = rot * a;
        let rate = &delta * (lambda_dot[j].clone() / dt.clone());
        omega = &a_inv * omega + &rate;
        if with_alpha {
            alpha = &a_inv * alpha + &delta * (lambda_ddot[j].clone() / dt2.clone())
                + omega.cross(&rate);
        }
    }
    SegmentRotation { rot, omega, alpha }
}

/// Rotation and body-frame angular velocity of one segment at `s`.
pub fn eval_segment(knots: [&Quat; SPLINE_ORDER], s: Real, dt: Real) -> (Quat, Vec3) {
    let seg = eval_segment_generic(knots, s, dt, false);
    (seg.rot, seg.omega)
}

/// Body angular acceleration of one segment at `s`.
pub fn eval_segment_angular_acceleration(knots: [&Quat; SPLINE_ORDER], s: Real, dt: Real) -> Vec3 {
    eval_segment_generic(knots, s, dt, true).alpha
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct So3Spline {
    grid: KnotGrid,
    knots: Vec<Quat>,
}

impl So3Spline {
    /// Spline over `[start, end]` with identity knots.
    pub fn new(start: Real, end: Real, dt: Real) -> Self {
        let grid = KnotGrid::covering(start, end, dt);
        Self {
            knots: vec![Quat::identity(); grid.knot_count],
            grid,
        }
    }

    pub fn grid(&self) -> &KnotGrid {
        &self.grid
    }

    pub fn dt(&self) -> Real {
        self.grid.dt
    }

    pub fn min_time(&self) -> Real {
        self.grid.min_time()
    }

    pub fn max_time(&self) -> Real {
        self.grid.max_time()
    }

    pub fn time_in_range(&self, t: Real) -> bool {
        self.grid.time_in_range(t)
    }

    pub fn segment(&self, t: Real) -> Option<(usize, Real)> {
        self.grid.segment(t)
    }

    pub fn knots(&self) -> &[Quat] {
        &self.knots
    }

    pub fn knots_mut(&mut self) -> &mut [Quat] {
        &mut self.knots
    }

    fn segment_knots(&self, idx: usize) -> [&Quat; SPLINE_ORDER] {
        [
            &self.knots[idx],
            &self.knots[idx + 1],
            &self.knots[idx + 2],
            &self.knots[idx + 3],
        ]
    }

    pub fn evaluate(&self, t: Real) -> Option<Quat> {
        let (idx, s) = self.segment(t)?;
        Some(eval_segment(self.segment_knots(idx), s, self.grid.dt).0)
    }

    pub fn angular_velocity_body(&self, t: Real) -> Option<Vec3> {
        let (idx, s) = self.segment(t)?;
        Some(eval_segment(self.segment_knots(idx), s, self.grid.dt).1)
    }

    pub fn angular_acceleration_body(&self, t: Real) -> Option<Vec3> {
        let (idx, s) = self.segment(t)?;
        Some(eval_segment_angular_acceleration(
            self.segment_knots(idx),
            s,
            self.grid.dt,
        ))
    }
}
