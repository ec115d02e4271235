//! Scale spline: cumulative cubic B-spline on R^3.

use nalgebra::{RealField, Vector3};
use serde::{Deserialize, Serialize};

use super::{cumulative_blend, KnotGrid, SPLINE_ORDER};
use crate::math::{Real, Vec3};

/// Value (`deriv == 0`) or time derivative of one segment at `s`.
pub fn eval_segment_generic<T: RealField>(
    knots: [&Vector3<T>; SPLINE_ORDER],
    s: T,
    dt: T,
    deriv: usize,
) -> Vector3<T> {
    let lambda = cumulative_blend(s, deriv);
    let mut out = if deriv == 0 {
        knots[0].clone()
    } else {
        Vector3::zeros()
    };
    for j in 1..SPLINE_ORDER {
        out += (knots[j] - knots[j - 1]) * lambda[j].clone();
    }
    if deriv > 0 {
        out /= dt.powi(deriv as i32);
    }
    out
}

pub fn eval_segment(knots: [&Vec3; SPLINE_ORDER], s: Real, dt: Real, deriv: usize) -> Vec3 {
    eval_segment_generic(knots, s, dt, deriv)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RdSpline {
    grid: KnotGrid,
    knots: Vec<Vec3>,
}

impl RdSpline {
    /// Spline over `[start, end]` with zero knots.
    pub fn new(start: Real, end: Real, dt: Real) -> Self {
        let grid = KnotGrid::covering(start, end, dt);
        Self {
            knots: vec![Vec3::zeros(); grid.knot_count],
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

    pub fn knots(&self) -> &[Vec3] {
        &self.knots
    }

    pub fn knots_mut(&mut self) -> &mut [Vec3] {
        &mut self.knots
    }

    pub fn evaluate(&self, t: Real) -> Option<Vec3> {
        self.evaluate_derivative(t, 0)
    }

    /// Value or derivative of order 1 or 2 at `t`.
    pub fn evaluate_derivative(&self, t: Real, order: usize) -> Option<Vec3> {
        let (idx, s) = self.segment(t)?;
        let k = &self.knots;
        Some(eval_segment(
            [&k[idx], &k[idx + 1], &k[idx + 2], &k[idx + 3]],
            s,
            self.grid.dt,
            order,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn linear_knots_give_constant_velocity() {
        let mut spline = RdSpline::new(0.0, 3.0, 0.5);
        let v = Vec3::new(1.0, -2.0, 0.5);
        let dt = spline.dt();
        for (i, k) in spline.knots_mut().iter_mut().enumerate() {
            *k = v * ((i as Real - 1.0) * dt);
        }
        for &t in &[0.0, 0.8, 2.2, 3.0] {
            assert_relative_eq!(spline.evaluate(t).unwrap(), v * t, epsilon = 1e-12);
            assert_relative_eq!(
                spline.evaluate_derivative(t, 1).unwrap(),
                v,
                epsilon = 1e-12
            );
            assert_relative_eq!(
                spline.evaluate_derivative(t, 2).unwrap(),
                Vec3::zeros(),
                epsilon = 1e-10
            );
        }
    }

    #[test]
    fn second_derivative_matches_finite_difference() {
        let mut spline = RdSpline::new(0.0, 2.0, 0.25);
        for (i, k) in spline.knots_mut().iter_mut().enumerate() {
            let f = i as Real;
            *k = Vec3::new(f.sin(), (0.5 * f).cos(), 0.1 * f * f);
        }
        let (t, h) = (1.1, 1e-4);
        let fd = (spline.evaluate(t + h).unwrap() - 2.0 * spline.evaluate(t).unwrap()
            + spline.evaluate(t - h).unwrap())
            / (h * h);
        assert_relative_eq!(spline.evaluate_derivative(t, 2).unwrap(), fd, epsilon = 1e-4);
    }

    #[test]
    fn out_of_range_is_none() {
        let spline = RdSpline::new(0.5, 1.5, 0.1);
        assert!(spline.evaluate(0.49).is_none());
        assert!(spline.evaluate_derivative(spline.max_time() + 1e-6, 1).is_none());
    }
}
