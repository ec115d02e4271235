//! Robust loss evaluation for iteratively re-weighted least squares (IRLS).

use crate::ir::RobustLoss;

impl RobustLoss {
    /// Return the robust loss `rho(r^2)` and the IRLS weight `w(r)` for a squared residual.
    ///
    /// The sparse backend uses the classic IRLS procedure:
    /// 1. evaluate residuals `r_i` for the current parameters,
    /// 2. compute weights `w_i` using this method,
    /// 3. scale both residuals and Jacobian rows by `sqrt(w_i)` before solving the linearised system.
    pub fn rho_and_weight(self, r2: f64) -> (f64, f64) {
        match self {
            RobustLoss::None => (r2, 1.0),
            RobustLoss::Huber { scale } => {
                let r = r2.sqrt();
                if r <= scale {
                    (r2, 1.0)
                } else {
                    (2.0 * scale * r - scale * scale, scale / r)
                }
            }
            RobustLoss::Cauchy { scale } => {
                let c2 = scale * scale;
                let t = r2 / c2;
                (c2 * (1.0 + t).ln(), 1.0 / (1.0 + t))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, tol: f64) {
        assert!(
            (a - b).abs() <= tol,
            "values differ: {} vs {} (tol={})",
            a,
            b,
            tol
        );
    }

    #[test]
    fn huber_matches_l2_for_small_residuals() {
        let (rho, w) = RobustLoss::Huber { scale: 1.0 }.rho_and_weight(0.25);
        approx_eq(rho, 0.25, 1e-12);
        approx_eq(w, 1.0, 1e-12);
    }

    #[test]
    fn huber_linear_for_large_residuals() {
        let r = 5.0;
        let (rho, w) = RobustLoss::Huber { scale: 1.0 }.rho_and_weight(r * r);
        approx_eq(rho, 2.0 * r - 1.0, 1e-9);
        approx_eq(w, 1.0 / r, 1e-9);
    }

    #[test]
    fn cauchy_weight_decreases_with_r() {
        let loss = RobustLoss::Cauchy { scale: 1.0 };
        let (_, w_small) = loss.rho_and_weight(0.01);
        let (_, w_large) = loss.rho_and_weight(100.0);
        assert!(w_small > 0.9, "w_small should be close to 1, got {}", w_small);
        assert!(w_large < 0.02, "w_large should be small, got {}", w_large);
    }

    fn irls_constant_fit(y: &[f64], loss: RobustLoss, iters: usize) -> f64 {
        let mut x = y.iter().sum::<f64>() / y.len() as f64;
        for _ in 0..iters {
            let (mut num, mut den) = (0.0, 0.0);
            for &yi in y {
                let r = x - yi;
                let (_, w) = loss.rho_and_weight(r * r);
                num += w * yi;
                den += w;
            }
            if den > 0.0 {
                x = num / den;
            }
        }
        x
    }

    #[test]
    fn cauchy_irls_resists_outliers() {
        let y = [0.9, 1.0, 1.1, 0.95, 1.05, 5.0, -4.0];
        let inlier_mean = y[..5].iter().sum::<f64>() / 5.0;
        let x_none = irls_constant_fit(&y, RobustLoss::None, 10);
        let x_cauchy = irls_constant_fit(&y, RobustLoss::Cauchy { scale: 0.2 }, 20);
        assert!(
            (x_cauchy - inlier_mean).abs() < (x_none - inlier_mean).abs(),
            "Cauchy should pull the estimate towards the inliers: {x_none} vs {x_cauchy}"
        );
    }
}
