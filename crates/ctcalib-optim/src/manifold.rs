//! Local parametrizations used by the sparse backend.
//!
//! - Euclidean: `x + delta`
//! - SO3: right perturbation `q * Exp(delta)` on `[qx, qy, qz, qw]`
//! - S2: rotation of `x` about two axes orthogonal to it, which keeps `|x|`

use ctcalib_core::{quat_cast, quat_from_slice, real, so3_exp_generic, vec3_cast, Vec3};
use nalgebra::{DVector, RealField, Vector3};

use crate::ir::ManifoldKind;

/// Apply the tangent increment `delta` to the ambient value `x`.
pub fn retract(manifold: ManifoldKind, x: &[f64], delta: &[f64]) -> DVector<f64> {
    retract_generic(manifold, x, delta)
}

/// [`retract`] with the increment in any real scalar.
///
/// The autodiff backend evaluates residuals at `x [+] delta` with dual
/// `delta` around zero, so the Jacobian columns are tangent-space columns.
pub fn retract_generic<T: RealField>(manifold: ManifoldKind, x: &[f64], delta: &[T]) -> DVector<T> {
    match manifold {
        ManifoldKind::Euclidean => {
            debug_assert_eq!(x.len(), delta.len());
            DVector::from_iterator(
                x.len(),
                x.iter().zip(delta).map(|(a, b)| real::<T>(*a) + b.clone()),
            )
        }
        ManifoldKind::SO3 => {
            let d = Vector3::new(delta[0].clone(), delta[1].clone(), delta[2].clone());
            let q = quat_cast::<T>(&quat_from_slice(x)) * so3_exp_generic(&d);
            DVector::from_vec(vec![q.i.clone(), q.j.clone(), q.k.clone(), q.w.clone()])
        }
        ManifoldKind::S2 => {
            let v = Vec3::new(x[0], x[1], x[2]);
            let (b1, b2) = s2_tangent_basis(&v);
            let axis = vec3_cast::<T>(&b1) * delta[0].clone() + vec3_cast::<T>(&b2) * delta[1].clone();
            let rotated = so3_exp_generic(&axis) * vec3_cast::<T>(&v);
            DVector::from_column_slice(rotated.as_slice())
        }
    }
}

/// Two unit vectors spanning the plane orthogonal to `v`.
pub fn s2_tangent_basis(v: &Vec3) -> (Vec3, Vec3) {
    let n = v.try_normalize(1e-12).unwrap_or_else(Vec3::z);
    let helper = if n.x.abs() < 0.9 { Vec3::x() } else { Vec3::y() };
    let b1 = n.cross(&helper).normalize();
    let b2 = n.cross(&b1);
    (b1, b2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ctcalib_core::{quat_to_array, so3_exp};

    #[test]
    fn so3_retraction_is_right_perturbation() {
        let q = so3_exp(&Vec3::new(0.3, 0.1, -0.2));
        let out = retract(ManifoldKind::SO3, &quat_to_array(&q), &[0.0, 0.0, 0.1]);
        let expected = q * so3_exp(&Vec3::new(0.0, 0.0, 0.1));
        assert!(quat_from_slice(out.as_slice()).angle_to(&expected) < 1e-12);
    }

    #[test]
    fn s2_retraction_preserves_norm() {
        let g = [0.3, -0.2, -9.7];
        let out = retract(ManifoldKind::S2, &g, &[0.05, -0.02]);
        let norm_in = Vec3::new(g[0], g[1], g[2]).norm();
        assert_relative_eq!(out.norm(), norm_in, epsilon = 1e-12);
        assert!((out[2] - g[2]).abs() > 0.0);
    }

    #[test]
    fn s2_basis_is_orthonormal() {
        for v in [Vec3::x(), Vec3::new(0.0, 0.0, -9.8), Vec3::new(1.0, 2.0, 3.0)] {
            let (b1, b2) = s2_tangent_basis(&v);
            assert_relative_eq!(b1.dot(&v), 0.0, epsilon = 1e-12);
            assert_relative_eq!(b2.dot(&v), 0.0, epsilon = 1e-12);
            assert_relative_eq!(b1.dot(&b2), 0.0, epsilon = 1e-12);
            assert_relative_eq!(b2.norm(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn euclidean_retraction_adds() {
        let out = retract(ManifoldKind::Euclidean, &[1.0, 2.0], &[0.5, -1.0]);
        assert_eq!(out.as_slice(), &[1.5, 1.0]);
    }
}
