//! Linear algebra aliases and SO(3) helpers shared by the whole workspace.

use nalgebra::{
    Isometry3, Matrix3, Point2, Point3, Quaternion, RealField, Rotation3, Translation3,
    UnitQuaternion, Vector2, Vector3,
};

pub type Real = f64;

pub type Vec2 = Vector2<Real>;
pub type Vec3 = Vector3<Real>;
pub type Pt2 = Point2<Real>;
pub type Pt3 = Point3<Real>;
pub type Mat3 = Matrix3<Real>;
pub type Iso3 = Isometry3<Real>;
pub type Quat = UnitQuaternion<Real>;

/// Exponential map of so(3): rotation vector to unit quaternion.
#[inline]
pub fn so3_exp(v: &Vec3) -> Quat {
    Quat::from_scaled_axis(*v)
}

/// Logarithm map of SO(3): unit quaternion to rotation vector.
#[inline]
pub fn so3_log(q: &Quat) -> Vec3 {
    q.scaled_axis()
}

/// Constant of a generic scalar.
#[inline]
pub fn real<T: RealField>(x: f64) -> T {
    nalgebra::convert(x)
}

/// [`so3_exp`] for any real scalar, including dual numbers.
///
/// Near zero the series expansion is used so derivatives stay finite at the
/// identity.
pub fn so3_exp_generic<T: RealField>(v: &Vector3<T>) -> UnitQuaternion<T> {
    let theta2 = v.norm_squared();
    let (w, k) = if theta2 < real(1e-10) {
        (
            T::one() - theta2.clone() * real(0.125),
            real::<T>(0.5) - theta2 * real(1.0 / 48.0),
        )
    } else {
        let theta = theta2.sqrt();
        let half = theta.clone() * real(0.5);
        (half.clone().cos(), half.sin() / theta)
    };
    UnitQuaternion::new_unchecked(Quaternion::from_parts(w, v * k))
}

/// [`so3_log`] for any real scalar; the result has an angle in `[0, pi]`.
pub fn so3_log_generic<T: RealField>(q: &UnitQuaternion<T>) -> Vector3<T> {
    let q = q.quaternion();
    let (w, xyz) = if q.w < T::zero() {
        (-q.w.clone(), -q.imag())
    } else {
        (q.w.clone(), q.imag())
    };
    let s2 = xyz.norm_squared();
    let k = if s2 < real(1e-10) {
        // 2 atan(s / w) / s to second order in s
        let w2 = w.clone() * w.clone();
        real::<T>(2.0) / w * (T::one() - s2 / (w2 * real(3.0)))
    } else {
        let s = s2.sqrt();
        real::<T>(2.0) * s.clone().atan2(w) / s
    };
    xyz * k
}

/// Skew-symmetric matrix `[v]x` such that `[v]x * w == v.cross(&w)`.
pub fn skew(v: &Vec3) -> Mat3 {
    Mat3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Storage layout used by parameter blocks: `[x, y, z, w]`.
#[inline]
pub fn quat_to_array(q: &Quat) -> [Real; 4] {
    [q.i, q.j, q.k, q.w]
}

/// Inverse of [`quat_to_array`]; the input is re-normalized.
#[inline]
pub fn quat_from_slice(v: &[Real]) -> Quat {
    Quat::from_quaternion(Quaternion::new(v[3], v[0], v[1], v[2]))
}

/// [`quat_from_slice`] for any real scalar.
#[inline]
pub fn quat_from_slice_generic<T: RealField>(v: &[T]) -> UnitQuaternion<T> {
    UnitQuaternion::from_quaternion(Quaternion::new(
        v[3].clone(),
        v[0].clone(),
        v[1].clone(),
        v[2].clone(),
    ))
}

/// Lift an `f64` rotation into any real scalar.
pub fn quat_cast<T: RealField>(q: &Quat) -> UnitQuaternion<T> {
    UnitQuaternion::new_unchecked(Quaternion::new(real(q.w), real(q.i), real(q.j), real(q.k)))
}

/// Lift an `f64` vector into any real scalar.
#[inline]
pub fn vec3_cast<T: RealField>(v: &Vec3) -> Vector3<T> {
    Vector3::new(real(v.x), real(v.y), real(v.z))
}

pub fn iso3_from_parts(rot: Quat, trans: Vec3) -> Iso3 {
    Iso3::from_parts(Translation3::from(trans), rot)
}

/// Angle of the relative rotation between `a` and `b`, in radians.
pub fn rotation_angle_between(a: &Quat, b: &Quat) -> Real {
    a.angle_to(b)
}

/// Rotation that brings the reference (first body) frame into a gravity
/// aligned world frame.
///
/// The returned rotation maps vectors expressed in the reference frame into
/// the aligned world frame:
/// - world `-z` is parallel to `gravity_ref`;
/// - world `x` is the projection of the first body `x` axis onto the
///   horizontal plane (the body `y` axis is used when `x` is vertical).
///
/// A zero gravity vector yields the identity.
pub fn gravity_aligned_ref_to_world(so3_b0_to_ref: &Quat, gravity_ref: &Vec3) -> Quat {
    let g_norm = gravity_ref.norm();
    if g_norm < 1e-9 {
        return Quat::identity();
    }
    let z_w = -gravity_ref / g_norm;

    let horizontal = |axis: Vec3| {
        let v = so3_b0_to_ref * axis;
        v - z_w * z_w.dot(&v)
    };
    let mut x_w = horizontal(Vec3::x());
    if x_w.norm() < 1e-6 {
        x_w = horizontal(Vec3::y());
    }
    let x_w = x_w.normalize();
    let y_w = z_w.cross(&x_w);

    // columns are the world axes expressed in the reference frame
    let w_to_ref = Mat3::from_columns(&[x_w, y_w, z_w]);
    let w_to_ref = Quat::from_rotation_matrix(&Rotation3::from_matrix_unchecked(w_to_ref));
    w_to_ref.inverse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn exp_log_are_inverse() {
        let v = Vec3::new(0.1, -0.4, 0.25);
        assert_relative_eq!(so3_log(&so3_exp(&v)), v, epsilon = 1e-12);
    }

    #[test]
    fn generic_exp_log_match_nalgebra() {
        for v in [
            Vec3::new(0.1, -0.4, 0.25),
            Vec3::new(1e-7, 2e-7, -1e-7),
            Vec3::zeros(),
            Vec3::new(0.0, 3.0, 0.0),
        ] {
            let q = so3_exp_generic(&v);
            assert!(q.angle_to(&so3_exp(&v)) < 1e-12, "exp of {v:?}");
            assert_relative_eq!(so3_log_generic(&q), so3_log(&q), epsilon = 1e-12);
        }
        // a quaternion with negative w maps to the short rotation
        let q = so3_exp(&Vec3::new(0.0, 0.0, 0.5));
        let flipped = Quat::new_unchecked(-q.into_inner());
        assert_relative_eq!(so3_log_generic(&flipped), Vec3::new(0.0, 0.0, 0.5), epsilon = 1e-12);
    }

    #[test]
    fn quat_array_layout_is_xyzw() {
        let q = so3_exp(&Vec3::new(0.3, 0.2, -0.1));
        let arr = quat_to_array(&q);
        assert_relative_eq!(arr[3], q.w, epsilon = 1e-15);
        let back = quat_from_slice(&arr);
        assert!(back.angle_to(&q) < 1e-12);
    }

    #[test]
    fn gravity_alignment_points_z_up() {
        let b0 = so3_exp(&Vec3::new(0.2, -0.3, 0.7));
        let g_ref = so3_exp(&Vec3::new(0.4, 0.1, 0.0)) * Vec3::new(0.0, 0.0, -9.8);
        let ref_to_w = gravity_aligned_ref_to_world(&b0, &g_ref);
        let g_w = ref_to_w * g_ref;
        assert_relative_eq!(g_w, Vec3::new(0.0, 0.0, -g_ref.norm()), epsilon = 1e-9);

        // heading: the rotated body x axis has no y component in the world
        let x_w = ref_to_w * (b0 * Vec3::x());
        assert!(x_w.y.abs() < 1e-9, "heading not preserved: {x_w:?}");
        assert!(x_w.x > 0.0);
    }

    #[test]
    fn gravity_alignment_is_idempotent() {
        let b0 = so3_exp(&Vec3::new(0.2, -0.3, 0.7));
        let g_ref = Vec3::new(1.0, -2.0, -9.0);
        let first = gravity_aligned_ref_to_world(&b0, &g_ref);
        let second = gravity_aligned_ref_to_world(&(first * b0), &(first * g_ref));
        assert!(second.angle() < 1e-9, "second pass rotated by {}", second.angle());
    }

    #[test]
    fn gravity_alignment_degenerate_heading_uses_y() {
        // body x axis parallel to gravity
        let b0 = so3_exp(&Vec3::new(0.0, std::f64::consts::FRAC_PI_2, 0.0));
        let g_ref = Vec3::new(0.0, 0.0, -9.8);
        let ref_to_w = gravity_aligned_ref_to_world(&b0, &g_ref);
        assert_relative_eq!(ref_to_w * g_ref, g_ref, epsilon = 1e-9);
    }
}
