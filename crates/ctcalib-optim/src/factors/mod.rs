//! Residual factors over spline segments.
//!
//! Every factor is a pure function of parameter slices laid out as described
//! on [`FactorKind`]. The first four slices are always the orientation knots
//! of the segment; factors that need translational motion take the four
//! scale knots next. Residuals are scaled by `sqrt(w)`.
//!
//! All factors are generic over [`nalgebra::RealField`]: the `f64`
//! instantiation evaluates costs, the `num_dual` instantiation yields the
//! Jacobians of the sparse backend. Body kinematics come from the shared
//! segment evaluators of [`ctcalib_core::spline`], so the factors and the
//! splines agree exactly.
//!
//! ## Key Guidelines
//!
//! - Use `.clone()` on `T: RealField` values (dual numbers are not `Copy`)
//! - Convert constants with [`ctcalib_core::real`]
//! - Measurements stay `f64`; only parameters are generic
//!
//! # Available Factors
//!
//! - [`inertial`] - gyroscope and accelerometer readings
//! - [`radar`] - Doppler velocity of static targets
//! - [`visual`] - SfM camera poses and landmark reprojection
//! - [`lidar`] - point-to-plane distance against a surfel map

pub mod inertial;
pub mod lidar;
pub mod radar;
pub mod visual;

use ctcalib_core::spline::{rd, so3};
use ctcalib_core::{quat_from_slice_generic, real, ScaleSplineType};
use nalgebra::{DVector, RealField, UnitQuaternion, Vector3};

use crate::ir::{FactorKind, SegmentTime};

/// Evaluate the unweighted-by-loss residual of `factor`.
pub fn evaluate_factor<T: RealField>(factor: &FactorKind, params: &[&[T]]) -> DVector<T> {
    match *factor {
        FactorKind::ImuGyro {
            t,
            gyro,
            so3_seg,
            w,
        } => DVector::from_column_slice(
            inertial::gyro_residual_generic(params, t, gyro, so3_seg, w).as_slice(),
        ),
        FactorKind::ImuAcce {
            t,
            acce,
            so3_seg,
            scale_seg,
            scale_type,
            w,
        } => DVector::from_column_slice(
            inertial::acce_residual_generic(params, t, acce, so3_seg, scale_seg, scale_type, w)
                .as_slice(),
        ),
        FactorKind::RadarDoppler {
            t,
            dir,
            radial_vel,
            so3_seg,
            scale_seg,
            scale_type,
            w,
        } => DVector::from_element(
            1,
            radar::doppler_residual_generic(
                params, t, dir, radial_vel, so3_seg, scale_seg, scale_type, w,
            ),
        ),
        FactorKind::CameraPose {
            t,
            so3_cam_to_world,
            pos_cam_in_world,
            so3_seg,
            scale_seg,
            w_rot,
            w_pos,
        } => DVector::from_column_slice(
            visual::camera_pose_residual_generic(
                params,
                t,
                so3_cam_to_world,
                pos_cam_in_world,
                so3_seg,
                scale_seg,
                w_rot,
                w_pos,
            )
            .as_slice(),
        ),
        FactorKind::Reprojection {
            t,
            uv,
            intrinsics,
            so3_seg,
            scale_seg,
            w,
        } => DVector::from_column_slice(
            visual::reprojection_residual_generic(params, t, uv, intrinsics, so3_seg, scale_seg, w)
                .as_slice(),
        ),
        FactorKind::LidarPointToPlane {
            t,
            point,
            plane,
            so3_seg,
            scale_seg,
            w,
        } => DVector::from_element(
            1,
            lidar::point_to_plane_residual_generic(params, t, point, plane, so3_seg, scale_seg, w),
        ),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared kinematics
// ─────────────────────────────────────────────────────────────────────────────

#[inline]
pub(crate) fn vec3<T: RealField>(p: &[T]) -> Vector3<T> {
    debug_assert!(p.len() >= 3, "expected a 3D block");
    Vector3::new(p[0].clone(), p[1].clone(), p[2].clone())
}

#[inline]
pub(crate) fn const_vec3<T: RealField>(p: &[f64; 3]) -> Vector3<T> {
    Vector3::new(real(p[0]), real(p[1]), real(p[2]))
}

#[inline]
pub(crate) fn quat<T: RealField>(p: &[T]) -> UnitQuaternion<T> {
    quat_from_slice_generic(p)
}

/// Sensor time shifted by the offset block: `t + to`.
#[inline]
pub(crate) fn body_time<T: RealField>(t: f64, offset: &[T]) -> T {
    real::<T>(t) + offset[0].clone()
}

/// Orientation and body derivatives over the knots in `params[0..4]`.
pub(crate) fn rotational<T: RealField>(
    params: &[&[T]],
    seg: SegmentTime,
    t: T,
    with_alpha: bool,
) -> so3::SegmentRotation<T> {
    let knots = [
        quat(params[0]),
        quat(params[1]),
        quat(params[2]),
        quat(params[3]),
    ];
    let refs = [&knots[0], &knots[1], &knots[2], &knots[3]];
    so3::eval_segment_generic(refs, seg.normalized(t), real(seg.dt), with_alpha)
}

/// World-frame translational state available from a scale spline.
pub(crate) struct Translational<T: RealField> {
    pub pos: Option<Vector3<T>>,
    pub vel: Option<Vector3<T>>,
    pub acc: Vector3<T>,
}

/// `params[4..8]` hold the scale knots.
pub(crate) fn translational<T: RealField>(
    params: &[&[T]],
    seg: SegmentTime,
    t: T,
    scale_type: ScaleSplineType,
) -> Translational<T> {
    let knots = [
        vec3(params[4]),
        vec3(params[5]),
        vec3(params[6]),
        vec3(params[7]),
    ];
    let refs = [&knots[0], &knots[1], &knots[2], &knots[3]];
    let s = seg.normalized(t);
    let eval = |deriv| rd::eval_segment_generic(refs, s.clone(), real(seg.dt), deriv);
    match scale_type {
        ScaleSplineType::LinPos => Translational {
            pos: Some(eval(0)),
            vel: Some(eval(1)),
            acc: eval(2),
        },
        ScaleSplineType::LinVel => Translational {
            pos: None,
            vel: Some(eval(0)),
            acc: eval(1),
        },
        ScaleSplineType::LinAcce => Translational {
            pos: None,
            vel: None,
            acc: eval(0),
        },
    }
}

/// Sensor-to-world pose `T_WB(t + to) * T_BS` from a position spline.
///
/// Parameters `[8]`, `[9]`, `[10]` are the sensor rotation, position and time
/// offset; `None` without a position spline.
pub(crate) fn sensor_to_world<T: RealField>(
    params: &[&[T]],
    t: f64,
    so3_seg: SegmentTime,
    scale_seg: SegmentTime,
) -> Option<(UnitQuaternion<T>, Vector3<T>)> {
    let q_bs = quat(params[8]);
    let p_bs = vec3(params[9]);
    let t_body = body_time(t, params[10]);

    let rot = rotational(params, so3_seg, t_body.clone(), false).rot;
    let pos = translational(params, scale_seg, t_body, ScaleSplineType::LinPos).pos?;
    let p_ws = pos + &rot * p_bs;
    Some((rot * q_bs, p_ws))
}

#[cfg(test)]
pub(crate) mod test_support {
    use ctcalib_core::synthetic::SyntheticMotion;
    use ctcalib_core::{quat_to_array, SplineBundle};

    use crate::ir::SegmentTime;

    /// Knot slices of the segments containing `t`, in factor order
    /// (four orientation knots, then four scale knots).
    pub fn segment_slices(bundle: &SplineBundle, t: f64) -> (Vec<Vec<f64>>, SegmentTime, SegmentTime) {
        let (i, _) = bundle.so3.segment(t).expect("so3 segment");
        let (j, _) = bundle.scale.segment(t).expect("scale segment");
        let mut out = Vec::new();
        for k in &bundle.so3.knots()[i..i + 4] {
            out.push(quat_to_array(k).to_vec());
        }
        for k in &bundle.scale.knots()[j..j + 4] {
            out.push(k.as_slice().to_vec());
        }
        let so3_seg = SegmentTime {
            t0: bundle.so3.grid().segment_start(i),
            dt: bundle.so3.dt(),
        };
        let scale_seg = SegmentTime {
            t0: bundle.scale.grid().segment_start(j),
            dt: bundle.scale.dt(),
        };
        (out, so3_seg, scale_seg)
    }

    pub fn motion() -> SyntheticMotion {
        SyntheticMotion::new(0.0, 4.0, 0.2)
    }

    pub fn as_refs(v: &[Vec<f64>]) -> Vec<&[f64]> {
        v.iter().map(|x| x.as_slice()).collect()
    }
}
