//! Radar Doppler residual.
//!
//! A static target seen along the unit direction `d` (radar frame) has the
//! radial velocity `-d . (R_WR^T * v_R)`, where `v_R` is the world velocity
//! of the radar origin: `v_W + R_WB * (w_B x p)`.

use ctcalib_core::{real, ScaleSplineType, Vec3};
use nalgebra::RealField;

use super::{body_time, const_vec3, quat, rotational, translational, vec3};
use crate::ir::SegmentTime;

/// Parameters: \[so3 x4, scale x4, so3_radar_to_body, pos_radar_in_body,
/// time_offset\]
///
/// An acceleration scale spline carries no velocity; the residual is zero.
#[allow(clippy::too_many_arguments)]
pub fn doppler_residual(
    params: &[&[f64]],
    t: f64,
    dir: [f64; 3],
    radial_vel: f64,
    so3_seg: SegmentTime,
    scale_seg: SegmentTime,
    scale_type: ScaleSplineType,
    w: f64,
) -> f64 {
    doppler_residual_generic(params, t, dir, radial_vel, so3_seg, scale_seg, scale_type, w)
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn doppler_residual_generic<T: RealField>(
    params: &[&[T]],
    t: f64,
    dir: [f64; 3],
    radial_vel: f64,
    so3_seg: SegmentTime,
    scale_seg: SegmentTime,
    scale_type: ScaleSplineType,
    w: f64,
) -> T {
    debug_assert!(params.len() == 11, "radar factor expects 11 params");
    let q_br = quat(params[8]);
    let p_br = vec3(params[9]);

    let t_body = body_time(t, params[10]);
    let rot = rotational(params, so3_seg, t_body.clone(), false);
    let lin = translational(params, scale_seg, t_body, scale_type);
    let Some(v_w) = lin.vel else {
        return T::zero();
    };

    let v_radar_w = v_w + &rot.rot * rot.omega.cross(&p_br);
    let v_radar_r = (rot.rot * q_br).inverse() * v_radar_w;
    let los: [f64; 3] = Vec3::from(dir).normalize().into();
    let pred = -const_vec3::<T>(&los).dot(&v_radar_r);
    (pred - real::<T>(radial_vel)) * real::<T>(w.sqrt())
}
