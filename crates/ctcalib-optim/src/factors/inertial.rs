//! Gyroscope and accelerometer residuals.
//!
//! With `R_BI`/`p` the IMU-to-body extrinsic, `to` the IMU time offset and
//! body time `t + to`:
//! - gyro: `R_BI^T * w_B + b_g - gyro`
//! - acce: `R_BI^T * (R_WB^T * (a_W - g) + alpha_B x p + w_B x (w_B x p)) + b_a - acce`

use ctcalib_core::{real, ScaleSplineType};
use nalgebra::{RealField, SVector};

use super::{body_time, const_vec3, quat, rotational, translational, vec3};
use crate::ir::SegmentTime;

/// Parameters: \[so3 x4, so3_imu_to_body, time_offset, gyro_bias\]
pub fn gyro_residual(
    params: &[&[f64]],
    t: f64,
    gyro: [f64; 3],
    so3_seg: SegmentTime,
    w: f64,
) -> SVector<f64, 3> {
    gyro_residual_generic(params, t, gyro, so3_seg, w)
}

pub(crate) fn gyro_residual_generic<T: RealField>(
    params: &[&[T]],
    t: f64,
    gyro: [f64; 3],
    so3_seg: SegmentTime,
    w: f64,
) -> SVector<T, 3> {
    debug_assert!(params.len() == 7, "gyro factor expects 7 params");
    let q_bi = quat(params[4]);
    let bias = vec3(params[6]);

    let motion = rotational(params, so3_seg, body_time(t, params[5]), false);
    let pred = q_bi.inverse() * motion.omega + bias;
    (pred - const_vec3(&gyro)) * real::<T>(w.sqrt())
}

/// Parameters: \[so3 x4, scale x4, so3_imu_to_body, pos_imu_in_body,
/// time_offset, acce_bias, gravity\]
#[allow(clippy::too_many_arguments)]
pub fn acce_residual(
    params: &[&[f64]],
    t: f64,
    acce: [f64; 3],
    so3_seg: SegmentTime,
    scale_seg: SegmentTime,
    scale_type: ScaleSplineType,
    w: f64,
) -> SVector<f64, 3> {
    acce_residual_generic(params, t, acce, so3_seg, scale_seg, scale_type, w)
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn acce_residual_generic<T: RealField>(
    params: &[&[T]],
    t: f64,
    acce: [f64; 3],
    so3_seg: SegmentTime,
    scale_seg: SegmentTime,
    scale_type: ScaleSplineType,
    w: f64,
) -> SVector<T, 3> {
    debug_assert!(params.len() == 13, "acce factor expects 13 params");
    let q_bi = quat(params[8]);
    let p_bi = vec3(params[9]);
    let bias = vec3(params[11]);
    let gravity = vec3(params[12]);

    let t_body = body_time(t, params[10]);
    let rot = rotational(params, so3_seg, t_body.clone(), true);
    let lin = translational(params, scale_seg, t_body, scale_type);

    let lever = rot.alpha.cross(&p_bi) + rot.omega.cross(&rot.omega.cross(&p_bi));
    let specific_body = rot.rot.inverse() * (lin.acc - gravity) + lever;
    let pred = q_bi.inverse() * specific_body + bias;
    (pred - const_vec3(&acce)) * real::<T>(w.sqrt())
}
