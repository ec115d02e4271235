//! Camera residuals: SfM camera poses and landmark reprojection.
//!
//! Both need a position scale spline. The camera-to-world pose at the
//! camera time `t` is `T_WB(t + to) * T_BC`.

use ctcalib_core::{quat_from_slice, quat_cast, real, so3_log_generic};
use nalgebra::{RealField, SVector, Vector2, Vector6};

use super::{const_vec3, sensor_to_world, vec3};
use crate::ir::SegmentTime;

/// Parameters: \[so3 x4, scale x4, so3_cam_to_body, pos_cam_in_body,
/// time_offset\]
///
/// Residual `[Log(R_meas^T * R_pred) * sqrt(w_rot), (p_pred - p_meas) * sqrt(w_pos)]`.
#[allow(clippy::too_many_arguments)]
pub fn camera_pose_residual(
    params: &[&[f64]],
    t: f64,
    so3_cam_to_world: [f64; 4],
    pos_cam_in_world: [f64; 3],
    so3_seg: SegmentTime,
    scale_seg: SegmentTime,
    w_rot: f64,
    w_pos: f64,
) -> SVector<f64, 6> {
    camera_pose_residual_generic(
        params,
        t,
        so3_cam_to_world,
        pos_cam_in_world,
        so3_seg,
        scale_seg,
        w_rot,
        w_pos,
    )
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn camera_pose_residual_generic<T: RealField>(
    params: &[&[T]],
    t: f64,
    so3_cam_to_world: [f64; 4],
    pos_cam_in_world: [f64; 3],
    so3_seg: SegmentTime,
    scale_seg: SegmentTime,
    w_rot: f64,
    w_pos: f64,
) -> SVector<T, 6> {
    debug_assert!(params.len() == 11, "camera pose factor expects 11 params");
    let Some((q_wc, p_wc)) = sensor_to_world(params, t, so3_seg, scale_seg) else {
        return Vector6::zeros();
    };
    let q_meas = quat_cast::<T>(&quat_from_slice(&so3_cam_to_world));
    let r_rot = so3_log_generic(&(q_meas.inverse() * q_wc)) * real::<T>(w_rot.sqrt());
    let r_pos = (p_wc - const_vec3(&pos_cam_in_world)) * real::<T>(w_pos.sqrt());
    Vector6::new(
        r_rot.x.clone(),
        r_rot.y.clone(),
        r_rot.z.clone(),
        r_pos.x.clone(),
        r_pos.y.clone(),
        r_pos.z.clone(),
    )
}

/// Parameters: \[so3 x4, scale x4, so3_cam_to_body, pos_cam_in_body,
/// time_offset, landmark\]
///
/// Landmarks behind the camera contribute a zero residual.
pub fn reprojection_residual(
    params: &[&[f64]],
    t: f64,
    uv: [f64; 2],
    intrinsics: [f64; 4],
    so3_seg: SegmentTime,
    scale_seg: SegmentTime,
    w: f64,
) -> SVector<f64, 2> {
    reprojection_residual_generic(params, t, uv, intrinsics, so3_seg, scale_seg, w)
}

pub(crate) fn reprojection_residual_generic<T: RealField>(
    params: &[&[T]],
    t: f64,
    uv: [f64; 2],
    intrinsics: [f64; 4],
    so3_seg: SegmentTime,
    scale_seg: SegmentTime,
    w: f64,
) -> SVector<T, 2> {
    debug_assert!(params.len() == 12, "reprojection factor expects 12 params");
    let Some((q_wc, p_wc)) = sensor_to_world(params, t, so3_seg, scale_seg) else {
        return Vector2::zeros();
    };
    let landmark = vec3(params[11]);
    let p_c = q_wc.inverse() * (landmark - p_wc);
    if p_c.z <= real(1e-6) {
        return Vector2::zeros();
    }
    let [fx, fy, cx, cy] = intrinsics;
    let u = real::<T>(fx) * p_c.x.clone() / p_c.z.clone() + real(cx);
    let v = real::<T>(fy) * p_c.y.clone() / p_c.z.clone() + real(cy);
    let sw = real::<T>(w.sqrt());
    Vector2::new(
        (u - real(uv[0])) * sw.clone(),
        (v - real(uv[1])) * sw,
    )
}
