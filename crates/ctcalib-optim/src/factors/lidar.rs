//! LiDAR point-to-plane residual.
//!
//! A point `p_L` measured at time `t` lies on the world plane `(n, d)`:
//! `n . (T_WB(t + to) * T_BL * p_L) + d = 0`.

use ctcalib_core::real;
use nalgebra::RealField;

use super::{const_vec3, sensor_to_world};
use crate::ir::SegmentTime;

/// Parameters: \[so3 x4, scale x4, so3_lidar_to_body, pos_lidar_in_body,
/// time_offset\]
///
/// Needs a position scale spline; the residual is zero otherwise.
pub fn point_to_plane_residual(
    params: &[&[f64]],
    t: f64,
    point: [f64; 3],
    plane: [f64; 4],
    so3_seg: SegmentTime,
    scale_seg: SegmentTime,
    w: f64,
) -> f64 {
    point_to_plane_residual_generic(params, t, point, plane, so3_seg, scale_seg, w)
}

pub(crate) fn point_to_plane_residual_generic<T: RealField>(
    params: &[&[T]],
    t: f64,
    point: [f64; 3],
    plane: [f64; 4],
    so3_seg: SegmentTime,
    scale_seg: SegmentTime,
    w: f64,
) -> T {
    debug_assert!(params.len() == 11, "lidar factor expects 11 params");
    let Some((q_wl, p_wl)) = sensor_to_world(params, t, so3_seg, scale_seg) else {
        return T::zero();
    };
    let p_w = q_wl * const_vec3::<T>(&point) + p_wl;
    let normal = const_vec3::<T>(&[plane[0], plane[1], plane[2]]);
    (normal.dot(&p_w) + real::<T>(plane[3])) * real::<T>(w.sqrt())
}
