use std::fmt;

use log::info;
use serde::{Deserialize, Serialize};

use super::{RdSpline, So3Spline};
use crate::error::CalibError;
use crate::math::{iso3_from_parts, Iso3, Quat, Real, Vec3};

/// What the scale spline represents in the world frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleSplineType {
    /// Position; needs a sensor observing absolute motion (LiDAR, camera).
    LinPos,
    /// Linear velocity; observable with radar Doppler.
    LinVel,
    /// Linear acceleration; inertial-only setups.
    LinAcce,
}

impl ScaleSplineType {
    /// Most informative representation the integrated sensors can observe.
    pub fn from_integration(lidar: bool, camera: bool, radar: bool) -> Self {
        if lidar || camera {
            ScaleSplineType::LinPos
        } else if radar {
            ScaleSplineType::LinVel
        } else {
            ScaleSplineType::LinAcce
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScaleSplineType::LinPos => "LIN_POS_SPLINE",
            ScaleSplineType::LinVel => "LIN_VEL_SPLINE",
            ScaleSplineType::LinAcce => "LIN_ACCE_SPLINE",
        }
    }
}

impl fmt::Display for ScaleSplineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orientation and scale splines over one time axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplineBundle {
    pub so3: So3Spline,
    pub scale: RdSpline,
    pub scale_type: ScaleSplineType,
}

impl SplineBundle {
    pub fn new(
        start: Real,
        end: Real,
        so3_dt: Real,
        scale_dt: Real,
        scale_type: ScaleSplineType,
    ) -> Self {
        let bundle = Self {
            so3: So3Spline::new(start, end, so3_dt),
            scale: RdSpline::new(start, end, scale_dt),
            scale_type,
        };
        info!(
            "spline bundle over [{start:.3}, {end:.3}] s: so3 dt {so3_dt:.3} s ({} knots), \
             scale dt {scale_dt:.3} s ({} knots), scale type '{scale_type}'",
            bundle.so3.knots().len(),
            bundle.scale.knots().len(),
        );
        bundle
    }

    pub fn time_in_range(&self, t: Real) -> bool {
        self.so3.time_in_range(t) && self.scale.time_in_range(t)
    }

    pub fn ensure_position(&self, query: &'static str) -> Result<(), CalibError> {
        if self.scale_type == ScaleSplineType::LinPos {
            Ok(())
        } else {
            Err(CalibError::ScaleSplineNotPosition {
                query,
                scale_type: self.scale_type.to_string(),
            })
        }
    }

    /// Body-to-world pose at `t`; `None` outside the common valid interval.
    ///
    /// Only meaningful for a position scale spline, see [`Self::ensure_position`].
    pub fn body_to_world(&self, t: Real) -> Option<Iso3> {
        let rot = self.so3.evaluate(t)?;
        let pos = self.scale.evaluate(t)?;
        Some(iso3_from_parts(rot, pos))
    }

    /// Re-express the trajectory in another world frame given the rotation
    /// from the current world into the new one.
    pub fn rotate_world(&mut self, cur_to_new: &Quat) {
        for q in self.so3.knots_mut() {
            *q = cur_to_new * *q;
        }
        for k in self.scale.knots_mut() {
            *k = cur_to_new * *k;
        }
    }

    /// Translation knot values, mainly for snapshots.
    pub fn scale_knots(&self) -> &[Vec3] {
        self.scale.knots()
    }
}
