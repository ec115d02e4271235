//! Deterministic synthetic motion for tests.
//!
//! A [`SyntheticMotion`] is a smooth ground-truth [`SplineBundle`] with a
//! position scale spline. Measurements are generated from it with the same
//! sensor models the residual factors use, so estimators can be checked
//! against exact values:
//! - gyroscope: `R_BI^T * w_B`
//! - accelerometer: `R_BI^T * (R_WB^T * (a_W - g_W) + alpha_B x p + w_B x (w_B x p))`
//! - radar Doppler: `-d . (R_WR^T * v_R)` for static targets
//!
//! Noise uses splitmix64 keyed by explicit seeds, so datasets do not depend
//! on the internal algorithm of any RNG.

use crate::frames::{ImuFrame, RadarTarget, RadarTargetArray};
use crate::math::{so3_exp, Iso3, Quat, Real, Vec3};
use crate::params::Extrinsic;
use crate::spline::{ScaleSplineType, SplineBundle};

/// Deterministic uniform noise in `[-max_abs, +max_abs]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UniformNoise {
    pub seed: u64,
    pub max_abs: Real,
}

impl UniformNoise {
    pub fn none() -> Self {
        Self {
            seed: 0,
            max_abs: 0.0,
        }
    }

    /// Noise sample for the key `(stream, index)`.
    pub fn sample(&self, stream: usize, index: usize) -> Real {
        if self.max_abs == 0.0 {
            return 0.0;
        }
        let key = self.seed
            ^ (stream as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (index as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        (unit_f64(splitmix64(key)) - 0.5) * 2.0 * self.max_abs.abs()
    }

    pub fn sample_vec3(&self, stream: usize, index: usize) -> Vec3 {
        Vec3::new(
            self.sample(stream * 3, index),
            self.sample(stream * 3 + 1, index),
            self.sample(stream * 3 + 2, index),
        )
    }
}

#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[inline]
fn unit_f64(x: u64) -> Real {
    (x >> 11) as Real * (1.0 / (1u64 << 53) as Real)
}

/// Smooth ground-truth trajectory with gravity.
#[derive(Debug, Clone)]
pub struct SyntheticMotion {
    pub bundle: SplineBundle,
    pub gravity: Vec3,
}

impl SyntheticMotion {
    /// Trajectory valid on `[start, end]` with 0.1 s knots; `phase` varies
    /// the motion between datasets.
    pub fn new(start: Real, end: Real, phase: Real) -> Self {
        let dt = 0.1;
        let mut bundle = SplineBundle::new(start, end, dt, dt, ScaleSplineType::LinPos);
        for (i, q) in bundle.so3.knots_mut().iter_mut().enumerate() {
            let t = start + (i as Real - 1.0) * dt + phase;
            *q = so3_exp(&Vec3::new(
                0.5 * (0.9 * t).sin(),
                0.4 * (0.7 * t + 1.0).sin(),
                0.8 * (0.35 * t).sin(),
            ));
        }
        for (i, p) in bundle.scale.knots_mut().iter_mut().enumerate() {
            let t = start + (i as Real - 1.0) * dt + phase;
            *p = Vec3::new(
                2.0 * (0.4 * t).sin(),
                1.5 * ((0.3 * t).cos() - 1.0),
                0.3 * (0.8 * t).sin(),
            );
        }
        Self {
            bundle,
            gravity: Vec3::new(0.0, 0.0, -9.8),
        }
    }

    pub fn min_time(&self) -> Real {
        self.bundle.so3.min_time()
    }

    pub fn max_time(&self) -> Real {
        self.bundle.so3.max_time().min(self.bundle.scale.max_time())
    }

    pub fn body_to_world(&self, t: Real) -> Option<Iso3> {
        self.bundle.body_to_world(t)
    }

    pub fn world_velocity(&self, t: Real) -> Option<Vec3> {
        self.bundle.scale.evaluate_derivative(t, 1)
    }

    /// Error-free IMU reading of a sensor mounted at `ext`, at body time `t`.
    pub fn imu_reading(&self, t: Real, ext: &Extrinsic) -> Option<(Vec3, Vec3)> {
        let so3 = &self.bundle.so3;
        let r_wb = so3.evaluate(t)?;
        let w = so3.angular_velocity_body(t)?;
        let alpha = so3.angular_acceleration_body(t)?;
        let a_w = self.bundle.scale.evaluate_derivative(t, 2)?;

        let r_bi_inv = ext.so3.inverse();
        let gyro = r_bi_inv * w;
        let specific = r_wb.inverse() * (a_w - self.gravity)
            + alpha.cross(&ext.pos)
            + w.cross(&w.cross(&ext.pos));
        Some((gyro, r_bi_inv * specific))
    }

    /// IMU stream at `rate` Hz over the sensor clock `[t0, t1]`.
    ///
    /// `time_offset` maps sensor time to body time; samples whose body time
    /// leaves the trajectory are skipped.
    pub fn imu_frames(
        &self,
        t0: Real,
        t1: Real,
        rate: Real,
        ext: &Extrinsic,
        time_offset: Real,
        noise: UniformNoise,
    ) -> Vec<ImuFrame> {
        let n = ((t1 - t0) * rate).floor() as usize + 1;
        (0..n)
            .filter_map(|i| {
                let t_sensor = t0 + i as Real / rate;
                let (gyro, acce) = self.imu_reading(t_sensor + time_offset, ext)?;
                Some(ImuFrame::new(
                    t_sensor,
                    gyro + noise.sample_vec3(0, i),
                    acce + noise.sample_vec3(1, i),
                ))
            })
            .collect()
    }

    /// Doppler readings of static world points seen by a radar mounted at
    /// `ext`, at sensor time `t_sensor`.
    pub fn radar_frame(
        &self,
        t_sensor: Real,
        ext: &Extrinsic,
        time_offset: Real,
        world_points: &[Vec3],
    ) -> Option<RadarTargetArray> {
        let t = t_sensor + time_offset;
        let pose_wb = self.body_to_world(t)?;
        let w = self.bundle.so3.angular_velocity_body(t)?;
        let v_w = self.world_velocity(t)?;

        let pose_wr = pose_wb * ext.to_iso3();
        let r_wr = pose_wr.rotation;
        // velocity of the radar origin, world frame
        let v_radar_w = v_w + pose_wb.rotation * w.cross(&ext.pos);
        let v_radar_r = r_wr.inverse() * v_radar_w;

        let targets = world_points
            .iter()
            .map(|p_w| {
                let p_r = pose_wr.inverse_transform_point(&(*p_w).into()).coords;
                let dir = p_r.normalize();
                RadarTarget::from_position(t_sensor, &p_r, -dir.dot(&v_radar_r))
            })
            .collect();
        Some(RadarTargetArray {
            timestamp: t_sensor,
            targets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn noise_is_deterministic_and_bounded() {
        let noise = UniformNoise {
            seed: 7,
            max_abs: 0.5,
        };
        for i in 0..100 {
            let a = noise.sample(1, i);
            assert_eq!(a, noise.sample(1, i));
            assert!(a.abs() <= 0.5);
        }
        assert_ne!(noise.sample(1, 3), noise.sample(2, 3));
        assert_eq!(UniformNoise::none().sample(4, 4), 0.0);
    }

    #[test]
    fn static_reading_measures_gravity() {
        let mut motion = SyntheticMotion::new(0.0, 2.0, 0.0);
        for q in motion.bundle.so3.knots_mut() {
            *q = Quat::identity();
        }
        for p in motion.bundle.scale.knots_mut() {
            *p = Vec3::zeros();
        }
        let (gyro, acce) = motion.imu_reading(1.0, &Extrinsic::default()).unwrap();
        assert_relative_eq!(gyro, Vec3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(acce, Vec3::new(0.0, 0.0, 9.8), epsilon = 1e-9);
    }

    #[test]
    fn imu_stream_respects_validity() {
        let motion = SyntheticMotion::new(0.0, 5.0, 0.3);
        let frames = motion.imu_frames(
            0.0,
            5.0,
            100.0,
            &Extrinsic::default(),
            0.0,
            UniformNoise::none(),
        );
        assert!((500..=501).contains(&frames.len()));
        let late = motion.imu_frames(0.0, 5.0, 100.0, &Extrinsic::default(), 1.0, UniformNoise::none());
        assert!(late.len() < frames.len());
    }
}
