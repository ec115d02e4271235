//! Calibration parameters estimated by the solver.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::config::CalibConfig;
use crate::error::CalibError;
use crate::format::DataFormat;
use crate::math::{iso3_from_parts, Iso3, Quat, Real, Vec3};
use crate::models::PinholeIntrinsics;

/// Rigid transform from a sensor frame to the body frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extrinsic {
    pub so3: Quat,
    pub pos: Vec3,
}

impl Default for Extrinsic {
    fn default() -> Self {
        Self {
            so3: Quat::identity(),
            pos: Vec3::zeros(),
        }
    }
}

impl Extrinsic {
    pub fn to_iso3(&self) -> Iso3 {
        iso3_from_parts(self.so3, self.pos)
    }

    pub fn from_iso3(iso: &Iso3) -> Self {
        Self {
            so3: iso.rotation,
            pos: iso.translation.vector,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ImuIntrinsics {
    pub gyro_bias: Vec3,
    pub acce_bias: Vec3,
}

/// Every estimated quantity except the trajectory itself.
///
/// Maps are keyed by topic. The reference IMU keeps the identity extrinsic
/// and a zero time offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibParamManager {
    /// Gravity in the world frame, m/s^2.
    pub gravity: Vec3,
    pub extri: BTreeMap<String, Extrinsic>,
    /// Time offsets: `t_body = t_sensor + offset`.
    pub temporal: BTreeMap<String, Real>,
    pub imu_intri: BTreeMap<String, ImuIntrinsics>,
    pub camera_intri: BTreeMap<String, PinholeIntrinsics>,
}

impl CalibParamManager {
    /// Initial parameters for every configured topic.
    pub fn from_config(config: &CalibConfig) -> Result<Self, CalibError> {
        let mut params = Self {
            gravity: Vec3::new(0.0, 0.0, -config.prior.gravity_norm),
            extri: BTreeMap::new(),
            temporal: BTreeMap::new(),
            imu_intri: BTreeMap::new(),
            camera_intri: BTreeMap::new(),
        };
        for topic in config.all_topics() {
            params.extri.insert(topic.clone(), Extrinsic::default());
            params.temporal.insert(topic, 0.0);
        }
        for topic in config.data_stream.imu_topics.keys() {
            params.imu_intri.insert(topic.clone(), ImuIntrinsics::default());
        }
        for topic in config.data_stream.camera_topics.keys() {
            let intri = config.prior.camera_intrinsics.get(topic).ok_or_else(|| {
                CalibError::InvalidConfig(format!("camera topic '{topic}' has no initial intrinsics"))
            })?;
            params.camera_intri.insert(topic.clone(), intri.clone());
        }
        Ok(params)
    }

    pub fn extrinsic(&self, topic: &str) -> Result<&Extrinsic> {
        self.extri
            .get(topic)
            .ok_or_else(|| anyhow!("no extrinsic for topic '{topic}'"))
    }

    pub fn time_offset(&self, topic: &str) -> Result<Real> {
        self.temporal
            .get(topic)
            .copied()
            .ok_or_else(|| anyhow!("no time offset for topic '{topic}'"))
    }

    pub fn imu_intrinsics(&self, topic: &str) -> Result<&ImuIntrinsics> {
        self.imu_intri
            .get(topic)
            .ok_or_else(|| anyhow!("no IMU intrinsics for topic '{topic}'"))
    }

    pub fn camera_intrinsics(&self, topic: &str) -> Result<&PinholeIntrinsics> {
        self.camera_intri
            .get(topic)
            .ok_or_else(|| anyhow!("no camera intrinsics for topic '{topic}'"))
    }

    pub fn save(&self, path: &Path, format: DataFormat) -> Result<()> {
        format.save(self, path)
    }

    pub fn load(path: &Path, format: DataFormat) -> Result<Self> {
        format.load(path)
    }

    /// Log a readable summary of the current values.
    pub fn log_status(&self) {
        info!("gravity: [{:+.6}, {:+.6}, {:+.6}]", self.gravity.x, self.gravity.y, self.gravity.z);
        for (topic, ext) in &self.extri {
            let euler = ext.so3.euler_angles();
            info!(
                "'{topic}': rpy [{:+.3}, {:+.3}, {:+.3}] deg, pos [{:+.4}, {:+.4}, {:+.4}] m, offset {:+.6} s",
                euler.0.to_degrees(),
                euler.1.to_degrees(),
                euler.2.to_degrees(),
                ext.pos.x,
                ext.pos.y,
                ext.pos.z,
                self.temporal.get(topic).copied().unwrap_or(0.0),
            );
        }
        for (topic, intri) in &self.imu_intri {
            info!(
                "'{topic}': gyro bias {:?}, acce bias {:?}",
                intri.gyro_bias.as_slice(),
                intri.acce_bias.as_slice()
            );
        }
        for (topic, cam) in &self.camera_intri {
            info!(
                "'{topic}': fx {:.3} fy {:.3} cx {:.3} cy {:.3}",
                cam.fx, cam.fy, cam.cx, cam.cy
            );
        }
    }
}
