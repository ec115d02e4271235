//! Sensor model registry and camera intrinsics.
//!
//! Every supported sensor family is a closed enum whose variants are the
//! vendor models. Configuration files name models by their canonical
//! upper-case strings; [`std::str::FromStr`] resolves them and rejects
//! unknown names with [`CalibError::UnknownSensorModel`].

mod camera;

pub use camera::*;

use std::fmt;
use std::str::FromStr;

use crate::error::CalibError;

/// Sensor family, used in logs and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SensorKind {
    Imu,
    Radar,
    Lidar,
    Camera,
}

impl SensorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SensorKind::Imu => "IMU",
            SensorKind::Radar => "radar",
            SensorKind::Lidar => "LiDAR",
            SensorKind::Camera => "camera",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! sensor_models {
    (
        $(#[$meta:meta])*
        $name:ident ($kind:expr) {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }

            pub fn kind(self) -> SensorKind {
                $kind
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CalibError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::ALL
                    .iter()
                    .copied()
                    .find(|m| m.as_str() == s)
                    .ok_or_else(|| CalibError::UnknownSensorModel {
                        kind: $kind.as_str(),
                        name: s.to_string(),
                    })
            }
        }
    };
}

sensor_models! {
    /// Inertial measurement unit message layouts.
    ImuModel (SensorKind::Imu) {
        /// Standard message, acceleration in m/s^2.
        SensorImu => "SENSOR_IMU",
        /// Standard message, acceleration in units of g.
        SensorImuG => "SENSOR_IMU_G",
        /// Standard message, acceleration in units of -g.
        SensorImuGNeg => "SENSOR_IMU_G_NEG",
        /// SBG systems message with `gyro`/`accel` fields.
        SbgImu => "SBG_IMU",
    }
}

sensor_models! {
    /// Millimeter-wave radar message layouts.
    RadarModel (SensorKind::Radar) {
        /// TI AWR1843BOOST point cloud, one target per message.
        Awr1843BoostRaw => "AWR1843BOOST_RAW",
        /// TI AWR1843BOOST custom message, one target per message.
        Awr1843BoostCustom => "AWR1843BOOST_CUSTOM",
        /// Ainstein radar, native target arrays.
        AinsteinRadar => "AINSTEIN_RADAR",
    }
}

sensor_models! {
    /// Scanning range sensor message layouts.
    LidarModel (SensorKind::Lidar) {
        VelodyneLidar => "VELODYNE_LIDAR",
        OusterLidar => "OUSTER_LIDAR",
        LivoxCustom => "LIVOX_CUSTOM",
    }
}

sensor_models! {
    /// Camera message layouts and shutter types.
    CameraModel (SensorKind::Camera) {
        SensorImageGs => "SENSOR_IMAGE_GS",
        SensorImageRsFirst => "SENSOR_IMAGE_RS_FIRST",
        SensorImageRsMid => "SENSOR_IMAGE_RS_MID",
        SensorImageRsLast => "SENSOR_IMAGE_RS_LAST",
        SensorImageCompGs => "SENSOR_IMAGE_COMP_GS",
        SensorImageCompRsFirst => "SENSOR_IMAGE_COMP_RS_FIRST",
        SensorImageCompRsMid => "SENSOR_IMAGE_COMP_RS_MID",
        SensorImageCompRsLast => "SENSOR_IMAGE_COMP_RS_LAST",
    }
}

impl ImuModel {
    /// Factor converting the raw accelerometer reading into m/s^2.
    pub fn acce_scale(self, gravity_norm: f64) -> f64 {
        match self {
            ImuModel::SensorImu | ImuModel::SbgImu => 1.0,
            ImuModel::SensorImuG => gravity_norm,
            ImuModel::SensorImuGNeg => -gravity_norm,
        }
    }
}

impl RadarModel {
    /// Models publishing one target per message; their streams are
    /// re-grouped into arrays after loading.
    pub fn needs_target_merge(self) -> bool {
        matches!(
            self,
            RadarModel::Awr1843BoostRaw | RadarModel::Awr1843BoostCustom
        )
    }
}

impl CameraModel {
    pub fn is_rolling_shutter(self) -> bool {
        !matches!(self, CameraModel::SensorImageGs | CameraModel::SensorImageCompGs)
    }

    pub fn is_compressed(self) -> bool {
        matches!(
            self,
            CameraModel::SensorImageCompGs
                | CameraModel::SensorImageCompRsFirst
                | CameraModel::SensorImageCompRsMid
                | CameraModel::SensorImageCompRsLast
        )
    }
}
