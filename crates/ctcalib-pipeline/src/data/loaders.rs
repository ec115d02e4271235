//! Per-model message unpackers.
//!
//! Each sensor model family has one unpacker that decodes the record's `msg`
//! into the vendor payload defined below. A payload that does not match the
//! model's encoding is rejected with `None`.

use ctcalib_core::{
    CameraFrame, CameraModel, ImuFrame, ImuModel, LidarFrame, LidarModel, LidarPoint,
    RadarModel, RadarTarget, RadarTargetArray, Vec3,
};
use image::{DynamicImage, GrayImage, RgbImage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::LogRecord;

// ─────────────────────────────────────────────────────────────────────────────
// Vendor payloads
// ─────────────────────────────────────────────────────────────────────────────

/// `SENSOR_IMU`, `SENSOR_IMU_G`, `SENSOR_IMU_G_NEG`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImuMessage {
    pub angular_velocity: [f64; 3],
    pub linear_acceleration: [f64; 3],
}

/// `SBG_IMU`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SbgImuMessage {
    pub gyro: [f64; 3],
    pub accel: [f64; 3],
}

/// `AWR1843BOOST_RAW`: one Cartesian target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Awr1843RawMessage {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub velocity: f64,
}

/// One polar radar target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolarTarget {
    pub range: f64,
    pub azimuth: f64,
    pub elevation: f64,
    pub doppler: f64,
}

/// `AINSTEIN_RADAR`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AinsteinRadarMessage {
    pub targets: Vec<PolarTarget>,
}

/// Point of a spinning LiDAR, `time` relative to the message stamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpinningPoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub intensity: f32,
    pub time: f64,
}

/// `VELODYNE_LIDAR`, `OUSTER_LIDAR`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpinningLidarMessage {
    pub points: Vec<SpinningPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LivoxPoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub reflectivity: f32,
    /// Nanoseconds after `timebase`.
    pub offset_time: u64,
}

/// `LIVOX_CUSTOM`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LivoxMessage {
    /// Nanoseconds.
    pub timebase: u64,
    pub points: Vec<LivoxPoint>,
}

/// Raw image buffer, row-major without padding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawImageMessage {
    pub width: u32,
    pub height: u32,
    /// `mono8`, `rgb8` or `bgr8`.
    pub encoding: String,
    pub data: Vec<u8>,
}

/// Encoded image bytes (JPEG, PNG, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompressedImageMessage {
    pub format: String,
    pub data: Vec<u8>,
}

fn decode<T: DeserializeOwned>(msg: &serde_json::Value) -> Option<T> {
    T::deserialize(msg).ok()
}

// ─────────────────────────────────────────────────────────────────────────────
// Unpackers
// ─────────────────────────────────────────────────────────────────────────────

pub fn unpack_imu(model: ImuModel, record: &LogRecord, gravity_norm: f64) -> Option<ImuFrame> {
    let (gyro, acce) = match model {
        ImuModel::SensorImu | ImuModel::SensorImuG | ImuModel::SensorImuGNeg => {
            let m: ImuMessage = decode(&record.msg)?;
            (m.angular_velocity, m.linear_acceleration)
        }
        ImuModel::SbgImu => {
            let m: SbgImuMessage = decode(&record.msg)?;
            (m.gyro, m.accel)
        }
    };
    let scale = model.acce_scale(gravity_norm);
    Some(ImuFrame::new(
        record.stamp,
        Vec3::from(gyro),
        Vec3::from(acce) * scale,
    ))
}

/// Single-target models yield one-element arrays; they are re-grouped by
/// [`merge_radar_targets`](super::merge_radar_targets).
pub fn unpack_radar(model: RadarModel, record: &LogRecord) -> Option<RadarTargetArray> {
    let t = record.stamp;
    let polar = |p: &PolarTarget| RadarTarget {
        timestamp: t,
        range: p.range,
        azimuth: p.azimuth,
        elevation: p.elevation,
        radial_vel: p.doppler,
    };
    let targets = match model {
        RadarModel::Awr1843BoostRaw => {
            let m: Awr1843RawMessage = decode(&record.msg)?;
            vec![RadarTarget::from_position(t, &Vec3::new(m.x, m.y, m.z), m.velocity)]
        }
        RadarModel::Awr1843BoostCustom => {
            let m: PolarTarget = decode(&record.msg)?;
            vec![polar(&m)]
        }
        RadarModel::AinsteinRadar => {
            let m: AinsteinRadarMessage = decode(&record.msg)?;
            m.targets.iter().map(polar).collect()
        }
    };
    if targets.is_empty() {
        return None;
    }
    Some(RadarTargetArray {
        timestamp: t,
        targets,
    })
}

pub fn unpack_lidar(model: LidarModel, record: &LogRecord) -> Option<LidarFrame> {
    match model {
        LidarModel::VelodyneLidar | LidarModel::OusterLidar => {
            let m: SpinningLidarMessage = decode(&record.msg)?;
            let points = m
                .points
                .iter()
                .filter(|p| p.x.is_finite() && p.y.is_finite() && p.z.is_finite())
                .map(|p| LidarPoint {
                    timestamp: record.stamp + p.time,
                    position: Vec3::new(p.x, p.y, p.z),
                    intensity: p.intensity,
                })
                .collect();
            Some(LidarFrame {
                timestamp: record.stamp,
                points,
            })
        }
        LidarModel::LivoxCustom => {
            let m: LivoxMessage = decode(&record.msg)?;
            let base = m.timebase as f64 * 1e-9;
            let points = m
                .points
                .iter()
                .map(|p| LidarPoint {
                    timestamp: base + p.offset_time as f64 * 1e-9,
                    position: Vec3::new(p.x, p.y, p.z),
                    intensity: p.reflectivity,
                })
                .collect();
            Some(LidarFrame {
                timestamp: base,
                points,
            })
        }
    }
}

fn raw_image(m: RawImageMessage) -> Option<DynamicImage> {
    let expected = |channels: usize| {
        (m.width as usize)
            .checked_mul(m.height as usize)?
            .checked_mul(channels)
    };
    let len = Some(m.data.len());
    match m.encoding.as_str() {
        "mono8" if len == expected(1) => {
            GrayImage::from_raw(m.width, m.height, m.data).map(DynamicImage::ImageLuma8)
        }
        "rgb8" if len == expected(3) => {
            RgbImage::from_raw(m.width, m.height, m.data).map(DynamicImage::ImageRgb8)
        }
        "bgr8" if len == expected(3) => {
            let mut data = m.data;
            for px in data.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            RgbImage::from_raw(m.width, m.height, data).map(DynamicImage::ImageRgb8)
        }
        _ => None,
    }
}

/// Frame id is the raw stamp in milliseconds.
pub fn unpack_camera(model: CameraModel, record: &LogRecord) -> Option<CameraFrame> {
    let image = if model.is_compressed() {
        let m: CompressedImageMessage = decode(&record.msg)?;
        image::load_from_memory(&m.data).ok()?
    } else {
        raw_image(decode(&record.msg)?)?
    };
    Some(CameraFrame {
        id: (record.stamp * 1e3) as u64,
        timestamp: record.stamp,
        image,
    })
}
