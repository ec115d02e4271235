//! Time-stamped sensor measurements.
//!
//! All stamps are seconds. Frames are created once by the loaders; the data
//! manager later removes frames outside the calibration window and shifts
//! every stamp (including per-point and per-target stamps) onto the common
//! time axis through [`TimedFrame::shift_time`].

use image::DynamicImage;

use crate::math::{Real, Vec3};

/// Common interface used by window trimming and time re-basing.
pub trait TimedFrame {
    fn timestamp(&self) -> Real;

    /// Add `delta` to the frame stamp and to every nested stamp.
    fn shift_time(&mut self, delta: Real);
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImuFrame {
    pub timestamp: Real,
    /// Angular rate in rad/s.
    pub gyro: Vec3,
    /// Specific force in m/s^2.
    pub acce: Vec3,
}

impl ImuFrame {
    pub fn new(timestamp: Real, gyro: Vec3, acce: Vec3) -> Self {
        Self {
            timestamp,
            gyro,
            acce,
        }
    }
}

impl TimedFrame for ImuFrame {
    fn timestamp(&self) -> Real {
        self.timestamp
    }

    fn shift_time(&mut self, delta: Real) {
        self.timestamp += delta;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LidarPoint {
    pub timestamp: Real,
    pub position: Vec3,
    pub intensity: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LidarFrame {
    pub timestamp: Real,
    pub points: Vec<LidarPoint>,
}

impl TimedFrame for LidarFrame {
    fn timestamp(&self) -> Real {
        self.timestamp
    }

    fn shift_time(&mut self, delta: Real) {
        self.timestamp += delta;
        for p in &mut self.points {
            p.timestamp += delta;
        }
    }
}

#[derive(Debug, Clone)]
pub struct CameraFrame {
    /// Milliseconds of the raw (pre re-basing) stamp, unique per topic.
    pub id: u64,
    pub timestamp: Real,
    pub image: DynamicImage,
}

impl TimedFrame for CameraFrame {
    fn timestamp(&self) -> Real {
        self.timestamp
    }

    fn shift_time(&mut self, delta: Real) {
        self.timestamp += delta;
    }
}

/// One radar detection in spherical coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadarTarget {
    pub timestamp: Real,
    pub range: Real,
    /// Angle in the x-y plane from the x axis, radians.
    pub azimuth: Real,
    /// Angle above the x-y plane, radians.
    pub elevation: Real,
    /// Radial velocity, positive when the target moves away.
    pub radial_vel: Real,
}

impl RadarTarget {
    pub fn from_position(timestamp: Real, p: &Vec3, radial_vel: Real) -> Self {
        let range = p.norm();
        let azimuth = p.y.atan2(p.x);
        let elevation = if range > 0.0 { (p.z / range).asin() } else { 0.0 };
        Self {
            timestamp,
            range,
            azimuth,
            elevation,
            radial_vel,
        }
    }

    /// Unit line-of-sight vector in the radar frame.
    pub fn direction(&self) -> Vec3 {
        let (se, ce) = self.elevation.sin_cos();
        let (sa, ca) = self.azimuth.sin_cos();
        Vec3::new(ce * ca, ce * sa, se)
    }

    pub fn position(&self) -> Vec3 {
        self.direction() * self.range
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RadarTargetArray {
    pub timestamp: Real,
    pub targets: Vec<RadarTarget>,
}

impl RadarTargetArray {
    /// Array stamped at the mean of its member stamps.
    pub fn from_targets(targets: Vec<RadarTarget>) -> Self {
        let timestamp = if targets.is_empty() {
            0.0
        } else {
            targets.iter().map(|t| t.timestamp).sum::<Real>() / targets.len() as Real
        };
        Self { timestamp, targets }
    }
}

impl TimedFrame for RadarTargetArray {
    fn timestamp(&self) -> Real {
        self.timestamp
    }

    fn shift_time(&mut self, delta: Real) {
        self.timestamp += delta;
        for t in &mut self.targets {
            t.timestamp += delta;
        }
    }
}
