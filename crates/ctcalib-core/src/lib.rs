//! Core types of the `ctcalib` continuous-time calibration workspace.
//!
//! This crate contains:
//! - linear algebra aliases and SO(3) helpers (`Real`, `Vec3`, `Quat`, ...),
//! - the error kinds shared by every crate ([`CalibError`]),
//! - the run configuration ([`CalibConfig`]) and serialized formats,
//! - the sensor model registry and pinhole camera intrinsics,
//! - time-stamped sensor frames,
//! - uniform cumulative B-splines on SO(3) and R^3 and their bundle,
//! - the calibration parameter manager.

/// Run configuration.
pub mod config;
/// Error kinds and severity classification.
pub mod error;
/// JSON/TOML file formats.
pub mod format;
/// Sensor measurements.
pub mod frames;
/// Linear algebra type aliases and helpers.
pub mod math;
/// Sensor model registry and camera intrinsics.
pub mod models;
/// Estimated calibration parameters.
pub mod params;
/// Continuous-time trajectory splines.
pub mod spline;
/// Deterministic synthetic motion for tests.
pub mod synthetic;

pub use config::*;
pub use error::*;
pub use format::*;
pub use frames::*;
pub use math::*;
pub use models::*;
pub use params::*;
pub use spline::{ScaleSplineType, SplineBundle};
