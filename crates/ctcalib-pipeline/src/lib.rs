//! Data handling and staged solving of the continuous-time calibrator.
//!
//! This crate contains:
//! - the message-log reader and the [`CalibDataManager`] that trims and
//!   aligns every sensor stream,
//! - the staged [`CalibSolver`] and its step functions,
//! - the bridge to an external structure-from-motion tool,
//! - the voxel surfel map behind the LiDAR point-to-plane factors,
//! - the optional progress viewer and the session audit log.
//!
//! ```no_run
//! use ctcalib_core::CalibConfig;
//! use ctcalib_pipeline::run_calibration;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = CalibConfig::load(std::path::Path::new("config.toml"))?;
//! let params = run_calibration(&config)?;
//! params.log_status();
//! # Ok(())
//! # }
//! ```

/// Message log, stream loading, trimming and alignment.
pub mod data;
/// Surfel map of the LiDAR factors.
pub mod lidar;
/// Audit trail of a run.
pub mod session;
/// Structure-from-motion export and import.
pub mod sfm;
/// Staged solver.
pub mod solver;
/// Progress viewer thread.
pub mod viewer;

pub use data::{CalibDataManager, SensorStreams};
pub use session::{LogEntry, SessionLog, SessionMetadata};
pub use solver::{run_calibration, run_steps, CalibSolver};
pub use viewer::{Viewer, ViewerFrame};
