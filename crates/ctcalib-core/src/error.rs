//! Error kinds raised across the calibration workspace.
//!
//! Library functions return `anyhow::Result` and put a [`CalibError`] at the
//! root of the chain whenever the caller has to react to the kind. The CLI
//! walks the chain with [`severity_of`] to decide between abort and a clean
//! stop.

use std::path::PathBuf;

use thiserror::Error;

/// How the top-level run loop reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Abort the run and report failure.
    Fatal,
    /// The run stopped on purpose; it can be resumed after user action.
    Recoverable,
}

#[derive(Debug, Error)]
pub enum CalibError {
    #[error("the message log '{}' does not exist", .0.display())]
    MissingLog(PathBuf),

    #[error("there is no data in topic '{topic}', check the topic name and the sensor model")]
    MissingTopicData { topic: String },

    #[error("{kind} topic '{topic}' is empty after {stage}")]
    EmptyStream {
        kind: &'static str,
        topic: String,
        stage: String,
    },

    #[error("no time intersection between {first} and {second}: window [{start:.6}, {end:.6}]")]
    NoIntersection {
        first: String,
        second: String,
        start: f64,
        end: f64,
    },

    #[error("unknown {kind} model '{name}'")]
    UnknownSensorModel { kind: &'static str, name: String },

    #[error("'{query}' needs a position scale spline, the current scale spline is '{scale_type}'")]
    ScaleSplineNotPosition {
        query: &'static str,
        scale_type: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "SfM reconstruction of camera '{topic}' is required: run the commands in '{}' and restart",
        .command_file.display()
    )]
    SfmReconstructionRequired {
        topic: String,
        command_file: PathBuf,
    },

    #[error("i/o failure on '{}'", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed data: {0}")]
    Format(String),
}

impl CalibError {
    pub fn severity(&self) -> Severity {
        match self {
            CalibError::SfmReconstructionRequired { .. } => Severity::Recoverable,
            _ => Severity::Fatal,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CalibError::Io {
            path: path.into(),
            source,
        }
    }
}

/// First [`CalibError`] found in the chain of `err`, if any.
pub fn find_calib_error(err: &anyhow::Error) -> Option<&CalibError> {
    err.chain().find_map(|cause| cause.downcast_ref::<CalibError>())
}

/// Severity of an arbitrary error; errors without a kind are fatal.
pub fn severity_of(err: &anyhow::Error) -> Severity {
    find_calib_error(err)
        .map(CalibError::severity)
        .unwrap_or(Severity::Fatal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn only_sfm_request_is_recoverable() {
        let err = CalibError::SfmReconstructionRequired {
            topic: "/cam".into(),
            command_file: PathBuf::from("/tmp/ws/sfm-command-line.txt"),
        };
        assert_eq!(err.severity(), Severity::Recoverable);
        assert_eq!(
            CalibError::MissingLog(PathBuf::from("x")).severity(),
            Severity::Fatal
        );
    }

    #[test]
    fn severity_survives_context() {
        let res: anyhow::Result<()> = Err(CalibError::SfmReconstructionRequired {
            topic: "/cam".into(),
            command_file: PathBuf::from("cmd.txt"),
        }
        .into());
        let err = res.context("visual init").unwrap_err();
        assert_eq!(severity_of(&err), Severity::Recoverable);

        let plain = anyhow::anyhow!("something else");
        assert_eq!(severity_of(&plain), Severity::Fatal);
    }
}
