//! Audit trail of a calibration run.
//!
//! Every solver stage appends a [`LogEntry`]; the whole log is written as
//! `<output>/session.<ext>` when the run ends.

mod types;

use std::path::Path;

use anyhow::Result;
use ctcalib_core::DataFormat;
use serde::{Deserialize, Serialize};

pub use types::{current_timestamp, LogEntry, SessionMetadata};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLog {
    pub metadata: SessionMetadata,
    pub entries: Vec<LogEntry>,
}

impl SessionLog {
    pub fn new(metadata: SessionMetadata) -> Self {
        Self {
            metadata,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        self.metadata.touch();
        self.entries.push(entry);
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.last()
    }

    pub fn save(&self, path: &Path, format: DataFormat) -> Result<()> {
        format.save(self, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_log_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = SessionLog::new(SessionMetadata::new("LIN_POS_SPLINE", vec!["/imu".into()]));
        log.push(LogEntry::success("so3_init").with_cost(0.25));
        log.push(LogEntry::failure("visual_init", "missing reconstruction"));

        for format in [DataFormat::Json, DataFormat::Toml] {
            let path = dir.path().join(format!("session.{}", format.extension()));
            log.save(&path, format).unwrap();
            let restored: SessionLog = format.load(&path).unwrap();
            assert_eq!(restored.entries.len(), 2);
            assert_eq!(restored.entries[0].final_cost, Some(0.25));
            assert!(!restored.entries[1].success);
        }
    }
}
