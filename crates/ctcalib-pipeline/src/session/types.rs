//! Run log types: metadata and one entry per solver stage.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Metadata about a calibration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Tool version that produced the run.
    pub version: String,

    /// Scale spline the run used (`LIN_POS_SPLINE`, ...).
    pub scale_spline: String,

    /// Every configured topic.
    pub topics: Vec<String>,

    /// Unix timestamp when the run started (seconds since epoch).
    pub created_at: u64,

    /// Unix timestamp of the last logged stage.
    pub last_modified: u64,
}

impl SessionMetadata {
    pub fn new(scale_spline: impl Into<String>, topics: Vec<String>) -> Self {
        let now = current_timestamp();
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            scale_spline: scale_spline.into(),
            topics,
            created_at: now,
            last_modified: now,
        }
    }

    /// Update the last_modified timestamp to now.
    pub fn touch(&mut self) {
        self.last_modified = current_timestamp();
    }
}

/// Lightweight stage log entry.
///
/// Intended for the audit trail written next to the results, not for replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Unix timestamp of the stage end (seconds since epoch).
    pub timestamp: u64,

    /// Stage name (e.g. "so3_init", "joint_refine").
    pub operation: String,

    /// Whether the stage succeeded.
    pub success: bool,

    /// Final cost of the stage optimization, if it ran one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_cost: Option<f64>,

    /// Optional notes or error message.
    pub notes: Option<String>,
}

impl LogEntry {
    pub fn success(operation: impl Into<String>) -> Self {
        Self {
            timestamp: current_timestamp(),
            operation: operation.into(),
            success: true,
            final_cost: None,
            notes: None,
        }
    }

    pub fn success_with_notes(operation: impl Into<String>, notes: impl Into<String>) -> Self {
        Self {
            notes: Some(notes.into()),
            ..Self::success(operation)
        }
    }

    pub fn failure(operation: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            notes: Some(error.into()),
            ..Self::success(operation)
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.final_cost = Some(cost);
        self
    }
}

/// Current Unix timestamp in seconds; 0 when the clock is before the epoch.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_new() {
        let meta = SessionMetadata::new("LIN_ACCE_SPLINE", vec!["/imu0".to_string()]);
        assert_eq!(meta.scale_spline, "LIN_ACCE_SPLINE");
        assert_eq!(meta.topics, vec!["/imu0".to_string()]);
        assert!(meta.created_at > 0);
        assert_eq!(meta.created_at, meta.last_modified);
    }

    #[test]
    fn metadata_touch() {
        let mut meta = SessionMetadata::new("LIN_POS_SPLINE", Vec::new());
        let original = meta.last_modified;
        meta.touch();
        assert!(meta.last_modified >= original);
    }

    #[test]
    fn log_entry_variants() {
        let entry = LogEntry::success("so3_init").with_cost(1.5);
        assert!(entry.success);
        assert_eq!(entry.final_cost, Some(1.5));
        assert!(entry.notes.is_none());

        let entry = LogEntry::success_with_notes("gravity_init", "window 1.0 s");
        assert_eq!(entry.notes.as_deref(), Some("window 1.0 s"));

        let entry = LogEntry::failure("visual_init", "no reconstruction");
        assert!(!entry.success);
        assert_eq!(entry.operation, "visual_init");
    }

    #[test]
    fn log_entry_serialization_skips_missing_cost() {
        let json = serde_json::to_string(&LogEntry::success("gravity_align")).unwrap();
        assert!(!json.contains("final_cost"));
        let restored: LogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.operation, "gravity_align");
        assert_eq!(restored.final_cost, None);
    }
}
