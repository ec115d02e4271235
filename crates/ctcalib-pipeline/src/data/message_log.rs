//! Recorded multi-topic message log.
//!
//! The log is a JSON-lines file, one record per line:
//!
//! ```text
//! {"topic": "/imu0", "stamp": 1620000000.125, "msg": {"angular_velocity": [0, 0, 0.1], ...}}
//! ```
//!
//! Records keep their file order; streams are sorted after decoding.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ctcalib_core::CalibError;
use serde::{Deserialize, Serialize};

/// One message of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub topic: String,
    /// Receive time in seconds.
    pub stamp: f64,
    /// Vendor payload, decoded by the topic's unpacker.
    pub msg: serde_json::Value,
}

impl LogRecord {
    pub fn new(topic: impl Into<String>, stamp: f64, msg: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            stamp,
            msg,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageLog {
    path: PathBuf,
    records: Vec<LogRecord>,
}

impl MessageLog {
    /// Read the whole log; a missing file is [`CalibError::MissingLog`].
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(CalibError::MissingLog(path.to_path_buf()).into());
        }
        let file = File::open(path).map_err(|e| CalibError::io(path, e))?;
        let mut records = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| CalibError::io(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: LogRecord = serde_json::from_str(&line)
                .map_err(|e| CalibError::Format(format!("line {}: {e}", idx + 1)))
                .with_context(|| format!("reading message log '{}'", path.display()))?;
            records.push(record);
        }
        log::debug!("read {} records from '{}'", records.len(), path.display());
        Ok(Self {
            path: path.to_path_buf(),
            records,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Earliest and latest stamp among `topics`, `None` when none of them
    /// has a record.
    pub fn time_range(&self, topics: &[String]) -> Option<(f64, f64)> {
        self.records
            .iter()
            .filter(|r| topics.contains(&r.topic))
            .fold(None, |acc, r| match acc {
                None => Some((r.stamp, r.stamp)),
                Some((lo, hi)) => Some((f64::min(lo, r.stamp), f64::max(hi, r.stamp))),
            })
    }

    /// Records of `topics` with `begin <= stamp <= end`, in file order.
    pub fn query<'a>(
        &'a self,
        topics: &'a [String],
        begin: f64,
        end: f64,
    ) -> impl Iterator<Item = &'a LogRecord> + 'a {
        self.records
            .iter()
            .filter(move |r| r.stamp >= begin && r.stamp <= end && topics.contains(&r.topic))
    }
}

/// Write `records` as a JSON-lines log.
pub fn write_message_log<'a>(
    path: &Path,
    records: impl IntoIterator<Item = &'a LogRecord>,
) -> Result<()> {
    let file = File::create(path).map_err(|e| CalibError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    for record in records {
        serde_json::to_writer(&mut writer, record)
            .map_err(|e| CalibError::Format(e.to_string()))?;
        writer
            .write_all(b"\n")
            .map_err(|e| CalibError::io(path, e))?;
    }
    writer.flush().map_err(|e| CalibError::io(path, e))?;
    Ok(())
}
