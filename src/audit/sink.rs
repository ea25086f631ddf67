//! Durable sinks behind the in-memory audit log.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;

use crate::audit::AuditEvent;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("sink io failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Receives every appended event. Implementations must be cheap enough to
/// run inline with the append.
pub trait AuditSink: Send + Sync {
    fn append(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Append-only JSON-lines file sink.
///
/// One self-describing JSON object per line, so records stay readable as
/// fields are added in later versions.
pub struct JsonlSink {
    file: Mutex<File>,
    path: PathBuf,
}

impl JsonlSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlSink {
    fn append(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let line = serde_json::to_string(event)?;
        let mut file = self.file.lock();
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEventType, AuditSeverity};
    use serde_json::json;

    #[test]
    fn writes_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlSink::create(&path).unwrap();

        for i in 0..3 {
            let event = AuditEvent::new(
                AuditEventType::Load,
                format!("strategy-{i}"),
                AuditSeverity::Info,
                json!({"outcome": "ready"}),
            );
            sink.append(&event).unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["event_type"], "load");
            assert!(value["subject"].as_str().unwrap().starts_with("strategy-"));
        }
    }

    #[test]
    fn reopening_appends_rather_than_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let first = JsonlSink::create(&path).unwrap();
        first
            .append(&AuditEvent::new(
                AuditEventType::CacheHit,
                "s-1",
                AuditSeverity::Info,
                json!({}),
            ))
            .unwrap();
        drop(first);

        let second = JsonlSink::create(&path).unwrap();
        second
            .append(&AuditEvent::new(
                AuditEventType::CacheMiss,
                "s-1",
                AuditSeverity::Info,
                json!({}),
            ))
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
