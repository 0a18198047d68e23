//! Append-only audit trail for successful identify and enroll outcomes.
//!
//! The sink is invoked after the result is decided; a failing sink is
//! logged and never alters the result.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Identify,
    Enroll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub credential: String,
    pub uid: String,
    pub operation: AuditOperation,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(credential: &str, uid: &str, operation: AuditOperation) -> Self {
        Self {
            credential: credential.to_string(),
            uid: uid.to_string(),
            operation,
            timestamp: Utc::now(),
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord) -> Result<()>;
}

/// One JSON object per line, appended to a log file.
pub struct JsonlAuditSink {
    file: Mutex<std::fs::File>,
}

impl JsonlAuditSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| crate::error::GateError::Internal(format!("Audit encode failed: {}", e)))?;
        line.push('\n');
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

/// Discards every record. Selected when no audit path is configured.
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _record: &AuditRecord) -> Result<()> {
        Ok(())
    }
}
