use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use ulid::Ulid;

pub const AUDIT_LOG_FILE: &str = "audit.log";

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Failed to write audit log: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize audit event: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One line of session history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: String,
    /// `start`, `resume`, `complete`, `cancel` or `discard`.
    pub action: String,
    pub task_id: Option<String>,
    pub identity: Option<String>,
    #[serde(default)]
    pub details: Value,
}

impl AuditEvent {
    pub fn new(action: &str, task_id: Option<&str>, identity: Option<&str>, details: Value) -> Self {
        Self {
            id: Ulid::new().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            action: action.to_string(),
            task_id: task_id.map(str::to_string),
            identity: identity.map(str::to_string),
            details,
        }
    }
}

pub fn audit_log_path(state_dir: &Path) -> PathBuf {
    state_dir.join(AUDIT_LOG_FILE)
}

pub fn append_audit_event(state_dir: &Path, event: &AuditEvent) -> Result<(), AuditError> {
    fs::create_dir_all(state_dir)?;
    let path = audit_log_path(state_dir);
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(event)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

/// Newest-last slice of at most `limit` events. Unparsable lines are skipped.
pub fn read_recent_events(state_dir: &Path, limit: usize) -> Result<Vec<AuditEvent>, AuditError> {
    let path = audit_log_path(state_dir);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path)?;
    let events: Vec<AuditEvent> = raw
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();
    let skip = events.len().saturating_sub(limit);
    Ok(events.into_iter().skip(skip).collect())
}
