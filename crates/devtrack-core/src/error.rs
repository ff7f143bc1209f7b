use std::path::PathBuf;

use thiserror::Error;

use crate::backend::BackendError;
use crate::process::GitError;

/// Every failure a session operation can report to its caller.
///
/// The caller-input kinds (`NotAVersionControlledTree` through `NotReady`)
/// are expected outcomes and carry enough context to be shown to a human
/// as-is.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{} is not inside a git working tree", .path.display())]
    NotAVersionControlledTree { path: PathBuf },
    #[error("Unable to resolve a baseline commit in {}: {reason}", .path.display())]
    NoBaseline { path: PathBuf, reason: String },
    #[error(
        "No changes detected for task {task_id} since baseline {baseline_ref}; check that you are in the right directory and have edited files"
    )]
    NoChangesDetected {
        task_id: String,
        baseline_ref: String,
    },
    #[error("No active session (no marker at {})", .marker_path.display())]
    NoActiveSession { marker_path: PathBuf },
    #[error(
        "A session for task {active_task_id} is already active (started {started_at}); finish or cancel it before starting {requested_task_id}"
    )]
    SessionAlreadyActive {
        active_task_id: String,
        requested_task_id: String,
        started_at: String,
    },
    #[error(
        "Stale session for task {task_id} belongs to another caller; remove {} manually (devtrack clear) before continuing",
        .marker_path.display()
    )]
    StaleSession {
        task_id: String,
        marker_path: PathBuf,
    },
    #[error("Active session tracks task {active_task_id}, not {requested_task_id}")]
    TaskMismatch {
        active_task_id: String,
        requested_task_id: String,
    },
    #[error("Task {task_id} is not ready: {}", describe_not_ready(.missing_artifacts, .blockers))]
    NotReady {
        task_id: String,
        missing_artifacts: Vec<String>,
        blockers: Vec<String>,
    },
    #[error(
        "Backend unavailable while completing task {task_id}: {reason}; the session was kept, retry complete"
    )]
    BackendUnavailable { task_id: String, reason: String },
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("Session state IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse session state: {0}")]
    Parse(#[from] serde_json::Error),
}

impl SessionError {
    /// Stable machine-readable name for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::NotAVersionControlledTree { .. } => "not_a_version_controlled_tree",
            SessionError::NoBaseline { .. } => "no_baseline",
            SessionError::NoChangesDetected { .. } => "no_changes_detected",
            SessionError::NoActiveSession { .. } => "no_active_session",
            SessionError::SessionAlreadyActive { .. } => "session_already_active",
            SessionError::StaleSession { .. } => "stale_session",
            SessionError::TaskMismatch { .. } => "task_mismatch",
            SessionError::NotReady { .. } => "not_ready",
            SessionError::BackendUnavailable { .. } => "backend_unavailable",
            SessionError::Backend(_) => "backend",
            SessionError::Git(_) => "git",
            SessionError::Io(_) => "io",
            SessionError::Parse(_) => "parse",
        }
    }

    /// True for the kinds that describe caller input rather than a fault.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            SessionError::NotAVersionControlledTree { .. }
                | SessionError::NoChangesDetected { .. }
                | SessionError::NoActiveSession { .. }
                | SessionError::SessionAlreadyActive { .. }
                | SessionError::StaleSession { .. }
                | SessionError::TaskMismatch { .. }
                | SessionError::NotReady { .. }
        )
    }
}

fn describe_not_ready(missing_artifacts: &[String], blockers: &[String]) -> String {
    let mut parts = Vec::new();
    if !missing_artifacts.is_empty() {
        parts.push(format!("missing {}", missing_artifacts.join(", ")));
    }
    if !blockers.is_empty() {
        parts.push(blockers.join("; "));
    }
    if parts.is_empty() {
        "readiness check failed".to_string()
    } else {
        parts.join(" | ")
    }
}
