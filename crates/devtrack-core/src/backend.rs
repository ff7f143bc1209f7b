//! Generic request/response interface to the task-tracking backend.
//!
//! Payloads are typed per endpoint category. Unknown fields in backend data
//! are ignored on deserialization and never reach core logic.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::capture::{ChangeRecord, SessionSummary};

#[derive(Debug, Error)]
pub enum BackendError {
    /// Transport-level failure; the request may succeed if retried.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("backend rejected request: {0}")]
    Rejected(String),
    #[error("unexpected backend response: expected {expected}, got {actual}")]
    UnexpectedResponse {
        expected: &'static str,
        actual: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub title: String,
    pub status: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub spec_id: Option<String>,
    /// Ids of tasks that must be complete before this one starts.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub subtasks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecSubtask {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// `None` when the subtask carries no dependency information at all.
    #[serde(default)]
    pub dependencies: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecRecord {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub document: Option<String>,
    #[serde(default)]
    pub pages: Vec<ArtifactRef>,
    #[serde(default)]
    pub endpoints: Vec<ArtifactRef>,
    #[serde(default)]
    pub schemas: Vec<ArtifactRef>,
    #[serde(default)]
    pub navigation_flow: Option<String>,
    #[serde(default)]
    pub main_task_id: Option<String>,
    #[serde(default)]
    pub subtasks: Vec<SpecSubtask>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRecord {
    pub id: String,
    pub title: String,
    pub status: String,
}

/// Everything a completed session hands to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSubmission {
    pub task_id: String,
    pub summary: SessionSummary,
    pub changes: Vec<ChangeRecord>,
    #[serde(default)]
    pub summary_text: Option<String>,
    /// Stable over retries of the same change set.
    pub fingerprint: String,
}

impl SessionSubmission {
    pub fn new(
        task_id: &str,
        summary: SessionSummary,
        changes: Vec<ChangeRecord>,
        summary_text: Option<String>,
    ) -> Self {
        let fingerprint = submission_fingerprint(task_id, &summary.baseline_ref, &changes);
        Self {
            task_id: task_id.to_string(),
            summary,
            changes,
            summary_text,
            fingerprint,
        }
    }
}

/// SHA-256 over the task, the baseline and each change's path, kind and diff.
pub fn submission_fingerprint(task_id: &str, baseline_ref: &str, changes: &[ChangeRecord]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(baseline_ref.as_bytes());
    for change in changes {
        hasher.update([0u8]);
        hasher.update(change.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(change.change_type.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(change.unified_diff.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BackendRequest {
    Task { task_id: String },
    Specification { spec_id: String },
    Dependencies { task_id: String },
    SubmitSession(Box<SessionSubmission>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BackendResponse {
    Task(TaskRecord),
    Specification(SpecRecord),
    Dependencies(Vec<DependencyRecord>),
    Accepted { reference: Option<String> },
}

impl BackendResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendResponse::Task(_) => "task",
            BackendResponse::Specification(_) => "specification",
            BackendResponse::Dependencies(_) => "dependencies",
            BackendResponse::Accepted { .. } => "accepted",
        }
    }
}

/// A task-tracking backend reached through one blocking call per request.
pub trait Backend {
    fn call(&self, request: BackendRequest) -> Result<BackendResponse, BackendError>;
}

impl<B: Backend + ?Sized> Backend for std::rc::Rc<B> {
    fn call(&self, request: BackendRequest) -> Result<BackendResponse, BackendError> {
        (**self).call(request)
    }
}

/// Typed helpers over [`Backend::call`].
#[derive(Clone, Copy)]
pub struct BackendClient<'a> {
    backend: &'a dyn Backend,
}

impl<'a> BackendClient<'a> {
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self { backend }
    }

    pub fn task(&self, task_id: &str) -> Result<TaskRecord, BackendError> {
        match self.backend.call(BackendRequest::Task {
            task_id: task_id.to_string(),
        })? {
            BackendResponse::Task(task) => Ok(task),
            other => Err(unexpected("task", &other)),
        }
    }

    pub fn specification(&self, spec_id: &str) -> Result<SpecRecord, BackendError> {
        match self.backend.call(BackendRequest::Specification {
            spec_id: spec_id.to_string(),
        })? {
            BackendResponse::Specification(spec) => Ok(spec),
            other => Err(unexpected("specification", &other)),
        }
    }

    pub fn dependencies(&self, task_id: &str) -> Result<Vec<DependencyRecord>, BackendError> {
        match self.backend.call(BackendRequest::Dependencies {
            task_id: task_id.to_string(),
        })? {
            BackendResponse::Dependencies(records) => Ok(records),
            other => Err(unexpected("dependencies", &other)),
        }
    }

    /// Returns the backend's reference for the stored submission, if any.
    pub fn submit(&self, submission: SessionSubmission) -> Result<Option<String>, BackendError> {
        match self
            .backend
            .call(BackendRequest::SubmitSession(Box::new(submission)))?
        {
            BackendResponse::Accepted { reference } => Ok(reference),
            other => Err(unexpected("accepted", &other)),
        }
    }
}

fn unexpected(expected: &'static str, actual: &BackendResponse) -> BackendError {
    BackendError::UnexpectedResponse {
        expected,
        actual: actual.kind(),
    }
}
