//! Work-session lifecycle: `start`, `complete`, `cancel`.
//!
//! The marker file is the only arbiter between invocations. Each call runs
//! its steps in order and blocks on every git and file-system operation.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit::{append_audit_event, read_recent_events, AuditError, AuditEvent};
use crate::backend::{Backend, BackendClient, BackendError, SessionSubmission};
use crate::baseline::{BaselineResolver, BaselineSource};
use crate::capture::{ChangeCaptureEngine, ChangeRecord, SessionSummary};
use crate::config::{ConfigLayer, SessionSettings};
use crate::error::SessionError;
use crate::git;
use crate::marker::{MarkerStore, SessionMarker};
use crate::process::ProcessRunner;
use crate::progress::{ParentTask, ProgressEntry, ProgressStore, SubtaskChange, SubtaskProgress};
use crate::readiness::{ReadinessReport, ReadinessValidator};

#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub marker: SessionMarker,
    /// True when an existing marker for the same task and identity was kept.
    pub resumed: bool,
    pub baseline_source: Option<BaselineSource>,
    pub readiness: ReadinessReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionOutcome {
    pub task_id: String,
    pub summary: SessionSummary,
    pub changes: Vec<ChangeRecord>,
    pub fingerprint: String,
    pub backend_reference: Option<String>,
    pub progress: Option<ProgressEntry>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub root: PathBuf,
    pub marker_path: PathBuf,
    pub marker: Option<SessionMarker>,
    /// `None` when no identity was presented.
    pub stale: Option<bool>,
    pub state_dir: PathBuf,
    /// Config layer that chose the state directory.
    pub state_dir_source: ConfigLayer,
}

/// Resolves the working-tree root containing `cwd`.
pub fn resolve_root(runner: &dyn ProcessRunner, cwd: &Path) -> Result<PathBuf, SessionError> {
    git::repo_root(runner, cwd)?.ok_or_else(|| SessionError::NotAVersionControlledTree {
        path: cwd.to_path_buf(),
    })
}

/// Session state machine for one working tree.
pub struct WorkSession {
    root: PathBuf,
    settings: SessionSettings,
    runner: Box<dyn ProcessRunner>,
    backend: Box<dyn Backend>,
    markers: MarkerStore,
    progress: ProgressStore,
}

impl WorkSession {
    pub fn new(
        root: impl Into<PathBuf>,
        settings: SessionSettings,
        runner: Box<dyn ProcessRunner>,
        backend: Box<dyn Backend>,
    ) -> Self {
        let root = root.into();
        let state_dir = settings.state_dir_path(&root);
        Self {
            markers: MarkerStore::new(&state_dir),
            progress: ProgressStore::new(&state_dir, settings.done_status.clone()),
            root,
            settings,
            runner,
            backend,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn state_dir(&self) -> PathBuf {
        self.settings.state_dir_path(&self.root)
    }

    pub fn markers(&self) -> &MarkerStore {
        &self.markers
    }

    pub fn progress(&self) -> &ProgressStore {
        &self.progress
    }

    fn client(&self) -> BackendClient<'_> {
        BackendClient::new(self.backend.as_ref())
    }

    pub fn readiness(&self, task_id: &str) -> ReadinessReport {
        ReadinessValidator::new(self.client(), &self.settings.done_status).check(task_id)
    }

    /// Opens a session for `task_id`.
    ///
    /// Repeating the call with the same task and identity keeps the stored
    /// baseline. A marker for another task or another identity is rejected.
    pub fn start(&self, task_id: &str, identity: &str) -> Result<StartOutcome, SessionError> {
        let readiness = self.readiness(task_id);
        if !readiness.ready {
            return Err(SessionError::NotReady {
                task_id: task_id.to_string(),
                missing_artifacts: readiness.missing_artifacts,
                blockers: readiness.blockers,
            });
        }

        let baseline = BaselineResolver::new(self.runner.as_ref(), &self.settings).resolve(&self.root)?;

        if let Some(existing) = self.markers.read()? {
            if !existing.is_stale_for(identity) {
                if existing.task_id == task_id {
                    info!(task_id, baseline = %existing.baseline_ref, "session already active, keeping baseline");
                    self.record_event("resume", Some(task_id), Some(identity), json!({
                        "baseline_ref": existing.baseline_ref,
                    }));
                    return Ok(StartOutcome {
                        marker: existing,
                        resumed: true,
                        baseline_source: None,
                        readiness,
                    });
                }
                return Err(SessionError::SessionAlreadyActive {
                    active_task_id: existing.task_id,
                    requested_task_id: task_id.to_string(),
                    started_at: existing.started_at,
                });
            }
        }

        let marker = SessionMarker {
            task_id: task_id.to_string(),
            baseline_ref: baseline.reference,
            branch: baseline.branch,
            session_identity: identity.to_string(),
            started_at: chrono::Utc::now().to_rfc3339(),
        };
        self.markers.create(&marker)?;
        info!(
            task_id,
            baseline = %marker.baseline_ref,
            branch = %marker.branch,
            source = baseline.source.as_str(),
            "session started"
        );
        self.record_event("start", Some(task_id), Some(identity), json!({
            "baseline_ref": marker.baseline_ref,
            "branch": marker.branch,
            "baseline_source": baseline.source.as_str(),
        }));
        Ok(StartOutcome {
            marker,
            resumed: false,
            baseline_source: Some(baseline.source),
            readiness,
        })
    }

    /// Captures the session's changes, hands them to the backend and closes
    /// the session.
    ///
    /// The marker survives a backend failure so a retry recomputes the same
    /// change set.
    pub fn complete(
        &self,
        task_id: &str,
        identity: &str,
        summary_text: Option<&str>,
    ) -> Result<CompletionOutcome, SessionError> {
        let marker = self.active_marker(task_id, identity)?;

        let changes = ChangeCaptureEngine::new(self.runner.as_ref())
            .exclude_dir(self.settings.state_dir.clone())
            .capture(&self.root, &marker.baseline_ref)?;
        if changes.is_empty() {
            return Err(SessionError::NoChangesDetected {
                task_id: task_id.to_string(),
                baseline_ref: marker.baseline_ref,
            });
        }

        let final_ref =
            git::head_sha(self.runner.as_ref(), &self.root)?.unwrap_or_else(|| marker.baseline_ref.clone());
        let summary = SessionSummary::from_changes(&changes, &marker.baseline_ref, &final_ref, &marker.branch);
        let mut warnings: Vec<String> = changes
            .iter()
            .filter_map(|change| {
                change
                    .warning
                    .as_ref()
                    .map(|warning| format!("{}: {}", change.path, warning))
            })
            .collect();

        let submission = SessionSubmission::new(
            task_id,
            summary.clone(),
            changes.clone(),
            summary_text.map(str::to_string),
        );
        let fingerprint = submission.fingerprint.clone();
        let backend_reference = match self.client().submit(submission) {
            Ok(reference) => reference,
            Err(BackendError::Unavailable(reason)) => {
                warn!(task_id, reason = %reason, "backend unavailable, session kept for retry");
                return Err(SessionError::BackendUnavailable {
                    task_id: task_id.to_string(),
                    reason,
                });
            }
            Err(err) => return Err(err.into()),
        };

        let progress = match self.update_progress(task_id, &marker.branch) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(task_id, error = %err, "progress not updated");
                warnings.push(format!("progress not updated: {err}"));
                None
            }
        };

        self.markers.delete()?;
        info!(
            task_id,
            files = summary.files_changed,
            added = summary.lines_added,
            removed = summary.lines_removed,
            "session completed"
        );
        self.record_event("complete", Some(task_id), Some(identity), json!({
            "baseline_ref": summary.baseline_ref,
            "final_ref": summary.final_ref,
            "files_changed": summary.files_changed,
            "lines_added": summary.lines_added,
            "lines_removed": summary.lines_removed,
            "fingerprint": fingerprint,
        }));

        Ok(CompletionOutcome {
            task_id: task_id.to_string(),
            summary,
            changes,
            fingerprint,
            backend_reference,
            progress,
            warnings,
        })
    }

    /// Closes the session without capturing or submitting anything.
    pub fn cancel(&self, task_id: &str, identity: &str) -> Result<SessionMarker, SessionError> {
        let marker = self.active_marker(task_id, identity)?;
        self.markers.delete()?;
        info!(task_id, "session canceled");
        self.record_event("cancel", Some(task_id), Some(identity), json!({
            "baseline_ref": marker.baseline_ref,
        }));
        Ok(marker)
    }

    pub fn status(&self, identity: Option<&str>) -> Result<SessionStatus, SessionError> {
        let marker = self.markers.read()?;
        let stale = match (identity, marker.as_ref()) {
            (Some(identity), Some(marker)) => Some(marker.is_stale_for(identity)),
            (Some(_), None) => Some(false),
            (None, _) => None,
        };
        Ok(SessionStatus {
            root: self.root.clone(),
            marker_path: self.markers.path().to_path_buf(),
            marker,
            stale,
            state_dir: self.state_dir(),
            state_dir_source: self.settings.state_dir_source,
        })
    }

    /// Removes the marker whoever owns it. This is the manual cleanup a
    /// stale session asks for.
    pub fn discard_marker(&self) -> Result<Option<SessionMarker>, SessionError> {
        let Some(marker) = self.markers.read()? else {
            return Ok(None);
        };
        self.markers.delete()?;
        warn!(task_id = %marker.task_id, identity = %marker.session_identity, "session marker discarded");
        self.record_event(
            "discard",
            Some(&marker.task_id),
            Some(&marker.session_identity),
            json!({ "baseline_ref": marker.baseline_ref }),
        );
        Ok(Some(marker))
    }

    pub fn history(&self, limit: usize) -> Result<Vec<AuditEvent>, AuditError> {
        read_recent_events(&self.state_dir(), limit)
    }

    fn active_marker(&self, task_id: &str, identity: &str) -> Result<SessionMarker, SessionError> {
        let marker = self.markers.active_for(identity)?;
        if marker.task_id != task_id {
            return Err(SessionError::TaskMismatch {
                active_task_id: marker.task_id,
                requested_task_id: task_id.to_string(),
            });
        }
        Ok(marker)
    }

    /// Records the completed task under its parent, if it has one.
    fn update_progress(&self, task_id: &str, branch: &str) -> Result<Option<ProgressEntry>, SessionError> {
        let pruned = self.progress.prune_completed()?;
        if pruned > 0 {
            debug!(pruned, "pruned finished progress entries");
        }

        let client = self.client();
        let task = client.task(task_id)?;
        let Some(parent_id) = task.parent_id.as_deref() else {
            return Ok(None);
        };
        let parent = client.task(parent_id)?;

        let mut siblings = Vec::new();
        for sibling_id in parent.subtasks.iter().filter(|id| id.as_str() != task_id) {
            match client.task(sibling_id) {
                Ok(sibling) => siblings.push(SubtaskProgress {
                    task_id: sibling.id,
                    title: sibling.title,
                    status: sibling.status,
                    priority: sibling.priority,
                }),
                Err(err) => debug!(sibling = %sibling_id, error = %err, "sibling subtask skipped"),
            }
        }

        let change = SubtaskChange {
            parent: ParentTask {
                task_id: parent.id,
                title: parent.title,
                status: parent.status,
                priority: parent.priority,
            },
            siblings,
            subtask: SubtaskProgress {
                task_id: task.id,
                title: task.title,
                status: self.settings.done_status.clone(),
                priority: task.priority,
            },
        };
        let entry = self.progress.record_subtask_change(&change, Some(branch))?;
        Ok(Some(entry))
    }

    fn record_event(&self, action: &str, task_id: Option<&str>, identity: Option<&str>, details: serde_json::Value) {
        let event = AuditEvent::new(action, task_id, identity, details);
        if let Err(err) = append_audit_event(&self.state_dir(), &event) {
            warn!(action, error = %err, "audit event not written");
        }
    }
}
