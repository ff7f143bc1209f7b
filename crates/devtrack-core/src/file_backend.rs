use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::atomic::write_atomic;
use crate::backend::{
    Backend, BackendError, BackendRequest, BackendResponse, DependencyRecord, SessionSubmission,
    SpecRecord, TaskRecord,
};

pub const TASKS_FILE: &str = "tasks.yaml";
pub const SPECS_FILE: &str = "specs.yaml";
pub const STATUSES_FILE: &str = "statuses.json";
pub const SUBMISSIONS_DIR: &str = "submissions";
pub const MISSING_STATUS: &str = "missing";

/// Backend over a local directory of YAML catalogs.
///
/// Layout:
/// - `tasks.yaml`: list of tasks
/// - `specs.yaml`: list of specifications
/// - `statuses.json`: status overrides written by submissions
/// - `submissions/<task>-<fingerprint>.json`: one file per accepted session
///
/// A missing task catalog reads as an unavailable backend.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
    done_status: String,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>, done_status: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            done_status: done_status.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn submissions_dir(&self) -> PathBuf {
        self.dir.join(SUBMISSIONS_DIR)
    }

    fn tasks(&self) -> anyhow::Result<Vec<TaskRecord>> {
        let path = self.dir.join(TASKS_FILE);
        if !path.is_file() {
            anyhow::bail!("no task catalog at {}", path.display());
        }
        let mut tasks: Vec<TaskRecord> = read_yaml(&path)?;
        let statuses = self.statuses()?;
        for task in &mut tasks {
            if let Some(status) = statuses.get(&task.id) {
                task.status = status.clone();
            }
        }
        Ok(tasks)
    }

    fn specs(&self) -> anyhow::Result<Vec<SpecRecord>> {
        let path = self.dir.join(SPECS_FILE);
        if !path.is_file() {
            return Ok(Vec::new());
        }
        read_yaml(&path)
    }

    fn statuses(&self) -> anyhow::Result<BTreeMap<String, String>> {
        let path = self.dir.join(STATUSES_FILE);
        if !path.is_file() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
    }

    fn find_task(&self, task_id: &str) -> Result<TaskRecord, BackendError> {
        self.tasks()
            .map_err(unavailable)?
            .into_iter()
            .find(|task| task.id == task_id)
            .ok_or_else(|| BackendError::NotFound {
                kind: "task",
                id: task_id.to_string(),
            })
    }

    fn find_spec(&self, spec_id: &str) -> Result<SpecRecord, BackendError> {
        self.specs()
            .map_err(unavailable)?
            .into_iter()
            .find(|spec| spec.id == spec_id)
            .ok_or_else(|| BackendError::NotFound {
                kind: "specification",
                id: spec_id.to_string(),
            })
    }

    fn dependencies(&self, task_id: &str) -> Result<Vec<DependencyRecord>, BackendError> {
        let tasks = self.tasks().map_err(unavailable)?;
        let Some(task) = tasks.iter().find(|task| task.id == task_id) else {
            return Err(BackendError::NotFound {
                kind: "task",
                id: task_id.to_string(),
            });
        };
        Ok(task
            .dependencies
            .iter()
            .map(|dep_id| match tasks.iter().find(|candidate| &candidate.id == dep_id) {
                Some(dep) => DependencyRecord {
                    id: dep.id.clone(),
                    title: dep.title.clone(),
                    status: dep.status.clone(),
                },
                None => DependencyRecord {
                    id: dep_id.clone(),
                    title: dep_id.clone(),
                    status: MISSING_STATUS.to_string(),
                },
            })
            .collect())
    }

    /// Refuses submissions for tasks the catalog does not list. Without a
    /// catalog there is nothing to check against.
    fn ensure_known_task(&self, task_id: &str) -> Result<(), BackendError> {
        if !self.dir.join(TASKS_FILE).is_file() {
            return Ok(());
        }
        match self.find_task(task_id) {
            Ok(_) => Ok(()),
            Err(BackendError::NotFound { .. }) => Err(BackendError::Rejected(format!(
                "task {task_id} is not in the catalog"
            ))),
            Err(err) => Err(err),
        }
    }

    fn submit(&self, submission: &SessionSubmission) -> anyhow::Result<String> {
        let short = submission.fingerprint.get(..12).unwrap_or(&submission.fingerprint);
        let name = format!("{}-{}.json", sanitize_file_component(&submission.task_id), short);
        let path = self.submissions_dir().join(&name);
        let mut body = serde_json::to_vec_pretty(submission).context("serialize submission")?;
        body.push(b'\n');
        write_atomic(&path, &body).with_context(|| format!("write {}", path.display()))?;

        let mut statuses = self.statuses()?;
        statuses.insert(submission.task_id.clone(), self.done_status.clone());
        let status_path = self.dir.join(STATUSES_FILE);
        let mut body = serde_json::to_vec_pretty(&statuses).context("serialize statuses")?;
        body.push(b'\n');
        write_atomic(&status_path, &body).with_context(|| format!("write {}", status_path.display()))?;

        info!(
            task_id = %submission.task_id,
            files = submission.summary.files_changed,
            path = %path.display(),
            "stored session submission"
        );
        Ok(name)
    }
}

impl Backend for FileBackend {
    fn call(&self, request: BackendRequest) -> Result<BackendResponse, BackendError> {
        debug!(dir = %self.dir.display(), request = request_kind(&request), "file backend call");
        match request {
            BackendRequest::Task { task_id } => self.find_task(&task_id).map(BackendResponse::Task),
            BackendRequest::Specification { spec_id } => {
                self.find_spec(&spec_id).map(BackendResponse::Specification)
            }
            BackendRequest::Dependencies { task_id } => {
                self.dependencies(&task_id).map(BackendResponse::Dependencies)
            }
            BackendRequest::SubmitSession(submission) => {
                self.ensure_known_task(&submission.task_id)?;
                let reference = self.submit(&submission).map_err(unavailable)?;
                Ok(BackendResponse::Accepted {
                    reference: Some(reference),
                })
            }
        }
    }
}

fn request_kind(request: &BackendRequest) -> &'static str {
    match request {
        BackendRequest::Task { .. } => "task",
        BackendRequest::Specification { .. } => "specification",
        BackendRequest::Dependencies { .. } => "dependencies",
        BackendRequest::SubmitSession(_) => "submit_session",
    }
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

fn unavailable(err: anyhow::Error) -> BackendError {
    BackendError::Unavailable(format!("{err:#}"))
}

fn sanitize_file_component(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
