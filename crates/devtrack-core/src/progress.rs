use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::atomic::write_json_atomic;
use crate::error::SessionError;

pub const PROGRESS_SCHEMA_VERSION: u32 = 1;
pub const PROGRESS_FILE: &str = "progress.json";
const PROGRESS_LOCK_FILE: &str = "progress.lock";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskProgress {
    pub task_id: String,
    pub title: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub task_id: String,
    pub title: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    pub completion_percent: u8,
    #[serde(default)]
    pub subtasks: Vec<SubtaskProgress>,
    pub last_updated: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressDocument {
    pub version: u32,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub entries: Vec<ProgressEntry>,
}

impl Default for ProgressDocument {
    fn default() -> Self {
        Self {
            version: PROGRESS_SCHEMA_VERSION,
            branch: None,
            updated_at: None,
            entries: Vec::new(),
        }
    }
}

/// The parent task as last seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentTask {
    pub task_id: String,
    pub title: String,
    pub status: String,
    pub priority: Option<String>,
}

/// One subtask status change, with the sibling rows known at the time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtaskChange {
    pub parent: ParentTask,
    /// Known sibling rows; inserted when missing, refreshed when present.
    pub siblings: Vec<SubtaskProgress>,
    pub subtask: SubtaskProgress,
}

pub fn is_done_status(status: &str, done_status: &str) -> bool {
    let status = status.trim();
    status.eq_ignore_ascii_case(done_status) || status.eq_ignore_ascii_case("completed")
}

/// Rounded share of done subtasks, 0 for a parent with no subtasks.
pub fn completion_percent(subtasks: &[SubtaskProgress], done_status: &str) -> u8 {
    let total = subtasks.len() as u64;
    if total == 0 {
        return 0;
    }
    let done = subtasks
        .iter()
        .filter(|subtask| is_done_status(&subtask.status, done_status))
        .count() as u64;
    ((200 * done + total) / (2 * total)).min(100) as u8
}

struct ProgressLock {
    _file: fs::File,
}

/// Owns the progress document under the state directory.
///
/// Every mutation is a locked read-modify-write of the whole document,
/// saved with a temp file and rename.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
    lock_path: PathBuf,
    done_status: String,
}

impl ProgressStore {
    pub fn new(state_dir: &Path, done_status: impl Into<String>) -> Self {
        Self {
            path: state_dir.join(PROGRESS_FILE),
            lock_path: state_dir.join(PROGRESS_LOCK_FILE),
            done_status: done_status.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<ProgressDocument, SessionError> {
        if !self.path.exists() {
            return Ok(ProgressDocument::default());
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn save(&self, document: &ProgressDocument) -> Result<(), SessionError> {
        write_json_atomic(&self.path, document)
    }

    fn lock(&self) -> Result<ProgressLock, SessionError> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;
        file.lock_exclusive()?;
        Ok(ProgressLock { _file: file })
    }

    /// Upserts the subtask under its parent and recomputes the parent's
    /// completion. Returns the updated entry.
    pub fn record_subtask_change(
        &self,
        change: &SubtaskChange,
        branch: Option<&str>,
    ) -> Result<ProgressEntry, SessionError> {
        let _lock = self.lock()?;
        let mut document = self.load()?;
        let now = Utc::now().to_rfc3339();

        let index = match document
            .entries
            .iter()
            .position(|entry| entry.task_id == change.parent.task_id)
        {
            Some(index) => index,
            None => {
                document.entries.push(ProgressEntry {
                    task_id: change.parent.task_id.clone(),
                    title: change.parent.title.clone(),
                    status: change.parent.status.clone(),
                    priority: change.parent.priority.clone(),
                    completion_percent: 0,
                    subtasks: Vec::new(),
                    last_updated: now.clone(),
                });
                document.entries.len() - 1
            }
        };

        let entry = &mut document.entries[index];
        entry.title = change.parent.title.clone();
        entry.status = change.parent.status.clone();
        entry.priority = change.parent.priority.clone();
        for sibling in &change.siblings {
            upsert_subtask(&mut entry.subtasks, sibling);
        }
        upsert_subtask(&mut entry.subtasks, &change.subtask);
        entry.completion_percent = completion_percent(&entry.subtasks, &self.done_status);
        entry.last_updated = now.clone();
        let updated = entry.clone();

        document.version = PROGRESS_SCHEMA_VERSION;
        document.branch = branch.map(str::to_string);
        document.updated_at = Some(now);
        self.save(&document)?;
        debug!(
            parent = %updated.task_id,
            subtask = %change.subtask.task_id,
            percent = updated.completion_percent,
            "recorded subtask progress"
        );
        Ok(updated)
    }

    /// Removes every entry at 100% whose own status is done. Idempotent.
    pub fn prune_completed(&self) -> Result<usize, SessionError> {
        let _lock = self.lock()?;
        let mut document = self.load()?;
        let before = document.entries.len();
        document.entries.retain(|entry| {
            !(entry.completion_percent >= 100 && is_done_status(&entry.status, &self.done_status))
        });
        let removed = before - document.entries.len();
        if removed > 0 {
            document.updated_at = Some(Utc::now().to_rfc3339());
            self.save(&document)?;
            debug!(removed, "pruned completed progress entries");
        }
        Ok(removed)
    }

    /// Human-readable rendering of the progress document.
    pub fn summarize(&self) -> Result<String, SessionError> {
        let document = self.load()?;
        Ok(render_summary(&document, &self.done_status))
    }
}

fn upsert_subtask(subtasks: &mut Vec<SubtaskProgress>, row: &SubtaskProgress) {
    match subtasks.iter_mut().find(|existing| existing.task_id == row.task_id) {
        Some(existing) => *existing = row.clone(),
        None => subtasks.push(row.clone()),
    }
}

fn render_summary(document: &ProgressDocument, done_status: &str) -> String {
    if document.entries.is_empty() {
        return "No tracked progress.".to_string();
    }
    let mut lines = Vec::new();
    let mut header = "Progress".to_string();
    if let Some(branch) = document.branch.as_deref() {
        header.push_str(&format!(" on {branch}"));
    }
    if let Some(updated_at) = document.updated_at.as_deref() {
        header.push_str(&format!(" (updated {updated_at})"));
    }
    lines.push(header);
    for entry in &document.entries {
        let done = entry
            .subtasks
            .iter()
            .filter(|subtask| is_done_status(&subtask.status, done_status))
            .count();
        let priority = entry
            .priority
            .as_deref()
            .map(|priority| format!(" {priority}"))
            .unwrap_or_default();
        lines.push(format!(
            "- {} {} [{}{}] {}% ({}/{} subtasks)",
            entry.task_id,
            entry.title,
            entry.status,
            priority,
            entry.completion_percent,
            done,
            entry.subtasks.len()
        ));
        for subtask in &entry.subtasks {
            let mark = if is_done_status(&subtask.status, done_status) {
                "x"
            } else {
                " "
            };
            lines.push(format!("    [{mark}] {} {}", subtask.task_id, subtask.title));
        }
    }
    lines.join("\n")
}
