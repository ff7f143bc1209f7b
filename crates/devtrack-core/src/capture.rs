//! Change capture between a baseline commit and the live working tree.
//!
//! The working tree is diffed directly, so uncommitted and never-staged edits
//! are included. Untracked files that are not ignored count as added.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::git;
use crate::language::{infer_language, BINARY};
use crate::process::{GitError, ProcessRunner};

/// Bytes inspected for a NUL when sniffing binary content, as git does.
const BINARY_SNIFF_LEN: usize = 8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Added => "added",
            ChangeType::Modified => "modified",
            ChangeType::Deleted => "deleted",
        }
    }
}

/// One changed path.
///
/// `change_type` is authoritative. `before` is empty for every added file and
/// `after` for every deleted one, but an empty string alone does not imply
/// either: an added empty file has `after == ""`, and a file that was empty at
/// the baseline has `before == ""`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Path relative to the working-tree root, `/`-separated.
    pub path: String,
    pub change_type: ChangeType,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub language: String,
    #[serde(default)]
    pub binary: bool,
    pub before: String,
    pub after: String,
    pub unified_diff: String,
    /// Set when the record is a best-effort fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub files_changed: u64,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub baseline_ref: String,
    pub final_ref: String,
    pub branch: String,
}

impl SessionSummary {
    pub fn from_changes(
        changes: &[ChangeRecord],
        baseline_ref: &str,
        final_ref: &str,
        branch: &str,
    ) -> Self {
        Self {
            files_changed: changes.len() as u64,
            lines_added: changes.iter().map(|change| change.lines_added).sum(),
            lines_removed: changes.iter().map(|change| change.lines_removed).sum(),
            baseline_ref: baseline_ref.to_string(),
            final_ref: final_ref.to_string(),
            branch: branch.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathOrigin {
    Tracked,
    Untracked,
    /// Present at the baseline, dropped from the index, still on disk.
    Unindexed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct DiffStats {
    added: u64,
    removed: u64,
    binary: bool,
}

pub struct ChangeCaptureEngine<'a> {
    runner: &'a dyn ProcessRunner,
    excluded_dirs: Vec<String>,
}

impl<'a> ChangeCaptureEngine<'a> {
    pub fn new(runner: &'a dyn ProcessRunner) -> Self {
        Self {
            runner,
            excluded_dirs: Vec::new(),
        }
    }

    /// Skips everything under `dir` (relative to the working-tree root).
    pub fn exclude_dir(mut self, dir: impl Into<String>) -> Self {
        let dir = dir.into().trim_matches('/').to_string();
        if !dir.is_empty() {
            self.excluded_dirs.push(dir);
        }
        self
    }

    /// Returns one record per path that differs between `baseline_ref` and
    /// the current file-system state, sorted by path.
    pub fn capture(&self, cwd: &Path, baseline_ref: &str) -> Result<Vec<ChangeRecord>, SessionError> {
        let Some(root) = git::repo_root(self.runner, cwd)? else {
            return Err(SessionError::NotAVersionControlledTree {
                path: cwd.to_path_buf(),
            });
        };

        let untracked: BTreeSet<String> = self.untracked_files(&root)?.into_iter().collect();
        let mut paths: BTreeMap<String, (ChangeType, PathOrigin)> = BTreeMap::new();
        for (path, change_type) in self.tracked_changes(&root, baseline_ref)? {
            // git reports an index removal as a deletion even when the file
            // is still on disk; compare it against the live file instead.
            let on_disk = untracked.contains(&path)
                || fs::symlink_metadata(root.join(&path)).is_ok_and(|meta| !meta.is_dir());
            let entry = if change_type == ChangeType::Deleted && on_disk {
                (ChangeType::Modified, PathOrigin::Unindexed)
            } else {
                (change_type, PathOrigin::Tracked)
            };
            paths.insert(path, entry);
        }
        for path in untracked {
            paths
                .entry(path)
                .or_insert((ChangeType::Added, PathOrigin::Untracked));
        }
        paths.retain(|path, _| !self.is_excluded(path));

        let mut records = Vec::with_capacity(paths.len());
        for (path, (change_type, origin)) in paths {
            if let Some(record) = self.record(&root, baseline_ref, path, change_type, origin)? {
                records.push(record);
            }
        }
        debug!(baseline = baseline_ref, files = records.len(), "captured working tree changes");
        Ok(records)
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.excluded_dirs.iter().any(|dir| {
            path == dir
                || path
                    .strip_prefix(dir.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    fn tracked_changes(&self, root: &Path, baseline_ref: &str) -> Result<Vec<(String, ChangeType)>, GitError> {
        let args = ["diff", "--name-status", "--no-renames", "-z", baseline_ref, "--"];
        let output = self.runner.run(root, &args)?.ensure_success(&args)?;
        Ok(parse_name_status(&output.stdout_text()))
    }

    fn untracked_files(&self, root: &Path) -> Result<Vec<String>, GitError> {
        let args = ["ls-files", "--others", "--exclude-standard", "-z"];
        let output = self.runner.run(root, &args)?.ensure_success(&args)?;
        Ok(output
            .stdout_text()
            .split('\0')
            .filter(|path| !path.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn record(
        &self,
        root: &Path,
        baseline_ref: &str,
        path: String,
        change_type: ChangeType,
        origin: PathOrigin,
    ) -> Result<Option<ChangeRecord>, SessionError> {
        let mut warnings = Vec::new();

        let before = if change_type == ChangeType::Added {
            Vec::new()
        } else {
            match git::read_blob(self.runner, root, baseline_ref, &path) {
                Ok(bytes) => bytes,
                Err(GitError::CommandFailed { stderr, .. }) => {
                    warnings.push(format!("baseline content unavailable: {stderr}"));
                    Vec::new()
                }
                Err(err) => return Err(err.into()),
            }
        };

        let after = if change_type == ChangeType::Deleted {
            Vec::new()
        } else {
            match fs::read(root.join(&path)) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(
                        kind = "partial_capture",
                        path = %path,
                        error = %err,
                        "file unreadable, recording as deleted"
                    );
                    let reason = format!("unreadable in working tree ({err}); recorded as deleted");
                    warnings.push(reason);
                    return Ok(Some(unreadable_record(path, before, warnings)));
                }
            }
        };

        if origin == PathOrigin::Unindexed && before == after {
            debug!(path = %path, "unindexed file matches baseline, skipping");
            return Ok(None);
        }

        let diff = match origin {
            PathOrigin::Unindexed => self.content_diff(root, &path, &before)?,
            _ => self.unified_diff(root, baseline_ref, &path, origin)?,
        };
        let stats = count_diff_lines(&diff);
        let binary = stats.binary || is_binary(&before) || is_binary(&after);
        let (lines_added, lines_removed) = if binary {
            (0, 0)
        } else {
            (stats.added, stats.removed)
        };

        Ok(Some(ChangeRecord {
            language: if binary {
                BINARY.to_string()
            } else {
                infer_language(&path).to_string()
            },
            path,
            change_type,
            lines_added,
            lines_removed,
            binary,
            before: render_content(&before, binary),
            after: render_content(&after, binary),
            unified_diff: diff,
            warning: join_warnings(warnings),
        }))
    }

    fn unified_diff(
        &self,
        root: &Path,
        baseline_ref: &str,
        path: &str,
        origin: PathOrigin,
    ) -> Result<String, GitError> {
        match origin {
            PathOrigin::Tracked => {
                let args = ["diff", "--no-color", "--no-ext-diff", baseline_ref, "--", path];
                let output = self.runner.run(root, &args)?.ensure_success(&args)?;
                Ok(output.stdout_text())
            }
            PathOrigin::Untracked | PathOrigin::Unindexed => self.no_index_diff(root, "/dev/null", path),
        }
    }

    /// Diffs baseline content held in memory against the file at `path`.
    fn content_diff(&self, root: &Path, path: &str, before: &[u8]) -> Result<String, SessionError> {
        let mut baseline = tempfile::NamedTempFile::new()?;
        baseline.write_all(before)?;
        baseline.flush()?;
        let temp_path = baseline.path().to_string_lossy().to_string();
        let diff = self.no_index_diff(root, &temp_path, path)?;
        // Header lines name the temp file; point them at the real path.
        let temp_name = temp_path.trim_start_matches('/');
        let mut in_hunk = false;
        let lines: Vec<String> = diff
            .lines()
            .map(|line| {
                in_hunk |= line.starts_with("@@");
                if in_hunk {
                    line.to_string()
                } else {
                    line.replace(temp_name, path)
                }
            })
            .collect();
        let mut rendered = lines.join("\n");
        if diff.ends_with('\n') {
            rendered.push('\n');
        }
        Ok(rendered)
    }

    fn no_index_diff(&self, root: &Path, from: &str, to: &str) -> Result<String, GitError> {
        // --no-index exits 1 when the inputs differ.
        let args = ["diff", "--no-color", "--no-ext-diff", "--no-index", "--", from, to];
        let output = self.runner.run(root, &args)?;
        if matches!(output.code, Some(0) | Some(1)) {
            Ok(output.stdout_text())
        } else {
            Ok(output.ensure_success(&args)?.stdout_text())
        }
    }
}

fn unreadable_record(path: String, before: Vec<u8>, warnings: Vec<String>) -> ChangeRecord {
    let binary = is_binary(&before);
    let lines_removed = if binary { 0 } else { count_lines(&before) };
    ChangeRecord {
        language: if binary {
            BINARY.to_string()
        } else {
            infer_language(&path).to_string()
        },
        path,
        change_type: ChangeType::Deleted,
        lines_added: 0,
        lines_removed,
        binary,
        before: render_content(&before, binary),
        after: String::new(),
        unified_diff: String::new(),
        warning: join_warnings(warnings),
    }
}

fn join_warnings(warnings: Vec<String>) -> Option<String> {
    if warnings.is_empty() {
        None
    } else {
        Some(warnings.join("; "))
    }
}

/// Parses `git diff --name-status -z` output into `(path, change)` pairs.
fn parse_name_status(output: &str) -> Vec<(String, ChangeType)> {
    let mut fields = output.split('\0').filter(|field| !field.is_empty());
    let mut changes = Vec::new();
    while let Some(status) = fields.next() {
        let code = status.chars().next().unwrap_or('M');
        // Renames and copies carry a source and a destination path.
        if matches!(code, 'R' | 'C') {
            let source = fields.next();
            let Some(dest) = fields.next() else {
                break;
            };
            if code == 'R' {
                if let Some(source) = source {
                    changes.push((source.to_string(), ChangeType::Deleted));
                }
            }
            changes.push((dest.to_string(), ChangeType::Added));
            continue;
        }
        let Some(path) = fields.next() else {
            break;
        };
        let change = match code {
            'A' => ChangeType::Added,
            'D' => ChangeType::Deleted,
            _ => ChangeType::Modified,
        };
        changes.push((path.to_string(), change));
    }
    changes
}

/// Counts `+`/`-` lines inside hunks; file headers are skipped.
fn count_diff_lines(diff: &str) -> DiffStats {
    let mut stats = DiffStats::default();
    let mut in_hunk = false;
    for line in diff.lines() {
        if line.starts_with("diff --git ") {
            in_hunk = false;
            continue;
        }
        if line.starts_with("Binary files ") || line == "GIT binary patch" {
            stats.binary = true;
            continue;
        }
        if line.starts_with("@@") {
            in_hunk = true;
            continue;
        }
        if !in_hunk {
            continue;
        }
        if line.starts_with('+') {
            stats.added += 1;
        } else if line.starts_with('-') {
            stats.removed += 1;
        }
    }
    stats
}

fn is_binary(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(BINARY_SNIFF_LEN)];
    head.contains(&0) || std::str::from_utf8(bytes).is_err()
}

fn count_lines(bytes: &[u8]) -> u64 {
    String::from_utf8_lossy(bytes).lines().count() as u64
}

fn render_content(bytes: &[u8], binary: bool) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    if binary {
        return format!("<binary {} bytes>", bytes.len());
    }
    String::from_utf8_lossy(bytes).to_string()
}
