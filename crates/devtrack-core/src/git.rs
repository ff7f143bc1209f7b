//! Read-only git probes used by baseline resolution and change capture.
//!
//! Every helper maps "git answered no" (non-zero exit) to `Ok(None)` and
//! reserves `Err` for failures to run git at all.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::process::{GitError, ProcessRunner};

fn probe(runner: &dyn ProcessRunner, cwd: &Path, args: &[&str]) -> Result<Option<String>, GitError> {
    let output = runner.run(cwd, args)?;
    if !output.success() {
        return Ok(None);
    }
    let text = output.trimmed();
    if text.is_empty() {
        Ok(None)
    } else {
        Ok(Some(text))
    }
}

/// Returns the top-level directory of the working tree containing `cwd`.
pub fn repo_root(runner: &dyn ProcessRunner, cwd: &Path) -> Result<Option<PathBuf>, GitError> {
    let root = probe(runner, cwd, &["rev-parse", "--show-toplevel"])?;
    Ok(root.map(PathBuf::from))
}

/// Returns the checked-out branch name, or `None` on a detached HEAD.
pub fn current_branch(runner: &dyn ProcessRunner, root: &Path) -> Result<Option<String>, GitError> {
    let branch = probe(runner, root, &["rev-parse", "--abbrev-ref", "HEAD"])?;
    Ok(branch.filter(|name| name != "HEAD"))
}

pub fn head_sha(runner: &dyn ProcessRunner, root: &Path) -> Result<Option<String>, GitError> {
    probe(runner, root, &["rev-parse", "--verify", "--quiet", "HEAD^{commit}"])
}

/// Resolves `reference` to a commit id if it exists.
pub fn verify_commit(
    runner: &dyn ProcessRunner,
    root: &Path,
    reference: &str,
) -> Result<Option<String>, GitError> {
    let spec = format!("{reference}^{{commit}}");
    probe(runner, root, &["rev-parse", "--verify", "--quiet", &spec])
}

pub fn merge_base(
    runner: &dyn ProcessRunner,
    root: &Path,
    left: &str,
    right: &str,
) -> Result<Option<String>, GitError> {
    probe(runner, root, &["merge-base", left, right])
}

/// Reads `refs/remotes/<remote>/HEAD`, e.g. `refs/remotes/origin/main`.
pub fn remote_head_ref(
    runner: &dyn ProcessRunner,
    root: &Path,
    remote: &str,
) -> Result<Option<String>, GitError> {
    let symbolic = format!("refs/remotes/{remote}/HEAD");
    probe(runner, root, &["symbolic-ref", "--quiet", &symbolic])
}

/// Returns the oldest parentless commit reachable from HEAD.
pub fn root_commit(runner: &dyn ProcessRunner, root: &Path) -> Result<Option<String>, GitError> {
    let roots = probe(runner, root, &["rev-list", "--max-parents=0", "HEAD"])?;
    Ok(roots.and_then(|text| text.lines().last().map(|line| line.trim().to_string())))
}

pub fn commit_count(runner: &dyn ProcessRunner, root: &Path) -> Result<Option<u64>, GitError> {
    let count = probe(runner, root, &["rev-list", "--count", "HEAD"])?;
    Ok(count.and_then(|value| value.parse::<u64>().ok()))
}

/// Reads the blob for `path` as recorded in `reference`.
pub fn read_blob(
    runner: &dyn ProcessRunner,
    root: &Path,
    reference: &str,
    path: &str,
) -> Result<Vec<u8>, GitError> {
    let object = format!("{reference}:{path}");
    let args = ["cat-file", "blob", object.as_str()];
    let output = runner.run(root, &args)?.ensure_success(&args)?;
    debug!(reference, path, bytes = output.stdout.len(), "read baseline blob");
    Ok(output.stdout)
}
