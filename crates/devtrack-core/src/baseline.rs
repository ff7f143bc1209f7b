use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SessionSettings;
use crate::error::SessionError;
use crate::git;
use crate::process::ProcessRunner;

/// Which probe produced the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineSource {
    RemoteMergeBase,
    LocalMergeBase,
    RootCommit,
    Head,
}

impl BaselineSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            BaselineSource::RemoteMergeBase => "remote_merge_base",
            BaselineSource::LocalMergeBase => "local_merge_base",
            BaselineSource::RootCommit => "root_commit",
            BaselineSource::Head => "head",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Baseline {
    pub root: PathBuf,
    pub reference: String,
    /// Branch name, or `HEAD` when detached.
    pub branch: String,
    pub source: BaselineSource,
}

pub struct BaselineResolver<'a> {
    runner: &'a dyn ProcessRunner,
    settings: &'a SessionSettings,
}

impl<'a> BaselineResolver<'a> {
    pub fn new(runner: &'a dyn ProcessRunner, settings: &'a SessionSettings) -> Self {
        Self { runner, settings }
    }

    /// Finds the commit that represents where work on `cwd` began.
    ///
    /// Probes in order: merge-base with the remote default branch, merge-base
    /// with a local default branch, the root commit reachable from HEAD, and
    /// HEAD itself for a single-commit history. All probes are read-only.
    pub fn resolve(&self, cwd: &Path) -> Result<Baseline, SessionError> {
        let Some(root) = git::repo_root(self.runner, cwd)? else {
            return Err(SessionError::NotAVersionControlledTree {
                path: cwd.to_path_buf(),
            });
        };
        let branch = git::current_branch(self.runner, &root)?.unwrap_or_else(|| "HEAD".to_string());
        if git::head_sha(self.runner, &root)?.is_none() {
            return Err(SessionError::NoBaseline {
                path: root,
                reason: "repository has no commits".to_string(),
            });
        }

        let found = match self.remote_merge_base(&root)? {
            Some(reference) => Some((reference, BaselineSource::RemoteMergeBase)),
            None => match self.local_merge_base(&root)? {
                Some(reference) => Some((reference, BaselineSource::LocalMergeBase)),
                None => match git::root_commit(self.runner, &root)? {
                    Some(reference) => Some((reference, BaselineSource::RootCommit)),
                    None => self.single_commit_head(&root)?,
                },
            },
        };

        let Some((reference, source)) = found else {
            return Err(SessionError::NoBaseline {
                path: root,
                reason: "no merge-base, root commit or HEAD could be resolved".to_string(),
            });
        };
        debug!(reference = %reference, branch = %branch, source = source.as_str(), "resolved baseline");
        Ok(Baseline {
            root,
            reference,
            branch,
            source,
        })
    }

    fn remote_merge_base(&self, root: &Path) -> Result<Option<String>, SessionError> {
        let remote = self.settings.remote.as_str();
        let mut candidates = Vec::new();
        if let Some(head_ref) = git::remote_head_ref(self.runner, root, remote)? {
            candidates.push(head_ref);
        }
        for branch in &self.settings.default_branches {
            let candidate = format!("refs/remotes/{remote}/{branch}");
            if !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }
        for candidate in candidates {
            if git::verify_commit(self.runner, root, &candidate)?.is_none() {
                continue;
            }
            if let Some(base) = git::merge_base(self.runner, root, "HEAD", &candidate)? {
                debug!(candidate = %candidate, "remote default branch merge-base found");
                return Ok(Some(base));
            }
        }
        Ok(None)
    }

    fn local_merge_base(&self, root: &Path) -> Result<Option<String>, SessionError> {
        for branch in &self.settings.default_branches {
            let candidate = format!("refs/heads/{branch}");
            if let Some(base) = git::merge_base(self.runner, root, "HEAD", &candidate)? {
                debug!(candidate = %candidate, "local default branch merge-base found");
                return Ok(Some(base));
            }
        }
        Ok(None)
    }

    fn single_commit_head(&self, root: &Path) -> Result<Option<(String, BaselineSource)>, SessionError> {
        if git::commit_count(self.runner, root)? != Some(1) {
            return Ok(None);
        }
        Ok(git::head_sha(self.runner, root)?.map(|sha| (sha, BaselineSource::Head)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::scripted::ScriptedRunner;
    use pretty_assertions::assert_eq;

    fn repo() -> ScriptedRunner {
        ScriptedRunner::default()
            .ok("rev-parse --show-toplevel", "/repo\n")
            .ok("rev-parse --abbrev-ref HEAD", "feature/login\n")
            .ok("rev-parse --verify --quiet HEAD^{commit}", "head000\n")
    }

    #[test]
    fn outside_a_repository_is_reported() {
        let runner = ScriptedRunner::default().fail("rev-parse --show-toplevel", 128);
        let settings = SessionSettings::default();
        let err = BaselineResolver::new(&runner, &settings)
            .resolve(Path::new("/tmp/plain"))
            .expect_err("not a repo");
        assert!(matches!(err, SessionError::NotAVersionControlledTree { .. }));
    }

    #[test]
    fn prefers_remote_default_branch_merge_base() {
        let runner = repo()
            .ok("symbolic-ref --quiet refs/remotes/origin/HEAD", "refs/remotes/origin/main\n")
            .ok("rev-parse --verify --quiet refs/remotes/origin/main^{commit}", "remote01\n")
            .ok("merge-base HEAD refs/remotes/origin/main", "base0001\n")
            .ok("merge-base HEAD refs/heads/main", "local001\n");
        let settings = SessionSettings::default();
        let baseline = BaselineResolver::new(&runner, &settings)
            .resolve(Path::new("/repo/src"))
            .expect("baseline");
        assert_eq!(baseline.reference, "base0001");
        assert_eq!(baseline.branch, "feature/login");
        assert_eq!(baseline.root, PathBuf::from("/repo"));
        assert_eq!(baseline.source, BaselineSource::RemoteMergeBase);
    }

    #[test]
    fn falls_back_to_local_default_branch() {
        let runner = repo()
            .fail("merge-base HEAD refs/heads/main", 1)
            .ok("merge-base HEAD refs/heads/master", "local002\n");
        let settings = SessionSettings::default();
        let baseline = BaselineResolver::new(&runner, &settings)
            .resolve(Path::new("/repo"))
            .expect("baseline");
        assert_eq!(baseline.reference, "local002");
        assert_eq!(baseline.source, BaselineSource::LocalMergeBase);
        assert!(runner
            .calls
            .borrow()
            .iter()
            .any(|call| call == "merge-base HEAD refs/heads/main"));
    }

    #[test]
    fn falls_back_to_root_commit_then_head() {
        let runner = repo().ok("rev-list --max-parents=0 HEAD", "root0001\n");
        let settings = SessionSettings::default();
        let baseline = BaselineResolver::new(&runner, &settings)
            .resolve(Path::new("/repo"))
            .expect("baseline");
        assert_eq!(baseline.reference, "root0001");
        assert_eq!(baseline.source, BaselineSource::RootCommit);

        let runner = repo().ok("rev-list --count HEAD", "1\n");
        let baseline = BaselineResolver::new(&runner, &settings)
            .resolve(Path::new("/repo"))
            .expect("baseline");
        assert_eq!(baseline.reference, "head000");
        assert_eq!(baseline.source, BaselineSource::Head);
    }

    #[test]
    fn empty_repository_has_no_baseline() {
        let runner = ScriptedRunner::default()
            .ok("rev-parse --show-toplevel", "/repo\n")
            .fail("rev-parse --abbrev-ref HEAD", 128)
            .fail("rev-parse --verify --quiet HEAD^{commit}", 1);
        let settings = SessionSettings::default();
        let err = BaselineResolver::new(&runner, &settings)
            .resolve(Path::new("/repo"))
            .expect_err("no commits");
        assert!(matches!(err, SessionError::NoBaseline { .. }));
    }

    #[test]
    fn configured_remote_and_branch_are_probed() {
        let runner = repo()
            .ok("rev-parse --verify --quiet refs/remotes/upstream/trunk^{commit}", "up0001\n")
            .ok("merge-base HEAD refs/remotes/upstream/trunk", "base0002\n");
        let settings = SessionSettings {
            remote: "upstream".to_string(),
            default_branches: vec!["trunk".to_string()],
            ..SessionSettings::default()
        };
        let baseline = BaselineResolver::new(&runner, &settings)
            .resolve(Path::new("/repo"))
            .expect("baseline");
        assert_eq!(baseline.reference, "base0002");
    }
}
