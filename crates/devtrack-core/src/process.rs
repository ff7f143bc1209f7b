use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git executable not found in PATH")]
    GitNotInstalled,
    #[error("Failed to run git: {0}")]
    Io(#[from] std::io::Error),
    #[error("git {args} failed (exit {code:?}): {stderr}")]
    CommandFailed {
        args: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Captured result of one subprocess invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn trimmed(&self) -> String {
        self.stdout_text().trim().to_string()
    }

    /// Converts a non-zero exit into `GitError::CommandFailed`.
    pub fn ensure_success(self, args: &[&str]) -> Result<ProcessOutput, GitError> {
        if self.success() {
            return Ok(self);
        }
        Err(GitError::CommandFailed {
            args: shell_words::join(args),
            code: self.code,
            stderr: self.stderr,
        })
    }
}

/// Executes version-control subcommands in a working directory.
///
/// Implementations only fail when the process cannot be spawned. A non-zero
/// exit status is reported through `ProcessOutput::code`; callers decide
/// what it means.
pub trait ProcessRunner {
    fn run(&self, cwd: &Path, args: &[&str]) -> Result<ProcessOutput, GitError>;
}

/// Runs the `git` binary found on `PATH`.
#[derive(Debug, Clone)]
pub struct GitRunner {
    program: PathBuf,
}

impl GitRunner {
    pub fn new() -> Result<Self, GitError> {
        let program = which::which("git").map_err(|_| GitError::GitNotInstalled)?;
        Ok(Self { program })
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl ProcessRunner for GitRunner {
    fn run(&self, cwd: &Path, args: &[&str]) -> Result<ProcessOutput, GitError> {
        trace!(
            cwd = %cwd.display(),
            cmd = %format!("git {}", shell_words::join(args)),
            "running git command"
        );

        let output = Command::new(&self.program)
            .arg("-C")
            .arg(cwd)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("LC_ALL", "C")
            .output()
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    GitError::GitNotInstalled
                } else {
                    GitError::Io(err)
                }
            })?;

        Ok(ProcessOutput {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
