//! Work-session tracking over a git working tree.
//!
//! A session records a baseline commit when work on a task starts and, on
//! completion, captures every change since that baseline (uncommitted edits
//! included) and hands the result to a task-tracking backend.

pub mod atomic;
pub mod audit;
pub mod backend;
pub mod baseline;
pub mod capture;
pub mod config;
pub mod error;
pub mod file_backend;
pub mod git;
pub mod language;
pub mod marker;
pub mod process;
pub mod progress;
pub mod readiness;
pub mod session;

pub use error::SessionError;
