use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use devtrack_core::config::SessionSettings;
use devtrack_core::file_backend::FileBackend;
use devtrack_core::process::GitRunner;
use devtrack_core::readiness::ReadinessReport;
use devtrack_core::session::{resolve_root, WorkSession};
use devtrack_core::SessionError;

mod logging;

#[derive(Parser)]
#[command(name = "devtrack", version, about = "Track task work sessions against a git baseline")]
struct Cli {
    /// Directory inside the working tree (defaults to the current directory)
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,
    /// Emit machine-readable JSON on stdout
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check readiness, record the baseline and open a session
    Start {
        #[arg(long)]
        task: String,
        #[arg(long, env = "DEVTRACK_SESSION_ID")]
        identity: String,
    },
    /// Capture changes since the baseline, submit them and close the session
    Complete {
        #[arg(long)]
        task: String,
        #[arg(long, env = "DEVTRACK_SESSION_ID")]
        identity: String,
        /// Free-form summary handed to the backend with the changes
        #[arg(long)]
        summary: Option<String>,
    },
    /// Close the session without capturing anything
    Cancel {
        #[arg(long)]
        task: String,
        #[arg(long, env = "DEVTRACK_SESSION_ID")]
        identity: String,
    },
    /// Show the active session marker
    Status {
        #[arg(long, env = "DEVTRACK_SESSION_ID")]
        identity: Option<String>,
    },
    /// Remove the session marker regardless of who owns it
    Clear,
    /// Report whether a task's artifacts and dependencies are in place
    Readiness {
        #[arg(long)]
        task: String,
    },
    /// Show tracked parent-task progress
    Progress {
        /// Drop entries that are complete and done first
        #[arg(long)]
        prune: bool,
    },
    /// Show recent session history
    Log {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();
    let json = cli.json;
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => report_error(&err, json),
    }
}

fn open_session(cwd: Option<PathBuf>) -> Result<WorkSession> {
    let cwd = match cwd {
        Some(cwd) => cwd,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let runner = GitRunner::new()?;
    let root = resolve_root(&runner, &cwd)?;
    let settings = SessionSettings::resolve(&root);
    let backend = FileBackend::new(
        settings.state_dir_path(&root).join("backend"),
        settings.done_status.clone(),
    );
    Ok(WorkSession::new(root, settings, Box::new(runner), Box::new(backend)))
}

fn run(cli: Cli) -> Result<()> {
    let session = open_session(cli.cwd)?;
    let json = cli.json;

    match cli.command {
        Command::Start { task, identity } => {
            let outcome = session.start(&task, &identity)?;
            if json {
                print_json(json!({"ok": true, "session": outcome}))?;
            } else {
                let verb = if outcome.resumed { "Resumed" } else { "Started" };
                println!(
                    "{verb} session for {} at baseline {} on {}",
                    outcome.marker.task_id, outcome.marker.baseline_ref, outcome.marker.branch
                );
                for warning in &outcome.readiness.warnings {
                    println!("warning: {warning}");
                }
            }
        }
        Command::Complete {
            task,
            identity,
            summary,
        } => {
            let outcome = session.complete(&task, &identity, summary.as_deref())?;
            if json {
                print_json(json!({"ok": true, "completion": outcome}))?;
            } else {
                let summary = &outcome.summary;
                println!(
                    "Completed {}: {} files changed, +{} -{} ({}..{})",
                    outcome.task_id,
                    summary.files_changed,
                    summary.lines_added,
                    summary.lines_removed,
                    short_ref(&summary.baseline_ref),
                    short_ref(&summary.final_ref)
                );
                for change in &outcome.changes {
                    println!(
                        "  {:<8} {} (+{} -{}) [{}]",
                        change.change_type.as_str(),
                        change.path,
                        change.lines_added,
                        change.lines_removed,
                        change.language
                    );
                }
                if let Some(entry) = &outcome.progress {
                    println!("Progress: {} {}%", entry.task_id, entry.completion_percent);
                }
                for warning in &outcome.warnings {
                    println!("warning: {warning}");
                }
            }
        }
        Command::Cancel { task, identity } => {
            let marker = session.cancel(&task, &identity)?;
            if json {
                print_json(json!({"ok": true, "canceled": marker}))?;
            } else {
                println!("Canceled session for {}", marker.task_id);
            }
        }
        Command::Status { identity } => {
            let status = session.status(identity.as_deref())?;
            if json {
                print_json(json!({"ok": true, "status": status}))?;
            } else {
                match &status.marker {
                    Some(marker) => {
                        println!(
                            "Active session: {} since {} (baseline {}, branch {})",
                            marker.task_id,
                            marker.started_at,
                            short_ref(&marker.baseline_ref),
                            marker.branch
                        );
                        if status.stale == Some(true) {
                            println!(
                                "Stale for this caller; run `devtrack clear` to remove {}",
                                status.marker_path.display()
                            );
                        }
                    }
                    None => println!("No active session"),
                }
                println!(
                    "State dir: {} ({})",
                    status.state_dir.display(),
                    status.state_dir_source.as_str()
                );
            }
        }
        Command::Clear => {
            let removed = session.discard_marker()?;
            if json {
                print_json(json!({"ok": true, "removed": removed}))?;
            } else {
                match removed {
                    Some(marker) => println!("Removed session marker for {}", marker.task_id),
                    None => println!("No session marker to remove"),
                }
            }
        }
        Command::Readiness { task } => {
            let report = session.readiness(&task);
            if json {
                print_json(json!({"ok": true, "readiness": report}))?;
            } else {
                print_readiness(&report);
            }
        }
        Command::Progress { prune } => {
            let pruned = if prune {
                Some(session.progress().prune_completed()?)
            } else {
                None
            };
            if json {
                let document = session.progress().load()?;
                print_json(json!({"ok": true, "pruned": pruned, "progress": document}))?;
            } else {
                if let Some(count) = pruned {
                    println!("Pruned {count} completed entries");
                }
                println!("{}", session.progress().summarize()?);
            }
        }
        Command::Log { limit } => {
            let events = session.history(limit)?;
            if json {
                print_json(json!({"ok": true, "events": events}))?;
            } else if events.is_empty() {
                println!("No session history");
            } else {
                for event in events {
                    println!(
                        "{} {:<8} {} {}",
                        event.timestamp,
                        event.action,
                        event.task_id.as_deref().unwrap_or("-"),
                        event.identity.as_deref().unwrap_or("-")
                    );
                }
            }
        }
    }
    Ok(())
}

fn print_readiness(report: &ReadinessReport) {
    let verdict = if report.ready { "ready" } else { "not ready" };
    println!("Task {} is {verdict}", report.task_id);
    for item in &report.checklist {
        let mark = if item.present { "x" } else { " " };
        println!("  [{mark}] {} ({})", item.category.as_str(), item.count);
    }
    for blocker in &report.blockers {
        println!("blocker: {blocker}");
    }
    for warning in &report.warnings {
        println!("warning: {warning}");
    }
}

fn print_json(value: serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Caller mistakes exit with 2, faults with 1.
fn report_error(err: &anyhow::Error, json: bool) -> ExitCode {
    let session_error = err.downcast_ref::<SessionError>();
    let kind = session_error.map(SessionError::kind).unwrap_or("internal");
    if json {
        let mut payload = json!({"ok": false, "error": kind, "message": format!("{err:#}")});
        if let Some(SessionError::NotReady {
            missing_artifacts,
            blockers,
            ..
        }) = session_error
        {
            payload["missing_artifacts"] = json!(missing_artifacts);
            payload["blockers"] = json!(blockers);
        }
        eprintln!("{payload}");
    } else {
        eprintln!("error: {err:#}");
    }
    if session_error.is_some_and(SessionError::is_caller_error) {
        ExitCode::from(2)
    } else {
        ExitCode::FAILURE
    }
}

fn short_ref(reference: &str) -> &str {
    reference.get(..12).unwrap_or(reference)
}
