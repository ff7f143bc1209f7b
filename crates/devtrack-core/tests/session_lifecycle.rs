use std::fs;
use std::path::Path;
use std::process::Command;

use devtrack_core::config::SessionSettings;
use devtrack_core::file_backend::FileBackend;
use devtrack_core::process::GitRunner;
use devtrack_core::session::WorkSession;
use devtrack_core::SessionError;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

fn run_git(repo: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(args)
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

const TASKS: &str = r#"
- id: T-1
  title: Add login form
  status: todo
- id: T-2
  title: Wire session API
  status: todo
  dependencies: [T-1]
- id: T-3
  title: Spec-driven page
  status: todo
  spec_id: S-1
"#;

const SPECS: &str = r#"
- id: S-1
  title: Dashboard
  document: specs/dashboard.md
  pages: []
  endpoints: []
  schemas:
    - name: widgets
  navigation_flow: home -> dashboard
  main_task_id: T-3
  subtasks:
    - id: T-3
      dependencies: []
"#;

struct Fixture {
    repo: TempDir,
    head: String,
}

impl Fixture {
    fn new() -> Self {
        let repo = TempDir::new().expect("repo");
        run_git(repo.path(), &["init", "-q"]);
        run_git(repo.path(), &["symbolic-ref", "HEAD", "refs/heads/main"]);
        run_git(repo.path(), &["config", "user.name", "Devtrack Test"]);
        run_git(repo.path(), &["config", "user.email", "devtrack-test@example.com"]);
        run_git(repo.path(), &["config", "commit.gpgsign", "false"]);
        fs::write(repo.path().join("a.ts"), "export const a = 1;\n").expect("a.ts");
        run_git(repo.path(), &["add", "-A"]);
        run_git(repo.path(), &["commit", "-q", "-m", "seed"]);
        let head = run_git(repo.path(), &["rev-parse", "HEAD"]);

        let backend_dir = repo.path().join(".devtrack").join("backend");
        fs::create_dir_all(&backend_dir).expect("backend dir");
        fs::write(backend_dir.join("tasks.yaml"), TASKS).expect("tasks");
        fs::write(backend_dir.join("specs.yaml"), SPECS).expect("specs");
        Self { repo, head }
    }

    fn root(&self) -> &Path {
        self.repo.path()
    }

    fn session(&self) -> WorkSession {
        let settings = SessionSettings::default();
        let backend = FileBackend::new(
            settings.state_dir_path(self.root()).join("backend"),
            settings.done_status.clone(),
        );
        let runner = GitRunner::new().expect("git");
        WorkSession::new(self.root(), settings, Box::new(runner), Box::new(backend))
    }
}

#[test]
fn start_edit_complete_round_trip() {
    let fixture = Fixture::new();
    let session = fixture.session();

    let started = session.start("T-1", "agent-7").expect("start");
    assert!(!started.resumed);
    assert_eq!(started.marker.baseline_ref, fixture.head);
    assert_eq!(started.marker.branch, "main");
    assert_eq!(started.marker.session_identity, "agent-7");
    assert!(session.markers().path().is_file());

    fs::write(fixture.root().join("a.ts"), "export const a = 2;\nexport const z = 0;\n").expect("edit");
    fs::write(fixture.root().join("b.ts"), "export const b = 1;\n").expect("new");

    let outcome = session
        .complete("T-1", "agent-7", Some("login form"))
        .expect("complete");
    assert_eq!(outcome.summary.files_changed, 2);
    assert_eq!(outcome.summary.lines_added, 3);
    assert_eq!(outcome.summary.lines_removed, 1);
    assert_eq!(outcome.summary.baseline_ref, fixture.head);
    assert_eq!(outcome.summary.final_ref, fixture.head);
    assert_eq!(outcome.fingerprint.len(), 64);
    assert!(session.markers().read().expect("read").is_none());

    let reference = outcome.backend_reference.expect("reference");
    let stored = fixture
        .root()
        .join(".devtrack/backend/submissions")
        .join(&reference);
    let submission: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(stored).expect("submission")).expect("json");
    assert_eq!(submission["task_id"], "T-1");
    assert_eq!(submission["summary_text"], "login form");
    assert_eq!(submission["changes"].as_array().map(Vec::len), Some(2));

    // T-1 is now done, so T-2 is unblocked.
    assert!(session.readiness("T-2").ready);

    let actions: Vec<_> = session
        .history(10)
        .expect("history")
        .into_iter()
        .map(|event| event.action)
        .collect();
    assert_eq!(actions, vec!["start", "complete"]);
}

#[test]
fn repeated_start_keeps_baseline() {
    let fixture = Fixture::new();
    let session = fixture.session();
    let first = session.start("T-1", "ctx").expect("start");

    fs::write(fixture.root().join("c.ts"), "export const c = 1;\n").expect("c.ts");
    run_git(fixture.root(), &["add", "c.ts"]);
    run_git(fixture.root(), &["commit", "-q", "-m", "more"]);

    let second = session.start("T-1", "ctx").expect("idempotent start");
    assert!(second.resumed);
    assert_eq!(second.marker.baseline_ref, first.marker.baseline_ref);
    assert_eq!(second.marker.started_at, first.marker.started_at);
    assert_eq!(
        session.markers().read().expect("read").expect("marker").baseline_ref,
        fixture.head
    );
}

#[test]
fn foreign_identity_sees_stale_session_and_marker_survives() {
    let fixture = Fixture::new();
    let session = fixture.session();
    session.start("T-1", "identity-a").expect("start");
    fs::write(fixture.root().join("a.ts"), "changed\n").expect("edit");
    let before = fs::read_to_string(session.markers().path()).expect("marker");

    let err = session
        .complete("T-1", "identity-b", None)
        .expect_err("stale");
    match &err {
        SessionError::StaleSession { task_id, marker_path } => {
            assert_eq!(task_id, "T-1");
            assert_eq!(marker_path, session.markers().path());
        }
        other => panic!("expected stale session, got {other:?}"),
    }
    assert!(err.to_string().contains("T-1"));
    assert!(matches!(
        session.cancel("T-1", "identity-b"),
        Err(SessionError::StaleSession { .. })
    ));
    assert!(matches!(
        session.start("T-1", "identity-b"),
        Err(SessionError::SessionAlreadyActive { .. })
    ));
    assert_eq!(fs::read_to_string(session.markers().path()).expect("marker"), before);
}

#[test]
fn complete_without_edits_fails_and_keeps_session() {
    let fixture = Fixture::new();
    let session = fixture.session();
    session.start("T-1", "ctx").expect("start");

    let err = session.complete("T-1", "ctx", None).expect_err("no changes");
    assert!(matches!(err, SessionError::NoChangesDetected { .. }));
    assert!(session.markers().read().expect("read").is_some());
}

#[test]
fn lifecycle_errors_for_missing_and_mismatched_sessions() {
    let fixture = Fixture::new();
    let session = fixture.session();
    assert!(matches!(
        session.complete("T-1", "ctx", None),
        Err(SessionError::NoActiveSession { .. })
    ));
    assert!(matches!(
        session.cancel("T-1", "ctx"),
        Err(SessionError::NoActiveSession { .. })
    ));

    session.start("T-1", "ctx").expect("start");
    let err = session.cancel("T-2", "ctx").expect_err("mismatch");
    match err {
        SessionError::TaskMismatch {
            active_task_id,
            requested_task_id,
        } => {
            assert_eq!(active_task_id, "T-1");
            assert_eq!(requested_task_id, "T-2");
        }
        other => panic!("expected task mismatch, got {other:?}"),
    }

    let canceled = session.cancel("T-1", "ctx").expect("cancel");
    assert_eq!(canceled.task_id, "T-1");
    assert!(session.markers().read().expect("read").is_none());
}

#[test]
fn not_ready_start_creates_no_marker() {
    let fixture = Fixture::new();
    let session = fixture.session();

    let err = session.start("T-2", "ctx").expect_err("blocked");
    match err {
        SessionError::NotReady { blockers, .. } => {
            assert_eq!(blockers.len(), 1);
            assert!(blockers[0].contains("Add login form"));
        }
        other => panic!("expected not ready, got {other:?}"),
    }

    let err = session.start("T-3", "ctx").expect_err("spec incomplete");
    match err {
        SessionError::NotReady {
            missing_artifacts, ..
        } => {
            assert!(missing_artifacts.contains(&"pages".to_string()));
            assert!(missing_artifacts.contains(&"endpoints".to_string()));
        }
        other => panic!("expected not ready, got {other:?}"),
    }
    assert!(session.markers().read().expect("read").is_none());
}

#[test]
fn missing_catalog_degrades_readiness_and_defers_to_backend() {
    let fixture = Fixture::new();
    fs::remove_file(fixture.root().join(".devtrack/backend/tasks.yaml")).expect("remove catalog");
    let session = fixture.session();

    let started = session.start("T-9", "ctx").expect("degraded start");
    assert!(started.readiness.degraded);
    assert!(started.readiness.ready);

    fs::write(fixture.root().join("a.ts"), "export const a = 3;\n").expect("edit");
    let outcome = session.complete("T-9", "ctx", None).expect("complete");
    assert!(outcome.progress.is_none());
    assert!(outcome
        .warnings
        .iter()
        .any(|warning| warning.contains("progress not updated")));
}

#[test]
fn state_dir_outside_a_repository_is_rejected() {
    let dir = TempDir::new().expect("dir");
    let runner = GitRunner::new().expect("git");
    let err = devtrack_core::session::resolve_root(&runner, dir.path()).expect_err("no repo");
    assert!(matches!(err, SessionError::NotAVersionControlledTree { .. }));
}
