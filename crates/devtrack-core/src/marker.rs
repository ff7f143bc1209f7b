use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::atomic::write_json_atomic;
use crate::error::SessionError;

pub const MARKER_FILE: &str = "session.json";

/// The one active work session for a working tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMarker {
    pub task_id: String,
    pub baseline_ref: String,
    pub branch: String,
    /// Opaque token from the invoking context; only ever compared.
    pub session_identity: String,
    /// RFC3339 timestamp
    pub started_at: String,
}

impl SessionMarker {
    pub fn is_stale_for(&self, identity: &str) -> bool {
        self.session_identity != identity
    }
}

/// Reads and replaces the marker file. Writes always go through a temp file
/// and a rename; the marker is never edited in place.
#[derive(Debug, Clone)]
pub struct MarkerStore {
    path: PathBuf,
}

impl MarkerStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(MARKER_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<Option<SessionMarker>, SessionError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)?;
        let marker: SessionMarker = serde_json::from_str(&raw)?;
        Ok(Some(marker))
    }

    /// Writes `marker`, refusing to clobber a marker owned by another identity.
    pub fn create(&self, marker: &SessionMarker) -> Result<(), SessionError> {
        if let Some(existing) = self.read()? {
            if existing.is_stale_for(&marker.session_identity) {
                return Err(SessionError::SessionAlreadyActive {
                    active_task_id: existing.task_id,
                    requested_task_id: marker.task_id.clone(),
                    started_at: existing.started_at,
                });
            }
        }
        write_json_atomic(&self.path, marker)?;
        debug!(path = %self.path.display(), task_id = %marker.task_id, "wrote session marker");
        Ok(())
    }

    /// Removes the marker. Returns false when there was nothing to remove.
    pub fn delete(&self) -> Result<bool, SessionError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "removed session marker");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Returns the marker owned by `identity`.
    ///
    /// A marker written by any other identity is stale for this caller and
    /// must be cleaned up manually; it is never inherited.
    pub fn active_for(&self, identity: &str) -> Result<SessionMarker, SessionError> {
        let Some(marker) = self.read()? else {
            return Err(SessionError::NoActiveSession {
                marker_path: self.path.clone(),
            });
        };
        if marker.is_stale_for(identity) {
            return Err(SessionError::StaleSession {
                task_id: marker.task_id,
                marker_path: self.path.clone(),
            });
        }
        Ok(marker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn marker(task_id: &str, identity: &str, baseline: &str) -> SessionMarker {
        SessionMarker {
            task_id: task_id.to_string(),
            baseline_ref: baseline.to_string(),
            branch: "feature/login".to_string(),
            session_identity: identity.to_string(),
            started_at: "2026-01-05T09:30:00+00:00".to_string(),
        }
    }

    #[test]
    fn round_trips_opaque_identity() {
        let temp = TempDir::new().expect("tempdir");
        let store = MarkerStore::new(&temp.path().join(".devtrack"));
        let original = marker("T-1", "ctx:\"42\" \n/ünïcode", "c0ffee");
        store.create(&original).expect("create");
        assert_eq!(store.read().expect("read"), Some(original));
    }

    #[test]
    fn create_rejects_foreign_identity_and_keeps_marker() {
        let temp = TempDir::new().expect("tempdir");
        let store = MarkerStore::new(temp.path());
        store.create(&marker("T-1", "alpha", "c0")).expect("create");

        let err = store
            .create(&marker("T-2", "beta", "c1"))
            .expect_err("conflict");
        match err {
            SessionError::SessionAlreadyActive {
                active_task_id,
                requested_task_id,
                ..
            } => {
                assert_eq!(active_task_id, "T-1");
                assert_eq!(requested_task_id, "T-2");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.read().expect("read").expect("marker").baseline_ref, "c0");
    }

    #[test]
    fn create_with_same_identity_overwrites() {
        let temp = TempDir::new().expect("tempdir");
        let store = MarkerStore::new(temp.path());
        store.create(&marker("T-1", "alpha", "c0")).expect("create");
        store.create(&marker("T-1", "alpha", "c1")).expect("overwrite");
        assert_eq!(store.read().expect("read").expect("marker").baseline_ref, "c1");
    }

    #[test]
    fn active_for_distinguishes_missing_and_stale() {
        let temp = TempDir::new().expect("tempdir");
        let store = MarkerStore::new(temp.path());
        assert!(matches!(
            store.active_for("alpha"),
            Err(SessionError::NoActiveSession { .. })
        ));

        store.create(&marker("T-9", "alpha", "c0")).expect("create");
        match store.active_for("beta") {
            Err(SessionError::StaleSession { task_id, marker_path }) => {
                assert_eq!(task_id, "T-9");
                assert_eq!(marker_path, store.path());
            }
            other => panic!("expected stale session, got {other:?}"),
        }
        assert_eq!(store.active_for("alpha").expect("active").task_id, "T-9");
    }

    #[test]
    fn delete_is_idempotent() {
        let temp = TempDir::new().expect("tempdir");
        let store = MarkerStore::new(temp.path());
        store.create(&marker("T-1", "alpha", "c0")).expect("create");
        assert!(store.delete().expect("delete"));
        assert!(!store.delete().expect("second delete"));
        assert_eq!(store.read().expect("read"), None);
    }

    #[test]
    fn corrupt_marker_is_a_parse_error() {
        let temp = TempDir::new().expect("tempdir");
        let store = MarkerStore::new(temp.path());
        fs::write(store.path(), "{\"task_id\": ").expect("write");
        assert!(matches!(store.read(), Err(SessionError::Parse(_))));
    }
}
