//! Filesystem persistence for sessions, circuit state, and bounded history
//! logs, keyed by (project, agent).
//!
//! Layout under the base directory:
//! `sessions/<project>.<agent>.json`, `circuits/<project>.<agent>.json`,
//! `history/sessions/<project>.<agent>.json`,
//! `history/circuits/<project>.<agent>.json`. Every write goes through a
//! temp file and rename so readers never observe a torn file.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::models::{CircuitHistoryEntry, CircuitState, Session, SessionHistoryEntry};

/// Entries kept per history log; older entries are discarded.
pub const MAX_HISTORY_ENTRIES: usize = 50;

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("no parent directory for {:?}", path))?;
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating {:?}", parent))?;

    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json)
        .await
        .with_context(|| format!("writing {:?}", tmp))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming {:?} into place", tmp))?;
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => {
            let value = serde_json::from_str(&json)
                .with_context(|| format!("malformed JSON in {:?}", path))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {:?}", path)),
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {:?}", path)),
    }
}

fn key_file(dir: &Path, project: &str, agent: &str) -> PathBuf {
    dir.join(format!("{}.{}.json", project, agent))
}

/// Durable store for [`Session`] and [`CircuitState`] records.
#[derive(Debug, Clone)]
pub struct SessionStore {
    base_dir: PathBuf,
}

impl SessionStore {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
        }
    }

    fn sessions_dir(&self) -> PathBuf {
        self.base_dir.join("sessions")
    }

    fn circuits_dir(&self) -> PathBuf {
        self.base_dir.join("circuits")
    }

    pub async fn load_session(&self, project: &str, agent: &str) -> Result<Option<Session>> {
        read_json(&key_file(&self.sessions_dir(), project, agent)).await
    }

    /// Load a session, deleting it when older than `ttl_hours`. Returns
    /// `(session, expired)`; an expired session comes back as `(None, true)`
    /// without an error.
    pub async fn load_session_with_expiration(
        &self,
        project: &str,
        agent: &str,
        ttl_hours: i64,
    ) -> Result<(Option<Session>, bool)> {
        let Some(session) = self.load_session(project, agent).await? else {
            return Ok((None, false));
        };
        if ttl_hours > 0 && Utc::now() - session.updated_at > Duration::hours(ttl_hours) {
            debug!(
                "session for {}/{} expired (last updated {})",
                project, agent, session.updated_at
            );
            self.delete_session(project, agent).await?;
            return Ok((None, true));
        }
        Ok((Some(session), false))
    }

    pub async fn save_session(&self, session: &Session) -> Result<()> {
        let path = key_file(&self.sessions_dir(), &session.project, &session.agent);
        write_json_atomic(&path, session).await
    }

    pub async fn delete_session(&self, project: &str, agent: &str) -> Result<()> {
        remove_if_exists(&key_file(&self.sessions_dir(), project, agent)).await
    }

    /// All parseable sessions for a project; malformed files are skipped.
    pub async fn list_sessions(&self, project: &str) -> Result<Vec<Session>> {
        let dir = self.sessions_dir();
        let mut sessions = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sessions),
            Err(e) => return Err(e).with_context(|| format!("reading {:?}", dir)),
        };

        let prefix = format!("{}.", project);
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(&prefix) || !name.ends_with(".json") {
                continue;
            }
            match read_json::<Session>(&entry.path()).await {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(e) => debug!("skipping unreadable session file {:?}: {:#}", entry.path(), e),
            }
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    pub async fn load_circuit_state(
        &self,
        project: &str,
        agent: &str,
    ) -> Result<Option<CircuitState>> {
        read_json(&key_file(&self.circuits_dir(), project, agent)).await
    }

    pub async fn save_circuit_state(
        &self,
        project: &str,
        agent: &str,
        state: &CircuitState,
    ) -> Result<()> {
        write_json_atomic(&key_file(&self.circuits_dir(), project, agent), state).await
    }

    pub async fn delete_circuit_state(&self, project: &str, agent: &str) -> Result<()> {
        remove_if_exists(&key_file(&self.circuits_dir(), project, agent)).await
    }
}

/// Best-effort append-and-trim event logs for sessions and circuits.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    base_dir: PathBuf,
}

impl HistoryStore {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
        }
    }

    fn session_history_dir(&self) -> PathBuf {
        self.base_dir.join("history").join("sessions")
    }

    fn circuit_history_dir(&self) -> PathBuf {
        self.base_dir.join("history").join("circuits")
    }

    pub async fn add_session_entry(
        &self,
        project: &str,
        agent: &str,
        entry: SessionHistoryEntry,
    ) -> Result<()> {
        let path = key_file(&self.session_history_dir(), project, agent);
        append_trimmed(&path, entry).await
    }

    pub async fn add_circuit_entry(
        &self,
        project: &str,
        agent: &str,
        entry: CircuitHistoryEntry,
    ) -> Result<()> {
        let path = key_file(&self.circuit_history_dir(), project, agent);
        append_trimmed(&path, entry).await
    }

    pub async fn session_history(
        &self,
        project: &str,
        agent: &str,
    ) -> Result<Vec<SessionHistoryEntry>> {
        Ok(read_json(&key_file(&self.session_history_dir(), project, agent))
            .await?
            .unwrap_or_default())
    }

    pub async fn circuit_history(
        &self,
        project: &str,
        agent: &str,
    ) -> Result<Vec<CircuitHistoryEntry>> {
        Ok(read_json(&key_file(&self.circuit_history_dir(), project, agent))
            .await?
            .unwrap_or_default())
    }
}

async fn append_trimmed<T: Serialize + DeserializeOwned>(path: &Path, entry: T) -> Result<()> {
    // History is telemetry: a malformed existing log is replaced rather
    // than treated as fatal.
    let mut entries: Vec<T> = match read_json(path).await {
        Ok(existing) => existing.unwrap_or_default(),
        Err(e) => {
            warn!("resetting unreadable history file {:?}: {:#}", path, e);
            Vec::new()
        }
    };
    entries.push(entry);
    if entries.len() > MAX_HISTORY_ENTRIES {
        let excess = entries.len() - MAX_HISTORY_ENTRIES;
        entries.drain(..excess);
    }
    write_json_atomic(path, &entries).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionStatus;
    use tempfile::TempDir;

    fn sample_session(project: &str, agent: &str) -> Session {
        Session::new(project, agent, Path::new("/tmp/work"), "build the thing")
    }

    #[tokio::test]
    async fn session_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let store = SessionStore::new(dir.path());

        let mut session = sample_session("proj", "agent");
        session.loops_completed = 4;
        store.save_session(&session).await.expect("save");

        let loaded = store
            .load_session("proj", "agent")
            .await
            .expect("load")
            .expect("present");
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.loops_completed, 4);
        assert_eq!(loaded.status, SessionStatus::Running);

        store.delete_session("proj", "agent").await.expect("delete");
        assert!(store.load_session("proj", "agent").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn missing_session_is_none_not_error() {
        let dir = TempDir::new().expect("tempdir");
        let store = SessionStore::new(dir.path());
        assert!(store.load_session("nope", "agent").await.expect("load").is_none());
        // Deleting something absent is also fine.
        store.delete_session("nope", "agent").await.expect("delete");
    }

    #[tokio::test]
    async fn malformed_session_file_errors() {
        let dir = TempDir::new().expect("tempdir");
        let store = SessionStore::new(dir.path());
        let sessions_dir = dir.path().join("sessions");
        std::fs::create_dir_all(&sessions_dir).expect("mkdir");
        std::fs::write(sessions_dir.join("proj.agent.json"), "{ not json").expect("write");

        assert!(store.load_session("proj", "agent").await.is_err());
    }

    #[tokio::test]
    async fn expired_session_is_deleted_and_reported() {
        let dir = TempDir::new().expect("tempdir");
        let store = SessionStore::new(dir.path());

        let mut session = sample_session("proj", "agent");
        session.updated_at = Utc::now() - Duration::hours(48);
        store.save_session(&session).await.expect("save");

        let (loaded, expired) = store
            .load_session_with_expiration("proj", "agent", 24)
            .await
            .expect("load");
        assert!(loaded.is_none());
        assert!(expired);

        // The file is gone afterwards.
        assert!(store.load_session("proj", "agent").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn fresh_session_survives_expiration_check() {
        let dir = TempDir::new().expect("tempdir");
        let store = SessionStore::new(dir.path());
        store.save_session(&sample_session("proj", "agent")).await.expect("save");

        let (loaded, expired) = store
            .load_session_with_expiration("proj", "agent", 24)
            .await
            .expect("load");
        assert!(loaded.is_some());
        assert!(!expired);
    }

    #[tokio::test]
    async fn list_sessions_filters_by_project_and_skips_malformed() {
        let dir = TempDir::new().expect("tempdir");
        let store = SessionStore::new(dir.path());

        store.save_session(&sample_session("alpha", "a1")).await.expect("save");
        store.save_session(&sample_session("alpha", "a2")).await.expect("save");
        store.save_session(&sample_session("beta", "b1")).await.expect("save");
        std::fs::write(dir.path().join("sessions/alpha.broken.json"), "garbage").expect("write");

        let sessions = store.list_sessions("alpha").await.expect("list");
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().all(|s| s.project == "alpha"));
    }

    #[tokio::test]
    async fn circuit_state_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let store = SessionStore::new(dir.path());

        let state = CircuitState {
            tripped: true,
            trip_reason: "stagnation: no progress for 3 consecutive loops".to_string(),
            no_progress_count: 3,
            tripped_at: Some(Utc::now()),
            updated_at: Utc::now(),
        };
        store
            .save_circuit_state("proj", "agent", &state)
            .await
            .expect("save");

        let loaded = store
            .load_circuit_state("proj", "agent")
            .await
            .expect("load")
            .expect("present");
        assert!(loaded.tripped);
        assert_eq!(loaded.trip_reason, state.trip_reason);

        store.delete_circuit_state("proj", "agent").await.expect("delete");
        assert!(store
            .load_circuit_state("proj", "agent")
            .await
            .expect("load")
            .is_none());
    }

    #[tokio::test]
    async fn history_is_trimmed_to_the_newest_fifty() {
        let dir = TempDir::new().expect("tempdir");
        let history = HistoryStore::new(dir.path());

        for i in 0..60 {
            history
                .add_session_entry(
                    "proj",
                    "agent",
                    SessionHistoryEntry {
                        timestamp: Utc::now(),
                        event: format!("loop_{}", i),
                        loop_count: i,
                        status: "running".to_string(),
                        error: None,
                    },
                )
                .await
                .expect("append");
        }

        let entries = history.session_history("proj", "agent").await.expect("read");
        assert_eq!(entries.len(), MAX_HISTORY_ENTRIES);
        assert_eq!(entries.first().map(|e| e.event.as_str()), Some("loop_10"));
        assert_eq!(entries.last().map(|e| e.event.as_str()), Some("loop_59"));
    }

    #[tokio::test]
    async fn circuit_history_appends() {
        let dir = TempDir::new().expect("tempdir");
        let history = HistoryStore::new(dir.path());

        history
            .add_circuit_entry(
                "proj",
                "agent",
                CircuitHistoryEntry {
                    timestamp: Utc::now(),
                    from_state: "closed".to_string(),
                    to_state: "tripped".to_string(),
                    reason: "same error repeated 5 times".to_string(),
                    no_progress_count: 0,
                    same_error_count: 5,
                    test_loop_count: 0,
                    completion_count: 0,
                },
            )
            .await
            .expect("append");

        let entries = history.circuit_history("proj", "agent").await.expect("read");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].to_state, "tripped");
    }
}
