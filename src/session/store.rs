//! Session persistence backends
//!
//! The file backend writes each blob via temp file + atomic rename so a
//! crash never leaves partial state, serializes writes per session id,
//! and validates ids against path traversal before they touch the
//! filesystem. The in-memory backend backs tests and ephemeral runs.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{Checkpoint, ExecutionState, Session, SessionId, SessionStatus};
use crate::error::CoreError;

/// Durable storage for sessions and their checkpoints
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create and persist a fresh session
    async fn create_session(&self, agent_name: &str, input: &Value) -> Result<Session, CoreError>;

    /// Persist the latest execution state
    async fn save_state(&self, id: &SessionId, state: &ExecutionState) -> Result<(), CoreError>;

    /// Append a checkpoint to the ordered list
    async fn append_checkpoint(
        &self,
        id: &SessionId,
        checkpoint: &Checkpoint,
    ) -> Result<(), CoreError>;

    /// Load a session with its checkpoints
    async fn load_session(&self, id: &SessionId) -> Result<Session, CoreError>;

    /// Ids of an agent's sessions, in id (creation) order
    async fn list_sessions(&self, agent_name: &str) -> Result<Vec<SessionId>, CoreError>;

    /// Update the session status
    async fn set_status(&self, id: &SessionId, status: SessionStatus) -> Result<(), CoreError>;

    /// Drop every checkpoint after the given one and return it
    ///
    /// Used by recovery; the returned checkpoint becomes the new tail.
    async fn truncate_checkpoints_after(
        &self,
        id: &SessionId,
        checkpoint_id: &str,
    ) -> Result<Checkpoint, CoreError>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Ephemeral session store for tests and single-process runs
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: std::sync::RwLock<HashMap<SessionId, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F, T>(&self, id: &SessionId, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&mut Session) -> T,
    {
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| CoreError::SessionNotFound { id: id.to_string() })?;
        session.updated_at = chrono::Utc::now();
        Ok(f(session))
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, agent_name: &str, input: &Value) -> Result<Session, CoreError> {
        let session = Session::new(agent_name, input.clone());
        self.sessions
            .write()
            .expect("session lock poisoned")
            .insert(session.session_id.clone(), session.clone());
        Ok(session)
    }

    async fn save_state(&self, id: &SessionId, state: &ExecutionState) -> Result<(), CoreError> {
        self.update(id, |session| session.execution_state = state.clone())
    }

    async fn append_checkpoint(
        &self,
        id: &SessionId,
        checkpoint: &Checkpoint,
    ) -> Result<(), CoreError> {
        self.update(id, |session| session.checkpoints.push(checkpoint.clone()))
    }

    async fn load_session(&self, id: &SessionId) -> Result<Session, CoreError> {
        self.sessions
            .read()
            .expect("session lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::SessionNotFound { id: id.to_string() })
    }

    async fn list_sessions(&self, agent_name: &str) -> Result<Vec<SessionId>, CoreError> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .read()
            .expect("session lock poisoned")
            .values()
            .filter(|s| s.agent_name == agent_name)
            .map(|s| s.session_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn set_status(&self, id: &SessionId, status: SessionStatus) -> Result<(), CoreError> {
        self.update(id, |session| session.status = status)
    }

    async fn truncate_checkpoints_after(
        &self,
        id: &SessionId,
        checkpoint_id: &str,
    ) -> Result<Checkpoint, CoreError> {
        self.update(id, |session| {
            let position = session
                .checkpoints
                .iter()
                .position(|c| c.id == checkpoint_id);
            position.map(|position| {
                session.checkpoints.truncate(position + 1);
                session.checkpoints[position].clone()
            })
        })?
        .ok_or_else(|| {
            CoreError::storage(format!(
                "checkpoint '{checkpoint_id}' not found in session '{id}'"
            ))
        })
    }
}

// ---------------------------------------------------------------------------
// File backend
// ---------------------------------------------------------------------------

/// File-backed session store
///
/// Layout: `{base}/{session_id}/session.json` holds the envelope and
/// latest state; `{base}/{session_id}/checkpoints.json` holds the ordered
/// checkpoint list.
pub struct FileSessionStore {
    base_path: PathBuf,
    /// Per-session write gates so state and checkpoint writes never
    /// interleave at the byte level
    write_locks: Mutex<HashMap<SessionId, Arc<Mutex<()>>>>,
}

impl FileSessionStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn write_lock(&self, id: &SessionId) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().await;
        locks.entry(id.clone()).or_default().clone()
    }

    fn session_dir(&self, id: &SessionId) -> Result<PathBuf, CoreError> {
        validate_storage_key(id.as_str())?;
        Ok(self.base_path.join(id.as_str()))
    }

    fn session_path(&self, id: &SessionId) -> Result<PathBuf, CoreError> {
        Ok(self.session_dir(id)?.join("session.json"))
    }

    fn checkpoints_path(&self, id: &SessionId) -> Result<PathBuf, CoreError> {
        Ok(self.session_dir(id)?.join("checkpoints.json"))
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), CoreError> {
        let parent = path
            .parent()
            .ok_or_else(|| CoreError::storage("path has no parent"))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CoreError::storage_with_source("failed to create session dir", e))?;

        let tmp = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| CoreError::storage_with_source("failed to create temp file", e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| CoreError::storage_with_source("failed to write temp file", e))?;
        file.sync_all()
            .await
            .map_err(|e| CoreError::storage_with_source("failed to sync temp file", e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| CoreError::storage_with_source("failed to rename temp file", e))?;
        Ok(())
    }

    async fn read_session_envelope(&self, id: &SessionId) -> Result<Session, CoreError> {
        let path = self.session_path(id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::SessionNotFound { id: id.to_string() });
            }
            Err(e) => return Err(CoreError::storage_with_source("failed to read session", e)),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::storage_with_source("session blob is not valid JSON", e))
    }

    async fn read_checkpoints(&self, id: &SessionId) -> Result<Vec<Checkpoint>, CoreError> {
        let path = self.checkpoints_path(id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                CoreError::storage_with_source("checkpoint blob is not valid JSON", e)
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(CoreError::storage_with_source(
                "failed to read checkpoints",
                e,
            )),
        }
    }

    async fn write_session_envelope(&self, session: &Session) -> Result<(), CoreError> {
        // Checkpoints live in their own blob; keep the envelope small
        let mut envelope = session.clone();
        envelope.checkpoints.clear();
        let bytes = serde_json::to_vec_pretty(&envelope)?;
        self.write_atomic(&self.session_path(&session.session_id)?, &bytes)
            .await
    }

    async fn write_checkpoints(
        &self,
        id: &SessionId,
        checkpoints: &[Checkpoint],
    ) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec_pretty(checkpoints)?;
        self.write_atomic(&self.checkpoints_path(id)?, &bytes).await
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn create_session(&self, agent_name: &str, input: &Value) -> Result<Session, CoreError> {
        let session = Session::new(agent_name, input.clone());
        let gate = self.write_lock(&session.session_id).await;
        let _guard = gate.lock().await;
        self.write_session_envelope(&session).await?;
        Ok(session)
    }

    async fn save_state(&self, id: &SessionId, state: &ExecutionState) -> Result<(), CoreError> {
        let gate = self.write_lock(id).await;
        let _guard = gate.lock().await;
        let mut session = self.read_session_envelope(id).await?;
        session.execution_state = state.clone();
        session.updated_at = chrono::Utc::now();
        self.write_session_envelope(&session).await
    }

    async fn append_checkpoint(
        &self,
        id: &SessionId,
        checkpoint: &Checkpoint,
    ) -> Result<(), CoreError> {
        let gate = self.write_lock(id).await;
        let _guard = gate.lock().await;
        // Ensure the session exists before appending
        self.read_session_envelope(id).await?;
        let mut checkpoints = self.read_checkpoints(id).await?;
        checkpoints.push(checkpoint.clone());
        self.write_checkpoints(id, &checkpoints).await
    }

    async fn load_session(&self, id: &SessionId) -> Result<Session, CoreError> {
        let mut session = self.read_session_envelope(id).await?;
        session.checkpoints = self.read_checkpoints(id).await?;
        Ok(session)
    }

    async fn list_sessions(&self, agent_name: &str) -> Result<Vec<SessionId>, CoreError> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CoreError::storage_with_source("failed to list sessions", e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CoreError::storage_with_source("failed to read dir entry", e))?
        {
            let Some(name) = entry.file_name().to_str().map(|s| s.to_string()) else {
                continue;
            };
            let id = SessionId::from(name);
            if let Ok(session) = self.read_session_envelope(&id).await {
                if session.agent_name == agent_name {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn set_status(&self, id: &SessionId, status: SessionStatus) -> Result<(), CoreError> {
        let gate = self.write_lock(id).await;
        let _guard = gate.lock().await;
        let mut session = self.read_session_envelope(id).await?;
        session.status = status;
        session.updated_at = chrono::Utc::now();
        self.write_session_envelope(&session).await
    }

    async fn truncate_checkpoints_after(
        &self,
        id: &SessionId,
        checkpoint_id: &str,
    ) -> Result<Checkpoint, CoreError> {
        let gate = self.write_lock(id).await;
        let _guard = gate.lock().await;
        let mut checkpoints = self.read_checkpoints(id).await?;
        let position = checkpoints
            .iter()
            .position(|c| c.id == checkpoint_id)
            .ok_or_else(|| {
                CoreError::storage(format!(
                    "checkpoint '{checkpoint_id}' not found in session '{id}'"
                ))
            })?;
        checkpoints.truncate(position + 1);
        self.write_checkpoints(id, &checkpoints).await?;
        Ok(checkpoints[position].clone())
    }
}

/// Reject keys that could escape the storage root
fn validate_storage_key(key: &str) -> Result<(), CoreError> {
    if key.trim().is_empty() {
        return Err(CoreError::storage("storage key cannot be empty"));
    }
    if key.contains('/') || key.contains('\\') {
        return Err(CoreError::storage(format!(
            "invalid storage key '{key}': path separators not allowed"
        )));
    }
    if key.contains("..") || key.starts_with('.') {
        return Err(CoreError::storage(format!(
            "invalid storage key '{key}': path traversal detected"
        )));
    }
    if key.contains('\0') {
        return Err(CoreError::storage("invalid storage key: null byte"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CheckpointKind;
    use serde_json::json;
    use tempfile::tempdir;

    async fn exercise_store(store: &dyn SessionStore) {
        let session = store
            .create_session("agent", &json!({"topic": "rust"}))
            .await
            .unwrap();
        let id = session.session_id.clone();

        // save_state round-trips
        let mut state = session.execution_state.clone();
        state.record_visit(&"intake".into());
        store.save_state(&id, &state).await.unwrap();
        let loaded = store.load_session(&id).await.unwrap();
        assert_eq!(loaded.execution_state.visits(&"intake".into()), 1);
        assert_eq!(loaded.execution_state.memory, state.memory);

        // checkpoints append in order
        let cp1 = Checkpoint::new(CheckpointKind::NodeEntry, state.clone());
        let cp2 = Checkpoint::new(CheckpointKind::NodeComplete, state.clone());
        store.append_checkpoint(&id, &cp1).await.unwrap();
        store.append_checkpoint(&id, &cp2).await.unwrap();
        let loaded = store.load_session(&id).await.unwrap();
        assert_eq!(loaded.checkpoints.len(), 2);
        assert_eq!(loaded.checkpoints[0].id, cp1.id);

        // truncate drops everything after the target
        let rewound = store
            .truncate_checkpoints_after(&id, &cp1.id)
            .await
            .unwrap();
        assert_eq!(rewound.id, cp1.id);
        let loaded = store.load_session(&id).await.unwrap();
        assert_eq!(loaded.checkpoints.len(), 1);

        // status updates persist
        store.set_status(&id, SessionStatus::Paused).await.unwrap();
        let loaded = store.load_session(&id).await.unwrap();
        assert_eq!(loaded.status, SessionStatus::Paused);

        // listing is per agent
        let ids = store.list_sessions("agent").await.unwrap();
        assert!(ids.contains(&id));
        assert!(store.list_sessions("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_contract() {
        exercise_store(&MemorySessionStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_store_contract() {
        let dir = tempdir().unwrap();
        exercise_store(&FileSessionStore::new(dir.path())).await;
    }

    #[tokio::test]
    async fn test_missing_session_errors() {
        let store = MemorySessionStore::new();
        let err = store.load_session(&"nope".into()).await.unwrap_err();
        assert!(matches!(err, CoreError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_file_store_atomic_write_leaves_no_temp() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let session = store.create_session("agent", &json!(null)).await.unwrap();

        let session_dir = dir.path().join(session.session_id.as_str());
        assert!(session_dir.join("session.json").exists());
        assert!(!session_dir.join("session.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_rejects_traversal_keys() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        for bad in ["../escape", "a/b", "..", ".hidden"] {
            let err = store.load_session(&bad.into()).await.unwrap_err();
            assert!(matches!(err, CoreError::StorageFailure { .. }), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_list_sessions_sorted_by_creation() {
        let store = MemorySessionStore::new();
        let first = store.create_session("agent", &json!(null)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(3)).await;
        let second = store.create_session("agent", &json!(null)).await.unwrap();

        let ids = store.list_sessions("agent").await.unwrap();
        assert_eq!(ids, vec![first.session_id, second.session_id]);
    }
}
