//! Session persistence and rejoin after a restart
//!
//! Accepted sessions are written to a [`SessionStore`] and removed when they
//! end. After a restart the [`RecoveryCoordinator`] turns every persisted
//! accepted session without a live controller into a rejoin-eligible entry,
//! which the user can rejoin or decline.

use crate::types::{CallId, CallSession, CallStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

/// Session store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persistent storage of call sessions
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// All stored sessions
    async fn load(&self) -> Result<Vec<CallSession>, StoreError>;

    /// Insert or replace a session
    async fn save(&self, session: &CallSession) -> Result<(), StoreError>;

    /// Delete a session; missing entries are not an error
    async fn remove(&self, call_id: &CallId) -> Result<(), StoreError>;
}

/// Store kept in memory, surviving only as long as the value
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<CallId, CallSession>>,
}

impl MemorySessionStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self) -> Result<Vec<CallSession>, StoreError> {
        Ok(self.sessions.read().await.values().cloned().collect())
    }

    async fn save(&self, session: &CallSession) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .insert(session.call_id.clone(), session.clone());
        Ok(())
    }

    async fn remove(&self, call_id: &CallId) -> Result<(), StoreError> {
        self.sessions.write().await.remove(call_id);
        Ok(())
    }
}

/// Store writing every session into one JSON file
pub struct FileSessionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSessionStore {
    /// Use the file at `path`, created on first save
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<CallSession>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, sessions: &[CallSession]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_vec_pretty(sessions)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self) -> Result<Vec<CallSession>, StoreError> {
        let _guard = self.lock.lock().await;
        self.read_all().await
    }

    async fn save(&self, session: &CallSession) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut sessions = self.read_all().await?;
        sessions.retain(|s| s.call_id != session.call_id);
        sessions.push(session.clone());
        self.write_all(&sessions).await
    }

    async fn remove(&self, call_id: &CallId) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut sessions = self.read_all().await?;
        let before = sessions.len();
        sessions.retain(|s| &s.call_id != call_id);
        if sessions.len() != before {
            self.write_all(&sessions).await?;
        }
        Ok(())
    }
}

/// Tracks rejoin-eligible sessions on top of a [`SessionStore`]
pub struct RecoveryCoordinator {
    store: std::sync::Arc<dyn SessionStore>,
    eligible: RwLock<HashMap<CallId, CallSession>>,
}

impl RecoveryCoordinator {
    /// Create a coordinator over `store`
    #[must_use]
    pub fn new(store: std::sync::Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            eligible: RwLock::new(HashMap::new()),
        }
    }

    /// Load the store and flag accepted sessions that have no live controller
    ///
    /// Persisted sessions that are not accepted are stale and get removed.
    /// Returns the sessions that became eligible.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read
    #[tracing::instrument(skip_all)]
    pub async fn scan(
        &self,
        is_live: impl Fn(&CallId) -> bool + Send,
    ) -> Result<Vec<CallSession>, StoreError> {
        let sessions = self.store.load().await?;
        let mut found = Vec::new();
        let mut eligible = self.eligible.write().await;
        for session in sessions {
            if session.status != CallStatus::Accepted {
                tracing::debug!(call_id = %session.call_id, status = ?session.status, "Removing stale persisted session");
                self.forget(&session.call_id).await;
                continue;
            }
            if is_live(&session.call_id) || eligible.contains_key(&session.call_id) {
                continue;
            }
            tracing::info!(call_id = %session.call_id, chat_id = %session.chat_id, "Session eligible for rejoin");
            eligible.insert(session.call_id.clone(), session.clone());
            found.push(session);
        }
        Ok(found)
    }

    /// Whether `call_id` can be rejoined
    pub async fn is_eligible(&self, call_id: &CallId) -> bool {
        self.eligible.read().await.contains_key(call_id)
    }

    /// Every rejoin-eligible session
    pub async fn eligible(&self) -> Vec<CallSession> {
        self.eligible.read().await.values().cloned().collect()
    }

    /// Take an eligible session out for rejoining
    pub async fn take(&self, call_id: &CallId) -> Option<CallSession> {
        self.eligible.write().await.remove(call_id)
    }

    /// Put a session back after a failed rejoin
    pub async fn restore(&self, session: CallSession) {
        self.eligible
            .write()
            .await
            .insert(session.call_id.clone(), session);
    }

    /// Drop an eligible session locally and from the store
    ///
    /// Returns whether the session was eligible.
    pub async fn clear(&self, call_id: &CallId) -> bool {
        let removed = self.eligible.write().await.remove(call_id).is_some();
        if removed {
            self.forget(call_id).await;
        }
        removed
    }

    /// Persist a live session, logging failures
    pub async fn persist(&self, session: &CallSession) {
        if let Err(e) = self.store.save(session).await {
            tracing::warn!(call_id = %session.call_id, error = %e, "Failed to persist session");
        }
    }

    /// Delete a session from the store, logging failures
    pub async fn forget(&self, call_id: &CallId) {
        if let Err(e) = self.store.remove(call_id).await {
            tracing::warn!(call_id = %call_id, error = %e, "Failed to remove persisted session");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{CallType, ChatId, UserId};
    use std::sync::Arc;

    fn session(id: &str, status: CallStatus) -> CallSession {
        let mut s = CallSession::new(
            CallId::new(id),
            ChatId::new("chat"),
            CallType::Audio,
            UserId::new("alice"),
            [UserId::new("bob")],
        );
        if status == CallStatus::Accepted {
            s.mark_accepted();
        } else {
            s.status = status;
        }
        s
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("nested").join("sessions.json"));

        assert!(store.load().await.unwrap().is_empty());
        store.save(&session("c1", CallStatus::Accepted)).await.unwrap();
        store.save(&session("c2", CallStatus::Accepted)).await.unwrap();
        store.save(&session("c1", CallStatus::Accepted)).await.unwrap();
        assert_eq!(store.load().await.unwrap().len(), 2);

        store.remove(&CallId::new("c1")).await.unwrap();
        store.remove(&CallId::new("missing")).await.unwrap();
        let left = store.load().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].call_id, CallId::new("c2"));
    }

    #[tokio::test]
    async fn test_scan_flags_accepted_sessions_only() {
        let store = Arc::new(MemorySessionStore::new());
        store.save(&session("accepted", CallStatus::Accepted)).await.unwrap();
        store.save(&session("live", CallStatus::Accepted)).await.unwrap();
        store.save(&session("ringing", CallStatus::Ringing)).await.unwrap();
        let recovery = RecoveryCoordinator::new(store.clone());

        let found = recovery
            .scan(|id| id.as_str() == "live")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(recovery.is_eligible(&CallId::new("accepted")).await);
        assert!(!recovery.is_eligible(&CallId::new("live")).await);
        assert_eq!(store.load().await.unwrap().len(), 2);

        // once its controller is gone the live session becomes eligible too
        assert_eq!(recovery.scan(|_| false).await.unwrap().len(), 1);
        assert!(recovery.scan(|_| false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_removes_from_store() {
        let store = Arc::new(MemorySessionStore::new());
        store.save(&session("c1", CallStatus::Accepted)).await.unwrap();
        let recovery = RecoveryCoordinator::new(store.clone());
        recovery.scan(|_| false).await.unwrap();

        assert!(recovery.clear(&CallId::new("c1")).await);
        assert!(!recovery.clear(&CallId::new("c1")).await);
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_take_and_restore() {
        let store = Arc::new(MemorySessionStore::new());
        store.save(&session("c1", CallStatus::Accepted)).await.unwrap();
        let recovery = RecoveryCoordinator::new(store);
        recovery.scan(|_| false).await.unwrap();

        let taken = recovery.take(&CallId::new("c1")).await.unwrap();
        assert!(!recovery.is_eligible(&taken.call_id).await);
        recovery.restore(taken).await;
        assert_eq!(recovery.eligible().await.len(), 1);
    }
}
