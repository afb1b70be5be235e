//! Pluggable persistence for the current session.
//!
//! Three backends: process-lifetime memory, session-scoped (temp-dir file,
//! gone after the OS session), and durable (caller-chosen path). The
//! backends are single-writer-per-instance; coordination with other
//! processes writing the same path is out of scope.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::auth::types::AuthSession;
use crate::error::{ErrorCode, OrbError, OrbResult};

/// Persistence boundary for the current session.
///
/// Contract: `get_tokens` after `set_tokens(s)` returns a value deep-equal
/// to `s`; a corrupt or unreadable stored value reads as `None`, never an
/// error; `clear_tokens` never fails (it runs unconditionally on sign-out
/// and refresh-failure paths).
#[async_trait]
pub trait TokenStorage: Send + Sync {
    /// Persist the session, replacing any previous one.
    async fn set_tokens(&self, session: &AuthSession) -> OrbResult<()>;

    /// Read back the persisted session, if any.
    async fn get_tokens(&self) -> Option<AuthSession>;

    /// Remove the persisted session. Infallible by signature.
    async fn clear_tokens(&self);
}

/// In-memory storage scoped to the owning instance.
#[derive(Debug, Default)]
pub struct MemoryTokenStorage {
    inner: RwLock<Option<AuthSession>>,
}

impl MemoryTokenStorage {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStorage for MemoryTokenStorage {
    async fn set_tokens(&self, session: &AuthSession) -> OrbResult<()> {
        *self.inner.write().await = Some(session.clone());
        Ok(())
    }

    async fn get_tokens(&self) -> Option<AuthSession> {
        self.inner.read().await.clone()
    }

    async fn clear_tokens(&self) {
        *self.inner.write().await = None;
    }
}

/// Serialized payload written by the file-backed stores.
#[derive(Debug, Serialize, Deserialize)]
struct StoredSession {
    session: AuthSession,
    stored_at: DateTime<Utc>,
}

async fn write_session(path: &Path, session: &AuthSession) -> OrbResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            storage_unavailable("failed to create token storage directory").with_cause(e.to_string())
        })?;
    }

    let payload = StoredSession {
        session: session.clone(),
        stored_at: Utc::now(),
    };
    let bytes = serde_json::to_vec(&payload).map_err(|e| {
        storage_unavailable("failed to serialize session payload").with_cause(e.to_string())
    })?;

    tokio::fs::write(path, bytes).await.map_err(|e| {
        storage_unavailable("failed to write session payload").with_cause(e.to_string())
    })?;

    debug!(path = %path.display(), "Session persisted");
    Ok(())
}

async fn read_session(path: &Path) -> Option<AuthSession> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            // Unavailable backend reads as empty.
            debug!(path = %path.display(), error = %e, "Token storage unreadable");
            return None;
        }
    };

    match serde_json::from_slice::<StoredSession>(&bytes) {
        Ok(payload) => Some(payload.session),
        Err(e) => {
            // Corrupt payloads are treated as "no tokens", not surfaced.
            debug!(path = %path.display(), error = %e, "Stored session is corrupt, ignoring");
            None
        }
    }
}

async fn remove_session(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Session cleared from storage"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            // clear_tokens must never fail, even on an unavailable backend.
            warn!(path = %path.display(), error = %e, "Failed to clear session file");
        }
    }
}

fn storage_unavailable(message: &str) -> OrbError {
    OrbError::Service {
        code: ErrorCode::ServiceUnavailable,
        message: message.to_string(),
        retry_after: None,
        suggestion: Some("check that the storage location is writable".to_string()),
        cause: None,
    }
}

/// Session-scoped storage: a file under the OS temp directory.
///
/// Survives a process restart within one OS session; typically gone after
/// the session ends. An unavailable temp directory reads as empty.
#[derive(Debug)]
pub struct SessionTokenStorage {
    path: PathBuf,
}

impl SessionTokenStorage {
    /// Create a session-scoped store keyed by `namespace`.
    pub fn new(namespace: &str) -> Self {
        let path = std::env::temp_dir()
            .join("orb-auth")
            .join(format!("{}.session.json", namespace));
        Self { path }
    }
}

#[async_trait]
impl TokenStorage for SessionTokenStorage {
    async fn set_tokens(&self, session: &AuthSession) -> OrbResult<()> {
        write_session(&self.path, session).await
    }

    async fn get_tokens(&self) -> Option<AuthSession> {
        read_session(&self.path).await
    }

    async fn clear_tokens(&self) {
        remove_session(&self.path).await
    }
}

/// Durable cross-restart storage at a caller-chosen path.
#[derive(Debug)]
pub struct FileTokenStorage {
    path: PathBuf,
}

impl FileTokenStorage {
    /// Create a durable store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TokenStorage for FileTokenStorage {
    async fn set_tokens(&self, session: &AuthSession) -> OrbResult<()> {
        write_session(&self.path, session).await
    }

    async fn get_tokens(&self) -> Option<AuthSession> {
        read_session(&self.path).await
    }

    async fn clear_tokens(&self) {
        remove_session(&self.path).await
    }
}
