//! Process-wide registry of conversation sessions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::error::Error;
use crate::llm::ChatBackend;
use crate::session::ConversationSession;

/// Opaque session identifier, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared handle to a session. Holding its lock means owning the current turn.
pub type SessionHandle = Arc<Mutex<ConversationSession>>;

/// Creates and resolves sessions. Ids are assigned monotonically from 1.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    next_id: AtomicU64,
    backend: Arc<dyn ChatBackend>,
}

impl SessionRegistry {
    /// Creates an empty registry whose sessions talk to `backend`.
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            backend,
        }
    }

    /// Allocates a new session and returns its id.
    pub async fn create(&self, model: &str, system_prompt: &str) -> SessionId {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let session = ConversationSession::new(id, model, system_prompt, Arc::clone(&self.backend));
        self.sessions
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(session)));
        info!(session_id = %id, model = %model, "Session created");
        id
    }

    /// Looks up a session.
    pub async fn get(&self, id: SessionId) -> Result<SessionHandle, Error> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::SessionNotFound(id))
    }

    /// Returns the number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Returns true if no session has been created.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
