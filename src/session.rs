//! Per-client conversation state.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Error;
use crate::llm::{ChatBackend, ChatOptions, ChatRequest};
use crate::registry::SessionId;

/// Author of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A client's conversation history bound to one model.
pub struct ConversationSession {
    id: SessionId,
    model: String,
    turns: Vec<Turn>,
    backend: Arc<dyn ChatBackend>,
}

impl ConversationSession {
    /// Creates a session; an empty `system_prompt` adds no system turn.
    pub fn new(
        id: SessionId,
        model: impl Into<String>,
        system_prompt: &str,
        backend: Arc<dyn ChatBackend>,
    ) -> Self {
        let mut turns = Vec::new();
        if !system_prompt.is_empty() {
            turns.push(Turn::new(Role::System, system_prompt));
        }
        Self {
            id,
            model: model.into(),
            turns,
            backend,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Full history, oldest first.
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Appends `user_message`, calls the backend with the whole history and
    /// appends the accumulated reply.
    ///
    /// Blocks until the backend finishes. On failure the user turn stays in
    /// the history and no assistant turn is added.
    pub fn chat(&mut self, user_message: &str) -> Result<String, Error> {
        self.turns.push(Turn::new(Role::User, user_message));

        let request = ChatRequest {
            model: &self.model,
            messages: &self.turns,
            options: ChatOptions::default(),
        };
        let mut reply = String::new();
        let mut fragments = 0usize;
        let result = self.backend.chat(&request, &mut |fragment: &str| {
            fragments += 1;
            reply.push_str(fragment);
        });

        if let Err(e) = result {
            warn!(session_id = %self.id, error = %e, "Model call failed");
            return Err(match e {
                Error::BackendUnavailable(_) => e,
                other => Error::BackendUnavailable(other.to_string()),
            });
        }

        debug!(session_id = %self.id, fragments = fragments, chars = reply.len(), "Model reply");
        self.turns.push(Turn::new(Role::Assistant, reply.clone()));
        Ok(reply)
    }
}
