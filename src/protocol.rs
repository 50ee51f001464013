//! Client-facing wire protocol.
//!
//! Requests are JSON objects tagged by `action`, events are tagged by `event`.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::registry::SessionId;

/// A request sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Omitted fields fall back to the relay's configured defaults.
    CreateSession {
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        system_prompt: Option<String>,
    },
    Chat {
        session_id: SessionId,
        message: String,
    },
}

/// An event sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    SessionCreated {
        session_id: SessionId,
    },
    TextResponse {
        content: String,
    },
    AudioChunk {
        /// Hex-encoded audio bytes.
        data: String,
        /// Container tag of the audio stream.
        format: String,
    },
    AudioDone,
    Error {
        message: String,
    },
}

impl ServerEvent {
    /// Builds an audio chunk event from raw bytes.
    pub fn audio_chunk(bytes: &[u8], format: &str) -> Self {
        ServerEvent::AudioChunk {
            data: hex::encode(bytes),
            format: format.to_string(),
        }
    }

    /// Builds an error event from any displayable error.
    pub fn error(err: impl std::fmt::Display) -> Self {
        ServerEvent::Error {
            message: err.to_string(),
        }
    }

    /// True for events that end a chat turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerEvent::AudioDone | ServerEvent::Error { .. })
    }
}

/// Parses one inbound text frame.
///
/// Unrecognized actions yield [`Error::UnknownAction`]; known actions with
/// bad fields yield [`Error::InvalidRequest`].
pub fn parse_request(text: &str) -> Result<ClientRequest, Error> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| Error::InvalidRequest(e.to_string()))?;

    let action = match value.get("action") {
        Some(serde_json::Value::String(action)) => action.clone(),
        Some(other) => other.to_string(),
        None => "null".to_string(),
    };

    match action.as_str() {
        "create_session" | "chat" => {
            serde_json::from_value(value).map_err(|e| Error::InvalidRequest(e.to_string()))
        }
        _ => Err(Error::UnknownAction(action)),
    }
}
