//! Error types for the voice relay.

use thiserror::Error;

use crate::registry::SessionId;

/// Error type for relay operations.
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket connection error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error on a socket or pipe.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Audio payload was not valid hex.
    #[error("Invalid audio payload: {0}")]
    InvalidAudio(#[from] hex::FromHexError),

    /// Client referenced a session id that does not exist.
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// A turn is already running for this session.
    #[error("Session busy: {0}")]
    SessionBusy(SessionId),

    /// The language-model backend failed or was unreachable.
    #[error("Language model unavailable: {0}")]
    BackendUnavailable(String),

    /// The synthesis backend could not be reached or rejected the handshake.
    #[error("Synthesis connect failed: {0}")]
    Connect(String),

    /// The synthesis backend rejected the task configuration.
    #[error("Synthesis task start failed: {0}")]
    TaskStart(String),

    /// Channel not ready for the requested operation.
    #[error("Channel not ready")]
    NotReady,

    /// Synthesis backend reported an error mid-stream.
    #[error("Server error: {message} (code: {code})")]
    ServerError {
        /// Status message from the backend.
        message: String,
        /// Status code from the backend.
        code: i32,
    },

    /// The transcoding filter could not be started.
    #[error("Transcoder unavailable: {0}")]
    TranscodeUnavailable(String),

    /// The transcoding filter stopped accepting input.
    #[error("Transcoder error: {0}")]
    Transcode(String),

    /// Client sent an action the relay does not know.
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// Client sent a malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The client's event stream is gone.
    #[error("Client disconnected")]
    ClientGone,

    /// Configuration could not be loaded.
    #[error("Config error: {0}")]
    Config(String),

    /// Connection or receive timeout.
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// Peer closed the connection.
    #[error("Connection closed")]
    ConnectionClosed,
}
