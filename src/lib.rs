//! WebSocket relay between voice clients, a local language model and a
//! streaming speech-synthesis backend.
//!
//! Clients open sessions, send chat messages and receive the model's reply as
//! text followed by synthesized audio chunks.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use voice_relay::{Config, OllamaBackend, Relay, RelayServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), voice_relay::Error> {
//!     let config = Config::load(None)?;
//!     let backend = Arc::new(OllamaBackend::new(&config.llm.base_url));
//!     let relay = Arc::new(Relay::new(backend, config.relay_settings()));
//!
//!     let server = RelayServer::bind(config.bind_addr(), relay).await?;
//!     server.run().await
//! }
//! ```

pub mod config;
mod error;
pub mod llm;
pub mod messages;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod synthesis;
pub mod transcode;
pub mod wg;
mod ws;

pub use config::{AudioSettings, Config, VoiceParams, OLLAMA_URL, TTS_ENDPOINT, TTS_MODEL};
pub use error::Error;
pub use llm::{ChatBackend, ChatOptions, ChatRequest, OllamaBackend};
pub use protocol::{parse_request, ClientRequest, ServerEvent};
pub use registry::{SessionHandle, SessionId, SessionRegistry};
pub use relay::{Relay, RelaySettings};
pub use server::{RelayServer, WS_PATH};
pub use session::{ConversationSession, Role, Turn};
pub use synthesis::{AudioFragment, ChannelState, Credentials, SynthesisChannel, SynthesisSettings};
pub use transcode::{TranscodePipe, TranscodeSettings};
pub use wg::{WaitGroup, WaitGroupGuard};
