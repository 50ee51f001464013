//! Streaming speech-synthesis channel.
//!
//! One [`SynthesisChannel`] serves exactly one reply: it is connected, given a
//! task configuration, fed the reply text once and then drained of audio
//! fragments until the backend flags the final message.

use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::{AudioSettings, VoiceParams};
use crate::error::Error;
use crate::messages::*;
use crate::ws::WebSocket;

/// Endpoint and API key for the synthesis backend.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// WebSocket endpoint URL.
    pub endpoint: String,
    /// API key sent as a bearer token.
    pub api_key: String,
}

/// Everything needed to run a synthesis task except the text.
#[derive(Debug, Clone)]
pub struct SynthesisSettings {
    pub credentials: Credentials,
    /// Synthesis model name.
    pub model: String,
    pub voice: VoiceParams,
    pub audio: AudioSettings,
}

/// Lifecycle of a synthesis channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connected,
    TaskStarted,
    Streaming,
    Closed,
    Error,
}

/// A block of encoded audio received from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFragment {
    /// Raw audio bytes, decoded from the wire encoding.
    pub data: Vec<u8>,
    /// True if this fragment arrived on the final message.
    pub is_final: bool,
}

/// Connection to the synthesis backend for a single reply.
pub struct SynthesisChannel {
    conn: Option<WebSocket>,
    state: ChannelState,
    final_seen: bool,
    fragments_received: usize,
    channel_id: String,
}

impl SynthesisChannel {
    fn idle() -> Self {
        Self {
            conn: None,
            state: ChannelState::Idle,
            final_seen: false,
            fragments_received: 0,
            channel_id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
        }
    }

    /// Connects to the backend and waits for the handshake confirmation.
    ///
    /// Any failure yields [`Error::Connect`]; the half-open socket is dropped.
    pub async fn connect(credentials: &Credentials) -> Result<Self, Error> {
        let mut channel = Self::idle();
        info!(channel_id = %channel.channel_id, "Synthesis connecting");

        let conn = WebSocket::connect(&credentials.endpoint, &credentials.api_key)
            .await
            .map_err(|e| Error::Connect(e.to_string()))?;

        let response = read_control(&conn)
            .await
            .map_err(|e| Error::Connect(e.to_string()))?;
        if response.event() != "connected_success" {
            error!(event = %response.event(), "Synthesis handshake rejected");
            conn.close().await;
            return Err(Error::Connect(format!(
                "unexpected handshake event '{}'",
                response.event()
            )));
        }

        channel.conn = Some(conn);
        channel.state = ChannelState::Connected;
        info!(channel_id = %channel.channel_id, "Synthesis connected");
        Ok(channel)
    }

    /// Sends the task configuration and waits for `task_started`.
    pub async fn start_task(&mut self, settings: &SynthesisSettings) -> Result<(), Error> {
        if self.state != ChannelState::Connected {
            return Err(Error::NotReady);
        }
        let conn = self.conn.as_ref().ok_or(Error::NotReady)?;

        let payload = TaskStartMessage::new(settings.model.clone(), &settings.voice, &settings.audio);
        let result = async {
            conn.send_json(&payload).await?;
            read_control(conn).await
        }
        .await;

        match result {
            Ok(response) if response.event() == "task_started" => {
                self.state = ChannelState::TaskStarted;
                info!(channel_id = %self.channel_id, voice_id = %settings.voice.voice_id, "Synthesis task started");
                Ok(())
            }
            Ok(response) => {
                self.state = ChannelState::Error;
                let reason = match response.failure() {
                    Some((code, message)) => format!("{} (code: {})", message, code),
                    None => format!("unexpected event '{}'", response.event()),
                };
                error!(channel_id = %self.channel_id, reason = %reason, "Synthesis task rejected");
                Err(Error::TaskStart(reason))
            }
            Err(e) => {
                self.state = ChannelState::Error;
                Err(Error::TaskStart(e.to_string()))
            }
        }
    }

    /// Submits `text` and returns the lazy sequence of audio fragments.
    pub async fn stream_text(&mut self, text: &str) -> Result<Fragments<'_>, Error> {
        if self.state != ChannelState::TaskStarted {
            return Err(Error::NotReady);
        }
        let conn = self.conn.as_ref().ok_or(Error::NotReady)?;

        if let Err(e) = conn.send_json(&TaskContinueMessage::new(text.to_string())).await {
            self.state = ChannelState::Error;
            return Err(e);
        }
        self.state = ChannelState::Streaming;
        debug!(channel_id = %self.channel_id, chars = text.chars().count(), "Synthesis text submitted");
        Ok(Fragments { channel: self })
    }

    /// Sends `task_finish` and closes the socket. Never fails.
    pub async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.state != ChannelState::Error {
                if let Err(e) = conn.send_json(&ControlMessage::task_finish()).await {
                    debug!(error = %e, "task_finish not delivered");
                }
            }
            conn.close().await;
            info!(
                channel_id = %self.channel_id,
                fragments = self.fragments_received,
                "Synthesis channel closed"
            );
        }
        self.state = ChannelState::Closed;
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Returns the number of audio fragments received so far.
    pub fn fragments_received(&self) -> usize {
        self.fragments_received
    }

    async fn next_fragment(&mut self) -> Result<Option<AudioFragment>, Error> {
        if self.state != ChannelState::Streaming || self.final_seen {
            return Ok(None);
        }
        let result = self.recv_fragment().await;
        if result.is_err() {
            self.state = ChannelState::Error;
        }
        result
    }

    async fn recv_fragment(&mut self) -> Result<Option<AudioFragment>, Error> {
        loop {
            let msg = self.conn.as_ref().ok_or(Error::NotReady)?.recv().await?;
            let Some(response) = parse_message(msg)? else {
                continue;
            };

            if let Some((code, message)) = response.failure() {
                error!(channel_id = %self.channel_id, code = code, message = %message, "Synthesis error");
                return Err(Error::ServerError { message, code });
            }

            if response.is_final {
                self.final_seen = true;
            }

            if let Some(audio) = response.audio_hex() {
                let data = hex::decode(audio)?;
                self.fragments_received += 1;
                debug!(
                    channel_id = %self.channel_id,
                    chunk = self.fragments_received,
                    len = data.len(),
                    "Synthesis audio chunk"
                );
                return Ok(Some(AudioFragment {
                    data,
                    is_final: response.is_final,
                }));
            }

            if response.is_final {
                info!(channel_id = %self.channel_id, fragments = self.fragments_received, "Synthesis done");
                return Ok(None);
            }
        }
    }
}

/// Lazy sequence of audio fragments for one submitted text.
pub struct Fragments<'a> {
    channel: &'a mut SynthesisChannel,
}

impl Fragments<'_> {
    /// Waits for the next audio fragment.
    ///
    /// Returns `Ok(None)` once the final message has been processed.
    pub async fn next(&mut self) -> Result<Option<AudioFragment>, Error> {
        self.channel.next_fragment().await
    }
}

/// Reads the next JSON control reply, skipping transport frames.
async fn read_control(conn: &WebSocket) -> Result<SynthesisResponse, Error> {
    loop {
        if let Some(response) = parse_message(conn.recv().await?)? {
            return Ok(response);
        }
    }
}

/// Decodes one transport message. `Ok(None)` means "not a payload, keep reading".
fn parse_message(msg: Message) -> Result<Option<SynthesisResponse>, Error> {
    let text = match msg {
        Message::Text(t) => t,
        Message::Binary(b) => match String::from_utf8(b) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Ignoring non-UTF-8 binary message");
                return Ok(None);
            }
        },
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return Ok(None),
        Message::Close(frame) => {
            debug!(frame = ?frame, "Synthesis backend closed");
            return Err(Error::ConnectionClosed);
        }
    };

    let response: SynthesisResponse = serde_json::from_str(&text)?;
    Ok(Some(response))
}
