//! Per-turn orchestration: model reply, then synthesized audio.
//!
//! Every chat turn produces `text_response`, zero or more `audio_chunk`s and
//! exactly one `audio_done`, or a single `error` if the session or the model
//! call fails. Synthesis and transcoding failures only reduce the turn to
//! fewer (or no) audio chunks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::llm::ChatBackend;
use crate::protocol::{parse_request, ClientRequest, ServerEvent};
use crate::registry::{SessionId, SessionRegistry};
use crate::synthesis::{Fragments, SynthesisChannel, SynthesisSettings};
use crate::transcode::{TranscodePipe, TranscodeSettings};

/// Outbound event queue of one client connection.
pub type EventSink = mpsc::Sender<ServerEvent>;

/// What the relay does for every turn.
#[derive(Debug, Clone, Default)]
pub struct RelaySettings {
    /// Model for new sessions.
    pub model: String,
    /// System prompt for new sessions; empty for none.
    pub system_prompt: String,
    /// `None` disables speech synthesis.
    pub synthesis: Option<SynthesisSettings>,
    /// `None` forwards backend audio unchanged.
    pub transcode: Option<TranscodeSettings>,
}

/// Coordinates sessions, the model backend, synthesis and transcoding.
pub struct Relay {
    registry: Arc<SessionRegistry>,
    settings: RelaySettings,
}

impl Relay {
    /// Creates a relay with a fresh session registry.
    pub fn new(backend: Arc<dyn ChatBackend>, settings: RelaySettings) -> Self {
        if settings.synthesis.is_none() {
            info!("Speech synthesis disabled");
        }
        Self {
            registry: Arc::new(SessionRegistry::new(backend)),
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Handles one raw inbound frame.
    ///
    /// Returns `Err` only when the client can no longer receive events.
    pub async fn handle_text(&self, text: &str, events: &EventSink) -> Result<(), Error> {
        match parse_request(text) {
            Ok(request) => self.handle(request, events).await,
            Err(e) => {
                warn!(error = %e, "Rejected request");
                emit(events, ServerEvent::error(e)).await
            }
        }
    }

    /// Handles one parsed request.
    pub async fn handle(&self, request: ClientRequest, events: &EventSink) -> Result<(), Error> {
        match request {
            ClientRequest::CreateSession {
                model,
                system_prompt,
            } => {
                let session_id = self
                    .create_session_with(model.as_deref(), system_prompt.as_deref())
                    .await;
                emit(events, ServerEvent::SessionCreated { session_id }).await
            }
            ClientRequest::Chat {
                session_id,
                message,
            } => self.chat(session_id, message, events).await,
        }
    }

    /// Creates a session with the configured model and system prompt.
    pub async fn create_session(&self) -> SessionId {
        self.create_session_with(None, None).await
    }

    /// Creates a session, overriding the configured model or system prompt.
    pub async fn create_session_with(
        &self,
        model: Option<&str>,
        system_prompt: Option<&str>,
    ) -> SessionId {
        let model = model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(self.settings.model.as_str());
        let system_prompt = system_prompt.unwrap_or(self.settings.system_prompt.as_str());
        self.registry.create(model, system_prompt).await
    }

    /// Runs one chat turn, emitting its events in order.
    pub async fn chat(
        &self,
        session_id: SessionId,
        message: String,
        events: &EventSink,
    ) -> Result<(), Error> {
        let reply = match self.reply(session_id, message).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Turn aborted");
                return emit(events, ServerEvent::error(e)).await;
            }
        };
        info!(session_id = %session_id, chars = reply.len(), "Assistant replied");

        emit(events, ServerEvent::TextResponse {
            content: reply.clone(),
        })
        .await?;

        if let Some(synthesis) = &self.settings.synthesis {
            self.speak(session_id, synthesis, &reply, events).await?;
        }
        emit(events, ServerEvent::AudioDone).await
    }

    /// Resolves the session and runs the model call on the blocking pool.
    async fn reply(&self, session_id: SessionId, message: String) -> Result<String, Error> {
        let session = self.registry.get(session_id).await?;
        let mut session = session
            .try_lock_owned()
            .map_err(|_| Error::SessionBusy(session_id))?;

        tokio::task::spawn_blocking(move || session.chat(&message))
            .await
            .map_err(|e| Error::BackendUnavailable(format!("model task failed: {}", e)))?
    }

    /// Streams synthesized audio for `reply`. Synthesis failures are logged and
    /// swallowed; only a vanished client is returned as an error.
    async fn speak(
        &self,
        session_id: SessionId,
        synthesis: &SynthesisSettings,
        reply: &str,
        events: &EventSink,
    ) -> Result<(), Error> {
        let mut channel = match SynthesisChannel::connect(&synthesis.credentials).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Synthesis unavailable, text only");
                return Ok(());
            }
        };

        let result = self.stream_audio(&mut channel, synthesis, reply, events).await;
        channel.close().await;
        result
    }

    async fn stream_audio(
        &self,
        channel: &mut SynthesisChannel,
        synthesis: &SynthesisSettings,
        reply: &str,
        events: &EventSink,
    ) -> Result<(), Error> {
        if let Err(e) = channel.start_task(synthesis).await {
            warn!(error = %e, "Synthesis task not started, text only");
            return Ok(());
        }
        let mut fragments = match channel.stream_text(reply).await {
            Ok(fragments) => fragments,
            Err(e) => {
                warn!(error = %e, "Synthesis text not accepted, text only");
                return Ok(());
            }
        };

        let pipe = self.settings.transcode.as_ref().and_then(|settings| {
            TranscodePipe::spawn(settings)
                .map_err(|e| warn!(error = %e, "Forwarding untranscoded audio"))
                .ok()
        });

        let Some(mut pipe) = pipe else {
            return forward_direct(&mut fragments, &synthesis.audio.format, events).await;
        };

        let mut pending = Vec::new();
        let outcome = forward_transcoded(&mut fragments, &mut pipe, &mut pending, events).await;
        pipe.close().await;

        match outcome {
            Ok(()) => Ok(()),
            Err(Interrupt::Client(e)) => Err(e),
            Err(Interrupt::FilterFailed) => {
                warn!(
                    replayed = pending.len(),
                    "Transcoder produced no audio, forwarding untranscoded"
                );
                let format = &synthesis.audio.format;
                for data in pending {
                    emit(events, ServerEvent::audio_chunk(&data, format)).await?;
                }
                forward_direct(&mut fragments, format, events).await
            }
        }
    }
}

/// Why transcoded forwarding stopped early.
enum Interrupt {
    /// The filter ended or refused input before yielding any output.
    FilterFailed,
    Client(Error),
}

/// Sends one event to the client.
async fn emit(events: &EventSink, event: ServerEvent) -> Result<(), Error> {
    events.send(event).await.map_err(|_| Error::ClientGone)
}

async fn forward_direct(
    fragments: &mut Fragments<'_>,
    format: &str,
    events: &EventSink,
) -> Result<(), Error> {
    loop {
        match fragments.next().await {
            Ok(Some(fragment)) => {
                emit(events, ServerEvent::audio_chunk(&fragment.data, format)).await?;
            }
            Ok(None) => return Ok(()),
            Err(e) => {
                error!(error = %e, "Synthesis stream failed");
                return Ok(());
            }
        }
    }
}

/// Feeds fragments into the filter while draining its output to the client.
///
/// Until the first output chunk arrives, every fed fragment is also kept in
/// `pending` so the caller can replay it untranscoded on
/// [`Interrupt::FilterFailed`].
async fn forward_transcoded(
    fragments: &mut Fragments<'_>,
    pipe: &mut TranscodePipe,
    pending: &mut Vec<Vec<u8>>,
    events: &EventSink,
) -> Result<(), Interrupt> {
    let format = pipe.format().to_string();
    let (mut sink, mut source) = pipe.split();
    let started = AtomicBool::new(false);
    let started = &started;

    let feed = async move {
        loop {
            match fragments.next().await {
                Ok(Some(fragment)) => {
                    if !started.load(Ordering::SeqCst) {
                        pending.push(fragment.data.clone());
                    }
                    if let Err(e) = sink.feed(fragment.data).await {
                        if !started.load(Ordering::SeqCst) {
                            return Err(Interrupt::FilterFailed);
                        }
                        error!(error = %e, "Transcoder rejected audio");
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Synthesis stream failed");
                    break;
                }
            }
        }
        sink.finish();
        Ok(())
    };

    let drain = async move {
        let mut chunks = 0usize;
        while let Some(chunk) = source.next_chunk().await {
            chunks += 1;
            started.store(true, Ordering::SeqCst);
            emit(events, ServerEvent::audio_chunk(&chunk, &format))
                .await
                .map_err(Interrupt::Client)?;
        }
        if chunks == 0 {
            return Err(Interrupt::FilterFailed);
        }
        debug!(chunks = chunks, "Transcoder drained");
        Ok(())
    };

    tokio::try_join!(feed, drain).map(|_| ())
}
