//! Shared fixtures: a scripted chat backend, a stub synthesis server and
//! client helpers.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use voice_relay::{
    AudioSettings, ChatBackend, ChatRequest, Credentials, Error, Relay, RelaySettings, Role,
    ServerEvent, SynthesisSettings, Turn, VoiceParams,
};

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

// ============================================================================
// Chat backend
// ============================================================================

/// Chat backend that replies from a script.
#[derive(Default)]
pub struct StubChat {
    /// Reply fragments, concatenated by the session.
    pub fragments: Vec<String>,
    /// Reply with "echo: <last user message>" instead of `fragments`.
    pub echo: bool,
    pub fail: bool,
    /// Blocks each call this long before replying.
    pub delay: Duration,
    pub calls: AtomicUsize,
    pub histories: Mutex<Vec<Vec<Turn>>>,
}

impl StubChat {
    pub fn replying(fragments: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            ..Default::default()
        })
    }

    pub fn echoing() -> Arc<Self> {
        Arc::new(Self {
            echo: true,
            ..Default::default()
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Default::default()
        })
    }

    pub fn slow(fragments: &[&str], delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            delay,
            ..Default::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ChatBackend for StubChat {
    fn chat(
        &self,
        request: &ChatRequest<'_>,
        on_fragment: &mut dyn FnMut(&str),
    ) -> Result<(), Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.histories
            .lock()
            .unwrap()
            .push(request.messages.to_vec());
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.fail {
            return Err(Error::BackendUnavailable("connection refused".to_string()));
        }
        if self.echo {
            let last = request
                .messages
                .iter()
                .rev()
                .find(|t| t.role == Role::User)
                .map(|t| t.content.clone())
                .unwrap_or_default();
            on_fragment("echo: ");
            on_fragment(&last);
            return Ok(());
        }
        for fragment in &self.fragments {
            on_fragment(fragment);
        }
        Ok(())
    }
}

// ============================================================================
// Synthesis server
// ============================================================================

/// What the stub synthesis server does on each connection.
#[derive(Clone)]
pub struct SynthesisScript {
    /// Event sent right after the WebSocket handshake.
    pub handshake_event: String,
    /// Reply `task_started` (true) or `task_failed` (false) to `task_start`.
    pub accept_task: bool,
    /// Messages sent, in order, after `task_continue`.
    pub replies: Vec<Value>,
    /// Pause before each reply.
    pub delay: Duration,
    /// Extra pause per reply added for each earlier connection, so
    /// concurrent connections stream at different rates.
    pub stagger: Duration,
    /// When set, ignore `replies` and answer with the submitted text's
    /// bytes as audio, split into fragments of this many bytes.
    pub echo_chunk: Option<usize>,
}

impl SynthesisScript {
    /// Sends one `task_continued` per hex fragment, the last one final.
    pub fn fragments(hex_fragments: &[&str]) -> Self {
        let last = hex_fragments.len().saturating_sub(1);
        Self {
            handshake_event: "connected_success".to_string(),
            accept_task: true,
            replies: hex_fragments
                .iter()
                .enumerate()
                .map(|(i, hex)| continued(hex, i == last))
                .collect(),
            delay: Duration::ZERO,
            stagger: Duration::ZERO,
            echo_chunk: None,
        }
    }

    /// Answers every text with its own UTF-8 bytes as audio.
    pub fn echo(chunk: usize, stagger: Duration) -> Self {
        Self {
            stagger,
            echo_chunk: Some(chunk),
            ..Self::fragments(&[])
        }
    }

    fn replies_for(&self, text: &str) -> Vec<Value> {
        let Some(chunk) = self.echo_chunk else {
            return self.replies.clone();
        };
        let pieces: Vec<&[u8]> = text.as_bytes().chunks(chunk).collect();
        let last = pieces.len().saturating_sub(1);
        pieces
            .iter()
            .enumerate()
            .map(|(i, piece)| continued(&hex::encode(piece), i == last))
            .collect()
    }

    pub fn with_replies(replies: Vec<Value>) -> Self {
        Self {
            replies,
            ..Self::fragments(&[])
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A `task_continued` message carrying `hex` audio.
pub fn continued(hex: &str, is_final: bool) -> Value {
    json!({
        "event": "task_continued",
        "data": { "audio": hex },
        "is_final": is_final,
        "base_resp": { "status_code": 0, "status_msg": "success" }
    })
}

/// A mid-stream failure message.
pub fn failure(code: i32, message: &str) -> Value {
    json!({
        "event": "task_failed",
        "base_resp": { "status_code": code, "status_msg": message }
    })
}

/// What the stub server observed.
#[derive(Default)]
pub struct SynthesisLog {
    pub connections: AtomicUsize,
    pub active: AtomicUsize,
    pub finished: AtomicUsize,
    pub task_starts: Mutex<Vec<Value>>,
    pub texts: Mutex<Vec<String>>,
    pub auth_headers: Mutex<Vec<String>>,
}

struct ActiveGuard(Arc<SynthesisLog>);

impl ActiveGuard {
    /// Registers a connection and returns its zero-based index.
    fn new(log: &Arc<SynthesisLog>) -> (Self, u32) {
        let index = log.connections.fetch_add(1, Ordering::SeqCst);
        log.active.fetch_add(1, Ordering::SeqCst);
        (Self(Arc::clone(log)), index as u32)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Stub streaming synthesis backend on a local port.
pub struct StubSynthesis {
    pub addr: SocketAddr,
    pub log: Arc<SynthesisLog>,
}

impl StubSynthesis {
    pub async fn start(script: SynthesisScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log = Arc::new(SynthesisLog::default());
        let script = Arc::new(script);

        let server_log = Arc::clone(&log);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (guard, index) = ActiveGuard::new(&server_log);
                let script = Arc::clone(&script);
                tokio::spawn(serve_synthesis(stream, script, guard, index));
            }
        });

        Self { addr, log }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            endpoint: format!("ws://{}/ws/v1/t2a_v2", self.addr),
            api_key: "test-key".to_string(),
        }
    }

    pub fn settings(&self) -> SynthesisSettings {
        synthesis_settings(self.credentials())
    }

    pub fn connections(&self) -> usize {
        self.log.connections.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.log.active.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.log.finished.load(Ordering::SeqCst)
    }

    pub fn texts(&self) -> Vec<String> {
        self.log.texts.lock().unwrap().clone()
    }

    /// Polls until no connection is open.
    pub async fn wait_idle(&self, within: Duration) -> bool {
        wait_for(within, || self.active() == 0).await
    }
}

pub fn synthesis_settings(credentials: Credentials) -> SynthesisSettings {
    SynthesisSettings {
        credentials,
        model: "speech-2.8-hd".to_string(),
        voice: VoiceParams {
            voice_id: "test-voice".to_string(),
            ..VoiceParams::default()
        },
        audio: AudioSettings::default(),
    }
}

async fn serve_synthesis(
    stream: tokio::net::TcpStream,
    script: Arc<SynthesisScript>,
    guard: ActiveGuard,
    index: u32,
) {
    let delay = script.delay + script.stagger * index;
    let log = Arc::clone(&guard.0);
    let auth_log = Arc::clone(&log);
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if let Some(value) = request.headers().get("Authorization") {
            auth_log
                .auth_headers
                .lock()
                .unwrap()
                .push(value.to_str().unwrap_or_default().to_string());
        }
        Ok(response)
    };
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };
    let (mut sink, mut stream) = ws.split();

    let hello = json!({ "event": script.handshake_event }).to_string();
    if sink.send(Message::Text(hello)).await.is_err() {
        return;
    }

    while let Some(Ok(msg)) = stream.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        match value["event"].as_str() {
            Some("task_start") => {
                log.task_starts.lock().unwrap().push(value.clone());
                let reply = if script.accept_task {
                    json!({ "event": "task_started", "base_resp": { "status_code": 0 } })
                } else {
                    failure(2049, "invalid api key")
                };
                if sink.send(Message::Text(reply.to_string())).await.is_err() {
                    return;
                }
            }
            Some("task_continue") => {
                let text = value["text"].as_str().unwrap_or_default().to_string();
                let replies = script.replies_for(&text);
                log.texts.lock().unwrap().push(text);
                for reply in &replies {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        incoming = stream.next() => match incoming {
                            Some(Ok(Message::Text(_))) | Some(Ok(Message::Ping(_))) => {}
                            _ => return,
                        }
                    }
                    if sink.send(Message::Text(reply.to_string())).await.is_err() {
                        return;
                    }
                }
            }
            Some("task_finish") => {
                log.finished.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }
    drop(guard);
}

// ============================================================================
// Clients
// ============================================================================

/// Relay with no system prompt.
pub fn relay(
    backend: Arc<dyn ChatBackend>,
    synthesis: Option<SynthesisSettings>,
) -> Arc<Relay> {
    Arc::new(Relay::new(
        backend,
        RelaySettings {
            model: "test-model".to_string(),
            system_prompt: String::new(),
            synthesis,
            transcode: None,
        },
    ))
}

/// Runs one request through the relay and collects every event it emits.
pub async fn run_request(relay: &Relay, request: Value) -> Vec<ServerEvent> {
    let (tx, mut rx) = mpsc::channel(8);
    let text = request.to_string();
    let turn = async move {
        relay.handle_text(&text, &tx).await.unwrap();
    };
    let collect = async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    };
    let ((), events) = tokio::time::timeout(Duration::from_secs(20), async {
        tokio::join!(turn, collect)
    })
    .await
    .expect("turn timed out");
    events
}

pub fn chat(session_id: u64, message: &str) -> Value {
    json!({ "action": "chat", "session_id": session_id, "message": message })
}

/// Decodes every audio chunk of a turn and returns the bytes with their tags.
pub fn audio_of(events: &[ServerEvent]) -> Vec<(Vec<u8>, String)> {
    events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::AudioChunk { data, format } => {
                Some((hex::decode(data).unwrap(), format.clone()))
            }
            _ => None,
        })
        .collect()
}

pub type ClientSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Connects a client to a running relay server.
pub async fn connect_client(addr: SocketAddr) -> ClientSocket {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .unwrap();
    ws
}

pub async fn send(ws: &mut ClientSocket, request: Value) {
    send_raw(ws, &request.to_string()).await;
}

pub async fn send_raw(ws: &mut ClientSocket, text: &str) {
    ws.send(Message::Text(text.to_string())).await.unwrap();
}

/// Reads the next event, failing the test after a timeout.
pub async fn next_event(ws: &mut ClientSocket) -> ServerEvent {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("no event from relay")
            .expect("relay closed the connection")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Reads events up to and including the one that ends the turn.
pub async fn read_turn(ws: &mut ClientSocket) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(ws).await;
        let done = event.is_terminal();
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Polls `condition` every 20ms until it holds or `within` elapses.
pub async fn wait_for(within: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
