//! Language-model backend interface and an Ollama `/api/chat` client.

use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::Error;
use crate::session::Turn;

/// Context window requested for every model call.
pub const CONTEXT_WINDOW: u32 = 8192;

/// Sampling temperature requested for every model call.
pub const TEMPERATURE: f32 = 0.7;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Fixed decoding options sent with each call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChatOptions {
    pub num_ctx: u32,
    pub temperature: f32,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            num_ctx: CONTEXT_WINDOW,
            temperature: TEMPERATURE,
        }
    }
}

/// One model call: the full history plus decoding options.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Turn],
    pub options: ChatOptions,
}

/// A blocking, streaming chat backend.
///
/// Implementations deliver the reply as ordered text fragments through
/// `on_fragment` and return once the stream is complete. Calls block the
/// current thread and must be made from the blocking pool.
pub trait ChatBackend: Send + Sync + 'static {
    fn chat(&self, request: &ChatRequest<'_>, on_fragment: &mut dyn FnMut(&str))
        -> Result<(), Error>;
}

/// Client for an Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    base_url: String,
}

#[derive(Serialize)]
struct OllamaChatBody<'a> {
    #[serde(flatten)]
    request: &'a ChatRequest<'a>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

/// One decoded line of an NDJSON chat stream.
#[derive(Debug, PartialEq)]
enum StreamLine {
    Fragment(String),
    Done(String),
    Skip,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }
}

impl ChatBackend for OllamaBackend {
    fn chat(
        &self,
        request: &ChatRequest<'_>,
        on_fragment: &mut dyn FnMut(&str),
    ) -> Result<(), Error> {
        // The blocking client owns a runtime; build and drop it on this thread.
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(unavailable)?;

        info!(model = %request.model, turns = request.messages.len(), "Model call");
        let response = client
            .post(self.endpoint())
            .json(&OllamaChatBody {
                request,
                stream: true,
            })
            .send()
            .map_err(unavailable)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(Error::BackendUnavailable(format!("HTTP {}: {}", status, body)));
        }

        for line in BufReader::new(response).lines() {
            let line = line.map_err(unavailable)?;
            match parse_stream_line(&line)? {
                StreamLine::Fragment(text) => on_fragment(&text),
                StreamLine::Done(text) => {
                    if !text.is_empty() {
                        on_fragment(&text);
                    }
                    debug!("Model stream done");
                    return Ok(());
                }
                StreamLine::Skip => {}
            }
        }
        Err(Error::BackendUnavailable(
            "stream ended before completion".to_string(),
        ))
    }
}

fn unavailable(e: impl std::fmt::Display) -> Error {
    Error::BackendUnavailable(e.to_string())
}

fn parse_stream_line(line: &str) -> Result<StreamLine, Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(StreamLine::Skip);
    }
    let chunk: OllamaChunk = serde_json::from_str(line).map_err(unavailable)?;
    if let Some(error) = chunk.error {
        return Err(Error::BackendUnavailable(error));
    }
    let content = chunk.message.map(|m| m.content).unwrap_or_default();
    if chunk.done {
        Ok(StreamLine::Done(content))
    } else if content.is_empty() {
        Ok(StreamLine::Skip)
    } else {
        Ok(StreamLine::Fragment(content))
    }
}
