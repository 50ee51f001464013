//! Relay configuration: TOML file plus environment overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use crate::error::Error;
use crate::relay::RelaySettings;
use crate::synthesis::{Credentials, SynthesisSettings};
use crate::transcode::TranscodeSettings;

/// Default synthesis WebSocket endpoint.
pub const TTS_ENDPOINT: &str = "wss://api.minimax.io/ws/v1/t2a_v2";

/// Default synthesis model.
pub const TTS_MODEL: &str = "speech-2.8-hd";

/// Default Ollama base URL.
pub const OLLAMA_URL: &str = "http://127.0.0.1:11434";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub transcode: Option<TranscodeSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_url(),
            model: default_llm_model(),
            system_prompt: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default = "default_tts_endpoint")]
    pub endpoint: String,
    /// Usually supplied through `MINIMAX_API_KEY` instead of the file.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_tts_model")]
    pub model: String,
    #[serde(default)]
    pub voice: VoiceParams,
    #[serde(default)]
    pub audio: AudioSettings,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            endpoint: default_tts_endpoint(),
            api_key: None,
            model: default_tts_model(),
            voice: VoiceParams::default(),
            audio: AudioSettings::default(),
        }
    }
}

/// Voice parameters for one synthesis task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceParams {
    /// Empty means synthesis is disabled.
    pub voice_id: String,
    pub speed: f32,
    pub volume: f32,
    pub pitch: i32,
    pub english_normalization: bool,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            voice_id: String::new(),
            speed: 1.0,
            volume: 1.0,
            pitch: 0,
            english_normalization: false,
        }
    }
}

/// Output audio requested from the synthesis backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub bitrate: u32,
    /// Container tag, also reported to clients on untranscoded chunks.
    pub format: String,
    pub channels: u8,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: 32000,
            bitrate: 128000,
            format: "mp3".to_string(),
            channels: 1,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8024
}

fn default_llm_url() -> String {
    OLLAMA_URL.to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_tts_endpoint() -> String {
    TTS_ENDPOINT.to_string()
}

fn default_tts_model() -> String {
    TTS_MODEL.to_string()
}

impl Config {
    /// Loads the config file at `path` if it exists, otherwise defaults, then
    /// applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let mut config = match path {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "Loading config");
                let content = std::fs::read_to_string(path)?;
                Self::from_toml(&content)?
            }
            Some(path) => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                Config::default()
            }
            None => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Parses a config document.
    pub fn from_toml(content: &str) -> Result<Self, Error> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Applies `RELAY_HOST`, `RELAY_PORT`, `OLLAMA_HOST`, `MINIMAX_API_KEY` and
    /// `RELAY_VOICE_ID` from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(host) = lookup("RELAY_HOST") {
            self.server.host = host;
        }
        if let Some(raw) = lookup("RELAY_PORT") {
            match raw.parse::<u16>() {
                Ok(port) => self.server.port = port,
                Err(_) => warn!("Invalid RELAY_PORT='{}', keeping {}", raw, self.server.port),
            }
        }
        if let Some(url) = lookup("OLLAMA_HOST") {
            self.llm.base_url = if url.starts_with("http://") || url.starts_with("https://") {
                url
            } else {
                format!("http://{}", url)
            };
        }
        if let Some(key) = lookup("MINIMAX_API_KEY") {
            self.tts.api_key = Some(key);
        }
        if let Some(voice_id) = lookup("RELAY_VOICE_ID") {
            self.tts.voice.voice_id = voice_id;
        }
    }

    /// Returns synthesis settings when both credentials and a voice are configured.
    pub fn synthesis_settings(&self) -> Option<SynthesisSettings> {
        let api_key = self.tts.api_key.as_deref().unwrap_or("").trim();
        if api_key.is_empty() || self.tts.voice.voice_id.trim().is_empty() {
            return None;
        }
        Some(SynthesisSettings {
            credentials: Credentials {
                endpoint: self.tts.endpoint.clone(),
                api_key: api_key.to_string(),
            },
            model: self.tts.model.clone(),
            voice: self.tts.voice.clone(),
            audio: self.tts.audio.clone(),
        })
    }

    /// Builds the orchestrator settings.
    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            model: self.llm.model.clone(),
            system_prompt: self.llm.system_prompt.clone(),
            synthesis: self.synthesis_settings(),
            transcode: self.transcode.clone(),
        }
    }

    /// Returns the `host:port` listen address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
