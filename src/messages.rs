//! Message types for the speech-synthesis WebSocket protocol.

use serde::{Deserialize, Serialize};

use crate::config::{AudioSettings, VoiceParams};

// ============================================================================
// Outbound
// ============================================================================

/// Control message carrying only an event name (`task_finish`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    /// The event name.
    pub event: String,
}

impl ControlMessage {
    /// Creates the message that ends a synthesis task.
    pub fn task_finish() -> Self {
        Self {
            event: "task_finish".to_string(),
        }
    }
}

/// Voice settings as sent on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceSetting {
    pub voice_id: String,
    pub speed: f32,
    pub vol: f32,
    pub pitch: i32,
    pub english_normalization: bool,
}

impl From<&VoiceParams> for VoiceSetting {
    fn from(params: &VoiceParams) -> Self {
        Self {
            voice_id: params.voice_id.clone(),
            speed: params.speed,
            vol: params.volume,
            pitch: params.pitch,
            english_normalization: params.english_normalization,
        }
    }
}

/// Audio settings as sent on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSetting {
    pub sample_rate: u32,
    pub bitrate: u32,
    pub format: String,
    pub channel: u8,
}

impl From<&AudioSettings> for AudioSetting {
    fn from(audio: &AudioSettings) -> Self {
        Self {
            sample_rate: audio.sample_rate,
            bitrate: audio.bitrate,
            format: audio.format.clone(),
            channel: audio.channels,
        }
    }
}

/// Task start message configuring one synthesis task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStartMessage {
    /// The event name (always "task_start").
    pub event: String,
    /// Synthesis model name.
    pub model: String,
    pub voice_setting: VoiceSetting,
    pub audio_setting: AudioSetting,
}

impl TaskStartMessage {
    /// Creates a new task start message.
    pub fn new(model: String, voice: &VoiceParams, audio: &AudioSettings) -> Self {
        Self {
            event: "task_start".to_string(),
            model,
            voice_setting: voice.into(),
            audio_setting: audio.into(),
        }
    }
}

/// Text submission for the running task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContinueMessage {
    /// The event name (always "task_continue").
    pub event: String,
    /// Text to synthesize.
    pub text: String,
}

impl TaskContinueMessage {
    /// Creates a new text submission.
    pub fn new(text: String) -> Self {
        Self {
            event: "task_continue".to_string(),
            text,
        }
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// Status block attached to most backend replies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaseResp {
    #[serde(default)]
    pub status_code: i32,
    #[serde(default)]
    pub status_msg: String,
}

/// Audio payload of a backend reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioData {
    /// Hex-encoded audio bytes. May be empty.
    #[serde(default)]
    pub audio: Option<String>,
}

/// Any message received from the synthesis backend.
///
/// Every field is optional on the wire; control replies carry only `event`,
/// audio replies carry `data` and `is_final`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynthesisResponse {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub data: Option<AudioData>,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub base_resp: Option<BaseResp>,
}

impl SynthesisResponse {
    /// Returns the event name, or an empty string.
    pub fn event(&self) -> &str {
        self.event.as_deref().unwrap_or("")
    }

    /// Returns the hex audio payload if it is present and non-empty.
    pub fn audio_hex(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.audio.as_deref())
            .filter(|a| !a.is_empty())
    }

    /// Returns the backend failure carried by this message, if any.
    pub fn failure(&self) -> Option<(i32, String)> {
        if self.event() == "task_failed" {
            let resp = self.base_resp.clone().unwrap_or_default();
            let message = if resp.status_msg.is_empty() {
                "task failed".to_string()
            } else {
                resp.status_msg
            };
            return Some((resp.status_code, message));
        }
        match &self.base_resp {
            Some(resp) if resp.status_code != 0 => {
                Some((resp.status_code, resp.status_msg.clone()))
            }
            _ => None,
        }
    }
}
