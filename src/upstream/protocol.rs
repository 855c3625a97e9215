//! # Gemini Live Wire Format
//!
//! Serde types for the BidiGenerateContent WebSocket protocol and the
//! decoding of server messages into [`ServerEvent`]s.
//!
//! ## Message Flow:
//! 1. Client sends `setup`, server answers `setupComplete`
//! 2. Client streams `realtimeInput` audio and `clientContent` text turns
//! 3. Server streams `serverContent` (audio parts, transcriptions, turn markers)
//!
//! All field names are camelCase on the wire.

use super::{ServerEvent, UpstreamError};
use crate::transcription::Speaker;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

pub const INPUT_TRANSCRIPTION_PROVIDER: &str = "gemini_live_input_transcription";
pub const OUTPUT_TRANSCRIPTION_PROVIDER: &str = "gemini_live_output_transcription";
pub const MODEL_TEXT_PROVIDER: &str = "gemini_live_model_turn";

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    pub realtime_input_config: RealtimeInputConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<EmptyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<EmptyConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputConfig {
    pub automatic_activity_detection: AutomaticActivityDetection,
}

/// Server-side voice activity detection knobs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomaticActivityDetection {
    pub disabled: bool,
    pub start_of_speech_sensitivity: String,
    pub end_of_speech_sensitivity: String,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

/// Serializes as `{}`; enables a feature without options.
#[derive(Debug, Default, Serialize)]
pub struct EmptyConfig {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    /// Base64-encoded bytes
    pub data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
pub struct RealtimeInput {
    pub audio: Blob,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContentMessage {
    pub client_content: ClientContent,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

impl RealtimeInputMessage {
    pub fn audio(bytes: &[u8], mime_type: String) -> Self {
        Self {
            realtime_input: RealtimeInput {
                audio: Blob {
                    mime_type,
                    data: BASE64.encode(bytes),
                },
            },
        }
    }
}

impl ClientContentMessage {
    /// A complete user turn carrying one text part.
    pub fn user_text(text: &str) -> Self {
        Self {
            client_content: ClientContent {
                turns: vec![Content {
                    role: Some("user".to_string()),
                    parts: vec![Part {
                        text: Some(text.to_string()),
                        inline_data: None,
                    }],
                }],
                turn_complete: true,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

impl ServerMessage {
    pub fn parse(raw: &[u8]) -> Result<Self, UpstreamError> {
        serde_json::from_slice(raw).map_err(|e| UpstreamError::Protocol(e.to_string()))
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Flatten into relay events.
    ///
    /// Order within one message: transcriptions, model parts, interruption,
    /// turn completion.
    pub fn into_events(self) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        if let Some(content) = self.server_content {
            if let Some(text) = content.input_transcription.and_then(|t| t.text) {
                if !text.is_empty() {
                    events.push(ServerEvent::TranscriptDelta {
                        speaker: Speaker::User,
                        text,
                        provider: INPUT_TRANSCRIPTION_PROVIDER.to_string(),
                    });
                }
            }
            if let Some(text) = content.output_transcription.and_then(|t| t.text) {
                if !text.is_empty() {
                    events.push(ServerEvent::TranscriptDelta {
                        speaker: Speaker::Assistant,
                        text,
                        provider: OUTPUT_TRANSCRIPTION_PROVIDER.to_string(),
                    });
                }
            }

            for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
                if let Some(blob) = part.inline_data {
                    if blob.mime_type.starts_with("audio/") {
                        match BASE64.decode(blob.data.as_bytes()) {
                            Ok(bytes) if !bytes.is_empty() => {
                                events.push(ServerEvent::AudioChunk(bytes))
                            }
                            Ok(_) => {}
                            Err(e) => events.push(ServerEvent::Error(format!(
                                "undecodable audio part: {}",
                                e
                            ))),
                        }
                    }
                }
                if let Some(text) = part.text {
                    if !text.is_empty() {
                        events.push(ServerEvent::TranscriptDelta {
                            speaker: Speaker::Assistant,
                            text,
                            provider: MODEL_TEXT_PROVIDER.to_string(),
                        });
                    }
                }
            }

            if content.interrupted {
                events.push(ServerEvent::Interrupted);
            }
            if content.turn_complete {
                events.push(ServerEvent::TurnComplete);
            }
        }

        if let Some(go_away) = self.go_away {
            events.push(ServerEvent::Error(format!(
                "upstream going away (time left: {})",
                go_away.time_left.unwrap_or_else(|| "unknown".to_string())
            )));
        }
        if let Some(error) = self.error {
            events.push(ServerEvent::Error(error.to_string()));
        }

        events
    }
}
