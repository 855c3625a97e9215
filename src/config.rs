//! # Configuration Management
//!
//! This module handles loading and managing relay configuration from multiple sources:
//! - Configuration file (`config.toml`, `config.json`, ...), optional
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment variables: `HOST`, `PORT`, `GOOGLE_API_KEY` / `GEMINI_API_KEY`
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_TRANSCRIPTS__IDLE_FLUSH_MS`, ...)
//! 3. Configuration file
//! 4. Default values (defined in the Default impls)
//!
//! Nested keys are separated by a double underscore so that field names
//! containing a single underscore survive the mapping.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub audio: AudioConfig,
    pub transcripts: TranscriptConfig,
    pub sessions: SessionConfig,
}

/// Where the HTTP/WebSocket server listens.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Upstream realtime speech service settings.
///
/// ## Timeouts:
/// - `turn_timeout_ms` bounds the connect/setup handshake and every individual send
/// - `receive_idle_timeout_secs` bounds silence on the receive side; 0 disables it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub url: String,
    pub api_key: String,
    pub model: String,
    /// `AUDIO` or `TEXT`
    pub response_modality: String,
    pub input_transcription: bool,
    pub output_transcription: bool,
    pub vad_disabled: bool,
    pub start_of_speech_sensitivity: String,
    pub end_of_speech_sensitivity: String,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
    pub turn_timeout_ms: u64,
    pub receive_idle_timeout_secs: u64,
    /// Send the mode's greeting as the first text turn
    pub send_greeting: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
            api_key: String::new(),
            model: "models/gemini-2.0-flash-live-001".to_string(),
            response_modality: "AUDIO".to_string(),
            input_transcription: true,
            output_transcription: true,
            vad_disabled: false,
            start_of_speech_sensitivity: "START_SENSITIVITY_MEDIUM".to_string(),
            end_of_speech_sensitivity: "END_SENSITIVITY_MEDIUM".to_string(),
            prefix_padding_ms: 200,
            silence_duration_ms: 600,
            turn_timeout_ms: 5000,
            receive_idle_timeout_secs: 0,
            send_greeting: true,
        }
    }
}

/// Audio shaping in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub input_channels: u16,
    pub input_bit_depth: u16,
    /// Rate of the PCM the upstream speaks back with
    pub output_sample_rate: u32,
    /// Bytes per upstream audio send
    pub inbound_chunk_bytes: usize,
    /// Outbound frames are `inbound_chunk_bytes * outbound_frame_multiplier` bytes
    pub outbound_frame_multiplier: usize,
    pub outbound_idle_flush_ms: u64,
    /// Upstream chunks held for the client before drop-oldest kicks in
    pub outbound_queue_capacity: usize,
    /// Client messages held for the relay before new ones are dropped
    pub inbound_queue_capacity: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16000,
            input_channels: 1,
            input_bit_depth: 16,
            output_sample_rate: 24000,
            inbound_chunk_bytes: 1024,
            outbound_frame_multiplier: 4,
            outbound_idle_flush_ms: 1000,
            outbound_queue_capacity: 64,
            inbound_queue_capacity: 64,
        }
    }
}

impl AudioConfig {
    pub fn outbound_frame_bytes(&self) -> usize {
        self.inbound_chunk_bytes * self.outbound_frame_multiplier
    }
}

/// Transcript aggregation and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptConfig {
    pub noise_max_chars: usize,
    pub min_utterance_chars: usize,
    pub max_buffer_chars: usize,
    pub idle_flush_ms: u64,
    /// `log` or `jsonl`
    pub sink: String,
    pub jsonl_path: String,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            noise_max_chars: 2,
            min_utterance_chars: 8,
            max_buffer_chars: 300,
            idle_flush_ms: 6000,
            sink: "log".to_string(),
            jsonl_path: "transcripts.jsonl".to_string(),
        }
    }
}

/// Session lifecycle limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_concurrent_sessions: usize,
    pub max_session_duration_secs: u64,
    pub sweep_interval_secs: u64,
    pub teardown_timeout_ms: u64,
    /// Consecutive upstream send failures tolerated before the relay gives up
    pub send_failure_budget: u32,
    pub default_mode: String,
    /// Optional JSON file overriding the built-in interview modes
    pub prompts_file: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 10,
            max_session_duration_secs: 900,
            sweep_interval_secs: 300,
            teardown_timeout_ms: 5000,
            send_failure_budget: 3,
            default_mode: "general_interviewer".to_string(),
            prompts_file: None,
        }
    }
}

impl SessionConfig {
    pub fn max_session_duration(&self) -> Duration {
        Duration::from_secs(self.max_session_duration_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_SESSIONS__MAX_CONCURRENT_SESSIONS=50`: Raise the session cap
    /// - `HOST` / `PORT`: Special cases for deployment platforms
    /// - `GOOGLE_API_KEY`: Upstream credential
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Some(key) = ["GOOGLE_API_KEY", "GEMINI_API_KEY"]
            .iter()
            .find_map(|name| env::var(name).ok())
        {
            settings = settings.set_override("upstream.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.sessions.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.sessions.max_session_duration_secs == 0 || self.sessions.sweep_interval_secs == 0 {
            return Err(anyhow::anyhow!("Session duration and sweep interval must be greater than 0"));
        }

        if self.sessions.send_failure_budget == 0 {
            return Err(anyhow::anyhow!("Send failure budget must be at least 1"));
        }

        if self.audio.inbound_chunk_bytes == 0 || self.audio.outbound_frame_multiplier == 0 {
            return Err(anyhow::anyhow!("Audio chunk sizes must be greater than 0"));
        }

        if self.audio.outbound_queue_capacity == 0 || self.audio.inbound_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Audio queue capacities must be greater than 0"));
        }

        if self.transcripts.max_buffer_chars <= self.transcripts.min_utterance_chars {
            return Err(anyhow::anyhow!(
                "Transcript max buffer ({}) must exceed the minimum utterance length ({})",
                self.transcripts.max_buffer_chars,
                self.transcripts.min_utterance_chars
            ));
        }

        if !matches!(self.transcripts.sink.as_str(), "log" | "jsonl") {
            return Err(anyhow::anyhow!("Unknown transcript sink '{}'", self.transcripts.sink));
        }

        if self.upstream.turn_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Upstream turn timeout must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial JSON document on top of the current configuration.
    ///
    /// Only the keys present in the document change, e.g.
    /// `{"transcripts": {"idle_flush_ms": 4000}}`. The result is validated
    /// and `self` is left untouched if validation fails.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let patch: serde_json::Value = serde_json::from_str(json_str)?;
        if !patch.is_object() {
            return Err(anyhow::anyhow!("Configuration update must be a JSON object"));
        }

        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, patch);
        let updated: AppConfig = serde_json::from_value(merged)?;
        updated.validate()?;

        *self = updated;
        Ok(())
    }

    /// Copy safe to return over the API.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.upstream.api_key.is_empty() {
            copy.upstream.api_key = "***".to_string();
        }
        copy
    }
}

fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
