//! # Upstream Speech Service
//!
//! Abstraction over the bidirectional realtime speech service the relay talks to.
//!
//! ## Key Components:
//! - **[`UpstreamConnector`]**: opens one upstream session per relay
//! - **[`UpstreamHandle`]**: send side of an open session, plus idempotent release
//! - **[`EventStream`]**: receive side, yielding normalized [`ServerEvent`]s
//! - **Gemini adapter**: the production implementation over WebSocket
//!
//! Send and receive halves are separate so the relay can drive them from
//! different tasks without sharing a lock.

pub mod gemini;   // Gemini Live BidiGenerateContent adapter
pub mod protocol; // Wire message types

use crate::audio::AudioFrame;
use crate::config::UpstreamConfig;
use crate::transcription::Speaker;
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

pub use gemini::GeminiLiveConnector;

/// Normalized event from the upstream.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Synthesized speech, raw PCM bytes
    AudioChunk(Vec<u8>),
    TranscriptDelta {
        speaker: Speaker,
        text: String,
        provider: String,
    },
    /// The model stopped speaking because the user barged in
    Interrupted,
    TurnComplete,
    /// Non-fatal upstream notice
    Error(String),
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to connect to upstream: {0}")]
    Connect(String),

    #[error("failed to send to upstream: {0}")]
    Send(String),

    #[error("failed to receive from upstream: {0}")]
    Receive(String),

    #[error("upstream protocol error: {0}")]
    Protocol(String),

    #[error("upstream operation timed out after {0}ms")]
    Timeout(u64),

    #[error("upstream session closed")]
    Closed,
}

impl UpstreamError {
    /// Errors after which the session cannot continue regardless of retry budget.
    pub fn is_fatal(&self) -> bool {
        matches!(self, UpstreamError::Timeout(_) | UpstreamError::Closed)
    }
}

/// Per-session parameters passed to [`UpstreamConnector::open`].
#[derive(Debug, Clone, Default)]
pub struct SessionProfile {
    pub system_instruction: String,
    pub greeting: Option<String>,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<ServerEvent, UpstreamError>> + Send>>;

/// An open upstream session.
pub struct UpstreamConnection {
    pub handle: Arc<dyn UpstreamHandle>,
    pub events: EventStream,
}

#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Connect and complete the service handshake.
    async fn open(&self, profile: &SessionProfile) -> Result<UpstreamConnection, UpstreamError>;

    /// Replace connection settings for sessions opened afterwards.
    fn reconfigure(&self, config: &UpstreamConfig);

    fn name(&self) -> &'static str;
}

#[async_trait]
pub trait UpstreamHandle: Send + Sync {
    async fn send_audio(&self, frame: &AudioFrame) -> Result<(), UpstreamError>;

    async fn send_text(&self, text: &str) -> Result<(), UpstreamError>;

    /// Release the session. Safe to call more than once.
    async fn close(&self);
}
