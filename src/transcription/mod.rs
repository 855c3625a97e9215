//! # Transcription Module
//!
//! Turns the upstream's streaming transcript fragments into whole utterances
//! and hands them to a persistence sink.
//!
//! ## Key Components:
//! - **Aggregator**: per-speaker buffers with punctuation, length and idle flushing
//! - **Sink**: fire-and-forget persistence of completed utterances
//!
//! The upstream sends partial words ("I th", "ink the") for both the user's
//! speech and the model's spoken reply. Aggregation happens per speaker so the
//! two streams never interleave.

pub mod aggregator; // Fragment buffering and flush heuristics
pub mod sink;       // Utterance persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use aggregator::{AggregatorSettings, TranscriptAggregator};
pub use sink::{build_sink, TranscriptSink};

/// Who produced a piece of transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::User => "user",
            Speaker::Assistant => "assistant",
        }
    }
}

/// A partial transcript as delivered by the upstream.
#[derive(Debug, Clone)]
pub struct TranscriptFragment {
    pub speaker: Speaker,
    pub text: String,
    /// Which upstream channel produced this fragment
    pub provider: String,
}

/// Why an utterance was considered complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionReason {
    Punctuation,
    LengthThreshold,
    IdleTimeout,
    SessionEndFlush,
    /// Typed by the client rather than transcribed from audio
    DirectInput,
}

/// A completed utterance ready for persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utterance {
    pub session_id: String,
    pub speaker: Speaker,
    pub text: String,
    pub provider: String,
    pub confidence: Option<f32>,
    pub reason: CompletionReason,
    pub completed_at: DateTime<Utc>,
}
