//! Persistence for completed utterances.
//!
//! The relay never waits on storage: [`spawn_persist`] hands each utterance
//! to a background task and only logs failures.

use super::Utterance;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("transcript storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transcript serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[async_trait]
pub trait TranscriptSink: Send + Sync {
    async fn persist_utterance(&self, utterance: &Utterance) -> Result<(), StorageError>;
}

/// Writes utterances to the structured log.
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl TranscriptSink for TracingSink {
    async fn persist_utterance(&self, utterance: &Utterance) -> Result<(), StorageError> {
        info!(
            session_id = %utterance.session_id,
            speaker = utterance.speaker.as_str(),
            provider = %utterance.provider,
            reason = ?utterance.reason,
            "Transcript: {}", utterance.text
        );
        Ok(())
    }
}

/// Appends one JSON object per utterance to a file.
#[derive(Debug)]
pub struct JsonlFileSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl TranscriptSink for JsonlFileSink {
    async fn persist_utterance(&self, utterance: &Utterance) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(utterance)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Build the sink named in configuration. Unknown kinds fall back to logging.
pub fn build_sink(kind: &str, path: &str) -> Arc<dyn TranscriptSink> {
    match kind {
        "jsonl" => Arc::new(JsonlFileSink::new(path)),
        "log" => Arc::new(TracingSink),
        other => {
            warn!("Unknown transcript sink '{}', using log sink", other);
            Arc::new(TracingSink)
        }
    }
}

/// Persist in the background. Failures are logged, never propagated.
pub fn spawn_persist(sink: Arc<dyn TranscriptSink>, utterance: Utterance) {
    tokio::spawn(async move {
        if let Err(e) = sink.persist_utterance(&utterance).await {
            warn!(
                session_id = %utterance.session_id,
                "Failed to persist utterance: {}", e
            );
        }
    });
}
