//! # Transcript Aggregator
//!
//! Buffers transcript fragments per speaker and decides when a buffer has
//! become a complete utterance.
//!
//! ## Flush Rules:
//! 1. **Noise**: fragments of `noise_max_chars` or fewer with no `.`, `!`, `?`
//!    are ignored outright
//! 2. **Punctuation**: flush immediately when the buffer ends in terminal
//!    punctuation or contains one followed by a space
//! 3. **Length**: flush immediately when the buffer grows past `max_buffer_chars`
//! 4. **Idle**: otherwise flush once no fragment has arrived for `idle_flush`
//!
//! A flushed buffer is only emitted when its trimmed text is longer than
//! `min_utterance_chars`; shorter buffers are discarded.
//!
//! The aggregator owns no timers. The relay asks for [`TranscriptAggregator::next_deadline`]
//! and calls [`TranscriptAggregator::flush_expired`] when it passes, so a
//! deferred flush can never outlive its session.

use super::{CompletionReason, Speaker, TranscriptFragment, Utterance};
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const TERMINALS: [char; 3] = ['.', '!', '?'];

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub noise_max_chars: usize,
    pub min_utterance_chars: usize,
    pub max_buffer_chars: usize,
    pub idle_flush: Duration,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            noise_max_chars: 2,
            min_utterance_chars: 8,
            max_buffer_chars: 300,
            idle_flush: Duration::from_secs(6),
        }
    }
}

#[derive(Debug)]
struct SpeakerBuffer {
    text: String,
    provider: String,
    last_update: Instant,
    deadline: Option<Instant>,
}

/// Per-session aggregator holding one buffer per speaker.
#[derive(Debug)]
pub struct TranscriptAggregator {
    session_id: String,
    settings: AggregatorSettings,
    buffers: HashMap<Speaker, SpeakerBuffer>,
}

impl TranscriptAggregator {
    pub fn new(session_id: impl Into<String>, settings: AggregatorSettings) -> Self {
        Self {
            session_id: session_id.into(),
            settings,
            buffers: HashMap::new(),
        }
    }

    /// Append a fragment. Returns an utterance if this fragment completed one.
    pub fn append_fragment(&mut self, fragment: TranscriptFragment) -> Option<Utterance> {
        if self.is_noise(&fragment.text) {
            debug!(
                session_id = %self.session_id,
                speaker = fragment.speaker.as_str(),
                "Ignoring noise fragment {:?}", fragment.text
            );
            return None;
        }

        let now = Instant::now();
        let idle_flush = self.settings.idle_flush;
        let buffer = self
            .buffers
            .entry(fragment.speaker)
            .or_insert_with(|| SpeakerBuffer {
                text: String::new(),
                provider: fragment.provider.clone(),
                last_update: now,
                deadline: None,
            });

        buffer.text.push_str(&fragment.text);
        buffer.provider = fragment.provider;
        buffer.last_update = now;

        if let Some(reason) = self.immediate_flush_reason(fragment.speaker) {
            return self.flush(fragment.speaker, reason);
        }

        // Re-arm the idle deadline on every fragment
        if let Some(buffer) = self.buffers.get_mut(&fragment.speaker) {
            buffer.deadline = Some(now + idle_flush);
        }
        None
    }

    /// Earliest pending idle deadline across speakers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.buffers.values().filter_map(|b| b.deadline).min()
    }

    /// Flush every buffer whose idle deadline is at or before `now`.
    pub fn flush_expired(&mut self, now: Instant) -> Vec<Utterance> {
        let expired: Vec<Speaker> = self
            .buffers
            .iter()
            .filter(|(_, b)| b.deadline.is_some_and(|d| d <= now))
            .map(|(speaker, _)| *speaker)
            .collect();

        expired
            .into_iter()
            .filter_map(|speaker| self.flush(speaker, CompletionReason::IdleTimeout))
            .collect()
    }

    /// Flush all speakers. Used on session teardown.
    pub fn flush_all(&mut self) -> Vec<Utterance> {
        let speakers: Vec<Speaker> = self.buffers.keys().copied().collect();
        speakers
            .into_iter()
            .filter_map(|speaker| self.flush(speaker, CompletionReason::SessionEndFlush))
            .collect()
    }

    /// Text currently buffered for `speaker`.
    #[cfg(test)]
    pub fn pending(&self, speaker: Speaker) -> Option<&str> {
        self.buffers
            .get(&speaker)
            .map(|b| b.text.as_str())
            .filter(|t| !t.is_empty())
    }

    fn is_noise(&self, text: &str) -> bool {
        text.chars().count() <= self.settings.noise_max_chars && !text.contains(TERMINALS)
    }

    fn immediate_flush_reason(&self, speaker: Speaker) -> Option<CompletionReason> {
        let text = &self.buffers.get(&speaker)?.text;

        let ends_terminal = text.trim_end().ends_with(TERMINALS);
        let inner_terminal = TERMINALS
            .iter()
            .any(|t| text.contains(&format!("{} ", t)));
        if ends_terminal || inner_terminal {
            return Some(CompletionReason::Punctuation);
        }

        if text.chars().count() > self.settings.max_buffer_chars {
            return Some(CompletionReason::LengthThreshold);
        }
        None
    }

    fn flush(&mut self, speaker: Speaker, reason: CompletionReason) -> Option<Utterance> {
        let buffer = self.buffers.remove(&speaker)?;
        let text = buffer.text.trim();

        if text.chars().count() <= self.settings.min_utterance_chars {
            debug!(
                session_id = %self.session_id,
                speaker = speaker.as_str(),
                "Discarding short transcript {:?}", text
            );
            return None;
        }

        Some(Utterance {
            session_id: self.session_id.clone(),
            speaker,
            text: text.to_string(),
            provider: buffer.provider,
            confidence: None,
            reason,
            completed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(speaker: Speaker, text: &str) -> TranscriptFragment {
        TranscriptFragment {
            speaker,
            text: text.to_string(),
            provider: "test".to_string(),
        }
    }

    fn aggregator() -> TranscriptAggregator {
        TranscriptAggregator::new("s1", AggregatorSettings::default())
    }

    #[test]
    fn test_fragments_join_into_one_utterance() {
        let mut agg = aggregator();
        assert!(agg.append_fragment(fragment(Speaker::User, "I th")).is_none());
        assert!(agg.append_fragment(fragment(Speaker::User, "ink the")).is_none());
        let utterance = agg
            .append_fragment(fragment(Speaker::User, " answer is 4."))
            .expect("punctuation flush");

        assert_eq!(utterance.text, "I think the answer is 4.");
        assert_eq!(utterance.reason, CompletionReason::Punctuation);
        assert_eq!(utterance.speaker, Speaker::User);
        assert!(agg.pending(Speaker::User).is_none());
        assert!(agg.flush_all().is_empty());
    }

    #[test]
    fn test_noise_fragment_never_emitted() {
        let mut agg = aggregator();
        assert!(agg.append_fragment(fragment(Speaker::User, "um")).is_none());
        assert!(agg.pending(Speaker::User).is_none());
        assert!(agg.flush_all().is_empty());
    }

    #[test]
    fn test_short_punctuated_buffer_is_discarded() {
        let mut agg = aggregator();
        assert!(agg.append_fragment(fragment(Speaker::Assistant, "Yes.")).is_none());
        assert!(agg.pending(Speaker::Assistant).is_none());
    }

    #[test]
    fn test_inner_terminal_triggers_flush() {
        let mut agg = aggregator();
        let utterance = agg
            .append_fragment(fragment(Speaker::User, "That works. Next we"))
            .expect("inner punctuation flush");
        assert_eq!(utterance.text, "That works. Next we");
    }

    #[test]
    fn test_length_threshold_flush() {
        let mut agg = aggregator();
        let mut emitted = None;
        for _ in 0..40 {
            if let Some(u) = agg.append_fragment(fragment(Speaker::Assistant, "word word ")) {
                emitted = Some(u);
                break;
            }
        }
        let utterance = emitted.expect("length flush");
        assert_eq!(utterance.reason, CompletionReason::LengthThreshold);
        assert!(utterance.text.len() > 290);
    }

    #[test]
    fn test_speakers_are_buffered_separately() {
        let mut agg = aggregator();
        agg.append_fragment(fragment(Speaker::User, "tell me about"));
        agg.append_fragment(fragment(Speaker::Assistant, "Sure thing, let"));
        assert_eq!(agg.pending(Speaker::User), Some("tell me about"));
        assert_eq!(agg.pending(Speaker::Assistant), Some("Sure thing, let"));

        let flushed = agg.flush_all();
        assert_eq!(flushed.len(), 2);
        assert!(flushed.iter().all(|u| u.reason == CompletionReason::SessionEndFlush));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_deadline_flushes_after_quiet_period() {
        let mut agg = aggregator();
        agg.append_fragment(fragment(Speaker::User, "so the idea is"));
        let deadline = agg.next_deadline().expect("deadline armed");

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(agg.flush_expired(Instant::now()).is_empty());

        agg.append_fragment(fragment(Speaker::User, " that we"));
        let rearmed = agg.next_deadline().expect("deadline re-armed");
        assert!(rearmed > deadline);

        tokio::time::advance(Duration::from_secs(6)).await;
        let flushed = agg.flush_expired(Instant::now());
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].text, "so the idea is that we");
        assert_eq!(flushed[0].reason, CompletionReason::IdleTimeout);
        assert!(agg.next_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_flush_disarms_deadline() {
        let mut agg = aggregator();
        agg.append_fragment(fragment(Speaker::User, "almost there"));
        assert!(agg.next_deadline().is_some());
        agg.append_fragment(fragment(Speaker::User, " now!"));
        assert!(agg.next_deadline().is_none());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(agg.flush_expired(Instant::now()).is_empty());
    }
}
