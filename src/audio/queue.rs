//! # Outbound Audio Queue
//!
//! Bounded buffer between the upstream receive task and the client drain task.
//!
//! ## Key Features:
//! - **Drop-oldest overflow**: pushing into a full queue evicts the oldest
//!   chunk so the relay never stalls on a slow client
//! - **Barge-in**: [`OutboundAudioQueue::clear`] empties the queue and bumps a
//!   generation counter; chunks stamped with an older generation are stale
//! - **Single consumer**: one drain task waits on [`OutboundAudioQueue::pop`]

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// One queued upstream audio chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedChunk {
    pub data: Vec<u8>,
    /// Queue generation at push time
    pub generation: u64,
}

/// Result of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue was full and its oldest chunk was evicted
    DroppedOldest,
    /// The queue is closed; the chunk was discarded
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    chunks: VecDeque<QueuedChunk>,
    generation: u64,
    closed: bool,
}

#[derive(Debug)]
pub struct OutboundAudioQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl OutboundAudioQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                chunks: VecDeque::with_capacity(capacity),
                ..QueueState::default()
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, data: Vec<u8>) -> PushOutcome {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return PushOutcome::Closed;
            }

            let mut outcome = PushOutcome::Queued;
            if state.chunks.len() >= self.capacity {
                state.chunks.pop_front();
                outcome = PushOutcome::DroppedOldest;
            }
            let generation = state.generation;
            state.chunks.push_back(QueuedChunk { data, generation });
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Wait for the next chunk. Returns `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<QueuedChunk> {
        loop {
            {
                let mut state = self.lock();
                if let Some(chunk) = state.chunks.pop_front() {
                    return Some(chunk);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Discard everything queued and start a new generation.
    ///
    /// Returns the number of chunks discarded.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let discarded = state.chunks.len();
        state.chunks.clear();
        state.generation += 1;
        discarded
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().chunks.len()
    }
}
