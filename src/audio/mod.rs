//! # Audio Module
//!
//! Byte-level audio handling for the relay. Nothing in here knows about
//! sessions or the upstream; it only shapes audio.
//!
//! ## Key Components:
//! - **Processor**: normalizes client audio into 16kHz/16-bit/mono PCM
//! - **Chunker**: fixed-size inbound slices, accumulated outbound frames
//! - **Queue**: bounded drop-oldest buffer for upstream audio awaiting the client
//!
//! ## Audio Format Requirements:
//! - **Upstream input**: 16kHz, 16-bit PCM, mono, little-endian
//! - **Upstream output**: 24kHz PCM, passed to the client untouched

pub mod chunker;    // Inbound slicing and outbound frame accumulation
pub mod processor;  // Format detection and PCM normalization
pub mod queue;      // Outbound drop-oldest queue

pub use chunker::{InboundChunker, OutboundAccumulator};
pub use processor::{AudioFormat, AudioFrame, AudioProcessor, PcmSpec};
pub use queue::{OutboundAudioQueue, PushOutcome};
