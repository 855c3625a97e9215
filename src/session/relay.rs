//! # Relay Loop
//!
//! Moves audio and events between one client and its upstream session.
//!
//! ## Tasks:
//! - **Client input**: normalizes client audio, slices it and sends it upstream;
//!   forwards typed text; handles client barge-in
//! - **Upstream events**: queues synthesized audio, aggregates transcripts,
//!   reacts to interruption and turn markers
//! - **Outbound drain**: regroups queued audio into fixed-size frames for the
//!   client, flushing a partial frame after a quiet period
//! - **Supervisor**: waits for the first exit signal, then cancels the others,
//!   flushes transcripts and releases the upstream
//!
//! All tasks share one [`CancellationToken`]. Whichever task hits a terminal
//! condition reports a [`RelayExit`] to the supervisor and returns.

use super::{RelayExit, RelayPhase, SessionRef};
use crate::audio::{
    AudioFormat, AudioFrame, AudioProcessor, InboundChunker, OutboundAccumulator,
    OutboundAudioQueue, PcmSpec, PushOutcome,
};
use crate::config::AppConfig;
use crate::state::RelayCounters;
use crate::transcription::sink::spawn_persist;
use crate::transcription::{
    AggregatorSettings, CompletionReason, Speaker, TranscriptAggregator, TranscriptFragment,
    TranscriptSink, Utterance,
};
use crate::upstream::{
    EventStream, ServerEvent, SessionProfile, UpstreamConnector, UpstreamError, UpstreamHandle,
};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Messages from the client connection into the relay.
#[derive(Debug, Clone)]
pub enum ClientInput {
    Audio {
        data: Vec<u8>,
        format: AudioFormat,
        sample_rate: Option<u32>,
    },
    Text(String),
    /// The user started talking over the model
    Interrupt,
}

/// Messages from the relay to the client connection.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Audio {
        data: Vec<u8>,
        sample_rate: u32,
        timestamp: DateTime<Utc>,
    },
    Transcript(Utterance),
    Interrupted,
    TurnComplete,
    Stopped(RelayExit),
}

/// Channel pair connecting a relay to its client.
pub struct ClientLink {
    pub inbound: mpsc::Receiver<ClientInput>,
    pub outbound: mpsc::Sender<ClientEvent>,
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub inbound_chunk_bytes: usize,
    pub outbound_frame_bytes: usize,
    pub outbound_idle_flush: Duration,
    pub outbound_queue_capacity: usize,
    pub output_sample_rate: u32,
    pub teardown_timeout: Duration,
    pub send_failure_budget: u32,
    pub receive_idle_timeout: Option<Duration>,
    /// PCM layout client audio is normalized into
    pub input: PcmSpec,
    pub aggregator: AggregatorSettings,
}

impl RelaySettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            inbound_chunk_bytes: config.audio.inbound_chunk_bytes,
            outbound_frame_bytes: config.audio.outbound_frame_bytes(),
            outbound_idle_flush: Duration::from_millis(config.audio.outbound_idle_flush_ms),
            outbound_queue_capacity: config.audio.outbound_queue_capacity,
            output_sample_rate: config.audio.output_sample_rate,
            teardown_timeout: Duration::from_millis(config.sessions.teardown_timeout_ms),
            send_failure_budget: config.sessions.send_failure_budget,
            receive_idle_timeout: match config.upstream.receive_idle_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            input: PcmSpec {
                sample_rate: config.audio.input_sample_rate,
                channels: config.audio.input_channels,
                bit_depth: config.audio.input_bit_depth,
            },
            aggregator: AggregatorSettings {
                noise_max_chars: config.transcripts.noise_max_chars,
                min_utterance_chars: config.transcripts.min_utterance_chars,
                max_buffer_chars: config.transcripts.max_buffer_chars,
                idle_flush: Duration::from_millis(config.transcripts.idle_flush_ms),
            },
        }
    }
}

/// Long-lived collaborators shared by every relay.
#[derive(Clone)]
pub struct RelayDeps {
    pub connector: Arc<dyn UpstreamConnector>,
    pub sink: Arc<dyn TranscriptSink>,
    pub counters: Arc<RelayCounters>,
    /// Runtime relays are opened and run on. HTTP workers come and go with
    /// their own runtimes, so relays must not live on the caller's.
    pub runtime: Option<Handle>,
}

impl RelayDeps {
    /// Relays will run on the Tokio runtime this is called from, if any.
    pub fn new(
        connector: Arc<dyn UpstreamConnector>,
        sink: Arc<dyn TranscriptSink>,
        counters: Arc<RelayCounters>,
    ) -> Self {
        Self {
            connector,
            sink,
            counters,
            runtime: Handle::try_current().ok(),
        }
    }
}

/// Invoked once by the supervisor after teardown completes.
pub type ExitHook = Box<dyn FnOnce(&RelayExit) + Send + 'static>;

/// Control handle for a running relay.
pub struct RelayHandle {
    cancel: CancellationToken,
    requested: Arc<Mutex<Option<RelayExit>>>,
    supervisor: JoinHandle<RelayExit>,
}

impl RelayHandle {
    pub fn is_finished(&self) -> bool {
        self.supervisor.is_finished()
    }

    /// Ask the relay to stop. The first requested reason wins.
    pub fn request_stop(&self, exit: RelayExit) {
        {
            let mut requested = self.requested.lock().unwrap_or_else(PoisonError::into_inner);
            if requested.is_none() {
                *requested = Some(exit);
            }
        }
        self.cancel.cancel();
    }

    /// Stop the relay and wait for teardown, aborting it after `wait`.
    pub async fn shutdown(self, exit: RelayExit, wait: Duration) -> Option<RelayExit> {
        self.request_stop(exit);
        let mut supervisor = self.supervisor;
        match tokio::time::timeout(wait, &mut supervisor).await {
            Ok(Ok(exit)) => Some(exit),
            Ok(Err(e)) => {
                warn!("Relay supervisor failed: {}", e);
                None
            }
            Err(_) => {
                warn!("Relay teardown exceeded {:?}, aborting", wait);
                supervisor.abort();
                None
            }
        }
    }
}

/// Starts relays for sessions.
pub struct RelayLoop {
    session: SessionRef,
    deps: RelayDeps,
    settings: RelaySettings,
}

struct RelayContext {
    session: SessionRef,
    upstream: Arc<dyn UpstreamHandle>,
    processor: AudioProcessor,
    queue: OutboundAudioQueue,
    client_tx: mpsc::Sender<ClientEvent>,
    exit_tx: mpsc::Sender<RelayExit>,
    cancel: CancellationToken,
    deps: RelayDeps,
    settings: RelaySettings,
}

impl RelayLoop {
    pub fn new(session: SessionRef, deps: RelayDeps, settings: RelaySettings) -> Self {
        Self {
            session,
            deps,
            settings,
        }
    }

    /// Open the upstream and spawn the relay tasks on the relay runtime.
    ///
    /// Returns once the relay is streaming. On error no task has been
    /// spawned and the upstream is not held.
    pub async fn start(
        self,
        profile: SessionProfile,
        client: ClientLink,
        on_exit: ExitHook,
    ) -> Result<RelayHandle, UpstreamError> {
        let Some(runtime) = self.deps.runtime.clone() else {
            return self.open_and_spawn(profile, client, on_exit).await;
        };
        runtime
            .spawn(self.open_and_spawn(profile, client, on_exit))
            .await
            .map_err(|e| UpstreamError::Connect(format!("relay runtime unavailable: {}", e)))?
    }

    async fn open_and_spawn(
        self,
        profile: SessionProfile,
        client: ClientLink,
        on_exit: ExitHook,
    ) -> Result<RelayHandle, UpstreamError> {
        let RelayLoop {
            session,
            deps,
            settings,
        } = self;

        session.set_phase(RelayPhase::Connecting);
        info!(session_id = %session.id(), "Opening upstream via {}", deps.connector.name());

        let connection = match deps.connector.open(&profile).await {
            Ok(connection) => connection,
            Err(e) => {
                session.set_phase(RelayPhase::Terminated);
                RelayCounters::incr(&deps.counters.relay_start_failures);
                return Err(e);
            }
        };

        if let Some(greeting) = profile.greeting.as_deref() {
            if let Err(e) = connection.handle.send_text(greeting).await {
                warn!(session_id = %session.id(), "Failed to send greeting: {}", e);
            }
        }

        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = mpsc::channel(4);
        let requested = Arc::new(Mutex::new(None));

        let ctx = Arc::new(RelayContext {
            session: session.clone(),
            upstream: connection.handle,
            processor: AudioProcessor::new(settings.input.clone()),
            queue: OutboundAudioQueue::new(settings.outbound_queue_capacity),
            client_tx: client.outbound,
            exit_tx,
            cancel: cancel.clone(),
            deps,
            settings,
        });

        let inbound = tokio::spawn(pump_client_input(ctx.clone(), client.inbound));
        let receive = tokio::spawn(pump_upstream_events(ctx.clone(), connection.events));
        let drain = tokio::spawn(drain_outbound(ctx.clone()));

        session.set_phase(RelayPhase::Streaming);
        RelayCounters::incr(&ctx.deps.counters.relays_started);
        info!(session_id = %session.id(), "Relay streaming");

        let supervisor = tokio::spawn(supervise(
            ctx,
            exit_rx,
            requested.clone(),
            RelayTasks {
                inbound,
                receive,
                drain,
            },
            on_exit,
        ));

        Ok(RelayHandle {
            cancel,
            requested,
            supervisor,
        })
    }
}

impl RelayContext {
    fn session_id(&self) -> &str {
        self.session.id()
    }

    fn signal_exit(&self, exit: RelayExit) {
        // The supervisor only needs the first signal
        let _ = self.exit_tx.try_send(exit);
    }

    fn emit_utterance(&self, utterance: Utterance) {
        RelayCounters::incr(&self.deps.counters.utterances_emitted);
        spawn_persist(self.deps.sink.clone(), utterance.clone());
        if self
            .client_tx
            .try_send(ClientEvent::Transcript(utterance))
            .is_err()
        {
            debug!(session_id = %self.session_id(), "Client busy, transcript not forwarded");
        }
    }

    /// Send a control event to the client without waiting.
    fn notify_client(&self, event: ClientEvent) {
        if self.client_tx.try_send(event).is_err() {
            debug!(session_id = %self.session_id(), "Client busy, control event dropped");
        }
    }

    /// Deliver an audio frame. Returns false when the client is gone.
    async fn deliver_audio(&self, data: Vec<u8>) -> bool {
        let event = ClientEvent::Audio {
            data,
            sample_rate: self.settings.output_sample_rate,
            timestamp: Utc::now(),
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => true,
            sent = self.client_tx.send(event) => {
                if sent.is_ok() {
                    RelayCounters::incr(&self.deps.counters.outbound_frames);
                }
                sent.is_ok()
            }
        }
    }
}

/// Send `frame` upstream in order. PCM is sliced to `chunker`'s size;
/// compressed containers go as one piece. Stops at the first failure.
pub async fn send_chunked(
    upstream: &dyn UpstreamHandle,
    frame: &AudioFrame,
    chunker: &InboundChunker,
) -> Result<usize, UpstreamError> {
    if frame.format != AudioFormat::Pcm {
        upstream.send_audio(frame).await?;
        return Ok(frame.data.len());
    }

    let mut sent = 0;
    for slice in chunker.slices(&frame.data) {
        upstream.send_audio(&frame.with_data(slice.to_vec())).await?;
        sent += slice.len();
    }
    Ok(sent)
}

async fn pump_client_input(ctx: Arc<RelayContext>, mut inbound: mpsc::Receiver<ClientInput>) {
    let chunker = InboundChunker::new(ctx.settings.inbound_chunk_bytes);
    let budget = ctx.settings.send_failure_budget;
    let counters = ctx.deps.counters.clone();
    let mut consecutive_failures = 0u32;

    loop {
        let input = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return,
            input = inbound.recv() => input,
        };

        let result = match input {
            None => {
                ctx.signal_exit(RelayExit::ClientDisconnected);
                return;
            }
            Some(ClientInput::Interrupt) => {
                let discarded = ctx.queue.clear();
                RelayCounters::add(&counters.outbound_chunks_discarded, discarded as u64);
                debug!(session_id = %ctx.session_id(), "Client barge-in, discarded {} chunks", discarded);
                continue;
            }
            Some(ClientInput::Audio {
                data,
                format,
                sample_rate,
            }) => {
                ctx.session.touch();
                let frame = ctx.processor.normalize_to_pcm(data, &format, sample_rate);
                send_chunked(ctx.upstream.as_ref(), &frame, &chunker)
                    .await
                    .map(|bytes| RelayCounters::add(&counters.inbound_audio_bytes, bytes as u64))
            }
            Some(ClientInput::Text(text)) => {
                ctx.session.touch();
                let result = ctx.upstream.send_text(&text).await;
                let typed = text.trim();
                if result.is_ok() && !typed.is_empty() {
                    ctx.emit_utterance(Utterance {
                        session_id: ctx.session_id().to_string(),
                        speaker: Speaker::User,
                        text: typed.to_string(),
                        provider: "client_text".to_string(),
                        confidence: None,
                        reason: CompletionReason::DirectInput,
                        completed_at: Utc::now(),
                    });
                }
                result
            }
        };

        match result {
            Ok(()) => consecutive_failures = 0,
            Err(e) => {
                consecutive_failures += 1;
                RelayCounters::incr(&counters.upstream_send_failures);
                warn!(
                    session_id = %ctx.session_id(),
                    "Upstream send failed ({}/{}): {}", consecutive_failures, budget, e
                );
                if e.is_fatal() {
                    ctx.signal_exit(RelayExit::UpstreamFailed(e.to_string()));
                    return;
                }
                if consecutive_failures >= budget {
                    ctx.signal_exit(RelayExit::SendBudgetExhausted);
                    return;
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Returns the aggregator so the supervisor can flush it after cancellation.
async fn pump_upstream_events(
    ctx: Arc<RelayContext>,
    mut events: EventStream,
) -> TranscriptAggregator {
    let counters = ctx.deps.counters.clone();
    let mut aggregator =
        TranscriptAggregator::new(ctx.session_id(), ctx.settings.aggregator.clone());
    let mut last_event = Instant::now();

    loop {
        let idle_deadline = ctx.settings.receive_idle_timeout.map(|d| last_event + d);

        let next = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            _ = sleep_until_opt(aggregator.next_deadline()) => {
                for utterance in aggregator.flush_expired(Instant::now()) {
                    ctx.emit_utterance(utterance);
                }
                continue;
            }
            _ = sleep_until_opt(idle_deadline) => {
                warn!(session_id = %ctx.session_id(), "No upstream traffic within idle timeout");
                ctx.signal_exit(RelayExit::UpstreamFailed("receive idle timeout".to_string()));
                break;
            }
            next = events.next() => next,
        };
        last_event = Instant::now();

        match next {
            Some(Ok(ServerEvent::AudioChunk(bytes))) => {
                if ctx.queue.push(bytes) == PushOutcome::DroppedOldest {
                    RelayCounters::incr(&counters.outbound_chunks_dropped);
                    debug!(session_id = %ctx.session_id(), "Outbound queue full, dropped oldest chunk");
                }
            }
            Some(Ok(ServerEvent::TranscriptDelta {
                speaker,
                text,
                provider,
            })) => {
                let fragment = TranscriptFragment {
                    speaker,
                    text,
                    provider,
                };
                if let Some(utterance) = aggregator.append_fragment(fragment) {
                    ctx.emit_utterance(utterance);
                }
            }
            Some(Ok(ServerEvent::Interrupted)) => {
                let discarded = ctx.queue.clear();
                RelayCounters::incr(&counters.interruptions);
                RelayCounters::add(&counters.outbound_chunks_discarded, discarded as u64);
                info!(session_id = %ctx.session_id(), "Upstream interrupted, discarded {} chunks", discarded);
                ctx.notify_client(ClientEvent::Interrupted);
            }
            Some(Ok(ServerEvent::TurnComplete)) => {
                debug!(session_id = %ctx.session_id(), "Turn complete");
                ctx.notify_client(ClientEvent::TurnComplete);
            }
            Some(Ok(ServerEvent::Error(detail))) => {
                warn!(session_id = %ctx.session_id(), "Upstream reported: {}", detail);
            }
            Some(Err(UpstreamError::Closed)) | None => {
                ctx.signal_exit(RelayExit::UpstreamClosed);
                break;
            }
            Some(Err(e)) => {
                warn!(session_id = %ctx.session_id(), "Upstream receive failed: {}", e);
                ctx.signal_exit(RelayExit::UpstreamFailed(e.to_string()));
                break;
            }
        }
    }

    aggregator
}

async fn drain_outbound(ctx: Arc<RelayContext>) {
    let mut accumulator = OutboundAccumulator::new(ctx.settings.outbound_frame_bytes);
    let mut generation = ctx.queue.generation();

    loop {
        let popped = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            popped = tokio::time::timeout(ctx.settings.outbound_idle_flush, ctx.queue.pop()) => popped,
        };

        // A barge-in since the last pass makes anything buffered stale
        let current = ctx.queue.generation();
        if current != generation {
            accumulator.clear();
            generation = current;
        }

        let frames = match popped {
            Ok(Some(chunk)) if chunk.generation == generation => accumulator.push(&chunk.data),
            Ok(Some(_stale)) => continue,
            Ok(None) => break,
            Err(_idle) => accumulator.flush().into_iter().collect(),
        };

        for frame in frames {
            if ctx.queue.generation() != generation {
                accumulator.clear();
                break;
            }
            if !ctx.deliver_audio(frame).await {
                ctx.signal_exit(RelayExit::ClientDisconnected);
                return;
            }
        }
    }
}

struct RelayTasks {
    inbound: JoinHandle<()>,
    receive: JoinHandle<TranscriptAggregator>,
    drain: JoinHandle<()>,
}

async fn join_or_abort(task: &mut JoinHandle<()>, deadline: Instant, name: &str, session_id: &str) {
    match tokio::time::timeout_at(deadline, &mut *task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(session_id, "Relay {} task failed: {}", name, e),
        Err(_) => {
            warn!(session_id, "Relay {} task did not stop in time, aborting", name);
            task.abort();
        }
    }
}

async fn supervise(
    ctx: Arc<RelayContext>,
    mut exit_rx: mpsc::Receiver<RelayExit>,
    requested: Arc<Mutex<Option<RelayExit>>>,
    mut tasks: RelayTasks,
    on_exit: ExitHook,
) -> RelayExit {
    let signalled = tokio::select! {
        Some(exit) = exit_rx.recv() => Some(exit),
        _ = ctx.cancel.cancelled() => None,
    };
    let exit = requested
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .or(signalled)
        .unwrap_or(RelayExit::EndRequested);

    let session_id = ctx.session_id().to_string();
    info!(session_id = %session_id, reason = exit.reason(), "Relay draining");
    ctx.session.set_phase(RelayPhase::Draining);
    ctx.cancel.cancel();
    ctx.queue.close();

    let deadline = Instant::now() + ctx.settings.teardown_timeout;
    join_or_abort(&mut tasks.inbound, deadline, "client input", &session_id).await;
    join_or_abort(&mut tasks.drain, deadline, "outbound drain", &session_id).await;
    let aggregator = match tokio::time::timeout_at(deadline, &mut tasks.receive).await {
        Ok(Ok(aggregator)) => Some(aggregator),
        Ok(Err(e)) => {
            warn!(session_id = %session_id, "Relay upstream task failed: {}", e);
            None
        }
        Err(_) => {
            warn!(session_id = %session_id, "Relay upstream task did not stop in time, aborting");
            tasks.receive.abort();
            None
        }
    };

    if let Some(mut aggregator) = aggregator {
        for utterance in aggregator.flush_all() {
            ctx.emit_utterance(utterance);
        }
    }

    ctx.upstream.close().await;
    ctx.notify_client(ClientEvent::Stopped(exit.clone()));
    ctx.session.set_phase(RelayPhase::Terminated);
    info!(session_id = %session_id, reason = exit.reason(), "Relay terminated");

    on_exit(&exit);
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, SessionState};
    use crate::transcription::sink::TracingSink;
    use crate::upstream::testing::FakeConnector;
    use std::sync::atomic::Ordering;

    struct Harness {
        connector: Arc<FakeConnector>,
        session: SessionRef,
        input_tx: mpsc::Sender<ClientInput>,
        events_rx: mpsc::Receiver<ClientEvent>,
        exits: Arc<Mutex<Vec<RelayExit>>>,
        handle: RelayHandle,
        counters: Arc<RelayCounters>,
    }

    fn settings() -> RelaySettings {
        let mut settings = RelaySettings::from_config(&AppConfig::default());
        settings.outbound_idle_flush = Duration::from_millis(50);
        settings.teardown_timeout = Duration::from_secs(1);
        settings
    }

    async fn start(settings: RelaySettings, profile: SessionProfile) -> Harness {
        let connector = Arc::new(FakeConnector::default());
        let counters = Arc::new(RelayCounters::default());
        let deps = RelayDeps::new(connector.clone(), Arc::new(TracingSink), counters.clone());
        let session = SessionRef::new(Session::new("s1", "general_interviewer"));
        let (input_tx, input_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::channel(64);
        let exits = Arc::new(Mutex::new(Vec::new()));
        let hook_exits = exits.clone();

        let handle = RelayLoop::new(session.clone(), deps, settings)
            .start(
                profile,
                ClientLink {
                    inbound: input_rx,
                    outbound: events_tx,
                },
                Box::new(move |exit| hook_exits.lock().unwrap().push(exit.clone())),
            )
            .await
            .expect("relay starts");

        Harness {
            connector,
            session,
            input_tx,
            events_rx,
            exits,
            handle,
            counters,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    async fn next_event(rx: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    fn pcm(len: usize) -> ClientInput {
        ClientInput::Audio {
            data: vec![1u8; len],
            format: AudioFormat::Pcm,
            sample_rate: None,
        }
    }

    #[tokio::test]
    async fn test_start_sends_greeting_and_streams() {
        let h = start(
            settings(),
            SessionProfile {
                system_instruction: "interview".to_string(),
                greeting: Some("Say hello".to_string()),
            },
        )
        .await;
        assert_eq!(h.session.state(), SessionState::Active);
        assert_eq!(*h.connector.last_handle().texts.lock().unwrap(), vec!["Say hello"]);
        assert_eq!(h.counters.relays_started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inbound_audio_is_sliced_in_order() {
        let h = start(settings(), SessionProfile::default()).await;
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 200) as u8).collect();
        h.input_tx
            .send(ClientInput::Audio {
                data: data.clone(),
                format: AudioFormat::Pcm,
                sample_rate: None,
            })
            .await
            .expect("send");

        let upstream = h.connector.last_handle();
        wait_until(|| upstream.audio.lock().unwrap().len() == 3).await;

        let frames = upstream.audio.lock().unwrap().clone();
        let sizes: Vec<usize> = frames.iter().map(|f| f.data.len()).collect();
        assert_eq!(sizes, vec![1024, 1024, 452]);
        let joined: Vec<u8> = frames.into_iter().flat_map(|f| f.data).collect();
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn test_outbound_audio_is_framed_then_flushed() {
        let mut h = start(settings(), SessionProfile::default()).await;
        let events = h.connector.last_events();
        for _ in 0..10 {
            events.send(Ok(ServerEvent::AudioChunk(vec![3u8; 1000]))).expect("send");
        }

        let mut sizes = Vec::new();
        while sizes.iter().sum::<usize>() < 10_000 {
            match next_event(&mut h.events_rx).await {
                ClientEvent::Audio { data, sample_rate, .. } => {
                    assert_eq!(sample_rate, 24000);
                    sizes.push(data.len());
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(sizes, vec![4096, 4096, 1808]);
    }

    #[tokio::test]
    async fn test_interruption_discards_pending_audio() {
        let mut h = start(settings(), SessionProfile::default()).await;
        let events = h.connector.last_events();
        events.send(Ok(ServerEvent::AudioChunk(vec![5u8; 1000]))).expect("send");
        events.send(Ok(ServerEvent::Interrupted)).expect("send");

        assert!(matches!(next_event(&mut h.events_rx).await, ClientEvent::Interrupted));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.events_rx.try_recv().is_err(), "stale audio delivered after interruption");
        assert_eq!(h.counters.interruptions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transcript_fragments_reach_client_as_one_utterance() {
        let mut h = start(settings(), SessionProfile::default()).await;
        let events = h.connector.last_events();
        for text in ["I th", "ink the", " answer is 4."] {
            events
                .send(Ok(ServerEvent::TranscriptDelta {
                    speaker: Speaker::User,
                    text: text.to_string(),
                    provider: "test".to_string(),
                }))
                .expect("send");
        }

        match next_event(&mut h.events_rx).await {
            ClientEvent::Transcript(utterance) => {
                assert_eq!(utterance.text, "I think the answer is 4.");
                assert_eq!(utterance.reason, CompletionReason::Punctuation);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upstream_close_tears_down_once() {
        let mut h = start(settings(), SessionProfile::default()).await;
        h.connector.hang_up();

        loop {
            if let ClientEvent::Stopped(exit) = next_event(&mut h.events_rx).await {
                assert_eq!(exit, RelayExit::UpstreamClosed);
                break;
            }
        }
        wait_until(|| h.handle.is_finished()).await;
        assert_eq!(*h.exits.lock().unwrap(), vec![RelayExit::UpstreamClosed]);
        assert_eq!(h.connector.last_handle().close_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.session.snapshot().relay_phase, RelayPhase::Terminated);
    }

    #[tokio::test]
    async fn test_send_failures_exhaust_budget() {
        let h = start(settings(), SessionProfile::default()).await;
        h.connector.last_handle().fail_sends.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            h.input_tx.send(pcm(100)).await.expect("send");
        }

        wait_until(|| h.handle.is_finished()).await;
        assert_eq!(*h.exits.lock().unwrap(), vec![RelayExit::SendBudgetExhausted]);
        assert_eq!(h.counters.upstream_send_failures.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let h = start(settings(), SessionProfile::default()).await;
        let upstream = h.connector.last_handle();

        upstream.fail_sends.store(true, Ordering::SeqCst);
        h.input_tx.send(pcm(10)).await.expect("send");
        h.input_tx.send(pcm(10)).await.expect("send");
        wait_until(|| h.counters.upstream_send_failures.load(Ordering::SeqCst) == 2).await;

        upstream.fail_sends.store(false, Ordering::SeqCst);
        h.input_tx.send(pcm(10)).await.expect("send");
        wait_until(|| upstream.audio.lock().unwrap().len() == 1).await;

        upstream.fail_sends.store(true, Ordering::SeqCst);
        h.input_tx.send(pcm(10)).await.expect("send");
        h.input_tx.send(pcm(10)).await.expect("send");
        wait_until(|| h.counters.upstream_send_failures.load(Ordering::SeqCst) == 4).await;
        assert!(!h.handle.is_finished());
    }

    #[tokio::test]
    async fn test_client_disconnect_ends_relay() {
        let h = start(settings(), SessionProfile::default()).await;
        drop(h.input_tx);
        wait_until(|| h.handle.is_finished()).await;
        assert_eq!(*h.exits.lock().unwrap(), vec![RelayExit::ClientDisconnected]);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_transcript() {
        let mut h = start(settings(), SessionProfile::default()).await;
        h.connector
            .last_events()
            .send(Ok(ServerEvent::TranscriptDelta {
                speaker: Speaker::Assistant,
                text: "so the next question".to_string(),
                provider: "test".to_string(),
            }))
            .expect("send");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let exit = h
            .handle
            .shutdown(RelayExit::EndRequested, Duration::from_secs(2))
            .await;
        assert_eq!(exit, Some(RelayExit::EndRequested));

        let mut flushed = None;
        while let Ok(event) = h.events_rx.try_recv() {
            if let ClientEvent::Transcript(utterance) = event {
                flushed = Some(utterance);
            }
        }
        let utterance = flushed.expect("flushed utterance");
        assert_eq!(utterance.reason, CompletionReason::SessionEndFlush);
        assert_eq!(utterance.text, "so the next question");
        assert_eq!(h.connector.last_handle().close_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_failure_spawns_nothing() {
        let connector = Arc::new(FakeConnector::default());
        connector.fail_open.store(true, Ordering::SeqCst);
        let counters = Arc::new(RelayCounters::default());
        let deps = RelayDeps::new(connector, Arc::new(TracingSink), counters.clone());
        let session = SessionRef::new(Session::new("s1", "general_interviewer"));
        let (_input_tx, input_rx) = mpsc::channel(1);
        let (events_tx, _events_rx) = mpsc::channel(1);

        let result = RelayLoop::new(session.clone(), deps, settings())
            .start(
                SessionProfile::default(),
                ClientLink {
                    inbound: input_rx,
                    outbound: events_tx,
                },
                Box::new(|_| {}),
            )
            .await;

        assert!(matches!(result, Err(UpstreamError::Connect(_))));
        assert_eq!(session.state(), SessionState::Created);
        assert_eq!(counters.relay_start_failures.load(Ordering::SeqCst), 1);
    }
}
