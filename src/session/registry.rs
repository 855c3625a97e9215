//! # Session Registry
//!
//! Owns every live session and the relay attached to it.
//!
//! ## Key Features:
//! - **Concurrency limit**: `create` refuses new sessions past the configured cap
//! - **One relay per session**: starting a second relay while one runs fails
//!   with [`RegistryError::AlreadyActive`]
//! - **Idempotent teardown**: `end` on a missing or already-ended session is a no-op
//! - **Expiry sweep**: a background task force-ends sessions older than the
//!   maximum duration
//!
//! ## Locking:
//! The session map sits behind a std `RwLock` held only for map operations.
//! Each entry has its own async mutex around the relay handle, which
//! serializes start/stop/end for that one session without blocking others.

use super::relay::{ClientLink, ExitHook, RelayDeps, RelayHandle, RelayLoop, RelaySettings};
use super::{RegistryError, RelayExit, Session, SessionRef, SessionState};
use crate::config::AppConfig;
use crate::prompts::PromptCatalog;
use crate::state::RelayCounters;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub max_concurrent_sessions: usize,
    pub max_session_duration: Duration,
    pub sweep_interval: Duration,
    pub send_greeting: bool,
    pub relay: RelaySettings,
}

impl RegistrySettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_concurrent_sessions: config.sessions.max_concurrent_sessions,
            max_session_duration: config.sessions.max_session_duration(),
            sweep_interval: config.sessions.sweep_interval(),
            send_greeting: config.upstream.send_greeting,
            relay: RelaySettings::from_config(config),
        }
    }

    /// Upper bound on waiting for a relay to finish teardown.
    fn shutdown_wait(&self) -> Duration {
        self.relay.teardown_timeout * 2
    }
}

struct SessionEntry {
    session: SessionRef,
    created: Instant,
    relay: tokio::sync::Mutex<Option<RelayHandle>>,
}

struct RegistryInner {
    entries: RwLock<HashMap<String, Arc<SessionEntry>>>,
    settings: RwLock<RegistrySettings>,
    deps: RelayDeps,
    catalog: Arc<PromptCatalog>,
}

impl RegistryInner {
    /// Remove `session` from the map unless the id now belongs to a newer record.
    fn remove_if_same(&self, session: &SessionRef) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let same = entries
            .get(session.id())
            .is_some_and(|entry| entry.session.same_record(session));
        if same {
            entries.remove(session.id());
        }
        same
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(deps: RelayDeps, catalog: Arc<PromptCatalog>, settings: RegistrySettings) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: RwLock::new(HashMap::new()),
                settings: RwLock::new(settings),
                deps,
                catalog,
            }),
        }
    }

    pub fn settings(&self) -> RegistrySettings {
        self.inner
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply a new configuration to sessions and relays started afterwards.
    /// Running relays keep what they started with.
    pub fn apply_config(&self, config: &AppConfig) {
        *self
            .inner
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = RegistrySettings::from_config(config);
        self.inner.deps.connector.reconfigure(&config.upstream);
    }

    fn entry(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    /// Register a new session in the `Created` state.
    pub fn create(&self, session_id: &str, mode: &str) -> Result<Session, RegistryError> {
        if !self.inner.catalog.contains(mode) {
            return Err(RegistryError::UnknownMode(mode.to_string()));
        }
        let max = self.settings().max_concurrent_sessions;

        let mut entries = self
            .inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(session_id) {
            return Err(RegistryError::DuplicateSession(session_id.to_string()));
        }
        if entries.len() >= max {
            return Err(RegistryError::CapacityExceeded(max));
        }

        let session = SessionRef::new(Session::new(session_id, mode));
        let snapshot = session.snapshot();
        entries.insert(
            session_id.to_string(),
            Arc::new(SessionEntry {
                session,
                created: Instant::now(),
                relay: tokio::sync::Mutex::new(None),
            }),
        );
        info!(session_id, mode, active = entries.len(), "Session created");
        Ok(snapshot)
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.entry(session_id).map(|entry| entry.session.snapshot())
    }

    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|entry| entry.session.snapshot())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub fn len(&self) -> usize {
        self.inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn exit_hook(&self, entry: &Arc<SessionEntry>) -> ExitHook {
        let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let session = entry.session.clone();
        Box::new(move |exit: &RelayExit| {
            if !exit.ends_session() {
                return;
            }
            if let Some(inner) = registry.upgrade() {
                if inner.remove_if_same(&session) {
                    info!(session_id = %session.id(), reason = exit.reason(), "Session closed by relay");
                }
            }
            session.set_state(SessionState::Closed);
        })
    }

    /// Attach a relay to an existing session and start streaming.
    pub async fn start_relay(&self, session_id: &str, client: ClientLink) -> Result<(), RegistryError> {
        let entry = self
            .entry(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;

        let mut slot = entry.relay.lock().await;
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(RegistryError::AlreadyActive(session_id.to_string()));
        }
        *slot = None;

        if matches!(entry.session.state(), SessionState::Closing | SessionState::Closed) {
            return Err(RegistryError::NotFound(session_id.to_string()));
        }

        let settings = self.settings();
        let mode = entry.session.snapshot().mode;
        let profile = self
            .inner
            .catalog
            .session_profile(&mode, settings.send_greeting)
            .ok_or_else(|| RegistryError::UnknownMode(mode.clone()))?;

        let relay = RelayLoop::new(entry.session.clone(), self.inner.deps.clone(), settings.relay);
        match relay.start(profile, client, self.exit_hook(&entry)).await {
            Ok(handle) => {
                *slot = Some(handle);
                Ok(())
            }
            Err(source) => {
                warn!(session_id, "Relay failed to start: {}", source);
                Err(RegistryError::StartFailed {
                    session_id: session_id.to_string(),
                    source,
                })
            }
        }
    }

    /// Stop the session's relay but keep the session registered.
    pub async fn stop_relay(&self, session_id: &str) -> Result<Option<RelayExit>, RegistryError> {
        let entry = self
            .entry(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;

        // Held through teardown so no new relay starts until this one is gone
        let mut slot = entry.relay.lock().await;
        let Some(handle) = slot.take() else {
            return Ok(None);
        };

        let exit = handle
            .shutdown(RelayExit::StopRequested, self.settings().shutdown_wait())
            .await;
        if entry.session.state() != SessionState::Closed {
            entry.session.set_state(SessionState::Created);
        }
        Ok(exit)
    }

    /// End a session at the client's request. Unknown ids are ignored.
    pub async fn end(&self, session_id: &str) -> bool {
        self.end_with(session_id, RelayExit::EndRequested).await
    }

    /// Tear down a session and its relay. Returns whether the session existed.
    pub async fn end_with(&self, session_id: &str, exit: RelayExit) -> bool {
        let Some(entry) = self.entry(session_id) else {
            debug!(session_id, "End requested for unknown session");
            return false;
        };

        entry.session.set_state(SessionState::Closing);
        let mut slot = entry.relay.lock().await;
        if let Some(handle) = slot.take() {
            handle.shutdown(exit.clone(), self.settings().shutdown_wait()).await;
        }
        drop(slot);

        self.inner.remove_if_same(&entry.session);
        entry.session.set_state(SessionState::Closed);
        info!(session_id, reason = exit.reason(), "Session ended");
        true
    }

    /// Force-end sessions older than the maximum duration.
    pub async fn sweep_expired(&self) -> usize {
        let max_age = self.settings().max_session_duration;
        let expired: Vec<String> = self
            .inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, entry)| entry.created.elapsed() > max_age)
            .map(|(id, _)| id.clone())
            .collect();

        for session_id in &expired {
            warn!(
                session_id = %session_id,
                reason = RelayExit::MaxDurationExceeded.reason(),
                "Force-ending session"
            );
            if self.end_with(session_id, RelayExit::MaxDurationExceeded).await {
                RelayCounters::incr(&self.inner.deps.counters.sessions_expired);
            }
        }
        expired.len()
    }

    /// Run [`Self::sweep_expired`] every sweep interval until `shutdown` fires.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                let interval = registry.settings().sweep_interval;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let swept = registry.sweep_expired().await;
                if swept > 0 {
                    info!("Expiry sweep ended {} sessions", swept);
                }
            }
            debug!("Session sweeper stopped");
        })
    }

    /// End every session. Used on server shutdown.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self
            .inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for session_id in ids {
            self.end_with(&session_id, RelayExit::Shutdown).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ClientEvent, ClientInput};
    use crate::transcription::sink::TracingSink;
    use crate::transcription::{CompletionReason, Speaker};
    use crate::upstream::ServerEvent;
    use crate::upstream::testing::FakeConnector;
    use std::sync::atomic::Ordering;
    use tokio::sync::mpsc;

    fn registry_with(config: AppConfig) -> (SessionRegistry, Arc<FakeConnector>) {
        let connector = Arc::new(FakeConnector::default());
        let deps = RelayDeps::new(
            connector.clone(),
            Arc::new(TracingSink),
            Arc::new(RelayCounters::default()),
        );
        let registry = SessionRegistry::new(
            deps,
            Arc::new(PromptCatalog::builtin()),
            RegistrySettings::from_config(&config),
        );
        (registry, connector)
    }

    fn registry() -> (SessionRegistry, Arc<FakeConnector>) {
        registry_with(AppConfig::default())
    }

    fn link() -> (ClientLink, mpsc::Sender<ClientInput>, mpsc::Receiver<ClientEvent>) {
        let (input_tx, input_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::channel(64);
        (
            ClientLink {
                inbound: input_rx,
                outbound: events_tx,
            },
            input_tx,
            events_rx,
        )
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

    #[tokio::test]
    async fn test_create_rejects_duplicates_and_unknown_modes() {
        let (registry, _) = registry();
        let session = registry.create("s1", "amazon_interviewer").expect("create");
        assert_eq!(session.state, SessionState::Created);

        assert!(matches!(
            registry.create("s1", "amazon_interviewer"),
            Err(RegistryError::DuplicateSession(_))
        ));
        assert!(matches!(
            registry.create("s2", "astronaut"),
            Err(RegistryError::UnknownMode(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_create_enforces_capacity() {
        let mut config = AppConfig::default();
        config.sessions.max_concurrent_sessions = 2;
        let (registry, _) = registry_with(config);

        registry.create("a", "general_interviewer").expect("create");
        registry.create("b", "general_interviewer").expect("create");
        assert!(matches!(
            registry.create("c", "general_interviewer"),
            Err(RegistryError::CapacityExceeded(2))
        ));

        registry.end("a").await;
        assert!(registry.create("c", "general_interviewer").is_ok());
    }

    #[tokio::test]
    async fn test_start_relay_errors() {
        let (registry, connector) = registry();
        let (client, _input, _events) = link();
        assert!(matches!(
            registry.start_relay("missing", client).await,
            Err(RegistryError::NotFound(_))
        ));

        registry.create("s1", "general_interviewer").expect("create");
        let (client, _input1, _events1) = link();
        registry.start_relay("s1", client).await.expect("first start");
        assert_eq!(registry.get("s1").map(|s| s.state), Some(SessionState::Active));

        let (client, _input2, _events2) = link();
        assert!(matches!(
            registry.start_relay("s1", client).await,
            Err(RegistryError::AlreadyActive(_))
        ));
        assert_eq!(connector.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_start_keeps_session_for_retry() {
        let (registry, connector) = registry();
        registry.create("s1", "general_interviewer").expect("create");

        connector.fail_open.store(true, Ordering::SeqCst);
        let (client, _input, _events) = link();
        assert!(matches!(
            registry.start_relay("s1", client).await,
            Err(RegistryError::StartFailed { .. })
        ));
        assert_eq!(registry.get("s1").map(|s| s.state), Some(SessionState::Created));

        connector.fail_open.store(false, Ordering::SeqCst);
        let (client, _input, _events) = link();
        assert!(registry.start_relay("s1", client).await.is_ok());
    }

    #[tokio::test]
    async fn test_end_is_idempotent() {
        let (registry, connector) = registry();
        assert!(!registry.end("never-existed").await);

        registry.create("s1", "general_interviewer").expect("create");
        let (client, _input, _events) = link();
        registry.start_relay("s1", client).await.expect("start");

        assert!(registry.end("s1").await);
        assert!(!registry.end("s1").await);
        assert!(registry.get("s1").is_none());
        assert_eq!(connector.last_handle().close_calls.load(Ordering::SeqCst), 1);

        // The id is free again
        assert!(registry.create("s1", "general_interviewer").is_ok());
    }

    #[tokio::test]
    async fn test_relay_exit_removes_session() {
        let (registry, connector) = registry();
        registry.create("s1", "general_interviewer").expect("create");
        let (client, _input, _events) = link();
        registry.start_relay("s1", client).await.expect("start");

        connector.hang_up();
        wait_until(|| registry.get("s1").is_none()).await;
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_stop_relay_keeps_session() {
        let (registry, connector) = registry();
        registry.create("s1", "general_interviewer").expect("create");
        let (client, _input, _events) = link();
        registry.start_relay("s1", client).await.expect("start");

        let exit = registry.stop_relay("s1").await.expect("stop");
        assert_eq!(exit, Some(RelayExit::StopRequested));
        assert_eq!(registry.get("s1").map(|s| s.state), Some(SessionState::Created));
        assert_eq!(registry.stop_relay("s1").await.expect("second stop"), None);

        let (client, _input, _events) = link();
        registry.start_relay("s1", client).await.expect("restart");
        assert_eq!(connector.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_ends_expired_sessions() {
        let mut config = AppConfig::default();
        config.sessions.max_session_duration_secs = 10;
        config.sessions.sweep_interval_secs = 5;
        let (registry, connector) = registry_with(config);

        registry.create("old", "general_interviewer").expect("create");
        let (client, _input, _events) = link();
        registry.start_relay("old", client).await.expect("start");

        let shutdown = CancellationToken::new();
        let sweeper = registry.spawn_sweeper(shutdown.clone());

        tokio::time::sleep(Duration::from_secs(6)).await;
        registry.create("young", "general_interviewer").expect("create");

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(registry.get("old").is_none());
        assert!(registry.get("young").is_some());
        assert_eq!(connector.last_handle().close_calls.load(Ordering::SeqCst), 1);
        assert!(registry.create("old", "general_interviewer").is_ok());

        shutdown.cancel();
        sweeper.await.expect("sweeper stops");
    }

    #[tokio::test]
    async fn test_shutdown_all_ends_everything() {
        let (registry, _) = registry();
        for id in ["a", "b", "c"] {
            registry.create(id, "google_interviewer").expect("create");
        }
        let (client, _input, _events) = link();
        registry.start_relay("b", client).await.expect("start");

        registry.shutdown_all().await;
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_shutdown_flushes_relay_started_from_a_finished_worker() {
        let main = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("main runtime");
        let (registry, connector) = main.block_on(async { registry() });
        registry.create("s1", "general_interviewer").expect("create");

        // Start the relay from a short-lived runtime, as an HTTP worker would
        let worker_registry = registry.clone();
        let worker_connector = connector.clone();
        let (_input, mut events) = std::thread::spawn(move || {
            let worker = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("worker runtime");
            worker.block_on(async move {
                let (client, input, events) = link();
                worker_registry.start_relay("s1", client).await.expect("start");
                worker_connector
                    .last_events()
                    .send(Ok(ServerEvent::TranscriptDelta {
                        speaker: Speaker::Assistant,
                        text: "so the next question".to_string(),
                        provider: "test".to_string(),
                    }))
                    .expect("send");
                tokio::time::sleep(Duration::from_millis(100)).await;
                (input, events)
            })
        })
        .join()
        .expect("worker thread");

        assert_eq!(registry.len(), 1);
        main.block_on(registry.shutdown_all());
        assert_eq!(registry.len(), 0);
        assert_eq!(connector.last_handle().close_calls.load(Ordering::SeqCst), 1);

        let mut flushed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ClientEvent::Transcript(utterance) = event {
                flushed.push(utterance);
            }
        }
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].text, "so the next question");
        assert_eq!(flushed[0].reason, CompletionReason::SessionEndFlush);
    }
}
