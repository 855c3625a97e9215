//! # Session Management
//!
//! A session is one client conversation with the upstream model. The
//! [`SessionRegistry`] owns every session record; at most one [`RelayLoop`]
//! moves audio for a session at a time.
//!
//! ## Session Lifecycle:
//! 1. **Created**: registered, no relay yet
//! 2. **Connecting**: relay is opening the upstream
//! 3. **Active**: relay is streaming
//! 4. **Closing**: teardown in progress
//! 5. **Closed**: removed from the registry
//!
//! ## Relay Lifecycle:
//! `Init -> Connecting -> Streaming -> Draining -> Terminated`. A failed
//! upstream open goes straight from `Connecting` to `Terminated`.

pub mod error;    // RegistryError and RelayExit
pub mod registry; // Session ownership, limits and expiry sweep
pub mod relay;    // Per-session bidirectional pump

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use error::{RegistryError, RelayExit};
pub use registry::{RegistrySettings, SessionRegistry};
pub use relay::{ClientEvent, ClientInput, ClientLink, RelayDeps};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Connecting,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayPhase {
    Init,
    Connecting,
    Streaming,
    Draining,
    Terminated,
}

/// Snapshot of a session record.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub mode: String,
    pub state: SessionState,
    pub relay_phase: RelayPhase,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>, mode: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            mode: mode.into(),
            state: SessionState::Created,
            relay_phase: RelayPhase::Init,
            created_at: now,
            last_activity: now,
        }
    }
}

/// Shared reference to a live session record.
///
/// The registry owns the record; relays get a clone of this handle so they
/// can report activity and phase changes without going through the registry.
#[derive(Debug, Clone)]
pub struct SessionRef {
    id: Arc<str>,
    inner: Arc<Mutex<Session>>,
}

impl SessionRef {
    pub fn new(session: Session) -> Self {
        Self {
            id: Arc::from(session.id.as_str()),
            inner: Arc::new(Mutex::new(session)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> Session {
        self.lock().clone()
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn touch(&self) {
        self.lock().last_activity = Utc::now();
    }

    pub fn set_state(&self, state: SessionState) {
        self.lock().state = state;
    }

    /// Record a relay phase change and mirror it onto the session state.
    pub fn set_phase(&self, phase: RelayPhase) {
        let mut session = self.lock();
        session.relay_phase = phase;
        if session.state == SessionState::Closed {
            return;
        }
        session.state = match phase {
            RelayPhase::Init | RelayPhase::Terminated => match session.state {
                SessionState::Closing => SessionState::Closing,
                _ => SessionState::Created,
            },
            RelayPhase::Connecting => SessionState::Connecting,
            RelayPhase::Streaming => SessionState::Active,
            RelayPhase::Draining => SessionState::Closing,
        };
    }

    pub fn same_record(&self, other: &SessionRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
