use crate::upstream::UpstreamError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session '{0}' already exists")]
    DuplicateSession(String),

    #[error("session '{0}' not found")]
    NotFound(String),

    #[error("session '{0}' already has an active relay")]
    AlreadyActive(String),

    #[error("maximum concurrent sessions ({0}) reached")]
    CapacityExceeded(usize),

    #[error("unknown interview mode '{0}'")]
    UnknownMode(String),

    #[error("failed to start relay for session '{session_id}': {source}")]
    StartFailed {
        session_id: String,
        #[source]
        source: UpstreamError,
    },
}

/// Why a relay stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum RelayExit {
    ClientDisconnected,
    /// The client or an API caller ended the session
    EndRequested,
    /// Audio stopped but the session stays open
    StopRequested,
    MaxDurationExceeded,
    Shutdown,
    UpstreamClosed,
    UpstreamFailed(String),
    SendBudgetExhausted,
}

impl RelayExit {
    pub fn reason(&self) -> &'static str {
        match self {
            RelayExit::ClientDisconnected => "client_disconnected",
            RelayExit::EndRequested => "end_requested",
            RelayExit::StopRequested => "stop_requested",
            RelayExit::MaxDurationExceeded => "max_duration_exceeded",
            RelayExit::Shutdown => "shutdown",
            RelayExit::UpstreamClosed => "upstream_closed",
            RelayExit::UpstreamFailed(_) => "upstream_failed",
            RelayExit::SendBudgetExhausted => "send_budget_exhausted",
        }
    }

    /// Whether the owning session should be torn down along with the relay.
    pub fn ends_session(&self) -> bool {
        !matches!(self, RelayExit::StopRequested)
    }
}
