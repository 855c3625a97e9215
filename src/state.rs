//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: Multiple ownership (many handlers hold a reference)
//! - **RwLock**: Many readers or one writer for config and HTTP metrics
//!
//! ### Atomics for hot counters
//! - Relay counters are bumped on every audio chunk, from many tasks at once
//! - `AtomicU64` avoids taking a lock on the audio path
//!
//! Lock poisoning is recovered from rather than propagated: every value
//! behind these locks stays consistent after a panic mid-update.

use crate::config::AppConfig;
use crate::prompts::PromptCatalog;
use crate::session::SessionRegistry;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// HTTP request metrics, updated by middleware
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Audio path counters, updated by relays
    pub relay_counters: Arc<RelayCounters>,

    pub registry: SessionRegistry,

    pub catalog: Arc<PromptCatalog>,

    /// When the server started
    pub start_time: Instant,
}

/// HTTP metrics collected across all requests.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Key: endpoint name (e.g., "GET /api/v1/health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// Counters for the audio relay path.
#[derive(Debug, Default)]
pub struct RelayCounters {
    pub relays_started: AtomicU64,
    pub relay_start_failures: AtomicU64,
    pub inbound_audio_bytes: AtomicU64,
    pub inbound_messages_dropped: AtomicU64,
    pub upstream_send_failures: AtomicU64,
    pub outbound_frames: AtomicU64,
    pub outbound_chunks_dropped: AtomicU64,
    pub outbound_chunks_discarded: AtomicU64,
    pub interruptions: AtomicU64,
    pub utterances_emitted: AtomicU64,
    pub sessions_expired: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayCountersSnapshot {
    pub relays_started: u64,
    pub relay_start_failures: u64,
    pub inbound_audio_bytes: u64,
    pub inbound_messages_dropped: u64,
    pub upstream_send_failures: u64,
    pub outbound_frames: u64,
    pub outbound_chunks_dropped: u64,
    pub outbound_chunks_discarded: u64,
    pub interruptions: u64,
    pub utterances_emitted: u64,
    pub sessions_expired: u64,
}

impl RelayCounters {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub fn snapshot(&self) -> RelayCountersSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RelayCountersSnapshot {
            relays_started: load(&self.relays_started),
            relay_start_failures: load(&self.relay_start_failures),
            inbound_audio_bytes: load(&self.inbound_audio_bytes),
            inbound_messages_dropped: load(&self.inbound_messages_dropped),
            upstream_send_failures: load(&self.upstream_send_failures),
            outbound_frames: load(&self.outbound_frames),
            outbound_chunks_dropped: load(&self.outbound_chunks_dropped),
            outbound_chunks_discarded: load(&self.outbound_chunks_discarded),
            interruptions: load(&self.interruptions),
            utterances_emitted: load(&self.utterances_emitted),
            sessions_expired: load(&self.sessions_expired),
        }
    }
}

impl AppState {
    pub fn new(
        config: AppConfig,
        registry: SessionRegistry,
        catalog: Arc<PromptCatalog>,
        relay_counters: Arc<RelayCounters>,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            relay_counters,
            registry,
            catalog,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration and push the session-facing parts to the
    /// registry and the upstream connector.
    ///
    /// Running relays keep the settings they started with.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        if !self.catalog.contains(&new_config.sessions.default_mode) {
            return Err(format!(
                "Unknown default mode '{}'",
                new_config.sessions.default_mode
            ));
        }
        self.registry.apply_config(&new_config);
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
