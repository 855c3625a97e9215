//! # Live Audio Relay - Main Application Entry Point
//!
//! Relays live audio between browser clients and a realtime speech model.
//!
//! ## Application Architecture:
//! - **config**: Handles application configuration (config file + environment variables)
//! - **state**: Shared application state and metrics
//! - **session**: Session registry and the per-session relay loop
//! - **upstream**: Realtime speech service client (Gemini Live)
//! - **audio**: Format normalization, chunking and the outbound queue
//! - **transcription**: Transcript aggregation and persistence
//! - **websocket**: Client WebSocket endpoint
//! - **health / handlers**: HTTP API
//! - **middleware**: Request logging and metrics
//! - **error**: HTTP error responses

mod audio;         // PCM normalization, framing, outbound queue
mod config;        // Configuration management (config.rs)
mod error;         // Error handling types (error.rs)
mod handlers;      // HTTP request handlers (handlers/ directory)
mod health;        // Health check endpoints (health.rs)
mod middleware;    // Custom middleware (middleware/ directory)
mod prompts;       // Interview mode catalog
mod session;       // Session registry and relay loop
mod state;         // Application state management (state.rs)
mod transcription; // Transcript aggregation and sinks
mod upstream;      // Realtime speech service adapter
mod websocket;     // Client WebSocket actor

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use config::AppConfig;
use prompts::PromptCatalog;
use session::{RegistrySettings, RelayDeps, SessionRegistry};
use state::{AppState, RelayCounters};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream::GeminiLiveConnector;

/// Prompts file picked up from the working directory when none is configured.
const DEFAULT_PROMPTS_FILE: &str = "prompts.json";

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load().context("Failed to load configuration")?;
    config.validate()?;

    info!("Starting live-audio-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if config.upstream.api_key.is_empty() {
        warn!("No upstream API key configured; set GOOGLE_API_KEY before starting sessions");
    }

    let prompts_file = config
        .sessions
        .prompts_file
        .clone()
        .or_else(|| Path::new(DEFAULT_PROMPTS_FILE).exists().then(|| DEFAULT_PROMPTS_FILE.to_string()));
    let catalog = Arc::new(PromptCatalog::load(prompts_file.as_deref()));
    if !catalog.contains(&config.sessions.default_mode) {
        anyhow::bail!("Default mode '{}' is not in the prompt catalog", config.sessions.default_mode);
    }

    let counters = Arc::new(RelayCounters::default());
    let connector = Arc::new(GeminiLiveConnector::new(config.upstream.clone()));
    let sink = transcription::build_sink(&config.transcripts.sink, &config.transcripts.jsonl_path);
    // Relays run on this runtime so they survive HTTP worker shutdown
    let deps = RelayDeps::new(connector, sink, counters.clone());
    let registry = SessionRegistry::new(deps, catalog.clone(), RegistrySettings::from_config(&config));

    let app_state = AppState::new(config.clone(), registry.clone(), catalog, counters);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let sweeper_shutdown = CancellationToken::new();
    let sweeper = registry.spawn_sweeper(sweeper_shutdown.clone());

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware runs in reverse order of registration for responses
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/prompts", web::get().to(handlers::list_prompts))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{session_id}", web::get().to(handlers::get_session))
                    .route("/sessions/{session_id}", web::delete().to(handlers::end_session)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws", web::get().to(websocket::relay_websocket_new))
            .route("/ws/{session_id}", web::get().to(websocket::relay_websocket))
    })
    // Signals are handled below so sessions can drain before exit
    .disable_signals()
    .bind(&bind_addr)
    .with_context(|| format!("Failed to bind {}", bind_addr))?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, ending {} live sessions", registry.len());
            sweeper_shutdown.cancel();
            registry.shutdown_all().await;
            info!("Stopping server...");
            server_handle.stop(true).await;
        }
    }

    sweeper_shutdown.cancel();
    if let Err(e) = sweeper.await {
        warn!("Session sweeper ended abnormally: {}", e);
    }

    // Sessions created while the server was stopping
    registry.shutdown_all().await;

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// `RUST_LOG` controls verbosity; defaults to
/// `live_audio_relay=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_audio_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("Failed to initialize tracing")?;

    Ok(())
}

/// Resolve on SIGINT or SIGTERM. If a handler cannot be installed, only the
/// other signal is awaited.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
