//! Study Room SFU
//!
//! Room coordinator and WebSocket signaling server for the media engine.
//!
//! # Servers
//!
//! - WebSocket signaling server (default: 0.0.0.0:8080, path `/ws`)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment and initialize tracing
//! 2. Initialize Prometheus metrics recorder
//! 3. Start the media worker and the shared routing context
//! 4. Initialize actor system (`RoomRegistryActorHandle`)
//! 5. Start health HTTP server (liveness, readiness, metrics)
//! 6. Start signaling server
//! 7. Wait for shutdown signal or media worker death
//!
//! A dead media worker cannot be rebuilt in-process; the service exits with
//! an error so its supervisor restarts it.

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sfu_service::actors::{ActorMetrics, RegistryLimits, RoomRegistryActorHandle};
use sfu_service::config::{Config, DEFAULT_ENGINE_LOG_LEVEL};
use sfu_service::engine::bootstrap::RouterSettings;
use sfu_service::engine::local::{LocalWorker, WorkerSettings};
use sfu_service::engine::{MediaEngineBootstrap, MediaWorker};
use sfu_service::errors::SfuError;
use sfu_service::observability::{health_router, init_metrics_recorder, HealthState};
use sfu_service::signaling::{signaling_router, SignalingState};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Grace period for connections to run their cleanup after shutdown starts.
const CONNECTION_DRAIN_PERIOD: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Configuration first: the engine log level feeds the tracing filter
    let config = Config::from_env();

    let engine_level = config
        .as_ref()
        .map_or(DEFAULT_ENGINE_LOG_LEVEL, |c| c.engine_log_level.as_str());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sfu_service=debug,tower_http=debug".into())
                .add_directive(engine_directive(engine_level)?),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting SFU service");

    let config = config.map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        sfu_id = %config.sfu_id,
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        rtc_min_port = config.rtc_min_port,
        rtc_max_port = config.rtc_max_port,
        listen_ip = %config.listen_ip,
        announced_ip = ?config.announced_ip,
        max_rooms = config.max_rooms,
        max_peers_per_room = config.max_peers_per_room,
        "Configuration loaded successfully"
    );

    // This must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    // Media engine: one worker and one routing context for the process
    info!("Starting media worker...");
    let worker = LocalWorker::spawn(WorkerSettings {
        rtc_min_port: config.rtc_min_port,
        rtc_max_port: config.rtc_max_port,
        listen_ip: config.listen_ip,
        announced_ip: config.announced_ip,
        log_level: config.engine_log_level.clone(),
    })
    .map_err(|e| {
        error!(error = %e, "Failed to start media worker");
        e
    })?;
    let worker: Arc<dyn MediaWorker> = Arc::new(worker);

    let engine = MediaEngineBootstrap::initialize(Arc::clone(&worker), RouterSettings::default())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to initialize media engine");
            e
        })?;
    info!(worker_id = %worker.id(), "Media engine started");

    info!("Initializing actor system...");
    let registry = RoomRegistryActorHandle::new(
        config.sfu_id.clone(),
        Arc::clone(&engine.routing),
        RegistryLimits {
            max_rooms: config.max_rooms,
            max_peers_per_room: config.max_peers_per_room,
        },
        ActorMetrics::new(),
    );
    info!("Actor system initialized");

    // Servers stop when this token is cancelled (child of the registry's)
    let shutdown_token = registry.child_token();

    // Start health HTTP server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let health_app = health_router(Arc::clone(&health_state), Some(prometheus_handle));

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });
    info!(addr = %health_addr, "Health server started");

    // Start signaling server
    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.signaling_bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;

    let signaling_app = signaling_router(SignalingState {
        registry: registry.clone(),
        routing: Arc::clone(&engine.routing),
        shutdown: shutdown_token.child_token(),
    });

    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;

    let signaling_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });
    info!(addr = %signaling_addr, "Signaling server started");

    health_state.set_ready();
    info!("SFU service running - press Ctrl+C to shutdown");

    let engine_died = tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
            false
        }
        () = engine.fatal.cancelled() => {
            error!("Media engine died, shutting down for restart");
            health_state.mark_engine_dead();
            true
        }
    };

    // Mark as not ready immediately so traffic stops
    health_state.set_not_ready();

    // Connections run their cleanup against the still-running registry
    shutdown_token.cancel();
    tokio::time::sleep(CONNECTION_DRAIN_PERIOD).await;

    // Close every room and its media resources
    if let Err(e) = registry.shutdown().await {
        warn!(error = %e, "Actor system shutdown error");
    }
    engine.stop_watchdog();

    if engine_died {
        return Err(SfuError::EngineUnavailable(format!("worker {} died", worker.id())).into());
    }

    info!("SFU service shutdown complete");
    Ok(())
}

/// Tracing directive for the media engine target.
fn engine_directive(level: &str) -> Result<Directive, tracing_subscriber::filter::ParseError> {
    let level = match level {
        "none" => "off",
        other => other,
    };
    format!("sfu.engine={level}").parse()
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// If a handler cannot be installed that source is logged and ignored.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
