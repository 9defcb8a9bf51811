//! MQ Worker Service
//!
//! Hosts an `MqServer` on Redis with the demo `Reverse` and `Hello` handlers.
//!
//! ## Architecture
//!
//! ```text
//! Client ── LPUSH mq:Hello.inq ──► Redis ◄── PUBLISH mq:topic:in "mq:Hello.inq"
//!                                    │
//!                      control thread (SUBSCRIBE mq:topic:in)
//!                                    │ wakes
//!                     worker threads (RPOP mq:Hello.inq, mq:Hello.priorityq)
//!                                    │
//!                   mq:Hello.outq / reply_to / mq:Hello.dlq
//! ```
//!
//! ## Features
//!
//! - One OS thread per worker, `Hello` runs two
//! - Retry then dead-letter on handler failure
//! - Self-healing control loop with capped backoff
//! - Health, lifecycle and DLQ admin endpoints
//! - Graceful shutdown on SIGINT/SIGTERM

pub mod handlers;

use axum::Router;
use core_config::{app_info, redis::RedisConfig, server::HealthServerConfig, Environment, FromEnv};
use eyre::{Result, WrapErr};
use mq_server::{full_admin_router, metrics, HealthState, MqServer, MqServerConfig, RedisBroker};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

/// Start the health and admin HTTP server
///
/// Provides endpoints for:
/// - Liveness probes: `/health`, `/healthz`
/// - Readiness probes: `/ready`, `/readyz`
/// - Server monitoring: `/mq/status`, `/mq/stats`, `/mq/stats/description`
/// - Prometheus metrics: `/metrics`
/// - Lifecycle and DLQ admin: `/admin/mq/*`
async fn start_health_server(health_state: HealthState, config: HealthServerConfig) -> Result<()> {
    let app: Router = full_admin_router(health_state);

    let addr = config.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(address = %addr, "Health and admin server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Register the demo handlers
fn register_handlers(server: &MqServer) -> Result<()> {
    server
        .register_handler(handlers::reverse)
        .wrap_err("Failed to register Reverse handler")?;
    server
        .register_handler_with(handlers::hello, None, 2)
        .wrap_err("Failed to register Hello handler")?;
    Ok(())
}

/// Run the MQ worker
///
/// This is the main entry point for the worker. It:
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Connects to Redis with retry
/// 3. Registers handlers and starts the server
/// 4. Serves health and admin endpoints until a shutdown signal arrives
///
/// # Errors
///
/// Returns an error if:
/// - Redis or server configuration is invalid
/// - Redis connection fails
/// - The server cannot start
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    metrics::init_metrics();

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, "Starting MQ worker service");
    info!("Environment: {:?}", environment);

    let health_config =
        HealthServerConfig::from_env().wrap_err("Failed to load health server configuration")?;
    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;
    let mq_config = MqServerConfig::from_env().wrap_err("Failed to load MQ server configuration")?;
    info!(
        retry_count = mq_config.retry_count,
        keep_alive_retry_after = ?mq_config.keep_alive_retry_after,
        control_topic = %mq_config.control_topic,
        queue_prefix = %mq_config.queue_prefix,
        "MQ server configuration loaded"
    );

    // Connecting blocks, so keep it off the runtime threads
    info!("Connecting to Redis...");
    let url = redis_config.build_url();
    let broker = tokio::task::spawn_blocking(move || RedisBroker::connect_with_retry(&url, None))
        .await
        .wrap_err("Redis connect task panicked")?
        .wrap_err("Failed to connect to Redis")?;
    info!("Connected to Redis successfully");

    let server = MqServer::new(Arc::new(broker), mq_config);
    register_handlers(&server)?;

    let starter = server.clone();
    tokio::task::spawn_blocking(move || starter.start())
        .await
        .wrap_err("Server start task panicked")?
        .wrap_err("Failed to start MQ server")?;
    info!("MQ server started");

    let health_state = HealthState::new(server.clone(), app_info.name, app_info.version);
    let health_server = tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_config).await {
            error!(error = %e, "Health server failed");
        }
    });

    if let Err(e) = shutdown_signal().await {
        error!("Error waiting for shutdown signal: {}", e);
    }

    health_server.abort();

    // Dispose joins worker threads
    tokio::task::spawn_blocking(move || server.dispose())
        .await
        .wrap_err("Server dispose task panicked")?;

    info!("MQ worker service stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install signal handler")?
            .recv()
            .await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mq_server::{InMemoryBroker, WorkerStatus};

    #[test]
    fn test_register_handlers_builds_priority_and_inbox_workers() {
        let server = MqServer::new(Arc::new(InMemoryBroker::new()), MqServerConfig::new());
        register_handlers(&server).unwrap();
        server.init().unwrap();

        assert_eq!(server.workers_for("mq:Reverse.inq").len(), 1);
        assert_eq!(server.workers_for("mq:Hello.inq").len(), 2);
        assert_eq!(server.workers_for("mq:Hello.priorityq").len(), 2);
        assert_eq!(server.status(), WorkerStatus::Stopped);
    }

    #[test]
    fn test_register_handlers_twice_fails() {
        let server = MqServer::new(Arc::new(InMemoryBroker::new()), MqServerConfig::new());
        register_handlers(&server).unwrap();
        assert!(register_handlers(&server).is_err());
    }
}
