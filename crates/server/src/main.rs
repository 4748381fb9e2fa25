//! Driftbox server
//!
//! Sandbox lifecycle orchestration and realtime event streaming for
//! agent-built apps. Serves HTTP + WebSocket; all long-running work lives
//! in background tasks observed through the event stream.

mod config;
mod executor;
mod health;
mod lifecycle;
mod logging;
mod persistence;
mod provider;
mod rate_limit;
mod remote_provider;
mod routes;
mod sandbox;
mod state;
mod websocket;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{delete, get, post};
use axum::Router;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::executor::AgentExecutor;
use crate::health::{HealthMonitor, HealthPolicy};
use crate::logging::init_logging;
use crate::persistence::{create_persistence_channel, ensure_schema, PersistenceWriter};
use crate::provider::ResourceProfile;
use crate::rate_limit::{RateLimiter, SystemClock};
use crate::remote_provider::{RemoteProvider, RemoteSnapshots};
use crate::routes::{
    build_handler, delete_project_handler, events_handler, health_handler, server_health_handler,
    stop_handler,
};
use crate::sandbox::SandboxController;
use crate::state::{AppContext, ProjectRegistry};
use crate::websocket::ws_handler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    let _logging = init_logging()?;

    let db_path = config.db_path();
    {
        // Fail fast on an unusable database before accepting traffic.
        let conn = rusqlite::Connection::open(&db_path)?;
        ensure_schema(&conn)?;
    }

    let (persist_tx, persist_rx) = create_persistence_channel();
    tokio::spawn(PersistenceWriter::new(persist_rx, db_path.clone()).run());

    let provider = Arc::new(RemoteProvider::new(
        config.provider_url.clone(),
        config.provider_api_key.clone(),
    ));
    let snapshots = Arc::new(RemoteSnapshots::new(
        config.snapshot_url.clone(),
        config.provider_api_key.clone(),
    ));

    let registry = Arc::new(ProjectRegistry::new(db_path, persist_tx.clone()));
    let controller = Arc::new(SandboxController::new(
        provider.clone(),
        persist_tx,
        ResourceProfile::default(),
    ));
    let executor = Arc::new(AgentExecutor::new(provider.clone(), registry.clone()));
    let monitor = Arc::new(HealthMonitor::new(
        provider,
        controller.clone(),
        snapshots,
        registry.clone(),
        HealthPolicy::default(),
    ));

    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit_max,
        Duration::from_secs(config.rate_limit_window_secs),
        Arc::new(SystemClock),
    ));
    let _sweeper = limiter.spawn_sweeper();

    let ctx = Arc::new(AppContext {
        registry,
        controller,
        executor,
        monitor,
        limiter,
        auto_restart: config.auto_restart,
    });

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(server_health_handler))
        .route("/projects/{id}/build", post(build_handler))
        .route("/projects/{id}/stop", post(stop_handler))
        .route("/projects/{id}/health", get(health_handler))
        .route("/projects/{id}/events", get(events_handler))
        .route("/projects/{id}", delete(delete_project_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(ctx);

    info!(
        component = "main",
        event = "server.listening",
        bind = %config.bind,
        "driftbox listening"
    );

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
