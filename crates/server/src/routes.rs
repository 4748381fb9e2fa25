//! HTTP surface
//!
//! The build trigger returns as soon as the background run is launched —
//! request latency is decoupled from agent runtime, and all further state
//! is observed through the event stream. User-visible failures are always
//! a `{status: "error", message}` pair; internal detail stays in the logs.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use driftbox_protocol::ServerMessage;

use crate::persistence;
use crate::state::AppContext;

#[derive(Debug, Deserialize)]
pub struct BuildRequest {
    pub prompt: String,
    #[serde(default)]
    pub resume_session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct HealthQuery {
    #[serde(default, rename = "autoRestart")]
    pub auto_restart: Option<bool>,
}

/// A user-facing failure: HTTP status + human-readable message.
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status,
            Json(serde_json::json!({
                "status": "error",
                "message": self.message,
            })),
        )
            .into_response()
    }
}

fn user_id(headers: &HeaderMap) -> String {
    // Session issuance is external; the gateway forwards the resolved user.
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string()
}

/// Shared build trigger used by the HTTP route and the WebSocket action.
pub async fn trigger_build(
    ctx: &Arc<AppContext>,
    project_id: &str,
    user_id: &str,
    prompt: &str,
    resume_session_id: Option<&str>,
) -> Result<(), ApiError> {
    if !ctx.limiter.check(&format!("{}:{}", user_id, project_id)) {
        return Err(ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "Too many build requests, try again shortly",
        ));
    }

    let record = persistence::load_sandbox(ctx.registry.db_path(), project_id)
        .await
        .map_err(|e| {
            warn!(
                component = "routes",
                event = "build.load_failed",
                project_id = %project_id,
                error = %e,
                "Failed to load sandbox record"
            );
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Could not read project state",
            )
        })?;

    let sandbox = ctx
        .controller
        .ensure(project_id, record.as_ref())
        .await
        .map_err(|e| match e {
            crate::sandbox::ControllerError::CreateInFlight => ApiError::new(
                StatusCode::CONFLICT,
                "A sandbox is already starting for this project",
            ),
            e => {
                warn!(
                    component = "routes",
                    event = "build.sandbox_failed",
                    project_id = %project_id,
                    error = %e,
                    "Could not provision sandbox"
                );
                ApiError::new(
                    StatusCode::BAD_GATEWAY,
                    "Could not start a sandbox for this project",
                )
            }
        })?;

    // One health poll loop per project, started alongside the first build.
    if !ctx.registry.has_health_task(project_id) {
        ctx.monitor.spawn_poll_loop(project_id, ctx.auto_restart);
    }

    let run = ctx
        .executor
        .start(
            project_id,
            user_id,
            &sandbox.sandbox_id,
            prompt,
            resume_session_id,
        )
        .await
        .map_err(|e| {
            warn!(
                component = "routes",
                event = "build.spawn_failed",
                project_id = %project_id,
                error = %e,
                "Could not launch the agent"
            );
            ApiError::new(StatusCode::BAD_GATEWAY, "Could not launch the build agent")
        })?;

    info!(
        component = "routes",
        event = "build.started",
        project_id = %project_id,
        sandbox_id = %sandbox.sandbox_id,
        reattached = sandbox.reattached,
        pid = ?run.pid,
        "Build started"
    );

    // The run continues in the background; clients watch the event stream.
    drop(run.task);

    ctx.registry
        .broadcast(
            project_id,
            ServerMessage::BuildStarted {
                project_id: project_id.to_string(),
            },
        )
        .await;

    Ok(())
}

pub async fn build_handler(
    State(ctx): State<Arc<AppContext>>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<BuildRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = user_id(&headers);
    trigger_build(
        &ctx,
        &project_id,
        &user,
        &request.prompt,
        request.resume_session_id.as_deref(),
    )
    .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "starting"})),
    ))
}

pub async fn stop_handler(
    State(ctx): State<Arc<AppContext>>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    // Stop the agent first so nothing keeps writing into a dying sandbox.
    let _ = ctx.executor.stop(&project_id).await;

    let record = persistence::load_sandbox(ctx.registry.db_path(), &project_id)
        .await
        .ok()
        .flatten();
    let status = record
        .as_ref()
        .map(|r| r.status)
        .unwrap_or(driftbox_protocol::SandboxStatus::Idle);
    let sandbox_id = record.and_then(|r| r.sandbox_id);

    ctx.registry.abort_health_task(&project_id);

    ctx.controller
        .stop(&project_id, sandbox_id.as_deref(), status)
        .await
        .map_err(|e| {
            warn!(
                component = "routes",
                event = "stop.failed",
                project_id = %project_id,
                error = %e,
                "Sandbox stop failed"
            );
            ApiError::new(StatusCode::BAD_GATEWAY, "Could not stop the sandbox")
        })?;

    Ok(Json(serde_json::json!({"status": "idle"})))
}

/// Project teardown: stop everything, then drop the event log, session
/// record, and sandbox reference. The only path that deletes events.
pub async fn delete_project_handler(
    State(ctx): State<Arc<AppContext>>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let _ = ctx.executor.stop(&project_id).await;

    let record = persistence::load_sandbox(ctx.registry.db_path(), &project_id)
        .await
        .ok()
        .flatten();
    let status = record
        .as_ref()
        .map(|r| r.status)
        .unwrap_or(driftbox_protocol::SandboxStatus::Idle);
    let sandbox_id = record.and_then(|r| r.sandbox_id);

    ctx.registry.abort_health_task(&project_id);
    let _ = ctx
        .controller
        .stop(&project_id, sandbox_id.as_deref(), status)
        .await;

    let _ = ctx
        .registry
        .persist()
        .send(persistence::PersistCommand::ProjectDelete {
            project_id: project_id.clone(),
        })
        .await;

    info!(
        component = "routes",
        event = "project.deleted",
        project_id = %project_id,
        "Project torn down"
    );
    Ok(Json(serde_json::json!({"status": "deleted"})))
}

pub async fn health_handler(
    State(ctx): State<Arc<AppContext>>,
    Path(project_id): Path<String>,
    Query(query): Query<HealthQuery>,
) -> impl IntoResponse {
    let auto_restart = query.auto_restart.unwrap_or(ctx.auto_restart);
    let report = ctx.monitor.check(&project_id, auto_restart).await;
    Json(report)
}

pub async fn events_handler(
    State(ctx): State<Arc<AppContext>>,
    Path(project_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(500).min(2000);
    let events =
        persistence::select_events_since(ctx.registry.db_path(), &project_id, query.since, limit)
            .await
            .map_err(|e| {
                warn!(
                    component = "routes",
                    event = "events.read_failed",
                    project_id = %project_id,
                    error = %e,
                    "Event read failed"
                );
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Could not read events")
            })?;

    Ok(Json(serde_json::json!({ "events": events })))
}

pub async fn server_health_handler() -> impl IntoResponse {
    "OK"
}
