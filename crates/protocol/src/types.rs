//! Core types shared across the protocol

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Administrative sandbox status — reflects intent, not observed liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Idle,
    Starting,
    Ready,
    Error,
}

/// Persisted sandbox reference for a project.
///
/// `sandbox_id` is None while a create is in flight — the `starting` row is
/// written before any expensive provisioning so a crash mid-setup is still
/// observable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub project_id: String,
    pub sandbox_id: Option<String>,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
    pub dev_server_url: Option<String>,
    pub preview_code: Option<String>,
}

/// Live-probed liveness classification, distinct from `SandboxStatus`.
/// Never stored — computed from process/port/HTTP probes on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Sleeping,
    Starting,
    MetroStarting,
    Ready,
    Error,
}

/// Health status wire contract. Field names are camelCase on the wire per
/// the external API contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub status: HealthStatus,
    pub sandbox_alive: bool,
    pub dev_server_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_code: Option<String>,
    pub message: String,
}

impl HealthReport {
    /// An error report with a human-readable message and nothing alive.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            status: HealthStatus::Error,
            sandbox_alive: false,
            dev_server_running: false,
            url: None,
            preview_code: None,
            message: message.into(),
        }
    }

    /// Report for a project with no sandbox reference.
    pub fn sleeping() -> Self {
        Self {
            healthy: false,
            status: HealthStatus::Sleeping,
            sandbox_alive: false,
            dev_server_running: false,
            url: None,
            preview_code: None,
            message: "Sandbox is not running".to_string(),
        }
    }
}

/// Registry record for an agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSessionRecord {
    pub session_id: String,
    pub project_id: String,
    pub user_id: String,
    pub working_directory: String,
    pub pid: Option<i64>,
    pub last_activity_at: DateTime<Utc>,
}

/// Subtype of a `system` agent event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemSubtype {
    Init,
    Config,
    Permission,
}

/// Terminal outcome of an agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultOutcome {
    Success,
    Error,
    MaxTurns,
    Timeout,
    Cancelled,
}

/// A content block inside an `assistant` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { name: String, input: Value },
}

/// Closed union of agent events. Raw NDJSON lines are mapped into this
/// type by the ingest crate or discarded — untyped payloads never pass
/// through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    System {
        subtype: SystemSubtype,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Assistant {
        blocks: Vec<ContentBlock>,
    },
    ToolResult {
        content: String,
        is_error: bool,
    },
    Result {
        outcome: ResultOutcome,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        num_turns: Option<u32>,
    },
    /// Partial text delta. Recognized so it never hits the malformed path,
    /// but not persisted — the final assistant event carries the full text.
    StreamEvent {
        text: String,
    },
    Log {
        line: String,
    },
    RuntimeError {
        message: String,
    },
}

impl AgentEvent {
    /// Stable discriminant string used as the `event_type` column.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::System { .. } => "system",
            AgentEvent::Assistant { .. } => "assistant",
            AgentEvent::ToolResult { .. } => "tool_result",
            AgentEvent::Result { .. } => "result",
            AgentEvent::StreamEvent { .. } => "stream_event",
            AgentEvent::Log { .. } => "log",
            AgentEvent::RuntimeError { .. } => "runtime_error",
        }
    }

    /// Whether this event is written to the durable log.
    pub fn is_persisted(&self) -> bool {
        !matches!(self, AgentEvent::StreamEvent { .. })
    }
}

/// A persisted event, id assigned at ingestion time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub event: AgentEvent,
    pub created_at: DateTime<Utc>,
}
