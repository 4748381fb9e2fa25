//! Server → Client messages

use serde::{Deserialize, Serialize};

use crate::types::{EventRecord, HealthReport};

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Subscribe ack. Carries the catch-up batch so the client can merge
    /// historical and push deliveries by event id.
    Subscribed {
        project_id: String,
        events: Vec<EventRecord>,
    },
    Unsubscribed {
        project_id: String,
    },

    // Incremental updates
    EventAppended {
        project_id: String,
        event: EventRecord,
    },
    HealthChanged {
        project_id: String,
        report: HealthReport,
    },

    // Lifecycle
    BuildStarted {
        project_id: String,
    },
    AgentStopped {
        project_id: String,
    },

    // Errors — always a code + human-readable message, never internal detail
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
    },
}
