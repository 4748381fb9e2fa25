//! Client → Server messages

use serde::{Deserialize, Serialize};

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // Subscriptions
    Subscribe {
        project_id: String,
        /// Catch-up cursor: only events created after this timestamp are
        /// replayed in the subscribe ack. Omitted = recent window.
        #[serde(skip_serializing_if = "Option::is_none")]
        since: Option<chrono::DateTime<chrono::Utc>>,
    },
    Unsubscribe {
        project_id: String,
    },

    // Actions
    StartBuild {
        project_id: String,
        prompt: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        resume_session_id: Option<String>,
    },
    StopAgent {
        project_id: String,
    },
    StopSandbox {
        project_id: String,
    },
    CheckHealth {
        project_id: String,
        #[serde(default)]
        auto_restart: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::ClientMessage;

    #[test]
    fn deserializes_subscribe_without_cursor() {
        let json = r#"{"type":"subscribe","project_id":"proj-1"}"#;
        let parsed: ClientMessage = serde_json::from_str(json).expect("parse subscribe");
        match parsed {
            ClientMessage::Subscribe { project_id, since } => {
                assert_eq!(project_id, "proj-1");
                assert!(since.is_none());
            }
            other => panic!("unexpected message variant: {:?}", other),
        }
    }

    #[test]
    fn roundtrip_start_build() {
        let json = r#"{
          "type":"start_build",
          "project_id":"proj-2",
          "prompt":"Add a dark mode toggle",
          "resume_session_id":"sess-abc"
        }"#;

        let parsed: ClientMessage = serde_json::from_str(json).expect("parse start_build");
        match &parsed {
            ClientMessage::StartBuild {
                project_id,
                prompt,
                resume_session_id,
            } => {
                assert_eq!(project_id, "proj-2");
                assert_eq!(prompt, "Add a dark mode toggle");
                assert_eq!(resume_session_id.as_deref(), Some("sess-abc"));
            }
            other => panic!("unexpected variant: {:?}", other),
        }

        let serialized = serde_json::to_string(&parsed).expect("serialize");
        let _: ClientMessage = serde_json::from_str(&serialized).expect("reparse");
    }

    #[test]
    fn check_health_auto_restart_defaults_to_false() {
        let json = r#"{"type":"check_health","project_id":"proj-3"}"#;
        let parsed: ClientMessage = serde_json::from_str(json).expect("parse check_health");
        match parsed {
            ClientMessage::CheckHealth { auto_restart, .. } => assert!(!auto_restart),
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
