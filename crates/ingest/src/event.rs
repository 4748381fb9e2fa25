//! Typed parse of agent stdout lines
//!
//! The agent CLI emits one JSON object per line. Anything that is not a
//! recognized event — blank lines, stderr chatter that leaked into the
//! stream, objects without a `type` field — is expected noise and is
//! discarded without logging an error.

use serde_json::Value;
use tracing::debug;

use driftbox_protocol::{AgentEvent, ContentBlock, ResultOutcome, SystemSubtype};

/// Parse one line into a typed event. Returns `None` for noise.
pub fn parse_line(line: &str) -> Option<AgentEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let raw: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return None,
    };

    let msg_type = raw.get("type").and_then(|v| v.as_str())?;

    match msg_type {
        "system" => parse_system(&raw),
        "assistant" => parse_assistant(&raw),
        "tool_result" => parse_tool_result(&raw),
        "result" => parse_result(&raw),
        "stream_event" => parse_stream_event(&raw),
        "log" => raw
            .get("line")
            .and_then(|v| v.as_str())
            .map(|line| AgentEvent::Log {
                line: line.to_string(),
            }),
        "runtime_error" => raw
            .get("message")
            .and_then(|v| v.as_str())
            .map(|message| AgentEvent::RuntimeError {
                message: message.to_string(),
            }),
        other => {
            debug!(
                component = "ingest",
                event = "ingest.line.unknown_type",
                msg_type = %other,
                "Unknown event type, discarding line"
            );
            None
        }
    }
}

fn parse_system(raw: &Value) -> Option<AgentEvent> {
    let subtype = match raw.get("subtype").and_then(|v| v.as_str())? {
        "init" => SystemSubtype::Init,
        "config" => SystemSubtype::Config,
        "permission" => SystemSubtype::Permission,
        _ => return None,
    };
    let session_id = raw
        .get("session_id")
        .and_then(|v| v.as_str())
        .map(String::from);
    Some(AgentEvent::System {
        subtype,
        session_id,
    })
}

fn parse_assistant(raw: &Value) -> Option<AgentEvent> {
    let content = raw
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_array())?;

    let mut blocks = Vec::new();
    for block in content {
        match block.get("type").and_then(|v| v.as_str()) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                    blocks.push(ContentBlock::Text {
                        text: text.to_string(),
                    });
                }
            }
            Some("tool_use") => {
                let name = block
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                blocks.push(ContentBlock::ToolUse { name, input });
            }
            _ => {} // thinking blocks etc. — not part of the event log
        }
    }

    Some(AgentEvent::Assistant { blocks })
}

fn parse_tool_result(raw: &Value) -> Option<AgentEvent> {
    // `content` is a string for command output, an array for rich blocks.
    let content = match raw.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let is_error = raw
        .get("is_error")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    Some(AgentEvent::ToolResult { content, is_error })
}

fn parse_result(raw: &Value) -> Option<AgentEvent> {
    let subtype = raw.get("subtype").and_then(|v| v.as_str())?;
    let outcome = match subtype {
        "success" => ResultOutcome::Success,
        "max_turns" | "error_max_turns" => ResultOutcome::MaxTurns,
        "timeout" => ResultOutcome::Timeout,
        "cancelled" => ResultOutcome::Cancelled,
        // The CLI reports errors as "error" or "error_during_execution"
        s if s.starts_with("error") => ResultOutcome::Error,
        _ => return None,
    };
    Some(AgentEvent::Result {
        outcome,
        duration_ms: raw.get("duration_ms").and_then(|v| v.as_u64()),
        num_turns: raw
            .get("num_turns")
            .and_then(|v| v.as_u64())
            .map(|n| n as u32),
    })
}

fn parse_stream_event(raw: &Value) -> Option<AgentEvent> {
    let event = raw.get("event")?;
    if event.get("type").and_then(|v| v.as_str()) != Some("content_block_delta") {
        return None;
    }
    let delta = event.get("delta")?;
    if delta.get("type").and_then(|v| v.as_str()) != Some("text_delta") {
        return None;
    }
    delta
        .get("text")
        .and_then(|v| v.as_str())
        .map(|text| AgentEvent::StreamEvent {
            text: text.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_system_init_with_session_id() {
        let line = r#"{"type":"system","subtype":"init","session_id":"sess-42","model":"x"}"#;
        match parse_line(line) {
            Some(AgentEvent::System {
                subtype: SystemSubtype::Init,
                session_id,
            }) => assert_eq!(session_id.as_deref(), Some("sess-42")),
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn parses_assistant_blocks() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"text","text":"Installing dependencies"},
            {"type":"tool_use","name":"bash","input":{"command":"npm install"}},
            {"type":"thinking","thinking":"hmm"}
        ]}}"#;
        match parse_line(line) {
            Some(AgentEvent::Assistant { blocks }) => {
                assert_eq!(blocks.len(), 2);
                assert!(matches!(&blocks[0], ContentBlock::Text { text } if text == "Installing dependencies"));
                assert!(matches!(&blocks[1], ContentBlock::ToolUse { name, .. } if name == "bash"));
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn parses_tool_result_array_content() {
        let line = r#"{"type":"tool_result","content":[{"type":"text","text":"ok"}],"is_error":false}"#;
        match parse_line(line) {
            Some(AgentEvent::ToolResult { content, is_error }) => {
                assert!(content.contains("ok"));
                assert!(!is_error);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn maps_result_subtypes() {
        let cases = [
            ("success", ResultOutcome::Success),
            ("error", ResultOutcome::Error),
            ("error_during_execution", ResultOutcome::Error),
            ("error_max_turns", ResultOutcome::MaxTurns),
            ("max_turns", ResultOutcome::MaxTurns),
            ("timeout", ResultOutcome::Timeout),
            ("cancelled", ResultOutcome::Cancelled),
        ];
        for (subtype, expected) in cases {
            let line = format!(r#"{{"type":"result","subtype":"{}"}}"#, subtype);
            match parse_line(&line) {
                Some(AgentEvent::Result { outcome, .. }) => assert_eq!(outcome, expected),
                other => panic!("subtype {}: unexpected parse {:?}", subtype, other),
            }
        }
    }

    #[test]
    fn parses_stream_event_text_delta() {
        let line = r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"par"}}}"#;
        match parse_line(line) {
            Some(AgentEvent::StreamEvent { text }) => assert_eq!(text, "par"),
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn malformed_lines_are_silently_discarded() {
        let stream = [
            r#"not json"#,
            r#""#,
            r#"{"noType":true}"#,
            r#"{"type":"system","subtype":"init","session_id":"s"}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#,
            r#"{"type":"result","subtype":"success"}"#,
        ];
        let events: Vec<_> = stream.iter().filter_map(|l| parse_line(l)).collect();
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn unknown_type_is_discarded() {
        assert!(parse_line(r#"{"type":"keep_alive"}"#).is_none());
        assert!(parse_line(r#"{"type":"tool_progress","id":"t1"}"#).is_none());
    }
}
