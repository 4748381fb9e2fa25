//! Dev-server URL extraction
//!
//! The dev server announces its public URL somewhere in the agent's output.
//! Command output (`tool_result`) is the most likely carrier, so it is
//! scanned first; assistant text is the fallback. Events are scanned in
//! arrival order and the first match wins.

use once_cell::sync::Lazy;
use regex::Regex;

use driftbox_protocol::{AgentEvent, ContentBlock};

/// `scheme://host[:port][/path]` — scheme per RFC 3986.
static URL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[a-zA-Z][a-zA-Z0-9+.\-]*://[^\s"'<>)\]]+"#).unwrap());

/// Find the first URL in a text snippet.
fn first_url(text: &str) -> Option<String> {
    URL_REGEX.find(text).map(|m| m.as_str().to_string())
}

/// Scan events for the dev-server URL: all `tool_result` content first,
/// then assistant text blocks, both in arrival order.
pub fn find_preview_url(events: &[AgentEvent]) -> Option<String> {
    for event in events {
        if let AgentEvent::ToolResult { content, .. } = event {
            if let Some(url) = first_url(content) {
                return Some(url);
            }
        }
    }

    for event in events {
        if let AgentEvent::Assistant { blocks } = event {
            for block in blocks {
                if let ContentBlock::Text { text } = block {
                    if let Some(url) = first_url(text) {
                        return Some(url);
                    }
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_result(content: &str) -> AgentEvent {
        AgentEvent::ToolResult {
            content: content.to_string(),
            is_error: false,
        }
    }

    fn assistant_text(text: &str) -> AgentEvent {
        AgentEvent::Assistant {
            blocks: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
        }
    }

    #[test]
    fn tool_result_wins_over_assistant_text() {
        let events = vec![
            assistant_text("Your app is at https://from-assistant.example.dev"),
            tool_result("Metro waiting on exp://10.0.0.5:8081"),
        ];
        assert_eq!(
            find_preview_url(&events).as_deref(),
            Some("exp://10.0.0.5:8081")
        );
    }

    #[test]
    fn first_tool_result_match_stops_the_scan() {
        let events = vec![
            tool_result("no url here, exit 0"),
            tool_result("tunnel ready: https://abc123.tunnel.example.dev"),
            tool_result("second: https://later.example.dev"),
        ];
        assert_eq!(
            find_preview_url(&events).as_deref(),
            Some("https://abc123.tunnel.example.dev")
        );
    }

    #[test]
    fn falls_back_to_assistant_text() {
        let events = vec![
            tool_result("npm install completed"),
            assistant_text("Preview it at https://preview.example.dev/p/42 when ready"),
        ];
        assert_eq!(
            find_preview_url(&events).as_deref(),
            Some("https://preview.example.dev/p/42")
        );
    }

    #[test]
    fn no_url_yields_none() {
        let events = vec![tool_result("done"), assistant_text("all finished")];
        assert!(find_preview_url(&events).is_none());
    }

    #[test]
    fn url_excludes_trailing_quote() {
        assert_eq!(
            first_url(r#"listening on "http://localhost:8081" now"#).as_deref(),
            Some("http://localhost:8081")
        );
    }
}
