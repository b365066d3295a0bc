//! Holder re-init helpers: reconstructing derived state from the
//! persisted journal.
//!
//! Child-session events are not stored as rows of their own; they are
//! recovered by scanning `tool` messages for `spawn_session` calls and
//! pulling the child id out of the recorded result text.

use berth_core::message::{ContentPart, Message, Role};
use once_cell::sync::Lazy;
use regex::Regex;

/// Accepts `Child session spawned: {uuid}` anywhere in the text, or a
/// bare UUID as the whole text.
static CHILD_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)Child session spawned:\s*([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})|^\s*([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})\s*$",
    )
    .expect("child-id regex compiles")
});

/// Extract a child session id from a spawn result text.
pub fn extract_child_session_id(text: &str) -> Option<String> {
    CHILD_ID.captures(text).and_then(|caps| {
        caps.get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str().to_lowercase())
    })
}

/// Scan replayed messages for spawned children, in journal order,
/// deduplicated.
pub fn scan_child_sessions(messages: &[Message]) -> Vec<String> {
    let mut ids = Vec::new();
    for msg in messages.iter().filter(|m| m.role == Role::Tool) {
        let mut texts: Vec<String> = Vec::new();
        if let Some(parts) = &msg.parts {
            for part in parts {
                if let ContentPart::ToolCall {
                    tool_name, result, ..
                } = part
                {
                    if tool_name == "spawn_session" {
                        if let Some(result) = result {
                            match result.as_str() {
                                Some(s) => texts.push(s.to_string()),
                                None => texts.push(result.to_string()),
                            }
                        }
                    }
                }
            }
        }
        // v1 tool messages carry the result in `content`; only the prose
        // form identifies a spawn there.
        if msg.parts.is_none() && msg.content.contains("Child session spawned") {
            texts.push(msg.content.clone());
        }
        for text in texts {
            if let Some(id) = extract_child_session_id(&text) {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
    }
    ids
}
