//! The message model: journal entries with typed content parts.
//!
//! Two formats coexist. `v1` messages carry text in `content` only; their
//! streaming text lives in a side buffer until the final assistant message
//! lands. `v2` messages carry ordered typed parts, and streaming chunks
//! mutate the last text part in place.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    V1,
    V2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Complete,
    Error,
}

/// One ordered part of a `v2` message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ContentPart {
    Text {
        text: String,
        /// Set while chunks are still being appended to this part.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        streaming: Option<bool>,
    },
    ToolCall {
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        status: ToolCallStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Finish {
        reason: String,
    },
    Error {
        message: String,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text {
            text: text.into(),
            streaming: None,
        }
    }

    pub fn streaming_text(text: impl Into<String>) -> Self {
        ContentPart::Text {
            text: text.into(),
            streaming: Some(true),
        }
    }

    pub fn is_streaming_text(&self) -> bool {
        matches!(
            self,
            ContentPart::Text {
                streaming: Some(true),
                ..
            }
        )
    }
}

/// Who authored a message (platform user metadata, not channel identity).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// A materialised media attachment on an inbound message or prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Coarse kind: `image`, `audio`, `video`, `document`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Either a data URL or a remote URL.
    pub url: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "fileName")]
    pub file_name: Option<String>,
    /// Seconds, for audio/video.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
}

/// One entry of a session's message journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<ContentPart>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "channelType")]
    pub channel_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "channelId")]
    pub channel_id: Option<String>,
    #[serde(with = "time::serde::rfc3339", rename = "createdAt")]
    pub created_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<MessageFormat>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Message {
            id: Uuid::now_v7().to_string(),
            role,
            content: content.into(),
            parts: None,
            author: None,
            channel_type: None,
            channel_id: None,
            created_at: OffsetDateTime::now_utc(),
            format: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_parts(mut self, parts: Vec<ContentPart>) -> Self {
        self.parts = Some(parts);
        self.format = Some(MessageFormat::V2);
        self
    }

    pub fn with_author(mut self, author: Author) -> Self {
        self.author = Some(author);
        self
    }

    pub fn with_channel(mut self, channel_type: impl Into<String>, channel_id: impl Into<String>) -> Self {
        self.channel_type = Some(channel_type.into());
        self.channel_id = Some(channel_id.into());
        self
    }

    /// The format the journal should treat this message as. Untagged
    /// messages with parts behave as `v2`; untagged bare-content messages
    /// are `v1`.
    pub fn effective_format(&self) -> MessageFormat {
        match self.format {
            Some(f) => f,
            None if self.parts.is_some() => MessageFormat::V2,
            None => MessageFormat::V1,
        }
    }

    /// Concatenated text of all text parts, falling back to `content`.
    pub fn text(&self) -> String {
        match &self.parts {
            Some(parts) => {
                let joined: String = parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::Text { text, .. } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                if joined.is_empty() {
                    self.content.clone()
                } else {
                    joined
                }
            }
            None => self.content.clone(),
        }
    }

    /// True while any text part is still marked streaming.
    pub fn is_streaming(&self) -> bool {
        self.parts
            .as_ref()
            .map(|parts| parts.iter().any(ContentPart::is_streaming_text))
            .unwrap_or(false)
    }
}

/// Partial update applied through `Journal::update`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MessagePatch {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub parts: Option<Vec<ContentPart>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_wire_shape_matches_protocol() {
        let part = ContentPart::ToolCall {
            call_id: "c1".into(),
            tool_name: "spawn_session".into(),
            status: ToolCallStatus::Complete,
            args: None,
            result: Some(serde_json::json!({"ok": true})),
            error: None,
        };
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "tool-call");
        assert_eq!(json["callId"], "c1");
        assert_eq!(json["toolName"], "spawn_session");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn effective_format_defaults_by_parts() {
        let v1 = Message::new(Role::User, "hi");
        assert_eq!(v1.effective_format(), MessageFormat::V1);

        let v2 = Message::new(Role::Assistant, "").with_parts(vec![ContentPart::text("hi")]);
        assert_eq!(v2.effective_format(), MessageFormat::V2);
    }

    #[test]
    fn text_prefers_parts_over_content() {
        let msg = Message::new(Role::Assistant, "stale")
            .with_parts(vec![ContentPart::text("Hel"), ContentPart::text("lo")]);
        assert_eq!(msg.text(), "Hello");
    }

    #[test]
    fn streaming_flag_is_visible() {
        let msg = Message::new(Role::Assistant, "")
            .with_parts(vec![ContentPart::streaming_text("Hel")]);
        assert!(msg.is_streaming());
    }

    #[test]
    fn message_serde_round_trip() {
        let msg = Message::new(Role::User, "hello")
            .with_channel("telegram", "999")
            .with_author(Author {
                id: Some("u1".into()),
                name: Some("Alice".into()),
                ..Author::default()
            });
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
