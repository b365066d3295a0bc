//! Append-mostly message journal with in-place streaming mutation.
//!
//! The journal is the in-memory head of a session's conversation. The
//! holder persists every mutating event and replays the rows on restart,
//! so nothing here touches storage. In-place mutation is permitted in
//! exactly two cases: extending the active streaming text part, and
//! content-wins updates.

use crate::error::{PlatformError, PlatformResult};
use crate::message::{ContentPart, Message, MessageFormat, MessagePatch, Role};

/// Ordered log of one session's messages plus the live streaming state.
#[derive(Debug, Default)]
pub struct Journal {
    messages: Vec<Message>,
    /// v1 side buffer: chunk text accumulated before the final assistant
    /// message arrives. Never journaled.
    streaming_content: String,
    /// Id of the v2 message currently receiving chunks.
    streaming_message_id: Option<String>,
}

impl Journal {
    pub fn new() -> Self {
        Journal::default()
    }

    /// Rebuild from persisted rows (holder re-init). Rows must already be
    /// in insertion order.
    pub fn replay(rows: Vec<Message>) -> Self {
        Journal {
            messages: rows,
            streaming_content: String::new(),
            streaming_message_id: None,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn list(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Append a message. Ids are unique within a session.
    pub fn append(&mut self, msg: Message) -> PlatformResult<&Message> {
        if self.messages.iter().any(|m| m.id == msg.id) {
            return Err(PlatformError::validation(format!(
                "duplicate message id: {}",
                msg.id
            )));
        }
        self.messages.push(msg);
        Ok(self.messages.last().unwrap())
    }

    /// Apply a partial update.
    ///
    /// Content-wins: while the target is actively streaming, an incoming
    /// content shorter than the current one is ignored, so a delayed
    /// tool-update broadcast cannot truncate text assembled from chunks.
    /// Returns the updated message, or None if the id is unknown.
    pub fn update(&mut self, id: &str, patch: MessagePatch) -> Option<&Message> {
        let streaming = self.streaming_message_id.as_deref() == Some(id)
            || self.get(id).map(Message::is_streaming).unwrap_or(false);
        let msg = self.messages.iter_mut().find(|m| m.id == id)?;

        if let Some(content) = patch.content {
            if !streaming || content.len() >= msg.content.len() {
                msg.content = content;
            } else {
                log::debug!(
                    "journal: content-wins kept {} chars over incoming {} for {}",
                    msg.content.len(),
                    content.len(),
                    id
                );
            }
        }
        if let Some(parts) = patch.parts {
            msg.parts = Some(parts);
        }
        Some(msg)
    }

    /// Remove the listed messages, returning the ids actually removed in
    /// journal order.
    pub fn remove(&mut self, ids: &[String]) -> Vec<String> {
        let mut removed = Vec::new();
        self.messages.retain(|m| {
            if ids.iter().any(|id| *id == m.id) {
                removed.push(m.id.clone());
                false
            } else {
                true
            }
        });
        if let Some(current) = &self.streaming_message_id {
            if removed.iter().any(|id| id == current) {
                self.streaming_message_id = None;
            }
        }
        removed
    }

    /// Remove a message and everything after it (client `revert`).
    pub fn remove_from(&mut self, id: &str) -> Vec<String> {
        match self.messages.iter().position(|m| m.id == id) {
            Some(pos) => {
                let removed: Vec<String> =
                    self.messages.drain(pos..).map(|m| m.id).collect();
                if let Some(current) = &self.streaming_message_id {
                    if removed.iter().any(|r| r == current) {
                        self.streaming_message_id = None;
                    }
                }
                removed
            }
            None => Vec::new(),
        }
    }

    /// Feed one streaming chunk into the journal.
    ///
    /// v2: extends the last text part of the current assistant message
    /// when it is marked streaming, otherwise appends a fresh streaming
    /// text part. If no assistant message is accumulating, a new v2
    /// assistant message is created. Returns the id of the message the
    /// chunk landed in.
    pub fn append_chunk(&mut self, format: MessageFormat, chunk: &str) -> String {
        if format == MessageFormat::V1 {
            self.streaming_content.push_str(chunk);
            return self
                .streaming_message_id
                .clone()
                .unwrap_or_else(|| "streaming".to_string());
        }

        let id = match &self.streaming_message_id {
            Some(id) if self.get(id).is_some() => id.clone(),
            _ => {
                let msg = Message::new(Role::Assistant, "")
                    .with_parts(vec![ContentPart::streaming_text("")]);
                let id = msg.id.clone();
                self.messages.push(msg);
                self.streaming_message_id = Some(id.clone());
                id
            }
        };

        if let Some(msg) = self.messages.iter_mut().find(|m| m.id == id) {
            let parts = msg.parts.get_or_insert_with(Vec::new);
            match parts.last_mut() {
                Some(ContentPart::Text {
                    text,
                    streaming: Some(true),
                }) => text.push_str(chunk),
                _ => parts.push(ContentPart::streaming_text(chunk)),
            }
            msg.content.push_str(chunk);
        }
        id
    }

    /// Buffered v1 streaming text (not yet journaled).
    pub fn streaming_content(&self) -> &str {
        &self.streaming_content
    }

    pub fn streaming_message_id(&self) -> Option<&str> {
        self.streaming_message_id.as_deref()
    }

    /// Finish the current stream.
    ///
    /// v2: clears the streaming flags on the accumulating message. v1:
    /// drops the side buffer (the caller appends the final assistant
    /// message it received from the runner). Returns the finalized v2
    /// message, if any.
    pub fn finalize_stream(&mut self) -> Option<&Message> {
        self.streaming_content.clear();
        let id = self.streaming_message_id.take()?;
        let msg = self.messages.iter_mut().find(|m| m.id == id)?;
        if let Some(parts) = &mut msg.parts {
            for part in parts.iter_mut() {
                if let ContentPart::Text { streaming, .. } = part {
                    *streaming = None;
                }
            }
        }
        Some(msg)
    }

    /// Drop any in-flight streaming state without finalizing (abort).
    pub fn clear_stream(&mut self) {
        self.streaming_content.clear();
        if let Some(id) = self.streaming_message_id.take() {
            if let Some(msg) = self.messages.iter_mut().find(|m| m.id == id) {
                if let Some(parts) = &mut msg.parts {
                    for part in parts.iter_mut() {
                        if let ContentPart::Text { streaming, .. } = part {
                            *streaming = None;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    fn user(id: &str, content: &str) -> Message {
        Message::new(Role::User, content).with_id(id)
    }

    #[test]
    fn append_preserves_order_and_rejects_duplicates() {
        let mut journal = Journal::new();
        journal.append(user("a", "1")).unwrap();
        journal.append(user("b", "2")).unwrap();
        assert!(journal.append(user("a", "again")).is_err());
        let ids: Vec<&str> = journal.list().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn v2_chunks_extend_last_streaming_part() {
        let mut journal = Journal::new();
        let id1 = journal.append_chunk(MessageFormat::V2, "Hel");
        let id2 = journal.append_chunk(MessageFormat::V2, "lo");
        assert_eq!(id1, id2);

        let msg = journal.get(&id1).unwrap();
        let parts = msg.parts.as_ref().unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(msg.text(), "Hello");
        assert!(msg.is_streaming());
    }

    #[test]
    fn v2_non_streaming_tail_gets_new_part() {
        let mut journal = Journal::new();
        let id = journal.append_chunk(MessageFormat::V2, "one");
        journal.finalize_stream();

        // Re-open streaming on the same conversation: a fresh message.
        let id2 = journal.append_chunk(MessageFormat::V2, "two");
        assert_ne!(id, id2);
        assert_eq!(journal.get(&id).unwrap().text(), "one");
        assert_eq!(journal.get(&id2).unwrap().text(), "two");
    }

    #[test]
    fn v1_chunks_stay_out_of_the_journal() {
        let mut journal = Journal::new();
        journal.append_chunk(MessageFormat::V1, "Hel");
        journal.append_chunk(MessageFormat::V1, "lo");
        assert!(journal.is_empty());
        assert_eq!(journal.streaming_content(), "Hello");

        journal.finalize_stream();
        assert_eq!(journal.streaming_content(), "");
    }

    #[test]
    fn content_wins_while_streaming() {
        let mut journal = Journal::new();
        let id = journal.append_chunk(MessageFormat::V2, "Hello wor");

        // A delayed tool-update broadcast carrying stale shorter content.
        journal.update(
            &id,
            MessagePatch {
                content: Some("Hello".into()),
                parts: None,
            },
        );
        assert_eq!(journal.get(&id).unwrap().content, "Hello wor");

        // Longer incoming content is accepted.
        journal.update(
            &id,
            MessagePatch {
                content: Some("Hello world".into()),
                parts: None,
            },
        );
        assert_eq!(journal.get(&id).unwrap().content, "Hello world");
    }

    #[test]
    fn shorter_update_applies_once_stream_finalized() {
        let mut journal = Journal::new();
        let id = journal.append_chunk(MessageFormat::V2, "Hello world");
        journal.finalize_stream();

        journal.update(
            &id,
            MessagePatch {
                content: Some("edited".into()),
                parts: None,
            },
        );
        assert_eq!(journal.get(&id).unwrap().content, "edited");
    }

    #[test]
    fn remove_from_drops_suffix() {
        let mut journal = Journal::new();
        for id in ["a", "b", "c", "d"] {
            journal.append(user(id, id)).unwrap();
        }
        let removed = journal.remove_from("c");
        assert_eq!(removed, ["c", "d"]);
        assert_eq!(journal.len(), 2);
        assert!(journal.remove_from("zzz").is_empty());
    }

    #[test]
    fn remove_clears_streaming_pointer() {
        let mut journal = Journal::new();
        let id = journal.append_chunk(MessageFormat::V2, "x");
        journal.remove(&[id.clone()]);
        assert!(journal.streaming_message_id().is_none());

        // Next chunk opens a fresh message instead of resurrecting the old id.
        let id2 = journal.append_chunk(MessageFormat::V2, "y");
        assert_ne!(id, id2);
    }

    #[test]
    fn replay_restores_order() {
        let rows = vec![user("a", "1"), user("b", "2")];
        let journal = Journal::replay(rows);
        assert_eq!(journal.len(), 2);
        assert_eq!(journal.list()[0].id, "a");
        assert!(journal.streaming_message_id().is_none());
    }
}
