//! Web channel: the browser UI.
//!
//! Web clients hold their own session WebSocket, so the adapter's
//! outbound surface is a no-op — fan-out happens through the holder's
//! client sockets. Inbound parsing exists so web-originated prompts move
//! through the same pipeline as every other channel.

use crate::{ChannelAdapter, ChannelContext, InboundMessage};
use async_trait::async_trait;
use berth_core::error::PlatformResult;
use serde::Deserialize;
use std::collections::HashMap;

pub struct WebAdapter;

impl WebAdapter {
    pub fn new() -> Self {
        WebAdapter
    }
}

impl Default for WebAdapter {
    fn default() -> Self {
        WebAdapter::new()
    }
}

#[derive(Deserialize)]
struct WebInbound {
    content: String,
    session_id: String,
    #[serde(default)]
    sender: Option<String>,
}

#[async_trait]
impl ChannelAdapter for WebAdapter {
    fn channel_type(&self) -> &'static str {
        "web"
    }

    /// Web requests are authenticated by the platform session cookie
    /// upstream of the adapter.
    fn verify_signature(
        &self,
        _headers: &HashMap<String, String>,
        _raw_body: &[u8],
        _secret: &str,
    ) -> bool {
        true
    }

    async fn parse_inbound(
        &self,
        _headers: &HashMap<String, String>,
        raw_body: &[u8],
        _ctx: &ChannelContext,
    ) -> PlatformResult<Option<InboundMessage>> {
        let body: WebInbound = match serde_json::from_slice(raw_body) {
            Ok(body) => body,
            Err(_) => return Ok(None),
        };
        if body.content.is_empty() {
            return Ok(None);
        }
        Ok(Some(InboundMessage {
            channel_type: "web".into(),
            channel_id: body.session_id,
            sender_id: body.sender.unwrap_or_else(|| "web".into()),
            sender_name: None,
            text: body.content,
            attachments: Vec::new(),
            message_ref: None,
            delivery_id: None,
        }))
    }

    fn format_markdown(&self, markdown: &str) -> String {
        markdown.to_string()
    }

    async fn send_message(
        &self,
        _ctx: &ChannelContext,
        _channel_id: &str,
        _markdown: &str,
    ) -> PlatformResult<String> {
        // Delivered through the session's client sockets.
        Ok(String::new())
    }

    async fn edit_message(
        &self,
        _ctx: &ChannelContext,
        _channel_id: &str,
        _message_ref: &str,
        _markdown: &str,
    ) -> PlatformResult<()> {
        Ok(())
    }

    async fn delete_message(
        &self,
        _ctx: &ChannelContext,
        _channel_id: &str,
        _message_ref: &str,
    ) -> PlatformResult<()> {
        Ok(())
    }

    async fn send_typing(&self, _ctx: &ChannelContext, _channel_id: &str) -> PlatformResult<()> {
        Ok(())
    }

    async fn register_webhook(&self, _ctx: &ChannelContext, _url: &str) -> PlatformResult<()> {
        Ok(())
    }

    async fn unregister_webhook(&self, _ctx: &ChannelContext) -> PlatformResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn web_inbound_scopes_to_the_session() {
        let adapter = WebAdapter::new();
        let body = br#"{"content": "hi", "session_id": "s-1"}"#;
        let msg = adapter
            .parse_inbound(&HashMap::new(), body, &ChannelContext::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.channel_id, "s-1");
        assert_eq!(msg.text, "hi");
    }
}
