//! Raw API channel: programmatic callers posting JSON bodies.
//!
//! Each request names (or receives) an idempotency key, which becomes the
//! channel id — so retried posts of the same logical message land in the
//! same session lane.

use crate::{ChannelAdapter, ChannelContext, InboundMessage};
use async_trait::async_trait;
use berth_core::error::PlatformResult;
use serde::Deserialize;
use std::collections::HashMap;
use uuid::Uuid;

pub struct ApiAdapter;

impl ApiAdapter {
    pub fn new() -> Self {
        ApiAdapter
    }
}

impl Default for ApiAdapter {
    fn default() -> Self {
        ApiAdapter::new()
    }
}

#[derive(Deserialize)]
struct ApiInbound {
    message: String,
    #[serde(default)]
    idempotency_key: Option<String>,
    #[serde(default)]
    sender: Option<String>,
}

#[async_trait]
impl ChannelAdapter for ApiAdapter {
    fn channel_type(&self) -> &'static str {
        "api"
    }

    /// Bearer-token equality; the route has already extracted the token
    /// from the Authorization header.
    fn verify_signature(
        &self,
        headers: &HashMap<String, String>,
        _raw_body: &[u8],
        secret: &str,
    ) -> bool {
        headers
            .get("authorization")
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token == secret)
            .unwrap_or(false)
    }

    async fn parse_inbound(
        &self,
        _headers: &HashMap<String, String>,
        raw_body: &[u8],
        _ctx: &ChannelContext,
    ) -> PlatformResult<Option<InboundMessage>> {
        let body: ApiInbound = match serde_json::from_slice(raw_body) {
            Ok(body) => body,
            Err(e) => {
                log::debug!("api channel: undecodable body: {e}");
                return Ok(None);
            }
        };
        if body.message.is_empty() {
            return Ok(None);
        }
        let key = body
            .idempotency_key
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(Some(InboundMessage {
            channel_type: "api".into(),
            channel_id: key.clone(),
            sender_id: body.sender.unwrap_or_else(|| "api".into()),
            sender_name: None,
            text: body.message,
            attachments: Vec::new(),
            message_ref: None,
            delivery_id: Some(key),
        }))
    }

    fn format_markdown(&self, markdown: &str) -> String {
        // API consumers get the platform markdown untouched.
        markdown.to_string()
    }

    async fn send_message(
        &self,
        _ctx: &ChannelContext,
        channel_id: &str,
        _markdown: &str,
    ) -> PlatformResult<String> {
        // API callers poll the session instead of receiving pushes.
        log::debug!("api channel: outbound message to {channel_id} is a no-op");
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
    async fn idempotency_key_becomes_the_channel_id() {
        let adapter = ApiAdapter::new();
        let body = br#"{"message": "run the report", "idempotency_key": "k-1"}"#;
        let msg = adapter
            .parse_inbound(&HashMap::new(), body, &ChannelContext::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.channel_id, "k-1");
        assert_eq!(msg.delivery_id.as_deref(), Some("k-1"));
        assert_eq!(msg.text, "run the report");
    }

    #[tokio::test]
    async fn missing_key_gets_a_generated_one() {
        let adapter = ApiAdapter::new();
        let body = br#"{"message": "hi"}"#;
        let a = adapter
            .parse_inbound(&HashMap::new(), body, &ChannelContext::default())
            .await
            .unwrap()
            .unwrap();
        let b = adapter
            .parse_inbound(&HashMap::new(), body, &ChannelContext::default())
            .await
            .unwrap()
            .unwrap();
        assert!(!a.channel_id.is_empty());
        assert_ne!(a.channel_id, b.channel_id);
    }

    #[test]
    fn bearer_secret_check() {
        let adapter = ApiAdapter::new();
        let mut headers = HashMap::new();
        headers.insert("authorization".into(), "Bearer s3cret".into());
        assert!(adapter.verify_signature(&headers, b"", "s3cret"));
        assert!(!adapter.verify_signature(&headers, b"", "other"));
    }
}
