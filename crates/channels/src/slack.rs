//! Slack events-API adapter.
//!
//! Signature scheme: `v0={hex(hmac_sha256(secret, "v0:{ts}:{body}"))}` in
//! `X-Slack-Signature`. The channel id composed into scope keys is
//! `team:channel:thread`, so replies land in the originating thread.

use crate::markdown::to_slack_mrkdwn;
use crate::{ChannelAdapter, ChannelContext, InboundMessage};
use async_trait::async_trait;
use berth_core::error::{PlatformError, PlatformResult};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_API_BASE: &str = "https://slack.com/api";

pub struct SlackAdapter {
    client: reqwest::Client,
}

impl SlackAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        SlackAdapter { client }
    }

    async fn call(
        &self,
        ctx: &ChannelContext,
        method: &str,
        body: Value,
    ) -> PlatformResult<Value> {
        let token = ctx
            .token
            .as_deref()
            .ok_or_else(|| PlatformError::Channel("slack: missing bot token".into()))?;
        let base = ctx.api_base.as_deref().unwrap_or(DEFAULT_API_BASE);
        let response = self
            .client
            .post(format!("{base}/{method}"))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| PlatformError::Channel(format!("slack {method}: {e}")))?;
        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| PlatformError::Channel(format!("slack {method}: {e}")))?;
        if !status.is_success() || payload["ok"] != json!(true) {
            return Err(PlatformError::Upstream {
                status: status.as_u16(),
                body_prefix: payload["error"]
                    .as_str()
                    .unwrap_or("unknown slack error")
                    .to_string(),
            });
        }
        Ok(payload)
    }

    /// Split a composed `team:channel:thread` id back into API fields.
    fn split_channel_id(channel_id: &str) -> (Option<&str>, &str, Option<&str>) {
        let mut parts = channel_id.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(team), Some(channel), thread) => (Some(team), channel, thread),
            _ => (None, channel_id, None),
        }
    }
}

#[async_trait]
impl ChannelAdapter for SlackAdapter {
    fn channel_type(&self) -> &'static str {
        "slack"
    }

    fn verify_signature(
        &self,
        headers: &HashMap<String, String>,
        raw_body: &[u8],
        secret: &str,
    ) -> bool {
        let (Some(signature), Some(timestamp)) = (
            headers.get("x-slack-signature"),
            headers.get("x-slack-request-timestamp"),
        ) else {
            return false;
        };
        let Some(hex_sig) = signature.strip_prefix("v0=") else {
            return false;
        };
        let Ok(expected) = hex::decode(hex_sig) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(b"v0:");
        mac.update(timestamp.as_bytes());
        mac.update(b":");
        mac.update(raw_body);
        mac.verify_slice(&expected).is_ok()
    }

    async fn parse_inbound(
        &self,
        _headers: &HashMap<String, String>,
        raw_body: &[u8],
        _ctx: &ChannelContext,
    ) -> PlatformResult<Option<InboundMessage>> {
        let envelope: Value = match serde_json::from_slice(raw_body) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("slack: undecodable event: {e}");
                return Ok(None);
            }
        };

        // URL verification and non-event callbacks are handled by the
        // webhook route, not turned into messages.
        if envelope["type"] != json!("event_callback") {
            return Ok(None);
        }
        let event = &envelope["event"];
        if event["type"] != json!("message") {
            return Ok(None);
        }
        // Bot echoes and message edits come back through the same event
        // stream; ignore both.
        if event.get("bot_id").is_some() || event.get("subtype").is_some() {
            return Ok(None);
        }

        let (Some(team), Some(channel), Some(user), Some(ts)) = (
            envelope["team_id"].as_str(),
            event["channel"].as_str(),
            event["user"].as_str(),
            event["ts"].as_str(),
        ) else {
            return Ok(None);
        };
        let thread = event["thread_ts"].as_str().unwrap_or(ts);
        let text = event["text"].as_str().unwrap_or("").to_string();
        if text.is_empty() {
            return Ok(None);
        }

        Ok(Some(InboundMessage {
            channel_type: "slack".into(),
            channel_id: format!("{team}:{channel}:{thread}"),
            sender_id: user.to_string(),
            sender_name: None,
            text,
            attachments: Vec::new(),
            message_ref: Some(ts.to_string()),
            delivery_id: envelope["event_id"].as_str().map(|s| s.to_string()),
        }))
    }

    fn format_markdown(&self, markdown: &str) -> String {
        to_slack_mrkdwn(markdown)
    }

    async fn send_message(
        &self,
        ctx: &ChannelContext,
        channel_id: &str,
        markdown: &str,
    ) -> PlatformResult<String> {
        let (_, channel, thread) = Self::split_channel_id(channel_id);
        let mut body = json!({
            "channel": channel,
            "text": self.format_markdown(markdown),
        });
        if let Some(thread_ts) = thread {
            body["thread_ts"] = json!(thread_ts);
        }
        let payload = self.call(ctx, "chat.postMessage", body).await?;
        Ok(payload["ts"].as_str().unwrap_or_default().to_string())
    }

    async fn edit_message(
        &self,
        ctx: &ChannelContext,
        channel_id: &str,
        message_ref: &str,
        markdown: &str,
    ) -> PlatformResult<()> {
        let (_, channel, _) = Self::split_channel_id(channel_id);
        self.call(
            ctx,
            "chat.update",
            json!({
                "channel": channel,
                "ts": message_ref,
                "text": self.format_markdown(markdown),
            }),
        )
        .await
        .map(|_| ())
    }

    async fn delete_message(
        &self,
        ctx: &ChannelContext,
        channel_id: &str,
        message_ref: &str,
    ) -> PlatformResult<()> {
        let (_, channel, _) = Self::split_channel_id(channel_id);
        self.call(
            ctx,
            "chat.delete",
            json!({"channel": channel, "ts": message_ref}),
        )
        .await
        .map(|_| ())
    }

    async fn send_typing(&self, _ctx: &ChannelContext, _channel_id: &str) -> PlatformResult<()> {
        // The events API offers no typing indicator for bots.
        Ok(())
    }

    async fn register_webhook(&self, _ctx: &ChannelContext, _url: &str) -> PlatformResult<()> {
        // Slack event subscriptions are configured in the app manifest,
        // not per-webhook.
        Ok(())
    }

    async fn unregister_webhook(&self, _ctx: &ChannelContext) -> PlatformResult<()> {
        Ok(())
    }
}
