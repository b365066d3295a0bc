//! Telegram bot-API adapter.
//!
//! Inbound updates arrive on the webhook; outbound calls go straight to
//! `api.telegram.org/bot{token}`. Telegram sends photos as an array of
//! sizes — the last entry is the largest, and the only one we keep.

use crate::attachment::{materialise_all, MediaFetcher, MediaRef, MediaSource};
use crate::markdown::to_telegram_html;
use crate::{ChannelAdapter, ChannelContext, InboundMessage};
use async_trait::async_trait;
use berth_core::error::{PlatformError, PlatformResult};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

pub struct TelegramAdapter {
    client: reqwest::Client,
    fetcher: Arc<dyn MediaFetcher>,
}

impl TelegramAdapter {
    pub fn new(client: reqwest::Client, fetcher: Arc<dyn MediaFetcher>) -> Self {
        TelegramAdapter { client, fetcher }
    }

    fn api_url(ctx: &ChannelContext, method: &str) -> PlatformResult<String> {
        let token = ctx
            .token
            .as_deref()
            .ok_or_else(|| PlatformError::Channel("telegram: missing bot token".into()))?;
        let base = ctx.api_base.as_deref().unwrap_or(DEFAULT_API_BASE);
        Ok(format!("{base}/bot{token}/{method}"))
    }

    async fn call(
        &self,
        ctx: &ChannelContext,
        method: &str,
        body: Value,
    ) -> PlatformResult<Value> {
        let url = Self::api_url(ctx, method)?;
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PlatformError::Channel(format!("telegram {method}: {e}")))?;
        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| PlatformError::Channel(format!("telegram {method}: {e}")))?;
        if !status.is_success() || payload["ok"] != json!(true) {
            return Err(PlatformError::Upstream {
                status: status.as_u16(),
                body_prefix: truncate(&payload.to_string(), 200),
            });
        }
        Ok(payload)
    }

    /// Decode the interesting parts of an update without touching the
    /// network. Returns the message skeleton plus media sources still to
    /// be materialised.
    fn decode_update(update: &Value) -> Option<(InboundMessage, Vec<MediaSource>)> {
        // Edited messages, callback queries, channel posts, stickers and
        // other update kinds are not conversations we handle.
        let message = update.get("message")?;
        let chat_id = message["chat"]["id"].as_i64()?;
        let from = message.get("from")?;
        let sender_id = from["id"].as_i64()?.to_string();
        let sender_name = from["first_name"].as_str().map(|s| s.to_string());

        let mut sources = Vec::new();
        if let Some(photos) = message["photo"].as_array() {
            // Telegram orders sizes ascending; keep only the largest.
            if let Some(file_id) = photos.last().and_then(|p| p["file_id"].as_str()) {
                sources.push(MediaSource {
                    kind: "image".into(),
                    reference: MediaRef::TelegramFileId(file_id.to_string()),
                    mime_hint: Some("image/jpeg".into()),
                    file_name: None,
                    duration: None,
                });
            }
        }
        if let Some(doc) = message.get("document") {
            if let Some(file_id) = doc["file_id"].as_str() {
                sources.push(MediaSource {
                    kind: "document".into(),
                    reference: MediaRef::TelegramFileId(file_id.to_string()),
                    mime_hint: doc["mime_type"].as_str().map(|s| s.to_string()),
                    file_name: doc["file_name"].as_str().map(|s| s.to_string()),
                    duration: None,
                });
            }
        }
        if let Some(voice) = message.get("voice") {
            if let Some(file_id) = voice["file_id"].as_str() {
                sources.push(MediaSource {
                    kind: "audio".into(),
                    reference: MediaRef::TelegramFileId(file_id.to_string()),
                    mime_hint: voice["mime_type"].as_str().map(|s| s.to_string()),
                    file_name: None,
                    duration: voice["duration"].as_u64().map(|d| d as u32),
                });
            }
        }

        let text = message["text"]
            .as_str()
            .or_else(|| message["caption"].as_str())
            .unwrap_or("")
            .to_string();
        if text.is_empty() && sources.is_empty() {
            // Stickers, joins, pins and similar service messages.
            return None;
        }

        let message_ref = message["message_id"].as_i64().map(|id| id.to_string());
        Some((
            InboundMessage {
                channel_type: "telegram".into(),
                channel_id: chat_id.to_string(),
                sender_id,
                sender_name,
                text,
                attachments: Vec::new(),
                message_ref,
                delivery_id: update["update_id"].as_i64().map(|id| id.to_string()),
            },
            sources,
        ))
    }
}

#[async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel_type(&self) -> &'static str {
        "telegram"
    }

    /// Telegram authenticates webhooks with a shared secret echoed in a
    /// header rather than an HMAC.
    fn verify_signature(
        &self,
        headers: &HashMap<String, String>,
        _raw_body: &[u8],
        secret: &str,
    ) -> bool {
        headers
            .get("x-telegram-bot-api-secret-token")
            .map(|value| value == secret)
            .unwrap_or(false)
    }

    async fn parse_inbound(
        &self,
        _headers: &HashMap<String, String>,
        raw_body: &[u8],
        ctx: &ChannelContext,
    ) -> PlatformResult<Option<InboundMessage>> {
        let update: Value = match serde_json::from_slice(raw_body) {
            Ok(update) => update,
            Err(e) => {
                log::warn!("telegram: undecodable update: {e}");
                return Ok(None);
            }
        };
        let Some((mut msg, sources)) = Self::decode_update(&update) else {
            return Ok(None);
        };
        msg.attachments = materialise_all(self.fetcher.as_ref(), sources, ctx).await;
        Ok(Some(msg))
    }

    fn format_markdown(&self, markdown: &str) -> String {
        to_telegram_html(markdown)
    }

    async fn send_message(
        &self,
        ctx: &ChannelContext,
        channel_id: &str,
        markdown: &str,
    ) -> PlatformResult<String> {
        let payload = self
            .call(
                ctx,
                "sendMessage",
                json!({
                    "chat_id": channel_id,
                    "text": self.format_markdown(markdown),
                    "parse_mode": "HTML",
                }),
            )
            .await?;
        Ok(payload["result"]["message_id"]
            .as_i64()
            .map(|id| id.to_string())
            .unwrap_or_default())
    }

    async fn edit_message(
        &self,
        ctx: &ChannelContext,
        channel_id: &str,
        message_ref: &str,
        markdown: &str,
    ) -> PlatformResult<()> {
        self.call(
            ctx,
            "editMessageText",
            json!({
                "chat_id": channel_id,
                "message_id": message_ref.parse::<i64>().map_err(|_| {
                    PlatformError::validation(format!("bad telegram message ref: {message_ref}"))
                })?,
                "text": self.format_markdown(markdown),
                "parse_mode": "HTML",
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
        self.call(
            ctx,
            "deleteMessage",
            json!({
                "chat_id": channel_id,
                "message_id": message_ref.parse::<i64>().map_err(|_| {
                    PlatformError::validation(format!("bad telegram message ref: {message_ref}"))
                })?,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn send_typing(&self, ctx: &ChannelContext, channel_id: &str) -> PlatformResult<()> {
        self.call(
            ctx,
            "sendChatAction",
            json!({"chat_id": channel_id, "action": "typing"}),
        )
        .await
        .map(|_| ())
    }

    async fn register_webhook(&self, ctx: &ChannelContext, url: &str) -> PlatformResult<()> {
        let mut body = json!({"url": url});
        if let Some(secret) = &ctx.secret {
            body["secret_token"] = json!(secret);
        }
        self.call(ctx, "setWebhook", body).await.map(|_| ())
    }

    async fn unregister_webhook(&self, ctx: &ChannelContext) -> PlatformResult<()> {
        self.call(ctx, "deleteWebhook", json!({})).await.map(|_| ())
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}
