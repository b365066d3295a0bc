//! GitHub webhook adapter.
//!
//! Conversations are issue and pull-request comment threads. The scope
//! channel id is `owner/repo:pr:42` or `owner/repo:issue:7`, so every
//! thread gets its own session lane.

use crate::markdown::to_github_markdown;
use crate::{ChannelAdapter, ChannelContext, InboundMessage};
use async_trait::async_trait;
use berth_core::error::{PlatformError, PlatformResult};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_API_BASE: &str = "https://api.github.com";

pub struct GithubAdapter {
    client: reqwest::Client,
}

impl GithubAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        GithubAdapter { client }
    }

    /// `owner/repo:pr:42` → (`owner/repo`, `42`). The middle segment only
    /// records the thread kind; both kinds comment through the issues API.
    fn split_channel_id(channel_id: &str) -> PlatformResult<(&str, &str)> {
        let mut parts = channel_id.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(repo), Some(_kind), Some(number)) if repo.contains('/') => Ok((repo, number)),
            _ => Err(PlatformError::validation(format!(
                "bad github channel id: {channel_id}"
            ))),
        }
    }

    async fn call(
        &self,
        ctx: &ChannelContext,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> PlatformResult<Value> {
        let token = ctx
            .token
            .as_deref()
            .ok_or_else(|| PlatformError::Channel("github: missing token".into()))?;
        let base = ctx.api_base.as_deref().unwrap_or(DEFAULT_API_BASE);
        let mut request = self
            .client
            .request(method, format!("{base}{path}"))
            .bearer_auth(token)
            .header("User-Agent", "berth")
            .header("Accept", "application/vnd.github+json");
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| PlatformError::Channel(format!("github {path}: {e}")))?;
        let status = response.status();
        let payload: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(PlatformError::Upstream {
                status: status.as_u16(),
                body_prefix: payload["message"]
                    .as_str()
                    .unwrap_or("unknown github error")
                    .to_string(),
            });
        }
        Ok(payload)
    }
}

#[async_trait]
impl ChannelAdapter for GithubAdapter {
    fn channel_type(&self) -> &'static str {
        "github"
    }

    /// `X-Hub-Signature-256: sha256={hex}` over the raw body.
    fn verify_signature(
        &self,
        headers: &HashMap<String, String>,
        raw_body: &[u8],
        secret: &str,
    ) -> bool {
        let Some(signature) = headers.get("x-hub-signature-256") else {
            return false;
        };
        let Some(hex_sig) = signature.strip_prefix("sha256=") else {
            return false;
        };
        let Ok(expected) = hex::decode(hex_sig) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(raw_body);
        mac.verify_slice(&expected).is_ok()
    }

    async fn parse_inbound(
        &self,
        headers: &HashMap<String, String>,
        raw_body: &[u8],
        _ctx: &ChannelContext,
    ) -> PlatformResult<Option<InboundMessage>> {
        let event_kind = headers
            .get("x-github-event")
            .map(String::as_str)
            .unwrap_or("");
        if event_kind != "issue_comment" {
            // Push, check-run and review events are trigger material,
            // not conversation.
            return Ok(None);
        }

        let payload: Value = match serde_json::from_slice(raw_body) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("github: undecodable payload: {e}");
                return Ok(None);
            }
        };
        if payload["action"] != json!("created") {
            return Ok(None);
        }

        let (Some(repo), Some(issue), Some(comment)) = (
            payload["repository"]["full_name"].as_str(),
            payload.get("issue"),
            payload.get("comment"),
        ) else {
            return Ok(None);
        };
        let Some(number) = issue["number"].as_u64() else {
            return Ok(None);
        };
        let kind = if issue.get("pull_request").is_some() {
            "pr"
        } else {
            "issue"
        };
        let sender = &comment["user"];
        if sender["type"] == json!("Bot") {
            return Ok(None);
        }

        let text = comment["body"].as_str().unwrap_or("").to_string();
        if text.is_empty() {
            return Ok(None);
        }

        Ok(Some(InboundMessage {
            channel_type: "github".into(),
            channel_id: format!("{repo}:{kind}:{number}"),
            sender_id: sender["id"].as_u64().map(|id| id.to_string()).unwrap_or_default(),
            sender_name: sender["login"].as_str().map(|s| s.to_string()),
            text,
            attachments: Vec::new(),
            message_ref: comment["id"].as_u64().map(|id| id.to_string()),
            delivery_id: headers.get("x-github-delivery").cloned(),
        }))
    }

    fn format_markdown(&self, markdown: &str) -> String {
        to_github_markdown(markdown)
    }

    async fn send_message(
        &self,
        ctx: &ChannelContext,
        channel_id: &str,
        markdown: &str,
    ) -> PlatformResult<String> {
        let (repo, number) = Self::split_channel_id(channel_id)?;
        let payload = self
            .call(
                ctx,
                reqwest::Method::POST,
                &format!("/repos/{repo}/issues/{number}/comments"),
                Some(json!({"body": self.format_markdown(markdown)})),
            )
            .await?;
        Ok(payload["id"]
            .as_u64()
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
        let (repo, _) = Self::split_channel_id(channel_id)?;
        self.call(
            ctx,
            reqwest::Method::PATCH,
            &format!("/repos/{repo}/issues/comments/{message_ref}"),
            Some(json!({"body": self.format_markdown(markdown)})),
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
        let (repo, _) = Self::split_channel_id(channel_id)?;
        self.call(
            ctx,
            reqwest::Method::DELETE,
            &format!("/repos/{repo}/issues/comments/{message_ref}"),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn send_typing(&self, _ctx: &ChannelContext, _channel_id: &str) -> PlatformResult<()> {
        // No typing indicator on GitHub.
        Ok(())
    }

    async fn register_webhook(&self, ctx: &ChannelContext, url: &str) -> PlatformResult<()> {
        // Webhook registration needs a repository context; the team id
        // field carries `owner/repo` for this provider.
        let repo = ctx
            .team_id
            .as_deref()
            .ok_or_else(|| PlatformError::validation("github: missing repository"))?;
        let mut config = json!({"url": url, "content_type": "json"});
        if let Some(secret) = &ctx.secret {
            config["secret"] = json!(secret);
        }
        self.call(
            ctx,
            reqwest::Method::POST,
            &format!("/repos/{repo}/hooks"),
            Some(json!({"events": ["issue_comment"], "config": config})),
        )
        .await
        .map(|_| ())
    }

    async fn unregister_webhook(&self, _ctx: &ChannelContext) -> PlatformResult<()> {
        // Requires the hook id, which the platform does not persist yet.
        Ok(())
    }
}
