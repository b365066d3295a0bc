//! Channel adapters: the polymorphic transport contract.
//!
//! Each adapter binds one external chat surface (Telegram, Slack, GitHub,
//! the raw API, the web UI) to the platform. Adapters are stateless; all
//! addressable state (bindings, tokens) lives in the store. The registry
//! resolves adapters by their string tag.

pub mod api;
pub mod attachment;
pub mod github;
pub mod markdown;
pub mod slack;
pub mod telegram;
pub mod web;

use async_trait::async_trait;
use berth_core::error::PlatformResult;
use berth_core::message::Attachment;
use berth_core::scope::ScopeKeyParts;
use std::collections::HashMap;
use std::sync::Arc;

pub use attachment::{HttpMediaFetcher, MediaFetcher, MediaSource, MAX_ATTACHMENTS};

/// Per-call context for an adapter: credentials and routing hints.
///
/// `api_base` overrides the provider endpoint (tests, proxies); adapters
/// fall back to the provider default when absent.
#[derive(Debug, Clone, Default)]
pub struct ChannelContext {
    /// Bot / app token used for outbound calls and media fetch.
    pub token: Option<String>,
    /// Webhook signing secret.
    pub secret: Option<String>,
    /// Team / workspace discriminator (Slack).
    pub team_id: Option<String>,
    pub api_base: Option<String>,
}

impl ChannelContext {
    pub fn with_token(token: impl Into<String>) -> Self {
        ChannelContext {
            token: Some(token.into()),
            ..ChannelContext::default()
        }
    }
}

/// A decoded inbound channel message, normalised across providers.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub channel_type: String,
    /// Channel-specific id composed into the scope key. May itself
    /// contain colons (`T:C:thread`, `owner/repo:pr:42`).
    pub channel_id: String,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub text: String,
    pub attachments: Vec<Attachment>,
    /// Provider-side message reference, for later edit/delete.
    pub message_ref: Option<String>,
    /// Provider delivery id, used for webhook idempotency.
    pub delivery_id: Option<String>,
}

/// The polymorphic transport contract.
///
/// `parse_inbound` returns `Ok(None)` for updates the adapter does not
/// handle (callback queries, stickers, bot echoes); media fetch failures
/// degrade to a message without the attachment rather than erroring.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel_type(&self) -> &'static str;

    /// Verify the provider's webhook signature over the raw body.
    fn verify_signature(
        &self,
        headers: &HashMap<String, String>,
        raw_body: &[u8],
        secret: &str,
    ) -> bool;

    async fn parse_inbound(
        &self,
        headers: &HashMap<String, String>,
        raw_body: &[u8],
        ctx: &ChannelContext,
    ) -> PlatformResult<Option<InboundMessage>>;

    /// `(channelType, channelId)` for scope-key composition. Must agree
    /// across adapter instances for the same logical message.
    fn scope_key_parts(&self, msg: &InboundMessage) -> ScopeKeyParts {
        ScopeKeyParts {
            channel_type: self.channel_type().to_string(),
            channel_id: msg.channel_id.clone(),
        }
    }

    /// Render platform markdown into the channel's native markup.
    fn format_markdown(&self, markdown: &str) -> String;

    /// Send a message; returns the provider message reference.
    async fn send_message(
        &self,
        ctx: &ChannelContext,
        channel_id: &str,
        markdown: &str,
    ) -> PlatformResult<String>;

    async fn edit_message(
        &self,
        ctx: &ChannelContext,
        channel_id: &str,
        message_ref: &str,
        markdown: &str,
    ) -> PlatformResult<()>;

    async fn delete_message(
        &self,
        ctx: &ChannelContext,
        channel_id: &str,
        message_ref: &str,
    ) -> PlatformResult<()>;

    async fn send_typing(&self, ctx: &ChannelContext, channel_id: &str) -> PlatformResult<()>;

    async fn register_webhook(&self, ctx: &ChannelContext, url: &str) -> PlatformResult<()>;

    async fn unregister_webhook(&self, ctx: &ChannelContext) -> PlatformResult<()>;
}

/// Registry of adapters keyed by channel tag.
#[derive(Default)]
pub struct ChannelRegistry {
    adapters: HashMap<&'static str, Arc<dyn ChannelAdapter>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        ChannelRegistry::default()
    }

    /// Registry with the five built-in adapters.
    pub fn with_builtins() -> Self {
        let client = reqwest::Client::new();
        let fetcher: Arc<dyn MediaFetcher> = Arc::new(HttpMediaFetcher::new(client.clone()));
        let mut registry = ChannelRegistry::new();
        registry.register(Arc::new(web::WebAdapter::new()));
        registry.register(Arc::new(api::ApiAdapter::new()));
        registry.register(Arc::new(telegram::TelegramAdapter::new(
            client.clone(),
            fetcher.clone(),
        )));
        registry.register(Arc::new(slack::SlackAdapter::new(client.clone())));
        registry.register(Arc::new(github::GithubAdapter::new(client)));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters.insert(adapter.channel_type(), adapter);
    }

    pub fn get(&self, channel_type: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(channel_type).cloned()
    }

    pub fn channel_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.adapters.keys().copied().collect();
        types.sort_unstable();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_knows_all_five_tags() {
        let registry = ChannelRegistry::with_builtins();
        assert_eq!(
            registry.channel_types(),
            vec!["api", "github", "slack", "telegram", "web"]
        );
        assert!(registry.get("telegram").is_some());
        assert!(registry.get("discord").is_none());
    }

    #[test]
    fn scope_key_parts_default_uses_adapter_tag() {
        let registry = ChannelRegistry::with_builtins();
        let adapter = registry.get("telegram").unwrap();
        let msg = InboundMessage {
            channel_type: "telegram".into(),
            channel_id: "999".into(),
            sender_id: "100".into(),
            sender_name: None,
            text: "hi".into(),
            attachments: vec![],
            message_ref: None,
            delivery_id: None,
        };
        let parts = adapter.scope_key_parts(&msg);
        assert_eq!(parts.channel_type, "telegram");
        assert_eq!(parts.channel_id, "999");
    }
}
