//! Scope keys: canonical routing strings for conversation lanes.
//!
//! A scope key is the only handle the binding table and the trigger
//! idempotency keys use: `user:{userId}:{channelType}:{parts...}`.
//! Channel-specific parts may themselves contain colons (Slack threads,
//! GitHub PR references), so parsing splits on at most four fields.

use crate::error::{PlatformError, PlatformResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The `(channelType, channelId)` pair an adapter derives from an inbound
/// message. Two adapters of the same channel type must return identical
/// parts for the same logical message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeKeyParts {
    pub channel_type: String,
    pub channel_id: String,
}

/// Canonical `user:{userId}:{channelType}:{channelId}` routing key.
///
/// Equivalent inputs always produce identical strings: composition is the
/// single source of truth, adapters never format keys by hand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeKey(String);

impl ScopeKey {
    /// Compose a key from its parts.
    pub fn compose(user_id: &str, channel_type: &str, channel_id: &str) -> Self {
        ScopeKey(format!("user:{user_id}:{channel_type}:{channel_id}"))
    }

    pub fn from_parts(user_id: &str, parts: &ScopeKeyParts) -> Self {
        Self::compose(user_id, &parts.channel_type, &parts.channel_id)
    }

    /// Parse a canonical key back into its fields.
    ///
    /// The channel id keeps any embedded colons (`T:C:thread`,
    /// `owner/repo:pr:42`).
    pub fn parse(raw: &str) -> PlatformResult<(String, ScopeKeyParts)> {
        let mut fields = raw.splitn(4, ':');
        match (fields.next(), fields.next(), fields.next(), fields.next()) {
            (Some("user"), Some(user), Some(channel_type), Some(channel_id))
                if !user.is_empty() && !channel_type.is_empty() && !channel_id.is_empty() =>
            {
                Ok((
                    user.to_string(),
                    ScopeKeyParts {
                        channel_type: channel_type.to_string(),
                        channel_id: channel_id.to_string(),
                    },
                ))
            }
            _ => Err(PlatformError::validation(format!(
                "malformed scope key: {raw}"
            ))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ScopeKey> for String {
    fn from(key: ScopeKey) -> String {
        key.0
    }
}

/// Many-to-many mapping from an external channel identity to a platform
/// user. Looked up by adapters when routing inbound messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentityLink {
    pub user_id: String,
    /// Channel tag the external identity belongs to (`telegram`, `slack`, ...).
    pub provider: String,
    pub external_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_name: Option<String>,
    /// Workspace / team discriminator for providers that need one (Slack).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
}
