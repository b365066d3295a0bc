//! Shared server state, configuration, and the HTTP error boundary.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use berth_channels::ChannelRegistry;
use berth_core::config::PlatformConfig;
use berth_core::error::PlatformError;
use berth_dispatch::proposals::ProposalService;
use berth_dispatch::runtime::ExecutionRuntime;
use berth_dispatch::Dispatcher;
use berth_session::SessionRegistry;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Per-channel credentials configured on the deployment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelCredentials {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
}

/// Service configuration: the shared platform config plus channel
/// credentials and the listen address.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    #[serde(flatten)]
    pub platform: PlatformConfig,
    pub listen: String,
    /// Channel tag → credentials.
    pub channels: HashMap<String, ChannelCredentials>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            platform: PlatformConfig::default(),
            listen: "0.0.0.0:8080".to_string(),
            channels: HashMap::new(),
        }
    }
}

impl ServiceConfig {
    pub fn load(path: &Path) -> Result<Self, PlatformError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PlatformError::validation(format!("cannot read config {}: {e}", path.display()))
        })?;
        let mut config: ServiceConfig = toml::from_str(&raw)
            .map_err(|e| PlatformError::validation(format!("invalid config: {e}")))?;
        config.platform.queue.collect_debounce_ms =
            berth_core::config::clamp_collect_debounce(config.platform.queue.collect_debounce_ms);
        Ok(config)
    }

    pub fn channel_context(&self, channel_type: &str) -> berth_channels::ChannelContext {
        let creds = self.channels.get(channel_type).cloned().unwrap_or_default();
        berth_channels::ChannelContext {
            token: creds.token,
            secret: creds.secret,
            team_id: None,
            api_base: None,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub channels: Arc<ChannelRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub runtime: ExecutionRuntime,
    pub proposals: ProposalService,
    pub config: Arc<ServiceConfig>,
}

/// The authenticated platform user. The real OAuth/invite flow is an
/// external collaborator; the service trusts the identity header the
/// auth front-door injects.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub id: String,
}

impl<S: Send + Sync> FromRequestParts<S> for AuthedUser {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(|id| AuthedUser { id: id.to_string() })
            .ok_or_else(|| {
                api_error(&PlatformError::Unauthorized(
                    "missing user identity".into(),
                ))
            })
    }
}

/// Map a platform error onto the HTTP boundary: status code plus a JSON
/// body; concurrency rejections carry their counters.
pub fn api_error(e: &PlatformError) -> Response {
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = match e {
        PlatformError::Concurrency {
            active_user,
            active_global,
            limit,
        } => json!({
            "error": e.kind(),
            "reason": e.to_string(),
            "activeUser": active_user,
            "activeGlobal": active_global,
            "limit": limit,
        }),
        other => json!({ "error": other.kind(), "reason": other.to_string() }),
    };
    (status, Json(body)).into_response()
}

/// Shorthand used by every route.
pub type ApiResult = Result<Response, Response>;

pub fn fail(e: PlatformError) -> Response {
    api_error(&e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_and_channel_context() {
        let config = ServiceConfig::default();
        assert_eq!(config.listen, "0.0.0.0:8080");
        let ctx = config.channel_context("telegram");
        assert!(ctx.token.is_none());
    }

    #[test]
    fn config_parses_channel_credentials() {
        let raw = r#"
listen = "127.0.0.1:9000"
db_path = "/tmp/b.db"

[channels.telegram]
token = "tok"
secret = "shh"
"#;
        let config: ServiceConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.platform.db_path, "/tmp/b.db");
        let ctx = config.channel_context("telegram");
        assert_eq!(ctx.token.as_deref(), Some("tok"));
        assert_eq!(ctx.secret.as_deref(), Some("shh"));
    }

    #[test]
    fn concurrency_error_body_carries_counters() {
        let response = api_error(&PlatformError::Concurrency {
            active_user: 3,
            active_global: 12,
            limit: 3,
        });
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
