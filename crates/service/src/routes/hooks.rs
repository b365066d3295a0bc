//! Inbound channel webhooks.
//!
//! The flow for every channel: verify the provider signature over the
//! raw body, decode it through the adapter, resolve the platform user
//! (identity link first, then the path), derive the scope key, locate
//! or create the session bound to that scope, and enqueue the prompt.

use crate::state::{fail, ApiResult, AppState};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use berth_core::error::PlatformError;
use berth_core::protocol::{QueueMode, QueuedPrompt};
use berth_core::scope::ScopeKey;
use berth_core::status::SessionPurpose;
use berth_session::messages::EnqueuePrompt;
use berth_session::store::binding_repo::ChannelBinding;
use berth_session::store::session_repo::NewSession;
use berth_core::message::Author;
use serde_json::json;
use std::collections::HashMap;

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

pub async fn channel_webhook(
    State(state): State<AppState>,
    Path((channel_type, path_user_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    let adapter = state
        .channels
        .get(&channel_type)
        .ok_or_else(|| fail(PlatformError::not_found("channel", &channel_type)))?;
    let ctx = state.config.channel_context(&channel_type);
    let headers = header_map(&headers);

    if let Some(secret) = ctx.secret.as_deref() {
        if !adapter.verify_signature(&headers, &body, secret) {
            return Err(fail(PlatformError::Unauthorized(
                "webhook signature mismatch".into(),
            )));
        }
    }

    let Some(inbound) = adapter
        .parse_inbound(&headers, &body, &ctx)
        .await
        .map_err(fail)?
    else {
        // Unsupported update kinds acknowledge without side effects.
        return Ok((StatusCode::OK, Json(json!({ "status": "ignored" }))).into_response());
    };

    // Prefer a linked identity; fall back to the user named in the path.
    let user_id = state
        .registry
        .store()
        .identity
        .resolve(&channel_type, &inbound.sender_id)
        .await
        .map_err(fail)?
        .unwrap_or(path_user_id);

    let parts = adapter.scope_key_parts(&inbound);
    let scope_key = ScopeKey::from_parts(&user_id, &parts);

    // Locate or create the session bound to this scope.
    let store = state.registry.store();
    let (binding, created) = match store.bindings.get(&scope_key).await.map_err(fail)? {
        Some(binding) => (binding, false),
        None => {
            let (record, _token) = state
                .registry
                .create_session(NewSession {
                    owner_id: user_id.clone(),
                    workspace: String::new(),
                    purpose: SessionPurpose::Interactive,
                    parent_id: None,
                    persona_id: None,
                })
                .await
                .map_err(fail)?;
            let binding = ChannelBinding {
                scope_key: scope_key.clone(),
                session_id: record.id,
                queue_mode: QueueMode::Collect,
                collect_debounce_ms: state.config.platform.queue.collect_debounce_ms,
            };
            store.bindings.put(binding.clone()).await.map_err(fail)?;
            (binding, true)
        }
    };

    let prompt = QueuedPrompt {
        content: inbound.text.clone(),
        model: None,
        author: Some(Author {
            id: Some(inbound.sender_id.clone()),
            name: inbound.sender_name.clone(),
            email: None,
            avatar: None,
        }),
        model_preferences: None,
        attachments: (!inbound.attachments.is_empty()).then(|| inbound.attachments.clone()),
        channel_type: Some(channel_type.clone()),
        channel_id: Some(inbound.channel_id.clone()),
        queue_mode: binding.queue_mode,
        scope_key: Some(scope_key.as_str().to_string()),
    };

    let actor = state
        .registry
        .ensure_actor(&binding.session_id)
        .await
        .map_err(fail)?;
    actor
        .ask(EnqueuePrompt { prompt })
        .await
        .map_err(|e| match e {
            kameo::error::SendError::HandlerError(err) => fail(err),
            _ => fail(PlatformError::Internal("session actor unavailable".into())),
        })?;

    // Best-effort typing indicator back to the channel.
    if ctx.token.is_some() {
        if let Err(e) = adapter.send_typing(&ctx, &inbound.channel_id).await {
            log::debug!("webhook: typing indicator failed: {e}");
        }
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "queued",
            "sessionId": binding.session_id,
            "scopeKey": scope_key,
            "sessionCreated": created,
        })),
    )
        .into_response())
}
