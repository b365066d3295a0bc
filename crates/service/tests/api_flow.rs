//! HTTP-surface flows: trigger CRUD, manual runs with dedup, admission
//! rejection, approval gates and channel webhooks, driven through the
//! router with an in-memory database.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use berth_channels::ChannelRegistry;
use berth_core::config::{ExecutionLimits, PlatformConfig};
use berth_dispatch::api::DispatchWorkflowApi;
use berth_dispatch::proposals::ProposalService;
use berth_dispatch::runtime::ExecutionRuntime;
use berth_dispatch::{DispatchStore, Dispatcher};
use berth_service::bridges::{AdapterChannelSender, RegistryBridge};
use berth_service::state::{AppState, ServiceConfig};
use berth_session::registry::Collaborators;
use berth_session::store::SessionStore;
use berth_session::SessionRegistry;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;

async fn test_app() -> (Router, AppState) {
    let mut platform = PlatformConfig::default();
    platform.limits = ExecutionLimits {
        per_user: 2,
        global: 10,
    };
    let config = Arc::new(ServiceConfig {
        platform: platform.clone(),
        listen: String::new(),
        channels: Default::default(),
    });

    let session_store = SessionStore::open_in_memory().unwrap();
    let dispatch_store = DispatchStore::attach(session_store.db()).await.unwrap();
    let registry = SessionRegistry::new(session_store, Arc::new(platform));
    let channels = Arc::new(ChannelRegistry::with_builtins());
    let dispatcher = Arc::new(Dispatcher::new(
        dispatch_store.clone(),
        Arc::new(RegistryBridge::new(registry.clone())),
        config.platform.limits.clone(),
    ));
    let runtime = ExecutionRuntime::new(dispatch_store.clone());
    let proposals = ProposalService::new(dispatch_store);

    registry.set_collaborators(Collaborators {
        workflow_api: Some(Arc::new(DispatchWorkflowApi::new(
            dispatcher.clone(),
            runtime.clone(),
            proposals.clone(),
        ))),
        channel_sender: Some(Arc::new(AdapterChannelSender::new(
            registry.clone(),
            channels.clone(),
            config.clone(),
        ))),
        ..Collaborators::default()
    });

    let state = AppState {
        registry,
        channels,
        dispatcher,
        runtime,
        proposals,
        config,
    };
    (berth_service::routes::router(state.clone()), state)
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post(path: &str, user: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .header("x-user-id", user)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(path: &str, user: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header("x-user-id", user)
        .body(Body::empty())
        .unwrap()
}

async fn create_workflow(app: &Router, user: &str) -> String {
    let (status, body) = call(
        app,
        post(
            "/api/workflows",
            user,
            json!({"name": "deploy", "data": {"steps": [{"id": "s1"}]}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["workflow"]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn missing_identity_is_401() {
    let (app, _state) = test_app().await;
    let request = Request::builder()
        .method("GET")
        .uri("/api/triggers")
        .body(Body::empty())
        .unwrap();
    let (status, body) = call(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");
}

#[tokio::test]
async fn manual_run_codes_201_then_200() {
    let (app, _state) = test_app().await;
    let workflow_id = create_workflow(&app, "u1").await;

    let (status, body) = call(
        &app,
        post(
            &format!("/api/workflows/{workflow_id}/run"),
            "u1",
            json!({"client_request_id": "req-1"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let execution_id = body["executionId"].as_str().unwrap().to_string();

    let (status, body) = call(
        &app,
        post(
            &format!("/api/workflows/{workflow_id}/run"),
            "u1",
            json!({"client_request_id": "req-1"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["executionId"], execution_id.as_str());
    assert_eq!(body["status"], "deduplicated");
}

#[tokio::test]
async fn admission_returns_429_with_counters() {
    let (app, _state) = test_app().await;
    let workflow_id = create_workflow(&app, "u1").await;

    for i in 0..2 {
        let (status, _) = call(
            &app,
            post(
                &format!("/api/workflows/{workflow_id}/run"),
                "u1",
                json!({"client_request_id": format!("req-{i}")}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, body) = call(
        &app,
        post(
            &format!("/api/workflows/{workflow_id}/run"),
            "u1",
            json!({"client_request_id": "req-over"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["activeUser"], 2);
    assert_eq!(body["activeGlobal"], 2);
    assert_eq!(body["limit"], 2);
}

#[tokio::test]
async fn webhook_trigger_roundtrip_and_duplicate_delivery() {
    let (app, _state) = test_app().await;
    let workflow_id = create_workflow(&app, "u1").await;

    let (status, _body) = call(
        &app,
        post(
            "/api/triggers",
            "u1",
            json!({
                "name": "on-deploy",
                "type": "webhook",
                "workflow_id": workflow_id,
                "config": {"path": "deploy", "method": "POST"},
                "variable_mapping": {"branch": "$.ref"}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let mut first = post("/api/hooks/u1/deploy", "u1", json!({"ref": "main"}));
    first
        .headers_mut()
        .insert("x-delivery-id", "d-1".parse().unwrap());
    let (status, body) = call(&app, first).await;
    assert_eq!(status, StatusCode::CREATED);
    let execution_id = body["executionId"].as_str().unwrap().to_string();

    let mut second = post("/api/hooks/u1/deploy", "u1", json!({"ref": "main"}));
    second
        .headers_mut()
        .insert("x-delivery-id", "d-1".parse().unwrap());
    let (status, body) = call(&app, second).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["executionId"], execution_id.as_str());
}

#[tokio::test]
async fn duplicate_webhook_path_is_409() {
    let (app, _state) = test_app().await;
    let workflow_id = create_workflow(&app, "u1").await;
    let draft = json!({
        "name": "hook",
        "type": "webhook",
        "workflow_id": workflow_id,
        "config": {"path": "deploy", "method": "POST"}
    });
    let (status, _) = call(&app, post("/api/triggers", "u1", draft.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = call(&app, post("/api/triggers", "u1", draft)).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn approval_gate_over_http() {
    let (app, state) = test_app().await;
    let workflow_id = create_workflow(&app, "u1").await;
    let (status, body) = call(
        &app,
        post(
            &format!("/api/workflows/{workflow_id}/run"),
            "u1",
            json!({"client_request_id": "req-1"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let execution_id = body["executionId"].as_str().unwrap().to_string();

    // The executor starts the run and suspends at a gate.
    state.runtime.start(&execution_id).await.unwrap();
    let token = state
        .runtime
        .suspend_for_approval(&execution_id, None)
        .await
        .unwrap();

    // Wrong token: 409.
    let (status, _) = call(
        &app,
        post(
            &format!("/api/executions/{execution_id}/approve"),
            "u1",
            json!({"resume_token": "wrong"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Right token resumes.
    let (status, body) = call(
        &app,
        post(
            &format!("/api/executions/{execution_id}/approve"),
            "u1",
            json!({"resume_token": token}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["execution"]["status"], "running");
    assert!(body["execution"]["resume_token"].is_null());
}

#[tokio::test]
async fn other_users_cannot_see_executions() {
    let (app, _state) = test_app().await;
    let workflow_id = create_workflow(&app, "u1").await;
    let (_, body) = call(
        &app,
        post(
            &format!("/api/workflows/{workflow_id}/run"),
            "u1",
            json!({"client_request_id": "r"}),
        ),
    )
    .await;
    let execution_id = body["executionId"].as_str().unwrap().to_string();

    let (status, _) = call(&app, get(&format!("/api/executions/{execution_id}"), "u2")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn channel_webhook_binds_scope_and_queues_prompt() {
    let (app, state) = test_app().await;

    let update = json!({
        "update_id": 9,
        "message": {
            "message_id": 1,
            "chat": {"id": 999},
            "from": {"id": 100, "first_name": "Alice"},
            "text": "hello agent"
        }
    });
    let request = Request::builder()
        .method("POST")
        .uri("/channels/telegram/u1")
        .header("content-type", "application/json")
        .body(Body::from(update.to_string()))
        .unwrap();
    let (status, body) = call(&app, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["scopeKey"], "user:u1:telegram:999");
    let session_id = body["sessionId"].as_str().unwrap().to_string();
    assert_eq!(body["sessionCreated"], true);

    // The prompt is journaled in the bound session.
    let messages = state
        .registry
        .store()
        .messages
        .list(&session_id)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "hello agent");
    assert_eq!(messages[0].channel_type.as_deref(), Some("telegram"));

    // Same chat again: same session, no new binding.
    let request = Request::builder()
        .method("POST")
        .uri("/channels/telegram/u1")
        .header("content-type", "application/json")
        .body(Body::from(update.to_string()))
        .unwrap();
    let (status, body) = call(&app, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["sessionId"], session_id.as_str());
    assert_eq!(body["sessionCreated"], false);
}

#[tokio::test]
async fn unsupported_channel_updates_are_ignored() {
    let (app, _state) = test_app().await;
    let request = Request::builder()
        .method("POST")
        .uri("/channels/telegram/u1")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"update_id": 1, "callback_query": {"id": "x"}}).to_string(),
        ))
        .unwrap();
    let (status, body) = call(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");
}
