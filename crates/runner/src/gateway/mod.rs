//! The gateway: an authenticating reverse proxy in front of the
//! sandbox's dev tools.
//!
//! | Prefix      | Upstream          | Auth                        |
//! |-------------|-------------------|-----------------------------|
//! | `/health`   | self              | none                        |
//! | `/opencode` | local model server| none (server-to-server)     |
//! | `/vscode`   | code editor       | JWT or session cookie       |
//! | `/vnc`      | remote desktop    | JWT or session cookie       |
//! | `/ttyd`     | terminal          | JWT or session cookie (`tty` subprotocol) |
//! | `/api`      | internal API      | localhost only              |

pub mod auth;
pub mod proxy;

use crate::bridge::BridgeHandle;
use auth::SessionTokens;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{FromRequestParts, Path, Request, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;

/// Pull a WebSocket upgrade out of the request when one is offered;
/// plain HTTP requests pass through untouched.
async fn split_upgrade(req: Request) -> (Option<WebSocketUpgrade>, Request) {
    let wants_ws = req
        .headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !wants_ws {
        return (None, req);
    }
    let (mut parts, body) = req.into_parts();
    let upgrade = WebSocketUpgrade::from_request_parts(&mut parts, &()).await.ok();
    (upgrade, Request::from_parts(parts, body))
}

/// Upstream base URLs, `http://127.0.0.1:{port}` shaped.
#[derive(Debug, Clone)]
pub struct Upstreams {
    pub opencode: String,
    pub vscode: String,
    pub vnc: String,
    pub ttyd: String,
}

pub struct GatewayState {
    pub bridge: BridgeHandle,
    pub jwt_secret: Vec<u8>,
    pub sessions: SessionTokens,
    pub upstreams: Upstreams,
    pub client: reqwest::Client,
}

pub type SharedState = Arc<GatewayState>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/opencode/{*rest}", any(opencode))
        .route("/vscode/{*rest}", any(vscode))
        .route("/vnc/{*rest}", any(vnc))
        .route("/ttyd/{*rest}", any(ttyd))
        .nest("/api", crate::internal_api::router())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Outcome of gateway auth: pass-through, pass-through with a freshly
/// minted cookie to attach, or a 401.
enum AuthOutcome {
    Ok { set_cookie: Option<String> },
    Denied,
}

fn authenticate(state: &GatewayState, headers: &HeaderMap) -> AuthOutcome {
    // Cookie first: assets and follow-up requests carry it.
    if let Some(cookie_header) = headers.get("cookie").and_then(|v| v.to_str().ok()) {
        if let Some(token) = SessionTokens::from_cookie_header(cookie_header) {
            if state.sessions.is_valid(token) {
                return AuthOutcome::Ok { set_cookie: None };
            }
        }
    }

    // First contact: bearer JWT; on success the response carries the
    // session cookie so the JWT never appears again.
    if let Some(bearer) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        if auth::verify_jwt(bearer, &state.jwt_secret, now).is_some() {
            let token = state.sessions.mint();
            return AuthOutcome::Ok {
                set_cookie: Some(SessionTokens::cookie_for(&token)),
            };
        }
    }

    AuthOutcome::Denied
}

async fn opencode(
    State(state): State<SharedState>,
    Path(rest): Path<String>,
    req: Request,
) -> Response {
    let upstream = state.upstreams.opencode.clone();
    let (ws, req) = split_upgrade(req).await;
    proxy::handle(state, upstream, rest, None, ws, req, None).await
}

async fn vscode(
    State(state): State<SharedState>,
    Path(rest): Path<String>,
    req: Request,
) -> Response {
    authed_proxy(state, |u| u.vscode.clone(), rest, req, None).await
}

async fn vnc(
    State(state): State<SharedState>,
    Path(rest): Path<String>,
    req: Request,
) -> Response {
    authed_proxy(state, |u| u.vnc.clone(), rest, req, None).await
}

async fn ttyd(
    State(state): State<SharedState>,
    Path(rest): Path<String>,
    req: Request,
) -> Response {
    authed_proxy(state, |u| u.ttyd.clone(), rest, req, Some("tty")).await
}

async fn authed_proxy(
    state: SharedState,
    upstream: impl Fn(&Upstreams) -> String,
    rest: String,
    req: Request,
    subprotocol: Option<&'static str>,
) -> Response {
    match authenticate(&state, req.headers()) {
        AuthOutcome::Ok { set_cookie } => {
            let upstream = upstream(&state.upstreams);
            let (ws, req) = split_upgrade(req).await;
            proxy::handle(state, upstream, rest, set_cookie, ws, req, subprotocol).await
        }
        AuthOutcome::Denied => {
            (StatusCode::UNAUTHORIZED, "missing or invalid credentials").into_response()
        }
    }
}

/// Guard for the internal API: loopback peers only.
pub fn require_localhost(addr: &ConnectInfo<SocketAddr>) -> Result<(), StatusCode> {
    if addr.0.ip().is_loopback() {
        Ok(())
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{Bridge, BridgeConfig};

    fn state() -> SharedState {
        let (_bridge, handle, _incoming) =
            Bridge::new(BridgeConfig::new("ws://127.0.0.1:1/ws", "t"));
        Arc::new(GatewayState {
            bridge: handle,
            jwt_secret: b"secret".to_vec(),
            sessions: SessionTokens::new(),
            upstreams: Upstreams {
                opencode: "http://127.0.0.1:4096".into(),
                vscode: "http://127.0.0.1:4097".into(),
                vnc: "http://127.0.0.1:4098".into(),
                ttyd: "http://127.0.0.1:4099".into(),
            },
            client: reqwest::Client::new(),
        })
    }

    #[test]
    fn jwt_then_cookie_handoff() {
        let state = state();
        let now = time::OffsetDateTime::now_utc().unix_timestamp();

        // No credentials.
        let empty = HeaderMap::new();
        assert!(matches!(authenticate(&state, &empty), AuthOutcome::Denied));

        // Bearer JWT mints a cookie.
        let jwt = auth::sign_jwt("u1", "s1", now + 60, b"secret");
        let mut headers = HeaderMap::new();
        headers.insert("authorization", format!("Bearer {jwt}").parse().unwrap());
        let AuthOutcome::Ok {
            set_cookie: Some(cookie),
        } = authenticate(&state, &headers)
        else {
            panic!("expected cookie handoff");
        };

        // The cookie alone now authenticates; no new cookie minted.
        let token = cookie
            .split_once('=')
            .and_then(|(_, rest)| rest.split(';').next())
            .unwrap();
        let mut cookie_headers = HeaderMap::new();
        cookie_headers.insert(
            "cookie",
            format!("gateway_session={token}").parse().unwrap(),
        );
        assert!(matches!(
            authenticate(&state, &cookie_headers),
            AuthOutcome::Ok { set_cookie: None }
        ));
    }

    #[test]
    fn bad_jwt_is_denied() {
        let state = state();
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer not.a.jwt".parse().unwrap());
        assert!(matches!(authenticate(&state, &headers), AuthOutcome::Denied));
    }

    #[test]
    fn localhost_guard() {
        let local = ConnectInfo::<SocketAddr>("127.0.0.1:9999".parse().unwrap());
        assert!(require_localhost(&local).is_ok());
        let remote = ConnectInfo::<SocketAddr>("10.0.0.9:9999".parse().unwrap());
        assert_eq!(require_localhost(&remote).unwrap_err(), StatusCode::FORBIDDEN);
    }
}
