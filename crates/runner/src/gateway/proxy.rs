//! The forwarding half of the gateway: plain HTTP and tunneled
//! WebSockets.
//!
//! Bodies must arrive byte-exact on both sides, so upstream requests ask
//! for identity encoding and the hop-by-hop headers are stripped in both
//! directions. WebSocket tunnels open one upstream socket per client
//! upgrade; frames that arrive while the upstream handshake is still in
//! flight are buffered and flushed in order.

use super::SharedState;
use axum::body::Body;
use axum::extract::ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage, WebSocket};
use axum::extract::{Request, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use berth_core::protocol::CLOSE_UPSTREAM_ERROR;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as TungCloseFrame;
use tokio_tungstenite::tungstenite::Message as TungMessage;

/// Headers that never cross the proxy, either direction.
const HOP_HEADERS: &[&str] = &[
    "content-encoding",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "host",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "proxy-authenticate",
    "proxy-authorization",
];

pub fn is_hop_header(name: &str) -> bool {
    HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Upstream request URL for a proxied call.
pub fn upstream_url(base: &str, rest: &str, query: Option<&str>) -> String {
    let base = base.trim_end_matches('/');
    match query {
        Some(query) if !query.is_empty() => format!("{base}/{rest}?{query}"),
        _ => format!("{base}/{rest}"),
    }
}

/// Entry point shared by all proxied prefixes.
#[allow(clippy::too_many_arguments)]
pub async fn handle(
    state: SharedState,
    upstream_base: String,
    rest: String,
    set_cookie: Option<String>,
    ws: Option<WebSocketUpgrade>,
    req: Request,
    subprotocol: Option<&'static str>,
) -> Response {
    let mut response = match ws {
        Some(upgrade) => {
            let ws_url = upstream_url(
                &upstream_base.replacen("http", "ws", 1),
                &rest,
                req.uri().query(),
            );
            let upgrade = match subprotocol {
                Some(proto) => upgrade.protocols([proto]),
                None => upgrade,
            };
            upgrade.on_upgrade(move |socket| tunnel(socket, ws_url))
        }
        None => forward_http(&state, &upstream_base, &rest, req).await,
    };

    if let Some(cookie) = set_cookie {
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append("set-cookie", value);
        }
    }
    response
}

async fn forward_http(
    state: &SharedState,
    upstream_base: &str,
    rest: &str,
    req: Request,
) -> Response {
    let url = upstream_url(upstream_base, rest, req.uri().query());
    let method = match reqwest::Method::from_bytes(req.method().as_str().as_bytes()) {
        Ok(method) => method,
        Err(_) => return StatusCode::METHOD_NOT_ALLOWED.into_response(),
    };

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in req.headers() {
        if is_hop_header(name.as_str()) || name.as_str() == "accept-encoding" {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.insert(name, value);
        }
    }
    // Tunneled bodies stay byte-exact.
    headers.insert(
        reqwest::header::ACCEPT_ENCODING,
        reqwest::header::HeaderValue::from_static("identity"),
    );

    let body = match axum::body::to_bytes(req.into_body(), 64 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("proxy: body read failed: {e}");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let upstream_response = match state
        .client
        .request(method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            log::warn!("proxy: upstream {url} failed: {e}");
            return (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response();
        }
    };

    let status = StatusCode::from_u16(upstream_response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream_response.headers() {
        if is_hop_header(name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            response_headers.insert(name, value);
        }
    }

    let bytes = match upstream_response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("proxy: upstream body read failed: {e}");
            return (StatusCode::BAD_GATEWAY, "upstream body error").into_response();
        }
    };

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

// ── WebSocket tunneling ──────────────────────────────────────────────────

async fn tunnel(mut client: WebSocket, upstream_url: String) {
    // Buffer client frames that land before the upstream handshake
    // completes; flush them in arrival order.
    let mut pre_buffer: Vec<AxumMessage> = Vec::new();
    let connect = connect_async(&upstream_url);
    tokio::pin!(connect);

    let upstream = loop {
        tokio::select! {
            connected = &mut connect => {
                match connected {
                    Ok((stream, _response)) => break stream,
                    Err(e) => {
                        log::warn!("proxy: upstream ws {upstream_url} failed: {e}");
                        let _ = client
                            .send(AxumMessage::Close(Some(AxumCloseFrame {
                                code: CLOSE_UPSTREAM_ERROR,
                                reason: "upstream connect failed".into(),
                            })))
                            .await;
                        return;
                    }
                }
            }
            early = client.recv() => {
                match early {
                    Some(Ok(msg)) => pre_buffer.push(msg),
                    _ => return, // client went away before the tunnel opened
                }
            }
        }
    };

    let (mut upstream_sink, mut upstream_source) = upstream.split();
    for msg in pre_buffer.drain(..) {
        let Some(converted) = client_to_upstream(msg) else {
            continue;
        };
        if upstream_sink.send(converted).await.is_err() {
            let _ = client
                .send(AxumMessage::Close(Some(AxumCloseFrame {
                    code: CLOSE_UPSTREAM_ERROR,
                    reason: "upstream write failed".into(),
                })))
                .await;
            return;
        }
    }

    let (mut client_sink, mut client_source) = client.split();
    loop {
        tokio::select! {
            from_client = client_source.next() => {
                match from_client {
                    Some(Ok(msg)) => {
                        let closing = matches!(msg, AxumMessage::Close(_));
                        if let Some(converted) = client_to_upstream(msg) {
                            if upstream_sink.send(converted).await.is_err() {
                                break;
                            }
                        }
                        if closing {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        log::debug!("proxy: client ws error: {e}");
                        let _ = upstream_sink
                            .send(TungMessage::Close(Some(TungCloseFrame {
                                code: CloseCode::Away,
                                reason: "client error".into(),
                            })))
                            .await;
                        break;
                    }
                    None => {
                        let _ = upstream_sink.send(TungMessage::Close(None)).await;
                        break;
                    }
                }
            }
            from_upstream = upstream_source.next() => {
                match from_upstream {
                    Some(Ok(msg)) => {
                        let closing = matches!(msg, TungMessage::Close(_));
                        if let Some(converted) = upstream_to_client(msg) {
                            if client_sink.send(converted).await.is_err() {
                                break;
                            }
                        }
                        if closing {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        log::debug!("proxy: upstream ws error: {e}");
                        let _ = client_sink
                            .send(AxumMessage::Close(Some(AxumCloseFrame {
                                code: CLOSE_UPSTREAM_ERROR,
                                reason: "upstream error".into(),
                            })))
                            .await;
                        break;
                    }
                    None => {
                        let _ = client_sink.send(AxumMessage::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }
}

fn client_to_upstream(msg: AxumMessage) -> Option<TungMessage> {
    match msg {
        AxumMessage::Text(text) => Some(TungMessage::Text(text.as_str().into())),
        AxumMessage::Binary(bytes) => Some(TungMessage::Binary(bytes)),
        AxumMessage::Ping(bytes) => Some(TungMessage::Ping(bytes)),
        AxumMessage::Pong(bytes) => Some(TungMessage::Pong(bytes)),
        AxumMessage::Close(frame) => Some(TungMessage::Close(frame.map(|f| TungCloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason.as_str().to_string().into(),
        }))),
    }
}

fn upstream_to_client(msg: TungMessage) -> Option<AxumMessage> {
    match msg {
        TungMessage::Text(text) => Some(AxumMessage::Text(text.as_str().into())),
        TungMessage::Binary(bytes) => Some(AxumMessage::Binary(bytes)),
        TungMessage::Ping(bytes) => Some(AxumMessage::Ping(bytes)),
        TungMessage::Pong(bytes) => Some(AxumMessage::Pong(bytes)),
        TungMessage::Close(frame) => Some(AxumMessage::Close(frame.map(|f| AxumCloseFrame {
            code: f.code.into(),
            reason: f.reason.as_str().to_string().into(),
        }))),
        TungMessage::Frame(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_headers_are_stripped_case_insensitively() {
        for header in [
            "content-encoding",
            "Transfer-Encoding",
            "CONNECTION",
            "keep-alive",
            "Host",
        ] {
            assert!(is_hop_header(header), "{header} should be stripped");
        }
        assert!(!is_hop_header("content-type"));
        assert!(!is_hop_header("authorization"));
    }

    #[test]
    fn upstream_urls_preserve_path_and_query() {
        assert_eq!(
            upstream_url("http://127.0.0.1:8443", "static/app.js", None),
            "http://127.0.0.1:8443/static/app.js"
        );
        assert_eq!(
            upstream_url("http://127.0.0.1:8443/", "a/b", Some("x=1&y=2")),
            "http://127.0.0.1:8443/a/b?x=1&y=2"
        );
        assert_eq!(
            upstream_url("http://127.0.0.1:8443", "a", Some("")),
            "http://127.0.0.1:8443/a"
        );
    }
}
