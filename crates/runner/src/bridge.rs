//! The holder bridge: a persistent WebSocket client with buffering,
//! correlation and a deliberate exit policy.
//!
//! Reconnection is exponential backoff (1 s base, 30 s cap, reset on a
//! successful open). Outbound frames queue while disconnected and flush
//! FIFO on reconnect. Two close signals end the process instead of
//! reconnecting: a normal close whose reason carries the supersession
//! marker (exit 0), and five consecutive `1002` upgrade rejections,
//! which mean the stored runner token was rotated and this sandbox is
//! orphaned (exit 1).

use berth_core::correlation::PendingMap;
use berth_core::error::{PlatformError, PlatformResult};
use berth_core::protocol::{
    op_deadline, HolderFrame, RunnerFrame, RunnerOp, MAX_CONSECUTIVE_UPGRADE_FAILURES,
    PING_INTERVAL, SUPERSEDED_REASON,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Why the bridge stopped for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Superseded by a newer runner; exit 0.
    Superseded,
    /// Token rotated out from under us; exit 1.
    CredentialsRotated,
}

impl ExitReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitReason::Superseded => 0,
            ExitReason::CredentialsRotated => 1,
        }
    }
}

/// How one connected session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DriveEnd {
    /// Supersession close; terminal.
    Superseded,
    /// Upgrade rejected with 1002 (stale token).
    Rejected,
    /// Anything else: reconnect.
    Lost,
}

/// Classify a server close frame.
fn classify_close(code: u16, reason: &str) -> DriveEnd {
    if code == 1002 {
        DriveEnd::Rejected
    } else if reason.contains(SUPERSEDED_REASON) {
        DriveEnd::Superseded
    } else {
        DriveEnd::Lost
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// `ws://host/ws/runner/{sessionId}` — the token rides as a query
    /// parameter.
    pub holder_url: String,
    pub token: String,
    pub ping_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl BridgeConfig {
    pub fn new(holder_url: impl Into<String>, token: impl Into<String>) -> Self {
        BridgeConfig {
            holder_url: holder_url.into(),
            token: token.into(),
            ping_interval: PING_INTERVAL,
            backoff_base: BACKOFF_BASE,
            backoff_cap: BACKOFF_CAP,
        }
    }

    fn url_with_token(&self) -> String {
        let sep = if self.holder_url.contains('?') { '&' } else { '?' };
        format!("{}{sep}token={}", self.holder_url, self.token)
    }
}

/// Sender half handed to the gateway and the agent loop.
#[derive(Clone)]
pub struct BridgeHandle {
    out_tx: mpsc::UnboundedSender<String>,
    pending: PendingMap,
}

impl BridgeHandle {
    /// Queue a frame. Buffered while disconnected; FIFO on flush.
    pub fn send(&self, frame: &RunnerFrame) -> PlatformResult<()> {
        let json = serde_json::to_string(frame)?;
        self.out_tx
            .send(json)
            .map_err(|_| PlatformError::Fatal("bridge is shut down".into()))
    }

    /// Issue a correlated operation and await the holder's response.
    pub async fn request(&self, op: RunnerOp) -> PlatformResult<Value> {
        let request_id = Uuid::new_v4().to_string();
        let deadline = op_deadline(op.class());
        let rx = self
            .pending
            .register(&request_id, &op_name(&op), deadline);
        self.send(&RunnerFrame::Request {
            request_id,
            op,
        })?;
        rx.await
            .map_err(|_| PlatformError::Fatal("bridge is shut down".into()))?
    }
}

fn op_name(op: &RunnerOp) -> String {
    serde_json::to_value(op)
        .ok()
        .and_then(|v| v["op"].as_str().map(String::from))
        .unwrap_or_else(|| "op".to_string())
}

pub struct Bridge {
    config: BridgeConfig,
    handle: BridgeHandle,
    out_rx: mpsc::UnboundedReceiver<String>,
    /// Frames other than correlated responses, for the agent loop.
    incoming_tx: mpsc::UnboundedSender<HolderFrame>,
}

impl Bridge {
    /// Build a bridge. Returns the bridge itself (run it with
    /// [`Bridge::run`]), the cloneable handle, and the stream of holder
    /// frames.
    pub fn new(
        config: BridgeConfig,
    ) -> (Self, BridgeHandle, mpsc::UnboundedReceiver<HolderFrame>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let handle = BridgeHandle {
            out_tx,
            pending: PendingMap::new(),
        };
        let bridge = Bridge {
            config,
            handle: handle.clone(),
            out_rx,
            incoming_tx,
        };
        (bridge, handle, incoming_rx)
    }

    /// Run until a terminal signal. The return value decides the process
    /// exit code.
    pub async fn run(mut self) -> ExitReason {
        let mut backoff = self.config.backoff_base;
        let mut consecutive_rejections: u32 = 0;
        // Frames pulled off the channel but not yet delivered (the
        // connection died mid-send). Flushed first on reconnect.
        let mut unsent: VecDeque<String> = VecDeque::new();

        loop {
            match connect_async(self.config.url_with_token()).await {
                Ok((stream, _response)) => {
                    log::info!("bridge: connected to {}", self.config.holder_url);
                    backoff = self.config.backoff_base;
                    let end = self.drive(stream, &mut unsent).await;
                    self.handle
                        .pending
                        .fail_all(PlatformError::Fatal("holder connection lost".into()));
                    match end {
                        DriveEnd::Superseded => {
                            log::info!("bridge: superseded by a new runner, exiting");
                            return ExitReason::Superseded;
                        }
                        DriveEnd::Rejected => {
                            consecutive_rejections += 1;
                            log::warn!(
                                "bridge: upgrade rejected ({consecutive_rejections}/{MAX_CONSECUTIVE_UPGRADE_FAILURES})"
                            );
                            if consecutive_rejections >= MAX_CONSECUTIVE_UPGRADE_FAILURES {
                                log::error!(
                                    "bridge: runner token rotated, sandbox is orphaned"
                                );
                                return ExitReason::CredentialsRotated;
                            }
                        }
                        DriveEnd::Lost => {
                            consecutive_rejections = 0;
                        }
                    }
                }
                Err(e) => {
                    log::warn!("bridge: connect failed: {e}");
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.backoff_cap);
        }
    }

    /// Pump one live connection until it ends.
    async fn drive(
        &mut self,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        unsent: &mut VecDeque<String>,
    ) -> DriveEnd {
        let (mut sink, mut source) = stream.split();

        // Flush anything left over from the previous connection.
        while let Some(json) = unsent.pop_front() {
            if sink.send(WsMessage::Text(json.clone().into())).await.is_err() {
                unsent.push_front(json);
                return DriveEnd::Lost;
            }
        }

        let mut ping_timer = tokio::time::interval(self.config.ping_interval);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_timer.tick().await; // immediate first tick
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                outbound = self.out_rx.recv() => {
                    let Some(json) = outbound else {
                        // All handles dropped: runner is shutting down.
                        let _ = sink.send(WsMessage::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "runner shutdown".into(),
                        }))).await;
                        return DriveEnd::Lost;
                    };
                    if sink.send(WsMessage::Text(json.clone().into())).await.is_err() {
                        unsent.push_back(json);
                        return DriveEnd::Lost;
                    }
                }
                _ = ping_timer.tick() => {
                    if awaiting_pong {
                        log::warn!("bridge: no pong within a ping cycle, reconnecting");
                        return DriveEnd::Lost;
                    }
                    awaiting_pong = true;
                    if let Ok(json) = serde_json::to_string(&RunnerFrame::Ping) {
                        if sink.send(WsMessage::Text(json.into())).await.is_err() {
                            return DriveEnd::Lost;
                        }
                    }
                }
                inbound = source.next() => {
                    match inbound {
                        Some(Ok(WsMessage::Text(text))) => {
                            match serde_json::from_str::<HolderFrame>(&text) {
                                Ok(HolderFrame::Pong) => awaiting_pong = false,
                                Ok(HolderFrame::Ping) => {
                                    let _ = self.handle.send(&RunnerFrame::Pong);
                                }
                                Ok(HolderFrame::Response { request_id, result, error }) => {
                                    let outcome = match error {
                                        Some(message) => Err(PlatformError::Internal(message)),
                                        None => Ok(result.unwrap_or(Value::Null)),
                                    };
                                    if !self.handle.pending.resolve(&request_id, outcome) {
                                        log::debug!("bridge: late response {request_id} dropped");
                                    }
                                }
                                Ok(frame) => {
                                    if self.incoming_tx.send(frame).is_err() {
                                        log::warn!("bridge: frame consumer gone");
                                        return DriveEnd::Lost;
                                    }
                                }
                                Err(e) => {
                                    log::warn!("bridge: undecodable frame dropped: {e}");
                                }
                            }
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            let _ = sink.send(WsMessage::Pong(payload)).await;
                        }
                        Some(Ok(WsMessage::Pong(_))) => {
                            awaiting_pong = false;
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            let (code, reason) = match &frame {
                                Some(f) => (u16::from(f.code), f.reason.to_string()),
                                None => (1005, String::new()),
                            };
                            log::info!("bridge: holder closed: {code} {reason}");
                            return classify_close(code, &reason);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("bridge: socket error: {e}");
                            return DriveEnd::Lost;
                        }
                        None => return DriveEnd::Lost,
                    }
                }
            }
        }
    }
}
