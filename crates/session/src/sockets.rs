//! Socket bookkeeping for the three connection roles.
//!
//! The holder owns every socket attached to its session. Each socket is
//! represented by an mpsc sender of [`SocketOutput`]; the WebSocket task
//! on the other end writes frames out and interprets `Close`. Sends are
//! non-blocking: a slow client drops frames (it recovers from snapshots)
//! instead of stalling the actor.

use berth_core::protocol::{ConnectedUser, HolderFrame, ServerFrame};
use tokio::sync::mpsc;

/// What a socket task receives from the holder.
#[derive(Debug, Clone)]
pub enum SocketOutput {
    /// A serialized JSON frame to write.
    Frame(String),
    /// Close the socket with this code/reason and end the task.
    Close { code: u16, reason: String },
}

pub type SocketSender = mpsc::Sender<SocketOutput>;

/// Buffer depth for per-socket outboxes.
pub const SOCKET_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct ClientSocket {
    pub conn_id: String,
    pub user: ConnectedUser,
    tx: SocketSender,
}

#[derive(Debug, Clone)]
pub struct ChannelSocket {
    pub conn_id: String,
    pub scope_key: String,
    pub channel_type: String,
    pub channel_id: String,
    tx: SocketSender,
}

#[derive(Debug)]
pub struct RunnerSocket {
    pub conn_id: String,
    tx: SocketSender,
}

impl RunnerSocket {
    pub fn new(conn_id: String, tx: SocketSender) -> Self {
        RunnerSocket { conn_id, tx }
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.try_send(SocketOutput::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// All sockets attached to one session.
#[derive(Debug, Default)]
pub struct SocketHub {
    clients: Vec<ClientSocket>,
    channels: Vec<ChannelSocket>,
    runner: Option<RunnerSocket>,
}

impl SocketHub {
    pub fn new() -> Self {
        SocketHub::default()
    }

    // ── Clients ──────────────────────────────────────────────────────────

    pub fn add_client(&mut self, conn_id: String, user: ConnectedUser, tx: SocketSender) {
        self.clients.push(ClientSocket { conn_id, user, tx });
    }

    pub fn remove_client(&mut self, conn_id: &str) -> Option<ClientSocket> {
        let pos = self.clients.iter().position(|c| c.conn_id == conn_id)?;
        Some(self.clients.remove(pos))
    }

    pub fn roster(&self) -> Vec<ConnectedUser> {
        self.clients.iter().map(|c| c.user.clone()).collect()
    }

    pub fn client_user(&self, conn_id: &str) -> Option<&ConnectedUser> {
        self.clients
            .iter()
            .find(|c| c.conn_id == conn_id)
            .map(|c| &c.user)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Fan a frame out to every client. Lossy per client by design.
    pub fn broadcast(&self, frame: &ServerFrame) {
        let Ok(json) = serde_json::to_string(frame) else {
            log::error!("socket hub: unserializable frame");
            return;
        };
        for client in &self.clients {
            if client.tx.try_send(SocketOutput::Frame(json.clone())).is_err() {
                log::debug!("socket hub: dropped frame for slow client {}", client.conn_id);
            }
        }
        // Channel sockets subscribe to the same stream.
        for channel in &self.channels {
            let _ = channel.tx.try_send(SocketOutput::Frame(json.clone()));
        }
    }

    /// Send one frame to one client connection.
    pub fn send_to_client(&self, conn_id: &str, frame: &ServerFrame) {
        let Ok(json) = serde_json::to_string(frame) else {
            return;
        };
        if let Some(client) = self.clients.iter().find(|c| c.conn_id == conn_id) {
            let _ = client.tx.try_send(SocketOutput::Frame(json));
        }
    }

    // ── Channel sockets ──────────────────────────────────────────────────

    pub fn add_channel(
        &mut self,
        conn_id: String,
        scope_key: String,
        channel_type: String,
        channel_id: String,
        tx: SocketSender,
    ) {
        self.channels.push(ChannelSocket {
            conn_id,
            scope_key,
            channel_type,
            channel_id,
            tx,
        });
    }

    pub fn remove_channel(&mut self, conn_id: &str) -> Option<ChannelSocket> {
        let pos = self.channels.iter().position(|c| c.conn_id == conn_id)?;
        Some(self.channels.remove(pos))
    }

    /// Per-channel fan-out, addressed by `(channelType, channelId)`.
    pub fn send_to_channel(&self, channel_type: &str, channel_id: &str, frame: &ServerFrame) {
        let Ok(json) = serde_json::to_string(frame) else {
            return;
        };
        for channel in self
            .channels
            .iter()
            .filter(|c| c.channel_type == channel_type && c.channel_id == channel_id)
        {
            let _ = channel.tx.try_send(SocketOutput::Frame(json.clone()));
        }
    }

    // ── Runner ───────────────────────────────────────────────────────────

    /// Attach a runner socket, returning the superseded one (the caller
    /// closes it with the supersession reason).
    pub fn attach_runner(&mut self, socket: RunnerSocket) -> Option<RunnerSocket> {
        self.runner.replace(socket)
    }

    /// Detach the runner, but only if the conn id still matches — a
    /// disconnect notification from a superseded socket must not tear
    /// down its replacement.
    pub fn detach_runner(&mut self, conn_id: &str) -> Option<RunnerSocket> {
        if self.runner.as_ref().map(|r| r.conn_id.as_str()) == Some(conn_id) {
            self.runner.take()
        } else {
            None
        }
    }

    /// Detach whichever runner is attached, regardless of conn id
    /// (token rotation, termination).
    pub fn detach_runner_any(&mut self) -> Option<RunnerSocket> {
        self.runner.take()
    }

    pub fn has_runner(&self) -> bool {
        self.runner.is_some()
    }

    pub fn runner_conn_id(&self) -> Option<&str> {
        self.runner.as_ref().map(|r| r.conn_id.as_str())
    }

    /// Outbox of the attached runner socket, for detached tasks that
    /// reply to runner requests directly.
    pub fn runner_tx(&self) -> Option<SocketSender> {
        self.runner.as_ref().map(|r| r.tx.clone())
    }

    /// Send a frame to the runner. Returns false when no runner is
    /// attached or its outbox is gone.
    pub fn send_runner(&self, frame: &HolderFrame) -> bool {
        let Some(runner) = &self.runner else {
            return false;
        };
        let Ok(json) = serde_json::to_string(frame) else {
            return false;
        };
        runner.tx.try_send(SocketOutput::Frame(json)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::status::AgentStatus;

    fn channel(capacity: usize) -> (SocketSender, mpsc::Receiver<SocketOutput>) {
        mpsc::channel(capacity)
    }

    fn user(id: &str) -> ConnectedUser {
        ConnectedUser {
            id: id.into(),
            ..ConnectedUser::default()
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_all_clients() {
        let mut hub = SocketHub::new();
        let (tx1, mut rx1) = channel(8);
        let (tx2, mut rx2) = channel(8);
        hub.add_client("c1".into(), user("u1"), tx1);
        hub.add_client("c2".into(), user("u2"), tx2);

        hub.broadcast(&ServerFrame::Pong);
        assert!(matches!(rx1.recv().await, Some(SocketOutput::Frame(_))));
        assert!(matches!(rx2.recv().await, Some(SocketOutput::Frame(_))));
    }

    #[tokio::test]
    async fn slow_clients_drop_rather_than_block() {
        let mut hub = SocketHub::new();
        let (tx, mut rx) = channel(1);
        hub.add_client("c1".into(), user("u1"), tx);

        hub.broadcast(&ServerFrame::Pong);
        hub.broadcast(&ServerFrame::Pong); // buffer full: dropped
        assert!(matches!(rx.try_recv(), Ok(SocketOutput::Frame(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn attach_runner_supersedes_previous() {
        let mut hub = SocketHub::new();
        let (tx1, _rx1) = channel(8);
        let (tx2, _rx2) = channel(8);

        assert!(hub.attach_runner(RunnerSocket::new("r1".into(), tx1)).is_none());
        let replaced = hub.attach_runner(RunnerSocket::new("r2".into(), tx2)).unwrap();
        assert_eq!(replaced.conn_id, "r1");
        assert_eq!(hub.runner_conn_id(), Some("r2"));
    }

    #[tokio::test]
    async fn detach_ignores_stale_conn_ids() {
        let mut hub = SocketHub::new();
        let (tx, _rx) = channel(8);
        hub.attach_runner(RunnerSocket::new("r2".into(), tx));
        assert!(hub.detach_runner("r1").is_none());
        assert!(hub.has_runner());
        assert!(hub.detach_runner("r2").is_some());
        assert!(!hub.has_runner());
    }

    #[tokio::test]
    async fn channel_fanout_is_addressed() {
        let mut hub = SocketHub::new();
        let (tx1, mut rx1) = channel(8);
        let (tx2, mut rx2) = channel(8);
        hub.add_channel(
            "ch1".into(),
            "user:u:telegram:1".into(),
            "telegram".into(),
            "1".into(),
            tx1,
        );
        hub.add_channel(
            "ch2".into(),
            "user:u:telegram:2".into(),
            "telegram".into(),
            "2".into(),
            tx2,
        );

        hub.send_to_channel(
            "telegram",
            "1",
            &ServerFrame::AgentStatus {
                status: AgentStatus::Streaming,
                channel_type: Some("telegram".into()),
                channel_id: Some("1".into()),
            },
        );
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }
}
