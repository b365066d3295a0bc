//! Request/response correlation with deadlines.
//!
//! Both the holder and the runner bridge keep one of these: register a
//! request id before sending, resolve it when the matching response
//! frame arrives, and let the deadline task reject it otherwise. Timers
//! are cancelled on response and on disconnect so a late delivery never
//! produces a spurious rejection.

use crate::error::PlatformError;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

type PendingResult = Result<Value, PlatformError>;

struct PendingEntry {
    responder: oneshot::Sender<PendingResult>,
    timer: JoinHandle<()>,
}

/// Concurrent map of in-flight correlated requests.
#[derive(Clone, Default)]
pub struct PendingMap {
    inner: Arc<Mutex<HashMap<String, PendingEntry>>>,
}

impl PendingMap {
    pub fn new() -> Self {
        PendingMap::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Register a request. The returned receiver resolves with the
    /// response, or with a typed timeout once `deadline` passes.
    pub fn register(
        &self,
        request_id: &str,
        operation: &str,
        deadline: Duration,
    ) -> oneshot::Receiver<PendingResult> {
        let (tx, rx) = oneshot::channel();
        let map = self.inner.clone();
        let id = request_id.to_string();
        let op = operation.to_string();
        let timer = tokio::spawn({
            let map = map.clone();
            let id = id.clone();
            async move {
                tokio::time::sleep(deadline).await;
                if let Some(entry) = map.lock().remove(&id) {
                    let _ = entry
                        .responder
                        .send(Err(PlatformError::timeout(op, deadline.as_secs())));
                }
            }
        });
        map.lock().insert(
            id,
            PendingEntry {
                responder: tx,
                timer,
            },
        );
        rx
    }

    /// Resolve a pending request. Returns false for unknown ids (late or
    /// duplicate responses), which callers log and drop.
    pub fn resolve(&self, request_id: &str, result: PendingResult) -> bool {
        let entry = self.inner.lock().remove(request_id);
        match entry {
            Some(entry) => {
                entry.timer.abort();
                let _ = entry.responder.send(result);
                true
            }
            None => false,
        }
    }

    /// Fail every pending request (socket disconnect). Timers are
    /// cancelled so nothing fires after the failure.
    pub fn fail_all(&self, error: PlatformError) {
        let drained: Vec<PendingEntry> = {
            let mut map = self.inner.lock();
            map.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.timer.abort();
            let _ = entry.responder.send(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_before_deadline_delivers_the_result() {
        let pending = PendingMap::new();
        let rx = pending.register("r1", "spawn-child", Duration::from_secs(5));
        assert!(pending.resolve("r1", Ok(serde_json::json!({"sessionId": "s2"}))));
        let result = rx.await.unwrap().unwrap();
        assert_eq!(result["sessionId"], "s2");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn deadline_rejects_with_typed_timeout() {
        let pending = PendingMap::new();
        let rx = pending.register("r1", "memory-read", Duration::from_millis(10));
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, PlatformError::Timeout { .. }));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn late_response_is_reported_unknown() {
        let pending = PendingMap::new();
        let rx = pending.register("r1", "op", Duration::from_millis(10));
        let _ = rx.await;
        assert!(!pending.resolve("r1", Ok(Value::Null)));
    }

    #[tokio::test]
    async fn fail_all_rejects_everything_and_cancels_timers() {
        let pending = PendingMap::new();
        let rx1 = pending.register("r1", "op", Duration::from_secs(60));
        let rx2 = pending.register("r2", "op", Duration::from_secs(60));
        pending.fail_all(PlatformError::Fatal("runner disconnected".into()));

        assert!(matches!(
            rx1.await.unwrap().unwrap_err(),
            PlatformError::Fatal(_)
        ));
        assert!(matches!(
            rx2.await.unwrap().unwrap_err(),
            PlatformError::Fatal(_)
        ));
        assert!(pending.is_empty());
    }
}
