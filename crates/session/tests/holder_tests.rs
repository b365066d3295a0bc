//! End-to-end holder behaviour through the actor interface: fake client
//! and runner sockets on mpsc channels, real store underneath.

use berth_core::config::PlatformConfig;
use berth_core::message::{Message as JournalMessage, Role};
use berth_core::protocol::{ClientFrame, ConnectedUser, QueueMode, QueuedPrompt, RunnerFrame};
use berth_core::question::PendingQuestion;
use berth_core::status::{AgentStatus, SessionPurpose, SessionStatus};
use berth_session::messages::{
    ClientConnect, ClientInput, EnqueuePrompt, RunnerConnect, RunnerInput, SweepQuestions,
};
use berth_session::registry::SessionRegistry;
use berth_session::sockets::{SocketOutput, SOCKET_BUFFER};
use berth_session::store::session_repo::NewSession;
use berth_session::store::{SessionRecord, SessionStore};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Harness {
    registry: Arc<SessionRegistry>,
    record: SessionRecord,
    token: String,
    actor: kameo::actor::ActorRef<berth_session::SessionActor>,
}

async fn harness() -> Harness {
    let store = SessionStore::open_in_memory().unwrap();
    let registry = SessionRegistry::new(store, Arc::new(PlatformConfig::default()));
    let (record, token) = registry
        .create_session(NewSession {
            owner_id: "u1".into(),
            workspace: "repo".into(),
            purpose: SessionPurpose::Interactive,
            parent_id: None,
            persona_id: None,
        })
        .await
        .unwrap();
    let actor = registry.ensure_actor(&record.id).await.unwrap();
    Harness {
        registry,
        record,
        token,
        actor,
    }
}

async fn connect_client(
    harness: &Harness,
    conn_id: &str,
) -> mpsc::Receiver<SocketOutput> {
    let (tx, rx) = mpsc::channel(SOCKET_BUFFER);
    harness
        .actor
        .tell(ClientConnect {
            conn_id: conn_id.into(),
            user: ConnectedUser {
                id: "u1".into(),
                name: Some("Alice".into()),
                ..ConnectedUser::default()
            },
            tx,
        })
        .await
        .unwrap();
    rx
}

async fn connect_runner(
    harness: &Harness,
    conn_id: &str,
    token: &str,
) -> Result<mpsc::Receiver<SocketOutput>, berth_core::PlatformError> {
    let (tx, rx) = mpsc::channel(SOCKET_BUFFER);
    harness
        .actor
        .ask(RunnerConnect {
            conn_id: conn_id.into(),
            token: token.into(),
            tx,
        })
        .await
        .map_err(|e| match e {
            kameo::error::SendError::HandlerError(err) => err,
            _ => berth_core::PlatformError::Internal("send failed".into()),
        })?;
    Ok(rx)
}

/// Drain frames until one matches, with a timeout.
async fn wait_for_frame(
    rx: &mut mpsc::Receiver<SocketOutput>,
    frame_type: &str,
) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let output = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {frame_type}"))
            .unwrap_or_else(|| panic!("socket closed waiting for {frame_type}"));
        match output {
            SocketOutput::Frame(json) => {
                let value: Value = serde_json::from_str(&json).unwrap();
                if value["type"] == frame_type {
                    return value;
                }
            }
            SocketOutput::Close { code, reason } => {
                panic!("unexpected close {code} {reason} while waiting for {frame_type}");
            }
        }
    }
}

async fn wait_for_close(rx: &mut mpsc::Receiver<SocketOutput>) -> (u16, String) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let output = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("timed out waiting for close")
            .expect("socket ended without close");
        if let SocketOutput::Close { code, reason } = output {
            return (code, reason);
        }
    }
}

#[tokio::test]
async fn streaming_text_end_to_end() {
    let harness = harness().await;
    let mut client_rx = connect_client(&harness, "c1").await;
    let init = wait_for_frame(&mut client_rx, "init").await;
    assert_eq!(init["snapshot"]["status"], "initializing");

    let mut runner_rx = connect_runner(&harness, "r1", &harness.token).await.unwrap();

    harness
        .actor
        .tell(ClientInput {
            conn_id: "c1".into(),
            frame: ClientFrame::Prompt {
                content: "hi".into(),
                model: None,
                attachments: None,
                queue_mode: QueueMode::Followup,
                channel_type: None,
                channel_id: None,
            },
        })
        .await
        .unwrap();

    // The runner receives the dispatched prompt.
    let prompt_frame = loop {
        match runner_rx.recv().await.unwrap() {
            SocketOutput::Frame(json) => {
                let value: Value = serde_json::from_str(&json).unwrap();
                if value["type"] == "prompt" {
                    break value;
                }
            }
            other => panic!("unexpected runner output: {other:?}"),
        }
    };
    assert_eq!(prompt_frame["prompt"]["content"], "hi");

    // The client saw its own message echoed.
    let user_msg = wait_for_frame(&mut client_rx, "message").await;
    assert_eq!(user_msg["message"]["content"], "hi");

    // Runner streams two chunks, then the final message.
    for delta in ["Hel", "lo"] {
        harness
            .actor
            .tell(RunnerInput {
                frame: RunnerFrame::Stream {
                    delta: delta.into(),
                },
            })
            .await
            .unwrap();
    }

    let status = wait_for_frame(&mut client_rx, "agentStatus").await;
    assert_eq!(status["status"], "streaming");
    let chunk1 = wait_for_frame(&mut client_rx, "chunk").await;
    assert_eq!(chunk1["delta"], "Hel");
    let chunk2 = wait_for_frame(&mut client_rx, "chunk").await;
    assert_eq!(chunk2["delta"], "lo");

    harness
        .actor
        .tell(RunnerInput {
            frame: RunnerFrame::Result {
                message: JournalMessage::new(Role::Assistant, "Hello"),
            },
        })
        .await
        .unwrap();

    let final_msg = wait_for_frame(&mut client_rx, "message").await;
    assert_eq!(final_msg["message"]["content"], "Hello");
    assert_eq!(final_msg["message"]["role"], "assistant");
    let idle = wait_for_frame(&mut client_rx, "agentStatus").await;
    assert_eq!(idle["status"], "idle");

    // The final assistant message is persisted.
    let rows = harness
        .registry
        .store()
        .messages
        .list(&harness.record.id)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].content, "Hello");
}

#[tokio::test]
async fn invalid_runner_token_is_rejected() {
    let harness = harness().await;
    let err = connect_runner(&harness, "r1", "0000").await.unwrap_err();
    assert_eq!(err.http_status(), 401);
}

#[tokio::test]
async fn supersession_closes_old_runner_and_delivers_queue_to_new() {
    let harness = harness().await;

    // Queue a prompt before any runner exists.
    harness
        .actor
        .ask(EnqueuePrompt {
            prompt: QueuedPrompt::text("pending work", QueueMode::Followup),
        })
        .await
        .unwrap();

    // Runner A attaches and receives the prompt.
    let mut runner_a = connect_runner(&harness, "rA", &harness.token).await.unwrap();
    loop {
        match runner_a.recv().await.unwrap() {
            SocketOutput::Frame(json) => {
                let value: Value = serde_json::from_str(&json).unwrap();
                if value["type"] == "prompt" {
                    break;
                }
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    // Runner B presents the same (still valid) token.
    let mut runner_b = connect_runner(&harness, "rB", &harness.token).await.unwrap();

    // A is closed with the supersession signal.
    let (code, reason) = wait_for_close(&mut runner_a).await;
    assert_eq!(code, 1000);
    assert!(reason.contains("Replaced by new runner connection"));

    // B receives the re-queued prompt.
    let prompt = loop {
        match runner_b.recv().await.unwrap() {
            SocketOutput::Frame(json) => {
                let value: Value = serde_json::from_str(&json).unwrap();
                if value["type"] == "prompt" {
                    break value;
                }
            }
            other => panic!("unexpected: {other:?}"),
        }
    };
    assert_eq!(prompt["prompt"]["content"], "pending work");
}

#[tokio::test]
async fn steer_aborts_and_jumps_the_queue() {
    let harness = harness().await;
    let mut runner_rx = connect_runner(&harness, "r1", &harness.token).await.unwrap();

    harness
        .actor
        .ask(EnqueuePrompt {
            prompt: QueuedPrompt::text("long job", QueueMode::Followup),
        })
        .await
        .unwrap();
    // Dispatched; a followup queues behind it.
    harness
        .actor
        .ask(EnqueuePrompt {
            prompt: QueuedPrompt::text("later", QueueMode::Followup),
        })
        .await
        .unwrap();
    harness
        .actor
        .ask(EnqueuePrompt {
            prompt: QueuedPrompt::text("actually, stop and do this", QueueMode::Steer),
        })
        .await
        .unwrap();

    // Expect: prompt(long job), then abort, then after idle ack the
    // steer prompt, before "later".
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while seen.len() < 2 {
        let output = tokio::time::timeout_at(deadline, runner_rx.recv())
            .await
            .expect("timed out")
            .expect("runner socket closed");
        if let SocketOutput::Frame(json) = output {
            let value: Value = serde_json::from_str(&json).unwrap();
            match value["type"].as_str() {
                Some("prompt") => seen.push(format!("prompt:{}", value["prompt"]["content"].as_str().unwrap())),
                Some("abort") => seen.push("abort".into()),
                _ => {}
            }
        }
    }
    assert_eq!(seen, ["prompt:long job", "abort"]);

    // Runner acknowledges idle after the abort; the steer dispatches.
    harness
        .actor
        .tell(RunnerInput {
            frame: RunnerFrame::AgentStatus {
                status: AgentStatus::Idle,
            },
        })
        .await
        .unwrap();

    let next = loop {
        match runner_rx.recv().await.unwrap() {
            SocketOutput::Frame(json) => {
                let value: Value = serde_json::from_str(&json).unwrap();
                if value["type"] == "prompt" {
                    break value;
                }
            }
            other => panic!("unexpected: {other:?}"),
        }
    };
    assert_eq!(next["prompt"]["content"], "actually, stop and do this");
}

#[tokio::test]
async fn question_lifecycle_answer_and_expiry() {
    let harness = harness().await;
    let mut client_rx = connect_client(&harness, "c1").await;
    wait_for_frame(&mut client_rx, "init").await;
    let mut runner_rx = connect_runner(&harness, "r1", &harness.token).await.unwrap();

    harness
        .actor
        .tell(RunnerInput {
            frame: RunnerFrame::Question {
                question: PendingQuestion {
                    question_id: "q1".into(),
                    text: "deploy?".into(),
                    options: Some(vec!["yes".into(), "no".into()]),
                    expires_at: None,
                    channel_type: None,
                    channel_id: None,
                },
            },
        })
        .await
        .unwrap();
    let question = wait_for_frame(&mut client_rx, "question").await;
    assert_eq!(question["question"]["questionId"], "q1");

    harness
        .actor
        .tell(ClientInput {
            conn_id: "c1".into(),
            frame: ClientFrame::Answer {
                question_id: "q1".into(),
                answer: "yes".into(),
            },
        })
        .await
        .unwrap();

    // Runner receives the routed answer.
    let answer = loop {
        match runner_rx.recv().await.unwrap() {
            SocketOutput::Frame(json) => {
                let value: Value = serde_json::from_str(&json).unwrap();
                if value["type"] == "answer" {
                    break value;
                }
            }
            other => panic!("unexpected: {other:?}"),
        }
    };
    assert_eq!(answer["answer"], "yes");

    // A status event names the resolved question.
    let status = wait_for_frame(&mut client_rx, "status").await;
    assert_eq!(status["event"]["kind"], "questionAnswered");
    assert_eq!(status["event"]["questionId"], "q1");

    // Expired questions announce questionExpired on sweep.
    harness
        .actor
        .tell(RunnerInput {
            frame: RunnerFrame::Question {
                question: PendingQuestion {
                    question_id: "q2".into(),
                    text: "stale?".into(),
                    options: None,
                    expires_at: Some(time::OffsetDateTime::now_utc() - time::Duration::minutes(1)),
                    channel_type: None,
                    channel_id: None,
                },
            },
        })
        .await
        .unwrap();
    wait_for_frame(&mut client_rx, "question").await;
    harness.actor.tell(SweepQuestions).await.unwrap();
    let expired = wait_for_frame(&mut client_rx, "status").await;
    assert_eq!(expired["event"]["kind"], "questionExpired");
    assert_eq!(expired["event"]["questionId"], "q2");
}

#[tokio::test]
async fn holder_restart_replays_journal_and_queue() {
    let harness = harness().await;
    harness
        .actor
        .ask(EnqueuePrompt {
            prompt: QueuedPrompt::text("survive me", QueueMode::Followup),
        })
        .await
        .unwrap();

    // Simulate a holder crash: drop the actor from the registry and
    // spawn a fresh one over the same store.
    harness.registry.remove(&harness.record.id).await;
    let actor = harness
        .registry
        .ensure_actor(&harness.record.id)
        .await
        .unwrap();

    // A reconnecting client receives an init snapshot with the replayed
    // journal and the still-queued prompt.
    let (tx, mut rx) = mpsc::channel(SOCKET_BUFFER);
    actor
        .tell(ClientConnect {
            conn_id: "c1".into(),
            user: ConnectedUser {
                id: "u1".into(),
                ..ConnectedUser::default()
            },
            tx,
        })
        .await
        .unwrap();
    let init = wait_for_frame(&mut rx, "init").await;
    assert_eq!(init["snapshot"]["messages"][0]["content"], "survive me");
    assert_eq!(init["snapshot"]["queuedPrompts"], 1);
    assert_eq!(init["snapshot"]["agentStatus"], "queued");
}

#[tokio::test]
async fn runner_error_becomes_error_frame_and_system_message() {
    let harness = harness().await;
    let mut client_rx = connect_client(&harness, "c1").await;
    wait_for_frame(&mut client_rx, "init").await;
    let _runner_rx = connect_runner(&harness, "r1", &harness.token).await.unwrap();

    harness
        .actor
        .tell(RunnerInput {
            frame: RunnerFrame::Error {
                message: "model exploded".into(),
            },
        })
        .await
        .unwrap();

    let error = wait_for_frame(&mut client_rx, "error").await;
    assert_eq!(error["message"], "model exploded");
    let system = wait_for_frame(&mut client_rx, "message").await;
    assert_eq!(system["message"]["role"], "system");
    assert_eq!(system["message"]["content"], "Error: model exploded");

    let rows = harness
        .registry
        .store()
        .messages
        .list(&harness.record.id)
        .await
        .unwrap();
    assert_eq!(rows.last().unwrap().content, "Error: model exploded");
}
