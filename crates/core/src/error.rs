//! Structured error type shared across the platform.
//!
//! Every layer raises `PlatformError`; HTTP routes map variants to status
//! codes through [`PlatformError::http_status`], and the session holder
//! turns runner-reported errors into `error` frames plus a `system`
//! journal message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type PlatformResult<T> = Result<T, PlatformError>;

/// Typed, serializable error for the berth platform.
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum PlatformError {
    /// Bad input at any boundary. Returned to clients, never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Addressed entity missing or not visible to the caller.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Missing or bad credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Caller lacks the required role or visibility.
    #[error("permission denied: {0}")]
    Permission(String),

    /// State conflict: terminal execution, failed orchestrator dispatch,
    /// mismatched resume token.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Admission rejected. Carries both counters for client back-off.
    #[error("concurrency limit reached: {active_user} active for user, {active_global} global (limit {limit})")]
    Concurrency {
        active_user: u32,
        active_global: u32,
        limit: u32,
    },

    /// A correlated request/response exceeded its deadline.
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// Proxy or third-party channel returned non-OK.
    #[error("upstream returned {status}: {body_prefix}")]
    Upstream { status: u16, body_prefix: String },

    /// Runner supersession or credential rotation. Causes process exit.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Channel adapter failure (send/edit/delete, webhook registration).
    #[error("channel error: {0}")]
    Channel(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PlatformError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        PlatformError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        PlatformError::Validation(msg.into())
    }

    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        PlatformError::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    /// HTTP status code this error maps to at route boundaries.
    ///
    /// | Variant        | Code |
    /// |----------------|------|
    /// | Validation     | 400  |
    /// | Unauthorized   | 401  |
    /// | Permission     | 403  |
    /// | NotFound       | 404  |
    /// | Conflict       | 409  |
    /// | Concurrency    | 429  |
    /// | Upstream, Channel | 502 |
    /// | everything else   | 500 |
    pub fn http_status(&self) -> u16 {
        match self {
            PlatformError::Validation(_) => 400,
            PlatformError::Unauthorized(_) => 401,
            PlatformError::Permission(_) => 403,
            PlatformError::NotFound { .. } => 404,
            PlatformError::Conflict(_) => 409,
            PlatformError::Concurrency { .. } => 429,
            PlatformError::Upstream { .. } | PlatformError::Channel(_) => 502,
            _ => 500,
        }
    }

    /// Short machine-readable tag used in JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            PlatformError::Validation(_) => "validation",
            PlatformError::NotFound { .. } => "not_found",
            PlatformError::Unauthorized(_) => "unauthorized",
            PlatformError::Permission(_) => "permission",
            PlatformError::Conflict(_) => "conflict",
            PlatformError::Concurrency { .. } => "concurrency",
            PlatformError::Timeout { .. } => "timeout",
            PlatformError::Upstream { .. } => "upstream",
            PlatformError::Fatal(_) => "fatal",
            PlatformError::Store(_) => "store",
            PlatformError::Serialization(_) => "serialization",
            PlatformError::Channel(_) => "channel",
            PlatformError::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for PlatformError {
    fn from(e: serde_json::Error) -> Self {
        PlatformError::Serialization(e.to_string())
    }
}
