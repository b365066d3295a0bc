//! Shared kernel for the berth platform.
//!
//! Everything that the session holder, the channel adapters, the sandbox
//! runner and the workflow dispatcher agree on lives here: scope keys,
//! the message model and journal, session/agent statuses, the wire
//! protocol, the correlation map both socket ends share, and the
//! platform error taxonomy.

pub mod config;
pub mod correlation;
pub mod error;
pub mod journal;
pub mod message;
pub mod protocol;
pub mod question;
pub mod scope;
pub mod status;

pub use error::{PlatformError, PlatformResult};
pub use scope::{ScopeKey, ScopeKeyParts, UserIdentityLink};
pub use status::{AgentStatus, SessionPurpose, SessionStatus};
