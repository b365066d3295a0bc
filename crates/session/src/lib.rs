//! Session state holders.
//!
//! One kameo actor per session owns the journal head, the prompt queue,
//! the pending questions, the socket roles and the runner token. All
//! mutations serialise on the actor inbox; the store persists every
//! mutating event so a holder can replay itself after a restart.

pub mod actor;
pub mod messages;
pub mod queue;
pub mod questions;
pub mod registry;
pub mod replay;
pub mod runner_ops;
pub mod services;
pub mod sockets;
pub mod store;
pub mod token;

pub use actor::SessionActor;
pub use registry::SessionRegistry;
pub use store::{SessionRecord, SessionStore};
