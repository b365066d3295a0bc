//! Trigger store & dispatcher plus the workflow execution runtime.
//!
//! Triggers (webhook / schedule / manual) admit work into durable
//! execution rows; the runtime drives the execution state machine with
//! step traces, approval gates and periodic reconciliation; proposals
//! and version history cover workflow self-modification and rollback.

pub mod api;
pub mod dispatcher;
pub mod model;
pub mod proposals;
pub mod reconcile;
pub mod runtime;
pub mod store;
pub mod validate;
pub mod variables;

pub use dispatcher::{DispatchOutcome, Dispatcher, SessionBridge};
pub use model::*;
pub use store::DispatchStore;
