//! The berth platform server.
//!
//! Wires the session registry, the channel adapters and the workflow
//! dispatcher behind one axum surface: session WebSockets for the three
//! socket roles, channel webhooks, and the trigger/execution HTTP API.

pub mod bridges;
pub mod routes;
pub mod scheduler;
pub mod state;

pub use state::{AppState, ServiceConfig};
