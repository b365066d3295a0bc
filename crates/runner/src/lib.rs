//! The in-sandbox runner.
//!
//! Two halves: the bridge (an auto-reconnecting WebSocket client that is
//! the session holder's only window into the sandbox) and the gateway (a
//! local authenticating reverse proxy in front of the sandbox's dev
//! tools, plus the localhost internal API the agent tooling calls).

pub mod bridge;
pub mod gateway;
pub mod internal_api;

pub use bridge::{Bridge, BridgeConfig, BridgeHandle, ExitReason};
