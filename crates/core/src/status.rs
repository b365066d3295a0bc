//! Session and agent status machines.
//!
//! The two are distinct: session status tracks the sandbox lifecycle,
//! agent status tracks what the model loop is doing right now. Terminal
//! session statuses force the agent status (idle, or error for sessions
//! that died in error).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Why a session exists. Orchestrator and workflow sessions are only
/// visible to their owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPurpose {
    Interactive,
    Orchestrator,
    Workflow,
}

impl SessionPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPurpose::Interactive => "interactive",
            SessionPurpose::Orchestrator => "orchestrator",
            SessionPurpose::Workflow => "workflow",
        }
    }
}

impl FromStr for SessionPurpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interactive" => Ok(SessionPurpose::Interactive),
            "orchestrator" => Ok(SessionPurpose::Orchestrator),
            "workflow" => Ok(SessionPurpose::Workflow),
            other => Err(format!("unknown session purpose: {other}")),
        }
    }
}

/// Sandbox lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Running,
    Idle,
    Hibernating,
    Hibernated,
    Restoring,
    Terminated,
    Archived,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Running => "running",
            SessionStatus::Idle => "idle",
            SessionStatus::Hibernating => "hibernating",
            SessionStatus::Hibernated => "hibernated",
            SessionStatus::Restoring => "restoring",
            SessionStatus::Terminated => "terminated",
            SessionStatus::Archived => "archived",
            SessionStatus::Error => "error",
        }
    }

    /// Statuses after which the session row no longer changes on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Terminated | SessionStatus::Archived | SessionStatus::Error
        )
    }

    /// Error sessions heal when a runner reattaches; only these two are
    /// truly closed to new work.
    pub fn accepts_prompts(&self) -> bool {
        !matches!(self, SessionStatus::Terminated | SessionStatus::Archived)
    }

    /// Statuses that make a workflow-purpose session unusable for its
    /// execution. The stale-execution reconciler fails executions whose
    /// session reports one of these.
    pub fn is_dead_for_execution(&self) -> bool {
        matches!(
            self,
            SessionStatus::Terminated | SessionStatus::Error | SessionStatus::Hibernated
        )
    }

    /// Legal transition table. The holder refuses transitions outside it
    /// (logging the attempt) rather than corrupting the lifecycle.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        if *self == next {
            return true;
        }
        match self {
            Initializing => matches!(next, Running | Idle | Error | Terminated),
            Running => matches!(next, Idle | Hibernating | Terminated | Archived | Error),
            Idle => matches!(next, Running | Hibernating | Terminated | Archived | Error),
            Hibernating => matches!(next, Hibernated | Error | Terminated),
            Hibernated => matches!(next, Restoring | Terminated | Archived),
            Restoring => matches!(next, Running | Idle | Error | Terminated),
            Terminated => matches!(next, Archived),
            // A runner reattaching to an errored session heals it.
            Error => matches!(next, Running | Idle | Terminated | Archived),
            Archived => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(SessionStatus::Initializing),
            "running" => Ok(SessionStatus::Running),
            "idle" => Ok(SessionStatus::Idle),
            "hibernating" => Ok(SessionStatus::Hibernating),
            "hibernated" => Ok(SessionStatus::Hibernated),
            "restoring" => Ok(SessionStatus::Restoring),
            "terminated" => Ok(SessionStatus::Terminated),
            "archived" => Ok(SessionStatus::Archived),
            "error" => Ok(SessionStatus::Error),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// What the agent loop is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Thinking,
    ToolCalling,
    Streaming,
    Error,
    Queued,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Thinking => "thinking",
            AgentStatus::ToolCalling => "tool_calling",
            AgentStatus::Streaming => "streaming",
            AgentStatus::Error => "error",
            AgentStatus::Queued => "queued",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The agent status clients should see given the session lifecycle.
/// Terminal sessions never show a live agent.
pub fn effective_agent_status(session: SessionStatus, agent: AgentStatus) -> AgentStatus {
    if session == SessionStatus::Error {
        AgentStatus::Error
    } else if session.is_terminal() {
        AgentStatus::Idle
    } else {
        agent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(SessionStatus::Terminated.is_terminal());
        assert!(SessionStatus::Archived.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
        assert!(!SessionStatus::Hibernated.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
    }

    #[test]
    fn dead_for_execution_includes_hibernated() {
        assert!(SessionStatus::Hibernated.is_dead_for_execution());
        assert!(SessionStatus::Terminated.is_dead_for_execution());
        assert!(SessionStatus::Error.is_dead_for_execution());
        assert!(!SessionStatus::Idle.is_dead_for_execution());
        assert!(!SessionStatus::Archived.is_dead_for_execution());
    }

    #[test]
    fn archived_is_a_dead_end() {
        use SessionStatus::*;
        for next in [
            Initializing,
            Running,
            Idle,
            Hibernating,
            Hibernated,
            Restoring,
            Terminated,
            Error,
        ] {
            assert!(!Archived.can_transition_to(next));
        }
        assert!(Archived.can_transition_to(Archived));
    }

    #[test]
    fn lifecycle_happy_path() {
        use SessionStatus::*;
        assert!(Initializing.can_transition_to(Running));
        assert!(Running.can_transition_to(Idle));
        assert!(Idle.can_transition_to(Running));
        assert!(Idle.can_transition_to(Hibernating));
        assert!(Hibernating.can_transition_to(Hibernated));
        assert!(Hibernated.can_transition_to(Restoring));
        assert!(Restoring.can_transition_to(Running));
        assert!(Running.can_transition_to(Terminated));
        assert!(Terminated.can_transition_to(Archived));
    }

    #[test]
    fn hibernated_cannot_jump_straight_to_running() {
        assert!(!SessionStatus::Hibernated.can_transition_to(SessionStatus::Running));
    }

    #[test]
    fn errored_sessions_heal_but_closed_ones_do_not() {
        assert!(SessionStatus::Error.can_transition_to(SessionStatus::Running));
        assert!(SessionStatus::Error.accepts_prompts());
        assert!(!SessionStatus::Terminated.accepts_prompts());
        assert!(!SessionStatus::Archived.accepts_prompts());
        assert!(!SessionStatus::Terminated.can_transition_to(SessionStatus::Running));
    }

    #[test]
    fn effective_agent_status_is_forced_by_terminal_sessions() {
        assert_eq!(
            effective_agent_status(SessionStatus::Terminated, AgentStatus::Streaming),
            AgentStatus::Idle
        );
        assert_eq!(
            effective_agent_status(SessionStatus::Error, AgentStatus::Streaming),
            AgentStatus::Error
        );
        assert_eq!(
            effective_agent_status(SessionStatus::Running, AgentStatus::Thinking),
            AgentStatus::Thinking
        );
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            SessionStatus::Initializing,
            SessionStatus::Running,
            SessionStatus::Idle,
            SessionStatus::Hibernating,
            SessionStatus::Hibernated,
            SessionStatus::Restoring,
            SessionStatus::Terminated,
            SessionStatus::Archived,
            SessionStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
    }

    #[test]
    fn agent_status_wire_names_are_snake_case() {
        assert_eq!(
            serde_json::to_string(&AgentStatus::ToolCalling).unwrap(),
            "\"tool_calling\""
        );
    }
}
