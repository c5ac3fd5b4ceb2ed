//! Session and context error types.

use relay_core::errors::IsolationViolation;
use relay_core::ids::{RunId, ThreadId, UserId};

use crate::agent::AgentKind;

/// Errors from session and execution-context operations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The user has no live session.
    #[error("Session not found for user {0}")]
    SessionNotFound(UserId),

    /// No constructor is registered for this agent kind.
    #[error("Agent not registered: {0}")]
    AgentNotRegistered(AgentKind),

    /// Another run still owns the thread's context.
    #[error("Thread {thread_id} busy with run {active_run}")]
    ThreadBusy {
        /// Thread requested.
        thread_id: ThreadId,
        /// Run currently holding it.
        active_run: RunId,
    },

    /// The run already ended; its ID cannot be reused.
    #[error("Run already retired: {0}")]
    RunRetired(RunId),

    /// The session was cleaned up.
    #[error("Session closed for user {0}")]
    SessionClosed(UserId),

    /// A context or agent of one user reached another user's session.
    #[error(transparent)]
    Isolation(#[from] IsolationViolation),
}

impl SessionError {
    /// Error category string for logs.
    pub fn category(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::AgentNotRegistered(_) => "agent_not_registered",
            Self::ThreadBusy { .. } => "thread_busy",
            Self::RunRetired(_) => "run_retired",
            Self::SessionClosed(_) => "session_closed",
            Self::Isolation(_) => "isolation_violation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            SessionError::SessionNotFound(UserId::from("u1")).to_string(),
            "Session not found for user u1"
        );
        assert_eq!(
            SessionError::AgentNotRegistered(AgentKind::Triage).to_string(),
            "Agent not registered: triage"
        );
        let busy = SessionError::ThreadBusy {
            thread_id: ThreadId::from("t1"),
            active_run: RunId::from("r1"),
        };
        assert_eq!(busy.to_string(), "Thread t1 busy with run r1");
    }

    #[test]
    fn categories() {
        assert_eq!(
            SessionError::RunRetired(RunId::from("r")).category(),
            "run_retired"
        );
        let v = IsolationViolation {
            requester: UserId::from("a"),
            owner: UserId::from("b"),
            resource: "session".into(),
        };
        assert_eq!(SessionError::from(v).category(), "isolation_violation");
    }
}
