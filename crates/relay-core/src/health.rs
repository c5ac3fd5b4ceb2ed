//! Connection health state machine.
//!
//! ```text
//! connecting ──▶ active ◀──▶ degraded
//!                  │  ▲          │
//!                  ▼  │          ▼
//!              disconnected ◀────┘
//!
//! any ──▶ terminated (final)
//! ```

use serde::{Deserialize, Serialize};

/// Health of one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Registered, handshake not yet complete.
    Connecting,
    /// Healthy.
    Active,
    /// Missed heartbeats; still receives events.
    Degraded,
    /// Confirmed failure; may recover.
    Disconnected,
    /// Closed for good.
    Terminated,
}

impl ConnectionStatus {
    /// Lowercase name used in logs and metric tags.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Disconnected => "disconnected",
            Self::Terminated => "terminated",
        }
    }

    /// Whether events may be sent to a connection in this state.
    pub fn is_deliverable(self) -> bool {
        matches!(self, Self::Active | Self::Degraded)
    }

    /// Whether the state machine permits `self -> next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionStatus::{Active, Connecting, Degraded, Disconnected, Terminated};
        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated)
            | (Connecting | Degraded | Disconnected, Active)
            | (Active, Degraded)
            | (Connecting | Active | Degraded, Disconnected) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a connection receives events normally or stands by for failover.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionRole {
    /// Receives the user's events.
    #[default]
    Primary,
    /// Receives events while substituting for a failed primary, or when the
    /// user has no primary at all.
    Backup,
}

#[cfg(test)]
mod tests {
    use super::ConnectionStatus::*;
    use super::*;

    #[test]
    fn happy_path() {
        assert!(Connecting.can_transition_to(Active));
        assert!(Active.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Active));
    }

    #[test]
    fn degraded_recovers() {
        assert!(Degraded.can_transition_to(Active));
    }

    #[test]
    fn terminated_is_final() {
        for next in [Connecting, Active, Degraded, Disconnected, Terminated] {
            assert!(!Terminated.can_transition_to(next));
        }
    }

    #[test]
    fn anything_live_can_terminate() {
        for from in [Connecting, Active, Degraded, Disconnected] {
            assert!(from.can_transition_to(Terminated));
        }
    }

    #[test]
    fn cannot_go_back_to_connecting() {
        for from in [Active, Degraded, Disconnected] {
            assert!(!from.can_transition_to(Connecting));
        }
    }

    #[test]
    fn disconnected_cannot_degrade() {
        assert!(!Disconnected.can_transition_to(Degraded));
        assert!(!Connecting.can_transition_to(Degraded));
    }

    #[test]
    fn deliverable_states() {
        assert!(Active.is_deliverable());
        assert!(Degraded.is_deliverable());
        assert!(!Connecting.is_deliverable());
        assert!(!Disconnected.is_deliverable());
        assert!(!Terminated.is_deliverable());
    }

    #[test]
    fn role_defaults_to_primary() {
        assert_eq!(ConnectionRole::default(), ConnectionRole::Primary);
        let json = serde_json::to_string(&ConnectionRole::Backup).unwrap();
        assert_eq!(json, "\"backup\"");
    }
}
