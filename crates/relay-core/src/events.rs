//! Agent lifecycle events.
//!
//! Two shapes:
//!
//! - **[`EmitRequest`]**: what the agent pipeline hands to its bridge. It names
//!   the owner, thread, run, and event kind but carries no sequence number.
//! - **[`Event`]**: the router-stamped form. The router assigns `sequence_no`
//!   and `timestamp`; after that the event is immutable and shared as
//!   `Arc<Event>` across every recipient.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ConnectionId, RequestId, RunId, ThreadId, UserId};

/// Kind of lifecycle transition an agent run reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// The run began.
    AgentStarted,
    /// The agent is reasoning.
    AgentThinking,
    /// A tool call is in progress.
    ToolExecuting,
    /// A tool call finished.
    ToolCompleted,
    /// The run finished normally.
    AgentCompleted,
    /// The run was cancelled before completion.
    AgentCancelled,
    /// The run failed.
    AgentError,
}

impl EventType {
    /// The five canonical lifecycle events in the order a run emits them.
    pub const CANONICAL: [Self; 5] = [
        Self::AgentStarted,
        Self::AgentThinking,
        Self::ToolExecuting,
        Self::ToolCompleted,
        Self::AgentCompleted,
    ];

    /// Wire name of the event type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentStarted => "agent_started",
            Self::AgentThinking => "agent_thinking",
            Self::ToolExecuting => "tool_executing",
            Self::ToolCompleted => "tool_completed",
            Self::AgentCompleted => "agent_completed",
            Self::AgentCancelled => "agent_cancelled",
            Self::AgentError => "agent_error",
        }
    }

    /// Whether this event ends its run. Nothing may be routed for the run afterwards.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::AgentCompleted | Self::AgentCancelled | Self::AgentError
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied fields of an event, before sequencing.
#[derive(Clone, Debug, PartialEq)]
pub struct EmitRequest {
    /// Owning user, taken from the emitting execution context.
    pub user_id: UserId,
    /// Thread the event belongs to.
    pub thread_id: ThreadId,
    /// Run the event belongs to.
    pub run_id: RunId,
    /// Request that started the run.
    pub request_id: RequestId,
    /// Optional target connection. When set, only that connection is addressed.
    pub connection_id: Option<ConnectionId>,
    /// Lifecycle kind.
    pub event_type: EventType,
    /// Opaque payload.
    pub payload: Value,
}

/// A sequenced, timestamped event ready for delivery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    event_type: EventType,
    user_id: UserId,
    thread_id: ThreadId,
    run_id: RunId,
    request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    connection_id: Option<ConnectionId>,
    sequence_no: u64,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    payload: Value,
}

impl Event {
    /// Stamp a request with its sequence number and the current time.
    #[must_use]
    pub fn stamp(request: EmitRequest, sequence_no: u64) -> Self {
        Self {
            event_type: request.event_type,
            user_id: request.user_id,
            thread_id: request.thread_id,
            run_id: request.run_id,
            request_id: request.request_id,
            connection_id: request.connection_id,
            sequence_no,
            timestamp: Utc::now(),
            payload: request.payload,
        }
    }

    /// Lifecycle kind.
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Owning user. Fixed at creation.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Thread the event belongs to.
    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    /// Run the event belongs to.
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Request that started the run.
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Target connection hint, if any.
    pub fn connection_id(&self) -> Option<&ConnectionId> {
        self.connection_id.as_ref()
    }

    /// Per-thread sequence number assigned by the router.
    pub fn sequence_no(&self) -> u64 {
        self.sequence_no
    }

    /// When the router stamped the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Opaque payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }
}
