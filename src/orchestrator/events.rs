//! Hooks consumed by outer platform adapters.

use crate::store::JobKind;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// The job has no active message and was untouched for the idle window.
    /// Its agent, if any, has been released.
    JobIdle {
        organization_id: String,
        job_id: String,
    },
    /// An agent acknowledged a reliable message sent on `connection_id`.
    MessageAcknowledged {
        connection_id: String,
        message_id: String,
        kind: String,
    },
    AgentAssigned {
        organization_id: String,
        agent_id: String,
        job_id: String,
    },
    AgentUnassigned {
        organization_id: String,
        agent_id: String,
        job_id: String,
    },
    /// Result text an agent produced for one processed message, ready to be
    /// posted back to the thread.
    AssistantReply {
        organization_id: String,
        job_id: String,
        processed_message_id: String,
        thread: JobKind,
        message: String,
    },
}

impl OrchestratorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OrchestratorEvent::JobIdle { .. } => "job_idle",
            OrchestratorEvent::MessageAcknowledged { .. } => "message_acknowledged",
            OrchestratorEvent::AgentAssigned { .. } => "agent_assigned",
            OrchestratorEvent::AgentUnassigned { .. } => "agent_unassigned",
            OrchestratorEvent::AssistantReply { .. } => "assistant_reply",
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: OrchestratorEvent);
}

/// Discards events after tracing them.
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, event: OrchestratorEvent) {
        tracing::trace!(event = event.name(), "Event discarded");
    }
}

/// Fans events out to any number of subscribers. Slow subscribers lag and
/// miss events rather than holding up the orchestrator.
pub struct BroadcastEventSink {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: OrchestratorEvent) {
        tracing::debug!(event = event.name(), "Orchestrator event");
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}
