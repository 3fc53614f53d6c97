//! Job and agent orchestration: who works on which thread, and how far each
//! inbound message has progressed.

pub mod agents;
pub mod coordinator;
pub mod events;
pub mod jobs;
pub mod messages;
pub mod scheduler;

pub use agents::AgentRegistry;
pub use coordinator::{Coordinator, Dispatch, FrameOutcome, SweepReport, ThreadEvent};
pub use events::{BroadcastEventSink, EventSink, NoopEventSink, OrchestratorEvent};
pub use jobs::{JobCreation, JobManager};
pub use messages::{MessageTracker, NewMessage};
pub use scheduler::{AssignmentScheduler, JobAgent};
