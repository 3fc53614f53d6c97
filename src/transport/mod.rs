//! Reliable messaging over agent connections.

pub mod dedup;
pub mod hub;
pub mod protocol;
pub mod reliable;

pub use dedup::InboundDedup;
pub use hub::{Connection, ConnectionHub};
pub use protocol::{decode_frame, AgentMessage, Envelope, InboundEnvelope};
pub use reliable::{
    AckSender, DeliverySettings, FrameSink, MemorySink, PendingMessage, ReliableSender, RetryPass,
};
