//! Receiver-side dedup of inbound reliable frames.
//!
//! The ack goes out when a frame is first seen, before the caller has done
//! anything with it. A crash between the ack and the caller's processing loses
//! that event: the peer has already retired it and will not resend.

use super::protocol::InboundEnvelope;
use super::reliable::AckSender;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 60);

pub struct InboundDedup {
    retention: Duration,
    seen: RwLock<HashMap<String, Instant>>,
    acks: Arc<dyn AckSender>,
}

impl InboundDedup {
    pub fn new(acks: Arc<dyn AckSender>, retention: Duration) -> Self {
        Self {
            retention,
            seen: RwLock::new(HashMap::new()),
            acks,
        }
    }

    /// Returns `true` when the frame was already processed and must be skipped.
    ///
    /// Frames without an id are never acknowledged and always processed.
    pub fn check_and_acknowledge(&self, envelope: &InboundEnvelope) -> bool {
        self.check_and_acknowledge_at(envelope, Instant::now())
    }

    pub fn check_and_acknowledge_at(&self, envelope: &InboundEnvelope, now: Instant) -> bool {
        let Some(id) = envelope.delivery_id() else {
            return false;
        };

        let mut seen = self.seen.write();
        seen.retain(|_, at| now.saturating_duration_since(*at) < self.retention);

        if seen.contains_key(id) {
            self.acks.send_ack(id);
            debug!(
                message_id = id,
                kind = %envelope.kind,
                "Duplicate inbound frame, re-acknowledged"
            );
            return true;
        }

        seen.insert(id.to_string(), now);
        self.acks.send_ack(id);
        false
    }

    pub fn len(&self) -> usize {
        self.seen.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.read().is_empty()
    }
}
