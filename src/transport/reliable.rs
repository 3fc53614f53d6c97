//! Reliable outbound delivery for one agent connection.
//!
//! Every frame for a connection, reliable or not, goes through a single
//! bounded dispatch lane drained by exactly one task, so writes to the socket
//! never interleave and stay in submission order. Reliable envelopes are also
//! kept in a pending table until the agent acknowledges them; a periodic sweep
//! resubmits entries older than the ack timeout and drops them once the retry
//! budget is spent. Dropped messages are logged, not reported to the caller.

use super::protocol::{ack_frame, Envelope};
use crate::config::DeliveryConfig;
use crate::error::CoreError;
use crate::ids::{new_id, ENVELOPE_PREFIX};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Write half of one agent connection.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_text(&self, text: String) -> Result<()>;
}

/// Something that can acknowledge an inbound message id back to its sender.
pub trait AckSender: Send + Sync {
    /// Queue an acknowledgement. Returns `false` if it could not be queued.
    fn send_ack(&self, message_id: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliverySettings {
    pub ack_timeout: Duration,
    pub retry_interval: Duration,
    pub max_retries: u32,
    pub queue_capacity: usize,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(30),
            retry_interval: Duration::from_secs(5),
            max_retries: 3,
            queue_capacity: 256,
        }
    }
}

impl From<&DeliveryConfig> for DeliverySettings {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            ack_timeout: Duration::from_secs(config.ack_timeout_secs),
            retry_interval: Duration::from_secs(config.retry_interval_secs),
            max_retries: config.max_retries,
            queue_capacity: config.queue_capacity,
        }
    }
}

/// Reliable envelope awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub id: String,
    pub kind: String,
    pub frame: String,
    pub sent_at: Instant,
    pub retries: u32,
}

/// Outcome of one retry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPass {
    pub resubmitted: usize,
    pub dropped: usize,
}

pub type AckCallback = Arc<dyn Fn(&PendingMessage) + Send + Sync>;

struct QueuedFrame {
    message_id: Option<String>,
    frame: String,
}

struct Shared {
    connection_id: String,
    settings: DeliverySettings,
    pending: RwLock<HashMap<String, PendingMessage>>,
    lane: RwLock<Option<mpsc::Sender<QueuedFrame>>>,
    on_ack: RwLock<Option<AckCallback>>,
}

impl Shared {
    fn enqueue(&self, item: QueuedFrame) -> bool {
        let lane = self.lane.read();
        let Some(tx) = lane.as_ref() else {
            debug!(
                connection_id = %self.connection_id,
                "Dispatch lane closed; frame not queued"
            );
            return false;
        };
        match tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(item)) => {
                warn!(
                    connection_id = %self.connection_id,
                    message_id = item.message_id.as_deref().unwrap_or("-"),
                    "Dispatch lane full; frame left for the retry sweep"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn retry_pass(&self, now: Instant) -> RetryPass {
        let mut resubmit = Vec::new();
        let mut dropped = Vec::new();
        {
            let mut pending = self.pending.write();
            pending.retain(|id, entry| {
                if now.saturating_duration_since(entry.sent_at) < self.settings.ack_timeout {
                    return true;
                }
                if entry.retries < self.settings.max_retries {
                    entry.retries += 1;
                    entry.sent_at = now;
                    resubmit.push(QueuedFrame {
                        message_id: Some(id.clone()),
                        frame: entry.frame.clone(),
                    });
                    true
                } else {
                    dropped.push((id.clone(), entry.kind.clone()));
                    false
                }
            });
        }

        for (id, kind) in &dropped {
            warn!(
                connection_id = %self.connection_id,
                message_id = %id,
                kind = %kind,
                max_retries = self.settings.max_retries,
                "Dropping unacknowledged message after exhausting retries"
            );
        }
        let resubmitted = resubmit.len();
        for item in resubmit {
            debug!(
                connection_id = %self.connection_id,
                message_id = item.message_id.as_deref().unwrap_or("-"),
                "Resubmitting unacknowledged message"
            );
            self.enqueue(item);
        }

        RetryPass {
            resubmitted,
            dropped: dropped.len(),
        }
    }
}

/// Reliable sender bound to one agent connection.
pub struct ReliableSender {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
}

impl ReliableSender {
    /// Spawn the dispatch lane and retry sweep for `connection_id`.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn start(
        connection_id: impl Into<String>,
        sink: Arc<dyn FrameSink>,
        settings: DeliverySettings,
    ) -> Self {
        let connection_id = connection_id.into();
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            connection_id: connection_id.clone(),
            settings,
            pending: RwLock::new(HashMap::new()),
            lane: RwLock::new(Some(tx)),
            on_ack: RwLock::new(None),
        });
        let cancel = CancellationToken::new();

        let dispatch_task = tokio::spawn(run_dispatch(connection_id, sink, rx));
        let retry_task = tokio::spawn(run_retry_sweep(Arc::clone(&shared), cancel.clone()));

        Self {
            shared,
            cancel,
            dispatch_task: Mutex::new(Some(dispatch_task)),
            retry_task: Mutex::new(Some(retry_task)),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.shared.connection_id
    }

    /// Register the callback invoked once per acknowledged message.
    pub fn set_on_ack(&self, callback: AckCallback) {
        *self.shared.on_ack.write() = Some(callback);
    }

    /// Queue `payload` as a uniquely identified envelope and return its id.
    ///
    /// Never waits on the socket. If the lane is momentarily full the entry
    /// stays pending and goes out on the next retry sweep.
    pub fn send_reliable<T: Serialize>(&self, kind: &str, payload: &T) -> Result<String> {
        if self.shared.lane.read().is_none() {
            return Err(CoreError::TransientDelivery(format!(
                "sender for connection `{}` is stopped",
                self.shared.connection_id
            ))
            .into());
        }
        let id = new_id(ENVELOPE_PREFIX).map_err(CoreError::from)?;
        let envelope = Envelope {
            id: id.clone(),
            kind: kind.to_string(),
            payload: serde_json::to_value(payload)?,
        };
        let frame = serde_json::to_string(&envelope)?;

        // Record before queueing so an ack can never beat its pending entry.
        self.shared.pending.write().insert(
            id.clone(),
            PendingMessage {
                id: id.clone(),
                kind: kind.to_string(),
                frame: frame.clone(),
                sent_at: Instant::now(),
                retries: 0,
            },
        );
        self.shared.enqueue(QueuedFrame {
            message_id: Some(id.clone()),
            frame,
        });
        debug!(
            connection_id = %self.shared.connection_id,
            message_id = %id,
            kind,
            "Queued reliable message"
        );
        Ok(id)
    }

    /// Retire a pending entry. Returns `false` for unknown or already acked ids.
    pub fn handle_ack(&self, message_id: &str) -> bool {
        let Some(entry) = self.shared.pending.write().remove(message_id) else {
            debug!(
                connection_id = %self.shared.connection_id,
                message_id,
                "Ack for unknown or already acknowledged message"
            );
            return false;
        };
        debug!(
            connection_id = %self.shared.connection_id,
            message_id,
            retries = entry.retries,
            "Message acknowledged"
        );
        let callback = self.shared.on_ack.read().clone();
        if let Some(callback) = callback {
            callback(&entry);
        }
        true
    }

    /// Run one retry sweep as of `now`. The background sweep calls this on
    /// every tick.
    pub fn retry_pass_at(&self, now: Instant) -> RetryPass {
        self.shared.retry_pass(now)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.read().len()
    }

    pub fn is_pending(&self, message_id: &str) -> bool {
        self.shared.pending.read().contains_key(message_id)
    }

    pub fn retries_for(&self, message_id: &str) -> Option<u32> {
        self.shared
            .pending
            .read()
            .get(message_id)
            .map(|entry| entry.retries)
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.lane.read().is_none()
    }

    /// Cancel the retry sweep, then close the lane and wait until every frame
    /// already queued has been written.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let retry_task = self.retry_task.lock().take();
        if let Some(handle) = retry_task {
            let _ = handle.await;
        }

        self.shared.lane.write().take();
        let dispatch_task = self.dispatch_task.lock().take();
        if let Some(handle) = dispatch_task {
            let _ = handle.await;
        }

        let abandoned = self.pending_count();
        info!(
            connection_id = %self.shared.connection_id,
            abandoned,
            "Reliable sender stopped"
        );
    }
}

impl AckSender for ReliableSender {
    fn send_ack(&self, message_id: &str) -> bool {
        self.shared.enqueue(QueuedFrame {
            message_id: None,
            frame: ack_frame(message_id),
        })
    }
}

impl Drop for ReliableSender {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_dispatch(
    connection_id: String,
    sink: Arc<dyn FrameSink>,
    mut rx: mpsc::Receiver<QueuedFrame>,
) {
    while let Some(item) = rx.recv().await {
        if let Err(e) = sink.send_text(item.frame).await {
            // Reliable entries stay pending, so the retry sweep covers this.
            warn!(
                connection_id = %connection_id,
                message_id = item.message_id.as_deref().unwrap_or("-"),
                "Socket write failed: {e}"
            );
        }
    }
    debug!(connection_id = %connection_id, "Dispatch lane drained");
}

async fn run_retry_sweep(shared: Arc<Shared>, cancel: CancellationToken) {
    let period = shared.settings.retry_interval.max(Duration::from_millis(10));
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; nothing can be overdue yet.
    interval.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                shared.retry_pass(Instant::now());
            }
        }
    }
}

/// In-process [`FrameSink`] that records every frame. Used as a loopback in
/// tests and local harnesses.
#[derive(Default)]
pub struct MemorySink {
    frames: Mutex<Vec<String>>,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().clone()
    }

    /// Frames decoded as JSON, skipping anything unparsable.
    pub fn json_frames(&self) -> Vec<serde_json::Value> {
        self.frames
            .lock()
            .iter()
            .filter_map(|frame| serde_json::from_str(frame).ok())
            .collect()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_text(&self, text: String) -> Result<()> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("connection reset by peer");
        }
        self.frames.lock().push(text);
        Ok(())
    }
}
