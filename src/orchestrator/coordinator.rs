//! Glue between platform events, the orchestration state and the agent
//! connections.
//!
//! ```text
//! thread event -> job (get or create) -> processed message (Queued)
//!     -> agent already on the job?  user_message to it
//!     -> otherwise claim a free agent, start_conversation
//!     -> no agent free: stays Queued until dispatch_queued
//! agent frame  -> ack / dedup -> processing_started (InProgress)
//!                             -> assistant_message (Completed, reply event)
//! idle sweep   -> release agent, JobIdle event, dispatch queued work
//! ```

use super::agents::{require, AgentRegistry};
use super::events::{EventSink, OrchestratorEvent};
use super::jobs::{JobCreation, JobManager};
use super::messages::{MessageTracker, NewMessage};
use super::scheduler::{AssignmentScheduler, JobAgent};
use crate::error::{is_conflict, is_not_found, CoreError};
use crate::store::{Agent, Job, JobKind, MessageStatus, ProcessedMessage, Store};
use crate::transport::protocol::{
    self, AgentMessage, AssistantMessagePayload, JobMessagePayload, ProcessingStartedPayload,
};
use crate::transport::{
    Connection, ConnectionHub, DeliverySettings, FrameSink, InboundDedup, ReliableSender,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Agents tried per dispatch before a message is left queued. Each failed
/// attempt removes an agent whose connection is gone.
const MAX_CLAIM_ATTEMPTS: usize = 3;

/// Normalized inbound message from a chat platform thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadEvent {
    pub organization_id: String,
    pub thread: JobKind,
    pub platform_message_id: String,
    pub text: String,
}

/// What happened to one thread event.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Dispatch {
    /// The platform redelivered an event already recorded.
    Duplicate { processed_message_id: String },
    /// Sent to an agent over its connection.
    Delivered {
        job_id: String,
        job: JobCreation,
        processed_message_id: String,
        agent_id: String,
        envelope_id: String,
    },
    /// No agent is free; the message waits for [`Coordinator::dispatch_queued`].
    Queued {
        job_id: String,
        job: JobCreation,
        processed_message_id: String,
    },
}

/// Result of handling one agent frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Ack for one of our messages. `known` is false for stale or repeated acks.
    Acknowledged { message_id: String, known: bool },
    /// Reliable frame seen before; re-acked and skipped.
    Duplicate,
    /// Processing status moved for the given processed message.
    StatusUpdated {
        processed_message_id: String,
        status: MessageStatus,
    },
    SystemNotice,
    Ignored { kind: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub organizations: usize,
    pub idle_jobs: usize,
    pub released: usize,
    pub dispatched: usize,
}

pub struct Coordinator {
    agents: AgentRegistry,
    jobs: JobManager,
    messages: MessageTracker,
    scheduler: AssignmentScheduler,
    hub: Arc<ConnectionHub>,
    events: Arc<dyn EventSink>,
    delivery: DeliverySettings,
    dedup_retention: Duration,
}

impl Coordinator {
    pub fn new(
        store: Store,
        events: Arc<dyn EventSink>,
        delivery: DeliverySettings,
        dedup_retention: Duration,
    ) -> Self {
        Self {
            agents: AgentRegistry::new(store.clone()),
            jobs: JobManager::new(store.clone()),
            messages: MessageTracker::new(store.clone()),
            scheduler: AssignmentScheduler::new(store),
            hub: Arc::new(ConnectionHub::new()),
            events,
            delivery,
            dedup_retention,
        }
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    pub fn messages(&self) -> &MessageTracker {
        &self.messages
    }

    pub fn scheduler(&self) -> &AssignmentScheduler {
        &self.scheduler
    }

    pub fn hub(&self) -> &ConnectionHub {
        &self.hub
    }

    /// Attach a live connection: start its transport, register the agent and
    /// hand it any queued work of its organization.
    pub async fn connect_agent(
        &self,
        connection_id: &str,
        organization_id: &str,
        runtime_id: &str,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Agent> {
        require("connection_id", connection_id)?;
        let agent = self
            .agents
            .upsert_active_agent(connection_id, organization_id, runtime_id)?;

        let sender = Arc::new(ReliableSender::start(connection_id, sink, self.delivery));
        let events = Arc::clone(&self.events);
        let acked_on = connection_id.to_string();
        sender.set_on_ack(Arc::new(move |pending| {
            events.emit(OrchestratorEvent::MessageAcknowledged {
                connection_id: acked_on.clone(),
                message_id: pending.id.clone(),
                kind: pending.kind.clone(),
            });
        }));
        let dedup = Arc::new(InboundDedup::new(sender.clone(), self.dedup_retention));
        let replaced = self.hub.register(Connection {
            id: connection_id.to_string(),
            organization_id: organization_id.to_string(),
            sender,
            dedup,
        });
        if let Some(old) = replaced {
            warn!(connection_id, "Connection id reused; stopping previous transport");
            old.sender.stop().await;
        }

        info!(
            connection_id,
            organization_id,
            agent_id = %agent.id,
            runtime_id,
            "Agent connected"
        );
        self.dispatch_queued(organization_id)?;
        Ok(agent)
    }

    /// Drain the transport, then release every job the agent held and remove it.
    ///
    /// Queued messages of the released jobs are handed to other agents.
    /// In-progress messages stay in progress.
    pub async fn disconnect_agent(&self, connection_id: &str) -> Result<()> {
        let Some(connection) = self.hub.remove(connection_id) else {
            debug!(connection_id, "Disconnect for unknown connection");
            return Ok(());
        };
        let organization_id = connection.organization_id.as_str();
        connection.sender.stop().await;

        if let Some(agent) = self
            .agents
            .get_agent_by_ws_connection_id(connection_id, organization_id)?
        {
            self.retire_agent(&agent)?;
        }
        info!(connection_id, organization_id, "Agent disconnected");

        self.dispatch_queued(organization_id)?;
        Ok(())
    }

    /// Accept one inbound thread message and route it to an agent.
    pub fn handle_thread_event(&self, event: &ThreadEvent) -> Result<Dispatch> {
        require("organization_id", &event.organization_id)?;
        require("platform_message_id", &event.platform_message_id)?;
        event.thread.validate()?;
        let organization_id = event.organization_id.as_str();
        let integration_id = event.thread.integration_id();

        if let Some(existing) = self.messages.find_by_platform_message_id(
            organization_id,
            integration_id,
            &event.platform_message_id,
        )? {
            debug!(
                platform_message_id = %event.platform_message_id,
                "Platform redelivered an event already recorded"
            );
            return Ok(Dispatch::Duplicate {
                processed_message_id: existing.id,
            });
        }

        let (job, creation) = self
            .jobs
            .get_or_create_job_for_thread(organization_id, &event.thread)?;
        let recorded = self.messages.record(&NewMessage {
            job_id: &job.id,
            organization_id,
            integration_id,
            platform_message_id: &event.platform_message_id,
            text: &event.text,
        });
        let message = match recorded {
            Ok(message) => message,
            Err(err) if is_conflict(&err) => {
                // Lost a race with a concurrent redelivery of the same event.
                let existing = self
                    .messages
                    .find_by_platform_message_id(
                        organization_id,
                        integration_id,
                        &event.platform_message_id,
                    )?
                    .ok_or(err)?;
                return Ok(Dispatch::Duplicate {
                    processed_message_id: existing.id,
                });
            }
            Err(err) => return Err(err),
        };

        self.route(&job, creation, &message)
    }

    /// Hand queued messages of unassigned jobs to free agents, oldest first.
    /// Returns how many messages went out.
    pub fn dispatch_queued(&self, organization_id: &str) -> Result<usize> {
        let mut dispatched = 0;
        for message in self.messages.queued_for_unassigned_jobs(organization_id)? {
            let Some(job) = self.jobs.get_job(&message.job_id, organization_id)? else {
                continue;
            };
            // An earlier message of the same job may have just claimed an agent.
            match self.route(&job, JobCreation::AlreadyExists, &message)? {
                Dispatch::Delivered { .. } => dispatched += 1,
                Dispatch::Queued { .. } => break,
                Dispatch::Duplicate { .. } => {}
            }
        }
        if dispatched > 0 {
            info!(organization_id, dispatched, "Dispatched queued messages");
        }
        Ok(dispatched)
    }

    /// Decode and apply one text frame received on `connection_id`.
    pub fn handle_agent_frame(&self, connection_id: &str, text: &str) -> Result<FrameOutcome> {
        let connection = self
            .hub
            .get(connection_id)
            .ok_or_else(|| CoreError::not_found("connection", connection_id))?;
        let (envelope, message) = protocol::decode_frame(text)?;

        // Acks are never acked back; everything else goes through dedup.
        let is_ack = matches!(message, AgentMessage::Acknowledgement(_));
        if !is_ack && connection.dedup.check_and_acknowledge(&envelope) {
            return Ok(FrameOutcome::Duplicate);
        }

        let organization_id = connection.organization_id.as_str();
        match message {
            AgentMessage::Acknowledgement(ack) => {
                let known = connection.sender.handle_ack(&ack.message_id);
                Ok(FrameOutcome::Acknowledged {
                    message_id: ack.message_id,
                    known,
                })
            }
            AgentMessage::ProcessingStarted(ProcessingStartedPayload {
                job_id,
                processed_message_id,
            }) => {
                self.require_holder(connection_id, organization_id, &job_id)?;
                self.advance(
                    organization_id,
                    &job_id,
                    &processed_message_id,
                    MessageStatus::InProgress,
                )?;
                Ok(FrameOutcome::StatusUpdated {
                    processed_message_id,
                    status: MessageStatus::InProgress,
                })
            }
            AgentMessage::AssistantMessage(AssistantMessagePayload {
                job_id,
                processed_message_id,
                message,
            }) => {
                self.require_holder(connection_id, organization_id, &job_id)?;
                let job = self.advance(
                    organization_id,
                    &job_id,
                    &processed_message_id,
                    MessageStatus::Completed,
                )?;
                self.events.emit(OrchestratorEvent::AssistantReply {
                    organization_id: organization_id.to_string(),
                    job_id: job.id,
                    processed_message_id: processed_message_id.clone(),
                    thread: job.kind,
                    message,
                });
                Ok(FrameOutcome::StatusUpdated {
                    processed_message_id,
                    status: MessageStatus::Completed,
                })
            }
            AgentMessage::SystemMessage(notice) => {
                info!(
                    connection_id,
                    job_id = notice.job_id.as_deref().unwrap_or("-"),
                    "Agent notice: {}",
                    notice.message
                );
                Ok(FrameOutcome::SystemNotice)
            }
            AgentMessage::Unknown { kind, .. } => {
                debug!(connection_id, kind = %kind, "Ignoring unknown frame type");
                Ok(FrameOutcome::Ignored { kind })
            }
        }
    }

    /// Release agents from jobs that went idle, emit JobIdle for each, then
    /// dispatch queued work to the agents that became free.
    pub fn sweep_idle_jobs(&self, idle_minutes: u32) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for organization_id in self.jobs.organizations()? {
            report.organizations += 1;
            for job in self.jobs.get_idle_jobs(&organization_id, idle_minutes)? {
                let Some(assignment) = self.scheduler.assignment_for_job(&job.id, &organization_id)?
                else {
                    continue;
                };
                report.idle_jobs += 1;
                if self
                    .scheduler
                    .unassign_agent_from_job(&assignment.agent_id, &job.id, &organization_id)?
                {
                    report.released += 1;
                    self.events.emit(OrchestratorEvent::AgentUnassigned {
                        organization_id: organization_id.clone(),
                        agent_id: assignment.agent_id.clone(),
                        job_id: job.id.clone(),
                    });
                }
                self.events.emit(OrchestratorEvent::JobIdle {
                    organization_id: organization_id.clone(),
                    job_id: job.id,
                });
            }
            report.dispatched += self.dispatch_queued(&organization_id)?;
        }
        if report.idle_jobs > 0 {
            info!(
                idle_jobs = report.idle_jobs,
                released = report.released,
                dispatched = report.dispatched,
                "Idle sweep finished"
            );
        }
        Ok(report)
    }

    /// Stop every live transport. Used on shutdown.
    pub async fn shutdown(&self) {
        for connection_id in self.hub.connection_ids() {
            if let Some(connection) = self.hub.remove(&connection_id) {
                connection.sender.stop().await;
            }
        }
    }

    fn route(
        &self,
        job: &Job,
        creation: JobCreation,
        message: &ProcessedMessage,
    ) -> Result<Dispatch> {
        let organization_id = job.organization_id.as_str();
        let queued = || Dispatch::Queued {
            job_id: job.id.clone(),
            job: creation,
            processed_message_id: message.id.clone(),
        };

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let resolved = match self.scheduler.agent_for_job(&job.id, organization_id) {
                Ok(resolved) => resolved,
                Err(err) if is_conflict(&err) => {
                    debug!(job_id = %job.id, "Job was bound concurrently; resolving again");
                    continue;
                }
                Err(err) => return Err(err),
            };
            let (agent, kind) = match resolved {
                Some(JobAgent::Holder(agent)) => (agent, protocol::USER_MESSAGE),
                Some(JobAgent::Claimed(agent, _)) => {
                    self.events.emit(OrchestratorEvent::AgentAssigned {
                        organization_id: organization_id.to_string(),
                        agent_id: agent.id.clone(),
                        job_id: job.id.clone(),
                    });
                    (agent, protocol::START_CONVERSATION)
                }
                None => {
                    debug!(job_id = %job.id, "No agent available; message stays queued");
                    return Ok(queued());
                }
            };

            let Some(connection) = self.hub.get(&agent.ws_connection_id) else {
                warn!(
                    agent_id = %agent.id,
                    connection_id = %agent.ws_connection_id,
                    "Agent has no live connection; removing it"
                );
                self.retire_agent(&agent)?;
                continue;
            };

            let payload = JobMessagePayload {
                job_id: job.id.clone(),
                processed_message_id: message.id.clone(),
                message: message.text.clone(),
            };
            match connection.sender.send_reliable(kind, &payload) {
                Ok(envelope_id) => {
                    self.jobs.update_job_timestamp(&job.id, organization_id)?;
                    return Ok(Dispatch::Delivered {
                        job_id: job.id.clone(),
                        job: creation,
                        processed_message_id: message.id.clone(),
                        agent_id: agent.id,
                        envelope_id,
                    });
                }
                Err(err) => {
                    warn!(agent_id = %agent.id, "Send failed, retiring agent: {err}");
                    self.retire_agent(&agent)?;
                }
            }
        }
        Ok(queued())
    }

    /// Unassign every job of `agent` (emitting hooks), then delete it.
    fn retire_agent(&self, agent: &Agent) -> Result<()> {
        let organization_id = agent.organization_id.as_str();
        for assignment in self
            .scheduler
            .get_active_agent_job_assignments(&agent.id, organization_id)?
        {
            if self
                .scheduler
                .unassign_agent_from_job(&agent.id, &assignment.job_id, organization_id)?
            {
                self.events.emit(OrchestratorEvent::AgentUnassigned {
                    organization_id: organization_id.to_string(),
                    agent_id: agent.id.clone(),
                    job_id: assignment.job_id,
                });
            }
        }
        if let Err(err) = self.agents.delete_active_agent(&agent.id, organization_id) {
            if !is_not_found(&err) {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Only the agent holding `job_id` may report on it. Marks that agent as
    /// recently active.
    fn require_holder(
        &self,
        connection_id: &str,
        organization_id: &str,
        job_id: &str,
    ) -> Result<()> {
        let agent = self
            .agents
            .get_agent_by_ws_connection_id(connection_id, organization_id)?
            .ok_or_else(|| CoreError::not_found("agent for connection", connection_id))?;
        let holder = self.agents.get_agent_by_job_id(job_id, organization_id)?;
        if holder.as_ref().map(|holder| holder.id.as_str()) != Some(agent.id.as_str()) {
            return Err(CoreError::validation(format!(
                "agent `{}` does not hold job `{job_id}`",
                agent.id
            ))
            .into());
        }
        self.agents.touch(&agent.id, organization_id)
    }

    /// Apply a status change reported by an agent and return the owning job.
    fn advance(
        &self,
        organization_id: &str,
        job_id: &str,
        processed_message_id: &str,
        status: MessageStatus,
    ) -> Result<Job> {
        let job = self
            .jobs
            .get_job(job_id, organization_id)?
            .ok_or_else(|| CoreError::not_found("job", job_id))?;
        let current = self
            .messages
            .get(processed_message_id, organization_id)?
            .ok_or_else(|| CoreError::not_found("processed message", processed_message_id))?;
        if current.job_id != job.id {
            return Err(CoreError::validation(format!(
                "processed message `{processed_message_id}` does not belong to job `{job_id}`"
            ))
            .into());
        }
        self.messages
            .update_status(processed_message_id, organization_id, status)?;
        Ok(job)
    }
}
