use super::agents::require;
use crate::error::CoreError;
use crate::ids::{new_id, PROCESSED_MESSAGE_PREFIX};
use crate::store::{jobs, messages, MessageStatus, ProcessedMessage, Store};
use anyhow::Result;
use chrono::Utc;

/// An inbound platform message accepted for a job.
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub job_id: &'a str,
    pub organization_id: &'a str,
    pub integration_id: &'a str,
    pub platform_message_id: &'a str,
    pub text: &'a str,
}

/// Processing status of inbound messages per job.
#[derive(Clone)]
pub struct MessageTracker {
    store: Store,
}

impl MessageTracker {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Record `message` as Queued and touch its job.
    pub fn record(&self, message: &NewMessage<'_>) -> Result<ProcessedMessage> {
        require("job_id", message.job_id)?;
        require("organization_id", message.organization_id)?;
        require("integration_id", message.integration_id)?;
        require("platform_message_id", message.platform_message_id)?;
        let now = Utc::now();
        let record = ProcessedMessage {
            id: new_id(PROCESSED_MESSAGE_PREFIX).map_err(CoreError::from)?,
            job_id: message.job_id.to_string(),
            organization_id: message.organization_id.to_string(),
            integration_id: message.integration_id.to_string(),
            platform_message_id: message.platform_message_id.to_string(),
            text: message.text.to_string(),
            status: MessageStatus::Queued,
            created_at: now,
            updated_at: now,
        };

        self.store.run_atomically(|conn| {
            if jobs::get_job_by_id(conn, message.job_id, message.organization_id)?.is_none() {
                return Err(CoreError::not_found("job", message.job_id).into());
            }
            messages::insert_processed_message(conn, &record)?;
            jobs::set_job_updated_at(conn, message.job_id, message.organization_id, now)?;
            Ok(())
        })?;
        Ok(record)
    }

    /// Move a message forward. Re-applying the current status only refreshes
    /// `updated_at`; moving backwards is rejected.
    pub fn update_status(
        &self,
        message_id: &str,
        organization_id: &str,
        status: MessageStatus,
    ) -> Result<ProcessedMessage> {
        let now = Utc::now();
        self.store.run_atomically(|conn| {
            let mut current = messages::get_processed_message(conn, message_id, organization_id)?
                .ok_or_else(|| CoreError::not_found("processed message", message_id))?;
            if !current.status.can_transition_to(status) {
                return Err(CoreError::validation(format!(
                    "processed message `{message_id}` cannot move from {} to {status}",
                    current.status
                ))
                .into());
            }
            messages::set_status(conn, message_id, organization_id, status, now)?;
            jobs::set_job_updated_at(conn, &current.job_id, organization_id, now)?;
            if current.status != status {
                tracing::debug!(
                    processed_message_id = message_id,
                    from = %current.status,
                    to = %status,
                    "Processed message status changed"
                );
            }
            current.status = status;
            current.updated_at = now;
            Ok(current)
        })
    }

    pub fn get(&self, message_id: &str, organization_id: &str) -> Result<Option<ProcessedMessage>> {
        self.store.with_connection(|conn| {
            messages::get_processed_message(conn, message_id, organization_id)
        })
    }

    /// Lookup used to skip platform redeliveries of the same event.
    pub fn find_by_platform_message_id(
        &self,
        organization_id: &str,
        integration_id: &str,
        platform_message_id: &str,
    ) -> Result<Option<ProcessedMessage>> {
        self.store.with_connection(|conn| {
            messages::get_by_platform_message_id(
                conn,
                organization_id,
                integration_id,
                platform_message_id,
            )
        })
    }

    pub fn list_for_job(
        &self,
        job_id: &str,
        organization_id: &str,
    ) -> Result<Vec<ProcessedMessage>> {
        self.store
            .with_connection(|conn| messages::list_for_job(conn, job_id, organization_id))
    }

    pub fn active_count_for_job(&self, job_id: &str, organization_id: &str) -> Result<usize> {
        self.store
            .with_connection(|conn| messages::active_count_for_job(conn, job_id, organization_id))
    }

    pub fn active_count(&self, organization_id: &str) -> Result<usize> {
        self.store
            .with_connection(|conn| messages::active_count(conn, organization_id))
    }

    /// Queued messages whose job has no agent, oldest first.
    pub fn queued_for_unassigned_jobs(
        &self,
        organization_id: &str,
    ) -> Result<Vec<ProcessedMessage>> {
        self.store
            .with_connection(|conn| messages::queued_for_unassigned_jobs(conn, organization_id))
    }
}
