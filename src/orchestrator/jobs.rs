use super::agents::require;
use crate::error::CoreError;
use crate::ids::{new_id, JOB_PREFIX};
use crate::store::{jobs, Job, JobKind, Store};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Whether [`JobManager::get_or_create_job_for_thread`] made a new job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobCreation {
    Created,
    AlreadyExists,
}

#[derive(Clone)]
pub struct JobManager {
    store: Store,
}

impl JobManager {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Find the job for `thread`, creating it if this is the first event seen.
    ///
    /// Two racing first events for the same thread both get the same job; only
    /// one of them sees [`JobCreation::Created`].
    pub fn get_or_create_job_for_thread(
        &self,
        organization_id: &str,
        thread: &JobKind,
    ) -> Result<(Job, JobCreation)> {
        require("organization_id", organization_id)?;
        thread.validate()?;
        let now = Utc::now();
        let candidate = Job {
            id: new_id(JOB_PREFIX).map_err(CoreError::from)?,
            organization_id: organization_id.to_string(),
            kind: thread.clone(),
            created_at: now,
            updated_at: now,
        };

        self.store.run_atomically(|conn| {
            if jobs::insert_job_if_absent(conn, &candidate)? {
                tracing::info!(
                    job_id = %candidate.id,
                    organization_id,
                    thread = %thread.thread_key(),
                    "Created job"
                );
                return Ok((candidate.clone(), JobCreation::Created));
            }
            let existing = jobs::get_job_by_natural_key(conn, organization_id, thread)?
                .context("Job vanished between insert and lookup")?;
            Ok((existing, JobCreation::AlreadyExists))
        })
    }

    pub fn get_job(&self, job_id: &str, organization_id: &str) -> Result<Option<Job>> {
        self.store
            .with_connection(|conn| jobs::get_job_by_id(conn, job_id, organization_id))
    }

    pub fn list_jobs(&self, organization_id: &str) -> Result<Vec<Job>> {
        self.store
            .with_connection(|conn| jobs::list_jobs(conn, organization_id))
    }

    /// Record activity on the job so idle detection starts over.
    pub fn update_job_timestamp(&self, job_id: &str, organization_id: &str) -> Result<()> {
        self.set_updated_at(job_id, organization_id, Utc::now())
    }

    /// Set `updated_at` explicitly. Used by maintenance tooling and tests.
    pub fn set_updated_at(
        &self,
        job_id: &str,
        organization_id: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let updated = self.store.with_connection(|conn| {
            jobs::set_job_updated_at(conn, job_id, organization_id, updated_at)
        })?;
        if !updated {
            return Err(CoreError::not_found("job", job_id).into());
        }
        Ok(())
    }

    /// Jobs untouched for longer than `idle_minutes` with no queued or
    /// in-progress message. A job with active work is never idle.
    pub fn get_idle_jobs(&self, organization_id: &str, idle_minutes: u32) -> Result<Vec<Job>> {
        let cutoff = Utc::now() - Duration::minutes(i64::from(idle_minutes));
        self.store
            .with_connection(|conn| jobs::idle_jobs(conn, organization_id, cutoff))
    }

    /// Delete the job together with its processed messages and assignment.
    pub fn delete_job(&self, job_id: &str, organization_id: &str) -> Result<()> {
        let deleted = self
            .store
            .run_atomically(|conn| jobs::delete_job(conn, job_id, organization_id))?;
        if !deleted {
            return Err(CoreError::not_found("job", job_id).into());
        }
        tracing::info!(job_id, organization_id, "Deleted job");
        Ok(())
    }

    pub fn organizations(&self) -> Result<Vec<String>> {
        self.store.with_connection(jobs::organizations_with_jobs)
    }
}
