//! Exclusive binding of agents to jobs.
//!
//! Exclusivity rests on the `UNIQUE(job_id)` constraint of the assignment
//! table; the existence checks run in the same IMMEDIATE transaction as the
//! insert, so no partial assignment is ever visible.

use super::agents::require;
use crate::error::CoreError;
use crate::ids::{new_id, ASSIGNMENT_PREFIX};
use crate::store::{agents, assignments, jobs, Agent, Assignment, Store};
use anyhow::Result;
use chrono::Utc;
use rusqlite::Connection;

/// Agent that will handle the next message of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobAgent {
    /// The job was already bound to this agent.
    Holder(Agent),
    /// A free agent was bound to the job by this call.
    Claimed(Agent, Assignment),
}

#[derive(Clone)]
pub struct AssignmentScheduler {
    store: Store,
}

impl AssignmentScheduler {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Bind `agent_id` to `job_id`.
    ///
    /// Fails with NotFound when either id does not resolve inside the
    /// organization and with Conflict when the job already has an agent.
    pub fn assign_agent_to_job(
        &self,
        agent_id: &str,
        job_id: &str,
        organization_id: &str,
    ) -> Result<Assignment> {
        require("agent_id", agent_id)?;
        require("job_id", job_id)?;
        require("organization_id", organization_id)?;
        let assignment_id = new_id(ASSIGNMENT_PREFIX).map_err(CoreError::from)?;

        let assignment = self.store.run_atomically(|conn| {
            if agents::get_agent_by_id(conn, agent_id, organization_id)?.is_none() {
                return Err(CoreError::not_found("agent", agent_id).into());
            }
            bind(conn, assignment_id, agent_id, job_id, organization_id)
        })?;
        tracing::info!(agent_id, job_id, organization_id, "Assigned agent to job");
        Ok(assignment)
    }

    /// Return the agent holding `job_id`, or claim a free one, in a single
    /// transaction. Concurrent callers for the same job all get the same agent.
    /// Returns `None` when the job is unheld and no agent is free.
    pub fn agent_for_job(&self, job_id: &str, organization_id: &str) -> Result<Option<JobAgent>> {
        let assignment_id = new_id(ASSIGNMENT_PREFIX).map_err(CoreError::from)?;
        let resolved = self.store.run_atomically(|conn| {
            if let Some(holder) = agents::get_agent_by_job_id(conn, job_id, organization_id)? {
                return Ok(Some(JobAgent::Holder(holder)));
            }
            let Some(agent) = agents::available_agents(conn, organization_id)?
                .into_iter()
                .next()
            else {
                return Ok(None);
            };
            let assignment = bind(conn, assignment_id, &agent.id, job_id, organization_id)?;
            agents::touch_agent(conn, &agent.id, organization_id, assignment.assigned_at)?;
            Ok(Some(JobAgent::Claimed(agent, assignment)))
        })?;
        if let Some(JobAgent::Claimed(agent, _)) = &resolved {
            tracing::info!(agent_id = %agent.id, job_id, organization_id, "Claimed agent for job");
        }
        Ok(resolved)
    }

    /// Remove the binding. Returns `false` when there was none.
    pub fn unassign_agent_from_job(
        &self,
        agent_id: &str,
        job_id: &str,
        organization_id: &str,
    ) -> Result<bool> {
        let removed = self.store.run_atomically(|conn| {
            let removed = assignments::delete_assignment(conn, agent_id, job_id, organization_id)?;
            if removed {
                agents::touch_agent(conn, agent_id, organization_id, Utc::now())?;
            }
            Ok(removed)
        })?;
        if removed {
            tracing::info!(agent_id, job_id, organization_id, "Unassigned agent from job");
        }
        Ok(removed)
    }

    /// Every job currently held by the agent.
    pub fn get_active_agent_job_assignments(
        &self,
        agent_id: &str,
        organization_id: &str,
    ) -> Result<Vec<Assignment>> {
        self.store.with_connection(|conn| {
            assignments::assignments_for_agent(conn, agent_id, organization_id)
        })
    }

    pub fn assignment_for_job(
        &self,
        job_id: &str,
        organization_id: &str,
    ) -> Result<Option<Assignment>> {
        self.store.with_connection(|conn| {
            assignments::get_assignment_for_job(conn, job_id, organization_id)
        })
    }
}

fn bind(
    conn: &Connection,
    assignment_id: String,
    agent_id: &str,
    job_id: &str,
    organization_id: &str,
) -> Result<Assignment> {
    if jobs::get_job_by_id(conn, job_id, organization_id)?.is_none() {
        return Err(CoreError::not_found("job", job_id).into());
    }
    if let Some(existing) = assignments::get_assignment_for_job(conn, job_id, organization_id)? {
        return Err(CoreError::conflict(format!(
            "job `{job_id}` is already assigned to agent `{}`",
            existing.agent_id
        ))
        .into());
    }
    let assignment = Assignment {
        id: assignment_id,
        agent_id: agent_id.to_string(),
        job_id: job_id.to_string(),
        organization_id: organization_id.to_string(),
        assigned_at: Utc::now(),
    };
    assignments::insert_assignment(conn, &assignment)?;
    Ok(assignment)
}
