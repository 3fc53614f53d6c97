use crate::error::CoreError;
use crate::ids::{new_id, AGENT_PREFIX};
use crate::store::{agents, Agent, Store};
use anyhow::Result;
use chrono::Utc;

/// Connected agents and their availability.
#[derive(Clone)]
pub struct AgentRegistry {
    store: Store,
}

impl AgentRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Register the agent behind `ws_connection_id`, or refresh it when the
    /// connection is already known.
    pub fn upsert_active_agent(
        &self,
        ws_connection_id: &str,
        organization_id: &str,
        runtime_id: &str,
    ) -> Result<Agent> {
        require("ws_connection_id", ws_connection_id)?;
        require("organization_id", organization_id)?;
        require("runtime_id", runtime_id)?;
        let agent_id = new_id(AGENT_PREFIX).map_err(CoreError::from)?;

        let agent = self.store.run_atomically(|conn| {
            agents::upsert_agent(
                conn,
                &agent_id,
                ws_connection_id,
                organization_id,
                runtime_id,
                Utc::now(),
            )
        })?;
        agent.ok_or_else(|| {
            CoreError::conflict(format!(
                "connection `{ws_connection_id}` is registered to another organization"
            ))
            .into()
        })
    }

    pub fn get_agent_by_id(&self, agent_id: &str, organization_id: &str) -> Result<Option<Agent>> {
        self.store
            .with_connection(|conn| agents::get_agent_by_id(conn, agent_id, organization_id))
    }

    pub fn get_agent_by_ws_connection_id(
        &self,
        ws_connection_id: &str,
        organization_id: &str,
    ) -> Result<Option<Agent>> {
        self.store.with_connection(|conn| {
            agents::get_agent_by_ws_connection_id(conn, ws_connection_id, organization_id)
        })
    }

    pub fn get_agent_by_job_id(
        &self,
        job_id: &str,
        organization_id: &str,
    ) -> Result<Option<Agent>> {
        self.store
            .with_connection(|conn| agents::get_agent_by_job_id(conn, job_id, organization_id))
    }

    /// Agents of the organization with no assignment, least recently active first.
    pub fn get_available_agents(&self, organization_id: &str) -> Result<Vec<Agent>> {
        self.store
            .with_connection(|conn| agents::available_agents(conn, organization_id))
    }

    pub fn list_agents(&self, organization_id: &str) -> Result<Vec<Agent>> {
        self.store
            .with_connection(|conn| agents::list_agents(conn, organization_id))
    }

    /// Mark the agent as recently active.
    pub fn touch(&self, agent_id: &str, organization_id: &str) -> Result<()> {
        let touched = self.store.with_connection(|conn| {
            agents::touch_agent(conn, agent_id, organization_id, Utc::now())
        })?;
        if !touched {
            return Err(CoreError::not_found("agent", agent_id).into());
        }
        Ok(())
    }

    /// Remove the agent. Its assignments disappear with it; callers that need
    /// the unassign hooks must unassign first.
    pub fn delete_active_agent(&self, agent_id: &str, organization_id: &str) -> Result<()> {
        let deleted = self
            .store
            .with_connection(|conn| agents::delete_agent(conn, agent_id, organization_id))?;
        if !deleted {
            return Err(CoreError::not_found("agent", agent_id).into());
        }
        Ok(())
    }

    /// Drop agents left over from a previous process.
    pub fn purge_stale(&self) -> Result<usize> {
        self.store.run_atomically(agents::purge_agents)
    }
}

pub(crate) fn require(field: &str, value: &str) -> Result<(), CoreError> {
    if value.trim().is_empty() {
        return Err(CoreError::validation(format!("{field} must not be empty")));
    }
    Ok(())
}
