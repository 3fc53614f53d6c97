use super::{format_ts, parse_ts, Agent};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const AGENT_COLUMNS: &str =
    "a.id, a.ws_connection_id, a.organization_id, a.runtime_id, a.created_at, a.updated_at";

/// Insert the agent for `ws_connection_id`, or refresh it if the connection is
/// already known to the same organization.
///
/// Returns `None` when the connection is registered to another organization.
pub fn upsert_agent(
    conn: &Connection,
    agent_id: &str,
    ws_connection_id: &str,
    organization_id: &str,
    runtime_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<Agent>> {
    let now = format_ts(now);
    conn.execute(
        "INSERT INTO agents (id, ws_connection_id, organization_id, runtime_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)
         ON CONFLICT(ws_connection_id) DO UPDATE SET
            runtime_id = excluded.runtime_id,
            updated_at = excluded.updated_at
         WHERE agents.organization_id = excluded.organization_id",
        params![agent_id, ws_connection_id, organization_id, runtime_id, now],
    )
    .context("Failed to upsert agent")?;

    get_agent_by_ws_connection_id(conn, ws_connection_id, organization_id)
}

pub fn get_agent_by_id(
    conn: &Connection,
    agent_id: &str,
    organization_id: &str,
) -> Result<Option<Agent>> {
    let sql = format!(
        "SELECT {AGENT_COLUMNS} FROM agents a WHERE a.id = ?1 AND a.organization_id = ?2"
    );
    conn.query_row(&sql, params![agent_id, organization_id], map_agent_row)
        .optional()
        .context("Failed to load agent")
}

pub fn get_agent_by_ws_connection_id(
    conn: &Connection,
    ws_connection_id: &str,
    organization_id: &str,
) -> Result<Option<Agent>> {
    let sql = format!(
        "SELECT {AGENT_COLUMNS} FROM agents a
         WHERE a.ws_connection_id = ?1 AND a.organization_id = ?2"
    );
    conn.query_row(&sql, params![ws_connection_id, organization_id], map_agent_row)
        .optional()
        .context("Failed to load agent by connection")
}

pub fn get_agent_by_job_id(
    conn: &Connection,
    job_id: &str,
    organization_id: &str,
) -> Result<Option<Agent>> {
    let sql = format!(
        "SELECT {AGENT_COLUMNS} FROM agents a
         JOIN agent_job_assignments x ON x.agent_id = a.id
         WHERE x.job_id = ?1 AND a.organization_id = ?2"
    );
    conn.query_row(&sql, params![job_id, organization_id], map_agent_row)
        .optional()
        .context("Failed to load agent by job")
}

/// Agents of `organization_id` that hold no assignment, least recently active first.
pub fn available_agents(conn: &Connection, organization_id: &str) -> Result<Vec<Agent>> {
    let sql = format!(
        "SELECT {AGENT_COLUMNS} FROM agents a
         WHERE a.organization_id = ?1
           AND NOT EXISTS (SELECT 1 FROM agent_job_assignments x WHERE x.agent_id = a.id)
         ORDER BY a.updated_at ASC, a.id ASC"
    );
    collect_agents(conn, &sql, organization_id)
}

pub fn list_agents(conn: &Connection, organization_id: &str) -> Result<Vec<Agent>> {
    let sql = format!(
        "SELECT {AGENT_COLUMNS} FROM agents a WHERE a.organization_id = ?1 ORDER BY a.created_at ASC"
    );
    collect_agents(conn, &sql, organization_id)
}

pub fn touch_agent(
    conn: &Connection,
    agent_id: &str,
    organization_id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE agents SET updated_at = ?1 WHERE id = ?2 AND organization_id = ?3",
            params![format_ts(now), agent_id, organization_id],
        )
        .context("Failed to touch agent")?;
    Ok(changed > 0)
}

/// Remove the agent. Its assignment rows go with it through the foreign key.
pub fn delete_agent(conn: &Connection, agent_id: &str, organization_id: &str) -> Result<bool> {
    let changed = conn
        .execute(
            "DELETE FROM agents WHERE id = ?1 AND organization_id = ?2",
            params![agent_id, organization_id],
        )
        .context("Failed to delete agent")?;
    Ok(changed > 0)
}

/// Remove every agent row. Connections do not survive a restart, so rows left
/// by a previous process can never be reached again.
pub fn purge_agents(conn: &Connection) -> Result<usize> {
    conn.execute("DELETE FROM agents", [])
        .context("Failed to purge agents")
}

fn collect_agents(conn: &Connection, sql: &str, organization_id: &str) -> Result<Vec<Agent>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![organization_id], map_agent_row)?;
    let mut agents = Vec::new();
    for row in rows {
        agents.push(row?);
    }
    Ok(agents)
}

fn map_agent_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    Ok(Agent {
        id: row.get(0)?,
        ws_connection_id: row.get(1)?,
        organization_id: row.get(2)?,
        runtime_id: row.get(3)?,
        created_at: parse_ts(&created_at, 4)?,
        updated_at: parse_ts(&updated_at, 5)?,
    })
}
