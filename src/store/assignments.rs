use super::{format_ts, is_unique_violation, parse_ts, Assignment};
use crate::error::CoreError;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

const ASSIGNMENT_COLUMNS: &str = "id, agent_id, job_id, organization_id, assigned_at";

/// Insert the binding. The `UNIQUE(job_id)` constraint turns a second binding
/// for the same job into a [`CoreError::Conflict`].
pub fn insert_assignment(conn: &Connection, assignment: &Assignment) -> Result<()> {
    let result = conn.execute(
        "INSERT INTO agent_job_assignments (id, agent_id, job_id, organization_id, assigned_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            assignment.id,
            assignment.agent_id,
            assignment.job_id,
            assignment.organization_id,
            format_ts(assignment.assigned_at),
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(err) if is_unique_violation(&err) => Err(CoreError::conflict(format!(
            "job `{}` already has an assigned agent",
            assignment.job_id
        ))
        .into()),
        Err(err) => Err(err).context("Failed to insert assignment"),
    }
}

pub fn get_assignment_for_job(
    conn: &Connection,
    job_id: &str,
    organization_id: &str,
) -> Result<Option<Assignment>> {
    let sql = format!(
        "SELECT {ASSIGNMENT_COLUMNS} FROM agent_job_assignments
         WHERE job_id = ?1 AND organization_id = ?2"
    );
    conn.query_row(&sql, params![job_id, organization_id], map_assignment_row)
        .optional()
        .context("Failed to load assignment")
}

pub fn assignments_for_agent(
    conn: &Connection,
    agent_id: &str,
    organization_id: &str,
) -> Result<Vec<Assignment>> {
    let sql = format!(
        "SELECT {ASSIGNMENT_COLUMNS} FROM agent_job_assignments
         WHERE agent_id = ?1 AND organization_id = ?2
         ORDER BY assigned_at ASC, id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![agent_id, organization_id], map_assignment_row)?;
    let mut assignments = Vec::new();
    for row in rows {
        assignments.push(row?);
    }
    Ok(assignments)
}

pub fn delete_assignment(
    conn: &Connection,
    agent_id: &str,
    job_id: &str,
    organization_id: &str,
) -> Result<bool> {
    let changed = conn
        .execute(
            "DELETE FROM agent_job_assignments
             WHERE agent_id = ?1 AND job_id = ?2 AND organization_id = ?3",
            params![agent_id, job_id, organization_id],
        )
        .context("Failed to delete assignment")?;
    Ok(changed > 0)
}

fn map_assignment_row(row: &Row<'_>) -> rusqlite::Result<Assignment> {
    let assigned_at: String = row.get(4)?;
    Ok(Assignment {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        job_id: row.get(2)?,
        organization_id: row.get(3)?,
        assigned_at: parse_ts(&assigned_at, 4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_conflict;
    use crate::store::{agents, jobs, Job, JobKind, Store};
    use chrono::Utc;

    fn seed(store: &Store) {
        let now = Utc::now();
        store
            .with_connection(|conn| {
                agents::upsert_agent(conn, "ag_1", "conn_1", "org", "rt", now)?;
                agents::upsert_agent(conn, "ag_2", "conn_2", "org", "rt", now)?;
                for (id, thread) in [("j_1", "t1"), ("j_2", "t2")] {
                    jobs::insert_job_if_absent(
                        conn,
                        &Job {
                            id: id.into(),
                            organization_id: "org".into(),
                            kind: JobKind::DiscordThread {
                                message_id: "m".into(),
                                thread_id: thread.into(),
                                integration_id: "int".into(),
                            },
                            created_at: now,
                            updated_at: now,
                        },
                    )?;
                }
                Ok(())
            })
            .unwrap();
    }

    fn assignment(id: &str, agent_id: &str, job_id: &str) -> Assignment {
        Assignment {
            id: id.into(),
            agent_id: agent_id.into(),
            job_id: job_id.into(),
            organization_id: "org".into(),
            assigned_at: Utc::now(),
        }
    }

    #[test]
    fn second_agent_for_same_job_is_a_conflict() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);
        store
            .with_connection(|conn| insert_assignment(conn, &assignment("asg_1", "ag_1", "j_1")))
            .unwrap();
        let err = store
            .with_connection(|conn| insert_assignment(conn, &assignment("asg_2", "ag_2", "j_1")))
            .unwrap_err();
        assert!(is_conflict(&err));
    }

    #[test]
    fn agent_may_hold_several_jobs() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);
        store
            .with_connection(|conn| {
                insert_assignment(conn, &assignment("asg_1", "ag_1", "j_1"))?;
                insert_assignment(conn, &assignment("asg_2", "ag_1", "j_2"))
            })
            .unwrap();
        let held = store
            .with_connection(|conn| assignments_for_agent(conn, "ag_1", "org"))
            .unwrap();
        assert_eq!(held.len(), 2);
    }

    #[test]
    fn deleting_agent_cascades_to_assignments() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);
        store
            .with_connection(|conn| insert_assignment(conn, &assignment("asg_1", "ag_1", "j_1")))
            .unwrap();
        store
            .with_connection(|conn| agents::delete_agent(conn, "ag_1", "org"))
            .unwrap();
        let left = store
            .with_connection(|conn| get_assignment_for_job(conn, "j_1", "org"))
            .unwrap();
        assert!(left.is_none());
    }

    #[test]
    fn delete_reports_whether_a_binding_existed() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);
        store
            .with_connection(|conn| insert_assignment(conn, &assignment("asg_1", "ag_1", "j_1")))
            .unwrap();
        let removed = store
            .with_connection(|conn| delete_assignment(conn, "ag_1", "j_1", "org"))
            .unwrap();
        let again = store
            .with_connection(|conn| delete_assignment(conn, "ag_1", "j_1", "org"))
            .unwrap();
        assert!(removed);
        assert!(!again);
    }
}
