use super::{format_ts, is_unique_violation, parse_ts, MessageStatus, ProcessedMessage};
use crate::error::CoreError;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const MESSAGE_COLUMNS: &str = "m.id, m.job_id, m.organization_id, m.integration_id, \
     m.platform_message_id, m.text, m.status, m.created_at, m.updated_at";

pub fn insert_processed_message(conn: &Connection, message: &ProcessedMessage) -> Result<()> {
    let result = conn.execute(
        "INSERT INTO processed_messages (
            id, job_id, organization_id, integration_id, platform_message_id, text, status,
            created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            message.id,
            message.job_id,
            message.organization_id,
            message.integration_id,
            message.platform_message_id,
            message.text,
            message.status.as_str(),
            format_ts(message.created_at),
            format_ts(message.updated_at),
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(err) if is_unique_violation(&err) => Err(CoreError::conflict(format!(
            "platform message `{}` already recorded",
            message.platform_message_id
        ))
        .into()),
        Err(err) => Err(err).context("Failed to insert processed message"),
    }
}

pub fn get_processed_message(
    conn: &Connection,
    message_id: &str,
    organization_id: &str,
) -> Result<Option<ProcessedMessage>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM processed_messages m
         WHERE m.id = ?1 AND m.organization_id = ?2"
    );
    conn.query_row(&sql, params![message_id, organization_id], map_message_row)
        .optional()
        .context("Failed to load processed message")
}

pub fn get_by_platform_message_id(
    conn: &Connection,
    organization_id: &str,
    integration_id: &str,
    platform_message_id: &str,
) -> Result<Option<ProcessedMessage>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM processed_messages m
         WHERE m.organization_id = ?1 AND m.integration_id = ?2 AND m.platform_message_id = ?3"
    );
    conn.query_row(
        &sql,
        params![organization_id, integration_id, platform_message_id],
        map_message_row,
    )
    .optional()
    .context("Failed to load processed message by platform id")
}

pub fn set_status(
    conn: &Connection,
    message_id: &str,
    organization_id: &str,
    status: MessageStatus,
    now: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE processed_messages SET status = ?1, updated_at = ?2
             WHERE id = ?3 AND organization_id = ?4",
            params![status.as_str(), format_ts(now), message_id, organization_id],
        )
        .context("Failed to update processed message status")?;
    Ok(changed > 0)
}

pub fn list_for_job(
    conn: &Connection,
    job_id: &str,
    organization_id: &str,
) -> Result<Vec<ProcessedMessage>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM processed_messages m
         WHERE m.job_id = ?1 AND m.organization_id = ?2
         ORDER BY m.created_at ASC, m.id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![job_id, organization_id], map_message_row)?;
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

/// Queued messages whose job currently has no agent, oldest first.
pub fn queued_for_unassigned_jobs(
    conn: &Connection,
    organization_id: &str,
) -> Result<Vec<ProcessedMessage>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM processed_messages m
         WHERE m.organization_id = ?1
           AND m.status = 'queued'
           AND NOT EXISTS (SELECT 1 FROM agent_job_assignments x WHERE x.job_id = m.job_id)
         ORDER BY m.created_at ASC, m.id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![organization_id], map_message_row)?;
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

pub fn active_count_for_job(
    conn: &Connection,
    job_id: &str,
    organization_id: &str,
) -> Result<usize> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM processed_messages
             WHERE job_id = ?1 AND organization_id = ?2 AND status IN ('queued', 'in_progress')",
            params![job_id, organization_id],
            |row| row.get(0),
        )
        .context("Failed to count active messages for job")?;
    Ok(usize::try_from(count).unwrap_or(0))
}

pub fn active_count(conn: &Connection, organization_id: &str) -> Result<usize> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM processed_messages
             WHERE organization_id = ?1 AND status IN ('queued', 'in_progress')",
            params![organization_id],
            |row| row.get(0),
        )
        .context("Failed to count active messages")?;
    Ok(usize::try_from(count).unwrap_or(0))
}

fn map_message_row(row: &Row<'_>) -> rusqlite::Result<ProcessedMessage> {
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(ProcessedMessage {
        id: row.get(0)?,
        job_id: row.get(1)?,
        organization_id: row.get(2)?,
        integration_id: row.get(3)?,
        platform_message_id: row.get(4)?,
        text: row.get(5)?,
        status: row.get(6)?,
        created_at: parse_ts(&created_at, 7)?,
        updated_at: parse_ts(&updated_at, 8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_conflict;
    use crate::store::{jobs, Job, JobKind, Store};

    fn seed_job(store: &Store) {
        let now = Utc::now();
        let job = Job {
            id: "j_1".into(),
            organization_id: "org".into(),
            kind: JobKind::DiscordThread {
                message_id: "m".into(),
                thread_id: "t".into(),
                integration_id: "int".into(),
            },
            created_at: now,
            updated_at: now,
        };
        store
            .with_connection(|conn| jobs::insert_job_if_absent(conn, &job))
            .unwrap();
    }

    fn message(id: &str, platform_id: &str, status: MessageStatus) -> ProcessedMessage {
        let now = Utc::now();
        ProcessedMessage {
            id: id.into(),
            job_id: "j_1".into(),
            organization_id: "org".into(),
            integration_id: "int".into(),
            platform_message_id: platform_id.into(),
            text: "hello".into(),
            status,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn duplicate_platform_message_is_a_conflict() {
        let store = Store::open_in_memory().unwrap();
        seed_job(&store);
        store
            .with_connection(|conn| {
                insert_processed_message(conn, &message("pm_1", "p1", MessageStatus::Queued))
            })
            .unwrap();
        let err = store
            .with_connection(|conn| {
                insert_processed_message(conn, &message("pm_2", "p1", MessageStatus::Queued))
            })
            .unwrap_err();
        assert!(is_conflict(&err));
    }

    #[test]
    fn active_count_ignores_completed() {
        let store = Store::open_in_memory().unwrap();
        seed_job(&store);
        store
            .with_connection(|conn| {
                insert_processed_message(conn, &message("pm_1", "p1", MessageStatus::Queued))?;
                insert_processed_message(conn, &message("pm_2", "p2", MessageStatus::InProgress))?;
                insert_processed_message(conn, &message("pm_3", "p3", MessageStatus::Completed))
            })
            .unwrap();
        let per_job = store
            .with_connection(|conn| active_count_for_job(conn, "j_1", "org"))
            .unwrap();
        let per_org = store.with_connection(|conn| active_count(conn, "org")).unwrap();
        assert_eq!(per_job, 2);
        assert_eq!(per_org, 2);
        let other_org = store.with_connection(|conn| active_count(conn, "other")).unwrap();
        assert_eq!(other_org, 0);
    }
}
