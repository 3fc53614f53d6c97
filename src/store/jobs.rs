use super::{format_ts, parse_ts, Job, JobKind};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const JOB_COLUMNS: &str = "j.id, j.organization_id, j.payload, j.created_at, j.updated_at";

/// Insert `job` unless a job with the same natural key already exists.
///
/// Returns `true` when this call created the row.
pub fn insert_job_if_absent(conn: &Connection, job: &Job) -> Result<bool> {
    let payload = serde_json::to_string(&job.kind)?;
    let changed = conn
        .execute(
            "INSERT INTO jobs (id, organization_id, job_type, integration_id, thread_key, payload, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(organization_id, integration_id, thread_key) DO NOTHING",
            params![
                job.id,
                job.organization_id,
                job.kind.as_str(),
                job.kind.integration_id(),
                job.kind.thread_key(),
                payload,
                format_ts(job.created_at),
                format_ts(job.updated_at),
            ],
        )
        .context("Failed to insert job")?;
    Ok(changed == 1)
}

pub fn get_job_by_id(
    conn: &Connection,
    job_id: &str,
    organization_id: &str,
) -> Result<Option<Job>> {
    let sql =
        format!("SELECT {JOB_COLUMNS} FROM jobs j WHERE j.id = ?1 AND j.organization_id = ?2");
    conn.query_row(&sql, params![job_id, organization_id], map_job_row)
        .optional()
        .context("Failed to load job")
}

pub fn get_job_by_natural_key(
    conn: &Connection,
    organization_id: &str,
    kind: &JobKind,
) -> Result<Option<Job>> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM jobs j
         WHERE j.organization_id = ?1 AND j.integration_id = ?2 AND j.thread_key = ?3"
    );
    conn.query_row(
        &sql,
        params![organization_id, kind.integration_id(), kind.thread_key()],
        map_job_row,
    )
    .optional()
    .context("Failed to load job by thread")
}

pub fn set_job_updated_at(
    conn: &Connection,
    job_id: &str,
    organization_id: &str,
    updated_at: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE jobs SET updated_at = ?1 WHERE id = ?2 AND organization_id = ?3",
            params![format_ts(updated_at), job_id, organization_id],
        )
        .context("Failed to update job timestamp")?;
    Ok(changed > 0)
}

pub fn list_jobs(conn: &Connection, organization_id: &str) -> Result<Vec<Job>> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM jobs j WHERE j.organization_id = ?1 ORDER BY j.created_at ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![organization_id], map_job_row)?;
    let mut jobs = Vec::new();
    for row in rows {
        jobs.push(row?);
    }
    Ok(jobs)
}

/// Jobs last touched before `cutoff` that have no queued or in-progress message.
pub fn idle_jobs(
    conn: &Connection,
    organization_id: &str,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Job>> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM jobs j
         WHERE j.organization_id = ?1
           AND j.updated_at < ?2
           AND NOT EXISTS (
               SELECT 1 FROM processed_messages m
               WHERE m.job_id = j.id AND m.status IN ('queued', 'in_progress')
           )
         ORDER BY j.updated_at ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![organization_id, format_ts(cutoff)], map_job_row)?;
    let mut jobs = Vec::new();
    for row in rows {
        jobs.push(row?);
    }
    Ok(jobs)
}

/// Delete the job. Processed messages and the assignment cascade.
pub fn delete_job(conn: &Connection, job_id: &str, organization_id: &str) -> Result<bool> {
    let changed = conn
        .execute(
            "DELETE FROM jobs WHERE id = ?1 AND organization_id = ?2",
            params![job_id, organization_id],
        )
        .context("Failed to delete job")?;
    Ok(changed > 0)
}

pub fn organizations_with_jobs(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT organization_id FROM jobs ORDER BY organization_id")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut orgs = Vec::new();
    for row in rows {
        orgs.push(row?);
    }
    Ok(orgs)
}

fn map_job_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let payload: String = row.get(2)?;
    let kind: JobKind = serde_json::from_str(&payload).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;
    Ok(Job {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        kind,
        created_at: parse_ts(&created_at, 3)?,
        updated_at: parse_ts(&updated_at, 4)?,
    })
}
