//! SQLite-backed repositories.
//!
//! Repository functions take a `&Connection` so the same code runs both on a
//! plain connection and inside [`Store::run_atomically`] (a rusqlite
//! `Transaction` derefs to `Connection`). Every query is scoped by
//! organization.

pub mod agents;
pub mod assignments;
pub mod jobs;
pub mod messages;
pub mod models;

pub use models::{Agent, Assignment, Job, JobKind, MessageStatus, ProcessedMessage};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS agents (
        id               TEXT PRIMARY KEY,
        ws_connection_id TEXT NOT NULL UNIQUE,
        organization_id  TEXT NOT NULL,
        runtime_id       TEXT NOT NULL,
        created_at       TEXT NOT NULL,
        updated_at       TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_agents_org ON agents(organization_id);

    CREATE TABLE IF NOT EXISTS jobs (
        id              TEXT PRIMARY KEY,
        organization_id TEXT NOT NULL,
        job_type        TEXT NOT NULL,
        integration_id  TEXT NOT NULL,
        thread_key      TEXT NOT NULL,
        payload         TEXT NOT NULL,
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL,
        UNIQUE (organization_id, integration_id, thread_key)
    );
    CREATE INDEX IF NOT EXISTS idx_jobs_org_updated ON jobs(organization_id, updated_at);

    CREATE TABLE IF NOT EXISTS processed_messages (
        id                  TEXT PRIMARY KEY,
        job_id              TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
        organization_id     TEXT NOT NULL,
        integration_id      TEXT NOT NULL,
        platform_message_id TEXT NOT NULL,
        text                TEXT NOT NULL,
        status              TEXT NOT NULL,
        created_at          TEXT NOT NULL,
        updated_at          TEXT NOT NULL,
        UNIQUE (organization_id, integration_id, platform_message_id)
    );
    CREATE INDEX IF NOT EXISTS idx_processed_messages_job ON processed_messages(job_id, status);

    CREATE TABLE IF NOT EXISTS agent_job_assignments (
        id              TEXT PRIMARY KEY,
        agent_id        TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
        job_id          TEXT NOT NULL UNIQUE REFERENCES jobs(id) ON DELETE CASCADE,
        organization_id TEXT NOT NULL,
        assigned_at     TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_assignments_agent ON agent_job_assignments(agent_id);
";

/// Shared handle to the orchestration database.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| {
                    format!("Failed to create store directory: {}", parent.display())
                })?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open store DB: {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
            .context("Failed to enable WAL journal")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory store")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize store schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` in one IMMEDIATE transaction: committed on `Ok`, rolled back on `Err`.
    ///
    /// The write lock is taken up front so a check-then-insert inside `f`
    /// cannot interleave with another writer.
    pub fn run_atomically<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin transaction")?;
        let value = f(&tx)?;
        tx.commit().context("Failed to commit transaction")?;
        Ok(value)
    }
}

/// Fixed-width RFC 3339 so that lexical order in SQL equals time order.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
