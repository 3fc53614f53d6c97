use crate::error::CoreError;
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use serde::{Deserialize, Serialize};

/// A connected coding agent. Available while it holds no assignment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Agent {
    pub id: String,
    pub ws_connection_id: String,
    pub organization_id: String,
    /// Identity of the coding CLI the agent runs on.
    pub runtime_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Platform thread a job was opened for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    SlackThread {
        channel_id: String,
        thread_ts: String,
        integration_id: String,
    },
    DiscordThread {
        message_id: String,
        thread_id: String,
        integration_id: String,
    },
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::SlackThread { .. } => "slack_thread",
            JobKind::DiscordThread { .. } => "discord_thread",
        }
    }

    pub fn integration_id(&self) -> &str {
        match self {
            JobKind::SlackThread { integration_id, .. }
            | JobKind::DiscordThread { integration_id, .. } => integration_id,
        }
    }

    /// Thread identity inside one integration. Together with organization
    /// and integration it forms the natural key of a job.
    pub fn thread_key(&self) -> String {
        match self {
            JobKind::SlackThread {
                channel_id,
                thread_ts,
                ..
            } => format!("slack:{channel_id}:{thread_ts}"),
            // A Discord thread id is globally unique; the originating message is
            // payload only.
            JobKind::DiscordThread { thread_id, .. } => format!("discord:{thread_id}"),
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let fields: Vec<(&'static str, &str)> = match self {
            JobKind::SlackThread {
                channel_id,
                thread_ts,
                integration_id,
            } => vec![
                ("channel_id", channel_id.as_str()),
                ("thread_ts", thread_ts.as_str()),
                ("integration_id", integration_id.as_str()),
            ],
            JobKind::DiscordThread {
                message_id,
                thread_id,
                integration_id,
            } => vec![
                ("message_id", message_id.as_str()),
                ("thread_id", thread_id.as_str()),
                ("integration_id", integration_id.as_str()),
            ],
        };
        for (name, value) in &fields {
            if value.trim().is_empty() {
                return Err(CoreError::validation(format!(
                    "{} field `{name}` must not be empty",
                    self.as_str()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub organization_id: String,
    pub kind: JobKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Processing status of one inbound platform message.
///
/// Transitions only move forward: Queued → InProgress → Completed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    InProgress,
    Completed,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Queued => "queued",
            MessageStatus::InProgress => "in_progress",
            MessageStatus::Completed => "completed",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, MessageStatus::Queued | MessageStatus::InProgress)
    }

    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        next >= self
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for MessageStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "queued" => Ok(MessageStatus::Queued),
            "in_progress" => Ok(MessageStatus::InProgress),
            "completed" => Ok(MessageStatus::Completed),
            other => Err(format!("unknown processed message status '{other}'")),
        }
    }
}

impl FromSql for MessageStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        MessageStatus::try_from(text).map_err(|e| FromSqlError::Other(e.into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessedMessage {
    pub id: String,
    pub job_id: String,
    pub organization_id: String,
    pub integration_id: String,
    pub platform_message_id: String,
    pub text: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Assignment {
    pub id: String,
    pub agent_id: String,
    pub job_id: String,
    pub organization_id: String,
    pub assigned_at: DateTime<Utc>,
}
