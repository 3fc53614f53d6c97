//! Agent-side view of a coding CLI: a prompt goes in, text comes out.
//!
//! Spawning the CLI process is left to implementations; this module defines
//! the seam and turns a job message into the reply the orchestrator expects.

pub mod stream;

use crate::transport::protocol::{AssistantMessagePayload, JobMessagePayload};
use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliAgentOutput {
    pub text: String,
    /// Session to resume for the next message of the same thread.
    pub session_id: Option<String>,
}

impl CliAgentOutput {
    /// Build an output from a captured streaming transcript.
    pub fn from_stream(output: &str) -> Result<Self> {
        let messages = stream::parse_stream(output);
        let text = stream::final_result(&messages)
            .ok_or_else(|| anyhow::anyhow!("CLI produced no result"))?;
        Ok(Self {
            text,
            session_id: stream::session_id(&messages),
        })
    }
}

#[async_trait]
pub trait CliAgent: Send + Sync {
    /// Tool identity reported as `runtime_id` when the agent connects.
    fn runtime_id(&self) -> &str;

    async fn run(&self, prompt: &str, session_id: Option<&str>) -> Result<CliAgentOutput>;
}

/// Run the CLI on one job message and build the `assistant_message` reply.
pub async fn answer(
    agent: &dyn CliAgent,
    job: &JobMessagePayload,
    session_id: Option<&str>,
) -> Result<(AssistantMessagePayload, Option<String>)> {
    let output = agent.run(&job.message, session_id).await?;
    tracing::debug!(
        job_id = %job.job_id,
        runtime_id = agent.runtime_id(),
        chars = output.text.len(),
        "CLI agent produced a reply"
    );
    Ok((
        AssistantMessagePayload {
            job_id: job.job_id.clone(),
            processed_message_id: job.processed_message_id.clone(),
            message: output.text,
        },
        output.session_id,
    ))
}
