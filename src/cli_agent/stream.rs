//! Line-delimited JSON emitted by coding CLIs in streaming mode.
//!
//! Each line carries a `type` discriminant. Types we do not model decode to
//! [`StreamMessage::Unknown`] so a newer CLI never breaks the parse.

use anyhow::{Context, Result};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Assistant {
        session_id: Option<String>,
        text: String,
    },
    System {
        session_id: Option<String>,
        subtype: Option<String>,
    },
    User {
        session_id: Option<String>,
    },
    ToolUse {
        session_id: Option<String>,
        name: String,
        input: Value,
    },
    Result {
        session_id: Option<String>,
        result: String,
        is_error: bool,
    },
    Unknown {
        kind: String,
        session_id: Option<String>,
    },
}

impl StreamMessage {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            StreamMessage::Assistant { session_id, .. }
            | StreamMessage::System { session_id, .. }
            | StreamMessage::User { session_id }
            | StreamMessage::ToolUse { session_id, .. }
            | StreamMessage::Result { session_id, .. }
            | StreamMessage::Unknown { session_id, .. } => session_id.as_deref(),
        }
    }
}

type LineDecoder = fn(&Value, Option<String>) -> StreamMessage;

const DECODERS: &[(&str, LineDecoder)] = &[
    ("assistant", decode_assistant),
    ("system", decode_system),
    ("user", decode_user),
    ("tool_use", decode_tool_use),
    ("result", decode_result),
];

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Concatenated `text` blocks of `message.content`.
fn decode_assistant(value: &Value, session_id: Option<String>) -> StreamMessage {
    let text = value
        .pointer("/message/content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    StreamMessage::Assistant { session_id, text }
}

fn decode_system(value: &Value, session_id: Option<String>) -> StreamMessage {
    StreamMessage::System {
        session_id,
        subtype: str_field(value, "subtype"),
    }
}

fn decode_user(_: &Value, session_id: Option<String>) -> StreamMessage {
    StreamMessage::User { session_id }
}

fn decode_tool_use(value: &Value, session_id: Option<String>) -> StreamMessage {
    StreamMessage::ToolUse {
        session_id,
        name: str_field(value, "name").unwrap_or_default(),
        input: value.get("input").cloned().unwrap_or(Value::Null),
    }
}

fn decode_result(value: &Value, session_id: Option<String>) -> StreamMessage {
    StreamMessage::Result {
        session_id,
        result: str_field(value, "result").unwrap_or_default(),
        is_error: value
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

/// Decode one line. Only invalid JSON or a missing `type` is an error.
pub fn parse_line(line: &str) -> Result<StreamMessage> {
    let value: Value = serde_json::from_str(line.trim()).context("Invalid stream line")?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .context("Stream line has no `type`")?;
    let session_id = str_field(&value, "session_id");
    Ok(match DECODERS.iter().find(|(name, _)| *name == kind) {
        Some((_, decode)) => decode(&value, session_id),
        None => StreamMessage::Unknown {
            kind: kind.to_string(),
            session_id,
        },
    })
}

/// Parse a whole transcript, skipping blank and malformed lines.
pub fn parse_stream(output: &str) -> Vec<StreamMessage> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match parse_line(line) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::debug!("Skipping stream line: {e}");
                None
            }
        })
        .collect()
}

/// The textual result of a run: the last `result` line, or the assistant text
/// when the stream ended without one.
pub fn final_result(messages: &[StreamMessage]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find_map(|message| match message {
            StreamMessage::Result { result, .. } => Some(result.clone()),
            _ => None,
        })
        .or_else(|| {
            let text: Vec<&str> = messages
                .iter()
                .filter_map(|message| match message {
                    StreamMessage::Assistant { text, .. } if !text.is_empty() => {
                        Some(text.as_str())
                    }
                    _ => None,
                })
                .collect();
            (!text.is_empty()).then(|| text.join("\n"))
        })
}

/// Last session id mentioned anywhere in the stream.
pub fn session_id(messages: &[StreamMessage]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find_map(|message| message.session_id().map(str::to_string))
}
