//! Wire envelopes exchanged with agents over their persistent connection.
//!
//! ```text
//! Server -> Agent: {"id":"msg_...","type":"start_conversation","payload":{...}}
//! Agent  -> Server: {"type":"acknowledgement","payload":{"message_id":"msg_..."}}
//! Agent  -> Server: {"id":"msg_...","type":"assistant_message","payload":{...}}
//! Server -> Agent: {"type":"acknowledgement","payload":{"message_id":"msg_..."}}
//! ```
//!
//! Frames without an `id` are not subject to reliable delivery and are never
//! acknowledged.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const START_CONVERSATION: &str = "start_conversation";
pub const USER_MESSAGE: &str = "user_message";
pub const PROCESSING_STARTED: &str = "processing_started";
pub const ASSISTANT_MESSAGE: &str = "assistant_message";
pub const SYSTEM_MESSAGE: &str = "system_message";
pub const ACKNOWLEDGEMENT: &str = "acknowledgement";

/// Outbound envelope sent with reliable delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

/// Any frame received from an agent. `id` is absent on acknowledgements and
/// other fire-and-forget traffic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl InboundEnvelope {
    /// Id usable for dedup and acks. Blank ids count as absent; any other id
    /// is returned exactly as sent, since the peer retires pending entries by
    /// exact match.
    pub fn delivery_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AckPayload {
    pub message_id: String,
}

/// Work handed to an agent: the first message of a thread
/// (`start_conversation`) or a follow-up in the same thread (`user_message`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobMessagePayload {
    pub job_id: String,
    pub processed_message_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessingStartedPayload {
    pub job_id: String,
    pub processed_message_id: String,
}

/// Result produced by an agent for one processed message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssistantMessagePayload {
    pub job_id: String,
    pub processed_message_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemMessagePayload {
    #[serde(default)]
    pub job_id: Option<String>,
    pub message: String,
}

/// Decoded agent frame.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    Acknowledgement(AckPayload),
    ProcessingStarted(ProcessingStartedPayload),
    AssistantMessage(AssistantMessagePayload),
    SystemMessage(SystemMessagePayload),
    /// Discriminant we do not know. Carries only the common fields.
    Unknown { id: Option<String>, kind: String },
}

type Decoder = fn(Value) -> Result<AgentMessage, serde_json::Error>;

const DECODERS: &[(&str, Decoder)] = &[
    (ACKNOWLEDGEMENT, decode_ack),
    (PROCESSING_STARTED, decode_processing_started),
    (ASSISTANT_MESSAGE, decode_assistant_message),
    (SYSTEM_MESSAGE, decode_system_message),
];

fn decode_ack(payload: Value) -> Result<AgentMessage, serde_json::Error> {
    serde_json::from_value(payload).map(AgentMessage::Acknowledgement)
}

fn decode_processing_started(payload: Value) -> Result<AgentMessage, serde_json::Error> {
    serde_json::from_value(payload).map(AgentMessage::ProcessingStarted)
}

fn decode_assistant_message(payload: Value) -> Result<AgentMessage, serde_json::Error> {
    serde_json::from_value(payload).map(AgentMessage::AssistantMessage)
}

fn decode_system_message(payload: Value) -> Result<AgentMessage, serde_json::Error> {
    serde_json::from_value(payload).map(AgentMessage::SystemMessage)
}

impl AgentMessage {
    /// Decode the payload of `envelope` by its `type`.
    ///
    /// Unknown types decode to [`AgentMessage::Unknown`]; a known type with a
    /// malformed payload is a validation error.
    pub fn decode(envelope: &InboundEnvelope) -> Result<Self, CoreError> {
        let Some((_, decode)) = DECODERS.iter().find(|(kind, _)| *kind == envelope.kind) else {
            return Ok(AgentMessage::Unknown {
                id: envelope.id.clone(),
                kind: envelope.kind.clone(),
            });
        };
        decode(envelope.payload.clone()).map_err(|e| {
            CoreError::validation(format!("malformed `{}` payload: {e}", envelope.kind))
        })
    }
}

/// Parse one text frame into its envelope and decoded message.
pub fn decode_frame(text: &str) -> Result<(InboundEnvelope, AgentMessage), CoreError> {
    let envelope: InboundEnvelope = serde_json::from_str(text)
        .map_err(|e| CoreError::validation(format!("invalid frame: {e}")))?;
    let message = AgentMessage::decode(&envelope)?;
    Ok((envelope, message))
}

/// Serialized acknowledgement for `message_id`.
pub fn ack_frame(message_id: &str) -> String {
    serde_json::json!({
        "type": ACKNOWLEDGEMENT,
        "payload": { "message_id": message_id },
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ack_frame_matches_wire_shape() {
        let value: Value = serde_json::from_str(&ack_frame("msg_1")).unwrap();
        assert_eq!(
            value,
            json!({"type": "acknowledgement", "payload": {"message_id": "msg_1"}})
        );
        assert!(value.get("id").is_none());
    }

    #[test]
    fn decodes_assistant_message() {
        let frame = json!({
            "id": "msg_9",
            "type": "assistant_message",
            "payload": {"job_id": "j_1", "processed_message_id": "pm_1", "message": "done"}
        })
        .to_string();
        let (envelope, message) = decode_frame(&frame).unwrap();
        assert_eq!(envelope.delivery_id(), Some("msg_9"));
        assert_eq!(
            message,
            AgentMessage::AssistantMessage(AssistantMessagePayload {
                job_id: "j_1".into(),
                processed_message_id: "pm_1".into(),
                message: "done".into(),
            })
        );
    }

    #[test]
    fn unknown_type_falls_back_to_catch_all() {
        let frame = r#"{"id":"msg_2","type":"telemetry","payload":{"cpu":3}}"#;
        let (_, message) = decode_frame(frame).unwrap();
        assert_eq!(
            message,
            AgentMessage::Unknown {
                id: Some("msg_2".into()),
                kind: "telemetry".into()
            }
        );
    }

    #[test]
    fn known_type_with_bad_payload_is_rejected() {
        let frame = r#"{"type":"acknowledgement","payload":{}}"#;
        let err = decode_frame(frame).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn missing_payload_defaults_to_null() {
        let (envelope, message) = decode_frame(r#"{"type":"ping"}"#).unwrap();
        assert!(envelope.payload.is_null());
        assert!(envelope.delivery_id().is_none());
        assert!(matches!(message, AgentMessage::Unknown { .. }));
    }

    #[test]
    fn blank_id_is_not_a_delivery_id() {
        let envelope = InboundEnvelope {
            id: Some("  ".into()),
            kind: "x".into(),
            payload: Value::Null,
        };
        assert!(envelope.delivery_id().is_none());
    }

    #[test]
    fn delivery_id_keeps_surrounding_whitespace() {
        let envelope = InboundEnvelope {
            id: Some(" msg_1 ".into()),
            kind: "x".into(),
            payload: Value::Null,
        };
        assert_eq!(envelope.delivery_id(), Some(" msg_1 "));
    }
}
