//! Text frame codec for the live channel.

use serde_json::{Map, Value, json};

use crate::error::{Result, SyncError};
use crate::model::{Message, MessageId, MessagePatch, ThreadId};

/// Keepalive probe text.
pub const PROBE: &str = "ping";
/// Keepalive reply text.
pub const PROBE_REPLY: &str = "pong";

const TAG_INSERT: &str = "message_insert";
const TAG_UPDATE: &str = "message_update";
const TAG_LEGACY_MESSAGE: &str = "message";

/// Incremental change to a thread.
#[derive(Debug, Clone, PartialEq)]
pub enum ThreadEvent {
    Insert(Message),
    Update(MessagePatch),
}

impl ThreadEvent {
    #[must_use]
    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            Self::Insert(message) => Some(&message.id),
            Self::Update(patch) => patch.id.as_ref(),
        }
    }

    #[must_use]
    pub fn thread_id(&self) -> Option<&ThreadId> {
        match self {
            Self::Insert(message) => message.thread_id.as_ref(),
            Self::Update(patch) => patch.thread_id.as_ref(),
        }
    }
}

/// Decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Remote keepalive probe; answer with [`OutboundFrame::ProbeReply`].
    Probe,
    /// Reply to our probe. Consumed by the keepalive monitor.
    ProbeReply,
    Event(ThreadEvent),
    /// Change notice without a payload; re-fetch the snapshot.
    RefreshRequested { thread_id: Option<ThreadId> },
}

/// Frames written to the live channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Probe,
    ProbeReply,
    UserInput { content: String },
}

impl OutboundFrame {
    pub fn encode(&self) -> Result<String> {
        match self {
            Self::Probe => Ok(PROBE.to_string()),
            Self::ProbeReply => Ok(PROBE_REPLY.to_string()),
            Self::UserInput { content } => Ok(serde_json::to_string(&json!({
                "content": content,
            }))?),
        }
    }
}

/// Decode one inbound text frame.
///
/// Returns `Ok(None)` for well-formed frames of an unknown type.
pub fn decode_frame(text: &str) -> Result<Option<InboundFrame>> {
    let trimmed = text.trim();
    match trimmed {
        PROBE => return Ok(Some(InboundFrame::Probe)),
        PROBE_REPLY => return Ok(Some(InboundFrame::ProbeReply)),
        _ => {}
    }

    let value: Value = serde_json::from_str(trimmed)
        .map_err(|error| SyncError::Decode(format!("invalid JSON frame: {error}")))?;
    let Value::Object(object) = value else {
        return Err(SyncError::Decode("expected JSON object frame".to_string()));
    };

    let tag = object
        .get("type")
        .or_else(|| object.get("event_type"))
        .map(|tag| {
            tag.as_str()
                .ok_or_else(|| SyncError::Decode("frame type must be a string".to_string()))
        })
        .transpose()?;

    match tag {
        Some(PROBE) => Ok(Some(InboundFrame::Probe)),
        Some(PROBE_REPLY) => Ok(Some(InboundFrame::ProbeReply)),
        Some(TAG_INSERT) => {
            let payload = object
                .get("message")
                .cloned()
                .ok_or_else(|| SyncError::Decode("message_insert without message".to_string()))?;
            decode_insert(payload).map(Some)
        }
        Some(TAG_UPDATE) => match object.get("message") {
            Some(payload) if !payload.is_null() => decode_update(payload.clone()).map(Some),
            _ => Ok(Some(InboundFrame::RefreshRequested {
                thread_id: notice_thread_id(&object)?,
            })),
        },
        Some(TAG_LEGACY_MESSAGE) => decode_insert(Value::Object(object)).map(Some),
        Some(_) => Ok(None),
        None if object.contains_key("id") => decode_insert(Value::Object(object)).map(Some),
        None => Err(SyncError::Decode(
            "untagged frame without message id".to_string(),
        )),
    }
}

fn decode_insert(payload: Value) -> Result<InboundFrame> {
    let message: Message = serde_json::from_value(payload)
        .map_err(|error| SyncError::Decode(format!("invalid insert payload: {error}")))?;
    Ok(InboundFrame::Event(ThreadEvent::Insert(message)))
}

fn decode_update(payload: Value) -> Result<InboundFrame> {
    let patch: MessagePatch = serde_json::from_value(payload)
        .map_err(|error| SyncError::Decode(format!("invalid update payload: {error}")))?;
    if patch.id.is_none() {
        return Err(SyncError::Decode("update payload without id".to_string()));
    }
    Ok(InboundFrame::Event(ThreadEvent::Update(patch)))
}

fn notice_thread_id(object: &Map<String, Value>) -> Result<Option<ThreadId>> {
    match object.get("thread_id") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|error| SyncError::Decode(format!("invalid notice thread id: {error}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageRole;

    #[test]
    fn probes_and_replies_decode_from_bare_and_json_forms() -> Result<()> {
        assert_eq!(decode_frame("ping")?, Some(InboundFrame::Probe));
        assert_eq!(decode_frame(" pong\n")?, Some(InboundFrame::ProbeReply));
        assert_eq!(
            decode_frame(r#"{"type":"pong"}"#)?,
            Some(InboundFrame::ProbeReply)
        );
        Ok(())
    }

    #[test]
    fn tagged_insert_and_update_envelopes() -> Result<()> {
        let insert = decode_frame(
            r#"{"type":"message_insert","message":{"id":1,"role":"user","content":"hi"}}"#,
        )?;
        let Some(InboundFrame::Event(ThreadEvent::Insert(message))) = insert else {
            return Err(SyncError::Decode(format!("unexpected frame: {insert:?}")));
        };
        assert_eq!(message.id.as_str(), "1");
        assert_eq!(message.role, MessageRole::User);

        let update = decode_frame(
            r#"{"event_type":"message_update","message":{"id":"1","tool_result":"ok"}}"#,
        )?;
        let Some(InboundFrame::Event(ThreadEvent::Update(patch))) = update else {
            return Err(SyncError::Decode(format!("unexpected frame: {update:?}")));
        };
        assert_eq!(patch.id, Some(MessageId::from("1")));
        assert!(patch.role.is_none());
        Ok(())
    }

    #[test]
    fn legacy_shapes_are_normalised() -> Result<()> {
        assert_eq!(
            decode_frame(r#"{"type":"message_update","thread_id":12}"#)?,
            Some(InboundFrame::RefreshRequested {
                thread_id: Some(ThreadId::from("12"))
            })
        );

        let flat = decode_frame(r#"{"type":"message","id":4,"role":"assistant","content":"x"}"#)?;
        assert!(matches!(
            flat,
            Some(InboundFrame::Event(ThreadEvent::Insert(ref message))) if message.id.as_str() == "4"
        ));

        let bare = decode_frame(r#"{"id":"5","role":"tool","tool_name":"ls"}"#)?;
        assert!(matches!(
            bare,
            Some(InboundFrame::Event(ThreadEvent::Insert(ref message))) if message.tool_name.as_deref() == Some("ls")
        ));
        Ok(())
    }

    #[test]
    fn unknown_types_are_ignored() -> Result<()> {
        assert_eq!(decode_frame(r#"{"type":"typing","thread_id":1}"#)?, None);
        Ok(())
    }

    #[test]
    fn decode_malformed_frames() {
        struct Case {
            name: &'static str,
            input: &'static str,
            expected_error_fragment: &'static str,
        }

        let cases = vec![
            Case {
                name: "not json",
                input: "{oops",
                expected_error_fragment: "invalid JSON frame",
            },
            Case {
                name: "array payload",
                input: r#"["message_insert"]"#,
                expected_error_fragment: "expected JSON object frame",
            },
            Case {
                name: "numeric tag",
                input: r#"{"type":7}"#,
                expected_error_fragment: "frame type must be a string",
            },
            Case {
                name: "insert without message",
                input: r#"{"type":"message_insert"}"#,
                expected_error_fragment: "message_insert without message",
            },
            Case {
                name: "insert with unknown role",
                input: r#"{"type":"message_insert","message":{"id":1,"role":"robot"}}"#,
                expected_error_fragment: "invalid insert payload",
            },
            Case {
                name: "update without id",
                input: r#"{"type":"message_update","message":{"content":"x"}}"#,
                expected_error_fragment: "update payload without id",
            },
            Case {
                name: "untagged without id",
                input: r#"{"content":"x"}"#,
                expected_error_fragment: "untagged frame without message id",
            },
        ];

        for case in cases {
            let result = decode_frame(case.input);
            assert!(result.is_err(), "{}: expected an error", case.name);

            if let Err(error) = result {
                let rendered = error.to_string();
                assert!(
                    rendered.contains(case.expected_error_fragment),
                    "{}: expected error fragment '{}' in '{}'",
                    case.name,
                    case.expected_error_fragment,
                    rendered
                );
            }
        }
    }

    #[test]
    fn outbound_frames_encode_to_wire_text() -> Result<()> {
        assert_eq!(OutboundFrame::Probe.encode()?, "ping");
        assert_eq!(OutboundFrame::ProbeReply.encode()?, "pong");
        assert_eq!(
            OutboundFrame::UserInput {
                content: "hello".to_string()
            }
            .encode()?,
            r#"{"content":"hello"}"#
        );
        Ok(())
    }
}
