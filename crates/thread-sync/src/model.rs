//! Thread and message wire shapes.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Opaque thread identifier. Numeric JSON ids are normalised to strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ThreadId(String);

/// Message identifier, unique within a thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MessageId(String);

macro_rules! opaque_id {
    ($name:ident) => {
        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                deserialize_id(deserializer).map(Self)
            }
        }
    };
}

opaque_id!(ThreadId);
opaque_id!(MessageId);

fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(serde_json::Number),
    }

    let raw = match RawId::deserialize(deserializer)? {
        RawId::Text(text) => text.trim().to_string(),
        RawId::Number(number) => number.to_string(),
    };
    if raw.is_empty() {
        return Err(serde::de::Error::custom("identifier must not be empty"));
    }
    Ok(raw)
}

/// Sender tag of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
    Developer,
    System,
}

impl MessageRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::Developer => "developer",
            Self::System => "system",
        }
    }
}

/// How `content` should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Text,
    Html,
    Media,
}

/// Agent lifecycle tag carried on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    AwaitInput,
    AwaitAiResponse,
    AwaitToolResponse,
    #[serde(other)]
    Unknown,
}

/// Reference to a media item inside structured content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "MediaRefWire")]
pub struct MediaRef {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MediaRefWire {
    Url(String),
    Full {
        url: String,
        #[serde(default)]
        mime_type: Option<String>,
    },
}

impl From<MediaRefWire> for MediaRef {
    fn from(wire: MediaRefWire) -> Self {
        match wire {
            MediaRefWire::Url(url) => Self {
                url,
                mime_type: None,
            },
            MediaRefWire::Full { url, mime_type } => Self { url, mime_type },
        }
    }
}

/// Primary message content: text/HTML, or an ordered list of media references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Media(Vec<MediaRef>),
}

impl MessageContent {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Media(items) => items.is_empty(),
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text.as_str()),
            Self::Media(_) => None,
        }
    }
}

impl From<&str> for MessageContent {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// One message of a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(alias = "sender")]
    pub role: MessageRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_state: Option<AgentState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
    #[serde(
        default,
        deserialize_with = "deserialize_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
}

impl Message {
    pub fn new(id: impl Into<MessageId>, role: MessageRole) -> Self {
        Self {
            id: id.into(),
            role,
            content: None,
            content_type: None,
            tool_name: None,
            tool_args: None,
            tool_result: None,
            tool_call_id: None,
            agent_state: None,
            sequence_number: None,
            created_at: None,
            thread_id: None,
        }
    }

    #[must_use]
    pub fn with_text(mut self, text: &str) -> Self {
        self.content = Some(MessageContent::from(text));
        self
    }

    #[must_use]
    pub fn with_sequence(mut self, sequence_number: u64) -> Self {
        self.sequence_number = Some(sequence_number);
        self
    }

    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.content.as_ref().and_then(MessageContent::as_text)
    }

    /// Field-level merge: present, non-empty patch fields overwrite, everything else stays.
    /// Returns whether anything changed.
    pub fn merge(&mut self, patch: &MessagePatch) -> bool {
        let before = self.clone();

        if let Some(role) = patch.role {
            self.role = role;
        }
        if let Some(content) = patch.content.as_ref().filter(|content| !content.is_empty()) {
            self.content = Some(content.clone());
        }
        if let Some(kind) = patch.content_type {
            self.content_type = Some(kind);
        }
        merge_text(&mut self.tool_name, patch.tool_name.as_ref());
        merge_value(&mut self.tool_args, patch.tool_args.as_ref());
        merge_value(&mut self.tool_result, patch.tool_result.as_ref());
        merge_text(&mut self.tool_call_id, patch.tool_call_id.as_ref());
        if let Some(state) = patch.agent_state {
            self.agent_state = Some(state);
        }
        if let Some(sequence_number) = patch.sequence_number {
            self.sequence_number = Some(sequence_number);
        }
        if let Some(created_at) = patch.created_at {
            self.created_at = Some(created_at);
        }
        if let Some(thread_id) = patch.thread_id.as_ref() {
            self.thread_id = Some(thread_id.clone());
        }

        *self != before
    }
}

fn merge_text(target: &mut Option<String>, incoming: Option<&String>) {
    if let Some(value) = incoming.filter(|value| !value.is_empty()) {
        *target = Some(value.clone());
    }
}

fn merge_value(target: &mut Option<Value>, incoming: Option<&Value>) {
    if let Some(value) = incoming.filter(|value| !is_empty_value(value)) {
        *target = Some(value.clone());
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Partial message carried by an update event. Only `id` is required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePatch {
    pub id: Option<MessageId>,
    #[serde(default, alias = "sender", skip_serializing_if = "Option::is_none")]
    pub role: Option<MessageRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_state: Option<AgentState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
    #[serde(
        default,
        deserialize_with = "deserialize_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
}

impl MessagePatch {
    pub fn new(id: impl Into<MessageId>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Materialise a patch whose base row never arrived. A missing role falls back to
    /// `assistant`; a later update carrying a role overwrites it.
    #[must_use]
    pub fn into_message(self, id: MessageId) -> Message {
        let mut message = Message::new(id, self.role.unwrap_or(MessageRole::Assistant));
        message.merge(&self);
        message
    }
}

impl From<Message> for MessagePatch {
    fn from(message: Message) -> Self {
        Self {
            id: Some(message.id),
            role: Some(message.role),
            content: message.content,
            content_type: message.content_type,
            tool_name: message.tool_name,
            tool_args: message.tool_args,
            tool_result: message.tool_result,
            tool_call_id: message.tool_call_id,
            agent_state: message.agent_state,
            sequence_number: message.sequence_number,
            created_at: message.created_at,
            thread_id: message.thread_id,
        }
    }
}

/// Conversation thread metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    #[serde(default)]
    pub title: String,
    #[serde(
        default,
        deserialize_with = "deserialize_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        deserialize_with = "deserialize_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "is_running")]
    pub running: bool,
}

/// Full, authoritative state of a thread at the time of the fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadSnapshot {
    pub thread: Option<Thread>,
    pub messages: Vec<Message>,
}

impl ThreadSnapshot {
    #[must_use]
    pub fn running(&self) -> bool {
        self.thread.as_ref().is_some_and(|thread| thread.running)
    }
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => parse_timestamp(text)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {text}"))),
    }
}

/// Accepts RFC 3339 and naive ISO-8601 timestamps; naive values are taken as UTC.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}
