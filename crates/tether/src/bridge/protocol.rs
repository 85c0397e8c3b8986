//! Wire protocol types for sub-process ↔ parent communication.
//!
//! Every frame on the local channel is one [`Message`] serialized as compact JSON
//! and terminated with `\n`:
//!
//! ```text
//! {"type":0,"topic":"registration","msg_id":"…","timestamp":1700000000000,"sender_id":"…","receiver_id":"main_process","body":{…}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::version::VersionInfo;

/// Receiver used when the identity does not name a parent.
pub const DEFAULT_PARENT_ID: &str = "main_process";

/// Message kinds, serialized as their integer discriminant.
///
/// The numbering is shared with the parent process and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageType {
    Hello = 0,
    HelloAck = 1,
    Heartbeat = 2,
    HeartbeatAck = 3,
    ConfigUpdate = 4,
    Command = 5,
    CommandResponse = 6,
    StatusReport = 7,
    LogMessage = 8,
    ErrorReport = 9,
    Shutdown = 10,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hello => "HELLO",
            Self::HelloAck => "HELLO_ACK",
            Self::Heartbeat => "HEARTBEAT",
            Self::HeartbeatAck => "HEARTBEAT_ACK",
            Self::ConfigUpdate => "CONFIG_UPDATE",
            Self::Command => "COMMAND",
            Self::CommandResponse => "COMMAND_RESPONSE",
            Self::StatusReport => "STATUS_REPORT",
            Self::LogMessage => "LOG_MESSAGE",
            Self::ErrorReport => "ERROR_REPORT",
            Self::Shutdown => "SHUTDOWN",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<MessageType> for u8 {
    fn from(kind: MessageType) -> Self {
        kind as u8
    }
}

/// Raised when a frame carries a message type this build does not know.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown message type {0}")]
pub struct UnknownMessageType(pub u8);

impl TryFrom<u8> for MessageType {
    type Error = UnknownMessageType;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Hello,
            1 => Self::HelloAck,
            2 => Self::Heartbeat,
            3 => Self::HeartbeatAck,
            4 => Self::ConfigUpdate,
            5 => Self::Command,
            6 => Self::CommandResponse,
            7 => Self::StatusReport,
            8 => Self::LogMessage,
            9 => Self::ErrorReport,
            10 => Self::Shutdown,
            other => return Err(UnknownMessageType(other)),
        })
    }
}

/// The wire envelope.
///
/// `id` is assigned by the sender and unique for the lifetime of a connection;
/// only Heartbeat/HeartbeatAck are paired by the protocol itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub topic: String,
    #[serde(rename = "msg_id", default)]
    pub id: String,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub receiver_id: String,
    #[serde(default)]
    pub body: Map<String, Value>,
}

impl Message {
    /// New message with a fresh id and the current timestamp.
    pub fn new(kind: MessageType, topic: impl Into<String>) -> Self {
        Self {
            kind,
            topic: topic.into(),
            id: new_message_id(),
            timestamp: now_millis(),
            sender_id: String::new(),
            receiver_id: String::new(),
            body: Map::new(),
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = sender_id.into();
        self
    }

    pub fn with_receiver(mut self, receiver_id: impl Into<String>) -> Self {
        self.receiver_id = receiver_id.into();
        self
    }

    pub fn with_body(mut self, body: Map<String, Value>) -> Self {
        self.body = body;
        self
    }

    /// Set a single body field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.body.insert(key.into(), value.into());
        self
    }

    /// Body field as a string, if present and a string.
    pub fn body_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    /// Serialize into a single newline-terminated frame.
    pub fn to_frame(&self) -> serde_json::Result<Vec<u8>> {
        let mut frame = serde_json::to_vec(self)?;
        frame.push(b'\n');
        Ok(frame)
    }

    /// Parse one frame. A trailing `\n` (and `\r`) is tolerated.
    pub fn from_frame(frame: &[u8]) -> serde_json::Result<Self> {
        let end = frame
            .iter()
            .rposition(|b| !matches!(b, b'\n' | b'\r'))
            .map_or(0, |i| i + 1);
        serde_json::from_slice(&frame[..end])
    }
}

/// Who this process is, as seen by the parent.
///
/// Replaces any hard-coded sender names: every outbound message built through
/// [`ProcessIdentity::message`] is addressed from `process_id` to `parent_id`.
#[derive(Debug, Clone)]
pub struct ProcessIdentity {
    pub process_id: String,
    pub process_name: String,
    pub version: VersionInfo,
    pub parent_id: String,
}

impl ProcessIdentity {
    pub fn new(process_id: impl Into<String>, process_name: impl Into<String>) -> Self {
        Self {
            process_id: process_id.into(),
            process_name: process_name.into(),
            version: VersionInfo::new(),
            parent_id: DEFAULT_PARENT_ID.to_string(),
        }
    }

    /// Identity with a generated `{prefix}_{uuid}` process id.
    pub fn generated(prefix: &str, process_name: impl Into<String>) -> Self {
        Self::new(format!("{}_{}", prefix, uuid::Uuid::new_v4()), process_name)
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = self.version.with_process(version);
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = parent_id.into();
        self
    }

    /// New message addressed from this process to its parent.
    pub fn message(&self, kind: MessageType, topic: impl Into<String>) -> Message {
        Message::new(kind, topic)
            .with_sender(self.process_id.clone())
            .with_receiver(self.parent_id.clone())
    }

    /// Registration message sent once per successful connect.
    pub fn hello(&self) -> Message {
        self.message(MessageType::Hello, "registration")
            .with_field("version", self.version.process_version())
            .with_field("runtime_version", self.version.runtime)
            .with_field("process_name", self.process_name.clone())
    }

    /// Liveness message; `process_state` is the caller's current snapshot.
    pub fn heartbeat(&self, process_state: &str) -> Message {
        let message = self.message(MessageType::Heartbeat, "heartbeat");
        let timestamp = message.timestamp;
        message
            .with_field("process_state", process_state)
            .with_field("process_name", self.process_name.clone())
            .with_field("timestamp", timestamp)
    }
}

pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
