use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Result payload an agent or dispatcher uses to end a TCP session.
pub const EXIT_RESULT: &str = "EXIT";

/// Messages exchanged over the TCP channel, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Welcome {
        message: String,
    },
    SystemInfo {
        #[serde(default)]
        data: Map<String, Value>,
    },
    Command {
        data: String,
    },
    Result {
        data: String,
    },
    Error {
        data: String,
    },
}

impl Message {
    pub fn welcome(message: impl Into<String>) -> Self {
        Self::Welcome {
            message: message.into(),
        }
    }

    pub fn command(data: impl Into<String>) -> Self {
        Self::Command { data: data.into() }
    }

    pub fn result(data: impl Into<String>) -> Self {
        Self::Result { data: data.into() }
    }

    pub fn error(data: impl Into<String>) -> Self {
        Self::Error { data: data.into() }
    }

    pub fn exit() -> Self {
        Self::result(EXIT_RESULT)
    }

    /// True for a `result` whose data is exactly `EXIT`.
    pub fn is_exit(&self) -> bool {
        matches!(self, Self::Result { data } if data == EXIT_RESULT)
    }

    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

/// A decoded inbound frame.
///
/// Valid JSON that does not match any [`Message`] shape is kept as
/// `Unrecognized` so the dispatcher can answer it instead of the connection
/// being dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(Message),
    Unrecognized(Value),
}

impl Inbound {
    pub fn is_exit(&self) -> bool {
        matches!(self, Self::Message(m) if m.is_exit())
    }
}

/// Decode one frame payload. Only invalid JSON is an error.
pub fn decode_inbound(payload: &[u8]) -> Result<Inbound, serde_json::Error> {
    let value: Value = serde_json::from_slice(payload)?;
    Ok(match Message::deserialize(&value) {
        Ok(message) => Inbound::Message(message),
        Err(_) => Inbound::Unrecognized(value),
    })
}
