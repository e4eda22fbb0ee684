use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Sent back (inside a `message` frame) when an inbound frame cannot be understood.
pub const INVALID_FORMAT: &str = "خطأ: تنسيق الرسالة غير صالح";

/// Client → server frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundFrame {
    /// Advisory hello; the server-assigned id stays authoritative.
    Connection { client_id: Option<String> },
    Message { client_id: Option<String>, message: String },
    Pong,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionBody {
    #[serde(default)]
    client_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageBody {
    #[serde(default)]
    client_id: Option<String>,
    /// `null` and a missing field both mean "no text".
    #[serde(default)]
    message: Option<String>,
}

impl InboundFrame {
    /// Parse a text frame, checking the `type` discriminator explicitly.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or(ProtocolError::MissingType)?;

        match kind.as_str() {
            "pong" => Ok(Self::Pong),
            "connection" => {
                let body: ConnectionBody = serde_json::from_value(value).map_err(|e| {
                    ProtocolError::InvalidFields {
                        kind: "connection",
                        reason: e.to_string(),
                    }
                })?;
                Ok(Self::Connection {
                    client_id: body.client_id,
                })
            }
            "message" => {
                let body: MessageBody =
                    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidFields {
                        kind: "message",
                        reason: e.to_string(),
                    })?;
                Ok(Self::Message {
                    client_id: body.client_id,
                    message: body.message.unwrap_or_default(),
                })
            }
            _ => Err(ProtocolError::UnknownType(kind)),
        }
    }
}

/// Server → client frames.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Liveness check; `timestamp` is epoch seconds.
    Ping { timestamp: f64 },
    Message { message: String, timestamp: String },
}

impl OutboundFrame {
    pub fn ping() -> Self {
        Self::Ping {
            timestamp: Utc::now().timestamp_micros() as f64 / 1_000_000.0,
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self::Message {
            message: text.into(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        }
    }
}
