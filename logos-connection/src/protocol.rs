//! Wire envelope for the lifecycle events the server pushes.
//!
//! Text frames carry JSON:
//! ```text
//! {"event": "joinProjectResponse", "data": {"protocolVersion": 2, "publicId": "P.abc"}}
//! {"event": "connectionRejected",  "data": {"message": "retry"}}
//! {"event": "reconnectGracefully"}
//! {"event": "forceDisconnect",     "data": {"delaySeconds": 10, "reason": "maintenance"}}
//! ```
//!
//! Anything else on the socket belongs to the editing protocol and is not
//! interpreted here.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::TransportEvent;

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Missing payload for '{0}'")]
    MissingPayload(&'static str),
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinProjectResponse {
    protocol_version: u32,
    public_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConnectionRejected {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForceDisconnect {
    #[serde(default)]
    delay_seconds: u64,
    #[serde(default)]
    reason: Option<String>,
}

/// Lifecycle messages understood by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    JoinProjectResponse {
        protocol_version: u32,
        public_id: String,
    },
    ConnectionRejected {
        message: String,
    },
    ReconnectGracefully,
    ForceDisconnect {
        delay_secs: u64,
        reason: Option<String>,
    },
}

impl ServerMessage {
    /// Decode a text frame. `Ok(None)` for events outside the lifecycle set.
    pub fn decode(text: &str) -> Result<Option<Self>, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let msg = match envelope.event.as_str() {
            "joinProjectResponse" => {
                let data = envelope
                    .data
                    .ok_or(ProtocolError::MissingPayload("joinProjectResponse"))?;
                let body: JoinProjectResponse = serde_json::from_value(data)?;
                ServerMessage::JoinProjectResponse {
                    protocol_version: body.protocol_version,
                    public_id: body.public_id,
                }
            }
            "connectionRejected" => {
                let body = match envelope.data {
                    Some(data) => serde_json::from_value(data)?,
                    None => ConnectionRejected { message: String::new() },
                };
                ServerMessage::ConnectionRejected { message: body.message }
            }
            "reconnectGracefully" => ServerMessage::ReconnectGracefully,
            "forceDisconnect" => {
                let body: ForceDisconnect = match envelope.data {
                    Some(data) => serde_json::from_value(data)?,
                    None => ForceDisconnect::default(),
                };
                ServerMessage::ForceDisconnect {
                    delay_secs: body.delay_seconds,
                    reason: body.reason,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }

    /// Encode as a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let (event, data) = match self {
            ServerMessage::JoinProjectResponse {
                protocol_version,
                public_id,
            } => (
                "joinProjectResponse",
                Some(serde_json::to_value(JoinProjectResponse {
                    protocol_version: *protocol_version,
                    public_id: public_id.clone(),
                })?),
            ),
            ServerMessage::ConnectionRejected { message } => (
                "connectionRejected",
                Some(serde_json::to_value(ConnectionRejected {
                    message: message.clone(),
                })?),
            ),
            ServerMessage::ReconnectGracefully => ("reconnectGracefully", None),
            ServerMessage::ForceDisconnect { delay_secs, reason } => (
                "forceDisconnect",
                Some(serde_json::to_value(ForceDisconnect {
                    delay_seconds: *delay_secs,
                    reason: reason.clone(),
                })?),
            ),
        };
        let envelope = Envelope {
            event: event.to_string(),
            data,
        };
        Ok(serde_json::to_string(&envelope)?)
    }
}

impl From<ServerMessage> for TransportEvent {
    fn from(msg: ServerMessage) -> Self {
        match msg {
            ServerMessage::JoinProjectResponse {
                protocol_version,
                public_id,
            } => TransportEvent::JoinProjectResponse {
                protocol_version,
                public_id,
            },
            ServerMessage::ConnectionRejected { message } => {
                TransportEvent::ConnectionRejected { message }
            }
            ServerMessage::ReconnectGracefully => TransportEvent::ReconnectGracefully,
            ServerMessage::ForceDisconnect { delay_secs, reason } => {
                TransportEvent::ForceDisconnect { delay_secs, reason }
            }
        }
    }
}
