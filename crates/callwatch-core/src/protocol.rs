//! Push-channel wire format: Socket.IO v5 packets carried in Engine.IO v4
//! text frames over a websocket.
//!
//! Only what the call channel needs is modelled: the Engine.IO handshake and
//! heartbeat, Socket.IO connect/disconnect/event/ack packets on any namespace,
//! and the two client commands plus the `escalation` server event. Binary
//! attachments are rejected.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::types::{BusinessId, CallId, EscalationPayload};

/// Query string selecting Engine.IO v4 over a raw websocket.
pub const ENGINE_QUERY: &str = "EIO=4&transport=websocket";

/// Frame sent in answer to an Engine.IO ping without payload.
pub const PONG: &str = "3";

const DEFAULT_NAMESPACE: &str = "/";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,

    #[error("unknown engine.io packet type {0:?}")]
    UnknownEngineType(char),

    #[error("unknown socket.io packet type {0:?}")]
    UnknownSocketType(char),

    #[error("binary socket.io packets are not supported")]
    BinaryUnsupported,

    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },

    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Engine.IO `open` packet body.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// Milliseconds between server pings.
    pub ping_interval: u64,
    /// Milliseconds the server waits for a pong.
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

impl Handshake {
    /// How long the client may go without a ping before the link is dead.
    pub fn liveness_window_ms(&self) -> u64 {
        self.ping_interval.saturating_add(self.ping_timeout)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(Handshake),
    Close,
    Ping(String),
    Pong(String),
    Message(SocketPacket),
    Upgrade,
    Noop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect {
        namespace: String,
        data: Option<Value>,
    },
    Disconnect {
        namespace: String,
    },
    Event {
        namespace: String,
        ack_id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    Ack {
        namespace: String,
        ack_id: u64,
        args: Vec<Value>,
    },
    ConnectError {
        namespace: String,
        message: String,
    },
}

/// Decode one websocket text frame.
pub fn decode_frame(frame: &str) -> Result<EnginePacket, ProtocolError> {
    let mut chars = frame.chars();
    let kind = chars.next().ok_or(ProtocolError::Empty)?;
    let body = chars.as_str();

    match kind {
        '0' => Ok(EnginePacket::Open(serde_json::from_str(body)?)),
        '1' => Ok(EnginePacket::Close),
        '2' => Ok(EnginePacket::Ping(body.to_string())),
        '3' => Ok(EnginePacket::Pong(body.to_string())),
        '4' => Ok(EnginePacket::Message(decode_socket_packet(body)?)),
        '5' => Ok(EnginePacket::Upgrade),
        '6' => Ok(EnginePacket::Noop),
        other => Err(ProtocolError::UnknownEngineType(other)),
    }
}

fn decode_socket_packet(packet: &str) -> Result<SocketPacket, ProtocolError> {
    let mut chars = packet.chars();
    let kind = chars.next().ok_or(ProtocolError::Empty)?;
    let rest = chars.as_str();

    if kind == '5' || kind == '6' {
        return Err(ProtocolError::BinaryUnsupported);
    }

    let (namespace, rest) = split_namespace(rest);
    let digits = rest.chars().take_while(char::is_ascii_digit).count();
    let (ack_digits, payload) = rest.split_at(digits);
    let ack_id = if ack_digits.is_empty() {
        None
    } else {
        Some(ack_digits.parse::<u64>().map_err(|e| ProtocolError::Malformed {
            what: "ack id",
            detail: e.to_string(),
        })?)
    };

    match kind {
        '0' => Ok(SocketPacket::Connect {
            namespace,
            data: parse_optional_json(payload)?,
        }),
        '1' => Ok(SocketPacket::Disconnect { namespace }),
        '2' => {
            let (name, args) = split_event_array(payload)?;
            Ok(SocketPacket::Event {
                namespace,
                ack_id,
                name,
                args,
            })
        }
        '3' => {
            let ack_id = ack_id.ok_or_else(|| ProtocolError::Malformed {
                what: "ack",
                detail: "missing ack id".into(),
            })?;
            let args = match parse_optional_json(payload)? {
                Some(Value::Array(items)) => items,
                Some(other) => vec![other],
                None => Vec::new(),
            };
            Ok(SocketPacket::Ack {
                namespace,
                ack_id,
                args,
            })
        }
        '4' => {
            let message = match parse_optional_json(payload)? {
                Some(Value::Object(map)) => map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("connection refused")
                    .to_string(),
                Some(Value::String(s)) => s,
                _ => "connection refused".to_string(),
            };
            Ok(SocketPacket::ConnectError { namespace, message })
        }
        other => Err(ProtocolError::UnknownSocketType(other)),
    }
}

fn split_namespace(rest: &str) -> (String, &str) {
    if rest.starts_with('/') {
        match rest.split_once(',') {
            Some((ns, tail)) => (ns.to_string(), tail),
            None => (rest.to_string(), ""),
        }
    } else {
        (DEFAULT_NAMESPACE.to_string(), rest)
    }
}

fn parse_optional_json(payload: &str) -> Result<Option<Value>, ProtocolError> {
    if payload.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(payload)?))
}

fn split_event_array(payload: &str) -> Result<(String, Vec<Value>), ProtocolError> {
    let mut items = match serde_json::from_str::<Value>(payload)? {
        Value::Array(items) => items,
        _ => {
            return Err(ProtocolError::Malformed {
                what: "event",
                detail: "payload is not an array".into(),
            });
        }
    };
    if items.is_empty() {
        return Err(ProtocolError::Malformed {
            what: "event",
            detail: "missing event name".into(),
        });
    }
    let name = match items.remove(0) {
        Value::String(s) => s,
        other => {
            return Err(ProtocolError::Malformed {
                what: "event",
                detail: format!("event name is not a string: {other}"),
            });
        }
    };
    Ok((name, items))
}

/// Socket.IO CONNECT on the default namespace, carrying the auth object.
pub fn encode_connect(auth: &Value) -> String {
    format!("40{auth}")
}

/// Socket.IO EVENT on the default namespace, without an ack id.
pub fn encode_event(name: &str, payload: &Value) -> String {
    let array = Value::Array(vec![Value::String(name.to_string()), payload.clone()]);
    format!("42{array}")
}

/// Answer to an Engine.IO ping, echoing any probe payload.
pub fn encode_pong(data: &str) -> String {
    format!("{PONG}{data}")
}

/// Auth object sent with the Socket.IO CONNECT packet.
pub fn connect_auth(token: &str) -> Value {
    serde_json::json!({ "token": token })
}

/// Client-to-server commands on the call channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    JoinBusiness {
        business_id: BusinessId,
    },
    RequestTakeover {
        call_id: CallId,
        phone_number: String,
    },
}

impl ClientCommand {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::JoinBusiness { .. } => "join_business",
            Self::RequestTakeover { .. } => "request_takeover",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::JoinBusiness { business_id } => {
                serde_json::json!({ "business_id": business_id.as_str() })
            }
            Self::RequestTakeover {
                call_id,
                phone_number,
            } => serde_json::json!({
                "call_id": call_id.as_str(),
                "phone_number": phone_number,
            }),
        }
    }

    /// Full websocket frame for this command.
    pub fn encode(&self) -> String {
        encode_event(self.event_name(), &self.payload())
    }
}

/// Server-to-client events on the call channel.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Escalation(EscalationPayload),
    Other { name: String },
}

impl ServerEvent {
    pub fn from_event(name: &str, args: &[Value]) -> Result<Self, ProtocolError> {
        match name {
            "escalation" => {
                let payload = match args.first() {
                    Some(value) => serde_json::from_value(value.clone())?,
                    None => EscalationPayload::default(),
                };
                Ok(Self::Escalation(payload))
            }
            other => Ok(Self::Other {
                name: other.to_string(),
            }),
        }
    }
}
