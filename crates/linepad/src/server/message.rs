//! Wire envelopes exchanged between the server and its participants.
//!
//! Every unit on the wire is a JSON object of the form
//! `{"packet_type": ..., "data": ...}` followed by a single `\n`. The one
//! exception is the first unit a client sends, which is a bare `{"name": ...}`.
//!
//! Decoding happens once, here, into the closed [`Envelope`] type. Callers
//! match on the variant instead of poking at string fields.

use crate::document::{Operation, Position, WireOperation};
use crate::error::{HandshakeError, ProtocolError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terminates every unit on the wire.
pub const SEPARATOR: u8 = b'\n';

/// A decoded wire unit.
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    /// Server notices: handshake results and shutdown.
    Message(Notice),
    /// Presence changes (join/leave).
    UserEvent(UserEvent),
    /// A document edit, kept alongside the payload the sender wrote.
    Operation(OperationMessage),
    /// A cursor movement.
    Update(CursorUpdate),
    /// Any `packet_type` this server does not know. Kept verbatim.
    Unknown { packet_type: String, data: Value },
}

/// The `packet_type` of an envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvelopeKind {
    Message,
    UserEvent,
    Operation,
    Update,
    Unknown,
}

#[derive(Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    packet_type: String,
    #[serde(default)]
    data: Value,
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Message(_) => EnvelopeKind::Message,
            Envelope::UserEvent(_) => EnvelopeKind::UserEvent,
            Envelope::Operation(_) => EnvelopeKind::Operation,
            Envelope::Update(_) => EnvelopeKind::Update,
            Envelope::Unknown { .. } => EnvelopeKind::Unknown,
        }
    }

    /// Decode one unit (without its separator).
    ///
    /// Unrecognized `packet_type` values decode to [`Envelope::Unknown`];
    /// a recognized type with a bad payload is a `MalformedMessage`.
    pub fn decode(unit: &[u8]) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_slice(unit)?;
        let envelope = match raw.packet_type.as_str() {
            "message" => Envelope::Message(serde_json::from_value(raw.data)?),
            "user_event" => Envelope::UserEvent(serde_json::from_value(raw.data)?),
            "operation" => Envelope::Operation(OperationMessage::from_data(raw.data)?),
            "update" => Envelope::Update(serde_json::from_value(raw.data)?),
            _ => Envelope::Unknown {
                packet_type: raw.packet_type,
                data: raw.data,
            },
        };
        Ok(envelope)
    }

    /// Serialize to a JSON string, without the separator.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let (packet_type, data) = match self {
            Envelope::Message(notice) => ("message", serde_json::to_value(notice)?),
            Envelope::UserEvent(event) => ("user_event", serde_json::to_value(event)?),
            Envelope::Operation(message) => ("operation", message.data.clone()),
            Envelope::Update(update) => ("update", serde_json::to_value(update)?),
            Envelope::Unknown { packet_type, data } => (packet_type.as_str(), data.clone()),
        };
        let raw = RawEnvelope {
            packet_type: packet_type.to_string(),
            data,
        };
        Ok(serde_json::to_string(&raw)?)
    }

    /// Serialize to a ready-to-send frame, separator included.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut frame = self.to_json()?.into_bytes();
        frame.push(SEPARATOR);
        Ok(Bytes::from(frame))
    }

    /// Presence event announcing a new participant.
    pub fn user_connected(name: &str, color: &str, cursor: Position) -> Self {
        Envelope::UserEvent(UserEvent {
            event: PresenceEvent::UserConnected,
            user: Collaborator {
                name: name.to_string(),
                color: Some(color.to_string()),
                cursor: Some(cursor),
            },
        })
    }

    /// Presence event announcing a departure.
    pub fn user_disconnected(name: &str) -> Self {
        Envelope::UserEvent(UserEvent {
            event: PresenceEvent::UserDisconnected,
            user: Collaborator {
                name: name.to_string(),
                color: None,
                cursor: None,
            },
        })
    }

    /// Cursor movement relayed to peers, attributed to `name`.
    pub fn cursor_moved(name: &str, cursor: Position) -> Self {
        Envelope::Update(CursorUpdate {
            name: Some(name.to_string()),
            cursor,
        })
    }
}

/// Payload of `operation` envelopes.
///
/// Peers receive the payload exactly as the sender wrote it, so fields the
/// server does not interpret (the deleted `character`, for one) survive the
/// relay.
#[derive(Clone, Debug, PartialEq)]
pub struct OperationMessage {
    pub operation: Operation,
    /// Target document; `None` means the server's shared document.
    pub filename: Option<String>,
    data: Value,
}

impl OperationMessage {
    pub fn from_data(data: Value) -> Result<Self, ProtocolError> {
        let mut wire = WireOperation::deserialize(&data)?;
        let filename = wire.filename.take();
        let operation = Operation::try_from(wire)?;
        Ok(Self {
            operation,
            filename,
            data,
        })
    }

    /// The payload as received.
    pub fn data(&self) -> &Value {
        &self.data
    }
}

/// Payload of `message` envelopes, tagged by `message_type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum Notice {
    /// Handshake accepted. Carries everything a client needs to render.
    ConnectSuccess {
        color: String,
        buffer: Vec<String>,
        collaborators: Vec<Collaborator>,
    },
    /// Handshake refused: empty or missing name.
    ErrorNewnameInvalid {
        #[serde(default)]
        message: String,
    },
    /// Handshake refused: name in use.
    ErrorNewnameTaken {
        #[serde(default)]
        message: String,
    },
    /// The server is going away.
    ServerShutdown {
        #[serde(default)]
        message: String,
    },
}

impl Notice {
    pub fn server_shutdown() -> Self {
        Notice::ServerShutdown {
            message: "Server is shutting down. Disconnecting...".to_string(),
        }
    }
}

impl From<&HandshakeError> for Notice {
    fn from(e: &HandshakeError) -> Self {
        match e {
            HandshakeError::Invalid => Notice::ErrorNewnameInvalid {
                message: "Username cannot be empty.".to_string(),
            },
            HandshakeError::Taken { .. } => Notice::ErrorNewnameTaken {
                message: "Username already taken. Choose another one.".to_string(),
            },
        }
    }
}

/// A participant as seen by the others.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Position>,
}

/// Payload of `user_event` envelopes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEvent {
    pub event: PresenceEvent,
    pub user: Collaborator,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceEvent {
    UserConnected,
    UserDisconnected,
}

/// Payload of `update` envelopes.
///
/// Clients send only `cursor`; relayed copies name the participant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorUpdate {
    #[serde(default, alias = "user", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub cursor: Position,
}

/// Extract the requested display name from a client's first unit.
///
/// Accepts the bare `{"name": ...}` form and, for older clients, a
/// `message` envelope whose data carries `name`.
pub fn decode_handshake(unit: &[u8]) -> Result<String, HandshakeError> {
    let value: Value = serde_json::from_slice(unit).map_err(|_| HandshakeError::Invalid)?;
    let name = value
        .get("name")
        .or_else(|| value.get("data").and_then(|data| data.get("name")))
        .and_then(Value::as_str)
        .unwrap_or_default();

    if name.is_empty() {
        return Err(HandshakeError::Invalid);
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_str(s: &str) -> Result<Envelope, ProtocolError> {
        Envelope::decode(s.as_bytes())
    }

    fn operation(data: Value) -> Envelope {
        Envelope::Operation(OperationMessage::from_data(data).unwrap())
    }

    #[test]
    fn test_decode_operation() {
        let env = decode_str(
            r#"{"packet_type":"operation",
                "data":{"type":"insert","position":{"x":0,"y":0},"character":"h"}}"#,
        )
        .unwrap();
        assert_eq!(env.kind(), EnvelopeKind::Operation);
        match env {
            Envelope::Operation(message) => {
                assert_eq!(message.operation, Operation::Insert { x: 0, y: 0, ch: 'h' });
                assert_eq!(message.filename, None);
            }
            other => panic!("Wrong envelope: {other:?}"),
        }
    }

    #[test]
    fn test_operation_payload_is_relayed_verbatim() {
        let data = json!({
            "type": "delete",
            "position": {"x": 0, "y": 0},
            "character": "q",
            "filename": "notes.txt",
        });
        let env = operation(data.clone());
        match &env {
            Envelope::Operation(message) => {
                assert_eq!(message.operation, Operation::Delete { x: 0, y: 0 });
                assert_eq!(message.filename.as_deref(), Some("notes.txt"));
            }
            other => panic!("Wrong envelope: {other:?}"),
        }

        let relayed: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(relayed, json!({"packet_type": "operation", "data": data}));
    }

    #[test]
    fn test_decode_update_accepts_user_alias() {
        let unit = r#"{"packet_type":"update","data":{"user":"bob","cursor":{"x":1,"y":2}}}"#;
        let env = decode_str(unit).unwrap();
        assert_eq!(env, Envelope::cursor_moved("bob", Position::new(1, 2)));

        let bare =
            decode_str(r#"{"packet_type":"update","data":{"cursor":{"x":4,"y":0}}}"#).unwrap();
        match bare {
            Envelope::Update(update) => {
                assert_eq!(update.name, None);
                assert_eq!(update.cursor, Position::new(4, 0));
            }
            other => panic!("Wrong envelope: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_packet_type_is_not_an_error() {
        let env = decode_str(r#"{"packet_type":"telemetry","data":{"a":1}}"#).unwrap();
        assert_eq!(env.kind(), EnvelopeKind::Unknown);

        let json = env.to_json().unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, json!({"packet_type": "telemetry", "data": {"a": 1}}));

        let missing = decode_str(r#"{"data":{}}"#).unwrap();
        assert_eq!(missing.kind(), EnvelopeKind::Unknown);
    }

    #[test]
    fn test_malformed_payloads() {
        let cases = [
            "not json",
            r#"{"packet_type":"operation","data":{"type":"insert"}}"#,
            r#"{"packet_type":"operation","data":{"type":"teleport","position":{"x":0,"y":0}}}"#,
            r#"{"packet_type":"operation","data":{"type":"delete","position":{"x":"a","y":0}}}"#,
            r#"{"packet_type":"update","data":{}}"#,
            r#"{"packet_type":"user_event","data":{"event":"user_connected"}}"#,
        ];
        for case in cases {
            let err = decode_str(case).unwrap_err();
            assert!(err.is_recoverable(), "{case}");
        }
    }

    #[test]
    fn test_connect_success_shape() {
        let env = Envelope::Message(Notice::ConnectSuccess {
            color: "#FF5733".to_string(),
            buffer: vec!["hi".to_string()],
            collaborators: vec![Collaborator {
                name: "bob".to_string(),
                color: Some("#33FF57".to_string()),
                cursor: Some(Position::new(1, 0)),
            }],
        });

        let value: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "packet_type": "message",
                "data": {
                    "message_type": "connect_success",
                    "color": "#FF5733",
                    "buffer": ["hi"],
                    "collaborators": [
                        {"name": "bob", "color": "#33FF57", "cursor": {"x": 1, "y": 0}}
                    ]
                }
            })
        );
    }

    #[test]
    fn test_encode_appends_single_separator() {
        let frame = Envelope::user_disconnected("alice").encode().unwrap();
        assert_eq!(frame.last(), Some(&SEPARATOR));
        assert_eq!(frame.iter().filter(|&&b| b == SEPARATOR).count(), 1);

        let value: Value = serde_json::from_slice(&frame[..frame.len() - 1]).unwrap();
        assert_eq!(
            value,
            json!({
                "packet_type": "user_event",
                "data": {"event": "user_disconnected", "user": {"name": "alice"}},
            })
        );
    }

    #[test]
    fn test_encode_is_lossless_for_relayed_envelopes() {
        let envelopes = [
            operation(json!({
                "type": "insert_newline",
                "position": {"x": 2, "y": 3},
                "character": "\n",
            })),
            operation(json!({"type": "delete", "position": {"x": 0, "y": 1}})),
            Envelope::cursor_moved("carol", Position::new(5, 6)),
            Envelope::user_connected("carol", "#3357FF", Position::default()),
            Envelope::Message(Notice::server_shutdown()),
        ];
        for env in envelopes {
            let json = env.to_json().unwrap();
            assert_eq!(decode_str(&json).unwrap(), env);
        }
    }

    #[test]
    fn test_handshake_forms() {
        assert_eq!(decode_handshake(br#"{"name":"alice"}"#), Ok("alice".to_string()));
        assert_eq!(
            decode_handshake(br#"{"packet_type":"message","data":{"name":"bob"}}"#),
            Ok("bob".to_string())
        );
        assert_eq!(decode_handshake(br#"{"name":""}"#), Err(HandshakeError::Invalid));
        assert_eq!(decode_handshake(br#"{"name":42}"#), Err(HandshakeError::Invalid));
        assert_eq!(decode_handshake(br#"{}"#), Err(HandshakeError::Invalid));
        assert_eq!(decode_handshake(b"garbage"), Err(HandshakeError::Invalid));
    }

    #[test]
    fn test_handshake_error_notices() {
        let taken = Notice::from(&HandshakeError::Taken {
            name: "alice".to_string(),
        });
        assert!(matches!(taken, Notice::ErrorNewnameTaken { .. }));
        assert!(matches!(
            Notice::from(&HandshakeError::Invalid),
            Notice::ErrorNewnameInvalid { .. }
        ));
    }
}
