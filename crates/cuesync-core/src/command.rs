//! Control protocol messages
//!
//! Inbound frames carry one object with a `type` tag (`play`, `pause`,
//! `seek`, `heartbeat`) plus `position` and `referenceTime` in milliseconds.
//! Text frames are JSON; binary frames are CBOR, or JSON bytes from servers
//! that do not bother with text frames.
//!
//! Decoding goes through an untyped value first so that every failure maps to
//! a precise [`DecodeError`] and unknown fields are ignored.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::transport::Frame;

/// Protocol version announced in `hello`
pub const PROTOCOL_VERSION: &str = "1";

/// A decoded playback-control command
///
/// Times are server-clock milliseconds, positions are media milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlCommand {
    /// Be playing, at `position` as of `reference_time`
    Play {
        position: i64,
        #[serde(rename = "referenceTime")]
        reference_time: i64,
    },

    /// Be paused at `position` (or wherever the timeline was at `reference_time`)
    Pause {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<i64>,
        #[serde(rename = "referenceTime")]
        reference_time: i64,
    },

    /// Jump to `position`, keeping the current play/pause state
    Seek {
        position: i64,
        #[serde(rename = "referenceTime")]
        reference_time: i64,
    },

    /// Server clock sample
    Heartbeat {
        #[serde(rename = "referenceTime")]
        reference_time: i64,
    },
}

impl ControlCommand {
    /// Server time at which this command's position is valid
    pub fn reference_time(&self) -> i64 {
        match *self {
            ControlCommand::Play { reference_time, .. }
            | ControlCommand::Pause { reference_time, .. }
            | ControlCommand::Seek { reference_time, .. }
            | ControlCommand::Heartbeat { reference_time } => reference_time,
        }
    }

    /// Wire tag of this command
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::Play { .. } => "play",
            ControlCommand::Pause { .. } => "pause",
            ControlCommand::Seek { .. } => "seek",
            ControlCommand::Heartbeat { .. } => "heartbeat",
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, ControlCommand::Heartbeat { .. })
    }

    /// Encode as a JSON text frame payload
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Decode a raw transport frame into a command
pub fn decode(frame: &Frame) -> Result<ControlCommand, DecodeError> {
    let value = match frame {
        Frame::Text(text) => parse_json(text.as_bytes())?,
        Frame::Binary(bytes) => parse_binary(bytes)?,
    };
    decode_value(&value)
}

/// Decode a JSON string (as typed on the command line)
pub fn decode_str(text: &str) -> Result<ControlCommand, DecodeError> {
    decode(&Frame::Text(text.to_string()))
}

fn parse_json(bytes: &[u8]) -> Result<Value, DecodeError> {
    serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))
}

fn parse_binary(bytes: &[u8]) -> Result<Value, DecodeError> {
    let first = bytes.iter().find(|b| !b.is_ascii_whitespace());
    if first == Some(&b'{') {
        return parse_json(bytes);
    }
    ciborium::from_reader(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))
}

fn decode_value(value: &Value) -> Result<ControlCommand, DecodeError> {
    let obj = value.as_object().ok_or(DecodeError::NotAnObject)?;

    let kind = match obj.get("type") {
        None | Some(Value::Null) => return Err(DecodeError::MissingType),
        Some(Value::String(kind)) => kind.as_str(),
        Some(other) => {
            return Err(DecodeError::InvalidField {
                field: "type",
                details: format!("expected a string, got {}", other),
            })
        }
    };

    match kind {
        "play" => Ok(ControlCommand::Play {
            position: required(obj, "play", "position")?,
            reference_time: required(obj, "play", "referenceTime")?,
        }),
        "pause" => Ok(ControlCommand::Pause {
            position: optional(obj, "position")?,
            reference_time: required(obj, "pause", "referenceTime")?,
        }),
        "seek" => Ok(ControlCommand::Seek {
            position: required(obj, "seek", "position")?,
            reference_time: required(obj, "seek", "referenceTime")?,
        }),
        "heartbeat" => Ok(ControlCommand::Heartbeat {
            reference_time: required(obj, "heartbeat", "referenceTime")?,
        }),
        other => Err(DecodeError::UnknownType(other.to_string())),
    }
}

fn required(
    obj: &Map<String, Value>,
    command: &'static str,
    field: &'static str,
) -> Result<i64, DecodeError> {
    optional(obj, field)?.ok_or(DecodeError::MissingField { command, field })
}

fn optional(obj: &Map<String, Value>, field: &'static str) -> Result<Option<i64>, DecodeError> {
    let value = match obj.get(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(value) => value,
    };

    let millis = if let Some(n) = value.as_i64() {
        n
    } else if let Some(f) = value.as_f64() {
        if !f.is_finite() || f.abs() > i64::MAX as f64 {
            return Err(DecodeError::InvalidField {
                field,
                details: format!("{} is out of range", f),
            });
        }
        f.round() as i64
    } else {
        return Err(DecodeError::InvalidField {
            field,
            details: format!("expected milliseconds, got {}", value),
        });
    };

    if millis < 0 {
        return Err(DecodeError::InvalidField {
            field,
            details: format!("{} is negative", millis),
        });
    }

    Ok(Some(millis))
}

/// Why the client asks the server for a full state snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResyncReason {
    /// First connection of the session
    Connected,
    /// Connection was re-established after a drop
    Reconnected,
    /// Clock estimate went stale while following
    Clock,
}

/// Messages sent to the control server
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Sent on every successful connect
    Hello {
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(rename = "protocolVersion")]
        protocol_version: String,
    },

    /// Ask the server to re-send its current playback state
    Resync {
        #[serde(rename = "clientId")]
        client_id: String,
        reason: ResyncReason,
    },

    /// Result of a drift check
    Telemetry {
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(rename = "driftMs")]
        drift_ms: i64,
        #[serde(rename = "offsetMs")]
        offset_ms: f64,
        confidence: f64,
        state: String,
    },
}

impl ClientMessage {
    pub fn hello(client_id: &str) -> Self {
        ClientMessage::Hello {
            client_id: client_id.to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn resync(client_id: &str, reason: ResyncReason) -> Self {
        ClientMessage::Resync {
            client_id: client_id.to_string(),
            reason,
        }
    }

    /// Encode message to JSON bytes
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_play() {
        let cmd = decode_str(r#"{"type":"play","position":1500,"referenceTime":1000}"#).unwrap();
        assert_eq!(
            cmd,
            ControlCommand::Play {
                position: 1500,
                reference_time: 1000
            }
        );
        assert_eq!(cmd.reference_time(), 1000);
        assert_eq!(cmd.name(), "play");
    }

    #[test]
    fn test_decode_pause_without_position() {
        let cmd = decode_str(r#"{"type":"pause","referenceTime":42}"#).unwrap();
        assert_eq!(
            cmd,
            ControlCommand::Pause {
                position: None,
                reference_time: 42
            }
        );
    }

    #[test]
    fn test_decode_rounds_fractional_millis() {
        let cmd = decode_str(r#"{"type":"seek","position":1200.6,"referenceTime":7.0}"#).unwrap();
        assert_eq!(
            cmd,
            ControlCommand::Seek {
                position: 1201,
                reference_time: 7
            }
        );
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let cmd = decode_str(
            r#"{"type":"heartbeat","referenceTime":5,"serverName":"edge-1","extra":{"a":1}}"#,
        )
        .unwrap();
        assert!(cmd.is_heartbeat());
    }

    #[test]
    fn test_malformed_json() {
        let err = decode_str(r#"{"type":"play","#).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_not_an_object() {
        assert_eq!(decode_str("[1,2,3]").unwrap_err(), DecodeError::NotAnObject);
    }

    #[test]
    fn test_missing_and_unknown_type() {
        assert_eq!(
            decode_str(r#"{"position":1}"#).unwrap_err(),
            DecodeError::MissingType
        );
        assert_eq!(
            decode_str(r#"{"type":"rewind","referenceTime":1}"#).unwrap_err(),
            DecodeError::UnknownType("rewind".to_string())
        );
    }

    #[test]
    fn test_missing_required_field() {
        assert_eq!(
            decode_str(r#"{"type":"seek","referenceTime":1}"#).unwrap_err(),
            DecodeError::MissingField {
                command: "seek",
                field: "position"
            }
        );
        assert_eq!(
            decode_str(r#"{"type":"play","position":0}"#).unwrap_err(),
            DecodeError::MissingField {
                command: "play",
                field: "referenceTime"
            }
        );
    }

    #[test]
    fn test_invalid_field_values() {
        let err = decode_str(r#"{"type":"seek","position":"soon","referenceTime":1}"#).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidField { field: "position", .. }));

        let err = decode_str(r#"{"type":"seek","position":-5,"referenceTime":1}"#).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidField { field: "position", .. }));

        let err = decode_str(r#"{"type":7,"referenceTime":1}"#).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidField { field: "type", .. }));
    }

    #[test]
    fn test_decode_cbor_binary_frame() {
        let value = serde_json::json!({"type": "seek", "position": 90_000, "referenceTime": 12});
        let mut bytes = Vec::new();
        ciborium::into_writer(&value, &mut bytes).unwrap();

        let cmd = decode(&Frame::Binary(bytes)).unwrap();
        assert_eq!(
            cmd,
            ControlCommand::Seek {
                position: 90_000,
                reference_time: 12
            }
        );
    }

    #[test]
    fn test_decode_json_in_binary_frame() {
        let bytes = br#" {"type":"heartbeat","referenceTime":99}"#.to_vec();
        let cmd = decode(&Frame::Binary(bytes)).unwrap();
        assert_eq!(cmd, ControlCommand::Heartbeat { reference_time: 99 });
    }

    #[test]
    fn test_garbage_binary_frame() {
        let err = decode(&Frame::Binary(vec![0xff, 0x00, 0x13])).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Malformed(_) | DecodeError::NotAnObject
        ));
    }

    #[test]
    fn test_command_json_decodes_back() {
        let cmd = ControlCommand::Pause {
            position: Some(3_000),
            reference_time: 10,
        };
        let json = cmd.to_json().unwrap();
        assert!(json.contains(r#""referenceTime":10"#));
        assert_eq!(decode_str(&json).unwrap(), cmd);
    }

    #[test]
    fn test_client_message_encoding() {
        let bytes = ClientMessage::resync("cuesync-1234", ResyncReason::Reconnected)
            .encode()
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "resync");
        assert_eq!(value["clientId"], "cuesync-1234");
        assert_eq!(value["reason"], "reconnected");

        let bytes = ClientMessage::hello("cuesync-1234").encode().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "hello");
        assert_eq!(value["protocolVersion"], PROTOCOL_VERSION);
    }
}
