use std::io;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{kind:?} envelope is missing `{field}`")]
    MissingField {
        kind: MessageType,
        field: &'static str,
    },
    #[error("ipc channel closed")]
    ChannelClosed,
    #[error("ipc write failed: {0}")]
    Io(#[from] io::Error),
}

/// The three channels every envelope travels on. Closed set.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    /// Controls the supervisor machinery.
    System,
    /// Namespaced traffic for attached daemon services.
    Daemon,
    /// Opaque user payloads. Never changes supervisor state.
    Application,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum SysCall {
    Close,
    Stat,
    Online,
}

/// Flat wire form of a message, one JSON object per line.
///
/// Only the fields relevant to `kind` (and `call` for SYSTEM) are populated;
/// use [`Envelope::payload`] to get the typed view.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub time: f64,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<SysCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SystemCall {
    /// Graceful termination: an order when sent by the primary, a notice when
    /// sent by a segment.
    Close { code: i32, reason: String },
    /// Statistics forwarded upward without interpretation.
    Stat { realm: String, message: Value },
    /// Readiness handshake, first envelope a segment sends.
    Online,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    System(SystemCall),
    Daemon { key: String, message: Value },
    Application(Value),
}

/// Wall-clock milliseconds since the epoch, fractional.
pub fn now_ms() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1000.0
}

impl Envelope {
    /// Stamp `payload` with the current time and this process' pid.
    pub fn new(payload: Payload) -> Self {
        Self::with_sender(payload, now_ms(), std::process::id())
    }

    pub fn with_sender(payload: Payload, time: f64, pid: u32) -> Self {
        let mut envelope = Envelope {
            kind: MessageType::Application,
            time,
            pid,
            call: None,
            code: None,
            reason: None,
            realm: None,
            daemon_key: None,
            message: None,
        };

        match payload {
            Payload::System(call) => {
                envelope.kind = MessageType::System;
                match call {
                    SystemCall::Close { code, reason } => {
                        envelope.call = Some(SysCall::Close);
                        envelope.code = Some(code);
                        envelope.reason = Some(reason);
                    }
                    SystemCall::Stat { realm, message } => {
                        envelope.call = Some(SysCall::Stat);
                        envelope.realm = Some(realm);
                        envelope.message = Some(message);
                    }
                    SystemCall::Online => envelope.call = Some(SysCall::Online),
                }
            }
            Payload::Daemon { key, message } => {
                envelope.kind = MessageType::Daemon;
                envelope.daemon_key = Some(key);
                envelope.message = Some(message);
            }
            Payload::Application(message) => {
                envelope.message = Some(message);
            }
        }

        envelope
    }

    pub fn application(message: Value) -> Self {
        Self::new(Payload::Application(message))
    }

    pub fn daemon(key: impl Into<String>, message: Value) -> Self {
        Self::new(Payload::Daemon {
            key: key.into(),
            message,
        })
    }

    pub fn system(call: SystemCall) -> Self {
        Self::new(Payload::System(call))
    }

    pub fn close(code: i32, reason: impl Into<String>) -> Self {
        Self::system(SystemCall::Close {
            code,
            reason: reason.into(),
        })
    }

    pub fn stat(realm: impl Into<String>, message: Value) -> Self {
        Self::system(SystemCall::Stat {
            realm: realm.into(),
            message,
        })
    }

    pub fn online() -> Self {
        Self::system(SystemCall::Online)
    }

    pub fn is_call(&self, call: SysCall) -> bool {
        self.kind == MessageType::System && self.call == Some(call)
    }

    /// Typed view of the envelope.
    ///
    /// A CLOSE without `code`/`reason` reads as `0`/`""`. A null or absent
    /// `message` reads as `Value::Null`.
    pub fn payload(&self) -> Result<Payload, ProtocolError> {
        let message = || self.message.clone().unwrap_or(Value::Null);

        match self.kind {
            MessageType::System => {
                let call = self.call.ok_or(ProtocolError::MissingField {
                    kind: self.kind,
                    field: "call",
                })?;
                let call = match call {
                    SysCall::Close => SystemCall::Close {
                        code: self.code.unwrap_or(0),
                        reason: self.reason.clone().unwrap_or_default(),
                    },
                    SysCall::Stat => SystemCall::Stat {
                        realm: self.realm.clone().ok_or(ProtocolError::MissingField {
                            kind: self.kind,
                            field: "realm",
                        })?,
                        message: message(),
                    },
                    SysCall::Online => SystemCall::Online,
                };
                Ok(Payload::System(call))
            }
            MessageType::Daemon => Ok(Payload::Daemon {
                key: self
                    .daemon_key
                    .clone()
                    .ok_or(ProtocolError::MissingField {
                        kind: self.kind,
                        field: "daemon_key",
                    })?,
                message: message(),
            }),
            MessageType::Application => Ok(Payload::Application(message())),
        }
    }

    pub fn encode_line(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)? + "\n")
    }

    pub fn decode_line(line: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn close_uses_flat_wire_fields() {
        let envelope = Envelope::with_sender(
            Payload::System(SystemCall::Close {
                code: 3,
                reason: "drain".into(),
            }),
            1.5,
            42,
        );
        let wire: Value = serde_json::from_str(&envelope.encode_line().unwrap()).unwrap();

        assert_eq!(
            wire,
            json!({"type": "SYSTEM", "time": 1.5, "pid": 42, "call": "CLOSE", "code": 3, "reason": "drain"})
        );
    }

    #[test]
    fn every_payload_kind_survives_the_wire() {
        let payloads = vec![
            Payload::System(SystemCall::Close {
                code: 1,
                reason: "bye".into(),
            }),
            Payload::System(SystemCall::Stat {
                realm: "http".into(),
                message: json!({"requests": 12}),
            }),
            Payload::System(SystemCall::Online),
            Payload::Daemon {
                key: "metrics".into(),
                message: json!(["a", 1]),
            },
            Payload::Application(json!({"nested": {"value": true}})),
        ];

        for payload in payloads {
            let sent = Envelope::with_sender(payload.clone(), 1_000.25, 7);
            let received = Envelope::decode_line(&sent.encode_line().unwrap()).unwrap();
            assert_eq!(received, sent);
            assert_eq!(received.payload().unwrap(), payload);
        }
    }

    #[test]
    fn close_defaults_missing_code_and_reason() {
        let envelope = Envelope::decode_line(r#"{"type":"SYSTEM","time":0,"pid":1,"call":"CLOSE"}"#)
            .unwrap();
        assert_eq!(
            envelope.payload().unwrap(),
            Payload::System(SystemCall::Close {
                code: 0,
                reason: String::new()
            })
        );
    }

    #[test]
    fn system_without_call_is_rejected() {
        let envelope = Envelope::decode_line(r#"{"type":"SYSTEM","time":0,"pid":1}"#).unwrap();
        assert!(matches!(
            envelope.payload(),
            Err(ProtocolError::MissingField { field: "call", .. })
        ));
    }

    #[test]
    fn unknown_type_is_malformed() {
        let result = Envelope::decode_line(r#"{"type":"GOSSIP","time":0,"pid":1}"#);
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn new_stamps_current_pid() {
        let envelope = Envelope::application(Value::Null);
        assert_eq!(envelope.pid, std::process::id());
        assert!(envelope.time > 0.0);
        assert_eq!(envelope.payload().unwrap(), Payload::Application(Value::Null));
    }
}
