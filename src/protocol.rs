//! Bus message protocol.
//!
//! Every frame is a JSON envelope `[topic, payload]`. Routing decodes the
//! envelope first and compares the logical topic; the payload shape depends
//! on the topic:
//!
//! | Topic | Dir | Payload |
//! |---|---|---|
//! | `basalisk.offer` | in | `[token, bytes]` |
//! | `basalisk.gaze` | out | `token` |
//! | `basalisk.reconfigure` | in | `[[add...], [remove...]]` |
//! | `basalisk.invalidate` | out | `service_name` |
//! | `basalisk.status` | in | `token` |
//! | `basalisk.status.reply` | out | `[token, service_name, started_at, {"patterns": [...], "uptime_secs": n}]` |
//! | `basalisk.persist_failed` | out | `[service_name, reason]` |
//!
//! Tokens are arbitrary JSON values echoed back verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DecodeError, TransportError};
use crate::expression::ExpressionSet;

/// Topic names.
pub mod topics {
    /// Inbound scan request.
    pub const SCAN_REQUEST: &str = "basalisk.offer";
    /// Outbound match notification.
    pub const MATCH_FOUND: &str = "basalisk.gaze";
    /// Inbound rule-set change.
    pub const RECONFIGURE: &str = "basalisk.reconfigure";
    /// Outbound broadcast after any successful reconfigure.
    pub const CACHE_INVALIDATE: &str = "basalisk.invalidate";
    /// Inbound liveness/introspection query.
    pub const STATUS_CHECK: &str = "basalisk.status";
    /// Outbound reply to a status query.
    pub const STATUS_RESPONSE: &str = "basalisk.status.reply";
    /// Outbound signal that a reconfigure did not reach disk.
    pub const PERSIST_FAILED: &str = "basalisk.persist_failed";
}

/// Opaque correlation value round-tripped from request to notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestToken(pub Value);

impl RequestToken {
    pub fn new(value: impl Into<Value>) -> Self {
        Self(value.into())
    }
}

/// Scan input: raw bytes, or text for clients that cannot send byte arrays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScanPayload {
    Bytes(Vec<u8>),
    Text(String),
}

impl ScanPayload {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Bytes(b) => b,
            Self::Text(s) => s.as_bytes(),
        }
    }
}

/// Decoded inbound request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Scan {
        token: RequestToken,
        payload: ScanPayload,
    },
    Reconfigure {
        add: ExpressionSet,
        remove: ExpressionSet,
    },
    Status {
        token: RequestToken,
    },
    /// A topic this service does not handle.
    Unknown {
        topic: String,
    },
}

/// Detail map carried in a status response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDetails {
    pub patterns: Vec<String>,
    pub uptime_secs: i64,
}

/// Reply to a status query.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusResponse {
    pub token: RequestToken,
    pub service_name: String,
    pub started_at: DateTime<Utc>,
    pub details: StatusDetails,
}

/// Outbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    MatchFound {
        token: RequestToken,
    },
    CacheInvalidate {
        service_name: String,
    },
    Status(StatusResponse),
    PersistFailed {
        service_name: String,
        reason: String,
    },
}

impl Notification {
    #[must_use]
    pub const fn topic(&self) -> &'static str {
        match self {
            Self::MatchFound { .. } => topics::MATCH_FOUND,
            Self::CacheInvalidate { .. } => topics::CACHE_INVALIDATE,
            Self::Status(_) => topics::STATUS_RESPONSE,
            Self::PersistFailed { .. } => topics::PERSIST_FAILED,
        }
    }

    /// Encodes the notification as a bus frame.
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        let payload = match self {
            Self::MatchFound { token } => serde_json::to_value(token),
            Self::CacheInvalidate { service_name } => serde_json::to_value(service_name),
            Self::Status(s) => serde_json::to_value((&s.token, &s.service_name, s.started_at, &s.details)),
            Self::PersistFailed { service_name, reason } => serde_json::to_value((service_name, reason)),
        };
        let payload = payload.map_err(|e| TransportError::Encode {
            message: e.to_string(),
        })?;
        encode_envelope(self.topic(), payload)
    }

    /// Decodes a frame produced by `encode`.
    ///
    /// # Errors
    /// Malformed envelopes, payloads, or topics that are not notifications.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let (topic, payload) = decode_envelope(raw)?;
        match topic.as_str() {
            topics::MATCH_FOUND => Ok(Self::MatchFound {
                token: payload_as(&topic, payload)?,
            }),
            topics::CACHE_INVALIDATE => Ok(Self::CacheInvalidate {
                service_name: payload_as(&topic, payload)?,
            }),
            topics::STATUS_RESPONSE => {
                let (token, service_name, started_at, details) = payload_as(&topic, payload)?;
                Ok(Self::Status(StatusResponse {
                    token,
                    service_name,
                    started_at,
                    details,
                }))
            }
            topics::PERSIST_FAILED => {
                let (service_name, reason) = payload_as(&topic, payload)?;
                Ok(Self::PersistFailed { service_name, reason })
            }
            _ => Err(DecodeError::Envelope {
                reason: format!("'{topic}' is not a notification topic"),
            }),
        }
    }
}

impl Request {
    /// Decodes an inbound frame. Unknown topics decode to `Request::Unknown`.
    ///
    /// # Errors
    /// Malformed envelope, or a payload that does not fit its topic.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let (topic, payload) = decode_envelope(raw)?;
        match topic.as_str() {
            topics::SCAN_REQUEST => {
                let (token, payload) = payload_as(&topic, payload)?;
                Ok(Self::Scan { token, payload })
            }
            topics::RECONFIGURE => {
                let (add, remove) = payload_as(&topic, payload)?;
                Ok(Self::Reconfigure { add, remove })
            }
            topics::STATUS_CHECK => Ok(Self::Status {
                token: payload_as(&topic, payload)?,
            }),
            _ => Ok(Self::Unknown { topic }),
        }
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        match self {
            Self::Scan { .. } => topics::SCAN_REQUEST,
            Self::Reconfigure { .. } => topics::RECONFIGURE,
            Self::Status { .. } => topics::STATUS_CHECK,
            Self::Unknown { topic } => topic,
        }
    }

    /// Encodes the request as a bus frame (client side).
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        let payload = match self {
            Self::Scan { token, payload } => serde_json::to_value((token, payload)),
            Self::Reconfigure { add, remove } => serde_json::to_value((add, remove)),
            Self::Status { token } => serde_json::to_value(token),
            Self::Unknown { .. } => Ok(Value::Null),
        };
        let payload = payload.map_err(|e| TransportError::Encode {
            message: e.to_string(),
        })?;
        encode_envelope(self.topic(), payload)
    }
}

/// Encodes `[topic, payload]`.
pub fn encode_envelope(topic: &str, payload: Value) -> Result<Vec<u8>, TransportError> {
    serde_json::to_vec(&(topic, payload)).map_err(|e| TransportError::Encode {
        message: e.to_string(),
    })
}

/// Decodes `[topic, payload]`.
pub fn decode_envelope(raw: &[u8]) -> Result<(String, Value), DecodeError> {
    serde_json::from_slice(raw).map_err(|e| DecodeError::Envelope {
        reason: e.to_string(),
    })
}

fn payload_as<T: serde::de::DeserializeOwned>(topic: &str, payload: Value) -> Result<T, DecodeError> {
    serde_json::from_value(payload).map_err(|e| DecodeError::Payload {
        topic: topic.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_scan_with_byte_array() {
        let raw = br#"["basalisk.offer", [42, [120, 102, 111, 111]]]"#;
        let req = Request::decode(raw).unwrap();
        assert_eq!(
            req,
            Request::Scan {
                token: RequestToken::new(42),
                payload: ScanPayload::Bytes(b"xfoo".to_vec()),
            }
        );
    }

    #[test]
    fn test_decode_scan_with_text() {
        let raw = br#"["basalisk.offer", [{"id": "abc"}, "hello"]]"#;
        let Request::Scan { token, payload } = Request::decode(raw).unwrap() else {
            panic!("expected scan request");
        };
        assert_eq!(token.0["id"], "abc");
        assert_eq!(payload.as_bytes(), b"hello");
    }

    #[test]
    fn test_decode_reconfigure() {
        let raw = br#"["basalisk.reconfigure", [["bar"], ["foo"]]]"#;
        let Request::Reconfigure { add, remove } = Request::decode(raw).unwrap() else {
            panic!("expected reconfigure");
        };
        assert_eq!(add.to_strings(), vec!["bar"]);
        assert_eq!(remove.to_strings(), vec!["foo"]);
    }

    #[test]
    fn test_reconfigure_with_empty_expression_is_payload_error() {
        let raw = br#"["basalisk.reconfigure", [[""], []]]"#;
        let err = Request::decode(raw).unwrap_err();
        assert!(matches!(err, DecodeError::Payload { .. }));
    }

    #[test]
    fn test_unknown_topic_is_not_an_error() {
        let raw = br#"["someone.else", {"anything": true}]"#;
        assert_eq!(
            Request::decode(raw).unwrap(),
            Request::Unknown {
                topic: "someone.else".to_string()
            }
        );
    }

    #[test]
    fn test_malformed_envelope() {
        for raw in [&b"not json"[..], b"{}", b"[1, 2]", b"[\"only-topic\"]"] {
            assert!(
                matches!(Request::decode(raw), Err(DecodeError::Envelope { .. })),
                "{:?} should be an envelope error",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn test_scan_payload_shape_error() {
        let raw = br#"["basalisk.offer", 7]"#;
        assert!(matches!(Request::decode(raw), Err(DecodeError::Payload { .. })));
    }

    #[test]
    fn test_match_found_wire_shape() {
        let frame = Notification::MatchFound {
            token: RequestToken::new("t-1"),
        }
        .encode()
        .unwrap();
        assert_eq!(frame, br#"["basalisk.gaze","t-1"]"#);
    }

    #[test]
    fn test_status_response_wire_shape() {
        let started_at = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let note = Notification::Status(StatusResponse {
            token: RequestToken::new(7),
            service_name: "basalisk".to_string(),
            started_at,
            details: StatusDetails {
                patterns: vec!["foo".to_string()],
                uptime_secs: 3,
            },
        });
        let frame = note.encode().unwrap();
        let value: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value[0], "basalisk.status.reply");
        assert_eq!(value[1][0], 7);
        assert_eq!(value[1][1], "basalisk");
        assert_eq!(value[1][3]["patterns"][0], "foo");

        assert_eq!(Notification::decode(&frame).unwrap(), note);
    }

    #[test]
    fn test_request_encode_is_decodable() {
        let req = Request::Reconfigure {
            add: ExpressionSet::from_strs(["a"]).unwrap(),
            remove: ExpressionSet::new(),
        };
        assert_eq!(Request::decode(&req.encode().unwrap()).unwrap(), req);
    }
}
