//! Wire messages for the control channel.
//!
//! One JSON object per line (see [`crate::transport`]). Discriminated by
//! the `type` field. Unknown types decode into [`Message::Unknown`] instead
//! of failing, per the tagged-dispatch-with-unknown-case design note.
//!
//! serde's derive can't mix an internally-tagged enum with a catch-all
//! variant, so `Message` hand-rolls (de)serialization around a private
//! `Wire` enum that covers only the known types.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello {
        version: String,
        features: Vec<String>,
    },
    HelloResponse {
        version: String,
    },
    Auth {
        token: String,
        version: String,
        client_info: ClientInfo,
    },
    AuthResponse {
        status: Status,
        client_id: Option<String>,
        tenant_id: Option<String>,
        error: Option<String>,
    },
    TunnelInfo {
        tunnel_id: String,
        local_port: u16,
        remote_host: String,
        remote_port: u16,
        tenant_id: Option<String>,
    },
    TunnelResponse {
        status: Status,
        tunnel_id: Option<String>,
        config: Option<Value>,
        error: Option<String>,
    },
    Heartbeat {
        tunnel_id: Option<String>,
        stats: Option<Value>,
    },
    HeartbeatResponse {
        status: Status,
        server_time: String,
    },
    Error {
        code: String,
        message: String,
        details: Option<Value>,
    },
    /// Anything whose `type` isn't recognized. Logged and ignored in Ready,
    /// never fatal unless it was a mandatory response to an outstanding
    /// request (the dispatcher enforces that, not this type).
    Unknown(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Wire {
    Hello {
        version: String,
        features: Vec<String>,
    },
    HelloResponse {
        version: String,
    },
    Auth {
        token: String,
        version: String,
        client_info: ClientInfo,
    },
    AuthResponse {
        status: Status,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        client_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        tenant_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
    },
    TunnelInfo {
        tunnel_id: String,
        local_port: u16,
        remote_host: String,
        remote_port: u16,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        tenant_id: Option<String>,
    },
    TunnelResponse {
        status: Status,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        tunnel_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        config: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
    },
    Heartbeat {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        tunnel_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        stats: Option<Value>,
    },
    HeartbeatResponse {
        status: Status,
        server_time: String,
    },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        details: Option<Value>,
    },
}

impl From<Wire> for Message {
    fn from(w: Wire) -> Self {
        match w {
            Wire::Hello { version, features } => Message::Hello { version, features },
            Wire::HelloResponse { version } => Message::HelloResponse { version },
            Wire::Auth {
                token,
                version,
                client_info,
            } => Message::Auth {
                token,
                version,
                client_info,
            },
            Wire::AuthResponse {
                status,
                client_id,
                tenant_id,
                error,
            } => Message::AuthResponse {
                status,
                client_id,
                tenant_id,
                error,
            },
            Wire::TunnelInfo {
                tunnel_id,
                local_port,
                remote_host,
                remote_port,
                tenant_id,
            } => Message::TunnelInfo {
                tunnel_id,
                local_port,
                remote_host,
                remote_port,
                tenant_id,
            },
            Wire::TunnelResponse {
                status,
                tunnel_id,
                config,
                error,
            } => Message::TunnelResponse {
                status,
                tunnel_id,
                config,
                error,
            },
            Wire::Heartbeat { tunnel_id, stats } => Message::Heartbeat { tunnel_id, stats },
            Wire::HeartbeatResponse {
                status,
                server_time,
            } => Message::HeartbeatResponse {
                status,
                server_time,
            },
            Wire::Error {
                code,
                message,
                details,
            } => Message::Error {
                code,
                message,
                details,
            },
        }
    }
}

/// Converts a known `Message` variant to its wire form. Only called for
/// non-`Unknown` variants (see `Message::serialize`).
fn to_wire(m: &Message) -> Option<Wire> {
    Some(match m.clone() {
        Message::Hello { version, features } => Wire::Hello { version, features },
        Message::HelloResponse { version } => Wire::HelloResponse { version },
        Message::Auth {
            token,
            version,
            client_info,
        } => Wire::Auth {
            token,
            version,
            client_info,
        },
        Message::AuthResponse {
            status,
            client_id,
            tenant_id,
            error,
        } => Wire::AuthResponse {
            status,
            client_id,
            tenant_id,
            error,
        },
        Message::TunnelInfo {
            tunnel_id,
            local_port,
            remote_host,
            remote_port,
            tenant_id,
        } => Wire::TunnelInfo {
            tunnel_id,
            local_port,
            remote_host,
            remote_port,
            tenant_id,
        },
        Message::TunnelResponse {
            status,
            tunnel_id,
            config,
            error,
        } => Wire::TunnelResponse {
            status,
            tunnel_id,
            config,
            error,
        },
        Message::Heartbeat { tunnel_id, stats } => Wire::Heartbeat { tunnel_id, stats },
        Message::HeartbeatResponse {
            status,
            server_time,
        } => Wire::HeartbeatResponse {
            status,
            server_time,
        },
        Message::Error {
            code,
            message,
            details,
        } => Wire::Error {
            code,
            message,
            details,
        },
        Message::Unknown(_) => return None,
    })
}

impl Serialize for Message {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Message::Unknown(value) => value.serialize(serializer),
            known => to_wire(known)
                .expect("non-Unknown variant always converts")
                .serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match serde_json::from_value::<Wire>(value.clone()) {
            Ok(wire) => Ok(Message::from(wire)),
            Err(_) => Ok(Message::Unknown(value)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ClientInfo {
    pub os: String,
    pub version: String,
    #[serde(flatten, default)]
    pub extra: HashMap<String, Value>,
}

impl Message {
    pub fn hello(features: Vec<String>) -> Self {
        Message::Hello {
            version: PROTOCOL_VERSION.to_string(),
            features,
        }
    }

    pub fn heartbeat() -> Self {
        Message::Heartbeat {
            tunnel_id: None,
            stats: None,
        }
    }

    pub fn heartbeat_response_ok(server_time: String) -> Self {
        Message::HeartbeatResponse {
            status: Status::Ok,
            server_time,
        }
    }

    /// The `type` tag as it appears on the wire, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::HelloResponse { .. } => "hello_response",
            Message::Auth { .. } => "auth",
            Message::AuthResponse { .. } => "auth_response",
            Message::TunnelInfo { .. } => "tunnel_info",
            Message::TunnelResponse { .. } => "tunnel_response",
            Message::Heartbeat { .. } => "heartbeat",
            Message::HeartbeatResponse { .. } => "heartbeat_response",
            Message::Error { .. } => "error",
            Message::Unknown(_) => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_round_trips() {
        let m = Message::hello(vec!["tls".into(), "heartbeat".into()]);
        let encoded = serde_json::to_string(&m).unwrap();
        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(m, decoded);
    }

    #[test]
    fn auth_response_round_trips() {
        let m = Message::AuthResponse {
            status: Status::Ok,
            client_id: Some("c-1".into()),
            tenant_id: None,
            error: None,
        };
        let encoded = serde_json::to_string(&m).unwrap();
        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(m, decoded);
        assert!(!encoded.contains("tenant_id"));
    }

    #[test]
    fn unknown_type_is_not_fatal() {
        let decoded: Message = serde_json::from_str(r#"{"type":"future_feature","x":1}"#).unwrap();
        assert!(matches!(decoded, Message::Unknown(_)));
    }

    #[test]
    fn hello_response_rejects_bad_version_at_caller_level() {
        let decoded: Message =
            serde_json::from_str(r#"{"type":"hello_response","version":"2.0"}"#).unwrap();
        match decoded {
            Message::HelloResponse { version } => assert_ne!(version, PROTOCOL_VERSION),
            _ => panic!("expected HelloResponse"),
        }
    }

    #[test]
    fn missing_required_field_is_unknown_not_error() {
        // A malformed "auth_response" (missing status) doesn't match Wire,
        // so it falls back to Unknown rather than failing to parse.
        let decoded: Message =
            serde_json::from_str(r#"{"type":"auth_response","client_id":"c-1"}"#).unwrap();
        assert!(matches!(decoded, Message::Unknown(_)));
    }
}
