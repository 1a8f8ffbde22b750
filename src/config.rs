//! Core configuration data model (`ClientConfig`).
//!
//! This type is immutable once built and is the only configuration input
//! the core consumes — loading it from a file, environment, or CLI flags
//! is the binary crate's job (`src/bin/relay_tunnel.rs`), not the core's.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub relay: RelayConfig,
    pub tls: TlsConfig,
    pub auth: AuthConfig,
    pub retry: RetryConfig,
    pub heartbeat: HeartbeatConfig,
    pub limits: LimitsConfig,
    /// Default bind address for tunnel listeners when a tunnel doesn't
    /// specify one explicitly. Defaults to loopback for safety.
    #[serde(default = "default_tunnel_bind_address")]
    pub tunnel_bind_address: String,
}

fn default_tunnel_bind_address() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub verify_cert: bool,
    pub ca_cert: Option<String>,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
    pub server_name: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    Hmac {
        secret: String,
    },
    Keyset {
        server_url: String,
        realm: String,
        client_id: String,
        #[serde(default)]
        jwks_url: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    #[serde(with = "duration_secs")]
    pub max_backoff: Duration,
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    #[serde(with = "duration_secs")]
    pub response_timeout: Duration,
    pub max_missed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(with = "duration_secs", default = "default_io_deadline")]
    pub read_deadline: Duration,
    #[serde(with = "duration_secs", default = "default_io_deadline")]
    pub write_deadline: Duration,
}

fn default_max_message_size() -> usize {
    1024 * 1024
}

fn default_io_deadline() -> Duration {
    Duration::from_secs(30)
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            read_deadline: default_io_deadline(),
            write_deadline: default_io_deadline(),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

impl ClientConfig {
    /// Field-level validation beyond what serde's types already enforce
    /// (non-zero ports, non-empty host, TLS cert/key pairing).
    pub fn validate(&self) -> Result<(), crate::error::LocalError> {
        use crate::error::LocalError;

        if self.relay.host.trim().is_empty() {
            return Err(LocalError::InvalidConfig("relay.host must not be empty".into()));
        }
        if self.relay.port == 0 {
            return Err(LocalError::InvalidConfig("relay.port must be 1..=65535".into()));
        }
        if self.tls.client_cert.is_some() != self.tls.client_key.is_some() {
            return Err(LocalError::InvalidConfig(
                "tls.client_cert and tls.client_key must both be set or both be absent".into(),
            ));
        }
        if self.retry.backoff_multiplier <= 0.0 {
            return Err(LocalError::InvalidConfig(
                "retry.backoff_multiplier must be > 0".into(),
            ));
        }
        if self.heartbeat.max_missed == 0 {
            return Err(LocalError::InvalidConfig(
                "heartbeat.max_missed must be >= 1".into(),
            ));
        }
        if let AuthConfig::Hmac { secret } = &self.auth {
            if secret.is_empty() {
                return Err(LocalError::InvalidConfig("auth.secret must not be empty".into()));
            }
        }
        Ok(())
    }
}
