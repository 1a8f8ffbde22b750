//! Error taxonomy for the relay client core.

use std::time::{Duration, Instant};

/// Top-level error returned by the client facade and its components.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("application error: {0}")]
    Application(#[from] ApplicationError),
    #[error("local error: {0}")]
    Local(#[from] LocalError),
}

impl RelayError {
    /// Whether the retry policy should attempt this operation again.
    pub fn retryable(&self) -> bool {
        match self {
            RelayError::Transport(_) => true,
            RelayError::Protocol(_) => false,
            RelayError::Application(e) => e.retryable(),
            RelayError::Local(_) => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
    #[error("read failed: {0}")]
    Read(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("frame too large: {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed by peer")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unexpected message type: expected {expected}, got {got}")]
    UnexpectedType { expected: String, got: String },
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Application-level error codes, carried in `error` frames and
/// `*_response` messages with `status == "error"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationErrorCode {
    InvalidToken,
    RateLimitExceeded,
    ConnectionLimitReached,
    ServerUnavailable,
    AuthenticationFailed,
    TunnelCreationFailed,
    HeartbeatFailed,
}

impl ApplicationErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidToken => "invalid_token",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::ConnectionLimitReached => "connection_limit_reached",
            Self::ServerUnavailable => "server_unavailable",
            Self::AuthenticationFailed => "authentication_failed",
            Self::TunnelCreationFailed => "tunnel_creation_failed",
            Self::HeartbeatFailed => "heartbeat_failed",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded | Self::ServerUnavailable | Self::HeartbeatFailed
        )
    }
}

impl std::fmt::Display for ApplicationErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApplicationError {
    pub code: ApplicationErrorCode,
    pub message: String,
}

impl ApplicationError {
    pub fn new(code: ApplicationErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn retryable(&self) -> bool {
        self.code.retryable()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LocalError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("duplicate tunnel id: {0}")]
    DuplicateTunnelId(String),
    #[error("local port {0} already in use by an active tunnel")]
    PortInUse(u16),
    #[error("session already connected")]
    AlreadyConnected,
    #[error("error threshold exceeded for code {0}")]
    ErrorThresholdExceeded(String),
    #[error("failed to bind tunnel listener at {0}: {1}")]
    BindFailed(String, String),
}

/// Sliding window counting how many times each error code has been
/// observed recently, used to detect the error-threshold condition.
///
/// Filters out entries older than the window, appends the new one,
/// reports the count.
pub struct ErrorWindow {
    window: Duration,
    threshold: usize,
    timestamps: std::collections::HashMap<String, Vec<Instant>>,
}

impl ErrorWindow {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            window,
            threshold,
            timestamps: std::collections::HashMap::new(),
        }
    }

    /// Record an occurrence of `code` now; returns true if the threshold
    /// has been reached within the window.
    pub fn record(&mut self, code: &str) -> bool {
        self.record_at(code, Instant::now())
    }

    fn record_at(&mut self, code: &str, now: Instant) -> bool {
        let entry = self.timestamps.entry(code.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) <= self.window);
        entry.push(now);
        entry.len() >= self.threshold
    }
}
