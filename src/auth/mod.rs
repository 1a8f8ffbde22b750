//! Auth strategy: builds the auth payload and optionally pre-validates
//! a token locally before it is sent.

pub mod hmac;
pub mod keyset;

use crate::error::ApplicationError;

/// Claims extracted from a locally-validated token, used for rate-limit
/// keying (`sub`) and tunnel-creation messages (`tenant_id`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Claims {
    pub sub: Option<String>,
    pub tenant_id: Option<String>,
}

/// A pluggable local pre-validation strategy. The relay itself is the
/// authority on whether a token is accepted; this trait only governs
/// whether the client aborts *before* sending a token it can already
/// tell is invalid (expired, wrong algorithm, wrong issuer/audience).
pub trait AuthStrategy: Send + Sync {
    /// Validate `token` locally. On success, returns whatever claims could
    /// be extracted (may be empty if the strategy can't introspect).
    fn validate(&self, token: &str) -> Result<Claims, ApplicationError>;
}

pub use hmac::HmacStrategy;
pub use keyset::KeySetStrategy;
