//! HMAC-SHA256 token verification.
//!
//! Verifies a compact JWT against a shared secret with a strict `{HS256}`
//! algorithm whitelist. `exp` and `nbf` claims are honored by
//! `jsonwebtoken`'s validation; `sub` and `tenant_id` are extracted for
//! rate-limit keying and tunnel-creation messages respectively.

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::{ApplicationError, ApplicationErrorCode};

use super::{AuthStrategy, Claims};

pub struct HmacStrategy {
    key: DecodingKey,
}

impl HmacStrategy {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    tenant_id: Option<String>,
}

impl AuthStrategy for HmacStrategy {
    fn validate(&self, token: &str) -> Result<Claims, ApplicationError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_nbf = true;
        // The relay is the audience/issuer authority for HMAC tokens; no
        // iss/aud check is configured for this strategy (only the key-set
        // strategy validates issuer/audience).
        validation.required_spec_claims.clear();

        let decoded = jsonwebtoken::decode::<TokenClaims>(token, &self.key, &validation)
            .map_err(|e| ApplicationError::new(ApplicationErrorCode::InvalidToken, e.to_string()))?;

        Ok(Claims {
            sub: decoded.claims.sub,
            tenant_id: decoded.claims.tenant_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[derive(Serialize)]
    struct SignClaims {
        sub: String,
        exp: u64,
    }

    fn now() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
    }

    fn sign(secret: &str, exp_offset: i64) -> String {
        let claims = SignClaims {
            sub: "u".to_string(),
            exp: (now() as i64 + exp_offset) as u64,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_is_accepted_and_sub_extracted() {
        let strategy = HmacStrategy::new("s");
        let token = sign("s", 3600);
        let claims = strategy.validate(&token).unwrap();
        assert_eq!(claims.sub.as_deref(), Some("u"));
    }

    #[test]
    fn expired_token_is_rejected() {
        let strategy = HmacStrategy::new("s");
        let token = sign("s", -60);
        let err = strategy.validate(&token).unwrap_err();
        assert_eq!(err.code, crate::error::ApplicationErrorCode::InvalidToken);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let strategy = HmacStrategy::new("s");
        let token = sign("other", 3600);
        assert!(strategy.validate(&token).is_err());
    }
}
