//! Key-set (JWKS) token verification.
//!
//! Fetches a JSON Web Key Set over HTTPS at construction time, verifies
//! RS256 tokens against it, and checks issuer/audience. The JWK→RSA
//! conversion is built from the JWK's base64url `n`/`e` fields via
//! `jsonwebtoken::DecodingKey::from_rsa_raw_components`.

use std::collections::HashMap;

use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::{ApplicationError, ApplicationErrorCode};

use super::{AuthStrategy, Claims};

#[derive(Debug, Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: String,
    n: String,
    e: String,
    #[serde(default)]
    alg: Option<String>,
}

pub struct KeySetStrategy {
    keys_by_kid: HashMap<String, DecodingKey>,
    issuer: String,
    audience: String,
}

impl KeySetStrategy {
    /// Fetch the JWKS document and build one `DecodingKey` per `kid`.
    pub async fn fetch(
        server_url: &str,
        realm: &str,
        client_id: &str,
        jwks_url_override: Option<&str>,
    ) -> Result<Self, ApplicationError> {
        let jwks_url = match jwks_url_override {
            Some(url) => url.to_string(),
            None => format!(
                "{}/realms/{}/protocol/openid-connect/certs",
                server_url.trim_end_matches('/'),
                realm
            ),
        };

        let response = reqwest::get(&jwks_url).await.map_err(|e| {
            ApplicationError::new(
                ApplicationErrorCode::AuthenticationFailed,
                format!("fetching JWKS from {jwks_url}: {e}"),
            )
        })?;
        let jwks: Jwks = response.json().await.map_err(|e| {
            ApplicationError::new(
                ApplicationErrorCode::AuthenticationFailed,
                format!("parsing JWKS: {e}"),
            )
        })?;

        let mut keys_by_kid = HashMap::new();
        for jwk in jwks.keys {
            if jwk.alg.as_deref().is_some_and(|a| a != "RS256") {
                continue;
            }
            let n = base64::engine::general_purpose::URL_SAFE_NO_PAD
                .decode(&jwk.n)
                .map_err(|e| {
                    ApplicationError::new(
                        ApplicationErrorCode::AuthenticationFailed,
                        format!("decoding JWK n for kid {}: {e}", jwk.kid),
                    )
                })?;
            let e = base64::engine::general_purpose::URL_SAFE_NO_PAD
                .decode(&jwk.e)
                .map_err(|err| {
                    ApplicationError::new(
                        ApplicationErrorCode::AuthenticationFailed,
                        format!("decoding JWK e for kid {}: {err}", jwk.kid),
                    )
                })?;
            let key = DecodingKey::from_rsa_raw_components(&n, &e);
            keys_by_kid.insert(jwk.kid, key);
        }

        Ok(Self {
            keys_by_kid,
            issuer: format!("{}/realms/{}", server_url.trim_end_matches('/'), realm),
            audience: client_id.to_string(),
        })
    }

    #[cfg(test)]
    fn from_keys(keys: HashMap<String, DecodingKey>, issuer: String, audience: String) -> Self {
        Self {
            keys_by_kid: keys,
            issuer,
            audience,
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

impl AuthStrategy for KeySetStrategy {
    fn validate(&self, token: &str) -> Result<Claims, ApplicationError> {
        let header = jsonwebtoken::decode_header(token).map_err(|e| {
            ApplicationError::new(ApplicationErrorCode::InvalidToken, e.to_string())
        })?;
        let kid = header.kid.ok_or_else(|| {
            ApplicationError::new(ApplicationErrorCode::InvalidToken, "token missing kid header")
        })?;
        let key = self.keys_by_kid.get(&kid).ok_or_else(|| {
            ApplicationError::new(
                ApplicationErrorCode::InvalidToken,
                format!("unknown key id {kid}"),
            )
        })?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);

        let decoded = jsonwebtoken::decode::<TokenClaims>(token, key, &validation)
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

    /// Builds a syntactically valid but unsigned compact JWT: header and
    /// payload are real base64url JSON, the signature segment is a
    /// placeholder. `decode_header` only inspects the header, so this is
    /// enough to exercise kid lookup without a real RSA keypair.
    fn fake_token(kid: &str) -> String {
        let header = serde_json::json!({"alg": "RS256", "typ": "JWT", "kid": kid});
        let payload = serde_json::json!({"sub": "u"});
        let b64 = |v: &serde_json::Value| {
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(v.to_string())
        };
        format!("{}.{}.sig", b64(&header), b64(&payload))
    }

    #[test]
    fn unknown_kid_is_rejected() {
        let strategy = KeySetStrategy::from_keys(
            HashMap::new(),
            "https://idp.example/realms/r".to_string(),
            "client-a".to_string(),
        );
        let token = fake_token("missing");
        let err = strategy.validate(&token).unwrap_err();
        assert_eq!(err.code, ApplicationErrorCode::InvalidToken);
    }

    #[test]
    fn token_without_kid_header_is_rejected() {
        let strategy = KeySetStrategy::from_keys(
            HashMap::new(),
            "https://idp.example/realms/r".to_string(),
            "client-a".to_string(),
        );
        let header = serde_json::json!({"alg": "RS256", "typ": "JWT"});
        let payload = serde_json::json!({"sub": "u"});
        let b64 = |v: &serde_json::Value| {
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(v.to_string())
        };
        let token = format!("{}.{}.sig", b64(&header), b64(&payload));
        let err = strategy.validate(&token).unwrap_err();
        assert_eq!(err.code, ApplicationErrorCode::InvalidToken);
    }
}
