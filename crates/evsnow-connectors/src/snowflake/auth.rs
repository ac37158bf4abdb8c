//! Key-pair JWT minting for the SQL and streaming ingest APIs.
//!
//! Snowflake accepts RS256 JWTs whose issuer carries the public-key
//! fingerprint: `iss = ACCOUNT.USER.SHA256:<fp>`, `sub = ACCOUNT.USER`.
//! Tokens are minted with a 55-minute lifetime and re-minted once less
//! than five minutes remain.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde::Serialize;

use super::ConnectionProfile;
use crate::error::ConnectorError;

const TOKEN_LIFETIME_MINUTES: i64 = 55;
const REFRESH_MARGIN_MINUTES: i64 = 5;

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    sub: &'a str,
    iat: i64,
    exp: i64,
}

struct CachedToken {
    jwt: String,
    expires_at: DateTime<Utc>,
}

/// Mints and caches key-pair JWTs for one connection profile.
pub struct KeyPairJwt {
    issuer: String,
    subject: String,
    encoding_key: EncodingKey,
    cached: Mutex<Option<CachedToken>>,
}

impl KeyPairJwt {
    /// Prepares a signer from the profile's private key.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Configuration`] when the PEM cannot be
    /// parsed as an RSA private key.
    pub fn new(profile: &ConnectionProfile) -> Result<Self, ConnectorError> {
        let encoding_key =
            EncodingKey::from_rsa_pem(profile.private_key_pem.as_bytes()).map_err(|e| {
                ConnectorError::Configuration(format!("invalid private key PEM: {e}"))
            })?;

        // Snowflake canonicalizes account and user to upper case in claims.
        let account = profile.account.to_uppercase();
        let user = profile.user.to_uppercase();
        let subject = format!("{account}.{user}");
        let issuer = format!("{subject}.{}", profile.public_key_fingerprint);

        Ok(Self {
            issuer,
            subject,
            encoding_key,
            cached: Mutex::new(None),
        })
    }

    /// Returns a JWT with at least [`REFRESH_MARGIN_MINUTES`] of life left,
    /// minting a fresh one when the cached token is close to expiry.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Configuration`] when signing fails.
    pub fn token(&self) -> Result<String, ConnectorError> {
        let now = Utc::now();
        let mut cached = self.cached.lock();

        if let Some(tok) = cached.as_ref() {
            if tok.expires_at - now > ChronoDuration::minutes(REFRESH_MARGIN_MINUTES) {
                return Ok(tok.jwt.clone());
            }
        }

        let expires_at = now + ChronoDuration::minutes(TOKEN_LIFETIME_MINUTES);
        let claims = Claims {
            iss: &self.issuer,
            sub: &self.subject,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let jwt = jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &self.encoding_key,
        )
        .map_err(|e| ConnectorError::Configuration(format!("JWT signing failed: {e}")))?;

        *cached = Some(CachedToken {
            jwt: jwt.clone(),
            expires_at,
        });
        Ok(jwt)
    }

    /// The issuer claim, `ACCOUNT.USER.SHA256:<fp>`.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// The subject claim, `ACCOUNT.USER`.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl std::fmt::Debug for KeyPairJwt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPairJwt")
            .field("issuer", &self.issuer)
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}
