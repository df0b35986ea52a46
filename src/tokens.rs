//! OAuth2 `client_credentials` access tokens.
//!
//! Tokens are HS256 JWTs signed with a key derived from the master key. The
//! audience lists the repositories granted at issuance; serving still checks
//! the client's current registration, so narrowing a client takes effect
//! before its tokens expire.

use crate::db::Client;
use crate::error::{AppError, AppResult};
use crate::vault::Vault;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const ISSUER: &str = "ConfigServer";

/// JWT claims of an access token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub iss: String,
    /// Client id
    pub sub: String,
    /// Granted repository names
    pub aud: Vec<String>,
    pub nbf: i64,
    pub iat: i64,
    pub exp: i64,
}

impl AccessClaims {
    pub fn grants(&self, repository: &str) -> bool {
        self.aud.iter().any(|granted| granted == repository)
    }
}

/// Signs and checks access tokens
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        validation.set_required_spec_claims(&["exp", "nbf", "iss", "sub"]);
        validation.validate_nbf = true;
        // Audience is matched against the requested repository when serving
        validation.validate_aud = false;

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            ttl,
        }
    }

    pub fn from_vault(vault: &Vault, ttl: Duration) -> Self {
        Self::new(&vault.token_signing_key(), ttl)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Sign a token for `client_id` granting `repositories`.
    pub fn issue(
        &self,
        client_id: &str,
        repositories: Vec<String>,
    ) -> AppResult<(String, AccessClaims)> {
        self.issue_at(client_id, repositories, Utc::now())
    }

    fn issue_at(
        &self,
        client_id: &str,
        repositories: Vec<String>,
        now: DateTime<Utc>,
    ) -> AppResult<(String, AccessClaims)> {
        let now = now.timestamp();
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = AccessClaims {
            iss: ISSUER.to_string(),
            sub: client_id.to_string(),
            aud: repositories,
            nbf: now,
            iat: now,
            exp: now.saturating_add(ttl),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AppError::internal(format!("failed to sign access token: {}", e)))?;
        Ok((token, claims))
    }

    /// Verify signature, issuer and validity window.
    pub fn validate(&self, token: &str) -> AppResult<AccessClaims> {
        decode::<AccessClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!(error = %e, "Rejected access token");
                AppError::InvalidCredentials
            })
    }
}

/// Repositories of a space separated `scope` the client may read, in request
/// order without duplicates.
pub fn granted_scopes(client: &Client, scope: &str) -> AppResult<Vec<String>> {
    let mut granted: Vec<String> = Vec::new();
    let mut requested = 0;
    for name in scope.split_whitespace() {
        requested += 1;
        if client.is_authorized(name) && !granted.iter().any(|g| g == name) {
            granted.push(name.to_string());
        }
    }
    if requested == 0 {
        return Err(AppError::validation("'scope' is required"));
    }
    if granted.is_empty() {
        return Err(AppError::Forbidden(scope.trim().to_string()));
    }
    Ok(granted)
}
