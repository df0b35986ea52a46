//! JSON bodies exchanged over the ConfigServer HTTP API.
//!
//! The service and `configserver-admin` both depend on this crate so the
//! request and response shapes cannot drift apart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Body of `POST /api/register`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    /// Empty asks the server to generate an identifier.
    #[serde(default)]
    pub client_id: String,
    pub repositories: Vec<String>,
}

/// Response of `POST /api/register`.
///
/// The secret is only ever returned here; the server keeps a verifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub client_id: String,
    pub client_secret: String,
}

/// Form body of `POST /oauth2/token`.
///
/// Field names follow RFC 6749, hence no camelCase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRequest {
    pub grant_type: String,
    /// Space separated repository names
    #[serde(default)]
    pub scope: String,
}

/// Response of `POST /oauth2/token`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    /// Granted repositories, space separated
    pub scope: String,
}

/// One row of `GET /api/stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryStats {
    pub name: String,
    pub hit_count: u64,
    pub last_update: Option<DateTime<Utc>>,
    pub next_update: Option<DateTime<Utc>>,
    pub last_error: String,
}

/// Error body returned with every non-2xx JSON response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: u16,
}

/// `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
