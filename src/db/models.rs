use chrono::{DateTime, Duration, Utc};
use sqlx::FromRow;

/// A registered client. Only the secret verifier is stored, never the secret.
#[derive(Debug, Clone, FromRow)]
pub struct Client {
    pub client_id: String,
    pub secret_verifier: String,
    pub repositories: String, // JSON array of repository names
    pub secret_issued_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Client {
    /// Authorized repository names
    pub fn repositories(&self) -> Vec<String> {
        serde_json::from_str(&self.repositories).unwrap_or_default()
    }

    pub fn is_authorized(&self, repository: &str) -> bool {
        self.repositories().iter().any(|r| r == repository)
    }

    /// Whether the secret is older than `expiry_days`
    pub fn is_secret_expired(&self, expiry_days: u32, now: DateTime<Utc>) -> bool {
        now - self.secret_issued_at > Duration::days(i64::from(expiry_days))
    }
}

/// Data for creating or replacing a client
#[derive(Debug, Clone)]
pub struct NewClient {
    pub client_id: String,
    pub secret_verifier: String,
    pub repositories: Vec<String>,
}
