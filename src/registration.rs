//! Client registration and credential checks.

use crate::config::SecretsConfig;
use crate::db::{Client, ClientRepo, DbPool, NewClient};
use crate::error::{AppError, AppResult};
use crate::repository::Registry;
use crate::tokens::AccessClaims;
use crate::vault::SharedVault;
use chrono::Utc;
use configserver_types::RegisterResponse;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_CLIENT_ID_LEN: usize = 128;
const MAX_ID_ATTEMPTS: usize = 8;

/// Well-formed verifier no secret maps to, checked for unknown client ids so
/// they cost the same MAC as known ones.
const UNKNOWN_CLIENT_VERIFIER: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

/// Issues credentials against the repository registry
#[derive(Clone)]
pub struct RegistrationService {
    registry: Arc<Registry>,
    vault: SharedVault,
    pool: DbPool,
    secrets: SecretsConfig,
}

impl RegistrationService {
    pub fn new(
        registry: Arc<Registry>,
        vault: SharedVault,
        pool: DbPool,
        secrets: SecretsConfig,
    ) -> Self {
        Self {
            registry,
            vault,
            pool,
            secrets,
        }
    }

    /// Register a client, or re-register an existing one.
    ///
    /// Every call mints a new secret; the previous one stops working and the
    /// authorized set is replaced, not merged. Nothing is written when any
    /// requested repository is unknown.
    pub async fn register(
        &self,
        client_id: &str,
        repositories: &[String],
    ) -> AppResult<RegisterResponse> {
        let client_id = client_id.trim();
        validate_client_id(client_id)?;
        let repositories = self.registry.validate(repositories)?;

        if client_id.is_empty() {
            return self.register_new(repositories).await;
        }

        let secret = self.vault.generate_secret();
        let record = NewClient {
            client_id: client_id.to_string(),
            secret_verifier: self.vault.secret_verifier(client_id, secret.expose()),
            repositories,
        };
        ClientRepo::upsert(&self.pool, &record).await?;
        info!(client_id = %client_id, repositories = ?record.repositories, "Client registered");

        Ok(RegisterResponse {
            client_id: record.client_id,
            client_secret: secret.into_inner(),
        })
    }

    async fn register_new(&self, repositories: Vec<String>) -> AppResult<RegisterResponse> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let client_id = Uuid::new_v4().to_string();
            let secret = self.vault.generate_secret();
            let record = NewClient {
                secret_verifier: self.vault.secret_verifier(&client_id, secret.expose()),
                client_id,
                repositories: repositories.clone(),
            };
            if ClientRepo::insert_new(&self.pool, &record).await? {
                info!(client_id = %record.client_id, repositories = ?record.repositories, "New client registered");
                return Ok(RegisterResponse {
                    client_id: record.client_id,
                    client_secret: secret.into_inner(),
                });
            }
            warn!(client_id = %record.client_id, "Generated client id already taken, retrying");
        }
        Err(AppError::internal("could not allocate a unique client id"))
    }

    /// Check a presented id/secret pair.
    ///
    /// Expired secrets are logged, and only rejected when expiry is enforced.
    pub async fn authenticate(&self, client_id: &str, secret: &str) -> AppResult<Client> {
        let Some(client) = ClientRepo::get(&self.pool, client_id).await? else {
            let _ = self.vault.verify_secret(client_id, secret, UNKNOWN_CLIENT_VERIFIER);
            return Err(AppError::InvalidCredentials);
        };

        if !self
            .vault
            .verify_secret(client_id, secret, &client.secret_verifier)
        {
            return Err(AppError::InvalidCredentials);
        }

        if client.is_secret_expired(self.secrets.expiry_days, Utc::now()) {
            warn!(
                client_id = %client_id,
                issued_at = %client.secret_issued_at,
                "Client secret has expired"
            );
            if self.secrets.enforce_expiry {
                return Err(AppError::SecretExpired);
            }
        }

        Ok(client)
    }

    /// Resolve the client behind a validated access token.
    ///
    /// Tokens issued before the client's current secret are rejected, so
    /// re-registering a client revokes its outstanding tokens.
    pub async fn authenticate_token(&self, claims: &AccessClaims) -> AppResult<Client> {
        let client = ClientRepo::get(&self.pool, &claims.sub)
            .await?
            .ok_or(AppError::InvalidCredentials)?;
        if claims.iat < client.secret_issued_at.timestamp() {
            debug!(client_id = %claims.sub, "Access token predates the current secret");
            return Err(AppError::InvalidCredentials);
        }
        Ok(client)
    }
}

fn validate_client_id(client_id: &str) -> AppResult<()> {
    if client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(AppError::validation(format!(
            "clientId must be at most {} characters",
            MAX_CLIENT_ID_LEN
        )));
    }
    // ':' separates id and secret in Basic credentials
    if client_id.contains(':') || client_id.chars().any(char::is_control) {
        return Err(AppError::validation(
            "clientId must not contain ':' or control characters",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::queries::setup_test_db;
    use crate::repository::RepositoryEntry;
    use crate::vault::{MasterKey, Vault, SECRET_LEN};
    use std::collections::HashSet;
    use std::time::Duration;

    async fn service() -> RegistrationService {
        let registry = Arc::new(Registry::new(["docs", "infra", "billing"].map(|name| {
            RepositoryEntry::new(name, format!("/srv/{name}"), Duration::from_secs(60))
        })));
        RegistrationService::new(
            registry,
            Arc::new(Vault::new(MasterKey::generate())),
            setup_test_db().await,
            SecretsConfig::default(),
        )
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn test_register_generates_client_id() {
        let service = service().await;
        let response = service
            .register("", &names(&["docs", "infra"]))
            .await
            .unwrap();

        assert!(!response.client_id.is_empty());
        assert!(Uuid::parse_str(&response.client_id).is_ok());
        assert_eq!(response.client_secret.len(), SECRET_LEN);

        let client = service
            .authenticate(&response.client_id, &response.client_secret)
            .await
            .unwrap();
        assert_eq!(client.repositories(), names(&["docs", "infra"]));
    }

    #[tokio::test]
    async fn test_reregister_rotates_and_replaces() {
        let service = service().await;
        let first = service
            .register("", &names(&["docs", "infra"]))
            .await
            .unwrap();
        let second = service
            .register(&first.client_id, &names(&["docs"]))
            .await
            .unwrap();

        assert_eq!(second.client_id, first.client_id);
        assert_ne!(second.client_secret, first.client_secret);

        assert!(matches!(
            service
                .authenticate(&first.client_id, &first.client_secret)
                .await,
            Err(AppError::InvalidCredentials)
        ));
        let client = service
            .authenticate(&second.client_id, &second.client_secret)
            .await
            .unwrap();
        assert_eq!(client.repositories(), names(&["docs"]));
        assert!(!client.is_authorized("infra"));
    }

    #[tokio::test]
    async fn test_unknown_repository_leaves_prior_registration() {
        let service = service().await;
        let original = service
            .register("team-a", &names(&["docs"]))
            .await
            .unwrap();

        let result = service
            .register("team-a", &names(&["docs", "unknown-repo"]))
            .await;
        assert!(matches!(result, Err(AppError::UnknownRepository(ref u)) if u == &names(&["unknown-repo"])));

        let client = service
            .authenticate("team-a", &original.client_secret)
            .await
            .unwrap();
        assert_eq!(client.repositories(), names(&["docs"]));
    }

    #[tokio::test]
    async fn test_unknown_repository_creates_nothing() {
        let service = service().await;
        assert!(service.register("", &names(&["nope"])).await.is_err());
        assert!(service.register("fresh", &names(&["nope"])).await.is_err());
        assert_eq!(ClientRepo::count(&service.pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_repository_list_rejected() {
        let service = service().await;
        assert!(matches!(
            service.register("team-a", &[]).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_client_id_is_trimmed_and_checked() {
        let service = service().await;
        let response = service
            .register("  team-a  ", &names(&["docs"]))
            .await
            .unwrap();
        assert_eq!(response.client_id, "team-a");

        assert!(matches!(
            service.register("a:b", &names(&["docs"])).await,
            Err(AppError::Validation(_))
        ));
        let long = "x".repeat(MAX_CLIENT_ID_LEN + 1);
        assert!(matches!(
            service.register(&long, &names(&["docs"])).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_distinct_clients_get_distinct_secrets() {
        let service = service().await;
        let mut secrets = HashSet::new();
        for i in 0..200 {
            let response = service
                .register(&format!("client-{i}"), &names(&["docs"]))
                .await
                .unwrap();
            secrets.insert(response.client_secret);
        }
        assert_eq!(secrets.len(), 200);
    }

    #[tokio::test]
    async fn test_authenticate_rejects_bad_credentials() {
        let service = service().await;
        let response = service.register("team-a", &names(&["docs"])).await.unwrap();

        assert!(matches!(
            service.authenticate("team-a", "wrong").await,
            Err(AppError::InvalidCredentials)
        ));
        assert!(matches!(
            service.authenticate("team-b", &response.client_secret).await,
            Err(AppError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_unknown_client_checked_against_placeholder_verifier() {
        let service = service().await;
        let real = service.vault.secret_verifier("team-a", "secret");
        assert_eq!(UNKNOWN_CLIENT_VERIFIER.len(), real.len());
        assert!(!service
            .vault
            .verify_secret("ghost", "secret", UNKNOWN_CLIENT_VERIFIER));

        assert!(matches!(
            service.authenticate("ghost", "secret").await,
            Err(AppError::InvalidCredentials)
        ));
    }

    fn claims(client_id: &str, issued_at: i64) -> AccessClaims {
        AccessClaims {
            iss: crate::tokens::ISSUER.to_string(),
            sub: client_id.to_string(),
            aud: names(&["docs"]),
            nbf: issued_at,
            iat: issued_at,
            exp: issued_at + 3600,
        }
    }

    #[tokio::test]
    async fn test_authenticate_token() {
        let service = service().await;
        let response = service.register("team-a", &names(&["docs"])).await.unwrap();
        let now = Utc::now().timestamp();

        let client = service.authenticate_token(&claims("team-a", now)).await.unwrap();
        assert_eq!(client.client_id, response.client_id);

        // Issued before the current secret
        assert!(matches!(
            service.authenticate_token(&claims("team-a", now - 600)).await,
            Err(AppError::InvalidCredentials)
        ));
        assert!(matches!(
            service.authenticate_token(&claims("ghost", now)).await,
            Err(AppError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_expired_secret_only_rejected_when_enforced() {
        let mut service = service().await;
        let response = service.register("team-a", &names(&["docs"])).await.unwrap();
        sqlx::query("UPDATE clients SET secret_issued_at = ? WHERE client_id = ?")
            .bind(Utc::now() - chrono::Duration::days(400))
            .bind("team-a")
            .execute(&service.pool)
            .await
            .unwrap();

        assert!(service
            .authenticate("team-a", &response.client_secret)
            .await
            .is_ok());

        service.secrets.enforce_expiry = true;
        assert!(matches!(
            service.authenticate("team-a", &response.client_secret).await,
            Err(AppError::SecretExpired)
        ));
    }
}
