//! HTTP authentication for the config serving and token routes.
//!
//! Clients present either their registered `clientId:clientSecret` as Basic
//! credentials, or a bearer token obtained from `POST /oauth2/token`.

use crate::db::Client;
use crate::error::{AppError, AppResult};
use crate::registration::RegistrationService;
use crate::tokens::TokenIssuer;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::headers::authorization::{Basic, Bearer};
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use tracing::debug;
use zeroize::Zeroizing;

/// `clientId:clientSecret` taken from the `Authorization` header
pub struct ClientCredentials {
    pub client_id: String,
    pub secret: Zeroizing<String>,
}

impl<S> FromRequestParts<S> for ClientCredentials
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(basic)) =
            TypedHeader::<Authorization<Basic>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::AuthRequired)?;

        if basic.username().is_empty() {
            return Err(AppError::AuthRequired);
        }

        Ok(Self {
            client_id: basic.username().to_string(),
            secret: Zeroizing::new(basic.password().to_string()),
        })
    }
}

/// Basic credentials or a bearer access token
pub enum RequestCredentials {
    Basic(ClientCredentials),
    Bearer(Zeroizing<String>),
}

impl<S> FromRequestParts<S> for RequestCredentials
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Ok(TypedHeader(Authorization(bearer))) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state).await
        {
            if bearer.token().is_empty() {
                return Err(AppError::AuthRequired);
            }
            return Ok(Self::Bearer(Zeroizing::new(bearer.token().to_string())));
        }
        ClientCredentials::from_request_parts(parts, state)
            .await
            .map(Self::Basic)
    }
}

/// Authenticate the caller and check it may read `repository`.
///
/// A bearer token must name the repository in its audience, and the client
/// must still be authorized for it.
pub async fn authorize(
    registration: &RegistrationService,
    tokens: &TokenIssuer,
    credentials: &RequestCredentials,
    repository: &str,
) -> AppResult<Client> {
    let client = match credentials {
        RequestCredentials::Basic(basic) => {
            registration
                .authenticate(&basic.client_id, &basic.secret)
                .await?
        }
        RequestCredentials::Bearer(token) => {
            let claims = tokens.validate(token)?;
            if !claims.grants(repository) {
                debug!(client_id = %claims.sub, repository = %repository, "Repository outside token scope");
                return Err(AppError::Forbidden(repository.to_string()));
            }
            registration.authenticate_token(&claims).await?
        }
    };

    if !client.is_authorized(repository) {
        debug!(client_id = %client.client_id, repository = %repository, "Repository not authorized");
        return Err(AppError::Forbidden(repository.to_string()));
    }
    Ok(client)
}
