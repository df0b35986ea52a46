use crate::vault::CryptoError;
use axum::http::{header, HeaderValue, StatusCode};
use configserver_types::ErrorBody;
use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Unknown repository: {}", .0.join(", "))]
    UnknownRepository(Vec<String>),

    #[error("Repository '{0}' does not exist")]
    RepositoryNotFound(String),

    #[error("Repository '{0}' has not been fetched successfully yet")]
    RepositoryUnavailable(String),

    #[error("'{0}' was not found in the repository")]
    FileNotFound(String),

    #[error("'{0}' is not a valid repository path")]
    InvalidPath(String),

    #[error("Encrypted value could not be decrypted: {0}")]
    Integrity(CryptoError),

    #[error("Authentication required")]
    AuthRequired,

    #[error("Invalid client credentials")]
    InvalidCredentials,

    #[error("Client secret has expired, register the client again")]
    SecretExpired,

    #[error("Client is not allowed to access repository '{0}'")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<CryptoError> for AppError {
    fn from(error: CryptoError) -> Self {
        match error {
            CryptoError::Integrity => Self::Integrity(error),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Convert AppError to HTTP status codes for web responses
impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::UnknownRepository(_) => StatusCode::BAD_REQUEST,
            Self::RepositoryNotFound(_) => StatusCode::NOT_FOUND,
            Self::RepositoryUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::FileNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidPath(_) => StatusCode::BAD_REQUEST,
            Self::Integrity(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::AuthRequired => StatusCode::UNAUTHORIZED,
            Self::InvalidCredentials => StatusCode::UNAUTHORIZED,
            Self::SecretExpired => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
            code: status.as_u16(),
        };
        let mut response = (status, axum::Json(body)).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"ConfigServer\""),
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            AppError::UnknownRepository(vec!["x".into()]).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(AppError::validation("bad").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::AuthRequired.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AppError::Forbidden("docs".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::Integrity(CryptoError::Integrity).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_every_error_has_a_message() {
        let errors = vec![
            AppError::validation("empty body"),
            AppError::UnknownRepository(vec!["nope".into()]),
            AppError::RepositoryNotFound("docs".into()),
            AppError::RepositoryUnavailable("docs".into()),
            AppError::FileNotFound("a.yaml".into()),
            AppError::InvalidPath("../etc".into()),
            AppError::Integrity(CryptoError::Integrity),
            AppError::AuthRequired,
            AppError::InvalidCredentials,
            AppError::SecretExpired,
            AppError::Forbidden("docs".into()),
            AppError::internal("boom"),
        ];
        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_crypto_errors_map_by_kind() {
        let error = AppError::from(CryptoError::Integrity);
        assert!(matches!(error, AppError::Integrity(_)));
        assert!(error.to_string().contains("could not be decrypted"));

        for crypto in [
            CryptoError::Encryption,
            CryptoError::InvalidKey("short".into()),
            CryptoError::Io(std::io::Error::other("disk")),
        ] {
            let error = AppError::from(crypto);
            assert!(matches!(error, AppError::Internal(_)), "{error}");
            assert!(!error.to_string().contains("decrypted"));
            assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    #[test]
    fn test_unauthorized_carries_challenge() {
        let response = AppError::AuthRequired.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
    }

    #[test]
    fn test_unknown_repository_lists_names() {
        let error = AppError::UnknownRepository(vec!["a".into(), "b".into()]);
        assert_eq!(error.to_string(), "Unknown repository: a, b");
    }
}
