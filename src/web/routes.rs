use crate::cache::{CacheKey, ContentCache};
use crate::config::{SecretsConfig, WebConfig};
use crate::db::DbPool;
use crate::error::{AppError, AppResult};
use crate::registration::RegistrationService;
use crate::repository::{normalize_path, Registry, StatsAggregator};
use crate::tokens::{granted_scopes, TokenIssuer};
use crate::vault::{SharedVault, Vault};
use crate::web::auth::{self, ClientCredentials, RequestCredentials};
use axum::{
    body::Bytes,
    extract::{
        rejection::{FormRejection, JsonRejection},
        DefaultBodyLimit, Form, Path, State,
    },
    http::{header, HeaderValue, Method},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use configserver_types::{
    AccessTokenResponse, HealthResponse, RegisterRequest, RegisterResponse, RepositoryStats,
    TokenRequest,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub vault: SharedVault,
    pub registration: RegistrationService,
    pub stats: StatsAggregator,
    pub cache: Arc<ContentCache>,
    pub tokens: Arc<TokenIssuer>,
}

impl AppState {
    pub fn new(
        registry: Arc<Registry>,
        vault: SharedVault,
        pool: DbPool,
        secrets: SecretsConfig,
        cache: Arc<ContentCache>,
    ) -> Self {
        let tokens = Arc::new(TokenIssuer::from_vault(
            &vault,
            Duration::from_secs(secrets.access_token_ttl_secs),
        ));
        Self {
            registration: RegistrationService::new(registry.clone(), vault.clone(), pool, secrets),
            tokens,
            stats: StatsAggregator::new(registry.clone()),
            registry,
            vault,
            cache,
        }
    }
}

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Every configured repository, fetched or not
pub async fn list_repositories(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.registry.list_names())
}

pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> AppResult<Json<RegisterResponse>> {
    let Json(request) = payload.map_err(|e| AppError::validation(e.body_text()))?;
    let response = state
        .registration
        .register(&request.client_id, &request.repositories)
        .await?;
    Ok(Json(response))
}

/// OAuth2 token endpoint, `client_credentials` grant only.
///
/// The client authenticates with Basic credentials; the token is scoped to
/// the requested repositories it is authorized for.
pub async fn issue_token(
    credentials: ClientCredentials,
    State(state): State<AppState>,
    form: Result<Form<TokenRequest>, FormRejection>,
) -> AppResult<Json<AccessTokenResponse>> {
    let client = state
        .registration
        .authenticate(&credentials.client_id, &credentials.secret)
        .await?;

    let Form(request) = form.map_err(|e| AppError::validation(e.body_text()))?;
    if request.grant_type != "client_credentials" {
        return Err(AppError::validation(
            "unsupported grant type, only client_credentials is supported",
        ));
    }

    let granted = granted_scopes(&client, &request.scope)?;
    let (access_token, claims) = state.tokens.issue(&client.client_id, granted)?;
    info!(client_id = %client.client_id, scope = ?claims.aud, "Access token issued");

    Ok(Json(AccessTokenResponse {
        access_token,
        token_type: "bearer".to_string(),
        expires_in: state.tokens.ttl().as_secs(),
        scope: claims.aud.join(" "),
    }))
}

fn utf8_body(body: Bytes) -> AppResult<String> {
    if body.is_empty() {
        return Err(AppError::validation("request body must not be empty"));
    }
    String::from_utf8(body.to_vec())
        .map_err(|_| AppError::validation("request body must be UTF-8 text"))
}

fn text(body: String) -> Response {
    ([(header::CONTENT_TYPE, TEXT_PLAIN)], body).into_response()
}

/// Seal a raw text body into a token to embed in a config file
pub async fn encrypt(State(state): State<AppState>, body: Bytes) -> AppResult<Response> {
    let plaintext = zeroize::Zeroizing::new(utf8_body(body)?);
    let token = state.vault.encrypt(plaintext.as_bytes())?;
    Ok(text(token))
}

/// Replace `{enc:plaintext}` placeholders of a whole document with tokens
pub async fn tokenize(State(state): State<AppState>, body: Bytes) -> AppResult<Response> {
    let document = utf8_body(body)?;
    Ok(text(state.vault.tokenize(&document)?))
}

pub async fn stats(State(state): State<AppState>) -> Json<Vec<RepositoryStats>> {
    Json(state.stats.snapshot().await)
}

fn render(vault: &Vault, raw: Bytes) -> AppResult<Bytes> {
    match std::str::from_utf8(&raw) {
        Ok(text) => Ok(Bytes::from(vault.detokenize(text)?)),
        // Binary files cannot hold tokens
        Err(_) => Ok(raw),
    }
}

/// Serve one file of a repository to an authorized client, with every
/// encrypted token replaced by its plaintext.
pub async fn serve_file(
    credentials: RequestCredentials,
    State(state): State<AppState>,
    Path((repository, path)): Path<(String, String)>,
) -> AppResult<Response> {
    let client = auth::authorize(&state.registration, &state.tokens, &credentials, &repository).await?;

    let normalized = normalize_path(&path).ok_or_else(|| AppError::InvalidPath(path.clone()))?;
    let file = state.registry.get_file(&repository, &normalized).await?;
    let key = CacheKey {
        repository: repository.clone(),
        path: normalized,
        revision: file.revision,
    };

    let content = match state.cache.get(&key) {
        Some(content) => content,
        None => {
            let rendered = render(&state.vault, file.content)?;
            state.cache.insert(key, rendered.clone());
            rendered
        }
    };

    let hits = state.stats.increment_hit(&repository)?;
    debug!(client_id = %client.client_id, repository = %repository, path = %path, hits, "Served configuration");

    let content_type = if std::str::from_utf8(&content).is_ok() {
        TEXT_PLAIN
    } else {
        "application/octet-stream"
    };
    Ok(([(header::CONTENT_TYPE, content_type)], content).into_response())
}

fn cors_layer(config: &WebConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    if config.allowed_origins.is_empty() {
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();
    cors.allow_origin(origins)
}

/// Create the web router
pub fn create_router(state: AppState, config: &WebConfig) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/repositories", get(list_repositories))
        .route("/api/register", post(register))
        .route("/oauth2/token", post(issue_token))
        .route("/api/encrypt", post(encrypt))
        .route("/api/tokenize", post(tokenize))
        .route("/api/stats", get(stats))
        .route("/git/{repository}/{*path}", get(serve_file))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(config))
                .layer(DefaultBodyLimit::max(config.max_body_bytes)),
        )
}
