use anyhow::{anyhow, Context, Result};
use configserver_types::{
    AccessTokenResponse, ErrorBody, RegisterRequest, RegisterResponse, RepositoryStats, TokenRequest,
};
use reqwest::{Client, Response};
use serde_json::Value;
use std::time::Duration;

/// Thin client over the ConfigServer HTTP API
pub struct ApiClient {
    http: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn repositories(&self) -> Result<Vec<String>> {
        let response = self.http.get(self.url("/api/repositories")).send().await?;
        Ok(check(response).await?.json().await?)
    }

    pub async fn stats(&self) -> Result<Vec<RepositoryStats>> {
        let response = self.http.get(self.url("/api/stats")).send().await?;
        Ok(check(response).await?.json().await?)
    }

    pub async fn register(
        &self,
        client_id: Option<String>,
        repositories: Vec<String>,
    ) -> Result<RegisterResponse> {
        let request = RegisterRequest {
            client_id: client_id.unwrap_or_default(),
            repositories,
        };
        let response = self
            .http
            .post(self.url("/api/register"))
            .json(&request)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    /// Exchange client credentials for a bearer token scoped to `repositories`.
    pub async fn token(
        &self,
        client_id: &str,
        client_secret: &str,
        repositories: &[String],
    ) -> Result<AccessTokenResponse> {
        let request = TokenRequest {
            grant_type: "client_credentials".to_string(),
            scope: repositories.join(" "),
        };
        let response = self
            .http
            .post(self.url("/oauth2/token"))
            .basic_auth(client_id, Some(client_secret))
            .form(&request)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }
}

/// Turn a non-2xx response into an error carrying the server's message.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|e| e.error)
        .or_else(|_| {
            serde_json::from_str::<Value>(&body).map(|v| v.to_string())
        })
        .unwrap_or(body);
    Err(anyhow!("Server returned {}: {}", status, message))
}
