//! GitHub App installation tokens, scoped to the task's repository.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{header, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CredentialExchange, CredentialGrant, ExchangeError};
use crate::crds::RepositoryRef;

const GITHUB_API_VERSION: &str = "2022-11-28";

/// Backdated to absorb clock drift between us and GitHub
const ASSERTION_BACKDATE_SECS: i64 = 60;
/// GitHub rejects assertions living longer than ten minutes
const ASSERTION_LIFETIME_SECS: i64 = 9 * 60;

#[derive(Debug, Clone)]
pub struct GitHubAppSettings {
    pub app_id: String,
    pub installation_id: String,
    /// PEM-encoded RSA private key of the app
    pub private_key: String,
    pub api_base: String,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub request_timeout: Duration,
}

impl GitHubAppSettings {
    /// Read the app identity from `GITHUB_APP_ID`, `GITHUB_APP_INSTALLATION_ID`
    /// and `GITHUB_APP_PRIVATE_KEY`. Returns `None` if any is missing.
    #[must_use]
    pub fn from_env(
        api_base: &str,
        max_attempts: u32,
        initial_backoff: Duration,
        request_timeout: Duration,
    ) -> Option<Self> {
        let app_id = std::env::var("GITHUB_APP_ID").ok()?;
        let installation_id = std::env::var("GITHUB_APP_INSTALLATION_ID").ok()?;
        let private_key = std::env::var("GITHUB_APP_PRIVATE_KEY").ok()?;
        Some(Self {
            app_id,
            installation_id,
            private_key,
            api_base: api_base.to_string(),
            max_attempts,
            initial_backoff,
            request_timeout,
        })
    }
}

#[derive(Debug, Serialize)]
struct AppClaims<'a> {
    iat: i64,
    exp: i64,
    iss: &'a str,
}

#[derive(Debug, Serialize)]
struct AccessTokenRequest<'a> {
    repositories: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

pub struct GitHubAppExchange {
    client: reqwest::Client,
    key: EncodingKey,
    settings: GitHubAppSettings,
}

impl std::fmt::Debug for GitHubAppExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubAppExchange")
            .field("app_id", &self.settings.app_id)
            .field("installation_id", &self.settings.installation_id)
            .field("api_base", &self.settings.api_base)
            .finish_non_exhaustive()
    }
}

impl GitHubAppExchange {
    pub fn new(settings: GitHubAppSettings) -> Result<Self, ExchangeError> {
        let key = EncodingKey::from_rsa_pem(settings.private_key.as_bytes())?;
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .user_agent(concat!("sandbox-controller/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;
        Ok(Self {
            client,
            key,
            settings,
        })
    }

    fn assertion(&self) -> Result<String, ExchangeError> {
        let now = Utc::now().timestamp();
        let claims = AppClaims {
            iat: now - ASSERTION_BACKDATE_SECS,
            exp: now + ASSERTION_LIFETIME_SECS,
            iss: &self.settings.app_id,
        };
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &self.key,
        )?)
    }

    async fn attempt(&self, repository: &str) -> Result<CredentialGrant, ExchangeError> {
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.settings.api_base.trim_end_matches('/'),
            self.settings.installation_id
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.assertion()?)
            .header(header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
            .json(&AccessTokenRequest {
                repositories: [repository],
            })
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let body: AccessTokenResponse = response
                .json()
                .await
                .map_err(|e| ExchangeError::Transient(format!("malformed token response: {e}")))?;
            return Ok(CredentialGrant {
                credential: body.token,
                expires_at: body.expires_at,
            });
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(ExchangeError::Transient(format!("{status}: {body}")))
        } else {
            Err(ExchangeError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl CredentialExchange for GitHubAppExchange {
    async fn exchange(&self, repository: &RepositoryRef) -> Result<CredentialGrant, ExchangeError> {
        let (_, name) = repository
            .slug()
            .ok_or_else(|| ExchangeError::InvalidRepository(repository.url.clone()))?;

        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.attempt(&name).await {
                Ok(grant) => return Ok(grant),
                Err(ExchangeError::Transient(reason)) if attempt < max_attempts => {
                    let delay = self.settings.initial_backoff * 2u32.saturating_pow(attempt - 1);
                    warn!(attempt, %reason, ?delay, "Token exchange failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Token exchange gave up");
                    return Err(e);
                }
            }
        }
    }
}
