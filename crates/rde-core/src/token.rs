//! OAuth2 client-credentials tokens
//!
//! Agents and the controller authenticate to the broker with a token
//! obtained from the identity provider's token endpoint. Tokens are cached
//! until shortly before they expire.

use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::OAuthClientConfig;
use crate::error::TokenError;

/// Refresh this long before the reported expiry
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Lifetime assumed when the endpoint does not report `expires_in`
const DEFAULT_LIFETIME: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    access_token: String,
    refresh_at: Instant,
}

/// Fetches and caches client-credentials access tokens
pub struct ClientCredentials {
    http: reqwest::Client,
    config: OAuthClientConfig,
    cached: Mutex<Option<CachedToken>>,
}

impl ClientCredentials {
    pub fn new(config: OAuthClientConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(http: reqwest::Client, config: OAuthClientConfig) -> Self {
        Self {
            http,
            config,
            cached: Mutex::new(None),
        }
    }

    /// A valid access token, fetching a new one if the cached one is stale
    pub async fn token(&self) -> Result<String, TokenError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.access_token.clone());
            }
        }

        let fresh = self.fetch().await?;
        let access_token = fresh.access_token.clone();
        *cached = Some(fresh);
        Ok(access_token)
    }

    /// Drop the cached token, e.g. after the broker rejected it
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn fetch(&self) -> Result<CachedToken, TokenError> {
        debug!(token_url = %self.config.token_url, "Requesting client-credentials token");

        let response = self
            .http
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TokenError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response.json().await?;
        let lifetime = token
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_LIFETIME);

        Ok(CachedToken {
            access_token: token.access_token,
            refresh_at: Instant::now() + lifetime.saturating_sub(EXPIRY_MARGIN),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Form, Json, Router};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn spawn_token_endpoint(expires_in: u64) -> (String, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let app = Router::new().route(
            "/token",
            post(move |Form(form): Form<HashMap<String, String>>| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(form.get("grant_type").map(String::as_str), Some("client_credentials"));
                    if form.get("client_secret").map(String::as_str) != Some("s3cret") {
                        return Err(axum::http::StatusCode::UNAUTHORIZED);
                    }
                    Ok(Json(serde_json::json!({
                        "access_token": format!("token-{}", n),
                        "expires_in": expires_in,
                    })))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/token", addr), calls)
    }

    fn config(token_url: String, secret: &str) -> OAuthClientConfig {
        OAuthClientConfig {
            token_url,
            client_id: "kuberde-agent".into(),
            client_secret: secret.into(),
        }
    }

    #[tokio::test]
    async fn test_token_is_cached() {
        let (url, calls) = spawn_token_endpoint(3600).await;
        let creds = ClientCredentials::new(config(url, "s3cret"));

        assert_eq!(creds.token().await.unwrap(), "token-0");
        assert_eq!(creds.token().await.unwrap(), "token-0");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        creds.invalidate().await;
        assert_eq!(creds.token().await.unwrap(), "token-1");
    }

    #[tokio::test]
    async fn test_short_lived_token_is_refetched() {
        // Lifetime shorter than the margin: never served from cache
        let (url, calls) = spawn_token_endpoint(10).await;
        let creds = ClientCredentials::new(config(url, "s3cret"));

        creds.token().await.unwrap();
        creds.token().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let (url, _calls) = spawn_token_endpoint(3600).await;
        let creds = ClientCredentials::new(config(url, "wrong"));

        match creds.token().await {
            Err(TokenError::Rejected { status, .. }) => assert_eq!(status, 401),
            other => panic!("expected rejection, got {:?}", other.map(|_| ())),
        }
    }
}
