//! Agent activity as reported by the broker

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use rde_core::config::ControllerConfig;
use rde_core::token::ClientCredentials;
use rde_core::{AgentId, AgentStats};

use crate::error::ReconcileError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait ActivitySource: Send + Sync {
    /// Activity snapshot, `None` if the broker has never seen the agent
    async fn stats(&self, agent_id: &AgentId) -> Result<Option<AgentStats>, ReconcileError>;
}

/// Reads `GET {broker_url}/mgmt/agents/{id}`
pub struct BrokerActivity {
    http: reqwest::Client,
    base_url: String,
    credentials: Option<ClientCredentials>,
}

impl BrokerActivity {
    pub fn new(config: &ControllerConfig) -> Result<Self, ReconcileError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ReconcileError::Activity(e.to_string()))?;
        Ok(Self {
            credentials: config
                .broker_auth
                .clone()
                .map(|auth| ClientCredentials::with_client(http.clone(), auth)),
            http,
            base_url: config.broker_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url(&self, agent_id: &AgentId) -> String {
        format!("{}/mgmt/agents/{}", self.base_url, agent_id)
    }
}

#[async_trait]
impl ActivitySource for BrokerActivity {
    async fn stats(&self, agent_id: &AgentId) -> Result<Option<AgentStats>, ReconcileError> {
        let mut request = self.http.get(self.url(agent_id));
        if let Some(credentials) = &self.credentials {
            request = request.bearer_auth(credentials.token().await?);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ReconcileError::Activity(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!(agent_id = %agent_id, "Broker has no activity record");
                Ok(None)
            }
            status if status.is_success() => response
                .json::<AgentStats>()
                .await
                .map(Some)
                .map_err(|e| ReconcileError::Activity(format!("invalid stats payload: {}", e))),
            status => {
                if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
                    if let Some(credentials) = &self.credentials {
                        credentials.invalidate().await;
                    }
                }
                let body = response.text().await.unwrap_or_default();
                Err(ReconcileError::Activity(format!("broker returned {}: {}", status, body)))
            }
        }
    }
}
