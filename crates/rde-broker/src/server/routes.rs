//! Route table, subdomain proxying, management and health endpoints

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};

use rde_core::{AgentStats, ErrorBody};

use super::{agent, user};
use crate::auth::extract_token;
use crate::error::{ApiError, AuthError};
use crate::state::BrokerState;

/// Build the broker router
pub fn router(state: Arc<BrokerState>) -> Router {
    Router::new()
        .route("/connect/:agent_id", get(agent::connect))
        .route("/ssh/:agent_id", get(user::interactive))
        .route("/proxy/:agent_id", any(user::proxy_root))
        .route("/proxy/:agent_id/", any(user::proxy_root))
        .route("/proxy/:agent_id/*rest", any(user::proxy_path))
        .route("/mgmt/agents/:agent_id", get(agent_stats))
        .route("/healthz", get(health))
        .route("/livez", get(health))
        .route("/readyz", get(ready))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), subdomain_proxy))
        .with_state(state)
}

/// Requests for `{agent_id}.{agent_domain}` go to that agent whatever the path
async fn subdomain_proxy(State(state): State<Arc<BrokerState>>, request: Request, next: Next) -> Response {
    let target = state
        .config
        .agent_domain
        .as_deref()
        .and_then(|domain| subdomain_agent(request.headers(), domain))
        .map(str::to_string);

    match target {
        Some(target) => {
            let path = request.uri().path().to_string();
            user::proxy(&state, &target, &path, request).await.into_response()
        }
        None => next.run(request).await,
    }
}

/// The agent label of a `Host` one level below `domain`
fn subdomain_agent<'a>(headers: &'a HeaderMap, domain: &str) -> Option<&'a str> {
    let host = headers.get(header::HOST)?.to_str().ok()?;
    let host = host.rsplit_once(':').map_or(host, |(name, _port)| name);
    let label = host
        .strip_suffix(domain.trim_start_matches('.'))?
        .strip_suffix('.')?;
    (!label.is_empty() && !label.contains('.')).then_some(label)
}

/// `GET /mgmt/agents/{agent_id}`
async fn agent_stats(
    State(state): State<Arc<BrokerState>>,
    Path(target): Path<String>,
    headers: HeaderMap,
) -> Result<Json<AgentStats>, ApiError> {
    let token = extract_token(&headers, None).ok_or(AuthError::MissingToken)?;
    let (id, _) = state.auth.authorize_management(token, &target)?;
    state
        .activity
        .snapshot(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No activity recorded for {}", id)))
}

async fn health() -> &'static str {
    "ok"
}

async fn ready(State(state): State<Arc<BrokerState>>) -> (StatusCode, &'static str) {
    if state.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "signing keys not loaded")
    }
}

async fn not_found() -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody::new("not_found", "No such route", false)),
    )
}
