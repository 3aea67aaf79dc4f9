//! Liveness and readiness endpoints

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const SERVICE: &str = "kuberde-controller";

/// What the readiness probe looks at
#[derive(Clone)]
pub struct HealthState {
    /// Set once the watch cache holds the initial listing
    synced: Arc<AtomicBool>,
    leader: watch::Receiver<bool>,
}

impl HealthState {
    pub fn new(synced: Arc<AtomicBool>, leader: watch::Receiver<bool>) -> Self {
        Self { synced, leader }
    }

    /// A standby is ready; a leader once its cache is synced
    pub fn is_ready(&self) -> bool {
        !*self.leader.borrow() || self.synced.load(Ordering::Acquire)
    }
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/healthz", get(live))
        .route("/livez", get(live))
        .route("/readyz", get(ready))
        .with_state(state)
}

async fn live() -> Json<Value> {
    Json(json!({ "status": "ok", "service": SERVICE }))
}

async fn ready(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    let leader = *state.leader.borrow();
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(json!({ "status": "ready", "service": SERVICE, "leader": leader })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not ready", "reason": "watch cache not synced", "leader": leader })),
        )
    }
}

/// Serve the probes on `address` until `cancel` fires
pub async fn serve(address: &str, state: HealthState, cancel: CancellationToken) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    tracing::info!("Health endpoints listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn status(state: &HealthState, uri: &str) -> StatusCode {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        router(state.clone()).oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_liveness() {
        let (_tx, rx) = watch::channel(false);
        let state = HealthState::new(Arc::new(AtomicBool::new(false)), rx);
        assert_eq!(status(&state, "/healthz").await, StatusCode::OK);
        assert_eq!(status(&state, "/livez").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_follows_leadership_and_sync() {
        let (tx, rx) = watch::channel(false);
        let synced = Arc::new(AtomicBool::new(false));
        let state = HealthState::new(synced.clone(), rx);

        // Standby
        assert_eq!(status(&state, "/readyz").await, StatusCode::OK);

        tx.send(true).unwrap();
        assert_eq!(status(&state, "/readyz").await, StatusCode::SERVICE_UNAVAILABLE);

        synced.store(true, Ordering::Release);
        assert_eq!(status(&state, "/readyz").await, StatusCode::OK);
    }
}
