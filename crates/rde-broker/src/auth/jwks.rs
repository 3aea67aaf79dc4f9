//! Signing key cache
//!
//! Requests verify against the last key set that loaded successfully and
//! never wait for a fetch. A background task refreshes the set on a fixed
//! period, and early when a token names a key the set does not contain
//! (the identity provider rotated its keys).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::jwk::{Jwk, JwkSet};
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AuthError;

/// Minimum spacing of refreshes triggered by unknown key ids
const MIN_ON_DEMAND_INTERVAL: Duration = Duration::from_secs(30);

/// Retry period while no key set has loaded yet
const INITIAL_RETRY: Duration = Duration::from_secs(5);

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Cached JWKS of the identity provider
pub struct JwksCache {
    url: String,
    http: reqwest::Client,
    keys: RwLock<Option<Arc<JwkSet>>>,
    refresh_pending: AtomicBool,
    refresh_wanted: Notify,
}

impl JwksCache {
    pub fn new(url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            http,
            keys: RwLock::new(None),
            refresh_pending: AtomicBool::new(false),
            refresh_wanted: Notify::new(),
        }
    }

    /// A cache preloaded with `keys` and no endpoint
    pub fn with_keys(keys: JwkSet) -> Self {
        let cache = Self::new(String::new());
        *cache.keys.write() = Some(Arc::new(keys));
        cache
    }

    /// Whether a key set has been loaded
    pub fn is_ready(&self) -> bool {
        self.keys.read().is_some()
    }

    pub fn current(&self) -> Option<Arc<JwkSet>> {
        self.keys.read().clone()
    }

    /// Key for a token header's `kid`
    ///
    /// Without a `kid` the set must hold exactly one key. An unknown `kid`
    /// schedules a refresh and fails this request.
    pub fn find(&self, kid: Option<&str>) -> Result<Jwk, AuthError> {
        let keys = self.current().ok_or(AuthError::KeysUnavailable)?;
        match kid {
            Some(kid) => match keys.find(kid) {
                Some(jwk) => Ok(jwk.clone()),
                None => {
                    self.request_refresh();
                    Err(AuthError::UnknownKey(kid.to_string()))
                }
            },
            None => match keys.keys.as_slice() {
                [only] => Ok(only.clone()),
                _ => Err(AuthError::InvalidToken("token header has no kid".into())),
            },
        }
    }

    /// Ask the refresh task for an early refresh. Only one request is
    /// outstanding at a time.
    pub fn request_refresh(&self) {
        if !self.refresh_pending.swap(true, Ordering::AcqRel) {
            self.refresh_wanted.notify_one();
        }
    }

    /// Fetch the key set now, replacing the cached one on success
    pub async fn refresh(&self) -> Result<usize, AuthError> {
        let keys: JwkSet = self
            .http
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let count = keys.keys.len();
        *self.keys.write() = Some(Arc::new(keys));
        debug!(keys = count, "Refreshed signing keys");
        Ok(count)
    }

    /// Keep the cache fresh until `cancel` fires
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut last_refresh: Option<Instant> = None;
            loop {
                match cache.refresh().await {
                    Ok(count) => {
                        if last_refresh.is_none() {
                            info!(keys = count, url = %cache.url, "Loaded signing keys");
                        }
                        last_refresh = Some(Instant::now());
                    }
                    Err(e) => warn!("Failed to refresh signing keys from {}: {}", cache.url, e),
                }
                cache.refresh_pending.store(false, Ordering::Release);

                let period = if cache.is_ready() { interval } else { INITIAL_RETRY };
                let next = Instant::now() + period;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep_until(next) => break,
                        _ = cache.refresh_wanted.notified() => {
                            let recent = last_refresh
                                .map(|at| at.elapsed() < MIN_ON_DEMAND_INTERVAL)
                                .unwrap_or(false);
                            if recent {
                                cache.refresh_pending.store(false, Ordering::Release);
                                continue;
                            }
                            break;
                        }
                    }
                }
            }
        })
    }
}
