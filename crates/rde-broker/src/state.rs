//! Global broker state

use std::sync::Arc;

use rde_core::config::BrokerConfig;
use rde_core::{ConfigError, IdentifierOwnership, OwnershipLookup, StaticOwners};

use crate::activity::ActivityTracker;
use crate::auth::{AuthGuard, JwksCache};
use crate::dispatch::Dispatcher;
use crate::registry::SessionRegistry;

/// State shared by every broker connection
pub struct BrokerState {
    /// Configuration
    pub config: BrokerConfig,
    /// Active agent sessions
    pub registry: Arc<SessionRegistry>,
    /// Per-agent activity, served on the management API
    pub activity: Arc<ActivityTracker>,
    /// Token verification
    pub auth: Arc<AuthGuard>,
    /// User connection routing
    pub dispatcher: Arc<Dispatcher>,
}

impl BrokerState {
    pub fn new(config: BrokerConfig, jwks: Arc<JwksCache>) -> Result<Self, ConfigError> {
        let ownership: Arc<dyn OwnershipLookup> = if config.owners.is_empty() {
            Arc::new(IdentifierOwnership)
        } else {
            Arc::new(StaticOwners::new(config.owners.clone()))
        };
        let auth = Arc::new(AuthGuard::new(config.auth.clone(), jwks, ownership)?);

        let activity = Arc::new(ActivityTracker::new());
        let registry = Arc::new(SessionRegistry::new(activity.clone()));
        let dispatcher = Arc::new(Dispatcher::new(&config, registry.clone(), activity.clone()));

        Ok(Self {
            config,
            registry,
            activity,
            auth,
            dispatcher,
        })
    }

    /// Whether the broker can verify tokens yet
    pub fn is_ready(&self) -> bool {
        self.auth.jwks().is_ready()
    }
}
