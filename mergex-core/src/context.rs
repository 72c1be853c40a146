//! Shared handles for everything the engine touches.

use std::fmt;
use std::sync::Arc;

use crate::github::{GithubFactory, RestGithubFactory};
use crate::lease::LeaseManager;
use crate::queue::RepoQueue;
use crate::settings::Settings;
use crate::store::{RedisStore, Store};
use crate::throttle::ThrottleGate;

/// Process-wide engine context: settings, the external store, and the
/// GitHub client factory. Cheap to share behind an `Arc`; per-repo handles
/// are constructed on demand.
pub struct EngineContext {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn Store>,
    pub github: Arc<dyn GithubFactory>,
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("settings", &self.settings)
            .finish()
    }
}

impl EngineContext {
    /// Connect to the configured Redis instance and build a production
    /// context.
    pub async fn connect(settings: Arc<Settings>) -> crate::Result<Self> {
        let store: Arc<dyn Store> = Arc::new(RedisStore::connect(&settings.redis_url).await?);
        Ok(Self::new(settings, store))
    }

    /// Production context with the REST client factory.
    pub fn new(settings: Arc<Settings>, store: Arc<dyn Store>) -> Self {
        let github = Arc::new(RestGithubFactory::new(
            Arc::clone(&settings),
            Arc::clone(&store),
        ));
        Self {
            settings,
            store,
            github,
        }
    }

    /// Context with an injected GitHub factory, used by tests.
    pub fn with_github(
        settings: Arc<Settings>,
        store: Arc<dyn Store>,
        github: Arc<dyn GithubFactory>,
    ) -> Self {
        Self {
            settings,
            store,
            github,
        }
    }

    /// Queue handle for one repository.
    pub fn queue(&self, installation_id: u64, owner: &str, repo: &str) -> RepoQueue {
        RepoQueue::new(
            Arc::clone(&self.store),
            Arc::clone(&self.settings),
            installation_id,
            owner,
            repo,
        )
    }

    /// Lease handle for one repository.
    pub fn lease(&self, installation_id: u64, owner: &str, repo: &str) -> LeaseManager {
        LeaseManager::new(
            Arc::clone(&self.store),
            Arc::clone(&self.settings),
            installation_id,
            owner,
            repo,
        )
    }

    /// Throttle handle for one installation.
    pub fn throttle(&self, installation_id: u64) -> ThrottleGate {
        ThrottleGate::new(
            Arc::clone(&self.store),
            Arc::clone(&self.settings),
            installation_id,
        )
    }
}
