//! GitHub REST client and the trait seam the engine consumes.
//!
//! The merge state machine and the webhook ingress talk to [`GithubApi`]
//! only, so tests substitute recording doubles. [`GithubClient`] is the
//! production implementation: installation-token auth with a process-wide
//! cache, bounded retries for idempotent calls, and rate-limit translation
//! into the per-installation throttle.

mod client;

pub use self::client::GithubClient;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{CheckSuite, CombinedStatus, MergeMethod, PullRequest};
use crate::settings::Settings;
use crate::store::Store;

/// Client-level failure surfaced to the worker.
#[derive(Error, Debug)]
pub enum GithubError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JWT signing failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),
}

/// Forge operations the engine relies on.
///
/// Implementations return typed, defensively parsed results; endpoint
/// failures that have a safe degenerate value (empty list, pending status)
/// degrade to it rather than erroring.
#[async_trait]
pub trait GithubApi: Send + Sync {
    /// Pull requests associated with a commit SHA.
    async fn list_prs_for_commit(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> Result<Vec<PullRequest>, GithubError>;

    /// Fetch one pull request; `None` when missing or unparseable.
    async fn get_pr(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<Option<PullRequest>, GithubError>;

    /// Combined commit status for a head SHA.
    async fn get_combined_status(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> Result<CombinedStatus, GithubError>;

    /// Check suites for a head SHA.
    async fn list_check_suites(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> Result<Vec<CheckSuite>, GithubError>;

    /// Bring the PR branch up to date with its base; true on 200/202.
    async fn update_branch(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<bool, GithubError>;

    /// Merge the PR. Not idempotent: never retried at the HTTP layer.
    async fn merge_pr(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        method: MergeMethod,
        title: &str,
        body: &str,
    ) -> Result<(bool, String), GithubError>;

    /// Load a file from the repository's default branch.
    async fn load_repo_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
    ) -> Result<Option<String>, GithubError>;
}

/// Builds installation-scoped [`GithubApi`] clients.
///
/// The seam lets the server and drain tests inject doubles without a
/// network.
pub trait GithubFactory: Send + Sync {
    fn client(&self, installation_id: u64) -> Arc<dyn GithubApi>;
}

/// Production factory: one shared HTTP connection pool, one client handle
/// per installation.
pub struct RestGithubFactory {
    settings: Arc<Settings>,
    store: Arc<dyn Store>,
    http: reqwest::Client,
}

impl std::fmt::Debug for RestGithubFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestGithubFactory").finish()
    }
}

impl RestGithubFactory {
    pub fn new(settings: Arc<Settings>, store: Arc<dyn Store>) -> Self {
        Self {
            settings,
            store,
            http: reqwest::Client::new(),
        }
    }
}

impl GithubFactory for RestGithubFactory {
    fn client(&self, installation_id: u64) -> Arc<dyn GithubApi> {
        Arc::new(GithubClient::new(
            Arc::clone(&self.settings),
            Arc::clone(&self.store),
            self.http.clone(),
            installation_id,
        ))
    }
}
