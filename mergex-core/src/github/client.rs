//! Production GitHub REST client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use rand::Rng;
use reqwest::Method;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, USER_AGENT};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{GithubApi, GithubError};
use crate::metrics;
use crate::models::{CheckSuite, CombinedStatus, MergeMethod, PullRequest};
use crate::settings::Settings;
use crate::store::Store;
use crate::throttle::ThrottleGate;
use crate::util::epoch_seconds;

/// Refresh a cached installation token when its remaining lifetime drops
/// under this margin.
const TOKEN_SAFETY_MARGIN_SECONDS: f64 = 120.0;

const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: f64,
}

/// Process-wide installation token cache, keyed by installation id and
/// shared by every client handle.
static TOKEN_CACHE: Lazy<DashMap<u64, CachedToken>> = Lazy::new(DashMap::new);

/// Per-installation refresh locks. Concurrent callers that both observe a
/// stale or missing token converge on one in-flight exchange instead of
/// minting independently.
static TOKEN_LOCKS: Lazy<DashMap<u64, Arc<tokio::sync::Mutex<()>>>> = Lazy::new(DashMap::new);

/// Cached token for the installation, unless its remaining lifetime is
/// inside the safety margin.
fn cached_token(installation_id: u64) -> Option<String> {
    let cached = TOKEN_CACHE.get(&installation_id)?;
    if epoch_seconds() < cached.expires_at - TOKEN_SAFETY_MARGIN_SECONDS {
        Some(cached.token.clone())
    } else {
        None
    }
}

fn refresh_lock(installation_id: u64) -> Arc<tokio::sync::Mutex<()>> {
    TOKEN_LOCKS
        .entry(installation_id)
        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
        .clone()
}

/// Buffered response: status, headers, and body read eagerly so the
/// rate-limit handler can inspect the payload without consuming anything
/// the caller still needs.
#[derive(Debug)]
struct ApiResponse {
    status: u16,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl ApiResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn header_i64(&self, name: &str) -> Option<i64> {
        self.header(name).and_then(|v| v.trim().parse().ok())
    }

    fn json<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_slice(&self.body).ok()
    }

    fn is_json(&self) -> bool {
        self.header("content-type")
            .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("application/json"))
    }
}

/// Installation-scoped GitHub REST client.
pub struct GithubClient {
    installation_id: u64,
    settings: Arc<Settings>,
    http: reqwest::Client,
    throttle: ThrottleGate,
}

impl std::fmt::Debug for GithubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubClient")
            .field("installation_id", &self.installation_id)
            .finish()
    }
}

#[derive(serde::Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
    #[serde(default)]
    expires_at: Option<String>,
}

impl GithubClient {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn Store>,
        http: reqwest::Client,
        installation_id: u64,
    ) -> Self {
        let throttle = ThrottleGate::new(store, Arc::clone(&settings), installation_id);
        Self {
            installation_id,
            settings,
            http,
            throttle,
        }
    }

    /// Short-lived app JWT used only for the token exchange.
    fn app_jwt(&self) -> Result<String, GithubError> {
        let now = chrono::Utc::now().timestamp();
        let claims = AppClaims {
            iat: now - 60,
            exp: now + 600,
            iss: self.settings.app_id.clone(),
        };
        let key = jsonwebtoken::EncodingKey::from_rsa_pem(
            self.settings.app_private_key.as_bytes(),
        )?;
        Ok(jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &key,
        )?)
    }

    /// Installation token, minted through the shared cache.
    ///
    /// The exchange runs under a per-installation lock: whoever wins the
    /// race refreshes, everyone else re-reads the cache.
    async fn installation_token(&self) -> Result<String, GithubError> {
        if let Some(token) = cached_token(self.installation_id) {
            return Ok(token);
        }

        let lock = refresh_lock(self.installation_id);
        let _guard = lock.lock().await;
        // A concurrent refresh may have landed while we waited.
        if let Some(token) = cached_token(self.installation_id) {
            return Ok(token);
        }

        let jwt = self.app_jwt()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.settings.github_api_url, self.installation_id
        );
        let endpoint = "POST /app/installations/{id}/access_tokens";
        debug!(
            installation = self.installation_id,
            "github.request: token exchange"
        );
        let start = Instant::now();
        let result = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(30))
            .header(AUTHORIZATION, format!("Bearer {jwt}"))
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, "mergex/0.1")
            .send()
            .await;
        metrics::GITHUB_API_LATENCY_SECONDS
            .with_label_values(&[endpoint])
            .observe(start.elapsed().as_secs_f64());

        let resp = result?;
        let status = resp.status();
        metrics::GITHUB_API_REQUESTS
            .with_label_values(&[endpoint, status.as_str()])
            .inc();
        if !status.is_success() {
            return Err(GithubError::TokenExchange(format!(
                "status {status} for installation {}",
                self.installation_id
            )));
        }

        let data: TokenResponse = resp
            .json()
            .await
            .map_err(|e| GithubError::TokenExchange(format!("invalid token payload: {e}")))?;
        let expires_at = data
            .expires_at
            .as_deref()
            .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.timestamp() as f64)
            .unwrap_or_else(|| epoch_seconds() + 3600.0);
        TOKEN_CACHE.insert(
            self.installation_id,
            CachedToken {
                token: data.token.clone(),
                expires_at,
            },
        );
        Ok(data.token)
    }

    /// Issue one API request with bounded retries.
    ///
    /// 5xx responses and transport errors retry regardless of method;
    /// 429/403 retry only for idempotent calls, and the merge endpoint is
    /// never retried. Every observed response feeds the rate-limit
    /// handler.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<ApiResponse, GithubError> {
        let url = if path.starts_with("http") {
            path.to_string()
        } else {
            format!(
                "{}/{}",
                self.settings.github_api_url,
                path.trim_start_matches('/')
            )
        };
        let endpoint = format!(
            "{} {}",
            method,
            if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{path}")
            }
        );
        let idempotent =
            (method == Method::GET || method == Method::PUT) && !path.ends_with("/merge");

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let token = self.installation_token().await?;
            let mut req = self
                .http
                .request(method.clone(), &url)
                .timeout(Duration::from_secs(60))
                .header(AUTHORIZATION, format!("token {token}"))
                .header(ACCEPT, "application/vnd.github+json")
                .header(USER_AGENT, "mergex/0.1");
            if let Some(body) = body {
                req = req.json(body);
            }

            debug!(
                %endpoint,
                installation = self.installation_id,
                attempt = attempts,
                "github.request"
            );
            let start = Instant::now();
            let result = req.send().await;
            let duration = start.elapsed();
            metrics::GITHUB_API_LATENCY_SECONDS
                .with_label_values(&[&endpoint])
                .observe(duration.as_secs_f64());

            let retry = match &result {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    status >= 500 || ((status == 429 || status == 403) && idempotent)
                }
                Err(_) => true,
            };

            match result {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    metrics::GITHUB_API_REQUESTS
                        .with_label_values(&[&endpoint, &status.to_string()])
                        .inc();
                    let headers = resp.headers().clone();
                    let body = resp.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
                    let response = ApiResponse {
                        status,
                        headers,
                        body,
                    };
                    self.handle_rate_limit(&response).await;
                    debug!(
                        %endpoint,
                        status,
                        duration_ms = duration.as_millis() as u64,
                        installation = self.installation_id,
                        attempt = attempts,
                        "github.response"
                    );
                    if !retry || attempts >= MAX_ATTEMPTS {
                        return Ok(response);
                    }
                }
                Err(e) => {
                    metrics::GITHUB_API_REQUESTS
                        .with_label_values(&[&endpoint, "exc"])
                        .inc();
                    debug!(
                        %endpoint,
                        error = %e,
                        installation = self.installation_id,
                        attempt = attempts,
                        "github.response_error"
                    );
                    if attempts >= MAX_ATTEMPTS {
                        return Err(e.into());
                    }
                }
            }

            let sleep_seconds = (self.settings.backoff_base_seconds
                * self
                    .settings
                    .backoff_factor
                    .powi(attempts.saturating_sub(1) as i32))
            .min(self.settings.max_backoff_seconds as f64);
            debug!(
                %endpoint,
                sleep_seconds,
                attempt = attempts,
                "github.retry"
            );
            tokio::time::sleep(Duration::from_secs_f64(sleep_seconds)).await;
        }
    }

    /// Track rate-limit headers and engage the installation throttle when
    /// the response signals limiting or the remaining budget is low.
    async fn handle_rate_limit(&self, resp: &ApiResponse) {
        let installation = self.installation_id.to_string();
        let remaining = resp.header_i64("x-ratelimit-remaining");
        let reset = resp.header_i64("x-ratelimit-reset");
        if let Some(remaining) = remaining {
            metrics::GITHUB_RATE_LIMIT_REMAINING
                .with_label_values(&[&installation])
                .set(remaining as f64);
        }
        if let Some(reset) = reset {
            metrics::GITHUB_RATE_LIMIT_RESET
                .with_label_values(&[&installation])
                .set(reset as f64);
        }

        let low_budget =
            remaining.is_some_and(|r| r <= self.settings.rate_limit_min_remaining);
        if !(resp.status == 429 || resp.status == 403 || low_budget) {
            return;
        }

        let secondary = resp.status == 403
            && resp.is_json()
            && resp
                .json::<serde_json::Value>()
                .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
                .is_some_and(|m| m.to_lowercase().contains("secondary"));
        let reason = classify_reason(resp.status, secondary);

        let now = epoch_seconds();
        let retry_after = resp.header_i64("retry-after");
        let until = throttle_deadline(
            now,
            retry_after,
            reset,
            self.settings.rate_limit_cooldown_seconds,
        );
        let max_jitter = self.settings.rate_limit_jitter_seconds.min(15) as f64;
        let jitter = if max_jitter > 0.0 {
            rand::rng().random_range(0.0..=max_jitter)
        } else {
            0.0
        };
        self.throttle.set(until + jitter, reason).await;
        metrics::THROTTLES
            .with_label_values(&["installation", reason])
            .inc();
    }
}

/// Advisory throttle reason from the status code and message.
fn classify_reason(status: u16, secondary_message: bool) -> &'static str {
    if status == 429 {
        "retry_after"
    } else if status == 403 && secondary_message {
        "secondary"
    } else {
        "primary"
    }
}

/// Resume deadline: `Retry-After` wins, then the reset epoch, then the
/// configured cooldown.
fn throttle_deadline(
    now: f64,
    retry_after: Option<i64>,
    reset_epoch: Option<i64>,
    cooldown_seconds: u64,
) -> f64 {
    if let Some(retry_after) = retry_after {
        return now + retry_after as f64;
    }
    if let Some(reset) = reset_epoch {
        return reset as f64;
    }
    now + cooldown_seconds as f64
}

#[async_trait::async_trait]
impl GithubApi for GithubClient {
    async fn list_prs_for_commit(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> Result<Vec<PullRequest>, GithubError> {
        let resp = self
            .request(
                Method::GET,
                &format!("/repos/{owner}/{repo}/commits/{sha}/pulls"),
                None,
            )
            .await?;
        if resp.status != 200 {
            return Ok(Vec::new());
        }
        Ok(resp.json().unwrap_or_default())
    }

    async fn get_pr(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<Option<PullRequest>, GithubError> {
        let resp = self
            .request(
                Method::GET,
                &format!("/repos/{owner}/{repo}/pulls/{number}"),
                None,
            )
            .await?;
        if resp.status != 200 {
            return Ok(None);
        }
        Ok(resp.json())
    }

    async fn get_combined_status(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> Result<CombinedStatus, GithubError> {
        let resp = self
            .request(
                Method::GET,
                &format!("/repos/{owner}/{repo}/commits/{sha}/status"),
                None,
            )
            .await?;
        if resp.status != 200 {
            return Ok(CombinedStatus::pending());
        }
        Ok(resp.json().unwrap_or_else(CombinedStatus::pending))
    }

    async fn list_check_suites(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> Result<Vec<CheckSuite>, GithubError> {
        #[derive(Deserialize, Default)]
        struct CheckSuites {
            #[serde(default)]
            check_suites: Vec<CheckSuite>,
        }
        let resp = self
            .request(
                Method::GET,
                &format!("/repos/{owner}/{repo}/commits/{sha}/check-suites"),
                None,
            )
            .await?;
        if resp.status != 200 {
            return Ok(Vec::new());
        }
        Ok(resp.json::<CheckSuites>().unwrap_or_default().check_suites)
    }

    async fn update_branch(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<bool, GithubError> {
        let resp = self
            .request(
                Method::PUT,
                &format!("/repos/{owner}/{repo}/pulls/{number}/update-branch"),
                None,
            )
            .await?;
        Ok(resp.status == 200 || resp.status == 202)
    }

    async fn merge_pr(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        method: MergeMethod,
        title: &str,
        body: &str,
    ) -> Result<(bool, String), GithubError> {
        let payload = serde_json::json!({
            "merge_method": method.as_str(),
            "commit_title": title,
            "commit_message": body,
        });
        let resp = self
            .request(
                Method::PUT,
                &format!("/repos/{owner}/{repo}/pulls/{number}/merge"),
                Some(&payload),
            )
            .await?;
        if resp.status == 200 || resp.status == 201 {
            return Ok((true, format!("Merged PR #{number} via {method}")));
        }
        let detail = resp
            .json::<serde_json::Value>()
            .map(|v| v.to_string())
            .unwrap_or_else(|| String::from_utf8_lossy(&resp.body).into_owned());
        Ok((
            false,
            format!("Merge failed for PR #{number}: {} {detail}", resp.status),
        ))
    }

    async fn load_repo_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
    ) -> Result<Option<String>, GithubError> {
        let resp = self
            .request(
                Method::GET,
                &format!("/repos/{owner}/{repo}/contents/{path}"),
                None,
            )
            .await?;
        if resp.status != 200 {
            return Ok(None);
        }
        let Some(data) = resp.json::<serde_json::Value>() else {
            return Ok(None);
        };
        if data.get("encoding").and_then(|e| e.as_str()) != Some("base64") {
            return Ok(None);
        }
        let content: String = data
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        match BASE64
            .decode(content)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
        {
            Some(text) => Ok(Some(text)),
            None => {
                warn!(owner, repo, path, "failed to decode repo file contents");
                metrics::CONFIG_LOAD_FAILURES.inc();
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_takes_priority_over_reset() {
        let until = throttle_deadline(1000.0, Some(5), Some(2000), 60);
        assert_eq!(until, 1005.0);
    }

    #[test]
    fn reset_epoch_used_when_no_retry_after() {
        let until = throttle_deadline(1000.0, None, Some(2000), 60);
        assert_eq!(until, 2000.0);
    }

    #[test]
    fn cooldown_is_the_fallback() {
        let until = throttle_deadline(1000.0, None, None, 60);
        assert_eq!(until, 1060.0);
    }

    #[test]
    fn reason_classification() {
        assert_eq!(classify_reason(429, false), "retry_after");
        assert_eq!(classify_reason(403, true), "secondary");
        assert_eq!(classify_reason(403, false), "primary");
        // Low-budget throttling on an otherwise fine response
        assert_eq!(classify_reason(200, false), "primary");
    }

    // Installation ids unique per test: the cache is a process-wide static
    // shared across the parallel test threads.

    #[test]
    fn token_cache_is_shared_across_reads() {
        let installation = 910_001;
        TOKEN_CACHE.insert(
            installation,
            CachedToken {
                token: "long-lived".to_string(),
                expires_at: epoch_seconds() + 3600.0,
            },
        );

        assert_eq!(cached_token(installation).as_deref(), Some("long-lived"));
        // A second reader gets the same entry without another exchange.
        assert_eq!(cached_token(installation).as_deref(), Some("long-lived"));

        TOKEN_CACHE.remove(&installation);
    }

    #[test]
    fn token_inside_safety_margin_forces_refresh() {
        let installation = 910_002;
        // 30s of lifetime left, under the 120s margin: treated as expiring.
        TOKEN_CACHE.insert(
            installation,
            CachedToken {
                token: "short-lived".to_string(),
                expires_at: epoch_seconds() + 30.0,
            },
        );

        assert_eq!(cached_token(installation), None);

        TOKEN_CACHE.remove(&installation);
    }

    #[test]
    fn missing_or_expired_tokens_miss_the_cache() {
        let installation = 910_003;
        assert_eq!(cached_token(installation), None);

        TOKEN_CACHE.insert(
            installation,
            CachedToken {
                token: "stale".to_string(),
                expires_at: epoch_seconds() - 10.0,
            },
        );
        assert_eq!(cached_token(installation), None);

        TOKEN_CACHE.remove(&installation);
    }

    #[test]
    fn refresh_lock_is_one_per_installation() {
        let installation = 910_004;
        let first = refresh_lock(installation);
        let second = refresh_lock(installation);
        assert!(Arc::ptr_eq(&first, &second));

        let other = refresh_lock(910_005);
        assert!(!Arc::ptr_eq(&first, &other));
    }
}
