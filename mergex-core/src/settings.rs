//! Environment-provided service settings.
//!
//! Every knob the engine honors is read once at startup from the process
//! environment. Unset variables fall back to the documented defaults; the
//! required secrets (`APP_ID`, `APP_PRIVATE_KEY`, `WEBHOOK_SECRET`) default
//! to empty strings so failures surface explicitly at first use rather than
//! at boot.

use std::env;
use std::fs;

use tracing::warn;

/// Runtime configuration for the engine and its collaborators.
#[derive(Debug, Clone)]
pub struct Settings {
    /// GitHub App id used as the JWT issuer.
    pub app_id: String,
    /// PEM contents of the GitHub App private key.
    ///
    /// `APP_PRIVATE_KEY` is expected to be a filesystem path to the PEM
    /// file; a raw PEM string is accepted directly for compatibility.
    pub app_private_key: String,
    /// Shared secret for webhook HMAC verification.
    pub webhook_secret: String,

    /// Redis connection URL.
    pub redis_url: String,
    /// Prefix for every key the engine writes.
    pub redis_namespace: String,
    /// TTL of the per-repo worker lease.
    pub redis_lock_ttl_seconds: u64,
    /// Interval between lease heartbeats; keep well under the lock TTL.
    pub redis_heartbeat_seconds: u64,

    /// Base URL of the GitHub REST API, without a trailing slash.
    pub github_api_url: String,
    /// Reported by `/healthz` and the `service_info` metric.
    pub service_version: String,

    /// Engage backpressure when the remaining rate budget drops to this.
    pub rate_limit_min_remaining: i64,
    /// Throttle duration when the response carries no usable reset hint.
    pub rate_limit_cooldown_seconds: u64,
    /// Upper bound for the random jitter added to throttle deadlines.
    pub rate_limit_jitter_seconds: u64,
    /// Cap for retry backoff delays and throttle-deferred drains.
    pub max_backoff_seconds: u64,

    /// First retry delay for transiently failed items.
    pub backoff_base_seconds: f64,
    /// Multiplier applied per additional retry.
    pub backoff_factor: f64,
    /// Transient failures tolerated before an item is dead-lettered.
    pub max_retries: u32,
    /// Wall-time budget per item before the starvation guard requeues it.
    pub max_item_window_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_private_key: String::new(),
            webhook_secret: String::new(),
            redis_url: "redis://localhost:6379/0".to_string(),
            redis_namespace: "automerge".to_string(),
            redis_lock_ttl_seconds: 60,
            redis_heartbeat_seconds: 15,
            github_api_url: "https://api.github.com".to_string(),
            service_version: "dev".to_string(),
            rate_limit_min_remaining: 50,
            rate_limit_cooldown_seconds: 60,
            rate_limit_jitter_seconds: 15,
            max_backoff_seconds: 120,
            backoff_base_seconds: 5.0,
            backoff_factor: 2.0,
            max_retries: 5,
            max_item_window_seconds: 1800,
        }
    }
}

impl Settings {
    /// Load settings from the process environment on top of the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            app_id: env_string("APP_ID", &defaults.app_id),
            app_private_key: load_private_key(),
            webhook_secret: env_string("WEBHOOK_SECRET", &defaults.webhook_secret),
            redis_url: env_string("REDIS_URL", &defaults.redis_url),
            redis_namespace: env_string("REDIS_NAMESPACE", &defaults.redis_namespace),
            redis_lock_ttl_seconds: env_parse("REDIS_LOCK_TTL_SECONDS", defaults.redis_lock_ttl_seconds),
            redis_heartbeat_seconds: env_parse(
                "REDIS_HEARTBEAT_SECONDS",
                defaults.redis_heartbeat_seconds,
            ),
            github_api_url: env_string("GITHUB_API_URL", &defaults.github_api_url)
                .trim_end_matches('/')
                .to_string(),
            service_version: env_string("SERVICE_VERSION", &defaults.service_version),
            rate_limit_min_remaining: env_parse(
                "RATE_LIMIT_MIN_REMAINING",
                defaults.rate_limit_min_remaining,
            ),
            rate_limit_cooldown_seconds: env_parse(
                "RATE_LIMIT_COOLDOWN_SECONDS",
                defaults.rate_limit_cooldown_seconds,
            ),
            rate_limit_jitter_seconds: env_parse(
                "RATE_LIMIT_JITTER_SECONDS",
                defaults.rate_limit_jitter_seconds,
            ),
            max_backoff_seconds: env_parse("MAX_BACKOFF_SECONDS", defaults.max_backoff_seconds),
            backoff_base_seconds: env_parse("BACKOFF_BASE_SECONDS", defaults.backoff_base_seconds),
            backoff_factor: env_parse("BACKOFF_FACTOR", defaults.backoff_factor),
            max_retries: env_parse("MAX_RETRIES", defaults.max_retries),
            max_item_window_seconds: env_parse(
                "MAX_ITEM_WINDOW_SECONDS",
                defaults.max_item_window_seconds,
            ),
        }
    }

    /// Build a namespaced store key from its parts.
    pub fn redis_key(&self, parts: &[&str]) -> String {
        let mut key = String::with_capacity(
            self.redis_namespace.len() + parts.iter().map(|p| p.len() + 1).sum::<usize>(),
        );
        key.push_str(&self.redis_namespace);
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        key
    }
}

fn env_string(name: &str, default: &str) -> String {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(value) => value.trim().parse().unwrap_or_else(|_| {
            warn!("invalid value for {name}, using default");
            default
        }),
        Err(_) => default,
    }
}

/// Resolve `APP_PRIVATE_KEY` as a file path, falling back to treating the
/// value as PEM contents when it is not a readable file.
fn load_private_key() -> String {
    let raw = env::var("APP_PRIVATE_KEY").unwrap_or_default();
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }
    match fs::read_to_string(raw) {
        Ok(contents) => contents.trim().to_string(),
        Err(_) => {
            if !(raw.contains("-----BEGIN") && raw.contains("PRIVATE KEY-----")) {
                warn!("APP_PRIVATE_KEY is neither a readable file nor a PEM string");
            }
            raw.to_string()
        }
    }
}
