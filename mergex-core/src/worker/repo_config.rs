//! Per-repository merge configuration.
//!
//! Loaded from `.github/automerge.yml` (or `.yaml`) on the default branch.
//! The format is a minimal KEY: VALUE subset of YAML with scalar coercion;
//! unknown keys are ignored so repos can carry extra tooling config in the
//! same file.

use std::time::Duration;

use tracing::debug;

use crate::github::GithubApi;
use crate::models::MergeMethod;

/// Effective merge options for one repository.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoConfig {
    /// Label gating eligibility.
    pub label: String,
    /// When false, the label requirement is waived.
    pub require_label: bool,
    pub merge_method: MergeMethod,
    /// Allow issuing update-branch when the PR is behind its base.
    pub update_branch: bool,
    /// Treat behind/blocked mergeable states as not mergeable.
    pub require_up_to_date: bool,
    /// With no statuses and no check suites at all, treat the PR as green.
    pub allow_merge_when_no_checks: bool,
    /// Upper bound for the checks-polling phase.
    pub max_wait_minutes: u64,
    pub poll_interval_seconds: u64,
    pub title_template: String,
    pub body_template: String,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            label: "automerge".to_string(),
            require_label: true,
            merge_method: MergeMethod::Squash,
            update_branch: true,
            require_up_to_date: true,
            allow_merge_when_no_checks: true,
            max_wait_minutes: 60,
            poll_interval_seconds: 10,
            title_template: "{title} (#{number})".to_string(),
            body_template: "{body}\n\nAuto-merged by Auto Merge Bot for PR #{number}"
                .to_string(),
        }
    }
}

impl RepoConfig {
    /// Polling interval for the checks wait, floored at five seconds.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds.max(5))
    }

    /// Parse user config on top of the defaults.
    pub fn from_yaml(text: &str) -> Self {
        let mut cfg = Self::default();
        for (key, value) in parse_simple_yaml(text) {
            cfg.apply(&key, value);
        }
        cfg
    }

    fn apply(&mut self, key: &str, value: ConfigValue) {
        match key {
            "label" => {
                if let ConfigValue::Str(s) = value {
                    self.label = s;
                }
            }
            "require_label" => {
                if let Some(b) = value.as_bool() {
                    self.require_label = b;
                }
            }
            "merge_method" => {
                if let ConfigValue::Str(s) = &value
                    && let Some(method) = MergeMethod::parse(s)
                {
                    self.merge_method = method;
                }
            }
            "update_branch" => {
                if let Some(b) = value.as_bool() {
                    self.update_branch = b;
                }
            }
            "require_up_to_date" => {
                if let Some(b) = value.as_bool() {
                    self.require_up_to_date = b;
                }
            }
            "allow_merge_when_no_checks" => {
                if let Some(b) = value.as_bool() {
                    self.allow_merge_when_no_checks = b;
                }
            }
            "max_wait_minutes" => {
                if let Some(n) = value.as_u64() {
                    self.max_wait_minutes = n;
                }
            }
            "poll_interval_seconds" => {
                if let Some(n) = value.as_u64() {
                    self.poll_interval_seconds = n;
                }
            }
            "title_template" => {
                if let ConfigValue::Str(s) = value {
                    self.title_template = s;
                }
            }
            "body_template" => {
                if let ConfigValue::Str(s) = value {
                    self.body_template = s;
                }
            }
            // Unknown keys are not an error.
            _ => {}
        }
    }
}

/// Scalar value with the coercion ladder bool -> int -> float -> string.
#[derive(Debug, Clone, PartialEq)]
enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ConfigValue {
    fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Int(n) if *n >= 0 => Some(*n as u64),
            _ => None,
        }
    }
}

fn coerce(raw: &str) -> ConfigValue {
    let trimmed = raw
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .to_string();
    match trimmed.to_lowercase().as_str() {
        "true" => return ConfigValue::Bool(true),
        "false" => return ConfigValue::Bool(false),
        _ => {}
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return ConfigValue::Int(n);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return ConfigValue::Float(f);
    }
    ConfigValue::Str(trimmed)
}

fn parse_simple_yaml(text: &str) -> Vec<(String, ConfigValue)> {
    let mut entries = Vec::new();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        entries.push((key.trim().to_string(), coerce(value)));
    }
    entries
}

/// Fetch and parse the repo's merge config, falling back to defaults.
pub async fn load(gh: &dyn GithubApi, owner: &str, repo: &str) -> RepoConfig {
    let mut content = None;
    for path in [".github/automerge.yml", ".github/automerge.yaml"] {
        match gh.load_repo_file(owner, repo, path).await {
            Ok(Some(text)) => {
                content = Some(text);
                break;
            }
            Ok(None) => {}
            Err(e) => debug!(owner, repo, path, "config load failed: {e}"),
        }
    }
    match content {
        Some(text) => RepoConfig::from_yaml(&text),
        None => RepoConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_table() {
        let cfg = RepoConfig::default();
        assert_eq!(cfg.label, "automerge");
        assert!(cfg.require_label);
        assert_eq!(cfg.merge_method, MergeMethod::Squash);
        assert!(cfg.update_branch);
        assert!(cfg.require_up_to_date);
        assert!(cfg.allow_merge_when_no_checks);
        assert_eq!(cfg.max_wait_minutes, 60);
        assert_eq!(cfg.poll_interval_seconds, 10);
    }

    #[test]
    fn parses_and_coerces_known_keys() {
        let cfg = RepoConfig::from_yaml(
            "label: ship-it\n\
             require_label: false\n\
             merge_method: rebase\n\
             max_wait_minutes: 5\n\
             poll_interval_seconds: 2\n\
             # a comment\n\
             title_template: \"{title}\"\n",
        );
        assert_eq!(cfg.label, "ship-it");
        assert!(!cfg.require_label);
        assert_eq!(cfg.merge_method, MergeMethod::Rebase);
        assert_eq!(cfg.max_wait_minutes, 5);
        assert_eq!(cfg.poll_interval_seconds, 2);
        assert_eq!(cfg.title_template, "{title}");
    }

    #[test]
    fn unknown_keys_and_junk_lines_are_ignored() {
        let cfg = RepoConfig::from_yaml(
            "totally_unknown: 42\n\
             not a mapping line\n\
             update_branch: false\n",
        );
        assert!(!cfg.update_branch);
        assert_eq!(cfg.label, "automerge");
    }

    #[test]
    fn invalid_merge_method_keeps_default() {
        let cfg = RepoConfig::from_yaml("merge_method: octopus\n");
        assert_eq!(cfg.merge_method, MergeMethod::Squash);
    }

    #[test]
    fn poll_interval_is_floored_at_five_seconds() {
        let cfg = RepoConfig::from_yaml("poll_interval_seconds: 1\n");
        assert_eq!(cfg.poll_interval(), Duration::from_secs(5));

        let cfg = RepoConfig::from_yaml("poll_interval_seconds: 30\n");
        assert_eq!(cfg.poll_interval(), Duration::from_secs(30));
    }

    #[test]
    fn negative_ints_are_rejected_for_unsigned_fields() {
        let cfg = RepoConfig::from_yaml("max_wait_minutes: -3\n");
        assert_eq!(cfg.max_wait_minutes, 60);
    }
}
