//! Shared wire and domain types.
//!
//! GitHub payloads are heterogeneous, so every field beyond the PR number is
//! optional or defaulted; callers decide which absences are fatal.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One queued auto-merge attempt for a specific pull request.
///
/// Serialized as the item JSON blob stored in the per-repo queue list:
/// `{"number", "sender", "ts", "retries", "not_before"}` with float-second
/// timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Pull request number; also the dedupe key within a repo.
    pub number: u64,
    /// Actor that originated the event, advisory only.
    #[serde(default)]
    pub sender: Option<String>,
    /// Wall-clock seconds of the first enqueue.
    pub ts: f64,
    /// Transient failures so far; monotonic across the item's lifetime.
    #[serde(default)]
    pub retries: u32,
    /// Earliest wall-clock time the item may be processed; 0 = immediately.
    #[serde(default)]
    pub not_before: f64,
}

/// Unit-of-work identity extracted from a webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrIdentity {
    pub installation_id: u64,
    pub owner: String,
    pub repo: String,
    pub number: u64,
    pub sender: Option<String>,
}

/// Merge strategy passed to the merge endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    Squash,
    Rebase,
    Merge,
}

impl MergeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Squash => "squash",
            Self::Rebase => "rebase",
            Self::Merge => "merge",
        }
    }

    /// Parse a configured method; unknown values are rejected so the caller
    /// can keep its default.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "squash" => Some(Self::Squash),
            "rebase" => Some(Self::Rebase),
            "merge" => Some(Self::Merge),
            _ => None,
        }
    }
}

impl fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pull request facts as returned by the REST API, parsed defensively.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub labels: Vec<Label>,
    /// `None` while GitHub is still computing mergeability.
    #[serde(default)]
    pub mergeable: Option<bool>,
    /// clean, unstable, blocked, behind, dirty, unknown.
    #[serde(default)]
    pub mergeable_state: Option<String>,
    #[serde(default)]
    pub head: Option<GitRef>,
    #[serde(default)]
    pub base: Option<GitRef>,
    #[serde(default)]
    pub user: Option<Actor>,
}

impl PullRequest {
    pub fn head_sha(&self) -> Option<&str> {
        self.head.as_ref().and_then(|h| h.sha.as_deref())
    }

    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|l| l.name == name)
    }
}

/// Issue label attached to a pull request.
#[derive(Debug, Clone, Deserialize)]
pub struct Label {
    pub name: String,
}

/// Head or base ref of a pull request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GitRef {
    #[serde(rename = "ref", default)]
    pub ref_name: Option<String>,
    #[serde(default)]
    pub sha: Option<String>,
}

/// GitHub account, reduced to the login.
#[derive(Debug, Clone, Deserialize)]
pub struct Actor {
    pub login: String,
}

/// Combined commit status for a head SHA.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CombinedStatus {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub statuses: Vec<CommitStatus>,
}

impl CombinedStatus {
    /// Fallback used when the status endpoint is unavailable.
    pub fn pending() -> Self {
        Self {
            state: "pending".to_string(),
            statuses: Vec::new(),
        }
    }
}

/// One legacy commit status within the combined view.
#[derive(Debug, Clone, Deserialize)]
pub struct CommitStatus {
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub state: String,
}

/// Check suite attached to a head SHA; only the conclusion matters here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckSuite {
    #[serde(default)]
    pub conclusion: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_item_round_trips_wire_shape() {
        let raw = r#"{"number":7,"sender":"octocat","ts":1700000000.5,"retries":2,"not_before":1700000100.0}"#;
        let item: QueueItem = serde_json::from_str(raw).unwrap();
        assert_eq!(item.number, 7);
        assert_eq!(item.sender.as_deref(), Some("octocat"));
        assert_eq!(item.retries, 2);

        let encoded = serde_json::to_string(&item).unwrap();
        let again: QueueItem = serde_json::from_str(&encoded).unwrap();
        assert_eq!(item, again);
    }

    #[test]
    fn queue_item_tolerates_missing_optionals() {
        let item: QueueItem = serde_json::from_str(r#"{"number":3,"ts":1.0}"#).unwrap();
        assert_eq!(item.retries, 0);
        assert_eq!(item.not_before, 0.0);
        assert!(item.sender.is_none());
    }

    #[test]
    fn pull_request_parses_sparse_payload() {
        let pr: PullRequest = serde_json::from_str(r#"{"number":42}"#).unwrap();
        assert_eq!(pr.number, 42);
        assert!(!pr.draft);
        assert!(pr.head_sha().is_none());
        assert!(!pr.has_label("automerge"));
    }

    #[test]
    fn merge_method_parse_rejects_unknown() {
        assert_eq!(MergeMethod::parse("rebase"), Some(MergeMethod::Rebase));
        assert_eq!(MergeMethod::parse("octopus"), None);
    }
}
