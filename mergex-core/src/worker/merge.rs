//! Merge decision state machine.
//!
//! One run per popped queue item: load the repo config, evaluate the pull
//! request, optionally update the branch and wait for checks, then merge.
//! Every terminal path is a reason string the drain classifies as
//! transient or permanent; the machine itself never panics or propagates.

use std::time::{Duration, Instant};

use tracing::debug;

use super::Heartbeat;
use super::repo_config::{self, RepoConfig};
use crate::github::GithubApi;
use crate::metrics;
use crate::models::PullRequest;

/// Terminal result of processing one queue item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// The PR was merged; the item is consumed.
    Success,
    /// Not merged; the reason decides retry vs drop (see
    /// [`super::is_transient`]).
    Failed(String),
    /// The worker's lease lapsed mid-item; stop without further forge
    /// mutations.
    LeaseLost,
}

enum Verdict {
    Mergeable(PullRequest),
    Rejected {
        reason: String,
        pr: Option<PullRequest>,
    },
}

enum WaitOutcome {
    Green,
    Timeout,
    LeaseLost,
}

/// Combined-status and check-suite greenness for a head SHA.
///
/// With neither statuses nor suites present the configured
/// `allow_merge_when_no_checks` decides. A `skipped` suite conclusion
/// counts as green; any failing conclusion blocks even when siblings are
/// skipped.
async fn checks_green(
    gh: &dyn GithubApi,
    owner: &str,
    repo: &str,
    sha: &str,
    cfg: &RepoConfig,
) -> Result<bool, String> {
    let combined = gh
        .get_combined_status(owner, repo, sha)
        .await
        .map_err(|e| format!("failed_to_fetch:status:{e}"))?;
    let suites = gh
        .list_check_suites(owner, repo, sha)
        .await
        .map_err(|e| format!("failed_to_fetch:check_suites:{e}"))?;

    if combined.statuses.is_empty() && suites.is_empty() {
        debug!(
            owner,
            repo,
            sha,
            allow = cfg.allow_merge_when_no_checks,
            "no statuses and no check suites"
        );
        return Ok(cfg.allow_merge_when_no_checks);
    }

    if !matches!(combined.state.as_str(), "success" | "neutral") {
        debug!(owner, repo, sha, state = %combined.state, "combined status not green");
        return Ok(false);
    }
    for suite in &suites {
        let conclusion = suite.conclusion.as_deref().unwrap_or("");
        if !matches!(conclusion, "success" | "neutral" | "skipped") {
            debug!(owner, repo, sha, conclusion, "check suite not green");
            return Ok(false);
        }
    }
    Ok(true)
}

async fn evaluate(
    gh: &dyn GithubApi,
    owner: &str,
    repo: &str,
    number: u64,
    cfg: &RepoConfig,
) -> Verdict {
    let pr = match gh.get_pr(owner, repo, number).await {
        Ok(Some(pr)) => pr,
        Ok(None) => {
            return Verdict::Rejected {
                reason: "failed_to_fetch".to_string(),
                pr: None,
            };
        }
        Err(e) => {
            debug!(owner, repo, number, "PR fetch failed: {e}");
            return Verdict::Rejected {
                reason: "failed_to_fetch".to_string(),
                pr: None,
            };
        }
    };

    if pr.draft {
        return Verdict::Rejected {
            reason: "draft".to_string(),
            pr: Some(pr),
        };
    }
    if pr.locked {
        return Verdict::Rejected {
            reason: "locked".to_string(),
            pr: Some(pr),
        };
    }
    if cfg.require_label && !pr.has_label(&cfg.label) {
        return Verdict::Rejected {
            reason: "missing_label".to_string(),
            pr: Some(pr),
        };
    }

    let state = pr
        .mergeable_state
        .clone()
        .unwrap_or_else(|| "unknown".to_string());
    if cfg.require_up_to_date && matches!(state.as_str(), "behind" | "blocked") {
        return Verdict::Rejected {
            reason: format!("behind_or_blocked:{state}"),
            pr: Some(pr),
        };
    }

    let Some(sha) = pr.head_sha().map(str::to_string) else {
        return Verdict::Rejected {
            reason: "failed_to_fetch:head_sha".to_string(),
            pr: Some(pr),
        };
    };
    match checks_green(gh, owner, repo, &sha, cfg).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(owner, repo, number, sha, "checks not green");
            return Verdict::Rejected {
                reason: "checks_not_green".to_string(),
                pr: Some(pr),
            };
        }
        Err(reason) => {
            return Verdict::Rejected {
                reason,
                pr: Some(pr),
            };
        }
    }

    if pr.mergeable == Some(false) {
        return Verdict::Rejected {
            reason: format!("mergeable_false:{state}"),
            pr: Some(pr),
        };
    }

    Verdict::Mergeable(pr)
}

/// Poll greenness until the deadline, heartbeating the lease each tick.
async fn wait_for_checks(
    gh: &dyn GithubApi,
    owner: &str,
    repo: &str,
    sha: &str,
    cfg: &RepoConfig,
    heartbeat: &Heartbeat,
) -> WaitOutcome {
    let deadline = Instant::now() + Duration::from_secs(cfg.max_wait_minutes * 60);
    let interval = cfg.poll_interval();
    while Instant::now() < deadline {
        if !heartbeat.beat().await {
            return WaitOutcome::LeaseLost;
        }
        if let Ok(true) = checks_green(gh, owner, repo, sha, cfg).await {
            return WaitOutcome::Green;
        }
        tokio::time::sleep(interval).await;
    }
    WaitOutcome::Timeout
}

fn render_template(template: &str, pr: &PullRequest, number: u64) -> String {
    let title = pr
        .title
        .clone()
        .unwrap_or_else(|| format!("PR #{number}"));
    template
        .replace("{number}", &number.to_string())
        .replace("{title}", &title)
        .replace("{body}", pr.body.as_deref().unwrap_or(""))
        .replace(
            "{head}",
            pr.head
                .as_ref()
                .and_then(|h| h.ref_name.as_deref())
                .unwrap_or(""),
        )
        .replace(
            "{base}",
            pr.base
                .as_ref()
                .and_then(|b| b.ref_name.as_deref())
                .unwrap_or(""),
        )
        .replace(
            "{user}",
            pr.user.as_ref().map(|u| u.login.as_str()).unwrap_or(""),
        )
}

/// Drive one queue item to a terminal outcome.
pub async fn process_item(
    gh: &dyn GithubApi,
    owner: &str,
    repo: &str,
    number: u64,
    heartbeat: &Heartbeat,
) -> ItemOutcome {
    let cfg = repo_config::load(gh, owner, repo).await;
    debug!(owner, repo, number, ?cfg, "evaluating PR");

    let timer = metrics::WORKER_PROCESSING_SECONDS
        .with_label_values(&["evaluate", owner, repo])
        .start_timer();
    let verdict = evaluate(gh, owner, repo, number, &cfg).await;
    timer.observe_duration();

    let pr = match verdict {
        Verdict::Mergeable(pr) => pr,
        Verdict::Rejected { reason, pr } => {
            debug!(owner, repo, number, %reason, "PR not mergeable initially");
            let behind = pr
                .as_ref()
                .and_then(|p| p.mergeable_state.as_deref())
                == Some("behind");
            let Some(pr) = pr.filter(|_| cfg.update_branch && behind) else {
                return ItemOutcome::Failed(reason);
            };

            // Keep the lease fresh across the long-running mutation.
            if !heartbeat.beat().await {
                return ItemOutcome::LeaseLost;
            }
            debug!(owner, repo, number, "attempting update-branch");
            let timer = metrics::WORKER_PROCESSING_SECONDS
                .with_label_values(&["update_branch", owner, repo])
                .start_timer();
            let updated = gh.update_branch(owner, repo, number).await;
            timer.observe_duration();
            let updated = match updated {
                Ok(updated) => updated,
                Err(e) => {
                    return ItemOutcome::Failed(format!("uncaught_error:{e}"));
                }
            };
            metrics::BRANCH_UPDATES
                .with_label_values(&[if updated { "success" } else { "fail" }])
                .inc();
            if !updated {
                return ItemOutcome::Failed(format!("update_branch_failed:{reason}"));
            }

            let Some(sha) = pr.head_sha().map(str::to_string) else {
                return ItemOutcome::Failed("failed_to_fetch:head_sha".to_string());
            };
            let timer = metrics::CHECKS_WAIT_SECONDS.start_timer();
            let wait = wait_for_checks(gh, owner, repo, &sha, &cfg, heartbeat).await;
            timer.observe_duration();
            match wait {
                WaitOutcome::Green => {}
                WaitOutcome::Timeout => {
                    debug!(owner, repo, number, "checks timeout after update");
                    return ItemOutcome::Failed("checks_timeout".to_string());
                }
                WaitOutcome::LeaseLost => return ItemOutcome::LeaseLost,
            }

            debug!(owner, repo, number, "re-evaluating after branch update");
            let timer = metrics::WORKER_PROCESSING_SECONDS
                .with_label_values(&["evaluate", owner, repo])
                .start_timer();
            let verdict = evaluate(gh, owner, repo, number, &cfg).await;
            timer.observe_duration();
            match verdict {
                Verdict::Mergeable(pr) => pr,
                Verdict::Rejected { reason, .. } => {
                    debug!(owner, repo, number, %reason, "still not mergeable after update");
                    return ItemOutcome::Failed(format!(
                        "not_mergeable_after_update:{reason}"
                    ));
                }
            }
        }
    };

    if !heartbeat.beat().await {
        return ItemOutcome::LeaseLost;
    }
    let method = cfg.merge_method;
    let title = render_template(&cfg.title_template, &pr, number);
    let body = render_template(&cfg.body_template, &pr, number);
    debug!(owner, repo, number, %method, "merging PR");

    let timer = metrics::WORKER_PROCESSING_SECONDS
        .with_label_values(&["merge", owner, repo])
        .start_timer();
    let merged = gh.merge_pr(owner, repo, number, method, &title, &body).await;
    timer.observe_duration();

    match merged {
        Ok((true, msg)) => {
            metrics::MERGE_ATTEMPTS
                .with_label_values(&[method.as_str(), "success"])
                .inc();
            metrics::MERGES_SUCCESS
                .with_label_values(&[method.as_str()])
                .inc();
            debug!(owner, repo, number, %msg, "merge success");
            ItemOutcome::Success
        }
        Ok((false, msg)) => {
            metrics::MERGE_ATTEMPTS
                .with_label_values(&[method.as_str(), "error"])
                .inc();
            metrics::MERGES_FAILED
                .with_label_values(&["merge_api_error"])
                .inc();
            debug!(owner, repo, number, %msg, "merge failure");
            ItemOutcome::Failed("merge_api_error".to_string())
        }
        Err(e) => {
            metrics::MERGE_ATTEMPTS
                .with_label_values(&[method.as_str(), "error"])
                .inc();
            ItemOutcome::Failed(format!("uncaught_error:{e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::FakeGithub;
    use super::super::tests::heartbeat;
    use super::*;
    use crate::models::MergeMethod;

    #[tokio::test]
    async fn clean_labeled_pr_merges_with_squash() {
        let gh = FakeGithub::mergeable_pr(10)
            .with_suites(&["success"])
            .with_combined("success", &["success"]);
        let (hb, _guard) = heartbeat().await;

        let outcome = process_item(&gh, "octo", "repo", 10, &hb).await;

        assert_eq!(outcome, ItemOutcome::Success);
        assert!(gh.saw_merge_with(MergeMethod::Squash));
    }

    #[tokio::test]
    async fn missing_label_is_rejected() {
        let gh = FakeGithub::mergeable_pr(20).without_labels();
        let (hb, _guard) = heartbeat().await;

        let outcome = process_item(&gh, "octo", "repo", 20, &hb).await;

        assert_eq!(outcome, ItemOutcome::Failed("missing_label".to_string()));
        assert!(!gh.saw_merge());
    }

    #[tokio::test]
    async fn label_requirement_can_be_waived() {
        let gh = FakeGithub::mergeable_pr(20)
            .without_labels()
            .with_config("require_label: false")
            .with_suites(&["success"]);
        let (hb, _guard) = heartbeat().await;

        let outcome = process_item(&gh, "octo", "repo", 20, &hb).await;

        assert_eq!(outcome, ItemOutcome::Success);
        assert!(gh.saw_merge());
    }

    #[tokio::test]
    async fn no_checks_at_all_counts_as_green_by_default() {
        let gh = FakeGithub::mergeable_pr(30);
        let (hb, _guard) = heartbeat().await;

        assert_eq!(
            process_item(&gh, "octo", "repo", 30, &hb).await,
            ItemOutcome::Success
        );
    }

    #[tokio::test]
    async fn no_checks_override_can_be_disabled() {
        let gh = FakeGithub::mergeable_pr(30)
            .with_config("allow_merge_when_no_checks: false\nmax_wait_minutes: 0");
        let (hb, _guard) = heartbeat().await;

        assert_eq!(
            process_item(&gh, "octo", "repo", 30, &hb).await,
            ItemOutcome::Failed("checks_not_green".to_string())
        );
    }

    #[tokio::test]
    async fn skipped_suites_do_not_block() {
        let gh = FakeGithub::mergeable_pr(21)
            .with_combined("success", &["success"])
            .with_suites(&["skipped", "skipped"]);
        let (hb, _guard) = heartbeat().await;

        assert_eq!(
            process_item(&gh, "octo", "repo", 21, &hb).await,
            ItemOutcome::Success
        );
    }

    #[tokio::test]
    async fn one_failed_suite_blocks_despite_skipped_siblings() {
        let gh = FakeGithub::mergeable_pr(22)
            .with_combined("success", &["success"])
            .with_suites(&["skipped", "failure"]);
        let (hb, _guard) = heartbeat().await;

        assert_eq!(
            process_item(&gh, "octo", "repo", 22, &hb).await,
            ItemOutcome::Failed("checks_not_green".to_string())
        );
        assert!(!gh.saw_merge());
    }

    #[tokio::test]
    async fn draft_and_locked_are_terminal() {
        let gh = FakeGithub::mergeable_pr(5).drafted();
        let (hb, _guard) = heartbeat().await;
        assert_eq!(
            process_item(&gh, "octo", "repo", 5, &hb).await,
            ItemOutcome::Failed("draft".to_string())
        );

        let gh = FakeGithub::mergeable_pr(5).locked();
        assert_eq!(
            process_item(&gh, "octo", "repo", 5, &hb).await,
            ItemOutcome::Failed("locked".to_string())
        );
    }

    #[tokio::test]
    async fn behind_pr_is_updated_then_merged() {
        let gh = FakeGithub::mergeable_pr(11)
            .behind_until_updated()
            .with_suites(&["success"]);
        let (hb, _guard) = heartbeat().await;

        let outcome = process_item(&gh, "octo", "repo", 11, &hb).await;

        assert_eq!(outcome, ItemOutcome::Success);
        assert!(gh.saw_update_branch());
        assert!(gh.saw_merge());
    }

    #[tokio::test]
    async fn behind_with_updates_disabled_is_rejected() {
        let gh = FakeGithub::mergeable_pr(11)
            .behind_until_updated()
            .with_config("update_branch: false");
        let (hb, _guard) = heartbeat().await;

        assert_eq!(
            process_item(&gh, "octo", "repo", 11, &hb).await,
            ItemOutcome::Failed("behind_or_blocked:behind".to_string())
        );
        assert!(!gh.saw_update_branch());
    }

    #[tokio::test]
    async fn failed_branch_update_keeps_original_reason() {
        let gh = FakeGithub::mergeable_pr(12)
            .behind_until_updated()
            .update_branch_fails();
        let (hb, _guard) = heartbeat().await;

        assert_eq!(
            process_item(&gh, "octo", "repo", 12, &hb).await,
            ItemOutcome::Failed("update_branch_failed:behind_or_blocked:behind".to_string())
        );
    }

    #[tokio::test]
    async fn merge_api_rejection_is_transient() {
        let gh = FakeGithub::mergeable_pr(13)
            .with_suites(&["success"])
            .merge_fails();
        let (hb, _guard) = heartbeat().await;

        assert_eq!(
            process_item(&gh, "octo", "repo", 13, &hb).await,
            ItemOutcome::Failed("merge_api_error".to_string())
        );
    }

    #[tokio::test]
    async fn lapsed_lease_stops_before_merge() {
        use crate::lease::LeaseManager;
        use crate::settings::Settings;
        use crate::store::{MemoryStore, Store};
        use std::sync::Arc;

        let gh = FakeGithub::mergeable_pr(15).with_suites(&["success"]);
        // Heartbeat for a worker that never held the lease.
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let lease = LeaseManager::new(store, Arc::new(Settings::default()), 1, "octo", "repo");
        let hb = Heartbeat::new(lease, "ghost-worker");

        assert_eq!(
            process_item(&gh, "octo", "repo", 15, &hb).await,
            ItemOutcome::LeaseLost
        );
        assert!(!gh.saw_merge());
    }

    #[tokio::test]
    async fn missing_pr_reports_failed_to_fetch() {
        let gh = FakeGithub::missing_pr();
        let (hb, _guard) = heartbeat().await;

        assert_eq!(
            process_item(&gh, "octo", "repo", 99, &hb).await,
            ItemOutcome::Failed("failed_to_fetch".to_string())
        );
    }

    #[tokio::test]
    async fn mergeable_false_is_terminal() {
        let gh = FakeGithub::mergeable_pr(14)
            .with_suites(&["success"])
            .mergeable_flag(false);
        let (hb, _guard) = heartbeat().await;

        assert_eq!(
            process_item(&gh, "octo", "repo", 14, &hb).await,
            ItemOutcome::Failed("mergeable_false:clean".to_string())
        );
    }

    #[test]
    fn templates_render_pr_placeholders() {
        let pr: PullRequest = serde_json::from_value(serde_json::json!({
            "number": 8,
            "title": "feat: change",
            "body": "details",
            "head": {"ref": "feature", "sha": "abc"},
            "base": {"ref": "main"},
            "user": {"login": "dev"},
        }))
        .unwrap();
        assert_eq!(
            render_template("{title} (#{number}) by {user}", &pr, 8),
            "feat: change (#8) by dev"
        );
        assert_eq!(
            render_template("{body}\n{head}->{base}", &pr, 8),
            "details\nfeature->main"
        );
    }
}
