//! Webhook ingress: signature verification, identity extraction, enqueue,
//! and drain spawning.

use std::collections::HashSet;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use hmac::{Hmac, Mac};
use mergex_core::metrics;
use mergex_core::models::PrIdentity;
use mergex_core::worker::spawn_drain;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Verify an `X-Hub-Signature-256` header against the raw body.
///
/// The header carries `sha256=<hex digest>`; comparison is constant-time
/// through the MAC verifier.
pub fn verify_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };
    let Some(hex_digest) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Reduce a webhook payload to the PR identities it concerns.
///
/// `pull_request` events carry the identity directly; `check_suite` and
/// `status` events are resolved through the commit-to-PRs endpoint. Other
/// events carry no work.
pub(crate) async fn extract_identities(
    state: &AppState,
    event: &str,
    payload: &Value,
) -> Option<Vec<PrIdentity>> {
    let installation_id = payload.pointer("/installation/id")?.as_u64()?;
    let owner = payload.pointer("/repository/owner/login")?.as_str()?;
    let repo = payload.pointer("/repository/name")?.as_str()?;
    let sender = payload
        .pointer("/sender/login")
        .and_then(|s| s.as_str())
        .map(String::from);

    match event {
        "pull_request" => {
            let number = payload.pointer("/pull_request/number")?.as_u64()?;
            Some(vec![PrIdentity {
                installation_id,
                owner: owner.to_string(),
                repo: repo.to_string(),
                number,
                sender,
            }])
        }
        "check_suite" | "status" => {
            let sha = if event == "check_suite" {
                payload.pointer("/check_suite/head_sha")?.as_str()?
            } else {
                payload.get("sha")?.as_str()?
            };
            let gh = state.ctx.github.client(installation_id);
            let prs = match gh.list_prs_for_commit(owner, repo, sha).await {
                Ok(prs) => prs,
                Err(e) => {
                    warn!(owner, repo, sha, "failed to resolve PRs for commit: {e}");
                    return None;
                }
            };
            let identities: Vec<PrIdentity> = prs
                .into_iter()
                .map(|pr| PrIdentity {
                    installation_id,
                    owner: owner.to_string(),
                    repo: repo.to_string(),
                    number: pr.number,
                    sender: sender.clone(),
                })
                .collect();
            if identities.is_empty() {
                None
            } else {
                Some(identities)
            }
        }
        _ => None,
    }
}

/// `POST /webhook`: verify, parse, enqueue, and trigger drains.
pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let event = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());

    if !verify_signature(&state.ctx.settings.webhook_secret, &body, signature) {
        metrics::WEBHOOK_INVALID_SIGNATURES.inc();
        metrics::WEBHOOK_REQUESTS
            .with_label_values(&[&event, "unknown", "401"])
            .inc();
        return StatusCode::UNAUTHORIZED;
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => {
            metrics::WEBHOOK_PARSE_FAILURES
                .with_label_values(&[&event])
                .inc();
            metrics::WEBHOOK_REQUESTS
                .with_label_values(&[&event, "unknown", "400"])
                .inc();
            return StatusCode::BAD_REQUEST;
        }
    };
    let action = payload
        .get("action")
        .and_then(|a| a.as_str())
        .unwrap_or("unknown")
        .to_string();

    let Some(identities) = extract_identities(&state, &event, &payload).await else {
        // Unrelated event types are accepted and dropped.
        metrics::WEBHOOK_REQUESTS
            .with_label_values(&[&event, &action, "202"])
            .inc();
        return StatusCode::ACCEPTED;
    };

    let mut touched = HashSet::new();
    for identity in identities {
        let queue = state
            .ctx
            .queue(identity.installation_id, &identity.owner, &identity.repo);
        match queue
            .enqueue(identity.number, identity.sender.as_deref(), 0, 0.0)
            .await
        {
            Ok(outcome) => {
                debug!(
                    owner = %identity.owner,
                    repo = %identity.repo,
                    number = identity.number,
                    ?outcome,
                    "webhook identity enqueued"
                );
            }
            Err(e) => {
                warn!(
                    owner = %identity.owner,
                    repo = %identity.repo,
                    number = identity.number,
                    "enqueue failed: {e}"
                );
            }
        }
        touched.insert((identity.installation_id, identity.owner, identity.repo));
    }

    for (installation_id, owner, repo) in touched {
        spawn_drain(Arc::clone(&state.ctx), installation_id, &owner, &repo);
    }

    metrics::WEBHOOK_REQUESTS
        .with_label_values(&[&event, &action, "202"])
        .inc();
    StatusCode::ACCEPTED
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn verify_accepts_matching_signature() {
        let body = br#"{"action":"opened"}"#;
        let sig = sign("test-secret", body);
        assert!(verify_signature("test-secret", body, Some(&sig)));
    }

    #[test]
    fn verify_rejects_wrong_secret_prefix_and_absence() {
        let body = br#"{"action":"opened"}"#;
        let sig = sign("other-secret", body);
        assert!(!verify_signature("test-secret", body, Some(&sig)));
        assert!(!verify_signature("test-secret", body, Some("sha256=deadbeef")));
        assert!(!verify_signature("test-secret", body, Some("sha1=deadbeef")));
        assert!(!verify_signature("test-secret", body, None));
    }
}
