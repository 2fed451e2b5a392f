mod common;

use berth::credentials::CredentialInjector;
use berth::events::{Event, EventBus};
use chrono::{Duration as ChronoDuration, Utc};
use common::{credential, FakeIssuance};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn injector(issuance: Arc<FakeIssuance>) -> (CredentialInjector, EventBus) {
    let events = EventBus::new();
    (CredentialInjector::new(issuance, events.clone()), events)
}

fn providers(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[tokio::test]
async fn prepare_converts_credentials_to_env() {
    let issuance = Arc::new(FakeIssuance::new());
    issuance.add_credential(credential("github", Some(Utc::now() + ChronoDuration::hours(2))));
    issuance.add_credential(credential("google", None));
    let (injector, _) = injector(issuance);

    let env = injector
        .prepare_oauth_credentials("acct-1", &providers(&["github", "google"]), None)
        .await
        .unwrap();

    assert_eq!(env["OAUTH_GITHUB_ACCESS_TOKEN"], "github-access-token");
    assert_eq!(env["OAUTH_GITHUB_REFRESH_TOKEN"], "github-refresh-token");
    assert_eq!(env["OAUTH_GITHUB_SCOPES"], "repo,read:org");
    assert!(env.contains_key("OAUTH_GITHUB_EXPIRES_AT"));
    assert_eq!(env["GITHUB_TOKEN"], "github-access-token");
    assert_eq!(env["GH_TOKEN"], "github-access-token");
    assert_eq!(env["GOOGLE_OAUTH_TOKEN"], "google-access-token");
    assert_eq!(env["GOOGLE_ACCESS_TOKEN"], "google-access-token");
    // Non-expiring credential gets no expiry variable.
    assert!(!env.contains_key("OAUTH_GOOGLE_EXPIRES_AT"));
}

#[tokio::test]
async fn partially_missing_providers_still_succeed() {
    let issuance = Arc::new(FakeIssuance::with_credential(credential("github", None)));
    let (injector, _) = injector(issuance);

    let env = injector
        .prepare_oauth_credentials("acct-1", &providers(&["github", "slack"]), None)
        .await
        .unwrap();

    assert!(env.contains_key("GITHUB_TOKEN"));
    assert!(!env.contains_key("SLACK_BOT_TOKEN"));
}

#[tokio::test]
async fn no_credentials_at_all_is_a_hard_error() {
    let issuance = Arc::new(FakeIssuance::new());
    let (injector, events) = injector(issuance);
    let mut rx = events.subscribe();

    let err = injector
        .prepare_oauth_credentials("acct-1", &providers(&["github"]), None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("No valid OAuth credentials"));

    let history = injector.injection_history("acct-1").await;
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);

    let mut saw_failure = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, Event::CredentialInjectionFailed { .. }) {
            saw_failure = true;
        }
    }
    assert!(saw_failure);
}

#[tokio::test(start_paused = true)]
async fn cache_is_evicted_after_the_ttl() {
    let issuance = Arc::new(FakeIssuance::with_credential(credential("github", None)));
    let (injector, _) = injector(issuance);

    injector
        .prepare_oauth_credentials("acct-1", &providers(&["github"]), None)
        .await
        .unwrap();
    assert!(injector.credential_status("acct-1").await.has_credentials);

    // Fixed five-minute TTL, regardless of token expiry.
    tokio::time::sleep(Duration::from_secs(301)).await;
    assert!(!injector.credential_status("acct-1").await.has_credentials);
}

#[tokio::test(start_paused = true)]
async fn refresh_does_not_extend_the_cache_ttl() {
    let issuance = Arc::new(FakeIssuance::with_credential(credential(
        "github",
        // Expiry at +400s schedules a refresh at +100s, inside the TTL.
        Some(Utc::now() + ChronoDuration::seconds(400)),
    )));
    let (injector, _) = injector(issuance.clone());

    injector
        .prepare_oauth_credentials("acct-1", &providers(&["github"]), None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(150)).await;
    assert_eq!(issuance.issue_count.load(Ordering::SeqCst), 2);
    assert!(injector.credential_status("acct-1").await.has_credentials);

    // The TTL is absolute from first injection; the refresh at +100s must
    // not have re-armed it.
    tokio::time::sleep(Duration::from_secs(151)).await;
    assert!(!injector.credential_status("acct-1").await.has_credentials);
}

#[tokio::test(start_paused = true)]
async fn refresh_fires_before_token_expiry() {
    let issuance = Arc::new(FakeIssuance::with_credential(credential(
        "github",
        // Refresh is scheduled five minutes before expiry, i.e. at +100s.
        Some(Utc::now() + ChronoDuration::seconds(400)),
    )));
    let (injector, events) = injector(issuance.clone());
    let mut rx = events.subscribe();

    injector
        .prepare_oauth_credentials("acct-1", &providers(&["github"]), None)
        .await
        .unwrap();
    assert_eq!(issuance.issue_count.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(150)).await;
    assert_eq!(issuance.issue_count.load(Ordering::SeqCst), 2);

    let mut saw_update = false;
    while let Ok(event) = rx.try_recv() {
        if let Event::CredentialUpdated { account_id, providers } = event {
            assert_eq!(account_id, "acct-1");
            assert_eq!(providers, vec!["github".to_string()]);
            saw_update = true;
        }
    }
    assert!(saw_update);
}

#[tokio::test(start_paused = true)]
async fn already_expired_token_refreshes_immediately() {
    let issuance = Arc::new(FakeIssuance::with_credential(credential(
        "github",
        Some(Utc::now() - ChronoDuration::seconds(10)),
    )));
    let (injector, _) = injector(issuance.clone());

    injector
        .prepare_oauth_credentials("acct-1", &providers(&["github"]), None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(issuance.issue_count.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_emits_but_keeps_cached_entry() {
    let issuance = Arc::new(FakeIssuance::with_credential(credential(
        "github",
        Some(Utc::now() + ChronoDuration::seconds(400)),
    )));
    let (injector, events) = injector(issuance.clone());
    let mut rx = events.subscribe();

    injector
        .prepare_oauth_credentials("acct-1", &providers(&["github"]), None)
        .await
        .unwrap();

    issuance.set_fail(true);
    tokio::time::sleep(Duration::from_secs(150)).await;

    let mut saw_refresh_failure = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, Event::CredentialRefreshFailed { .. }) {
            saw_refresh_failure = true;
        }
    }
    assert!(saw_refresh_failure);
    assert!(injector.credential_status("acct-1").await.has_credentials);
}

#[tokio::test]
async fn cleanup_is_idempotent_and_notifies_the_backend() {
    let issuance = Arc::new(FakeIssuance::with_credential(credential("github", None)));
    let (injector, events) = injector(issuance.clone());
    let mut rx = events.subscribe();

    injector
        .prepare_oauth_credentials("acct-1", &providers(&["github"]), None)
        .await
        .unwrap();

    injector.cleanup_credentials("acct-1").await.unwrap();
    assert!(!injector.credential_status("acct-1").await.has_credentials);
    assert_eq!(issuance.cleanup_calls.lock().unwrap().len(), 1);

    // Cleaning an account with nothing cached is not an error.
    injector.cleanup_credentials("acct-1").await.unwrap();

    let mut cleaned = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, Event::CredentialsCleanedUp { .. }) {
            cleaned += 1;
        }
    }
    assert_eq!(cleaned, 2);
}

#[tokio::test]
async fn audit_summary_counts_active_credentials() {
    let issuance = Arc::new(FakeIssuance::new());
    issuance.add_credential(credential("github", None));
    issuance.add_credential(credential("slack", None));
    let (injector, _) = injector(issuance);

    injector
        .prepare_oauth_credentials("acct-1", &providers(&["github", "slack"]), None)
        .await
        .unwrap();
    injector
        .prepare_oauth_credentials("acct-2", &providers(&["github"]), None)
        .await
        .unwrap();

    let summary = injector.audit_summary().await;
    assert_eq!(summary.accounts_with_credentials, 2);
    assert_eq!(summary.active_credentials, 3);
    assert_eq!(summary.credentials_by_provider["github"], 2);
    assert_eq!(summary.injections_24h, 2);
    assert_eq!(summary.failures_24h, 0);
}
