use crate::error::CredentialError;
use crate::events::{Event, EventBus};
use crate::{BerthError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CREDENTIAL_CACHE_TTL: Duration = Duration::from_secs(300);
const TOKEN_REFRESH_BUFFER_SECS: i64 = 300;
const IMMEDIATE_REFRESH_DELAY: Duration = Duration::from_secs(1);
const MAX_AUDIT_ENTRIES: usize = 50;

/// OAuth material for one provider. Held only in memory, never written to
/// durable storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthCredential {
    pub provider: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Remote service that issues per-provider OAuth material.
#[async_trait]
pub trait IssuanceClient: Send + Sync {
    async fn issue(
        &self,
        account_id: &str,
        providers: &[String],
        context: Option<&serde_json::Value>,
    ) -> Result<HashMap<String, OAuthCredential>>;

    /// Best-effort cleanup notification, for the backend's audit trail.
    async fn cleanup(&self, account_id: &str) -> Result<()>;
}

/// HTTP implementation of the issuance service API.
pub struct HttpIssuanceClient {
    base_url: String,
    bearer_token: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct IssueRequest<'a> {
    account_id: &'a str,
    providers: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct IssueResponse {
    #[serde(default)]
    oauth_credentials: HashMap<String, OAuthCredential>,
}

impl HttpIssuanceClient {
    pub fn new(base_url: impl Into<String>, bearer_token: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            bearer_token,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(format!("{}{}", self.base_url, path));
        if let Some(ref token) = self.bearer_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

#[async_trait]
impl IssuanceClient for HttpIssuanceClient {
    async fn issue(
        &self,
        account_id: &str,
        providers: &[String],
        context: Option<&serde_json::Value>,
    ) -> Result<HashMap<String, OAuthCredential>> {
        let response = self
            .request("/api/mcp/oauth-credentials")
            .json(&IssueRequest {
                account_id,
                providers,
                context,
            })
            .send()
            .await?
            .error_for_status()
            .map_err(|e| {
                BerthError::Credential(CredentialError::RetrievalFailed {
                    account_id: account_id.to_string(),
                    reason: e.to_string(),
                })
            })?;

        let body: IssueResponse = response.json().await?;
        Ok(body.oauth_credentials)
    }

    async fn cleanup(&self, account_id: &str) -> Result<()> {
        self.request("/api/mcp/oauth-credentials/cleanup")
            .json(&serde_json::json!({ "account_id": account_id }))
            .send()
            .await?
            .error_for_status()
            .map_err(BerthError::Http)?;
        Ok(())
    }
}

/// One audit-log entry for a credential injection attempt.
#[derive(Debug, Clone, Serialize)]
pub struct InjectionRecord {
    pub timestamp: DateTime<Utc>,
    pub providers: Vec<String>,
    pub success: bool,
}

/// Expiry view of one cached provider credential.
#[derive(Debug, Clone, Serialize)]
pub struct ExpiryInfo {
    pub expires_at: Option<DateTime<Utc>>,
    pub expired: bool,
    pub expires_in_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub has_credentials: bool,
    pub providers: Vec<String>,
    pub expiry: HashMap<String, ExpiryInfo>,
}

/// Aggregate audit view across all accounts.
#[derive(Debug, Clone, Serialize)]
pub struct AuditSummary {
    pub accounts_with_credentials: usize,
    pub active_credentials: usize,
    pub credentials_by_provider: HashMap<String, usize>,
    pub injections_24h: usize,
    pub failures_24h: usize,
}

/// Retrieves, caches, and auto-refreshes OAuth credentials, converting them
/// to environment variables for container injection.
///
/// Zero-persistence model: the cache is memory-only and every entry is
/// evicted after a fixed TTL regardless of refresh activity. Refresh and
/// expiry timers are independent per account and aborted on cleanup or
/// shutdown.
#[derive(Clone)]
pub struct CredentialInjector {
    issuance: Arc<dyn IssuanceClient>,
    cache: Arc<RwLock<HashMap<String, HashMap<String, OAuthCredential>>>>,
    refresh_tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    expiry_tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    audit_log: Arc<RwLock<HashMap<String, Vec<InjectionRecord>>>>,
    events: EventBus,
}

impl CredentialInjector {
    pub fn new(issuance: Arc<dyn IssuanceClient>, events: EventBus) -> Self {
        info!("Credential injector initialized with zero-persistence model");
        Self {
            issuance,
            cache: Arc::new(RwLock::new(HashMap::new())),
            refresh_tasks: Arc::new(Mutex::new(HashMap::new())),
            expiry_tasks: Arc::new(Mutex::new(HashMap::new())),
            audit_log: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Retrieve and cache OAuth credentials for an account, returning them
    /// as environment-variable-style strings.
    ///
    /// A retrieval failure, or zero credentials returned for a non-empty
    /// provider set, is a hard error for the calling deployment step.
    pub async fn prepare_oauth_credentials(
        &self,
        account_id: &str,
        providers: &[String],
        context: Option<&serde_json::Value>,
    ) -> Result<HashMap<String, String>> {
        info!(
            "Preparing OAuth credentials for account {} (providers: {})",
            account_id,
            providers.join(", ")
        );

        match self.retrieve(account_id, providers, context).await {
            Ok(credentials) => {
                self.cache_credentials(account_id, credentials.clone()).await;
                self.schedule_refresh(account_id, &credentials).await;

                let env = convert_to_env(&credentials);
                self.record_injection(account_id, providers, true).await;
                self.events.emit(Event::CredentialsInjected {
                    account_id: account_id.to_string(),
                    providers: providers.to_vec(),
                });

                Ok(env)
            }
            Err(e) => {
                self.record_injection(account_id, providers, false).await;
                self.events.emit(Event::CredentialInjectionFailed {
                    account_id: account_id.to_string(),
                    providers: providers.to_vec(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn retrieve(
        &self,
        account_id: &str,
        providers: &[String],
        context: Option<&serde_json::Value>,
    ) -> Result<HashMap<String, OAuthCredential>> {
        let issued = self.issuance.issue(account_id, providers, context).await?;

        let mut credentials = HashMap::new();
        for provider in providers {
            match issued.get(provider) {
                Some(credential) => {
                    debug!("Retrieved {} credential for account {}", provider, account_id);
                    credentials.insert(provider.clone(), credential.clone());
                }
                None => {
                    warn!(
                        "No credential available for provider {} on account {}",
                        provider, account_id
                    );
                }
            }
        }

        if credentials.is_empty() {
            return Err(BerthError::Credential(CredentialError::NoCredentials));
        }

        Ok(credentials)
    }

    /// Insert into the cache and arm the TTL eviction timer. The TTL is
    /// absolute from first injection: a refresh replaces the entry but
    /// never extends its lifetime.
    async fn cache_credentials(
        &self,
        account_id: &str,
        credentials: HashMap<String, OAuthCredential>,
    ) {
        self.cache
            .write()
            .await
            .insert(account_id.to_string(), credentials);

        let mut tasks = self.expiry_tasks.lock().await;
        if tasks
            .get(account_id)
            .is_some_and(|task| !task.is_finished())
        {
            return;
        }

        let cache = Arc::clone(&self.cache);
        let account = account_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(CREDENTIAL_CACHE_TTL).await;
            cache.write().await.remove(&account);
            debug!("Credential cache expired for account {}", account);
        });
        tasks.insert(account_id.to_string(), handle);
    }

    /// Arm a single refresh timer at `earliest expiry − 5min`; if that point
    /// has already passed, refresh near-immediately instead.
    async fn schedule_refresh(
        &self,
        account_id: &str,
        credentials: &HashMap<String, OAuthCredential>,
    ) {
        let earliest = credentials.values().filter_map(|c| c.expires_at).min();
        let Some(earliest) = earliest else {
            return;
        };

        let refresh_at = earliest - ChronoDuration::seconds(TOKEN_REFRESH_BUFFER_SECS);
        let delay = match (refresh_at - Utc::now()).to_std() {
            Ok(delay) => delay,
            Err(_) => {
                warn!(
                    "Credential for account {} expires too soon, immediate refresh needed",
                    account_id
                );
                IMMEDIATE_REFRESH_DELAY
            }
        };

        debug!(
            "Scheduled credential refresh for account {} in {}s",
            account_id,
            delay.as_secs()
        );

        let injector = self.clone();
        let account = account_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            injector.refresh(&account).await;
        });

        if let Some(previous) = self
            .refresh_tasks
            .lock()
            .await
            .insert(account_id.to_string(), handle)
        {
            previous.abort();
        }
    }

    /// Re-retrieve the cached provider set, replace the cache entry, and
    /// reschedule. Restart decisions on the update belong to the
    /// orchestrator.
    ///
    /// Boxed because the future recurses through `schedule_refresh`.
    fn refresh<'a>(
        &'a self,
        account_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let providers: Vec<String> = {
                let cache = self.cache.read().await;
                match cache.get(account_id) {
                    Some(credentials) => credentials.keys().cloned().collect(),
                    None => {
                        debug!(
                            "No cached credentials for account {}, skipping refresh",
                            account_id
                        );
                        return;
                    }
                }
            };

            match self.retrieve(account_id, &providers, None).await {
                Ok(refreshed) => {
                    self.cache_credentials(account_id, refreshed.clone()).await;
                    self.schedule_refresh(account_id, &refreshed).await;

                    info!("Refreshed credentials for account {}", account_id);
                    self.events.emit(Event::CredentialUpdated {
                        account_id: account_id.to_string(),
                        providers,
                    });
                }
                Err(e) => {
                    error!(
                        "Failed to refresh credentials for account {}: {}",
                        account_id, e
                    );
                    self.events.emit(Event::CredentialRefreshFailed {
                        account_id: account_id.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        })
    }

    /// Manually trigger a refresh; returns whether the cache now holds a
    /// fresh entry.
    pub async fn force_refresh(&self, account_id: &str) -> bool {
        self.refresh(account_id).await;
        self.cache.read().await.contains_key(account_id)
    }

    /// Idempotent teardown of an account's credentials: cache entry, both
    /// timers, and a best-effort backend notification.
    pub async fn cleanup_credentials(&self, account_id: &str) -> Result<()> {
        info!("Cleaning up credentials for account {}", account_id);

        self.cache.write().await.remove(account_id);

        if let Some(handle) = self.refresh_tasks.lock().await.remove(account_id) {
            handle.abort();
        }
        if let Some(handle) = self.expiry_tasks.lock().await.remove(account_id) {
            handle.abort();
        }

        if let Err(e) = self.issuance.cleanup(account_id).await {
            warn!(
                "Failed to notify issuance service about cleanup for {}: {}",
                account_id, e
            );
        }

        self.events.emit(Event::CredentialsCleanedUp {
            account_id: account_id.to_string(),
        });

        Ok(())
    }

    pub async fn credential_status(&self, account_id: &str) -> CredentialStatus {
        let cache = self.cache.read().await;
        let Some(credentials) = cache.get(account_id).filter(|c| !c.is_empty()) else {
            return CredentialStatus {
                has_credentials: false,
                providers: Vec::new(),
                expiry: HashMap::new(),
            };
        };

        let now = Utc::now();
        let mut expiry = HashMap::new();
        for (provider, credential) in credentials {
            expiry.insert(
                provider.clone(),
                ExpiryInfo {
                    expires_at: credential.expires_at,
                    expired: credential.expires_at.is_some_and(|at| now > at),
                    expires_in_ms: credential
                        .expires_at
                        .map(|at| (at - now).num_milliseconds()),
                },
            );
        }

        CredentialStatus {
            has_credentials: true,
            providers: credentials.keys().cloned().collect(),
            expiry,
        }
    }

    pub async fn injection_history(&self, account_id: &str) -> Vec<InjectionRecord> {
        self.audit_log
            .read()
            .await
            .get(account_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Aggregate audit view: active credential counts by provider plus
    /// 24-hour injection/failure counts.
    pub async fn audit_summary(&self) -> AuditSummary {
        let cache = self.cache.read().await;

        let mut active_credentials = 0;
        let mut by_provider: HashMap<String, usize> = HashMap::new();
        for credentials in cache.values() {
            active_credentials += credentials.len();
            for provider in credentials.keys() {
                *by_provider.entry(provider.clone()).or_insert(0) += 1;
            }
        }

        let day_ago = Utc::now() - ChronoDuration::hours(24);
        let mut injections_24h = 0;
        let mut failures_24h = 0;
        for history in self.audit_log.read().await.values() {
            for entry in history {
                if entry.timestamp > day_ago {
                    if entry.success {
                        injections_24h += 1;
                    } else {
                        failures_24h += 1;
                    }
                }
            }
        }

        AuditSummary {
            accounts_with_credentials: cache.len(),
            active_credentials,
            credentials_by_provider: by_provider,
            injections_24h,
            failures_24h,
        }
    }

    async fn record_injection(&self, account_id: &str, providers: &[String], success: bool) {
        let mut audit = self.audit_log.write().await;
        let history = audit.entry(account_id.to_string()).or_default();
        history.push(InjectionRecord {
            timestamp: Utc::now(),
            providers: providers.to_vec(),
            success,
        });
        if history.len() > MAX_AUDIT_ENTRIES {
            let overflow = history.len() - MAX_AUDIT_ENTRIES;
            history.drain(0..overflow);
        }
    }

    /// Abort all timers and wipe every credential from memory.
    pub async fn shutdown(&self) {
        info!("Shutting down credential injector");

        for (_, handle) in self.refresh_tasks.lock().await.drain() {
            handle.abort();
        }
        for (_, handle) in self.expiry_tasks.lock().await.drain() {
            handle.abort();
        }
        self.cache.write().await.clear();

        info!("Credential injector shutdown complete, all credentials cleared from memory");
    }
}

/// Convert cached credentials to environment-variable form: generic
/// `OAUTH_<PROVIDER>_*` variables, convenience aliases for well-known
/// providers, and flattened string-valued metadata.
pub fn convert_to_env(credentials: &HashMap<String, OAuthCredential>) -> HashMap<String, String> {
    let mut env = HashMap::new();

    for (provider, credential) in credentials {
        let upper = provider.to_uppercase();

        env.insert(
            format!("OAUTH_{upper}_ACCESS_TOKEN"),
            credential.access_token.clone(),
        );
        if let Some(ref refresh) = credential.refresh_token {
            env.insert(format!("OAUTH_{upper}_REFRESH_TOKEN"), refresh.clone());
        }
        if let Some(expires_at) = credential.expires_at {
            env.insert(format!("OAUTH_{upper}_EXPIRES_AT"), expires_at.to_rfc3339());
        }
        if !credential.scopes.is_empty() {
            env.insert(format!("OAUTH_{upper}_SCOPES"), credential.scopes.join(","));
        }

        match provider.as_str() {
            "github" => {
                env.insert("GITHUB_TOKEN".to_string(), credential.access_token.clone());
                env.insert("GH_TOKEN".to_string(), credential.access_token.clone());
            }
            "google" => {
                env.insert(
                    "GOOGLE_ACCESS_TOKEN".to_string(),
                    credential.access_token.clone(),
                );
                env.insert(
                    "GOOGLE_OAUTH_TOKEN".to_string(),
                    credential.access_token.clone(),
                );
            }
            "microsoft" => {
                env.insert(
                    "MICROSOFT_ACCESS_TOKEN".to_string(),
                    credential.access_token.clone(),
                );
                env.insert(
                    "MS_GRAPH_TOKEN".to_string(),
                    credential.access_token.clone(),
                );
            }
            "slack" => {
                env.insert(
                    "SLACK_BOT_TOKEN".to_string(),
                    credential.access_token.clone(),
                );
                env.insert(
                    "SLACK_OAUTH_TOKEN".to_string(),
                    credential.access_token.clone(),
                );
            }
            _ => {}
        }

        for (key, value) in &credential.metadata {
            if let Some(text) = value.as_str() {
                env.insert(
                    format!("OAUTH_{upper}_{}", key.to_uppercase()),
                    text.to_string(),
                );
            }
        }
    }

    env
}
