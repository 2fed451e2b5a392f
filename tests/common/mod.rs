#![allow(dead_code)]

use async_trait::async_trait;
use berth::credentials::{IssuanceClient, OAuthCredential};
use berth::error::{CredentialError, RuntimeError};
use berth::resolver::ContainerSpec;
use berth::runtime::{ContainerRuntime, ContainerState};
use berth::types::{ServerSpec, TransportKind};
use berth::{BerthError, Result};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Pull(String),
    Start(String),
    Stop(String),
    Remove(String),
}

/// In-memory stand-in for the docker client. Records every call and lets
/// tests flip per-container behavior.
#[derive(Default)]
pub struct FakeRuntime {
    pub calls: Mutex<Vec<RuntimeCall>>,
    /// Paused-clock timestamps of pull calls, for batch timing assertions.
    pub pull_instants: Mutex<Vec<Instant>>,
    /// Every fully-resolved spec passed to create_and_start.
    pub started_specs: Mutex<Vec<ContainerSpec>>,
    /// Container names whose start should fail.
    pub failing_starts: Mutex<HashSet<String>>,
    /// Per-container running flag consulted by inspect (keyed by name or id).
    pub running: Mutex<HashMap<String, bool>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_start(&self, name: &str) {
        self.failing_starts.lock().unwrap().insert(name.to_string());
    }

    pub fn set_running(&self, key: &str, running: bool) {
        self.running.lock().unwrap().insert(key.to_string(), running);
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn pulled_images(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RuntimeCall::Pull(image) => Some(image),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: RuntimeCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull_image(&self, image: &str) -> Result<()> {
        self.record(RuntimeCall::Pull(image.to_string()));
        self.pull_instants.lock().unwrap().push(Instant::now());
        Ok(())
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String> {
        if self.failing_starts.lock().unwrap().contains(&spec.name) {
            return Err(BerthError::Runtime(RuntimeError::StartFailed {
                reason: format!("simulated start failure for {}", spec.name),
            }));
        }

        self.record(RuntimeCall::Start(spec.name.clone()));
        self.started_specs.lock().unwrap().push(spec.clone());

        let id = format!("ctr-{}", spec.name);
        self.set_running(&id, true);
        self.set_running(&spec.name, true);
        Ok(id)
    }

    async fn stop_container(&self, id: &str, _graceful_timeout: Duration) -> Result<()> {
        self.record(RuntimeCall::Stop(id.to_string()));
        self.set_running(id, false);
        Ok(())
    }

    async fn remove_container(&self, name_or_id: &str, _force: bool) -> Result<()> {
        self.record(RuntimeCall::Remove(name_or_id.to_string()));
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerState> {
        let running = self
            .running
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .unwrap_or(false);

        Ok(ContainerState {
            running,
            status: if running { "running" } else { "exited" }.to_string(),
            host_ports: HashMap::new(),
        })
    }

    async fn logs(&self, name_or_id: &str, _tail: Option<u32>) -> Result<String> {
        Ok(format!("log output for {name_or_id}\n"))
    }
}

/// Issuance service fake: a static provider->credential map per issue call.
#[derive(Default)]
pub struct FakeIssuance {
    pub credentials: Mutex<HashMap<String, OAuthCredential>>,
    pub issue_count: AtomicUsize,
    pub cleanup_calls: Mutex<Vec<String>>,
    pub fail: Mutex<bool>,
}

impl FakeIssuance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: OAuthCredential) -> Self {
        let fake = Self::default();
        fake.add_credential(credential);
        fake
    }

    pub fn add_credential(&self, credential: OAuthCredential) {
        self.credentials
            .lock()
            .unwrap()
            .insert(credential.provider.clone(), credential);
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

#[async_trait]
impl IssuanceClient for FakeIssuance {
    async fn issue(
        &self,
        account_id: &str,
        providers: &[String],
        _context: Option<&serde_json::Value>,
    ) -> Result<HashMap<String, OAuthCredential>> {
        self.issue_count.fetch_add(1, Ordering::SeqCst);

        if *self.fail.lock().unwrap() {
            return Err(BerthError::Credential(CredentialError::RetrievalFailed {
                account_id: account_id.to_string(),
                reason: "simulated issuance outage".to_string(),
            }));
        }

        let known = self.credentials.lock().unwrap();
        Ok(providers
            .iter()
            .filter_map(|p| known.get(p).map(|c| (p.clone(), c.clone())))
            .collect())
    }

    async fn cleanup(&self, account_id: &str) -> Result<()> {
        self.cleanup_calls
            .lock()
            .unwrap()
            .push(account_id.to_string());
        Ok(())
    }
}

pub fn credential(provider: &str, expires_at: Option<DateTime<Utc>>) -> OAuthCredential {
    OAuthCredential {
        provider: provider.to_string(),
        access_token: format!("{provider}-access-token"),
        refresh_token: Some(format!("{provider}-refresh-token")),
        expires_at,
        scopes: vec!["repo".to_string(), "read:org".to_string()],
        metadata: HashMap::new(),
    }
}

/// Stdio specs never probe HTTP, which keeps integration tests hermetic.
pub fn stdio_spec(name: &str, account_id: &str) -> ServerSpec {
    ServerSpec {
        name: name.to_string(),
        image: format!("mcp/{name}:latest"),
        account_id: account_id.to_string(),
        transport: TransportKind::Stdio,
        endpoint_path: "/mcp".to_string(),
        capabilities: HashMap::new(),
        discovery_metadata: HashMap::new(),
        required_oauth_providers: Vec::new(),
        port_bindings: HashMap::new(),
        env: HashMap::new(),
        overrides: Default::default(),
    }
}
