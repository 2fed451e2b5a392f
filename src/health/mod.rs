use crate::error::HealthError;
use crate::events::{Event, EventBus};
use crate::runtime::ContainerRuntime;
use crate::types::{GroupStatus, HealthState, TransportKind};
use crate::{BerthError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_RECOVERY_THRESHOLD: u32 = 2;
const GROUP_AGGREGATION_INTERVAL: Duration = Duration::from_secs(30);
const INITIAL_CHECK_DELAY: Duration = Duration::from_secs(1);
const MAX_HISTORY_SIZE: usize = 100;

/// Per-instance monitoring parameters.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub container_id: String,
    pub endpoint_path: String,
    pub transport: TransportKind,
    pub expected_capabilities: HashMap<String, serde_json::Value>,
    pub interval: Duration,
    pub timeout: Duration,
    pub failure_threshold: u32,
    pub recovery_threshold: u32,
}

impl MonitorConfig {
    pub fn new(
        container_id: impl Into<String>,
        endpoint_path: impl Into<String>,
        transport: TransportKind,
        expected_capabilities: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            container_id: container_id.into(),
            endpoint_path: endpoint_path.into(),
            transport,
            expected_capabilities,
            interval: DEFAULT_CHECK_INTERVAL,
            timeout: DEFAULT_CHECK_TIMEOUT,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_threshold: DEFAULT_RECOVERY_THRESHOLD,
        }
    }
}

/// Point-in-time snapshot of one health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub instance_name: String,
    pub timestamp: DateTime<Utc>,
    pub status: HealthState,
    pub response_time_ms: u64,
    pub container_running: bool,
    pub container_status: Option<String>,
    pub endpoint_reachable: bool,
    pub capabilities_match: bool,
    pub observed_capabilities: HashMap<String, serde_json::Value>,
    pub error: Option<String>,
}

/// Aggregated health of one group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupHealth {
    pub group_id: String,
    pub total_servers: usize,
    pub healthy_servers: usize,
    pub degraded_servers: usize,
    pub failed_servers: usize,
    pub overall: GroupStatus,
    pub last_checked: DateTime<Utc>,
    pub average_response_time_ms: Option<f64>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    failures: u32,
    recoveries: u32,
}

struct ProbeOutcome {
    reachable: bool,
    capabilities: HashMap<String, serde_json::Value>,
    error: Option<String>,
}

/// Watches registered MCP servers with per-instance timers, keeps a bounded
/// per-instance result history, and applies failure/recovery hysteresis
/// before notifying listeners.
#[derive(Clone)]
pub struct HealthMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    http: reqwest::Client,
    servers: Arc<RwLock<HashMap<String, MonitorConfig>>>,
    groups: Arc<RwLock<HashMap<String, Vec<String>>>>,
    history: Arc<RwLock<HashMap<String, VecDeque<HealthCheckResult>>>>,
    counters: Arc<RwLock<HashMap<String, Counters>>>,
    check_tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    group_tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    events: EventBus,
}

impl HealthMonitor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, events: EventBus) -> Self {
        Self {
            runtime,
            http: reqwest::Client::new(),
            servers: Arc::new(RwLock::new(HashMap::new())),
            groups: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(RwLock::new(HashMap::new())),
            check_tasks: Arc::new(Mutex::new(HashMap::new())),
            group_tasks: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Register an instance and start its private check timer. The first
    /// check runs shortly after registration.
    pub async fn register(&self, name: &str, config: MonitorConfig) {
        info!("Registering MCP server for health monitoring: {}", name);

        let interval = config.interval;
        self.servers.write().await.insert(name.to_string(), config);
        self.history
            .write()
            .await
            .insert(name.to_string(), VecDeque::new());
        self.counters
            .write()
            .await
            .insert(name.to_string(), Counters::default());

        let monitor = self.clone();
        let instance = name.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(INITIAL_CHECK_DELAY).await;
            loop {
                if let Err(e) = monitor.check(&instance).await {
                    debug!("Health check loop stopped for {}: {}", instance, e);
                    break;
                }
                tokio::time::sleep(interval).await;
            }
        });

        if let Some(previous) = self.check_tasks.lock().await.insert(name.to_string(), handle) {
            previous.abort();
        }

        self.events.emit(Event::ServerRegistered {
            name: name.to_string(),
        });
    }

    /// Cancel the instance timer and discard its history and counters.
    pub async fn unregister(&self, name: &str) {
        info!("Unregistering MCP server from health monitoring: {}", name);

        if let Some(handle) = self.check_tasks.lock().await.remove(name) {
            handle.abort();
        }
        self.servers.write().await.remove(name);
        self.history.write().await.remove(name);
        self.counters.write().await.remove(name);

        for members in self.groups.write().await.values_mut() {
            members.retain(|member| member != name);
        }

        self.events.emit(Event::ServerUnregistered {
            name: name.to_string(),
        });
    }

    /// Start periodic group-level aggregation over the given member set.
    pub async fn start_group_monitoring(&self, group_id: &str, members: Vec<String>) {
        info!(
            "Starting group health aggregation for {} ({} servers)",
            group_id,
            members.len()
        );

        self.groups
            .write()
            .await
            .insert(group_id.to_string(), members);

        let monitor = self.clone();
        let group = group_id.to_string();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(GROUP_AGGREGATION_INTERVAL).await;
                match monitor.group_health(&group).await {
                    Ok(health) => monitor.emit_group_update(&health),
                    Err(_) => break,
                }
            }
        });

        if let Some(previous) = self
            .group_tasks
            .lock()
            .await
            .insert(group_id.to_string(), handle)
        {
            previous.abort();
        }
    }

    pub async fn stop_group_monitoring(&self, group_id: &str) {
        info!("Stopping group health aggregation for {}", group_id);

        if let Some(handle) = self.group_tasks.lock().await.remove(group_id) {
            handle.abort();
        }
        self.groups.write().await.remove(group_id);
    }

    /// Run one health check against a registered instance.
    ///
    /// Probe failures are never fatal: they are downgraded into an
    /// unhealthy result and recorded in the instance history.
    pub async fn check(&self, name: &str) -> Result<HealthCheckResult> {
        let config = {
            let servers = self.servers.read().await;
            servers
                .get(name)
                .cloned()
                .ok_or_else(|| {
                    BerthError::Health(HealthError::NotRegistered {
                        name: name.to_string(),
                    })
                })?
        };

        let started = Instant::now();
        let mut result = HealthCheckResult {
            instance_name: name.to_string(),
            timestamp: Utc::now(),
            status: HealthState::Unknown,
            response_time_ms: 0,
            container_running: false,
            container_status: None,
            endpoint_reachable: false,
            capabilities_match: false,
            observed_capabilities: HashMap::new(),
            error: None,
        };

        match self.runtime.inspect(&config.container_id).await {
            Ok(state) => {
                result.container_running = state.running;
                result.container_status = Some(state.status.clone());

                if !state.running {
                    result.status = HealthState::Unhealthy;
                    result.error = Some(format!("Container not running: {}", state.status));
                } else {
                    let probe = self.probe_endpoint(&config, &state.host_ports).await;
                    result.endpoint_reachable = probe.reachable;
                    result.observed_capabilities = probe.capabilities;
                    result.error = probe.error;

                    result.capabilities_match = capabilities_match(
                        &result.observed_capabilities,
                        &config.expected_capabilities,
                    );

                    result.status = if result.container_running
                        && result.endpoint_reachable
                        && result.capabilities_match
                    {
                        HealthState::Healthy
                    } else {
                        HealthState::Unhealthy
                    };
                }
            }
            Err(e) => {
                result.status = HealthState::Unhealthy;
                result.error = Some(e.to_string());
            }
        }

        result.response_time_ms = started.elapsed().as_millis() as u64;

        self.push_history(name, result.clone()).await;
        self.track_thresholds(name, &config, &result).await;

        Ok(result)
    }

    /// Reachability/capability probe by transport.
    ///
    /// `stdio` has no network surface and counts as reachable with an empty
    /// observed set; a non-empty expected set therefore can never match for
    /// a stdio instance.
    async fn probe_endpoint(
        &self,
        config: &MonitorConfig,
        host_ports: &HashMap<String, u16>,
    ) -> ProbeOutcome {
        if config.transport == TransportKind::Stdio {
            return ProbeOutcome {
                reachable: true,
                capabilities: HashMap::new(),
                error: None,
            };
        }

        let Some(host_port) = host_ports.values().copied().next() else {
            return ProbeOutcome {
                reachable: false,
                capabilities: HashMap::new(),
                error: Some("No exposed ports found for MCP endpoint".to_string()),
            };
        };

        let base = format!("http://localhost:{}{}", host_port, config.endpoint_path);

        match config.transport {
            TransportKind::Sse => self.probe_sse(&base, config.timeout).await,
            TransportKind::Websocket => self.probe_websocket(&base, config.timeout).await,
            TransportKind::Stdio => unreachable!("handled above"),
        }
    }

    async fn probe_sse(&self, base: &str, timeout: Duration) -> ProbeOutcome {
        let url = format!("{base}/capabilities");
        match self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .timeout(timeout)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                let capabilities = response.json().await.unwrap_or_default();
                ProbeOutcome {
                    reachable: true,
                    capabilities,
                    error: None,
                }
            }
            // Connection-refused and not-found mean "unreachable", not a
            // hard probe error.
            Ok(_) => ProbeOutcome {
                reachable: false,
                capabilities: HashMap::new(),
                error: None,
            },
            Err(e) => ProbeOutcome {
                reachable: false,
                capabilities: HashMap::new(),
                error: if e.is_connect() {
                    None
                } else {
                    Some(e.to_string())
                },
            },
        }
    }

    /// Best-effort HTTP probe chain for websocket servers: a dedicated
    /// health path first, then the base path. A full protocol handshake is
    /// not performed.
    async fn probe_websocket(&self, base: &str, timeout: Duration) -> ProbeOutcome {
        let health_url = base.replace("/ws", "/health");
        if let Ok(response) = self.http.get(&health_url).timeout(timeout).send().await {
            if response.status().is_success() {
                let capabilities = response.json().await.unwrap_or_default();
                return ProbeOutcome {
                    reachable: true,
                    capabilities,
                    error: None,
                };
            }
        }

        let base_url = base.replace("/ws", "");
        match self.http.get(&base_url).timeout(timeout).send().await {
            Ok(response) if response.status().is_success() => ProbeOutcome {
                reachable: true,
                capabilities: HashMap::new(),
                error: None,
            },
            _ => ProbeOutcome {
                reachable: false,
                capabilities: HashMap::new(),
                error: None,
            },
        }
    }

    async fn push_history(&self, name: &str, result: HealthCheckResult) {
        let mut history = self.history.write().await;
        if let Some(entries) = history.get_mut(name) {
            entries.push_back(result);
            while entries.len() > MAX_HISTORY_SIZE {
                entries.pop_front();
            }
        }
    }

    /// Failure/recovery hysteresis. The unhealthy notification re-fires on
    /// every check at or above the failure threshold, not only at the
    /// crossing edge.
    async fn track_thresholds(
        &self,
        name: &str,
        config: &MonitorConfig,
        result: &HealthCheckResult,
    ) {
        let mut counters = self.counters.write().await;
        let Some(entry) = counters.get_mut(name) else {
            return;
        };

        match result.status {
            HealthState::Unhealthy => {
                entry.failures += 1;
                entry.recoveries = 0;

                if entry.failures >= config.failure_threshold {
                    warn!(
                        "Server {} unhealthy ({} consecutive failures)",
                        name, entry.failures
                    );
                    self.events.emit(Event::HealthChanged {
                        name: name.to_string(),
                        health: HealthState::Unhealthy,
                        failure_count: entry.failures,
                        recovery_count: 0,
                    });
                }
            }
            HealthState::Healthy => {
                entry.recoveries += 1;

                if entry.failures > 0 && entry.recoveries >= config.recovery_threshold {
                    info!(
                        "Server {} recovered after {} healthy checks",
                        name, entry.recoveries
                    );
                    let recoveries = entry.recoveries;
                    entry.failures = 0;
                    entry.recoveries = 0;
                    self.events.emit(Event::HealthChanged {
                        name: name.to_string(),
                        health: HealthState::Healthy,
                        failure_count: 0,
                        recovery_count: recoveries,
                    });
                }
            }
            HealthState::Unknown => {}
        }
    }

    /// Latest recorded result for an instance.
    pub async fn server_health(&self, name: &str) -> Option<HealthCheckResult> {
        self.history
            .read()
            .await
            .get(name)
            .and_then(|h| h.back().cloned())
    }

    /// Recent history for an instance, newest last.
    pub async fn server_history(&self, name: &str, limit: Option<usize>) -> Vec<HealthCheckResult> {
        let history = self.history.read().await;
        let Some(entries) = history.get(name) else {
            return Vec::new();
        };
        let skip = limit
            .map(|l| entries.len().saturating_sub(l))
            .unwrap_or(0);
        entries.iter().skip(skip).cloned().collect()
    }

    /// Synchronous, on-demand recomputation of a group's aggregate health
    /// from each member's latest recorded result. This may reflect a
    /// slightly different instant than the periodic aggregation.
    pub async fn group_health(&self, group_id: &str) -> Result<GroupHealth> {
        let members = {
            let groups = self.groups.read().await;
            groups.get(group_id).cloned().ok_or_else(|| {
                BerthError::Health(HealthError::UnknownGroup {
                    group_id: group_id.to_string(),
                })
            })?
        };

        let history = self.history.read().await;
        let mut healthy = 0;
        let mut degraded = 0;
        let mut failed = 0;
        let mut response_total = 0u64;
        let mut response_count = 0u64;

        for member in &members {
            let latest = history.get(member).and_then(|h| h.back());
            match classify_member(latest) {
                MemberClass::Healthy => healthy += 1,
                MemberClass::Degraded => degraded += 1,
                MemberClass::Failed => failed += 1,
            }
            if let Some(result) = latest {
                response_total += result.response_time_ms;
                response_count += 1;
            }
        }

        Ok(GroupHealth {
            group_id: group_id.to_string(),
            total_servers: members.len(),
            healthy_servers: healthy,
            degraded_servers: degraded,
            failed_servers: failed,
            overall: overall_status(healthy, failed, members.len()),
            last_checked: Utc::now(),
            average_response_time_ms: (response_count > 0)
                .then(|| response_total as f64 / response_count as f64),
        })
    }

    fn emit_group_update(&self, health: &GroupHealth) {
        self.events.emit(Event::GroupHealthUpdate {
            group_id: health.group_id.clone(),
            overall: health.overall,
            healthy: health.healthy_servers,
            degraded: health.degraded_servers,
            failed: health.failed_servers,
            total: health.total_servers,
        });
    }

    /// Abort every timer and drop all monitoring state.
    pub async fn shutdown(&self) {
        info!("Shutting down health monitor");

        for (_, handle) in self.check_tasks.lock().await.drain() {
            handle.abort();
        }
        for (_, handle) in self.group_tasks.lock().await.drain() {
            handle.abort();
        }
        self.servers.write().await.clear();
        self.groups.write().await.clear();
        self.history.write().await.clear();
        self.counters.write().await.clear();
    }
}

enum MemberClass {
    Healthy,
    Degraded,
    Failed,
}

/// Classify one member from its latest result: unhealthy with a running
/// container is degraded, unhealthy without one is failed, and a member
/// with no recorded history yet counts as degraded.
fn classify_member(latest: Option<&HealthCheckResult>) -> MemberClass {
    match latest {
        Some(result) => match result.status {
            HealthState::Healthy => MemberClass::Healthy,
            HealthState::Unhealthy => {
                if result.container_running {
                    MemberClass::Degraded
                } else {
                    MemberClass::Failed
                }
            }
            HealthState::Unknown => MemberClass::Degraded,
        },
        None => MemberClass::Degraded,
    }
}

// A group with no members is failed, matching `GroupStatus::derive`.
fn overall_status(healthy: usize, failed: usize, total: usize) -> GroupStatus {
    if total == 0 {
        GroupStatus::Failed
    } else if healthy == total {
        GroupStatus::Healthy
    } else if failed == total || healthy == 0 {
        GroupStatus::Failed
    } else {
        GroupStatus::Degraded
    }
}

/// An empty expected set always matches; otherwise every expected key must
/// be present with an equal value.
fn capabilities_match(
    observed: &HashMap<String, serde_json::Value>,
    expected: &HashMap<String, serde_json::Value>,
) -> bool {
    if expected.is_empty() {
        return true;
    }
    expected
        .iter()
        .all(|(key, value)| observed.get(key) == Some(value))
}
