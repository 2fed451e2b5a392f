use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Protocol surface of an MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Sse,
    Websocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::Sse => write!(f, "sse"),
            TransportKind::Websocket => write!(f, "websocket"),
        }
    }
}

/// Declarative descriptor for one MCP server instance.
///
/// Created by the caller of `deploy_group` and never mutated afterwards;
/// the orchestrator keeps a copy inside the owning [`Instance`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSpec {
    /// Unique instance name, also used as the container name.
    pub name: String,
    /// Container image reference.
    pub image: String,
    /// External account-tool identifier; keys the credential cache.
    pub account_id: String,
    pub transport: TransportKind,
    /// Path the MCP endpoint is served on, e.g. `/mcp`.
    #[serde(default = "default_endpoint_path")]
    pub endpoint_path: String,
    /// Capability set the server is expected to advertise.
    #[serde(default)]
    pub capabilities: HashMap<String, serde_json::Value>,
    /// Free-form discovery metadata, passed to the container as JSON.
    #[serde(default)]
    pub discovery_metadata: HashMap<String, serde_json::Value>,
    /// OAuth providers whose credentials must be injected before start.
    #[serde(default)]
    pub required_oauth_providers: Vec<String>,
    /// Explicit port bindings (container port spec -> host port). When set,
    /// transport-based port derivation is skipped entirely.
    #[serde(default)]
    pub port_bindings: HashMap<String, u16>,
    /// Caller-supplied environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Typed partial-override block, merged after all other layers.
    #[serde(default)]
    pub overrides: SpecOverrides,
}

fn default_endpoint_path() -> String {
    "/mcp".to_string()
}

/// Bounded override structure applied as the last resolution layer.
///
/// This is the documented escape hatch: values here replace what the
/// resolver derived, including hardening established by earlier layers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecOverrides {
    #[serde(default)]
    pub env: Vec<String>,
    pub cmd: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub network_mode: Option<String>,
    pub resources: Option<ResourceOverrides>,
    pub security: Option<SecurityOverrides>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceOverrides {
    /// Memory limit with `<int><k|m|g|t>[b]` suffix grammar, e.g. "512m".
    pub memory: Option<String>,
    pub cpu_shares: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityOverrides {
    pub readonly_rootfs: Option<bool>,
    pub seccomp_profile: Option<String>,
    pub apparmor_profile: Option<String>,
}

/// Lifecycle state of a managed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Pulling,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

/// Point-in-time health classification of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Mutable runtime record for one deployed MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub spec: ServerSpec,
    pub status: InstanceStatus,
    pub container_id: Option<String>,
    pub health: HealthState,
    pub last_health_check: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub last_restart: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Instance {
    pub fn new(spec: ServerSpec) -> Self {
        Self {
            spec,
            status: InstanceStatus::Pending,
            container_id: None,
            health: HealthState::Unknown,
            last_health_check: None,
            start_time: None,
            restart_count: 0,
            last_restart: None,
            last_error: None,
        }
    }
}

/// Collective status of a container group, derived from member state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Initializing,
    Healthy,
    Degraded,
    Failed,
}

impl GroupStatus {
    /// Pure derivation from member counters; never stored as independent
    /// truth.
    pub fn derive(total: usize, running: usize, healthy: usize) -> Self {
        if running == 0 {
            GroupStatus::Failed
        } else if healthy == total {
            GroupStatus::Healthy
        } else if healthy > 0 {
            GroupStatus::Degraded
        } else {
            GroupStatus::Failed
        }
    }
}

/// Snapshot of one instance for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub status: InstanceStatus,
    pub health: HealthState,
    pub container_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub last_restart: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub endpoint_path: String,
    pub transport: TransportKind,
}

impl From<&Instance> for InstanceSnapshot {
    fn from(instance: &Instance) -> Self {
        Self {
            status: instance.status,
            health: instance.health,
            container_id: instance.container_id.clone(),
            start_time: instance.start_time,
            restart_count: instance.restart_count,
            last_restart: instance.last_restart,
            last_error: instance.last_error.clone(),
            endpoint_path: instance.spec.endpoint_path.clone(),
            transport: instance.spec.transport,
        }
    }
}

/// Snapshot of one group for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub collective_status: GroupStatus,
    pub total_instances: usize,
    pub running_instances: usize,
    pub healthy_instances: usize,
    pub shared_networking: bool,
    pub instances: HashMap<String, InstanceSnapshot>,
}
