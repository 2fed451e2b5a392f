use crate::types::{GroupStatus, HealthState, InstanceStatus};
use serde::Serialize;
use tokio::sync::broadcast;

const DEFAULT_BUS_CAPACITY: usize = 256;

/// In-process event stream for instance, group, health, and credential
/// lifecycle notifications.
///
/// Delivery is best-effort: only listeners subscribed at emit time observe
/// an event, and a lagging receiver drops the oldest entries.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    InstanceStatusChanged {
        name: String,
        status: InstanceStatus,
        container_id: Option<String>,
        error: Option<String>,
    },
    InstanceRestarted {
        name: String,
        restart_count: u32,
    },
    InstanceRestartFailed {
        name: String,
        error: String,
    },
    GroupDeploymentComplete {
        group_id: String,
        deployed: Vec<String>,
        failed: Vec<String>,
        total: usize,
    },
    GroupRemovalComplete {
        group_id: String,
        removed: Vec<String>,
        failed: Vec<String>,
    },
    GroupStatusChanged {
        group_id: String,
        collective_status: GroupStatus,
        running_instances: usize,
        healthy_instances: usize,
        total_instances: usize,
    },
    ServerRegistered {
        name: String,
    },
    ServerUnregistered {
        name: String,
    },
    HealthChanged {
        name: String,
        health: HealthState,
        failure_count: u32,
        recovery_count: u32,
    },
    GroupHealthUpdate {
        group_id: String,
        overall: GroupStatus,
        healthy: usize,
        degraded: usize,
        failed: usize,
        total: usize,
    },
    CredentialsInjected {
        account_id: String,
        providers: Vec<String>,
    },
    CredentialInjectionFailed {
        account_id: String,
        providers: Vec<String>,
        error: String,
    },
    CredentialUpdated {
        account_id: String,
        providers: Vec<String>,
    },
    CredentialRefreshFailed {
        account_id: String,
        error: String,
    },
    CredentialsCleanedUp {
        account_id: String,
    },
    CredentialUpdateRequired {
        name: String,
        provider: String,
    },
}

/// Typed broadcast channel shared by every subsystem.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Emit an event; a send error only means nobody is listening.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
