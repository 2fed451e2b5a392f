use crate::credentials::CredentialInjector;
use crate::error::RuntimeError;
use crate::events::{Event, EventBus};
use crate::health::{HealthMonitor, MonitorConfig};
use crate::resolver::{ConfigResolver, NetworkContext};
use crate::runtime::ContainerRuntime;
use crate::types::{
    GroupSnapshot, GroupStatus, HealthState, Instance, InstanceSnapshot, InstanceStatus,
    ServerSpec,
};
use crate::{BerthError, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Orchestrator tunables. The defaults are the production values; tests
/// shrink the cooldown.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_restart_attempts: u32,
    pub restart_cooldown: Duration,
    pub batch_pause: Duration,
    pub auto_restart_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_restart_attempts: 3,
            restart_cooldown: Duration::from_secs(30),
            batch_pause: Duration::from_secs(2),
            auto_restart_delay: Duration::from_secs(5),
        }
    }
}

/// Options for one group deployment.
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    pub shared_networking: bool,
    /// Names deploy in this order; unlisted specs keep their relative order
    /// and follow after all listed ones.
    pub dependency_order: Vec<String>,
    pub max_concurrent: Option<usize>,
}

const DEFAULT_MAX_CONCURRENT: usize = 3;

#[derive(Debug, Clone)]
pub struct RemoveOptions {
    pub force: bool,
    pub graceful_timeout: Duration,
}

impl Default for RemoveOptions {
    fn default() -> Self {
        Self {
            force: false,
            graceful_timeout: Duration::from_secs(30),
        }
    }
}

/// Structured result of a group deployment: per-name failures never abort
/// the batch, so callers can always tell which members failed.
#[derive(Debug, Clone)]
pub struct GroupDeployReport {
    pub success: bool,
    pub deployed: Vec<String>,
    pub errors: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct GroupRemoveReport {
    pub success: bool,
    pub removed: Vec<String>,
    pub errors: HashMap<String, String>,
}

#[derive(Debug, Clone)]
struct Group {
    members: Vec<String>,
    shared_networking: bool,
    status: GroupStatus,
    running: usize,
    healthy: usize,
}

/// Top-level owner of group and instance state. Composes the credential
/// injector, configuration resolver, and health monitor to deploy, remove,
/// and restart MCP server groups.
#[derive(Clone)]
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    injector: CredentialInjector,
    resolver: ConfigResolver,
    monitor: HealthMonitor,
    // Lock order: `groups` before `instances`, always.
    groups: Arc<RwLock<HashMap<String, Group>>>,
    instances: Arc<RwLock<HashMap<String, Instance>>>,
    events: EventBus,
    listener: Arc<Mutex<Option<JoinHandle<()>>>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        injector: CredentialInjector,
        events: EventBus,
    ) -> Self {
        Self::with_config(runtime, injector, events, OrchestratorConfig::default())
    }

    pub fn with_config(
        runtime: Arc<dyn ContainerRuntime>,
        injector: CredentialInjector,
        events: EventBus,
        config: OrchestratorConfig,
    ) -> Self {
        let monitor = HealthMonitor::new(Arc::clone(&runtime), events.clone());
        Self {
            runtime,
            injector,
            resolver: ConfigResolver::new(),
            monitor,
            groups: Arc::new(RwLock::new(HashMap::new())),
            instances: Arc::new(RwLock::new(HashMap::new())),
            events,
            listener: Arc::new(Mutex::new(None)),
            config,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    pub fn injector(&self) -> &CredentialInjector {
        &self.injector
    }

    /// Wire up the reactive loop: unhealthy running instances are restarted
    /// after a short delay, and credential refreshes are relayed to the
    /// instances that depend on them.
    pub async fn start(&self) {
        let orchestrator = self.clone();
        let mut rx = self.events.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Orchestrator event listener lagged, skipped {}", skipped);
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                match event {
                    Event::HealthChanged { name, health, .. } => {
                        orchestrator.on_health_changed(&name, health).await;
                    }
                    Event::CredentialUpdated {
                        account_id,
                        providers,
                    } => {
                        orchestrator
                            .on_credential_updated(&account_id, &providers)
                            .await;
                    }
                    _ => {}
                }
            }
        });

        if let Some(previous) = self.listener.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Deploy a set of MCP servers as a coordinated group.
    pub async fn deploy_group(
        &self,
        group_id: &str,
        specs: Vec<ServerSpec>,
        options: DeployOptions,
    ) -> GroupDeployReport {
        let total = specs.len();
        info!(
            "Starting group deployment: {} with {} servers",
            group_id, total
        );

        let max_concurrent = options.max_concurrent.unwrap_or(DEFAULT_MAX_CONCURRENT).max(1);
        let mut deployed = Vec::new();
        let mut errors: HashMap<String, String> = HashMap::new();

        // Register the group and its pending instances up front. Instance
        // names are globally unique; a name already owned by another group
        // is rejected without touching its current owner.
        let mut accepted = Vec::new();
        {
            let mut groups = self.groups.write().await;
            let mut instances = self.instances.write().await;

            let group = groups.entry(group_id.to_string()).or_insert(Group {
                members: Vec::new(),
                shared_networking: options.shared_networking,
                status: GroupStatus::Initializing,
                running: 0,
                healthy: 0,
            });

            for spec in specs {
                if instances.contains_key(&spec.name) && !group.members.contains(&spec.name) {
                    errors.insert(
                        spec.name.clone(),
                        "instance name already managed by another group".to_string(),
                    );
                    continue;
                }
                if !group.members.contains(&spec.name) {
                    group.members.push(spec.name.clone());
                }
                instances.insert(spec.name.clone(), Instance::new(spec.clone()));
                accepted.push(spec);
            }
        }

        let ordered = deployment_order(accepted, &options.dependency_order);

        let batches: Vec<&[ServerSpec]> = ordered.chunks(max_concurrent).collect();
        let batch_count = batches.len();

        for (index, batch) in batches.into_iter().enumerate() {
            let results = futures::future::join_all(batch.iter().map(|spec| {
                let name = spec.name.clone();
                async move { (name, self.deploy_single(group_id, spec).await) }
            }))
            .await;

            for (name, result) in results {
                match result {
                    Ok(()) => deployed.push(name),
                    Err(e) => {
                        error!("Failed to deploy MCP server {}: {}", name, e);
                        errors.insert(name, e.to_string());
                    }
                }
            }

            // Fixed pause between batches bounds burst load on the runtime.
            if index + 1 < batch_count {
                tokio::time::sleep(self.config.batch_pause).await;
            }
        }

        self.update_group_status(group_id).await;

        let members = {
            let groups = self.groups.read().await;
            groups
                .get(group_id)
                .map(|g| g.members.clone())
                .unwrap_or_default()
        };
        self.monitor.start_group_monitoring(group_id, members).await;

        let success = !deployed.is_empty();
        info!(
            "Group deployment {} {}: {}/{} servers deployed",
            group_id,
            if success { "completed" } else { "failed" },
            deployed.len(),
            total
        );

        self.events.emit(Event::GroupDeploymentComplete {
            group_id: group_id.to_string(),
            deployed: deployed.clone(),
            failed: errors.keys().cloned().collect(),
            total,
        });

        GroupDeployReport {
            success,
            deployed,
            errors,
        }
    }

    /// Deploy one server: pull, inject credentials, resolve, start,
    /// register with the health monitor. Also the redeploy path used by
    /// [`Orchestrator::restart_server`].
    async fn deploy_single(&self, group_id: &str, spec: &ServerSpec) -> Result<()> {
        let result = self.run_deploy_steps(group_id, spec).await;

        if let Err(ref e) = result {
            let message = e.to_string();
            self.set_instance_error(&spec.name, &message).await;
        }

        result
    }

    async fn run_deploy_steps(&self, group_id: &str, spec: &ServerSpec) -> Result<()> {
        debug!("Deploying MCP server: {}", spec.name);

        self.set_instance_status(&spec.name, InstanceStatus::Pulling)
            .await;
        // The image must be fully pulled before any credential or
        // configuration step runs.
        self.runtime.pull_image(&spec.image).await?;

        let injected_env = if spec.required_oauth_providers.is_empty() {
            HashMap::new()
        } else {
            self.injector
                .prepare_oauth_credentials(
                    &spec.account_id,
                    &spec.required_oauth_providers,
                    None,
                )
                .await?
        };

        let shared_networking = {
            let groups = self.groups.read().await;
            groups
                .get(group_id)
                .map(|g| g.shared_networking)
                .unwrap_or(false)
        };
        let container_spec = self.resolver.resolve(
            spec,
            &injected_env,
            &NetworkContext {
                group_id: group_id.to_string(),
                shared_networking,
            },
        )?;

        self.set_instance_status(&spec.name, InstanceStatus::Starting)
            .await;
        let container_id = self.runtime.create_and_start(&container_spec).await?;

        {
            let mut instances = self.instances.write().await;
            if let Some(instance) = instances.get_mut(&spec.name) {
                instance.container_id = Some(container_id.clone());
                instance.status = InstanceStatus::Running;
                instance.start_time = Some(Utc::now());
                instance.health = HealthState::Unknown;
                instance.last_error = None;
            }
        }

        info!(
            "MCP server deployed successfully: {} ({})",
            spec.name, container_id
        );
        self.events.emit(Event::InstanceStatusChanged {
            name: spec.name.clone(),
            status: InstanceStatus::Running,
            container_id: Some(container_id.clone()),
            error: None,
        });

        self.monitor
            .register(
                &spec.name,
                MonitorConfig::new(
                    container_id,
                    spec.endpoint_path.clone(),
                    spec.transport,
                    spec.capabilities.clone(),
                ),
            )
            .await;

        Ok(())
    }

    /// Stop and remove a server group, iterating members in reverse of
    /// their deploy order.
    pub async fn remove_group(
        &self,
        group_id: &str,
        options: RemoveOptions,
    ) -> Result<GroupRemoveReport> {
        let members = {
            let groups = self.groups.read().await;
            let group = groups.get(group_id).ok_or_else(|| {
                BerthError::Runtime(RuntimeError::ContainerNotFound {
                    name: format!("group {group_id}"),
                })
            })?;
            group.members.clone()
        };

        info!("Removing MCP group: {}", group_id);

        self.monitor.stop_group_monitoring(group_id).await;

        let mut removed = Vec::new();
        let mut errors = HashMap::new();

        for name in members.iter().rev() {
            match self.remove_single(name, &options).await {
                Ok(()) => removed.push(name.clone()),
                Err(e) => {
                    error!("Failed to remove MCP server {}: {}", name, e);
                    errors.insert(name.clone(), e.to_string());
                }
            }
        }

        self.groups.write().await.remove(group_id);

        let success = !removed.is_empty();
        self.events.emit(Event::GroupRemovalComplete {
            group_id: group_id.to_string(),
            removed: removed.clone(),
            failed: errors.keys().cloned().collect(),
        });

        Ok(GroupRemoveReport {
            success,
            removed,
            errors,
        })
    }

    async fn remove_single(&self, name: &str, options: &RemoveOptions) -> Result<()> {
        debug!("Removing MCP server: {}", name);

        let (container_id, account_id) = {
            let instances = self.instances.read().await;
            let instance = instances.get(name).ok_or_else(|| {
                BerthError::Runtime(RuntimeError::ContainerNotFound {
                    name: name.to_string(),
                })
            })?;
            (
                instance.container_id.clone(),
                instance.spec.account_id.clone(),
            )
        };

        if let Some(id) = container_id {
            self.set_instance_status(name, InstanceStatus::Stopping).await;
            self.runtime
                .stop_container(&id, options.graceful_timeout)
                .await?;
            self.runtime.remove_container(name, options.force).await?;
        }

        self.monitor.unregister(name).await;
        self.injector.cleanup_credentials(&account_id).await?;

        self.instances.write().await.remove(name);
        for group in self.groups.write().await.values_mut() {
            group.members.retain(|member| member != name);
        }

        self.events.emit(Event::InstanceStatusChanged {
            name: name.to_string(),
            status: InstanceStatus::Stopped,
            container_id: None,
            error: None,
        });

        Ok(())
    }

    /// Restart a server using its stored spec.
    ///
    /// Guard rejections are not errors: an unknown name, exhausted restart
    /// attempts, or an unexpired cooldown all return `false` without
    /// touching state.
    pub async fn restart_server(&self, name: &str) -> bool {
        let (spec, container_id, restart_count, last_restart) = {
            let instances = self.instances.read().await;
            let Some(instance) = instances.get(name) else {
                error!("MCP instance {} not found for restart", name);
                return false;
            };
            (
                instance.spec.clone(),
                instance.container_id.clone(),
                instance.restart_count,
                instance.last_restart,
            )
        };

        if restart_count >= self.config.max_restart_attempts {
            error!("Max restart attempts reached for {}", name);
            return false;
        }

        if let Some(last) = last_restart {
            let elapsed = (Utc::now() - last)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if elapsed < self.config.restart_cooldown {
                info!("Restart cooldown in effect for {}, skipping restart", name);
                return false;
            }
        }

        info!(
            "Restarting MCP server: {} (attempt {})",
            name,
            restart_count + 1
        );

        // Best-effort teardown of whatever container is left.
        if container_id.is_some() {
            if let Err(e) = self.runtime.remove_container(name, true).await {
                warn!("Failed to remove existing container for {}: {}", name, e);
            }
        }

        let group_id = {
            let groups = self.groups.read().await;
            groups
                .iter()
                .find(|(_, group)| group.members.iter().any(|m| m == name))
                .map(|(id, _)| id.clone())
                .unwrap_or_default()
        };

        match self.deploy_single(&group_id, &spec).await {
            Ok(()) => {
                let new_count = {
                    let mut instances = self.instances.write().await;
                    match instances.get_mut(name) {
                        Some(instance) => {
                            instance.restart_count = restart_count + 1;
                            instance.last_restart = Some(Utc::now());
                            instance.restart_count
                        }
                        None => restart_count + 1,
                    }
                };

                info!("MCP server {} restarted successfully", name);
                self.events.emit(Event::InstanceRestarted {
                    name: name.to_string(),
                    restart_count: new_count,
                });
                true
            }
            Err(e) => {
                error!("Failed to restart MCP server {}: {}", name, e);
                self.events.emit(Event::InstanceRestartFailed {
                    name: name.to_string(),
                    error: e.to_string(),
                });
                false
            }
        }
    }

    /// Pure read: snapshot of all groups and their instances.
    pub async fn status(&self) -> HashMap<String, GroupSnapshot> {
        let groups = self.groups.read().await;
        let instances = self.instances.read().await;

        groups
            .iter()
            .map(|(group_id, group)| {
                let members: HashMap<String, InstanceSnapshot> = group
                    .members
                    .iter()
                    .filter_map(|name| {
                        instances
                            .get(name)
                            .map(|instance| (name.clone(), InstanceSnapshot::from(instance)))
                    })
                    .collect();

                (
                    group_id.clone(),
                    GroupSnapshot {
                        collective_status: group.status,
                        total_instances: group.members.len(),
                        running_instances: group.running,
                        healthy_instances: group.healthy,
                        shared_networking: group.shared_networking,
                        instances: members,
                    },
                )
            })
            .collect()
    }

    /// Log retrieval is a pass-through to the runtime client.
    pub async fn server_logs(&self, name: &str, tail: Option<u32>) -> Result<String> {
        let container_id = {
            let instances = self.instances.read().await;
            instances
                .get(name)
                .and_then(|instance| instance.container_id.clone())
        };

        match container_id {
            Some(id) => self.runtime.logs(&id, tail).await,
            None => Err(BerthError::Runtime(RuntimeError::ContainerNotFound {
                name: name.to_string(),
            })),
        }
    }

    /// Static spec validation without deployment; returns per-name errors.
    pub fn validate_specs(&self, specs: &[ServerSpec]) -> HashMap<String, String> {
        let mut errors = HashMap::new();
        for spec in specs {
            if let Err(e) = self.resolver.validate_spec(spec) {
                errors.insert(spec.name.clone(), e.to_string());
            }
        }
        errors
    }

    pub fn list_config_templates(&self) -> Vec<String> {
        self.resolver.templates()
    }

    /// Tear down every group and stop all background work.
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator");

        let group_ids: Vec<String> = self.groups.read().await.keys().cloned().collect();
        for group_id in group_ids {
            let options = RemoveOptions {
                force: true,
                graceful_timeout: Duration::from_secs(10),
            };
            if let Err(e) = self.remove_group(&group_id, options).await {
                warn!("Failed to remove group {} during shutdown: {}", group_id, e);
            }
        }

        self.monitor.shutdown().await;
        self.injector.shutdown().await;

        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }

        info!("Orchestrator shutdown complete");
    }

    async fn on_health_changed(&self, name: &str, health: HealthState) {
        let status = {
            let mut instances = self.instances.write().await;
            let Some(instance) = instances.get_mut(name) else {
                return;
            };
            instance.health = health;
            instance.last_health_check = Some(Utc::now());
            instance.status
        };

        let owning_group = {
            let groups = self.groups.read().await;
            groups
                .iter()
                .find(|(_, group)| group.members.iter().any(|m| m == name))
                .map(|(id, _)| id.clone())
        };

        if let Some(group_id) = owning_group {
            self.update_group_status(&group_id).await;
        }

        if health == HealthState::Unhealthy && status == InstanceStatus::Running {
            info!("MCP server {} is unhealthy, scheduling restart", name);
            let orchestrator = self.clone();
            let instance = name.to_string();
            let delay = self.config.auto_restart_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                orchestrator.restart_server(&instance).await;
            });
        }
    }

    async fn on_credential_updated(&self, account_id: &str, providers: &[String]) {
        let instances = self.instances.read().await;
        for instance in instances.values() {
            if instance.spec.account_id != account_id {
                continue;
            }
            for provider in providers {
                if instance.spec.required_oauth_providers.contains(provider) {
                    debug!(
                        "OAuth credential updated for {}, restart may be needed",
                        instance.spec.name
                    );
                    self.events.emit(Event::CredentialUpdateRequired {
                        name: instance.spec.name.clone(),
                        provider: provider.clone(),
                    });
                }
            }
        }
    }

    async fn set_instance_status(&self, name: &str, status: InstanceStatus) {
        {
            let mut instances = self.instances.write().await;
            if let Some(instance) = instances.get_mut(name) {
                instance.status = status;
            }
        }
        self.events.emit(Event::InstanceStatusChanged {
            name: name.to_string(),
            status,
            container_id: None,
            error: None,
        });
    }

    async fn set_instance_error(&self, name: &str, message: &str) {
        {
            let mut instances = self.instances.write().await;
            if let Some(instance) = instances.get_mut(name) {
                instance.status = InstanceStatus::Error;
                instance.last_error = Some(message.to_string());
            }
        }
        self.events.emit(Event::InstanceStatusChanged {
            name: name.to_string(),
            status: InstanceStatus::Error,
            container_id: None,
            error: Some(message.to_string()),
        });
    }

    /// Recompute a group's derived counters and collective status from its
    /// members.
    async fn update_group_status(&self, group_id: &str) {
        let mut groups = self.groups.write().await;
        let instances = self.instances.read().await;
        let Some(group) = groups.get_mut(group_id) else {
            return;
        };

        let mut running = 0;
        let mut healthy = 0;
        for name in &group.members {
            if let Some(instance) = instances.get(name) {
                if instance.status == InstanceStatus::Running {
                    running += 1;
                    if instance.health == HealthState::Healthy {
                        healthy += 1;
                    }
                }
            }
        }

        group.running = running;
        group.healthy = healthy;
        group.status = GroupStatus::derive(group.members.len(), running, healthy);

        self.events.emit(Event::GroupStatusChanged {
            group_id: group_id.to_string(),
            collective_status: group.status,
            running_instances: running,
            healthy_instances: healthy,
            total_instances: group.members.len(),
        });
    }
}

/// Stable-sort specs by their index in the dependency order; unlisted specs
/// keep their relative order after all listed ones.
pub(crate) fn deployment_order(
    mut specs: Vec<ServerSpec>,
    dependency_order: &[String],
) -> Vec<ServerSpec> {
    if dependency_order.is_empty() {
        return specs;
    }

    specs.sort_by_key(|spec| {
        dependency_order
            .iter()
            .position(|name| name == &spec.name)
            .unwrap_or(usize::MAX)
    });
    specs
}
