use crate::error::RuntimeError;
use crate::resolver::ContainerSpec;
use crate::{BerthError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Observed state of a container, as reported by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerState {
    pub running: bool,
    pub status: String,
    /// Published ports: container port spec (e.g. "8080/tcp") -> host port.
    pub host_ports: HashMap<String, u16>,
}

/// Summary entry from a container listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
}

/// Container runtime primitives the orchestrator depends on.
///
/// The production implementation is [`DockerCli`]; tests substitute fakes.
/// Runtime calls carry no Berth-side timeout and rely on the daemon's own
/// defaults.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create and start a container from a fully-resolved spec, returning
    /// the container id.
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String>;

    async fn stop_container(&self, id: &str, graceful_timeout: Duration) -> Result<()>;

    async fn remove_container(&self, name_or_id: &str, force: bool) -> Result<()>;

    async fn inspect(&self, id: &str) -> Result<ContainerState>;

    async fn logs(&self, name_or_id: &str, tail: Option<u32>) -> Result<String>;
}

/// Docker-CLI-backed runtime client.
#[derive(Debug, Clone, Default)]
pub struct DockerCli;

impl DockerCli {
    pub fn new() -> Self {
        Self
    }

    async fn docker(&self, args: &[String]) -> Result<String> {
        debug!("docker {}", args.join(" "));

        let output = Command::new("docker").args(args).output().await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(BerthError::Runtime(RuntimeError::CommandFailed {
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }))
        }
    }

    /// Create the group network if it does not exist yet. Networks are
    /// created implicitly on first use and never torn down here.
    async fn ensure_network(&self, name: &str) -> Result<()> {
        let args = vec!["network".to_string(), "create".to_string(), name.to_string()];
        match self.docker(&args).await {
            Ok(_) => {
                info!("Created container network: {}", name);
                Ok(())
            }
            Err(BerthError::Runtime(RuntimeError::CommandFailed { message }))
                if message.contains("already exists") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Containers belonging to one managed group, found via the group
    /// label rather than in-process state. Lets a fresh CLI process act on
    /// groups deployed by an earlier one.
    pub async fn list_group(&self, group_id: &str) -> Result<Vec<ContainerSummary>> {
        self.list_filtered(Some(group_id)).await
    }

    /// All berth-managed containers, keyed by their group label.
    pub async fn list_managed(&self) -> Result<Vec<(String, ContainerSummary)>> {
        let args = vec![
            "ps".to_string(),
            "-a".to_string(),
            "--filter".to_string(),
            "label=berth.managed_by=berth".to_string(),
            "--format".to_string(),
            "{{.ID}}\t{{.Names}}\t{{.Image}}\t{{.Status}}\t{{.Label \"berth.mcp.group_id\"}}"
                .to_string(),
        ];

        let stdout = self.docker(&args).await?;
        let mut containers = Vec::new();
        for line in stdout.lines() {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 5 {
                warn!("Unparseable container listing line: {}", line);
                continue;
            }
            containers.push((
                fields[4].to_string(),
                ContainerSummary {
                    id: fields[0].to_string(),
                    name: fields[1].to_string(),
                    image: fields[2].to_string(),
                    status: fields[3].to_string(),
                },
            ));
        }
        Ok(containers)
    }

    async fn list_filtered(&self, group_id: Option<&str>) -> Result<Vec<ContainerSummary>> {
        let mut args = vec!["ps".to_string(), "-a".to_string()];
        if let Some(group_id) = group_id {
            args.push("--filter".to_string());
            args.push(format!("label=berth.mcp.group_id={group_id}"));
        }
        args.push("--format".to_string());
        args.push("{{.ID}}\t{{.Names}}\t{{.Image}}\t{{.Status}}".to_string());

        let stdout = self.docker(&args).await?;
        let mut containers = Vec::new();
        for line in stdout.lines() {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 4 {
                warn!("Unparseable container listing line: {}", line);
                continue;
            }
            containers.push(ContainerSummary {
                id: fields[0].to_string(),
                name: fields[1].to_string(),
                image: fields[2].to_string(),
                status: fields[3].to_string(),
            });
        }
        Ok(containers)
    }

    fn run_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--restart".to_string(),
            format!(
                "{}:{}",
                spec.restart_policy.name, spec.restart_policy.max_retries
            ),
        ];

        for env in &spec.env {
            args.push("-e".to_string());
            args.push(env.clone());
        }

        for (container_port, host_port) in &spec.port_bindings {
            args.push("-p".to_string());
            let port = container_port.trim_end_matches("/tcp");
            args.push(format!("{host_port}:{port}"));
        }

        args.push("--network".to_string());
        args.push(spec.network_mode.clone());
        for alias in &spec.network_aliases {
            args.push("--network-alias".to_string());
            args.push(alias.clone());
        }

        args.push("--memory".to_string());
        args.push(spec.memory_bytes.to_string());
        args.push("--cpu-shares".to_string());
        args.push(spec.cpu_shares.to_string());

        for opt in &spec.security_opts {
            args.push("--security-opt".to_string());
            args.push(opt.clone());
        }
        if spec.readonly_rootfs {
            args.push("--read-only".to_string());
        }
        for (path, opts) in &spec.tmpfs {
            args.push("--tmpfs".to_string());
            args.push(format!("{path}:{opts}"));
        }

        args.push("--log-driver".to_string());
        args.push(spec.log_config.driver.clone());
        for (key, value) in &spec.log_config.options {
            args.push("--log-opt".to_string());
            args.push(format!("{key}={value}"));
        }

        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }

        if let Some(ref workdir) = spec.working_dir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }

        args.push(spec.image.clone());

        if let Some(ref cmd) = spec.cmd {
            args.extend(cmd.iter().cloned());
        }

        args
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn pull_image(&self, image: &str) -> Result<()> {
        info!("⬇️  Pulling image: {}", image);

        let args = vec!["pull".to_string(), image.to_string()];
        self.docker(&args).await.map_err(|e| {
            BerthError::Runtime(RuntimeError::ImagePullFailed {
                image: image.to_string(),
                reason: e.to_string(),
            })
        })?;

        Ok(())
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String> {
        info!("🐳 Starting container: {} ({})", spec.name, spec.image);

        // Shared group networks come into existence with their first member.
        if !matches!(spec.network_mode.as_str(), "bridge" | "host" | "none") {
            self.ensure_network(&spec.network_mode).await?;
        }

        let args = Self::run_args(spec);
        let container_id = self.docker(&args).await.map_err(|e| {
            BerthError::Runtime(RuntimeError::StartFailed {
                reason: e.to_string(),
            })
        })?;

        debug!("Container {} started as {}", spec.name, container_id);
        Ok(container_id)
    }

    async fn stop_container(&self, id: &str, graceful_timeout: Duration) -> Result<()> {
        let args = vec![
            "stop".to_string(),
            "-t".to_string(),
            graceful_timeout.as_secs().to_string(),
            id.to_string(),
        ];
        self.docker(&args).await.map_err(|e| {
            BerthError::Runtime(RuntimeError::StopFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })
        })?;
        Ok(())
    }

    async fn remove_container(&self, name_or_id: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(name_or_id.to_string());

        self.docker(&args).await.map_err(|e| {
            BerthError::Runtime(RuntimeError::RemoveFailed {
                id: name_or_id.to_string(),
                reason: e.to_string(),
            })
        })?;
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerState> {
        let args = vec!["inspect".to_string(), id.to_string()];
        let stdout = self.docker(&args).await.map_err(|e| {
            BerthError::Runtime(RuntimeError::InspectFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })
        })?;

        let parsed: serde_json::Value = serde_json::from_str(&stdout)?;
        let entry = parsed.get(0).ok_or_else(|| {
            BerthError::Runtime(RuntimeError::ContainerNotFound {
                name: id.to_string(),
            })
        })?;

        let running = entry["State"]["Running"].as_bool().unwrap_or(false);
        let status = entry["State"]["Status"]
            .as_str()
            .unwrap_or("unknown")
            .to_string();

        let mut host_ports = HashMap::new();
        if let Some(ports) = entry["NetworkSettings"]["Ports"].as_object() {
            for (container_port, bindings) in ports {
                let Some(first) = bindings.as_array().and_then(|b| b.first()) else {
                    continue;
                };
                if let Some(host_port) = first["HostPort"]
                    .as_str()
                    .and_then(|p| p.parse::<u16>().ok())
                {
                    host_ports.insert(container_port.clone(), host_port);
                }
            }
        }

        Ok(ContainerState {
            running,
            status,
            host_ports,
        })
    }

    async fn logs(&self, name_or_id: &str, tail: Option<u32>) -> Result<String> {
        let mut args = vec!["logs".to_string()];
        if let Some(tail) = tail {
            args.push("--tail".to_string());
            args.push(tail.to_string());
        }
        args.push(name_or_id.to_string());

        self.docker(&args).await
    }
}
