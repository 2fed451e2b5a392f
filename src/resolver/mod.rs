use crate::error::ConfigError;
use crate::types::{ServerSpec, TransportKind};
use crate::{BerthError, Result};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

const NETWORK_PREFIX: &str = "berth-mcp";
const DEFAULT_MEMORY_LIMIT: &str = "512m";
const DEFAULT_CPU_SHARES: i64 = 1024;
const LOW_MEMORY_WARNING_BYTES: i64 = 64 * 1024 * 1024;
const EPHEMERAL_PORT_RANGE: std::ops::RangeInclusive<u16> = 32768..=65535;

/// Networking context a group deployment passes to the resolver.
#[derive(Debug, Clone)]
pub struct NetworkContext {
    pub group_id: String,
    pub shared_networking: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub name: String,
    pub max_retries: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            name: "unless-stopped".to_string(),
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub driver: String,
    pub options: HashMap<String, String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            driver: "json-file".to_string(),
            options: HashMap::from([
                ("max-size".to_string(), "10m".to_string()),
                ("max-file".to_string(), "3".to_string()),
            ]),
        }
    }
}

/// Fully-resolved, runtime-ready container specification.
///
/// Produced fresh for every deployment and discarded once the container is
/// created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub env: Vec<String>,
    pub cmd: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub exposed_ports: Vec<String>,
    /// Container port spec -> host port.
    pub port_bindings: HashMap<String, u16>,
    pub network_mode: String,
    pub network_aliases: Vec<String>,
    pub restart_policy: RestartPolicy,
    pub memory_bytes: i64,
    pub cpu_shares: i64,
    pub security_opts: Vec<String>,
    pub readonly_rootfs: bool,
    pub tmpfs: HashMap<String, String>,
    pub log_config: LogConfig,
    pub labels: HashMap<String, String>,
}

/// Resource preset applied through [`ConfigResolver::apply_template`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceTemplate {
    pub memory: String,
    pub cpu_shares: i64,
}

/// Default resource and security posture used when a spec does not override
/// them.
#[derive(Debug, Clone)]
pub struct ResolverDefaults {
    pub memory_limit: String,
    pub cpu_shares: i64,
    pub readonly_rootfs: bool,
    pub no_new_privileges: bool,
    pub drop_capabilities: Vec<String>,
    pub add_capabilities: Vec<String>,
    pub seccomp_profile: Option<String>,
    pub apparmor_profile: Option<String>,
}

impl Default for ResolverDefaults {
    fn default() -> Self {
        Self {
            memory_limit: DEFAULT_MEMORY_LIMIT.to_string(),
            cpu_shares: DEFAULT_CPU_SHARES,
            // Some MCP servers need write access to their root filesystem.
            readonly_rootfs: false,
            no_new_privileges: true,
            drop_capabilities: vec!["ALL".to_string()],
            add_capabilities: vec!["NET_BIND_SERVICE".to_string()],
            seccomp_profile: None,
            apparmor_profile: None,
        }
    }
}

/// Audit view of a resolved specification.
#[derive(Debug, Clone, Serialize)]
pub struct SpecSummary {
    pub security_features: Vec<String>,
    pub memory_bytes: i64,
    pub cpu_shares: i64,
    pub network_mode: String,
    pub port_bindings: HashMap<String, u16>,
    pub env_var_count: usize,
}

/// Turns a declarative [`ServerSpec`] plus injected credentials and group
/// networking context into a runtime-ready [`ContainerSpec`].
///
/// Resolution is layered; each layer may override the previous one, and the
/// typed override block is merged last as a documented escape hatch.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    defaults: ResolverDefaults,
    templates: HashMap<String, ResourceTemplate>,
}

impl ConfigResolver {
    pub fn new() -> Self {
        let templates = HashMap::from([
            (
                "standard".to_string(),
                ResourceTemplate {
                    memory: "512m".to_string(),
                    cpu_shares: 1024,
                },
            ),
            (
                "high-performance".to_string(),
                ResourceTemplate {
                    memory: "2g".to_string(),
                    cpu_shares: 2048,
                },
            ),
            (
                "minimal".to_string(),
                ResourceTemplate {
                    memory: "128m".to_string(),
                    cpu_shares: 512,
                },
            ),
        ]);

        Self {
            defaults: ResolverDefaults::default(),
            templates,
        }
    }

    pub fn with_defaults(defaults: ResolverDefaults) -> Self {
        let mut resolver = Self::new();
        resolver.defaults = defaults;
        resolver
    }

    /// Resolve a complete container specification for one MCP server.
    pub fn resolve(
        &self,
        spec: &ServerSpec,
        injected_env: &HashMap<String, String>,
        network: &NetworkContext,
    ) -> Result<ContainerSpec> {
        debug!("Resolving container spec for {}", spec.name);

        // Layer 1: base identity.
        let mut container = ContainerSpec {
            image: spec.image.clone(),
            name: spec.name.clone(),
            env: Vec::new(),
            cmd: None,
            working_dir: None,
            exposed_ports: Vec::new(),
            port_bindings: HashMap::new(),
            network_mode: "bridge".to_string(),
            network_aliases: Vec::new(),
            restart_policy: RestartPolicy::default(),
            memory_bytes: 0,
            cpu_shares: 0,
            security_opts: Vec::new(),
            readonly_rootfs: false,
            tmpfs: HashMap::new(),
            log_config: LogConfig::default(),
            labels: self.build_labels(spec, &network.group_id),
        };

        // Layer 2: environment.
        container.env = self.build_env(spec, injected_env)?;

        // Layer 3: networking.
        self.apply_networking(&mut container, spec, network);

        // Layer 4: resources.
        self.apply_resources(&mut container, spec)?;

        // Layer 5: security.
        self.apply_security(&mut container, spec);

        // Layer 6: logging labels.
        container.log_config.options.insert(
            "labels".to_string(),
            format!("mcp_server,instance_name={}", spec.name),
        );

        // Layer 7: caller overrides, merged last.
        self.apply_overrides(&mut container, spec);

        // Layer 8: validation.
        self.validate(&container, spec)?;

        Ok(container)
    }

    /// Static check mirroring the resolver's pre-creation validation,
    /// without touching credentials or allocating ports.
    pub fn validate_spec(&self, spec: &ServerSpec) -> Result<()> {
        if spec.image.trim().is_empty() {
            return Err(BerthError::Config(ConfigError::MissingField {
                field: format!("image (instance {})", spec.name),
            }));
        }
        if spec.name.trim().is_empty() {
            return Err(BerthError::Config(ConfigError::MissingField {
                field: "name".to_string(),
            }));
        }
        if let Some(resources) = spec.overrides.resources.as_ref() {
            if let Some(ref memory) = resources.memory {
                parse_memory_limit(memory)?;
            }
        }
        Ok(())
    }

    pub fn templates(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.keys().cloned().collect();
        names.sort();
        names
    }

    /// Merge a named resource preset into the spec's override block.
    /// Explicit per-spec resource overrides keep precedence over the
    /// template.
    pub fn apply_template(&self, spec: &ServerSpec, template_name: &str) -> Result<ServerSpec> {
        let template = self.templates.get(template_name).ok_or_else(|| {
            BerthError::Config(ConfigError::TemplateNotFound {
                name: template_name.to_string(),
            })
        })?;

        let mut templated = spec.clone();
        let resources = templated
            .overrides
            .resources
            .get_or_insert_with(Default::default);
        if resources.memory.is_none() {
            resources.memory = Some(template.memory.clone());
        }
        if resources.cpu_shares.is_none() {
            resources.cpu_shares = Some(template.cpu_shares);
        }

        info!("Applied template '{}' to {}", template_name, spec.name);
        Ok(templated)
    }

    /// Audit summary of a resolved spec.
    pub fn summarize(&self, container: &ContainerSpec) -> SpecSummary {
        let mut security_features = Vec::new();
        if container.readonly_rootfs {
            security_features.push("read-only-root-filesystem".to_string());
        }
        if container
            .security_opts
            .iter()
            .any(|o| o == "no-new-privileges:true")
        {
            security_features.push("no-new-privileges".to_string());
        }
        if container
            .security_opts
            .iter()
            .any(|o| o.starts_with("seccomp="))
        {
            security_features.push("seccomp-profile".to_string());
        }
        if container
            .security_opts
            .iter()
            .any(|o| o.starts_with("apparmor="))
        {
            security_features.push("apparmor-profile".to_string());
        }

        SpecSummary {
            security_features,
            memory_bytes: container.memory_bytes,
            cpu_shares: container.cpu_shares,
            network_mode: container.network_mode.clone(),
            port_bindings: container.port_bindings.clone(),
            env_var_count: container.env.len(),
        }
    }

    fn build_labels(&self, spec: &ServerSpec, group_id: &str) -> HashMap<String, String> {
        HashMap::from([
            ("berth.mcp.server".to_string(), "true".to_string()),
            ("berth.mcp.instance_name".to_string(), spec.name.clone()),
            (
                "berth.mcp.account_id".to_string(),
                spec.account_id.clone(),
            ),
            (
                "berth.mcp.transport".to_string(),
                spec.transport.to_string(),
            ),
            (
                "berth.mcp.endpoint_path".to_string(),
                spec.endpoint_path.clone(),
            ),
            ("berth.mcp.group_id".to_string(), group_id.to_string()),
            (
                "berth.deployment.id".to_string(),
                uuid::Uuid::new_v4().to_string(),
            ),
            (
                "berth.deployment.timestamp".to_string(),
                Utc::now().to_rfc3339(),
            ),
            ("berth.managed_by".to_string(), "berth".to_string()),
        ])
    }

    fn build_env(
        &self,
        spec: &ServerSpec,
        injected_env: &HashMap<String, String>,
    ) -> Result<Vec<String>> {
        let mut env = vec![
            format!("MCP_ENDPOINT_PATH={}", spec.endpoint_path),
            format!("MCP_TRANSPORT_TYPE={}", spec.transport),
            format!("MCP_SERVER_NAME={}", spec.name),
            format!("MCP_ACCOUNT_ID={}", spec.account_id),
        ];

        if !spec.capabilities.is_empty() {
            env.push(format!(
                "MCP_CAPABILITIES={}",
                serde_json::to_string(&spec.capabilities)?
            ));
        }
        if !spec.discovery_metadata.is_empty() {
            env.push(format!(
                "MCP_DISCOVERY_METADATA={}",
                serde_json::to_string(&spec.discovery_metadata)?
            ));
        }

        // Injected OAuth material, held only in memory upstream of here.
        let mut injected: Vec<_> = injected_env.iter().collect();
        injected.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in injected {
            env.push(format!("{key}={value}"));
        }

        let mut custom: Vec<_> = spec.env.iter().collect();
        custom.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in custom {
            env.push(format!("{key}={value}"));
        }

        env.push(format!("CONTAINER_NAME={}", spec.name));
        env.push(format!("DEPLOYMENT_TIMESTAMP={}", Utc::now().to_rfc3339()));
        env.push("BERTH_RUNTIME_ENV=production".to_string());

        Ok(env)
    }

    fn apply_networking(
        &self,
        container: &mut ContainerSpec,
        spec: &ServerSpec,
        network: &NetworkContext,
    ) {
        // Explicit caller bindings win outright.
        if !spec.port_bindings.is_empty() {
            container.port_bindings = spec.port_bindings.clone();
        } else if let Some(container_port) = default_port_for(spec.transport) {
            // No real collision check against host state; an allocation can
            // race with another process binding the same port.
            let host_port = rand::thread_rng().gen_range(EPHEMERAL_PORT_RANGE);
            container
                .port_bindings
                .insert(format!("{container_port}/tcp"), host_port);
        }

        container.exposed_ports = container.port_bindings.keys().cloned().collect();

        if network.shared_networking {
            let network_name = format!("{NETWORK_PREFIX}-{}", network.group_id);
            container.network_mode = network_name;
            container.network_aliases = vec![spec.name.clone()];
        } else {
            container.network_mode = "bridge".to_string();
        }
    }

    fn apply_resources(&self, container: &mut ContainerSpec, spec: &ServerSpec) -> Result<()> {
        container.memory_bytes = parse_memory_limit(&self.defaults.memory_limit)?;
        container.cpu_shares = self.defaults.cpu_shares;

        if let Some(resources) = spec.overrides.resources.as_ref() {
            if let Some(ref memory) = resources.memory {
                container.memory_bytes = parse_memory_limit(memory)?;
            }
            if let Some(cpu_shares) = resources.cpu_shares {
                container.cpu_shares = cpu_shares;
            }
        }

        Ok(())
    }

    fn apply_security(&self, container: &mut ContainerSpec, spec: &ServerSpec) {
        // Default-deny posture: drop everything, add back what is required.
        for capability in &self.defaults.drop_capabilities {
            container.security_opts.push(format!("cap-drop={capability}"));
        }
        for capability in &self.defaults.add_capabilities {
            container.security_opts.push(format!("cap-add={capability}"));
        }

        if self.defaults.no_new_privileges {
            container
                .security_opts
                .push("no-new-privileges:true".to_string());
        }

        let mut readonly = self.defaults.readonly_rootfs;
        let mut seccomp = self.defaults.seccomp_profile.clone();
        let mut apparmor = self.defaults.apparmor_profile.clone();

        if let Some(security) = spec.overrides.security.as_ref() {
            if let Some(flag) = security.readonly_rootfs {
                readonly = flag;
            }
            if security.seccomp_profile.is_some() {
                seccomp = security.seccomp_profile.clone();
            }
            if security.apparmor_profile.is_some() {
                apparmor = security.apparmor_profile.clone();
            }
        }

        if readonly {
            container.readonly_rootfs = true;
            container.tmpfs = HashMap::from([
                ("/tmp".to_string(), "rw,noexec,nosuid,size=100m".to_string()),
                (
                    "/var/run".to_string(),
                    "rw,noexec,nosuid,size=10m".to_string(),
                ),
            ]);
        }

        // Profile names are passed through verbatim.
        if let Some(profile) = seccomp {
            container.security_opts.push(format!("seccomp={profile}"));
        }
        if let Some(profile) = apparmor {
            container.security_opts.push(format!("apparmor={profile}"));
        }
    }

    fn apply_overrides(&self, container: &mut ContainerSpec, spec: &ServerSpec) {
        let overrides = &spec.overrides;

        container.env.extend(overrides.env.iter().cloned());

        if let Some(ref cmd) = overrides.cmd {
            container.cmd = Some(cmd.clone());
        }
        if let Some(ref workdir) = overrides.working_dir {
            container.working_dir = Some(workdir.clone());
        }
        if let Some(ref network_mode) = overrides.network_mode {
            container.network_mode = network_mode.clone();
        }
        for (key, value) in &overrides.labels {
            container.labels.insert(key.clone(), value.clone());
        }
    }

    fn validate(&self, container: &ContainerSpec, spec: &ServerSpec) -> Result<()> {
        if container.image.trim().is_empty() {
            return Err(BerthError::Config(ConfigError::MissingField {
                field: "image".to_string(),
            }));
        }
        if container.name.trim().is_empty() {
            return Err(BerthError::Config(ConfigError::MissingField {
                field: "name".to_string(),
            }));
        }

        if spec.transport != TransportKind::Stdio && container.port_bindings.is_empty() {
            return Err(BerthError::Config(ConfigError::InvalidSpec {
                name: spec.name.clone(),
                reason: format!(
                    "port bindings required for transport type: {}",
                    spec.transport
                ),
            }));
        }

        if container.memory_bytes < LOW_MEMORY_WARNING_BYTES {
            warn!(
                "Memory limit very low for {}: {} bytes",
                spec.name, container.memory_bytes
            );
        }

        for env in &container.env {
            let lowered = env.to_lowercase();
            if lowered.contains("password") && !env.contains("_ID") && !env.contains("_REF") {
                warn!(
                    "Potential plain text secret in environment variables for {}",
                    spec.name
                );
            }
        }

        Ok(())
    }
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Default container port for a transport, per MCP convention.
fn default_port_for(transport: TransportKind) -> Option<u16> {
    match transport {
        TransportKind::Sse => Some(8080),
        TransportKind::Websocket => Some(3000),
        TransportKind::Stdio => None,
    }
}

/// Parse a memory limit with `<int><k|m|g|t>` suffix grammar,
/// case-insensitive, optional trailing `b`.
pub fn parse_memory_limit(limit: &str) -> Result<i64> {
    let trimmed = limit.trim();
    let lowered = trimmed.to_lowercase();

    let digits_end = lowered
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(lowered.len());
    let (digits, suffix) = lowered.split_at(digits_end);

    let invalid = || {
        BerthError::Config(ConfigError::InvalidMemoryLimit {
            value: limit.to_string(),
        })
    };

    if digits.is_empty() {
        return Err(invalid());
    }
    let value: i64 = digits.parse().map_err(|_| invalid())?;

    let multiplier: i64 = match suffix.trim_end_matches('b') {
        "" => 1,
        "k" => 1024,
        "m" => 1024 * 1024,
        "g" => 1024 * 1024 * 1024,
        "t" => 1024_i64.pow(4),
        _ => return Err(invalid()),
    };

    // Reject things like "512mm" or "512bb" that survive the strip above.
    let unit_len = suffix.trim_end_matches('b').len();
    if suffix.len() - unit_len > 1 {
        return Err(invalid());
    }

    Ok(value * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sse_spec(name: &str) -> ServerSpec {
        ServerSpec {
            name: name.to_string(),
            image: "mcp/github:latest".to_string(),
            account_id: "acct-1".to_string(),
            transport: TransportKind::Sse,
            endpoint_path: "/mcp".to_string(),
            capabilities: HashMap::new(),
            discovery_metadata: HashMap::new(),
            required_oauth_providers: Vec::new(),
            port_bindings: HashMap::new(),
            env: HashMap::new(),
            overrides: Default::default(),
        }
    }

    #[test]
    fn parses_memory_suffixes() {
        assert_eq!(parse_memory_limit("512m").unwrap(), 536_870_912);
        assert_eq!(parse_memory_limit("2g").unwrap(), 2_147_483_648);
        assert_eq!(parse_memory_limit("2G").unwrap(), 2_147_483_648);
        assert_eq!(parse_memory_limit("1024").unwrap(), 1024);
        assert_eq!(parse_memory_limit("4kb").unwrap(), 4096);
        assert_eq!(parse_memory_limit("1t").unwrap(), 1_099_511_627_776);
    }

    #[test]
    fn rejects_invalid_memory_formats() {
        assert!(parse_memory_limit("bogus").is_err());
        assert!(parse_memory_limit("").is_err());
        assert!(parse_memory_limit("12x").is_err());
        assert!(parse_memory_limit("m512").is_err());
    }

    #[test]
    fn sse_transport_gets_ephemeral_port_on_8080() {
        let resolver = ConfigResolver::new();
        let network = NetworkContext {
            group_id: "g1".to_string(),
            shared_networking: false,
        };

        let container = resolver
            .resolve(&sse_spec("a"), &HashMap::new(), &network)
            .unwrap();

        let host_port = container.port_bindings.get("8080/tcp").copied().unwrap();
        assert!((32768..=65535).contains(&host_port));
        assert_eq!(container.network_mode, "bridge");
    }

    #[test]
    fn stdio_transport_gets_no_ports() {
        let resolver = ConfigResolver::new();
        let mut spec = sse_spec("a");
        spec.transport = TransportKind::Stdio;

        let container = resolver
            .resolve(
                &spec,
                &HashMap::new(),
                &NetworkContext {
                    group_id: "g1".to_string(),
                    shared_networking: false,
                },
            )
            .unwrap();

        assert!(container.port_bindings.is_empty());
        assert!(container.exposed_ports.is_empty());
    }

    #[test]
    fn explicit_port_bindings_win_over_derivation() {
        let resolver = ConfigResolver::new();
        let mut spec = sse_spec("a");
        spec.port_bindings = HashMap::from([("9000/tcp".to_string(), 41000)]);

        let container = resolver
            .resolve(
                &spec,
                &HashMap::new(),
                &NetworkContext {
                    group_id: "g1".to_string(),
                    shared_networking: false,
                },
            )
            .unwrap();

        assert_eq!(
            container.port_bindings,
            HashMap::from([("9000/tcp".to_string(), 41000)])
        );
    }

    #[test]
    fn shared_networking_attaches_group_network_with_alias() {
        let resolver = ConfigResolver::new();
        let container = resolver
            .resolve(
                &sse_spec("web"),
                &HashMap::new(),
                &NetworkContext {
                    group_id: "tools".to_string(),
                    shared_networking: true,
                },
            )
            .unwrap();

        assert_eq!(container.network_mode, "berth-mcp-tools");
        assert_eq!(container.network_aliases, vec!["web".to_string()]);
    }

    #[test]
    fn env_layers_keep_injection_order() {
        let resolver = ConfigResolver::new();
        let mut spec = sse_spec("a");
        spec.env = HashMap::from([("CUSTOM_VAR".to_string(), "custom".to_string())]);
        let injected = HashMap::from([(
            "OAUTH_GITHUB_ACCESS_TOKEN".to_string(),
            "token".to_string(),
        )]);

        let container = resolver
            .resolve(
                &spec,
                &injected,
                &NetworkContext {
                    group_id: "g1".to_string(),
                    shared_networking: false,
                },
            )
            .unwrap();

        let idx = |needle: &str| {
            container
                .env
                .iter()
                .position(|e| e.starts_with(needle))
                .unwrap_or_else(|| panic!("missing env var {needle}"))
        };

        assert!(idx("MCP_ENDPOINT_PATH=") < idx("OAUTH_GITHUB_ACCESS_TOKEN="));
        assert!(idx("OAUTH_GITHUB_ACCESS_TOKEN=") < idx("CUSTOM_VAR="));
        assert!(idx("CUSTOM_VAR=") < idx("CONTAINER_NAME="));
    }

    #[test]
    fn missing_image_is_fatal() {
        let resolver = ConfigResolver::new();
        let mut spec = sse_spec("a");
        spec.image = String::new();

        let result = resolver.resolve(
            &spec,
            &HashMap::new(),
            &NetworkContext {
                group_id: "g1".to_string(),
                shared_networking: false,
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn override_block_is_merged_last() {
        let resolver = ConfigResolver::new();
        let mut spec = sse_spec("a");
        spec.overrides.env = vec!["EXTRA=1".to_string()];
        spec.overrides.cmd = Some(vec!["serve".to_string()]);
        spec.overrides.network_mode = Some("host".to_string());
        spec.overrides
            .labels
            .insert("team".to_string(), "mcp".to_string());

        let container = resolver
            .resolve(
                &spec,
                &HashMap::new(),
                &NetworkContext {
                    group_id: "g1".to_string(),
                    shared_networking: true,
                },
            )
            .unwrap();

        // Overrides bypass the shared-networking layer by design.
        assert_eq!(container.network_mode, "host");
        assert_eq!(container.cmd, Some(vec!["serve".to_string()]));
        assert_eq!(container.env.last().unwrap(), "EXTRA=1");
        assert_eq!(container.labels.get("team"), Some(&"mcp".to_string()));
    }

    #[test]
    fn resource_overrides_replace_defaults() {
        let resolver = ConfigResolver::new();
        let mut spec = sse_spec("a");
        spec.overrides.resources = Some(crate::types::ResourceOverrides {
            memory: Some("2g".to_string()),
            cpu_shares: Some(2048),
        });

        let container = resolver
            .resolve(
                &spec,
                &HashMap::new(),
                &NetworkContext {
                    group_id: "g1".to_string(),
                    shared_networking: false,
                },
            )
            .unwrap();

        assert_eq!(container.memory_bytes, 2_147_483_648);
        assert_eq!(container.cpu_shares, 2048);
    }

    #[test]
    fn invalid_memory_override_is_a_config_error() {
        let resolver = ConfigResolver::new();
        let mut spec = sse_spec("a");
        spec.overrides.resources = Some(crate::types::ResourceOverrides {
            memory: Some("bogus".to_string()),
            cpu_shares: None,
        });

        assert!(resolver.validate_spec(&spec).is_err());
        assert!(
            resolver
                .resolve(
                    &spec,
                    &HashMap::new(),
                    &NetworkContext {
                        group_id: "g1".to_string(),
                        shared_networking: false,
                    },
                )
                .is_err()
        );
    }

    #[test]
    fn templates_merge_without_clobbering_explicit_resources() {
        let resolver = ConfigResolver::new();
        let mut spec = sse_spec("a");
        spec.overrides.resources = Some(crate::types::ResourceOverrides {
            memory: Some("256m".to_string()),
            cpu_shares: None,
        });

        let templated = resolver.apply_template(&spec, "high-performance").unwrap();
        let resources = templated.overrides.resources.unwrap();
        assert_eq!(resources.memory, Some("256m".to_string()));
        assert_eq!(resources.cpu_shares, Some(2048));

        assert!(resolver.apply_template(&spec, "missing").is_err());
        assert_eq!(
            resolver.templates(),
            vec!["high-performance", "minimal", "standard"]
        );
    }

    #[test]
    fn readonly_rootfs_adds_scratch_mounts() {
        let resolver = ConfigResolver::new();
        let mut spec = sse_spec("a");
        spec.overrides.security = Some(crate::types::SecurityOverrides {
            readonly_rootfs: Some(true),
            seccomp_profile: Some("custom.json".to_string()),
            apparmor_profile: None,
        });

        let container = resolver
            .resolve(
                &spec,
                &HashMap::new(),
                &NetworkContext {
                    group_id: "g1".to_string(),
                    shared_networking: false,
                },
            )
            .unwrap();

        assert!(container.readonly_rootfs);
        assert!(container.tmpfs.contains_key("/tmp"));
        assert!(container.tmpfs.contains_key("/var/run"));
        assert!(
            container
                .security_opts
                .contains(&"seccomp=custom.json".to_string())
        );

        let summary = resolver.summarize(&container);
        assert!(
            summary
                .security_features
                .contains(&"read-only-root-filesystem".to_string())
        );
        assert!(
            summary
                .security_features
                .contains(&"seccomp-profile".to_string())
        );
    }
}
