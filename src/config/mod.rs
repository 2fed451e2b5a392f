use crate::error::ConfigError;
use crate::types::ServerSpec;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// TOML manifest describing one deployable MCP server group.
///
/// ```toml
/// [group]
/// id = "acct-42-tools"
/// shared_networking = true
/// dependency_order = ["postgres-mcp", "github-mcp"]
///
/// [[servers]]
/// name = "github-mcp"
/// image = "mcp/github:latest"
/// account_id = "acct-42"
/// transport = "sse"
/// required_oauth_providers = ["github"]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupFile {
    pub group: GroupSection,
    #[serde(default)]
    pub servers: Vec<ServerSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupSection {
    pub id: String,
    #[serde(default)]
    pub shared_networking: bool,
    #[serde(default)]
    pub dependency_order: Vec<String>,
    pub max_concurrent: Option<usize>,
}

impl GroupFile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::ManifestNotFound {
                path: path.display().to_string(),
            }
            .into());
        }

        let content = std::fs::read_to_string(path)?;
        let manifest: GroupFile = toml::from_str(&content)?;
        manifest.validate()?;

        debug!(
            "Loaded group manifest {} with {} servers",
            manifest.group.id,
            manifest.servers.len()
        );
        Ok(manifest)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.validate()?;
        let content =
            toml::to_string_pretty(self).map_err(|e| anyhow::anyhow!("TOML serialize: {e}"))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Structural validation: per-spec checks live in the resolver, this
    /// only covers manifest-level consistency.
    pub fn validate(&self) -> Result<()> {
        if self.group.id.is_empty() {
            return Err(ConfigError::MissingField {
                field: "group.id".to_string(),
            }
            .into());
        }
        if self.servers.is_empty() {
            return Err(ConfigError::InvalidSpec {
                name: self.group.id.clone(),
                reason: "group manifest defines no servers".to_string(),
            }
            .into());
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.name.as_str()) {
                return Err(ConfigError::InvalidSpec {
                    name: server.name.clone(),
                    reason: "duplicate server name in group manifest".to_string(),
                }
                .into());
            }
        }

        for name in &self.group.dependency_order {
            if !self.servers.iter().any(|s| &s.name == name) {
                return Err(ConfigError::InvalidSpec {
                    name: name.clone(),
                    reason: "dependency_order references an undefined server".to_string(),
                }
                .into());
            }
        }

        Ok(())
    }
}

/// Runtime configuration for the berth daemon and CLI.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BerthConfig {
    /// Base URL of the OAuth credential issuance service.
    pub issuance_url: String,
    /// Bearer token presented to the issuance service.
    pub issuance_token: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(skip)]
    pub config_dir: PathBuf,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BerthConfig {
    fn default() -> Self {
        Self {
            issuance_url: "http://127.0.0.1:4180".to_string(),
            issuance_token: None,
            log_level: default_log_level(),
            config_dir: default_config_dir(),
        }
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("berth")
}

impl BerthConfig {
    /// Load from `$XDG_CONFIG_HOME/berth/config.toml`, falling back to
    /// defaults when no file exists.
    pub fn load() -> Result<Self> {
        let config_dir = default_config_dir();
        let path = config_dir.join("config.toml");

        if !path.exists() {
            debug!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let mut config: BerthConfig = toml::from_str(&content)?;
        config.config_dir = config_dir;

        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        let path = self.config_dir.join("config.toml");
        let content =
            toml::to_string_pretty(self).map_err(|e| anyhow::anyhow!("TOML serialize: {e}"))?;
        std::fs::write(&path, content)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }
}
