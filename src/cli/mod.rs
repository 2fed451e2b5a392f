use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "berth")]
#[command(about = "Host-local orchestrator for containerized MCP server groups")]
#[command(version, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Deploy a server group from a manifest and supervise it until Ctrl-C
    Deploy {
        /// Path to the group manifest
        #[arg(default_value = "berth.toml")]
        manifest: String,

        /// Exit after deployment instead of supervising
        #[arg(short, long)]
        detach: bool,
    },

    /// Stop and remove a deployed server group
    Remove {
        /// Group identifier
        group_id: String,

        /// Force-remove containers
        #[arg(short, long)]
        force: bool,

        /// Graceful stop timeout in seconds
        #[arg(short, long, default_value = "30")]
        timeout: u64,
    },

    /// Show status of all managed groups
    Status,

    /// Validate a group manifest without deploying it
    Validate {
        /// Path to the group manifest
        #[arg(default_value = "berth.toml")]
        manifest: String,
    },

    /// Fetch logs from a managed server
    Logs {
        /// Server name
        name: String,

        /// Number of trailing lines
        #[arg(short, long)]
        tail: Option<u32>,
    },

    /// List available resource templates
    Templates,
}
