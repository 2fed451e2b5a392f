mod cli;

use anyhow::Result;
use berth::config::{BerthConfig, GroupFile};
use berth::credentials::{CredentialInjector, HttpIssuanceClient};
use berth::events::EventBus;
use berth::orchestrator::{DeployOptions, Orchestrator};
use berth::runtime::{ContainerRuntime, DockerCli};
use clap::Parser;
use cli::{Cli, Commands};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = BerthConfig::load()?;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.parse()?),
        )
        .init();

    let events = EventBus::new();
    let issuance = Arc::new(HttpIssuanceClient::new(
        config.issuance_url.clone(),
        config.issuance_token.clone(),
    ));
    let injector = CredentialInjector::new(issuance, events.clone());
    let runtime = Arc::new(DockerCli::new());
    let orchestrator = Orchestrator::new(
        Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
        injector,
        events.clone(),
    );

    match cli.command {
        Commands::Deploy { manifest, detach } => {
            let group = GroupFile::load(&manifest)?;
            info!("🚀 Deploying group: {}", group.group.id);

            orchestrator.start().await;
            let report = orchestrator
                .deploy_group(
                    &group.group.id,
                    group.servers,
                    DeployOptions {
                        shared_networking: group.group.shared_networking,
                        dependency_order: group.group.dependency_order.clone(),
                        max_concurrent: group.group.max_concurrent,
                    },
                )
                .await;

            for name in &report.deployed {
                info!("  ✅ {}", name);
            }
            for (name, err) in &report.errors {
                error!("  ❌ {}: {}", name, err);
            }
            if !report.success {
                orchestrator.shutdown().await;
                anyhow::bail!("deployment failed for group {}", group.group.id);
            }

            if detach {
                info!("Deployed {} servers, exiting", report.deployed.len());
                return Ok(());
            }

            info!("Supervising group {} (Ctrl-C to stop)", group.group.id);
            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            orchestrator.shutdown().await;
        }

        // Remove, status, and logs act on the daemon via the group labels
        // the resolver stamps on every managed container, so they work from
        // a process other than the one that deployed the group.
        Commands::Remove {
            group_id,
            force,
            timeout,
        } => {
            let containers = runtime.list_group(&group_id).await?;
            if containers.is_empty() {
                anyhow::bail!("no containers found for group {}", group_id);
            }

            for container in containers.iter().rev() {
                info!("🗑️  Removing {}", container.name);
                if let Err(e) = runtime
                    .stop_container(&container.id, Duration::from_secs(timeout))
                    .await
                {
                    if !force {
                        return Err(e.into());
                    }
                    error!("  Failed to stop {}: {}", container.name, e);
                }
                runtime.remove_container(&container.name, force).await?;
            }
        }

        Commands::Status => {
            let containers = runtime.list_managed().await?;
            if containers.is_empty() {
                info!("No managed containers");
                return Ok(());
            }
            println!("{:<25} {:<25} {:<35} {:<20}", "GROUP", "NAME", "IMAGE", "STATUS");
            for (group, container) in &containers {
                println!(
                    "{:<25} {:<25} {:<35} {:<20}",
                    group, container.name, container.image, container.status
                );
            }
        }

        Commands::Validate { manifest } => {
            let group = GroupFile::load(&manifest)?;
            let errors = orchestrator.validate_specs(&group.servers);
            if errors.is_empty() {
                info!("✅ Manifest {} is valid ({} servers)", manifest, group.servers.len());
            } else {
                for (name, err) in &errors {
                    error!("  ❌ {}: {}", name, err);
                }
                anyhow::bail!("{} invalid server specs", errors.len());
            }
        }

        Commands::Logs { name, tail } => {
            let logs = runtime.logs(&name, tail).await?;
            print!("{}", logs);
        }

        Commands::Templates => {
            for template in orchestrator.list_config_templates() {
                println!("{}", template);
            }
        }
    }

    Ok(())
}
