//! Instancer control CLI
//!
//! Route management commands for operators (`generate`, `remove`, `sync`,
//! `init`), the standalone lifecycle watcher (`watch`), and the full
//! service with control API, watcher and TTL sweep (`serve`).

use anyhow::{bail, Result};
use cerberus_instancer::instance::{derive_hostname, slugify};
use cerberus_instancer::proxy::{NginxControl, ProxySynchronizer};
use cerberus_instancer::registry::Registry;
use cerberus_instancer::runtime::{ContainerRuntime, DockerRuntime};
use cerberus_instancer::server::{run_server, AppState};
use cerberus_instancer::template::RouteParams;
use cerberus_instancer::terminal::{SharedSecretAuth, TerminalBridge};
use cerberus_instancer::watcher::LifecycleWatcher;
use cerberus_instancer::{InstanceManager, InstancerConfig};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "instancer")]
#[command(about = "Challenge instance orchestrator: containers, proxy routes, browser terminals")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish a proxy route for an already-running container
    Generate {
        container_id: String,
        container_ip: String,
        container_port: u16,
        challenge_name: String,
    },
    /// Retract a published route
    Remove { hostname: String },
    /// Follow runtime events and keep routes in sync (blocks)
    Watch,
    /// Run one reconciliation pass and exit
    Sync,
    /// Write the canonical route template to its configured path
    Init,
    /// Run the control API, lifecycle watcher and TTL sweep
    Serve {
        #[arg(long, default_value = "0.0.0.0", env = "INSTANCER_HOST")]
        host: String,

        #[arg(short, long, default_value = "8471", env = "INSTANCER_PORT")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cerberus_instancer=debug".parse().unwrap())
                .add_directive("info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let config = InstancerConfig::from_env();

    match args.command {
        Command::Generate {
            container_id,
            container_ip,
            container_port,
            challenge_name,
        } => {
            let proxy = synchronizer(&config)?;
            let hostname = derive_hostname(
                &slugify(&challenge_name),
                None,
                &config.challenge_domain,
            );
            let params = RouteParams {
                hostname: hostname.clone(),
                container_ip,
                container_port,
                challenge_name,
                container_id,
                timestamp: Utc::now(),
            };
            proxy.publish(&params).await?;
            proxy.reload_now().await?;
            println!("{}", hostname);
        }

        Command::Remove { hostname } => {
            let proxy = synchronizer(&config)?;
            proxy.retract(&hostname).await?;
            proxy.reload_now().await?;
            info!("Route {} removed", hostname);
        }

        Command::Init => {
            ProxySynchronizer::write_canonical_template(&config.template_path)?;
        }

        Command::Sync => {
            let (watcher, _, _) = components(&config).await?;
            let unresolved = watcher.reconcile().await?;
            if unresolved > 0 {
                bail!("{} containers could not be reconciled", unresolved);
            }
            info!("Registry, routes and containers are in sync");
        }

        Command::Watch => {
            let (watcher, _, _) = components(&config).await?;
            let shutdown = shutdown_signal();
            watcher.run(shutdown).await;
        }

        Command::Serve { host, port } => {
            let (watcher, registry, runtime) = components(&config).await?;
            let manager = Arc::new(InstanceManager::new(
                registry.clone(),
                runtime.clone(),
                config.clone(),
            ));
            let bridge = Arc::new(TerminalBridge::new(
                registry.clone(),
                runtime,
                Arc::new(SharedSecretAuth::new(config.session_token.clone())),
                config.clone(),
            ));
            let state = Arc::new(AppState {
                registry,
                manager: manager.clone(),
                bridge,
            });

            let shutdown = shutdown_signal();
            manager.spawn_expiry_sweep(shutdown.clone());
            let mut server_shutdown = shutdown.clone();
            tokio::spawn(async move { watcher.run(shutdown).await });

            tokio::select! {
                result = run_server(state, &host, port) => result?,
                _ = server_shutdown.changed() => info!("Instancer shutting down"),
            }
        }
    }

    Ok(())
}

fn synchronizer(config: &InstancerConfig) -> Result<Arc<ProxySynchronizer>> {
    Ok(ProxySynchronizer::spawn(
        &config.sites_available,
        &config.sites_enabled,
        &config.template_path,
        Arc::new(NginxControl::default()),
        config.reload_debounce(),
    )?)
}

async fn components(
    config: &InstancerConfig,
) -> Result<(Arc<LifecycleWatcher>, Arc<Registry>, Arc<dyn ContainerRuntime>)> {
    let registry = Arc::new(Registry::open(&config.registry_path)?);
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect().await?);
    let proxy = synchronizer(config)?;
    let watcher = Arc::new(LifecycleWatcher::new(
        registry.clone(),
        runtime.clone(),
        proxy,
        config.clone(),
    ));
    Ok((watcher, registry, runtime))
}

fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, shutting down");
            let _ = tx.send(true);
        }
    });
    rx
}
