mod cli;
mod plugin;

use anyhow::{bail, Context, Result};
use chain_tunnel::config::AppConfig;
use chain_tunnel::registry::ProtocolRegistry;
use chain_tunnel::reload::{ConfigHandle, Reloader, Snapshot};
use chain_tunnel::service::Service;
use clap::Parser;
use cli::{Cli, Commands};
use plugin::{PluginEnv, PluginPlan};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if cli::wants_version(&args) {
        println!("chain-tunnel {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut cli = Cli::parse_from(&args);
    let mut plugin_plan = None;
    if cli.command.is_none() {
        let Some(env) = PluginEnv::from_env() else {
            bail!("Can only be used as a shadowsocks plugin, SS_LOCAL_HOST/SS_LOCAL_PORT not set");
        };
        let plan = env.plan()?;
        cli = Cli::try_parse_from(cli::plugin_args(&args, &plan.args))
            .context("Invalid shadowsocks plugin options")?;
        plugin_plan = Some(plan);
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(cli.log_filter()))
        .context("Invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!("Chain Tunnel v{}", env!("CARGO_PKG_VERSION"));

    if let Some(PluginPlan {
        blob: Some(ref blob),
        ..
    }) = plugin_plan
    {
        let dir = blob.materialize()?;
        std::env::set_current_dir(&dir)
            .with_context(|| format!("Failed to enter {}", dir.display()))?;
        info!("Running as shadowsocks plugin in {}", dir.display());
    } else if plugin_plan.is_some() {
        info!("Running as shadowsocks plugin");
    }

    let registry = Arc::new(ProtocolRegistry::with_builtins());

    match cli.command {
        Some(Commands::Check { config }) => check_config(&config, &registry),
        Some(Commands::Run {
            config,
            listen,
            forward,
            reload_interval,
        }) => run(config, &listen, &forward, reload_interval, registry).await,
        None => bail!("No command given"),
    }
}

fn check_config(path: &str, registry: &ProtocolRegistry) -> Result<()> {
    let config = AppConfig::load(path)?;
    config.validate(registry)?;

    println!("Configuration {} is valid", path);
    println!("  chains:   {}", config.chains.len());
    for chain in &config.chains {
        println!("    - {} ({} hops, retries {})", chain.name, chain.hops.len(), chain.retries);
    }
    println!("  services: {}", config.services.len());
    for service in &config.services {
        let chains = if service.chains.is_empty() {
            "direct".to_string()
        } else {
            service.chains.join(", ")
        };
        println!("    - {} on {} via {}", service.name, service.listen, chains);
    }
    Ok(())
}

async fn run(
    config_path: Option<String>,
    listen: &[String],
    forward: &[String],
    reload_interval: u64,
    registry: Arc<ProtocolRegistry>,
) -> Result<()> {
    let config = match config_path {
        Some(ref path) => {
            if !listen.is_empty() || !forward.is_empty() {
                bail!("-C cannot be combined with -L/-F");
            }
            info!("Loading configuration from: {}", path);
            AppConfig::load(path)?
        }
        None => AppConfig::from_args(listen, forward)?,
    };
    config.validate(&registry)?;
    if config.services.is_empty() {
        bail!("No services configured; use -L or a config file with [[services]]");
    }

    let handle = ConfigHandle::new(Snapshot::build(&config, &registry, 1)?);
    handle.load().spawn_health_checker();

    let shutdown = CancellationToken::new();

    let mut services = Vec::with_capacity(config.services.len());
    for service_config in &config.services {
        let service = Service::bind(service_config, handle.clone()).await?;
        services.push(tokio::spawn(service.run(shutdown.child_token())));
    }

    if let (Some(path), true) = (config_path, reload_interval > 0) {
        let reloader = Reloader::new(
            path,
            handle.clone(),
            registry.clone(),
            Duration::from_secs(reload_interval),
        );
        tokio::spawn(reloader.run(shutdown.child_token()));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    shutdown.cancel();

    for task in services {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Service exited with error: {:#}", e),
            Err(e) => error!("Service task failed: {}", e),
        }
    }

    info!("Stopped");
    Ok(())
}
