//! PVE cluster autoscaler
//!
//! Watches Kubernetes node utilization and, when the cluster runs hot,
//! clones a worker VM from a Proxmox template and joins it to the cluster.

use anyhow::{Context, Result};
use autoscaler_lib::{
    join::{CommandRunner, JoinOrchestrator, KubeNodeLabeler},
    provisioner::{LifecycleController, ProxmoxClient},
    record::{PgRecordStore, RecordKeeper},
    sampler::{KubeMetricsProvider, UtilizationSampler},
    AutoscalerMetrics, ControlLoop, ControlLoopConfig, HealthRegistry, StructuredLogger,
};
use clap::Parser;
use pve_autoscaler::{
    api,
    config::{AutoscalerConfig, DEFAULT_SECRETS_DIR},
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AUTOSCALER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "pve-autoscaler")]
#[command(author, version, about = "Proxmox-backed Kubernetes worker autoscaler", long_about = None)]
struct Args {
    /// Directory holding one file per configuration key
    #[arg(long, env = "AUTOSCALER_SECRETS_DIR", default_value = DEFAULT_SECRETS_DIR)]
    secrets_dir: PathBuf,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let args = Args::parse();
    info!("Starting pve-autoscaler");

    let config = AutoscalerConfig::load(&args.secrets_dir)?;
    info!(
        node_name = %config.node_name,
        template = %config.template_name,
        cpu_limit = config.cpu_limit,
        memory_limit = config.memory_limit,
        "Autoscaler configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;
    let metrics = AutoscalerMetrics::new();

    let kube_client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let hypervisor = ProxmoxClient::connect(config.proxmox())
        .await
        .context("Failed to connect to the Proxmox API")?;

    let records = RecordKeeper::new(Arc::new(PgRecordStore::new(&config.postgres())));
    records.prepare().await?;

    let lifecycle = Arc::new(
        LifecycleController::new(Arc::new(hypervisor))
            .with_interface_filter(config.interface_filter.clone()),
    );
    let join = JoinOrchestrator::new(
        config.join_configuration()?,
        Arc::new(CommandRunner::new(config.ssh_key.clone())),
        Arc::new(KubeNodeLabeler::new(kube_client.clone())),
        lifecycle.clone(),
    );

    let logger = StructuredLogger::new(&config.node_name);
    logger.log_startup(AUTOSCALER_VERSION, &config.template_name, join.configuration().mode());

    let mut loop_config = ControlLoopConfig::new(config.provisioning_spec()?);
    loop_config.interval = config.loop_interval();

    let mut control = ControlLoop::new(
        UtilizationSampler::new(Arc::new(KubeMetricsProvider::new(kube_client))),
        config.scale_gate(),
        lifecycle,
        records,
        join,
        loop_config,
    )
    .with_health(health_registry.clone())
    .with_logger(logger.clone());

    if args.once {
        let outcome = control.run_cycle().await?;
        info!(outcome = ?outcome, "Single cycle complete");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let app_state = Arc::new(api::AppState::new(health_registry, metrics));
    let mut api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));
    let loop_handle = tokio::spawn(control.run(shutdown_rx));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            logger.log_shutdown("SIGINT received");
        }
        result = &mut api_handle => {
            match result {
                Ok(Err(e)) => error!(error = %e, "API server failed"),
                Err(e) => error!(error = %e, "API server task panicked"),
                Ok(Ok(())) => {}
            }
            logger.log_shutdown("API server stopped");
        }
    }

    // An in-flight provisioning attempt finishes before the loop exits
    let _ = shutdown_tx.send(());
    loop_handle.await?;
    if !api_handle.is_finished() {
        api_handle.await??;
    }
    info!("Shutting down");

    Ok(())
}
