use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{error, info, warn};

use replistate_node::config::NodeConfig;
use replistate_node::stats::describe_metrics;
use replistate_node::{MemoryNetwork, NatsTransport, StateNode};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path =
        std::env::var("REPLISTATE_CONFIG").unwrap_or_else(|_| "config/default".to_string());

    let (config, load_error) = match NodeConfig::from_file(&config_path) {
        Ok(config) => (config, None),
        Err(e) => (NodeConfig::default(), Some(e)),
    };

    init_tracing(&config);

    info!("Starting Replistate Node v{}", env!("CARGO_PKG_VERSION"));
    match load_error {
        None => info!(path = %config_path, "Configuration loaded"),
        Some(e) => warn!("Failed to load config file {}: {}, using defaults", config_path, e),
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    let role = config.identity.role;
    let node_id = config
        .identity
        .resolve_node_id()
        .map_err(|e| anyhow::anyhow!(e))?;

    if config.metrics.enabled {
        start_metrics_server(&config)?;
    }
    describe_metrics();

    let channels = if config.nats.enabled {
        NatsTransport::connect(&config.nats, role, node_id).await?
    } else {
        warn!("NATS disabled, running standalone on an in-process network");
        MemoryNetwork::new().join(role, node_id)
    };

    let mut node = StateNode::new(role, node_id, config.sync.clone(), channels);
    node.start()
        .await
        .context("Failed to start state node")?;

    info!(role = %role, node_id = %node_id, "Replistate node ready");

    let registry = node.registry();
    let reporter = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let stats = registry.stats();
            info!(
                states = stats.states,
                authority_sets = stats.authority_sets,
                mirrored = stats.mirrored_updates,
                rpc_failures = stats.rpc_failures,
                rejected = stats.actions_rejected,
                "Replication stats"
            );
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }

    info!("Shutdown signal received");
    reporter.abort();
    node.shutdown();
    Ok(())
}

fn init_tracing(config: &NodeConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn start_metrics_server(config: &NodeConfig) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    let addr = config
        .metrics
        .listen_addr()
        .context("Invalid metrics listen address")?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!(metrics_addr = %addr, "Prometheus metrics server started");
    Ok(())
}
