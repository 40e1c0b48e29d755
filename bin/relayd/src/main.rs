//! ---
//! relay_section: "01-core-functionality"
//! relay_subsection: "binary"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Binary entrypoint for the relay daemon."
//! relay_version: "v0.0.0-prealpha"
//! relay_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use relay_common::{init_tracing, AppConfig};
use relay_core::{configured_qos, RelayEngine, RelaySettings, SourceEmitter};
use relay_metrics::{
    new_registry, spawn_http_server, EmitterMetrics, MetricsServer, RelayMetrics, SharedRegistry,
};
use relay_transform::{Passthrough, PayloadTransform, TransformClient, TransformerServer};
use relay_transport::{MqttConnector, MqttSettings};
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Message relay daemon",
    long_about = None
)]
struct Cli {
    #[arg(
        long,
        value_name = "FILE",
        env = "RELAY_CONFIG",
        help = "Path to configuration file"
    )]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    #[command(about = "Relay source messages through the transformer to the forward topic")]
    Consumer {
        #[arg(long, help = "Forward message bodies without calling the transformer")]
        passthrough: bool,
    },
    #[command(about = "Publish timestamped messages from several random source identities")]
    Broadcaster,
    #[command(about = "Publish timestamped messages on a single fixed topic")]
    Publisher,
    #[command(about = "Serve the reference /transform and /health endpoints")]
    Transformer,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let loaded = AppConfig::load_with_source(cli.config.as_deref())?;
    let config = loaded.config;
    let command = cli
        .command
        .unwrap_or(Commands::Consumer { passthrough: false });

    init_tracing(service_name(&command), &config.logging)?;
    match &loaded.source {
        Some(path) => info!(config_path = %path.display(), "configuration loaded"),
        None => info!("configuration loaded from defaults and environment"),
    }

    let registry = new_registry();
    let metrics_server = start_metrics_exporter(&config, registry.clone())?;

    let outcome = match command {
        Commands::Consumer { passthrough } => run_consumer(&config, registry, passthrough).await,
        Commands::Broadcaster => run_emitter(&config, registry, Role::Broadcaster).await,
        Commands::Publisher => run_emitter(&config, registry, Role::Publisher).await,
        Commands::Transformer => run_transformer(&config, registry).await,
    };

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    outcome
}

fn service_name(command: &Commands) -> &'static str {
    match command {
        Commands::Consumer { .. } => "relay-consumer",
        Commands::Broadcaster => "relay-broadcaster",
        Commands::Publisher => "relay-publisher",
        Commands::Transformer => "relay-transformer",
    }
}

fn start_metrics_exporter(
    config: &AppConfig,
    registry: SharedRegistry,
) -> Result<Option<MetricsServer>> {
    if !config.metrics.enabled {
        info!("metrics exporter disabled by configuration");
        return Ok(None);
    }
    let server = spawn_http_server(registry, config.metrics.listen)?;
    info!(address = %server.addr(), "metrics exporter enabled");
    Ok(Some(server))
}

fn mqtt_connector(config: &AppConfig) -> MqttConnector {
    let mut settings = MqttSettings::new(config.broker.host.clone(), config.broker.port);
    settings.keep_alive = config.broker.keep_alive;
    settings.reconnect_delay = config.broker.reconnect_delay;
    settings.channel_capacity = config.broker.channel_capacity;
    MqttConnector::new(settings)
}

async fn run_consumer(config: &AppConfig, registry: SharedRegistry, passthrough: bool) -> Result<()> {
    let settings = RelaySettings::from_config(config)?;
    let metrics = RelayMetrics::new(registry)?;
    let transform: Arc<dyn PayloadTransform> = if passthrough {
        warn!("transformer disabled, message bodies are forwarded unchanged");
        Arc::new(Passthrough)
    } else {
        info!(url = %config.transform.url, timeout = ?config.transform.timeout, "using transformer");
        Arc::new(TransformClient::new(config.transform.url.clone()).with_metrics(metrics.clone()))
    };

    let engine = RelayEngine::new(settings, transform).with_metrics(metrics);
    let handle = engine.start(&mqtt_connector(config)).await?;

    info!("relay running; waiting for termination signal");
    shutdown_signal().await;
    info!("termination signal received; shutting down");
    handle.shutdown().await
}

#[derive(Debug, Clone, Copy)]
enum Role {
    Broadcaster,
    Publisher,
}

async fn run_emitter(config: &AppConfig, registry: SharedRegistry, role: Role) -> Result<()> {
    let qos = configured_qos(&config.broker)?;
    let emitter = match role {
        Role::Broadcaster => SourceEmitter::broadcaster(&config.broadcaster, qos)?,
        Role::Publisher => SourceEmitter::publisher(&config.publisher, qos)?,
    };
    let emitter = emitter.with_metrics(EmitterMetrics::new(&registry)?);
    let handle = emitter.start(&mqtt_connector(config)).await?;

    info!(role = ?role, sources = handle.sources().len(), "emitter running; waiting for termination signal");
    shutdown_signal().await;
    info!("termination signal received; shutting down");
    handle.shutdown().await
}

async fn run_transformer(config: &AppConfig, registry: SharedRegistry) -> Result<()> {
    let handle = TransformerServer::new(config.transformer.listen)
        .with_metrics_registry(registry)
        .spawn()
        .await?;

    info!(address = %handle.local_addr(), "transformer running; waiting for termination signal");
    shutdown_signal().await;
    info!("termination signal received; shutting down");
    handle.shutdown().await
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        tokio::select! {
            _ = ctrl_c() => {},
            _ = terminate() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(?err, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(err) => {
            warn!(?err, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}
