#![forbid(unsafe_code)]

//! `interaction-relay`: scheduled interaction delivery server.
//!
//! Bootstraps configuration, ensures the broker delay topology, then runs
//! the broker consumer, the reconciling poller, the scheduling HTTP API and
//! the IPC server for `interaction-relay-ctl` until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use interaction_relay::api::{self, AppState};
use interaction_relay::broker::amqp::AmqpBroker;
use interaction_relay::broker::{Broker, Topology};
use interaction_relay::config::GlobalConfig;
use interaction_relay::delivery::webhook::WebhookTarget;
use interaction_relay::ipc::server::spawn_ipc_server;
use interaction_relay::orchestrator::broker_consumer::spawn_broker_consumer;
use interaction_relay::orchestrator::dispatcher::Dispatcher;
use interaction_relay::orchestrator::reconciler::{spawn_reconciler, Reconciler};
use interaction_relay::persistence::db;
use interaction_relay::persistence::interaction_repo::InteractionRepo;
use interaction_relay::publisher::Publisher;
use interaction_relay::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "interaction-relay", about = "Scheduled interaction delivery server", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("interaction-relay bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    config.load_credentials().await?;
    let config = Arc::new(config);
    info!("configuration loaded");

    // ── Initialize database ─────────────────────────────
    let db = Arc::new(db::connect(&config.database_path).await?);
    info!(path = %config.database_path.display(), "database connected");

    // ── Connect broker and ensure topology once ─────────
    let uri = config
        .broker
        .uri
        .clone()
        .ok_or_else(|| AppError::Config("broker uri missing after credential load".into()))?;
    let amqp = Arc::new(AmqpBroker::connect(&uri).await?);
    let broker: Arc<dyn Broker> = Arc::<AmqpBroker>::clone(&amqp);
    let topology = Topology::from_config(&config.broker);
    broker.ensure_topology(&topology).await?;

    // ── Build pipeline ──────────────────────────────────
    let target = Arc::new(WebhookTarget::new(
        config.delivery_timeout(),
        config.delivery.webhook_token.clone(),
    )?);
    let dispatcher = Dispatcher::new(Arc::clone(&db), target, &config.delivery);
    let interactions = InteractionRepo::new(Arc::clone(&db));
    let reconciler = Arc::new(Reconciler::new(
        dispatcher.clone(),
        interactions.clone(),
        &config.poller,
    ));

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        interactions,
        publisher: Publisher::new(Arc::clone(&broker), topology.clone()),
        reconciler: Arc::clone(&reconciler),
    });

    // ── Start background tasks ──────────────────────────
    let ct = CancellationToken::new();

    let consumer_handle = spawn_broker_consumer(
        Arc::clone(&broker),
        topology.destination_queue.clone(),
        config.broker.prefetch,
        dispatcher,
        ct.clone(),
    );

    let poller_handle = if config.poller.enabled {
        Some(spawn_reconciler(
            Arc::clone(&reconciler),
            config.poll_interval(),
            ct.clone(),
        ))
    } else {
        info!("reconciling poller disabled; relying on external reconcile triggers");
        None
    };

    let ipc_handle = spawn_ipc_server(Arc::clone(&state), ct.clone())?;

    let http_ct = ct.clone();
    let http_state = Arc::clone(&state);
    let http_handle = tokio::spawn(async move {
        if let Err(err) = api::serve_http(http_state, http_ct).await {
            error!(%err, "scheduling api failed");
        }
    });

    info!("interaction-relay ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    // In-flight deliveries finish before their tasks return.
    let _ = tokio::join!(consumer_handle, ipc_handle, http_handle);
    if let Some(handle) = poller_handle {
        let _ = handle.await;
    }
    amqp.close().await;
    info!("interaction-relay shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
