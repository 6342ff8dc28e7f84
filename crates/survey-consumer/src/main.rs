//! Survey Consumer CLI
//!
//! Loads configuration, connects to Postgres, and indexes the Jetstream
//! firehose until SIGINT or SIGTERM.

use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use survey_consumer::{run_admin_server, AdminState, Consumer, PgStore, WebSocketConnector};
use survey_core::prelude::*;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "survey-consumer")]
#[command(about = "Indexes OpenMeet surveys from the Jetstream firehose into Postgres")]
#[command(version)]
struct Args {
    /// Configuration file (TOML, YAML, or JSON)
    #[arg(long, env = "SURVEY_INDEXER_CONFIG")]
    config: Option<String>,

    /// Jetstream subscribe endpoint
    #[arg(long, env = "JETSTREAM_ENDPOINT")]
    endpoint: Option<String>,

    /// Postgres connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Admin API listen address
    #[arg(long, env = "ADMIN_LISTEN")]
    admin_listen: Option<String>,

    /// Disable admin API
    #[arg(long, env = "ADMIN_DISABLED")]
    admin_disabled: bool,

    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

impl Args {
    fn apply(self, config: &mut IndexerConfig) {
        if let Some(endpoint) = self.endpoint {
            config.jetstream.endpoint = endpoint;
        }
        if let Some(url) = self.database_url {
            config.database.url = url;
        }
        if let Some(listen) = self.admin_listen {
            config.admin.listen = listen;
        }
        if self.admin_disabled {
            config.admin.enabled = false;
        }
        if let Some(level) = self.log_level {
            config.observability.log_level = level;
        }
    }
}

fn init_tracing(config: &IndexerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));

    if config.observability.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

/// Cancel `token` on the first SIGINT or SIGTERM
fn spawn_signal_handler(token: CancellationToken) -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        }
        token.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = IndexerConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    args.apply(&mut config);

    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        endpoint = %config.jetstream.endpoint,
        collections = ?config.jetstream.wanted_collections,
        "Starting survey-consumer"
    );

    let prometheus = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder unavailable, /metrics will be empty");
            None
        }
    };

    let store = Arc::new(PgStore::connect(&config.database).await?);
    let cursor = store.load_cursor().await?;
    info!(cursor, "Storage ready");

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    let consumer = Consumer::new(&config, store.clone(), Arc::new(WebSocketConnector::new()));

    let admin = if config.admin.enabled {
        let state = AdminState {
            stats: consumer.stats(),
            storage: store.clone(),
            prometheus,
        };
        let listen = config.admin.listen.clone();
        let token = cancel.child_token();
        Some(tokio::spawn(async move {
            if let Err(e) = run_admin_server(&listen, state, token).await {
                error!(error = %e, "Admin API failed");
            }
        }))
    } else {
        None
    };

    let result = consumer.run(cancel.child_token()).await;

    // stop the admin API whether the consumer exited cleanly or not
    cancel.cancel();
    if let Some(handle) = admin {
        if let Err(e) = handle.await {
            warn!(error = %e, "Admin API task did not shut down cleanly");
        }
    }

    if let Err(e) = &result {
        error!(error = %e, kind = e.kind(), "survey-consumer stopped with error");
    }
    result?;
    info!("survey-consumer stopped");
    Ok(())
}
