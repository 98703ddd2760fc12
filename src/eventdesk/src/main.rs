//! EventDesk automations: contact journey engine for event organizers.
//!
//! Main entry point: loads configuration, wires the journey engine to its
//! collaborators, and runs the scheduler next to the HTTP API until ctrl-c.

mod webhook;

use clap::Parser;
use eventdesk_api::ApiServer;
use eventdesk_core::config::AppConfig;
use eventdesk_core::error::CoreError;
use eventdesk_core::event_bus::EventSink;
use eventdesk_core::types::EngineEvent;
use eventdesk_journey::collaborators::{InMemoryContacts, OutboxEmailSender};
use eventdesk_journey::{Collaborators, JourneyEngine, Stores};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::webhook::HttpWebhookCaller;

#[derive(Parser, Debug)]
#[command(name = "eventdesk")]
#[command(about = "Contact journey automation engine for event management")]
#[command(version)]
struct Cli {
    /// Path to a config file (TOML, YAML or JSON)
    #[arg(long, env = "EVENTDESK_CONFIG")]
    config: Option<String>,

    /// Node identifier, also used as the scheduler's worker id (overrides config)
    #[arg(long, env = "EVENTDESK__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "EVENTDESK__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Serve the API without running the tick loop
    #[arg(long, default_value_t = false)]
    api_only: bool,
}

/// Writes engine lifecycle events to the log.
struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: EngineEvent) {
        info!(
            event_type = ?event.event_type,
            automation_id = %event.automation_id,
            enrollment_id = ?event.enrollment_id,
            contact_id = ?event.contact_id,
            step_id = ?event.step_id,
            detail = ?event.detail,
            "Engine event"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "eventdesk=info,eventdesk_journey=info,eventdesk_api=info,tower_http=info".into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("EventDesk automations starting up");

    // Load configuration
    let mut config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) if cli.config.is_some() || matches!(e, CoreError::Invalid(_)) => {
            return Err(e.into())
        }
        Err(e) => {
            warn!(error = %e, "Failed to load config, using defaults");
            AppConfig::default()
        }
    };

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        tick_interval_secs = config.automation.tick_interval_secs,
        worker_pool_size = config.automation.worker_pool_size,
        "Configuration loaded"
    );

    let collaborators = Collaborators {
        email: Arc::new(OutboxEmailSender::new()),
        webhook: Arc::new(HttpWebhookCaller::new(&config.webhook)?),
        contacts: Arc::new(InMemoryContacts::new()),
    };
    let engine = Arc::new(
        JourneyEngine::new(
            Stores::in_memory(),
            collaborators,
            &config.automation,
            config.node_id.clone(),
        )
        .with_event_sink(Arc::new(LogSink)),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let api_server = ApiServer::new(config.clone(), engine.clone());

    if config.metrics.enabled {
        if let Err(e) = api_server.start_metrics() {
            error!(error = %e, "Failed to start metrics exporter");
        }
    }

    let scheduler_task = if config.automation.scheduler_enabled && !cli.api_only {
        let scheduler = engine.scheduler().clone();
        let shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move { scheduler.run(shutdown).await }))
    } else {
        info!("Running in API-only mode (scheduler disabled)");
        None
    };

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        let _ = shutdown_tx.send(true);
    });

    info!("EventDesk automations is ready to serve traffic");

    // Blocks until shutdown
    api_server.start_http(shutdown_rx).await?;

    if let Some(task) = scheduler_task {
        task.await?;
    }
    info!("EventDesk automations stopped");

    Ok(())
}
