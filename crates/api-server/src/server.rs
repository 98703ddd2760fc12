//! API server. HTTP REST endpoints and the Prometheus exporter.

use crate::journey_rest;
use crate::rest::{self, AppState};
use axum::routing::{get, post, put};
use axum::Router;
use eventdesk_core::config::AppConfig;
use eventdesk_journey::JourneyEngine;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct ApiServer {
    config: AppConfig,
    engine: Arc<JourneyEngine>,
}

impl ApiServer {
    pub fn new(config: AppConfig, engine: Arc<JourneyEngine>) -> Self {
        Self { config, engine }
    }

    /// Builds the full router over `state`.
    pub fn router(state: AppState) -> Router {
        Router::new()
            // Automations
            .route(
                "/v1/automations",
                post(journey_rest::create_automation).get(journey_rest::list_automations),
            )
            .route("/v1/automations/:id", get(journey_rest::get_automation))
            .route(
                "/v1/automations/:id/definition",
                put(journey_rest::update_definition),
            )
            .route("/v1/automations/:id/activate", post(journey_rest::activate))
            .route("/v1/automations/:id/pause", post(journey_rest::pause))
            .route("/v1/automations/:id/resume", post(journey_rest::resume))
            .route(
                "/v1/automations/:id/exit-active",
                post(journey_rest::exit_active),
            )
            .route("/v1/automations/:id/reconcile", post(journey_rest::reconcile))
            .route("/v1/automations/:id/stats", get(journey_rest::stats))
            // Enrollments and execution history
            .route("/v1/enrollments", get(journey_rest::list_enrollments))
            .route(
                "/v1/enrollments/:id/history",
                get(journey_rest::enrollment_history),
            )
            // Domain event feed
            .route("/v1/events", post(journey_rest::ingest_event))
            // Operational endpoints
            .route("/health", get(rest::health_check))
            .route("/ready", get(rest::readiness))
            .route("/live", get(rest::liveness))
            // Middleware
            .layer(CompressionLayer::new())
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the HTTP REST server; returns once `shutdown` fires.
    pub async fn start_http(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let app = Self::router(AppState::new(
            self.engine.clone(),
            self.config.node_id.clone(),
        ));

        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server draining connections");
            })
            .await?;

        Ok(())
    }

    /// Start the metrics server on a separate port.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
