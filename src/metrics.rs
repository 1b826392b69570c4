use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State as AxumState, http::StatusCode, routing::get, Router};
use chrono::{DateTime, Utc};
use log::info;
use prometheus::{
    histogram_opts, opts, Encoder, Histogram, HistogramTimer, IntCounter, IntCounterVec, IntGauge,
    Registry, TextEncoder,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::controllers::deployment::DeploymentWatcher;
use crate::error::Error;

/// Prometheus instruments describing the reconcile loop and leadership.
#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: Histogram,
    pub inflight: IntGauge,
    pub leader: IntGauge,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let reconciliations = IntCounter::with_opts(opts!(
            "jnp_reconciliations_total",
            "Reconcile invocations started"
        ))?;
        let failures = IntCounterVec::new(
            opts!("jnp_reconciliation_errors_total", "Reconcile invocations that failed"),
            &["error"],
        )?;
        let reconcile_duration = Histogram::with_opts(histogram_opts!(
            "jnp_reconcile_duration_seconds",
            "Duration of a reconcile pass",
            vec![0.01, 0.1, 0.25, 0.5, 1.0, 5.0, 15.0, 60.0]
        ))?;
        let inflight = IntGauge::with_opts(opts!(
            "jnp_reconcile_queue_depth",
            "Reconcile requests currently being processed"
        ))?;
        let leader = IntGauge::with_opts(opts!(
            "jnp_leader",
            "1 while this instance holds the leader lease"
        ))?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(failures.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(inflight.clone()))?;
        registry.register(Box::new(leader.clone()))?;

        Ok(Metrics { reconciliations, failures, reconcile_duration, inflight, leader })
    }

    /// Count an invocation and time it until the guard drops.
    pub fn count_and_measure(&self) -> ReconcileMeasure {
        self.reconciliations.inc();
        self.inflight.inc();
        ReconcileMeasure {
            timer: Some(self.reconcile_duration.start_timer()),
            inflight: self.inflight.clone(),
        }
    }

    pub fn reconcile_failure(&self, err: &Error) {
        self.failures.with_label_values(&[err.metric_label()]).inc();
    }
}

pub struct ReconcileMeasure {
    timer: Option<HistogramTimer>,
    inflight: IntGauge,
}

impl Drop for ReconcileMeasure {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.observe_duration();
        }
        self.inflight.dec();
    }
}

/// Diagnostics populated by the reconciler, readable from the HTTP layer.
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self { last_event: Utc::now() }
    }
}

/// State shared between the controllers and the HTTP endpoint.
#[derive(Clone, Default)]
pub struct State {
    diagnostics: Arc<RwLock<Diagnostics>>,
    registry: Registry,
}

impl State {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn metrics_text(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub fn create_context(&self, client: kube::Client, metrics: Metrics) -> Arc<Context> {
        Arc::new(Context { client, metrics, diagnostics: self.diagnostics.clone() })
    }
}

#[derive(Clone)]
struct HttpState {
    state: State,
    watcher: DeploymentWatcher,
}

/// Serve diagnostics, `/metrics`, `/healthz` and `/readyz` until the token
/// fires.
pub async fn serve(
    state: State,
    watcher: DeploymentWatcher,
    port: u16,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/", get(index_handler))
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(health_handler))
        .route("/readyz", get(ready_handler))
        .with_state(HttpState { state, watcher });

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("starting metrics server on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

async fn index_handler(AxumState(http): AxumState<HttpState>) -> axum::Json<Diagnostics> {
    axum::Json(http.state.diagnostics().await)
}

async fn metrics_handler(AxumState(http): AxumState<HttpState>) -> Result<String, StatusCode> {
    http.state.metrics_text().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn health_handler() -> &'static str {
    "ok"
}

/// Ready once the informer cache has seen a full listing.
async fn ready_handler(AxumState(http): AxumState<HttpState>) -> StatusCode {
    if http.watcher.is_synced() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
