//! Health and metrics endpoints served on port 8080.
//!
//! `/healthz` answers as long as the process runs, `/readyz` once the
//! controller is started under a held lease, and `/metrics` exposes the
//! Prometheus registry below.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::{Metric, Registry};
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::crd::ReconciliationPhase;

/// Port of the health and metrics server
pub const HEALTH_PORT: u16 = 8080;

const METRIC_PREFIX: &str = "astarte_operator";

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResourceLabels {
    pub namespace: String,
    pub name: String,
}

impl ResourceLabels {
    fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabels {
    pub namespace: String,
    pub name: String,
    pub phase: String,
}

/// Result of one version transition.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum UpgradeOutcome {
    Succeeded,
    Failed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UpgradeLabels {
    pub transition: String,
    pub outcome: UpgradeOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StepLabels {
    pub step: String,
}

/// Operator metrics, all registered under the `astarte_operator` prefix.
pub struct Metrics {
    pub reconciliations_total: Family<ResourceLabels, Counter>,
    pub reconciliation_errors_total: Family<ResourceLabels, Counter>,
    pub reconcile_duration_seconds: Family<ResourceLabels, Histogram>,
    /// 1 for the current phase of each resource, 0 for the others
    pub resource_phase: Family<PhaseLabels, Gauge>,
    pub upgrades_total: Family<UpgradeLabels, Counter>,
    pub upgrade_step_duration_seconds: Family<StepLabels, Histogram>,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Register `metric` and hand back a handle to it.
fn registered<M: Metric + Clone>(registry: &mut Registry, name: &str, help: &str, metric: M) -> M {
    registry.register(name, help, metric.clone());
    metric
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix(METRIC_PREFIX);

        let reconciliations_total: Family<ResourceLabels, Counter> = registered(
            &mut registry,
            "reconciliations",
            "Reconciliations completed without error",
            Family::default(),
        );
        let reconciliation_errors_total: Family<ResourceLabels, Counter> = registered(
            &mut registry,
            "reconciliation_errors",
            "Reconciliations that returned an error",
            Family::default(),
        );
        let reconcile_duration_seconds = registered(
            &mut registry,
            "reconcile_duration_seconds",
            "Wall time of one reconciliation",
            Family::<ResourceLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            }),
        );
        let resource_phase: Family<PhaseLabels, Gauge> = registered(
            &mut registry,
            "resource_phase",
            "Reconciliation phase of each Astarte resource",
            Family::default(),
        );
        let upgrades_total: Family<UpgradeLabels, Counter> = registered(
            &mut registry,
            "upgrades",
            "Version transitions run, by outcome",
            Family::default(),
        );
        // Steps range from seconds to the one-hour migration wait.
        let upgrade_step_duration_seconds = registered(
            &mut registry,
            "upgrade_step_duration_seconds",
            "Wall time of one upgrade step",
            Family::<StepLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.5, 2.0, 14))
            }),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            resource_phase,
            upgrades_total,
            upgrade_step_duration_seconds,
            registry,
        }
    }

    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = ResourceLabels::new(namespace, name);
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn record_error(&self, namespace: &str, name: &str) {
        self.reconciliation_errors_total
            .get_or_create(&ResourceLabels::new(namespace, name))
            .inc();
    }

    /// Flip the phase gauge of a resource to `phase`.
    pub fn set_resource_phase(&self, namespace: &str, name: &str, phase: ReconciliationPhase) {
        for candidate in ReconciliationPhase::ALL {
            let labels = PhaseLabels {
                namespace: namespace.to_string(),
                name: name.to_string(),
                phase: candidate.to_string(),
            };
            self.resource_phase
                .get_or_create(&labels)
                .set(i64::from(candidate == phase));
        }
    }

    pub fn record_upgrade(&self, transition: &str, outcome: UpgradeOutcome) {
        let labels = UpgradeLabels {
            transition: transition.to_string(),
            outcome,
        };
        self.upgrades_total.get_or_create(&labels).inc();
    }

    pub fn record_upgrade_step(&self, step: &str, duration_secs: f64) {
        let labels = StepLabels {
            step: step.to_string(),
        };
        self.upgrade_step_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Render the registry in the Prometheus text format.
    pub fn encode(&self) -> String {
        let mut body = String::new();
        match encode(&mut body, &self.registry) {
            Ok(()) => body,
            Err(e) => {
                error!(error = %e, "Failed to encode metrics");
                "# Error encoding metrics\n".to_string()
            }
        }
    }
}

/// State shared between the controller and the health server.
pub struct HealthState {
    /// Set once the controller runs under a held lease
    ready: RwLock<bool>,
    pub metrics: Metrics,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Starts not ready.
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    if state.is_ready().await {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.metrics.encode(),
    )
}

pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve health checks and metrics on all interfaces until the listener fails.
pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], HEALTH_PORT));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(port = HEALTH_PORT, "Health server listening");
    axum::serve(listener, create_router(state)).await
}
