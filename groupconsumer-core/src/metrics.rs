use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::body::Body;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use axum::{Router, routing::get};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::partition::PartitionId;

// The top-level metric registry is created with the GLOBAL_PREFIX
const GLOBAL_PREFIX: &str = "groupconsumer";

const TOPIC_LABEL: &str = "topic";
const PARTITION_LABEL: &str = "partition";
const MODE_LABEL: &str = "mode";
const PHASE_LABEL: &str = "phase";

// counters, the _total suffix is added by the prometheus client
const PARTITION_CLAIMS_TOTAL: &str = "partition_claims";
const PARTITION_RELEASES_TOTAL: &str = "partition_releases";
const READER_ATTACH_TOTAL: &str = "reader_attach";
const RETRIES_TOTAL: &str = "retries";
const RECORDS_RELAYED_TOTAL: &str = "records_relayed";
const ERRORS_RELAYED_TOTAL: &str = "errors_relayed";

// gauges
const PARTITION_OWNED: &str = "partition_owned";

type Labels = Vec<(String, String)>;

/// The global register of all metrics.
struct GlobalRegistry {
    // std mutex semantics are enough, metrics are registered once and encoded rarely
    registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::with_prefix(GLOBAL_PREFIX)),
        }
    }
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::new)
}

/// Metrics of the partition managers, all labeled by topic and partition.
pub(crate) struct ManagerMetrics {
    pub(crate) claims_total: Family<Labels, Counter>,
    pub(crate) releases_total: Family<Labels, Counter>,
    /// 1 while this instance holds the claim of the partition.
    pub(crate) owned: Family<Labels, Gauge>,
    /// Labeled additionally by the start `mode`.
    pub(crate) reader_attach_total: Family<Labels, Counter>,
    /// Labeled additionally by the `phase` that failed.
    pub(crate) retries_total: Family<Labels, Counter>,
    pub(crate) records_relayed_total: Family<Labels, Counter>,
    pub(crate) errors_relayed_total: Family<Labels, Counter>,
}

impl ManagerMetrics {
    fn new() -> Self {
        let metrics = Self {
            claims_total: Family::<Labels, Counter>::default(),
            releases_total: Family::<Labels, Counter>::default(),
            owned: Family::<Labels, Gauge>::default(),
            reader_attach_total: Family::<Labels, Counter>::default(),
            retries_total: Family::<Labels, Counter>::default(),
            records_relayed_total: Family::<Labels, Counter>::default(),
            errors_relayed_total: Family::<Labels, Counter>::default(),
        };

        let mut registry = global_registry().registry.lock();
        registry.register(
            PARTITION_CLAIMS_TOTAL,
            "Total number of partition claims registered by this instance",
            metrics.claims_total.clone(),
        );
        registry.register(
            PARTITION_RELEASES_TOTAL,
            "Total number of partition claims released by this instance",
            metrics.releases_total.clone(),
        );
        registry.register(
            PARTITION_OWNED,
            "Whether this instance currently owns the partition",
            metrics.owned.clone(),
        );
        registry.register(
            READER_ATTACH_TOTAL,
            "Total number of readers attached, by start mode",
            metrics.reader_attach_total.clone(),
        );
        registry.register(
            RETRIES_TOTAL,
            "Total number of retried collaborator calls, by phase",
            metrics.retries_total.clone(),
        );
        registry.register(
            RECORDS_RELAYED_TOTAL,
            "Total number of records relayed to the output",
            metrics.records_relayed_total.clone(),
        );
        registry.register(
            ERRORS_RELAYED_TOTAL,
            "Total number of reader errors relayed to the output",
            metrics.errors_relayed_total.clone(),
        );
        metrics
    }
}

static MANAGER_METRICS: OnceLock<ManagerMetrics> = OnceLock::new();

pub(crate) fn manager_metrics() -> &'static ManagerMetrics {
    MANAGER_METRICS.get_or_init(ManagerMetrics::new)
}

pub(crate) fn partition_labels(partition: &PartitionId) -> Labels {
    vec![
        (TOPIC_LABEL.to_string(), partition.topic.clone()),
        (PARTITION_LABEL.to_string(), partition.partition.to_string()),
    ]
}

pub(crate) fn mode_labels(labels: &Labels, mode: &str) -> Labels {
    let mut labels = labels.clone();
    labels.push((MODE_LABEL.to_string(), mode.to_string()));
    labels
}

pub(crate) fn phase_labels(labels: &Labels, phase: &str) -> Labels {
    let mut labels = labels.clone();
    labels.push((PHASE_LABEL.to_string(), phase.to_string()));
    labels
}

/// Renders every registered metric in the OpenMetrics text format.
pub fn encode_metrics() -> Result<String> {
    // make sure the families exist even before the first manager starts
    manager_metrics();

    let registry = global_registry().registry.lock();
    let mut buffer = String::new();
    encode(&mut buffer, &registry)
        .map_err(|e| Error::Metrics(format!("Encoding metrics: {e}")))?;
    Ok(buffer)
}

async fn metrics_handler() -> impl IntoResponse {
    match encode_metrics() {
        Ok(buffer) => {
            debug!("Exposing metrics: {:?}", buffer);
            Response::builder()
                .status(StatusCode::OK)
                .header(
                    axum::http::header::CONTENT_TYPE,
                    "application/openmetrics-text; version=1.0.0; charset=utf-8",
                )
                .body(Body::from(buffer))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(e) => {
            error!(?e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

/// router for metrics and health endpoints
fn metrics_router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
}

/// Serves `/metrics` and `/livez` on `addr` until `cln_token` is cancelled.
pub async fn start_metrics_server(addr: SocketAddr, cln_token: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Metrics(format!("Binding metrics server to {addr}: {e}")))?;
    info!(%addr, "Started metrics server");

    axum::serve(listener, metrics_router())
        .with_graceful_shutdown(cln_token.cancelled_owned())
        .await
        .map_err(|e| Error::Metrics(format!("Starting web server for metrics: {e}")))
}
