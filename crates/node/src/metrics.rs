//! Prometheus metrics and the server exposing them.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;

use crate::{error::ErrorKind, service::Service};

/// Custom prometheus metrics
#[derive(Debug, Clone)]
pub struct Metrics {
    listener_events: CounterVec,
    job_errors: CounterVec,
    reporter_errors: CounterVec,
    submitted: CounterVec,
    submission_seconds: HistogramVec,
}

impl Metrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let listener_events = CounterVec::new(
            Opts::new("listener_events_total", "Events turned into worker jobs"),
            &["service"],
        )?;
        let job_errors =
            CounterVec::new(Opts::new("job_errors_total", "Failed job runs"), &["queue", "kind"])?;
        let reporter_errors = CounterVec::new(
            Opts::new("reporter_errors_total", "Failed submission trials"),
            &["service", "kind"],
        )?;
        let submitted = CounterVec::new(
            Opts::new("reporter_submitted_total", "Transactions included on chain"),
            &["service"],
        )?;
        let submission_seconds = HistogramVec::new(
            HistogramOpts::new(
                "reporter_submission_seconds",
                "Time from first trial to receipt",
            ),
            &["service"],
        )?;

        registry.register(Box::new(listener_events.clone()))?;
        registry.register(Box::new(job_errors.clone()))?;
        registry.register(Box::new(reporter_errors.clone()))?;
        registry.register(Box::new(submitted.clone()))?;
        registry.register(Box::new(submission_seconds.clone()))?;

        Ok(Self { listener_events, job_errors, reporter_errors, submitted, submission_seconds })
    }

    /// Increment listener events counter
    pub fn incr_listener_events(&self, service: Service, count: u64) {
        self.listener_events.with_label_values(&[service.slug()]).inc_by(count as f64);
    }

    /// Increment failed job runs counter
    pub fn incr_job_err(&self, queue: &str, kind: ErrorKind) {
        self.job_errors.with_label_values(&[queue, kind.as_ref()]).inc();
    }

    /// Increment failed trials counter
    pub fn incr_reporter_err(&self, service: Service, kind: &str) {
        self.reporter_errors.with_label_values(&[service.slug(), kind]).inc();
    }

    /// Record an included transaction
    pub fn observe_submission(&self, service: Service, seconds: f64) {
        self.submitted.with_label_values(&[service.slug()]).inc();
        self.submission_seconds.with_label_values(&[service.slug()]).observe(seconds);
    }

    /// Number of included transactions for `service`.
    pub fn submitted(&self, service: Service) -> u64 {
        self.submitted.with_label_values(&[service.slug()]).get() as u64
    }
}

/// Metrics Server
#[derive(Debug, Default, Clone)]
pub struct MetricServer {
    registry: Arc<Registry>,
}

impl MetricServer {
    /// Return a new server instance
    pub const fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Serve metrics until `shutdown` is cancelled.
    pub async fn serve(
        &self,
        addr: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<(), std::io::Error> {
        let router = Router::new()
            .route("/metrics", get(Self::handle_metrics))
            .route("/", get(Self::root))
            .with_state(Arc::clone(&self.registry));

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    }

    async fn root() -> &'static str {
        "Visit /metrics"
    }

    async fn handle_metrics(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = registry.gather();
        if let Err(error) = encoder.encode(&metric_families, &mut buffer) {
            return (StatusCode::INTERNAL_SERVER_ERROR, error.to_string());
        }
        (StatusCode::OK, String::from_utf8_lossy(&buffer).into_owned())
    }
}
