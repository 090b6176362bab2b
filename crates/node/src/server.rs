//! Control plane: HTTP routes over the listener, reporter and aggregator
//! states, so the active sets can change without a restart.

use alloy::primitives::Address;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    api::{Aggregator, ListenerConfig, ReporterConfig},
    jobs::DeviationRequest,
    listener::ListenerState,
    reporter::ReporterState,
    service::Service,
    worker::DataFeedWorker,
};

/// Error response of the control plane: 500 with the message as body.
#[derive(Debug)]
pub struct ErrorResponse {
    /// Error message
    pub message: String,
}

impl<E: std::error::Error> From<E> for ErrorResponse {
    fn from(error: E) -> Self {
        Self { message: error.to_string() }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        warn!(message = self.message, "control request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, self.message).into_response()
    }
}

type Reply<T> = Result<Json<T>, ErrorResponse>;

/// Routes of the listener half: `/<service>/...` per listener state, plus
/// `/<service>/aggregator/...` when the data feed worker is given. Deviating
/// aggregates are posted to `/<service>/aggregator/deviation`.
pub fn listener_router(
    listeners: &[Arc<ListenerState>],
    data_feed: Option<Arc<DataFeedWorker>>,
) -> Router {
    let mut router = Router::new().route("/health", get(health));
    for state in listeners {
        let mut routes = Router::new()
            .route("/all", get(listener_all))
            .route("/active", get(listener_active))
            .route("/refresh", get(listener_refresh))
            .route("/activate/{id}", get(listener_activate))
            .route("/deactivate/{id}", get(listener_deactivate))
            .with_state(Arc::clone(state));

        if state.service() == Service::DataFeed {
            if let Some(worker) = &data_feed {
                routes = routes.nest("/aggregator", aggregator_routes(Arc::clone(worker)));
            }
        }
        router = router.nest(&format!("/{}", state.service().slug()), routes);
    }
    router
}

/// Routes of the reporter half: `/<service>/...` per reporter state.
pub fn reporter_router(reporters: &[Arc<ReporterState>]) -> Router {
    let mut router = Router::new().route("/health", get(health));
    for state in reporters {
        let routes = Router::new()
            .route("/all", get(reporter_all))
            .route("/active", get(reporter_active))
            .route("/refresh", get(reporter_refresh))
            .route("/activate/{id}", get(reporter_activate))
            .route("/deactivate/{id}", get(reporter_deactivate))
            .with_state(Arc::clone(state));
        router = router.nest(&format!("/{}", state.service().slug()), routes);
    }
    router
}

fn aggregator_routes(worker: Arc<DataFeedWorker>) -> Router {
    Router::new()
        .route("/all", get(aggregator_all))
        .route("/active", get(aggregator_active))
        .route("/refresh", get(aggregator_refresh))
        .route("/activate/{address}", get(aggregator_activate))
        .route("/deactivate/{address}", get(aggregator_deactivate))
        .route("/deviation", post(aggregator_deviation))
        .with_state(worker)
}

/// Serve `router` on `addr` until `shutdown` is cancelled.
pub async fn serve(
    name: &'static str,
    router: Router,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("🎛️ {name} control plane listening on {}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health() -> &'static str {
    "ok"
}

async fn listener_all(State(state): State<Arc<ListenerState>>) -> Reply<Vec<ListenerConfig>> {
    Ok(Json(state.all().await?))
}

async fn listener_active(State(state): State<Arc<ListenerState>>) -> Reply<Vec<ListenerConfig>> {
    Ok(Json(state.active().await?))
}

async fn listener_refresh(State(state): State<Arc<ListenerState>>) -> Reply<Vec<ListenerConfig>> {
    Ok(Json(state.refresh().await?))
}

async fn listener_activate(
    State(state): State<Arc<ListenerState>>,
    Path(id): Path<String>,
) -> Reply<ListenerConfig> {
    Ok(Json(state.activate(&id).await?))
}

async fn listener_deactivate(
    State(state): State<Arc<ListenerState>>,
    Path(id): Path<String>,
) -> Reply<ListenerConfig> {
    Ok(Json(state.deactivate(&id).await?))
}

async fn reporter_all(State(state): State<Arc<ReporterState>>) -> Reply<Vec<ReporterConfig>> {
    Ok(Json(state.all().await?))
}

async fn reporter_active(State(state): State<Arc<ReporterState>>) -> Json<Vec<ReporterConfig>> {
    Json(state.active())
}

async fn reporter_refresh(State(state): State<Arc<ReporterState>>) -> Reply<Vec<ReporterConfig>> {
    Ok(Json(state.refresh().await?))
}

async fn reporter_activate(
    State(state): State<Arc<ReporterState>>,
    Path(id): Path<String>,
) -> Reply<ReporterConfig> {
    Ok(Json(state.add(&id).await?))
}

async fn reporter_deactivate(
    State(state): State<Arc<ReporterState>>,
    Path(id): Path<String>,
) -> Reply<ReporterConfig> {
    Ok(Json(state.remove(&id).await?))
}

fn parse_address(raw: &str) -> Result<Address, ErrorResponse> {
    raw.parse().map_err(|_| ErrorResponse { message: format!("invalid address {raw}") })
}

async fn aggregator_all(State(worker): State<Arc<DataFeedWorker>>) -> Reply<Vec<Aggregator>> {
    Ok(Json(worker.all().await?))
}

async fn aggregator_active(State(worker): State<Arc<DataFeedWorker>>) -> Json<Vec<Aggregator>> {
    Json(worker.active())
}

async fn aggregator_refresh(State(worker): State<Arc<DataFeedWorker>>) -> Reply<Vec<Aggregator>> {
    Ok(Json(worker.refresh().await?))
}

async fn aggregator_activate(
    State(worker): State<Arc<DataFeedWorker>>,
    Path(address): Path<String>,
) -> Reply<Aggregator> {
    Ok(Json(worker.activate(parse_address(&address)?).await?))
}

async fn aggregator_deactivate(
    State(worker): State<Arc<DataFeedWorker>>,
    Path(address): Path<String>,
) -> Reply<Aggregator> {
    Ok(Json(worker.deactivate(parse_address(&address)?).await?))
}

async fn aggregator_deviation(
    State(worker): State<Arc<DataFeedWorker>>,
    Json(request): Json<DeviationRequest>,
) -> Reply<Option<String>> {
    Ok(Json(worker.enqueue_deviation(request)?))
}
