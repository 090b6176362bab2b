//! Run the oracle node.

use alloy::primitives::B256;
use prometheus::Registry;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    signal::unix::{signal, SignalKind},
    task::JoinHandle,
    try_join,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use crate::{
    api::{Catalog, OraklApi},
    chain::{http_chain_client, ChainClient},
    jobs::{ReporterJob, WorkerJob},
    listener::{
        ApiWatermarks, EventProcessor, KvWatermarks, ListenerError, ListenerSettings,
        ListenerState, Scanner, WatermarkSource, Watermarks,
    },
    metrics::{MetricServer, Metrics},
    queue::{Queue, QueueWorker},
    reporter::{
        Delegator, DelegatorError, HttpDelegator, NonceManagerProcessor, ReporterError,
        ReporterProcessor, ReporterState, Submitter, TxStrategy,
    },
    server,
    service::{Service, Stage},
    store::{KvStore, MdbxStore},
    worker::{
        Aggregators, DataFeedSettings, DataFeedWorker, Heartbeats, HttpVrfProver,
        RequestResponseWorker, ServiceWorker, VrfWorker, WorkerError,
    },
};

/// Error type for this module.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// database error
    #[error("database error: {0}")]
    Database(#[from] orakl_db::Error),
    /// task join error
    #[error("error handling failed")]
    ErrorHandlingFailed(#[from] tokio::task::JoinError),
    /// server io error
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
    /// prometheus error
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
    /// listener error
    #[error("listener error: {0}")]
    Listener(#[from] ListenerError),
    /// reporter error
    #[error("reporter error: {0}")]
    Reporter(#[from] ReporterError),
    /// worker error
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),
    /// fee delegator error
    #[error("fee delegator error: {0}")]
    Delegator(#[from] DelegatorError),
    /// VRF needs a prover
    #[error("the vrf service requires a prover url")]
    MissingVrfProver,
}

/// Transaction strategy per service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxStrategies {
    /// Data feed submissions.
    pub data_feed: TxStrategy,
    /// VRF fulfillments.
    pub vrf: TxStrategy,
    /// Request-response fulfillments.
    pub request_response: TxStrategy,
}

impl TxStrategies {
    /// Strategy of `service`.
    pub const fn for_service(&self, service: Service) -> TxStrategy {
        match service {
            Service::DataFeed => self.data_feed,
            Service::Vrf => self.vrf,
            Service::RequestResponse => self.request_response,
        }
    }
}

/// Arguments to run a node
#[derive(Debug)]
pub struct NodeConfig {
    /// Chain name used against the catalog.
    pub chain: String,
    /// Deployment name prefixing queue names and state keys.
    pub deployment: String,
    /// Services to run.
    pub services: Vec<Service>,
    /// EVM http rpc address.
    pub provider_url: Url,
    /// Catalog API base url.
    pub api_url: Url,
    /// Fee delegator base url.
    pub delegator_url: Option<Url>,
    /// VRF prover base url.
    pub vrf_prover_url: Option<Url>,
    /// VRF key hash events are filtered by.
    pub vrf_key_hash: Option<B256>,
    /// Path to directory to init/open embedded database.
    pub db_dir: String,
    /// Where listener watermarks are kept.
    pub watermark_source: WatermarkSource,
    /// Listener poll settings.
    pub listener: ListenerSettings,
    /// Data feed worker settings.
    pub data_feed: DataFeedSettings,
    /// Gas added to VRF callback gas limits.
    pub vrf_gas_minimum: u64,
    /// Gas added to request-response callback gas limits.
    pub request_response_gas_minimum: u64,
    /// Worker pool size. Service default when [None].
    pub worker_concurrency: Option<usize>,
    /// Reporter pool size. Service default when [None].
    pub reporter_concurrency: Option<usize>,
    /// Transaction strategy per service.
    pub tx_strategies: TxStrategies,
    /// Number of tx confirmations to wait for when submitting transactions.
    pub confirmations: u64,
    /// How long to wait for a receipt.
    pub receipt_timeout: Duration,
    /// Listener control plane listen address.
    pub listener_addr: SocketAddr,
    /// Reporter control plane listen address.
    pub reporter_addr: SocketAddr,
    /// Prometheus metrics listen address.
    pub prom_addr: SocketAddr,
}

/// Shared handles every service is built from.
struct Shared {
    chain_name: String,
    deployment: String,
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn KvStore>,
    chain: Arc<dyn ChainClient>,
    watermarks: Arc<dyn Watermarks>,
    delegator: Option<Arc<dyn Delegator>>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

/// A running service.
struct Running {
    listeners: Arc<ListenerState>,
    reporters: Arc<ReporterState>,
    data_feed: Option<Arc<DataFeedWorker>>,
    pools: Vec<QueueWorker>,
}

/// Run the oracle node until `SIGINT` or `SIGTERM`.
pub async fn run(
    NodeConfig {
        chain,
        deployment,
        services,
        provider_url,
        api_url,
        delegator_url,
        vrf_prover_url,
        vrf_key_hash,
        db_dir,
        watermark_source,
        listener,
        data_feed,
        vrf_gas_minimum,
        request_response_gas_minimum,
        worker_concurrency,
        reporter_concurrency,
        tx_strategies,
        confirmations,
        receipt_timeout,
        listener_addr,
        reporter_addr,
        prom_addr,
    }: NodeConfig,
) -> Result<(), Error> {
    info!("⛓️ chain is {chain}, deployment is {deployment}");
    info!("🔮 services: {services:?}");

    // Setup Prometheus registry & custom metrics
    let registry = Arc::new(Registry::new());
    let metrics = Arc::new(Metrics::new(&registry)?);
    let metric_server = MetricServer::new(Arc::clone(&registry));

    let server_shutdown = CancellationToken::new();
    let prometheus_server = {
        let shutdown = server_shutdown.clone();
        tokio::spawn(async move {
            info!("prometheus server listening on {}", prom_addr);
            metric_server.serve(prom_addr, shutdown).await
        })
    };

    let db = orakl_db::init_db(&db_dir)?;
    info!(db_dir, "💾 db initialized");
    let store: Arc<dyn KvStore> = Arc::new(MdbxStore::new(db));

    let catalog: Arc<dyn Catalog> = Arc::new(OraklApi::new(api_url));
    let watermarks: Arc<dyn Watermarks> = match watermark_source {
        WatermarkSource::Kv => Arc::new(KvWatermarks::new(Arc::clone(&store))),
        WatermarkSource::Api => Arc::new(ApiWatermarks::new(Arc::clone(&catalog))),
    };
    let delegator = match delegator_url {
        Some(url) => {
            info!("⛽ fee delegator at {url}");
            Some(Arc::new(HttpDelegator::new(url)?) as Arc<dyn Delegator>)
        }
        None => None,
    };

    let shared = Shared {
        chain_name: chain,
        deployment,
        catalog,
        store: Arc::clone(&store),
        chain: http_chain_client(provider_url),
        watermarks,
        delegator,
        metrics,
        shutdown: CancellationToken::new(),
    };

    let mut running = Vec::with_capacity(services.len());
    for service in services {
        let options = ServiceOptions {
            listener,
            data_feed,
            vrf_prover_url: vrf_prover_url.clone(),
            vrf_key_hash,
            vrf_gas_minimum,
            request_response_gas_minimum,
            worker_concurrency: worker_concurrency.unwrap_or(service.settings().worker_concurrency),
            reporter_concurrency: reporter_concurrency
                .unwrap_or(service.settings().reporter_concurrency),
            strategy: tx_strategies.for_service(service),
            confirmations,
            receipt_timeout,
        };
        running.push(start_service(&shared, service, options).await?);
    }

    let listener_states: Vec<_> = running.iter().map(|r| Arc::clone(&r.listeners)).collect();
    let reporter_states: Vec<_> = running.iter().map(|r| Arc::clone(&r.reporters)).collect();
    let data_feed_worker = running.iter().find_map(|r| r.data_feed.clone());

    let listener_server = tokio::spawn(server::serve(
        "listener",
        server::listener_router(&listener_states, data_feed_worker),
        listener_addr,
        server_shutdown.clone(),
    ));
    let reporter_server = tokio::spawn(server::serve(
        "reporter",
        server::reporter_router(&reporter_states),
        reporter_addr,
        server_shutdown.clone(),
    ));

    let servers = async {
        try_join!(flatten(listener_server), flatten(reporter_server), flatten(prometheus_server))
            .map(|_| ())
    };
    tokio::pin!(servers);

    let served = tokio::select! {
        received = shutdown_signal() => {
            received?;
            None
        }
        result = &mut servers => Some(result),
    };
    info!("🛑 shutting down");

    shared.shutdown.cancel();
    for service in &listener_states {
        service.stop_all().await;
    }
    for service in running {
        for pool in service.pools {
            pool.close().await;
        }
    }
    store.close().await;
    info!("💾 db closed");

    server_shutdown.cancel();
    match served {
        Some(result) => result,
        None => servers.await,
    }
}

/// Per-service values taken from [`NodeConfig`].
#[derive(Debug, Clone)]
struct ServiceOptions {
    listener: ListenerSettings,
    data_feed: DataFeedSettings,
    vrf_prover_url: Option<Url>,
    vrf_key_hash: Option<B256>,
    vrf_gas_minimum: u64,
    request_response_gas_minimum: u64,
    worker_concurrency: usize,
    reporter_concurrency: usize,
    strategy: TxStrategy,
    confirmations: u64,
    receipt_timeout: Duration,
}

/// Build the queues and states of `service`, spawn its pools and start its
/// listeners.
async fn start_service(
    shared: &Shared,
    service: Service,
    options: ServiceOptions,
) -> Result<Running, Error> {
    let Shared { chain_name, deployment, catalog, store, chain, metrics, .. } = shared;

    let worker_queue: Queue<WorkerJob> = Queue::new(service.queue_name(deployment, Stage::Worker));
    let reporter_queue: Queue<ReporterJob> =
        Queue::new(service.queue_name(deployment, Stage::Reporter));
    let mut pools = Vec::new();

    let reporters = Arc::new(ReporterState::new(
        service,
        chain_name.as_str(),
        deployment,
        Arc::clone(catalog),
        Arc::clone(store),
    ));
    let active = reporters.start().await?;
    info!("✉️ {service} reporters active: {}", active.len());

    let submitter = Submitter::new(
        Arc::clone(chain),
        shared.delegator.clone(),
        options.confirmations,
        options.receipt_timeout,
    );
    pools.push(QueueWorker::spawn(
        reporter_queue.clone(),
        Arc::new(ReporterProcessor::new(
            Arc::clone(&reporters),
            Arc::clone(chain),
            submitter,
            options.strategy,
            Arc::clone(metrics),
        )),
        options.reporter_concurrency,
        Arc::clone(metrics),
    ));

    let mut data_feed = None;
    let worker = match service {
        Service::DataFeed => {
            let heartbeats = Heartbeats::new(
                Arc::clone(chain),
                Arc::clone(&reporters),
                worker_queue.clone(),
                deployment.as_str(),
                shared.shutdown.clone(),
            );
            let aggregators = Aggregators::new(
                chain_name.as_str(),
                deployment,
                Arc::clone(catalog),
                Arc::clone(store),
            );
            let worker = Arc::new(DataFeedWorker::new(
                chain_name.as_str(),
                deployment.as_str(),
                Arc::clone(catalog),
                Arc::clone(chain),
                Arc::clone(&reporters),
                aggregators,
                heartbeats,
                reporter_queue.clone(),
                options.data_feed,
            ));
            let active = worker.start().await?;
            info!("📈 aggregators active: {}", active.len());
            data_feed = Some(Arc::clone(&worker));
            ServiceWorker::DataFeed(worker)
        }
        Service::Vrf => {
            let url = options.vrf_prover_url.ok_or(Error::MissingVrfProver)?;
            info!("🎲 vrf prover at {url}");
            let nonce_queue = Queue::new(service.queue_name(deployment, Stage::NonceManager));
            pools.push(QueueWorker::spawn(
                nonce_queue.clone(),
                Arc::new(NonceManagerProcessor::new(
                    Arc::clone(&reporters),
                    Arc::clone(chain),
                    reporter_queue.clone(),
                )),
                1,
                Arc::clone(metrics),
            ));
            ServiceWorker::Vrf(VrfWorker::new(
                Arc::new(HttpVrfProver::new(url)?),
                nonce_queue,
                options.vrf_gas_minimum,
            ))
        }
        Service::RequestResponse => ServiceWorker::RequestResponse(RequestResponseWorker::new(
            reporter_queue.clone(),
            options.request_response_gas_minimum,
        )),
    };

    pools.push(QueueWorker::spawn(
        worker_queue.clone(),
        Arc::new(worker),
        options.worker_concurrency,
        Arc::clone(metrics),
    ));

    let processor = EventProcessor::new(
        service,
        chain_name.as_str(),
        deployment.as_str(),
        Arc::clone(catalog),
        options.vrf_key_hash,
    );
    let scanner = Scanner::new(
        service,
        Arc::clone(chain),
        Arc::clone(&shared.watermarks),
        processor,
        worker_queue,
        Arc::clone(metrics),
    );
    let listeners = Arc::new(ListenerState::new(
        chain_name.as_str(),
        deployment,
        Arc::clone(catalog),
        Arc::clone(store),
        Arc::clone(chain),
        scanner,
        options.listener,
        shared.shutdown.clone(),
    ));
    let active = listeners.start().await?;
    info!("👂 {service} listeners active: {}", active.len());

    Ok(Running { listeners, reporters, data_feed, pools })
}

async fn shutdown_signal() -> Result<(), std::io::Error> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

async fn flatten<T, E: Into<Error>>(handle: JoinHandle<Result<T, E>>) -> Result<T, Error> {
    match handle.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err.into()),
        Err(err) => Err(Error::ErrorHandlingFailed(err)),
    }
}
