use alloy::primitives::{address, Address, I256};
use chrono::Utc;
use axum::Router;
use orakl_test_utils::{get_localhost_port, sleep_until_bound, LOCALHOST};
use reqwest::StatusCode;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

use super::mocks::{
    listener_config, metrics, reporter_config, MockCatalog, MockChain, CHAIN, DEPLOYMENT,
};
use crate::{
    api::{Aggregator, ListenerConfig, ReporterConfig},
    jobs::{DeviationRequest, WorkerJob},
    listener::{EventProcessor, KvWatermarks, ListenerSettings, ListenerState, Scanner},
    queue::Queue,
    reporter::ReporterState,
    server::{listener_router, reporter_router, serve},
    service::Service,
    store::MemoryStore,
    worker::{Aggregators, DataFeedSettings, DataFeedWorker, Heartbeats},
};

const COORDINATOR: Address = address!("4000000000000000000000000000000000000001");
const AGGREGATOR: Address = address!("4000000000000000000000000000000000000002");

struct Plane {
    base: String,
    shutdown: CancellationToken,
}

impl Drop for Plane {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn spawn(name: &'static str, router: Router) -> Plane {
    let port = get_localhost_port();
    let shutdown = CancellationToken::new();
    let addr = format!("{LOCALHOST}:{port}").parse().unwrap();
    tokio::spawn(serve(name, router, addr, shutdown.clone()));
    sleep_until_bound(port).await;
    Plane { base: format!("http://{LOCALHOST}:{port}"), shutdown }
}

async fn get(plane: &Plane, path: &str) -> (StatusCode, String) {
    let response = reqwest::get(format!("{}{path}", plane.base)).await.unwrap();
    let status = response.status();
    (status, response.text().await.unwrap())
}

fn listener_state(
    service: Service,
    chain: Arc<MockChain>,
    catalog: Arc<MockCatalog>,
    store: Arc<MemoryStore>,
) -> Arc<ListenerState> {
    let scanner = Scanner::new(
        service,
        chain.clone(),
        Arc::new(KvWatermarks::new(store.clone())),
        EventProcessor::new(service, CHAIN, DEPLOYMENT, catalog.clone(), None),
        Queue::new("test-worker"),
        metrics(),
    );
    Arc::new(ListenerState::new(
        CHAIN,
        DEPLOYMENT,
        catalog,
        store,
        chain,
        scanner,
        ListenerSettings { delay: Duration::from_secs(3600), backfill_blocks: 0 },
        CancellationToken::new(),
    ))
}

#[tokio::test(flavor = "multi_thread")]
async fn listener_control_plane() {
    orakl_test_utils::test_tracing();
    let chain = MockChain::at_block(10);
    let catalog = MockCatalog::new();
    let store = Arc::new(MemoryStore::new());
    *catalog.listeners.lock() = vec![
        listener_config("1", COORDINATOR, Service::Vrf),
        listener_config("2", AGGREGATOR, Service::DataFeed),
    ];
    *catalog.aggregators.lock() = vec![Aggregator {
        aggregator_hash: "0xfeed".to_string(),
        address: AGGREGATOR,
        heartbeat: 60_000,
        name: "ETH-USD".to_string(),
    }];

    let vrf = listener_state(Service::Vrf, chain.clone(), catalog.clone(), store.clone());
    let data_feed = listener_state(Service::DataFeed, chain.clone(), catalog.clone(), store.clone());
    let reporters = Arc::new(ReporterState::new(
        Service::DataFeed,
        CHAIN,
        DEPLOYMENT,
        catalog.clone(),
        store.clone(),
    ));
    let worker_queue = Queue::new("test-worker");
    let worker = Arc::new(DataFeedWorker::new(
        CHAIN,
        DEPLOYMENT,
        catalog.clone(),
        chain.clone(),
        Arc::clone(&reporters),
        Aggregators::new(CHAIN, DEPLOYMENT, catalog.clone(), store.clone()),
        Heartbeats::new(
            chain.clone(),
            reporters,
            worker_queue.clone(),
            DEPLOYMENT,
            CancellationToken::new(),
        ),
        Queue::new("test-reporter"),
        DataFeedSettings::default(),
    ));

    let plane = spawn(
        "listener",
        listener_router(&[Arc::clone(&vrf), Arc::clone(&data_feed)], Some(worker)),
    )
    .await;

    assert_eq!(get(&plane, "/health").await, (StatusCode::OK, "ok".to_string()));

    let (status, body) = get(&plane, "/vrf/all").await;
    assert_eq!(status, StatusCode::OK);
    let all: Vec<ListenerConfig> = serde_json::from_str(&body).unwrap();
    assert_eq!(all, vec![listener_config("1", COORDINATOR, Service::Vrf)]);

    let (status, body) = get(&plane, "/vrf/activate/1").await;
    assert_eq!(status, StatusCode::OK);
    let activated: ListenerConfig = serde_json::from_str(&body).unwrap();
    assert_eq!(activated.id, "1");
    assert_eq!(vrf.running(), vec!["1"]);

    assert_eq!(
        get(&plane, "/vrf/activate/1").await,
        (StatusCode::INTERNAL_SERVER_ERROR, "listener 1 is already active".to_string())
    );
    assert_eq!(
        get(&plane, "/vrf/activate/2").await,
        (StatusCode::INTERNAL_SERVER_ERROR, "listener 2 not added".to_string())
    );

    let (status, _) = get(&plane, "/vrf/deactivate/1").await;
    assert_eq!(status, StatusCode::OK);
    assert!(vrf.running().is_empty());
    assert_eq!(get(&plane, "/vrf/active").await, (StatusCode::OK, "[]".to_string()));

    let (status, body) = get(&plane, &format!("/data-feed/aggregator/activate/{AGGREGATOR}")).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let aggregator: Aggregator = serde_json::from_str(&body).unwrap();
    assert_eq!(aggregator.address, AGGREGATOR);

    assert_eq!(
        get(&plane, "/data-feed/aggregator/activate/nope").await,
        (StatusCode::INTERNAL_SERVER_ERROR, "invalid address nope".to_string())
    );
    // Aggregator routes only exist under the data feed.
    assert_eq!(get(&plane, "/vrf/aggregator/active").await.0, StatusCode::NOT_FOUND);

    let deviation = DeviationRequest {
        oracle_address: AGGREGATOR,
        submission: I256::try_from(1300).unwrap(),
        timestamp: Utc::now(),
    };
    let response = reqwest::Client::new()
        .post(format!("{}/data-feed/aggregator/deviation", plane.base))
        .json(&deviation)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let queued: Vec<_> = worker_queue.take_waiting().into_iter().map(|j| j.payload).collect();
    assert_eq!(queued, vec![WorkerJob::Deviation(deviation)]);

    vrf.stop_all().await;
    data_feed.stop_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reporter_control_plane() {
    orakl_test_utils::test_tracing();
    let catalog = MockCatalog::new();
    *catalog.reporters.lock() = vec![
        reporter_config("r1", 0, COORDINATOR, Service::Vrf),
        reporter_config("r2", 1, AGGREGATOR, Service::Vrf),
    ];
    let state = Arc::new(ReporterState::new(
        Service::Vrf,
        CHAIN,
        DEPLOYMENT,
        catalog.clone(),
        Arc::new(MemoryStore::new()),
    ));
    state.refresh().await.unwrap();

    let plane = spawn("reporter", reporter_router(&[Arc::clone(&state)])).await;

    let (status, body) = get(&plane, "/vrf/active").await;
    assert_eq!(status, StatusCode::OK);
    assert!(!body.contains(orakl_test_utils::DEV_ACCOUNTS[0].0), "private key exposed");
    let active: Vec<ReporterConfig> = serde_json::from_str(&body).unwrap();
    let ids: Vec<_> = active.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["r1", "r2"]);

    assert_eq!(
        get(&plane, "/vrf/activate/r1").await,
        (StatusCode::INTERNAL_SERVER_ERROR, "reporter r1 is already active".to_string())
    );

    let (status, _) = get(&plane, "/vrf/deactivate/r2").await;
    assert_eq!(status, StatusCode::OK);
    assert!(state.wallet(AGGREGATOR).is_none());
    assert_eq!(
        get(&plane, "/vrf/deactivate/r2").await,
        (StatusCode::INTERNAL_SERVER_ERROR, "reporter r2 not found".to_string())
    );

    let (status, _) = get(&plane, "/vrf/activate/r2").await;
    assert_eq!(status, StatusCode::OK);
    assert!(state.wallet(AGGREGATOR).is_some());
}
