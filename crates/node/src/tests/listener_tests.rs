use alloy::primitives::{address, Address, B256, U256};
use orakl_contracts::{aggregator::IAggregator, vrf_coordinator::IVRFCoordinator};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

use super::mocks::{
    listener_config, log_of, metrics, reporter_config, MockCatalog, MockChain, CHAIN, DEPLOYMENT,
};
use crate::{
    error::{ErrorKind, HasKind},
    jobs::{WorkerJob, WorkerSource},
    listener::{
        aggregator_job_id, EventProcessor, KvWatermarks, ListenerError, ListenerSettings,
        ListenerState, Scanner, Watermarks,
    },
    queue::Queue,
    service::Service,
    store::MemoryStore,
};

const COORDINATOR: Address = address!("2000000000000000000000000000000000000001");
const AGGREGATOR: Address = address!("2000000000000000000000000000000000000002");

struct Setup {
    chain: Arc<MockChain>,
    catalog: Arc<MockCatalog>,
    store: Arc<MemoryStore>,
    watermarks: Arc<KvWatermarks>,
    queue: Queue<WorkerJob>,
}

impl Setup {
    fn new(block: u64) -> Self {
        orakl_test_utils::test_tracing();
        let store = Arc::new(MemoryStore::new());
        Self {
            chain: MockChain::at_block(block),
            catalog: MockCatalog::new(),
            watermarks: Arc::new(KvWatermarks::new(store.clone())),
            store,
            queue: Queue::new("test-worker"),
        }
    }

    fn scanner(&self, service: Service, vrf_key_hash: Option<B256>) -> Scanner {
        let processor =
            EventProcessor::new(service, CHAIN, DEPLOYMENT, self.catalog.clone(), vrf_key_hash);
        Scanner::new(
            service,
            self.chain.clone(),
            self.watermarks.clone(),
            processor,
            self.queue.clone(),
            metrics(),
        )
    }

    fn listener_state(&self, service: Service, backfill_blocks: u64) -> ListenerState {
        ListenerState::new(
            CHAIN,
            DEPLOYMENT,
            self.catalog.clone(),
            self.store.clone(),
            self.chain.clone(),
            self.scanner(service, None),
            // Long enough that only the immediate first tick runs during a test.
            ListenerSettings { delay: Duration::from_secs(3600), backfill_blocks },
            CancellationToken::new(),
        )
    }
}

fn random_words_requested(key_hash: B256, request_id: u64) -> IVRFCoordinator::RandomWordsRequested {
    IVRFCoordinator::RandomWordsRequested {
        keyHash: key_hash,
        requestId: U256::from(request_id),
        preSeed: U256::from(request_id * 1000),
        accId: 1,
        callbackGasLimit: 500_000,
        numWords: 1,
        sender: Address::repeat_byte(0x33),
        isDirectPayment: false,
    }
}

fn new_round(round: u64, started_by: Address) -> IAggregator::NewRound {
    IAggregator::NewRound {
        roundId: U256::from(round),
        startedBy: started_by,
        startedAt: U256::from(1_700_000_000u64),
    }
}

fn ids(listeners: &[crate::api::ListenerConfig]) -> Vec<&str> {
    listeners.iter().map(|l| l.id.as_str()).collect()
}

#[tokio::test]
async fn watermark_only_moves_forward() {
    let setup = Setup::new(100);
    let scanner = setup.scanner(Service::Vrf, None);
    let listener = listener_config("1", COORDINATOR, Service::Vrf);

    assert_eq!(scanner.poll(&listener).await.unwrap(), Some((100, 100)));
    assert_eq!(setup.watermarks.get(COORDINATOR).await.unwrap(), Some(101));

    // No new head.
    assert_eq!(scanner.poll(&listener).await.unwrap(), None);
    assert_eq!(setup.watermarks.get(COORDINATOR).await.unwrap(), Some(101));

    setup.chain.set_block(105);
    setup.chain.push_log(log_of(COORDINATOR, &random_words_requested(B256::ZERO, 7), 103));
    assert_eq!(scanner.poll(&listener).await.unwrap(), Some((101, 105)));
    assert_eq!(setup.watermarks.get(COORDINATOR).await.unwrap(), Some(106));
    assert_eq!(setup.chain.log_queries(), vec![(100, 100), (101, 105)]);

    let jobs = setup.queue.take_waiting();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, "7");
    let WorkerJob::Vrf(request) = &jobs[0].payload else { panic!("expected a vrf job") };
    assert_eq!(request.block_num, 103);
    assert_eq!(request.block_hash, B256::from(U256::from(103)));
    assert_eq!(request.callback_address, COORDINATOR);
    assert_eq!(request.seed, U256::from(7000));
}

#[tokio::test]
async fn failed_poll_keeps_watermark() {
    let setup = Setup::new(60);
    let scanner = setup.scanner(Service::Vrf, None);
    let listener = listener_config("1", COORDINATOR, Service::Vrf);
    setup.watermarks.set(COORDINATOR, 50).await.unwrap();
    setup.chain.push_log(log_of(COORDINATOR, &random_words_requested(B256::ZERO, 1), 55));

    setup.chain.set_fail_logs(true);
    let err = scanner.poll(&listener).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransientChain);
    assert_eq!(setup.watermarks.get(COORDINATOR).await.unwrap(), Some(50));

    setup.chain.set_fail_logs(false);
    assert_eq!(scanner.poll(&listener).await.unwrap(), Some((50, 60)));
    assert_eq!(setup.watermarks.get(COORDINATOR).await.unwrap(), Some(61));
    assert_eq!(setup.queue.take_waiting().len(), 1);
}

#[tokio::test]
async fn rescanned_events_are_enqueued_once() {
    let setup = Setup::new(20);
    let scanner = setup.scanner(Service::Vrf, None);
    let listener = listener_config("1", COORDINATOR, Service::Vrf);
    setup.chain.push_log(log_of(COORDINATOR, &random_words_requested(B256::ZERO, 1), 10));
    setup.chain.push_log(log_of(COORDINATOR, &random_words_requested(B256::ZERO, 2), 12));

    assert_eq!(scanner.scan(&listener, 5, 15).await.unwrap(), 2);
    assert_eq!(scanner.scan(&listener, 5, 15).await.unwrap(), 0);
    assert_eq!(scanner.scan(&listener, 11, 20).await.unwrap(), 0);

    let ids: Vec<_> = setup.queue.take_waiting().into_iter().map(|j| j.id).collect();
    assert_eq!(ids, vec!["1", "2"]);
}

#[tokio::test]
async fn requests_for_other_keys_are_ignored() {
    let setup = Setup::new(20);
    let key_hash = B256::repeat_byte(0xaa);
    let scanner = setup.scanner(Service::Vrf, Some(key_hash));
    let listener = listener_config("1", COORDINATOR, Service::Vrf);
    setup.chain.push_log(log_of(COORDINATOR, &random_words_requested(key_hash, 1), 10));
    setup.chain.push_log(log_of(COORDINATOR, &random_words_requested(B256::repeat_byte(0xbb), 2), 11));

    assert_eq!(scanner.scan(&listener, 0, 20).await.unwrap(), 1);
    let ids: Vec<_> = setup.queue.take_waiting().into_iter().map(|j| j.id).collect();
    assert_eq!(ids, vec!["1"]);
}

#[tokio::test]
async fn rounds_started_by_own_operator_are_skipped() {
    let setup = Setup::new(20);
    let operator: Address = orakl_test_utils::DEV_ACCOUNTS[0].1.parse().unwrap();
    setup.catalog.reporters.lock().push(reporter_config("r1", 0, AGGREGATOR, Service::DataFeed));
    let scanner = setup.scanner(Service::DataFeed, None);
    let listener = listener_config("1", AGGREGATOR, Service::DataFeed);

    setup.chain.push_log(log_of(AGGREGATOR, &new_round(4, operator), 10));
    setup.chain.push_log(log_of(AGGREGATOR, &new_round(5, Address::repeat_byte(0x44)), 11));

    assert_eq!(scanner.scan(&listener, 0, 20).await.unwrap(), 1);
    let jobs = setup.queue.take_waiting();
    assert_eq!(jobs[0].id, aggregator_job_id(5, AGGREGATOR, DEPLOYMENT));
    let WorkerJob::Aggregator(job) = &jobs[0].payload else { panic!("expected an aggregator job") };
    assert_eq!(job.round_id, 5);
    assert_eq!(job.oracle_address, AGGREGATOR);
    assert_eq!(job.source, WorkerSource::Event);
}

#[tokio::test]
async fn operator_registered_later_is_recognised() {
    let setup = Setup::new(20);
    let operator: Address = orakl_test_utils::DEV_ACCOUNTS[0].1.parse().unwrap();
    let scanner = setup.scanner(Service::DataFeed, None);
    let listener = listener_config("1", AGGREGATOR, Service::DataFeed);
    setup.chain.push_log(log_of(AGGREGATOR, &new_round(4, operator), 10));
    setup.chain.push_log(log_of(AGGREGATOR, &new_round(5, operator), 15));

    // Unknown operator, so the round is not recognised as our own.
    assert_eq!(scanner.scan(&listener, 0, 12).await.unwrap(), 1);

    setup.catalog.reporters.lock().push(reporter_config("r1", 0, AGGREGATOR, Service::DataFeed));
    assert_eq!(scanner.scan(&listener, 13, 20).await.unwrap(), 0);
    assert_eq!(setup.queue.take_waiting().len(), 1);
}

#[tokio::test]
async fn activation_is_validated() {
    let setup = Setup::new(100);
    let mut wrong_event = listener_config("2", AGGREGATOR, Service::Vrf);
    wrong_event.event_name = "NewRound".to_string();
    *setup.catalog.listeners.lock() =
        vec![listener_config("1", COORDINATOR, Service::Vrf), wrong_event];
    let state = setup.listener_state(Service::Vrf, 0);

    let err = state.activate("2").await.unwrap_err();
    assert!(matches!(err, ListenerError::EventMismatch { .. }), "{err}");
    assert!(matches!(state.activate("3").await, Err(ListenerError::ListenerNotAdded(_))));

    let activated = state.activate("1").await.unwrap();
    assert_eq!(activated.address, COORDINATOR);
    assert_eq!(setup.watermarks.get(COORDINATOR).await.unwrap().map(|b| b >= 100), Some(true));
    assert!(matches!(state.activate("1").await, Err(ListenerError::ListenerAlreadyActive(_))));
    assert_eq!(state.running(), vec!["1"]);
    assert_eq!(ids(&state.active().await.unwrap()), vec!["1"]);

    state.deactivate("1").await.unwrap();
    assert!(state.running().is_empty());
    assert!(state.active().await.unwrap().is_empty());
    let err = state.deactivate("1").await.unwrap_err();
    assert!(matches!(err, ListenerError::ListenerNotFound(_)));
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[tokio::test]
async fn activation_backfills_recent_blocks() {
    let setup = Setup::new(100);
    *setup.catalog.listeners.lock() = vec![listener_config("1", COORDINATOR, Service::Vrf)];
    setup.chain.push_log(log_of(COORDINATOR, &random_words_requested(B256::ZERO, 9), 95));
    let state = setup.listener_state(Service::Vrf, 10);

    state.activate("1").await.unwrap();

    assert!(setup.chain.log_queries().contains(&(90, 99)));
    assert!(setup.queue.contains("9"));
    state.stop_all().await;
}

#[tokio::test]
async fn start_restores_persisted_set() {
    let setup = Setup::new(100);
    *setup.catalog.listeners.lock() = vec![
        listener_config("1", COORDINATOR, Service::Vrf),
        listener_config("2", Address::repeat_byte(0x22), Service::Vrf),
    ];

    let first = setup.listener_state(Service::Vrf, 0);
    // Nothing persisted yet, so every catalog entry is activated.
    assert_eq!(ids(&first.start().await.unwrap()), vec!["1", "2"]);
    first.deactivate("2").await.unwrap();
    first.stop_all().await;

    let restarted = setup.listener_state(Service::Vrf, 0);
    assert_eq!(ids(&restarted.start().await.unwrap()), vec!["1"]);
    assert_eq!(restarted.running(), vec!["1"]);

    assert_eq!(ids(&restarted.refresh().await.unwrap()), vec!["1", "2"]);
    assert_eq!(restarted.running(), vec!["1", "2"]);

    restarted.clear().await.unwrap();
    assert!(restarted.running().is_empty());
    assert!(restarted.active().await.unwrap().is_empty());
}
