use alloy::{
    consensus::TxEnvelope,
    eips::eip2718::Decodable2718,
    primitives::{keccak256, Address, Bytes, B256, U256},
    rpc::types::Log,
    sol_types::SolEvent,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use prometheus::Registry;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    api::{Aggregate, Aggregator, ApiError, Catalog, ListenerConfig, ReporterConfig},
    chain::{ChainClient, ChainError, ChainErrorKind, TxOutcome},
    metrics::Metrics,
    reporter::{Delegator, DelegatorError, DelegatorRequest},
    service::Service,
    store::{KvStore, MemoryStore, StoreError},
    worker::{VrfProof, VrfProver, WorkerError},
};

pub(crate) const CHAIN: &str = "localhost";
pub(crate) const DEPLOYMENT: &str = "test";

pub(crate) fn metrics() -> Arc<Metrics> {
    Arc::new(Metrics::new(&Registry::new()).unwrap())
}

pub(crate) fn listener_config(id: &str, address: Address, service: Service) -> ListenerConfig {
    ListenerConfig {
        id: id.to_string(),
        address,
        event_name: service.settings().event_name.to_string(),
        chain: CHAIN.to_string(),
        service,
    }
}

/// Reporter for `oracle` signing with development account `account`.
pub(crate) fn reporter_config(
    id: &str,
    account: usize,
    oracle: Address,
    service: Service,
) -> ReporterConfig {
    let (key, address) = orakl_test_utils::DEV_ACCOUNTS[account];
    ReporterConfig {
        id: id.to_string(),
        address: address.to_string(),
        private_key: key.to_string(),
        oracle_address: oracle.to_string(),
        chain: CHAIN.to_string(),
        service,
    }
}

pub(crate) fn log_of<E: SolEvent>(address: Address, event: &E, block: u64) -> Log {
    Log {
        inner: alloy::primitives::Log { address, data: event.encode_log_data() },
        block_number: Some(block),
        block_hash: Some(B256::from(U256::from(block))),
        ..Default::default()
    }
}

fn cbor_text(s: &str) -> Vec<u8> {
    let mut out = Vec::new();
    match s.len() {
        n @ 0..=23 => out.push(0x60 | n as u8),
        n @ 24..=255 => out.extend([0x78, n as u8]),
        n => out.extend([0x79, (n >> 8) as u8, n as u8]),
    }
    out.extend(s.as_bytes());
    out
}

/// Request definition as emitted in `DataRequested`.
pub(crate) fn cbor_request(pairs: &[(&str, &str)]) -> Bytes {
    pairs.iter().flat_map(|(k, v)| [cbor_text(k), cbor_text(v)]).flatten().collect()
}

/// In-memory chain. Transactions are accepted unless an error is queued with
/// [`MockChain::push_send_error`].
#[derive(Debug, Default)]
pub(crate) struct MockChain {
    block: AtomicU64,
    timestamp: AtomicU64,
    tx_counts: Mutex<HashMap<Address, u64>>,
    tx_count_failures: AtomicU32,
    fail_logs: AtomicBool,
    logs: Mutex<Vec<Log>>,
    log_queries: Mutex<Vec<(u64, u64)>>,
    calls: Mutex<HashMap<(Address, [u8; 4]), Bytes>>,
    send_errors: Mutex<VecDeque<ChainError>>,
    attempts: Mutex<Vec<Bytes>>,
    sent: Mutex<Vec<Bytes>>,
}

impl MockChain {
    pub(crate) fn at_block(block: u64) -> Arc<Self> {
        let chain = Self::default();
        chain.set_block(block);
        Arc::new(chain)
    }

    pub(crate) fn set_block(&self, block: u64) {
        self.block.store(block, Ordering::SeqCst);
    }

    pub(crate) fn set_timestamp(&self, timestamp: u64) {
        self.timestamp.store(timestamp, Ordering::SeqCst);
    }

    pub(crate) fn set_tx_count(&self, address: Address, count: u64) {
        self.tx_counts.lock().insert(address, count);
    }

    /// Fail the next `times` transaction count reads.
    pub(crate) fn fail_tx_count(&self, times: u32) {
        self.tx_count_failures.store(times, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_logs(&self, fail: bool) {
        self.fail_logs.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn push_log(&self, log: Log) {
        self.logs.lock().push(log);
    }

    pub(crate) fn log_queries(&self) -> Vec<(u64, u64)> {
        self.log_queries.lock().clone()
    }

    pub(crate) fn set_call(&self, to: Address, selector: [u8; 4], output: Vec<u8>) {
        self.calls.lock().insert((to, selector), output.into());
    }

    pub(crate) fn push_send_error(&self, kind: ChainErrorKind) {
        self.send_errors.lock().push_back(ChainError::new(kind, format!("mock {}", kind.as_ref())));
    }

    /// Every broadcast, accepted or not.
    pub(crate) fn attempted(&self) -> Vec<TxEnvelope> {
        decode_all(&self.attempts.lock())
    }

    /// Accepted broadcasts.
    pub(crate) fn sent(&self) -> Vec<TxEnvelope> {
        decode_all(&self.sent.lock())
    }

    /// Accepted broadcasts as raw bytes.
    pub(crate) fn sent_raw(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }
}

fn decode_all(raw: &[Bytes]) -> Vec<TxEnvelope> {
    raw.iter().map(|tx| TxEnvelope::decode_2718(&mut tx.as_ref()).unwrap()).collect()
}

#[async_trait]
impl ChainClient for MockChain {
    async fn block_number(&self) -> Result<u64, ChainError> {
        Ok(self.block.load(Ordering::SeqCst))
    }

    async fn latest_block_timestamp(&self) -> Result<u64, ChainError> {
        Ok(self.timestamp.load(Ordering::SeqCst))
    }

    async fn logs(
        &self,
        address: Address,
        event_signature: B256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, ChainError> {
        if self.fail_logs.load(Ordering::SeqCst) {
            return Err(ChainError::new(ChainErrorKind::Rpc, "logs unavailable"));
        }
        self.log_queries.lock().push((from_block, to_block));

        Ok(self
            .logs
            .lock()
            .iter()
            .filter(|log| log.inner.address == address)
            .filter(|log| log.topics().first() == Some(&event_signature))
            .filter(|log| {
                log.block_number.is_some_and(|block| (from_block..=to_block).contains(&block))
            })
            .cloned()
            .collect())
    }

    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes, ChainError> {
        let selector: [u8; 4] = input
            .get(..4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| ChainError::new(ChainErrorKind::Rpc, "short call input"))?;
        self.calls
            .lock()
            .get(&(to, selector))
            .cloned()
            .ok_or_else(|| ChainError::new(ChainErrorKind::Rpc, "execution reverted"))
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, ChainError> {
        let fail = self
            .tx_count_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(ChainError::new(ChainErrorKind::Rpc, "connection refused"));
        }
        Ok(self.tx_counts.lock().get(&address).copied().unwrap_or_default())
    }

    async fn chain_id(&self) -> Result<u64, ChainError> {
        Ok(31337)
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        Ok(1_000_000_000)
    }

    async fn max_priority_fee_per_gas(&self) -> Result<u128, ChainError> {
        Ok(1)
    }

    async fn send_raw_transaction(
        &self,
        raw: Bytes,
        _confirmations: u64,
        _timeout: Duration,
    ) -> Result<TxOutcome, ChainError> {
        self.attempts.lock().push(raw.clone());
        if let Some(error) = self.send_errors.lock().pop_front() {
            return Err(error);
        }

        let hash = keccak256(&raw);
        self.sent.lock().push(raw);
        Ok(TxOutcome { hash, block_number: Some(self.block.load(Ordering::SeqCst)) })
    }
}

/// In-memory catalog.
#[derive(Debug, Default)]
pub(crate) struct MockCatalog {
    pub(crate) listeners: Mutex<Vec<ListenerConfig>>,
    pub(crate) reporters: Mutex<Vec<ReporterConfig>>,
    pub(crate) aggregators: Mutex<Vec<Aggregator>>,
    pub(crate) aggregates: Mutex<HashMap<String, Aggregate>>,
    pub(crate) observed: Mutex<HashMap<String, u64>>,
}

impl MockCatalog {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Catalog for MockCatalog {
    async fn listeners(
        &self,
        service: Service,
        chain: &str,
    ) -> Result<Vec<ListenerConfig>, ApiError> {
        Ok(self
            .listeners
            .lock()
            .iter()
            .filter(|l| l.service == service && l.chain == chain)
            .cloned()
            .collect())
    }

    async fn reporters(
        &self,
        service: Service,
        chain: &str,
    ) -> Result<Vec<ReporterConfig>, ApiError> {
        Ok(self
            .reporters
            .lock()
            .iter()
            .filter(|r| r.service == service && r.chain == chain)
            .cloned()
            .collect())
    }

    async fn reporter(&self, id: &str) -> Result<Option<ReporterConfig>, ApiError> {
        Ok(self.reporters.lock().iter().find(|r| r.id == id).cloned())
    }

    async fn reporter_by_oracle(
        &self,
        service: Service,
        chain: &str,
        oracle: Address,
    ) -> Result<Option<ReporterConfig>, ApiError> {
        Ok(self
            .reporters
            .lock()
            .iter()
            .find(|r| {
                r.service == service &&
                    r.chain == chain &&
                    r.oracle_address.parse::<Address>().ok() == Some(oracle)
            })
            .cloned())
    }

    async fn observed_block(&self, block_key: &str) -> Result<Option<u64>, ApiError> {
        Ok(self.observed.lock().get(block_key).copied())
    }

    async fn upsert_observed_block(&self, block_key: &str, block: u64) -> Result<(), ApiError> {
        self.observed.lock().insert(block_key.to_string(), block);
        Ok(())
    }

    async fn aggregators(&self, _chain: &str) -> Result<Vec<Aggregator>, ApiError> {
        Ok(self.aggregators.lock().clone())
    }

    async fn aggregator_by_address(
        &self,
        _chain: &str,
        address: Address,
    ) -> Result<Option<Aggregator>, ApiError> {
        Ok(self.aggregators.lock().iter().find(|a| a.address == address).cloned())
    }

    async fn latest_aggregate(
        &self,
        aggregator_hash: &str,
    ) -> Result<Option<Aggregate>, ApiError> {
        Ok(self.aggregates.lock().get(aggregator_hash).cloned())
    }
}

/// Prover returning a fixed proof and recording its inputs.
#[derive(Debug, Default)]
pub(crate) struct MockProver {
    pub(crate) alphas: Mutex<Vec<B256>>,
}

impl MockProver {
    pub(crate) fn proof() -> VrfProof {
        let n = |v: u64| U256::from(v);
        VrfProof {
            pk: [n(1), n(2)],
            proof: [n(3), n(4), n(5), n(6)],
            u_point: [n(7), n(8)],
            v_components: [n(9), n(10), n(11), n(12)],
        }
    }
}

#[async_trait]
impl VrfProver for MockProver {
    async fn prove(&self, alpha: B256) -> Result<VrfProof, WorkerError> {
        self.alphas.lock().push(alpha);
        Ok(Self::proof())
    }
}

/// Fee delegator that co-signs by returning fixed bytes, or fails while
/// `fail` is set.
#[derive(Debug, Default)]
pub(crate) struct MockDelegator {
    pub(crate) requests: Mutex<Vec<DelegatorRequest>>,
    pub(crate) fail: AtomicBool,
}

impl MockDelegator {
    pub(crate) const CO_SIGNED: &'static [u8] = &[0x09, 0xfe, 0xed];
}

#[async_trait]
impl Delegator for MockDelegator {
    async fn sign(&self, request: &DelegatorRequest) -> Result<Bytes, DelegatorError> {
        self.requests.lock().push(request.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(DelegatorError::Status(reqwest::StatusCode::BAD_GATEWAY));
        }
        Ok(Bytes::from_static(Self::CO_SIGNED))
    }
}

/// [`MemoryStore`] whose writes fail while `fail_writes` is set.
#[derive(Debug, Default)]
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    pub(crate) fail_writes: AtomicBool,
}

#[async_trait]
impl KvStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        self.inner.set(key, value).await
    }

    async fn close(&self) {}
}
