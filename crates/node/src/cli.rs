//! CLI for the oracle node.

use alloy::primitives::B256;
use clap::Parser;
use std::{net::SocketAddr, time::Duration};
use tracing::{info, instrument};
use url::Url;

use crate::{
    listener::{ListenerSettings, WatermarkSource},
    node::{self, NodeConfig, TxStrategies},
    reporter::TxStrategy,
    service::Service,
    worker::{DataFeedSettings, MAX_DATA_STALENESS},
};

/// Errors from the node CLI
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// no service was selected
    #[error("at least one service must be selected")]
    NoServices,
    /// a service is fee delegated but no delegator is configured
    #[error("{0} uses fee delegated transactions, set --delegator-url")]
    MissingDelegator(Service),
    /// default db dir could not be resolved
    #[error("could not resolve a home directory, set --db-dir")]
    NoHomeDir,
    /// error running node
    #[error(transparent)]
    Node(#[from] crate::node::Error),
}

/// `~/.config/orakl/<deployment>/db`
fn default_db_dir(deployment: &str) -> Option<String> {
    let mut p = home::home_dir()?;
    p.push(".config");
    p.push("orakl");
    p.push(deployment);
    p.push("db");
    p.into_os_string().into_string().ok()
}

/// Oracle node.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Opts {
    /// Chain name registered in the catalog
    #[arg(long, env = "ORAKL_CHAIN", default_value = "localhost")]
    chain: String,

    /// Deployment name prefixing queue names and state keys
    #[arg(long, env = "ORAKL_DEPLOYMENT_NAME", default_value = "orakl")]
    deployment_name: String,

    /// Services to run
    #[arg(
        long,
        env = "ORAKL_SERVICES",
        value_delimiter = ',',
        default_values_t = Service::ALL
    )]
    services: Vec<Service>,

    /// HTTP Ethereum RPC address. Defaults to a local anvil node address.
    #[arg(long, env = "ORAKL_PROVIDER_URL", default_value = "http://127.0.0.1:8545")]
    provider_url: Url,

    /// Catalog API base url
    #[arg(long, env = "ORAKL_API_URL", default_value = "http://127.0.0.1:3000/api/v1")]
    api_url: Url,

    /// Fee delegator base url. Required by fee delegated services.
    #[arg(long, env = "ORAKL_DELEGATOR_URL")]
    delegator_url: Option<Url>,

    /// VRF prover base url. Required by the vrf service.
    #[arg(long, env = "ORAKL_VRF_PROVER_URL")]
    vrf_prover_url: Option<Url>,

    /// Only serve VRF requests for this key hash
    #[arg(long, env = "ORAKL_VRF_KEY_HASH")]
    vrf_key_hash: Option<B256>,

    /// Path to the directory to include db. Defaults to `~/.config/orakl/<deployment>/db`.
    #[arg(long, env = "ORAKL_DB_DIR")]
    db_dir: Option<String>,

    /// Where listener watermarks are kept
    #[arg(long, env = "ORAKL_WATERMARK_SOURCE", value_enum, default_value_t = WatermarkSource::Kv)]
    watermark_source: WatermarkSource,

    /// Listener poll interval in milliseconds
    #[arg(long, env = "ORAKL_LISTENER_DELAY_MS", default_value_t = 500)]
    listener_delay_ms: u64,

    /// Blocks before the head scanned when a listener is activated
    #[arg(long, env = "ORAKL_BACKFILL_BLOCKS", default_value_t = 10)]
    backfill_blocks: u64,

    /// Gas limit of data feed submissions
    #[arg(long, env = "ORAKL_DATA_FEED_GAS_MINIMUM", default_value_t = Service::DataFeed.settings().fulfill_gas_minimum)]
    data_feed_gas_minimum: u64,

    /// Max age of the latest aggregate, in milliseconds
    #[arg(long, env = "ORAKL_MAX_DATA_STALENESS_MS", default_value_t = MAX_DATA_STALENESS.as_millis() as u64)]
    max_data_staleness_ms: u64,

    /// Gas added to VRF callback gas limits
    #[arg(long, env = "ORAKL_VRF_GAS_MINIMUM", default_value_t = Service::Vrf.settings().fulfill_gas_minimum)]
    vrf_gas_minimum: u64,

    /// Gas added to request-response callback gas limits
    #[arg(long, env = "ORAKL_REQUEST_RESPONSE_GAS_MINIMUM", default_value_t = Service::RequestResponse.settings().fulfill_gas_minimum)]
    request_response_gas_minimum: u64,

    /// Worker pool size. Defaults per service.
    #[arg(long, env = "ORAKL_WORKER_CONCURRENCY")]
    worker_concurrency: Option<usize>,

    /// Reporter pool size. Defaults per service.
    #[arg(long, env = "ORAKL_REPORTER_CONCURRENCY")]
    reporter_concurrency: Option<usize>,

    /// Transaction strategy of data feed submissions
    #[arg(long, env = "ORAKL_DATA_FEED_TX_STRATEGY", value_enum, default_value_t = TxStrategy::Legacy)]
    data_feed_tx_strategy: TxStrategy,

    /// Transaction strategy of VRF fulfillments
    #[arg(long, env = "ORAKL_VRF_TX_STRATEGY", value_enum, default_value_t = TxStrategy::Legacy)]
    vrf_tx_strategy: TxStrategy,

    /// Transaction strategy of request-response fulfillments
    #[arg(long, env = "ORAKL_REQUEST_RESPONSE_TX_STRATEGY", value_enum, default_value_t = TxStrategy::Legacy)]
    request_response_tx_strategy: TxStrategy,

    /// Required confirmations for tx
    #[arg(long, env = "ORAKL_CONFIRMATIONS", default_value_t = 1)]
    confirmations: u64,

    /// Seconds to wait for a receipt
    #[arg(long, env = "ORAKL_RECEIPT_TIMEOUT_SECS", default_value_t = 60)]
    receipt_timeout_secs: u64,

    /// Listener control plane address
    #[arg(long, env = "ORAKL_LISTENER_ADDRESS", default_value = "127.0.0.1:4000")]
    listener_address: SocketAddr,

    /// Reporter control plane address
    #[arg(long, env = "ORAKL_REPORTER_ADDRESS", default_value = "127.0.0.1:6000")]
    reporter_address: SocketAddr,

    /// prometheus metrics address
    #[arg(long, env = "ORAKL_PROM_ADDRESS", default_value = "127.0.0.1:3001")]
    prom_address: SocketAddr,
}

impl Opts {
    fn into_config(self) -> Result<NodeConfig, Error> {
        if self.services.is_empty() {
            return Err(Error::NoServices);
        }
        let mut services = self.services;
        services.sort();
        services.dedup();

        let tx_strategies = TxStrategies {
            data_feed: self.data_feed_tx_strategy,
            vrf: self.vrf_tx_strategy,
            request_response: self.request_response_tx_strategy,
        };
        if self.delegator_url.is_none() {
            if let Some(service) = services
                .iter()
                .find(|s| tx_strategies.for_service(**s) == TxStrategy::FeeDelegated)
            {
                return Err(Error::MissingDelegator(*service));
            }
        }

        let db_dir = match self.db_dir {
            Some(db_dir) => db_dir,
            None => default_db_dir(&self.deployment_name).ok_or(Error::NoHomeDir)?,
        };

        Ok(NodeConfig {
            chain: self.chain,
            deployment: self.deployment_name,
            services,
            provider_url: self.provider_url,
            api_url: self.api_url,
            delegator_url: self.delegator_url,
            vrf_prover_url: self.vrf_prover_url,
            vrf_key_hash: self.vrf_key_hash,
            db_dir,
            watermark_source: self.watermark_source,
            listener: ListenerSettings {
                delay: Duration::from_millis(self.listener_delay_ms),
                backfill_blocks: self.backfill_blocks,
            },
            data_feed: DataFeedSettings {
                gas_minimum: self.data_feed_gas_minimum,
                max_staleness: Duration::from_millis(self.max_data_staleness_ms),
            },
            vrf_gas_minimum: self.vrf_gas_minimum,
            request_response_gas_minimum: self.request_response_gas_minimum,
            worker_concurrency: self.worker_concurrency,
            reporter_concurrency: self.reporter_concurrency,
            tx_strategies,
            confirmations: self.confirmations,
            receipt_timeout: Duration::from_secs(self.receipt_timeout_secs),
            listener_addr: self.listener_address,
            reporter_addr: self.reporter_address,
            prom_addr: self.prom_address,
        })
    }
}

/// Command line interface for running the oracle node.
#[derive(Parser, Debug)]
pub struct Cli;

impl Cli {
    /// Run the CLI
    #[instrument]
    pub async fn run() -> Result<(), Error> {
        let config = Opts::parse().into_config()?;
        info!(db_dir = %config.db_dir, "📝 configuration loaded");

        node::run(config).await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_env_names() {
        let opts = Opts::try_parse_from([
            "orakl-node",
            "--services",
            "vrf,data-feed,vrf",
            "--db-dir",
            "/tmp/orakl",
            "--vrf-tx-strategy",
            "fee-delegated",
            "--delegator-url",
            "http://localhost:3002",
        ])
        .unwrap();
        let config = opts.into_config().unwrap();

        assert_eq!(config.services, vec![Service::DataFeed, Service::Vrf]);
        assert_eq!(config.listener, ListenerSettings::default());
        assert_eq!(config.data_feed, DataFeedSettings::default());
        assert_eq!(config.tx_strategies.for_service(Service::Vrf), TxStrategy::FeeDelegated);
        assert_eq!(config.tx_strategies.for_service(Service::DataFeed), TxStrategy::Legacy);
        assert_eq!(config.vrf_gas_minimum, 1_000_000);
        assert_eq!(config.worker_concurrency, None);
    }

    #[test]
    fn fee_delegation_requires_a_delegator() {
        let parse = |args: &[&str]| {
            let mut argv = vec!["orakl-node", "--db-dir", "/tmp/orakl"];
            argv.extend_from_slice(args);
            Opts::try_parse_from(argv).unwrap().into_config()
        };

        let err = parse(&["--services", "vrf", "--vrf-tx-strategy", "fee-delegated"]).unwrap_err();
        assert!(matches!(err, Error::MissingDelegator(Service::Vrf)), "{err}");

        // Only selected services are checked.
        let config =
            parse(&["--services", "data-feed", "--vrf-tx-strategy", "fee-delegated"]).unwrap();
        assert_eq!(config.services, vec![Service::DataFeed]);
    }
}
