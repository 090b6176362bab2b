//! Transaction building, signing and broadcast.

use alloy::{
    eips::eip2718::Encodable2718,
    network::{EthereumWallet, TransactionBuilder},
    primitives::{Address, Bytes, U256},
    rpc::types::TransactionRequest,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};
use tokio::sync::OnceCell;
use url::Url;

use super::wallet::Wallet;
use crate::{
    chain::{ChainClient, ChainError, TxOutcome},
    jobs::ReporterJob,
};

/// How reporter transactions are priced and signed.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum, strum::AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TxStrategy {
    /// Type 0 transaction signed by the reporter.
    #[default]
    Legacy,
    /// Dynamic fee transaction signed by the reporter.
    Eip1559,
    /// Reporter signed transaction co-signed by the fee delegator.
    FeeDelegated,
}

/// Fee delegator errors
#[derive(thiserror::Error, Debug)]
pub enum DelegatorError {
    /// delegator did not answer
    #[error("fee delegator request: {0}")]
    Http(#[from] reqwest::Error),
    /// delegator answered with a failure status
    #[error("fee delegator returned {0}")]
    Status(reqwest::StatusCode),
    /// base url cannot carry path segments
    #[error("fee delegator url cannot be a base: {0}")]
    BaseUrl(Url),
}

/// Transaction fields sent to the fee delegator along with the reporter signed tx.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegatorRequest {
    pub from: Address,
    pub to: Address,
    pub input: Bytes,
    pub gas: u64,
    pub value: U256,
    pub chain_id: u64,
    pub gas_price: u128,
    pub nonce: u64,
    pub raw_tx: Bytes,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelegatorResponse {
    signed_raw_tx: Bytes,
}

/// Co-signs transactions so that fees are paid by the delegator.
#[async_trait]
pub trait Delegator: fmt::Debug + Send + Sync {
    /// Returns the co-signed raw transaction.
    async fn sign(&self, request: &DelegatorRequest) -> Result<Bytes, DelegatorError>;
}

/// HTTP [`Delegator`].
#[derive(Debug, Clone)]
pub struct HttpDelegator {
    client: reqwest::Client,
    url: Url,
}

impl HttpDelegator {
    /// Create a new [Self].
    pub fn new(base: Url) -> Result<Self, DelegatorError> {
        let mut url = base.clone();
        url.path_segments_mut().map_err(|_| DelegatorError::BaseUrl(base))?.pop_if_empty().push("sign");
        Ok(Self { client: reqwest::Client::new(), url })
    }
}

#[async_trait]
impl Delegator for HttpDelegator {
    async fn sign(&self, request: &DelegatorRequest) -> Result<Bytes, DelegatorError> {
        let response = self.client.post(self.url.clone()).json(request).send().await?;
        if !response.status().is_success() {
            return Err(DelegatorError::Status(response.status()));
        }
        let body: DelegatorResponse = response.json().await?;
        Ok(body.signed_raw_tx)
    }
}

/// Failure of a single submission trial.
#[derive(thiserror::Error, Debug)]
pub enum SubmitError {
    /// chain rejected or did not confirm the transaction
    #[error(transparent)]
    Chain(#[from] ChainError),
    /// fee delegator failed
    #[error(transparent)]
    Delegator(#[from] DelegatorError),
    /// fee delegation was requested without a delegator
    #[error("fee delegated transaction without a fee delegator")]
    NoDelegator,
    /// transaction could not be signed
    #[error("signing: {0}")]
    Signing(String),
}

/// Signs and broadcasts reporter transactions.
#[derive(Debug)]
pub struct Submitter {
    chain: Arc<dyn ChainClient>,
    delegator: Option<Arc<dyn Delegator>>,
    confirmations: u64,
    receipt_timeout: Duration,
    chain_id: OnceCell<u64>,
}

impl Submitter {
    /// Create a new [Self].
    pub fn new(
        chain: Arc<dyn ChainClient>,
        delegator: Option<Arc<dyn Delegator>>,
        confirmations: u64,
        receipt_timeout: Duration,
    ) -> Self {
        Self { chain, delegator, confirmations, receipt_timeout, chain_id: OnceCell::new() }
    }

    async fn chain_id(&self) -> Result<u64, ChainError> {
        self.chain_id.get_or_try_init(|| self.chain.chain_id()).await.copied()
    }

    /// Sign `job` with `nonce` and send it, waiting for the receipt.
    pub async fn submit(
        &self,
        strategy: TxStrategy,
        wallet: &Wallet,
        job: &ReporterJob,
        nonce: u64,
    ) -> Result<TxOutcome, SubmitError> {
        let chain_id = self.chain_id().await?;
        let gas_price = self.chain.gas_price().await?;

        let tx = TransactionRequest::default()
            .with_from(wallet.address())
            .with_to(job.to)
            .with_input(job.payload.clone())
            .with_nonce(nonce)
            .with_gas_limit(job.gas_limit)
            .with_chain_id(chain_id);

        let tx = match strategy {
            TxStrategy::Legacy | TxStrategy::FeeDelegated => tx.with_gas_price(gas_price),
            TxStrategy::Eip1559 => {
                let priority = self.chain.max_priority_fee_per_gas().await?;
                tx.with_max_priority_fee_per_gas(priority)
                    .with_max_fee_per_gas(gas_price.saturating_add(priority))
            }
        };

        let delegator = match (strategy, &self.delegator) {
            (TxStrategy::FeeDelegated, Some(delegator)) => Some(delegator),
            (TxStrategy::FeeDelegated, None) => return Err(SubmitError::NoDelegator),
            _ => None,
        };

        let raw = sign(tx, wallet.signer()).await?;

        let raw = match delegator {
            Some(delegator) => {
                let request = DelegatorRequest {
                    from: wallet.address(),
                    to: job.to,
                    input: job.payload.clone(),
                    gas: job.gas_limit,
                    value: U256::ZERO,
                    chain_id,
                    gas_price,
                    nonce,
                    raw_tx: raw,
                };
                delegator.sign(&request).await?
            }
            None => raw,
        };

        Ok(self.chain.send_raw_transaction(raw, self.confirmations, self.receipt_timeout).await?)
    }
}

async fn sign(tx: TransactionRequest, signer: &EthereumWallet) -> Result<Bytes, SubmitError> {
    let envelope = tx.build(signer).await.map_err(|e| SubmitError::Signing(e.to_string()))?;
    Ok(envelope.encoded_2718().into())
}
