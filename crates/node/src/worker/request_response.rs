//! Request-response worker: fetches the requested URL, reduces the JSON
//! response and builds the matching `fulfillDataRequest*` call.

use alloy::{
    primitives::{keccak256, Bytes, B256, I256},
    sol_types::SolCall,
};
use orakl_contracts::request_response_coordinator::IRequestResponseCoordinator as Coordinator;
use serde_json::{Number, Value};
use tracing::{debug, info};

use super::WorkerError;
use crate::{
    jobs::{DataRequest, ReporterJob},
    queue::{JobOptions, Queue},
};

/// Decode a CBOR sequence of text strings into key value pairs.
pub fn decode_cbor_pairs(data: &[u8]) -> Result<Vec<(String, String)>, WorkerError> {
    let mut strings = Vec::new();
    let mut rest = data;

    while let Some((&head, tail)) = rest.split_first() {
        if head >> 5 != 3 {
            return Err(WorkerError::Request(format!("unexpected cbor major type in {head:#04x}")));
        }

        let (len, tail) = match head & 0x1f {
            n @ 0..=23 => (n as usize, tail),
            24 => take_len::<1>(tail)?,
            25 => take_len::<2>(tail)?,
            26 => take_len::<4>(tail)?,
            other => {
                return Err(WorkerError::Request(format!("unsupported cbor length {other}")));
            }
        };
        if tail.len() < len {
            return Err(WorkerError::Request("truncated cbor text".to_string()));
        }

        let (text, tail) = tail.split_at(len);
        let text = std::str::from_utf8(text)
            .map_err(|_| WorkerError::Request("cbor text is not utf-8".to_string()))?;
        strings.push(text.to_string());
        rest = tail;
    }

    if strings.len() % 2 != 0 {
        return Err(WorkerError::Request("cbor key without value".to_string()));
    }

    let mut pairs = Vec::with_capacity(strings.len() / 2);
    let mut strings = strings.into_iter();
    while let (Some(key), Some(value)) = (strings.next(), strings.next()) {
        pairs.push((key, value));
    }
    Ok(pairs)
}

fn take_len<const N: usize>(data: &[u8]) -> Result<(usize, &[u8]), WorkerError> {
    if data.len() < N {
        return Err(WorkerError::Request("truncated cbor length".to_string()));
    }
    let (len, rest) = data.split_at(N);
    let len = len.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
    Ok((len, rest))
}

/// One step applied to the fetched JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Reducer {
    /// Walk object keys.
    Path(Vec<String>),
    /// Pick an array element.
    Index(usize),
    Mul(f64),
    Div(f64),
    /// Multiply by `10^n`.
    Pow10(i32),
    Round,
}

impl Reducer {
    /// Parse a request pair. [None] for keys that are not reducers.
    pub fn parse(key: &str, value: &str) -> Result<Option<Self>, WorkerError> {
        let invalid = || WorkerError::Request(format!("invalid {key} reducer argument {value:?}"));
        let reducer = match key {
            "path" => Self::Path(value.split(',').map(|k| k.trim().to_string()).collect()),
            "index" => Self::Index(value.trim().parse().map_err(|_| invalid())?),
            "mul" => Self::Mul(value.trim().parse().map_err(|_| invalid())?),
            "div" => Self::Div(value.trim().parse().map_err(|_| invalid())?),
            "pow10" => Self::Pow10(value.trim().parse().map_err(|_| invalid())?),
            "round" => Self::Round,
            _ => return Ok(None),
        };
        Ok(Some(reducer))
    }

    /// Apply to `value`.
    pub fn apply(&self, value: Value) -> Result<Value, WorkerError> {
        match self {
            Self::Path(keys) => keys.iter().try_fold(value, |value, key| match value {
                Value::Object(mut map) => {
                    map.remove(key).ok_or_else(|| reduce_err(format!("missing key {key}")))
                }
                other => Err(reduce_err(format!("cannot take {key} of {other}"))),
            }),
            Self::Index(index) => match value {
                Value::Array(mut items) if *index < items.len() => Ok(items.swap_remove(*index)),
                other => Err(reduce_err(format!("cannot index {other} at {index}"))),
            },
            Self::Mul(by) => number(as_f64(&value)? * by),
            Self::Div(by) => number(as_f64(&value)? / by),
            Self::Pow10(exp) => number(as_f64(&value)? * 10f64.powi(*exp)),
            Self::Round => {
                let rounded = as_f64(&value)?.round();
                if rounded.abs() < i64::MAX as f64 {
                    Ok(Value::from(rounded as i64))
                } else {
                    number(rounded)
                }
            }
        }
    }
}

fn reduce_err(reason: String) -> WorkerError {
    WorkerError::Reduce(reason)
}

fn as_f64(value: &Value) -> Result<f64, WorkerError> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| reduce_err(format!("{value} is not a number")))
}

fn number(value: f64) -> Result<Value, WorkerError> {
    Number::from_f64(value).map(Value::Number).ok_or_else(|| reduce_err(format!("{value} is not finite")))
}

/// Parsed request definition.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRequestSpec {
    pub url: String,
    pub reducers: Vec<Reducer>,
}

impl DataRequestSpec {
    /// Parse CBOR request data. The first pair must be `get`.
    pub fn decode(data: &[u8]) -> Result<Self, WorkerError> {
        let pairs = decode_cbor_pairs(data)?;
        let mut pairs = pairs.into_iter();
        let url = match pairs.next() {
            Some((key, url)) if key == "get" => url,
            _ => return Err(WorkerError::Request("request does not start with get".to_string())),
        };

        let mut reducers = Vec::new();
        for (key, value) in pairs {
            match Reducer::parse(&key, &value)? {
                Some(reducer) => reducers.push(reducer),
                None => debug!(key, "ignoring unknown request key"),
            }
        }
        Ok(Self { url, reducers })
    }

    /// Apply every reducer in order.
    pub fn reduce(&self, value: Value) -> Result<Value, WorkerError> {
        self.reducers.iter().try_fold(value, |value, reducer| reducer.apply(value))
    }
}

/// Solidity type of the response, identified by the request's job id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr, strum::EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum ResponseType {
    Uint128,
    Int256,
    Bool,
    String,
    Bytes32,
    Bytes,
}

impl ResponseType {
    /// `keccak256(<type name>)`
    pub fn job_id(self) -> B256 {
        keccak256(self.as_ref())
    }

    /// Type whose job id is `job_id`.
    pub fn from_job_id(job_id: B256) -> Result<Self, WorkerError> {
        use strum::IntoEnumIterator;
        Self::iter()
            .find(|ty| ty.job_id() == job_id)
            .ok_or_else(|| WorkerError::Request(format!("unknown response type {job_id}")))
    }

    /// Encode the fulfillment call for `value`.
    pub fn encode(
        self,
        request: &DataRequest,
        value: &Value,
    ) -> Result<Vec<u8>, WorkerError> {
        let rc = Coordinator::RequestCommitment {
            blockNum: request.block_num,
            accId: request.acc_id,
            numSubmission: request.num_submission,
            callbackGasLimit: request.callback_gas_limit,
            sender: request.sender,
        };
        let request_id = request.request_id;
        let is_direct_payment = request.is_direct_payment;
        let invalid = || reduce_err(format!("{value} is not a valid {}", self.as_ref()));

        let encoded = match self {
            Self::Uint128 => Coordinator::fulfillDataRequestUint128Call {
                requestId: request_id,
                response: match value {
                    Value::Number(n) => n.as_u64().map(u128::from),
                    Value::String(s) => s.trim().parse().ok(),
                    _ => None,
                }
                .ok_or_else(invalid)?,
                rc,
                isDirectPayment: is_direct_payment,
            }
            .abi_encode(),
            Self::Int256 => Coordinator::fulfillDataRequestInt256Call {
                requestId: request_id,
                response: match value {
                    Value::Number(n) => n.as_i64().and_then(|i| I256::try_from(i).ok()),
                    Value::String(s) => s.trim().parse().ok(),
                    _ => None,
                }
                .ok_or_else(invalid)?,
                rc,
                isDirectPayment: is_direct_payment,
            }
            .abi_encode(),
            Self::Bool => Coordinator::fulfillDataRequestBoolCall {
                requestId: request_id,
                response: match value {
                    Value::Bool(b) => Some(*b),
                    Value::String(s) => s.trim().parse().ok(),
                    Value::Number(n) => n.as_f64().map(|f| f != 0.0),
                    _ => None,
                }
                .ok_or_else(invalid)?,
                rc,
                isDirectPayment: is_direct_payment,
            }
            .abi_encode(),
            Self::String => Coordinator::fulfillDataRequestStringCall {
                requestId: request_id,
                response: match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                },
                rc,
                isDirectPayment: is_direct_payment,
            }
            .abi_encode(),
            Self::Bytes32 => Coordinator::fulfillDataRequestBytes32Call {
                requestId: request_id,
                response: match value {
                    Value::String(s) => s.parse::<B256>().ok().or_else(|| {
                        (s.len() <= 32).then(|| B256::right_padding_from(s.as_bytes()))
                    }),
                    _ => None,
                }
                .ok_or_else(invalid)?,
                rc,
                isDirectPayment: is_direct_payment,
            }
            .abi_encode(),
            Self::Bytes => Coordinator::fulfillDataRequestBytesCall {
                requestId: request_id,
                response: match value {
                    Value::String(s) if s.starts_with("0x") => s.parse::<Bytes>().ok(),
                    Value::String(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
                    _ => None,
                }
                .ok_or_else(invalid)?,
                rc,
                isDirectPayment: is_direct_payment,
            }
            .abi_encode(),
        };
        Ok(encoded)
    }
}

/// Turns [`DataRequest`]s into fulfillment reporter jobs.
#[derive(Debug)]
pub struct RequestResponseWorker {
    client: reqwest::Client,
    reporter_queue: Queue<ReporterJob>,
    gas_minimum: u64,
}

impl RequestResponseWorker {
    /// Create a new [Self].
    pub fn new(reporter_queue: Queue<ReporterJob>, gas_minimum: u64) -> Self {
        Self { client: reqwest::Client::new(), reporter_queue, gas_minimum }
    }

    async fn fetch(&self, url: &str) -> Result<Value, WorkerError> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }

    /// Fetch, reduce and enqueue the fulfillment for `request` under `job_id`.
    pub async fn process(
        &self,
        job_id: &str,
        request: &DataRequest,
    ) -> Result<ReporterJob, WorkerError> {
        let response_type = ResponseType::from_job_id(request.job_id)?;
        let spec = DataRequestSpec::decode(&request.data)?;

        let fetched = self.fetch(&spec.url).await?;
        let value = spec.reduce(fetched)?;
        let payload = response_type.encode(request, &value)?;

        let gas_limit = u64::from(request.callback_gas_limit) + self.gas_minimum;
        let report = ReporterJob::new(request.callback_address, payload.into(), gas_limit);
        let options = JobOptions { remove_on_complete: false, ..JobOptions::with_id(job_id) };
        self.reporter_queue.add(report.clone(), options)?;

        info!(
            request_id = %request.request_id,
            response_type = response_type.as_ref(),
            %value,
            "fulfillment enqueued"
        );
        Ok(report)
    }
}
