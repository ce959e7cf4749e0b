//! The source chain as seen from this daemon: a couple of read RPCs to walk
//! blocks and their contract events, one write call to hand in signatures,
//! and the schema of the two notifications addressed to us.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use std::{sync::Arc, time::Duration};

/// Version of the notification layout decoded below. The contract emits
/// heterogeneous positional arrays; the field indices are part of the wire
/// contract and must only change together with this number.
pub const NOTIFY_SCHEMA_VERSION: u32 = 1;

/// Discriminator of a request that custodians sign a pending transaction.
pub const SIGN_REQUEST_KEY: &str = "makeBtcTx";
/// Discriminator of the announcement that a signing gathered its quorum.
pub const SIGN_COMPLETE_KEY: &str = "btcTxToRelay";

// Field positions within a notification's states array, layout version 1.
const REQ_BINDING_KEY_IDX: usize = 1;
const REQ_RAW_TX_IDX: usize = 2;
const REQ_AMOUNTS_IDX: usize = 3;
const COMPLETE_RAW_TX_IDX: usize = 3;
const COMPLETE_BINDING_KEY_IDX: usize = 5;

#[derive(Debug)]
pub enum ChainError {
    /// The RPC didn't get through (connection, timeout, HTTP failure).
    /// The only error class worth retrying.
    Transport(String),
    /// The node answered with an error envelope.
    Rpc { code: i64, desc: String },
    /// The node answered something we can't make sense of.
    BadResponse(String),
}

impl ChainError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Transport(_))
    }
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ChainError::Transport(e) => write!(f, "Chain transport error: '{}'", e),
            ChainError::Rpc { code, desc } => {
                write!(f, "Chain RPC error {}: '{}'", code, desc)
            }
            ChainError::BadResponse(e) => write!(f, "Invalid chain response: '{}'", e),
        }
    }
}

impl std::error::Error for ChainError {}

/// One contract event of a block, carrying any number of notifications.
#[derive(Debug, Clone, Deserialize)]
pub struct ContractEvent {
    #[serde(rename = "TxHash")]
    pub tx_hash: String,
    #[serde(rename = "State", default)]
    pub state: u8,
    #[serde(rename = "Notify", default)]
    pub notifications: Vec<NotifyEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyEntry {
    #[serde(rename = "ContractAddress", default)]
    pub contract_address: String,
    #[serde(rename = "States", default)]
    pub states: Value,
}

#[derive(PartialEq, Eq, Debug)]
pub struct SchemaError(pub String);

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Notification schema error: {}", self.0)
    }
}

impl std::error::Error for SchemaError {}

/// A notification decoded against the versioned layout.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A pending transaction custodians are asked to sign, with the
    /// per-input spent amounts needed for witness signature hashes.
    SignRequest {
        binding_key: String,
        raw_tx: String,
        amounts: Vec<u64>,
    },
    /// A previously requested signing gathered enough signatures.
    SignComplete { binding_key: String, raw_tx: String },
}

fn str_field(states: &[Value], index: usize) -> Result<String, SchemaError> {
    states
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SchemaError(format!("no string at position {}", index)))
}

fn amount_field(value: &Value) -> Option<u64> {
    // Chains encode amounts as JSON numbers; tolerate the float form some
    // encoders produce for large integers.
    value.as_u64().or_else(|| value.as_f64().map(|f| f as u64))
}

impl Notification {
    /// Decode one notification. `Ok(None)` means the notification is not
    /// addressed to this tool at all (unknown discriminator or not even an
    /// array); an `Err` means it matched a known discriminator but its
    /// payload doesn't follow the layout, which callers log and skip.
    pub fn from_states(states: &Value) -> Result<Option<Notification>, SchemaError> {
        let states = match states.as_array() {
            Some(states) => states,
            None => return Ok(None),
        };
        let discriminator = match states.get(0).and_then(Value::as_str) {
            Some(name) => name,
            None => return Ok(None),
        };

        match discriminator {
            SIGN_REQUEST_KEY => {
                let binding_key = str_field(states, REQ_BINDING_KEY_IDX)?;
                let raw_tx = str_field(states, REQ_RAW_TX_IDX)?;
                let amounts = states
                    .get(REQ_AMOUNTS_IDX)
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        SchemaError(format!("no amount list at position {}", REQ_AMOUNTS_IDX))
                    })?
                    .iter()
                    .map(|v| {
                        amount_field(v)
                            .ok_or_else(|| SchemaError("non-numeric amount".to_string()))
                    })
                    .collect::<Result<Vec<u64>, SchemaError>>()?;

                Ok(Some(Notification::SignRequest {
                    binding_key,
                    raw_tx,
                    amounts,
                }))
            }
            SIGN_COMPLETE_KEY => {
                let raw_tx = str_field(states, COMPLETE_RAW_TX_IDX)?;
                let binding_key = str_field(states, COMPLETE_BINDING_KEY_IDX)?;

                Ok(Some(Notification::SignComplete {
                    binding_key,
                    raw_tx,
                }))
            }
            _ => Ok(None),
        }
    }
}

/// What the observer and signer need from the source chain. A trait so
/// workers can be exercised against a test double.
pub trait SourceChain: Send + Sync {
    /// The current block height.
    fn block_height(&self) -> Result<u32, ChainError>;

    /// All contract events of the block at this height.
    fn events_at(&self, height: u32) -> Result<Vec<ContractEvent>, ChainError>;

    /// Hand our signatures to the threshold-collection contract. Returns the
    /// source-chain transaction id of the submission.
    fn submit_signatures(
        &self,
        binding_key: &str,
        tx_hash: &[u8],
        address: &str,
        signatures: &[Vec<u8>],
    ) -> Result<String, ChainError>;
}

impl<C: SourceChain + ?Sized> SourceChain for Arc<C> {
    fn block_height(&self) -> Result<u32, ChainError> {
        (**self).block_height()
    }

    fn events_at(&self, height: u32) -> Result<Vec<ContractEvent>, ChainError> {
        (**self).events_at(height)
    }

    fn submit_signatures(
        &self,
        binding_key: &str,
        tx_hash: &[u8],
        address: &str,
        signatures: &[Vec<u8>],
    ) -> Result<String, ChainError> {
        (**self).submit_signatures(binding_key, tx_hash, address, signatures)
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u64,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    error: i64,
    #[serde(default)]
    desc: String,
    #[serde(default)]
    result: Value,
}

/// The JSON-RPC client used in production.
#[derive(Debug, Clone)]
pub struct HttpSourceChain {
    url: String,
    client: reqwest::blocking::Client,
}

impl HttpSourceChain {
    pub fn new(url: String) -> Result<Self, ChainError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| ChainError::Transport(e.to_string()))?;

        Ok(HttpSourceChain { url, client })
    }

    fn call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: 1,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| ChainError::Transport(e.to_string()))?;

        let response: RpcResponse = response
            .json()
            .map_err(|e| ChainError::BadResponse(e.to_string()))?;
        if response.error != 0 {
            return Err(ChainError::Rpc {
                code: response.error,
                desc: response.desc,
            });
        }

        Ok(response.result)
    }
}

impl SourceChain for HttpSourceChain {
    fn block_height(&self) -> Result<u32, ChainError> {
        let result = self.call("getblockcount", Value::Array(vec![]))?;
        result
            .as_u64()
            .map(|h| h as u32)
            .ok_or_else(|| ChainError::BadResponse(format!("non-numeric height: {}", result)))
    }

    fn events_at(&self, height: u32) -> Result<Vec<ContractEvent>, ChainError> {
        let result = self.call("getsmartcodeeventbyheight", serde_json::json!([height]))?;
        if result.is_null() {
            // An empty block.
            return Ok(vec![]);
        }
        serde_json::from_value(result).map_err(|e| ChainError::BadResponse(e.to_string()))
    }

    fn submit_signatures(
        &self,
        binding_key: &str,
        tx_hash: &[u8],
        address: &str,
        signatures: &[Vec<u8>],
    ) -> Result<String, ChainError> {
        let signatures: Vec<String> = signatures.iter().map(hex::encode).collect();
        let result = self.call(
            "btcmultisign",
            serde_json::json!([binding_key, hex::encode(tx_hash), address, signatures]),
        )?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ChainError::BadResponse(format!("non-string txid: {}", result)))
    }
}
