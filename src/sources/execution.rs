//! Execution-layer JSON-RPC client
//!
//! `eth_getBlockByNumber` for full blocks and a batched pair of
//! `eth_getBalance` calls for the proposer balance before/after a block.

use async_trait::async_trait;
use num_bigint::BigUint;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use super::FetchError;
use crate::config::RetryPolicy;
use crate::models::{parse_hex_biguint, to_hex_quantity, BlockRecord};

#[async_trait]
pub trait ExecutionSource: Send + Sync {
    /// Full block by number, transactions as hashes.
    async fn get_block(&self, number: u64) -> Result<BlockRecord, FetchError>;

    /// Balance of `address` at the end of `before_block` and `after_block`,
    /// fetched in one batch.
    async fn get_balance_pair(
        &self,
        address: &str,
        before_block: u64,
        after_block: u64,
    ) -> Result<(BigUint, BigUint), FetchError>;
}

pub struct ExecutionRpcClient {
    url: String,
    client: Client,
    policy: RetryPolicy,
}

impl ExecutionRpcClient {
    pub fn new(url: &str, policy: RetryPolicy) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(policy.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(16)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build execution RPC client: {}", e))?;

        Ok(Self {
            url: url.to_string(),
            client,
            policy,
        })
    }

    async fn post_once(&self, body: &Value) -> Result<Value, FetchError> {
        let resp = self
            .client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }
        resp.json::<Value>().await.map_err(FetchError::from_reqwest)
    }

    async fn post(&self, body: &Value) -> Result<Value, FetchError> {
        let mut attempt: u32 = 0;
        loop {
            match self.post_once(body).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt + 1 < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    attempt += 1;
                    warn!(attempt, error = %e, "Execution RPC error, retrying in {:?}", delay);
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn rpc_request(id: u64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

/// Unwrap a JSON-RPC response envelope into its `result`.
fn rpc_result(envelope: &Value) -> Result<&Value, FetchError> {
    if let Some(err) = envelope.get("error") {
        return Err(FetchError::Malformed(format!("RPC error: {}", err)));
    }
    envelope
        .get("result")
        .ok_or_else(|| FetchError::Malformed("response without result".to_string()))
}

fn parse_balance(envelope: &Value) -> Result<BigUint, FetchError> {
    let result = rpc_result(envelope)?;
    result
        .as_str()
        .and_then(parse_hex_biguint)
        .ok_or_else(|| FetchError::Malformed(format!("invalid balance: {}", result)))
}

#[async_trait]
impl ExecutionSource for ExecutionRpcClient {
    async fn get_block(&self, number: u64) -> Result<BlockRecord, FetchError> {
        let req = rpc_request(
            1,
            "eth_getBlockByNumber",
            json!([to_hex_quantity(number), false]),
        );
        let envelope = self.post(&req).await?;
        let result = rpc_result(&envelope)?;
        if result.is_null() {
            return Err(FetchError::Malformed(format!("block {} not found", number)));
        }
        BlockRecord::from_rpc_json(result).map_err(|e| FetchError::Malformed(e.to_string()))
    }

    async fn get_balance_pair(
        &self,
        address: &str,
        before_block: u64,
        after_block: u64,
    ) -> Result<(BigUint, BigUint), FetchError> {
        let batch = json!([
            rpc_request(0, "eth_getBalance", json!([address, to_hex_quantity(before_block)])),
            rpc_request(1, "eth_getBalance", json!([address, to_hex_quantity(after_block)])),
        ]);
        let response = self.post(&batch).await?;
        let items = response
            .as_array()
            .ok_or_else(|| FetchError::Malformed("batch response is not an array".to_string()))?;

        // batch responses may come back in any order
        let by_id = |id: u64| {
            items
                .iter()
                .find(|item| item.get("id").and_then(Value::as_u64) == Some(id))
                .ok_or_else(|| FetchError::Malformed(format!("batch response missing id {}", id)))
        };
        let before = parse_balance(by_id(0)?)?;
        let after = parse_balance(by_id(1)?)?;
        Ok((before, after))
    }
}
