//! Relay data API client
//!
//! Pages backward through `proposer_payload_delivered` by slot cursor.
//! Transient failures are retried with exponential backoff; once the attempt
//! ceiling is hit the client returns an empty page so the walker can apply
//! its own jump-back policy instead of stalling.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::FetchError;
use crate::clock::Slot;
use crate::config::{RelayInfo, RetryPolicy};
use crate::models::RelayPayload;

pub const PAYLOAD_DELIVERED_PATH: &str = "/relay/v1/data/bidtraces/proposer_payload_delivered";

/// A paginated source of relay payloads.
#[async_trait]
pub trait PayloadSource: Send + Sync {
    /// Stable identity, used as the store key and checkpoint source.
    fn source_id(&self) -> &str;

    /// Payloads at or before `cursor`, newest first, at most `limit`.
    /// Empty when the source has nothing there (or retries were exhausted).
    async fn fetch_page(&self, cursor: Slot, limit: u32) -> Result<Vec<RelayPayload>, FetchError>;

    /// The payload delivered for one block, if this relay delivered it.
    async fn fetch_by_block(&self, block_number: u64) -> Result<Option<RelayPayload>, FetchError>;
}

/// HTTP client for one relay. Each instance owns its own connection pool.
pub struct RelayClient {
    info: RelayInfo,
    client: Client,
    policy: RetryPolicy,
}

impl RelayClient {
    pub fn new(info: RelayInfo, policy: RetryPolicy) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(policy.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(concat!("mevwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client for {}: {}", info.id, e))?;

        Ok(Self {
            info,
            client,
            policy,
        })
    }

    pub fn info(&self) -> &RelayInfo {
        &self.info
    }

    #[inline]
    fn url(&self) -> String {
        format!("{}{}", self.info.url.trim_end_matches('/'), PAYLOAD_DELIVERED_PATH)
    }

    async fn request_once(&self, query: &[(&str, String)]) -> Result<Vec<RelayPayload>, FetchError> {
        let resp = self
            .client
            .get(self.url())
            .query(query)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let body = resp.bytes().await.map_err(FetchError::from_reqwest)?;
        let value: Value = serde_json::from_slice(&body)
            .map_err(|e| FetchError::Malformed(format!("invalid JSON: {}", e)))?;
        let items = value
            .as_array()
            .ok_or_else(|| FetchError::Malformed("expected a JSON array".to_string()))?;

        Ok(self.parse_records(items))
    }

    /// Parse, skipping malformed records, and dedupe by slot keeping the first.
    fn parse_records(&self, items: &[Value]) -> Vec<RelayPayload> {
        let mut seen: HashSet<Slot> = HashSet::with_capacity(items.len());
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match RelayPayload::from_relay_json(&self.info.id, item) {
                Ok(p) => {
                    if seen.insert(p.slot) {
                        out.push(p);
                    }
                }
                Err(e) => {
                    warn!(relay = %self.info.id, error = %e, "Skipping malformed payload record");
                }
            }
        }
        if out.len() < items.len() {
            debug!(
                relay = %self.info.id,
                raw = items.len(),
                kept = out.len(),
                "Dropped duplicate or malformed records"
            );
        }
        out
    }

    async fn request_with_retry(
        &self,
        query: &[(&str, String)],
    ) -> Result<Vec<RelayPayload>, FetchError> {
        let mut attempt: u32 = 0;
        loop {
            match self.request_once(query).await {
                Ok(records) => return Ok(records),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if attempt >= self.policy.max_attempts {
                        warn!(
                            relay = %self.info.id,
                            attempts = attempt,
                            error = %e,
                            "Retry ceiling reached, returning empty page"
                        );
                        return Ok(Vec::new());
                    }
                    let delay = self.policy.backoff(attempt - 1);
                    warn!(
                        relay = %self.info.id,
                        attempt,
                        error = %e,
                        "Transient relay error, retrying in {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl PayloadSource for RelayClient {
    fn source_id(&self) -> &str {
        &self.info.id
    }

    async fn fetch_page(&self, cursor: Slot, limit: u32) -> Result<Vec<RelayPayload>, FetchError> {
        let limit = self.info.page_limit(limit);
        let query = [("cursor", cursor.to_string()), ("limit", limit.to_string())];
        let page = self.request_with_retry(&query).await?;
        debug!(relay = %self.info.id, cursor, limit, records = page.len(), "Fetched page");
        Ok(page)
    }

    async fn fetch_by_block(&self, block_number: u64) -> Result<Option<RelayPayload>, FetchError> {
        let query = [("block_number", block_number.to_string())];
        let mut records = self.request_with_retry(&query).await?;
        records.retain(|p| p.block_number.map_or(true, |n| n == block_number));
        Ok(records.into_iter().next())
    }
}
