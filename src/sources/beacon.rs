//! Beacon API client: latest finalized slot.

use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

use super::FetchError;
use crate::clock::Slot;

const FINALIZED_HEADER_PATH: &str = "/eth/v1/beacon/headers/finalized";

pub struct BeaconClient {
    base_url: String,
    client: Client,
}

impl BeaconClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build beacon client: {}", e))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Slot of the latest finalized block header.
    pub async fn finalized_slot(&self) -> Result<Slot, FetchError> {
        let url = format!("{}{}", self.base_url, FINALIZED_HEADER_PATH);
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }
        let body: Value = resp.json().await.map_err(FetchError::from_reqwest)?;
        parse_finalized_slot(&body)
    }
}

/// `data.header.message.slot`, a decimal string.
fn parse_finalized_slot(body: &Value) -> Result<Slot, FetchError> {
    let slot = &body["data"]["header"]["message"]["slot"];
    match slot {
        Value::String(s) => s
            .parse::<Slot>()
            .map_err(|_| FetchError::Malformed(format!("invalid slot: {}", s))),
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| FetchError::Malformed(format!("invalid slot: {}", n))),
        _ => Err(FetchError::Malformed(
            "finalized header without slot".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_finalized_slot() {
        let body = json!({
            "execution_optimistic": false,
            "finalized": true,
            "data": {
                "root": "0x1",
                "canonical": true,
                "header": {"message": {"slot": "8626176", "proposer_index": "1"}}
            }
        });
        assert_eq!(parse_finalized_slot(&body), Ok(8_626_176));
        assert!(parse_finalized_slot(&json!({"data": {}})).is_err());
    }
}
