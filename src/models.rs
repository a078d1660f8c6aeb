//! Record types shared by the live pipeline, the backfill walker and the store.
//!
//! Raw JSON from relays and execution nodes is mapped into these types by an
//! explicit parsing step that fails closed: a missing or unparseable required
//! field yields a `ParseError` instead of a half-filled record.

use num_bigint::{BigInt, BigUint};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::clock::Slot;

// =============================================================================
// PARSE ERRORS
// =============================================================================

/// Reason a raw JSON object could not be turned into a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    NotObject,
    /// Missing or wrongly typed field, as reported by serde.
    Decode(String),
    InvalidField { field: &'static str, value: String },
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotObject => write!(f, "expected a JSON object"),
            Self::Decode(msg) => write!(f, "{}", msg),
            Self::InvalidField { field, value } => {
                write!(f, "invalid value for '{}': {}", field, value)
            }
        }
    }
}

impl std::error::Error for ParseError {}

impl From<serde_json::Error> for ParseError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

// =============================================================================
// SERDE HELPERS
// =============================================================================

/// Decimal quantity sent either as a JSON string or a number.
fn de_dec_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s.trim().to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected decimal string or number, got {}",
            other
        ))),
    }
}

fn de_dec_string_opt<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected decimal string or number, got {}",
            other
        ))),
    }
}

fn parse_dec<T: std::str::FromStr>(field: &'static str, raw: &str) -> Result<T, ParseError> {
    raw.parse::<T>().map_err(|_| ParseError::InvalidField {
        field,
        value: raw.to_string(),
    })
}

fn parse_hex(field: &'static str, raw: &str) -> Result<u64, ParseError> {
    parse_hex_u64(raw).ok_or_else(|| ParseError::InvalidField {
        field,
        value: raw.to_string(),
    })
}

fn require_object(obj: &Value) -> Result<(), ParseError> {
    if obj.is_object() {
        Ok(())
    } else {
        Err(ParseError::NotObject)
    }
}

/// Parse a `0x`-prefixed JSON-RPC quantity.
pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// Parse a `0x`-prefixed JSON-RPC quantity of arbitrary width (wei balances).
pub fn parse_hex_biguint(s: &str) -> Option<BigUint> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return None;
    }
    BigUint::parse_bytes(digits.as_bytes(), 16)
}

/// Encode a block number as a JSON-RPC quantity.
#[inline]
pub fn to_hex_quantity(n: u64) -> String {
    format!("0x{:x}", n)
}

/// The zero address some clients report for headers without a fee recipient.
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

fn normalize_address(addr: Option<String>) -> Option<String> {
    addr.map(|a| a.to_ascii_lowercase())
        .filter(|a| a != ZERO_ADDRESS && a.len() > 2)
}

// =============================================================================
// BLOCK HEADER (newHeads notification)
// =============================================================================

/// Wire shape of a `newHeads` notification result.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawHeader {
    pub number: String,
    pub hash: String,
    #[serde(default)]
    pub parent_hash: Option<String>,
    #[serde(default)]
    pub miner: Option<String>,
    pub timestamp: String,
}

/// Header delivered by an `eth_subscribe(["newHeads"])` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub miner: Option<String>,
    pub timestamp: i64,
}

impl TryFrom<RawHeader> for BlockHeader {
    type Error = ParseError;

    fn try_from(raw: RawHeader) -> Result<Self, Self::Error> {
        Ok(Self {
            number: parse_hex("number", &raw.number)?,
            hash: raw.hash,
            parent_hash: raw.parent_hash.unwrap_or_default(),
            miner: normalize_address(raw.miner),
            timestamp: parse_hex("timestamp", &raw.timestamp)? as i64,
        })
    }
}

impl BlockHeader {
    pub fn from_json(obj: &Value) -> Result<Self, ParseError> {
        require_object(obj)?;
        RawHeader::deserialize(obj)?.try_into()
    }
}

// =============================================================================
// BLOCK RECORD
// =============================================================================

/// Wire shape of an `eth_getBlockByNumber` result (hashes only).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBlock {
    pub number: String,
    pub hash: String,
    pub parent_hash: String,
    #[serde(default)]
    pub miner: Option<String>,
    pub gas_used: String,
    pub gas_limit: String,
    #[serde(default)]
    pub base_fee_per_gas: Option<String>,
    #[serde(default)]
    pub extra_data: Option<String>,
    pub timestamp: String,
    pub transactions: Vec<Value>,
}

/// Execution block, keyed by number. Reorgs overwrite in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub miner: Option<String>,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub base_fee_per_gas: Option<u64>,
    /// Hex-encoded extra data, as returned by the node.
    pub extra_data: String,
    pub timestamp: i64,
    pub transaction_count: u64,
}

impl TryFrom<RawBlock> for BlockRecord {
    type Error = ParseError;

    fn try_from(raw: RawBlock) -> Result<Self, Self::Error> {
        let base_fee_per_gas = match raw.base_fee_per_gas.as_deref() {
            Some(fee) => Some(parse_hex("baseFeePerGas", fee)?),
            None => None,
        };
        Ok(Self {
            number: parse_hex("number", &raw.number)?,
            hash: raw.hash,
            parent_hash: raw.parent_hash,
            miner: normalize_address(raw.miner),
            gas_used: parse_hex("gasUsed", &raw.gas_used)?,
            gas_limit: parse_hex("gasLimit", &raw.gas_limit)?,
            base_fee_per_gas,
            extra_data: raw
                .extra_data
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "0x".to_string()),
            timestamp: parse_hex("timestamp", &raw.timestamp)? as i64,
            transaction_count: raw.transactions.len() as u64,
        })
    }
}

impl BlockRecord {
    /// Parse an `eth_getBlockByNumber` result.
    pub fn from_rpc_json(obj: &Value) -> Result<Self, ParseError> {
        require_object(obj)?;
        RawBlock::deserialize(obj)?.try_into()
    }
}

// =============================================================================
// RELAY PAYLOAD RECORD
// =============================================================================

/// Wire shape of one `proposer_payload_delivered` entry. Quantities arrive
/// as decimal strings, occasionally as numbers.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRelayPayload {
    #[serde(deserialize_with = "de_dec_string")]
    pub slot: String,
    #[serde(default, deserialize_with = "de_dec_string_opt")]
    pub block_number: Option<String>,
    pub block_hash: String,
    #[serde(default)]
    pub parent_hash: Option<String>,
    pub builder_pubkey: String,
    pub proposer_pubkey: String,
    pub proposer_fee_recipient: String,
    #[serde(deserialize_with = "de_dec_string")]
    pub gas_limit: String,
    #[serde(deserialize_with = "de_dec_string")]
    pub gas_used: String,
    #[serde(deserialize_with = "de_dec_string")]
    pub value: String,
    #[serde(default, deserialize_with = "de_dec_string_opt")]
    pub num_tx: Option<String>,
}

/// A "payload delivered" entry, keyed by `(slot, relay)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPayload {
    pub relay: String,
    pub slot: Slot,
    pub block_number: Option<u64>,
    pub block_hash: String,
    pub parent_hash: String,
    pub builder_pubkey: String,
    pub proposer_pubkey: String,
    pub proposer_fee_recipient: String,
    pub gas_limit: u64,
    pub gas_used: u64,
    /// Payment to the proposer, in wei.
    pub value: BigUint,
    pub num_tx: Option<u64>,
}

impl RelayPayload {
    /// Attach the relay identity to a decoded wire entry.
    pub fn from_raw(relay: &str, raw: RawRelayPayload) -> Result<Self, ParseError> {
        let block_number = match raw.block_number.as_deref() {
            Some(n) => Some(parse_dec("block_number", n)?),
            None => None,
        };
        let num_tx = match raw.num_tx.as_deref() {
            Some(n) => Some(parse_dec("num_tx", n)?),
            None => None,
        };
        Ok(Self {
            relay: relay.to_string(),
            slot: parse_dec("slot", &raw.slot)?,
            block_number,
            block_hash: raw.block_hash.to_ascii_lowercase(),
            parent_hash: raw.parent_hash.unwrap_or_default().to_ascii_lowercase(),
            builder_pubkey: raw.builder_pubkey.to_ascii_lowercase(),
            proposer_pubkey: raw.proposer_pubkey.to_ascii_lowercase(),
            proposer_fee_recipient: raw.proposer_fee_recipient.to_ascii_lowercase(),
            gas_limit: parse_dec("gas_limit", &raw.gas_limit)?,
            gas_used: parse_dec("gas_used", &raw.gas_used)?,
            value: parse_dec("value", &raw.value)?,
            num_tx,
        })
    }

    /// Parse one element of a relay `proposer_payload_delivered` response.
    pub fn from_relay_json(relay: &str, obj: &Value) -> Result<Self, ParseError> {
        require_object(obj)?;
        Self::from_raw(relay, RawRelayPayload::deserialize(obj)?)
    }

    /// Natural key.
    #[inline]
    pub fn key(&self) -> (Slot, &str) {
        (self.slot, self.relay.as_str())
    }
}

// =============================================================================
// DERIVED ROWS
// =============================================================================

/// Proposer balance change across one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceDelta {
    pub block_number: u64,
    pub address: String,
    pub balance_before: BigUint,
    pub balance_after: BigUint,
    pub delta: BigInt,
}

impl BalanceDelta {
    pub fn new(block_number: u64, address: String, before: BigUint, after: BigUint) -> Self {
        let delta = BigInt::from(after.clone()) - BigInt::from(before.clone());
        Self {
            block_number,
            address,
            balance_before: before,
            balance_after: after,
            delta,
        }
    }
}

/// Per-block analytics row computed from one enrichment run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSummary {
    pub block_number: u64,
    pub block_hash: String,
    pub slot: Slot,
    pub timestamp: i64,
    pub miner: Option<String>,
    pub builder_name: String,
    pub transaction_count: u64,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub balance_before: BigUint,
    pub balance_after: BigUint,
    pub balance_delta: BigInt,
    pub relays: Vec<String>,
    pub max_payment_value: Option<BigUint>,
    pub proposer_fee_recipient: Option<String>,
    /// No relay reported delivering this block.
    pub is_vanilla: bool,
}

/// Covered range for one source, in slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoveredRange {
    pub from: Slot,
    pub to: Slot,
}

/// Persisted checkpoint row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source: String,
    pub from_slot: Slot,
    pub to_slot: Slot,
    pub updated_at: i64,
}

/// Aggregate row: records stored for one source on one UTC day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCount {
    pub source: String,
    pub day: chrono::NaiveDate,
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn relay_json() -> Value {
        json!({
            "slot": "7200123",
            "parent_hash": "0xAA",
            "block_hash": "0xBB",
            "builder_pubkey": "0xb1",
            "proposer_pubkey": "0xp1",
            "proposer_fee_recipient": "0xFEE",
            "gas_limit": "30000000",
            "gas_used": "12345678",
            "value": "123456789012345678901",
            "block_number": "18000000",
            "num_tx": "150"
        })
    }

    #[test]
    fn test_parse_relay_payload() {
        let p = RelayPayload::from_relay_json("flashbots", &relay_json()).unwrap();
        assert_eq!(p.slot, 7_200_123);
        assert_eq!(p.block_number, Some(18_000_000));
        assert_eq!(p.block_hash, "0xbb");
        assert_eq!(p.proposer_fee_recipient, "0xfee");
        assert_eq!(p.value, "123456789012345678901".parse::<BigUint>().unwrap());
        assert_eq!(p.num_tx, Some(150));
        assert_eq!(p.key(), (7_200_123, "flashbots"));
    }

    #[test]
    fn test_relay_payload_missing_field_fails_closed() {
        let mut v = relay_json();
        v.as_object_mut().unwrap().remove("value");
        let err = RelayPayload::from_relay_json("r", &v).unwrap_err();
        assert!(matches!(&err, ParseError::Decode(msg) if msg.contains("value")), "{}", err);

        let mut v = relay_json();
        v["slot"] = json!("not-a-number");
        assert!(matches!(
            RelayPayload::from_relay_json("r", &v),
            Err(ParseError::InvalidField { field: "slot", .. })
        ));
    }

    #[test]
    fn test_relay_payload_optional_fields() {
        let mut v = relay_json();
        v.as_object_mut().unwrap().remove("num_tx");
        v["block_number"] = Value::Null;
        let p = RelayPayload::from_relay_json("r", &v).unwrap();
        assert_eq!(p.num_tx, None);
        assert_eq!(p.block_number, None);
    }

    #[test]
    fn test_parse_header() {
        let v = json!({
            "number": "0x112a880",
            "hash": "0xabc",
            "parentHash": "0xdef",
            "miner": "0x95222290DD7278Aa3Ddd389Cc1E1d165CC4BAfe5",
            "timestamp": "0x64f5e1a3"
        });
        let h = BlockHeader::from_json(&v).unwrap();
        assert_eq!(h.number, 18_000_000);
        assert_eq!(h.timestamp, 0x64f5e1a3);
        assert_eq!(
            h.miner.as_deref(),
            Some("0x95222290dd7278aa3ddd389cc1e1d165cc4bafe5")
        );
    }

    #[test]
    fn test_header_zero_miner_is_none() {
        let v = json!({
            "number": "0x1",
            "hash": "0xabc",
            "miner": ZERO_ADDRESS,
            "timestamp": "0x1"
        });
        assert_eq!(BlockHeader::from_json(&v).unwrap().miner, None);
    }

    #[test]
    fn test_parse_rpc_block() {
        let v = json!({
            "number": "0x10",
            "hash": "0xh",
            "parentHash": "0xp",
            "miner": "0xm1",
            "gasUsed": "0x5208",
            "gasLimit": "0x1c9c380",
            "baseFeePerGas": "0x3b9aca00",
            "extraData": "0x6265617665726275696c642e6f7267",
            "timestamp": "0x6500",
            "transactions": ["0x1", "0x2", "0x3"]
        });
        let b = BlockRecord::from_rpc_json(&v).unwrap();
        assert_eq!(b.number, 16);
        assert_eq!(b.gas_used, 21_000);
        assert_eq!(b.base_fee_per_gas, Some(1_000_000_000));
        assert_eq!(b.transaction_count, 3);
        assert_eq!(b.miner.as_deref(), Some("0xm1"));
    }

    #[test]
    fn test_rpc_block_without_transactions_fails() {
        let v = json!({"number": "0x10", "hash": "0xh", "parentHash": "0xp",
            "gasUsed": "0x0", "gasLimit": "0x0", "timestamp": "0x0"});
        let err = BlockRecord::from_rpc_json(&v).unwrap_err();
        assert!(matches!(&err, ParseError::Decode(msg) if msg.contains("transactions")), "{}", err);
    }

    #[test]
    fn test_relay_payload_accepts_numeric_quantities() {
        let mut v = relay_json();
        v["slot"] = json!(7_200_123u64);
        v["gas_used"] = json!(12_345_678u64);
        v["num_tx"] = json!(150);
        let p = RelayPayload::from_relay_json("r", &v).unwrap();
        assert_eq!(p.slot, 7_200_123);
        assert_eq!(p.gas_used, 12_345_678);
        assert_eq!(p.num_tx, Some(150));

        v["value"] = json!(true);
        assert!(matches!(
            RelayPayload::from_relay_json("r", &v),
            Err(ParseError::Decode(_))
        ));
        assert_eq!(
            RelayPayload::from_relay_json("r", &json!(["x"])).unwrap_err(),
            ParseError::NotObject
        );
    }

    #[test]
    fn test_bad_hex_quantity_is_invalid_field() {
        let v = json!({"number": "0xzz", "hash": "0xabc", "timestamp": "0x1"});
        assert!(matches!(
            BlockHeader::from_json(&v),
            Err(ParseError::InvalidField { field: "number", .. })
        ));
    }

    #[test]
    fn test_balance_delta_can_be_negative() {
        let d = BalanceDelta::new(5, "0xa".into(), BigUint::from(100u32), BigUint::from(40u32));
        assert_eq!(d.delta, BigInt::from(-60));
    }

    #[test]
    fn test_hex_helpers() {
        assert_eq!(parse_hex_u64("0x0"), Some(0));
        assert_eq!(parse_hex_u64("0x"), None);
        assert_eq!(to_hex_quantity(255), "0xff");
        assert_eq!(
            parse_hex_biguint("0xde0b6b3a7640000"),
            Some(BigUint::from(1_000_000_000_000_000_000u64))
        );
    }
}
