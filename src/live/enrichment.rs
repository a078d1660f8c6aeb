//! Per-block enrichment: four ordered stages, each using only what earlier
//! stages of the same task fetched.
//!
//! 1. full block from the execution node (abort on failure)
//! 2. proposer balance before/after the block
//! 3. delayed relay poll for payloads delivered for the block
//! 4. derived summary row, built in memory

use anyhow::{Context, Result};
use futures_util::future::join_all;
use num_bigint::{BigInt, BigUint};
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::builder_names::builder_name_from_extra_data;
use crate::clock::SlotClock;
use crate::config::LiveConfig;
use crate::models::{BalanceDelta, BlockHeader, BlockRecord, BlockSummary, RelayPayload};
use crate::sources::{ExecutionSource, PayloadSource};
use crate::storage::RecordStore;

/// Everything an enrichment task needs, created once at startup.
pub struct EnrichmentContext {
    pub execution: Arc<dyn ExecutionSource>,
    pub relays: Vec<Arc<dyn PayloadSource>>,
    pub store: Arc<dyn RecordStore>,
    pub clock: SlotClock,
    pub config: LiveConfig,
}

/// Stage 1.
async fn fetch_block(ctx: &EnrichmentContext, header: &BlockHeader) -> Result<BlockRecord> {
    let block = ctx
        .execution
        .get_block(header.number)
        .await
        .with_context(|| format!("Failed to fetch block {}", header.number))?;
    if block.hash != header.hash {
        debug!(block = header.number, "Block hash differs from header, storing fetched block");
    }
    ctx.store.upsert_block(&block)?;
    Ok(block)
}

/// Stage 2. Balances default to zero when there is no proposer address or
/// the lookup fails.
async fn fetch_balance_delta(
    ctx: &EnrichmentContext,
    block: &BlockRecord,
    miner: Option<&str>,
) -> (BigUint, BigUint) {
    let zero = || (BigUint::default(), BigUint::default());
    let Some(address) = miner else {
        debug!(block = block.number, "No proposer address, skipping balance delta");
        return zero();
    };

    let before_block = block.number.saturating_sub(1);
    match ctx
        .execution
        .get_balance_pair(address, before_block, block.number)
        .await
    {
        Ok((before, after)) => {
            let delta = BalanceDelta::new(
                block.number,
                address.to_string(),
                before.clone(),
                after.clone(),
            );
            if let Err(e) = ctx.store.upsert_balance_delta(&delta) {
                warn!(block = block.number, error = %e, "Failed to persist balance delta");
            }
            (before, after)
        }
        Err(e) => {
            warn!(block = block.number, error = %e, "Balance lookup failed");
            zero()
        }
    }
}

/// Stage 3. Waits the initial delay, then polls every relay until at least
/// one answers or the total time cap runs out.
async fn poll_relays(ctx: &EnrichmentContext, block: &BlockRecord) -> Vec<RelayPayload> {
    let started = Instant::now();
    sleep(ctx.config.relay_initial_delay).await;

    loop {
        let lookups = ctx.relays.iter().map(|relay| {
            let relay = relay.clone();
            let number = block.number;
            async move { (relay.source_id().to_string(), relay.fetch_by_block(number).await) }
        });

        let mut found = Vec::new();
        for (relay, result) in join_all(lookups).await {
            match result {
                Ok(Some(payload)) => found.push(payload),
                Ok(None) => {}
                Err(e) => {
                    debug!(relay = %relay, block = block.number, error = %e, "Relay lookup failed")
                }
            }
        }

        if !found.is_empty() {
            return found;
        }
        if started.elapsed() + ctx.config.relay_retry_interval >= ctx.config.relay_max_elapsed {
            info!(block = block.number, "No relay delivered this block");
            return found;
        }
        sleep(ctx.config.relay_retry_interval).await;
    }
}

/// Warn when a payload's slot time and the block timestamp disagree.
fn check_slot_consistency(clock: &SlotClock, block: &BlockRecord, payload: &RelayPayload) -> bool {
    let slot_time = clock.slot_to_unix(payload.slot);
    let consistent = slot_time.abs_diff(block.timestamp) <= clock.slot_secs().unsigned_abs();
    if !consistent {
        warn!(
            block = block.number,
            relay = %payload.relay,
            slot = payload.slot,
            slot_time,
            block_time = block.timestamp,
            "Relay slot does not match block timestamp"
        );
    }
    consistent
}

/// Stage 4, pure.
pub fn build_summary(
    clock: &SlotClock,
    block: &BlockRecord,
    miner: Option<String>,
    balances: (BigUint, BigUint),
    payloads: &[RelayPayload],
) -> BlockSummary {
    let best = payloads.iter().max_by(|a, b| a.value.cmp(&b.value));
    let slot = best
        .map(|p| p.slot)
        .unwrap_or_else(|| clock.unix_to_slot(block.timestamp));
    let mut relays: Vec<String> = payloads.iter().map(|p| p.relay.clone()).collect();
    relays.sort();
    relays.dedup();

    let (before, after) = balances;
    let delta = BigInt::from(after.clone()) - BigInt::from(before.clone());

    BlockSummary {
        block_number: block.number,
        block_hash: block.hash.clone(),
        slot,
        timestamp: block.timestamp,
        miner,
        builder_name: builder_name_from_extra_data(&block.extra_data),
        transaction_count: block.transaction_count,
        gas_used: block.gas_used,
        gas_limit: block.gas_limit,
        balance_before: before,
        balance_after: after,
        balance_delta: delta,
        is_vanilla: relays.is_empty(),
        relays,
        max_payment_value: best.map(|p| p.value.clone()),
        proposer_fee_recipient: best.map(|p| p.proposer_fee_recipient.clone()),
    }
}

/// Run all four stages for one header.
pub async fn enrich_block(ctx: Arc<EnrichmentContext>, header: BlockHeader) -> Result<BlockSummary> {
    let block = fetch_block(&ctx, &header).await?;
    let miner = block.miner.clone().or_else(|| header.miner.clone());

    let balances = fetch_balance_delta(&ctx, &block, miner.as_deref()).await;

    let payloads = poll_relays(&ctx, &block).await;
    if !payloads.is_empty() {
        for p in &payloads {
            check_slot_consistency(&ctx.clock, &block, p);
        }
        ctx.store.upsert_payloads(&payloads)?;
    }

    let summary = build_summary(&ctx.clock, &block, miner, balances, &payloads);
    ctx.store.upsert_summary(&summary)?;

    info!(
        block = summary.block_number,
        builder = %summary.builder_name,
        relays = summary.relays.len(),
        vanilla = summary.is_vanilla,
        "Block enriched"
    );
    Ok(summary)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sources::FetchError;
    use crate::storage::SqliteStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    pub(crate) struct FakeExecution {
        pub miner: Option<String>,
        pub fail: bool,
        pub balance_calls: AtomicU32,
    }

    impl FakeExecution {
        pub fn new(miner: Option<&str>) -> Self {
            Self {
                miner: miner.map(str::to_string),
                fail: false,
                balance_calls: AtomicU32::new(0),
            }
        }
    }

    pub(crate) fn block(number: u64, miner: Option<String>) -> BlockRecord {
        let clock = SlotClock::mainnet();
        BlockRecord {
            number,
            hash: format!("0x{:x}", number),
            parent_hash: "0x0".into(),
            miner,
            gas_used: 15_000_000,
            gas_limit: 30_000_000,
            base_fee_per_gas: Some(10),
            extra_data: format!("0x{}", hex::encode("beaverbuild.org")),
            timestamp: clock.slot_to_unix(number + 1_000),
            transaction_count: 120,
        }
    }

    #[async_trait]
    impl ExecutionSource for FakeExecution {
        async fn get_block(&self, number: u64) -> Result<BlockRecord, FetchError> {
            if self.fail {
                return Err(FetchError::Timeout);
            }
            Ok(block(number, self.miner.clone()))
        }

        async fn get_balance_pair(
            &self,
            _address: &str,
            _before_block: u64,
            _after_block: u64,
        ) -> Result<(BigUint, BigUint), FetchError> {
            self.balance_calls.fetch_add(1, Ordering::SeqCst);
            Ok((BigUint::from(1_000u32), BigUint::from(1_500u32)))
        }
    }

    /// Relay that starts answering after `answer_from_call` lookups.
    pub(crate) struct FakeRelay {
        pub id: String,
        pub answer_from_call: u32,
        pub value: u64,
        pub calls: AtomicU32,
        pub call_times: Mutex<Vec<Instant>>,
    }

    impl FakeRelay {
        pub fn new(id: &str, answer_from_call: u32, value: u64) -> Self {
            Self {
                id: id.to_string(),
                answer_from_call,
                value,
                calls: AtomicU32::new(0),
                call_times: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PayloadSource for FakeRelay {
        fn source_id(&self) -> &str {
            &self.id
        }

        async fn fetch_page(&self, _cursor: u64, _limit: u32) -> Result<Vec<RelayPayload>, FetchError> {
            Ok(Vec::new())
        }

        async fn fetch_by_block(&self, block_number: u64) -> Result<Option<RelayPayload>, FetchError> {
            self.call_times.lock().push(Instant::now());
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.answer_from_call {
                return Ok(None);
            }
            Ok(Some(RelayPayload {
                relay: self.id.clone(),
                slot: block_number + 1_000,
                block_number: Some(block_number),
                block_hash: format!("0x{:x}", block_number),
                parent_hash: "0x0".into(),
                builder_pubkey: "0xb".into(),
                proposer_pubkey: "0xp".into(),
                proposer_fee_recipient: format!("0xfee-{}", self.id),
                gas_limit: 30_000_000,
                gas_used: 15_000_000,
                value: BigUint::from(self.value),
                num_tx: Some(120),
            }))
        }
    }

    fn header(number: u64, miner: Option<&str>) -> BlockHeader {
        BlockHeader {
            number,
            hash: format!("0x{:x}", number),
            parent_hash: "0x0".into(),
            miner: miner.map(str::to_string),
            timestamp: 0,
        }
    }

    pub(crate) fn context(
        execution: Arc<dyn ExecutionSource>,
        relays: Vec<Arc<dyn PayloadSource>>,
        store: Arc<dyn RecordStore>,
    ) -> EnrichmentContext {
        EnrichmentContext {
            execution,
            relays,
            store,
            clock: SlotClock::mainnet(),
            config: LiveConfig::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_enrichment_picks_best_payment() {
        let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open_memory().unwrap());
        let execution = Arc::new(FakeExecution::new(Some("0xminer")));
        let relays: Vec<Arc<dyn PayloadSource>> = vec![
            Arc::new(FakeRelay::new("flashbots", 0, 10)),
            Arc::new(FakeRelay::new("ultrasound", 0, 30)),
        ];
        let ctx = Arc::new(context(execution.clone(), relays, store.clone()));

        let summary = enrich_block(ctx, header(500, Some("0xminer"))).await.unwrap();

        assert!(!summary.is_vanilla);
        assert_eq!(summary.relays, vec!["flashbots".to_string(), "ultrasound".to_string()]);
        assert_eq!(summary.max_payment_value, Some(BigUint::from(30u32)));
        assert_eq!(summary.proposer_fee_recipient.as_deref(), Some("0xfee-ultrasound"));
        assert_eq!(summary.builder_name, "beaverbuild");
        assert_eq!(summary.balance_delta, BigInt::from(500));
        assert_eq!(summary.slot, 1_500);

        assert!(store.get_block(500).unwrap().is_some());
        assert!(store.get_payload(1_500, "flashbots").unwrap().is_some());
        assert_eq!(store.get_summary(500).unwrap(), Some(summary));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_miner_skips_balances_but_stores_block_and_summary() {
        let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open_memory().unwrap());
        let execution = Arc::new(FakeExecution::new(None));
        let relay: Arc<dyn PayloadSource> = Arc::new(FakeRelay::new("aestus", 0, 7));
        let ctx = Arc::new(context(execution.clone(), vec![relay], store.clone()));

        let summary = enrich_block(ctx, header(42, None)).await.unwrap();

        assert_eq!(execution.balance_calls.load(Ordering::SeqCst), 0);
        assert_eq!(summary.miner, None);
        assert_eq!(summary.balance_before, BigUint::default());
        assert_eq!(summary.balance_after, BigUint::default());
        assert_eq!(summary.balance_delta, BigInt::default());
        assert!(store.get_block(42).unwrap().is_some());
        assert!(store.get_summary(42).unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_failure_aborts_remaining_stages() {
        let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open_memory().unwrap());
        let execution = Arc::new(FakeExecution {
            fail: true,
            ..FakeExecution::new(Some("0xminer"))
        });
        let relay = Arc::new(FakeRelay::new("titan", 0, 1));
        let ctx = Arc::new(context(
            execution,
            vec![relay.clone() as Arc<dyn PayloadSource>],
            store.clone(),
        ));

        assert!(enrich_block(ctx, header(7, None)).await.is_err());
        assert_eq!(relay.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.get_summary(7).unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_poll_waits_then_retries_on_interval() {
        let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open_memory().unwrap());
        let relay = Arc::new(FakeRelay::new("bloxroute", 2, 5));
        let ctx = Arc::new(context(
            Arc::new(FakeExecution::new(None)),
            vec![relay.clone() as Arc<dyn PayloadSource>],
            store,
        ));

        let start = Instant::now();
        let summary = enrich_block(ctx, header(9, None)).await.unwrap();
        assert!(!summary.is_vanilla);

        let times = relay.call_times.lock().clone();
        assert_eq!(times.len(), 3);
        let cfg = LiveConfig::default();
        assert!(times[0] - start >= cfg.relay_initial_delay);
        assert!(times[1] - times[0] >= cfg.relay_retry_interval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_relays_give_vanilla_block_after_cap() {
        let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open_memory().unwrap());
        let relay = Arc::new(FakeRelay::new("eden", u32::MAX, 1));
        let mut ctx = context(
            Arc::new(FakeExecution::new(None)),
            vec![relay.clone() as Arc<dyn PayloadSource>],
            store,
        );
        ctx.config.relay_initial_delay = Duration::from_secs(12);
        ctx.config.relay_retry_interval = Duration::from_secs(12);
        ctx.config.relay_max_elapsed = Duration::from_secs(60);

        let start = Instant::now();
        let summary = enrich_block(Arc::new(ctx), header(11, None)).await.unwrap();

        assert!(summary.is_vanilla);
        assert!(summary.relays.is_empty());
        assert_eq!(summary.max_payment_value, None);
        // polls at 12, 24, 36, 48 seconds; the next would pass the 60s cap
        assert_eq!(relay.calls.load(Ordering::SeqCst), 4);
        assert!(start.elapsed() <= Duration::from_secs(60));
    }

    #[test]
    fn test_slot_consistency_check() {
        let clock = SlotClock::mainnet();
        let b = block(5, None);
        let mut p = RelayPayload {
            relay: "r".into(),
            slot: 1_005,
            block_number: Some(5),
            block_hash: "0x5".into(),
            parent_hash: "0x0".into(),
            builder_pubkey: "0xb".into(),
            proposer_pubkey: "0xp".into(),
            proposer_fee_recipient: "0xf".into(),
            gas_limit: 1,
            gas_used: 1,
            value: BigUint::from(1u32),
            num_tx: None,
        };
        assert!(check_slot_consistency(&clock, &b, &p));
        p.slot = 2_000;
        assert!(!check_slot_consistency(&clock, &b, &p));

        // slot far past the representable time range
        p.slot = u64::MAX;
        assert!(!check_slot_consistency(&clock, &b, &p));
    }
}
