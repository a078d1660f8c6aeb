//! SQLite-backed record store
//!
//! - WAL mode so inspection tools can read while the engine writes
//! - Natural-key upserts for blocks, payloads, checkpoints and summaries
//! - Batch payload writes inside one transaction per page

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use num_bigint::{BigInt, BigUint};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::RecordStore;
use crate::clock::{Slot, SlotClock, SlotRange};
use crate::models::{
    BalanceDelta, BlockRecord, BlockSummary, Checkpoint, DailyCount, RelayPayload,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = FULL;
PRAGMA cache_size = -16000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS blocks (
    number INTEGER PRIMARY KEY,
    hash TEXT NOT NULL,
    parent_hash TEXT NOT NULL,
    miner TEXT,
    gas_used INTEGER NOT NULL,
    gas_limit INTEGER NOT NULL,
    base_fee_per_gas INTEGER,
    extra_data TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    transaction_count INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS relay_payloads (
    slot INTEGER NOT NULL,
    relay TEXT NOT NULL,
    block_number INTEGER,
    block_hash TEXT NOT NULL,
    parent_hash TEXT NOT NULL,
    builder_pubkey TEXT NOT NULL,
    proposer_pubkey TEXT NOT NULL,
    proposer_fee_recipient TEXT NOT NULL,
    gas_limit INTEGER NOT NULL,
    gas_used INTEGER NOT NULL,
    value_wei TEXT NOT NULL,
    num_tx INTEGER,
    PRIMARY KEY (slot, relay)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_relay_payloads_relay_slot
    ON relay_payloads(relay, slot);

CREATE INDEX IF NOT EXISTS idx_relay_payloads_block
    ON relay_payloads(block_number);

CREATE TABLE IF NOT EXISTS balance_deltas (
    block_number INTEGER PRIMARY KEY,
    address TEXT NOT NULL,
    balance_before TEXT NOT NULL,
    balance_after TEXT NOT NULL,
    delta TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS block_summaries (
    block_number INTEGER PRIMARY KEY,
    block_hash TEXT NOT NULL,
    slot INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    miner TEXT,
    builder_name TEXT NOT NULL,
    transaction_count INTEGER NOT NULL,
    gas_used INTEGER NOT NULL,
    gas_limit INTEGER NOT NULL,
    balance_before TEXT NOT NULL,
    balance_after TEXT NOT NULL,
    balance_delta TEXT NOT NULL,
    relays_json TEXT NOT NULL,
    max_payment_wei TEXT,
    proposer_fee_recipient TEXT,
    is_vanilla INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoints (
    source TEXT PRIMARY KEY,
    from_slot INTEGER NOT NULL,
    to_slot INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;
"#;

/// Record store over a single SQLite connection.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database file.
    pub fn open(db_path: &str) -> Result<Self> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database: {}", db_path))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        info!(path = %db_path, "Record store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an existing database without creating it or touching the schema.
    pub fn open_read_only(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database read-only: {}", db_path))?;
        debug!(path = %db_path, "Record store opened read-only");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open in-memory storage (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Total stored payloads.
    pub fn payload_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM relay_payloads", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

fn parse_biguint(text: &str) -> rusqlite::Result<BigUint> {
    text.parse::<BigUint>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_bigint(text: &str) -> rusqlite::Result<BigInt> {
    text.parse::<BigInt>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_payload(row: &Row<'_>) -> rusqlite::Result<RelayPayload> {
    let value: String = row.get(10)?;
    Ok(RelayPayload {
        slot: row.get::<_, i64>(0)? as u64,
        relay: row.get(1)?,
        block_number: row.get::<_, Option<i64>>(2)?.map(|n| n as u64),
        block_hash: row.get(3)?,
        parent_hash: row.get(4)?,
        builder_pubkey: row.get(5)?,
        proposer_pubkey: row.get(6)?,
        proposer_fee_recipient: row.get(7)?,
        gas_limit: row.get::<_, i64>(8)? as u64,
        gas_used: row.get::<_, i64>(9)? as u64,
        value: parse_biguint(&value)?,
        num_tx: row.get::<_, Option<i64>>(11)?.map(|n| n as u64),
    })
}

const PAYLOAD_COLUMNS: &str = "slot, relay, block_number, block_hash, parent_hash, builder_pubkey, \
     proposer_pubkey, proposer_fee_recipient, gas_limit, gas_used, value_wei, num_tx";

impl RecordStore for SqliteStore {
    fn upsert_block(&self, block: &BlockRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO blocks (
                number, hash, parent_hash, miner, gas_used, gas_limit,
                base_fee_per_gas, extra_data, timestamp, transaction_count, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(number) DO UPDATE SET
                hash = excluded.hash,
                parent_hash = excluded.parent_hash,
                miner = excluded.miner,
                gas_used = excluded.gas_used,
                gas_limit = excluded.gas_limit,
                base_fee_per_gas = excluded.base_fee_per_gas,
                extra_data = excluded.extra_data,
                timestamp = excluded.timestamp,
                transaction_count = excluded.transaction_count,
                updated_at = excluded.updated_at
            "#,
            params![
                block.number as i64,
                block.hash,
                block.parent_hash,
                block.miner,
                block.gas_used as i64,
                block.gas_limit as i64,
                block.base_fee_per_gas.map(|v| v as i64),
                block.extra_data,
                block.timestamp,
                block.transaction_count as i64,
                Utc::now().timestamp(),
            ],
        )
        .with_context(|| format!("Failed to upsert block {}", block.number))?;
        Ok(())
    }

    fn get_block(&self, number: u64) -> Result<Option<BlockRecord>> {
        let conn = self.conn.lock();
        let block = conn
            .query_row(
                r#"
                SELECT number, hash, parent_hash, miner, gas_used, gas_limit,
                       base_fee_per_gas, extra_data, timestamp, transaction_count
                FROM blocks WHERE number = ?1
                "#,
                params![number as i64],
                |row| {
                    Ok(BlockRecord {
                        number: row.get::<_, i64>(0)? as u64,
                        hash: row.get(1)?,
                        parent_hash: row.get(2)?,
                        miner: row.get(3)?,
                        gas_used: row.get::<_, i64>(4)? as u64,
                        gas_limit: row.get::<_, i64>(5)? as u64,
                        base_fee_per_gas: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
                        extra_data: row.get(7)?,
                        timestamp: row.get(8)?,
                        transaction_count: row.get::<_, i64>(9)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(block)
    }

    fn upsert_payloads(&self, payloads: &[RelayPayload]) -> Result<usize> {
        if payloads.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT INTO relay_payloads (
                    slot, relay, block_number, block_hash, parent_hash, builder_pubkey,
                    proposer_pubkey, proposer_fee_recipient, gas_limit, gas_used,
                    value_wei, num_tx
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                ON CONFLICT(slot, relay) DO UPDATE SET
                    block_number = COALESCE(excluded.block_number, block_number),
                    block_hash = excluded.block_hash,
                    parent_hash = CASE WHEN excluded.parent_hash = '' THEN parent_hash
                                       ELSE excluded.parent_hash END,
                    builder_pubkey = excluded.builder_pubkey,
                    proposer_pubkey = excluded.proposer_pubkey,
                    proposer_fee_recipient = excluded.proposer_fee_recipient,
                    gas_limit = excluded.gas_limit,
                    gas_used = excluded.gas_used,
                    value_wei = excluded.value_wei,
                    num_tx = COALESCE(excluded.num_tx, num_tx)
                "#,
            )?;
            for p in payloads {
                count += stmt.execute(params![
                    p.slot as i64,
                    p.relay,
                    p.block_number.map(|n| n as i64),
                    p.block_hash,
                    p.parent_hash,
                    p.builder_pubkey,
                    p.proposer_pubkey,
                    p.proposer_fee_recipient,
                    p.gas_limit as i64,
                    p.gas_used as i64,
                    p.value.to_string(),
                    p.num_tx.map(|n| n as i64),
                ])?;
            }
        }
        tx.commit().context("Failed to commit payload batch")?;

        debug!(rows = count, "Upserted relay payloads");
        Ok(count)
    }

    fn get_payload(&self, slot: Slot, relay: &str) -> Result<Option<RelayPayload>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM relay_payloads WHERE slot = ?1 AND relay = ?2",
            PAYLOAD_COLUMNS
        );
        let payload = conn
            .query_row(&sql, params![slot as i64, relay], row_to_payload)
            .optional()?;
        Ok(payload)
    }

    fn payloads_in_range(&self, relay: &str, range: SlotRange) -> Result<Vec<RelayPayload>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM relay_payloads WHERE relay = ?1 AND slot >= ?2 AND slot <= ?3 \
             ORDER BY slot ASC",
            PAYLOAD_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![relay, range.from as i64, range.to as i64],
                row_to_payload,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn upsert_balance_delta(&self, delta: &BalanceDelta) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO balance_deltas (block_number, address, balance_before, balance_after, delta)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(block_number) DO UPDATE SET
                address = excluded.address,
                balance_before = excluded.balance_before,
                balance_after = excluded.balance_after,
                delta = excluded.delta
            "#,
            params![
                delta.block_number as i64,
                delta.address,
                delta.balance_before.to_string(),
                delta.balance_after.to_string(),
                delta.delta.to_string(),
            ],
        )?;
        Ok(())
    }

    fn upsert_summary(&self, s: &BlockSummary) -> Result<()> {
        let relays_json = serde_json::to_string(&s.relays)?;
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO block_summaries (
                block_number, block_hash, slot, timestamp, miner, builder_name,
                transaction_count, gas_used, gas_limit, balance_before, balance_after,
                balance_delta, relays_json, max_payment_wei, proposer_fee_recipient, is_vanilla
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            ON CONFLICT(block_number) DO UPDATE SET
                block_hash = excluded.block_hash,
                slot = excluded.slot,
                timestamp = excluded.timestamp,
                miner = excluded.miner,
                builder_name = excluded.builder_name,
                transaction_count = excluded.transaction_count,
                gas_used = excluded.gas_used,
                gas_limit = excluded.gas_limit,
                balance_before = excluded.balance_before,
                balance_after = excluded.balance_after,
                balance_delta = excluded.balance_delta,
                relays_json = excluded.relays_json,
                max_payment_wei = excluded.max_payment_wei,
                proposer_fee_recipient = excluded.proposer_fee_recipient,
                is_vanilla = excluded.is_vanilla
            "#,
            params![
                s.block_number as i64,
                s.block_hash,
                s.slot as i64,
                s.timestamp,
                s.miner,
                s.builder_name,
                s.transaction_count as i64,
                s.gas_used as i64,
                s.gas_limit as i64,
                s.balance_before.to_string(),
                s.balance_after.to_string(),
                s.balance_delta.to_string(),
                relays_json,
                s.max_payment_value.as_ref().map(|v| v.to_string()),
                s.proposer_fee_recipient,
                s.is_vanilla as i32,
            ],
        )?;
        Ok(())
    }

    fn get_summary(&self, block_number: u64) -> Result<Option<BlockSummary>> {
        let conn = self.conn.lock();
        let summary = conn
            .query_row(
                r#"
                SELECT block_number, block_hash, slot, timestamp, miner, builder_name,
                       transaction_count, gas_used, gas_limit, balance_before, balance_after,
                       balance_delta, relays_json, max_payment_wei, proposer_fee_recipient,
                       is_vanilla
                FROM block_summaries WHERE block_number = ?1
                "#,
                params![block_number as i64],
                |row| {
                    let relays_json: String = row.get(12)?;
                    let relays: Vec<String> = serde_json::from_str(&relays_json).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            12,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?;
                    let max_payment: Option<String> = row.get(13)?;
                    Ok(BlockSummary {
                        block_number: row.get::<_, i64>(0)? as u64,
                        block_hash: row.get(1)?,
                        slot: row.get::<_, i64>(2)? as u64,
                        timestamp: row.get(3)?,
                        miner: row.get(4)?,
                        builder_name: row.get(5)?,
                        transaction_count: row.get::<_, i64>(6)? as u64,
                        gas_used: row.get::<_, i64>(7)? as u64,
                        gas_limit: row.get::<_, i64>(8)? as u64,
                        balance_before: parse_biguint(&row.get::<_, String>(9)?)?,
                        balance_after: parse_biguint(&row.get::<_, String>(10)?)?,
                        balance_delta: parse_bigint(&row.get::<_, String>(11)?)?,
                        relays,
                        max_payment_value: max_payment.as_deref().map(parse_biguint).transpose()?,
                        proposer_fee_recipient: row.get(14)?,
                        is_vanilla: row.get::<_, i32>(15)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(summary)
    }

    fn daily_counts(
        &self,
        clock: &SlotClock,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyCount>> {
        let first = clock.day_to_slot_range(from).from;
        let last = clock.day_to_slot_range(to).to;

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT relay, date(?1 + slot * ?2, 'unixepoch') AS day, COUNT(*)
            FROM relay_payloads
            WHERE slot >= ?3 AND slot <= ?4
            GROUP BY relay, day
            ORDER BY relay, day
            "#,
        )?;
        let rows = stmt
            .query_map(
                params![clock.genesis_secs(), clock.slot_secs(), first as i64, last as i64],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let mut counts = Vec::with_capacity(rows.len());
        for (source, day, count) in rows {
            let day = NaiveDate::parse_from_str(&day, "%Y-%m-%d")
                .with_context(|| format!("Unexpected day format from SQLite: {}", day))?;
            counts.push(DailyCount {
                source,
                day,
                count: count as u64,
            });
        }
        Ok(counts)
    }

    fn get_checkpoint(&self, source: &str) -> Result<Option<Checkpoint>> {
        let conn = self.conn.lock();
        let checkpoint = conn
            .query_row(
                "SELECT source, from_slot, to_slot, updated_at FROM checkpoints WHERE source = ?1",
                params![source],
                |row| {
                    Ok(Checkpoint {
                        source: row.get(0)?,
                        from_slot: row.get::<_, i64>(1)? as u64,
                        to_slot: row.get::<_, i64>(2)? as u64,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(checkpoint)
    }

    fn set_checkpoint(&self, source: &str, from: Slot, to: Slot) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO checkpoints (source, from_slot, to_slot, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(source) DO UPDATE SET
                from_slot = excluded.from_slot,
                to_slot = excluded.to_slot,
                updated_at = excluded.updated_at
            "#,
            params![source, from as i64, to as i64, Utc::now().timestamp()],
        )
        .with_context(|| format!("Failed to persist checkpoint for {}", source))?;
        Ok(())
    }

    fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT source, from_slot, to_slot, updated_at FROM checkpoints ORDER BY source",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Checkpoint {
                    source: row.get(0)?,
                    from_slot: row.get::<_, i64>(1)? as u64,
                    to_slot: row.get::<_, i64>(2)? as u64,
                    updated_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
