//! MEV relay data acquisition and reconciliation engine.
//!
//! Exposes core modules for use by binaries and tests.

pub mod backfill;
pub mod builder_names;
pub mod clock;
pub mod config;
pub mod live;
pub mod models;
pub mod sources;
pub mod storage;
