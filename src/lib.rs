//! candlestore - embedded OHLCV market-data store
//!
//! A single-file SQLite store for candles with:
//! - validated, batched, upsert-on-conflict bulk ingestion
//! - range / latest-N reads behind a coarsely invalidated cache
//! - quality and coherence scoring, multi-timeframe aligned materialization
//! - compaction, retention cleanup, backup/restore and an operation audit log
//!
//! Entry point is [`store::CandleStore`]; see `src/bin/store_admin.rs` for the
//! operator CLI.

pub mod sqlite_pragma;
pub mod store;

pub use store::{CandleStore, StoreConfig, StoreError};
