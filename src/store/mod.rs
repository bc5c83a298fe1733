//! # Candle Store
//!
//! Embedded OHLCV store over a single SQLite file.
//!
//! ## Architecture
//!
//! Components, leaves first:
//! 1. `pool` - bounded r2d2 pool; PRAGMAs applied once per connection
//! 2. `validator` - timestamp normalization + OHLCV invariants per record
//! 3. `ingestion` - batched upsert, one transaction per batch
//! 4. `query` - range / latest-N reads behind a whole-invalidated cache
//! 5. `quality` - diagnostic report + per-series coherence/gap scores
//! 6. `alignment` / `coherence` - derived per-timeframe materialization and
//!    cross-timeframe agreement
//! 7. `maintenance` / `backup` - compaction, retention, backup/restore
//! 8. `oplog` - append-only audit of every mutating operation
//!
//! `engine::CandleStore` owns all of the above; `scheduler` drives
//! maintenance on a timer.
//!
//! ## Data Flow
//!
//! ```text
//! raw candles → validator → ingestion → candles
//! candles → (alignment pipeline) → quality scores → aligned_candles + sessions
//! candles / aligned_candles → query cache → callers
//! ```
//!
//! Upsert keeps no history: re-ingesting a (symbol, timestamp) replaces the row.

pub mod alignment;
pub mod backup;
pub mod coherence;
pub mod config;
pub mod engine;
pub mod error;
pub mod ingestion;
pub mod maintenance;
pub mod oplog;
pub mod pool;
pub mod quality;
pub mod query;
pub mod scheduler;
pub mod schema;
pub mod types;
pub mod validator;

pub use alignment::{AlignedCandle, AlignedWriteReport, AlignmentSession, GapSummary};
pub use backup::{BackupEntry, BackupKind, BackupManifest, BackupRecord, BackupStatus};
pub use coherence::{CoherenceObservation, CoherenceStats};
pub use config::StoreConfig;
pub use engine::{CandleStore, RestoreReport, StoreStats};
pub use error::StoreError;
pub use ingestion::IngestReport;
pub use maintenance::{CancelFlag, CompactionReport, RetentionPolicy, RetentionReport};
pub use oplog::{OperationKind, OperationLogEntry, OperationStatus};
pub use quality::{QualityReport, QualityThresholds, SeriesScores};
pub use query::CacheStats;
pub use types::{Candle, CandleQuery, Column, ProjectedRow, SeriesBar, Timeframe};
pub use validator::ValidationError;
