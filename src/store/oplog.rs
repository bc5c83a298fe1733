//! Operation log - append-only audit of engine operations
//!
//! Every mutating path (bulk writes, aligned writes, sessions, coherence
//! checks, maintenance, backup/restore) appends one entry. A failure to append
//! is logged and otherwise ignored: the audit trail must never turn a
//! successful operation into a failed one.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    BulkWrite,
    StoreAligned,
    RecordSession,
    CoherenceCheck,
    Compaction,
    RetentionCleanup,
    Backup,
    Restore,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::BulkWrite => "bulk_write",
            OperationKind::StoreAligned => "store_aligned",
            OperationKind::RecordSession => "record_session",
            OperationKind::CoherenceCheck => "coherence_check",
            OperationKind::Compaction => "compaction",
            OperationKind::RetentionCleanup => "retention_cleanup",
            OperationKind::Backup => "backup",
            OperationKind::Restore => "restore",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bulk_write" => Ok(OperationKind::BulkWrite),
            "store_aligned" => Ok(OperationKind::StoreAligned),
            "record_session" => Ok(OperationKind::RecordSession),
            "coherence_check" => Ok(OperationKind::CoherenceCheck),
            "compaction" => Ok(OperationKind::Compaction),
            "retention_cleanup" => Ok(OperationKind::RetentionCleanup),
            "backup" => Ok(OperationKind::Backup),
            "restore" => Ok(OperationKind::Restore),
            other => Err(format!("unknown operation kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Success,
    /// Completed, but some records/batches/phases were rejected or failed
    Partial,
    Failed,
    DryRun,
    Cancelled,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Success => "success",
            OperationStatus::Partial => "partial",
            OperationStatus::Failed => "failed",
            OperationStatus::DryRun => "dry_run",
            OperationStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(OperationStatus::Success),
            "partial" => Ok(OperationStatus::Partial),
            "failed" => Ok(OperationStatus::Failed),
            "dry_run" => Ok(OperationStatus::DryRun),
            "cancelled" => Ok(OperationStatus::Cancelled),
            other => Err(format!("unknown operation status: {}", other)),
        }
    }
}

/// One row of `operation_log`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationLogEntry {
    pub id: Option<i64>,
    pub operation: OperationKind,
    pub status: OperationStatus,
    /// What the operation touched: symbols, a table, a backup path
    pub scope: String,
    pub records_processed: u64,
    pub duration_ms: u64,
    pub error: Option<String>,
    /// Unstructured diagnostic context only; anything queried belongs in a column
    pub metadata: Option<serde_json::Value>,
    pub started_at: i64,
}

impl OperationLogEntry {
    pub fn new(
        operation: OperationKind,
        status: OperationStatus,
        scope: impl Into<String>,
        started_at: i64,
    ) -> Self {
        Self {
            id: None,
            operation,
            status,
            scope: scope.into(),
            records_processed: 0,
            duration_ms: 0,
            error: None,
            metadata: None,
            started_at,
        }
    }

    pub fn with_records(mut self, records: u64) -> Self {
        self.records_processed = records;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Append an entry, returning its row id
pub fn append_entry(conn: &Connection, entry: &OperationLogEntry) -> rusqlite::Result<i64> {
    let metadata_json = entry.metadata.as_ref().map(|m| m.to_string());

    conn.execute(
        r#"
        INSERT INTO operation_log (
            operation, status, scope, records_processed, duration_ms,
            error, metadata_json, started_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            entry.operation.as_str(),
            entry.status.as_str(),
            entry.scope,
            entry.records_processed as i64,
            entry.duration_ms as i64,
            entry.error,
            metadata_json,
            entry.started_at,
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

/// Most recent entries first, optionally filtered by kind
pub fn recent_entries(
    conn: &Connection,
    limit: usize,
    kind: Option<OperationKind>,
) -> rusqlite::Result<Vec<OperationLogEntry>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, operation, status, scope, records_processed, duration_ms,
               error, metadata_json, started_at
        FROM operation_log
        WHERE (?1 IS NULL OR operation = ?1)
        ORDER BY id DESC
        LIMIT ?2
        "#,
    )?;

    let rows = stmt.query_map(
        params![kind.map(|k| k.as_str()), limit as i64],
        |row| {
            let operation: String = row.get(1)?;
            let status: String = row.get(2)?;
            let metadata_json: Option<String> = row.get(7)?;

            Ok(OperationLogEntry {
                id: Some(row.get(0)?),
                operation: operation.parse().map_err(|e: String| {
                    rusqlite::Error::FromSqlConversionFailure(
                        1,
                        rusqlite::types::Type::Text,
                        e.into(),
                    )
                })?,
                status: status.parse().map_err(|e: String| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Text,
                        e.into(),
                    )
                })?,
                scope: row.get(3)?,
                records_processed: row.get::<_, i64>(4)? as u64,
                duration_ms: row.get::<_, i64>(5)? as u64,
                error: row.get(6)?,
                metadata: metadata_json.and_then(|s| serde_json::from_str(&s).ok()),
                started_at: row.get(8)?,
            })
        },
    )?;

    let entries = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Most recent entry of a kind, if any
pub fn last_entry(
    conn: &Connection,
    kind: OperationKind,
) -> rusqlite::Result<Option<OperationLogEntry>> {
    Ok(recent_entries(conn, 1, Some(kind))?.into_iter().next())
}

/// Number of entries of a kind
pub fn count_entries(conn: &Connection, kind: OperationKind) -> rusqlite::Result<u64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM operation_log WHERE operation = ?1",
        [kind.as_str()],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::run_schema_migrations;
    use serde_json::json;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_schema_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn test_append_and_read_back() {
        let conn = test_conn();

        let entry = OperationLogEntry::new(
            OperationKind::BulkWrite,
            OperationStatus::Partial,
            "BTCUSD,ETHUSD",
            1_700_000_000,
        )
        .with_records(9_999)
        .with_duration_ms(42)
        .with_error("1 batch rolled back")
        .with_metadata(json!({"failed_batches": 1}));

        let id = append_entry(&conn, &entry).unwrap();

        let entries = recent_entries(&conn, 10, None).unwrap();
        assert_eq!(entries.len(), 1);
        let read = &entries[0];
        assert_eq!(read.id, Some(id));
        assert_eq!(read.operation, OperationKind::BulkWrite);
        assert_eq!(read.status, OperationStatus::Partial);
        assert_eq!(read.records_processed, 9_999);
        assert_eq!(read.error.as_deref(), Some("1 batch rolled back"));
        assert_eq!(read.metadata.as_ref().unwrap()["failed_batches"], 1);
    }

    #[test]
    fn test_recent_is_newest_first_and_filtered() {
        let conn = test_conn();

        for (i, kind) in [
            OperationKind::BulkWrite,
            OperationKind::Compaction,
            OperationKind::BulkWrite,
        ]
        .into_iter()
        .enumerate()
        {
            let entry = OperationLogEntry::new(kind, OperationStatus::Success, "x", i as i64);
            append_entry(&conn, &entry).unwrap();
        }

        let all = recent_entries(&conn, 10, None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].started_at, 2);

        let writes = recent_entries(&conn, 10, Some(OperationKind::BulkWrite)).unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(count_entries(&conn, OperationKind::Compaction).unwrap(), 1);

        let last = last_entry(&conn, OperationKind::Compaction).unwrap().unwrap();
        assert_eq!(last.started_at, 1);
        assert!(last_entry(&conn, OperationKind::Restore).unwrap().is_none());
    }
}
