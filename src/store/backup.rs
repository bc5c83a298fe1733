//! Backup & restore
//!
//! Archive layout (one directory per backup):
//! ```text
//! backup_<kind>_<YYYYmmdd_HHMMSS>[.N]/   stamped with the backup's created_at
//!   manifest.json          written last; its presence marks a complete archive
//!   payload/store.db       online-backup copy (full) or VACUUM INTO copy (compact)
//!   payload/dirs/<name>/   tracked directories
//! ```
//!
//! Backups never fail loudly: every attempt comes back as a `BackupRecord`
//! whose status says what happened.
//!
//! Restore is all-or-nothing per archive:
//! 1. manifest present, payload SHA-256 matches, schema version matches
//! 2. tracked directories staged next to their targets (`*.restore-staging`)
//! 3. data tables replaced from the attached payload inside ONE transaction
//! 4. staged directories swapped into place (all targets moved aside first)
//! 5. transaction committed; a failed commit swaps the directories back
//!
//! A failure at any step leaves tables and directories as they were, and
//! no staging directory survives. Audit tables are not touched by restore.

use super::error::StoreError;
use super::maintenance::{database_size, CancelFlag, RetentionPolicy};
use super::schema::{schema_version, DATA_TABLES};
use rusqlite::{params, Connection, DatabaseName};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const PAYLOAD_DIR: &str = "payload";
pub const PAYLOAD_DB: &str = "store.db";
pub const PAYLOAD_DIRS: &str = "dirs";

const STAGING_SUFFIX: &str = "restore-staging";
const OLD_SUFFIX: &str = "restore-old";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    /// Page-for-page copy via the online backup API
    Full,
    /// Size-reduced copy via `VACUUM INTO`
    Compact,
    /// A restore attempt, logged alongside backups
    Restore,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Compact => "compact",
            BackupKind::Restore => "restore",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(BackupKind::Full),
            "compact" => Ok(BackupKind::Compact),
            "restore" => Ok(BackupKind::Restore),
            other => Err(format!("unknown backup type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Success,
    Failed,
    Cancelled,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Success => "success",
            BackupStatus::Failed => "failed",
            BackupStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(BackupStatus::Success),
            "failed" => Ok(BackupStatus::Failed),
            "cancelled" => Ok(BackupStatus::Cancelled),
            other => Err(format!("unknown backup status: {}", other)),
        }
    }
}

/// One row of `backup_log`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: Option<i64>,
    pub kind: BackupKind,
    pub destination: PathBuf,
    pub size_before: u64,
    pub size_after: u64,
    /// size_after / size_before (0 when nothing was measured)
    pub compression_ratio: f64,
    pub duration_ms: u64,
    pub status: BackupStatus,
    pub error: Option<String>,
    pub created_at: i64,
}

impl BackupRecord {
    pub fn succeeded(&self) -> bool {
        self.status == BackupStatus::Success
    }
}

/// `manifest.json` contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub schema_version: u32,
    pub backup_type: BackupKind,
    pub created_at: i64,
    pub tables: Vec<String>,
    pub directories: Vec<String>,
    pub retention: RetentionPolicy,
    pub payload_file: String,
    pub payload_sha256: String,
    pub payload_size: u64,
}

/// What to back up and where
#[derive(Debug, Clone)]
pub struct BackupPlan {
    pub kind: BackupKind,
    /// Parent directory; the archive directory is created beneath it
    pub root: PathBuf,
    pub tracked_dirs: Vec<PathBuf>,
    pub retention: RetentionPolicy,
    pub created_at: i64,
}

/// An archive found on disk
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub manifest: BackupManifest,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableRestore {
    pub table: String,
    pub rows: u64,
}

/// Result of a successful restore
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreOutcome {
    pub manifest: BackupManifest,
    pub tables: Vec<TableRestore>,
    pub directories: Vec<PathBuf>,
    pub size_before: u64,
    pub size_after: u64,
}

/// Hex SHA-256 of a file, streamed
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Copy `src` into `dst` recursively, returning bytes copied
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<u64> {
    fs::create_dir_all(dst)?;
    let mut bytes = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            bytes += copy_dir_recursive(&entry.path(), &target)?;
        } else {
            bytes += fs::copy(entry.path(), &target)?;
        }
    }
    Ok(bytes)
}

fn dir_label(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.to_string_lossy().replace(['/', '\\'], "_"))
}

fn sibling_with_suffix(dir: &Path, suffix: &str) -> PathBuf {
    let mut name = dir.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_dir_if_exists(dir: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Fresh, unused archive directory name under `root`
fn archive_dir(root: &Path, kind: BackupKind, created_at: i64) -> PathBuf {
    let stamp = chrono::DateTime::from_timestamp(created_at, 0)
        .map(|t| t.format("%Y%m%d_%H%M%S").to_string())
        .unwrap_or_else(|| created_at.to_string());
    let base = root.join(format!("backup_{}_{}", kind, stamp));
    let mut candidate = base.clone();
    let mut n = 1;
    while candidate.exists() {
        candidate = sibling_with_suffix(&base, &n.to_string());
        n += 1;
    }
    candidate
}

/// Snapshot the store into a new archive
///
/// Never returns an error: failures come back as a `Failed` (or `Cancelled`)
/// record, and the partial archive directory is removed.
pub fn create_backup(conn: &Connection, plan: &BackupPlan, cancel: &CancelFlag) -> BackupRecord {
    let start = Instant::now();
    let destination = archive_dir(&plan.root, plan.kind, plan.created_at);

    log::info!("💾 {} backup → {}", plan.kind, destination.display());

    let (status, error, size_before, size_after) =
        match write_archive(conn, plan, &destination, cancel) {
            Ok((before, after)) => (BackupStatus::Success, None, before, after),
            Err(e) => {
                let status = match e {
                    StoreError::Cancelled(_) => BackupStatus::Cancelled,
                    _ => BackupStatus::Failed,
                };
                log::error!("   └─ ❌ Backup {}: {}", status, e);
                if let Err(cleanup_err) = remove_dir_if_exists(&destination) {
                    log::warn!("   └─ ⚠️  Could not remove partial archive: {}", cleanup_err);
                }
                (status, Some(e.to_string()), 0, 0)
            }
        };

    let record = BackupRecord {
        id: None,
        kind: plan.kind,
        destination,
        size_before,
        size_after,
        compression_ratio: if size_before > 0 {
            size_after as f64 / size_before as f64
        } else {
            0.0
        },
        duration_ms: start.elapsed().as_millis() as u64,
        status,
        error,
        created_at: plan.created_at,
    };

    if record.succeeded() {
        log::info!(
            "   └─ ✅ Backup done: {} → {} bytes (ratio {:.3}, {}ms)",
            record.size_before,
            record.size_after,
            record.compression_ratio,
            record.duration_ms
        );
    }

    record
}

fn write_archive(
    conn: &Connection,
    plan: &BackupPlan,
    destination: &Path,
    cancel: &CancelFlag,
) -> Result<(u64, u64), StoreError> {
    let payload_dir = destination.join(PAYLOAD_DIR);
    let payload_db = payload_dir.join(PAYLOAD_DB);
    fs::create_dir_all(&payload_dir)?;

    let size_before = database_size(conn)?;
    let version = schema_version(conn)?;

    cancel.check("snapshot")?;
    match plan.kind {
        BackupKind::Full => conn.backup(DatabaseName::Main, &payload_db, None)?,
        BackupKind::Compact => {
            conn.execute("VACUUM INTO ?1", [payload_db.to_string_lossy().into_owned()])?;
        }
        BackupKind::Restore => {
            return Err(StoreError::InvalidArgument(
                "restore is not a backup type".to_string(),
            ))
        }
    }

    // Payload is a standalone file: no WAL sidecars to hash or lose
    {
        let payload = Connection::open(&payload_db)?;
        payload.query_row("PRAGMA journal_mode = DELETE", [], |_| Ok(()))?;
    }
    let size_after = fs::metadata(&payload_db)?.len();

    cancel.check("tracked directories")?;
    let mut directories = Vec::new();
    for dir in &plan.tracked_dirs {
        if !dir.is_dir() {
            log::warn!("   ├─ ⚠️  Tracked directory missing, skipped: {}", dir.display());
            continue;
        }
        let label = dir_label(dir);
        let bytes = copy_dir_recursive(dir, &payload_dir.join(PAYLOAD_DIRS).join(&label))?;
        log::info!("   ├─ 📁 {} ({} bytes)", label, bytes);
        directories.push(label);
    }

    cancel.check("manifest")?;
    let manifest = BackupManifest {
        schema_version: version,
        backup_type: plan.kind,
        created_at: plan.created_at,
        tables: DATA_TABLES.iter().map(|t| t.to_string()).collect(),
        directories,
        retention: plan.retention,
        payload_file: format!("{}/{}", PAYLOAD_DIR, PAYLOAD_DB),
        payload_sha256: sha256_file(&payload_db)?,
        payload_size: size_after,
    };
    fs::write(
        destination.join(MANIFEST_FILE),
        serde_json::to_string_pretty(&manifest)?,
    )?;

    Ok((size_before, size_after))
}

pub fn read_manifest(archive: &Path) -> Result<BackupManifest, StoreError> {
    let path = archive.join(MANIFEST_FILE);
    let raw = fs::read_to_string(&path).map_err(|e| {
        StoreError::Backup(format!("manifest unreadable at {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&raw)
        .map_err(|e| StoreError::Backup(format!("manifest invalid at {}: {}", path.display(), e)))
}

/// Archives under `root`, newest first; a missing root is an empty list
pub fn list_backups(root: &Path) -> Result<Vec<BackupEntry>, StoreError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut backups = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.join(MANIFEST_FILE).is_file() {
            continue;
        }
        match read_manifest(&path) {
            Ok(manifest) => backups.push(BackupEntry { path, manifest }),
            Err(e) => log::warn!("⚠️  Skipping {}: {}", path.display(), e),
        }
    }

    backups.sort_by(|a, b| {
        b.manifest
            .created_at
            .cmp(&a.manifest.created_at)
            .then_with(|| b.path.cmp(&a.path))
    });
    Ok(backups)
}

/// Verify an archive and replace the live data tables + tracked directories
///
/// `tracked_dirs` are the live targets; each is matched to the archived copy
/// by directory name.
pub fn restore_backup(
    conn: &mut Connection,
    archive: &Path,
    tracked_dirs: &[PathBuf],
    cancel: &CancelFlag,
) -> Result<RestoreOutcome, StoreError> {
    log::info!("♻️  Restoring from {}", archive.display());

    let manifest = read_manifest(archive)?;
    let payload_db = archive.join(&manifest.payload_file);

    let digest = sha256_file(&payload_db)
        .map_err(|e| StoreError::Backup(format!("payload unreadable: {}", e)))?;
    if digest != manifest.payload_sha256 {
        return Err(StoreError::Backup(format!(
            "payload checksum mismatch (expected {}, got {})",
            manifest.payload_sha256, digest
        )));
    }
    log::info!("   ├─ ✅ Checksum verified");

    let live_version = schema_version(conn)?;
    if manifest.schema_version != live_version {
        return Err(StoreError::Backup(format!(
            "schema version mismatch (archive {}, store {})",
            manifest.schema_version, live_version
        )));
    }

    let size_before = database_size(conn)?;

    cancel.check("staging")?;
    let staged = stage_directories(archive, &manifest, tracked_dirs)?;

    let result = cancel
        .check("table restore")
        .and_then(|()| replace_tables_and_swap(conn, &payload_db, &manifest, &staged));

    // Whatever happened, no staging directory outlives the call
    for (_, staging) in &staged {
        if let Err(e) = remove_dir_if_exists(staging) {
            log::warn!("   ├─ ⚠️  Could not remove {}: {}", staging.display(), e);
        }
    }

    let (tables, swapped) = result?;
    let directories = finish_swap(swapped);
    let size_after = database_size(conn)?;

    log::info!(
        "   └─ ✅ Restore complete: {} tables, {} directories",
        tables.len(),
        directories.len()
    );

    Ok(RestoreOutcome {
        manifest,
        tables,
        directories,
        size_before,
        size_after,
    })
}

/// Copy archived directories next to their live targets
fn stage_directories(
    archive: &Path,
    manifest: &BackupManifest,
    tracked_dirs: &[PathBuf],
) -> Result<Vec<(PathBuf, PathBuf)>, StoreError> {
    let mut staged: Vec<(PathBuf, PathBuf)> = Vec::new();

    for target in tracked_dirs {
        let label = dir_label(target);
        if !manifest.directories.contains(&label) {
            continue;
        }
        let source = archive.join(PAYLOAD_DIR).join(PAYLOAD_DIRS).join(&label);
        let staging = sibling_with_suffix(target, STAGING_SUFFIX);

        let result = remove_dir_if_exists(&staging)
            .and_then(|()| copy_dir_recursive(&source, &staging));
        if let Err(e) = result {
            let _ = remove_dir_if_exists(&staging);
            for (_, done) in &staged {
                let _ = remove_dir_if_exists(done);
            }
            return Err(StoreError::Backup(format!(
                "staging {} failed: {}",
                target.display(),
                e
            )));
        }

        log::info!("   ├─ 📁 Staged {}", staging.display());
        staged.push((target.clone(), staging));
    }

    Ok(staged)
}

/// A tracked directory whose staged copy is in place
struct SwappedDir {
    target: PathBuf,
    /// Previous contents, moved aside; `None` if the target did not exist
    old: Option<PathBuf>,
}

/// Replace every data table from the payload and swap the staged directories
///
/// The table transaction commits only after every directory is in place; a
/// failed commit moves the directories back. Either everything is restored
/// or nothing is.
fn replace_tables_and_swap(
    conn: &mut Connection,
    payload_db: &Path,
    manifest: &BackupManifest,
    staged: &[(PathBuf, PathBuf)],
) -> Result<(Vec<TableRestore>, Vec<SwappedDir>), StoreError> {
    conn.execute(
        "ATTACH DATABASE ?1 AS restore_src",
        [payload_db.to_string_lossy().into_owned()],
    )?;

    let result = (|| -> Result<(Vec<TableRestore>, Vec<SwappedDir>), StoreError> {
        let tx = conn.transaction()?;
        let mut tables = Vec::new();
        for table in DATA_TABLES {
            if !manifest.tables.iter().any(|t| t == table) {
                continue;
            }
            tx.execute(&format!("DELETE FROM main.{}", table), [])?;
            let rows = tx.execute(
                &format!("INSERT INTO main.{t} SELECT * FROM restore_src.{t}", t = table),
                [],
            )? as u64;
            log::info!("   ├─ {}: {} rows", table, rows);
            tables.push(TableRestore {
                table: table.to_string(),
                rows,
            });
        }

        // Dropping `tx` on error rolls the tables back
        let swapped = swap_staged(staged)?;
        if let Err(e) = tx.commit() {
            roll_back_swap(&swapped);
            return Err(e.into());
        }
        Ok((tables, swapped))
    })();

    if let Err(e) = conn.execute("DETACH DATABASE restore_src", params![]) {
        log::warn!("   ├─ ⚠️  DETACH failed: {}", e);
    }

    result
}

/// Move every target aside, then every staged copy into place
///
/// On failure every move already made is undone before returning.
fn swap_staged(staged: &[(PathBuf, PathBuf)]) -> Result<Vec<SwappedDir>, StoreError> {
    let mut swapped: Vec<SwappedDir> = Vec::with_capacity(staged.len());

    for (target, _) in staged {
        let moved = (|| -> std::io::Result<Option<PathBuf>> {
            let old = sibling_with_suffix(target, OLD_SUFFIX);
            remove_dir_if_exists(&old)?;
            if target.exists() {
                fs::rename(target, &old)?;
                Ok(Some(old))
            } else {
                Ok(None)
            }
        })();
        match moved {
            Ok(old) => swapped.push(SwappedDir {
                target: target.clone(),
                old,
            }),
            Err(e) => {
                restore_old(&swapped);
                return Err(StoreError::Backup(format!(
                    "moving {} aside failed: {}",
                    target.display(),
                    e
                )));
            }
        }
    }

    for (i, (target, staging)) in staged.iter().enumerate() {
        if let Err(e) = fs::rename(staging, target) {
            for placed in &swapped[..i] {
                let _ = remove_dir_if_exists(&placed.target);
            }
            restore_old(&swapped);
            return Err(StoreError::Backup(format!(
                "swapping {} into place failed: {}",
                target.display(),
                e
            )));
        }
    }

    Ok(swapped)
}

/// Put moved-aside directories back where they were
fn restore_old(swapped: &[SwappedDir]) {
    for dir in swapped {
        if let Some(old) = &dir.old {
            if let Err(e) = fs::rename(old, &dir.target) {
                log::error!(
                    "   ├─ ❌ Could not move {} back to {}: {}",
                    old.display(),
                    dir.target.display(),
                    e
                );
            }
        }
    }
}

/// Undo a completed swap (restored contents out, previous contents back)
fn roll_back_swap(swapped: &[SwappedDir]) {
    for dir in swapped {
        if let Err(e) = remove_dir_if_exists(&dir.target) {
            log::error!("   ├─ ❌ Could not remove {}: {}", dir.target.display(), e);
        }
    }
    restore_old(swapped);
}

/// Drop the previous contents of swapped directories
fn finish_swap(swapped: Vec<SwappedDir>) -> Vec<PathBuf> {
    swapped
        .into_iter()
        .map(|dir| {
            if let Some(old) = &dir.old {
                if let Err(e) = remove_dir_if_exists(old) {
                    log::warn!("   ├─ ⚠️  Could not remove {}: {}", old.display(), e);
                }
            }
            dir.target
        })
        .collect()
}

pub fn insert_backup_record(conn: &Connection, record: &BackupRecord) -> rusqlite::Result<i64> {
    conn.execute(
        r#"
        INSERT INTO backup_log (
            backup_type, destination, size_before, size_after, compression_ratio,
            duration_ms, status, error, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            record.kind.as_str(),
            record.destination.to_string_lossy().into_owned(),
            record.size_before as i64,
            record.size_after as i64,
            record.compression_ratio,
            record.duration_ms as i64,
            record.status.as_str(),
            record.error,
            record.created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Newest backup attempts first
pub fn fetch_backup_history(conn: &Connection, limit: usize) -> rusqlite::Result<Vec<BackupRecord>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, backup_type, destination, size_before, size_after, compression_ratio,
               duration_ms, status, error, created_at
        FROM backup_log
        ORDER BY id DESC
        LIMIT ?1
        "#,
    )?;

    let rows = stmt.query_map([limit as i64], |row| {
        let kind: String = row.get(1)?;
        let status: String = row.get(7)?;
        let destination: String = row.get(2)?;
        Ok(BackupRecord {
            id: Some(row.get(0)?),
            kind: kind.parse().map_err(|e: String| {
                rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, e.into())
            })?,
            destination: PathBuf::from(destination),
            size_before: row.get::<_, i64>(3)? as u64,
            size_after: row.get::<_, i64>(4)? as u64,
            compression_ratio: row.get(5)?,
            duration_ms: row.get::<_, i64>(6)? as u64,
            status: status.parse().map_err(|e: String| {
                rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, e.into())
            })?,
            error: row.get(8)?,
            created_at: row.get(9)?,
        })
    })?;

    let records = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite_pragma::{apply_optimized_pragmas, PragmaSettings};
    use crate::store::schema::run_schema_migrations;
    use tempfile::tempdir;

    fn open_store(path: &Path) -> Connection {
        let conn = Connection::open(path).unwrap();
        apply_optimized_pragmas(&conn, &PragmaSettings::default()).unwrap();
        run_schema_migrations(&conn).unwrap();
        conn
    }

    fn insert_candle(conn: &Connection, ts: i64) {
        conn.execute(
            "INSERT INTO candles (symbol, timestamp, open, high, low, close, volume, ingested_at)
             VALUES ('BTCUSD', ?1, 1, 1, 1, 1, 1, 0)",
            [ts],
        )
        .unwrap();
    }

    fn candle_count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM candles", [], |row| row.get(0))
            .unwrap()
    }

    fn plan(root: &Path, kind: BackupKind, tracked: Vec<PathBuf>) -> BackupPlan {
        BackupPlan {
            kind,
            root: root.to_path_buf(),
            tracked_dirs: tracked,
            retention: RetentionPolicy::default(),
            created_at: 1_700_000_000,
        }
    }

    #[test]
    fn test_full_backup_writes_manifest_and_payload() {
        let dir = tempdir().unwrap();
        let conn = open_store(&dir.path().join("live.db"));
        insert_candle(&conn, 1);

        let record = create_backup(&conn, &plan(&dir.path().join("backups"), BackupKind::Full, vec![]), &CancelFlag::new());
        assert!(record.succeeded(), "{:?}", record.error);
        assert!(record.size_after > 0);
        assert!(record.compression_ratio > 0.0);

        let manifest = read_manifest(&record.destination).unwrap();
        assert_eq!(manifest.backup_type, BackupKind::Full);
        assert_eq!(manifest.schema_version, 1);
        assert_eq!(manifest.tables.len(), DATA_TABLES.len());
        assert_eq!(
            manifest.payload_sha256,
            sha256_file(&record.destination.join(&manifest.payload_file)).unwrap()
        );
    }

    #[test]
    fn test_compact_backup_and_listing() {
        let dir = tempdir().unwrap();
        let conn = open_store(&dir.path().join("live.db"));
        for ts in 0..200 {
            insert_candle(&conn, ts);
        }
        conn.execute("DELETE FROM candles WHERE timestamp < 150", []).unwrap();

        let root = dir.path().join("backups");
        let full = create_backup(&conn, &plan(&root, BackupKind::Full, vec![]), &CancelFlag::new());
        let compact = create_backup(&conn, &plan(&root, BackupKind::Compact, vec![]), &CancelFlag::new());
        assert!(full.succeeded() && compact.succeeded());
        assert!(compact.size_after <= full.size_after);

        let listed = list_backups(&root).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(list_backups(&dir.path().join("nowhere")).unwrap().is_empty());
    }

    #[test]
    fn test_failed_backup_is_a_record() {
        let dir = tempdir().unwrap();
        let conn = open_store(&dir.path().join("live.db"));

        // root is a regular file, so the archive directory cannot be created
        let blocker = dir.path().join("blocked");
        fs::write(&blocker, b"x").unwrap();

        let record = create_backup(&conn, &plan(&blocker, BackupKind::Full, vec![]), &CancelFlag::new());
        assert_eq!(record.status, BackupStatus::Failed);
        assert!(record.error.is_some());

        let cancel = CancelFlag::new();
        cancel.cancel();
        let record = create_backup(&conn, &plan(&dir.path().join("b"), BackupKind::Full, vec![]), &cancel);
        assert_eq!(record.status, BackupStatus::Cancelled);
        assert!(!record.destination.exists());
    }

    #[test]
    fn test_restore_roundtrip_with_tracked_dir() {
        let dir = tempdir().unwrap();
        let mut conn = open_store(&dir.path().join("live.db"));
        let models = dir.path().join("models");
        fs::create_dir_all(&models).unwrap();
        fs::write(models.join("weights.bin"), b"v1").unwrap();

        insert_candle(&conn, 1);
        insert_candle(&conn, 2);
        let record = create_backup(
            &conn,
            &plan(&dir.path().join("backups"), BackupKind::Full, vec![models.clone()]),
            &CancelFlag::new(),
        );
        assert!(record.succeeded());

        // diverge after the snapshot
        insert_candle(&conn, 3);
        fs::write(models.join("weights.bin"), b"v2").unwrap();
        conn.execute(
            "INSERT INTO operation_log (operation, status, scope, started_at) VALUES ('backup', 'success', 'x', 0)",
            [],
        )
        .unwrap();

        let outcome = restore_backup(&mut conn, &record.destination, &[models.clone()], &CancelFlag::new()).unwrap();
        assert_eq!(candle_count(&conn), 2);
        assert_eq!(outcome.tables[0], TableRestore { table: "candles".to_string(), rows: 2 });
        assert_eq!(fs::read(models.join("weights.bin")).unwrap(), b"v1");
        assert!(!sibling_with_suffix(&models, STAGING_SUFFIX).exists());

        // audit history survives a restore
        let audit: i64 = conn
            .query_row("SELECT COUNT(*) FROM operation_log", [], |row| row.get(0))
            .unwrap();
        assert_eq!(audit, 1);
    }

    #[test]
    fn test_corrupted_payload_leaves_store_untouched() {
        let dir = tempdir().unwrap();
        let mut conn = open_store(&dir.path().join("live.db"));
        insert_candle(&conn, 1);

        let record = create_backup(&conn, &plan(&dir.path().join("backups"), BackupKind::Full, vec![]), &CancelFlag::new());
        let manifest = read_manifest(&record.destination).unwrap();
        let payload = record.destination.join(&manifest.payload_file);
        let mut bytes = fs::read(&payload).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&payload, bytes).unwrap();

        insert_candle(&conn, 2);
        let err = restore_backup(&mut conn, &record.destination, &[], &CancelFlag::new()).unwrap_err();
        assert!(matches!(err, StoreError::Backup(ref m) if m.contains("checksum")));
        assert_eq!(candle_count(&conn), 2);
    }

    #[test]
    fn test_restore_without_manifest_is_rejected() {
        let dir = tempdir().unwrap();
        let mut conn = open_store(&dir.path().join("live.db"));
        let err = restore_backup(&mut conn, dir.path(), &[], &CancelFlag::new()).unwrap_err();
        assert!(matches!(err, StoreError::Backup(_)));
    }

    #[test]
    fn test_archive_named_from_created_at() {
        let dir = tempdir().unwrap();
        let conn = open_store(&dir.path().join("live.db"));
        let root = dir.path().join("backups");

        let first = create_backup(&conn, &plan(&root, BackupKind::Full, vec![]), &CancelFlag::new());
        let second = create_backup(&conn, &plan(&root, BackupKind::Full, vec![]), &CancelFlag::new());
        assert_eq!(first.destination, root.join("backup_full_20231114_221320"));
        assert_eq!(second.destination, root.join("backup_full_20231114_221320.1"));
    }

    /// Live `models` + `features` dirs, backed up with one candle, then diverged
    fn two_dir_fixture(root: &Path) -> (Connection, BackupRecord, PathBuf, PathBuf) {
        let conn = open_store(&root.join("live.db"));
        let models = root.join("models");
        let features = root.join("features");
        for (dir, body) in [(&models, b"m1"), (&features, b"f1")] {
            fs::create_dir_all(dir).unwrap();
            fs::write(dir.join("data.bin"), body).unwrap();
        }
        insert_candle(&conn, 1);

        let record = create_backup(
            &conn,
            &plan(&root.join("backups"), BackupKind::Full, vec![models.clone(), features.clone()]),
            &CancelFlag::new(),
        );
        assert!(record.succeeded(), "{:?}", record.error);

        insert_candle(&conn, 2);
        fs::write(models.join("data.bin"), b"m2").unwrap();
        fs::write(features.join("data.bin"), b"f2").unwrap();
        (conn, record, models, features)
    }

    #[test]
    fn test_staging_failure_removes_every_staged_copy() {
        let dir = tempdir().unwrap();
        let (mut conn, record, models, features) = two_dir_fixture(dir.path());

        // second tracked dir missing from the archive: models stages, features fails
        fs::remove_dir_all(record.destination.join(PAYLOAD_DIR).join(PAYLOAD_DIRS).join("features")).unwrap();

        let err = restore_backup(&mut conn, &record.destination, &[models.clone(), features.clone()], &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, StoreError::Backup(ref m) if m.contains("staging")));
        assert!(!sibling_with_suffix(&models, STAGING_SUFFIX).exists());
        assert!(!sibling_with_suffix(&features, STAGING_SUFFIX).exists());
        assert_eq!(fs::read(models.join("data.bin")).unwrap(), b"m2");
        assert_eq!(candle_count(&conn), 2);
    }

    #[test]
    fn test_swap_failure_rolls_back_dirs_and_tables() {
        let dir = tempdir().unwrap();
        let (mut conn, record, models, features) = two_dir_fixture(dir.path());

        // a regular file where features' old copy would go cannot be cleared
        // with remove_dir_all, so the second move-aside fails after the first
        fs::write(sibling_with_suffix(&features, OLD_SUFFIX), b"x").unwrap();

        let err = restore_backup(&mut conn, &record.destination, &[models.clone(), features.clone()], &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, StoreError::Backup(ref m) if m.contains("aside")));

        assert_eq!(fs::read(models.join("data.bin")).unwrap(), b"m2");
        assert_eq!(fs::read(features.join("data.bin")).unwrap(), b"f2");
        assert!(!sibling_with_suffix(&models, OLD_SUFFIX).exists());
        assert!(!sibling_with_suffix(&models, STAGING_SUFFIX).exists());
        assert!(!sibling_with_suffix(&features, STAGING_SUFFIX).exists());
        assert_eq!(candle_count(&conn), 2);

        // with the obstacle gone the same archive restores fully
        fs::remove_file(sibling_with_suffix(&features, OLD_SUFFIX)).unwrap();
        restore_backup(&mut conn, &record.destination, &[models.clone(), features.clone()], &CancelFlag::new()).unwrap();
        assert_eq!(fs::read(models.join("data.bin")).unwrap(), b"m1");
        assert_eq!(fs::read(features.join("data.bin")).unwrap(), b"f1");
        assert!(!sibling_with_suffix(&features, OLD_SUFFIX).exists());
        assert_eq!(candle_count(&conn), 1);
    }

    #[test]
    fn test_backup_history_roundtrip() {
        let dir = tempdir().unwrap();
        let conn = open_store(&dir.path().join("live.db"));

        let record = BackupRecord {
            id: None,
            kind: BackupKind::Compact,
            destination: PathBuf::from("/backups/x"),
            size_before: 100,
            size_after: 40,
            compression_ratio: 0.4,
            duration_ms: 5,
            status: BackupStatus::Failed,
            error: Some("disk full".to_string()),
            created_at: 7,
        };
        let id = insert_backup_record(&conn, &record).unwrap();

        let history = fetch_backup_history(&conn, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0], BackupRecord { id: Some(id), ..record });
    }
}
