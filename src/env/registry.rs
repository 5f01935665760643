//! Environment Registry
//!
//! Named, TTL-bounded store instances. The registry is the only thing that
//! creates or removes environment stores; records live in their own SQLite
//! file next to the stores they point at.
//!
//! Every mutation runs in an `IMMEDIATE` transaction on `registry.db`, so
//! create, delete and the expiry sweep never interleave on the same
//! environment, even across processes. A per-name lock keeps threads of one
//! process from queueing on the SQLite write lock for the same name.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::seed::{self, SeedMode};
use crate::clock::Clock;
use crate::error::{EnvError, StoreError};
use crate::store::{remove_store_files, Store};
use crate::sync::models::{format_timestamp, parse_timestamp};

type Result<T> = std::result::Result<T, EnvError>;

const REGISTRY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS environments (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    ttl_seconds INTEGER NOT NULL,
    seed_mode TEXT NOT NULL,
    backing_store_path TEXT NOT NULL UNIQUE
);
"#;

const REGISTRY_FILE: &str = "registry.db";
const STORES_DIR: &str = "stores";

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9][a-z0-9_-]{0,62}$").expect("environment name pattern compiles")
    })
}

pub fn validate_name(name: &str) -> Result<()> {
    if name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(EnvError::InvalidName(name.to_string()))
    }
}

/// One named environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: i64,
    pub seed_mode: SeedMode,
    pub backing_store_path: PathBuf,
}

impl EnvironmentRecord {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + chrono::Duration::seconds(self.ttl_seconds)
    }

    /// Live through `expires_at` inclusive
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, i64, String, String)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    }

    fn decode(raw: (String, String, i64, String, String)) -> std::result::Result<Self, StoreError> {
        let (name, created_at, ttl_seconds, seed_mode, path) = raw;
        let created_at = parse_timestamp(&created_at).ok_or_else(|| StoreError::InvalidValue {
            column: "created_at".to_string(),
            message: format!("not a timestamp: {created_at}"),
        })?;
        let seed_mode = seed_mode
            .parse::<SeedMode>()
            .map_err(|e| StoreError::InvalidValue {
                column: "seed_mode".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            name,
            created_at,
            ttl_seconds,
            seed_mode,
            backing_store_path: PathBuf::from(path),
        })
    }
}

/// Outcome of an idempotent delete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted,
    AlreadyGone,
}

/// What the startup reconciler removed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Expired environments removed
    pub expired: Vec<String>,
    /// Store files nothing referenced
    pub orphans: Vec<PathBuf>,
    /// Records whose store file was missing
    pub dangling: Vec<String>,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.orphans.is_empty() && self.dangling.is_empty()
    }
}

pub struct EnvironmentRegistry {
    records: Store,
    stores_dir: PathBuf,
    production: Option<Store>,
    clock: Arc<dyn Clock>,
    busy_timeout: Duration,
    max_ttl_seconds: i64,
    name_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EnvironmentRegistry {
    /// Open the registry rooted at `root` (`registry.db` plus `stores/`).
    pub fn open(
        root: impl AsRef<Path>,
        production: Option<Store>,
        clock: Arc<dyn Clock>,
        busy_timeout: Duration,
        max_ttl_seconds: i64,
    ) -> Result<Self> {
        let root = root.as_ref();
        let stores_dir = root.join(STORES_DIR);
        std::fs::create_dir_all(&stores_dir).map_err(|e| StoreError::io(&stores_dir, e))?;
        let records =
            Store::open_with_schema(root.join(REGISTRY_FILE), busy_timeout, REGISTRY_SCHEMA)?;

        Ok(Self {
            records,
            stores_dir,
            production,
            clock,
            busy_timeout,
            max_ttl_seconds,
            name_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn stores_dir(&self) -> &Path {
        &self.stores_dir
    }

    pub fn busy_timeout(&self) -> Duration {
        self.busy_timeout
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Create `name`, replacing an expired environment of the same name.
    pub fn create(
        &self,
        name: &str,
        seed_mode: SeedMode,
        ttl_seconds: i64,
    ) -> Result<EnvironmentRecord> {
        validate_name(name)?;
        if !(1..=self.max_ttl_seconds).contains(&ttl_seconds) {
            return Err(EnvError::InvalidTtl {
                ttl_seconds,
                max: self.max_ttl_seconds,
            });
        }

        let path = self
            .stores_dir
            .join(format!("{}-{}.db", name, uuid::Uuid::new_v4().simple()));
        let created = self.with_name_lock(name, || {
            self.exclusive(|conn| {
                let now = self.clock.now();
                if let Some(existing) = read_record(conn, name)? {
                    if !existing.is_expired(now) {
                        return Err(EnvError::Conflict(name.to_string()));
                    }
                    debug!(name, "replacing expired environment");
                    remove_environment(conn, &existing)?;
                }

                seed::provision(&path, seed_mode, self.production.as_ref(), self.busy_timeout)?;
                let record = EnvironmentRecord {
                    name: name.to_string(),
                    created_at: now.trunc_subsecs(3),
                    ttl_seconds,
                    seed_mode,
                    backing_store_path: path.clone(),
                };
                insert_record(conn, &record)?;
                Ok(record)
            })
        });

        match created {
            Ok(record) => {
                info!(
                    name,
                    seed_mode = %seed_mode,
                    ttl_seconds,
                    path = %record.backing_store_path.display(),
                    "environment created"
                );
                Ok(record)
            }
            Err(e) => {
                // Never registered, so nothing else can be using it
                if let Err(cleanup) = remove_store_files(&path) {
                    warn!(
                        path = %path.display(),
                        error = %cleanup,
                        "failed to remove partial store"
                    );
                }
                Err(e)
            }
        }
    }

    /// Live record for `name`
    pub fn get(&self, name: &str) -> Result<EnvironmentRecord> {
        let record = read_record(&self.records.lock(), name)?
            .ok_or_else(|| EnvError::NotFound(name.to_string()))?;
        if record.is_expired(self.clock.now()) {
            return Err(EnvError::Expired(name.to_string()));
        }
        Ok(record)
    }

    /// Remove `name` whether or not it has expired. Idempotent.
    pub fn delete(&self, name: &str) -> Result<DeleteOutcome> {
        if validate_name(name).is_err() {
            return Ok(DeleteOutcome::AlreadyGone);
        }
        self.with_name_lock(name, || {
            self.exclusive(|conn| match read_record(conn, name)? {
                Some(record) => {
                    remove_environment(conn, &record)?;
                    info!(name, "environment deleted");
                    Ok(DeleteOutcome::Deleted)
                }
                None => Ok(DeleteOutcome::AlreadyGone),
            })
        })
    }

    /// Live records, by name
    pub fn list(&self) -> Result<Vec<EnvironmentRecord>> {
        let now = self.clock.now();
        Ok(all_records(&self.records.lock())?
            .into_iter()
            .filter(|r| !r.is_expired(now))
            .collect())
    }

    pub fn list_expired(&self) -> Result<Vec<EnvironmentRecord>> {
        let now = self.clock.now();
        Ok(all_records(&self.records.lock())?
            .into_iter()
            .filter(|r| r.is_expired(now))
            .collect())
    }

    /// Remove `record` only if the same generation is still registered and
    /// still expired. Returns whether anything was removed.
    pub fn delete_if_expired(&self, record: &EnvironmentRecord) -> Result<bool> {
        self.with_name_lock(&record.name, || {
            self.exclusive(|conn| {
                let current = match read_record(conn, &record.name)? {
                    Some(current) => current,
                    None => return Ok(false),
                };
                if current.backing_store_path != record.backing_store_path
                    || !current.is_expired(self.clock.now())
                {
                    debug!(name = %record.name, "environment recreated or renewed, skipping");
                    return Ok(false);
                }
                remove_environment(conn, &current)?;
                info!(
                    name = %current.name,
                    expired_at = %current.expires_at(),
                    "expired environment removed"
                );
                Ok(true)
            })
        })
    }

    /// Reconcile records and store files after a restart. Safe to run while
    /// another process serves the same directory: the orphan scan holds the
    /// registry write lock, which every create holds until its record commits.
    pub fn startup_cleanup(&self) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();

        for record in self.list_expired()? {
            if self.delete_if_expired(&record)? {
                report.expired.push(record.name);
            }
        }

        self.exclusive(|conn| {
            let mut referenced = HashSet::new();
            for record in all_records(conn)? {
                if record.backing_store_path.exists() {
                    if let Some(file) = record.backing_store_path.file_name() {
                        referenced.insert(file.to_os_string());
                    }
                    continue;
                }
                delete_record(conn, &record)?;
                warn!(
                    name = %record.name,
                    path = %record.backing_store_path.display(),
                    "dropped record with missing store"
                );
                report.dangling.push(record.name);
            }

            let mut seen = HashSet::new();
            for entry in WalkDir::new(&self.stores_dir)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                let base = store_base_path(entry.path());
                let Some(file) = base.file_name().map(|f| f.to_os_string()) else {
                    continue;
                };
                if referenced.contains(&file) || !seen.insert(file) {
                    continue;
                }
                remove_store_files(&base)?;
                warn!(path = %base.display(), "removed orphaned store");
                report.orphans.push(base);
            }
            Ok(())
        })?;

        if report.is_empty() {
            debug!("startup cleanup found nothing to do");
        } else {
            info!(
                expired = report.expired.len(),
                orphans = report.orphans.len(),
                dangling = report.dangling.len(),
                "startup cleanup complete"
            );
        }
        Ok(report)
    }

    /// Run `f` in an `IMMEDIATE` transaction on a dedicated registry
    /// connection. The SQLite write lock serializes registry mutations across
    /// every process sharing this directory; name locks only cover this one.
    /// Readers on the shared connection are not blocked.
    fn exclusive<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let writer = self.records.reopen(self.busy_timeout)?;
        let mut conn = writer.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let value = f(&*tx)?;
        tx.commit().map_err(StoreError::from)?;
        Ok(value)
    }

    fn with_name_lock<T>(&self, name: &str, f: impl FnOnce() -> T) -> T {
        let lock = self
            .name_locks
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock();
            f()
        };

        // Drop the entry once nobody else is waiting on it
        let mut locks = self.name_locks.lock();
        if Arc::strong_count(&lock) == 2 {
            locks.remove(name);
        }
        result
    }
}

// ----------------------------------------------------------------------
// Record storage
// ----------------------------------------------------------------------

const SELECT_RECORD: &str =
    "SELECT name, created_at, ttl_seconds, seed_mode, backing_store_path FROM environments";

/// Store files first, then the record. A crash in between leaves a dangling
/// record, which startup cleanup drops.
fn remove_environment(conn: &Connection, record: &EnvironmentRecord) -> Result<()> {
    remove_store_files(&record.backing_store_path)?;
    delete_record(conn, record)
}

fn read_record(conn: &Connection, name: &str) -> Result<Option<EnvironmentRecord>> {
    let raw = conn
        .query_row(
            &format!("{SELECT_RECORD} WHERE name = ?1"),
            params![name],
            EnvironmentRecord::from_row,
        )
        .optional()
        .map_err(StoreError::from)?;
    Ok(raw.map(EnvironmentRecord::decode).transpose()?)
}

fn all_records(conn: &Connection) -> Result<Vec<EnvironmentRecord>> {
    let mut stmt = conn
        .prepare(&format!("{SELECT_RECORD} ORDER BY name"))
        .map_err(StoreError::from)?;
    let rows = stmt
        .query_map([], EnvironmentRecord::from_row)
        .map_err(StoreError::from)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(StoreError::from)?;

    let mut records = Vec::with_capacity(rows.len());
    for raw in rows {
        match EnvironmentRecord::decode(raw) {
            Ok(record) => records.push(record),
            Err(e) => warn!(error = %e, "skipping unreadable environment record"),
        }
    }
    Ok(records)
}

fn insert_record(conn: &Connection, record: &EnvironmentRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO environments (name, created_at, ttl_seconds, seed_mode, backing_store_path)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.name,
            format_timestamp(record.created_at),
            record.ttl_seconds,
            record.seed_mode.as_str(),
            path_key(&record.backing_store_path),
        ],
    )
    .map_err(StoreError::from)?;
    Ok(())
}

/// Delete `record`'s row only while it still points at the same store file,
/// so a stale record never removes a newer generation of the name.
fn delete_record(conn: &Connection, record: &EnvironmentRecord) -> Result<()> {
    let removed = conn
        .execute(
            "DELETE FROM environments WHERE name = ?1 AND backing_store_path = ?2",
            params![record.name, path_key(&record.backing_store_path)],
        )
        .map_err(StoreError::from)?;
    if removed == 0 {
        debug!(name = %record.name, "record already replaced or removed");
    }
    Ok(())
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// `foo.db-wal` and `foo.db-shm` belong to `foo.db`
fn store_base_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    for suffix in ["-wal", "-shm"] {
        if let Some(base) = raw.strip_suffix(suffix) {
            return PathBuf::from(base);
        }
    }
    path.to_path_buf()
}
