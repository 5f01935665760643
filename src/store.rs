//! Local mirror store
//!
//! An explicitly constructed handle to one SQLite file. Production and every
//! named environment each get their own handle; nothing here is global.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::sync::models::{format_timestamp, parse_timestamp, EntityKind, SyncCursor};

/// Default busy timeout for store connections
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Mirror schema shared by the production store and every environment store
pub const MIRROR_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    external_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    category TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    website TEXT,
    notes TEXT NOT NULL DEFAULT '',
    archived INTEGER NOT NULL DEFAULT 0,
    last_edited_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS transactions (
    external_id TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    amount REAL,
    date TEXT,
    category TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    account TEXT,
    entity_id TEXT,
    entity_name TEXT,
    reconciled INTEGER NOT NULL DEFAULT 0,
    receipt_url TEXT,
    notes TEXT NOT NULL DEFAULT '',
    last_edited_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS budgets (
    external_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    category TEXT,
    amount REAL,
    period TEXT,
    start_date TEXT,
    active INTEGER NOT NULL DEFAULT 0,
    last_edited_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS inventory_items (
    external_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    category TEXT,
    quantity REAL,
    purchase_price REAL,
    purchase_date TEXT,
    entity_id TEXT,
    entity_name TEXT,
    location TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    last_edited_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS wishlist_items (
    external_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    price REAL,
    priority TEXT,
    url TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    purchased INTEGER NOT NULL DEFAULT 0,
    last_edited_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_cursors (
    source_id TEXT PRIMARY KEY,
    last_edited_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_runs (
    id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    status TEXT NOT NULL,
    fetched INTEGER NOT NULL DEFAULT 0,
    written INTEGER NOT NULL DEFAULT 0,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_transactions_entity ON transactions(entity_id);
CREATE INDEX IF NOT EXISTS idx_sync_runs_source ON sync_runs(source_id, started_at);
"#;

/// Outcome recorded for one sync pass
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SyncRunRecord {
    pub id: String,
    pub source_id: String,
    pub kind: EntityKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: String,
    pub fetched: usize,
    pub written: usize,
    pub error: Option<String>,
}

/// Cloneable handle to one store file
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

impl Store {
    /// Open (creating if needed) a mirror store at `path`
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        Self::open_with_schema(path, busy_timeout, MIRROR_SCHEMA)
    }

    /// Open a store file with an arbitrary schema. Used by the environment
    /// registry, which keeps its records in its own file.
    pub fn open_with_schema(
        path: impl AsRef<Path>,
        busy_timeout: Duration,
        schema: &str,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let conn = Connection::open(&path)?;
        configure_connection(&conn, busy_timeout)?;
        conn.execute_batch(schema)?;
        debug!(path = %path.display(), "opened store");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Open an existing store without creating it. A file removed after the
    /// caller looked it up is reported as missing, never recreated empty.
    pub fn open_existing(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&path, flags).map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::CannotOpen => {
                StoreError::io(
                    &path,
                    std::io::Error::new(std::io::ErrorKind::NotFound, "store file missing"),
                )
            }
            other => StoreError::from(other),
        })?;
        configure_connection(&conn, busy_timeout)?;
        conn.execute_batch(MIRROR_SCHEMA)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// A second, independent connection to the same file. Transactions on it
    /// do not hold this handle's lock.
    pub fn reopen(&self, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(&self.path)?;
        configure_connection(&conn, busy_timeout)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: self.path.clone(),
        })
    }

    /// In-memory store (tests, scratch work)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(MIRROR_SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Path to the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Exclusive access to the connection for the duration of the guard
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Write a consistent snapshot of this store to `dest`
    pub fn snapshot_to(&self, dest: &Path) -> Result<()> {
        let conn = self.lock();
        conn.execute("VACUUM INTO ?1", params![dest.to_string_lossy().into_owned()])?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cursors
    // ------------------------------------------------------------------

    pub fn load_cursor(&self, source_id: &str) -> Result<Option<SyncCursor>> {
        let conn = self.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT last_edited_at FROM sync_cursors WHERE source_id = ?1",
                params![source_id],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|s| {
            parse_timestamp(&s)
                .map(|last_edited_at| SyncCursor {
                    source_id: source_id.to_string(),
                    last_edited_at,
                })
                .ok_or_else(|| StoreError::InvalidValue {
                    column: "sync_cursors.last_edited_at".to_string(),
                    message: s.clone(),
                })
        })
        .transpose()
    }

    /// Move the cursor forward. An older timestamp than the stored one is
    /// ignored, so the cursor never decreases. Returns whether it moved.
    pub fn advance_cursor(&self, source_id: &str, to: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "INSERT INTO sync_cursors (source_id, last_edited_at) VALUES (?1, ?2)
             ON CONFLICT(source_id) DO UPDATE SET last_edited_at = excluded.last_edited_at
             WHERE excluded.last_edited_at > sync_cursors.last_edited_at",
            params![source_id, format_timestamp(to)],
        )?;
        Ok(changed > 0)
    }

    pub fn list_cursors(&self) -> Result<Vec<SyncCursor>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT source_id, last_edited_at FROM sync_cursors ORDER BY source_id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut cursors = Vec::new();
        for row in rows {
            let (source_id, raw) = row?;
            match parse_timestamp(&raw) {
                Some(last_edited_at) => cursors.push(SyncCursor {
                    source_id,
                    last_edited_at,
                }),
                None => warn!(%source_id, value = %raw, "skipping unparseable cursor"),
            }
        }
        Ok(cursors)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// `external_id → name` for every mirrored counterparty
    pub fn entity_names(&self) -> Result<HashMap<String, String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT external_id, name FROM entities")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut names = HashMap::new();
        for row in rows {
            let (id, name): (String, String) = row?;
            names.insert(id, name);
        }
        Ok(names)
    }

    pub fn count(&self, kind: EntityKind) -> Result<usize> {
        let conn = self.lock();
        let sql = format!("SELECT COUNT(*) FROM {}", kind.table());
        let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Rows of one kind as JSON objects, most recently edited first.
    /// `tags` columns are decoded back into arrays.
    pub fn list_rows(&self, kind: EntityKind, limit: usize) -> Result<Vec<Value>> {
        let conn = self.lock();
        let columns = kind.columns();
        let sql = format!(
            "SELECT {} FROM {} ORDER BY last_edited_at DESC, external_id LIMIT ?1",
            columns.join(", "),
            kind.table()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let mut obj = Map::new();
            for (i, column) in columns.iter().enumerate() {
                let value: rusqlite::types::Value = row.get(i)?;
                obj.insert((*column).to_string(), column_to_json(column, value));
            }
            Ok(Value::Object(obj))
        })?;
        let out = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Sync history
    // ------------------------------------------------------------------

    pub fn record_sync_run(&self, run: &SyncRunRecord) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO sync_runs
             (id, source_id, kind, started_at, finished_at, status, fetched, written, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run.id,
                run.source_id,
                run.kind.as_str(),
                format_timestamp(run.started_at),
                format_timestamp(run.finished_at),
                run.status,
                run.fetched as i64,
                run.written as i64,
                run.error,
            ],
        )?;
        Ok(())
    }

    pub fn recent_sync_runs(&self, limit: usize) -> Result<Vec<SyncRunRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, source_id, kind, started_at, finished_at, status, fetched, written, error
             FROM sync_runs ORDER BY started_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, Option<String>>(8)?,
            ))
        })?;

        let mut runs = Vec::new();
        for row in rows {
            let (id, source_id, kind, started, finished, status, fetched, written, error) = row?;
            let (Ok(kind), Some(started_at), Some(finished_at)) = (
                kind.parse::<EntityKind>(),
                parse_timestamp(&started),
                parse_timestamp(&finished),
            ) else {
                warn!(%id, "skipping malformed sync run record");
                continue;
            };
            runs.push(SyncRunRecord {
                id,
                source_id,
                kind,
                started_at,
                finished_at,
                status,
                fetched: fetched as usize,
                written: written as usize,
                error,
            });
        }
        Ok(runs)
    }
}

/// Pragmas every store connection runs with: WAL so readers never wait on the
/// writer, and a bounded busy timeout so contention surfaces as `Busy`.
fn configure_connection(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.busy_timeout(busy_timeout)?;
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        warn!(%mode, "store did not switch to WAL journal");
    }
    conn.execute_batch("PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;")?;
    Ok(())
}

fn column_to_json(column: &str, value: rusqlite::types::Value) -> Value {
    use rusqlite::types::Value as Sql;
    match value {
        Sql::Null => Value::Null,
        Sql::Integer(i) if is_flag_column(column) => Value::Bool(i != 0),
        Sql::Integer(i) => Value::from(i),
        Sql::Real(f) => Value::from(f),
        Sql::Text(s) if column == "tags" => Value::from(decode_tags(&s)),
        Sql::Text(s) => Value::String(s),
        Sql::Blob(b) => Value::from(b),
    }
}

fn is_flag_column(column: &str) -> bool {
    matches!(column, "archived" | "reconciled" | "active" | "purchased")
}

/// Decode a stored tag list. Malformed JSON is a mapping defect: it is logged
/// and read as an empty list rather than failing the read.
pub fn decode_tags(raw: &str) -> Vec<String> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(tags) => tags,
        Err(e) => {
            warn!(value = %raw, error = %e, "malformed tag list, treating as empty");
            Vec::new()
        }
    }
}

/// Remove a store file together with its WAL sidecars. Missing files are fine.
pub fn remove_store_files(path: &Path) -> Result<()> {
    for candidate in store_file_set(path) {
        match std::fs::remove_file(&candidate) {
            Ok(()) => debug!(path = %candidate.display(), "removed store file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(candidate, e)),
        }
    }
    Ok(())
}

fn store_file_set(path: &Path) -> [PathBuf; 3] {
    let base = path.as_os_str().to_owned();
    let mut wal = base.clone();
    wal.push("-wal");
    let mut shm = base;
    shm.push("-shm");
    [path.to_path_buf(), PathBuf::from(wal), PathBuf::from(shm)]
}
