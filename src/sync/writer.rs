//! Upsert Writer
//!
//! Applies one batch of mapped rows as a single immediate transaction.
//! An existing row is fully replaced, never merged field by field.

use rusqlite::{params_from_iter, TransactionBehavior};
use tracing::debug;

use super::models::{EntityKind, MirroredRow};
use crate::error::{Result, StoreError};
use crate::store::Store;

/// Writer for one target store
pub struct UpsertWriter {
    store: Store,
}

impl UpsertWriter {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Upsert every row of `batch`, all of which must be of `kind`.
    /// Commits all rows or none; returns the number of rows written.
    pub fn write_batch(&self, kind: EntityKind, batch: &[MirroredRow]) -> Result<usize> {
        if let Some(row) = batch.iter().find(|r| r.kind() != kind) {
            return Err(StoreError::MixedBatch {
                expected: kind.as_str(),
                found: row.kind().as_str(),
            });
        }
        if batch.is_empty() {
            return Ok(0);
        }

        let sql = upsert_sql(kind);
        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut stmt = tx.prepare_cached(&sql)?;
            for row in batch {
                stmt.execute(params_from_iter(row.sql_values()))?;
            }
        }
        tx.commit()?;

        debug!(kind = %kind, rows = batch.len(), "upsert batch committed");
        Ok(batch.len())
    }
}

/// `INSERT … ON CONFLICT(external_id) DO UPDATE SET` every other column
fn upsert_sql(kind: EntityKind) -> String {
    let columns = kind.columns();
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let assignments = columns
        .iter()
        .filter(|c| **c != "external_id")
        .map(|c| format!("{c} = excluded.{c}"))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO {table} ({cols}) VALUES ({placeholders})
         ON CONFLICT(external_id) DO UPDATE SET {assignments}",
        table = kind.table(),
        cols = columns.join(", "),
    )
}
