//! Seeding for new environment stores

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EnvError, Result, StoreError};
use crate::store::Store;
use crate::sync::mapper::encode_tags;
use crate::sync::models::{
    BudgetRow, EntityKind, EntityRow, InventoryItemRow, MirroredRow, TransactionRow,
    WishlistItemRow,
};
use crate::sync::writer::UpsertWriter;

/// How a new environment's store is populated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedMode {
    /// Schema only
    #[default]
    Empty,
    /// Snapshot of the production store
    Production,
    /// Schema plus a small canned dataset
    Fixtures,
}

impl SeedMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeedMode::Empty => "empty",
            SeedMode::Production => "production",
            SeedMode::Fixtures => "fixtures",
        }
    }
}

impl fmt::Display for SeedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeedMode {
    type Err = EnvError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "empty" => Ok(SeedMode::Empty),
            "production" => Ok(SeedMode::Production),
            "fixtures" => Ok(SeedMode::Fixtures),
            other => Err(EnvError::UnknownSeedMode(other.to_string())),
        }
    }
}

/// Create and populate a store file at `path`.
///
/// `production` is required for [`SeedMode::Production`]. On error the caller
/// owns cleanup of any partially written file.
pub fn provision(
    path: &Path,
    mode: SeedMode,
    production: Option<&Store>,
    busy_timeout: std::time::Duration,
) -> std::result::Result<Store, EnvError> {
    match mode {
        SeedMode::Empty => Ok(Store::open(path, busy_timeout)?),
        SeedMode::Production => {
            let source = production.ok_or_else(|| {
                EnvError::SeedUnavailable("no production store configured".to_string())
            })?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
            source.snapshot_to(path)?;
            // Reopen so the snapshot gets the same pragmas as any other store
            Ok(Store::open(path, busy_timeout)?)
        }
        SeedMode::Fixtures => {
            let store = Store::open(path, busy_timeout)?;
            let written = load_fixtures(&store)?;
            info!(path = %path.display(), rows = written, "seeded fixtures");
            Ok(store)
        }
    }
}

/// Write the canned dataset into `store`, counterparties first.
pub fn load_fixtures(store: &Store) -> Result<usize> {
    let writer = UpsertWriter::new(store.clone());
    let mut written = 0;
    for kind in EntityKind::ALL {
        let rows: Vec<MirroredRow> = fixture_rows()
            .into_iter()
            .filter(|row| row.kind() == kind)
            .collect();
        written += writer.write_batch(kind, &rows)?;
    }
    Ok(written)
}

fn fixture_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

fn tags(values: &[&str]) -> String {
    encode_tags(&values.iter().map(|s| s.to_string()).collect::<Vec<_>>())
}

fn fixture_rows() -> Vec<MirroredRow> {
    let at = fixture_time();
    vec![
        MirroredRow::Entity(EntityRow {
            external_id: "fixture-entity-grocer".into(),
            name: "Corner Grocer".into(),
            category: Some("Merchant".into()),
            tags: tags(&["food"]),
            website: Some("https://grocer.example".into()),
            notes: String::new(),
            archived: false,
            last_edited_at: at,
        }),
        MirroredRow::Entity(EntityRow {
            external_id: "fixture-entity-landlord".into(),
            name: "Hillside Lettings".into(),
            category: Some("Housing".into()),
            tags: tags(&[]),
            website: None,
            notes: "Rent paid monthly".into(),
            archived: false,
            last_edited_at: at,
        }),
        MirroredRow::Transaction(TransactionRow {
            external_id: "fixture-tx-groceries".into(),
            description: "Weekly groceries".into(),
            amount: Some(-84.20),
            date: Some("2024-01-03".into()),
            category: Some("Food".into()),
            tags: tags(&["food", "weekly"]),
            account: Some("Checking".into()),
            entity_id: Some("fixture-entity-grocer".into()),
            entity_name: Some("Corner Grocer".into()),
            reconciled: true,
            receipt_url: None,
            notes: String::new(),
            last_edited_at: at,
        }),
        MirroredRow::Transaction(TransactionRow {
            external_id: "fixture-tx-rent".into(),
            description: "January rent".into(),
            amount: Some(-1450.0),
            date: Some("2024-01-01".into()),
            category: Some("Housing".into()),
            tags: tags(&[]),
            account: Some("Checking".into()),
            entity_id: Some("fixture-entity-landlord".into()),
            entity_name: Some("Hillside Lettings".into()),
            reconciled: false,
            receipt_url: None,
            notes: String::new(),
            last_edited_at: at,
        }),
        MirroredRow::Budget(BudgetRow {
            external_id: "fixture-budget-food".into(),
            name: "Food".into(),
            category: Some("Food".into()),
            amount: Some(400.0),
            period: Some("Monthly".into()),
            start_date: Some("2024-01-01".into()),
            active: true,
            last_edited_at: at,
        }),
        MirroredRow::InventoryItem(InventoryItemRow {
            external_id: "fixture-item-blender".into(),
            name: "Blender".into(),
            category: Some("Kitchen".into()),
            quantity: Some(1.0),
            purchase_price: Some(59.99),
            purchase_date: Some("2023-11-20".into()),
            entity_id: Some("fixture-entity-grocer".into()),
            entity_name: Some("Corner Grocer".into()),
            location: Some("Kitchen".into()),
            tags: tags(&["appliance"]),
            last_edited_at: at,
        }),
        MirroredRow::WishlistItem(WishlistItemRow {
            external_id: "fixture-wish-kettle".into(),
            name: "Gooseneck kettle".into(),
            price: Some(45.0),
            priority: Some("Medium".into()),
            url: Some("https://shop.example/kettle".into()),
            tags: tags(&["kitchen"]),
            purchased: false,
            last_edited_at: at,
        }),
    ]
}
