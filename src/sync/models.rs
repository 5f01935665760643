//! Data Models for the Mirror
//!
//! Raw records as returned by the remote document API, and the flat row
//! shapes they are mirrored into.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

/// A mirrored entity kind. Each kind lives in its own table and is pulled from
/// its own source database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Counterparties (merchants, people, institutions)
    Entities,
    Transactions,
    Budgets,
    InventoryItems,
    WishlistItems,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Entities,
        EntityKind::Transactions,
        EntityKind::Budgets,
        EntityKind::InventoryItems,
        EntityKind::WishlistItems,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Entities => "entities",
            EntityKind::Transactions => "transactions",
            EntityKind::Budgets => "budgets",
            EntityKind::InventoryItems => "inventory_items",
            EntityKind::WishlistItems => "wishlist_items",
        }
    }

    /// Table holding this kind's rows
    pub fn table(&self) -> &'static str {
        self.as_str()
    }

    /// Kinds whose rows must already be mirrored before this kind is mapped.
    /// Transactions and inventory items cache their counterparty's name.
    pub fn depends_on(&self) -> &'static [EntityKind] {
        match self {
            EntityKind::Transactions | EntityKind::InventoryItems => &[EntityKind::Entities],
            _ => &[],
        }
    }

    /// Columns in insertion order; `external_id` first, `last_edited_at` last.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Entities => &[
                "external_id",
                "name",
                "category",
                "tags",
                "website",
                "notes",
                "archived",
                "last_edited_at",
            ],
            EntityKind::Transactions => &[
                "external_id",
                "description",
                "amount",
                "date",
                "category",
                "tags",
                "account",
                "entity_id",
                "entity_name",
                "reconciled",
                "receipt_url",
                "notes",
                "last_edited_at",
            ],
            EntityKind::Budgets => &[
                "external_id",
                "name",
                "category",
                "amount",
                "period",
                "start_date",
                "active",
                "last_edited_at",
            ],
            EntityKind::InventoryItems => &[
                "external_id",
                "name",
                "category",
                "quantity",
                "purchase_price",
                "purchase_date",
                "entity_id",
                "entity_name",
                "location",
                "tags",
                "last_edited_at",
            ],
            EntityKind::WishlistItems => &[
                "external_id",
                "name",
                "price",
                "priority",
                "url",
                "tags",
                "purchased",
                "last_edited_at",
            ],
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown entity kind: {s}"))
    }
}

/// One record (page) as returned by the remote query API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: String,
    pub last_edited_time: DateTime<Utc>,
    #[serde(default, deserialize_with = "lenient_properties")]
    pub properties: HashMap<String, PropertyValue>,
}

/// Decode each property on its own. A property whose value does not match
/// its `type` becomes [`PropertyValue::Unsupported`] instead of failing the
/// whole page.
fn lenient_properties<'de, D>(deserializer: D) -> Result<HashMap<String, PropertyValue>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<HashMap<String, serde_json::Value>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(name, value)| {
            let parsed = serde_json::from_value(value).unwrap_or_else(|e| {
                warn!(property = %name, error = %e, "malformed property, ignoring its value");
                PropertyValue::Unsupported
            });
            (name, parsed)
        })
        .collect())
}

/// Typed property value, discriminated by the API's `type` field
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PropertyValue {
    Title {
        #[serde(default)]
        title: Vec<RichTextSpan>,
    },
    RichText {
        #[serde(default)]
        rich_text: Vec<RichTextSpan>,
    },
    Number {
        #[serde(default)]
        number: Option<f64>,
    },
    Select {
        #[serde(default)]
        select: Option<SelectOption>,
    },
    MultiSelect {
        #[serde(default)]
        multi_select: Vec<SelectOption>,
    },
    Date {
        #[serde(default)]
        date: Option<DateRange>,
    },
    Checkbox {
        #[serde(default)]
        checkbox: bool,
    },
    Relation {
        #[serde(default)]
        relation: Vec<RelationRef>,
    },
    Url {
        #[serde(default)]
        url: Option<String>,
    },
    /// Formulas, rollups, people, files, ...
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RichTextSpan {
    #[serde(default)]
    pub plain_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectOption {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DateRange {
    pub start: String,
    #[serde(default)]
    pub end: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationRef {
    pub id: String,
}

/// Resumable watermark for one source database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub source_id: String,
    pub last_edited_at: DateTime<Utc>,
}

/// A counterparty row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub external_id: String,
    pub name: String,
    pub category: Option<String>,
    /// JSON array string
    pub tags: String,
    pub website: Option<String>,
    pub notes: String,
    pub archived: bool,
    pub last_edited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRow {
    pub external_id: String,
    pub description: String,
    pub amount: Option<f64>,
    pub date: Option<String>,
    pub category: Option<String>,
    pub tags: String,
    pub account: Option<String>,
    pub entity_id: Option<String>,
    /// Denormalized from the counterparty row at sync time
    pub entity_name: Option<String>,
    pub reconciled: bool,
    pub receipt_url: Option<String>,
    pub notes: String,
    pub last_edited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetRow {
    pub external_id: String,
    pub name: String,
    pub category: Option<String>,
    pub amount: Option<f64>,
    pub period: Option<String>,
    pub start_date: Option<String>,
    pub active: bool,
    pub last_edited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryItemRow {
    pub external_id: String,
    pub name: String,
    pub category: Option<String>,
    pub quantity: Option<f64>,
    pub purchase_price: Option<f64>,
    pub purchase_date: Option<String>,
    pub entity_id: Option<String>,
    pub entity_name: Option<String>,
    pub location: Option<String>,
    pub tags: String,
    pub last_edited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WishlistItemRow {
    pub external_id: String,
    pub name: String,
    pub price: Option<f64>,
    pub priority: Option<String>,
    pub url: Option<String>,
    pub tags: String,
    pub purchased: bool,
    pub last_edited_at: DateTime<Utc>,
}

/// A flat row ready for the upsert writer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MirroredRow {
    Entity(EntityRow),
    Transaction(TransactionRow),
    Budget(BudgetRow),
    InventoryItem(InventoryItemRow),
    WishlistItem(WishlistItemRow),
}

impl MirroredRow {
    pub fn kind(&self) -> EntityKind {
        match self {
            MirroredRow::Entity(_) => EntityKind::Entities,
            MirroredRow::Transaction(_) => EntityKind::Transactions,
            MirroredRow::Budget(_) => EntityKind::Budgets,
            MirroredRow::InventoryItem(_) => EntityKind::InventoryItems,
            MirroredRow::WishlistItem(_) => EntityKind::WishlistItems,
        }
    }

    pub fn external_id(&self) -> &str {
        match self {
            MirroredRow::Entity(r) => &r.external_id,
            MirroredRow::Transaction(r) => &r.external_id,
            MirroredRow::Budget(r) => &r.external_id,
            MirroredRow::InventoryItem(r) => &r.external_id,
            MirroredRow::WishlistItem(r) => &r.external_id,
        }
    }

    pub fn last_edited_at(&self) -> DateTime<Utc> {
        match self {
            MirroredRow::Entity(r) => r.last_edited_at,
            MirroredRow::Transaction(r) => r.last_edited_at,
            MirroredRow::Budget(r) => r.last_edited_at,
            MirroredRow::InventoryItem(r) => r.last_edited_at,
            MirroredRow::WishlistItem(r) => r.last_edited_at,
        }
    }

    /// Column values in the order of [`EntityKind::columns`]
    pub fn sql_values(&self) -> Vec<SqlValue> {
        match self {
            MirroredRow::Entity(r) => vec![
                text(&r.external_id),
                text(&r.name),
                opt_text(&r.category),
                text(&r.tags),
                opt_text(&r.website),
                text(&r.notes),
                flag(r.archived),
                timestamp(r.last_edited_at),
            ],
            MirroredRow::Transaction(r) => vec![
                text(&r.external_id),
                text(&r.description),
                opt_real(r.amount),
                opt_text(&r.date),
                opt_text(&r.category),
                text(&r.tags),
                opt_text(&r.account),
                opt_text(&r.entity_id),
                opt_text(&r.entity_name),
                flag(r.reconciled),
                opt_text(&r.receipt_url),
                text(&r.notes),
                timestamp(r.last_edited_at),
            ],
            MirroredRow::Budget(r) => vec![
                text(&r.external_id),
                text(&r.name),
                opt_text(&r.category),
                opt_real(r.amount),
                opt_text(&r.period),
                opt_text(&r.start_date),
                flag(r.active),
                timestamp(r.last_edited_at),
            ],
            MirroredRow::InventoryItem(r) => vec![
                text(&r.external_id),
                text(&r.name),
                opt_text(&r.category),
                opt_real(r.quantity),
                opt_real(r.purchase_price),
                opt_text(&r.purchase_date),
                opt_text(&r.entity_id),
                opt_text(&r.entity_name),
                opt_text(&r.location),
                text(&r.tags),
                timestamp(r.last_edited_at),
            ],
            MirroredRow::WishlistItem(r) => vec![
                text(&r.external_id),
                text(&r.name),
                opt_real(r.price),
                opt_text(&r.priority),
                opt_text(&r.url),
                text(&r.tags),
                flag(r.purchased),
                timestamp(r.last_edited_at),
            ],
        }
    }
}

/// Canonical text form for stored timestamps. Fixed precision keeps the
/// column lexicographically ordered.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn text(s: &str) -> SqlValue {
    SqlValue::Text(s.to_string())
}

fn opt_text(s: &Option<String>) -> SqlValue {
    s.as_ref()
        .map(|v| SqlValue::Text(v.clone()))
        .unwrap_or(SqlValue::Null)
}

fn opt_real(v: Option<f64>) -> SqlValue {
    v.map(SqlValue::Real).unwrap_or(SqlValue::Null)
}

fn flag(b: bool) -> SqlValue {
    SqlValue::Integer(i64::from(b))
}

fn timestamp(ts: DateTime<Utc>) -> SqlValue {
    SqlValue::Text(format_timestamp(ts))
}
