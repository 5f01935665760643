//! Property Mapper
//!
//! Flattens the remote API's typed properties into mirror rows. Missing or
//! mistyped properties never fail a record; they map to `None`/empty.

use std::collections::HashMap;

use tracing::debug;

use super::models::{
    BudgetRow, EntityKind, EntityRow, InventoryItemRow, MirroredRow, PropertyValue, RawRecord,
    TransactionRow, WishlistItemRow,
};

/// Property names used by the source databases
pub mod props {
    pub const NAME: &str = "Name";
    pub const DESCRIPTION: &str = "Description";
    pub const AMOUNT: &str = "Amount";
    pub const DATE: &str = "Date";
    pub const CATEGORY: &str = "Category";
    pub const TAGS: &str = "Tags";
    pub const ACCOUNT: &str = "Account";
    pub const ENTITY: &str = "Entity";
    pub const RECONCILED: &str = "Reconciled";
    pub const RECEIPT: &str = "Receipt";
    pub const NOTES: &str = "Notes";
    pub const WEBSITE: &str = "Website";
    pub const ARCHIVED: &str = "Archived";
    pub const PERIOD: &str = "Period";
    pub const START_DATE: &str = "Start Date";
    pub const ACTIVE: &str = "Active";
    pub const QUANTITY: &str = "Quantity";
    pub const PURCHASE_PRICE: &str = "Purchase Price";
    pub const PURCHASE_DATE: &str = "Purchase Date";
    pub const LOCATION: &str = "Location";
    pub const PRICE: &str = "Price";
    pub const PRIORITY: &str = "Priority";
    pub const URL: &str = "URL";
    pub const PURCHASED: &str = "Purchased";
}

/// Lookups a mapping pass needs from rows already in the target store
#[derive(Debug, Clone, Default)]
pub struct MapContext {
    /// Counterparty `external_id → name`
    pub entity_names: HashMap<String, String>,
}

impl MapContext {
    pub fn new(entity_names: HashMap<String, String>) -> Self {
        Self { entity_names }
    }

    fn entity_name(&self, entity_id: Option<&String>) -> Option<String> {
        let id = entity_id?;
        let name = self.entity_names.get(id).cloned();
        if name.is_none() {
            debug!(entity_id = %id, "counterparty not mirrored yet, leaving name empty");
        }
        name
    }
}

/// Typed accessor over one raw record's properties
pub struct Properties<'a> {
    record: &'a RawRecord,
}

impl<'a> Properties<'a> {
    pub fn new(record: &'a RawRecord) -> Self {
        Self { record }
    }

    fn get(&self, name: &str) -> Option<&'a PropertyValue> {
        let value = self.record.properties.get(name);
        if value.is_none() {
            debug!(record = %self.record.id, property = name, "property missing");
        }
        value
    }

    fn mistyped(&self, name: &str, expected: &str) {
        debug!(
            record = %self.record.id,
            property = name,
            expected,
            "property has unexpected type"
        );
    }

    pub fn title(&self, name: &str) -> String {
        match self.get(name) {
            Some(PropertyValue::Title { title }) => join_spans(title),
            // Some databases keep the display name in a rich-text column
            Some(PropertyValue::RichText { rich_text }) => join_spans(rich_text),
            Some(_) => {
                self.mistyped(name, "title");
                String::new()
            }
            None => String::new(),
        }
    }

    pub fn rich_text(&self, name: &str) -> String {
        match self.get(name) {
            Some(PropertyValue::RichText { rich_text }) => join_spans(rich_text),
            Some(PropertyValue::Title { title }) => join_spans(title),
            Some(_) => {
                self.mistyped(name, "rich_text");
                String::new()
            }
            None => String::new(),
        }
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            PropertyValue::Number { number } => *number,
            _ => {
                self.mistyped(name, "number");
                None
            }
        }
    }

    pub fn select(&self, name: &str) -> Option<String> {
        match self.get(name)? {
            PropertyValue::Select { select } => select.as_ref().map(|s| s.name.clone()),
            _ => {
                self.mistyped(name, "select");
                None
            }
        }
    }

    pub fn multi_select(&self, name: &str) -> Vec<String> {
        match self.get(name) {
            Some(PropertyValue::MultiSelect { multi_select }) => {
                multi_select.iter().map(|s| s.name.clone()).collect()
            }
            Some(_) => {
                self.mistyped(name, "multi_select");
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    /// Start of the date range, as the API's ISO string
    pub fn date(&self, name: &str) -> Option<String> {
        match self.get(name)? {
            PropertyValue::Date { date } => date.as_ref().map(|d| d.start.clone()),
            _ => {
                self.mistyped(name, "date");
                None
            }
        }
    }

    pub fn checkbox(&self, name: &str) -> bool {
        match self.get(name) {
            Some(PropertyValue::Checkbox { checkbox }) => *checkbox,
            Some(_) => {
                self.mistyped(name, "checkbox");
                false
            }
            None => false,
        }
    }

    pub fn relation(&self, name: &str) -> Vec<String> {
        match self.get(name) {
            Some(PropertyValue::Relation { relation }) => {
                relation.iter().map(|r| r.id.clone()).collect()
            }
            Some(_) => {
                self.mistyped(name, "relation");
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    /// Scalar foreign key: the first related id. Further ids are dropped.
    pub fn first_relation(&self, name: &str) -> Option<String> {
        self.relation(name).into_iter().next()
    }

    pub fn url(&self, name: &str) -> Option<String> {
        match self.get(name)? {
            PropertyValue::Url { url } => url.clone(),
            _ => {
                self.mistyped(name, "url");
                None
            }
        }
    }

    /// Multi-select serialized for storage as a JSON array string
    pub fn tags(&self, name: &str) -> String {
        encode_tags(&self.multi_select(name))
    }
}

fn join_spans(spans: &[super::models::RichTextSpan]) -> String {
    spans.iter().map(|s| s.plain_text.as_str()).collect()
}

pub fn encode_tags(tags: &[String]) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string())
}

/// Map one raw record into the row shape of `kind`
pub fn map_record(kind: EntityKind, record: &RawRecord, ctx: &MapContext) -> MirroredRow {
    let p = Properties::new(record);
    let external_id = record.id.clone();
    let last_edited_at = record.last_edited_time;

    match kind {
        EntityKind::Entities => MirroredRow::Entity(EntityRow {
            external_id,
            name: p.title(props::NAME),
            category: p.select(props::CATEGORY),
            tags: p.tags(props::TAGS),
            website: p.url(props::WEBSITE),
            notes: p.rich_text(props::NOTES),
            archived: p.checkbox(props::ARCHIVED),
            last_edited_at,
        }),
        EntityKind::Transactions => {
            let entity_id = p.first_relation(props::ENTITY);
            MirroredRow::Transaction(TransactionRow {
                external_id,
                description: p.title(props::DESCRIPTION),
                amount: p.number(props::AMOUNT),
                date: p.date(props::DATE),
                category: p.select(props::CATEGORY),
                tags: p.tags(props::TAGS),
                account: p.select(props::ACCOUNT),
                entity_name: ctx.entity_name(entity_id.as_ref()),
                entity_id,
                reconciled: p.checkbox(props::RECONCILED),
                receipt_url: p.url(props::RECEIPT),
                notes: p.rich_text(props::NOTES),
                last_edited_at,
            })
        }
        EntityKind::Budgets => MirroredRow::Budget(BudgetRow {
            external_id,
            name: p.title(props::NAME),
            category: p.select(props::CATEGORY),
            amount: p.number(props::AMOUNT),
            period: p.select(props::PERIOD),
            start_date: p.date(props::START_DATE),
            active: p.checkbox(props::ACTIVE),
            last_edited_at,
        }),
        EntityKind::InventoryItems => {
            let entity_id = p.first_relation(props::ENTITY);
            MirroredRow::InventoryItem(InventoryItemRow {
                external_id,
                name: p.title(props::NAME),
                category: p.select(props::CATEGORY),
                quantity: p.number(props::QUANTITY),
                purchase_price: p.number(props::PURCHASE_PRICE),
                purchase_date: p.date(props::PURCHASE_DATE),
                entity_name: ctx.entity_name(entity_id.as_ref()),
                entity_id,
                location: p.select(props::LOCATION),
                tags: p.tags(props::TAGS),
                last_edited_at,
            })
        }
        EntityKind::WishlistItems => MirroredRow::WishlistItem(WishlistItemRow {
            external_id,
            name: p.title(props::NAME),
            price: p.number(props::PRICE),
            priority: p.select(props::PRIORITY),
            url: p.url(props::URL),
            tags: p.tags(props::TAGS),
            purchased: p.checkbox(props::PURCHASED),
            last_edited_at,
        }),
    }
}

/// Map a batch, preserving order
pub fn map_records(kind: EntityKind, records: &[RawRecord], ctx: &MapContext) -> Vec<MirroredRow> {
    records.iter().map(|r| map_record(kind, r, ctx)).collect()
}
