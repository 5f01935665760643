//! Shared test doubles

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};

use opsmirror::clock::{Clock, ManualClock};
use opsmirror::error::ApiError;
use opsmirror::sync::{
    DocumentApi, EntityKind, FetchPolicy, PageFetcher, ProgressTracker, QueryPage, QueryRequest,
    RawRecord, SyncOrchestrator, SyncSource,
};

/// In-memory remote: records per source database, served in ascending edit
/// order and honoring the `edited_after` filter.
#[derive(Default)]
pub struct FakeApi {
    databases: Mutex<HashMap<String, Vec<RawRecord>>>,
    /// (source id, page index) pairs that fail with a 400
    failing_pages: Mutex<HashSet<(String, usize)>>,
    pub requests: Mutex<Vec<QueryRequest>>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert or replace a record
    pub fn put(&self, source_id: &str, record: RawRecord) {
        let mut dbs = self.databases.lock();
        let records = dbs.entry(source_id.to_string()).or_default();
        records.retain(|r| r.id != record.id);
        records.push(record);
    }

    pub fn fail_page(&self, source_id: &str, page: usize) {
        self.failing_pages
            .lock()
            .insert((source_id.to_string(), page));
    }

    pub fn heal(&self) {
        self.failing_pages.lock().clear();
    }
}

impl DocumentApi for FakeApi {
    async fn query(&self, request: &QueryRequest) -> Result<QueryPage, ApiError> {
        self.requests.lock().push(request.clone());

        let offset: usize = request
            .start_cursor
            .as_deref()
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let page_index = offset / request.page_size as usize;
        if self
            .failing_pages
            .lock()
            .contains(&(request.source_id.clone(), page_index))
        {
            return Err(ApiError::Status {
                status: 400,
                message: "injected failure".into(),
            });
        }

        let mut matching: Vec<RawRecord> = self
            .databases
            .lock()
            .get(&request.source_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|r| request.edited_after.map_or(true, |after| r.last_edited_time > after))
            .collect();
        matching.sort_by_key(|r| r.last_edited_time);

        let end = (offset + request.page_size as usize).min(matching.len());
        let results = matching.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let has_more = end < matching.len();
        Ok(QueryPage {
            results,
            has_more,
            next_cursor: has_more.then(|| end.to_string()),
        })
    }
}

pub fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 0).unwrap()
}

pub fn record(id: &str, edited: DateTime<Utc>, properties: Value) -> RawRecord {
    serde_json::from_value(json!({
        "id": id,
        "last_edited_time": edited.to_rfc3339(),
        "properties": properties,
    }))
    .unwrap()
}

pub fn entity(id: &str, name: &str, edited: DateTime<Utc>) -> RawRecord {
    record(
        id,
        edited,
        json!({ "Name": { "type": "title", "title": [{ "plain_text": name }] } }),
    )
}

pub fn transaction(
    id: &str,
    description: &str,
    entity_id: &str,
    edited: DateTime<Utc>,
) -> RawRecord {
    record(
        id,
        edited,
        json!({
            "Description": { "type": "title", "title": [{ "plain_text": description }] },
            "Amount": { "type": "number", "number": -12.5 },
            "Entity": { "type": "relation", "relation": [{ "id": entity_id }] },
        }),
    )
}

pub fn budget(
    id: &str,
    name: &str,
    category: Option<&str>,
    tags: &[&str],
    edited: DateTime<Utc>,
) -> RawRecord {
    let select = category.map(|c| json!({ "name": c }));
    let tags: Vec<Value> = tags.iter().map(|t| json!({ "name": t })).collect();
    record(
        id,
        edited,
        json!({
            "Name": { "type": "title", "title": [{ "plain_text": name }] },
            "Category": { "type": "select", "select": select },
            "Tags": { "type": "multi_select", "multi_select": tags },
        }),
    )
}

pub fn fast_policy(page_size: u32) -> FetchPolicy {
    FetchPolicy {
        page_size,
        page_delay: Duration::from_millis(1),
        max_retries: 0,
        retry_backoff: Duration::from_millis(1),
    }
}

pub fn source(kind: EntityKind) -> SyncSource {
    SyncSource {
        kind,
        source_id: format!("db-{kind}"),
    }
}

pub fn orchestrator(
    api: Arc<FakeApi>,
    sources: Vec<SyncSource>,
    page_size: u32,
) -> SyncOrchestrator<Arc<FakeApi>> {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(at(0)));
    let progress = Arc::new(ProgressTracker::new(chrono::Duration::seconds(60), clock.clone()));
    SyncOrchestrator::new(
        PageFetcher::new(api, fast_policy(page_size)),
        sources,
        progress,
        clock,
    )
}
