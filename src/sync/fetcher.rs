//! Page Fetcher
//!
//! Pulls every record edited after a cursor from one source database, one
//! page at a time, pacing requests to stay under the remote rate limit.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::models::RawRecord;
use crate::config::ApiConfig;
use crate::error::ApiError;

/// One query against a source database
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub source_id: String,
    /// Only records edited strictly after this instant
    pub edited_after: Option<DateTime<Utc>>,
    pub page_size: u32,
    pub start_cursor: Option<String>,
}

/// One page of results
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryPage {
    pub results: Vec<RawRecord>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// The remote query call. Results are sorted ascending by last-edited time.
pub trait DocumentApi: Send + Sync {
    fn query(
        &self,
        request: &QueryRequest,
    ) -> impl Future<Output = Result<QueryPage, ApiError>> + Send;
}

impl<T: DocumentApi> DocumentApi for Arc<T> {
    fn query(
        &self,
        request: &QueryRequest,
    ) -> impl Future<Output = Result<QueryPage, ApiError>> + Send {
        T::query(self, request)
    }
}

/// Reqwest-backed [`DocumentApi`]
pub struct HttpDocumentApi {
    client: Client,
    base_url: String,
}

impl HttpDocumentApi {
    pub fn new(config: &ApiConfig, token: &str) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| ApiError::InvalidToken)?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(version) = HeaderValue::from_str(&config.api_version) {
            headers.insert("notion-version", version);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn request_body(request: &QueryRequest) -> serde_json::Value {
        let mut body = json!({
            "sorts": [{ "timestamp": "last_edited_time", "direction": "ascending" }],
            "page_size": request.page_size,
        });
        if let Some(after) = request.edited_after {
            body["filter"] = json!({
                "timestamp": "last_edited_time",
                "last_edited_time": {
                    "after": after.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
                }
            });
        }
        if let Some(cursor) = &request.start_cursor {
            body["start_cursor"] = json!(cursor);
        }
        body
    }
}

impl DocumentApi for HttpDocumentApi {
    async fn query(&self, request: &QueryRequest) -> Result<QueryPage, ApiError> {
        let url = format!("{}/databases/{}/query", self.base_url, request.source_id);
        let response = self
            .client
            .post(&url)
            .json(&Self::request_body(request))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ApiError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Pacing and retry policy for a fetch
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub page_size: u32,
    pub page_delay: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self::from(&ApiConfig::default())
    }
}

impl From<&ApiConfig> for FetchPolicy {
    fn from(config: &ApiConfig) -> Self {
        Self {
            page_size: config.page_size,
            page_delay: config.page_delay(),
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff(),
        }
    }
}

/// Paginating fetcher over a [`DocumentApi`]
pub struct PageFetcher<A> {
    api: A,
    policy: FetchPolicy,
}

impl<A: DocumentApi> PageFetcher<A> {
    pub fn new(api: A, policy: FetchPolicy) -> Self {
        Self { api, policy }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Fetch all records of `source_id` edited after `cursor`, in ascending
    /// edit order. A page that still fails after its retries discards the
    /// pages fetched so far; the caller's cursor stays where it was.
    pub async fn fetch_since(
        &self,
        source_id: &str,
        cursor: Option<DateTime<Utc>>,
        mut on_page: impl FnMut(usize, usize),
    ) -> Result<Vec<RawRecord>, ApiError> {
        let mut records = Vec::new();
        let mut request = QueryRequest {
            source_id: source_id.to_string(),
            edited_after: cursor,
            page_size: self.policy.page_size,
            start_cursor: None,
        };
        let mut pages = 0usize;

        loop {
            if pages > 0 {
                tokio::time::sleep(self.policy.page_delay).await;
            }

            let page = self.query_with_retry(&request).await?;
            pages += 1;
            records.extend(page.results);
            on_page(pages, records.len());
            debug!(source_id, pages, records = records.len(), "fetched page");

            match (page.has_more, page.next_cursor) {
                (true, Some(next)) => request.start_cursor = Some(next),
                (true, None) => {
                    warn!(source_id, "remote reported more pages without a cursor");
                    break;
                }
                (false, _) => break,
            }
        }

        if !records.is_empty() {
            info!(source_id, pages, records = records.len(), "fetch complete");
        }
        Ok(records)
    }

    async fn query_with_retry(&self, request: &QueryRequest) -> Result<QueryPage, ApiError> {
        let mut attempt = 0u32;
        loop {
            match self.api.query(request).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() && attempt < self.policy.max_retries => {
                    attempt += 1;
                    let wait = e
                        .retry_after()
                        .unwrap_or(self.policy.retry_backoff * attempt);
                    warn!(
                        source_id = %request.source_id,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "transient fetch failure, retrying page"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::mapper::{map_record, MapContext};
    use crate::sync::models::{EntityKind, MirroredRow};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    fn raw(id: &str) -> RawRecord {
        serde_json::from_value(json!({
            "id": id,
            "last_edited_time": "2024-01-01T00:00:00.000Z",
            "properties": {}
        }))
        .unwrap()
    }

    /// Replays scripted responses and records the requests it saw
    struct ScriptedApi {
        responses: Mutex<VecDeque<Result<QueryPage, ApiError>>>,
        seen: Mutex<Vec<QueryRequest>>,
    }

    impl ScriptedApi {
        fn new(responses: Vec<Result<QueryPage, ApiError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl DocumentApi for ScriptedApi {
        async fn query(&self, request: &QueryRequest) -> Result<QueryPage, ApiError> {
            self.seen.lock().push(request.clone());
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(QueryPage::default()))
        }
    }

    fn fast_policy(max_retries: u32) -> FetchPolicy {
        FetchPolicy {
            page_size: 2,
            page_delay: Duration::from_millis(1),
            max_retries,
            retry_backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_concatenates_pages_in_order() {
        let api = ScriptedApi::new(vec![
            Ok(QueryPage {
                results: vec![raw("a"), raw("b")],
                has_more: true,
                next_cursor: Some("c1".into()),
            }),
            Ok(QueryPage {
                results: vec![raw("c")],
                has_more: false,
                next_cursor: None,
            }),
        ]);
        let fetcher = PageFetcher::new(api, fast_policy(0));
        let records = fetcher.fetch_since("db", None, |_, _| {}).await.unwrap();

        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);

        let seen = fetcher.api().seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].start_cursor, None);
        assert_eq!(seen[1].start_cursor.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_passes_cursor_as_filter() {
        let cursor = Utc::now();
        let fetcher = PageFetcher::new(ScriptedApi::new(vec![]), fast_policy(0));
        let records = fetcher
            .fetch_since("db", Some(cursor), |_, _| {})
            .await
            .unwrap();
        assert!(records.is_empty());
        assert_eq!(fetcher.api().seen.lock()[0].edited_after, Some(cursor));
    }

    #[tokio::test]
    async fn test_mid_pagination_failure_discards_partial_batch() {
        let api = ScriptedApi::new(vec![
            Ok(QueryPage {
                results: vec![raw("a")],
                has_more: true,
                next_cursor: Some("c1".into()),
            }),
            Err(ApiError::Status {
                status: 400,
                message: "bad cursor".into(),
            }),
        ]);
        let fetcher = PageFetcher::new(api, fast_policy(3));
        let err = fetcher.fetch_since("db", None, |_, _| {}).await.unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let api = ScriptedApi::new(vec![
            Err(ApiError::RateLimited { retry_after: None }),
            Ok(QueryPage {
                results: vec![raw("a")],
                has_more: false,
                next_cursor: None,
            }),
        ]);
        let fetcher = PageFetcher::new(api, fast_policy(2));
        let records = fetcher.fetch_since("db", None, |_, _| {}).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(fetcher.api().seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_no_retry_when_disabled() {
        let api = ScriptedApi::new(vec![Err(ApiError::RateLimited { retry_after: None })]);
        let fetcher = PageFetcher::new(api, fast_policy(0));
        assert!(fetcher.fetch_since("db", None, |_, _| {}).await.is_err());
    }

    #[test]
    fn test_token_with_control_characters_is_rejected() {
        let err = HttpDocumentApi::new(&ApiConfig::default(), "secret\nvalue")
            .err()
            .unwrap();
        assert!(matches!(err, ApiError::InvalidToken));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_request_body_shape() {
        let after = DateTime::parse_from_rfc3339("2024-02-01T08:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let body = HttpDocumentApi::request_body(&QueryRequest {
            source_id: "db".into(),
            edited_after: Some(after),
            page_size: 100,
            start_cursor: Some("next".into()),
        });
        assert_eq!(body["page_size"], 100);
        assert_eq!(body["sorts"][0]["direction"], "ascending");
        assert_eq!(
            body["filter"]["last_edited_time"]["after"],
            "2024-02-01T08:30:00.000Z"
        );
        assert_eq!(body["start_cursor"], "next");
    }

    #[test]
    fn test_malformed_property_does_not_reject_page() {
        let body = json!({
            "results": [
                {
                    "id": "good",
                    "last_edited_time": "2024-01-01T00:00:00.000Z",
                    "properties": { "Amount": { "type": "number", "number": 4.0 } }
                },
                {
                    "id": "bad",
                    "last_edited_time": "2024-01-01T00:01:00.000Z",
                    "properties": {
                        "Description": { "type": "title", "title": [{ "plain_text": "Milk" }] },
                        "Amount": { "type": "number", "number": "twelve" }
                    }
                }
            ],
            "has_more": false,
            "next_cursor": null
        });
        let page: QueryPage = serde_json::from_slice(&serde_json::to_vec(&body).unwrap()).unwrap();
        assert_eq!(page.results.len(), 2);

        let row = map_record(
            EntityKind::Transactions,
            &page.results[1],
            &MapContext::default(),
        );
        match row {
            MirroredRow::Transaction(t) => {
                assert_eq!(t.description, "Milk");
                assert_eq!(t.amount, None);
            }
            other => panic!("unexpected row {other:?}"),
        }
    }
}
