//! Sync Orchestrator
//!
//! Drives `LoadCursor → Fetch → Map → Write → AdvanceCursor` for every
//! configured source database against an explicitly supplied store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use super::fetcher::{DocumentApi, PageFetcher};
use super::mapper::{map_records, MapContext};
use super::models::EntityKind;
use super::progress::{ProgressTracker, SyncPhase};
use super::writer::UpsertWriter;
use crate::clock::Clock;
use crate::error::{StoreError, SyncError};
use crate::store::{Store, SyncRunRecord};

/// One source database and the kind it mirrors
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSource {
    pub kind: EntityKind,
    pub source_id: String,
}

/// Result of a pass that did not fail
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassOutcome {
    pub run_id: String,
    pub fetched: usize,
    pub written: usize,
    /// New cursor, if the pass moved it
    pub cursor: Option<DateTime<Utc>>,
}

/// Per-source entry of a sync-all run
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub kind: EntityKind,
    pub source_id: String,
    pub outcome: Option<PassOutcome>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Result of a sync-all run
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub passes: Vec<PassReport>,
}

impl SyncReport {
    pub fn failed(&self) -> usize {
        self.passes.iter().filter(|p| p.error.is_some()).count()
    }

    pub fn written(&self) -> usize {
        self.passes
            .iter()
            .filter_map(|p| p.outcome.as_ref())
            .map(|o| o.written)
            .sum()
    }
}

/// Statistics about sync operations
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    /// Total passes attempted
    pub total_passes: u64,
    pub successful_passes: u64,
    pub failed_passes: u64,
    /// Total rows upserted
    pub rows_written: u64,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// The sync driver
pub struct SyncOrchestrator<A> {
    fetcher: PageFetcher<A>,
    /// In dependency order
    sources: Vec<SyncSource>,
    progress: Arc<ProgressTracker>,
    stats: RwLock<SyncStats>,
    clock: Arc<dyn Clock>,
    /// One sync-all at a time
    run_lock: Mutex<()>,
}

impl<A: DocumentApi> SyncOrchestrator<A> {
    pub fn new(
        fetcher: PageFetcher<A>,
        sources: Vec<SyncSource>,
        progress: Arc<ProgressTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            fetcher,
            sources: order_sources(sources),
            progress,
            stats: RwLock::new(SyncStats::default()),
            clock,
            run_lock: Mutex::new(()),
        }
    }

    /// Sources in the order they will be synced
    pub fn sources(&self) -> &[SyncSource] {
        &self.sources
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    /// Sync every source into `store`, dependencies first. A failing source
    /// does not stop the others.
    pub async fn sync_all(&self, store: &Store) -> SyncReport {
        let _guard = self.run_lock.lock().await;
        let mut report = SyncReport::default();

        for source in &self.sources {
            let failed_dependency = source.kind.depends_on().iter().find(|dep| {
                report
                    .passes
                    .iter()
                    .any(|p| p.kind == **dep && p.error.is_some())
            });
            if let Some(dep) = failed_dependency {
                warn!(
                    kind = %source.kind,
                    dependency = %dep,
                    "dependency failed this run, denormalized names may be stale"
                );
            }

            let started = Instant::now();
            let result = self.sync_source(store, source).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let (outcome, error) = match result {
                Ok(outcome) => (Some(outcome), None),
                Err(e) => (None, Some(e.to_string())),
            };
            report.passes.push(PassReport {
                kind: source.kind,
                source_id: source.source_id.clone(),
                outcome,
                error,
                duration_ms,
            });
        }

        info!(
            store = %store.path().display(),
            passes = report.passes.len(),
            failed = report.failed(),
            written = report.written(),
            "sync run finished"
        );
        report
    }

    /// One pass for one source. The cursor only moves after the batch commits.
    pub async fn sync_source(
        &self,
        store: &Store,
        source: &SyncSource,
    ) -> Result<PassOutcome, SyncError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = self.clock.now();
        let pass = self.progress.begin(&run_id, &source.source_id, source.kind);

        let result = self.run_pass(store, source, &run_id).await;
        let finished_at = self.clock.now();

        let (status, phase) = match &result {
            Ok(o) if o.fetched == 0 => ("no_changes", SyncPhase::NoChanges),
            Ok(_) => ("succeeded", SyncPhase::Succeeded),
            Err(_) => ("failed", SyncPhase::Failed),
        };
        pass.finish(phase);

        let record = SyncRunRecord {
            id: run_id.clone(),
            source_id: source.source_id.clone(),
            kind: source.kind,
            started_at,
            finished_at,
            status: status.to_string(),
            fetched: result.as_ref().map(|o| o.fetched).unwrap_or(0),
            written: result.as_ref().map(|o| o.written).unwrap_or(0),
            error: result.as_ref().err().map(|e| e.to_string()),
        };
        let history = store.clone();
        if let Err(e) = blocking(move || history.record_sync_run(&record)).await {
            warn!(run_id = %run_id, error = %e, "failed to record sync run");
        }

        self.record_stats(&result, finished_at);
        match &result {
            Ok(o) => info!(
                kind = %source.kind,
                source_id = %source.source_id,
                fetched = o.fetched,
                written = o.written,
                "sync pass {}", status
            ),
            Err(e) => error!(
                kind = %source.kind,
                source_id = %source.source_id,
                retryable = e.is_retryable(),
                error = %e,
                "sync pass failed"
            ),
        }
        result
    }

    async fn run_pass(
        &self,
        store: &Store,
        source: &SyncSource,
        run_id: &str,
    ) -> Result<PassOutcome, SyncError> {
        let kind = source.kind;

        let reader = store.clone();
        let source_id = source.source_id.clone();
        let cursor = blocking(move || reader.load_cursor(&source_id)).await?;

        self.progress.set_phase(run_id, SyncPhase::Fetch);
        let progress = Arc::clone(&self.progress);
        let records = self
            .fetcher
            .fetch_since(
                &source.source_id,
                cursor.as_ref().map(|c| c.last_edited_at),
                |pages, total| progress.record_page(run_id, pages, total),
            )
            .await
            .map_err(|error| SyncError::Fetch {
                source_id: source.source_id.clone(),
                error,
            })?;

        if records.is_empty() {
            return Ok(PassOutcome {
                run_id: run_id.to_string(),
                fetched: 0,
                written: 0,
                cursor: None,
            });
        }

        self.progress.set_phase(run_id, SyncPhase::Map);
        let ctx = if kind.depends_on().contains(&EntityKind::Entities) {
            let reader = store.clone();
            MapContext::new(blocking(move || reader.entity_names()).await?)
        } else {
            MapContext::default()
        };
        let rows = map_records(kind, &records, &ctx);
        let high_water = rows.iter().map(|r| r.last_edited_at()).max();

        self.progress.set_phase(run_id, SyncPhase::Write);
        let writer = UpsertWriter::new(store.clone());
        let written = blocking(move || writer.write_batch(kind, &rows)).await?;

        self.progress.set_phase(run_id, SyncPhase::AdvanceCursor);
        let mut moved_to = None;
        if let Some(ts) = high_water {
            let cursors = store.clone();
            let source_id = source.source_id.clone();
            if blocking(move || cursors.advance_cursor(&source_id, ts)).await? {
                moved_to = Some(ts);
            }
        }

        Ok(PassOutcome {
            run_id: run_id.to_string(),
            fetched: records.len(),
            written,
            cursor: moved_to,
        })
    }

    fn record_stats(&self, result: &Result<PassOutcome, SyncError>, at: DateTime<Utc>) {
        let mut stats = self.stats.write();
        stats.total_passes += 1;
        stats.last_sync = Some(at);
        match result {
            Ok(o) => {
                stats.successful_passes += 1;
                stats.rows_written += o.written as u64;
            }
            Err(e) => {
                stats.failed_passes += 1;
                stats.last_error = Some(e.to_string());
            }
        }
    }

    /// Run `sync_all` every `interval` until `shutdown` flips to true.
    pub async fn run_periodic(
        &self,
        store: Store,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if interval.is_zero() {
            warn!("scheduled sync interval is zero, not starting");
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "scheduled sync started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sync_all(&store).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("scheduled sync stopped");
    }
}

/// Order sources so every kind comes after the kinds it depends on.
/// Otherwise configuration order is kept.
pub fn order_sources(sources: Vec<SyncSource>) -> Vec<SyncSource> {
    let mut pending = sources;
    let mut ordered: Vec<SyncSource> = Vec::with_capacity(pending.len());

    while !pending.is_empty() {
        let ready = pending.iter().position(|candidate| {
            candidate.kind.depends_on().iter().all(|dep| {
                !pending
                    .iter()
                    .any(|other| other.kind == *dep && other.kind != candidate.kind)
            })
        });
        // Dependencies are static and acyclic, so something is always ready
        let index = ready.unwrap_or(0);
        ordered.push(pending.remove(index));
    }
    ordered
}

/// Run blocking store work off the async executor
async fn blocking<T, F>(job: F) -> Result<T, SyncError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(job).await??)
}
