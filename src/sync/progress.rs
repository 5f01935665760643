//! In-memory sync progress
//!
//! Each pass gets an entry that is visible while it runs and for a retention
//! window afterwards. Entries carry their own expiry timestamp and are evicted
//! by the periodic sweep, never by per-entry timers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;

use super::models::EntityKind;
use crate::clock::Clock;
use crate::env::watcher::Sweep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    LoadCursor,
    Fetch,
    Map,
    Write,
    AdvanceCursor,
    Succeeded,
    NoChanges,
    Failed,
}

impl SyncPhase {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            SyncPhase::Succeeded | SyncPhase::NoChanges | SyncPhase::Failed
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncProgress {
    pub run_id: String,
    pub source_id: String,
    pub kind: EntityKind,
    pub phase: SyncPhase,
    pub pages_fetched: usize,
    pub records_fetched: usize,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Eviction deadline; `None` while the pass is still running
    pub expires_at: Option<DateTime<Utc>>,
}

/// Shared progress table
pub struct ProgressTracker {
    entries: RwLock<HashMap<String, SyncProgress>>,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl ProgressTracker {
    pub fn new(retention: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            retention,
            clock,
        }
    }

    pub fn start(&self, run_id: &str, source_id: &str, kind: EntityKind) {
        let now = self.clock.now();
        self.entries.write().insert(
            run_id.to_string(),
            SyncProgress {
                run_id: run_id.to_string(),
                source_id: source_id.to_string(),
                kind,
                phase: SyncPhase::LoadCursor,
                pages_fetched: 0,
                records_fetched: 0,
                started_at: now,
                updated_at: now,
                expires_at: None,
            },
        );
    }

    /// Start an entry tied to the returned guard. Dropping the guard before
    /// [`PassGuard::finish`] marks the entry failed, so a cancelled pass still
    /// gets an expiry.
    pub fn begin(&self, run_id: &str, source_id: &str, kind: EntityKind) -> PassGuard<'_> {
        self.start(run_id, source_id, kind);
        PassGuard {
            tracker: self,
            run_id: run_id.to_string(),
        }
    }

    pub fn set_phase(&self, run_id: &str, phase: SyncPhase) {
        let now = self.clock.now();
        if let Some(entry) = self.entries.write().get_mut(run_id) {
            entry.phase = phase;
            entry.updated_at = now;
            if phase.is_finished() {
                entry.expires_at = Some(now + self.retention);
            }
        }
    }

    pub fn record_page(&self, run_id: &str, pages: usize, records: usize) {
        let now = self.clock.now();
        if let Some(entry) = self.entries.write().get_mut(run_id) {
            entry.pages_fetched = pages;
            entry.records_fetched = records;
            entry.updated_at = now;
        }
    }

    pub fn get(&self, run_id: &str) -> Option<SyncProgress> {
        self.entries.read().get(run_id).cloned()
    }

    /// Entries not yet past their expiry, oldest first
    pub fn snapshot(&self) -> Vec<SyncProgress> {
        let now = self.clock.now();
        let mut entries: Vec<_> = self
            .entries
            .read()
            .values()
            .filter(|e| e.expires_at.map_or(true, |t| now <= t))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.started_at);
        entries
    }

    /// Drop every entry past its expiry. Returns how many were removed.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at.map_or(true, |t| now <= t));
        before - entries.len()
    }
}

/// Finishes a progress entry exactly once, on success, failure or cancellation
pub struct PassGuard<'a> {
    tracker: &'a ProgressTracker,
    run_id: String,
}

impl PassGuard<'_> {
    pub fn finish(self, phase: SyncPhase) {
        self.tracker.set_phase(&self.run_id, phase);
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        let unfinished = self
            .tracker
            .get(&self.run_id)
            .is_some_and(|e| !e.phase.is_finished());
        if unfinished {
            warn!(run_id = %self.run_id, "sync pass abandoned before finishing");
            self.tracker.set_phase(&self.run_id, SyncPhase::Failed);
        }
    }
}

impl Sweep for ProgressTracker {
    fn name(&self) -> &'static str {
        "sync-progress"
    }

    fn sweep(&self, now: DateTime<Utc>) -> usize {
        self.evict_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_finished_entries_expire_after_retention() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let tracker = ProgressTracker::new(Duration::seconds(60), clock.clone());

        tracker.start("run-1", "db", EntityKind::Budgets);
        tracker.start("run-2", "db", EntityKind::Budgets);
        tracker.set_phase("run-1", SyncPhase::Succeeded);

        clock.advance(Duration::seconds(61));
        assert_eq!(tracker.snapshot().len(), 1);
        assert_eq!(tracker.evict_expired(clock.now()), 1);
        assert!(tracker.get("run-1").is_none());
        // Running passes never expire
        assert!(tracker.get("run-2").is_some());
    }

    #[test]
    fn test_dropped_guard_marks_entry_failed() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let tracker = ProgressTracker::new(Duration::seconds(60), clock.clone());

        let done = tracker.begin("run-1", "db", EntityKind::Budgets);
        done.finish(SyncPhase::NoChanges);
        drop(tracker.begin("run-2", "db", EntityKind::Budgets));

        assert_eq!(tracker.get("run-1").unwrap().phase, SyncPhase::NoChanges);
        let abandoned = tracker.get("run-2").unwrap();
        assert_eq!(abandoned.phase, SyncPhase::Failed);
        assert!(abandoned.expires_at.is_some());

        clock.advance(Duration::seconds(61));
        assert_eq!(tracker.evict_expired(clock.now()), 2);
    }

    #[test]
    fn test_record_page_updates_counts() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let tracker = ProgressTracker::new(Duration::seconds(60), clock);
        tracker.start("run-1", "db", EntityKind::Entities);
        tracker.record_page("run-1", 2, 150);
        let entry = tracker.get("run-1").unwrap();
        assert_eq!(entry.pages_fetched, 2);
        assert_eq!(entry.records_fetched, 150);
    }
}
