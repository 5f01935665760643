//! TTL Watcher
//!
//! One recurring timer for every kind of expiring state. Anything that holds
//! entries with a deadline implements [`Sweep`] and is registered here, so
//! there is no per-entry timer anywhere in the process.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::registry::EnvironmentRegistry;
use crate::clock::Clock;

/// A participant in the periodic sweep
pub trait Sweep: Send + Sync {
    fn name(&self) -> &'static str;

    /// Remove whatever expired as of `now`. Returns how many entries went.
    fn sweep(&self, now: DateTime<Utc>) -> usize;
}

impl Sweep for EnvironmentRegistry {
    fn name(&self) -> &'static str {
        "environments"
    }

    fn sweep(&self, _now: DateTime<Utc>) -> usize {
        let expired = match self.list_expired() {
            Ok(expired) => expired,
            Err(e) => {
                warn!(error = %e, "failed to list expired environments");
                return 0;
            }
        };

        let mut removed = 0;
        for record in expired {
            match self.delete_if_expired(&record) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    name = %record.name,
                    error = %e,
                    "failed to remove expired environment"
                ),
            }
        }
        removed
    }
}

pub struct TtlWatcher {
    participants: Vec<Arc<dyn Sweep>>,
    period: Duration,
    clock: Arc<dyn Clock>,
}

impl TtlWatcher {
    pub fn new(period: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            participants: Vec::new(),
            period,
            clock,
        }
    }

    pub fn register(mut self, participant: Arc<dyn Sweep>) -> Self {
        self.participants.push(participant);
        self
    }

    /// Run every participant once. A participant that panics is logged and
    /// skipped; the rest still run.
    pub fn tick(&self) -> usize {
        let now = self.clock.now();
        let mut total = 0;
        for participant in &self.participants {
            match catch_unwind(AssertUnwindSafe(|| participant.sweep(now))) {
                Ok(0) => {}
                Ok(n) => {
                    debug!(participant = participant.name(), removed = n, "sweep removed entries");
                    total += n;
                }
                Err(_) => error!(participant = participant.name(), "sweep panicked"),
            }
        }
        total
    }

    /// Tick on a fixed interval until `shutdown` flips to true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let watcher = Arc::new(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(watcher.period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                period_secs = watcher.period.as_secs(),
                participants = watcher.participants.len(),
                "ttl watcher started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let w = watcher.clone();
                        match tokio::task::spawn_blocking(move || w.tick()).await {
                            Ok(0) => {}
                            Ok(removed) => info!(removed, "ttl sweep complete"),
                            Err(e) => error!(error = %e, "ttl sweep task failed"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("ttl watcher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    impl Sweep for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn sweep(&self, _now: DateTime<Utc>) -> usize {
            self.0.fetch_add(1, Ordering::SeqCst);
            1
        }
    }

    struct Panicking;

    impl Sweep for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn sweep(&self, _now: DateTime<Utc>) -> usize {
            panic!("sweep failure")
        }
    }

    #[test]
    fn test_panicking_participant_does_not_stop_others() {
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let watcher = TtlWatcher::new(Duration::from_secs(1), clock)
            .register(Arc::new(Panicking))
            .register(counting.clone());

        assert_eq!(watcher.tick(), 1);
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_spawned_watcher_stops_on_shutdown() {
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let watcher = TtlWatcher::new(Duration::from_millis(10), clock).register(counting.clone());
        let (tx, rx) = watch::channel(false);

        let handle = watcher.spawn(rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(counting.0.load(Ordering::SeqCst) >= 1);
    }
}
