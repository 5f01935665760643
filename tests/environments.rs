//! Named environment lifecycle tests

mod common;

use std::sync::Arc;

use chrono::Duration;
use tempfile::TempDir;

use common::*;
use opsmirror::clock::{Clock, ManualClock};
use opsmirror::env::{
    ContextResolver, DeleteOutcome, EnvironmentRegistry, SeedMode, Sweep, TtlWatcher,
};
use opsmirror::error::{EnvError, ResolveError};
use opsmirror::store::{remove_store_files, Store, DEFAULT_BUSY_TIMEOUT};
use opsmirror::sync::EntityKind;

struct Fixture {
    dir: TempDir,
    clock: Arc<ManualClock>,
    production: Store,
    registry: Arc<EnvironmentRegistry>,
}

fn setup() -> Fixture {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(at(0)));
    let production = Store::open(dir.path().join("mirror.db"), DEFAULT_BUSY_TIMEOUT).unwrap();
    let registry = open_registry(&dir, &clock, &production);
    Fixture {
        dir,
        clock,
        production,
        registry,
    }
}

fn open_registry(
    dir: &TempDir,
    clock: &Arc<ManualClock>,
    production: &Store,
) -> Arc<EnvironmentRegistry> {
    Arc::new(
        EnvironmentRegistry::open(
            dir.path().join("environments"),
            Some(production.clone()),
            clock.clone(),
            DEFAULT_BUSY_TIMEOUT,
            7 * 24 * 3600,
        )
        .unwrap(),
    )
}

#[test]
fn test_live_name_is_unique() {
    let f = setup();
    f.registry.create("qa", SeedMode::Empty, 60).unwrap();
    assert!(matches!(
        f.registry.create("qa", SeedMode::Fixtures, 60),
        Err(EnvError::Conflict(_))
    ));
}

#[test]
fn test_concurrent_creates_yield_one_winner() {
    let f = setup();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = f.registry.clone();
            std::thread::spawn(move || registry.create("race", SeedMode::Empty, 60))
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, EnvError::Conflict(_))));
    assert_eq!(f.registry.list().unwrap().len(), 1);
}

#[test]
fn test_ttl_boundary() {
    let f = setup();
    f.registry.create("qa", SeedMode::Empty, 60).unwrap();

    f.clock.advance(Duration::seconds(59));
    assert!(f.registry.get("qa").is_ok());

    f.clock.advance(Duration::seconds(1));
    assert!(f.registry.get("qa").is_ok(), "live at exactly expires_at");

    f.clock.advance(Duration::seconds(1));
    assert!(matches!(f.registry.get("qa"), Err(EnvError::Expired(_))));
    assert!(f.registry.list().unwrap().is_empty());
    assert_eq!(f.registry.list_expired().unwrap().len(), 1);
}

#[test]
fn test_sweep_does_not_remove_recreated_environment() {
    let f = setup();
    f.registry.create("qa", SeedMode::Empty, 10).unwrap();
    f.clock.advance(Duration::seconds(11));

    let stale = f.registry.list_expired().unwrap().remove(0);
    let fresh = f.registry.create("qa", SeedMode::Empty, 60).unwrap();

    assert!(!f.registry.delete_if_expired(&stale).unwrap());
    assert_eq!(f.registry.get("qa").unwrap(), fresh);
    assert!(fresh.backing_store_path.exists());
}

#[test]
fn test_watcher_tick_removes_expired_environments() {
    let f = setup();
    let doomed = f.registry.create("short", SeedMode::Fixtures, 10).unwrap();
    f.registry.create("long", SeedMode::Empty, 600).unwrap();
    f.clock.advance(Duration::seconds(30));

    let watcher = TtlWatcher::new(std::time::Duration::from_secs(30), f.clock.clone())
        .register(f.registry.clone());
    assert_eq!(watcher.tick(), 1);

    assert!(matches!(f.registry.get("short"), Err(EnvError::NotFound(_))));
    assert!(!doomed.backing_store_path.exists());
    assert!(f.registry.get("long").is_ok());
    assert_eq!(f.registry.sweep(f.clock.now()), 0);
}

#[test]
fn test_registries_sharing_a_directory_respect_each_other() {
    let f = setup();
    let other = open_registry(&f.dir, &f.clock, &f.production);
    f.registry.create("qa", SeedMode::Empty, 10).unwrap();
    f.clock.advance(Duration::seconds(11));

    let stale = f.registry.list_expired().unwrap().remove(0);
    let fresh = other.create("qa", SeedMode::Empty, 60).unwrap();
    assert!(!f.registry.delete_if_expired(&stale).unwrap());
    assert_eq!(f.registry.get("qa").unwrap(), fresh);

    let report = other.startup_cleanup().unwrap();
    assert!(report.is_empty());
    assert!(fresh.backing_store_path.exists());
}

#[test]
fn test_delete_then_delete_again() {
    let f = setup();
    f.registry.create("qa", SeedMode::Empty, 60).unwrap();
    assert_eq!(f.registry.delete("qa").unwrap(), DeleteOutcome::Deleted);
    assert_eq!(f.registry.delete("qa").unwrap(), DeleteOutcome::AlreadyGone);
}

#[test]
fn test_startup_cleanup_reconciles_disk_and_records() {
    let f = setup();
    let keep = f.registry.create("keep", SeedMode::Empty, 600).unwrap();
    f.registry.create("old", SeedMode::Empty, 10).unwrap();
    let dangling = f.registry.create("dangling", SeedMode::Empty, 600).unwrap();

    let stores = f.registry.stores_dir().to_path_buf();
    let stray = stores.join("stray-0000.db");
    std::fs::write(&stray, b"").unwrap();
    std::fs::write(stores.join("stray-0000.db-wal"), b"").unwrap();
    remove_store_files(&dangling.backing_store_path).unwrap();

    f.clock.advance(Duration::seconds(60));

    // Fresh registry over the same directory, as after a restart
    drop(f.registry);
    let registry = open_registry(&f.dir, &f.clock, &f.production);
    let report = registry.startup_cleanup().unwrap();

    assert_eq!(report.expired, vec!["old".to_string()]);
    assert_eq!(report.dangling, vec!["dangling".to_string()]);
    assert_eq!(report.orphans, vec![stray.clone()]);
    assert!(!stray.exists());
    assert!(!stores.join("stray-0000.db-wal").exists());
    assert!(keep.backing_store_path.exists());

    let names: Vec<_> = registry.list().unwrap().into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["keep".to_string()]);
    assert!(registry.startup_cleanup().unwrap().is_empty());
}

#[test]
fn test_production_seed_is_a_snapshot() {
    let f = setup();
    opsmirror::env::seed::load_fixtures(&f.production).unwrap();
    let record = f.registry.create("copy", SeedMode::Production, 60).unwrap();

    // Later production writes do not leak into the copy
    let writer = opsmirror::sync::UpsertWriter::new(f.production.clone());
    let extra = opsmirror::sync::map_record(
        EntityKind::Budgets,
        &budget("b-late", "Late", None, &[], at(30)),
        &Default::default(),
    );
    writer.write_batch(EntityKind::Budgets, &[extra]).unwrap();

    let copy = Store::open_existing(&record.backing_store_path, DEFAULT_BUSY_TIMEOUT).unwrap();
    assert_eq!(
        copy.count(EntityKind::Budgets).unwrap() + 1,
        f.production.count(EntityKind::Budgets).unwrap()
    );
}

#[tokio::test]
async fn test_sync_into_environment_leaves_production_alone() {
    let f = setup();
    f.registry.create("qa", SeedMode::Empty, 600).unwrap();
    let resolver = ContextResolver::new(f.production.clone(), f.registry.clone());

    let api = FakeApi::new();
    api.put("db-budgets", budget("b1", "Food", None, &[], at(1)));
    let orch = orchestrator(api, vec![source(EntityKind::Budgets)], 100);

    let scoped = resolver.resolve(Some("qa")).unwrap();
    let report = orch.sync_all(&scoped.store).await;
    assert_eq!(report.written(), 1);

    assert_eq!(scoped.store.count(EntityKind::Budgets).unwrap(), 1);
    assert_eq!(f.production.count(EntityKind::Budgets).unwrap(), 0);
    assert!(f.production.load_cursor("db-budgets").unwrap().is_none());

    assert!(matches!(
        resolver.resolve(Some("nope")),
        Err(ResolveError::UnknownEnvironment(_))
    ));
}
