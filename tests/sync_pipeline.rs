//! End-to-end sync tests against an in-memory remote

mod common;

use common::*;
use opsmirror::store::{Store, DEFAULT_BUSY_TIMEOUT};
use opsmirror::sync::EntityKind;

fn create_test_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("mirror.db"), DEFAULT_BUSY_TIMEOUT).unwrap();
    (dir, store)
}

#[tokio::test]
async fn test_second_run_without_remote_changes_writes_nothing() {
    let (_dir, store) = create_test_store();
    let api = FakeApi::new();
    api.put("db-budgets", budget("b1", "Food", Some("Food"), &["monthly"], at(1)));
    api.put("db-budgets", budget("b2", "Rent", None, &[], at(2)));
    let orch = orchestrator(api.clone(), vec![source(EntityKind::Budgets)], 100);

    let first = orch.sync_all(&store).await;
    assert_eq!(first.failed(), 0);
    assert_eq!(first.written(), 2);
    let before = store.list_rows(EntityKind::Budgets, 100).unwrap();
    let cursor_before = store.load_cursor("db-budgets").unwrap();

    let second = orch.sync_all(&store).await;
    assert_eq!(second.failed(), 0);
    assert_eq!(second.written(), 0);
    assert_eq!(store.list_rows(EntityKind::Budgets, 100).unwrap(), before);
    assert_eq!(store.load_cursor("db-budgets").unwrap(), cursor_before);

    let requests = api.requests.lock();
    assert_eq!(requests.last().unwrap().edited_after, Some(at(2)));
}

#[tokio::test]
async fn test_cursor_tracks_latest_edit_and_picks_up_changes() {
    let (_dir, store) = create_test_store();
    let api = FakeApi::new();
    api.put("db-budgets", budget("b1", "Food", None, &[], at(5)));
    let orch = orchestrator(api.clone(), vec![source(EntityKind::Budgets)], 100);

    orch.sync_all(&store).await;
    assert_eq!(
        store.load_cursor("db-budgets").unwrap().unwrap().last_edited_at,
        at(5)
    );

    api.put("db-budgets", budget("b1", "Groceries", None, &[], at(9)));
    let report = orch.sync_all(&store).await;
    assert_eq!(report.written(), 1);
    assert_eq!(
        store.load_cursor("db-budgets").unwrap().unwrap().last_edited_at,
        at(9)
    );

    let rows = store.list_rows(EntityKind::Budgets, 10).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], "Groceries");
}

#[tokio::test]
async fn test_upsert_replaces_cleared_fields() {
    let (_dir, store) = create_test_store();
    let api = FakeApi::new();
    api.put("db-budgets", budget("b1", "Food", Some("Food"), &["a", "b"], at(1)));
    let orch = orchestrator(api.clone(), vec![source(EntityKind::Budgets)], 100);
    orch.sync_all(&store).await;

    api.put("db-budgets", budget("b1", "Food", None, &[], at(2)));
    orch.sync_all(&store).await;

    let rows = store.list_rows(EntityKind::Budgets, 10).unwrap();
    assert!(rows[0]["category"].is_null());
    assert_eq!(rows[0]["tags"], serde_json::json!([]));
}

#[tokio::test]
async fn test_counterparties_sync_before_transactions() {
    let (_dir, store) = create_test_store();
    let api = FakeApi::new();
    api.put("db-entities", entity("e1", "Corner Grocer", at(1)));
    api.put("db-transactions", transaction("t1", "Milk", "e1", at(2)));

    // Configured dependents-first on purpose
    let orch = orchestrator(
        api.clone(),
        vec![source(EntityKind::Transactions), source(EntityKind::Entities)],
        100,
    );
    let report = orch.sync_all(&store).await;
    assert_eq!(report.passes[0].kind, EntityKind::Entities);
    assert_eq!(report.failed(), 0);

    let rows = store.list_rows(EntityKind::Transactions, 10).unwrap();
    assert_eq!(rows[0]["entity_id"], "e1");
    assert_eq!(rows[0]["entity_name"], "Corner Grocer");
}

#[tokio::test]
async fn test_failed_page_leaves_store_and_cursor_untouched() {
    let (_dir, store) = create_test_store();
    let api = FakeApi::new();
    for i in 0..5 {
        api.put("db-budgets", budget(&format!("b{i}"), "Line", None, &[], at(i + 1)));
    }
    api.fail_page("db-budgets", 1);
    let orch = orchestrator(api.clone(), vec![source(EntityKind::Budgets)], 2);

    let report = orch.sync_all(&store).await;
    assert_eq!(report.failed(), 1);
    assert_eq!(store.count(EntityKind::Budgets).unwrap(), 0);
    assert!(store.load_cursor("db-budgets").unwrap().is_none());

    api.heal();
    let report = orch.sync_all(&store).await;
    assert_eq!(report.failed(), 0);
    assert_eq!(store.count(EntityKind::Budgets).unwrap(), 5);
}

#[tokio::test]
async fn test_one_failing_source_does_not_block_others() {
    let (_dir, store) = create_test_store();
    let api = FakeApi::new();
    api.put("db-budgets", budget("b1", "Food", None, &[], at(1)));
    api.put("db-entities", entity("e1", "Grocer", at(1)));
    api.fail_page("db-entities", 0);

    let orch = orchestrator(
        api.clone(),
        vec![source(EntityKind::Entities), source(EntityKind::Budgets)],
        100,
    );
    let report = orch.sync_all(&store).await;
    assert_eq!(report.failed(), 1);
    assert_eq!(store.count(EntityKind::Budgets).unwrap(), 1);

    let runs = store.recent_sync_runs(10).unwrap();
    assert!(runs.iter().any(|r| r.status == "failed" && r.kind == EntityKind::Entities));
    assert!(runs.iter().any(|r| r.status == "succeeded" && r.kind == EntityKind::Budgets));
}
