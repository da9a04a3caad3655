use demand_sync::reconciler::canonical_records;
use demand_sync::store::memory::FaultOp;
use demand_sync::{
    Collection, DemandClient, DemandDraft, DemandRecord, DemandStatus, LocalCache, MemoryStore, Notifier,
    ReconcileStrategy, Reconciler, RemoteStore, SqliteStore, SubActivity, SyncFault, SyncSettings, SystemClock,
    TagCategory, ViewFilter,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn settings(strategy: ReconcileStrategy) -> SyncSettings {
    SyncSettings {
        reconcile_strategy: strategy,
        ..SyncSettings::default()
    }
}

fn draft(title: &str, responsible: &str) -> DemandDraft {
    DemandDraft {
        title: title.to_string(),
        responsible: Some(responsible.to_string()),
        contract: Some("CT-01".to_string()),
        ..DemandDraft::default()
    }
}

async fn authoritative(store: Arc<dyn RemoteStore>) -> Vec<DemandRecord> {
    let reconciler = Reconciler::new(store, LocalCache::new(), Notifier::new(4), ReconcileStrategy::Full);
    let snapshot = reconciler.pull_all().await.expect("reference pull");
    canonical_records(&snapshot)
}

async fn wait_for_convergence(store: Arc<dyn RemoteStore>, clients: &[Arc<DemandClient>]) -> Vec<DemandRecord> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let reference = authoritative(store.clone()).await;
        if clients
            .iter()
            .all(|client| canonical_records(&client.snapshot()) == reference)
        {
            return reference;
        }
        assert!(Instant::now() < deadline, "clients did not converge");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn clients_converge_under_duplicate_delivery() {
    let store = MemoryStore::default();
    store.set_duplicate_delivery(true);
    let shared: Arc<dyn RemoteStore> = Arc::new(store.clone());

    let mut clients = Vec::new();
    for strategy in [
        ReconcileStrategy::Incremental,
        ReconcileStrategy::Incremental,
        ReconcileStrategy::Full,
    ] {
        clients.push(DemandClient::connect(shared.clone(), settings(strategy)).await);
    }
    let (a, b, c) = (&clients[0], &clients[1], &clients[2]);

    let first = a.create_demand(draft("Audit contracts", "ana")).await.expect("create");
    let second = a.create_demand(draft("Renew licences", "rui")).await.expect("create");
    assert_eq!(first.id, "DEM-001");
    assert_eq!(second.id, "DEM-002");
    assert_eq!((first.order, second.order), (0, 1));

    wait_for_convergence(shared.clone(), &clients).await;
    b.start_timer("DEM-001").await.expect("start");
    c.set_sub_activities(
        "DEM-002",
        vec![SubActivity {
            id: "s-1".to_string(),
            title: "collect quotes".to_string(),
            completed: false,
        }],
    )
    .await
    .expect("checklist");
    a.rename_tag(TagCategory::Responsible, "rui", "rita").await.expect("rename");

    let records = wait_for_convergence(shared.clone(), &clients).await;
    let dem1 = records.iter().find(|r| r.id == "DEM-001").expect("DEM-001");
    assert!(dem1.is_running());
    assert_eq!(dem1.status, DemandStatus::InProgress);
    let dem2 = records.iter().find(|r| r.id == "DEM-002").expect("DEM-002");
    assert_eq!(dem2.responsible.as_deref(), Some("rita"));
    assert_eq!(dem2.sub_activities.len(), 1);

    b.stop_timer("DEM-001").await.expect("stop");
    c.delete_demand("DEM-002").await.expect("delete");
    let records = wait_for_convergence(shared.clone(), &clients).await;
    assert_eq!(records.len(), 1);
    assert!(!records[0].is_running());
    assert_eq!(store.row_count(Collection::SubActivities), 0);
    assert_eq!(store.row_count(Collection::TimeEntries), 1);
}

#[tokio::test]
async fn reorder_is_visible_everywhere_and_repeat_is_a_no_op() {
    let store = MemoryStore::default();
    let shared: Arc<dyn RemoteStore> = Arc::new(store);
    let a = DemandClient::connect(shared.clone(), SyncSettings::default()).await;
    let b = DemandClient::connect(shared.clone(), SyncSettings::default()).await;

    for title in ["A", "B", "C"] {
        a.create_demand(draft(title, "ana")).await.expect("create");
    }
    let filter = ViewFilter::default();
    let visible = a.visible(&filter);
    let updates = a.reorder("DEM-003", "DEM-001", &visible).await.expect("reorder");
    assert_eq!(updates.len(), 3);

    let clients = [a.clone(), b.clone()];
    wait_for_convergence(shared.clone(), &clients).await;
    let titles = b.visible(&filter).into_iter().map(|r| r.title).collect::<Vec<_>>();
    assert_eq!(titles, vec!["C", "A", "B"]);

    let again = a.reorder("DEM-003", "DEM-001", &a.visible(&filter)).await.expect("reorder");
    assert!(again.is_empty());
}

#[tokio::test]
async fn filtered_reorder_reports_ordering_drift() {
    let shared: Arc<dyn RemoteStore> = Arc::new(MemoryStore::default());
    let client = DemandClient::connect(shared, SyncSettings::default()).await;
    for title in ["A", "X", "B", "C"] {
        client.create_demand(draft(title, "ana")).await.expect("create");
    }
    client.complete_demand("DEM-002").await.expect("complete");

    let active = client.visible(&ViewFilter::default());
    assert_eq!(active.len(), 3);
    client.reorder("DEM-004", "DEM-001", &active).await.expect("reorder");

    let hidden = client.snapshot().demand("DEM-002").map(|r| r.order);
    assert_eq!(hidden, Some(1));
    assert!(client
        .notice_history()
        .iter()
        .any(|notice| notice.fault == Some(SyncFault::OrderingDrift)));
}

#[tokio::test]
async fn failed_write_becomes_a_notice_and_keeps_the_snapshot() {
    let store = MemoryStore::default();
    let client = DemandClient::connect(Arc::new(store.clone()), SyncSettings::default()).await;
    client.create_demand(draft("A", "ana")).await.expect("create");

    store.fail_next(FaultOp::Update, Some(Collection::Demands), 1);
    let err = client
        .update_demand("DEM-001", draft("A renamed", "ana"))
        .await
        .expect_err("injected failure");
    assert!(err.is_transient());
    assert_eq!(client.snapshot().demand("DEM-001").map(|r| r.title.clone()), Some("A".to_string()));
    assert!(client
        .notice_history()
        .iter()
        .any(|notice| notice.fault == Some(SyncFault::TransientNetwork)));
}

#[tokio::test]
async fn stale_overwrite_is_reported() {
    let store = MemoryStore::default();
    let shared: Arc<dyn RemoteStore> = Arc::new(store.clone());
    let a = DemandClient::connect(shared.clone(), settings(ReconcileStrategy::Full)).await;
    a.create_demand(draft("A", "ana")).await.expect("create");
    let b = DemandClient::connect(shared.clone(), settings(ReconcileStrategy::Full)).await;

    // Stop A's sync loop so its cache keeps the old revision.
    a.shutdown();
    b.update_demand("DEM-001", draft("B's title", "ana")).await.expect("b edit");
    a.update_demand("DEM-001", draft("A's title", "ana")).await.expect("a edit");

    let records = authoritative(shared).await;
    assert_eq!(records[0].title, "A's title");
    assert!(a
        .notice_history()
        .iter()
        .any(|notice| notice.fault == Some(SyncFault::StaleWriteLoss)));
}

#[tokio::test]
async fn checklist_drives_status() {
    let client = DemandClient::connect(Arc::new(MemoryStore::default()), SyncSettings::default()).await;
    client.create_demand(draft("A", "ana")).await.expect("create");
    let sub = |id: &str, completed: bool| SubActivity {
        id: id.to_string(),
        title: id.to_string(),
        completed,
    };

    let done = client
        .set_sub_activities("DEM-001", vec![sub("s-1", true), sub("s-2", true)])
        .await
        .expect("all done");
    assert_eq!(done.status, DemandStatus::Completed);

    let reopened = client
        .set_sub_activities("DEM-001", vec![sub("s-1", true), sub("s-2", false)])
        .await
        .expect("reopen");
    assert_eq!(reopened.status, DemandStatus::InProgress);
    assert_eq!(reopened.sub_activities.len(), 2);
}

#[tokio::test]
async fn sqlite_backed_clients_share_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = SyncSettings {
        change_channel_capacity: 64,
        ..SyncSettings::default()
    };
    let store = SqliteStore::open_from_settings(&dir.path().join("demands.sqlite"), Arc::new(SystemClock), &settings)
        .expect("open");
    let shared: Arc<dyn RemoteStore> = Arc::new(store);
    let a = DemandClient::connect(shared.clone(), settings.clone()).await;
    let b = DemandClient::connect(shared.clone(), settings).await;

    a.create_demand(draft("Persisted", "ana")).await.expect("create");
    wait_for_convergence(shared.clone(), &[a.clone(), b.clone()]).await;
    b.move_demand("DEM-001", DemandStatus::Blocked, None, &[]).await.expect("move");

    let records = wait_for_convergence(shared, &[a.clone(), b.clone()]).await;
    assert_eq!(records[0].status, DemandStatus::Blocked);
    assert_eq!(a.tag_options().responsibles, vec!["ana"]);
}
