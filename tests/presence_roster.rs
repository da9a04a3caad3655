use chrono::{TimeZone, Utc};
use demand_sync::{DemandClient, ManualClock, MemoryStore, PresenceHub, SyncSettings};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn roster_drops_a_silent_client_after_timeout() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 10, 10, 9, 0, 0).unwrap());
    let settings = SyncSettings::default();
    let hub = PresenceHub::new(Arc::new(clock.clone()), settings.presence_timeout());
    let mut roster = hub.on_sync();

    let mut sessions = Vec::new();
    for key in ["ana", "rui", "rita"] {
        let client = DemandClient::connect(Arc::new(MemoryStore::default()), settings.clone()).await;
        sessions.push(client.join_presence(&hub, key));
    }
    // A client whose process died: tracked, never heartbeats, never leaves.
    std::mem::forget(hub.track("ghost"));

    roster.changed().await.expect("roster update");
    assert_eq!(roster.borrow_and_update().len(), 4);

    clock.advance(settings.presence_timeout() + chrono::Duration::seconds(1));
    for session in &sessions {
        assert!(session.heartbeat());
    }
    assert_eq!(hub.sweep(), vec!["ghost".to_string()]);

    let members = roster.borrow_and_update().iter().map(|m| m.key.clone()).collect::<Vec<_>>();
    assert_eq!(members, vec!["ana", "rita", "rui"]);

    sessions.pop();
    assert_eq!(hub.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn joined_clients_expire_a_ghost_without_manual_sweeps() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 10, 10, 9, 0, 0).unwrap());
    let settings = SyncSettings::default();
    let hub = PresenceHub::new(Arc::new(clock.clone()), settings.presence_timeout());

    let mut clients = Vec::new();
    let mut sessions = Vec::new();
    for key in ["ana", "rui", "rita"] {
        let client = DemandClient::connect(Arc::new(MemoryStore::default()), settings.clone()).await;
        sessions.push(client.join_presence(&hub, key));
        clients.push(client);
    }
    std::mem::forget(hub.track("ghost"));
    let mut roster = hub.on_sync();

    clock.advance(chrono::Duration::seconds(30));
    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(hub.len(), 4);
    assert!(!roster.has_changed().expect("hub alive"));

    clock.advance(chrono::Duration::seconds(30));
    tokio::time::sleep(Duration::from_secs(16)).await;
    assert!(roster.has_changed().expect("hub alive"));
    let members = roster.borrow_and_update().iter().map(|m| m.key.clone()).collect::<Vec<_>>();
    assert_eq!(members, vec!["ana", "rita", "rui"]);

    for client in &clients {
        client.shutdown();
    }
}
