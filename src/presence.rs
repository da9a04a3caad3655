//! Who is currently connected.
//!
//! Members are tracked by key with a heartbeat; a member silent for longer than
//! the timeout is dropped by `sweep`. Dropping a `PresenceSession` untracks it.

use crate::clock::Clock;
use crate::models::PresenceMember;
use chrono::Duration;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Tracked {
    member: PresenceMember,
    token: String,
}

#[derive(Clone)]
pub struct PresenceHub {
    members: Arc<Mutex<BTreeMap<String, Tracked>>>,
    roster: watch::Sender<Vec<PresenceMember>>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl PresenceHub {
    pub fn new(clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        let (roster, _) = watch::channel(Vec::new());
        Self {
            members: Arc::new(Mutex::new(BTreeMap::new())),
            roster,
            clock,
            timeout,
        }
    }

    /// Tracks `key` and returns the session that keeps it alive.
    ///
    /// Tracking a key that is already tracked replaces the older session.
    pub fn track(&self, key: &str) -> PresenceSession {
        let now = self.clock.now();
        let token = Uuid::new_v4().to_string();
        self.with_members(|members| {
            members.insert(
                key.to_string(),
                Tracked {
                    member: PresenceMember {
                        key: key.to_string(),
                        joined_at: now,
                        last_seen: now,
                    },
                    token: token.clone(),
                },
            );
        });
        tracing::debug!(key = %key, "presence tracked");
        PresenceSession {
            hub: self.clone(),
            key: key.to_string(),
            token,
            heartbeat: None,
        }
    }

    /// Roster updates, published when a member joins, leaves or expires.
    /// Heartbeats alone do not publish, so `last_seen` there is as of the
    /// last membership change; `members` reads it fresh.
    pub fn on_sync(&self) -> watch::Receiver<Vec<PresenceMember>> {
        self.roster.subscribe()
    }

    pub fn members(&self) -> Vec<PresenceMember> {
        self.lock().values().map(|tracked| tracked.member.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops members whose last heartbeat is older than the timeout.
    pub fn sweep(&self) -> Vec<String> {
        let cutoff = self.clock.now() - self.timeout;
        let mut expired = Vec::new();
        self.with_members(|members| {
            members.retain(|key, tracked| {
                let alive = tracked.member.last_seen >= cutoff;
                if !alive {
                    expired.push(key.clone());
                }
                alive
            });
        });
        for key in &expired {
            tracing::info!(key = %key, "presence expired");
        }
        expired
    }

    pub fn spawn_sweeper(&self, period: std::time::Duration) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                hub.sweep();
            }
        })
    }

    fn heartbeat(&self, key: &str, token: &str) -> bool {
        let now = self.clock.now();
        let mut alive = false;
        self.with_members(|members| {
            if let Some(tracked) = members.get_mut(key).filter(|tracked| tracked.token == token) {
                tracked.member.last_seen = now;
                alive = true;
            }
        });
        alive
    }

    fn untrack(&self, key: &str, token: &str) {
        self.with_members(|members| {
            if members.get(key).is_some_and(|tracked| tracked.token == token) {
                members.remove(key);
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Tracked>> {
        self.members.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_members(&self, change: impl FnOnce(&mut BTreeMap<String, Tracked>)) {
        let mut members = self.lock();
        change(&mut members);
        let roster = members.values().map(|tracked| tracked.member.clone()).collect::<Vec<_>>();
        drop(members);
        self.roster.send_if_modified(|current| {
            if same_membership(current, &roster) {
                return false;
            }
            *current = roster;
            true
        });
    }
}

/// Same keys joined at the same instants; `last_seen` is ignored.
fn same_membership(current: &[PresenceMember], next: &[PresenceMember]) -> bool {
    current.len() == next.len()
        && current
            .iter()
            .zip(next)
            .all(|(a, b)| a.key == b.key && a.joined_at == b.joined_at)
}

/// Membership held by one connected client.
pub struct PresenceSession {
    hub: PresenceHub,
    key: String,
    token: String,
    heartbeat: Option<JoinHandle<()>>,
}

impl PresenceSession {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Refreshes `last_seen`. Returns false once the member has expired.
    pub fn heartbeat(&self) -> bool {
        self.hub.heartbeat(&self.key, &self.token)
    }

    /// Heartbeats on `period` until the session is dropped or expires.
    pub fn spawn_heartbeat(&mut self, period: std::time::Duration) {
        let hub = self.hub.clone();
        let key = self.key.clone();
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if !hub.heartbeat(&key, &token) {
                    tracing::debug!(key = %key, "presence heartbeat stopped");
                    break;
                }
            }
        });
        if let Some(previous) = self.heartbeat.replace(handle) {
            previous.abort();
        }
    }

    pub fn leave(self) {}
}

impl Drop for PresenceSession {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
        self.hub.untrack(&self.key, &self.token);
        tracing::debug!(key = %self.key, "presence left");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use chrono::{TimeZone, Utc};

    fn hub() -> (ManualClock, PresenceHub) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 10, 10, 9, 0, 0).unwrap());
        let hub = PresenceHub::new(Arc::new(clock.clone()), Duration::seconds(45));
        (clock, hub)
    }

    #[test]
    fn join_and_drop_update_the_roster() {
        let (_, hub) = hub();
        let mut roster = hub.on_sync();
        let alice = hub.track("alice");
        let bob = hub.track("bob");
        assert!(roster.has_changed().expect("hub alive"));
        let keys = roster.borrow_and_update().iter().map(|m| m.key.clone()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["alice", "bob"]);

        drop(bob);
        assert_eq!(hub.len(), 1);
        alice.leave();
        assert!(hub.is_empty());
    }

    #[test]
    fn silent_members_expire_after_timeout() {
        let (clock, hub) = hub();
        let sessions = ["a", "b", "c", "d"].map(|key| hub.track(key));
        let [a, b, c, crashed] = sessions;
        // Simulates a client that vanished without leaving.
        std::mem::forget(crashed);
        assert_eq!(hub.len(), 4);

        clock.advance(Duration::seconds(46));
        assert!(a.heartbeat() && b.heartbeat() && c.heartbeat());
        assert_eq!(hub.sweep(), vec!["d".to_string()]);
        assert_eq!(hub.len(), 3);
    }

    #[test]
    fn heartbeat_refreshes_last_seen_without_publishing() {
        let (clock, hub) = hub();
        let alice = hub.track("alice");
        let roster = hub.on_sync();

        clock.advance(Duration::seconds(10));
        assert!(alice.heartbeat());
        assert!(!roster.has_changed().expect("hub alive"));
        assert_eq!(hub.members()[0].last_seen, clock.now());

        let _bob = hub.track("bob");
        assert!(roster.has_changed().expect("hub alive"));
    }

    #[test]
    fn stale_session_does_not_untrack_a_rejoined_key() {
        let (_, hub) = hub();
        let first = hub.track("alice");
        let second = hub.track("alice");
        drop(first);
        assert_eq!(hub.len(), 1);
        assert!(second.heartbeat());
    }
}
