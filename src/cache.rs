use crate::models::{DemandRecord, TimeEntry};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;

/// Immutable view of every demand-bound collection at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheSnapshot {
    /// Sorted by `order`; equal orders keep store insertion order.
    pub demands: Vec<DemandRecord>,
    pub time_entries: Vec<TimeEntry>,
    /// Ids deleted since the last full pull, with the revision of the delete.
    pub tombstones: BTreeMap<String, u64>,
    pub generation: u64,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl CacheSnapshot {
    pub fn demand(&self, id: &str) -> Option<&DemandRecord> {
        self.demands.iter().find(|demand| demand.id == id)
    }

    pub fn len(&self) -> usize {
        self.demands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.demands.is_empty()
    }

    pub fn running(&self) -> impl Iterator<Item = &DemandRecord> {
        self.demands.iter().filter(|demand| demand.is_running())
    }

    pub fn entries_for<'a>(&'a self, demand_id: &'a str) -> impl Iterator<Item = &'a TimeEntry> + 'a {
        self.time_entries.iter().filter(move |entry| entry.demand_id == demand_id)
    }
}

/// Single source of truth for every view of one client.
///
/// Only the reconciler swaps the snapshot; readers hold `Arc`s and never see a
/// half-built state.
#[derive(Clone)]
pub struct LocalCache {
    current: Arc<RwLock<Arc<CacheSnapshot>>>,
    notify: watch::Sender<Arc<CacheSnapshot>>,
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalCache {
    pub fn new() -> Self {
        let empty = Arc::new(CacheSnapshot::default());
        let (notify, _) = watch::channel(empty.clone());
        Self {
            current: Arc::new(RwLock::new(empty)),
            notify,
        }
    }

    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.current
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<CacheSnapshot>> {
        self.notify.subscribe()
    }

    /// Swaps in a new snapshot, stamping the next generation number.
    pub(crate) fn replace(&self, mut next: CacheSnapshot) -> Arc<CacheSnapshot> {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        next.generation = guard.generation + 1;
        let next = Arc::new(next);
        *guard = next.clone();
        drop(guard);
        self.notify.send_replace(next.clone());
        next
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheSnapshot, LocalCache};

    #[test]
    fn replace_bumps_generation_and_notifies() {
        let cache = LocalCache::new();
        let mut watcher = cache.subscribe();
        let first = cache.snapshot();
        assert_eq!(first.generation, 0);

        cache.replace(CacheSnapshot::default());
        assert!(watcher.has_changed().expect("sender alive"));
        assert_eq!(watcher.borrow_and_update().generation, 1);
        assert_eq!(first.generation, 0);
        assert_eq!(cache.snapshot().generation, 1);
    }
}
