//! In-memory coordination store for tests/dev and single-host runs.
//!
//! Every trait method holds the lock for its whole body, which gives the same
//! per-step atomicity the Redis scripts give. Worker threads sharing one
//! `Arc<InMemoryStore>` therefore race exactly like worker processes sharing
//! one Redis.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use leaseq_core::{MasterStatus, RequeueBudget, StoreError, WorkerId};

use super::{CoordinationStore, QueueCounts, RequeueOutcome, Reservation, StoreResult};
use crate::keys::BuildKeys;

#[derive(Debug)]
struct BuildState {
    master_status: MasterStatus,
    /// Front is served next.
    pending: VecDeque<String>,
    /// Item -> lease timestamp (epoch seconds).
    reserved: HashMap<String, f64>,
    owners: HashMap<String, WorkerId>,
    processed: HashSet<String>,
    requeues: HashMap<String, u32>,
    total_requeues: u64,
    total: Option<usize>,
    created_at: Option<f64>,
    workers: BTreeSet<WorkerId>,
    completed: HashMap<WorkerId, Vec<String>>,
    error_reports: BTreeMap<String, String>,
    stats: HashMap<String, HashMap<WorkerId, f64>>,
}

impl Default for BuildState {
    fn default() -> Self {
        Self {
            master_status: MasterStatus::Unset,
            pending: VecDeque::new(),
            reserved: HashMap::new(),
            owners: HashMap::new(),
            processed: HashSet::new(),
            requeues: HashMap::new(),
            total_requeues: 0,
            total: None,
            created_at: None,
            workers: BTreeSet::new(),
            completed: HashMap::new(),
            error_reports: BTreeMap::new(),
            stats: HashMap::new(),
        }
    }
}

impl BuildState {
    fn lease(&mut self, item: &str, worker: &WorkerId, now: f64) {
        self.reserved.insert(item.to_string(), now);
        self.owners.insert(item.to_string(), worker.clone());
    }

    fn release(&mut self, item: &str, worker: &WorkerId) {
        self.reserved.remove(item);
        if self.owners.get(item) == Some(worker) {
            self.owners.remove(item);
        }
    }

    /// Oldest lease at least `timeout` old, ties broken by item like a sorted set.
    fn oldest_expired(&self, now: f64, timeout: Duration) -> Option<String> {
        let threshold = now - timeout.as_secs_f64();
        self.reserved
            .iter()
            .filter(|(item, at)| **at <= threshold && !self.processed.contains(*item))
            .min_by(|(a_item, a_at), (b_item, b_at)| {
                a_at.total_cmp(b_at).then_with(|| a_item.cmp(b_item))
            })
            .map(|(item, _)| item.clone())
    }

    fn settle(&mut self, item: &str, worker: &WorkerId) -> bool {
        self.release(item, worker);
        self.completed
            .entry(worker.clone())
            .or_default()
            .push(item.to_string());
        self.processed.insert(item.to_string())
    }

    fn record_stats(&mut self, worker: &WorkerId, stats: &[(&str, f64)]) {
        for (name, value) in stats {
            self.stats
                .entry(name.to_string())
                .or_default()
                .insert(worker.clone(), *value);
        }
    }
}

/// Mutex-guarded map of builds, keyed by build prefix.
#[derive(Debug)]
pub struct InMemoryStore {
    builds: Mutex<HashMap<String, BuildState>>,
    available: AtomicBool,
    /// Calls left before one injected failure; `usize::MAX` when disarmed.
    fail_after: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            builds: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            fail_after: AtomicUsize::new(usize::MAX),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an outage: while unavailable every call fails with a
    /// connection error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Let `calls` more calls succeed, fail the next one with a connection
    /// error, then behave normally again.
    pub fn fail_once_after(&self, calls: usize) {
        self.fail_after.store(calls, Ordering::SeqCst);
    }

    fn with_build<T>(&self, keys: &BuildKeys, f: impl FnOnce(&mut BuildState) -> T) -> StoreResult<T> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::connection("in-memory store marked unavailable"));
        }
        let armed = self
            .fail_after
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                usize::MAX => None,
                0 => Some(usize::MAX),
                left => Some(left - 1),
            });
        if armed == Ok(0) {
            return Err(StoreError::connection("injected in-memory store failure"));
        }
        let mut builds = self.builds.lock().map_err(|_| StoreError::Poisoned)?;
        let state = builds.entry(keys.prefix().to_string()).or_default();
        Ok(f(state))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinationStore for InMemoryStore {
    fn try_elect(&self, keys: &BuildKeys) -> StoreResult<bool> {
        self.with_build(keys, |state| {
            if state.master_status != MasterStatus::Unset {
                return false;
            }
            state.master_status = MasterStatus::Setup;
            true
        })
    }

    fn push(&self, keys: &BuildKeys, items: &[String], created_at: f64) -> StoreResult<()> {
        self.with_build(keys, |state| {
            state.pending.extend(items.iter().cloned());
            state.total = Some(items.len());
            state.created_at = Some(created_at);
            state.master_status = MasterStatus::Ready;
        })
    }

    fn abandon_setup(&self, keys: &BuildKeys) -> StoreResult<()> {
        self.with_build(keys, |state| {
            if state.master_status == MasterStatus::Setup {
                state.master_status = MasterStatus::Unset;
            }
        })
    }

    fn master_status(&self, keys: &BuildKeys) -> StoreResult<MasterStatus> {
        self.with_build(keys, |state| state.master_status)
    }

    fn mark_finished(&self, keys: &BuildKeys) -> StoreResult<()> {
        self.with_build(keys, |state| {
            if state.master_status == MasterStatus::Ready {
                state.master_status = MasterStatus::Finished;
            }
        })
    }

    fn register_worker(&self, keys: &BuildKeys, worker: &WorkerId) -> StoreResult<()> {
        self.with_build(keys, |state| {
            state.workers.insert(worker.clone());
        })
    }

    fn workers(&self, keys: &BuildKeys) -> StoreResult<Vec<WorkerId>> {
        self.with_build(keys, |state| state.workers.iter().cloned().collect())
    }

    fn reserve(
        &self,
        keys: &BuildKeys,
        worker: &WorkerId,
        now: f64,
        timeout: Duration,
    ) -> StoreResult<Option<Reservation>> {
        self.with_build(keys, |state| {
            if let Some(item) = state.oldest_expired(now, timeout) {
                state.lease(&item, worker, now);
                return Some(Reservation {
                    item,
                    reclaimed: true,
                });
            }
            let item = state.pending.pop_front()?;
            state.lease(&item, worker, now);
            Some(Reservation {
                item,
                reclaimed: false,
            })
        })
    }

    fn heartbeat(&self, keys: &BuildKeys, worker: &WorkerId, item: &str, now: f64) -> StoreResult<bool> {
        self.with_build(keys, |state| {
            if state.owners.get(item) != Some(worker) {
                return false;
            }
            match state.reserved.get_mut(item) {
                Some(at) => {
                    *at = now;
                    true
                }
                None => false,
            }
        })
    }

    fn acknowledge(&self, keys: &BuildKeys, worker: &WorkerId, item: &str) -> StoreResult<bool> {
        self.with_build(keys, |state| state.settle(item, worker))
    }

    fn requeue(
        &self,
        keys: &BuildKeys,
        worker: &WorkerId,
        item: &str,
        budget: &RequeueBudget,
        offset: usize,
    ) -> StoreResult<RequeueOutcome> {
        self.with_build(keys, |state| {
            // Only the live lease holder may requeue.
            let holds_lease =
                state.owners.get(item) == Some(worker) && state.reserved.contains_key(item);
            if !holds_lease || state.processed.contains(item) {
                return RequeueOutcome::NotOwned;
            }

            let used = state.requeues.get(item).copied().unwrap_or(0);
            if !budget.allows(used, state.total_requeues) {
                state.settle(item, worker);
                return RequeueOutcome::Exhausted;
            }

            state.requeues.insert(item.to_string(), used + 1);
            state.total_requeues += 1;
            state.error_reports.remove(item);

            let position = offset.min(state.pending.len());
            state.pending.insert(position, item.to_string());
            state.release(item, worker);
            RequeueOutcome::Requeued
        })
    }

    fn counts(&self, keys: &BuildKeys) -> StoreResult<QueueCounts> {
        self.with_build(keys, |state| QueueCounts {
            pending: state.pending.len(),
            reserved: state.reserved.len(),
            processed: state.processed.len(),
        })
    }

    fn total(&self, keys: &BuildKeys) -> StoreResult<Option<usize>> {
        self.with_build(keys, |state| state.total)
    }

    fn created_at(&self, keys: &BuildKeys) -> StoreResult<Option<f64>> {
        self.with_build(keys, |state| state.created_at)
    }

    fn owner(&self, keys: &BuildKeys, item: &str) -> StoreResult<Option<WorkerId>> {
        self.with_build(keys, |state| state.owners.get(item).cloned())
    }

    fn requeue_counts(&self, keys: &BuildKeys, item: &str) -> StoreResult<(u32, u64)> {
        self.with_build(keys, |state| {
            (
                state.requeues.get(item).copied().unwrap_or(0),
                state.total_requeues,
            )
        })
    }

    fn completed_log(&self, keys: &BuildKeys, worker: &WorkerId) -> StoreResult<Vec<String>> {
        self.with_build(keys, |state| {
            state.completed.get(worker).cloned().unwrap_or_default()
        })
    }

    fn record_error(
        &self,
        keys: &BuildKeys,
        worker: &WorkerId,
        item: &str,
        payload: &str,
        stats: &[(&str, f64)],
    ) -> StoreResult<()> {
        self.with_build(keys, |state| {
            state
                .error_reports
                .insert(item.to_string(), payload.to_string());
            state.record_stats(worker, stats);
        })
    }

    fn record_success(
        &self,
        keys: &BuildKeys,
        worker: &WorkerId,
        item: &str,
        stats: &[(&str, f64)],
    ) -> StoreResult<()> {
        self.with_build(keys, |state| {
            state.error_reports.remove(item);
            state.record_stats(worker, stats);
        })
    }

    fn error_reports(&self, keys: &BuildKeys) -> StoreResult<BTreeMap<String, String>> {
        self.with_build(keys, |state| state.error_reports.clone())
    }

    fn stat_values(&self, keys: &BuildKeys, stat: &str) -> StoreResult<Vec<f64>> {
        self.with_build(keys, |state| {
            state
                .stats
                .get(stat)
                .map(|by_worker| by_worker.values().copied().collect())
                .unwrap_or_default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leaseq_core::BuildId;

    fn keys() -> BuildKeys {
        BuildKeys::new(&BuildId::new("b1"), None, Duration::from_secs(60))
    }

    fn items(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn worker(id: &str) -> WorkerId {
        WorkerId::new(id)
    }

    const LEASE: Duration = Duration::from_secs(10);

    #[test]
    fn election_has_one_winner() {
        let store = InMemoryStore::new();
        let keys = keys();
        assert!(store.try_elect(&keys).unwrap());
        assert!(!store.try_elect(&keys).unwrap());
        assert_eq!(store.master_status(&keys).unwrap(), MasterStatus::Setup);

        store.push(&keys, &items(&["a"]), 0.0).unwrap();
        assert_eq!(store.master_status(&keys).unwrap(), MasterStatus::Ready);
        assert_eq!(store.total(&keys).unwrap(), Some(1));
    }

    #[test]
    fn builds_are_isolated() {
        let store = InMemoryStore::new();
        let a = BuildKeys::new(&BuildId::new("a"), None, LEASE);
        let b = BuildKeys::new(&BuildId::new("b"), None, LEASE);
        assert!(store.try_elect(&a).unwrap());
        assert!(store.try_elect(&b).unwrap());
    }

    #[test]
    fn reserve_serves_fifo_then_reclaims_oldest_expired() {
        let store = InMemoryStore::new();
        let keys = keys();
        store.push(&keys, &items(&["a", "b", "c"]), 0.0).unwrap();

        let w1 = worker("w1");
        let w2 = worker("w2");
        let first = store.reserve(&keys, &w1, 100.0, LEASE).unwrap().unwrap();
        let second = store.reserve(&keys, &w1, 101.0, LEASE).unwrap().unwrap();
        assert_eq!((first.item.as_str(), first.reclaimed), ("a", false));
        assert_eq!(second.item, "b");

        // Neither lease is old enough yet.
        let next = store.reserve(&keys, &w2, 109.9, LEASE).unwrap().unwrap();
        assert_eq!((next.item.as_str(), next.reclaimed), ("c", false));

        // At exactly 10s "a" is reclaimable, and it goes first as the oldest.
        let reclaimed = store.reserve(&keys, &w2, 110.0, LEASE).unwrap().unwrap();
        assert_eq!((reclaimed.item.as_str(), reclaimed.reclaimed), ("a", true));
        assert_eq!(store.owner(&keys, "a").unwrap(), Some(w2.clone()));

        assert!(store.reserve(&keys, &w2, 110.5, LEASE).unwrap().is_none());
    }

    #[test]
    fn duplicate_acknowledge_returns_false() {
        let store = InMemoryStore::new();
        let keys = keys();
        store.push(&keys, &items(&["a"]), 0.0).unwrap();
        let w1 = worker("w1");
        let w2 = worker("w2");

        store.reserve(&keys, &w1, 0.0, LEASE).unwrap();
        store.reserve(&keys, &w2, 20.0, LEASE).unwrap();

        assert!(store.acknowledge(&keys, &w2, "a").unwrap());
        assert!(!store.acknowledge(&keys, &w1, "a").unwrap());
        assert_eq!(
            store.counts(&keys).unwrap(),
            QueueCounts {
                pending: 0,
                reserved: 0,
                processed: 1
            }
        );
    }

    #[test]
    fn requeue_inserts_offset_slots_behind_next_item() {
        let store = InMemoryStore::new();
        let keys = keys();
        store
            .push(&keys, &items(&["a", "b", "c", "d", "e"]), 0.0)
            .unwrap();
        let w = worker("w");
        let budget = RequeueBudget::new(5, 5);

        store.reserve(&keys, &w, 0.0, LEASE).unwrap();
        let outcome = store.requeue(&keys, &w, "a", &budget, 2).unwrap();
        assert_eq!(outcome, RequeueOutcome::Requeued);

        let order: Vec<String> = std::iter::from_fn(|| {
            store
                .reserve(&keys, &w, 1.0, LEASE)
                .unwrap()
                .map(|r| r.item)
        })
        .collect();
        assert_eq!(order, vec!["b", "c", "a", "d", "e"]);
    }

    #[test]
    fn requeue_past_the_end_goes_last() {
        let store = InMemoryStore::new();
        let keys = keys();
        store.push(&keys, &items(&["a", "b"]), 0.0).unwrap();
        let w = worker("w");

        store.reserve(&keys, &w, 0.0, LEASE).unwrap();
        store
            .requeue(&keys, &w, "a", &RequeueBudget::new(1, 1), 42)
            .unwrap();
        assert_eq!(
            store.reserve(&keys, &w, 0.0, LEASE).unwrap().unwrap().item,
            "b"
        );
        assert_eq!(
            store.reserve(&keys, &w, 0.0, LEASE).unwrap().unwrap().item,
            "a"
        );
    }

    #[test]
    fn exhausted_requeue_settles_the_item() {
        let store = InMemoryStore::new();
        let keys = keys();
        store.push(&keys, &items(&["a"]), 0.0).unwrap();
        let w = worker("w");

        store.reserve(&keys, &w, 0.0, LEASE).unwrap();
        let outcome = store
            .requeue(&keys, &w, "a", &RequeueBudget::none(), 0)
            .unwrap();
        assert_eq!(outcome, RequeueOutcome::Exhausted);
        assert_eq!(store.counts(&keys).unwrap().processed, 1);
        assert_eq!(store.completed_log(&keys, &w).unwrap(), vec!["a"]);
    }

    #[test]
    fn stale_worker_cannot_requeue_reclaimed_item() {
        let store = InMemoryStore::new();
        let keys = keys();
        store.push(&keys, &items(&["a"]), 0.0).unwrap();
        let stale = worker("stale");
        let fresh = worker("fresh");

        store.reserve(&keys, &stale, 0.0, LEASE).unwrap();
        store.reserve(&keys, &fresh, 30.0, LEASE).unwrap();

        let outcome = store
            .requeue(&keys, &stale, "a", &RequeueBudget::new(3, 3), 0)
            .unwrap();
        assert_eq!(outcome, RequeueOutcome::NotOwned);
        assert_eq!(store.counts(&keys).unwrap().pending, 0);
        assert_eq!(store.owner(&keys, "a").unwrap(), Some(fresh));
    }

    #[test]
    fn requeue_without_a_live_lease_is_not_owned() {
        let store = InMemoryStore::new();
        let keys = keys();
        store.push(&keys, &items(&["a", "b"]), 0.0).unwrap();
        let stale = worker("stale");
        let fresh = worker("fresh");
        let budget = RequeueBudget::new(3, 3);

        store.reserve(&keys, &stale, 0.0, LEASE).unwrap();
        store.reserve(&keys, &fresh, 30.0, LEASE).unwrap();
        assert_eq!(
            store.requeue(&keys, &fresh, "a", &budget, 0).unwrap(),
            RequeueOutcome::Requeued
        );

        // "a" is pending again with no owner; the stale holder must not touch it.
        assert_eq!(
            store.requeue(&keys, &stale, "a", &budget, 0).unwrap(),
            RequeueOutcome::NotOwned
        );
        assert_eq!(store.counts(&keys).unwrap().pending, 2);
        assert_eq!(store.requeue_counts(&keys, "a").unwrap(), (1, 1));
    }

    #[test]
    fn heartbeat_only_extends_own_lease() {
        let store = InMemoryStore::new();
        let keys = keys();
        store.push(&keys, &items(&["a"]), 0.0).unwrap();
        let w1 = worker("w1");
        let w2 = worker("w2");

        store.reserve(&keys, &w1, 0.0, LEASE).unwrap();
        assert!(store.heartbeat(&keys, &w1, "a", 8.0).unwrap());
        assert!(!store.heartbeat(&keys, &w2, "a", 8.0).unwrap());

        // Renewed at 8s, so still held at 12s.
        assert!(store.reserve(&keys, &w2, 12.0, LEASE).unwrap().is_none());
    }

    #[test]
    fn outage_fails_with_transient_error() {
        let store = InMemoryStore::new();
        let keys = keys();
        store.set_available(false);
        let err = store.try_elect(&keys).unwrap_err();
        assert!(err.is_transient());

        store.set_available(true);
        assert!(store.try_elect(&keys).unwrap());
    }

    #[test]
    fn error_reports_and_stats_aggregate() {
        let store = InMemoryStore::new();
        let keys = keys();
        let w1 = worker("w1");
        let w2 = worker("w2");

        store
            .record_error(&keys, &w1, "a", "{\"msg\":\"boom\"}", &[("assertions", 3.0)])
            .unwrap();
        store
            .record_success(&keys, &w2, "b", &[("assertions", 4.0)])
            .unwrap();
        assert_eq!(store.error_reports(&keys).unwrap().len(), 1);

        let mut values = store.stat_values(&keys, "assertions").unwrap();
        values.sort_by(f64::total_cmp);
        assert_eq!(values, vec![3.0, 4.0]);

        store.record_success(&keys, &w1, "a", &[]).unwrap();
        assert!(store.error_reports(&keys).unwrap().is_empty());
    }
}
