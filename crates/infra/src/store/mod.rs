//! Coordination store abstraction.
//!
//! Each method is one atomic step of the lease protocol. Implementations must
//! execute every method as a single critical section on the store side (a Lua
//! script or MULTI/EXEC for Redis, one lock hold for the in-memory store);
//! never as a client-side read followed by a dependent write.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_store;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use leaseq_core::{MasterStatus, RequeueBudget, StoreError, WorkerId};

use crate::keys::BuildKeys;

pub use in_memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

/// Result type for store calls.
pub type StoreResult<T> = Result<T, StoreError>;

/// An item leased to a worker by [`CoordinationStore::reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub item: String,
    /// Taken over from a worker whose lease expired.
    pub reclaimed: bool,
}

/// What [`CoordinationStore::requeue`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// Back in the pending list for another attempt.
    Requeued,
    /// A budget was spent; the item was marked processed as a final failure.
    Exhausted,
    /// This worker no longer holds a live lease on the item.
    NotOwned,
}

/// Queue sizes at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub reserved: usize,
    pub processed: usize,
}

/// Shared state of every build, addressed through [`BuildKeys`].
pub trait CoordinationStore: Send + Sync {
    /// Move master-status from unset to setup. True for exactly one caller.
    fn try_elect(&self, keys: &BuildKeys) -> StoreResult<bool>;

    /// Publish the backlog, record total and creation time, flip to ready.
    fn push(&self, keys: &BuildKeys, items: &[String], created_at: f64) -> StoreResult<()>;

    /// Move master-status from setup back to unset after a failed push, so
    /// the build can be claimed again. A no-op in any other state.
    fn abandon_setup(&self, keys: &BuildKeys) -> StoreResult<()>;

    fn master_status(&self, keys: &BuildKeys) -> StoreResult<MasterStatus>;

    /// Flip ready to finished; a no-op in any other state.
    fn mark_finished(&self, keys: &BuildKeys) -> StoreResult<()>;

    fn register_worker(&self, keys: &BuildKeys, worker: &WorkerId) -> StoreResult<()>;

    fn workers(&self, keys: &BuildKeys) -> StoreResult<Vec<WorkerId>>;

    /// Lease an item: first the oldest expired lease, else the next pending.
    fn reserve(
        &self,
        keys: &BuildKeys,
        worker: &WorkerId,
        now: f64,
        timeout: Duration,
    ) -> StoreResult<Option<Reservation>>;

    /// Re-stamp a lease this worker still owns.
    fn heartbeat(&self, keys: &BuildKeys, worker: &WorkerId, item: &str, now: f64) -> StoreResult<bool>;

    /// Settle an item. False if it was already processed.
    fn acknowledge(&self, keys: &BuildKeys, worker: &WorkerId, item: &str) -> StoreResult<bool>;

    /// Return an item to the pending list `offset` slots behind the next
    /// served item, if both budgets allow; otherwise settle it.
    fn requeue(
        &self,
        keys: &BuildKeys,
        worker: &WorkerId,
        item: &str,
        budget: &RequeueBudget,
        offset: usize,
    ) -> StoreResult<RequeueOutcome>;

    fn counts(&self, keys: &BuildKeys) -> StoreResult<QueueCounts>;

    fn total(&self, keys: &BuildKeys) -> StoreResult<Option<usize>>;

    fn created_at(&self, keys: &BuildKeys) -> StoreResult<Option<f64>>;

    /// Worker currently holding the lease on `item`.
    fn owner(&self, keys: &BuildKeys, item: &str) -> StoreResult<Option<WorkerId>>;

    /// Requeues used by `item`, and by the whole build.
    fn requeue_counts(&self, keys: &BuildKeys, item: &str) -> StoreResult<(u32, u64)>;

    /// Items `worker` settled, oldest first.
    fn completed_log(&self, keys: &BuildKeys, worker: &WorkerId) -> StoreResult<Vec<String>>;

    fn record_error(
        &self,
        keys: &BuildKeys,
        worker: &WorkerId,
        item: &str,
        payload: &str,
        stats: &[(&str, f64)],
    ) -> StoreResult<()>;

    fn record_success(
        &self,
        keys: &BuildKeys,
        worker: &WorkerId,
        item: &str,
        stats: &[(&str, f64)],
    ) -> StoreResult<()>;

    fn error_reports(&self, keys: &BuildKeys) -> StoreResult<BTreeMap<String, String>>;

    /// Every worker's value for one stat.
    fn stat_values(&self, keys: &BuildKeys, stat: &str) -> StoreResult<Vec<f64>>;
}

impl<S> CoordinationStore for Arc<S>
where
    S: CoordinationStore + ?Sized,
{
    fn try_elect(&self, keys: &BuildKeys) -> StoreResult<bool> {
        (**self).try_elect(keys)
    }

    fn push(&self, keys: &BuildKeys, items: &[String], created_at: f64) -> StoreResult<()> {
        (**self).push(keys, items, created_at)
    }

    fn abandon_setup(&self, keys: &BuildKeys) -> StoreResult<()> {
        (**self).abandon_setup(keys)
    }

    fn master_status(&self, keys: &BuildKeys) -> StoreResult<MasterStatus> {
        (**self).master_status(keys)
    }

    fn mark_finished(&self, keys: &BuildKeys) -> StoreResult<()> {
        (**self).mark_finished(keys)
    }

    fn register_worker(&self, keys: &BuildKeys, worker: &WorkerId) -> StoreResult<()> {
        (**self).register_worker(keys, worker)
    }

    fn workers(&self, keys: &BuildKeys) -> StoreResult<Vec<WorkerId>> {
        (**self).workers(keys)
    }

    fn reserve(
        &self,
        keys: &BuildKeys,
        worker: &WorkerId,
        now: f64,
        timeout: Duration,
    ) -> StoreResult<Option<Reservation>> {
        (**self).reserve(keys, worker, now, timeout)
    }

    fn heartbeat(&self, keys: &BuildKeys, worker: &WorkerId, item: &str, now: f64) -> StoreResult<bool> {
        (**self).heartbeat(keys, worker, item, now)
    }

    fn acknowledge(&self, keys: &BuildKeys, worker: &WorkerId, item: &str) -> StoreResult<bool> {
        (**self).acknowledge(keys, worker, item)
    }

    fn requeue(
        &self,
        keys: &BuildKeys,
        worker: &WorkerId,
        item: &str,
        budget: &RequeueBudget,
        offset: usize,
    ) -> StoreResult<RequeueOutcome> {
        (**self).requeue(keys, worker, item, budget, offset)
    }

    fn counts(&self, keys: &BuildKeys) -> StoreResult<QueueCounts> {
        (**self).counts(keys)
    }

    fn total(&self, keys: &BuildKeys) -> StoreResult<Option<usize>> {
        (**self).total(keys)
    }

    fn created_at(&self, keys: &BuildKeys) -> StoreResult<Option<f64>> {
        (**self).created_at(keys)
    }

    fn owner(&self, keys: &BuildKeys, item: &str) -> StoreResult<Option<WorkerId>> {
        (**self).owner(keys, item)
    }

    fn requeue_counts(&self, keys: &BuildKeys, item: &str) -> StoreResult<(u32, u64)> {
        (**self).requeue_counts(keys, item)
    }

    fn completed_log(&self, keys: &BuildKeys, worker: &WorkerId) -> StoreResult<Vec<String>> {
        (**self).completed_log(keys, worker)
    }

    fn record_error(
        &self,
        keys: &BuildKeys,
        worker: &WorkerId,
        item: &str,
        payload: &str,
        stats: &[(&str, f64)],
    ) -> StoreResult<()> {
        (**self).record_error(keys, worker, item, payload, stats)
    }

    fn record_success(
        &self,
        keys: &BuildKeys,
        worker: &WorkerId,
        item: &str,
        stats: &[(&str, f64)],
    ) -> StoreResult<()> {
        (**self).record_success(keys, worker, item, stats)
    }

    fn error_reports(&self, keys: &BuildKeys) -> StoreResult<BTreeMap<String, String>> {
        (**self).error_reports(keys)
    }

    fn stat_values(&self, keys: &BuildKeys, stat: &str) -> StoreResult<Vec<f64>> {
        (**self).stat_values(keys, stat)
    }
}
