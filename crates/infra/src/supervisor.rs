//! Leader wait and the read-only build supervisor.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use leaseq_core::{MasterStatus, QueueConfig, QueueError, QueueResult, StoreError, WorkerId};

use crate::keys::BuildKeys;
use crate::store::{CoordinationStore, QueueCounts};

/// Poll master-status until the backlog is published.
///
/// Transient store errors keep the wait going. At `timeout` the wait fails with
/// the store error if the store is still unreachable, otherwise the build
/// counts as lost because the master never reached `ready`.
pub fn wait_for_master<S>(
    store: &S,
    keys: &BuildKeys,
    timeout: Duration,
    interval: Duration,
) -> QueueResult<MasterStatus>
where
    S: CoordinationStore + ?Sized,
{
    let started = Instant::now();
    let mut last = MasterStatus::Unset;
    let mut outage: Option<StoreError> = None;

    loop {
        match store.master_status(keys) {
            Ok(status) if status.is_initialized() => return Ok(status),
            Ok(status) => {
                last = status;
                outage = None;
            }
            Err(err) if err.is_transient() => {
                warn!(build = %keys.prefix(), error = %err, "master status unavailable");
                outage = Some(err);
            }
            Err(err) => return Err(err.into()),
        }

        let waited = started.elapsed();
        if waited >= timeout {
            if let Some(err) = outage.take() {
                error!(build = %keys.prefix(), ?waited, error = %err, "store unreachable during leader wait");
                return Err(err.into());
            }
            error!(build = %keys.prefix(), status = %last, ?waited, "master never finished setup");
            return Err(QueueError::LostMaster {
                waited,
                status: last.to_string(),
            });
        }
        thread::sleep(interval.min(timeout - waited));
    }
}

/// Observer of one build, for a reporting process that does no work itself.
///
/// Never mutates queue state.
#[derive(Debug)]
pub struct Supervisor<S> {
    store: S,
    keys: BuildKeys,
    master_timeout: Duration,
    poll_interval: Duration,
}

impl<S: CoordinationStore> Supervisor<S> {
    pub fn new(store: S, config: &QueueConfig) -> QueueResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            keys: BuildKeys::from_config(config),
            master_timeout: config.master_timeout,
            poll_interval: config.master_poll_interval,
        })
    }

    pub fn keys(&self) -> &BuildKeys {
        &self.keys
    }

    pub fn wait_for_master(&self) -> QueueResult<MasterStatus> {
        wait_for_master(&self.store, &self.keys, self.master_timeout, self.poll_interval)
    }

    /// Wait until the build is exhausted or `deadline` passes.
    ///
    /// Returns whether the build drained in time. Leader-wait failures
    /// propagate.
    pub fn wait_for_workers(&self, deadline: Duration) -> QueueResult<bool> {
        let started = Instant::now();
        self.wait_for_master()?;

        loop {
            match self.is_exhausted() {
                Ok(true) => {
                    info!(build = %self.keys.prefix(), "all workers done");
                    return Ok(true);
                }
                Ok(false) => {}
                Err(err) if err.is_transient() => {
                    warn!(build = %self.keys.prefix(), error = %err, "store unavailable while waiting");
                }
                Err(err) => return Err(err),
            }

            let waited = started.elapsed();
            if waited >= deadline {
                warn!(build = %self.keys.prefix(), ?waited, "workers still busy at deadline");
                return Ok(false);
            }
            debug!(build = %self.keys.prefix(), "waiting for workers");
            thread::sleep(self.poll_interval.min(deadline - waited));
        }
    }

    pub fn status(&self) -> QueueResult<MasterStatus> {
        Ok(self.store.master_status(&self.keys)?)
    }

    pub fn is_exhausted(&self) -> QueueResult<bool> {
        if !self.status()?.is_initialized() {
            return Ok(false);
        }
        let counts = self.counts()?;
        Ok(counts.pending == 0 && counts.reserved == 0)
    }

    pub fn counts(&self) -> QueueResult<QueueCounts> {
        Ok(self.store.counts(&self.keys)?)
    }

    pub fn total(&self) -> QueueResult<usize> {
        Ok(self.store.total(&self.keys)?.unwrap_or(0))
    }

    pub fn size(&self) -> QueueResult<usize> {
        let counts = self.counts()?;
        Ok(counts.pending + counts.reserved)
    }

    pub fn progress(&self) -> QueueResult<usize> {
        Ok(self.total()?.saturating_sub(self.size()?))
    }

    pub fn workers(&self) -> QueueResult<Vec<WorkerId>> {
        Ok(self.store.workers(&self.keys)?)
    }

    /// Seconds since the master published the backlog.
    pub fn age_secs(&self, now: f64) -> QueueResult<Option<f64>> {
        Ok(self.store.created_at(&self.keys)?.map(|created| now - created))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use leaseq_core::WorkQueue;

    use super::*;
    use crate::queue::DistributedQueue;
    use crate::store::InMemoryStore;

    fn config(worker: &str) -> QueueConfig {
        QueueConfig::new("build-sup", worker)
            .with_poll_interval(Duration::from_millis(1))
            .with_master_poll_interval(Duration::from_millis(1))
            .with_master_timeout(Duration::from_secs(2))
    }

    fn items(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("t{i}")).collect()
    }

    #[test]
    fn wait_for_master_sees_ready_build() {
        let store = InMemoryStore::arc();
        let mut queue = DistributedQueue::new(Arc::clone(&store), config("w")).unwrap();
        queue.populate(items(3)).unwrap();

        let supervisor = Supervisor::new(Arc::clone(&store), &config("reporter")).unwrap();
        assert_eq!(supervisor.wait_for_master().unwrap(), MasterStatus::Ready);
        assert_eq!(supervisor.total().unwrap(), 3);
        assert_eq!(supervisor.progress().unwrap(), 0);
        assert_eq!(supervisor.workers().unwrap(), vec![WorkerId::new("w")]);
    }

    #[test]
    fn wait_for_master_reports_lost_master() {
        let store = InMemoryStore::new();
        let keys = BuildKeys::from_config(&config("w"));
        store.try_elect(&keys).unwrap();

        let err = wait_for_master(&store, &keys, Duration::from_millis(10), Duration::from_millis(1))
            .unwrap_err();
        assert!(matches!(err, QueueError::LostMaster { .. }));
    }

    #[test]
    fn wait_for_master_reports_outage_as_store_error() {
        let store = InMemoryStore::new();
        let keys = BuildKeys::from_config(&config("w"));
        store.try_elect(&keys).unwrap();
        store.set_available(false);

        let err = wait_for_master(&store, &keys, Duration::from_millis(10), Duration::from_millis(1))
            .unwrap_err();
        assert!(err.is_transient(), "got {err:?}");
    }

    #[test]
    fn wait_for_workers_returns_once_drained() {
        let store = InMemoryStore::arc();
        let supervisor = Supervisor::new(Arc::clone(&store), &config("reporter")).unwrap();

        let worker = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let mut queue = DistributedQueue::new(store, config("w")).unwrap();
                queue.populate(items(20)).unwrap();
                while let Some(item) = queue.poll().unwrap() {
                    queue.acknowledge(&item).unwrap();
                }
            })
        };

        assert!(supervisor.wait_for_workers(Duration::from_secs(5)).unwrap());
        worker.join().unwrap();
        assert_eq!(supervisor.counts().unwrap().processed, 20);
    }

    #[test]
    fn wait_for_workers_gives_up_at_deadline_without_mutating() {
        let store = InMemoryStore::arc();
        let mut queue = DistributedQueue::new(Arc::clone(&store), config("w")).unwrap();
        queue.populate(items(2)).unwrap();
        let held = queue.poll().unwrap().unwrap();

        let supervisor = Supervisor::new(Arc::clone(&store), &config("reporter")).unwrap();
        let before = supervisor.counts().unwrap();
        assert!(!supervisor.wait_for_workers(Duration::from_millis(20)).unwrap());
        assert_eq!(supervisor.counts().unwrap(), before);
        assert_eq!(store.owner(supervisor.keys(), &held).unwrap(), Some(WorkerId::new("w")));
    }
}
