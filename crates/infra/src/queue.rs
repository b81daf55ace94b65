//! Distributed lease queue.
//!
//! Many worker processes share one build's backlog through a
//! [`CoordinationStore`]. Each worker holds at most one lease; a lease not
//! settled within `timeout` is reclaimed by whichever worker reserves next.
//!
//! The reservation is a plain field on the queue, so one `DistributedQueue`
//! must not be driven from several threads at once. Run one per worker.

use std::collections::HashSet;
use std::thread;

use tracing::{debug, error, info, warn};

use leaseq_core::clock::to_epoch_secs;
use leaseq_core::{
    Clock, LocalQueue, MasterStatus, QueueConfig, QueueError, QueueResult, RequeueBudget,
    ShutdownSignal, StoreError, SystemClock, WorkQueue,
};

use crate::keys::BuildKeys;
use crate::store::{CoordinationStore, RequeueOutcome};
use crate::supervisor::wait_for_master;

/// One step of the poll loop.
enum Tick {
    Item(String),
    /// Nothing to lease now, but other workers still hold leases.
    Idle,
    Drained,
}

/// [`WorkQueue`] over a shared coordination store.
#[derive(Debug)]
pub struct DistributedQueue<S, C = SystemClock> {
    store: S,
    clock: C,
    config: QueueConfig,
    keys: BuildKeys,
    reserved: Option<String>,
    master: bool,
    initialized: bool,
    populated: bool,
    total: usize,
    budget: RequeueBudget,
    store_errors: u32,
    shutdown: ShutdownSignal,
}

impl<S: CoordinationStore> DistributedQueue<S> {
    pub fn new(store: S, config: QueueConfig) -> QueueResult<Self> {
        config.validate()?;
        Ok(Self {
            keys: BuildKeys::from_config(&config),
            store,
            clock: SystemClock,
            config,
            reserved: None,
            master: false,
            initialized: false,
            populated: false,
            total: 0,
            budget: RequeueBudget::none(),
            store_errors: 0,
            shutdown: ShutdownSignal::new(),
        })
    }
}

impl<S: CoordinationStore, C: Clock> DistributedQueue<S, C> {
    /// Replace the clock used to stamp and expire leases.
    pub fn with_clock<C2: Clock>(self, clock: C2) -> DistributedQueue<S, C2> {
        DistributedQueue {
            store: self.store,
            clock,
            config: self.config,
            keys: self.keys,
            reserved: self.reserved,
            master: self.master,
            initialized: self.initialized,
            populated: self.populated,
            total: self.total,
            budget: self.budget,
            store_errors: self.store_errors,
            shutdown: self.shutdown,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn keys(&self) -> &BuildKeys {
        &self.keys
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn budget(&self) -> RequeueBudget {
        self.budget
    }

    /// The item this worker currently holds.
    pub fn reserved_item(&self) -> Option<&str> {
        self.reserved.as_deref()
    }

    fn now(&self) -> f64 {
        to_epoch_secs(self.clock.now())
    }

    /// Wait for the master's backlog, then load the build-wide totals.
    fn ensure_initialized(&mut self) -> QueueResult<()> {
        if self.initialized {
            return Ok(());
        }
        wait_for_master(
            &self.store,
            &self.keys,
            self.config.master_timeout,
            self.config.master_poll_interval,
        )?;
        let total = self.store.total(&self.keys)?.ok_or_else(|| {
            StoreError::corrupt(format!("build {} is ready but has no total", self.keys.prefix()))
        })?;
        self.total = total;
        self.budget = RequeueBudget::from_config(total, &self.config);
        self.initialized = true;
        debug!(
            worker_id = %self.config.worker_id,
            total,
            global_max_requeues = self.budget.global_max_requeues,
            "build initialized"
        );
        Ok(())
    }

    /// Lease one item without waiting.
    ///
    /// Reclaims the oldest expired lease before serving a fresh item.
    pub fn reserve(&mut self) -> QueueResult<Option<String>> {
        if let Some(held) = &self.reserved {
            return Err(QueueError::ReservationHeld { held: held.clone() });
        }
        let now = self.now();
        let Some(reservation) =
            self.store
                .reserve(&self.keys, &self.config.worker_id, now, self.config.timeout)?
        else {
            return Ok(None);
        };

        if reservation.reclaimed {
            info!(
                worker_id = %self.config.worker_id,
                item = %reservation.item,
                "reclaimed expired lease"
            );
        } else {
            debug!(worker_id = %self.config.worker_id, item = %reservation.item, "reserved item");
        }
        self.reserved = Some(reservation.item.clone());
        Ok(Some(reservation.item))
    }

    fn tick(&mut self) -> QueueResult<Tick> {
        if let Some(item) = self.reserve()? {
            return Ok(Tick::Item(item));
        }
        let counts = self.store.counts(&self.keys)?;
        if counts.pending == 0 && counts.reserved == 0 {
            Ok(Tick::Drained)
        } else {
            Ok(Tick::Idle)
        }
    }

    /// Release the reservation for `item`, or report how the caller misused it.
    fn take_reservation(&mut self, item: &str) -> QueueResult<String> {
        match self.reserved.take() {
            Some(reserved) if reserved == item => Ok(reserved),
            Some(reserved) => {
                let err = QueueError::ReservationMismatch {
                    reserved: reserved.clone(),
                    item: item.to_string(),
                };
                self.reserved = Some(reserved);
                Err(err)
            }
            None => Err(QueueError::NotReserved {
                item: item.to_string(),
            }),
        }
    }

    /// Re-stamp the current lease so a long-running item is not reclaimed.
    ///
    /// False when nothing is held or the lease was already taken over.
    pub fn heartbeat(&mut self) -> QueueResult<bool> {
        let Some(item) = self.reserved.as_deref() else {
            return Ok(false);
        };
        let now = self.now();
        let renewed = self
            .store
            .heartbeat(&self.keys, &self.config.worker_id, item, now)?;
        if !renewed {
            warn!(worker_id = %self.config.worker_id, item, "lease lost before heartbeat");
        }
        Ok(renewed)
    }

    /// A local queue holding exactly what this worker settled, in order.
    pub fn retry_queue(&self) -> QueueResult<LocalQueue> {
        let items = self.store.completed_log(&self.keys, &self.config.worker_id)?;
        Ok(LocalQueue::populated(
            items,
            self.config.max_requeues,
            self.config.requeue_tolerance,
        ))
    }

    pub fn master_status(&self) -> QueueResult<MasterStatus> {
        Ok(self.store.master_status(&self.keys)?)
    }

    fn finish(&self) {
        match self.store.mark_finished(&self.keys) {
            Ok(()) => info!(worker_id = %self.config.worker_id, "build drained"),
            Err(err) => warn!(worker_id = %self.config.worker_id, error = %err, "could not mark build finished"),
        }
    }
}

impl<S: CoordinationStore, C: Clock> WorkQueue for DistributedQueue<S, C> {
    fn populate(&mut self, items: Vec<String>) -> QueueResult<()> {
        if self.populated {
            warn!(worker_id = %self.config.worker_id, "populate called twice, ignoring");
            return Ok(());
        }

        let mut seen = HashSet::with_capacity(items.len());
        if let Some(dup) = items.iter().find(|item| !seen.insert(item.as_str())) {
            return Err(QueueError::DuplicateItem { item: dup.clone() });
        }

        match self.store.try_elect(&self.keys) {
            Ok(true) => {
                let now = self.now();
                if let Err(err) = self.store.push(&self.keys, &items, now) {
                    error!(
                        worker_id = %self.config.worker_id,
                        build_id = %self.config.build_id,
                        error = %err,
                        "elected master but could not publish backlog"
                    );
                    if let Err(reset) = self.store.abandon_setup(&self.keys) {
                        error!(build_id = %self.config.build_id, error = %reset, "could not release setup claim");
                    }
                    return Err(err.into());
                }
                self.master = true;
                self.initialized = true;
                self.total = items.len();
                self.budget = RequeueBudget::from_config(self.total, &self.config);
                info!(
                    worker_id = %self.config.worker_id,
                    build_id = %self.config.build_id,
                    total = self.total,
                    "elected master, backlog published"
                );
            }
            Ok(false) => {
                debug!(worker_id = %self.config.worker_id, "another worker is master");
            }
            Err(err) if err.is_transient() => {
                warn!(worker_id = %self.config.worker_id, error = %err, "election failed, continuing as follower");
            }
            Err(err) => return Err(err.into()),
        }

        if let Err(err) = self.store.register_worker(&self.keys, &self.config.worker_id) {
            if !err.is_transient() {
                return Err(err.into());
            }
            warn!(worker_id = %self.config.worker_id, error = %err, "worker registration failed");
        }

        self.populated = true;
        Ok(())
    }

    fn poll(&mut self) -> QueueResult<Option<String>> {
        if !self.populated {
            return Err(QueueError::NotPopulated);
        }
        if let Some(held) = &self.reserved {
            return Err(QueueError::ReservationHeld { held: held.clone() });
        }
        match self.ensure_initialized() {
            Ok(()) => {}
            Err(err) if err.is_transient() => {
                error!(worker_id = %self.config.worker_id, error = %err, "store unavailable during setup");
                return Ok(None);
            }
            Err(err) => return Err(err),
        }

        loop {
            if self.shutdown.is_requested() {
                debug!(worker_id = %self.config.worker_id, "shutdown requested");
                return Ok(None);
            }

            match self.tick() {
                Ok(Tick::Item(item)) => {
                    self.store_errors = 0;
                    return Ok(Some(item));
                }
                Ok(Tick::Idle) => {
                    self.store_errors = 0;
                    thread::sleep(self.config.poll_interval);
                }
                Ok(Tick::Drained) => {
                    self.finish();
                    return Ok(None);
                }
                Err(err) if err.is_transient() => {
                    self.store_errors += 1;
                    if self.store_errors >= self.config.max_store_errors {
                        error!(
                            worker_id = %self.config.worker_id,
                            attempt = self.store_errors,
                            error = %err,
                            "store unavailable, giving up"
                        );
                        return Ok(None);
                    }
                    warn!(
                        worker_id = %self.config.worker_id,
                        attempt = self.store_errors,
                        error = %err,
                        "transient store error, retrying"
                    );
                    thread::sleep(self.config.poll_interval);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn acknowledge(&mut self, item: &str) -> QueueResult<bool> {
        let item = self.take_reservation(item)?;
        let added = self
            .store
            .acknowledge(&self.keys, &self.config.worker_id, &item)?;
        if added {
            debug!(worker_id = %self.config.worker_id, item = %item, "acknowledged");
        } else {
            info!(worker_id = %self.config.worker_id, item = %item, "duplicate acknowledge");
        }
        Ok(added)
    }

    fn requeue(&mut self, item: &str) -> QueueResult<bool> {
        let item = self.take_reservation(item)?;
        let outcome = self.store.requeue(
            &self.keys,
            &self.config.worker_id,
            &item,
            &self.budget,
            self.config.requeue_offset,
        )?;
        match outcome {
            RequeueOutcome::Requeued => {
                info!(worker_id = %self.config.worker_id, item = %item, "requeued");
                Ok(true)
            }
            RequeueOutcome::Exhausted => {
                warn!(worker_id = %self.config.worker_id, item = %item, "requeue budget exhausted, final failure");
                Ok(false)
            }
            RequeueOutcome::NotOwned => {
                warn!(worker_id = %self.config.worker_id, item = %item, "lease lost, requeue skipped");
                Err(QueueError::LeaseLost { item })
            }
        }
    }

    fn is_exhausted(&self) -> QueueResult<bool> {
        if !self.store.master_status(&self.keys)?.is_initialized() {
            return Ok(false);
        }
        let counts = self.store.counts(&self.keys)?;
        Ok(counts.pending == 0 && counts.reserved == 0)
    }

    fn size(&self) -> QueueResult<usize> {
        let counts = self.store.counts(&self.keys)?;
        Ok(counts.pending + counts.reserved)
    }

    fn total(&self) -> usize {
        self.total
    }

    fn is_master(&self) -> bool {
        self.master
    }

    fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }
}
