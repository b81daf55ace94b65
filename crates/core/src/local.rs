//! Single-process queue.
//!
//! Used for runs on one machine, for retrying exactly what a worker ran, and
//! as the behavioral baseline the distributed queue is tested against.

use std::collections::VecDeque;

use tracing::debug;

use crate::budget::{RequeueBudget, RequeueCounters};
use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::queue::{ShutdownSignal, WorkQueue};

/// In-memory FIFO queue with the same requeue budget as the distributed one.
#[derive(Debug, Clone)]
pub struct LocalQueue {
    pending: VecDeque<String>,
    populated: bool,
    total: usize,
    processed: usize,
    max_requeues: u32,
    requeue_tolerance: f64,
    budget: RequeueBudget,
    counters: RequeueCounters,
    shutdown: ShutdownSignal,
}

impl LocalQueue {
    /// A queue that never requeues.
    pub fn new() -> Self {
        Self::with_requeues(0, 0.0)
    }

    pub fn with_requeues(max_requeues: u32, requeue_tolerance: f64) -> Self {
        Self {
            pending: VecDeque::new(),
            populated: false,
            total: 0,
            processed: 0,
            max_requeues,
            requeue_tolerance,
            budget: RequeueBudget::none(),
            counters: RequeueCounters::new(),
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::with_requeues(config.max_requeues, config.requeue_tolerance)
    }

    /// Convenience: a queue already populated with `items`.
    pub fn populated(items: Vec<String>, max_requeues: u32, requeue_tolerance: f64) -> Self {
        let mut queue = Self::with_requeues(max_requeues, requeue_tolerance);
        queue.fill(items);
        queue
    }

    fn fill(&mut self, items: Vec<String>) {
        self.total = items.len();
        self.budget = RequeueBudget::for_total(self.total, self.max_requeues, self.requeue_tolerance);
        self.pending = items.into();
        self.populated = true;
    }

    pub fn budget(&self) -> RequeueBudget {
        self.budget
    }

    pub fn processed(&self) -> usize {
        self.processed
    }

    /// Remaining items in serving order.
    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(String::as_str)
    }
}

impl Default for LocalQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue for LocalQueue {
    fn populate(&mut self, items: Vec<String>) -> QueueResult<()> {
        self.fill(items);
        Ok(())
    }

    fn poll(&mut self) -> QueueResult<Option<String>> {
        if !self.populated {
            return Err(QueueError::NotPopulated);
        }
        if self.shutdown.is_requested() {
            return Ok(None);
        }
        Ok(self.pending.pop_front())
    }

    fn acknowledge(&mut self, _item: &str) -> QueueResult<bool> {
        self.processed += 1;
        Ok(true)
    }

    fn requeue(&mut self, item: &str) -> QueueResult<bool> {
        if !self.counters.try_consume(&self.budget, item) {
            debug!(item, "requeue budget exhausted");
            self.processed += 1;
            return Ok(false);
        }
        self.pending.push_front(item.to_string());
        Ok(true)
    }

    fn is_exhausted(&self) -> QueueResult<bool> {
        Ok(self.pending.is_empty())
    }

    fn size(&self) -> QueueResult<usize> {
        Ok(self.pending.len())
    }

    fn total(&self) -> usize {
        self.total
    }

    fn is_master(&self) -> bool {
        true
    }

    fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn items(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn polls_in_order_until_exhausted() {
        let mut queue = LocalQueue::new();
        queue.populate(items(&["a", "b", "c"])).unwrap();

        assert_eq!(queue.poll().unwrap().as_deref(), Some("a"));
        assert_eq!(queue.size().unwrap(), 2);
        assert_eq!(queue.poll().unwrap().as_deref(), Some("b"));
        assert_eq!(queue.poll().unwrap().as_deref(), Some("c"));
        assert_eq!(queue.poll().unwrap(), None);
        assert!(queue.is_exhausted().unwrap());
        assert_eq!(queue.progress().unwrap(), 3);
    }

    #[test]
    fn poll_before_populate_is_misuse() {
        let mut queue = LocalQueue::new();
        assert_eq!(queue.poll(), Err(QueueError::NotPopulated));
    }

    #[test]
    fn requeue_reinserts_at_front_within_budget() {
        let mut queue = LocalQueue::populated(items(&["a", "b", "c", "d"]), 1, 0.5);

        let a = queue.poll().unwrap().unwrap();
        assert!(queue.requeue(&a).unwrap());
        assert_eq!(queue.poll().unwrap().as_deref(), Some("a"));

        assert!(!queue.requeue("a").unwrap(), "per-item cap of 1 used");

        let b = queue.poll().unwrap().unwrap();
        assert!(queue.requeue(&b).unwrap());
        let b = queue.poll().unwrap().unwrap();
        assert_eq!(b, "b");

        let c = queue.poll().unwrap().unwrap();
        assert!(!queue.requeue(&c).unwrap(), "global cap of 2 used");
        assert_eq!(queue.processed(), 2);
    }

    #[test]
    fn shutdown_stops_polling() {
        let mut queue = LocalQueue::populated(items(&["a", "b"]), 0, 0.0);
        queue.shutdown_signal().request();
        assert_eq!(queue.poll().unwrap(), None);
        assert!(!queue.is_exhausted().unwrap());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: every populated item ends up acknowledged or finally
        /// failed, whatever the pass/fail pattern.
        #[test]
        fn every_item_settles_exactly_once(
            count in 0usize..40,
            failures in prop::collection::vec(any::<bool>(), 0..200),
            max_requeues in 0u32..3,
            tolerance in 0.0f64..=1.0,
        ) {
            let ids: Vec<String> = (0..count).map(|i| format!("t{i}")).collect();
            let mut queue = LocalQueue::populated(ids, max_requeues, tolerance);
            let mut outcomes = failures.into_iter().cycle();

            let mut acknowledged = 0usize;
            let mut final_failures = 0usize;
            while let Some(item) = queue.poll().unwrap() {
                let failed = outcomes.next().unwrap_or(false);
                if failed {
                    if !queue.requeue(&item).unwrap() {
                        final_failures += 1;
                    }
                } else {
                    queue.acknowledge(&item).unwrap();
                    acknowledged += 1;
                }
            }

            prop_assert_eq!(acknowledged + final_failures, count);
            prop_assert_eq!(queue.processed(), count);
        }
    }
}
