//! Worker drive loop: poll, hand the item to the executor, settle it.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::circuit_breaker::CircuitBreakers;
use crate::error::QueueResult;
use crate::queue::WorkQueue;

/// What the executor reports for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed,
}

/// Counters for one worker run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    /// Items acknowledged after passing.
    pub passed: u64,
    /// Items whose failure was final (requeue refused).
    pub failed: u64,
    /// Failures handed back to the backlog for another attempt.
    pub requeued: u64,
    /// Passing items another worker had already acknowledged.
    pub duplicate_acks: u64,
    /// Items left to lease expiry because settling them hit a store outage.
    pub abandoned: u64,
    /// Failed items whose lease another worker took over before the requeue.
    pub lost_leases: u64,
    /// Set when a circuit breaker ended the run early.
    pub stopped_by: Option<String>,
}

impl WorkerSummary {
    pub fn settled(&self) -> u64 {
        self.passed + self.failed
    }
}

/// Drive `queue` until it is exhausted, shut down, or a breaker opens.
///
/// Protocol and non-transient store errors propagate. A transient store error
/// while settling abandons that item: its lease expires and another worker
/// reclaims it. A lost lease leaves the item to its new holder and counts
/// toward neither `failed` nor `requeued`.
pub fn run_worker<Q, F>(
    queue: &mut Q,
    breakers: &mut CircuitBreakers,
    mut execute: F,
) -> QueueResult<WorkerSummary>
where
    Q: WorkQueue + ?Sized,
    F: FnMut(&str) -> Outcome,
{
    let mut summary = WorkerSummary::default();
    info!(master = queue.is_master(), total = queue.total(), "worker started");

    loop {
        if let Some(breaker) = breakers.tripped() {
            let reason = breaker.describe();
            warn!(reason = %reason, "circuit breaker open, stopping worker");
            summary.stopped_by = Some(reason);
            break;
        }

        let Some(item) = queue.poll()? else {
            break;
        };

        match execute(&item) {
            Outcome::Passed => {
                breakers.report_success();
                match queue.acknowledge(&item) {
                    Ok(true) => summary.passed += 1,
                    Ok(false) => {
                        debug!(item = %item, "item already acknowledged elsewhere");
                        summary.duplicate_acks += 1;
                    }
                    Err(err) if err.is_transient() => {
                        warn!(item = %item, error = %err, "acknowledge failed, leaving lease to expire");
                        summary.abandoned += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
            Outcome::Failed => {
                breakers.report_failure();
                match queue.requeue(&item) {
                    Ok(true) => summary.requeued += 1,
                    Ok(false) => summary.failed += 1,
                    Err(err) if err.is_lease_lost() => {
                        info!(item = %item, "lease taken over, leaving item to its holder");
                        summary.lost_leases += 1;
                    }
                    Err(err) if err.is_transient() => {
                        warn!(item = %item, error = %err, "requeue failed, leaving lease to expire");
                        summary.abandoned += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
    }

    info!(
        passed = summary.passed,
        failed = summary.failed,
        requeued = summary.requeued,
        duplicate_acks = summary.duplicate_acks,
        abandoned = summary.abandoned,
        lost_leases = summary.lost_leases,
        "worker stopped"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreaker;
    use crate::local::LocalQueue;

    fn items(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("t{i}")).collect()
    }

    #[test]
    fn runs_every_item() {
        let mut queue = LocalQueue::populated(items(5), 0, 0.0);
        let mut seen = Vec::new();
        let summary = run_worker(&mut queue, &mut CircuitBreakers::default(), |item| {
            seen.push(item.to_string());
            Outcome::Passed
        })
        .unwrap();

        assert_eq!(summary.passed, 5);
        assert_eq!(seen, items(5));
        assert!(summary.stopped_by.is_none());
    }

    #[test]
    fn failures_are_retried_within_budget() {
        let mut queue = LocalQueue::populated(items(4), 1, 0.5);
        let mut attempts = std::collections::HashMap::<String, u32>::new();

        let summary = run_worker(&mut queue, &mut CircuitBreakers::default(), |item| {
            let n = attempts.entry(item.to_string()).or_default();
            *n += 1;
            if item == "t0" { Outcome::Failed } else { Outcome::Passed }
        })
        .unwrap();

        assert_eq!(attempts["t0"], 2);
        assert_eq!(summary.requeued, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.passed, 3);
        assert_eq!(summary.settled(), 4);
    }

    #[test]
    fn open_breaker_stops_the_loop() {
        let mut queue = LocalQueue::populated(items(10), 0, 0.0);
        let mut breakers = CircuitBreakers::new(vec![CircuitBreaker::max_consecutive_failures(3)]);

        let summary = run_worker(&mut queue, &mut breakers, |_| Outcome::Failed).unwrap();

        assert_eq!(summary.failed, 3);
        assert_eq!(queue.size().unwrap(), 7);
        assert_eq!(
            summary.stopped_by.as_deref(),
            Some("3 consecutive failures")
        );
    }
}
