//! The work queue contract shared by every backend.
//!
//! ## Collaborator contract
//!
//! - The producer calls [`WorkQueue::populate`] exactly once, before any
//!   [`WorkQueue::poll`], with the full ordered item list.
//! - For every item returned by `poll`, the executor calls exactly one of
//!   [`WorkQueue::acknowledge`] or [`WorkQueue::requeue`] with that same item
//!   before polling again.
//!
//! ## Thread safety
//!
//! Queues hold at most one reservation in a plain field and take `&mut self`.
//! They are meant to be driven by one thread; run one queue per worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{QueueResult, StoreError};

/// Lifecycle of a build's master election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MasterStatus {
    /// Nobody has claimed the build yet.
    Unset,
    /// A master was elected and is populating.
    Setup,
    /// Items are available.
    Ready,
    /// A worker observed the build drained.
    Finished,
}

impl MasterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Setup => "setup",
            Self::Ready => "ready",
            Self::Finished => "finished",
        }
    }

    /// Parse the stored representation; a missing key means `Unset`.
    pub fn parse(raw: Option<&str>) -> Result<Self, StoreError> {
        match raw {
            None => Ok(Self::Unset),
            Some("setup") => Ok(Self::Setup),
            Some("ready") => Ok(Self::Ready),
            Some("finished") => Ok(Self::Finished),
            Some(other) => Err(StoreError::corrupt(format!(
                "unknown master status {other:?}"
            ))),
        }
    }

    /// Whether the backlog has been published.
    pub fn is_initialized(&self) -> bool {
        matches!(self, Self::Ready | Self::Finished)
    }
}

impl core::fmt::Display for MasterStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cooperative shutdown flag, checked once per poll iteration.
///
/// An item reserved when shutdown is requested is simply abandoned; its lease
/// expires and another worker reclaims it.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A queue of opaque work item ids.
pub trait WorkQueue {
    /// Publish the full item list. Only the master's call takes effect in a
    /// distributed queue; everyone else waits for it.
    fn populate(&mut self, items: Vec<String>) -> QueueResult<()>;

    /// Block until an item is available for this worker, or return `None`
    /// once the queue is exhausted or shutdown was requested.
    fn poll(&mut self) -> QueueResult<Option<String>>;

    /// Mark the reserved item processed. `false` means another worker had
    /// already acknowledged it; that is not an error.
    fn acknowledge(&mut self, item: &str) -> QueueResult<bool>;

    /// Return the reserved item to the backlog. `false` means the budget is
    /// spent and the item was recorded as a final failure instead. A backend
    /// with expiring leases reports a taken-over lease as
    /// [`QueueError::LeaseLost`](crate::error::QueueError::LeaseLost).
    fn requeue(&mut self, item: &str) -> QueueResult<bool>;

    /// Whether no work is left anywhere.
    fn is_exhausted(&self) -> QueueResult<bool>;

    /// Items pending or reserved.
    fn size(&self) -> QueueResult<usize>;

    /// Items in the build as populated.
    fn total(&self) -> usize;

    /// Items that left the queue for good.
    fn progress(&self) -> QueueResult<usize> {
        Ok(self.total().saturating_sub(self.size()?))
    }

    /// Whether this worker populated the queue.
    fn is_master(&self) -> bool;

    /// Handle the caller can use to stop `poll` cooperatively.
    fn shutdown_signal(&self) -> ShutdownSignal;
}

impl<Q> WorkQueue for Box<Q>
where
    Q: WorkQueue + ?Sized,
{
    fn populate(&mut self, items: Vec<String>) -> QueueResult<()> {
        (**self).populate(items)
    }

    fn poll(&mut self) -> QueueResult<Option<String>> {
        (**self).poll()
    }

    fn acknowledge(&mut self, item: &str) -> QueueResult<bool> {
        (**self).acknowledge(item)
    }

    fn requeue(&mut self, item: &str) -> QueueResult<bool> {
        (**self).requeue(item)
    }

    fn is_exhausted(&self) -> QueueResult<bool> {
        (**self).is_exhausted()
    }

    fn size(&self) -> QueueResult<usize> {
        (**self).size()
    }

    fn total(&self) -> usize {
        (**self).total()
    }

    fn progress(&self) -> QueueResult<usize> {
        (**self).progress()
    }

    fn is_master(&self) -> bool {
        (**self).is_master()
    }

    fn shutdown_signal(&self) -> ShutdownSignal {
        (**self).shutdown_signal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_status_parses_stored_values() {
        assert_eq!(MasterStatus::parse(None).unwrap(), MasterStatus::Unset);
        assert_eq!(
            MasterStatus::parse(Some("ready")).unwrap(),
            MasterStatus::Ready
        );
        assert!(MasterStatus::parse(Some("bogus")).is_err());
        assert!(MasterStatus::Finished.is_initialized());
        assert!(!MasterStatus::Setup.is_initialized());
    }

    #[test]
    fn shutdown_signal_is_shared_between_clones() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_requested());
        signal.request();
        assert!(clone.is_requested());
    }
}
