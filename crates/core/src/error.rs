//! Queue error model.

use std::time::Duration;

use thiserror::Error;

/// Result type used by queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Failure talking to the coordination store.
///
/// Connection failures are transient: the poll loop degrades them to "no work
/// this tick". Everything else indicates a broken store or corrupt state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached (refused, dropped, timed out).
    #[error("store connection error: {0}")]
    Connection(String),

    /// The store rejected a command or script.
    #[error("store command error: {0}")]
    Command(String),

    /// A stored value could not be interpreted.
    #[error("corrupt store value: {0}")]
    Corrupt(String),

    /// An in-process lock guarding store state was poisoned.
    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Whether retrying on the next poll tick can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Invalid queue configuration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("build id must not be empty")]
    EmptyBuildId,

    #[error("worker id must not be empty")]
    EmptyWorkerId,

    #[error("requeue tolerance must be within 0.0..=1.0, got {0}")]
    RequeueTolerance(f64),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("max consecutive failures must be greater than zero")]
    ZeroMaxConsecutiveFailures,
}

/// Queue-level error.
///
/// Protocol misuse variants are caller bugs and are never retried. Budget
/// exhaustion is not represented here: it is a plain `false` from `requeue`.
/// A lost lease is neither: the item belongs to another worker now and this
/// worker must drop it without counting it as settled.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueueError {
    /// `reserve` was called while this worker still holds an item.
    #[error("worker already holds a reservation on {held:?}")]
    ReservationHeld { held: String },

    /// `acknowledge`/`requeue` was called with no reservation held.
    #[error("no reservation held, cannot settle {item:?}")]
    NotReserved { item: String },

    /// `acknowledge`/`requeue` named an item other than the reserved one.
    #[error("reserved {reserved:?} but tried to settle {item:?}")]
    ReservationMismatch { reserved: String, item: String },

    /// The lease on `item` expired and was taken over before it was settled.
    #[error("lease on {item:?} was lost to another worker")]
    LeaseLost { item: String },

    /// The elected master never finished populating the build.
    #[error("master did not finish setup within {waited:?} (status: {status})")]
    LostMaster { waited: Duration, status: String },

    /// `populate` was given the same item id twice.
    #[error("item {item:?} appears more than once in the backlog")]
    DuplicateItem { item: String },

    /// `poll` was called before `populate`.
    #[error("queue has not been populated")]
    NotPopulated,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl QueueError {
    /// Whether this error is a transient store condition.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_transient())
    }

    pub fn is_lease_lost(&self) -> bool {
        matches!(self, Self::LeaseLost { .. })
    }

    /// Whether this error is a caller-side protocol violation.
    pub fn is_protocol_misuse(&self) -> bool {
        matches!(
            self,
            Self::ReservationHeld { .. }
                | Self::NotReserved { .. }
                | Self::ReservationMismatch { .. }
                | Self::NotPopulated
                | Self::DuplicateItem { .. }
        )
    }
}

/// Bisection failure (not to be confused with an inconclusive result).
#[derive(Debug, Error)]
pub enum BisectError {
    #[error("failing item {0:?} is not part of the run order")]
    FailingItemNotFound(String),

    #[error("isolated run failed to execute: {0}")]
    Runner(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_errors_are_transient() {
        assert!(StoreError::connection("refused").is_transient());
        assert!(!StoreError::command("NOSCRIPT").is_transient());
        assert!(!StoreError::Poisoned.is_transient());

        let err: QueueError = StoreError::connection("reset").into();
        assert!(err.is_transient());
        assert!(!err.is_protocol_misuse());
    }

    #[test]
    fn protocol_misuse_is_classified() {
        let err = QueueError::ReservationMismatch {
            reserved: "a".into(),
            item: "b".into(),
        };
        assert!(err.is_protocol_misuse());
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "reserved \"a\" but tried to settle \"b\"");
    }

    #[test]
    fn lost_lease_is_neither_misuse_nor_transient() {
        let err = QueueError::LeaseLost { item: "a".into() };
        assert!(err.is_lease_lost());
        assert!(!err.is_protocol_misuse());
        assert!(!err.is_transient());
    }
}
