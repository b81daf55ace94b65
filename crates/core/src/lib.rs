//! `leaseq-core`: queue building blocks with no I/O.
//!
//! The distributed implementation of [`WorkQueue`] lives in `leaseq-infra`;
//! everything here is shared by it or usable on its own in a single process.

pub mod bisect;
pub mod budget;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod id;
pub mod local;
pub mod queue;
pub mod worker;

pub use bisect::{BisectOutcome, BisectSession, Bisector, IsolatedRunner, Verdict};
pub use budget::{RequeueBudget, RequeueCounters};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakers};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::QueueConfig;
pub use error::{BisectError, ConfigError, QueueError, QueueResult, StoreError};
pub use id::{BuildId, WorkerId};
pub use local::LocalQueue;
pub use queue::{MasterStatus, ShutdownSignal, WorkQueue};
pub use worker::{Outcome, WorkerSummary, run_worker};
