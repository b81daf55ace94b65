//! Infrastructure layer: the coordination store, the distributed queue built
//! on it, and process-level bisection runs.

pub mod keys;
pub mod process_runner;
pub mod queue;
pub mod record;
pub mod store;
pub mod supervisor;


pub use keys::BuildKeys;
pub use process_runner::ProcessRunner;
pub use queue::DistributedQueue;
pub use record::BuildRecord;
pub use store::{CoordinationStore, InMemoryStore, QueueCounts, RequeueOutcome, Reservation};
#[cfg(feature = "redis")]
pub use store::RedisStore;
pub use supervisor::{Supervisor, wait_for_master};
