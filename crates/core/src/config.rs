//! Per-worker queue configuration.
//!
//! Every tunable is an explicit field here; nothing is read from process-wide
//! mutable state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::id::{BuildId, WorkerId};

/// Default number of pending slots a requeued item is placed behind.
pub const DEFAULT_REQUEUE_OFFSET: usize = 42;

/// Default store key expiry (8 hours).
pub const DEFAULT_TTL: Duration = Duration::from_secs(8 * 60 * 60);

/// Queue configuration shared by every backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Build this worker participates in.
    pub build_id: BuildId,
    /// Optional prefix separating unrelated users of one store.
    pub namespace: Option<String>,
    /// This worker's identity.
    pub worker_id: WorkerId,
    /// Lease duration: an unacknowledged item becomes reclaimable after this.
    pub timeout: Duration,
    /// Per-item requeue cap.
    pub max_requeues: u32,
    /// Build-wide requeue cap as a fraction of the initial item count.
    pub requeue_tolerance: f64,
    /// How many pending items a requeued item is placed behind.
    pub requeue_offset: usize,
    /// Stop the worker after this many consecutive failures.
    pub max_consecutive_failures: Option<u32>,
    /// Stop the worker once it has been running this long.
    pub max_duration: Option<Duration>,
    /// How long non-master workers wait for the master to finish setup.
    pub master_timeout: Duration,
    /// Backoff between empty reserve attempts.
    pub poll_interval: Duration,
    /// Backoff between master-status checks.
    pub master_poll_interval: Duration,
    /// Consecutive transient store errors tolerated before `poll` gives up.
    pub max_store_errors: u32,
    /// Expiry applied to every store key of the build.
    pub ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            build_id: BuildId::new("local"),
            namespace: None,
            worker_id: WorkerId::generate(),
            timeout: Duration::from_secs(30),
            max_requeues: 0,
            requeue_tolerance: 0.0,
            requeue_offset: DEFAULT_REQUEUE_OFFSET,
            max_consecutive_failures: None,
            max_duration: None,
            master_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
            master_poll_interval: Duration::from_millis(100),
            max_store_errors: 20,
            ttl: DEFAULT_TTL,
        }
    }
}

impl QueueConfig {
    pub fn new(build_id: impl Into<BuildId>, worker_id: impl Into<WorkerId>) -> Self {
        Self {
            build_id: build_id.into(),
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set both requeue caps at once.
    pub fn with_requeues(mut self, max_requeues: u32, requeue_tolerance: f64) -> Self {
        self.max_requeues = max_requeues;
        self.requeue_tolerance = requeue_tolerance;
        self
    }

    pub fn with_requeue_offset(mut self, offset: usize) -> Self {
        self.requeue_offset = offset;
        self
    }

    pub fn with_max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = Some(max);
        self
    }

    pub fn with_max_duration(mut self, max: Duration) -> Self {
        self.max_duration = Some(max);
        self
    }

    pub fn with_master_timeout(mut self, timeout: Duration) -> Self {
        self.master_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_master_poll_interval(mut self, interval: Duration) -> Self {
        self.master_poll_interval = interval;
        self
    }

    pub fn with_max_store_errors(mut self, max: u32) -> Self {
        self.max_store_errors = max;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Reject values that would make the protocol misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.build_id.is_empty() {
            return Err(ConfigError::EmptyBuildId);
        }
        if self.worker_id.is_empty() {
            return Err(ConfigError::EmptyWorkerId);
        }
        if !(0.0..=1.0).contains(&self.requeue_tolerance) {
            return Err(ConfigError::RequeueTolerance(self.requeue_tolerance));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("timeout"));
        }
        if self.ttl.as_secs() == 0 {
            return Err(ConfigError::ZeroDuration("ttl"));
        }
        if self.max_consecutive_failures == Some(0) {
            return Err(ConfigError::ZeroMaxConsecutiveFailures);
        }
        Ok(())
    }
}
