//! Requeue budget policy.
//!
//! Two independent caps, fixed once from the initial item count: a per-item
//! cap and a build-wide cap of `ceil(total * requeue_tolerance)`. A requeue
//! succeeds only while both have room.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::QueueConfig;

/// Absorbs float noise such as `10 * 0.3 == 3.0000000000000004`.
const TOLERANCE_EPSILON: f64 = 1e-9;

/// The two requeue caps of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequeueBudget {
    /// Requeues allowed for any single item.
    pub max_requeues: u32,
    /// Requeues allowed across the whole build.
    pub global_max_requeues: u64,
}

impl RequeueBudget {
    pub fn new(max_requeues: u32, global_max_requeues: u64) -> Self {
        Self {
            max_requeues,
            global_max_requeues,
        }
    }

    /// Derive both caps from the initial item count.
    pub fn for_total(total: usize, max_requeues: u32, requeue_tolerance: f64) -> Self {
        let scaled = total as f64 * requeue_tolerance.max(0.0);
        let global = (scaled - TOLERANCE_EPSILON).ceil().max(0.0) as u64;
        Self::new(max_requeues, global)
    }

    pub fn from_config(total: usize, config: &QueueConfig) -> Self {
        Self::for_total(total, config.max_requeues, config.requeue_tolerance)
    }

    /// No requeues at all.
    pub fn none() -> Self {
        Self::new(0, 0)
    }

    /// Whether one more requeue fits, given the counts used so far.
    pub fn allows(&self, item_requeues: u32, total_requeues: u64) -> bool {
        item_requeues < self.max_requeues && total_requeues < self.global_max_requeues
    }
}

/// Requeue counters for a single-process queue.
///
/// The distributed queue keeps the same counters in the store instead.
#[derive(Debug, Clone, Default)]
pub struct RequeueCounters {
    per_item: HashMap<String, u32>,
    total: u64,
}

impl RequeueCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one requeue of `item` if the budget allows it.
    pub fn try_consume(&mut self, budget: &RequeueBudget, item: &str) -> bool {
        let used = self.per_item.get(item).copied().unwrap_or(0);
        if !budget.allows(used, self.total) {
            return false;
        }
        self.per_item.insert(item.to_string(), used + 1);
        self.total += 1;
        true
    }

    pub fn for_item(&self, item: &str) -> u32 {
        self.per_item.get(item).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}
