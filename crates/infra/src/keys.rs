//! Per-build key namespace.
//!
//! Keys look like `build:{<namespace>:<build_id>}:<name>`. The braces are a
//! Redis Cluster hash tag: every key of a build hashes to one slot, so a
//! single script may touch all of them.

use std::time::Duration;

use leaseq_core::{BuildId, QueueConfig, WorkerId};

/// Key names and expiry for one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildKeys {
    prefix: String,
    ttl: Duration,
}

impl BuildKeys {
    pub fn new(build_id: &BuildId, namespace: Option<&str>, ttl: Duration) -> Self {
        let tag = match namespace {
            Some(ns) if !ns.is_empty() => format!("{ns}:{build_id}"),
            _ => build_id.to_string(),
        };
        Self {
            prefix: format!("build:{{{tag}}}"),
            ttl,
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(&config.build_id, config.namespace.as_deref(), config.ttl)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Expiry in whole seconds, at least one.
    pub fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }

    /// List of never-served or requeued items.
    pub fn pending(&self) -> String {
        self.key("pending")
    }

    /// Sorted set of leased items scored by lease timestamp.
    pub fn reserved(&self) -> String {
        self.key("reserved")
    }

    /// Hash of item -> worker currently holding its lease.
    pub fn owners(&self) -> String {
        self.key("owners")
    }

    /// Set of items settled for good.
    pub fn processed(&self) -> String {
        self.key("processed")
    }

    /// Hash of item -> requeue count, plus the build-wide total.
    pub fn requeues(&self) -> String {
        self.key("requeues")
    }

    pub fn error_reports(&self) -> String {
        self.key("error-reports")
    }

    pub fn master_status(&self) -> String {
        self.key("master-status")
    }

    pub fn total(&self) -> String {
        self.key("total")
    }

    pub fn created_at(&self) -> String {
        self.key("created-at")
    }

    pub fn workers(&self) -> String {
        self.key("workers")
    }

    /// Items this worker settled, in order.
    pub fn completed(&self, worker: &WorkerId) -> String {
        self.key(&format!("worker:{worker}:completed"))
    }

    /// Hash of worker -> value for a named reporting stat.
    pub fn stat(&self, name: &str) -> String {
        self.key(&format!("stats:{name}"))
    }
}

/// Field of the requeues hash holding the build-wide count.
pub const TOTAL_REQUEUES_FIELD: &str = "___total___";
