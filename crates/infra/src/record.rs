//! Reporting hooks: per-item error payloads and named stats.
//!
//! The reporting layer reads these independently of the queue and does its
//! own formatting. Payloads are stored as JSON strings.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use leaseq_core::{QueueConfig, QueueResult, StoreError, WorkerId};

use crate::keys::BuildKeys;
use crate::store::CoordinationStore;

/// Error reports and stats of one build, written under one worker's id.
#[derive(Debug)]
pub struct BuildRecord<S> {
    store: S,
    keys: BuildKeys,
    worker_id: WorkerId,
}

impl<S: CoordinationStore> BuildRecord<S> {
    pub fn new(store: S, config: &QueueConfig) -> Self {
        Self {
            store,
            keys: BuildKeys::from_config(config),
            worker_id: config.worker_id.clone(),
        }
    }

    /// Store the failure payload for `item` and this worker's stat values.
    pub fn record_error(&self, item: &str, payload: &JsonValue, stats: &[(&str, f64)]) -> QueueResult<()> {
        let encoded = serde_json::to_string(payload)
            .map_err(|e| StoreError::corrupt(format!("error payload for {item}: {e}")))?;
        self.store
            .record_error(&self.keys, &self.worker_id, item, &encoded, stats)?;
        debug!(worker_id = %self.worker_id, item, "recorded error");
        Ok(())
    }

    /// Clear any earlier error report for `item` and store stat values.
    pub fn record_success(&self, item: &str, stats: &[(&str, f64)]) -> QueueResult<()> {
        self.store
            .record_success(&self.keys, &self.worker_id, item, stats)?;
        Ok(())
    }

    /// Error payloads by item. Entries that are not valid JSON are kept as strings.
    pub fn error_reports(&self) -> QueueResult<BTreeMap<String, JsonValue>> {
        let raw = self.store.error_reports(&self.keys)?;
        Ok(raw
            .into_iter()
            .map(|(item, payload)| {
                let value = serde_json::from_str(&payload).unwrap_or_else(|e| {
                    warn!(item = %item, error = %e, "error payload is not JSON");
                    JsonValue::String(payload)
                });
                (item, value)
            })
            .collect())
    }

    /// Items that currently have an error report.
    pub fn failed_items(&self) -> QueueResult<Vec<String>> {
        Ok(self.store.error_reports(&self.keys)?.into_keys().collect())
    }

    /// Each named stat summed over every worker that reported it.
    pub fn fetch_stats(&self, names: &[&str]) -> QueueResult<BTreeMap<String, f64>> {
        let mut totals = BTreeMap::new();
        for name in names {
            let values = self.store.stat_values(&self.keys, name)?;
            totals.insert(name.to_string(), values.iter().sum());
        }
        Ok(totals)
    }

    /// Processed item count of the build.
    pub fn processed(&self) -> QueueResult<usize> {
        Ok(self.store.counts(&self.keys)?.processed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::store::InMemoryStore;

    fn record(store: &Arc<InMemoryStore>, worker: &str) -> BuildRecord<Arc<InMemoryStore>> {
        BuildRecord::new(Arc::clone(store), &QueueConfig::new("build-rec", worker))
    }

    #[test]
    fn error_reports_round_trip_as_json() {
        let store = InMemoryStore::arc();
        let rec = record(&store, "w1");

        rec.record_error("a", &json!({"message": "boom", "line": 12}), &[])
            .unwrap();

        let reports = rec.error_reports().unwrap();
        assert_eq!(reports["a"]["message"], "boom");
        assert_eq!(rec.failed_items().unwrap(), vec!["a"]);
    }

    #[test]
    fn success_clears_stale_report() {
        let store = InMemoryStore::arc();
        let rec = record(&store, "w1");
        rec.record_error("a", &json!("first attempt"), &[]).unwrap();
        rec.record_success("a", &[]).unwrap();
        assert!(rec.error_reports().unwrap().is_empty());
    }

    #[test]
    fn stats_are_summed_across_workers() {
        let store = InMemoryStore::arc();
        let w1 = record(&store, "w1");
        let w2 = record(&store, "w2");

        w1.record_success("a", &[("assertions", 10.0), ("seconds", 1.5)])
            .unwrap();
        w2.record_error("b", &json!({}), &[("assertions", 5.0)])
            .unwrap();
        // A later report from the same worker replaces its earlier value.
        w1.record_success("c", &[("assertions", 12.0)]).unwrap();

        let stats = w1.fetch_stats(&["assertions", "seconds", "missing"]).unwrap();
        assert_eq!(stats["assertions"], 17.0);
        assert_eq!(stats["seconds"], 1.5);
        assert_eq!(stats["missing"], 0.0);
    }

    #[test]
    fn non_json_payload_is_kept_as_string() {
        let store = InMemoryStore::arc();
        let rec = record(&store, "w1");
        store
            .record_error(&rec.keys, &rec.worker_id, "a", "plain text", &[])
            .unwrap();
        assert_eq!(rec.error_reports().unwrap()["a"], JsonValue::String("plain text".into()));
    }
}
