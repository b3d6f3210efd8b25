use dashmap::DashMap;
use serde::Serialize;
use url::Url;

use crate::config::HealthSettings;
use crate::registry::gateway_key;
use crate::time_util::epoch_ms;

/// Per-gateway circuit-breaker state.
#[derive(Clone, Debug, Serialize)]
pub struct HealthRecord {
    pub healthy: bool,
    pub last_checked: u64,
    pub failures: u32,
    pub circuit_open: bool,
    pub circuit_open_until: u64,
}

impl HealthRecord {
    fn fresh() -> Self {
        Self {
            healthy: true,
            last_checked: epoch_ms(),
            failures: 0,
            circuit_open: false,
            circuit_open_until: 0,
        }
    }
}

/// Tracks failures per gateway and opens a circuit once they cross the
/// threshold. An open circuit re-closes on its own after `circuit_reset_ms`
/// but only back to *unhealthy*; the next success is required to restore
/// `healthy`.
pub struct HealthTracker {
    records: DashMap<String, HealthRecord>,
    settings: HealthSettings,
}

impl HealthTracker {
    pub fn new(settings: HealthSettings) -> Self {
        Self {
            records: DashMap::new(),
            settings,
        }
    }

    pub fn record_failure(&self, gateway: &Url) {
        let key = gateway_key(gateway);
        self.ensure_capacity(&key);
        let now = epoch_ms();
        let mut record = self.records.entry(key.clone()).or_insert_with(HealthRecord::fresh);
        record.failures += 1;
        record.last_checked = now;
        if record.failures >= self.settings.failure_threshold && !record.circuit_open {
            record.circuit_open = true;
            record.circuit_open_until = now + self.settings.circuit_reset_ms;
            record.healthy = false;
            tracing::warn!(
                gateway = %key,
                failures = record.failures,
                reset_ms = self.settings.circuit_reset_ms,
                "circuit opened"
            );
        }
    }

    pub fn mark_healthy(&self, gateway: &Url) {
        let key = gateway_key(gateway);
        self.ensure_capacity(&key);
        let mut record = self.records.entry(key).or_insert_with(HealthRecord::fresh);
        record.failures = 0;
        record.circuit_open = false;
        record.circuit_open_until = 0;
        record.healthy = true;
        record.last_checked = epoch_ms();
    }

    /// May this gateway be chosen for routing? An expired open circuit
    /// re-closes here, demoted to unhealthy until a success lands.
    pub fn is_selectable(&self, gateway: &Url) -> bool {
        let key = gateway_key(gateway);
        let Some(mut record) = self.records.get_mut(&key) else {
            // Unknown gateways are innocent until proven otherwise.
            return true;
        };
        if !record.circuit_open {
            return true;
        }
        let now = epoch_ms();
        if now >= record.circuit_open_until {
            // Probation: failures are kept, so one more failure re-opens
            // the circuit immediately.
            record.circuit_open = false;
            record.circuit_open_until = 0;
            record.healthy = false;
            return true;
        }
        false
    }

    pub fn snapshot(&self) -> Vec<(String, HealthRecord)> {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Evict the record with the oldest `last_checked` once the capacity
    /// bound is reached and `key` is a new entrant.
    fn ensure_capacity(&self, key: &str) {
        if self.records.contains_key(key) || self.records.len() < self.settings.max_entries {
            return;
        }
        let oldest = self
            .records
            .iter()
            .min_by_key(|entry| entry.value().last_checked)
            .map(|entry| entry.key().clone());
        if let Some(oldest) = oldest {
            self.records.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(threshold: u32, reset_ms: u64) -> HealthTracker {
        HealthTracker::new(HealthSettings {
            failure_threshold: threshold,
            circuit_reset_ms: reset_ms,
            max_entries: 16,
        })
    }

    fn gw(host: &str) -> Url {
        Url::parse(&format!("https://{host}")).unwrap()
    }

    #[test]
    fn failures_below_threshold_stay_selectable() {
        let tracker = tracker(3, 60_000);
        let g = gw("g.example");
        tracker.record_failure(&g);
        tracker.record_failure(&g);
        assert!(tracker.is_selectable(&g));
    }

    #[test]
    fn circuit_opens_at_threshold_and_blocks_selection() {
        let tracker = tracker(3, 60_000);
        let g = gw("g.example");
        for _ in 0..3 {
            tracker.record_failure(&g);
        }
        assert!(!tracker.is_selectable(&g));
    }

    #[test]
    fn expired_circuit_recloses_to_unhealthy_not_healthy() {
        let tracker = tracker(2, 0);
        let g = gw("g.example");
        tracker.record_failure(&g);
        tracker.record_failure(&g);

        // Reset window of zero: the circuit is immediately expired.
        assert!(tracker.is_selectable(&g));
        let snapshot = tracker.snapshot();
        let record = &snapshot.iter().find(|(k, _)| k.contains("g.example")).unwrap().1;
        assert!(!record.circuit_open);
        assert!(!record.healthy, "re-close must demote, not restore");

        // A success is what restores health.
        tracker.mark_healthy(&g);
        let snapshot = tracker.snapshot();
        let record = &snapshot.iter().find(|(k, _)| k.contains("g.example")).unwrap().1;
        assert!(record.healthy);
        assert_eq!(record.failures, 0);
    }

    #[test]
    fn mark_healthy_clears_failures_and_circuit() {
        let tracker = tracker(2, 60_000);
        let g = gw("g.example");
        tracker.record_failure(&g);
        tracker.record_failure(&g);
        assert!(!tracker.is_selectable(&g));

        tracker.mark_healthy(&g);
        assert!(tracker.is_selectable(&g));
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot[0].1.failures, 0);
    }

    #[test]
    fn unknown_gateways_are_selectable() {
        let tracker = tracker(2, 60_000);
        assert!(tracker.is_selectable(&gw("never-seen.example")));
    }

    #[test]
    fn capacity_bound_evicts_oldest_record() {
        let tracker = HealthTracker::new(HealthSettings {
            failure_threshold: 10,
            circuit_reset_ms: 60_000,
            max_entries: 2,
        });
        tracker.record_failure(&gw("a.example"));
        std::thread::sleep(std::time::Duration::from_millis(2));
        tracker.record_failure(&gw("b.example"));
        std::thread::sleep(std::time::Duration::from_millis(2));
        tracker.record_failure(&gw("c.example"));

        assert_eq!(tracker.len(), 2);
        let keys: Vec<String> = tracker.snapshot().into_iter().map(|(k, _)| k).collect();
        assert!(!keys.iter().any(|k| k.contains("a.example")), "oldest must go");
    }

    #[test]
    fn trailing_slash_and_bare_origin_share_a_record() {
        let tracker = tracker(2, 60_000);
        tracker.record_failure(&Url::parse("https://g.example/").unwrap());
        tracker.record_failure(&Url::parse("https://g.example").unwrap());
        assert!(!tracker.is_selectable(&gw("g.example")));
        assert_eq!(tracker.len(), 1);
    }
}
