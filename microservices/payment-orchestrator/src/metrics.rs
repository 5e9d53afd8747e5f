//! Orchestrator metrics

use tiba_telemetry::{Counter, Gauge, Histogram};

#[derive(Clone)]
pub struct PaymentMetrics {
    pub charges: Counter,
    pub charge_conflicts: Counter,
    pub charge_failures: Counter,
    pub callbacks: Counter,
    pub orphan_callbacks: Counter,
    pub malformed_callbacks: Counter,
    pub transitions: Counter,
    pub noop_updates: Counter,
    pub unresolved_statuses: Counter,
    pub ledger_recordings: Counter,
    pub ledger_recording_failures: Counter,
    pub ledger_queue_depth: Gauge,
    pub initiate_latency_ms: Histogram,
}

impl Default for PaymentMetrics {
    fn default() -> Self {
        Self {
            charges: Counter::new("payment_charges_total"),
            charge_conflicts: Counter::new("payment_charge_conflicts_total"),
            charge_failures: Counter::new("payment_charge_failures_total"),
            callbacks: Counter::new("payment_callbacks_total"),
            orphan_callbacks: Counter::new("payment_orphan_callbacks_total"),
            malformed_callbacks: Counter::new("payment_malformed_callbacks_total"),
            transitions: Counter::new("payment_transitions_total"),
            noop_updates: Counter::new("payment_noop_updates_total"),
            unresolved_statuses: Counter::new("payment_unresolved_statuses_total"),
            ledger_recordings: Counter::new("ledger_recordings_total"),
            ledger_recording_failures: Counter::new("ledger_recording_failures_total"),
            ledger_queue_depth: Gauge::new("ledger_recording_queue_depth"),
            initiate_latency_ms: Histogram::new("payment_initiate_latency_ms"),
        }
    }
}

impl PaymentMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flat name/value view for the metrics endpoint
    pub fn snapshot(&self) -> serde_json::Value {
        let counters = [
            &self.charges,
            &self.charge_conflicts,
            &self.charge_failures,
            &self.callbacks,
            &self.orphan_callbacks,
            &self.malformed_callbacks,
            &self.transitions,
            &self.noop_updates,
            &self.unresolved_statuses,
            &self.ledger_recordings,
            &self.ledger_recording_failures,
        ];
        let mut map = serde_json::Map::new();
        for counter in counters {
            map.insert(counter.name().to_string(), counter.get().into());
        }
        map.insert(
            self.ledger_queue_depth.name().to_string(),
            self.ledger_queue_depth.get().into(),
        );
        map.insert(
            format!("{}_p95", self.initiate_latency_ms.name()),
            self.initiate_latency_ms.percentile(95.0).into(),
        );
        serde_json::Value::Object(map)
    }
}
