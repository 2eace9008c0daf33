//! Per-epoch scheduling metrics.
//!
//! Counters accumulate during an epoch and roll into an
//! [`EpochSummary`] at the boundary, which the service retains and the
//! device loop logs. Consumption (plotting, dashboards) is external.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::quota::EpochBudget;
use crate::types::{DeviceId, ModelId, WorkClass};

/// One model's numbers for one finished epoch.
#[derive(Debug, Clone, Serialize)]
pub struct ModelEpochMetrics {
    pub model: ModelId,
    pub class: WorkClass,
    pub op_groups_dispatched: u64,
    pub steps_completed: u64,
    pub tokens_generated: u64,
    /// Device time consumed by this model.
    #[serde(serialize_with = "as_micros")]
    pub busy: Duration,
    /// Budget the quota allocator granted.
    #[serde(serialize_with = "as_micros")]
    pub allocated: Duration,
    /// busy / allocated.
    pub quota_utilization: f64,
    pub boosted: bool,
    pub requests_finished: u64,
    /// EWMA of end-to-end request latency, carried across epochs.
    pub avg_request_latency_ms: f64,
    pub migrations_out: u64,
    pub migrations_in: u64,
    pub migration_failures: u64,
}

fn as_micros<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_micros() as u64)
}

/// All models on one device for one finished epoch.
#[derive(Debug, Clone, Serialize)]
pub struct EpochSummary {
    pub device: DeviceId,
    pub epoch: u64,
    /// EWMA of how long ready foreground work waited for dispatch.
    pub foreground_wait_us: f64,
    pub models: Vec<ModelEpochMetrics>,
}

#[derive(Debug, Default, Clone)]
struct ModelCounters {
    op_groups: u64,
    steps: u64,
    tokens: u64,
    requests_finished: u64,
    busy: Duration,
    migrations_out: u64,
    migrations_in: u64,
    migration_failures: u64,
}

/// In-epoch accumulator owned by one device loop.
pub struct MetricsLedger {
    device: DeviceId,
    counters: HashMap<ModelId, ModelCounters>,
    classes: HashMap<ModelId, WorkClass>,
    /// Cross-epoch latency EWMA per model.
    latency_ms: HashMap<ModelId, f64>,
    foreground_wait_us: f64,
}

impl MetricsLedger {
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            counters: HashMap::new(),
            classes: HashMap::new(),
            latency_ms: HashMap::new(),
            foreground_wait_us: 0.0,
        }
    }

    pub fn register(&mut self, model: &ModelId, class: WorkClass) {
        self.classes.insert(model.clone(), class);
        self.counters.entry(model.clone()).or_default();
    }

    pub fn on_dispatch(&mut self, model: &ModelId, busy: Duration) {
        let counters = self.counters.entry(model.clone()).or_default();
        counters.op_groups += 1;
        counters.busy += busy;
    }

    pub fn on_step_completed(&mut self, model: &ModelId, tokens: usize) {
        let counters = self.counters.entry(model.clone()).or_default();
        counters.steps += 1;
        counters.tokens += tokens as u64;
    }

    pub fn on_request_finished(&mut self, model: &ModelId, latency: Duration) {
        self.counters
            .entry(model.clone())
            .or_default()
            .requests_finished += 1;
        let ewma = self.latency_ms.entry(model.clone()).or_insert(0.0);
        update_ewma(ewma, latency.as_secs_f64() * 1000.0, 0.2);
    }

    pub fn on_migration_out(&mut self, model: &ModelId) {
        self.counters.entry(model.clone()).or_default().migrations_out += 1;
    }

    pub fn on_migration_in(&mut self, model: &ModelId) {
        self.counters.entry(model.clone()).or_default().migrations_in += 1;
    }

    pub fn on_migration_failure(&mut self, model: &ModelId) {
        self.counters
            .entry(model.clone())
            .or_default()
            .migration_failures += 1;
    }

    /// Record how long a ready foreground unit sat before dispatch.
    pub fn on_foreground_wait(&mut self, wait: Duration) {
        update_ewma(&mut self.foreground_wait_us, wait.as_micros() as f64, 0.2);
    }

    /// Fold the epoch's counters into a summary and reset for the next
    /// epoch. `budgets` comes from the quota allocator's end-of-epoch
    /// snapshot.
    pub fn roll(&mut self, epoch: u64, budgets: &HashMap<ModelId, EpochBudget>) -> EpochSummary {
        let mut models: Vec<ModelEpochMetrics> = self
            .counters
            .iter()
            .map(|(model, counters)| {
                let budget = budgets.get(model);
                let allocated = budget.map(|b| b.allocated).unwrap_or_default();
                let quota_utilization = if allocated.is_zero() {
                    0.0
                } else {
                    counters.busy.as_secs_f64() / allocated.as_secs_f64()
                };
                ModelEpochMetrics {
                    model: model.clone(),
                    class: self.classes.get(model).copied().unwrap_or_default(),
                    op_groups_dispatched: counters.op_groups,
                    steps_completed: counters.steps,
                    tokens_generated: counters.tokens,
                    busy: counters.busy,
                    allocated,
                    quota_utilization,
                    boosted: budget.map(|b| b.boosted).unwrap_or(false),
                    requests_finished: counters.requests_finished,
                    avg_request_latency_ms: self.latency_ms.get(model).copied().unwrap_or(0.0),
                    migrations_out: counters.migrations_out,
                    migrations_in: counters.migrations_in,
                    migration_failures: counters.migration_failures,
                }
            })
            .collect();
        models.sort_by(|a, b| a.model.cmp(&b.model));

        for counters in self.counters.values_mut() {
            *counters = ModelCounters::default();
        }

        EpochSummary {
            device: self.device,
            epoch,
            foreground_wait_us: self.foreground_wait_us,
            models,
        }
    }

    /// Total busy time this epoch across all models.
    pub fn busy_total(&self) -> Duration {
        self.counters.values().map(|c| c.busy).sum()
    }

    pub fn busy_for(&self, model: &ModelId) -> Duration {
        self.counters
            .get(model)
            .map(|c| c.busy)
            .unwrap_or_default()
    }
}

fn update_ewma(current: &mut f64, sample: f64, alpha: f64) {
    if sample < 0.0 {
        return;
    }
    if *current <= 0.0 {
        *current = sample;
    } else {
        *current = (*current * (1.0 - alpha)) + (sample * alpha);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roll_resets_counters() {
        let mut ledger = MetricsLedger::new(0);
        let model: ModelId = "m".into();
        ledger.register(&model, WorkClass::Foreground);
        ledger.on_dispatch(&model, Duration::from_millis(5));
        ledger.on_step_completed(&model, 3);

        let budgets = HashMap::new();
        let first = ledger.roll(0, &budgets);
        assert_eq!(first.models[0].op_groups_dispatched, 1);
        assert_eq!(first.models[0].tokens_generated, 3);

        let second = ledger.roll(1, &budgets);
        assert_eq!(second.models[0].op_groups_dispatched, 0);
        assert_eq!(second.models[0].tokens_generated, 0);
    }

    #[test]
    fn utilization_reflects_busy_over_allocated() {
        let mut ledger = MetricsLedger::new(0);
        let model: ModelId = "m".into();
        ledger.register(&model, WorkClass::Background);
        ledger.on_dispatch(&model, Duration::from_millis(30));

        let mut budgets = HashMap::new();
        budgets.insert(
            model.clone(),
            EpochBudget {
                allocated: Duration::from_millis(60),
                consumed: Duration::from_millis(30),
                boosted: false,
            },
        );
        let summary = ledger.roll(0, &budgets);
        assert!((summary.models[0].quota_utilization - 0.5).abs() < 1e-9);
    }
}
