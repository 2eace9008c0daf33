//! Epoch-based compute quota accounting.
//!
//! Each device loop owns one [`QuotaAllocator`] covering the instances
//! placed on it. Budgets are refreshed only at epoch boundaries by that
//! loop (the single designated updater per device); the scheduler reads
//! and charges budgets but never re-allocates mid-epoch, so there is no
//! race between refresh and dispatch.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::{EpochConfig, ModelSpec};
use crate::types::{ModelId, WorkClass};

/// Fixed scheduling window over which quotas are tracked and reset.
#[derive(Debug, Clone)]
pub struct ScheduleEpoch {
    pub index: u64,
    pub started: Instant,
    pub duration: Duration,
}

impl ScheduleEpoch {
    pub fn first(duration: Duration) -> Self {
        Self {
            index: 0,
            started: Instant::now(),
            duration,
        }
    }

    pub fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.started) >= self.duration
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.duration
            .saturating_sub(now.duration_since(self.started))
    }

    pub fn roll(&mut self) {
        self.index += 1;
        self.started = Instant::now();
    }
}

/// One model's budget for the current epoch.
#[derive(Debug, Clone)]
pub struct EpochBudget {
    pub allocated: Duration,
    pub consumed: Duration,
    /// Set when the previous epoch ended with this model overloaded;
    /// lifts its ranking for the current epoch.
    pub boosted: bool,
}

impl EpochBudget {
    fn new(allocated: Duration) -> Self {
        Self {
            allocated,
            consumed: Duration::ZERO,
            boosted: false,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.allocated.saturating_sub(self.consumed)
    }

    pub fn exhausted(&self) -> bool {
        self.consumed >= self.allocated
    }

    pub fn utilization(&self) -> f64 {
        if self.allocated.is_zero() {
            return 0.0;
        }
        self.consumed.as_secs_f64() / self.allocated.as_secs_f64()
    }
}

struct QuotaEntry {
    percent: u32,
    class: WorkClass,
    overload_threshold: usize,
    budget: EpochBudget,
}

/// Converts configured quota percentages into per-epoch compute-time
/// budgets and applies overload feedback.
pub struct QuotaAllocator {
    epoch_duration: Duration,
    boost_factor: f64,
    entries: HashMap<ModelId, QuotaEntry>,
}

impl QuotaAllocator {
    pub fn new(epoch: &EpochConfig) -> Self {
        Self {
            epoch_duration: Duration::from_millis(epoch.duration_ms),
            boost_factor: epoch.boost_factor,
            entries: HashMap::new(),
        }
    }

    pub fn register(&mut self, spec: &ModelSpec) {
        let allocated = self.share(spec.quota_percent);
        self.entries.insert(
            spec.id.clone(),
            QuotaEntry {
                percent: spec.quota_percent,
                class: spec.class,
                overload_threshold: spec.overload_threshold,
                budget: EpochBudget::new(allocated),
            },
        );
    }

    pub fn deregister(&mut self, model: &str) {
        self.entries.remove(model);
    }

    fn share(&self, percent: u32) -> Duration {
        self.epoch_duration.mul_f64(f64::from(percent.min(100)) / 100.0)
    }

    /// Recompute budgets for a new epoch. Never blocks.
    ///
    /// Foreground budgets are floored at their configured percentage
    /// regardless of background demand. If the combined percentages
    /// oversubscribe the device, background shares shrink to fit the
    /// capacity left after foreground floors. A model whose backlog
    /// exceeded its overload threshold enters the new epoch boosted.
    pub fn refresh(&mut self, epoch: &ScheduleEpoch, backlogs: &HashMap<ModelId, usize>) {
        let foreground_percent: u32 = self
            .entries
            .values()
            .filter(|e| e.class.is_foreground())
            .map(|e| e.percent)
            .sum();
        let background_percent: u32 = self
            .entries
            .values()
            .filter(|e| !e.class.is_foreground())
            .map(|e| e.percent)
            .sum();

        // Validation already caps foreground at 100; background absorbs
        // whatever headroom is left when the combined total overshoots.
        let background_scale = if foreground_percent + background_percent > 100 {
            f64::from(100 - foreground_percent.min(100)) / f64::from(background_percent.max(1))
        } else {
            1.0
        };

        for (model, entry) in &mut self.entries {
            let effective = if entry.class.is_foreground() {
                f64::from(entry.percent)
            } else {
                f64::from(entry.percent) * background_scale
            };
            let allocated = self.epoch_duration.mul_f64(effective / 100.0);

            let backlog = backlogs.get(model).copied().unwrap_or(0);
            let boosted = backlog > entry.overload_threshold;
            if boosted {
                debug!(
                    model = %model,
                    backlog,
                    threshold = entry.overload_threshold,
                    epoch = epoch.index,
                    "overloaded model boosted for next epoch"
                );
            }

            entry.budget = EpochBudget::new(allocated);
            entry.budget.boosted = boosted;
        }
    }

    /// Deduct consumed compute time after an op-group completes.
    pub fn charge(&mut self, model: &str, consumed: Duration) {
        if let Some(entry) = self.entries.get_mut(model) {
            entry.budget.consumed += consumed;
        }
    }

    pub fn budget(&self, model: &str) -> Option<&EpochBudget> {
        self.entries.get(model).map(|e| &e.budget)
    }

    pub fn remaining(&self, model: &str) -> Duration {
        self.budget(model).map(EpochBudget::remaining).unwrap_or_default()
    }

    pub fn is_boosted(&self, model: &str) -> bool {
        self.budget(model).map(|b| b.boosted).unwrap_or(false)
    }

    /// Ranking weight of a boosted model relative to its class peers.
    pub fn boost_factor(&self) -> f64 {
        self.boost_factor
    }

    pub fn epoch_duration(&self) -> Duration {
        self.epoch_duration
    }

    /// (allocated, consumed, boosted) per model, for metrics roll-up.
    pub fn snapshot(&self) -> HashMap<ModelId, EpochBudget> {
        self.entries
            .iter()
            .map(|(id, e)| (id.clone(), e.budget.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelSpec;
    use crate::types::Precision;

    fn spec(id: &str, quota: u32, class: WorkClass) -> ModelSpec {
        ModelSpec {
            id: id.to_string(),
            checkpoint: format!("ckpt/{id}"),
            parallelism: 1,
            placement: vec![0],
            quota_percent: quota,
            class,
            precision: Precision::default(),
            steps_per_dispatch: 8,
            overload_threshold: 2,
            max_pending: 64,
            sla_ms: 250,
            max_batch_size: 8,
            num_layers: 32,
        }
    }

    fn allocator() -> (QuotaAllocator, ScheduleEpoch) {
        let epoch_config = EpochConfig {
            duration_ms: 100,
            boost_factor: 1.5,
        };
        let allocator = QuotaAllocator::new(&epoch_config);
        let epoch = ScheduleEpoch::first(Duration::from_millis(100));
        (allocator, epoch)
    }

    #[test]
    fn budgets_proportional_to_percent() {
        let (mut allocator, epoch) = allocator();
        allocator.register(&spec("fg", 70, WorkClass::Foreground));
        allocator.register(&spec("bg", 30, WorkClass::Background));
        allocator.refresh(&epoch, &HashMap::new());

        assert_eq!(allocator.remaining("fg"), Duration::from_millis(70));
        assert_eq!(allocator.remaining("bg"), Duration::from_millis(30));
    }

    #[test]
    fn background_shrinks_under_oversubscription() {
        let (mut allocator, epoch) = allocator();
        allocator.register(&spec("fg", 70, WorkClass::Foreground));
        allocator.register(&spec("bg-a", 40, WorkClass::Background));
        allocator.register(&spec("bg-b", 40, WorkClass::Background));
        allocator.refresh(&epoch, &HashMap::new());

        // Foreground floor holds; background splits the remaining 30%.
        assert_eq!(allocator.remaining("fg"), Duration::from_millis(70));
        assert_eq!(allocator.remaining("bg-a"), Duration::from_millis(15));
        assert_eq!(allocator.remaining("bg-b"), Duration::from_millis(15));
    }

    #[test]
    fn backlog_over_threshold_boosts_next_epoch() {
        let (mut allocator, epoch) = allocator();
        allocator.register(&spec("busy", 30, WorkClass::Background));
        allocator.register(&spec("calm", 30, WorkClass::Background));

        let mut backlogs = HashMap::new();
        backlogs.insert("busy".to_string(), 3);
        backlogs.insert("calm".to_string(), 1);
        allocator.refresh(&epoch, &backlogs);

        assert!(allocator.is_boosted("busy"), "backlog 3 > threshold 2");
        assert!(!allocator.is_boosted("calm"));
    }

    #[test]
    fn charge_deducts_and_exhausts() {
        let (mut allocator, epoch) = allocator();
        allocator.register(&spec("m", 50, WorkClass::Foreground));
        allocator.refresh(&epoch, &HashMap::new());

        allocator.charge("m", Duration::from_millis(20));
        assert_eq!(allocator.remaining("m"), Duration::from_millis(30));

        allocator.charge("m", Duration::from_millis(40));
        assert!(allocator.budget("m").unwrap().exhausted());
        assert_eq!(allocator.remaining("m"), Duration::ZERO);
    }

    #[test]
    fn refresh_resets_consumption() {
        let (mut allocator, mut epoch) = allocator();
        allocator.register(&spec("m", 50, WorkClass::Foreground));
        allocator.refresh(&epoch, &HashMap::new());
        allocator.charge("m", Duration::from_millis(50));
        assert!(allocator.budget("m").unwrap().exhausted());

        epoch.roll();
        allocator.refresh(&epoch, &HashMap::new());
        assert_eq!(allocator.remaining("m"), Duration::from_millis(50));
    }
}
