//! The weaving scheduler: per-device candidate ranking and budget
//! enforcement.
//!
//! One [`WeavingScheduler`] backs each device loop. Every dispatch
//! cycle it reassembles instance batches, ranks the runnable
//! candidates, and hands out exactly one op-group. Ranking is strict:
//! foreground instances with unmet budget come first (earliest deadline
//! wins), then overload-boosted background, then background by largest
//! remaining budget. Instances with exhausted budgets are not
//! candidates until the next epoch, which is what bounds any model's
//! overshoot to a single op-group.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::config::{EpochConfig, MigrationConfig, ModelSpec};
use crate::error::Result;
use crate::executor::StepOutcome;
use crate::metrics::{EpochSummary, MetricsLedger};
use crate::model::ModelInstance;
use crate::opsplit::{BackendCaps, OpGroup, OpSplitter};
use crate::output::{ResponseEvent, ResponseSender};
use crate::quota::{QuotaAllocator, ScheduleEpoch};
use crate::request::SequenceState;
use crate::types::{DeviceId, ModelId, RequestId};

/// One schedulable work item, consumed exactly once per dispatch.
#[derive(Debug, Clone)]
pub struct StepUnit {
    pub model: ModelId,
    pub group: OpGroup,
}

/// A cross-device handoff the scheduler proposes at a step boundary.
#[derive(Debug, Clone)]
pub struct MigrationProposal {
    pub model: ModelId,
    pub request: RequestId,
    pub target: DeviceId,
}

pub struct WeavingScheduler {
    device: DeviceId,
    instances: HashMap<ModelId, ModelInstance>,
    quota: QuotaAllocator,
    epoch: ScheduleEpoch,
    metrics: MetricsLedger,
    /// When each currently-ready foreground instance became ready,
    /// for the dispatch-wait metric.
    fg_ready_since: HashMap<ModelId, Instant>,
}

impl WeavingScheduler {
    pub fn new(device: DeviceId, epoch_config: &EpochConfig) -> Self {
        let quota = QuotaAllocator::new(epoch_config);
        let epoch = ScheduleEpoch::first(quota.epoch_duration());
        Self {
            device,
            instances: HashMap::new(),
            quota,
            epoch,
            metrics: MetricsLedger::new(device),
            fg_ready_since: HashMap::new(),
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn epoch(&self) -> &ScheduleEpoch {
        &self.epoch
    }

    /// Register a model instance placed on this device. The backend's
    /// capability descriptor is queried once, here; a backend that
    /// cannot split runs whole steps from then on.
    pub fn add_instance(&mut self, spec: ModelSpec, caps: BackendCaps) {
        let splitter = OpSplitter::new(caps, spec.steps_per_dispatch);
        self.quota.register(&spec);
        self.metrics.register(&spec.id, spec.class);
        debug!(
            device = self.device,
            model = %spec.id,
            class = ?spec.class,
            quota = spec.quota_percent,
            op_split = caps.supports_op_split,
            "registered instance"
        );
        self.instances
            .insert(spec.id.clone(), ModelInstance::new(spec, splitter));
    }

    pub fn instance(&self, model: &str) -> Option<&ModelInstance> {
        self.instances.get(model)
    }

    pub fn instance_mut(&mut self, model: &str) -> Option<&mut ModelInstance> {
        self.instances.get_mut(model)
    }

    pub fn has_pending_work(&self) -> bool {
        self.instances.values().any(ModelInstance::has_work)
    }

    /// Roll the epoch if its window elapsed: fold metrics into a
    /// summary, then refresh budgets from current backlogs. This is the
    /// only place budgets are re-allocated, and only the owning device
    /// loop calls it.
    pub fn maybe_roll_epoch(&mut self) -> Option<EpochSummary> {
        if !self.epoch.expired(Instant::now()) {
            return None;
        }
        let budgets = self.quota.snapshot();
        let summary = self.metrics.roll(self.epoch.index, &budgets);

        let backlogs: HashMap<ModelId, usize> = self
            .instances
            .iter()
            .map(|(id, inst)| (id.clone(), inst.backlog()))
            .collect();

        self.epoch.roll();
        self.quota.refresh(&self.epoch, &backlogs);
        Some(summary)
    }

    /// Time until the current epoch's budgets reset; the idle sleep
    /// bound for the device loop.
    pub fn until_epoch_end(&self) -> Duration {
        self.epoch.remaining(Instant::now())
    }

    /// Pick the next (model, op-group) to dispatch, or None when no
    /// instance is both ready and within budget.
    pub fn next_unit(&mut self) -> Option<StepUnit> {
        let mut finished: Vec<(ModelId, Duration)> = Vec::new();
        for instance in self.instances.values_mut() {
            let latencies = instance.reassemble();
            let id = instance.id().clone();
            finished.extend(latencies.into_iter().map(|l| (id.clone(), l)));
        }
        for (model, latency) in finished {
            self.metrics.on_request_finished(&model, latency);
        }

        let now = Instant::now();
        self.track_foreground_readiness(now);

        let mut best: Option<(RankKey, &ModelInstance)> = None;
        for instance in self.instances.values() {
            if !instance.ready() {
                continue;
            }
            let Some(budget) = self.quota.budget(instance.id()) else {
                continue;
            };
            if budget.exhausted() {
                continue;
            }
            let key = RankKey {
                band: if instance.spec.class.is_foreground() {
                    Band::Foreground
                } else if budget.boosted {
                    Band::BoostedBackground
                } else {
                    Band::Background
                },
                boosted: budget.boosted,
                deadline: instance.earliest_deadline(),
                budget_score: budget.remaining().as_secs_f64()
                    * if budget.boosted {
                        self.quota.boost_factor()
                    } else {
                        1.0
                    },
            };
            match &best {
                Some((current, _)) if !key.beats(current) => {}
                _ => best = Some((key, instance)),
            }
        }

        let (_, instance) = best?;
        let model = instance.id().clone();
        let group = instance.current_group()?.clone();

        if let Some(since) = self.fg_ready_since.remove(&model) {
            self.metrics.on_foreground_wait(now.duration_since(since));
        }
        trace!(
            device = self.device,
            model = %model,
            group = group.index,
            of = group.of,
            "selected unit"
        );
        Some(StepUnit { model, group })
    }

    fn track_foreground_readiness(&mut self, now: Instant) {
        for instance in self.instances.values() {
            let id = instance.id();
            let runnable = instance.ready()
                && instance.spec.class.is_foreground()
                && self
                    .quota
                    .budget(id)
                    .map(|b| !b.exhausted())
                    .unwrap_or(false);
            if runnable {
                self.fg_ready_since.entry(id.clone()).or_insert(now);
            } else {
                self.fg_ready_since.remove(id);
            }
        }
    }

    /// Account a completed op-group: charge the budget, advance the
    /// plan, and finalize the step when its group sequence is
    /// exhausted. Returns true on finalization.
    pub fn on_success(&mut self, unit: &StepUnit, outcome: &StepOutcome) -> bool {
        self.quota.charge(&unit.model, outcome.duration);
        self.metrics.on_dispatch(&unit.model, outcome.duration);

        let Some(instance) = self.instances.get_mut(&unit.model) else {
            return false;
        };
        let exhausted = instance.advance_group();
        if exhausted {
            instance.finalize_step(&outcome.tokens);
            self.metrics
                .on_step_completed(&unit.model, outcome.tokens.len());
        }
        exhausted
    }

    /// A step failed: the owning batch fails with an explicit error,
    /// and the device keeps weaving the other models.
    pub fn fail_unit(&mut self, unit: &StepUnit, reason: &str) {
        if let Some(instance) = self.instances.get_mut(&unit.model) {
            instance.fail_batch(reason);
        }
    }

    /// Drain path: fail everything on this device.
    pub fn fail_all(&mut self, reason: &str) {
        for instance in self.instances.values_mut() {
            instance.fail_all(reason);
        }
    }

    /// Propose a handoff when this device is running hot and a batched
    /// sequence has a placement peer to move to. Conservative: only at
    /// step boundaries, never mid-plan.
    pub fn migration_proposal(&self, config: &MigrationConfig) -> Option<MigrationProposal> {
        if !config.enabled {
            return None;
        }
        let busy = self.metrics.busy_total().as_secs_f64();
        let window = self.quota.epoch_duration().as_secs_f64();
        if busy < window * config.busy_threshold {
            return None;
        }

        for instance in self.instances.values() {
            let Some(request) = instance.migration_candidate() else {
                continue;
            };
            let Some(target) = instance
                .spec
                .placement
                .iter()
                .copied()
                .find(|d| *d != self.device)
            else {
                continue;
            };
            return Some(MigrationProposal {
                model: instance.id().clone(),
                request,
                target,
            });
        }
        None
    }

    pub fn enqueue(
        &mut self,
        model: &str,
        seq: SequenceState,
        tx: ResponseSender,
    ) -> Result<()> {
        let instance = self
            .instances
            .get_mut(model)
            .ok_or_else(|| crate::error::Error::UnknownModel(model.to_string()))?;
        instance.enqueue(seq, tx)
    }

    pub fn emit(&self, model: &str, request: &str, event: ResponseEvent) {
        if let Some(instance) = self.instances.get(model) {
            instance.emit(request, event);
        }
    }

    pub fn metrics_mut(&mut self) -> &mut MetricsLedger {
        &mut self.metrics
    }

    pub fn quota(&self) -> &QuotaAllocator {
        &self.quota
    }
}

/// Ranking key; lower band wins, then the in-band rule.
#[derive(Debug, Clone, PartialEq)]
struct RankKey {
    band: Band,
    boosted: bool,
    deadline: Option<Instant>,
    budget_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Band {
    Foreground,
    BoostedBackground,
    Background,
}

impl RankKey {
    fn beats(&self, other: &Self) -> bool {
        if self.band != other.band {
            return self.band < other.band;
        }
        match self.band {
            // Foreground: boosted first, then earliest deadline.
            Band::Foreground => {
                if self.boosted != other.boosted {
                    return self.boosted;
                }
                match (self.deadline, other.deadline) {
                    (Some(a), Some(b)) => a < b,
                    (Some(_), None) => true,
                    _ => false,
                }
            }
            // Background bands: largest remaining (boost-weighted)
            // budget first.
            _ => self.budget_score > other.budget_score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output;
    use crate::request::SamplingParams;
    use crate::types::{Precision, StepStatus, WorkClass};

    fn spec(id: &str, quota: u32, class: WorkClass, overload_threshold: usize) -> ModelSpec {
        ModelSpec {
            id: id.to_string(),
            checkpoint: format!("ckpt/{id}"),
            parallelism: 1,
            placement: vec![0, 1],
            quota_percent: quota,
            class,
            precision: Precision::default(),
            steps_per_dispatch: 4,
            overload_threshold,
            max_pending: 64,
            sla_ms: 250,
            max_batch_size: 4,
            num_layers: 8,
        }
    }

    fn scheduler_with(models: Vec<ModelSpec>) -> WeavingScheduler {
        let mut scheduler = WeavingScheduler::new(
            0,
            &EpochConfig {
                duration_ms: 100,
                boost_factor: 1.5,
            },
        );
        for spec in models {
            scheduler.add_instance(spec, BackendCaps::default());
        }
        // Budgets are zero until the first refresh.
        scheduler.force_refresh(&HashMap::new());
        scheduler
    }

    impl WeavingScheduler {
        fn force_refresh(&mut self, backlogs: &HashMap<ModelId, usize>) {
            self.quota.refresh(&self.epoch, backlogs);
        }
    }

    fn submit(scheduler: &mut WeavingScheduler, model: &str, id: &str) {
        let (tx, _stream) = output::channel();
        let seq = SequenceState::new(
            id.to_string(),
            vec![1, 2, 3],
            SamplingParams {
                max_tokens: 8,
                ..Default::default()
            },
            Duration::from_millis(250),
        );
        scheduler.enqueue(model, seq, tx).unwrap();
    }

    fn outcome_ms(ms: u64) -> StepOutcome {
        StepOutcome {
            tokens: Vec::new(),
            duration: Duration::from_millis(ms),
            status: StepStatus::Ok,
        }
    }

    #[test]
    fn foreground_outranks_background() {
        let mut scheduler = scheduler_with(vec![
            spec("bg", 70, WorkClass::Background, 4),
            spec("fg", 30, WorkClass::Foreground, 4),
        ]);
        submit(&mut scheduler, "bg", "b1");
        submit(&mut scheduler, "fg", "f1");

        let unit = scheduler.next_unit().expect("work is ready");
        assert_eq!(unit.model, "fg", "foreground takes strict priority");
    }

    #[test]
    fn exhausted_budget_excludes_candidate_until_refresh() {
        let mut scheduler = scheduler_with(vec![spec("m", 10, WorkClass::Foreground, 4)]);
        submit(&mut scheduler, "m", "r1");

        let unit = scheduler.next_unit().unwrap();
        // 10% of a 100ms epoch is 10ms; a 20ms group exhausts it.
        scheduler.on_success(&unit, &outcome_ms(20));

        assert!(
            scheduler.next_unit().is_none(),
            "exhausted model must wait for the next epoch"
        );
        assert!(scheduler.has_pending_work());

        scheduler.force_refresh(&HashMap::new());
        assert!(scheduler.next_unit().is_some(), "budget reset re-admits it");
    }

    #[test]
    fn overshoot_is_bounded_by_one_op_group() {
        let mut scheduler = scheduler_with(vec![spec("m", 50, WorkClass::Background, 4)]);
        submit(&mut scheduler, "m", "r1");

        let group_ms = 8;
        let mut consumed = Duration::ZERO;
        while let Some(unit) = scheduler.next_unit() {
            scheduler.on_success(&unit, &outcome_ms(group_ms));
            consumed += Duration::from_millis(group_ms);
        }

        let allocated = Duration::from_millis(50);
        assert!(
            consumed <= allocated + Duration::from_millis(group_ms),
            "consumed {consumed:?} exceeds quota {allocated:?} by more than one group"
        );
    }

    #[test]
    fn boosted_background_outranks_calm_background() {
        let mut scheduler = scheduler_with(vec![
            spec("busy", 30, WorkClass::Background, 2),
            spec("calm", 40, WorkClass::Background, 2),
        ]);
        // Backlog of 3 pending batches against threshold 2.
        for id in ["q1", "q2", "q3"] {
            submit(&mut scheduler, "busy", id);
        }
        submit(&mut scheduler, "calm", "c1");

        let backlogs: HashMap<ModelId, usize> =
            [("busy".to_string(), 3), ("calm".to_string(), 1)]
                .into_iter()
                .collect();
        scheduler.force_refresh(&backlogs);

        let unit = scheduler.next_unit().unwrap();
        assert_eq!(
            unit.model, "busy",
            "overloaded model must be boosted above the calm one despite its smaller quota"
        );
    }

    #[test]
    fn step_finalizes_after_all_groups() {
        let mut scheduler = scheduler_with(vec![spec("m", 100, WorkClass::Foreground, 4)]);
        submit(&mut scheduler, "m", "r1");

        let mut finalized = false;
        let mut dispatched = 0;
        while !finalized {
            let unit = scheduler.next_unit().unwrap();
            dispatched += 1;
            let outcome = if unit.group.is_last() {
                StepOutcome {
                    tokens: vec![("r1".to_string(), 42)],
                    duration: Duration::from_millis(1),
                    status: StepStatus::Ok,
                }
            } else {
                outcome_ms(1)
            };
            finalized = scheduler.on_success(&unit, &outcome);
        }
        assert_eq!(dispatched, 4, "steps_per_dispatch=4 means four groups");

        let seq = scheduler
            .instance("m")
            .unwrap()
            .batch()
            .iter()
            .next()
            .unwrap();
        assert_eq!(seq.generated, vec![42]);
    }

    #[test]
    fn failed_unit_isolates_to_its_batch() {
        let mut scheduler = scheduler_with(vec![
            spec("victim", 50, WorkClass::Foreground, 4),
            spec("bystander", 50, WorkClass::Background, 4),
        ]);
        submit(&mut scheduler, "victim", "v1");
        submit(&mut scheduler, "bystander", "b1");

        let unit = scheduler.next_unit().unwrap();
        assert_eq!(unit.model, "victim");
        scheduler.fail_unit(&unit, "kernel fault");

        let next = scheduler.next_unit().expect("other models keep running");
        assert_eq!(next.model, "bystander");
    }

    /// Dispatch with fixed synthetic group costs until budgets run dry,
    /// refreshing over `epochs` virtual epochs. Returns completed step
    /// counts per model.
    fn run_epochs(
        scheduler: &mut WeavingScheduler,
        epochs: usize,
        group_ms: u64,
    ) -> HashMap<ModelId, u64> {
        let mut steps: HashMap<ModelId, u64> = HashMap::new();
        for _ in 0..epochs {
            scheduler.force_refresh(&HashMap::new());
            while let Some(unit) = scheduler.next_unit() {
                let finalized = scheduler.on_success(&unit, &outcome_ms(group_ms));
                if finalized {
                    *steps.entry(unit.model).or_default() += 1;
                }
            }
        }
        steps
    }

    #[test]
    fn foreground_rate_holds_under_background_contention() {
        // 70/30 split; sequences never finish within the run, so both
        // models stay saturated.
        let submit_heavy = |scheduler: &mut WeavingScheduler, model: &str| {
            let (tx, _stream) = output::channel();
            let seq = SequenceState::new(
                format!("{model}-work"),
                vec![1, 2, 3],
                SamplingParams {
                    max_tokens: 1_000_000,
                    ..Default::default()
                },
                Duration::from_millis(250),
            );
            scheduler.enqueue(model, seq, tx).unwrap();
        };

        let mut solo = scheduler_with(vec![spec("fg", 70, WorkClass::Foreground, 4)]);
        submit_heavy(&mut solo, "fg");
        let solo_steps = run_epochs(&mut solo, 20, 2)["fg"];

        let mut contended = scheduler_with(vec![
            spec("fg", 70, WorkClass::Foreground, 4),
            spec("bg", 30, WorkClass::Background, 4),
        ]);
        submit_heavy(&mut contended, "fg");
        submit_heavy(&mut contended, "bg");
        let contended_steps = run_epochs(&mut contended, 20, 2);

        assert!(
            contended_steps["bg"] > 0,
            "background must still make progress"
        );
        let ratio = contended_steps["fg"] as f64 / solo_steps as f64;
        assert!(
            ratio >= 0.65,
            "foreground completion rate {ratio:.2} fell below 0.65x of the no-contention rate \
             ({} vs {solo_steps} steps)",
            contended_steps["fg"]
        );
    }

    #[test]
    fn ready_foreground_always_preempts_at_group_boundary() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        // Property: whenever a foreground instance is ready with
        // budget, the very next dispatched unit is foreground.
        let mut rng = StdRng::seed_from_u64(0xF0F0);
        for round in 0..50 {
            let mut scheduler = scheduler_with(vec![
                spec("fg", 40, WorkClass::Foreground, 4),
                spec("bg-a", 30, WorkClass::Background, 4),
                spec("bg-b", 30, WorkClass::Background, 4),
            ]);
            for i in 0..rng.gen_range(1..4) {
                submit(&mut scheduler, "bg-a", &format!("a{round}-{i}"));
            }
            for i in 0..rng.gen_range(1..4) {
                submit(&mut scheduler, "bg-b", &format!("b{round}-{i}"));
            }
            // Let background run a few groups first.
            for _ in 0..rng.gen_range(0..6) {
                if let Some(unit) = scheduler.next_unit() {
                    scheduler.on_success(&unit, &outcome_ms(1));
                }
            }

            submit(&mut scheduler, "fg", &format!("f{round}"));
            let unit = scheduler
                .next_unit()
                .expect("foreground work must be runnable");
            assert_eq!(
                unit.model, "fg",
                "round {round}: a ready foreground group waits at most the in-flight group"
            );
        }
    }
}
