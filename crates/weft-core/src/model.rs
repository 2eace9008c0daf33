//! Runtime state of one colocated model instance.
//!
//! An instance is owned by exactly one device loop at a time. It holds
//! the backlog of admitted sequences, the batch currently advancing,
//! the op-group plan for the in-flight step, and the response stream
//! senders for everything it owns.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::ModelSpec;
use crate::error::{Error, Result};
use crate::opsplit::{OpGroup, OpSplitter, StepPlan, StepShape};
use crate::output::{ResponseEvent, ResponseSender};
use crate::request::{RequestBatch, SequenceState};
use crate::types::{ModelId, RequestId};

pub struct ModelInstance {
    pub spec: ModelSpec,
    splitter: OpSplitter,
    pending: VecDeque<SequenceState>,
    batch: RequestBatch,
    plan: Option<StepPlan>,
    streams: HashMap<RequestId, ResponseSender>,
}

impl ModelInstance {
    pub fn new(spec: ModelSpec, splitter: OpSplitter) -> Self {
        let batch = RequestBatch::new(spec.id.clone(), spec.class);
        Self {
            spec,
            splitter,
            pending: VecDeque::new(),
            batch,
            plan: None,
            streams: HashMap::new(),
        }
    }

    pub fn id(&self) -> &ModelId {
        &self.spec.id
    }

    pub fn sla(&self) -> Duration {
        Duration::from_millis(self.spec.sla_ms)
    }

    /// Waiting sequences not yet pulled into a batch.
    pub fn backlog(&self) -> usize {
        self.pending.len()
    }

    /// Everything this instance currently owns.
    pub fn in_flight(&self) -> usize {
        self.pending.len() + self.batch.len()
    }

    /// Admit a sequence, enforcing the hard admission ceiling. Soft
    /// overload (backlog above `overload_threshold`) is not rejected
    /// here; it feeds the quota allocator's boost path instead.
    pub fn enqueue(&mut self, seq: SequenceState, tx: ResponseSender) -> Result<()> {
        if self.in_flight() >= self.spec.max_pending {
            return Err(Error::AdmissionOverload {
                model: self.spec.id.clone(),
                backlog: self.in_flight(),
                capacity: self.spec.max_pending,
            });
        }
        self.streams.insert(seq.id.clone(), tx);
        self.pending.push_back(seq);
        Ok(())
    }

    /// Cancel a sequence wherever it currently sits. Batched entries
    /// are only marked; they are skipped and reaped at the next
    /// reassembly rather than mutated mid-flight.
    pub fn cancel(&mut self, request_id: &str) -> bool {
        if let Some(idx) = self.pending.iter().position(|s| s.id == request_id) {
            if let Some(seq) = self.pending.remove(idx) {
                self.emit(
                    &seq.id,
                    ResponseEvent::Cancelled {
                        request_id: seq.id.clone(),
                    },
                );
                self.streams.remove(request_id);
            }
            return true;
        }
        if let Some(seq) = self.batch.get_mut(request_id) {
            seq.mark_cancelled();
            return true;
        }
        false
    }

    /// Reap finished/cancelled sequences, refill the batch from the
    /// backlog, and rebuild the step plan. Called by the device loop
    /// between dispatches, never while a group is in flight.
    ///
    /// While a step is mid-flight (plan present, live sequences in it)
    /// the batch shape is frozen: cancelled entries stay marked until
    /// the step finalizes, and backlogged sequences join at the next
    /// step. A step whose every sequence was cancelled is abandoned.
    ///
    /// Returns the end-to-end latency of each request that finished,
    /// for the metrics ledger.
    pub fn reassemble(&mut self) -> Vec<Duration> {
        if self.plan.is_some() {
            if self.batch.live_len() > 0 {
                return Vec::new();
            }
            self.plan = None;
        }

        let mut latencies = Vec::new();
        for seq in self.batch.reap() {
            let event = if seq.is_cancelled() {
                ResponseEvent::Cancelled {
                    request_id: seq.id.clone(),
                }
            } else {
                latencies.push(seq.arrival.elapsed());
                ResponseEvent::Finished {
                    request_id: seq.id.clone(),
                    tokens_generated: seq.generated.len(),
                }
            };
            self.emit(&seq.id, event);
            self.streams.remove(&seq.id);
        }

        let before = self.batch.len();
        while self.batch.len() < self.spec.max_batch_size {
            let Some(seq) = self.pending.pop_front() else {
                break;
            };
            self.batch.push(seq);
        }
        if self.batch.len() > before {
            debug!(
                model = %self.spec.id,
                batched = self.batch.len(),
                backlog = self.pending.len(),
                "batch refilled"
            );
        }

        if self.batch.live_len() > 0 {
            let shape = StepShape {
                model: self.spec.id.clone(),
                layers: self.spec.num_layers,
                bucket: self.batch.bucket(),
                seqs: self.batch.live_len(),
            };
            self.plan = Some(StepPlan::new(&self.splitter, shape));
        }
        latencies
    }

    /// Whether this instance has a dispatchable op-group right now.
    pub fn ready(&self) -> bool {
        self.batch.live_len() > 0
            && self
                .plan
                .as_ref()
                .and_then(StepPlan::current)
                .is_some()
    }

    /// True if any work exists at all, runnable or not.
    pub fn has_work(&self) -> bool {
        !self.pending.is_empty() || self.batch.live_len() > 0
    }

    pub fn current_group(&self) -> Option<&OpGroup> {
        self.plan.as_ref().and_then(StepPlan::current)
    }

    pub fn batch(&self) -> &RequestBatch {
        &self.batch
    }

    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.batch.earliest_deadline().or_else(|| {
            self.pending
                .iter()
                .filter(|s| !s.is_cancelled())
                .map(|s| s.deadline)
                .min()
        })
    }

    /// Advance past the just-completed group. Returns true when the
    /// step's group sequence is exhausted and the step must finalize.
    pub fn advance_group(&mut self) -> bool {
        let Some(plan) = self.plan.as_mut() else {
            return false;
        };
        plan.advance();
        plan.is_exhausted()
    }

    /// Append produced tokens and emit them on the owning streams.
    /// Clears the step plan; the next reassembly builds the next step.
    pub fn finalize_step(&mut self, tokens: &[(RequestId, crate::types::TokenId)]) {
        for (request_id, token) in tokens {
            let Some(seq) = self.batch.get_mut(request_id) else {
                continue;
            };
            if seq.is_cancelled() {
                continue;
            }
            seq.append(*token);
            let event = ResponseEvent::Token {
                request_id: request_id.clone(),
                token: *token,
                position: seq.position(),
            };
            self.emit(request_id, event);
        }
        self.plan = None;
    }

    /// Fail every sequence in the current batch, emitting explicit
    /// errors on their streams. Backlogged sequences are untouched.
    pub fn fail_batch(&mut self, reason: &str) {
        let failed: Vec<RequestId> = self.batch.iter().map(|s| s.id.clone()).collect();
        for request_id in failed {
            self.emit(
                &request_id,
                ResponseEvent::Failed {
                    request_id: request_id.clone(),
                    error: reason.to_string(),
                },
            );
            self.streams.remove(&request_id);
            self.batch.take(&request_id);
        }
        self.plan = None;
    }

    /// Fail everything this instance owns (device drain).
    pub fn fail_all(&mut self, reason: &str) {
        self.fail_batch(reason);
        while let Some(seq) = self.pending.pop_front() {
            self.emit(
                &seq.id,
                ResponseEvent::Failed {
                    request_id: seq.id.clone(),
                    error: reason.to_string(),
                },
            );
            self.streams.remove(&seq.id);
        }
    }

    /// Choose a sequence to offload: the one with the most generation
    /// left, so the receiving device amortizes the transfer. Only
    /// batched, live, mid-generation sequences qualify, and only
    /// between steps (no plan in flight).
    pub fn migration_candidate(&self) -> Option<RequestId> {
        if self.plan.is_some() || self.batch.live_len() < 2 {
            return None;
        }
        self.batch
            .iter()
            .filter(|s| !s.is_cancelled() && !s.generated.is_empty())
            .max_by_key(|s| s.params.max_tokens.saturating_sub(s.generated.len()))
            .map(|s| s.id.clone())
    }

    /// Detach a sequence and its stream for migration. The caller must
    /// either complete the handoff or reinsert via [`Self::restore`].
    pub fn detach(&mut self, request_id: &str) -> Option<(SequenceState, ResponseSender)> {
        let seq = self
            .batch
            .take(request_id)
            .or_else(|| {
                self.pending
                    .iter()
                    .position(|s| s.id == request_id)
                    .and_then(|idx| self.pending.remove(idx))
            })?;
        let tx = self.streams.remove(request_id)?;
        Some((seq, tx))
    }

    /// Reinsert a sequence whose migration fell through; it resumes
    /// local execution from unchanged state.
    pub fn restore(&mut self, seq: SequenceState, tx: ResponseSender) {
        self.streams.insert(seq.id.clone(), tx);
        self.pending.push_back(seq);
    }

    pub fn emit(&self, request_id: &str, event: ResponseEvent) {
        if let Some(tx) = self.streams.get(request_id) {
            // A dropped receiver just means nobody is listening anymore.
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opsplit::BackendCaps;
    use crate::output;
    use crate::request::SamplingParams;
    use crate::types::{Precision, WorkClass};

    fn spec(max_pending: usize) -> ModelSpec {
        ModelSpec {
            id: "m".into(),
            checkpoint: "ckpt/m".into(),
            parallelism: 1,
            placement: vec![0],
            quota_percent: 50,
            class: WorkClass::Foreground,
            precision: Precision::default(),
            steps_per_dispatch: 4,
            overload_threshold: 2,
            max_pending,
            sla_ms: 250,
            max_batch_size: 2,
            num_layers: 8,
        }
    }

    fn instance(max_pending: usize) -> ModelInstance {
        let spec = spec(max_pending);
        let splitter = OpSplitter::new(BackendCaps::default(), spec.steps_per_dispatch);
        ModelInstance::new(spec, splitter)
    }

    fn seq(id: &str, max_tokens: usize) -> SequenceState {
        SequenceState::new(
            id.to_string(),
            vec![1, 2],
            SamplingParams {
                max_tokens,
                ..Default::default()
            },
            Duration::from_millis(250),
        )
    }

    #[test]
    fn admission_ceiling_rejects_past_capacity() {
        let mut instance = instance(2);
        let (tx, _rx) = output::channel();
        instance.enqueue(seq("a", 4), tx.clone()).unwrap();
        instance.enqueue(seq("b", 4), tx.clone()).unwrap();

        let err = instance.enqueue(seq("c", 4), tx).unwrap_err();
        assert!(
            matches!(err, Error::AdmissionOverload { backlog: 2, capacity: 2, .. }),
            "expected hard-ceiling rejection, got {err}"
        );
    }

    #[test]
    fn reassemble_builds_plan_and_caps_batch() {
        let mut instance = instance(8);
        let (tx, _rx) = output::channel();
        for id in ["a", "b", "c"] {
            instance.enqueue(seq(id, 4), tx.clone()).unwrap();
        }

        instance.reassemble();
        assert_eq!(instance.batch().len(), 2, "max_batch_size caps the refill");
        assert_eq!(instance.backlog(), 1);
        assert!(instance.ready());
        assert_eq!(instance.current_group().unwrap().index, 0);
    }

    #[test]
    fn step_lifecycle_appends_tokens_and_clears_plan() {
        let mut instance = instance(8);
        let (tx, mut stream) = output::channel();
        instance.enqueue(seq("a", 4), tx).unwrap();
        instance.reassemble();

        let groups = instance
            .plan
            .as_ref()
            .map(StepPlan::group_count)
            .unwrap();
        for _ in 0..groups - 1 {
            assert!(!instance.advance_group());
        }
        assert!(instance.advance_group(), "last group exhausts the step");

        instance.finalize_step(&[("a".to_string(), 77)]);
        assert!(!instance.ready(), "plan cleared until next reassembly");

        instance.reassemble();
        assert!(instance.ready(), "next step plan rebuilt");

        let event = futures_block(stream.next()).unwrap();
        assert!(matches!(event, ResponseEvent::Token { token: 77, .. }));
    }

    #[test]
    fn cancelled_batch_entry_reaps_at_the_step_boundary() {
        let mut instance = instance(8);
        let (tx, mut stream) = output::channel();
        instance.enqueue(seq("a", 4), tx).unwrap();
        instance.reassemble();

        assert!(instance.cancel("a"));
        // The step's shape is frozen: the entry is only marked until
        // the in-flight step reaches its boundary.
        assert_eq!(instance.batch().len(), 1);

        instance.reassemble();
        assert!(!instance.has_work(), "all-cancelled step is abandoned");

        let event = futures_block(stream.next()).unwrap();
        assert!(matches!(event, ResponseEvent::Cancelled { .. }));
    }

    #[test]
    fn backlog_joins_at_the_next_step_only() {
        let mut instance = instance(8);
        let (tx, _rx) = output::channel();
        instance.enqueue(seq("a", 4), tx.clone()).unwrap();
        instance.reassemble();
        assert_eq!(instance.batch().len(), 1);

        // Mid-step arrival stays in the backlog.
        instance.enqueue(seq("b", 4), tx).unwrap();
        instance.reassemble();
        assert_eq!(instance.batch().len(), 1, "shape frozen mid-step");
        assert_eq!(instance.backlog(), 1);

        // Drive the step to its boundary; the next reassembly admits it.
        while !instance.advance_group() {}
        instance.finalize_step(&[("a".to_string(), 9)]);
        instance.reassemble();
        assert_eq!(instance.batch().len(), 2);
    }

    #[test]
    fn migration_candidate_prefers_longest_remaining() {
        let mut instance = instance(8);
        let (tx, _rx) = output::channel();
        instance.enqueue(seq("short", 4), tx.clone()).unwrap();
        instance.enqueue(seq("long", 64), tx).unwrap();
        instance.reassemble();

        // Mid-generation state with no plan in flight.
        instance.batch.get_mut("short").unwrap().append(1);
        instance.batch.get_mut("long").unwrap().append(1);
        instance.plan = None;

        assert_eq!(instance.migration_candidate().as_deref(), Some("long"));
    }

    fn futures_block<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }
}
