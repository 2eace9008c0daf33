//! Request and batch state.
//!
//! A [`SequenceState`] is the unit the migration channel moves between
//! devices; a [`RequestBatch`] groups the sequences one model instance
//! advances together in a single step. Cancellation only marks a
//! sequence: the entry is skipped and reaped at the next batch
//! reassembly, never mutated mid-flight.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::types::{ModelId, RequestId, TokenId, WorkClass};

/// Sampling parameters carried with a sequence, including across
/// migrations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    /// Seed for deterministic generation. Fixed per request so a
    /// migrated continuation reproduces the same tokens.
    pub seed: u64,
    pub max_tokens: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            seed: 0,
            max_tokens: 128,
        }
    }
}

/// Per-sequence generation state.
#[derive(Debug, Clone)]
pub struct SequenceState {
    pub id: RequestId,
    pub prompt: Vec<TokenId>,
    pub generated: Vec<TokenId>,
    pub params: SamplingParams,
    /// Submission time, preserved across migration for deadline ranking.
    pub arrival: Instant,
    /// Soft deadline = arrival + owning model's SLA target.
    pub deadline: Instant,
    cancelled: bool,
}

impl SequenceState {
    pub fn new(id: RequestId, prompt: Vec<TokenId>, params: SamplingParams, sla: Duration) -> Self {
        let arrival = Instant::now();
        Self {
            id,
            prompt,
            generated: Vec::new(),
            params,
            arrival,
            deadline: arrival + sla,
            cancelled: false,
        }
    }

    /// Rebuild a sequence at an exact token position, as the migration
    /// receiver does.
    pub fn resumed(
        id: RequestId,
        prompt: Vec<TokenId>,
        generated: Vec<TokenId>,
        params: SamplingParams,
        sla: Duration,
    ) -> Self {
        let mut seq = Self::new(id, prompt, params, sla);
        seq.generated = generated;
        seq
    }

    /// Total token position: prompt plus everything generated so far.
    pub fn position(&self) -> usize {
        self.prompt.len() + self.generated.len()
    }

    pub fn append(&mut self, token: TokenId) {
        self.generated.push(token);
    }

    pub fn is_finished(&self) -> bool {
        self.generated.len() >= self.params.max_tokens
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// Sequences grouped for one model instance's current step.
///
/// Owned exclusively by that instance; tokens are appended every step
/// and finished or cancelled entries are removed at reassembly.
#[derive(Debug)]
pub struct RequestBatch {
    model: ModelId,
    class: WorkClass,
    sequences: Vec<SequenceState>,
}

impl RequestBatch {
    pub fn new(model: ModelId, class: WorkClass) -> Self {
        Self {
            model,
            class,
            sequences: Vec::new(),
        }
    }

    pub fn model(&self) -> &ModelId {
        &self.model
    }

    pub fn class(&self) -> WorkClass {
        self.class
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn push(&mut self, seq: SequenceState) {
        self.sequences.push(seq);
    }

    pub fn iter(&self) -> impl Iterator<Item = &SequenceState> {
        self.sequences.iter()
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SequenceState> {
        self.sequences.iter_mut().find(|s| s.id == id)
    }

    /// Longest token position across live sequences.
    pub fn max_position(&self) -> usize {
        self.sequences
            .iter()
            .filter(|s| !s.is_cancelled())
            .map(|s| s.position())
            .max()
            .unwrap_or(0)
    }

    /// Padded length bucket for the current step: the max position
    /// rounded up to a power of two. Steps with the same bucket share
    /// kernel launch shapes, which is what makes graph replay valid.
    pub fn bucket(&self) -> usize {
        self.max_position().next_power_of_two().max(16)
    }

    /// Earliest deadline among live sequences.
    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.sequences
            .iter()
            .filter(|s| !s.is_cancelled())
            .map(|s| s.deadline)
            .min()
    }

    /// Remove finished and cancelled sequences, returning them for
    /// stream finalization. Called only between steps.
    pub fn reap(&mut self) -> Vec<SequenceState> {
        let mut reaped = Vec::new();
        self.sequences.retain_mut(|seq| {
            if seq.is_finished() || seq.is_cancelled() {
                reaped.push(seq.clone());
                false
            } else {
                true
            }
        });
        reaped
    }

    /// Remove a specific sequence regardless of state (migration send).
    pub fn take(&mut self, id: &str) -> Option<SequenceState> {
        let idx = self.sequences.iter().position(|s| s.id == id)?;
        Some(self.sequences.remove(idx))
    }

    /// Live (not cancelled) sequence count.
    pub fn live_len(&self) -> usize {
        self.sequences.iter().filter(|s| !s.is_cancelled()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(id: &str, prompt_len: usize, max_tokens: usize) -> SequenceState {
        SequenceState::new(
            id.to_string(),
            vec![1; prompt_len],
            SamplingParams {
                max_tokens,
                ..Default::default()
            },
            Duration::from_millis(250),
        )
    }

    #[test]
    fn bucket_rounds_to_power_of_two() {
        let mut batch = RequestBatch::new("m".into(), WorkClass::Foreground);
        batch.push(seq("a", 100, 16));
        assert_eq!(batch.bucket(), 128);

        let empty = RequestBatch::new("m".into(), WorkClass::Foreground);
        assert_eq!(empty.bucket(), 16, "empty batch floors at the minimum bucket");
    }

    #[test]
    fn reap_removes_finished_and_cancelled() {
        let mut batch = RequestBatch::new("m".into(), WorkClass::Background);
        let mut done = seq("done", 4, 1);
        done.append(7);
        let mut gone = seq("gone", 4, 8);
        gone.mark_cancelled();
        batch.push(done);
        batch.push(gone);
        batch.push(seq("live", 4, 8));

        let reaped = batch.reap();
        assert_eq!(reaped.len(), 2);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.iter().next().unwrap().id, "live");
    }

    #[test]
    fn cancelled_sequence_survives_until_reap() {
        let mut batch = RequestBatch::new("m".into(), WorkClass::Background);
        batch.push(seq("a", 4, 8));
        batch.get_mut("a").unwrap().mark_cancelled();
        // Still present mid-step, excluded from live accounting.
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.live_len(), 0);
    }
}
