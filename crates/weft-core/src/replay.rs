//! Execution-graph replay cache.
//!
//! Re-dispatching the same (model, batch bucket, op-group) combination
//! can reuse a previously captured dispatch descriptor instead of
//! rebuilding it, amortizing launch overhead. Replay is purely a
//! performance layer under the executor adapter: a miss (or an evicted
//! entry) always falls back to full reconstruction, and token output is
//! identical either way.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::error::Result;
use crate::executor::{StepExecutor, StepOutcome};
use crate::opsplit::{BackendCaps, OpGroup};
use crate::request::RequestBatch;
use crate::types::ModelId;

/// Replay validity requires the batch shape and op-group identity to
/// match exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplayKey {
    pub model: ModelId,
    pub bucket: usize,
    pub group_index: usize,
}

#[derive(Debug, Default)]
struct ReplayStats {
    hits: u64,
    misses: u64,
}

/// Wraps any [`StepExecutor`], charging a one-time capture cost on the
/// first dispatch of each key and skipping it on subsequent exact
/// matches.
pub struct ReplayingExecutor<E> {
    inner: E,
    /// Synthetic dispatch-construction overhead paid on a miss.
    rebuild_cost: Duration,
    captured: Mutex<HashMap<ReplayKey, ()>>,
    stats: Mutex<ReplayStats>,
}

impl<E> ReplayingExecutor<E> {
    pub fn new(inner: E, rebuild_cost: Duration) -> Self {
        Self {
            inner,
            rebuild_cost,
            captured: Mutex::new(HashMap::new()),
            stats: Mutex::new(ReplayStats::default()),
        }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    /// (hits, misses) since construction.
    pub fn stats(&self) -> (u64, u64) {
        let stats = self.stats.lock().expect("replay stats poisoned");
        (stats.hits, stats.misses)
    }

    fn lookup(&self, key: &ReplayKey) -> bool {
        let mut captured = self.captured.lock().expect("replay cache poisoned");
        let mut stats = self.stats.lock().expect("replay stats poisoned");
        if captured.contains_key(key) {
            stats.hits += 1;
            true
        } else {
            captured.insert(key.clone(), ());
            stats.misses += 1;
            false
        }
    }
}

#[async_trait]
impl<E: StepExecutor> StepExecutor for ReplayingExecutor<E> {
    async fn execute(
        &self,
        model: &ModelId,
        batch: &RequestBatch,
        group: &OpGroup,
    ) -> Result<StepOutcome> {
        let key = ReplayKey {
            model: model.clone(),
            bucket: batch.bucket(),
            group_index: group.index,
        };
        let replayed = self.lookup(&key);

        let mut outcome = self.inner.execute(model, batch, group).await?;
        if !replayed {
            trace!(model = %model, bucket = key.bucket, group = key.group_index, "captured dispatch graph");
            outcome.duration += self.rebuild_cost;
        }
        Ok(outcome)
    }

    fn caps(&self, model: &ModelId) -> BackendCaps {
        self.inner.caps(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SimulatedStepExecutor;
    use crate::request::{SamplingParams, SequenceState};
    use crate::types::WorkClass;

    fn batch(prompt_len: usize) -> RequestBatch {
        let mut batch = RequestBatch::new("m".into(), WorkClass::Foreground);
        batch.push(SequenceState::new(
            "r".to_string(),
            vec![1; prompt_len],
            SamplingParams::default(),
            Duration::from_millis(250),
        ));
        batch
    }

    fn whole_step_group() -> OpGroup {
        OpGroup {
            index: 0,
            of: 1,
            ops: vec![],
            layer_start: 0,
            layer_end: 1,
            weight: 1.0,
        }
    }

    #[tokio::test]
    async fn exact_shape_match_replays() {
        let executor = ReplayingExecutor::new(
            SimulatedStepExecutor::new(Duration::from_millis(10)),
            Duration::from_millis(5),
        );
        let group = whole_step_group();

        let first = executor
            .execute(&"m".into(), &batch(8), &group)
            .await
            .unwrap();
        let second = executor
            .execute(&"m".into(), &batch(8), &group)
            .await
            .unwrap();

        assert_eq!(executor.stats(), (1, 1));
        assert!(
            second.duration < first.duration,
            "replay must skip the rebuild cost"
        );
        assert_eq!(first.tokens, second.tokens, "replay never changes output");
    }

    #[tokio::test]
    async fn bucket_change_invalidates_replay() {
        let executor = ReplayingExecutor::new(
            SimulatedStepExecutor::new(Duration::from_millis(10)),
            Duration::from_millis(5),
        );
        let group = whole_step_group();

        executor.execute(&"m".into(), &batch(8), &group).await.unwrap();
        // Prompt of 100 tokens lands in a different padded bucket.
        executor.execute(&"m".into(), &batch(100), &group).await.unwrap();

        assert_eq!(
            executor.stats(),
            (0, 2),
            "a different batch shape must rebuild, not replay"
        );
    }
}
