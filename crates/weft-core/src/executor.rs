//! Step executor boundary.
//!
//! The executor abstracts one op-group's worth of forward-pass work,
//! allowing different backends behind a unified async interface. The
//! weaving loop is the only caller and never has more than one group in
//! flight per device stream.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::opsplit::{BackendCaps, OpGroup};
use crate::request::RequestBatch;
use crate::types::{ModelId, RequestId, StepStatus, TokenId};

/// Result of executing one op-group.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Tokens produced, one per live sequence, only when the final
    /// group of a step completes. Interior groups report none.
    pub tokens: Vec<(RequestId, TokenId)>,
    /// Device time consumed; charged against the owner's epoch budget.
    pub duration: Duration,
    pub status: StepStatus,
}

impl StepOutcome {
    pub fn interior(duration: Duration) -> Self {
        Self {
            tokens: Vec::new(),
            duration,
            status: StepStatus::Ok,
        }
    }
}

/// Backend boundary: "execute one op-group of model M's batch B".
///
/// Implementations wrap real inference engines; [`SimulatedStepExecutor`]
/// stands in for them in tests and smoke deployments.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        model: &ModelId,
        batch: &RequestBatch,
        group: &OpGroup,
    ) -> Result<StepOutcome>;

    /// Capability descriptor, queried once per model at startup.
    fn caps(&self, model: &ModelId) -> BackendCaps;
}

/// Deterministic GPU-free executor.
///
/// Token output is a pure function of (request id, seed, position), so
/// a migrated or replayed continuation reproduces the exact sequence a
/// local run would have produced. Timing is synthetic: an op-group
/// consumes its weight's share of a nominal whole-step cost scaled by
/// the batch bucket.
pub struct SimulatedStepExecutor {
    /// Nominal duration of one full step at the reference bucket.
    base_step: Duration,
    /// Bucket at which `base_step` is calibrated.
    reference_bucket: usize,
    /// When set, awaits the synthetic duration on the tokio clock
    /// instead of returning immediately.
    realtime: bool,
    caps_overrides: HashMap<ModelId, BackendCaps>,
}

impl SimulatedStepExecutor {
    pub fn new(base_step: Duration) -> Self {
        Self {
            base_step,
            reference_bucket: 16,
            realtime: false,
            caps_overrides: HashMap::new(),
        }
    }

    /// Sleep for the synthetic duration instead of returning instantly.
    pub fn realtime(mut self) -> Self {
        self.realtime = true;
        self
    }

    pub fn with_caps(mut self, model: impl Into<ModelId>, caps: BackendCaps) -> Self {
        self.caps_overrides.insert(model.into(), caps);
        self
    }

    fn group_duration(&self, batch: &RequestBatch, group: &OpGroup) -> Duration {
        let scale = batch.bucket() as f64 / self.reference_bucket as f64;
        self.base_step.mul_f64(group.weight * scale.max(1.0))
    }

    /// Deterministic token synthesis: FNV-1a over (id, seed, position).
    fn synth_token(request_id: &str, seed: u64, position: usize) -> TokenId {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in request_id
            .as_bytes()
            .iter()
            .copied()
            .chain(seed.to_le_bytes())
            .chain((position as u64).to_le_bytes())
        {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        (hash % 32_000) as TokenId
    }
}

#[async_trait]
impl StepExecutor for SimulatedStepExecutor {
    async fn execute(
        &self,
        _model: &ModelId,
        batch: &RequestBatch,
        group: &OpGroup,
    ) -> Result<StepOutcome> {
        let duration = self.group_duration(batch, group);
        if self.realtime {
            tokio::time::sleep(duration).await;
        }

        if !group.is_last() {
            return Ok(StepOutcome::interior(duration));
        }

        let tokens = batch
            .iter()
            .filter(|seq| !seq.is_cancelled())
            .map(|seq| {
                let token = Self::synth_token(&seq.id, seq.params.seed, seq.position());
                (seq.id.clone(), token)
            })
            .collect();

        Ok(StepOutcome {
            tokens,
            duration,
            status: StepStatus::Ok,
        })
    }

    fn caps(&self, model: &ModelId) -> BackendCaps {
        self.caps_overrides
            .get(model)
            .copied()
            .unwrap_or_default()
    }
}
