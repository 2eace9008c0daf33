//! Op-splitting: decomposing a full inference step into schedulable
//! op groups.
//!
//! The weaving loop interleaves models at op-group granularity, so a
//! foreground step never waits behind more than one group of background
//! work. Splitting is deterministic for a given (model, batch shape):
//! the same step always yields the same group boundaries, which the
//! replay cache depends on.

use serde::{Deserialize, Serialize};

use crate::types::ModelId;

/// Operation classes inside a transformer step, in causal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Embed,
    /// Attention for a band of layers.
    Attention,
    /// MLP/projection for a band of layers.
    Mlp,
    LmHead,
}

/// One schedulable slice of a full step.
#[derive(Debug, Clone, PartialEq)]
pub struct OpGroup {
    /// Position in the step's group sequence.
    pub index: usize,
    /// Total groups in this step.
    pub of: usize,
    pub ops: Vec<OpKind>,
    /// First layer covered (inclusive).
    pub layer_start: usize,
    /// Last layer covered (exclusive).
    pub layer_end: usize,
    /// Estimated fraction of the whole step's execution time. Group
    /// weights for one step sum to 1.0.
    pub weight: f64,
}

impl OpGroup {
    pub fn is_last(&self) -> bool {
        self.index + 1 == self.of
    }
}

/// Shape key a split is computed for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepShape {
    pub model: ModelId,
    pub layers: usize,
    /// Padded length bucket of the batch.
    pub bucket: usize,
    pub seqs: usize,
}

/// What a model backend supports, queried once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCaps {
    /// Backends that cannot split degrade to one whole-step group; the
    /// scheduler stays correct and only loses preemption granularity.
    pub supports_op_split: bool,
    pub max_groups: usize,
}

impl Default for BackendCaps {
    fn default() -> Self {
        Self {
            supports_op_split: true,
            max_groups: 8,
        }
    }
}

/// Deterministic step partitioner for one model instance.
#[derive(Debug, Clone)]
pub struct OpSplitter {
    caps: BackendCaps,
    target_groups: usize,
}

impl OpSplitter {
    pub fn new(caps: BackendCaps, target_groups: usize) -> Self {
        Self {
            caps,
            target_groups: target_groups.max(1),
        }
    }

    pub fn caps(&self) -> BackendCaps {
        self.caps
    }

    /// Partition a step into op groups.
    ///
    /// Layers are divided into contiguous bands, one band per group;
    /// the first group also carries the embedding, the last the LM
    /// head. Concatenating the groups is equivalent to the unsplit
    /// step: every layer appears exactly once, in order.
    pub fn split(&self, shape: &StepShape) -> Vec<OpGroup> {
        let layers = shape.layers.max(1);

        if !self.caps.supports_op_split {
            return vec![OpGroup {
                index: 0,
                of: 1,
                ops: vec![OpKind::Embed, OpKind::Attention, OpKind::Mlp, OpKind::LmHead],
                layer_start: 0,
                layer_end: layers,
                weight: 1.0,
            }];
        }

        let groups = self
            .target_groups
            .min(self.caps.max_groups.max(1))
            .min(layers);
        let base = layers / groups;
        let remainder = layers % groups;

        let mut out = Vec::with_capacity(groups);
        let mut layer = 0;
        for index in 0..groups {
            // Earlier bands absorb the remainder so band sizes differ by
            // at most one layer.
            let band = base + usize::from(index < remainder);
            let mut ops = Vec::with_capacity(4);
            if index == 0 {
                ops.push(OpKind::Embed);
            }
            ops.push(OpKind::Attention);
            ops.push(OpKind::Mlp);
            if index + 1 == groups {
                ops.push(OpKind::LmHead);
            }
            out.push(OpGroup {
                index,
                of: groups,
                ops,
                layer_start: layer,
                layer_end: layer + band,
                weight: band as f64 / layers as f64,
            });
            layer += band;
        }
        out
    }
}

/// Cursor over one step's op groups.
///
/// Built when a batch is reassembled, advanced one group per dispatch,
/// and discarded when the step finalizes.
#[derive(Debug, Clone)]
pub struct StepPlan {
    shape: StepShape,
    groups: Vec<OpGroup>,
    next: usize,
}

impl StepPlan {
    pub fn new(splitter: &OpSplitter, shape: StepShape) -> Self {
        let groups = splitter.split(&shape);
        Self {
            shape,
            groups,
            next: 0,
        }
    }

    pub fn shape(&self) -> &StepShape {
        &self.shape
    }

    /// Next group to dispatch, or None once the step is exhausted.
    pub fn current(&self) -> Option<&OpGroup> {
        self.groups.get(self.next)
    }

    pub fn advance(&mut self) {
        self.next += 1;
    }

    pub fn is_exhausted(&self) -> bool {
        self.next >= self.groups.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}
