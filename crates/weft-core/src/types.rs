//! Shared identifier and status types.

use serde::{Deserialize, Serialize};

/// Identifier of a configured model instance.
pub type ModelId = String;

/// Identifier of a single generation request.
pub type RequestId = String;

/// Physical device (GPU) index.
pub type DeviceId = usize;

/// Vocabulary token id.
pub type TokenId = u32;

/// Priority tier of a model instance.
///
/// Foreground instances serve latency-sensitive traffic and take strict
/// dispatch priority while their epoch budget is unmet; background
/// instances absorb the remaining capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkClass {
    Foreground,
    #[default]
    Background,
}

impl WorkClass {
    pub fn is_foreground(&self) -> bool {
        matches!(self, WorkClass::Foreground)
    }
}

/// Lifecycle state of a device weaving loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// No runnable work; waiting for submissions or the next epoch.
    Idle,
    /// An op-group is in flight on the device stream.
    Dispatching,
    /// Shutdown in progress; no new work is admitted.
    Draining,
}

/// Completion status reported by the step executor for one op-group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Ok,
    /// The group ran but produced less work than requested (e.g. a
    /// backend-side truncation). The step continues.
    Partial,
    /// The group failed; the owning batch fails.
    Error,
}

/// Numeric precision a model instance runs at. Opaque to the scheduler,
/// forwarded to the executor backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Bf16,
    Fp16,
    Fp32,
    Int8,
}
