//! Error types shared across the crate.

use thiserror::Error;

use crate::types::{DeviceId, ModelId, RequestId};

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the weaving runtime.
///
/// Per-request failures are delivered on the owning request's response
/// stream and never abort a device loop; device-fatal failures drain the
/// affected device only.
#[derive(Debug, Error)]
pub enum Error {
    /// Backlog exceeded the model's hard admission ceiling. Soft overload
    /// (backlog above `overload_threshold` but below the ceiling) boosts
    /// priority instead of rejecting.
    #[error("model {model}: backlog {backlog} exceeds hard capacity {capacity}")]
    AdmissionOverload {
        model: ModelId,
        backlog: usize,
        capacity: usize,
    },

    /// A step failed on-device; the request batch fails, the device keeps
    /// scheduling other models.
    #[error("execution failure on device {device}: {reason}")]
    ExecutionFailure { device: DeviceId, reason: String },

    /// The device itself became unusable. The loop drains and halts;
    /// restart is an operator action.
    #[error("device {device} fatal: {reason}")]
    DeviceFatal { device: DeviceId, reason: String },

    /// No acknowledgment from the migration receiver within the retry
    /// budget.
    #[error("migration of request {request_id} timed out after {retries} retries")]
    MigrationTimeout { request_id: RequestId, retries: u32 },

    /// The receiver already applied a ticket with this idempotency key.
    #[error("duplicate migration ticket for request {request_id} at position {position}")]
    MigrationDuplicate {
        request_id: RequestId,
        position: usize,
    },

    /// Ticket payload did not match its checksum.
    #[error("migration ticket for request {request_id} failed checksum validation")]
    MigrationCorrupt { request_id: RequestId },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown model: {0}")]
    UnknownModel(ModelId),

    /// An internal channel endpoint went away, usually during shutdown.
    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

impl Error {
    /// Whether this error should take down the device loop that saw it.
    pub fn is_device_fatal(&self) -> bool {
        matches!(self, Error::DeviceFatal { .. })
    }
}
