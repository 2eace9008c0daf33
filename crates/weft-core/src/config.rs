//! Deployment configuration types.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{DeviceId, ModelId, Precision, WorkClass};

/// Top-level configuration for one weft deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxConfig {
    /// Devices available to this deployment.
    pub devices: Vec<DeviceConfig>,

    /// Model instances to colocate.
    pub models: Vec<ModelSpec>,

    /// Scheduling epoch parameters.
    #[serde(default)]
    pub epoch: EpochConfig,

    /// Cross-device migration parameters.
    #[serde(default)]
    pub migration: MigrationConfig,
}

/// One physical GPU (or GPU-sharing domain).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device index, unique within the deployment.
    pub id: DeviceId,

    /// Optional operator-facing label.
    #[serde(default)]
    pub label: String,
}

/// Static configuration of one model instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Identifier, unique within the deployment.
    pub id: ModelId,

    /// Checkpoint reference, opaque to the scheduler.
    pub checkpoint: String,

    /// Tensor/pipeline parallelism degree.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Devices this instance may run on. The first entry is the home
    /// device; additional entries are migration targets.
    pub placement: Vec<DeviceId>,

    /// Share of each placement device's compute time, in percent.
    pub quota_percent: u32,

    /// Priority tier.
    #[serde(default)]
    pub class: WorkClass,

    /// Numeric precision hint for the executor backend.
    #[serde(default)]
    pub precision: Precision,

    /// Scheduling granularity: target op-groups per full step.
    #[serde(default = "default_steps_per_dispatch")]
    pub steps_per_dispatch: usize,

    /// Backlog depth beyond which the instance counts as overloaded and
    /// receives a priority boost for the next epoch.
    #[serde(default = "default_overload_threshold")]
    pub overload_threshold: usize,

    /// Hard admission ceiling. Submissions beyond this backlog are
    /// rejected outright instead of boosted.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    /// Soft latency target for foreground deadline ranking.
    #[serde(default = "default_sla_ms")]
    pub sla_ms: u64,

    /// Maximum sequences batched into one step.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Transformer depth reported to the op-splitter.
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
}

/// Scheduling epoch parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochConfig {
    /// Fixed epoch length over which quotas are tracked and reset.
    #[serde(default = "default_epoch_ms")]
    pub duration_ms: u64,

    /// Multiplicative ranking boost applied to an overloaded model for
    /// the epoch after its backlog crossed `overload_threshold`.
    #[serde(default = "default_boost_factor")]
    pub boost_factor: f64,
}

impl Default for EpochConfig {
    fn default() -> Self {
        Self {
            duration_ms: default_epoch_ms(),
            boost_factor: default_boost_factor(),
        }
    }
}

/// Cross-device migration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Whether the weaving loops may hand sequences to peer devices.
    #[serde(default = "default_migration_enabled")]
    pub enabled: bool,

    /// Acknowledgment wait per send attempt.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Retransmissions before the sender reports `MigrationTimeout`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// A device whose busy fraction exceeds this within an epoch looks
    /// for a less-loaded placement peer at step boundaries.
    #[serde(default = "default_busy_threshold")]
    pub busy_threshold: f64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            enabled: default_migration_enabled(),
            ack_timeout_ms: default_ack_timeout_ms(),
            max_retries: default_max_retries(),
            busy_threshold: default_busy_threshold(),
        }
    }
}

fn default_parallelism() -> usize {
    1
}
fn default_steps_per_dispatch() -> usize {
    8
}
fn default_overload_threshold() -> usize {
    4
}
fn default_max_pending() -> usize {
    64
}
fn default_sla_ms() -> u64 {
    250
}
fn default_max_batch_size() -> usize {
    8
}
fn default_num_layers() -> usize {
    32
}
fn default_epoch_ms() -> u64 {
    100
}
fn default_boost_factor() -> f64 {
    1.5
}
fn default_migration_enabled() -> bool {
    true
}
fn default_ack_timeout_ms() -> u64 {
    50
}
fn default_max_retries() -> u32 {
    3
}
fn default_busy_threshold() -> f64 {
    0.85
}

impl MuxConfig {
    /// Parse a deployment config from JSON.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: MuxConfig = serde_json::from_str(raw)
            .map_err(|e| Error::InvalidConfig(format!("parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a deployment config from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    /// Validate structural invariants.
    ///
    /// Rejects: duplicate ids, empty or dangling placements, zero quotas,
    /// and any device whose foreground quota percentages sum past 100.
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(Error::InvalidConfig("no devices configured".into()));
        }
        if self.models.is_empty() {
            return Err(Error::InvalidConfig("no models configured".into()));
        }

        let mut device_ids = std::collections::HashSet::new();
        for device in &self.devices {
            if !device_ids.insert(device.id) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate device id {}",
                    device.id
                )));
            }
        }

        let mut model_ids = std::collections::HashSet::new();
        let mut foreground_percent: HashMap<DeviceId, u32> = HashMap::new();

        for model in &self.models {
            if !model_ids.insert(model.id.clone()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate model id {}",
                    model.id
                )));
            }
            if model.placement.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "model {} has no device placement",
                    model.id
                )));
            }
            for device in &model.placement {
                if !device_ids.contains(device) {
                    return Err(Error::InvalidConfig(format!(
                        "model {} placed on unknown device {device}",
                        model.id
                    )));
                }
            }
            if model.quota_percent == 0 || model.quota_percent > 100 {
                return Err(Error::InvalidConfig(format!(
                    "model {} quota {}% out of range (1..=100)",
                    model.id, model.quota_percent
                )));
            }
            if model.max_batch_size == 0 {
                return Err(Error::InvalidConfig(format!(
                    "model {} max_batch_size must be positive",
                    model.id
                )));
            }
            if model.class.is_foreground() {
                for device in &model.placement {
                    let total = foreground_percent.entry(*device).or_insert(0);
                    *total += model.quota_percent;
                    if *total > 100 {
                        return Err(Error::InvalidConfig(format!(
                            "device {device}: foreground quotas sum to {total}%, exceeding capacity"
                        )));
                    }
                }
            }
        }

        if self.epoch.duration_ms == 0 {
            return Err(Error::InvalidConfig("epoch duration must be positive".into()));
        }
        if self.epoch.boost_factor < 1.0 {
            return Err(Error::InvalidConfig(
                "boost_factor below 1.0 would invert overload handling".into(),
            ));
        }

        Ok(())
    }

    /// Models whose placement list contains `device`.
    pub fn models_on(&self, device: DeviceId) -> Vec<&ModelSpec> {
        self.models
            .iter()
            .filter(|m| m.placement.contains(&device))
            .collect()
    }

    pub fn model(&self, id: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.id == id)
    }
}

impl ModelSpec {
    /// The device this instance prefers when several are configured.
    pub fn home_device(&self) -> DeviceId {
        self.placement[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, placement: Vec<DeviceId>, quota: u32, class: WorkClass) -> ModelSpec {
        ModelSpec {
            id: id.to_string(),
            checkpoint: format!("ckpt/{id}"),
            parallelism: 1,
            placement,
            quota_percent: quota,
            class,
            precision: Precision::default(),
            steps_per_dispatch: 8,
            overload_threshold: 4,
            max_pending: 64,
            sla_ms: 250,
            max_batch_size: 8,
            num_layers: 32,
        }
    }

    fn base_config() -> MuxConfig {
        MuxConfig {
            devices: vec![DeviceConfig {
                id: 0,
                label: String::new(),
            }],
            models: vec![
                spec("chat", vec![0], 70, WorkClass::Foreground),
                spec("batch", vec![0], 30, WorkClass::Background),
            ],
            epoch: EpochConfig::default(),
            migration: MigrationConfig::default(),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn foreground_quota_oversubscription_rejected() {
        let mut config = base_config();
        config.models[1].class = WorkClass::Foreground;
        config.models[1].quota_percent = 40;
        let err = config.validate().unwrap_err();
        assert!(
            matches!(err, Error::InvalidConfig(ref msg) if msg.contains("foreground")),
            "expected foreground oversubscription error, got {err}"
        );
    }

    #[test]
    fn dangling_placement_rejected() {
        let mut config = base_config();
        config.models[0].placement = vec![7];
        assert!(config.validate().is_err());
    }

    #[test]
    fn serde_defaults_fill_optional_fields() {
        let raw = r#"{
            "devices": [{"id": 0}],
            "models": [{
                "id": "m",
                "checkpoint": "ckpt/m",
                "placement": [0],
                "quota_percent": 50
            }]
        }"#;
        let config = MuxConfig::from_json(raw).expect("minimal config should parse");
        assert_eq!(config.models[0].overload_threshold, 4);
        assert_eq!(config.models[0].class, WorkClass::Background);
        assert_eq!(config.epoch.duration_ms, 100);
    }
}
