//! Top-level multiplexing service.
//!
//! `MuxService` turns a validated [`MuxConfig`] into running device
//! loops, routes submissions to each model's home device, and collects
//! per-epoch metric summaries. Devices share nothing mutable; the only
//! cross-device traffic is the migration channel mesh built here.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::MuxConfig;
use crate::device::{spawn_device, DeviceHandle, MigrationLinks};
use crate::error::{Error, Result};
use crate::executor::StepExecutor;
use crate::metrics::EpochSummary;
use crate::migration;
use crate::output::{self, ResponseStream};
use crate::request::{SamplingParams, SequenceState};
use crate::scheduler::WeavingScheduler;
use crate::types::{DeviceId, ModelId, RequestId, TokenId};

pub struct MuxService {
    config: MuxConfig,
    devices: HashMap<DeviceId, DeviceHandle>,
    shutdown: CancellationToken,
    summaries: Arc<RwLock<HashMap<DeviceId, EpochSummary>>>,
    collector: JoinHandle<()>,
}

impl MuxService {
    /// Validate the config, wire the migration mesh, and spawn one
    /// weaving loop per device.
    pub fn start(config: MuxConfig, executor: Arc<dyn StepExecutor>) -> Result<Self> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let (summaries_tx, mut summaries_rx) = mpsc::unbounded_channel::<EpochSummary>();

        // One inbox per device; every device gets sender clones for all
        // of its peers.
        let ack_timeout = Duration::from_millis(config.migration.ack_timeout_ms);
        let mut inboxes = HashMap::new();
        let mut senders = HashMap::new();
        for device in &config.devices {
            let (sender, receiver) =
                migration::channel(64, ack_timeout, config.migration.max_retries);
            inboxes.insert(device.id, receiver);
            senders.insert(device.id, sender);
        }

        let mut devices = HashMap::new();
        for device in &config.devices {
            let mut scheduler = WeavingScheduler::new(device.id, &config.epoch);
            for spec in config.models_on(device.id) {
                // Capability is queried once, at startup.
                scheduler.add_instance(spec.clone(), executor.caps(&spec.id));
            }

            let peer_senders: HashMap<DeviceId, _> = senders
                .iter()
                .filter(|(id, _)| **id != device.id)
                .map(|(id, sender)| (*id, sender.clone()))
                .collect();
            let links = MigrationLinks {
                senders: peer_senders,
                receiver: inboxes
                    .remove(&device.id)
                    .expect("inbox created for every device"),
            };

            let handle = spawn_device(
                scheduler,
                executor.clone(),
                config.migration.clone(),
                links,
                summaries_tx.clone(),
                shutdown.child_token(),
            );
            devices.insert(device.id, handle);
        }
        info!(devices = devices.len(), models = config.models.len(), "mux service started");

        let summaries = Arc::new(RwLock::new(HashMap::new()));
        let sink = summaries.clone();
        let collector = tokio::spawn(async move {
            while let Some(summary) = summaries_rx.recv().await {
                if let Ok(mut latest) = sink.write() {
                    latest.insert(summary.device, summary);
                }
            }
        });

        Ok(Self {
            config,
            devices,
            shutdown,
            summaries,
            collector,
        })
    }

    /// Submit a request under a fresh id.
    pub async fn submit(
        &self,
        model: &str,
        prompt: Vec<TokenId>,
        params: SamplingParams,
    ) -> Result<ResponseStream> {
        let request_id = format!("req-{}", uuid::Uuid::new_v4());
        self.submit_request(model, request_id, prompt, params).await
    }

    /// Submit with a caller-chosen request id. Admission is resolved
    /// before this returns: a backlog past the model's hard ceiling
    /// yields `AdmissionOverload` here, not a dangling stream.
    pub async fn submit_request(
        &self,
        model: &str,
        request_id: RequestId,
        prompt: Vec<TokenId>,
        params: SamplingParams,
    ) -> Result<ResponseStream> {
        let spec = self
            .config
            .model(model)
            .ok_or_else(|| Error::UnknownModel(model.to_string()))?;
        let handle = self
            .devices
            .get(&spec.home_device())
            .ok_or_else(|| Error::UnknownModel(model.to_string()))?;

        let seq = SequenceState::new(
            request_id,
            prompt,
            params,
            Duration::from_millis(spec.sla_ms),
        );
        let (tx, stream) = output::channel();
        handle.submit(spec.id.clone(), seq, tx).await?;
        Ok(stream)
    }

    /// Cancel a request wherever it currently runs. Migration may have
    /// moved it off its home device, so every placement peer is told;
    /// the cancel is a no-op on devices that do not own it.
    pub async fn cancel(&self, model: &str, request_id: &str) -> Result<()> {
        let spec = self
            .config
            .model(model)
            .ok_or_else(|| Error::UnknownModel(model.to_string()))?;
        for device in &spec.placement {
            if let Some(handle) = self.devices.get(device) {
                handle
                    .cancel(spec.id.clone(), request_id.to_string())
                    .await?;
            }
        }
        Ok(())
    }

    /// Latest per-device epoch summaries.
    pub fn metrics(&self) -> Vec<EpochSummary> {
        let mut snapshot: Vec<EpochSummary> = self
            .summaries
            .read()
            .map(|latest| latest.values().cloned().collect())
            .unwrap_or_default();
        snapshot.sort_by_key(|s| s.device);
        snapshot
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelId> {
        self.config.models.iter().map(|m| &m.id)
    }

    /// Drain every device and stop the collector.
    pub async fn shutdown(self) -> Result<()> {
        debug!("mux service shutting down");
        self.shutdown.cancel();
        for (_, handle) in self.devices {
            handle.drain_and_join().await;
        }
        self.collector.abort();
        info!("mux service shut down");
        Ok(())
    }
}
