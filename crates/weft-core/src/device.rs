//! Per-device weaving loop.
//!
//! Each physical device runs one loop as an independent tokio task.
//! The loop owns its [`WeavingScheduler`] outright; there is no shared
//! mutable scheduling state across devices. It suspends only while an
//! op-group executes or while waiting on a migration acknowledgment,
//! both bounded. Commands and inbound migrations are drained between
//! dispatches, so cancellation and submission always land at a
//! sub-step boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MigrationConfig;
use crate::error::{Error, Result};
use crate::executor::StepExecutor;
use crate::metrics::EpochSummary;
use crate::migration::{
    MigrationEnvelope, MigrationOutcome, MigrationReceiver, MigrationSender, MigrationTicket,
};
use crate::output::{ResponseEvent, ResponseSender};
use crate::request::SequenceState;
use crate::scheduler::WeavingScheduler;
use crate::types::{DeviceId, DeviceState, ModelId, RequestId, StepStatus};

/// Control messages a device loop accepts between dispatches.
pub enum DeviceCommand {
    Submit {
        model: ModelId,
        seq: SequenceState,
        tx: ResponseSender,
        /// Admission verdict; `AdmissionOverload` rejections surface
        /// here, synchronously from the submitter's point of view.
        admit_tx: oneshot::Sender<Result<()>>,
    },
    Cancel {
        model: ModelId,
        request: RequestId,
    },
    Drain,
}

/// Migration endpoints wired up by the service: one sender per peer
/// device, plus this device's own inbox.
pub struct MigrationLinks {
    pub senders: HashMap<DeviceId, MigrationSender>,
    pub receiver: MigrationReceiver,
}

impl MigrationLinks {
    /// A device with no peers: migration proposals simply never find a
    /// target.
    pub fn isolated() -> Self {
        let (_, receiver) = crate::migration::channel(1, Duration::from_millis(1), 1);
        Self {
            senders: HashMap::new(),
            receiver,
        }
    }
}

/// Handle to a spawned device loop.
pub struct DeviceHandle {
    pub id: DeviceId,
    commands: mpsc::Sender<DeviceCommand>,
    join: JoinHandle<()>,
}

impl DeviceHandle {
    /// Submit a sequence to a model hosted on this device. Resolves
    /// once the loop has admitted or rejected it.
    pub async fn submit(
        &self,
        model: ModelId,
        seq: SequenceState,
        tx: ResponseSender,
    ) -> Result<()> {
        let (admit_tx, admit_rx) = oneshot::channel();
        self.commands
            .send(DeviceCommand::Submit {
                model,
                seq,
                tx,
                admit_tx,
            })
            .await
            .map_err(|_| Error::ChannelClosed(format!("device {} command queue", self.id)))?;
        admit_rx
            .await
            .map_err(|_| Error::ChannelClosed(format!("device {} admission reply", self.id)))?
    }

    pub async fn cancel(&self, model: ModelId, request: RequestId) -> Result<()> {
        self.commands
            .send(DeviceCommand::Cancel { model, request })
            .await
            .map_err(|_| Error::ChannelClosed(format!("device {} command queue", self.id)))
    }

    /// Ask the loop to drain and wait for it to finish.
    pub async fn drain_and_join(self) {
        let _ = self.commands.send(DeviceCommand::Drain).await;
        let _ = self.join.await;
    }
}

/// Spawn the weaving loop for one device.
pub fn spawn_device(
    scheduler: WeavingScheduler,
    executor: Arc<dyn StepExecutor>,
    migration_config: MigrationConfig,
    links: MigrationLinks,
    summaries_tx: mpsc::UnboundedSender<EpochSummary>,
    shutdown: CancellationToken,
) -> DeviceHandle {
    let id = scheduler.device();
    let (commands_tx, commands_rx) = mpsc::channel(256);
    let join = tokio::spawn(run_device(
        scheduler,
        executor,
        migration_config,
        links,
        commands_rx,
        summaries_tx,
        shutdown,
    ));
    DeviceHandle {
        id,
        commands: commands_tx,
        join,
    }
}

async fn run_device(
    mut scheduler: WeavingScheduler,
    executor: Arc<dyn StepExecutor>,
    migration_config: MigrationConfig,
    mut links: MigrationLinks,
    mut commands: mpsc::Receiver<DeviceCommand>,
    summaries_tx: mpsc::UnboundedSender<EpochSummary>,
    shutdown: CancellationToken,
) {
    let device = scheduler.device();
    let mut state = DeviceState::Idle;
    // Cleared once every peer sender is gone, so the idle wait does not
    // spin on a closed inbox.
    let mut migration_open = true;
    info!(device, "weaving loop started");

    'outer: loop {
        if let Some(summary) = scheduler.maybe_roll_epoch() {
            log_epoch(&summary);
            let _ = summaries_tx.send(summary);
        }

        // Land queued control traffic at the sub-step boundary.
        loop {
            match commands.try_recv() {
                Ok(command) => {
                    if !handle_command(&mut scheduler, command) {
                        set_state(device, &mut state, DeviceState::Draining);
                        break 'outer;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    set_state(device, &mut state, DeviceState::Draining);
                    break 'outer;
                }
            }
        }
        while let Some(envelope) = links.receiver.try_recv() {
            accept_migration(&mut scheduler, &mut links.receiver, envelope);
        }
        if shutdown.is_cancelled() {
            set_state(device, &mut state, DeviceState::Draining);
            break;
        }

        let Some(unit) = scheduler.next_unit() else {
            set_state(device, &mut state, DeviceState::Idle);
            // Bounded idle wait: wake for traffic, shutdown, or the
            // epoch boundary that re-funds exhausted budgets.
            let wait = scheduler.until_epoch_end().max(Duration::from_millis(1));
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !handle_command(&mut scheduler, command) {
                            set_state(device, &mut state, DeviceState::Draining);
                            break 'outer;
                        }
                    }
                    None => {
                        set_state(device, &mut state, DeviceState::Draining);
                        break 'outer;
                    }
                },
                envelope = links.receiver.recv(), if migration_open => {
                    match envelope {
                        Some(envelope) => {
                            accept_migration(&mut scheduler, &mut links.receiver, envelope);
                        }
                        None => migration_open = false,
                    }
                },
                _ = shutdown.cancelled() => {
                    set_state(device, &mut state, DeviceState::Draining);
                    break 'outer;
                },
                _ = tokio::time::sleep(wait) => {},
            }
            continue;
        };

        set_state(device, &mut state, DeviceState::Dispatching);
        let result = {
            let batch = scheduler
                .instance(&unit.model)
                .map(crate::model::ModelInstance::batch);
            match batch {
                Some(batch) => executor.execute(&unit.model, batch, &unit.group).await,
                None => continue,
            }
        };

        match result {
            Ok(outcome) if outcome.status == StepStatus::Error => {
                warn!(device, model = %unit.model, "executor reported step error");
                let reason = Error::ExecutionFailure {
                    device,
                    reason: "executor reported step error".into(),
                }
                .to_string();
                scheduler.fail_unit(&unit, &reason);
            }
            Ok(outcome) => {
                let finalized = scheduler.on_success(&unit, &outcome);
                if finalized {
                    maybe_migrate(&mut scheduler, &migration_config, &links).await;
                }
            }
            Err(e) if e.is_device_fatal() => {
                error!(device, error = %e, "device fatal, draining");
                set_state(device, &mut state, DeviceState::Draining);
                scheduler.fail_all(&e.to_string());
                break;
            }
            Err(e) => {
                warn!(device, model = %unit.model, error = %e, "step failed");
                scheduler.fail_unit(&unit, &e.to_string());
            }
        }
    }

    set_state(device, &mut state, DeviceState::Draining);
    scheduler.fail_all("device draining");
    info!(device, "weaving loop drained");
}

fn set_state(device: DeviceId, state: &mut DeviceState, next: DeviceState) {
    if *state != next {
        debug!(device, from = ?state, to = ?next, "device state");
        *state = next;
    }
}

/// Returns false when the loop must drain.
fn handle_command(scheduler: &mut WeavingScheduler, command: DeviceCommand) -> bool {
    match command {
        DeviceCommand::Submit {
            model,
            seq,
            tx,
            admit_tx,
        } => {
            let verdict = scheduler.enqueue(&model, seq, tx);
            let _ = admit_tx.send(verdict);
            true
        }
        DeviceCommand::Cancel { model, request } => {
            if let Some(instance) = scheduler.instance_mut(&model) {
                if !instance.cancel(&request) {
                    debug!(model = %model, request = %request, "cancel for unknown request");
                }
            }
            true
        }
        DeviceCommand::Drain => false,
    }
}

fn accept_migration(
    scheduler: &mut WeavingScheduler,
    receiver: &mut MigrationReceiver,
    envelope: MigrationEnvelope,
) {
    let model = envelope.model.clone();
    let sla = scheduler
        .instance(&model)
        .map(|i| i.sla())
        .unwrap_or(Duration::from_millis(250));
    let applied = receiver.apply(envelope, sla, |seq, tx| scheduler.enqueue(&model, seq, tx));
    if applied.is_some() {
        scheduler.metrics_mut().on_migration_in(&model);
    }
}

/// At a step boundary, offload one sequence if this device is running
/// hot and a placement peer exists. The sender keeps ownership until a
/// positive ack; on timeout or rejection the sequence resumes locally.
async fn maybe_migrate(
    scheduler: &mut WeavingScheduler,
    config: &MigrationConfig,
    links: &MigrationLinks,
) {
    let Some(proposal) = scheduler.migration_proposal(config) else {
        return;
    };
    let Some(sender) = links.senders.get(&proposal.target) else {
        return;
    };
    let Some((seq, tx)) = scheduler
        .instance_mut(&proposal.model)
        .and_then(|i| i.detach(&proposal.request))
    else {
        return;
    };

    let device = scheduler.device();
    let ticket = MigrationTicket::seal(&seq);
    match sender.send(&proposal.model, ticket, tx.clone()).await {
        Ok(ack) => match ack.outcome {
            MigrationOutcome::Applied | MigrationOutcome::AlreadyApplied => {
                info!(
                    device,
                    model = %proposal.model,
                    request = %proposal.request,
                    target = proposal.target,
                    "sequence migrated"
                );
                let _ = tx.send(ResponseEvent::Migrated {
                    request_id: proposal.request.clone(),
                    device: proposal.target,
                });
                scheduler.metrics_mut().on_migration_out(&proposal.model);
            }
            MigrationOutcome::Rejected(reason) => {
                warn!(device, request = %proposal.request, reason = %reason, "migration rejected");
                let _ = tx.send(ResponseEvent::MigrationFailed {
                    request_id: proposal.request.clone(),
                    error: reason,
                });
                scheduler.metrics_mut().on_migration_failure(&proposal.model);
                if let Some(instance) = scheduler.instance_mut(&proposal.model) {
                    instance.restore(seq, tx);
                }
            }
        },
        Err(e) => {
            warn!(device, request = %proposal.request, error = %e, "migration failed");
            let _ = tx.send(ResponseEvent::MigrationFailed {
                request_id: proposal.request.clone(),
                error: e.to_string(),
            });
            scheduler.metrics_mut().on_migration_failure(&proposal.model);
            if let Some(instance) = scheduler.instance_mut(&proposal.model) {
                instance.restore(seq, tx);
            }
        }
    }
}

fn log_epoch(summary: &EpochSummary) {
    for model in &summary.models {
        debug!(
            device = summary.device,
            epoch = summary.epoch,
            model = %model.model,
            steps = model.steps_completed,
            tokens = model.tokens_generated,
            utilization = format!("{:.2}", model.quota_utilization),
            boosted = model.boosted,
            "epoch metrics"
        );
    }
}
