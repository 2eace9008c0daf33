//! Cross-device migration of in-flight generation state.
//!
//! A sender packages a sequence's exact state into a [`MigrationTicket`]
//! and transmits it over an explicit message channel; the receiver
//! resumes generation from the same token position. Application is
//! at-most-once: the idempotency key is (request id, generation
//! position), and a retransmitted ticket is acknowledged without being
//! reapplied. The sender owns the sequence until a positive ack, so
//! there is no dual-owned window beyond the handshake itself.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::output::ResponseSender;
use crate::request::{SamplingParams, SequenceState};
use crate::types::{ModelId, RequestId, TokenId};

/// Wire payload for one in-flight handoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationTicket {
    pub request_id: RequestId,
    /// Number of tokens generated so far; the receiver resumes at
    /// exactly this position.
    pub generation_position: usize,
    /// Full token history: prompt followed by generated tokens.
    pub token_history: Vec<TokenId>,
    pub sampling: SamplingParams,
    /// blake3 hex digest over the fields above.
    pub checksum: String,
}

impl MigrationTicket {
    /// Package a sequence for transmission.
    pub fn seal(seq: &SequenceState) -> Self {
        let mut token_history = seq.prompt.clone();
        token_history.extend_from_slice(&seq.generated);
        let generation_position = seq.generated.len();
        let checksum = Self::digest(
            &seq.id,
            generation_position,
            &token_history,
            &seq.params,
        );
        Self {
            request_id: seq.id.clone(),
            generation_position,
            token_history,
            sampling: seq.params.clone(),
            checksum,
        }
    }

    fn digest(
        request_id: &str,
        position: usize,
        history: &[TokenId],
        sampling: &SamplingParams,
    ) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(request_id.as_bytes());
        hasher.update(&(position as u64).to_le_bytes());
        for token in history {
            hasher.update(&token.to_le_bytes());
        }
        hasher.update(&sampling.seed.to_le_bytes());
        hasher.update(&(sampling.max_tokens as u64).to_le_bytes());
        hasher.update(&sampling.temperature.to_le_bytes());
        hasher.update(&sampling.top_p.to_le_bytes());
        hasher.finalize().to_string()
    }

    pub fn verify(&self) -> bool {
        self.checksum
            == Self::digest(
                &self.request_id,
                self.generation_position,
                &self.token_history,
                &self.sampling,
            )
    }

    pub fn idempotency_key(&self) -> (RequestId, usize) {
        (self.request_id.clone(), self.generation_position)
    }

    /// Reconstruct the sequence at its exact token position.
    pub fn into_sequence(self, sla: Duration) -> SequenceState {
        let prompt_len = self
            .token_history
            .len()
            .saturating_sub(self.generation_position);
        let prompt = self.token_history[..prompt_len].to_vec();
        let generated = self.token_history[prompt_len..].to_vec();
        SequenceState::resumed(self.request_id, prompt, generated, self.sampling, sla)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationOutcome {
    Applied,
    /// Idempotent duplicate; the receiver did not reapply.
    AlreadyApplied,
    Rejected(String),
}

/// Receiver's reply for one ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationAck {
    pub request_id: RequestId,
    pub generation_position: usize,
    pub outcome: MigrationOutcome,
}

/// Channel message: the ticket plus transport-level context. The wire
/// contract is the ticket; the owning model id is routing metadata and
/// the response sender rides along so the receiver keeps emitting on
/// the submitter's original stream.
pub struct MigrationEnvelope {
    pub model: ModelId,
    pub ticket: MigrationTicket,
    pub resume_tx: ResponseSender,
    pub ack_tx: oneshot::Sender<MigrationAck>,
}

/// Create a migration link with the given in-flight capacity.
pub fn channel(
    capacity: usize,
    ack_timeout: Duration,
    max_attempts: u32,
) -> (MigrationSender, MigrationReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        MigrationSender {
            tx,
            ack_timeout,
            max_attempts: max_attempts.max(1),
        },
        MigrationReceiver {
            rx,
            applied: HashSet::new(),
        },
    )
}

/// Sending half: transmits with bounded ack waits and a fixed attempt
/// budget.
#[derive(Clone)]
pub struct MigrationSender {
    tx: mpsc::Sender<MigrationEnvelope>,
    ack_timeout: Duration,
    max_attempts: u32,
}

impl MigrationSender {
    /// Transmit a ticket and wait for the receiver's acknowledgment.
    ///
    /// Retransmits on ack timeout; the receiver's idempotency check
    /// makes retransmission safe. After `max_attempts` unacknowledged
    /// attempts the caller gets `MigrationTimeout` and the sequence
    /// stays owned by the sender.
    pub async fn send(
        &self,
        model: &ModelId,
        ticket: MigrationTicket,
        resume_tx: ResponseSender,
    ) -> Result<MigrationAck> {
        for attempt in 1..=self.max_attempts {
            let (ack_tx, ack_rx) = oneshot::channel();
            let envelope = MigrationEnvelope {
                model: model.clone(),
                ticket: ticket.clone(),
                resume_tx: resume_tx.clone(),
                ack_tx,
            };

            if self.tx.send(envelope).await.is_err() {
                // Peer gone; wait out the attempt window before the
                // next try so a restarting receiver can come back.
                warn!(
                    request = %ticket.request_id,
                    attempt,
                    "migration peer unreachable"
                );
                tokio::time::sleep(self.ack_timeout).await;
                continue;
            }

            match timeout(self.ack_timeout, ack_rx).await {
                Ok(Ok(ack)) => {
                    debug!(
                        request = %ticket.request_id,
                        outcome = ?ack.outcome,
                        attempt,
                        "migration acknowledged"
                    );
                    return Ok(ack);
                }
                Ok(Err(_)) | Err(_) => {
                    debug!(
                        request = %ticket.request_id,
                        attempt,
                        "migration ack timed out, retransmitting"
                    );
                }
            }
        }

        Err(Error::MigrationTimeout {
            request_id: ticket.request_id,
            retries: self.max_attempts,
        })
    }
}

/// Receiving half: validates, deduplicates, and applies tickets.
pub struct MigrationReceiver {
    rx: mpsc::Receiver<MigrationEnvelope>,
    applied: HashSet<(RequestId, usize)>,
}

impl MigrationReceiver {
    pub async fn recv(&mut self) -> Option<MigrationEnvelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<MigrationEnvelope> {
        self.rx.try_recv().ok()
    }

    /// Validate and apply one envelope.
    ///
    /// `admit` enqueues the resumed sequence into the local instance;
    /// its error (e.g. admission overload) turns into a `Rejected` ack
    /// and the sender keeps ownership. Duplicates and corrupt tickets
    /// are acked without calling `admit`.
    pub fn apply<F>(&mut self, envelope: MigrationEnvelope, sla: Duration, admit: F) -> Option<RequestId>
    where
        F: FnOnce(SequenceState, ResponseSender) -> Result<()>,
    {
        let MigrationEnvelope {
            ticket,
            resume_tx,
            ack_tx,
            ..
        } = envelope;
        let request_id = ticket.request_id.clone();
        let position = ticket.generation_position;

        let ack = |outcome: MigrationOutcome| MigrationAck {
            request_id: request_id.clone(),
            generation_position: position,
            outcome,
        };

        if !ticket.verify() {
            warn!(request = %request_id, "rejecting corrupt migration ticket");
            let _ = ack_tx.send(ack(MigrationOutcome::Rejected(
                Error::MigrationCorrupt {
                    request_id: request_id.clone(),
                }
                .to_string(),
            )));
            return None;
        }

        let key = ticket.idempotency_key();
        if self.applied.contains(&key) {
            debug!(request = %request_id, position, "duplicate ticket, acking without reapply");
            let _ = ack_tx.send(ack(MigrationOutcome::AlreadyApplied));
            return None;
        }

        match admit(ticket.into_sequence(sla), resume_tx) {
            Ok(()) => {
                self.applied.insert(key);
                let _ = ack_tx.send(ack(MigrationOutcome::Applied));
                Some(request_id)
            }
            Err(e) => {
                let _ = ack_tx.send(ack(MigrationOutcome::Rejected(e.to_string())));
                None
            }
        }
    }
}
