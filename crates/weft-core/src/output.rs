//! Per-request response streams.

use tokio::sync::mpsc;

use crate::types::{DeviceId, RequestId, TokenId};

/// Events delivered on a request's response stream.
///
/// `Finished`, `Failed` and `Cancelled` are terminal; everything else
/// may repeat. A failed request always observes an explicit terminal
/// event, never a silent hang.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    Token {
        request_id: RequestId,
        token: TokenId,
        /// Token position after appending (prompt + generated).
        position: usize,
    },
    /// The request's state moved to another device; generation resumes
    /// there on the same stream.
    Migrated {
        request_id: RequestId,
        device: DeviceId,
    },
    /// A migration attempt failed; generation continues locally.
    MigrationFailed {
        request_id: RequestId,
        error: String,
    },
    Finished {
        request_id: RequestId,
        tokens_generated: usize,
    },
    Failed {
        request_id: RequestId,
        error: String,
    },
    Cancelled {
        request_id: RequestId,
    },
}

impl ResponseEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResponseEvent::Finished { .. }
                | ResponseEvent::Failed { .. }
                | ResponseEvent::Cancelled { .. }
        )
    }
}

/// Sender half, held by the owning model instance (and forwarded with
/// the sequence on migration).
pub type ResponseSender = mpsc::UnboundedSender<ResponseEvent>;

/// Receiver half returned to the submitter.
#[derive(Debug)]
pub struct ResponseStream {
    rx: mpsc::UnboundedReceiver<ResponseEvent>,
}

impl ResponseStream {
    pub async fn next(&mut self) -> Option<ResponseEvent> {
        self.rx.recv().await
    }

    /// Non-blocking poll; None when no event is queued right now.
    pub fn try_next(&mut self) -> Option<ResponseEvent> {
        self.rx.try_recv().ok()
    }

    /// Collect every event up to and including the terminal one.
    pub async fn drain(&mut self) -> Vec<ResponseEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }
}

pub fn channel() -> (ResponseSender, ResponseStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, ResponseStream { rx })
}
