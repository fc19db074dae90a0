//! Phase-transition events for external observers.
//!
//! The engine exposes no rendering of its own. A front-end subscribes here
//! and combines the events with counter snapshots from the state manager to
//! drive progress bars or logs.

use tokio::sync::broadcast;

use crate::state::PhaseKind;

/// Events emitted by the transfer runner.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    RunStarted {
        repositories: usize,
    },
    RepoStarted {
        repo_key: String,
    },
    PhaseStarted {
        repo_key: String,
        phase: PhaseKind,
    },
    PhaseCompleted {
        repo_key: String,
        phase: PhaseKind,
    },
    RepoCompleted {
        repo_key: String,
    },
    RunCompleted {
        transferred_files: u64,
        failures: u64,
    },
}

const EVENT_CAPACITY: usize = 256;

/// Broadcast fan-out of [`TransferEvent`]s. Dropping all receivers is fine;
/// emission never fails.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<TransferEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: TransferEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let broadcaster = EventBroadcaster::new();
        let mut rx = broadcaster.subscribe();
        broadcaster.emit(TransferEvent::RepoStarted {
            repo_key: "repo1".to_string(),
        });
        match rx.recv().await.unwrap() {
            TransferEvent::RepoStarted { repo_key } => assert_eq!(repo_key, "repo1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        EventBroadcaster::new().emit(TransferEvent::RunStarted { repositories: 0 });
    }
}
