//! Outbound notifications for the presentation layer.

use serde::Serialize;
use tokio::sync::broadcast;

use msgtree_shared::{ChannelId, MessageId};
use msgtree_store::RecordRef;

use crate::backup::RestoreMode;
use crate::reconcile::ReconcileReport;
use crate::secrets::CredentialSource;
use crate::state::SyncPhase;
use crate::sync::SyncReport;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    SyncPhaseChanged {
        channel: ChannelId,
        phase: SyncPhase,
    },
    SyncBatchApplied {
        channel: ChannelId,
        cursor: MessageId,
        report: SyncReport,
    },
    ReconcileFinished {
        report: ReconcileReport,
    },
    RepairFinished {
        record: RecordRef,
        message_id: MessageId,
    },
    BackupCreated {
        seq: u64,
        message_id: MessageId,
    },
    RestoreStaged {
        mode: RestoreMode,
    },
    CredentialsChanged {
        source: Option<CredentialSource>,
    },
}

/// Broadcast fan-out. Publishing never waits for, nor needs, a subscriber.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::trace!(event = ?e.0, "no event subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(EngineEvent::CredentialsChanged { source: None });

        let mut rx = bus.subscribe();
        bus.emit(EngineEvent::BackupCreated {
            seq: 1,
            message_id: MessageId(9),
        });
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::BackupCreated { seq: 1, .. }
        ));
    }

    #[test]
    fn events_serialize_tagged() {
        let json = serde_json::to_value(EngineEvent::SyncPhaseChanged {
            channel: ChannelId(5),
            phase: SyncPhase::Pulling,
        })
        .unwrap();
        assert_eq!(json["event"], "sync_phase_changed");
        assert_eq!(json["phase"], "pulling");
    }
}
