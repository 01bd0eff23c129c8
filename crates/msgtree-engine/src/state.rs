//! Process-scoped engine state shared by every component.
//!
//! [`EngineState`] replaces ambient globals: the connected remote, the
//! per-channel sync status board, the restart-pending flag and the event bus
//! all live here and are passed around behind an `Arc`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use msgtree_shared::ChannelId;

use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::remote::RemoteClient;
use crate::sync::SyncReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Pulling,
    Applying,
    Error,
}

/// Status of one channel as shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStatus {
    pub phase: SyncPhase,
    pub last_report: Option<SyncReport>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Idle,
            last_report: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

pub struct EngineState {
    remote: RwLock<Option<Arc<dyn RemoteClient>>>,
    board: RwLock<HashMap<ChannelId, ChannelStatus>>,
    restart_pending: AtomicBool,
    events: EventBus,
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new(EventBus::default())
    }
}

impl EngineState {
    pub fn new(events: EventBus) -> Self {
        Self {
            remote: RwLock::new(None),
            board: RwLock::new(HashMap::new()),
            restart_pending: AtomicBool::new(false),
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ------------------------------------------------------------------
    // Remote handle
    // ------------------------------------------------------------------

    pub fn set_remote(&self, remote: Arc<dyn RemoteClient>) {
        *self.remote.write() = Some(remote);
    }

    pub fn disconnect(&self) {
        *self.remote.write() = None;
    }

    pub fn is_connected(&self) -> bool {
        self.remote.read().is_some()
    }

    pub fn remote(&self) -> Result<Arc<dyn RemoteClient>> {
        self.remote.read().clone().ok_or(EngineError::NotConnected)
    }

    // ------------------------------------------------------------------
    // Restart gate
    // ------------------------------------------------------------------

    pub fn mark_restart_pending(&self) {
        self.restart_pending.store(true, Ordering::SeqCst);
    }

    pub fn restart_pending(&self) -> bool {
        self.restart_pending.load(Ordering::SeqCst)
    }

    /// Fail with `RestartRequired` once a restore has been staged.
    pub fn ensure_live(&self) -> Result<()> {
        if self.restart_pending() {
            return Err(EngineError::RestartRequired);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sync status board
    // ------------------------------------------------------------------

    pub fn set_phase(&self, channel: ChannelId, phase: SyncPhase) {
        {
            let mut board = self.board.write();
            let status = board.entry(channel).or_default();
            if status.phase == phase {
                return;
            }
            status.phase = phase;
            status.updated_at = Utc::now();
        }
        tracing::debug!(channel = %channel, ?phase, "sync phase changed");
        self.events.emit(EngineEvent::SyncPhaseChanged { channel, phase });
    }

    pub fn record_report(&self, channel: ChannelId, report: SyncReport) {
        let mut board = self.board.write();
        let status = board.entry(channel).or_default();
        status.last_report = Some(report);
        status.last_error = None;
        status.updated_at = Utc::now();
    }

    pub fn record_error(&self, channel: ChannelId, error: &EngineError) {
        let mut board = self.board.write();
        let status = board.entry(channel).or_default();
        status.last_error = Some(error.to_string());
        status.updated_at = Utc::now();
    }

    pub fn status(&self, channel: ChannelId) -> ChannelStatus {
        self.board.read().get(&channel).cloned().unwrap_or_default()
    }

    pub fn board(&self) -> HashMap<ChannelId, ChannelStatus> {
        self.board.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_gate() {
        let state = EngineState::default();
        assert!(state.ensure_live().is_ok());
        state.mark_restart_pending();
        assert!(matches!(state.ensure_live(), Err(EngineError::RestartRequired)));
    }

    #[tokio::test]
    async fn phase_changes_are_published_once() {
        let state = EngineState::default();
        let mut rx = state.events().subscribe();
        let ch = ChannelId(3);

        state.set_phase(ch, SyncPhase::Pulling);
        state.set_phase(ch, SyncPhase::Pulling);
        state.set_phase(ch, SyncPhase::Idle);

        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::SyncPhaseChanged { phase: SyncPhase::Pulling, .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::SyncPhaseChanged { phase: SyncPhase::Idle, .. }
        ));
        assert_eq!(state.status(ch).phase, SyncPhase::Idle);
    }

    #[test]
    fn remote_is_required() {
        let state = EngineState::default();
        assert!(!state.is_connected());
        assert!(matches!(state.remote(), Err(EngineError::NotConnected)));
    }
}
