//! Per-session mutable state.
//!
//! One `SyncSessionState` exists per "sync turned on" lifecycle. It is owned
//! by the orchestrator task and mutated only there; transports and callbacks
//! report in through channels instead of touching it directly.

use uuid::Uuid;

use crate::core::fingerprint::DedupGuard;
use crate::core::fragment::Reassembler;

/// Connection phase, surfaced to the supervising process as status text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    #[default]
    Idle,
    Connecting,
    Connected,
    /// Relay only: the broker has delivered at least one message on our
    /// subscription since (re)connecting.
    Subscribed,
    /// Connection lost; automatic reconnect in progress.
    Reconnecting,
    Stopped,
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Subscribed => write!(f, "Connected - Subscribed"),
            Self::Reconnecting => write!(f, "Connection lost - Reconnecting"),
            Self::Stopped => write!(f, "Disconnected"),
        }
    }
}

/// Snapshot published on the status watch channel after every state change.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncStatus {
    pub phase: ConnectionPhase,
    /// Open peer data channels (mesh mode; always 0 in relay mode).
    pub live_peers: usize,
    /// Outbound fragment progress as (sent, total).
    pub sending: Option<(usize, usize)>,
    /// Inbound fragment progress as (received, total).
    pub receiving: Option<(usize, usize)>,
    /// Last expected rejection or recoverable error, as human-readable text.
    pub last_error: Option<String>,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} | Peers: {}", self.phase, self.live_peers)?;
        if let Some((sent, total)) = self.sending {
            write!(f, " | Sending: {}/{}", sent, total)?;
        }
        if let Some((received, total)) = self.receiving {
            write!(f, " | Receiving: {}/{}", received, total)?;
        }
        if let Some(err) = &self.last_error {
            write!(f, " | {}", err)?;
        }
        Ok(())
    }
}

/// All mutable state of one sync session, single-writer by construction.
#[derive(Debug, Default)]
pub struct SyncSessionState {
    pub dedup: DedupGuard,
    pub reassembler: Reassembler,
    /// Transfer id of the fragment train currently being sent, if any.
    /// Overwritten (superseding the old train) when new content arrives.
    pub outbound_transfer: Option<Uuid>,
    /// Outstanding image clipboard writes whose OS echo events are still
    /// expected. Each inbound image write increments this; the next local
    /// image change event decrements it and is suppressed.
    pub pending_image_echoes: usize,
    /// Whether inbound files are currently staged with the writer collaborator.
    pub files_staged: bool,
    pub status: SyncStatus,
}

impl SyncSessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the in-flight outbound fragment train, if any.
    pub fn supersede_outbound(&mut self) {
        self.outbound_transfer = None;
        self.status.sending = None;
    }

    /// Full reset on teardown: buffers cleared, dedup forgotten.
    pub fn reset(&mut self) {
        self.dedup.reset();
        self.reassembler.reset();
        self.outbound_transfer = None;
        self.pending_image_echoes = 0;
        self.files_staged = false;
        self.status = SyncStatus {
            phase: ConnectionPhase::Stopped,
            ..SyncStatus::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fingerprint::Fingerprint;

    #[test]
    fn reset_clears_everything() {
        let mut state = SyncSessionState::new();
        state.dedup.mark_seen(Fingerprint::of_str("x"));
        state.outbound_transfer = Some(Uuid::new_v4());
        state.pending_image_echoes = 2;
        state.files_staged = true;
        state.status.live_peers = 3;

        state.reset();

        assert!(state.dedup.is_new(Fingerprint::of_str("x")));
        assert!(state.outbound_transfer.is_none());
        assert_eq!(state.pending_image_echoes, 0);
        assert!(!state.files_staged);
        assert_eq!(state.status.phase, ConnectionPhase::Stopped);
        assert_eq!(state.status.live_peers, 0);
    }

    #[test]
    fn status_display_includes_stats() {
        let status = SyncStatus {
            phase: ConnectionPhase::Connected,
            live_peers: 2,
            sending: Some((1, 3)),
            receiving: None,
            last_error: None,
        };
        assert_eq!(status.to_string(), "Connected | Peers: 2 | Sending: 1/3");
    }
}
