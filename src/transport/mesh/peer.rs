//! Peer connection seam.
//!
//! The mesh control loop is written against these traits so roster handling,
//! the offer tie-break and broadcast fan-out can be exercised without real
//! network sockets.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::message::{IceCandidateJson, SessionDescription, SyncMessage};

/// Label of the single data channel carried by every peer connection.
pub const DATA_CHANNEL_LABEL: &str = "cliptext";

/// Events one peer connection reports to the mesh control loop.
#[derive(Debug)]
pub enum PeerEvent {
    ChannelOpen { peer_id: String },
    ChannelClosed { peer_id: String },
    Message { peer_id: String, message: SyncMessage },
    /// A locally gathered ICE candidate, to be relayed through signaling.
    LocalCandidate {
        peer_id: String,
        candidate: IceCandidateJson,
    },
}

/// One live (or connecting) peer.
#[async_trait]
pub trait PeerHandle: Send + Sync {
    /// Initiator side: produce the local offer.
    async fn create_offer(&self) -> Result<SessionDescription, SyncError>;

    /// Responder side: apply the remote offer and produce the answer.
    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, SyncError>;

    /// Initiator side: apply the remote answer.
    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), SyncError>;

    async fn add_remote_candidate(&self, candidate: IceCandidateJson) -> Result<(), SyncError>;

    /// Send one frame over the data channel. Callers must only invoke this
    /// after `ChannelOpen` for the peer.
    async fn send(&self, message: &SyncMessage) -> Result<(), SyncError>;

    async fn close(&self);
}

/// Creates peer connections. The production implementation is WebRTC; tests
/// substitute an in-memory one.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Open a new connection toward `peer_id`. When `initiator` is true this
    /// side creates the data channel and will offer; otherwise it waits for
    /// the remote channel.
    async fn connect_peer(
        &self,
        peer_id: &str,
        initiator: bool,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerHandle>, SyncError>;
}
