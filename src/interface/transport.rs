//! The transport capability interface.
//!
//! Relay and mesh are two implementations of one contract; the orchestrator
//! is written once against it and picks an implementation at session start.

use async_trait::async_trait;

use crate::error::SyncError;
use crate::message::SyncMessage;

/// Events a transport reports back to the orchestrator. All inbound frames
/// and connectivity changes funnel through one channel so session state stays
/// single-writer.
#[derive(Debug)]
pub enum TransportEvent {
    /// Connection established. `restored` is true when this follows a loss
    /// within the same session.
    Connected { restored: bool },
    /// Relay only: the broker delivered a message on our subscription.
    Subscribed,
    /// One framed inbound message (a whole payload, or one fragment).
    Frame(SyncMessage),
    /// Mesh only: the number of open peer data channels changed.
    PeerCountChanged(usize),
    /// Connection lost; the transport will retry on its own.
    ConnectionLost,
    /// The transport cannot operate at all; the session must stop.
    Fatal(String),
}

/// One logical connection to the rest of the fleet.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection and begin delivering events. Returns once the
    /// initial connection attempt has concluded; later drops are handled by
    /// the transport's own reconnect loop.
    async fn start(&self) -> Result<(), SyncError>;

    /// Send one framed message to the fleet. Transports may drop the frame as
    /// deliberate backpressure (relay) or deliver best-effort (mesh).
    async fn send(&self, frame: SyncMessage) -> Result<(), SyncError>;

    /// Frame size cap, if this transport needs payloads fragmented.
    fn max_frame_size(&self) -> Option<usize>;

    /// Manual reconnect request; a no-op while an automatic reconnect is
    /// already in flight.
    async fn reconnect(&self);

    /// Tear down all connections without triggering automatic reconnects.
    async fn stop(&self);
}
