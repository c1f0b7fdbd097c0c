//! Transport implementations and the factory that picks one per session.

pub mod mesh;
pub mod relay;

pub use mesh::MeshTransport;
pub use relay::RelayTransport;

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::{SyncConfig, TransportMode};
use crate::error::SyncError;
use crate::interface::{Transport, TransportEvent};

/// Build the transport selected by the configuration.
pub fn build_transport(
    config: &SyncConfig,
) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), SyncError> {
    match config.mode {
        TransportMode::Relay => {
            let (transport, events) = RelayTransport::new(config);
            Ok((Arc::new(transport), events))
        }
        TransportMode::Mesh => {
            let (transport, events) = MeshTransport::new(config)?;
            Ok((Arc::new(transport), events))
        }
    }
}
