//! Peer-to-peer transport over WebRTC data channels.

mod adapter;
pub mod ice;
pub mod peer;
pub mod signaling;
mod webrtc_peer;

pub use adapter::MeshTransport;
pub use peer::{PeerConnector, PeerEvent, PeerHandle, DATA_CHANNEL_LABEL};
pub use webrtc_peer::WebRtcConnector;
