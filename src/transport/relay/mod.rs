//! Broker-relayed transport (STOMP over WebSocket).

mod adapter;
pub mod frame;

pub use adapter::RelayTransport;
