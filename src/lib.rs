//! Clipboard synchronization engine.
//!
//! The engine keeps clipboards in sync across a fleet of devices over one of
//! two interchangeable transports: a broker-relayed topology (STOMP over
//! WebSocket) or a direct peer-to-peer mesh (WebRTC data channels with a
//! signaling server for introductions).
//!
//! The embedding application supplies the platform pieces (clipboard access,
//! file resolution, notifications) behind the traits in [`interface`], builds
//! a [`SyncEngine`] and feeds it clipboard change events; everything else,
//! from loop suppression to encryption and fragmentation, happens inside.
//!
//! ```no_run
//! use std::sync::Arc;
//! use clipcascade_sync::{SyncEngine, SyncConfig, TransportMode};
//! # use clipcascade_sync::interface::ClipboardWriter;
//! # async fn example(clipboard: Arc<dyn ClipboardWriter>) -> anyhow::Result<()> {
//! let config = SyncConfig::new(TransportMode::Relay, "ws://broker:8080/clipsocket");
//! let engine = SyncEngine::builder()
//!     .config(config)
//!     .clipboard(clipboard)
//!     .build()?;
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod interface;
pub mod message;
pub mod orchestrator;
pub mod transport;

pub use config::{LocalSizeLimit, SyncConfig, TransportMode};
pub use crate::core::cipher::{derive_session_key, SessionKey, DEFAULT_HASH_ROUNDS};
pub use crate::core::session::{ConnectionPhase, SyncStatus};
pub use error::{DecodeError, PolicyRejection, SyncError};
pub use message::{FragmentMetadata, PayloadKind, SignalMessage, SyncMessage};
pub use orchestrator::{SyncEngine, SyncEngineBuilder};
