//! Unified error type system for the synchronization engine.
//!
//! Errors are organized by how the session must react to them, not by the
//! module they come from:
//!
//! - `PolicyRejection`: expected control-flow outcomes, the pipeline simply
//!   stops for that item
//! - `TransientNetwork`: recovered via automatic reconnect
//! - `Decode`: recoverable per-message, the message is discarded
//! - `ProtocolViolation`: in-progress transfer state is discarded
//! - `FatalSetup`: the only class that terminates the session outright

use thiserror::Error;
use uuid::Uuid;

use crate::message::PayloadKind;

/// Engine error taxonomy.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    PolicyRejection(#[from] PolicyRejection),

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("fatal setup error: {0}")]
    FatalSetup(String),
}

impl SyncError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientNetwork(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::FatalSetup(msg.into())
    }

    /// Whether the running session survives this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::FatalSetup(_))
    }
}

/// Direction of a payload through the pipeline, for policy reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Outbound => write!(f, "outbound"),
            Direction::Inbound => write!(f, "inbound"),
        }
    }
}

/// Expected, non-fatal rejections. Surfaced as status text, never as a fault.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyRejection {
    #[error(
        "{direction} {kind} content of {size} bytes exceeds the allowed size \
         (server limit: {server_limit}, local limit: {local_limit})"
    )]
    SizeExceeded {
        size: u64,
        kind: PayloadKind,
        direction: Direction,
        server_limit: String,
        local_limit: String,
    },

    #[error("{kind} sharing is disabled on this device")]
    SharingDisabled { kind: PayloadKind },
}

/// Per-message decode failures. The message is discarded, the session continues.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    /// The payload did not parse as an encrypted envelope. Almost always means
    /// the cipher is enabled here but disabled on the sending device.
    #[error("encryption mismatch: enable the cipher on all devices, or on none")]
    EncryptionMismatch,

    #[error("decryption failed (bad key or tampered ciphertext)")]
    DecryptFailed,

    #[error("one or more fragments missing in transfer {transfer_id}")]
    MissingFragments { transfer_id: Uuid },
}
