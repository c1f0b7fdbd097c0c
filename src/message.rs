//! Wire message shapes shared by both transports.
//!
//! Every shape here is a straight serde mirror of what actually travels over
//! the broker or the data channels, decoded once at the transport boundary.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Content kind carried by a sync message. Defaults to `text` when the wire
/// message omits the field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    #[default]
    Text,
    Image,
    Files,
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Image => write!(f, "image"),
            Self::Files => write!(f, "files"),
        }
    }
}

/// Fragment train bookkeeping attached to mesh frames.
///
/// All fragments of one logical payload share an `id`; `index` runs 0-based up
/// to `total_fragments - 1`. `combined_raw_payload_size_in_bytes` is the size
/// of the payload before encryption and fragmentation, so a receiver can
/// reject an oversized transfer before buffering anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentMetadata {
    pub id: Uuid,
    pub is_fragmented: bool,
    pub index: usize,
    pub total_fragments: usize,
    pub combined_raw_payload_size_in_bytes: u64,
}

/// One framed clipboard message.
///
/// Relay mode serializes this without `metadata` (`{"payload","type"}`); mesh
/// mode always attaches metadata, `null` for unfragmented messages sent by
/// older peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub payload: String,
    #[serde(rename = "type", default)]
    pub kind: PayloadKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FragmentMetadata>,
}

impl SyncMessage {
    pub fn new(payload: String, kind: PayloadKind) -> Self {
        Self {
            payload,
            kind,
            metadata: None,
        }
    }

    pub fn transfer_id(&self) -> Option<Uuid> {
        self.metadata.as_ref().map(|m| m.id)
    }

    /// Whether this frame is part of a multi-fragment train.
    pub fn is_fragmented(&self) -> bool {
        self.metadata
            .as_ref()
            .map(|m| m.is_fragmented)
            .unwrap_or(false)
    }
}

/// An SDP description relayed through the signaling server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

/// An ICE candidate as it appears in signaling JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateJson {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// Messages exchanged with the mesh rendezvous (signaling) server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalMessage {
    /// The server hands this node its room-scoped identifier.
    #[serde(rename = "ASSIGNED_ID")]
    AssignedId {
        #[serde(rename = "peerId")]
        peer_id: String,
    },

    /// Full roster snapshot. Reconcile, do not diff.
    #[serde(rename = "PEER_LIST")]
    PeerList { peers: Vec<String> },

    #[serde(rename = "OFFER")]
    Offer {
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        #[serde(rename = "toPeerId")]
        to_peer_id: String,
        offer: SessionDescription,
    },

    #[serde(rename = "ANSWER")]
    Answer {
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        #[serde(rename = "toPeerId")]
        to_peer_id: String,
        answer: SessionDescription,
    },

    #[serde(rename = "ICE_CANDIDATE")]
    IceCandidate {
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        #[serde(rename = "toPeerId")]
        to_peer_id: String,
        candidate: IceCandidateJson,
    },
}
