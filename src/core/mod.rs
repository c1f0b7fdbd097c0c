//! Transport-independent pieces of the synchronization pipeline.

pub mod cipher;
pub mod content;
pub mod fingerprint;
pub mod fragment;
pub mod session;
pub mod size_policy;

pub use cipher::{derive_session_key, EncryptedEnvelope, SessionKey};
pub use fingerprint::{DedupGuard, Fingerprint};
pub use fragment::{fragment, split_utf8, OutboundTransfer, Reassembler, ReassemblyOutcome};
pub use session::{ConnectionPhase, SyncSessionState, SyncStatus};
pub use size_policy::SizeCeilings;
