//! Content fingerprinting and the dedup guard.
//!
//! The fingerprint is a fast non-cryptographic hash over the canonical payload
//! string (plaintext text, base64 image, JSON file map). It is used purely for
//! change detection; integrity comes from the cipher's authentication tag.

use twox_hash::xxh3::hash64;

/// Short content fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        Fingerprint(hash64(bytes))
    }

    pub fn of_str(s: &str) -> Self {
        Self::of(s.as_bytes())
    }
}

/// Single-slot last-seen guard, shared by the outbound and inbound paths.
///
/// Sharing one slot across both directions is the loop breaker: when a remote
/// payload is applied to the local clipboard, its fingerprint becomes the
/// last-seen value, so the OS change event fired by that write is recognized
/// as already seen and never re-transmitted.
///
/// Callers must not yield between [`is_new`](Self::is_new) and
/// [`mark_seen`](Self::mark_seen); the orchestrator's single-writer loop makes
/// [`check_and_mark`](Self::check_and_mark) effectively atomic.
#[derive(Debug, Default)]
pub struct DedupGuard {
    last_seen: Option<Fingerprint>,
}

impl DedupGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_new(&self, fp: Fingerprint) -> bool {
        self.last_seen != Some(fp)
    }

    pub fn mark_seen(&mut self, fp: Fingerprint) {
        self.last_seen = Some(fp);
    }

    /// Returns true (and records the fingerprint) if the content is new.
    pub fn check_and_mark(&mut self, fp: Fingerprint) -> bool {
        if self.is_new(fp) {
            self.mark_seen(fp);
            true
        } else {
            false
        }
    }

    /// Forget the last-seen value. Called on session teardown.
    pub fn reset(&mut self) {
        self.last_seen = None;
    }
}
