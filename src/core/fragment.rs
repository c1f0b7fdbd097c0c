//! Payload fragmentation and reassembly.
//!
//! Data channels cap frame sizes, so oversized payloads travel as an ordered
//! train of fragments sharing one transfer id. The receiver keeps at most one
//! in-progress buffer: a fragment carrying a new transfer id discards any
//! incomplete prior state (latest payload wins, same as the clipboard itself).

use log::debug;
use uuid::Uuid;

use crate::core::size_policy::SizeCeilings;
use crate::error::{DecodeError, Direction, SyncError};
use crate::message::{FragmentMetadata, PayloadKind, SyncMessage};

/// Split a string into chunks of at most `max_bytes` bytes, never splitting a
/// multi-byte code point. A chunk may exceed `max_bytes` only when a single
/// code point is wider than the budget.
pub fn split_utf8(s: &str, max_bytes: usize) -> Vec<&str> {
    assert!(max_bytes > 0, "fragment size must be non-zero");

    let mut chunks = Vec::new();
    let mut rest = s;
    while !rest.is_empty() {
        if rest.len() <= max_bytes {
            chunks.push(rest);
            break;
        }
        let mut cut = max_bytes;
        while cut > 0 && !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            // A single code point wider than the budget; emit it whole.
            cut = rest
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
        }
        let (chunk, tail) = rest.split_at(cut);
        chunks.push(chunk);
        rest = tail;
    }
    chunks
}

/// One logical payload prepared for transmission as a fragment train.
#[derive(Debug, Clone)]
pub struct OutboundTransfer {
    pub id: Uuid,
    pub frames: Vec<SyncMessage>,
}

impl OutboundTransfer {
    pub fn total_fragments(&self) -> usize {
        self.frames.len()
    }
}

/// Split an (already encrypted, if the cipher is on) payload string into
/// frames. `raw_size` is the payload size before encryption, which receivers
/// check against their ceilings before buffering.
pub fn fragment(
    payload: String,
    kind: PayloadKind,
    raw_size: u64,
    fragment_size: usize,
) -> OutboundTransfer {
    let id = Uuid::new_v4();
    let pieces = split_utf8(&payload, fragment_size);
    let total = pieces.len().max(1);

    let frames = if pieces.is_empty() {
        // Empty payload still travels as one (empty) frame.
        vec![make_frame(String::new(), kind, id, 0, total, raw_size)]
    } else {
        pieces
            .into_iter()
            .enumerate()
            .map(|(index, piece)| make_frame(piece.to_string(), kind, id, index, total, raw_size))
            .collect()
    };

    OutboundTransfer { id, frames }
}

fn make_frame(
    payload: String,
    kind: PayloadKind,
    id: Uuid,
    index: usize,
    total: usize,
    raw_size: u64,
) -> SyncMessage {
    SyncMessage {
        payload,
        kind,
        metadata: Some(FragmentMetadata {
            id,
            is_fragmented: total > 1,
            index,
            total_fragments: total,
            combined_raw_payload_size_in_bytes: raw_size,
        }),
    }
}

/// Result of feeding one inbound frame to the reassembler.
#[derive(Debug)]
pub enum ReassemblyOutcome {
    /// The logical payload is complete (metadata stripped).
    Complete(SyncMessage),
    /// Fragment stored; more are expected.
    Buffered { received: usize, total: usize },
}

#[derive(Debug)]
struct ReassemblyBuffer {
    transfer_id: Uuid,
    kind: PayloadKind,
    slots: Vec<Option<String>>,
    received: usize,
}

/// Single-buffer reassembler with a superseding policy.
#[derive(Debug, Default)]
pub struct Reassembler {
    in_progress: Option<ReassemblyBuffer>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Progress of the in-flight transfer as `(received, total)`.
    pub fn progress(&self) -> Option<(usize, usize)> {
        self.in_progress
            .as_ref()
            .map(|b| (b.received, b.slots.len()))
    }

    /// Drop any in-progress buffer. Called on errors and session teardown.
    pub fn reset(&mut self) {
        self.in_progress = None;
    }

    /// Feed one inbound frame.
    ///
    /// Non-fragmented frames bypass buffering entirely. The advertised
    /// combined size is checked against `ceilings` before any buffering, so a
    /// malicious transfer cannot grow the buffer first.
    pub fn accept(
        &mut self,
        msg: SyncMessage,
        ceilings: &SizeCeilings,
    ) -> Result<ReassemblyOutcome, SyncError> {
        let metadata = match &msg.metadata {
            Some(m) if m.is_fragmented => m.clone(),
            _ => {
                let mut whole = msg;
                whole.metadata = None;
                return Ok(ReassemblyOutcome::Complete(whole));
            }
        };

        if let Err(rejection) = ceilings.validate(
            metadata.combined_raw_payload_size_in_bytes,
            msg.kind,
            Direction::Inbound,
        ) {
            self.reset();
            return Err(rejection.into());
        }

        if metadata.total_fragments == 0 || metadata.index >= metadata.total_fragments {
            self.reset();
            return Err(SyncError::ProtocolViolation(format!(
                "fragment index {} outside train of {}",
                metadata.index, metadata.total_fragments
            )));
        }

        let same_transfer = self
            .in_progress
            .as_ref()
            .map(|b| b.transfer_id == metadata.id)
            .unwrap_or(false);
        if !same_transfer {
            // New transfer id supersedes whatever was in flight.
            if let Some(old) = &self.in_progress {
                debug!(
                    "discarding incomplete transfer {} ({} of {} fragments)",
                    old.transfer_id,
                    old.received,
                    old.slots.len()
                );
            }
            self.in_progress = Some(ReassemblyBuffer {
                transfer_id: metadata.id,
                kind: msg.kind,
                slots: vec![None; metadata.total_fragments],
                received: 0,
            });
        }
        let buffer = self.in_progress.as_mut().expect("buffer just ensured");

        if buffer.slots.len() != metadata.total_fragments {
            let transfer_id = buffer.transfer_id;
            self.reset();
            return Err(SyncError::ProtocolViolation(format!(
                "transfer {} changed its fragment count",
                transfer_id
            )));
        }

        if buffer.slots[metadata.index].is_none() {
            buffer.received += 1;
        }
        buffer.slots[metadata.index] = Some(msg.payload);

        if metadata.index == metadata.total_fragments - 1 {
            // Final index: every slot must be filled.
            if buffer.slots.iter().any(|s| s.is_none()) {
                let transfer_id = buffer.transfer_id;
                self.reset();
                return Err(DecodeError::MissingFragments { transfer_id }.into());
            }
            let buffer = self.in_progress.take().unwrap();
            let payload: String = buffer.slots.into_iter().map(|s| s.unwrap()).collect();
            return Ok(ReassemblyOutcome::Complete(SyncMessage::new(
                payload,
                buffer.kind,
            )));
        }

        Ok(ReassemblyOutcome::Buffered {
            received: buffer.received,
            total: metadata.total_fragments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalSizeLimit;

    fn no_limits() -> SizeCeilings {
        SizeCeilings::new(None, LocalSizeLimit::Unlimited)
    }

    fn reassemble_all(frames: Vec<SyncMessage>) -> SyncMessage {
        let mut reassembler = Reassembler::new();
        let mut complete = None;
        for frame in frames {
            match reassembler.accept(frame, &no_limits()).unwrap() {
                ReassemblyOutcome::Complete(msg) => complete = Some(msg),
                ReassemblyOutcome::Buffered { .. } => {}
            }
        }
        complete.expect("transfer never completed")
    }

    #[test]
    fn split_respects_byte_budget_and_boundaries() {
        let s = "aあいうえおbかきくけこ"; // 3-byte kana mixed with ASCII
        for max in 1..=16 {
            let chunks = split_utf8(s, max);
            assert_eq!(chunks.concat(), s, "lossless at max={}", max);
            for chunk in &chunks {
                assert!(
                    chunk.len() <= max || chunk.chars().count() == 1,
                    "chunk {:?} exceeds {} bytes",
                    chunk,
                    max
                );
            }
        }
    }

    #[test]
    fn forty_kib_payload_makes_three_fragments() {
        let payload = "x".repeat(40 * 1024);
        let transfer = fragment(payload.clone(), PayloadKind::Text, 40 * 1024, 15 * 1024);
        assert_eq!(transfer.total_fragments(), 3);
        for (i, frame) in transfer.frames.iter().enumerate() {
            let m = frame.metadata.as_ref().unwrap();
            assert_eq!(m.index, i);
            assert_eq!(m.total_fragments, 3);
            assert!(m.is_fragmented);
            assert_eq!(m.combined_raw_payload_size_in_bytes, 40 * 1024);
        }
        let joined = reassemble_all(transfer.frames);
        assert_eq!(joined.payload, payload);
    }

    #[test]
    fn small_payload_is_single_unfragmented_frame() {
        let transfer = fragment("hi".into(), PayloadKind::Text, 2, 15 * 1024);
        assert_eq!(transfer.total_fragments(), 1);
        assert!(!transfer.frames[0].metadata.as_ref().unwrap().is_fragmented);
    }

    #[test]
    fn round_trip_multibyte_payloads() {
        let payload = "日本語テキスト🦀".repeat(2000);
        let transfer = fragment(
            payload.clone(),
            PayloadKind::Text,
            payload.len() as u64,
            1000,
        );
        assert!(transfer.total_fragments() > 1);
        let joined = reassemble_all(transfer.frames);
        assert_eq!(joined.payload, payload);
    }

    #[test]
    fn new_transfer_id_supersedes_in_progress_buffer() {
        let a = fragment("a".repeat(40_000), PayloadKind::Text, 40_000, 15_000);
        let b = fragment("b".repeat(40_000), PayloadKind::Text, 40_000, 15_000);

        let mut reassembler = Reassembler::new();
        // Two of three fragments of A...
        for frame in a.frames.iter().take(2).cloned() {
            reassembler.accept(frame, &no_limits()).unwrap();
        }
        // ...then B arrives in full. A must never be emitted.
        let mut completed = Vec::new();
        for frame in b.frames.clone() {
            if let ReassemblyOutcome::Complete(msg) =
                reassembler.accept(frame, &no_limits()).unwrap()
            {
                completed.push(msg);
            }
        }
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].payload, "b".repeat(40_000));

        // A's late final fragment alone cannot complete A either.
        let late = a.frames.last().unwrap().clone();
        assert!(reassembler.accept(late, &no_limits()).is_err());
    }

    #[test]
    fn missing_fragment_is_reported_and_buffer_cleared() {
        let transfer = fragment("z".repeat(50_000), PayloadKind::Text, 50_000, 15_000);
        let mut reassembler = Reassembler::new();
        // Skip fragment 1, deliver the final one.
        reassembler
            .accept(transfer.frames[0].clone(), &no_limits())
            .unwrap();
        let err = reassembler
            .accept(transfer.frames.last().unwrap().clone(), &no_limits())
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Decode(DecodeError::MissingFragments { .. })
        ));
        assert!(reassembler.progress().is_none());
    }

    #[test]
    fn oversized_advertised_transfer_rejected_before_buffering() {
        let ceilings = SizeCeilings::new(None, LocalSizeLimit::Bytes(1024));
        let transfer = fragment("q".repeat(40_000), PayloadKind::Text, 40_000, 15_000);
        let mut reassembler = Reassembler::new();
        let err = reassembler
            .accept(transfer.frames[0].clone(), &ceilings)
            .unwrap_err();
        assert!(matches!(err, SyncError::PolicyRejection(_)));
        assert!(reassembler.progress().is_none());
    }

    #[test]
    fn non_fragmented_message_bypasses_buffering() {
        let mut reassembler = Reassembler::new();
        let msg = SyncMessage::new("plain".into(), PayloadKind::Text);
        match reassembler.accept(msg, &no_limits()).unwrap() {
            ReassemblyOutcome::Complete(out) => assert_eq!(out.payload, "plain"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn out_of_range_index_is_a_protocol_violation() {
        let mut frame = fragment("x".repeat(40_000), PayloadKind::Text, 40_000, 15_000)
            .frames
            .remove(0);
        frame.metadata.as_mut().unwrap().index = 99;
        let mut reassembler = Reassembler::new();
        let err = reassembler.accept(frame, &no_limits()).unwrap_err();
        assert!(matches!(err, SyncError::ProtocolViolation(_)));
    }
}
