//! Canonical payload string encoding.
//!
//! Everything travels as one string: plaintext for text, base64 for images,
//! and a JSON object of `file name -> base64 content` for file sets. The
//! fingerprint is computed over this canonical form on both directions.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use std::collections::BTreeMap;

use crate::error::DecodeError;

pub fn encode_image(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_image(payload: &str) -> Result<Bytes, DecodeError> {
    Ok(Bytes::from(BASE64.decode(payload)?))
}

/// Encode a file set. `BTreeMap` keeps the JSON deterministic so identical
/// file sets always fingerprint identically.
pub fn encode_files(files: &BTreeMap<String, Bytes>) -> String {
    let encoded: BTreeMap<&str, String> = files
        .iter()
        .map(|(name, content)| (name.as_str(), BASE64.encode(content)))
        .collect();
    serde_json::to_string(&encoded).expect("file map serialization")
}

pub fn decode_files(payload: &str) -> Result<BTreeMap<String, Bytes>, DecodeError> {
    let encoded: BTreeMap<String, String> = serde_json::from_str(payload)?;
    encoded
        .into_iter()
        .map(|(name, content)| Ok((name, Bytes::from(BASE64.decode(content)?))))
        .collect()
}
