//! ICE candidate line parsing.
//!
//! Candidate attributes arrive through signaling as opaque strings; this
//! parser recovers enough structure to validate them and log what kind of
//! path a peer is offering before handing the line to the connection.

use crate::error::SyncError;

/// Structured view of one `candidate:` attribute line (RFC 5245 grammar,
/// mandatory fields only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateLine {
    pub foundation: String,
    pub component: u16,
    pub protocol: String,
    pub priority: u64,
    pub address: String,
    pub port: u16,
    /// Candidate type: host, srflx, prflx or relay.
    pub typ: String,
}

pub fn parse_candidate(line: &str) -> Result<CandidateLine, SyncError> {
    let line = line.strip_prefix("candidate:").unwrap_or(line);
    let mut fields = line.split_ascii_whitespace();

    let malformed = |what: &str| SyncError::ProtocolViolation(format!("ICE candidate missing {}", what));

    let foundation = fields.next().ok_or_else(|| malformed("foundation"))?.to_string();
    let component = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| malformed("component id"))?;
    let protocol = fields.next().ok_or_else(|| malformed("transport"))?.to_ascii_lowercase();
    let priority = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| malformed("priority"))?;
    let address = fields.next().ok_or_else(|| malformed("address"))?.to_string();
    let port = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| malformed("port"))?;

    match fields.next() {
        Some("typ") => {}
        _ => return Err(malformed("typ marker")),
    }
    let typ = fields.next().ok_or_else(|| malformed("candidate type"))?;
    if !matches!(typ, "host" | "srflx" | "prflx" | "relay") {
        return Err(SyncError::ProtocolViolation(format!(
            "unknown ICE candidate type {:?}",
            typ
        )));
    }

    Ok(CandidateLine {
        foundation,
        component,
        protocol,
        priority,
        address,
        port,
        typ: typ.to_string(),
    })
}
