//! Size policy enforcement.
//!
//! Two independent ceilings apply to every payload: the server-declared
//! maximum and the locally configured limit. Both must pass. Rejection is a
//! normal control-flow outcome, not a fault.

use crate::config::LocalSizeLimit;
use crate::error::{Direction, PolicyRejection};
use crate::message::PayloadKind;

/// The pair of ceilings in force for one session.
#[derive(Debug, Clone, Copy)]
pub struct SizeCeilings {
    pub server: Option<u64>,
    pub local: LocalSizeLimit,
}

impl SizeCeilings {
    pub fn new(server: Option<u64>, local: LocalSizeLimit) -> Self {
        Self { server, local }
    }

    /// The local ceiling after resolving `Inherit` against the server value.
    pub fn effective_local(&self) -> Option<u64> {
        match self.local {
            LocalSizeLimit::Inherit => self.server,
            LocalSizeLimit::Unlimited => None,
            LocalSizeLimit::Bytes(n) => Some(n),
        }
    }

    /// Validate a payload of `size` bytes against both ceilings.
    pub fn validate(
        &self,
        size: u64,
        kind: PayloadKind,
        direction: Direction,
    ) -> Result<(), PolicyRejection> {
        let server_ok = self.server.map(|max| size <= max).unwrap_or(true);
        let local_ok = self
            .effective_local()
            .map(|max| size <= max)
            .unwrap_or(true);

        if server_ok && local_ok {
            return Ok(());
        }

        Err(PolicyRejection::SizeExceeded {
            size,
            kind,
            direction,
            server_limit: limit_text(self.server),
            local_limit: local_limit_text(self.local),
        })
    }
}

fn limit_text(limit: Option<u64>) -> String {
    match limit {
        Some(n) => format!("{} bytes", n),
        None => "none".to_string(),
    }
}

fn local_limit_text(limit: LocalSizeLimit) -> String {
    match limit {
        LocalSizeLimit::Inherit => "inherited from server".to_string(),
        LocalSizeLimit::Unlimited => "unlimited".to_string(),
        LocalSizeLimit::Bytes(n) => format!("{} bytes", n),
    }
}
