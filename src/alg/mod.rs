//! C5: application-layer gateway helpers, dispatched as a capability enum
//! (`spec.md` §9 "ALG helper table: same pattern [as protocol dispatch] —
//! variants `{none, ftp, tftp, sip}`").

pub mod ftp;
pub mod tftp;

use std::net::IpAddr;

use crate::conn::{Connection, Direction};
use crate::expectation::{Expectation, ExpectationTable};
use crate::key::ConnKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgProto {
    None,
    Ftp,
    Tftp,
    /// Capability-only per `spec.md` §9 Open Question 3: declared, data
    /// model supports its wildcard-source-address expectation shape, but no
    /// control-plane command wires a SIP helper name to it.
    Sip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgError {
    Malformed,
    BounceAttempt,
}

/// Everything an ALG step needs about the packet carrying the control
/// message: the direction relative to the parent connection's forward key,
/// the advertised NAT-visible address to validate against, and a mutable
/// owned payload so literals can be rewritten in place.
pub struct AlgPacket<'a> {
    pub reply: bool,
    pub payload: &'a mut Vec<u8>,
}

/// Result of inspecting one control packet.
#[derive(Debug, Default)]
pub struct AlgOutcome {
    pub expectation: Option<Expectation>,
    /// Signed byte delta introduced by rewriting the payload, and which
    /// direction it applies to (`spec.md` §4.5 step 5).
    pub seq_skew: Option<(i32, Direction)>,
}

pub trait AlgHelper {
    fn inspect(
        &self,
        conn: &Connection,
        parent_key: &ConnKey,
        nat_active: bool,
        pkt: &mut AlgPacket,
    ) -> Result<AlgOutcome, AlgError>;
}

/// Validates an advertised literal address against the parent connection's
/// real endpoint — rejects bounce attempts (`spec.md` §4.5 step 2).
pub fn validate_advertised_addr(conn: &Connection, reply: bool, advertised: IpAddr) -> bool {
    let expected = if reply {
        conn.rev_key.src.addr
    } else {
        conn.fwd_key.src.addr
    };
    let nat_visible = if reply {
        conn.fwd_key.dst.addr
    } else {
        conn.rev_key.dst.addr
    };
    advertised == expected || advertised == nat_visible
}

pub fn record_outcome(conn: &Connection, expectations: &ExpectationTable, outcome: AlgOutcome) {
    if let Some((delta, direction)) = outcome.seq_skew {
        conn.record_seq_skew(delta, direction);
    }
    if let Some(expectation) = outcome.expectation {
        expectations.insert(expectation);
    }
}
