//! C3: per-protocol state machinery, modeled as a capability interface
//! (`spec.md` §9 "function-pointer protocol dispatch") instead of the
//! original's `ct_l4_proto[]` table of C function pointers.

pub mod icmp;
pub mod tcp;
pub mod udp;

use crate::config::TimeoutPolicy;
use crate::conn::Connection;
use crate::key::ConnKey;

/// Outcome of feeding one packet through a protocol FSM (`spec.md` §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    Valid,
    Invalid,
    /// The packet starts a fresh handshake; the orchestrator force-expires
    /// any stale connection and recreates (`spec.md` §4.8 step 5, §9 Open
    /// Question 1).
    New,
    /// A SYN retransmit or equivalent that must not recycle existing state.
    ValidNew,
}

/// `{valid_new, new_conn, conn_update}` — the capability interface named in
/// `spec.md` §9, implemented per L4 protocol in this module's siblings.
pub trait L4Handler {
    /// Cheap structural check run before a connection is created at all —
    /// rejects e.g. a bare ACK trying to start a TCP flow.
    fn valid_new(&self, pkt: &PacketL4) -> bool;

    /// Build a fresh connection record's protocol-specific scratch state and
    /// return the initial timeout in milliseconds.
    fn new_conn(&self, pkt: &PacketL4, policy: &TimeoutPolicy) -> i64;

    /// Feed one packet to an existing connection's FSM.
    fn conn_update(
        &self,
        conn: &Connection,
        pkt: &PacketL4,
        reply: bool,
        now_ms: i64,
        policy: &TimeoutPolicy,
    ) -> UpdateResult;
}

/// The L4 fields the FSMs need, decoded by the (out-of-scope) packet-parsing
/// layer and handed in alongside the extracted [`ConnKey`].
#[derive(Debug, Clone, Copy)]
pub struct PacketL4 {
    pub key: ConnKey,
    pub tcp: Option<TcpHeader>,
    pub icmp_is_reply: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TcpHeader {
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
    pub wscale: u8,
    pub flags: TcpFlags,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}
