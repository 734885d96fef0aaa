//! The per-flow record (`spec.md` §3 "Connection") and the lightweight
//! key-node entries the flow table indexes it by.
//!
//! Grounded in the reference project's `proxy/nat.rs` `NatEntry` (atomic
//! last-active timestamp, cheap `Arc` sharing) and `app/tracker.rs`
//! (separating hot atomic counters from a mutex-guarded scratch area).

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::key::{ConnKey, L4Proto};
use crate::nat::NatAction;
use crate::proto::tcp::TcpScratch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// One of a connection's (up to) two table entries. Cheap to clone — it only
/// carries the key, the direction tag, and a back-reference to the shared
/// connection record (`spec.md` §9 "intrusive key-nodes embedded twice").
#[derive(Clone)]
pub struct KeyNode {
    pub key: ConnKey,
    pub direction: Direction,
    pub conn: Arc<Connection>,
}

/// Direction and accumulated byte delta of an FTP/TFTP payload rewrite
/// (`spec.md` §4.5 step 5, §8 invariant 7).
#[derive(Debug, Clone, Copy, Default)]
pub struct SeqSkew {
    pub bytes: i32,
    pub direction: Option<Direction>,
}

impl SeqSkew {
    fn accumulate(&mut self, delta: i32, direction: Direction) {
        self.bytes += delta;
        self.direction = Some(direction);
    }
}

/// ALG bookkeeping: which helper is attached, whether this flow itself was
/// spawned from an expectation, and (for FTP) the parent key + seq skew.
#[derive(Debug, Clone, Default)]
pub struct AlgState {
    pub alg_related: bool,
    pub parent_key: Option<ConnKey>,
    pub seq_skew: SeqSkew,
}

/// Mutable scratch guarded by the connection's fine-grained mutex — the only
/// fields a packet handler touches after the initial lookup (`spec.md` §3,
/// §5 "connection mutex").
#[derive(Debug, Default)]
pub struct ConnInner {
    pub mark: u32,
    pub label: u128,
    pub tcp: Option<TcpScratch>,
    pub alg: AlgState,
}

/// Protocol liveness state shared by UDP/other/ICMP (`spec.md` §4.3); TCP's
/// richer state lives in [`TcpScratch`] inside [`ConnInner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimpleLiveness {
    Unreplied,
    Replied,
    Established,
}

pub struct Connection {
    pub fwd_key: ConnKey,
    pub rev_key: ConnKey,
    pub nat_active: bool,
    /// The `NatDirective.action` bits used at allocation time, stored so
    /// ct-state SRC_NAT/DST_NAT classification reflects what was actually
    /// requested rather than an address-equality heuristic. Empty when
    /// `nat_active` is false.
    nat_action: AtomicU16,
    pub l4_proto: L4Proto,

    pub zone: u16,
    pub admit_zone_generation: u64,
    pub timeout_policy_id: u32,

    /// Monotonic deadline in milliseconds; only ever decreased via
    /// `force_expire`, otherwise advanced by protocol FSM updates
    /// (`spec.md` §3 invariant 5).
    pub expiration_ms: AtomicI64,
    /// Compare-and-set exactly-once cleanup flag (`spec.md` §9).
    pub reclaimed: AtomicBool,

    pub liveness: Mutex<SimpleLiveness>,
    pub created_zone_count_generation: AtomicU32,

    pub inner: Mutex<ConnInner>,
}

impl Connection {
    pub fn new(
        fwd_key: ConnKey,
        rev_key: ConnKey,
        nat_active: bool,
        zone: u16,
        admit_zone_generation: u64,
        timeout_policy_id: u32,
        now_ms: i64,
        initial_timeout_ms: i64,
    ) -> Connection {
        Connection {
            l4_proto: fwd_key.l4_proto,
            fwd_key,
            rev_key,
            nat_active,
            nat_action: AtomicU16::new(0),
            zone,
            admit_zone_generation,
            timeout_policy_id,
            expiration_ms: AtomicI64::new(now_ms + initial_timeout_ms),
            reclaimed: AtomicBool::new(false),
            liveness: Mutex::new(SimpleLiveness::Unreplied),
            created_zone_count_generation: AtomicU32::new(0),
            inner: Mutex::new(ConnInner::default()),
        }
    }

    pub fn expiration(&self) -> i64 {
        self.expiration_ms.load(Ordering::Acquire)
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expiration()
    }

    /// Protocol FSM updates call this to push the deadline forward.
    pub fn extend_expiration(&self, now_ms: i64, timeout_ms: i64) {
        self.expiration_ms
            .store(now_ms + timeout_ms, Ordering::Release);
    }

    /// The sweeper / flush path call this to pull the deadline into the
    /// past unconditionally (`spec.md` §3 invariant 5 allows monotonic
    /// decrease only here).
    pub fn force_expire(&self, now_ms: i64) {
        self.expiration_ms.store(now_ms - 1, Ordering::Release);
    }

    /// Exactly-once transition false→true (`spec.md` §3 invariant 4).
    /// Returns `true` if this call performed the transition.
    pub fn mark_reclaimed(&self) -> bool {
        self.reclaimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_reclaimed(&self) -> bool {
        self.reclaimed.load(Ordering::Acquire)
    }

    /// Records the directive's action bits at allocation time (`examples/
    /// original_source/lib/conntrack.c:977-980` `nat_packet` sets
    /// `CS_SRC_NAT`/`CS_DST_NAT` directly off `NAT_ACTION_SRC`/
    /// `NAT_ACTION_DST`, never from address equality).
    pub fn set_nat_action(&self, action: NatAction) {
        self.nat_action.store(action.bits(), Ordering::Release);
    }

    pub fn nat_action(&self) -> NatAction {
        NatAction::from_bits_truncate(self.nat_action.load(Ordering::Acquire))
    }

    pub fn set_mark(&self, value: u32, mask: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.mark = (inner.mark & !mask) | (value & mask);
    }

    pub fn set_label(&self, value: u128, mask: u128) {
        let mut inner = self.inner.lock().unwrap();
        inner.label = (inner.label & !mask) | (value & mask);
    }

    pub fn record_seq_skew(&self, delta: i32, direction: Direction) {
        let mut inner = self.inner.lock().unwrap();
        inner.alg.seq_skew.accumulate(delta, direction);
    }

    /// NAT-rewritten address on the side this connection's reverse key
    /// carries it — used by the ALG to validate an advertised literal
    /// against the real endpoint (`spec.md` §4.5 step 2).
    pub fn nat_visible_addr(&self, reply: bool) -> IpAddr {
        if reply {
            self.fwd_key.src.addr
        } else {
            self.rev_key.dst.addr
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("fwd_key", &self.fwd_key)
            .field("rev_key", &self.rev_key)
            .field("nat_active", &self.nat_active)
            .field("zone", &self.zone)
            .field("expiration_ms", &self.expiration())
            .field("reclaimed", &self.is_reclaimed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{Endpoint, L3Type};
    use std::net::Ipv4Addr;

    fn key(src_port: u16, dst_port: u16) -> ConnKey {
        ConnKey {
            src: Endpoint::port(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), src_port),
            dst: Endpoint::port(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), dst_port),
            l3_type: L3Type::V4,
            l4_proto: L4Proto::Tcp,
            zone: 0,
        }
    }

    #[test]
    fn reclaim_is_exactly_once() {
        let k = key(5000, 80);
        let conn = Connection::new(k, k.reverse(), false, 0, 0, 0, 0, 1000);
        assert!(conn.mark_reclaimed());
        assert!(!conn.mark_reclaimed());
    }

    #[test]
    fn force_expire_moves_deadline_into_past() {
        let k = key(5000, 80);
        let conn = Connection::new(k, k.reverse(), false, 0, 0, 0, 0, 60_000);
        assert!(!conn.is_expired(0));
        conn.force_expire(100);
        assert!(conn.is_expired(100));
    }

    #[test]
    fn masked_mark_write_preserves_other_bits() {
        let k = key(5000, 80);
        let conn = Connection::new(k, k.reverse(), false, 0, 0, 0, 0, 1000);
        conn.set_mark(0xFFFF_FFFF, 0x0000_00FF);
        conn.set_mark(0x0000_1200, 0x0000_FF00);
        let inner = conn.inner.lock().unwrap();
        assert_eq!(inner.mark, 0x0000_12FF);
    }
}
