//! C4: NAT tuple allocation — picking a reverse key that no live connection
//! in the zone already holds (`spec.md` §4.4).
//!
//! Port-class banding, the 128-probe bounded search, and the basis/hash
//! scheme are ported directly from `nat_range_hash`/`set_sport_range`/
//! `set_dport_range`/`nat_get_unique_l4`/`nat_get_unique_tuple` in
//! `lib/conntrack.c`. The `Arc<AtomicI64>`-style "touch and retry" shape of
//! the probe loop follows the reference project's `proxy/nat.rs`
//! `NatTable::get_or_insert`.

use std::hash::{Hash, Hasher};
use std::net::IpAddr;

use rand::Rng;
use tracing::warn;

use crate::key::{ConnKey, Endpoint, L4Proto};
use crate::table::FlowTable;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NatAction: u16 {
        const SRC          = 1;
        const DST          = 2;
        const SRC_PORT     = 4;
        const DST_PORT     = 8;
        const PERSISTENT   = 16;
        const RANGE_RANDOM = 32;
        const PROTO_HASH   = 64;
    }
}

/// `spec.md` §6 "NAT directive".
#[derive(Debug, Clone, Copy)]
pub struct NatDirective {
    pub action: NatAction,
    pub min_addr: IpAddr,
    pub max_addr: IpAddr,
    pub min_port: u16,
    pub max_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatError {
    Exhausted,
}

const MAX_PROBE_ATTEMPTS: u32 = 128;

/// Hashes a key/basis/directive combination the way `nat_range_hash` mixes
/// `ct_endpoint_hash_add`/`ct_addr_hash_add`/`hash_add` calls: when `basis`
/// is zero (a persistent directive) only the source address feeds the hash,
/// keeping the result stable per-directive; otherwise both endpoints do,
/// giving a randomized spread across calls.
fn range_hash(key: &ConnKey, basis: u64, directive: &NatDirective) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    basis.hash(&mut hasher);
    if basis == 0 {
        key.src.addr.hash(&mut hasher);
    } else {
        key.src.hash_into(&mut hasher);
        key.dst.hash_into(&mut hasher);
    }
    directive.min_addr.hash(&mut hasher);
    directive.max_addr.hash(&mut hasher);
    (((directive.max_port as u32) << 16) | directive.min_port as u32).hash(&mut hasher);
    key.l3_type.hash(&mut hasher);
    key.l4_proto.hash(&mut hasher);
    key.zone.hash(&mut hasher);
    hasher.finish()
}

impl Endpoint {
    fn hash_into<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
        self.port_or_id.hash(state);
    }
}

fn is_zero_addr(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_unspecified(),
        IpAddr::V6(v6) => v6.is_unspecified(),
    }
}

/// `get_addr_in_range` / `nat_ipv6_addr_increment`: picks an address in
/// `[min, max]` by `hash % range`. IPv4 is a direct 32-bit wraparound; IPv6
/// increments the 128-bit value by a 32-bit-bounded offset.
fn addr_in_range(min: IpAddr, max: IpAddr, hash: u64) -> IpAddr {
    match (min, max) {
        (IpAddr::V4(min), IpAddr::V4(max)) => {
            let range = u32::from(max).wrapping_sub(u32::from(min)) as u64 + 1;
            let offset = (hash % range) as u32;
            IpAddr::V4(u32::from(min).wrapping_add(offset).into())
        }
        (IpAddr::V6(min), IpAddr::V6(max)) => {
            let min_bits = u128::from(min);
            let max_bits = u128::from(max);
            let range = max_bits.wrapping_sub(min_bits).min(u32::MAX as u128) + 1;
            let offset = (hash % range) as u128;
            IpAddr::V6((min_bits.wrapping_add(offset)).into())
        }
        _ => min,
    }
}

fn find_addr(fwd_key: &ConnKey, directive: &NatDirective, hash: u64) -> IpAddr {
    if is_zero_addr(directive.min_addr) {
        if directive.action.contains(NatAction::SRC) {
            fwd_key.src.addr
        } else {
            fwd_key.dst.addr
        }
    } else {
        addr_in_range(directive.min_addr, directive.max_addr, hash)
    }
}

struct PortRange {
    curr: u16,
    min: u16,
    max: u16,
}

/// `set_sport_range`: the directive's source-port range if `SRC_PORT`/`DST`
/// is set, else an ephemeral band chosen by the *original* source port's
/// class (`spec.md` §4.4 step 4).
fn sport_range(directive: &NatDirective, fwd_key: &ConnKey, port_off: u64) -> PortRange {
    if directive.action.contains(NatAction::SRC_PORT) && !directive.action.contains(NatAction::DST) {
        let min = directive.min_port;
        let max = directive.max_port;
        let curr = min + (port_off % (max - min + 1) as u64) as u16;
        PortRange { curr, min, max }
    } else {
        let curr = fwd_key.src.port_or_id;
        let (min, max) = if curr < 512 {
            (1, 511)
        } else if curr < 1024 {
            (600, 1023)
        } else {
            (1024, 60_999)
        };
        PortRange { curr, min, max }
    }
}

/// `set_dport_range`: only the directive's range when `DST_PORT` is set,
/// otherwise the sender's original destination port, pinned as a one-value
/// range.
fn dport_range(directive: &NatDirective, fwd_key: &ConnKey, port_off: u64) -> PortRange {
    if directive.action.contains(NatAction::DST_PORT) {
        let min = directive.min_port;
        let max = directive.max_port;
        let curr = min + (port_off % (max - min + 1) as u64) as u16;
        PortRange { curr, min, max }
    } else {
        let curr = fwd_key.dst.port_or_id;
        PortRange {
            curr,
            min: curr,
            max: curr,
        }
    }
}

/// `nat_get_unique_l4`: walks a port range via a fixed stride up to 128
/// probes, retrying once from a random restart at half the attempt budget if
/// the range is larger than the cap (`spec.md` §4.4 rationale).
fn probe_port(
    table: &FlowTable,
    zone: u16,
    now_ms: i64,
    build_rev_key: impl Fn(u16) -> ConnKey,
    range: &PortRange,
) -> Option<u16> {
    let span = (range.max - range.min) as u32 + 1;
    let mut attempts = span.min(MAX_PROBE_ATTEMPTS);
    let mut curr = range.curr;

    loop {
        for i in 0..attempts {
            let candidate = range.min.wrapping_add(
                ((curr.wrapping_sub(range.min) as u32 + i) % span) as u16,
            );
            let rev_key = build_rev_key(candidate);
            if !table.contains_key(&rev_key, now_ms) {
                return Some(candidate);
            }
        }
        if attempts < span && attempts >= 16 {
            attempts /= 2;
            curr = range.min + (rand::thread_rng().gen_range(0..span) as u16);
            let _ = zone;
            continue;
        }
        return None;
    }
}

/// `spec.md` §4.4 full contract: mutate `fwd_key`'s reverse to a unique
/// tuple, or report exhaustion.
pub fn allocate(
    table: &FlowTable,
    fwd_key: &ConnKey,
    directive: &NatDirective,
    hash_basis: u64,
    now_ms: i64,
) -> Result<ConnKey, NatError> {
    let basis = if directive.action.contains(NatAction::PERSISTENT) {
        0
    } else {
        hash_basis
    };
    let hash = range_hash(fwd_key, basis, directive);

    let port_off = if directive.action.contains(NatAction::RANGE_RANDOM) {
        rand::thread_rng().gen::<u32>() as u64
    } else if basis != 0 {
        hash
    } else {
        range_hash(fwd_key, hash_basis, directive)
    };

    let addr = find_addr(fwd_key, directive, hash);
    let sport = sport_range(directive, fwd_key, port_off);
    let dport = dport_range(directive, fwd_key, port_off);

    let pat_proto = matches!(
        fwd_key.l4_proto,
        L4Proto::Tcp | L4Proto::Udp | L4Proto::Sctp
    );

    let mut rev_key = fwd_key.reverse();
    if directive.action.contains(NatAction::SRC) {
        rev_key.dst.addr = addr;
    } else {
        rev_key.src.addr = addr;
    }

    if !pat_proto {
        return if table.contains_key(&rev_key, now_ms) {
            Err(NatError::Exhausted)
        } else {
            Ok(rev_key)
        };
    }

    rev_key.src.port_or_id = dport.curr;
    rev_key.dst.port_or_id = sport.curr;

    let zone = fwd_key.zone;
    let try_dport = directive.action.contains(NatAction::DST_PORT);

    let mut found_dport = None;
    if try_dport {
        found_dport = probe_port(
            table,
            zone,
            now_ms,
            |candidate| {
                let mut k = rev_key;
                k.src.port_or_id = candidate;
                k
            },
            &dport,
        );
    }

    if let Some(port) = found_dport {
        rev_key.src.port_or_id = port;
        return Ok(rev_key);
    }

    let found_sport = probe_port(
        table,
        zone,
        now_ms,
        |candidate| {
            let mut k = rev_key;
            k.dst.port_or_id = candidate;
            k
        },
        &sport,
    );

    match found_sport {
        Some(port) => {
            rev_key.dst.port_or_id = port;
            Ok(rev_key)
        }
        None => {
            warn!(zone, "NAT port allocation exhausted");
            Err(NatError::Exhausted)
        }
    }
}
