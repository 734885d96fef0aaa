//! Property-based checks for the testable invariants in `spec.md` §8.

use std::net::{IpAddr, Ipv4Addr};

use proptest::prelude::*;

use conntrack::conn::Connection;
use conntrack::expectation::{Expectation, ExpectationTable};
use conntrack::key::{symmetric_hash, ConnKey, Endpoint, L3Type, L4Proto};
use conntrack::nat::{allocate, NatAction, NatDirective};
use conntrack::table::FlowTable;
use conntrack::zone::ZoneLimits;
use conntrack::config::ZoneLimit;

fn arb_addr() -> impl Strategy<Value = IpAddr> {
    any::<(u8, u8, u8, u8)>().prop_map(|(a, b, c, d)| IpAddr::V4(Ipv4Addr::new(a, b, c, d)))
}

fn arb_port() -> impl Strategy<Value = u16> {
    1u16..=u16::MAX
}

fn arb_key() -> impl Strategy<Value = ConnKey> {
    (arb_addr(), arb_addr(), arb_port(), arb_port(), 0u16..8).prop_map(
        |(src_addr, dst_addr, src_port, dst_port, zone)| ConnKey {
            src: Endpoint::port(src_addr, src_port),
            dst: Endpoint::port(dst_addr, dst_port),
            l3_type: L3Type::V4,
            l4_proto: L4Proto::Tcp,
            zone,
        },
    )
}

proptest! {
    /// Invariant 1: `hash(K) == hash(reverse(K))` for any key, not just
    /// hand-picked ones.
    #[test]
    fn symmetric_hash_holds_for_arbitrary_keys(key in arb_key()) {
        prop_assert_eq!(symmetric_hash(&key), symmetric_hash(&key.reverse()));
    }

    /// Invariant 2: `reverse` is its own inverse.
    #[test]
    fn reverse_is_involutive_for_arbitrary_keys(key in arb_key()) {
        prop_assert_eq!(key.reverse().reverse(), key);
    }

    /// Invariant 8: an expectation is removed the first time a candidate
    /// flow matches it, regardless of what that candidate's ports are —
    /// a second attempt with the same shape never matches again.
    #[test]
    fn expectation_is_consumed_at_most_once(
        client_port in arb_port(),
        data_port in arb_port(),
    ) {
        let parent = ConnKey {
            src: Endpoint::port(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), client_port),
            dst: Endpoint::port(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)), 21),
            l3_type: L3Type::V4,
            l4_proto: L4Proto::Tcp,
            zone: 0,
        };
        let table = ExpectationTable::new();
        table.insert(Expectation::new_ftp(
            &parent,
            Endpoint::port(parent.src.addr, 0),
            data_port,
            false,
        ));

        let candidate = ConnKey {
            src: Endpoint::port(parent.src.addr, 20),
            dst: Endpoint::port(parent.dst.addr, data_port),
            l3_type: L3Type::V4,
            l4_proto: L4Proto::Tcp,
            zone: 0,
        };

        prop_assert!(table.consume_matching(&candidate).is_some());
        prop_assert!(table.consume_matching(&candidate).is_none());
    }

    /// Invariant 6: a zone never admits more live connections than its
    /// effective limit, no matter the limit or the attempted count.
    #[test]
    fn zone_limit_is_never_exceeded(limit in 1u32..20, attempts in 0u32..40) {
        let limits = ZoneLimits::new(None);
        limits.set_limit(0, ZoneLimit::Count(limit));

        let mut admitted = 0u32;
        for _ in 0..attempts {
            if limits.admits(0, admitted) {
                admitted += 1;
            }
        }
        prop_assert!(admitted <= limit);
    }

    /// Invariant 4: reclaim is a one-shot transition regardless of call
    /// count.
    #[test]
    fn reclaim_is_exactly_once_under_repeated_calls(n in 1usize..50) {
        let key = ConnKey {
            src: Endpoint::port(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 5000),
            dst: Endpoint::port(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 80),
            l3_type: L3Type::V4,
            l4_proto: L4Proto::Tcp,
            zone: 0,
        };
        let conn = Connection::new(key, key.reverse(), false, 0, 0, 0, 0, 1000);
        let mut successes = 0;
        for _ in 0..n {
            if conn.mark_reclaimed() {
                successes += 1;
            }
        }
        prop_assert_eq!(successes, 1);
    }

    /// A masked mark/label write never disturbs bits outside its mask,
    /// for arbitrary value/mask pairs.
    #[test]
    fn masked_mark_write_preserves_untouched_bits(
        initial in any::<u32>(),
        value in any::<u32>(),
        mask in any::<u32>(),
    ) {
        let key = ConnKey {
            src: Endpoint::port(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 5000),
            dst: Endpoint::port(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 80),
            l3_type: L3Type::V4,
            l4_proto: L4Proto::Tcp,
            zone: 0,
        };
        let conn = Connection::new(key, key.reverse(), false, 0, 0, 0, 0, 1000);
        conn.set_mark(initial, u32::MAX);
        conn.set_mark(value, mask);
        let got = conn.inner.lock().unwrap().mark;
        prop_assert_eq!(got & !mask, initial & !mask);
        prop_assert_eq!(got & mask, value & mask);
    }

    /// Invariant 3: NAT allocation never hands out a reverse tuple that
    /// collides with one already live in the same zone.
    #[test]
    fn nat_allocation_never_collides_with_a_live_reverse_tuple(
        ports in prop::collection::vec(arb_port(), 1..6),
    ) {
        let table = FlowTable::new();
        let directive = NatDirective {
            action: NatAction::DST | NatAction::DST_PORT,
            min_addr: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)),
            max_addr: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)),
            min_port: 9000,
            max_port: 9015,
        };

        let mut allocated = Vec::new();
        for (i, port) in ports.into_iter().enumerate() {
            let fwd = ConnKey {
                src: Endpoint::port(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port),
                dst: Endpoint::port(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1)), 80),
                l3_type: L3Type::V4,
                l4_proto: L4Proto::Tcp,
                zone: 0,
            };
            if let Ok(rev) = allocate(&table, &fwd, &directive, i as u64, 0) {
                prop_assert!(!allocated.contains(&rev));
                let conn = std::sync::Arc::new(Connection::new(fwd, rev, true, 0, 0, 0, 0, 30_000));
                table.insert(conn);
                allocated.push(rev);
            }
        }
    }
}
