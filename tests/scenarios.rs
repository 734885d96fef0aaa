//! End-to-end pipeline scenarios S1..S6.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use conntrack::config::Config;
use conntrack::conn::Connection;
use conntrack::key::{Endpoint, L3Fields, L3L4, L3Type, L4Fields};
use conntrack::nat::{NatAction, NatDirective};
use conntrack::orchestrator::{CtState, ExecuteRequest, Tracker};
use conntrack::proto::{TcpFlags, TcpHeader};

fn addr(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(a, b, c, d))
}

fn tcp_pkt(src: IpAddr, dst: IpAddr, sport: u16, dport: u16) -> L3L4 {
    L3L4 {
        l3: L3Fields {
            l3_type: L3Type::V4,
            src,
            dst,
            is_fragment: false,
        },
        l4: L4Fields::Tcp {
            src_port: sport,
            dst_port: dport,
        },
    }
}

fn flags(syn: bool, ack: bool) -> TcpFlags {
    TcpFlags {
        syn,
        ack,
        fin: false,
        rst: false,
    }
}

fn base_request(pkt: &L3L4, tcp: Option<TcpHeader>, zone: u16, now_ms: i64) -> ExecuteRequest<'_> {
    ExecuteRequest {
        pkt,
        tcp,
        icmp_is_reply: false,
        zone,
        force: false,
        commit: true,
        set_mark: None,
        set_label: None,
        helper_name: None,
        nat_directive: None,
        now_ms,
        timeout_policy_id: 0,
        cached_conn: None,
        alg_payload: None,
    }
}

#[test]
fn s1_tcp_handshake_no_nat() {
    let tracker = Tracker::new(&Config::default(), 7);
    let client = addr(10, 0, 0, 1);
    let server = addr(10, 0, 0, 2);

    let syn_pkt = tcp_pkt(client, server, 5000, 80);
    let syn = TcpHeader {
        seq: 100,
        ack: 0,
        window: 64_000,
        wscale: 0,
        flags: flags(true, false),
    };
    let meta = tracker.execute(base_request(&syn_pkt, Some(syn), 0, 0));
    assert_eq!(meta.ct_state, CtState::NEW | CtState::TRACKED);

    let syn_ack_pkt = tcp_pkt(server, client, 80, 5000);
    let syn_ack = TcpHeader {
        seq: 300,
        ack: 101,
        window: 64_000,
        wscale: 0,
        flags: flags(true, true),
    };
    let meta = tracker.execute(base_request(&syn_ack_pkt, Some(syn_ack), 0, 1));
    // SYN-ACK alone only reaches SynRecv; ESTABLISHED needs the closing ACK.
    assert_eq!(meta.ct_state, CtState::REPLY_DIR | CtState::TRACKED);

    let ack_pkt = tcp_pkt(client, server, 5000, 80);
    let ack = TcpHeader {
        seq: 101,
        ack: 301,
        window: 64_000,
        wscale: 0,
        flags: flags(false, true),
    };
    let meta = tracker.execute(base_request(&ack_pkt, Some(ack), 0, 2));
    assert_eq!(meta.ct_state, CtState::ESTABLISHED | CtState::TRACKED);
}

#[test]
fn s2_dnat_rewrites_forward_and_reverse() {
    let tracker = Tracker::new(&Config::default(), 7);
    let client = addr(10, 0, 0, 1);
    let server_pub = addr(203, 0, 113, 1);

    let directive = NatDirective {
        action: NatAction::DST | NatAction::DST_PORT,
        min_addr: addr(192, 0, 2, 10),
        max_addr: addr(192, 0, 2, 10),
        min_port: 8080,
        max_port: 8080,
    };

    let pkt = tcp_pkt(client, server_pub, 5000, 80);
    let syn = TcpHeader {
        seq: 1,
        ack: 0,
        window: 64_000,
        wscale: 0,
        flags: flags(true, false),
    };
    let mut req = base_request(&pkt, Some(syn), 0, 0);
    req.nat_directive = Some(directive);
    let meta = tracker.execute(req);

    assert!(meta.ct_state.contains(CtState::NEW));
    assert!(meta.ct_state.contains(CtState::TRACKED));
    assert!(meta.ct_state.contains(CtState::DST_NAT));

    let conn = meta.conn.unwrap();
    assert_eq!(conn.rev_key.src.addr, addr(192, 0, 2, 10));
    assert_eq!(conn.rev_key.src.port_or_id, 8080);
    assert_eq!(conn.rev_key.dst, conn.fwd_key.src);
}

#[test]
fn s4_icmp_echo_pair() {
    use conntrack::key::IcmpClass;

    let tracker = Tracker::new(&Config::default(), 7);
    let a = addr(10, 0, 0, 1);
    let b = addr(10, 0, 0, 2);

    let req_pkt = L3L4 {
        l3: L3Fields {
            l3_type: L3Type::V4,
            src: a,
            dst: b,
            is_fragment: false,
        },
        l4: L4Fields::Icmp {
            v6: false,
            class: IcmpClass::EchoRequest,
            icmp_type: 8,
            icmp_code: 0,
            id: 0x1234,
            inner: None,
        },
    };
    let mut req = base_request(&req_pkt, None, 0, 0);
    req.icmp_is_reply = false;
    let meta = tracker.execute(req);
    assert_eq!(meta.ct_state, CtState::NEW | CtState::TRACKED);

    let reply_pkt = L3L4 {
        l3: L3Fields {
            l3_type: L3Type::V4,
            src: b,
            dst: a,
            is_fragment: false,
        },
        l4: L4Fields::Icmp {
            v6: false,
            class: IcmpClass::EchoReply,
            icmp_type: 0,
            icmp_code: 0,
            id: 0x1234,
            inner: None,
        },
    };
    let mut req = base_request(&reply_pkt, None, 0, 1);
    req.icmp_is_reply = true;
    let meta = tracker.execute(req);
    assert_eq!(meta.ct_state, CtState::ESTABLISHED | CtState::REPLY_DIR | CtState::TRACKED);
}

#[test]
fn s5_icmp_error_marks_related_without_new_connection() {
    use conntrack::key::IcmpClass;

    let tracker = Tracker::new(&Config::default(), 7);
    let client = addr(10, 0, 0, 1);
    let server = addr(10, 0, 0, 2);
    let router_addr = addr(10, 0, 0, 3);

    let syn_pkt = tcp_pkt(client, server, 5000, 80);
    let syn = TcpHeader {
        seq: 1,
        ack: 0,
        window: 64_000,
        wscale: 0,
        flags: flags(true, false),
    };
    tracker.execute(base_request(&syn_pkt, Some(syn), 0, 0));

    let syn_ack_pkt = tcp_pkt(server, client, 80, 5000);
    let syn_ack = TcpHeader {
        seq: 300,
        ack: 1,
        window: 64_000,
        wscale: 0,
        flags: flags(true, true),
    };
    tracker.execute(base_request(&syn_ack_pkt, Some(syn_ack), 0, 1));

    let ack_pkt = tcp_pkt(client, server, 5000, 80);
    let ack = TcpHeader {
        seq: 1,
        ack: 301,
        window: 64_000,
        wscale: 0,
        flags: flags(false, true),
    };
    tracker.execute(base_request(&ack_pkt, Some(ack), 0, 2));

    let before_count = tracker.table.live_count(0);

    let inner = tcp_pkt(client, server, 5000, 80);
    let icmp_error = L3L4 {
        l3: L3Fields {
            l3_type: L3Type::V4,
            src: router_addr,
            dst: client,
            is_fragment: false,
        },
        l4: L4Fields::Icmp {
            v6: false,
            class: IcmpClass::Error,
            icmp_type: 3,
            icmp_code: 1,
            id: 0,
            inner: Some(Box::new(inner)),
        },
    };
    let meta = tracker.execute(base_request(&icmp_error, None, 0, 3));

    assert!(meta.ct_state.contains(CtState::RELATED));
    assert!(meta.ct_state.contains(CtState::TRACKED));
    assert_eq!(tracker.table.live_count(0), before_count, "no new connection created");
}

#[test]
fn s6_zone_limit_exhaustion() {
    let tracker = Tracker::new(&Config::default(), 7);
    tracker.zone_limits.set_limit(7, conntrack::config::ZoneLimit::Count(2));

    for i in 0..2u16 {
        let pkt = tcp_pkt(addr(10, 0, 0, 1), addr(10, 0, 0, 2), 5000 + i, 80);
        let syn = TcpHeader {
            seq: 1,
            ack: 0,
            window: 64_000,
            wscale: 0,
            flags: flags(true, false),
        };
        let meta = tracker.execute(base_request(&pkt, Some(syn), 7, 0));
        assert!(meta.ct_state.contains(CtState::NEW));
    }
    assert_eq!(tracker.table.live_count(7), 2);

    let third_pkt = tcp_pkt(addr(10, 0, 0, 1), addr(10, 0, 0, 2), 5002, 80);
    let syn = TcpHeader {
        seq: 1,
        ack: 0,
        window: 64_000,
        wscale: 0,
        flags: flags(true, false),
    };
    let meta = tracker.execute(base_request(&third_pkt, Some(syn), 7, 0));
    assert!(meta.ct_state.contains(CtState::INVALID));
    assert_eq!(tracker.table.live_count(7), 2);
}

#[test]
fn s3_ftp_active_v4_snat_creates_expectation_and_skew() {
    use conntrack::alg::{ftp::FtpHelper, AlgHelper, AlgPacket};

    let client = addr(10, 0, 0, 1);
    let server = addr(198, 51, 100, 1);
    let nat_addr = addr(203, 0, 113, 5);

    let fwd = conntrack::key::ConnKey {
        src: Endpoint::port(client, 2000),
        dst: Endpoint::port(server, 21),
        l3_type: L3Type::V4,
        l4_proto: conntrack::key::L4Proto::Tcp,
        zone: 0,
    };
    let mut rev = fwd.reverse();
    rev.dst.addr = nat_addr;

    let conn = Arc::new(Connection::new(fwd, rev, true, 0, 0, 0, 0, 30_000));

    let mut payload = b"PORT 10,0,0,1,20,0".to_vec();
    let mut pkt = AlgPacket {
        reply: false,
        payload: &mut payload,
    };

    let outcome = FtpHelper.inspect(&conn, &fwd, true, &mut pkt).unwrap();
    assert!(outcome.expectation.is_some());
    let (delta, _) = outcome.seq_skew.expect("literal rewrite produces a skew");
    assert_eq!(delta, 3);
    assert_eq!(std::str::from_utf8(&payload).unwrap(), "PORT 203,0,113,5,20,0");
}
