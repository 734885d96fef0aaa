//! C3 ICMPv4/ICMPv6: a single request/reply pair per flow. Error messages
//! never reach this FSM — they are resolved during key extraction as
//! `icmp_related` and routed straight to the RELATED path (`spec.md` §4.3).

use crate::config::TimeoutPolicy;
use crate::conn::{Connection, SimpleLiveness};

use super::{L4Handler, PacketL4, UpdateResult};

pub struct IcmpHandler;

impl L4Handler for IcmpHandler {
    fn valid_new(&self, _pkt: &PacketL4) -> bool {
        true
    }

    fn new_conn(&self, _pkt: &PacketL4, policy: &TimeoutPolicy) -> i64 {
        (policy.icmp_first_secs * 1000) as i64
    }

    fn conn_update(
        &self,
        conn: &Connection,
        pkt: &PacketL4,
        reply: bool,
        now_ms: i64,
        policy: &TimeoutPolicy,
    ) -> UpdateResult {
        let mut liveness = conn.liveness.lock().unwrap();
        if reply && pkt.icmp_is_reply {
            *liveness = SimpleLiveness::Replied;
        }
        let timeout_secs = if *liveness == SimpleLiveness::Replied {
            policy.icmp_reply_secs
        } else {
            policy.icmp_first_secs
        };
        drop(liveness);
        conn.extend_expiration(now_ms, (timeout_secs * 1000) as i64);
        UpdateResult::Valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{ConnKey, Endpoint, L3Type, L4Proto};
    use std::net::{IpAddr, Ipv4Addr};

    fn key() -> ConnKey {
        ConnKey {
            src: Endpoint::icmp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 0x1234, 8, 0),
            dst: Endpoint::icmp(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 0x1234, 0, 0),
            l3_type: L3Type::V4,
            l4_proto: L4Proto::Icmp4,
            zone: 0,
        }
    }

    #[test]
    fn echo_reply_transitions_to_replied() {
        let handler = IcmpHandler;
        let k = key();
        let conn = Connection::new(k, k.reverse(), false, 0, 0, 0, 0, 30_000);
        let policy = TimeoutPolicy::default();

        let req = PacketL4 {
            key: k,
            tcp: None,
            icmp_is_reply: false,
        };
        handler.conn_update(&conn, &req, false, 0, &policy);
        assert_eq!(*conn.liveness.lock().unwrap(), SimpleLiveness::Unreplied);

        let reply = PacketL4 {
            key: k.reverse(),
            tcp: None,
            icmp_is_reply: true,
        };
        handler.conn_update(&conn, &reply, true, 1, &policy);
        assert_eq!(*conn.liveness.lock().unwrap(), SimpleLiveness::Replied);
    }
}
