//! C3 UDP/"other": liveness only — first packet per direction, then
//! unreplied → replied → established with increasing timeouts
//! (`spec.md` §4.3).

use crate::config::TimeoutPolicy;
use crate::conn::{Connection, SimpleLiveness};

use super::{L4Handler, PacketL4, UpdateResult};

pub struct UdpHandler;

pub struct OtherHandler;

fn update_liveness(conn: &Connection, reply: bool, now_ms: i64, policy: &TimeoutPolicy) -> i64 {
    let mut liveness = conn.liveness.lock().unwrap();
    *liveness = match (*liveness, reply) {
        (SimpleLiveness::Unreplied, true) => SimpleLiveness::Replied,
        (SimpleLiveness::Replied, _) => SimpleLiveness::Established,
        (other, _) => other,
    };
    let timeout_ms = match *liveness {
        SimpleLiveness::Unreplied => policy.udp_first_secs,
        SimpleLiveness::Replied => policy.udp_single_secs,
        SimpleLiveness::Established => policy.udp_multiple_secs,
    };
    drop(liveness);
    let timeout_ms = (timeout_ms * 1000) as i64;
    conn.extend_expiration(now_ms, timeout_ms);
    timeout_ms
}

impl L4Handler for UdpHandler {
    fn valid_new(&self, _pkt: &PacketL4) -> bool {
        true
    }

    fn new_conn(&self, _pkt: &PacketL4, policy: &TimeoutPolicy) -> i64 {
        (policy.udp_first_secs * 1000) as i64
    }

    fn conn_update(
        &self,
        conn: &Connection,
        _pkt: &PacketL4,
        reply: bool,
        now_ms: i64,
        policy: &TimeoutPolicy,
    ) -> UpdateResult {
        update_liveness(conn, reply, now_ms, policy);
        UpdateResult::Valid
    }
}

impl L4Handler for OtherHandler {
    fn valid_new(&self, _pkt: &PacketL4) -> bool {
        true
    }

    fn new_conn(&self, _pkt: &PacketL4, policy: &TimeoutPolicy) -> i64 {
        (policy.other_first_secs * 1000) as i64
    }

    fn conn_update(
        &self,
        conn: &Connection,
        _pkt: &PacketL4,
        reply: bool,
        now_ms: i64,
        policy: &TimeoutPolicy,
    ) -> UpdateResult {
        let mut liveness = conn.liveness.lock().unwrap();
        if matches!(*liveness, SimpleLiveness::Unreplied) && reply {
            *liveness = SimpleLiveness::Established;
        }
        let timeout_secs = if matches!(*liveness, SimpleLiveness::Unreplied) {
            policy.other_first_secs
        } else {
            policy.other_multiple_secs
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
            src: Endpoint::port(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 5000),
            dst: Endpoint::port(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 53),
            l3_type: L3Type::V4,
            l4_proto: L4Proto::Udp,
            zone: 0,
        }
    }

    fn pkt() -> PacketL4 {
        PacketL4 {
            key: key(),
            tcp: None,
            icmp_is_reply: false,
        }
    }

    #[test]
    fn udp_liveness_progresses() {
        let handler = UdpHandler;
        let k = key();
        let conn = Connection::new(k, k.reverse(), false, 0, 0, 0, 0, 30_000);
        let policy = TimeoutPolicy::default();

        handler.conn_update(&conn, &pkt(), false, 0, &policy);
        assert_eq!(*conn.liveness.lock().unwrap(), SimpleLiveness::Unreplied);

        handler.conn_update(&conn, &pkt(), true, 1, &policy);
        assert_eq!(*conn.liveness.lock().unwrap(), SimpleLiveness::Replied);

        handler.conn_update(&conn, &pkt(), false, 2, &policy);
        assert_eq!(*conn.liveness.lock().unwrap(), SimpleLiveness::Established);
    }
}
