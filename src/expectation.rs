//! C6: the expectation table — a secondary index of anticipated child flows
//! consulted on new-flow creation (`spec.md` §4.6).
//!
//! Two intrusive indices under a single read-write lock, following the
//! reference project's `proxy/nat.rs` `NatTable` three-map layout
//! (`entries` / `reverse` / `source_map`, all under their own `Mutex`);
//! here a single `RwLock` covers both indices since they are always updated
//! together.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;

use crate::key::{ConnKey, Endpoint, L3Type, L4Proto};

/// Source port wildcarding constant from `lib/conntrack.c`'s
/// `ALG_WC_SRC_PORT`.
pub const ALG_WC_SRC_PORT: u16 = 0;

/// An anticipated child flow (`spec.md` §3 "Expectation").
#[derive(Debug, Clone)]
pub struct Expectation {
    /// Key with the source port wildcarded to `ALG_WC_SRC_PORT`; source
    /// address is wildcarded (`wildcard_src_addr = true`) for SIP-like
    /// helpers (`spec.md` §9 Open Question 3).
    pub key: ConnKey,
    pub wildcard_src_addr: bool,
    pub parent_key: ConnKey,
    pub nat_replacement_address: Option<IpAddr>,
    pub nat_replacement_is_src: bool,
}

impl Expectation {
    pub fn new_ftp(parent_key: &ConnKey, client: Endpoint, data_port: u16, nat_active: bool) -> Expectation {
        let key = ConnKey {
            src: Endpoint::port(client.addr, ALG_WC_SRC_PORT),
            dst: Endpoint::port(parent_key.dst.addr, data_port),
            l3_type: parent_key.l3_type,
            l4_proto: L4Proto::Tcp,
            zone: parent_key.zone,
        };
        Expectation {
            key,
            wildcard_src_addr: false,
            parent_key: *parent_key,
            nat_replacement_address: nat_active.then_some(client.addr),
            nat_replacement_is_src: true,
        }
    }

    pub fn new_tftp(parent_key: &ConnKey) -> Expectation {
        let key = ConnKey {
            src: Endpoint::port(parent_key.dst.addr, ALG_WC_SRC_PORT),
            dst: Endpoint::port(parent_key.src.addr, parent_key.src.port_or_id),
            l3_type: parent_key.l3_type,
            l4_proto: L4Proto::Udp,
            zone: parent_key.zone,
        };
        Expectation {
            key,
            wildcard_src_addr: false,
            parent_key: *parent_key,
            nat_replacement_address: None,
            nat_replacement_is_src: false,
        }
    }

    /// A SIP-style wildcard-source-address expectation: only the
    /// destination endpoint and protocol need to match (`spec.md` §9 Open
    /// Question 3 capability).
    pub fn new_wildcard_src(parent_key: &ConnKey, dst: Endpoint, l3_type: L3Type, l4_proto: L4Proto) -> Expectation {
        let key = ConnKey {
            src: Endpoint::port(parent_key.src.addr, ALG_WC_SRC_PORT),
            dst,
            l3_type,
            l4_proto,
            zone: parent_key.zone,
        };
        Expectation {
            key,
            wildcard_src_addr: true,
            parent_key: *parent_key,
            nat_replacement_address: None,
            nat_replacement_is_src: false,
        }
    }

    fn matches(&self, candidate: &ConnKey) -> bool {
        if candidate.zone != self.key.zone
            || candidate.l3_type != self.key.l3_type
            || candidate.l4_proto != self.key.l4_proto
        {
            return false;
        }
        if candidate.dst.port_or_id != self.key.dst.port_or_id || candidate.dst.addr != self.key.dst.addr {
            return false;
        }
        self.wildcard_src_addr || candidate.src.addr == self.key.src.addr
    }
}

#[derive(Default)]
struct Indices {
    primary: HashMap<(IpAddr, IpAddr, u16, u16), Expectation>,
    by_parent: HashMap<ConnKey, Vec<(IpAddr, IpAddr, u16, u16)>>,
}

fn primary_index_key(exp: &Expectation) -> (IpAddr, IpAddr, u16, u16) {
    (
        exp.key.src.addr,
        exp.key.dst.addr,
        exp.key.dst.port_or_id,
        exp.key.zone,
    )
}

pub struct ExpectationTable {
    inner: RwLock<Indices>,
}

impl Default for ExpectationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpectationTable {
    pub fn new() -> Self {
        ExpectationTable {
            inner: RwLock::new(Indices::default()),
        }
    }

    pub fn insert(&self, expectation: Expectation) {
        let primary_key = primary_index_key(&expectation);
        let parent_key = expectation.parent_key;
        let mut indices = self.inner.write().unwrap();
        indices.by_parent.entry(parent_key).or_default().push(primary_key);
        indices.primary.insert(primary_key, expectation);
    }

    /// Consulted on new-flow creation (`spec.md` §4.6); on a hit the
    /// expectation is removed (consumed), per `spec.md` §8 invariant 8.
    pub fn consume_matching(&self, candidate: &ConnKey) -> Option<Expectation> {
        let mut indices = self.inner.write().unwrap();
        let hit_primary_key = indices
            .primary
            .iter()
            .find(|(_, exp)| exp.matches(candidate))
            .map(|(k, _)| *k)?;
        let expectation = indices.primary.remove(&hit_primary_key)?;
        if let Some(siblings) = indices.by_parent.get_mut(&expectation.parent_key) {
            siblings.retain(|k| *k != hit_primary_key);
        }
        Some(expectation)
    }

    /// Purges every expectation belonging to a parent that has been reaped
    /// (`spec.md` §3 "Expectation" lifecycle).
    pub fn purge_parent(&self, parent_key: &ConnKey) {
        let mut indices = self.inner.write().unwrap();
        if let Some(keys) = indices.by_parent.remove(parent_key) {
            for key in keys {
                indices.primary.remove(&key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
