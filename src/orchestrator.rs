//! C8: the per-packet pipeline — `spec.md` §4.8's ten-step recipe stitching
//! the key extractor, flow table, protocol FSMs, NAT allocator, expectation
//! table, and ALG helpers together, with zone/global admission in between.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use tracing::{debug, trace, warn};

use crate::alg::{ftp::FtpHelper, tftp::TftpHelper, AlgError, AlgHelper, AlgPacket};
use crate::config::{Config, RuntimeSettings, TimeoutPolicyTable};
use crate::conn::Connection;
use crate::expectation::ExpectationTable;
use crate::key::{extract_key, ConnKey, L3L4};
use crate::nat::{self, NatAction, NatDirective};
use crate::proto::icmp::IcmpHandler;
use crate::proto::tcp::TcpHandler;
use crate::proto::udp::{OtherHandler, UdpHandler};
use crate::proto::{L4Handler, PacketL4, UpdateResult};
use crate::sweeper::Sweeper;
use crate::table::FlowTable;
use crate::zone::{GlobalLimit, ZoneLimitSnapshot, ZoneLimits};

bitflags! {
    /// `spec.md` §6 "ct-state bits".
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CtState: u16 {
        const NEW          = 1;
        const ESTABLISHED  = 2;
        const RELATED      = 4;
        const REPLY_DIR    = 8;
        const INVALID      = 16;
        const TRACKED      = 32;
        const SRC_NAT      = 64;
        const DST_NAT      = 128;
    }
}

/// What the orchestrator writes back onto a packet (`spec.md` §6).
#[derive(Debug, Clone, Default)]
pub struct CtMetadata {
    pub ct_state: CtState,
    pub ct_zone: u16,
    pub ct_mark: u32,
    pub ct_label: u128,
    pub ct_orig_tuple: Option<ConnKey>,
    pub conn: Option<Arc<Connection>>,
}

impl Default for CtState {
    fn default() -> Self {
        CtState::empty()
    }
}

/// Per-packet input the orchestrator needs beyond the L3/L4 fields — helper
/// hint, a possible cached connection from a prior pipeline stage, and the
/// mark/label write requests (`spec.md` §4.8, §6).
pub struct ExecuteRequest<'a> {
    pub pkt: &'a L3L4,
    pub tcp: Option<crate::proto::TcpHeader>,
    pub icmp_is_reply: bool,
    pub zone: u16,
    pub force: bool,
    pub commit: bool,
    pub set_mark: Option<(u32, u32)>,
    pub set_label: Option<(u128, u128)>,
    pub helper_name: Option<AlgHelperName>,
    pub nat_directive: Option<NatDirective>,
    pub now_ms: i64,
    pub timeout_policy_id: u32,
    pub cached_conn: Option<Arc<Connection>>,
    pub alg_payload: Option<&'a mut Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgHelperName {
    Ftp,
    Tftp,
}

/// The tracker: owns every shared resource and exposes `execute()` as the
/// single per-packet entry point (`spec.md` §6 "Per-packet API").
pub struct Tracker {
    pub table: Arc<FlowTable>,
    pub expectations: Arc<ExpectationTable>,
    pub zone_limits: Arc<ZoneLimits>,
    pub global_limit: Arc<GlobalLimit>,
    pub settings: Arc<RuntimeSettings>,
    pub timeout_policies: Arc<Mutex<TimeoutPolicyTable>>,
    pub sweeper: Arc<Sweeper>,
    hash_basis: AtomicU64,
    tcp_seq_chk: Arc<AtomicBool>,
    tcp: TcpHandler,
    udp: UdpHandler,
    icmp: IcmpHandler,
    other: OtherHandler,
    ftp: FtpHelper,
    tftp: TftpHelper,
}

impl Tracker {
    pub fn new(config: &Config, hash_basis: u64) -> Arc<Tracker> {
        let settings = Arc::new(RuntimeSettings::from_config(config));
        let tcp_seq_chk = Arc::new(AtomicBool::new(config.tcp_seq_check));
        Arc::new(Tracker {
            table: Arc::new(FlowTable::new()),
            expectations: Arc::new(ExpectationTable::new()),
            zone_limits: Arc::new(ZoneLimits::new(config.default_zone_limit)),
            global_limit: Arc::new(GlobalLimit::default()),
            settings,
            timeout_policies: Arc::new(Mutex::new(TimeoutPolicyTable::new())),
            sweeper: Arc::new(Sweeper::new()),
            hash_basis: AtomicU64::new(hash_basis),
            tcp_seq_chk: tcp_seq_chk.clone(),
            tcp: TcpHandler { seq_chk: tcp_seq_chk },
            udp: UdpHandler,
            icmp: IcmpHandler,
            other: OtherHandler,
            ftp: FtpHelper,
            tftp: TftpHelper,
        })
    }

    pub fn set_tcp_seq_chk(&self, enabled: bool) {
        self.tcp_seq_chk.store(enabled, Ordering::Relaxed);
    }

    pub fn zone_limit_snapshot(&self, zone: u16) -> ZoneLimitSnapshot {
        self.zone_limits.snapshot(zone, self.table.live_count(zone))
    }

    fn handler_for(&self, l4: crate::key::L4Proto) -> &dyn L4Handler {
        use crate::key::L4Proto::*;
        match l4 {
            Tcp => &self.tcp,
            Udp | Sctp => &self.udp,
            Icmp4 | Icmp6 => &self.icmp,
            Other(_) => &self.other,
        }
    }

    /// `spec.md` §4.8: the ten-step per-packet pipeline. Returns the
    /// metadata to be written back onto the packet; never returns `Result`
    /// to the caller (`spec.md` §7).
    pub fn execute(&self, req: ExecuteRequest) -> CtMetadata {
        let mut meta = CtMetadata {
            ct_zone: req.zone,
            ..Default::default()
        };

        // Step 10 is folded earlier since the ALG runs before writeback
        // below; fast path (a cached connection from this traversal) skips
        // re-extraction entirely when there's no helper and no force.
        if let Some(conn) = req.cached_conn.clone() {
            if req.helper_name.is_none() && !req.force && !conn.is_expired(req.now_ms) {
                return self.finish_with_cached(conn, &req, meta);
            }
        }

        let extracted = match extract_key(req.pkt, req.zone) {
            Ok(extracted) => extracted,
            Err(err) => {
                trace!(?err, "key extraction failed");
                meta.ct_state = CtState::INVALID;
                return meta;
            }
        };

        let mut key = extracted.key;
        if extracted.icmp_related {
            meta.ct_state |= CtState::RELATED;
        }

        let pkt_l4 = PacketL4 {
            key,
            tcp: req.tcp,
            icmp_is_reply: req.icmp_is_reply,
        };

        // Step 2: if the packet already carries a NAT ct-state flag, the
        // caller is re-presenting a reply; probe the reverse key first.
        let carries_nat_hint =
            meta.ct_state.contains(CtState::SRC_NAT) || meta.ct_state.contains(CtState::DST_NAT);
        if carries_nat_hint {
            key = key.reverse();
        }

        let hit = self.table.lookup(&key, req.now_ms);

        // Step 3: wrong-direction forced expiry.
        let hit = match hit {
            Some(hit) if req.force && hit.reply => {
                hit.conn.force_expire(req.now_ms);
                None
            }
            other => other,
        };

        let result = match hit {
            // An ICMP-related lookup resolves to the *embedded* connection,
            // keyed from the payload the ICMP error quotes — this packet
            // carries no header that connection's own protocol handler
            // understands, so it only gets tagged RELATED, never fed through
            // `conn_update` (`spec.md` §4.1, §4.8 step 3).
            Some(hit) if extracted.icmp_related => Some((hit.conn, hit.reply, false)),
            Some(hit) => {
                let handler = self.handler_for(hit.conn.l4_proto);
                let update = handler.conn_update(&hit.conn, &pkt_l4, hit.reply, req.now_ms, &self.policy_for(&hit.conn));

                match update {
                    UpdateResult::Invalid => {
                        meta.ct_state |= CtState::TRACKED | CtState::INVALID;
                        meta.conn = Some(hit.conn);
                        return meta;
                    }
                    UpdateResult::New => {
                        // Open Question 1 resolution: only force-expire and
                        // recreate if a re-lookup under the write lock still
                        // finds the stale connection.
                        if self.table.lookup(&key, req.now_ms).is_some() {
                            hit.conn.force_expire(req.now_ms);
                            if req.commit {
                                self.create_connection(&key, &extracted, &req, &mut meta)
                            } else {
                                return meta;
                            }
                        } else {
                            Some((hit.conn, hit.reply, false))
                        }
                    }
                    UpdateResult::Valid | UpdateResult::ValidNew => Some((hit.conn, hit.reply, false)),
                }
            }
            None if req.commit => self.create_connection(&key, &extracted, &req, &mut meta),
            // `commit=false`: classify only, never materialize a new entry.
            None => return meta,
        };

        let Some((conn, reply, is_new)) = result else {
            return meta;
        };

        if is_new {
            meta.ct_state |= CtState::NEW;
        } else {
            let mut liveness_established = matches!(
                *conn.liveness.lock().unwrap(),
                crate::conn::SimpleLiveness::Established | crate::conn::SimpleLiveness::Replied
            );
            if conn.l4_proto == crate::key::L4Proto::Tcp {
                if let Some(tcp) = conn.inner.lock().unwrap().tcp {
                    liveness_established = tcp.state == crate::proto::tcp::TcpState::Established;
                }
            }
            if liveness_established {
                meta.ct_state |= CtState::ESTABLISHED;
            }
        }
        if reply {
            meta.ct_state |= CtState::REPLY_DIR;
        }
        meta.ct_state |= CtState::TRACKED;
        if conn.nat_active {
            let action = conn.nat_action();
            // `examples/original_source/lib/conntrack.c:977-980`: driven
            // directly off the directive's SRC/DST bits, not an address
            // comparison — a SRC_PORT/DST_PORT-only directive sets neither.
            if action.contains(NatAction::SRC) {
                meta.ct_state |= CtState::SRC_NAT;
            } else if action.contains(NatAction::DST) {
                meta.ct_state |= CtState::DST_NAT;
            }
        }

        meta.ct_orig_tuple = Some(conn.fwd_key);
        {
            let inner = conn.inner.lock().unwrap();
            meta.ct_mark = inner.mark;
            meta.ct_label = inner.label;
        }

        if let Some((value, mask)) = req.set_mark {
            conn.set_mark(value, mask);
            meta.ct_mark = conn.inner.lock().unwrap().mark;
        }
        if let Some((value, mask)) = req.set_label {
            conn.set_label(value, mask);
            meta.ct_label = conn.inner.lock().unwrap().label;
        }

        if let (Some(helper), Some(payload)) = (req.helper_name, req.alg_payload) {
            self.run_alg(&conn, &key, reply, helper, payload, &mut meta);
        }

        meta.conn = Some(conn);
        meta
    }

    fn finish_with_cached(&self, conn: Arc<Connection>, req: &ExecuteRequest, mut meta: CtMetadata) -> CtMetadata {
        meta.ct_state = CtState::TRACKED | CtState::ESTABLISHED;
        meta.ct_zone = conn.zone;
        meta.ct_orig_tuple = Some(conn.fwd_key);
        let inner = conn.inner.lock().unwrap();
        meta.ct_mark = inner.mark;
        meta.ct_label = inner.label;
        drop(inner);
        let _ = req;
        meta.conn = Some(conn);
        meta
    }

    fn policy_for(&self, conn: &Connection) -> crate::config::TimeoutPolicy {
        self.timeout_policies.lock().unwrap().get(conn.timeout_policy_id)
    }

    /// Step 7: create-path. Looks up expectations, re-checks the forward
    /// key under the lock order tracker → expectation rwlock → connection
    /// mutex, runs `valid_new`, enforces admission, allocates NAT, and
    /// inserts.
    fn create_connection(
        &self,
        key: &ConnKey,
        extracted: &crate::key::ExtractedKey,
        req: &ExecuteRequest,
        meta: &mut CtMetadata,
    ) -> Option<(Arc<Connection>, bool, bool)> {
        let handler = self.handler_for(key.l4_proto);
        let pkt_l4 = PacketL4 {
            key: *key,
            tcp: req.tcp,
            icmp_is_reply: req.icmp_is_reply,
        };

        if !handler.valid_new(&pkt_l4) {
            meta.ct_state |= CtState::TRACKED | CtState::INVALID;
            return None;
        }

        if self.table.lookup(key, req.now_ms).is_some() {
            // Lost-update guard: someone else created it already.
            let hit = self.table.lookup(key, req.now_ms)?;
            return Some((hit.conn, hit.reply, false));
        }

        let zone = req.zone;
        let live_count = self.table.live_count(zone);
        if !self.zone_limits.admits(zone, live_count) {
            warn!(zone, "zone connection limit exhausted");
            meta.ct_state |= CtState::TRACKED | CtState::INVALID;
            return None;
        }
        if !self.global_limit.admits(self.settings.n_conn_limit.load(Ordering::Relaxed)) {
            warn!("global connection limit exhausted");
            meta.ct_state |= CtState::TRACKED | CtState::INVALID;
            return None;
        }

        let expectation = self.expectations.consume_matching(key);

        let (rev_key, nat_active) = match (&req.nat_directive, &expectation) {
            (Some(directive), _) => {
                match nat::allocate(&self.table, key, directive, self.hash_basis.load(Ordering::Relaxed), req.now_ms) {
                    Ok(rev) => (rev, true),
                    Err(_) => {
                        meta.ct_state |= CtState::TRACKED | CtState::INVALID;
                        return None;
                    }
                }
            }
            (None, Some(exp)) if exp.nat_replacement_address.is_some() => (key.reverse(), false),
            _ => (key.reverse(), false),
        };

        let policy_id = req.timeout_policy_id;
        let policy = self.timeout_policies.lock().unwrap().get(policy_id);
        let initial_timeout = handler.new_conn(&pkt_l4, &policy);

        let generation = self.zone_limits.current_generation(zone);
        let conn = Arc::new(Connection::new(
            *key,
            rev_key,
            nat_active,
            zone,
            generation,
            policy_id,
            req.now_ms,
            initial_timeout,
        ));

        if let Some(directive) = &req.nat_directive {
            conn.set_nat_action(directive.action);
        }

        if let Some(exp) = expectation {
            let mut inner = conn.inner.lock().unwrap();
            inner.alg.alg_related = true;
            inner.alg.parent_key = Some(exp.parent_key);
        }
        if extracted.icmp_related {
            meta.ct_state |= CtState::RELATED;
        }

        self.table.insert(conn.clone());
        self.global_limit.increment();
        self.sweeper.push(conn.clone());

        debug!(zone, nat_active, "created connection");
        Some((conn, false, true))
    }

    fn run_alg(
        &self,
        conn: &Arc<Connection>,
        parent_key: &ConnKey,
        reply: bool,
        helper: AlgHelperName,
        payload: &mut Vec<u8>,
        meta: &mut CtMetadata,
    ) {
        let mut pkt = AlgPacket { reply, payload };
        let outcome = match helper {
            AlgHelperName::Ftp => self.ftp.inspect(conn, parent_key, conn.nat_active, &mut pkt),
            AlgHelperName::Tftp => self.tftp.inspect(conn, parent_key, conn.nat_active, &mut pkt),
        };
        match outcome {
            Ok(outcome) => crate::alg::record_outcome(conn, &self.expectations, outcome),
            Err(AlgError::Malformed) => {
                meta.ct_state |= CtState::TRACKED | CtState::INVALID;
            }
            Err(AlgError::BounceAttempt) => {
                warn!("rejected ALG bounce attempt");
                meta.ct_state |= CtState::TRACKED | CtState::INVALID;
            }
        }
    }
}
