//! C1: key extraction — turning a parsed packet into a canonical connection
//! key, plus the symmetric hash that lets a forward and reverse lookup land
//! in the same table bucket without extra bookkeeping (`spec.md` §4.2/§8).
//!
//! Byte-level header parsing, fragment reassembly, and checksum arithmetic
//! are external collaborators (`spec.md` §1 "out of scope"); this module
//! takes already-decoded L3/L4 fields (as a datapath's packet-parsing helpers
//! would deliver) and is only responsible for the parts the source's
//! `extract_l3_l4`/`conn_key_extract` family actually owns: validating the
//! fields, building the key, and handling ICMP relatedness.

use std::net::IpAddr;

use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L3Type {
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L4Proto {
    Tcp,
    Udp,
    Sctp,
    Icmp4,
    Icmp6,
    Other(u8),
}

/// One side of a connection key. Port/ICMP fields are mutually exclusive by
/// `l4_proto`: for TCP/UDP/SCTP, `port_or_id` is the transport port and
/// `icmp_type`/`icmp_code` are zero; for ICMP, `port_or_id` carries the echo
/// identifier (zero for non-echo/error messages) and `icmp_type`/`icmp_code`
/// carry this side's ICMP type/code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port_or_id: u16,
    pub icmp_type: u8,
    pub icmp_code: u8,
}

impl Endpoint {
    pub fn port(addr: IpAddr, port: u16) -> Self {
        Endpoint {
            addr,
            port_or_id: port,
            icmp_type: 0,
            icmp_code: 0,
        }
    }

    pub fn icmp(addr: IpAddr, id: u16, icmp_type: u8, icmp_code: u8) -> Self {
        Endpoint {
            addr,
            port_or_id: id,
            icmp_type,
            icmp_code,
        }
    }

    fn mix_into<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
        self.port_or_id.hash(state);
        self.icmp_type.hash(state);
        self.icmp_code.hash(state);
    }
}

/// The connection key: `{src_endpoint, dst_endpoint, l3_type, l4_proto, zone}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub src: Endpoint,
    pub dst: Endpoint,
    pub l3_type: L3Type,
    pub l4_proto: L4Proto,
    pub zone: u16,
}

impl ConnKey {
    /// Byte-swap src/dst, invariant 2 in `spec.md` §8 (`reverse(reverse(K)) == K`).
    #[must_use]
    pub fn reverse(&self) -> ConnKey {
        ConnKey {
            src: self.dst,
            dst: self.src,
            l3_type: self.l3_type,
            l4_proto: self.l4_proto,
            zone: self.zone,
        }
    }
}

/// Hash of one endpoint, independent of whether it is used as src or dst —
/// the building block for the symmetric key hash below.
fn endpoint_hash(e: &Endpoint) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    e.mix_into(&mut hasher);
    hasher.finish()
}

/// Symmetric hash over a connection key: XORing the two endpoint hashes
/// makes `hash(K) == hash(reverse(K))` (invariant 1, `spec.md` §8), so a
/// forward and a reverse lookup always probe the same table bucket. Mixed in
/// afterward: `l3_type`, `l4_proto`, `zone` (order-independent, so still
/// symmetric).
pub fn symmetric_hash(key: &ConnKey) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    (endpoint_hash(&key.src) ^ endpoint_hash(&key.dst)).hash(&mut hasher);
    key.l3_type.hash(&mut hasher);
    key.l4_proto.hash(&mut hasher);
    key.zone.hash(&mut hasher);
    hasher.finish()
}

/// ICMP message classes relevant to relatedness (`spec.md` §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpClass {
    EchoRequest,
    EchoReply,
    /// dst-unreachable, time-exceeded, parameter-problem, source-quench,
    /// redirect (and the IPv6 equivalents) — carries an embedded original
    /// packet that must be recursively keyed.
    Error,
    Other,
}

/// Already-decoded L4 fields, as a datapath's header-parsing helper would
/// hand them to the tracker core.
#[derive(Debug, Clone)]
pub enum L4Fields {
    Tcp {
        src_port: u16,
        dst_port: u16,
    },
    Udp {
        src_port: u16,
        dst_port: u16,
    },
    Sctp {
        src_port: u16,
        dst_port: u16,
    },
    Icmp {
        v6: bool,
        class: IcmpClass,
        icmp_type: u8,
        icmp_code: u8,
        /// Echo identifier; 0 for error/other messages.
        id: u16,
        /// For `IcmpClass::Error`: the embedded original packet's L3+L4.
        inner: Option<Box<L3L4>>,
    },
    Other {
        proto: u8,
    },
}

/// Already-decoded L3 fields for one packet (or one embedded ICMP-error inner
/// packet).
#[derive(Debug, Clone)]
pub struct L3Fields {
    pub l3_type: L3Type,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub is_fragment: bool,
}

#[derive(Debug, Clone)]
pub struct L3L4 {
    pub l3: L3Fields,
    pub l4: L4Fields,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractError {
    MalformedLength,
    Fragment,
    UnsupportedProtocol,
    ZeroPort,
    IcmpInnerMismatch,
    MissingInner,
}

/// Result of key extraction: the key plus whether the packet is an ICMP
/// "related" message (`spec.md` §4.1).
#[derive(Debug, Clone)]
pub struct ExtractedKey {
    pub key: ConnKey,
    pub icmp_related: bool,
}

/// C1: build a connection key from decoded L3/L4 fields and a zone id.
pub fn extract_key(pkt: &L3L4, zone: u16) -> Result<ExtractedKey, ExtractError> {
    if pkt.l3.is_fragment {
        return Err(ExtractError::Fragment);
    }

    match &pkt.l4 {
        L4Fields::Tcp { src_port, dst_port }
        | L4Fields::Udp { src_port, dst_port }
        | L4Fields::Sctp { src_port, dst_port } => {
            if *src_port == 0 || *dst_port == 0 {
                return Err(ExtractError::ZeroPort);
            }
            let l4_proto = match &pkt.l4 {
                L4Fields::Tcp { .. } => L4Proto::Tcp,
                L4Fields::Udp { .. } => L4Proto::Udp,
                L4Fields::Sctp { .. } => L4Proto::Sctp,
                _ => unreachable!(),
            };
            Ok(ExtractedKey {
                key: ConnKey {
                    src: Endpoint::port(pkt.l3.src, *src_port),
                    dst: Endpoint::port(pkt.l3.dst, *dst_port),
                    l3_type: pkt.l3.l3_type,
                    l4_proto,
                    zone,
                },
                icmp_related: false,
            })
        }
        L4Fields::Icmp {
            v6,
            class,
            icmp_type,
            icmp_code,
            id,
            inner,
        } => extract_icmp_key(pkt, *v6, *class, *icmp_type, *icmp_code, *id, inner, zone),
        L4Fields::Other { proto } => Ok(ExtractedKey {
            key: ConnKey {
                src: Endpoint::port(pkt.l3.src, 0),
                dst: Endpoint::port(pkt.l3.dst, 0),
                l3_type: pkt.l3.l3_type,
                l4_proto: L4Proto::Other(*proto),
                zone,
            },
            icmp_related: false,
        }),
    }
}

#[allow(clippy::too_many_arguments)]
fn extract_icmp_key(
    pkt: &L3L4,
    v6: bool,
    class: IcmpClass,
    icmp_type: u8,
    icmp_code: u8,
    id: u16,
    inner: &Option<Box<L3L4>>,
    zone: u16,
) -> Result<ExtractedKey, ExtractError> {
    let l4_proto = if v6 { L4Proto::Icmp6 } else { L4Proto::Icmp4 };

    match class {
        IcmpClass::EchoRequest | IcmpClass::EchoReply | IcmpClass::Other => {
            // Use the identifier as both src and dst "icmp_id"; record the
            // echo type with its reverse as dst type (spec.md §4.1).
            let reverse_type = reverse_icmp_type(icmp_type, v6);
            Ok(ExtractedKey {
                key: ConnKey {
                    src: Endpoint::icmp(pkt.l3.src, id, icmp_type, icmp_code),
                    dst: Endpoint::icmp(pkt.l3.dst, id, reverse_type, icmp_code),
                    l3_type: pkt.l3.l3_type,
                    l4_proto,
                    zone,
                },
                icmp_related: false,
            })
        }
        IcmpClass::Error => {
            let inner = inner.as_ref().ok_or(ExtractError::MissingInner)?;

            // The inner source must match the outer destination, else reject.
            if inner.l3.src != pkt.l3.dst {
                return Err(ExtractError::IcmpInnerMismatch);
            }

            let inner_extracted = extract_key(inner, zone)?;
            Ok(ExtractedKey {
                key: inner_extracted.key.reverse(),
                icmp_related: true,
            })
        }
    }
}

/// ICMP echo-reply is the reverse of echo-request, and likewise for the v6
/// equivalents (`spec.md` §4.1, §4.3).
fn reverse_icmp_type(icmp_type: u8, v6: bool) -> u8 {
    const ICMP4_ECHO_REQUEST: u8 = 8;
    const ICMP4_ECHO_REPLY: u8 = 0;
    const ICMP6_ECHO_REQUEST: u8 = 128;
    const ICMP6_ECHO_REPLY: u8 = 129;

    if v6 {
        match icmp_type {
            ICMP6_ECHO_REQUEST => ICMP6_ECHO_REPLY,
            ICMP6_ECHO_REPLY => ICMP6_ECHO_REQUEST,
            other => other,
        }
    } else {
        match icmp_type {
            ICMP4_ECHO_REQUEST => ICMP4_ECHO_REPLY,
            ICMP4_ECHO_REPLY => ICMP4_ECHO_REQUEST,
            other => other,
        }
    }
}
