//! C3 TCP: window validation plus an RFC-793-flavored liveness state
//! machine with Linux-style short SYN/FIN/TIME_WAIT timers and a long
//! ESTABLISHED timer, parameterized by the active timeout policy
//! (`spec.md` §4.3).

use tracing::trace;

use crate::config::TimeoutPolicy;
use crate::conn::{Connection, Direction};
use crate::key::ConnKey;

use super::{L4Handler, PacketL4, UpdateResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    SynSent,
    SynRecv,
    Established,
    FinWait,
    CloseWait,
    LastAck,
    TimeWait,
    Close,
    Listen,
    Closed,
}

/// Per-direction window tracking (`spec.md` §3, §4.3).
#[derive(Debug, Clone, Copy, Default)]
pub struct HalfStream {
    pub max_seq_sent: u32,
    pub max_ack_seen: u32,
    pub max_window: u32,
    pub wscale: u8,
    pub seen: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TcpScratch {
    pub state: TcpState,
    pub orig: HalfStream,
    pub reply: HalfStream,
}

impl Default for TcpScratch {
    fn default() -> Self {
        TcpScratch {
            state: TcpState::Closed,
            orig: HalfStream::default(),
            reply: HalfStream::default(),
        }
    }
}

/// Window edges the peer is allowed to send within: right edge
/// `max_ack + max_window`, left edge `max_seq - max_window` (`spec.md` §4.3).
fn in_window(seg: &HalfStream, seq: u32, ack: u32) -> bool {
    let right_edge = seg.max_ack_seen.wrapping_add(seg.max_window.max(1));
    let left_edge = seg.max_seq_sent.wrapping_sub(seg.max_window.max(1));
    // Accept on first packet of a direction (nothing to validate yet).
    if !seg.seen {
        return true;
    }
    seq.wrapping_sub(left_edge) <= right_edge.wrapping_sub(left_edge) || ack == seg.max_ack_seen
}

fn update_half(seg: &mut HalfStream, seq: u32, ack: u32, window: u16, wscale: u8) {
    let first = !seg.seen;
    seg.seen = true;
    if first || seq.wrapping_sub(seg.max_seq_sent) < u32::MAX / 2 {
        seg.max_seq_sent = seq;
    }
    if first || ack.wrapping_sub(seg.max_ack_seen) < u32::MAX / 2 {
        seg.max_ack_seen = ack;
    }
    let win = (window as u32) << wscale;
    if win > seg.max_window {
        seg.max_window = win;
    }
    seg.wscale = wscale;
}

pub struct TcpHandler {
    /// `spec.md` §9 supplemented feature: runtime `tcp-seq-chk` toggle
    /// consulted on every packet rather than only at construction time.
    pub seq_chk: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl L4Handler for TcpHandler {
    fn valid_new(&self, pkt: &PacketL4) -> bool {
        match pkt.tcp {
            Some(hdr) => hdr.flags.syn && !hdr.flags.ack,
            None => false,
        }
    }

    fn new_conn(&self, _pkt: &PacketL4, policy: &TimeoutPolicy) -> i64 {
        (policy.tcp_syn_sent_secs * 1000) as i64
    }

    fn conn_update(
        &self,
        conn: &Connection,
        pkt: &PacketL4,
        reply: bool,
        now_ms: i64,
        policy: &TimeoutPolicy,
    ) -> UpdateResult {
        let Some(hdr) = pkt.tcp else {
            return UpdateResult::Invalid;
        };

        let mut inner = conn.inner.lock().unwrap();
        let scratch = inner.tcp.get_or_insert_with(TcpScratch::default);

        let (this_side, other_side) = if reply {
            (&mut scratch.reply, &scratch.orig)
        } else {
            (&mut scratch.orig, &scratch.reply)
        };

        let seq_chk = self.seq_chk.load(std::sync::atomic::Ordering::Relaxed);
        if seq_chk && !in_window(other_side, hdr.seq, hdr.ack) {
            trace!(seq = hdr.seq, ack = hdr.ack, "tcp segment outside window");
            return UpdateResult::Invalid;
        }
        update_half(this_side, hdr.seq, hdr.ack, hdr.window, hdr.wscale);

        let prev_state = scratch.state;
        let result = if hdr.flags.rst {
            scratch.state = TcpState::Close;
            UpdateResult::Valid
        } else if hdr.flags.syn && !hdr.flags.ack {
            match prev_state {
                TcpState::Closed | TcpState::Listen => {
                    scratch.state = TcpState::SynSent;
                    UpdateResult::New
                }
                TcpState::SynSent => UpdateResult::ValidNew,
                TcpState::TimeWait | TcpState::Close => UpdateResult::New,
                _ => UpdateResult::Valid,
            }
        } else if hdr.flags.syn && hdr.flags.ack {
            if prev_state == TcpState::SynSent {
                scratch.state = TcpState::SynRecv;
            }
            UpdateResult::Valid
        } else if hdr.flags.fin {
            scratch.state = match prev_state {
                TcpState::Established => {
                    if reply {
                        TcpState::CloseWait
                    } else {
                        TcpState::FinWait
                    }
                }
                TcpState::FinWait => TcpState::TimeWait,
                TcpState::CloseWait => TcpState::LastAck,
                other => other,
            };
            UpdateResult::Valid
        } else if hdr.flags.ack {
            scratch.state = match prev_state {
                TcpState::SynRecv => TcpState::Established,
                TcpState::LastAck => TcpState::TimeWait,
                other => other,
            };
            UpdateResult::Valid
        } else {
            UpdateResult::Valid
        };

        let timeout_ms = state_timeout_ms(scratch.state, policy);
        drop(inner);
        conn.extend_expiration(now_ms, timeout_ms);
        result
    }
}

fn state_timeout_ms(state: TcpState, policy: &TimeoutPolicy) -> i64 {
    let secs = match state {
        TcpState::SynSent | TcpState::Listen | TcpState::Closed => policy.tcp_syn_sent_secs,
        TcpState::SynRecv => policy.tcp_syn_recv_secs,
        TcpState::Established => policy.tcp_established_secs,
        TcpState::FinWait => policy.tcp_fin_wait_secs,
        TcpState::CloseWait => policy.tcp_close_wait_secs,
        TcpState::LastAck => policy.tcp_last_ack_secs,
        TcpState::TimeWait => policy.tcp_time_wait_secs,
        TcpState::Close => policy.tcp_close_secs,
    };
    (secs * 1000) as i64
}

/// Applies accumulated FTP sequence skew to a segment's seq/ack before FSM
/// validation (`spec.md` §4.5 step 5).
pub fn apply_seq_skew(seq: u32, ack: u32, skew: i32, skew_direction: Direction, this_direction: Direction) -> (u32, u32) {
    if skew == 0 {
        return (seq, ack);
    }
    if this_direction == skew_direction {
        (seq.wrapping_add(skew as u32), ack)
    } else {
        (seq, ack.wrapping_sub(skew as u32))
    }
}
