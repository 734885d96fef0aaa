//! Ambient control-plane command dispatch: the JSON-RPC-shaped methods
//! named in `spec.md` §6, minus the transport itself (`spec.md` §1 marks
//! the RPC surface out of scope; `SPEC_FULL.md`'s ambient stack section
//! keeps a thin, transport-free dispatcher so the commands exist as typed
//! Rust calls).
//!
//! Modeled on the reference project's `api/` handlers: take a typed
//! request, mutate the tracker, return a typed reply — no socket or framing
//! code lives here.

use serde::{Deserialize, Serialize};

use crate::config::ZoneLimit;
use crate::error::{Error, Result};
use crate::orchestrator::Tracker;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "kebab-case")]
pub enum Command {
    FlushConntrack,
    FlushConntrackTuple { zone: u16 },
    SetMaxconns { max: u32 },
    GetMaxconns,
    SetSweepInterval { interval_ms: u64 },
    GetSweepInterval,
    ZoneLimitSet { zone: u16, limit: ZoneLimitArg },
    ZoneLimitDel { zone: u16 },
    ZoneLimitGet { zone: u16 },
    TcpSeqChk { enabled: bool },
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ZoneLimitArg {
    Unlimited,
    Count(u32),
}

impl From<ZoneLimitArg> for ZoneLimit {
    fn from(arg: ZoneLimitArg) -> Self {
        match arg {
            ZoneLimitArg::Unlimited => ZoneLimit::Unlimited,
            ZoneLimitArg::Count(n) => ZoneLimit::Count(n),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Reply {
    Ok,
    Maxconns { max: u32 },
    SweepIntervalMs { interval_ms: u64 },
    ZoneLimit {
        zone: u16,
        limit: ZoneLimitArg,
        current_count: u32,
        generation: u64,
    },
}

impl Serialize for ZoneLimitArg {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            ZoneLimitArg::Unlimited => serializer.serialize_str("unlimited"),
            ZoneLimitArg::Count(n) => serializer.serialize_u32(*n),
        }
    }
}

/// Dispatches one control-plane command against a live tracker.
pub fn dispatch(tracker: &Tracker, command: Command) -> Result<Reply> {
    match command {
        Command::FlushConntrack => {
            tracker.table.flush_all();
            Ok(Reply::Ok)
        }
        Command::FlushConntrackTuple { zone } => {
            tracker.table.flush_zone(zone);
            Ok(Reply::Ok)
        }
        Command::SetMaxconns { max } => {
            tracker
                .settings
                .n_conn_limit
                .store(max, std::sync::atomic::Ordering::Relaxed);
            Ok(Reply::Ok)
        }
        Command::GetMaxconns => Ok(Reply::Maxconns {
            max: tracker.settings.n_conn_limit.load(std::sync::atomic::Ordering::Relaxed),
        }),
        Command::SetSweepInterval { interval_ms } => {
            if interval_ms < crate::config::CT_CLEAN_MIN_INTERVAL_MS {
                return Err(Error::Control(format!(
                    "sweep interval {interval_ms}ms below minimum {}ms",
                    crate::config::CT_CLEAN_MIN_INTERVAL_MS
                )));
            }
            tracker
                .settings
                .sweep_interval_ms
                .store(interval_ms, std::sync::atomic::Ordering::Relaxed);
            Ok(Reply::Ok)
        }
        Command::GetSweepInterval => Ok(Reply::SweepIntervalMs {
            interval_ms: tracker.settings.sweep_interval_ms.load(std::sync::atomic::Ordering::Relaxed),
        }),
        Command::ZoneLimitSet { zone, limit } => {
            tracker.zone_limits.set_limit(zone, limit.into());
            Ok(Reply::Ok)
        }
        Command::ZoneLimitDel { zone } => {
            tracker.zone_limits.delete_limit(zone);
            Ok(Reply::Ok)
        }
        Command::ZoneLimitGet { zone } => {
            let snapshot = tracker.zone_limit_snapshot(zone);
            Ok(Reply::ZoneLimit {
                zone: snapshot.zone,
                limit: match snapshot.limit {
                    ZoneLimit::Unlimited => ZoneLimitArg::Unlimited,
                    ZoneLimit::Count(n) => ZoneLimitArg::Count(n),
                },
                current_count: snapshot.current_count,
                generation: snapshot.generation,
            })
        }
        Command::TcpSeqChk { enabled } => {
            tracker.set_tcp_seq_chk(enabled);
            Ok(Reply::Ok)
        }
    }
}
