//! Tracker-wide configuration: recognized option names from `spec.md` §6,
//! plus named timeout policies (§4.9/§9).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64};

use serde::Deserialize;

/// `max-conns: 0` means "use the default".
pub const DEFAULT_N_CONN_LIMIT: u32 = 3_000_000;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 20_000;
/// Lower bound on the sweeper's wait between iterations (`CT_CLEAN_MIN_INTERVAL_MS`).
pub const CT_CLEAN_MIN_INTERVAL_MS: u64 = 200;
/// Number of rotating expiration lists the sweeper round-robins over.
pub const N_EXP_LISTS: usize = 128;

/// `default-zone-limit` semantics: `-1` unlimited, `>=0` a concrete cap, `None`
/// delegates to the tracker-wide default (which itself may be unlimited).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ZoneLimit {
    Unlimited,
    Count(u32),
}

/// Options recognized by the control plane / startup config (`spec.md` §6).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub max_conns: u32,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_true")]
    pub tcp_seq_check: bool,
    #[serde(default)]
    pub default_zone_limit: Option<ZoneLimit>,
}

fn default_sweep_interval_ms() -> u64 {
    DEFAULT_SWEEP_INTERVAL_MS
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_conns: 0,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            tcp_seq_check: true,
            default_zone_limit: None,
        }
    }
}

impl Config {
    pub fn effective_max_conns(&self) -> u32 {
        if self.max_conns == 0 {
            DEFAULT_N_CONN_LIMIT
        } else {
            self.max_conns
        }
    }
}

/// Live, mutable knobs derived from [`Config`] — what the running tracker
/// actually consults. Kept separate from `Config` so the control-plane
/// `set-maxconns` / `tcp-seq-chk` commands can flip these at runtime without
/// re-parsing the static configuration, mirroring `ct->n_conn_limit` and
/// `ct->tcp_seq_chk` in the original implementation.
#[derive(Debug)]
pub struct RuntimeSettings {
    pub n_conn_limit: AtomicU32,
    pub sweep_interval_ms: AtomicU64,
    pub tcp_seq_chk: AtomicBool,
}

impl RuntimeSettings {
    pub fn from_config(config: &Config) -> Self {
        RuntimeSettings {
            n_conn_limit: AtomicU32::new(config.effective_max_conns()),
            sweep_interval_ms: AtomicU64::new(config.sweep_interval_ms),
            tcp_seq_chk: AtomicBool::new(config.tcp_seq_check),
        }
    }
}

/// Per-state timeouts for one named policy (`spec.md` §4.9, §9). Values
/// follow the conventional Linux/`nf_conntrack` cadence the source alludes to
/// (short timers while negotiating, a long timer once established) since the
/// concrete constants are not present in the filtered original source.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    pub id: u32,
    pub tcp_syn_sent_secs: u64,
    pub tcp_syn_recv_secs: u64,
    pub tcp_established_secs: u64,
    pub tcp_fin_wait_secs: u64,
    pub tcp_close_wait_secs: u64,
    pub tcp_last_ack_secs: u64,
    pub tcp_time_wait_secs: u64,
    pub tcp_close_secs: u64,
    pub udp_first_secs: u64,
    pub udp_single_secs: u64,
    pub udp_multiple_secs: u64,
    pub icmp_first_secs: u64,
    pub icmp_reply_secs: u64,
    pub other_first_secs: u64,
    pub other_multiple_secs: u64,
}

pub const DEFAULT_TIMEOUT_POLICY_ID: u32 = 0;

impl Default for TimeoutPolicy {
    fn default() -> Self {
        TimeoutPolicy {
            id: DEFAULT_TIMEOUT_POLICY_ID,
            tcp_syn_sent_secs: 30,
            tcp_syn_recv_secs: 60,
            tcp_established_secs: 86_400,
            tcp_fin_wait_secs: 120,
            tcp_close_wait_secs: 60,
            tcp_last_ack_secs: 30,
            tcp_time_wait_secs: 120,
            tcp_close_secs: 10,
            udp_first_secs: 30,
            udp_single_secs: 30,
            udp_multiple_secs: 180,
            icmp_first_secs: 30,
            icmp_reply_secs: 30,
            other_first_secs: 30,
            other_multiple_secs: 60,
        }
    }
}

/// Registry of named timeout policies, keyed by id. A connection records the
/// id at creation time; the FSM consults it on every transition (`spec.md` §4.9).
#[derive(Debug, Default)]
pub struct TimeoutPolicyTable {
    policies: HashMap<u32, TimeoutPolicy>,
}

impl TimeoutPolicyTable {
    pub fn new() -> Self {
        let mut policies = HashMap::new();
        policies.insert(DEFAULT_TIMEOUT_POLICY_ID, TimeoutPolicy::default());
        TimeoutPolicyTable { policies }
    }

    pub fn insert(&mut self, policy: TimeoutPolicy) {
        self.policies.insert(policy.id, policy);
    }

    pub fn get(&self, id: u32) -> TimeoutPolicy {
        self.policies
            .get(&id)
            .copied()
            .unwrap_or_else(TimeoutPolicy::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_source_defaults() {
        let config = Config::default();
        assert_eq!(config.effective_max_conns(), DEFAULT_N_CONN_LIMIT);
        assert_eq!(config.sweep_interval_ms, DEFAULT_SWEEP_INTERVAL_MS);
        assert!(config.tcp_seq_check);
    }

    #[test]
    fn zero_max_conns_falls_back_to_default() {
        let config = Config {
            max_conns: 0,
            ..Config::default()
        };
        assert_eq!(config.effective_max_conns(), DEFAULT_N_CONN_LIMIT);
    }

    #[test]
    fn unknown_policy_id_falls_back_to_default() {
        let table = TimeoutPolicyTable::new();
        let policy = table.get(42);
        assert_eq!(policy.tcp_established_secs, 86_400);
    }
}
