//! Crate-wide error type for setup-time and control-plane failures.
//!
//! Per-packet processing never surfaces `Result` to datapath callers — every
//! per-packet failure is folded into ct-state bits on the packet (see
//! [`crate::orchestrator`]). This type covers the handful of operations that
//! *can* legitimately fail: building a tracker, parsing a NAT directive, and
//! handling a control-plane command.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid NAT directive: {0}")]
    InvalidNatDirective(String),

    #[error("invalid zone limit: {0}")]
    InvalidZoneLimit(String),

    #[error("invalid timeout policy: {0}")]
    InvalidTimeoutPolicy(String),

    #[error("control command error: {0}")]
    Control(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
